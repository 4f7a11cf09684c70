use anyhow::Context;
use samyama_kv::codec::graph::{outgoing_edge_key, parse_edge_key, vertex_key};
use samyama_kv::{KvIterator, Storage, StorageOptions};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("Samyama KV v{}", samyama_kv::version());
    println!("==========================================");
    println!();

    let dir = std::env::temp_dir().join("samyama-kv-demo");
    let options = StorageOptions {
        gc_interval_ms: 1_000,
        ..StorageOptions::default()
    };
    let storage = Storage::open(&dir, options)
        .with_context(|| format!("opening storage in {}", dir.display()))?;

    demo_graph_writes(&storage)?;
    demo_snapshot_isolation(&storage)?;
    demo_conflict(&storage)?;

    let stats = storage.gc_now()?;
    println!("\n=== GC ===");
    println!("  keys scanned:     {}", stats.keys_scanned);
    println!("  versions deleted: {}", stats.versions_deleted);

    println!("\nMetrics: {:?}", storage.metrics());
    storage.close()?;
    Ok(())
}

fn demo_graph_writes(storage: &Storage) -> anyhow::Result<()> {
    println!("=== Demo 1: Graph keys in one transaction ===");
    let graph = 1;
    let edges = storage.run_in_txn(|txn| {
        for (vertex, name) in [(1, "Alice"), (2, "Bob"), (3, "Charlie")] {
            txn.set(&vertex_key(graph, vertex), name.as_bytes())?;
        }
        txn.set(&outgoing_edge_key(graph, 1, 2), b"KNOWS")?;
        txn.set(&outgoing_edge_key(graph, 2, 3), b"KNOWS")?;
        txn.set(&outgoing_edge_key(graph, 1, 3), b"FOLLOWS")?;
        Ok(3)
    })?;
    println!("✓ Stored 3 vertices and {} edges", edges);

    let txn = storage.begin()?;
    let lower = outgoing_edge_key(graph, 1, i64::MIN);
    let upper = outgoing_edge_key(graph, 1, i64::MAX);
    let mut iter = txn.iter(&lower, &upper)?;
    while iter.valid() {
        let edge = parse_edge_key(iter.key())?;
        println!(
            "  {} -[{}]-> {}",
            edge.src_vertex_id,
            String::from_utf8_lossy(iter.value()),
            edge.dst_vertex_id
        );
        iter.next()?;
    }
    Ok(())
}

fn demo_snapshot_isolation(storage: &Storage) -> anyhow::Result<()> {
    println!("\n=== Demo 2: Snapshot isolation ===");
    let key = vertex_key(1, 1);
    let reader = storage.begin()?;

    let mut writer = storage.begin()?;
    writer.set(&key, b"Alice Smith")?;
    let commit_ver = writer.commit()?;
    println!("✓ Writer committed at version {}", commit_ver);

    let old = reader.get(&key)?.unwrap_or_default();
    let new = storage.begin()?.get(&key)?.unwrap_or_default();
    println!("  older reader sees: {}", String::from_utf8_lossy(&old));
    println!("  newer reader sees: {}", String::from_utf8_lossy(&new));
    Ok(())
}

fn demo_conflict(storage: &Storage) -> anyhow::Result<()> {
    println!("\n=== Demo 3: Write conflict ===");
    let key = vertex_key(1, 2);
    let mut first = storage.begin()?;
    let mut second = storage.begin()?;
    first.set(&key, b"Bob (first)")?;
    second.set(&key, b"Bob (second)")?;
    first.commit()?;
    match second.commit() {
        Ok(_) => println!("✗ second writer unexpectedly committed"),
        Err(err) if err.is_retryable() => println!("✓ second writer aborted: {}", err),
        Err(err) => return Err(err.into()),
    }
    Ok(())
}
