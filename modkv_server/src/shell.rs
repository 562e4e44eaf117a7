//! Interactive cluster shell
//!
//! Attaches to the local store, builds the distributor from the cluster
//! configuration and runs a command loop against the whole keyspace.

use std::error::Error;
use std::io::Write;
use std::sync::Arc;

use modkv::DistributedKv;
use modkv_core::{ClusterConfig, KvStore, SegmentConfig, SegmentMode};

const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Runs the shell; the returned code becomes the process exit code.
/// Attach failure is exit code 1.
pub async fn run(config_path: Option<&str>, mode_arg: Option<&str>) -> Result<i32, Box<dyn Error>> {
    let cfg = ClusterConfig::load(config_path.unwrap_or(DEFAULT_CONFIG_PATH))?;
    let mode = match mode_arg.map(|m| m.to_ascii_lowercase()).as_deref() {
        Some("persistent") => SegmentMode::Persistent,
        _ => SegmentMode::Memory,
    };

    let seg = SegmentConfig::new(mode, cfg.size_bytes() as usize);
    let store = match KvStore::open_attacher(&seg) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("could not attach to the local store: {e}");
            return Ok(1);
        }
    };

    let kv = DistributedKv::from_config(&cfg, Some(store.clone())).await?;
    println!(
        "Attached to local store ({} entries). {} nodes configured.",
        store.entry_count(),
        kv.node_count().await
    );
    print_help();

    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        print!("modkv> ");
        std::io::stdout().flush()?;

        line.clear();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let args: Vec<&str> = line.split_whitespace().collect();
        let Some(&command) = args.first() else {
            continue;
        };

        match command {
            "put" => match parse_key_value(&args) {
                Some((key, value)) => report(kv.insert(key, value.as_bytes()).await),
                None => println!("usage: put <key> <value>"),
            },
            "get" => match parse_key(&args) {
                Some(key) => match kv.get(key).await {
                    Ok(value) => println!("{key} -> {}", String::from_utf8_lossy(&value)),
                    Err(e) => println!("error: {e}"),
                },
                None => println!("usage: get <key>"),
            },
            "update" => match parse_key_value(&args) {
                Some((key, value)) => report(kv.update(key, value.as_bytes()).await),
                None => println!("usage: update <key> <value>"),
            },
            "delete" => match parse_key(&args) {
                Some(key) => report(kv.delete(key).await),
                None => println!("usage: delete <key>"),
            },
            "addnode" => match args.get(1) {
                Some(&endpoint) => {
                    let provider_id = args
                        .get(2)
                        .and_then(|p| p.parse().ok())
                        .unwrap_or(cfg.provider_id);
                    report(kv.add_node(endpoint, provider_id).await);
                }
                None => println!("usage: addnode <endpoint> [provider_id]"),
            },
            "removenode" => match args.get(1).and_then(|i| i.parse().ok()) {
                Some(idx) => report(kv.remove_node(idx).await),
                None => println!("usage: removenode <node_index>"),
            },
            "listnodes" => {
                for (idx, node, local) in kv.list_nodes().await {
                    let marker = if local { " (LOCAL)" } else { " (REMOTE)" };
                    println!("Node {idx}: {}{marker}", node.endpoint);
                }
                if kv.local_node_id().await.is_none() {
                    println!("warning: no local node detected, all operations are remote");
                }
            }
            "distribution" => {
                for (idx, (node, count)) in kv.key_distribution().await.into_iter().enumerate() {
                    println!("Node {idx} ({}): {count} keys", node.endpoint);
                }
                println!("Total keys: {}", kv.mapped_keys().await);
            }
            "hash" => match parse_key(&args) {
                Some(key) => match kv.route(key).await {
                    Ok(node) => println!("key {key} hashes to node {node}"),
                    Err(e) => println!("error: {e}"),
                },
                None => println!("usage: hash <key>"),
            },
            "status" => {
                let stats = store.memory_stats();
                println!("Storage mode:  {:?}", store.mode());
                println!("Entries:       {}", store.entry_count());
                println!(
                    "Memory:        {:.2} MB used / {:.2} MB total ({:.2}%)",
                    stats.used as f64 / (1024.0 * 1024.0),
                    stats.total as f64 / (1024.0 * 1024.0),
                    stats.usage_percent
                );
                println!("Mapped keys:   {}", kv.mapped_keys().await);
                println!("Local node:    {:?}", kv.local_node_id().await);
            }
            "help" => print_help(),
            "exit" => break,
            other => println!("unknown command '{other}', try 'help'"),
        }
    }

    println!("Goodbye!");
    Ok(0)
}

fn parse_key(args: &[&str]) -> Option<i32> {
    args.get(1)?.parse().ok()
}

fn parse_key_value(args: &[&str]) -> Option<(i32, String)> {
    let key = args.get(1)?.parse().ok()?;
    if args.len() < 3 {
        return None;
    }
    Some((key, args[2..].join(" ")))
}

fn report(result: modkv_core::Result<()>) {
    match result {
        Ok(()) => println!("OK"),
        Err(e) => println!("error: {e}"),
    }
}

fn print_help() {
    println!("\nDistributed Key-Value Store Commands:");
    println!("====================================");
    println!("  put <key> <value>        - Store a key-value pair");
    println!("  get <key>                - Get the value for a key");
    println!("  update <key> <value>     - Update an existing key-value pair");
    println!("  delete <key>             - Delete a key-value pair");
    println!("  addnode <endpoint>       - Add a node to the cluster");
    println!("  removenode <index>       - Remove a node from the cluster");
    println!("  listnodes                - List the cluster membership");
    println!("  distribution             - Show keys per node");
    println!("  hash <key>               - Show which node a key hashes to");
    println!("  status                   - Show store and cluster status");
    println!("  help                     - Show this help message");
    println!("  exit                     - Exit the shell");
}
