//! End-to-end cluster tests: real stores, real TCP providers on
//! ephemeral ports, one distributor routing across them.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use modkv::cluster::distributor::Distributor;
use modkv::cluster::identity::FixedIdentity;
use modkv::cluster::mapping::MappingFile;
use modkv::cluster::NodeInfo;
use modkv::rpc::{ConnectionCache, KvClient, KvProvider};
use modkv_core::{KvStore, SegmentConfig, SegmentMode, StoreError};

const PROVIDER_ID: u16 = 1;

fn test_store(dir: &tempfile::TempDir, name: &str) -> Arc<KvStore> {
    let cfg = SegmentConfig::new(SegmentMode::Memory, 256 * 1024)
        .with_name(name)
        .with_path(dir.path().join(format!("{name}.seg")));
    Arc::new(KvStore::open_owner(&cfg).unwrap())
}

async fn spawn_node(dir: &tempfile::TempDir, name: &str) -> (NodeInfo, Arc<KvStore>) {
    let store = test_store(dir, name);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(KvProvider::new(Arc::clone(&store), PROVIDER_ID).serve(listener));
    (
        NodeInfo::new(format!("ofi+tcp://127.0.0.1:{port}"), PROVIDER_ID),
        store,
    )
}

fn local_oracle() -> Box<FixedIdentity> {
    // Every test endpoint is on loopback, so this makes node 0 local.
    Box::new(FixedIdentity::new(vec!["127.0.0.1".to_string()]))
}

fn remote_only_oracle() -> Box<FixedIdentity> {
    Box::new(FixedIdentity::new(Vec::new()))
}

#[tokio::test]
async fn two_node_cluster_splits_local_and_remote() {
    let dir = tempfile::tempdir().unwrap();
    let (node_a, store_a) = spawn_node(&dir, "clu-split-a").await;
    let (node_b, store_b) = spawn_node(&dir, "clu-split-b").await;

    let mut d = Distributor::new(
        local_oracle(),
        MappingFile::new(dir.path().join("mappings.txt")),
        Some(Arc::clone(&store_a)),
    );
    d.join_all(vec![node_a, node_b]).await;
    assert_eq!(d.local_node_id(), Some(0));

    // 1 % 2 = 1: remote insert to B. 2 % 2 = 0: local insert on A.
    d.insert(1, b"x").await.unwrap();
    d.insert(2, b"y").await.unwrap();
    assert_eq!(d.node_of(1), Some(1));
    assert_eq!(d.node_of(2), Some(0));

    assert_eq!(store_b.find(1).unwrap(), b"x");
    assert_eq!(store_a.find(2).unwrap(), b"y");
    assert!(store_a.find(1).is_err());
    assert!(store_b.find(2).is_err());

    assert_eq!(d.get(1).await.unwrap(), b"x");
    assert_eq!(d.get(2).await.unwrap(), b"y");
}

#[tokio::test]
async fn add_node_rebalances_and_preserves_values() {
    let dir = tempfile::tempdir().unwrap();
    let (node_a, store_a) = spawn_node(&dir, "clu-rebal-a").await;
    let (node_b, store_b) = spawn_node(&dir, "clu-rebal-b").await;

    let mut d = Distributor::new(
        remote_only_oracle(),
        MappingFile::new(dir.path().join("mappings.txt")),
        None,
    );
    d.join_all(vec![node_a]).await;

    d.insert(3, b"a").await.unwrap();
    d.insert(4, b"b").await.unwrap();
    d.insert(5, b"c").await.unwrap();
    assert_eq!(d.key_distribution(), vec![3]);

    d.add_node(&node_b.endpoint, PROVIDER_ID).await.unwrap();

    // 3 % 2 = 1, 4 % 2 = 0, 5 % 2 = 1.
    assert_eq!(d.node_of(3), Some(1));
    assert_eq!(d.node_of(4), Some(0));
    assert_eq!(d.node_of(5), Some(1));

    assert_eq!(store_b.find(3).unwrap(), b"a");
    assert_eq!(store_a.find(4).unwrap(), b"b");
    assert_eq!(store_b.find(5).unwrap(), b"c");
    // Moved keys were deleted from their old node.
    assert!(store_a.find(3).is_err());
    assert!(store_a.find(5).is_err());

    // Every value survives the membership change.
    assert_eq!(d.get(3).await.unwrap(), b"a");
    assert_eq!(d.get(4).await.unwrap(), b"b");
    assert_eq!(d.get(5).await.unwrap(), b"c");
}

#[tokio::test]
async fn remove_node_redistributes_keys() {
    let dir = tempfile::tempdir().unwrap();
    let (node_a, store_a) = spawn_node(&dir, "clu-rm-a").await;
    let (node_b, _store_b) = spawn_node(&dir, "clu-rm-b").await;

    let mut d = Distributor::new(
        remote_only_oracle(),
        MappingFile::new(dir.path().join("mappings.txt")),
        None,
    );
    d.join_all(vec![node_a, node_b]).await;

    d.insert(1, b"x").await.unwrap();
    assert_eq!(d.node_of(1), Some(1));

    d.remove_node(1).await.unwrap();
    assert_eq!(d.node_count(), 1);
    assert_eq!(d.node_of(1), Some(0));
    assert_eq!(d.get(1).await.unwrap(), b"x");
    assert_eq!(store_a.find(1).unwrap(), b"x");
}

#[tokio::test]
async fn remove_node_repartitions_across_remaining_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let (node_a, _store_a) = spawn_node(&dir, "clu-shrink-a").await;
    let (node_b, store_b) = spawn_node(&dir, "clu-shrink-b").await;
    let (node_c, store_c) = spawn_node(&dir, "clu-shrink-c").await;

    let mut d = Distributor::new(
        remote_only_oracle(),
        MappingFile::new(dir.path().join("mappings.txt")),
        None,
    );
    d.join_all(vec![node_a, node_b, node_c]).await;

    // Keys 0, 3, 6 live on node 0; 4 on node 1; 5 on node 2.
    for key in [0, 3, 4, 5, 6] {
        d.insert(key, format!("value-{key}").as_bytes()).await.unwrap();
    }
    assert_eq!(d.key_distribution(), vec![3, 1, 1]);

    d.remove_node(0).await.unwrap();
    assert_eq!(d.node_count(), 2);

    // Keys that stayed shift down with the membership; rescued keys are
    // re-placed by mod 2. Key 3's new owner index lies above the
    // removed index, so a blanket decrement would have corrupted it.
    assert_eq!(d.node_of(0), Some(0));
    assert_eq!(d.node_of(3), Some(1));
    assert_eq!(d.node_of(4), Some(0));
    assert_eq!(d.node_of(5), Some(1));
    assert_eq!(d.node_of(6), Some(0));

    assert_eq!(store_b.find(0).unwrap(), b"value-0");
    assert_eq!(store_b.find(4).unwrap(), b"value-4");
    assert_eq!(store_b.find(6).unwrap(), b"value-6");
    assert_eq!(store_c.find(3).unwrap(), b"value-3");
    assert_eq!(store_c.find(5).unwrap(), b"value-5");

    for key in [0, 3, 4, 5, 6] {
        assert_eq!(d.get(key).await.unwrap(), format!("value-{key}").as_bytes());
    }
}

#[tokio::test]
async fn keys_land_on_their_modulo_node() {
    let dir = tempfile::tempdir().unwrap();
    let (node_a, store_a) = spawn_node(&dir, "clu-place-a").await;
    let (node_b, store_b) = spawn_node(&dir, "clu-place-b").await;

    let mut d = Distributor::new(
        remote_only_oracle(),
        MappingFile::new(dir.path().join("mappings.txt")),
        None,
    );
    d.join_all(vec![node_a, node_b]).await;

    for key in [-7, 0, 1, 2, 9, 10, 13] {
        d.insert(key, format!("value-{key}").as_bytes()).await.unwrap();
    }

    for key in [-7i32, 0, 1, 2, 9, 10, 13] {
        let expected_node = key.rem_euclid(2) as usize;
        assert_eq!(d.node_of(key), Some(expected_node));

        let owner = if expected_node == 0 { &store_a } else { &store_b };
        let other = if expected_node == 0 { &store_b } else { &store_a };
        assert_eq!(owner.find(key).unwrap(), format!("value-{key}").as_bytes());
        assert!(matches!(other.find(key), Err(StoreError::NotFound(_))));
    }
}

#[tokio::test]
async fn local_path_matches_network_path() {
    let dir = tempfile::tempdir().unwrap();
    let (node, store) = spawn_node(&dir, "clu-equiv").await;
    let mapping_path = dir.path().join("mappings.txt");

    let mut d_local = Distributor::new(
        local_oracle(),
        MappingFile::new(&mapping_path),
        Some(Arc::clone(&store)),
    );
    d_local.join_all(vec![node.clone()]).await;
    assert_eq!(d_local.local_node_id(), Some(0));

    d_local.insert(10, b"ten").await.unwrap();

    // Remote-only distributor over the same cluster and mapping file.
    let mut d_remote = Distributor::new(remote_only_oracle(), MappingFile::new(&mapping_path), None);
    d_remote.join_all(vec![node]).await;
    assert_eq!(d_remote.local_node_id(), None);

    assert_eq!(
        d_local.get(10).await.unwrap(),
        d_remote.get(10).await.unwrap()
    );
    assert!(matches!(
        d_local.get(99).await,
        Err(StoreError::NotFound(99))
    ));
    assert!(matches!(
        d_remote.get(99).await,
        Err(StoreError::NotFound(99))
    ));
    assert!(matches!(
        d_local.insert(10, b"dup").await,
        Err(StoreError::AlreadyExists(10))
    ));
    assert!(matches!(
        d_remote.insert(10, b"dup").await,
        Err(StoreError::AlreadyExists(10))
    ));

    // A write through the network path is visible on the local path.
    d_remote.update(10, b"TEN").await.unwrap();
    assert_eq!(d_local.get(10).await.unwrap(), b"TEN");

    d_local.delete(10).await.unwrap();
    assert!(matches!(
        d_remote.get(10).await,
        Err(StoreError::NotFound(10))
    ));
}

#[tokio::test]
async fn connections_refresh_after_the_freshness_window() {
    let dir = tempfile::tempdir().unwrap();
    let (node, _store) = spawn_node(&dir, "clu-fresh").await;

    let cache = ConnectionCache::with_refresh_after(Duration::from_millis(100));
    let c1 = cache.get(0, &node.endpoint, PROVIDER_ID).await.unwrap();
    assert_eq!(cache.reconnects(), 1);

    // Within the window the slot is reused.
    let c2 = cache.get(0, &node.endpoint, PROVIDER_ID).await.unwrap();
    assert_eq!(cache.reconnects(), 1);
    assert!(Arc::ptr_eq(&c1, &c2));

    // Past the window, exactly one reconnect.
    tokio::time::sleep(Duration::from_millis(150)).await;
    cache.get(0, &node.endpoint, PROVIDER_ID).await.unwrap();
    assert_eq!(cache.reconnects(), 2);
    cache.get(0, &node.endpoint, PROVIDER_ID).await.unwrap();
    assert_eq!(cache.reconnects(), 2);
}

#[tokio::test]
async fn client_normalizes_the_fetch_sentinel() {
    let dir = tempfile::tempdir().unwrap();
    let (node, store) = spawn_node(&dir, "clu-sentinel").await;

    let mut client = KvClient::connect(&node.endpoint, PROVIDER_ID).await.unwrap();
    assert!(matches!(
        client.fetch(404).await,
        Err(StoreError::NotFound(404))
    ));

    client.insert(404, b"now here").await.unwrap();
    assert_eq!(client.fetch(404).await.unwrap(), b"now here");
    assert_eq!(store.find(404).unwrap(), b"now here");

    client.delete(404).await.unwrap();
    assert!(matches!(
        client.delete(404).await,
        Err(StoreError::Unavailable(_))
    ));
}

#[tokio::test]
async fn provider_rejects_unknown_provider_id() {
    let dir = tempfile::tempdir().unwrap();
    let (node, _store) = spawn_node(&dir, "clu-pid").await;

    let mut client = KvClient::connect(&node.endpoint, 9).await.unwrap();
    assert!(matches!(
        client.insert(1, b"v").await,
        Err(StoreError::Unavailable(_))
    ));
}

#[tokio::test]
async fn mapping_file_restores_routing_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let (node, _store) = spawn_node(&dir, "clu-remap").await;
    let mapping_path = dir.path().join("mappings.txt");

    {
        let mut d = Distributor::new(remote_only_oracle(), MappingFile::new(&mapping_path), None);
        d.join_all(vec![node.clone()]).await;
        d.insert(1, b"one").await.unwrap();
        d.insert(2, b"two").await.unwrap();
    }

    // A fresh distributor learns the placements from the mapping file.
    let mut d = Distributor::new(remote_only_oracle(), MappingFile::new(&mapping_path), None);
    d.join_all(vec![node]).await;
    assert_eq!(d.mapped_keys(), 2);
    assert_eq!(d.get(1).await.unwrap(), b"one");
    assert_eq!(d.get(2).await.unwrap(), b"two");
}

#[test]
fn peer_failure_invalidates_and_recovers() {
    let main_rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let dir = tempfile::tempdir().unwrap();

    let (node_a, _store_a) = main_rt.block_on(spawn_node(&dir, "clu-fail-a"));

    // Node B lives on its own runtime so the whole process can be torn
    // down mid-test.
    let store_b = test_store(&dir, "clu-fail-b");
    let rt_b = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let listener = rt_b.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
    let port = listener.local_addr().unwrap().port();
    let node_b = NodeInfo::new(format!("ofi+tcp://127.0.0.1:{port}"), PROVIDER_ID);
    rt_b.spawn(KvProvider::new(Arc::clone(&store_b), PROVIDER_ID).serve(listener));

    let mut d = main_rt.block_on(async {
        let mut d = Distributor::new(
            remote_only_oracle(),
            MappingFile::new(dir.path().join("mappings.txt")),
            None,
        );
        d.join_all(vec![node_a, node_b]).await;
        d
    });

    main_rt.block_on(d.insert(1, b"x")).unwrap();
    assert_eq!(main_rt.block_on(d.get(1)).unwrap(), b"x");

    // Kill node B.
    rt_b.shutdown_background();
    std::thread::sleep(Duration::from_millis(200));

    let err = main_rt.block_on(d.get(1)).unwrap_err();
    assert!(matches!(
        err,
        StoreError::Transport(_) | StoreError::Unavailable(_)
    ));

    // Restart node B on the same port with the same store; the slot was
    // invalidated, so the next call reconnects and succeeds.
    let rt_b2 = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let listener = rt_b2
        .block_on(TcpListener::bind(("127.0.0.1", port)))
        .unwrap();
    rt_b2.spawn(KvProvider::new(Arc::clone(&store_b), PROVIDER_ID).serve(listener));

    assert_eq!(main_rt.block_on(d.get(1)).unwrap(), b"x");
}
