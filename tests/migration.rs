use std::{collections::BTreeMap, time::Duration};

use rangekv::{
    config::Config,
    key::{Key, KeyRange},
    node::{Cluster, Replica},
    op::{Body, Operation, Outcome},
    store::range::Limit,
    task::BackgroundMonitor,
    Addr,
};
use tokio::time::timeout;

fn replica(i: usize) -> Addr {
    Addr::Untyped(format!("replica-{i}"))
}

fn key(i: usize) -> String {
    format!("key-{i:04}")
}

async fn put(replica: &Replica, key: &str, value: &str) {
    let response = replica
        .client
        .invoke(Operation::put(key, value))
        .await
        .unwrap();
    assert!(matches!(response.outcome, Outcome::Put { .. }), "{response:?}")
}

async fn scan(replica: &Replica, limit: Limit) -> (BTreeMap<Key, Vec<u8>>, bool) {
    let op = Operation::new(Body::RangeQuery {
        range: KeyRange::full(),
        limit,
        filter: None,
        action: None,
    });
    let response = replica.client.invoke(op).await.unwrap();
    let Outcome::Range { results, more } = response.outcome else {
        panic!("{response:?}")
    };
    (results, more)
}

async fn join(cluster: &mut Cluster, i: usize) -> Replica {
    let mut replica = cluster.add_replica(replica(i)).unwrap();
    timeout(Duration::from_secs(10), replica.wait_synced())
        .await
        .unwrap()
        .unwrap();
    replica
}

fn expected(written: &BTreeMap<String, String>) -> BTreeMap<Key, Vec<u8>> {
    written
        .iter()
        .map(|(key, value)| (Key::from(key.as_str()), value.as_bytes().to_vec()))
        .collect()
}

#[tokio::test]
async fn joining_replica_receives_range() {
    let monitor = BackgroundMonitor::default();
    let mut cluster = Cluster::new(Config::default(), KeyRange::full(), monitor.spawner());
    let first = join(&mut cluster, 0).await;

    let mut written = BTreeMap::new();
    for i in 0..200 {
        put(&first, &key(i % 150), &format!("{i}")).await;
        written.insert(key(i % 150), format!("{i}"));
    }

    let second = join(&mut cluster, 1).await;
    assert_eq!(cluster.view().members.len(), 2);
    let (results, more) = scan(&second, Limit::Unlimited).await;
    assert!(!more);
    assert_eq!(results, expected(&written));

    // both serve writes issued after the move
    put(&second, &key(0), "new").await;
    written.insert(key(0), "new".into());
    let (results, _) = scan(&first, Limit::Unlimited).await;
    assert_eq!(results, expected(&written));
    let response = second
        .client
        .invoke(Operation::get(key(0).as_str()))
        .await
        .unwrap();
    assert_eq!(
        response.outcome,
        Outcome::Get {
            key: key(0).as_str().into(),
            value: Some(b"new".to_vec())
        }
    );

    let (results, more) = scan(&second, Limit::Entries(10)).await;
    assert_eq!(results.len(), 10);
    assert!(more);
    monitor.cancel()
}

#[tokio::test]
async fn writes_during_catch_up_are_replayed() {
    let monitor = BackgroundMonitor::default();
    let config = Config {
        transfer_chunk_entries: 4,
        transfer_quota: 2,
        ..Default::default()
    };
    let mut cluster = Cluster::new(config, KeyRange::full(), monitor.spawner());
    let first = join(&mut cluster, 0).await;
    for i in 0..100 {
        put(&first, &key(i), "before").await
    }

    let mut second = cluster.add_replica(replica(1)).unwrap();
    for i in 50..150 {
        put(&first, &key(i), "during").await
    }
    timeout(Duration::from_secs(10), second.wait_synced())
        .await
        .unwrap()
        .unwrap();

    let (results, _) = scan(&second, Limit::Unlimited).await;
    assert_eq!(results.len(), 150);
    assert_eq!(results[&Key::from(key(10).as_str())], b"before");
    assert_eq!(results[&Key::from(key(60).as_str())], b"during");
    assert_eq!(results[&Key::from(key(149).as_str())], b"during");
    monitor.cancel()
}

#[tokio::test]
async fn group_grows_one_replica_at_a_time() {
    let monitor = BackgroundMonitor::default();
    let mut cluster = Cluster::new(Config::default(), KeyRange::full(), monitor.spawner());
    let first = join(&mut cluster, 0).await;
    let mut written = BTreeMap::new();
    for i in 0..30 {
        put(&first, &key(i), "v").await;
        written.insert(key(i), "v".to_string());
    }
    let mut replicas = vec![first];
    for i in 1..4 {
        replicas.push(join(&mut cluster, i).await);
        put(&replicas[0], &key(100 + i), "w").await;
        written.insert(key(100 + i), "w".into());
    }
    assert_eq!(cluster.view().id, 4);
    for replica in &replicas {
        let (results, _) = scan(replica, Limit::Unlimited).await;
        assert_eq!(results, expected(&written), "{}", replica.addr);
    }
    monitor.cancel()
}
