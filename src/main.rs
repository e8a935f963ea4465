use std::{collections::BTreeMap, path::PathBuf};

use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Zipf};
use rangekv::{
    config::Config,
    engine::ReplicationSetInfo,
    key::{Key, KeyRange},
    node::Cluster,
    op::{Operation, Outcome},
    task::BackgroundMonitor,
    Addr,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const NUM_KEYS: u64 = 1000;
const NUM_OPS: usize = 5000;

#[tokio::main]
async fn main() -> rangekv::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let config = Config::load(std::env::args().nth(1).map(PathBuf::from).as_deref())?;

    let mut monitor = BackgroundMonitor::default();
    let spawner = monitor.spawner();
    let workload = async move {
        let mut cluster = Cluster::new(config, KeyRange::full(), spawner);
        let mut first = cluster.add_replica(Addr::Untyped("replica-0".into()))?;
        first.wait_synced().await?;

        let zipf = Zipf::new(NUM_KEYS, 1.1).map_err(|err| rangekv::err!("{err}"))?;
        let mut rng = StdRng::seed_from_u64(0);
        let mut written = BTreeMap::new();
        for i in 0..NUM_OPS {
            let key = format!("key-{:05}", zipf.sample(&mut rng) as u64);
            let value = format!("value-{i}");
            let response = first
                .client
                .invoke(Operation::put(key.as_str(), value.as_str()))
                .await?;
            if let Outcome::Failed(code) = response.outcome {
                rangekv::bail!("put {key} failed: {code:?}")
            }
            written.insert(key, value);
        }
        info!("wrote {NUM_OPS} puts to {} keys", written.len());

        let mut second = cluster.add_replica(Addr::Untyped("replica-1".into()))?;
        second.wait_synced().await?;
        info!("view {} synced", cluster.view().id);
        second.send(ReplicationSetInfo {
            range: KeyRange::full(),
        })?;

        let response = second
            .client
            .invoke(Operation::range_query(KeyRange::full()))
            .await?;
        let Outcome::Range { results, more } = response.outcome else {
            rangekv::bail!("unexpected range query outcome {:?}", response.outcome)
        };
        let mismatched = written
            .iter()
            .filter(|(key, value)| {
                results.get(&Key::from(key.as_str())).map(Vec::as_slice) != Some(value.as_bytes())
            })
            .count();
        info!(
            "migrated replica returned {} keys (more: {more}), {mismatched} mismatched",
            results.len()
        );
        if mismatched != 0 || results.len() != written.len() {
            rangekv::bail!("migrated data diverged")
        }
        first.stop()?;
        second.stop()?;
        Ok::<_, rangekv::Error>(())
    };
    tokio::select! {
        result = workload => result?,
        result = monitor.wait() => result?,
        result = tokio::signal::ctrl_c() => result?,
    }
    monitor.cancel();
    Ok(())
}
