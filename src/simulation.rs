use futures::future::join_all;
use globaldb_core::{MemoryStateStore, Replica, ReplicaConfigBuilder, ReplicaError};
use globaldb_dag::{MemoryDAGStore, MemoryNetwork};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const TOPIC: &str = "globaldb-simulation";

/// Parameters of one simulated cluster run.
#[derive(Clone, Debug)]
pub struct SimulationConfig {
    pub replicas: usize,
    pub writes_per_replica: usize,
    pub keys: usize,
    /// Share of operations that delete instead of put.
    pub delete_ratio: f64,
    /// Split the cluster in two while writing, heal afterwards.
    pub partition: bool,
    pub rebroadcast_interval: Duration,
    pub timeout: Duration,
    pub seed: u64,
}

/// Outcome of a simulation run.
#[derive(Clone, Debug)]
pub struct SimulationReport {
    pub replicas: usize,
    pub puts: usize,
    pub deletes: usize,
    pub write_time: Duration,
    pub convergence_time: Duration,
    pub converged: bool,
    pub live_keys: usize,
    pub deltas: usize,
    pub merged: u64,
    pub rebroadcasts: u64,
    pub sync_failures: u64,
}

impl SimulationReport {
    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Simulation Report                             ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Replicas:                  {:>30} ║", self.replicas);
        println!("║  Puts:                      {:>30} ║", self.puts);
        println!("║  Deletes:                   {:>30} ║", self.deletes);
        println!("║  Deltas in DAG:             {:>30} ║", self.deltas);
        println!("║  Deltas merged remotely:    {:>30} ║", self.merged);
        println!("║  Rebroadcasts:              {:>30} ║", self.rebroadcasts);
        println!("║  Sync failures:             {:>30} ║", self.sync_failures);
        println!("║  Live keys:                 {:>30} ║", self.live_keys);
        println!("║  Write time:                {:>29}s ║", format!("{:.3}", self.write_time.as_secs_f64()));
        println!("║  Convergence time:          {:>29}s ║", format!("{:.3}", self.convergence_time.as_secs_f64()));
        println!("║  Converged:                 {:>30} ║", if self.converged { "yes" } else { "NO" });
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

/// A planned operation: `Some(value)` puts, `None` deletes.
type Op = (String, Option<String>);

fn plan(config: &SimulationConfig, replica: usize) -> Vec<Op> {
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(replica as u64));
    (0..config.writes_per_replica)
        .map(|i| {
            let key = format!("/sim/{:04}", rng.gen_range(0..config.keys.max(1)));
            if rng.gen_bool(config.delete_ratio.clamp(0.0, 1.0)) {
                (key, None)
            } else {
                (key, Some(format!("r{}-{}", replica, i)))
            }
        })
        .collect()
}

async fn converged(replicas: &[Replica]) -> Result<bool, ReplicaError> {
    let first = replicas[0].list("")?;
    let first_heads: BTreeSet<_> = replicas[0].heads().await.into_iter().collect();
    for replica in &replicas[1..] {
        if replica.list("")? != first {
            return Ok(false);
        }
        let heads: BTreeSet<_> = replica.heads().await.into_iter().collect();
        if heads != first_heads {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Run a cluster of in-process replicas until they converge or time out.
pub async fn run(config: SimulationConfig) -> Result<SimulationReport, ReplicaError> {
    let network = MemoryNetwork::new();
    let dag = Arc::new(MemoryDAGStore::new());
    let count = config.replicas.max(1);

    let replicas: Vec<Replica> = (0..count)
        .map(|i| {
            let id = format!("replica-{}", i);
            let replica_config = ReplicaConfigBuilder::new()
                .replica_id(id.clone())
                .topic(TOPIC)
                .rebroadcast_interval(config.rebroadcast_interval)
                .build();
            Replica::open(
                replica_config,
                dag.clone(),
                Arc::new(MemoryStateStore::new()),
                Arc::new(network.join(id, TOPIC)),
            )
        })
        .collect();

    if config.partition && count > 1 {
        for (i, replica) in replicas.iter().enumerate() {
            network.set_group(replica.id(), if i < count / 2 { 1 } else { 2 });
        }
        info!(left = count / 2, right = count - count / 2, "cluster partitioned");
    }

    let started = Instant::now();
    let writers = replicas.iter().enumerate().map(|(i, replica)| {
        let ops = plan(&config, i);
        async move {
            let (mut puts, mut deletes) = (0usize, 0usize);
            for (key, value) in ops {
                match value {
                    Some(value) => {
                        replica.put(key, value).await?;
                        puts += 1;
                    }
                    None => {
                        if replica.delete(&key).await?.is_some() {
                            deletes += 1;
                        }
                    }
                }
                tokio::task::yield_now().await;
            }
            debug!(replica = %replica.id(), puts, deletes, "writer finished");
            Ok::<_, ReplicaError>((puts, deletes))
        }
    });
    let mut puts = 0;
    let mut deletes = 0;
    for result in join_all(writers).await {
        let (p, d) = result?;
        puts += p;
        deletes += d;
    }
    let write_time = started.elapsed();

    if config.partition {
        network.heal();
        info!("partition healed");
    }

    let waiting = Instant::now();
    let deadline = waiting + config.timeout;
    let mut is_converged = converged(&replicas).await?;
    while !is_converged && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(25)).await;
        is_converged = converged(&replicas).await?;
    }
    let convergence_time = waiting.elapsed();
    if is_converged {
        info!(elapsed = ?convergence_time, "replicas converged");
    } else {
        warn!(timeout = ?config.timeout, "replicas did not converge");
    }

    let mut report = SimulationReport {
        replicas: count,
        puts,
        deletes,
        write_time,
        convergence_time,
        converged: is_converged,
        live_keys: replicas[0].list("")?.len(),
        deltas: dag.len(),
        merged: 0,
        rebroadcasts: 0,
        sync_failures: 0,
    };
    for replica in &replicas {
        let stats = replica.stats().await;
        report.merged += stats.deltas_merged;
        report.rebroadcasts += stats.rebroadcasts;
        report.sync_failures += stats.sync_failures;
        replica.close().await;
    }
    Ok(report)
}
