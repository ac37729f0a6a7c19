//! Causal sync: learning remote heads.
//!
//! Learning a head runs in three phases:
//! 1. Walk backwards from the head with an explicit worklist, fetching every
//!    delta that is not applied yet. Each frontier is fetched concurrently;
//!    the walk is capped at `max_traversal` deltas.
//! 2. Order the fetched sub-DAG parents-first (Kahn's algorithm).
//! 3. Apply the deltas one at a time under the state lock.
//!
//! Nothing is marked applied before it truly is, so a learn that fails in
//! any phase can simply be retried.

use crate::config::ReplicaConfig;
use crate::error::{ReplicaError, Result};
use crate::merge::{ApplyOutcome, KeyChange, MergeEngine};
use futures::stream::{self, StreamExt, TryStreamExt};
use globaldb_dag::{fetch_delta, Cid, DAGStore, DagError, Delta, HeadSet};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// The state every mutation goes through: applied set, clock and heads.
pub struct CausalState {
    pub engine: MergeEngine,
    pub heads: HeadSet,
}

impl CausalState {
    pub fn new(engine: MergeEngine) -> Self {
        CausalState {
            engine,
            heads: HeadSet::new(),
        }
    }

    /// Apply a delta and move the frontier past it.
    pub fn commit(&mut self, cid: Cid, delta: &Delta) -> Result<ApplyOutcome> {
        let outcome = self.engine.apply(cid, delta)?;
        if let ApplyOutcome::Applied { .. } = outcome {
            self.heads.advance(cid, &delta.parents);
        }
        Ok(outcome)
    }
}

/// A delta merged while learning a head.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergedDelta {
    pub cid: Cid,
    pub changes: Vec<KeyChange>,
}

/// What a single learn did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LearnReport {
    pub head: Cid,
    /// Deltas fetched from the DAG store.
    pub fetched: usize,
    /// Deltas merged by this learn, parents first.
    pub merged: Vec<MergedDelta>,
}

impl LearnReport {
    fn empty(head: Cid) -> Self {
        LearnReport {
            head,
            fetched: 0,
            merged: Vec::new(),
        }
    }
}

/// Fetches missing history and applies it in causal order.
pub struct SyncProcessor {
    dag: Arc<dyn DAGStore>,
    config: ReplicaConfig,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl SyncProcessor {
    pub fn new(dag: Arc<dyn DAGStore>, config: ReplicaConfig, cancel: CancellationToken) -> Self {
        let permits = Arc::new(Semaphore::new(config.fetch_concurrency.max(1)));
        SyncProcessor {
            dag,
            config,
            permits,
            cancel,
        }
    }

    /// Make `head` and its whole causal past applied.
    #[tracing::instrument(skip_all, fields(head = %head.short()))]
    pub async fn learn(&self, head: Cid, causal: &Mutex<CausalState>) -> Result<LearnReport> {
        if causal.lock().await.engine.is_applied(&head) {
            trace!("head already applied");
            return Ok(LearnReport::empty(head));
        }

        let fetched = self
            .walk(vec![head], Some(causal), self.config.max_traversal)
            .await?;
        let order = causal_order(&fetched)?;
        debug!(deltas = order.len(), "ancestor chain fetched");

        let mut report = LearnReport {
            head,
            fetched: fetched.len(),
            merged: Vec::new(),
        };
        for cid in order {
            if self.cancel.is_cancelled() {
                return Err(ReplicaError::Cancelled);
            }
            let delta = &fetched[&cid];
            let mut state = causal.lock().await;
            if let ApplyOutcome::Applied { changes } = state.commit(cid, delta)? {
                report.merged.push(MergedDelta { cid, changes });
            }
        }
        Ok(report)
    }

    /// Every delta reachable from `heads`, parents first.
    pub async fn history(&self, heads: &[Cid]) -> Result<Vec<(Cid, Delta)>> {
        let mut fetched = self.walk(heads.to_vec(), None, usize::MAX).await?;
        let order = causal_order(&fetched)?;
        Ok(order
            .into_iter()
            .filter_map(|cid| fetched.remove(&cid).map(|d| (cid, d)))
            .collect())
    }

    /// Fetch the unapplied past of `roots`, breadth-first.
    ///
    /// With `causal` set, applied deltas end the walk along their branch.
    async fn walk(
        &self,
        roots: Vec<Cid>,
        causal: Option<&Mutex<CausalState>>,
        limit: usize,
    ) -> Result<HashMap<Cid, Delta>> {
        let first = roots.first().copied();
        let mut fetched: HashMap<Cid, Delta> = HashMap::new();
        let mut visited: HashSet<Cid> = roots.iter().copied().collect();
        let mut frontier = roots;

        while !frontier.is_empty() {
            let wanted: Vec<Cid> = match causal {
                Some(causal) => {
                    let state = causal.lock().await;
                    frontier
                        .drain(..)
                        .filter(|cid| !state.engine.is_applied(cid))
                        .collect()
                }
                None => std::mem::take(&mut frontier),
            };

            if fetched.len().saturating_add(wanted.len()) > limit {
                return Err(ReplicaError::TraversalLimit {
                    head: first.unwrap_or_else(|| wanted[0]),
                    limit,
                });
            }

            let batch: Vec<(Cid, Delta)> = stream::iter(wanted)
                .map(|cid| async move { self.fetch(cid).await.map(|delta| (cid, delta)) })
                .buffer_unordered(self.config.fetch_concurrency.max(1))
                .try_collect()
                .await?;

            for (cid, delta) in batch {
                for parent in &delta.parents {
                    if visited.insert(*parent) {
                        frontier.push(*parent);
                    }
                }
                fetched.insert(cid, delta);
            }
        }
        Ok(fetched)
    }

    /// Fetch one delta, retrying with backoff while it is not found.
    async fn fetch(&self, cid: Cid) -> Result<Delta> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| ReplicaError::Closed)?;
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(ReplicaError::Cancelled),
                    result = fetch_delta(self.dag.as_ref(), &cid) => result,
                }
            };

            match result {
                Ok(delta) => return Ok(delta),
                Err(DagError::NotFound(_)) if attempt < self.config.max_fetch_attempts => {
                    let delay = self.config.retry_delay(attempt);
                    debug!(cid = %cid.short(), attempt, ?delay, "delta not found, retrying");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(ReplicaError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Order `nodes` so every delta comes after its parents within the set.
///
/// Parents outside the set are taken as already applied. Nodes left over
/// after the sort form a cycle, which only a forged DAG can contain.
pub fn causal_order(nodes: &HashMap<Cid, Delta>) -> Result<Vec<Cid>> {
    let mut in_degree: HashMap<Cid, usize> = HashMap::with_capacity(nodes.len());
    let mut children: HashMap<Cid, Vec<Cid>> = HashMap::new();

    for (cid, delta) in nodes {
        let local_parents: Vec<&Cid> = delta
            .parents
            .iter()
            .filter(|p| nodes.contains_key(p))
            .collect();
        in_degree.insert(*cid, local_parents.len());
        for parent in local_parents {
            children.entry(*parent).or_default().push(*cid);
        }
    }

    // Roots in identifier order keep the output deterministic.
    let roots: BTreeSet<Cid> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(c, _)| *c)
        .collect();
    let mut queue: VecDeque<Cid> = roots.into_iter().collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(cid) = queue.pop_front() {
        order.push(cid);
        if let Some(kids) = children.get(&cid) {
            let mut ready: Vec<Cid> = Vec::new();
            for child in kids {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(*child);
                    }
                }
            }
            ready.sort();
            queue.extend(ready);
        }
    }

    if order.len() != nodes.len() {
        return Err(ReplicaError::MalformedDelta(format!(
            "cycle among {} deltas",
            nodes.len() - order.len()
        )));
    }
    Ok(order)
}
