use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::model::{ParseStrategy, ProjectSummary};
use crate::worker::{IsolatedExecutor, ParseContext};

#[derive(Debug, Clone, Default)]
pub struct DispatchOutcome {
    pub summaries: Vec<ProjectSummary>,
    pub strategy: ParseStrategy,
}

// Fans stale projects out to isolated workers. Any worker failure throws
// away every group's result and re-parses the whole set in process.
pub struct Dispatcher {
    executor: Arc<dyn IsolatedExecutor>,
    context: ParseContext,
    max_groups: usize,
}

impl Dispatcher {
    pub fn new(executor: Arc<dyn IsolatedExecutor>, context: ParseContext, max_workers: usize) -> Self {
        let available = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            executor,
            context,
            max_groups: max_workers.clamp(1, available.max(1)),
        }
    }

    pub async fn parse_many(&self, project_ids: &[String]) -> DispatchOutcome {
        match project_ids.len() {
            0 => DispatchOutcome::default(),
            1 => DispatchOutcome {
                summaries: self.sequential(project_ids).await,
                strategy: ParseStrategy::Sequential,
            },
            stale => {
                let groups = partition(project_ids, self.max_groups.min(stale));
                debug!(projects = stale, groups = groups.len(), "dispatching parse groups");
                match self.parallel(groups).await {
                    Some(summaries) => DispatchOutcome {
                        summaries: dedup_by_id(summaries, project_ids),
                        strategy: ParseStrategy::Parallel,
                    },
                    None => {
                        info!(projects = stale, "falling back to sequential parse");
                        DispatchOutcome {
                            summaries: dedup_by_id(self.sequential(project_ids).await, project_ids),
                            strategy: ParseStrategy::Fallback,
                        }
                    }
                }
            }
        }
    }

    async fn parallel(&self, groups: Vec<Vec<String>>) -> Option<Vec<ProjectSummary>> {
        let runs = groups
            .into_iter()
            .map(|group| self.executor.execute(self.context.task(group)));
        let results = join_all(runs).await;

        let mut summaries = Vec::new();
        let mut failed = false;
        for (group, result) in results.into_iter().enumerate() {
            match result {
                Ok(output) => summaries.extend(output.summaries),
                Err(err) => {
                    warn!(group, error = %err, "parse worker failed");
                    failed = true;
                }
            }
        }
        (!failed).then_some(summaries)
    }

    async fn sequential(&self, project_ids: &[String]) -> Vec<ProjectSummary> {
        self.context.parser().parse_many(project_ids).await
    }
}

pub fn partition(ids: &[String], groups: usize) -> Vec<Vec<String>> {
    let groups = groups.clamp(1, ids.len().max(1));
    let base = ids.len() / groups;
    let extra = ids.len() % groups;

    let mut chunks = Vec::with_capacity(groups);
    let mut start = 0;
    for index in 0..groups {
        let len = base + usize::from(index < extra);
        chunks.push(ids[start..start + len].to_vec());
        start += len;
    }
    chunks.retain(|chunk| !chunk.is_empty());
    chunks
}

fn dedup_by_id(summaries: Vec<ProjectSummary>, requested: &[String]) -> Vec<ProjectSummary> {
    let wanted: HashSet<&str> = requested.iter().map(String::as_str).collect();
    let mut seen: HashSet<String> = HashSet::new();
    summaries
        .into_iter()
        .filter(|summary| wanted.contains(summary.id.as_str()))
        .filter(|summary| seen.insert(summary.id.clone()))
        .collect()
}
