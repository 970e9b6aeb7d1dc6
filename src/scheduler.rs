use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared, join_all};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::aggregate;
use crate::cache::ProjectCache;
use crate::dispatcher::Dispatcher;
use crate::model::{AggregateState, ProjectSummary, RefreshStats};
use crate::notifier::{ChangeKind, ChangeNotifier};
use crate::parser::{self, project_for_path};

#[derive(Debug, Clone, Error)]
pub enum RefreshError {
    #[error("failed to list projects in {path}: {message}")]
    ListProjects { path: PathBuf, message: String },
    #[error("refresh task aborted: {0}")]
    Aborted(String),
}

type RefreshResult = Result<Arc<AggregateState>, RefreshError>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshResult>>;

#[derive(Default)]
struct Flight {
    current: Option<(u64, SharedRefresh)>,
    pending: HashSet<String>,
    started: u64,
}

struct Inner {
    cache: ProjectCache,
    dispatcher: Dispatcher,
    notifier: Arc<ChangeNotifier>,
    state: watch::Sender<Option<Arc<AggregateState>>>,
    flight: Mutex<Flight>,
}

// Owns the cache and the published aggregate. At most one refresh runs at
// a time; callers arriving mid-run share its result.
#[derive(Clone)]
pub struct Aggregator {
    inner: Arc<Inner>,
}

impl Aggregator {
    pub fn new(cache: ProjectCache, dispatcher: Dispatcher, notifier: Arc<ChangeNotifier>) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                cache,
                dispatcher,
                notifier,
                state,
                flight: Mutex::new(Flight::default()),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        self.inner.cache.root()
    }

    pub fn snapshot(&self) -> Option<Arc<AggregateState>> {
        self.inner.state.borrow().clone()
    }

    pub async fn current(&self) -> Arc<AggregateState> {
        if let Some(state) = self.snapshot() {
            return state;
        }
        if let Err(err) = self.refresh(None).await {
            warn!(error = %err, "initial refresh failed");
        }
        self.snapshot()
            .unwrap_or_else(|| Arc::new(AggregateState::empty(Utc::now())))
    }

    // Refreshes the aggregate, first invalidating the project `changed`
    // points into. Returns once a run that has seen that invalidation
    // has finished.
    pub async fn refresh(&self, changed: Option<&Path>) -> RefreshResult {
        let project = changed.and_then(|path| project_for_path(self.root(), path));
        let requested_at = {
            let mut flight = self.lock_flight();
            if let Some(id) = &project {
                flight.pending.insert(id.clone());
            }
            flight.started
        };

        loop {
            let (run, future) = self.join_or_start();
            let result = future.await;
            if project.is_none() || run > requested_at {
                return result;
            }
            debug!(run, requested_at, "invalidation arrived after run started; refreshing again");
        }
    }

    fn lock_flight(&self) -> std::sync::MutexGuard<'_, Flight> {
        self.inner.flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn join_or_start(&self) -> (u64, SharedRefresh) {
        let mut flight = self.lock_flight();
        if let Some((run, future)) = &flight.current
            && future.peek().is_none()
        {
            return (*run, future.clone());
        }

        flight.started += 1;
        let run = flight.started;
        let invalidated = std::mem::take(&mut flight.pending);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run(run, invalidated).await });
        let future = async move {
            match handle.await {
                Ok(result) => result,
                Err(err) => Err(RefreshError::Aborted(err.to_string())),
            }
        }
        .boxed()
        .shared();
        flight.current = Some((run, future.clone()));
        (run, future)
    }
}

impl Inner {
    async fn run(&self, run: u64, invalidated: HashSet<String>) -> RefreshResult {
        let started = Instant::now();
        for id in &invalidated {
            self.cache.invalidate(id).await;
        }

        let root = self.cache.root().to_path_buf();
        let listing = {
            let root = root.clone();
            tokio::task::spawn_blocking(move || parser::list_projects(&root)).await
        };
        let ids = match listing {
            Ok(Ok(ids)) => ids,
            Ok(Err(err)) if err.kind() == io::ErrorKind::NotFound => {
                info!(root = %root.display(), "projects directory missing; nothing to aggregate");
                Vec::new()
            }
            Ok(Err(err)) => {
                return self.fail(RefreshError::ListProjects {
                    path: root,
                    message: err.to_string(),
                });
            }
            Err(err) => return self.fail(RefreshError::Aborted(err.to_string())),
        };

        let live: HashSet<String> = ids.iter().cloned().collect();
        let dropped = self.cache.retain(&live).await;
        if dropped > 0 {
            debug!(dropped, "forgot deleted projects");
        }

        let checks = join_all(ids.iter().map(|id| self.cache.needs_parsing(id))).await;
        let stale: Vec<String> = ids
            .iter()
            .zip(checks)
            .filter(|(_, stale)| *stale)
            .map(|(id, _)| id.clone())
            .collect();

        let outcome = self.dispatcher.parse_many(&stale).await;
        let mut fresh: HashMap<String, ProjectSummary> = outcome
            .summaries
            .into_iter()
            .map(|summary| (summary.id.clone(), summary))
            .collect();
        for id in &stale {
            self.cache.update(id, fresh.get(id).cloned()).await;
        }

        let stale_set: HashSet<&String> = stale.iter().collect();
        let mut projects = Vec::with_capacity(ids.len());
        for id in &ids {
            let summary = if stale_set.contains(id) {
                fresh.remove(id)
            } else {
                self.cache.get(id).await
            };
            projects.extend(summary);
        }

        let stats = RefreshStats {
            parsed_projects: stale.len(),
            cached_projects: ids.len() - stale.len(),
            strategy: outcome.strategy,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        let state = Arc::new(aggregate::build(projects, stats, Utc::now()));
        self.state.send_replace(Some(Arc::clone(&state)));
        self.notifier.publish(ChangeKind::Refresh);

        let cache_entries = self.cache.len().await;
        info!(
            run,
            projects = state.projects.len(),
            cache_entries,
            parsed = state.refresh.parsed_projects,
            cached = state.refresh.cached_projects,
            strategy = ?state.refresh.strategy,
            duration_ms = state.refresh.duration_ms,
            "aggregate refreshed"
        );
        Ok(state)
    }

    fn fail(&self, err: RefreshError) -> RefreshResult {
        warn!(error = %err, "refresh failed");
        self.state.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(Arc::new(AggregateState::empty(Utc::now())));
            true
        });
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::RateTable;
    use crate::decoder::DecoderKind;
    use crate::model::ParseStrategy;
    use crate::worker::{InProcessExecutor, ParseContext};
    use std::fs;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn haiku_line(input_tokens: u64) -> String {
        format!(
            r#"{{"type":"assistant","message":{{"model":"claude-haiku","usage":{{"input_tokens":{input_tokens}}}}}}}"#
        )
    }

    fn write_log(root: &Path, project: &str, input_tokens: u64) -> PathBuf {
        let dir = root.join(project);
        fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join("session.jsonl");
        fs::write(&path, haiku_line(input_tokens)).expect("write");
        path
    }

    fn bump_mtime(path: &Path) {
        let file = fs::File::options().write(true).open(path).expect("open");
        file.set_modified(SystemTime::now() + Duration::from_secs(10))
            .expect("set mtime");
    }

    fn aggregator(root: &Path) -> (Aggregator, Arc<ChangeNotifier>) {
        let notifier = Arc::new(ChangeNotifier::default());
        let context = ParseContext {
            root: root.to_path_buf(),
            decoder: DecoderKind::Strict,
            rates: Arc::new(RateTable::default()),
        };
        let dispatcher = Dispatcher::new(Arc::new(InProcessExecutor), context, 2);
        (
            Aggregator::new(ProjectCache::new(root), dispatcher, Arc::clone(&notifier)),
            notifier,
        )
    }

    #[tokio::test]
    async fn unchanged_projects_come_from_cache() {
        let tmp = TempDir::new().expect("temp dir");
        write_log(tmp.path(), "a", 1_000);
        write_log(tmp.path(), "b", 2_000);
        let (agg, _) = aggregator(tmp.path());

        let first = agg.refresh(None).await.expect("first refresh");
        assert_eq!(first.refresh.parsed_projects, 2);
        assert_ne!(first.refresh.strategy, ParseStrategy::None);

        let second = agg.refresh(None).await.expect("second refresh");
        assert_eq!(second.refresh.parsed_projects, 0);
        assert_eq!(second.refresh.cached_projects, 2);
        assert_eq!(second.refresh.strategy, ParseStrategy::None);
        assert_eq!(first.projects, second.projects);
    }

    #[tokio::test]
    async fn changed_project_is_reparsed_and_merged_with_cached() {
        let tmp = TempDir::new().expect("temp dir");
        write_log(tmp.path(), "a", 1_230_000);
        write_log(tmp.path(), "b", 1_000_000);
        let (agg, _) = aggregator(tmp.path());
        agg.refresh(None).await.expect("initial refresh");

        let changed = write_log(tmp.path(), "b", 4_560_000);
        bump_mtime(&changed);
        let state = agg.refresh(Some(&changed)).await.expect("refresh");

        assert_eq!(state.refresh.parsed_projects, 1);
        assert_eq!(state.refresh.cached_projects, 1);
        assert!((state.total_estimated_cost - 5.79).abs() < 1e-9);
    }

    #[tokio::test]
    async fn invalidation_forces_reparse_even_without_mtime_change() {
        let tmp = TempDir::new().expect("temp dir");
        let log = write_log(tmp.path(), "a", 10);
        let (agg, _) = aggregator(tmp.path());
        agg.refresh(None).await.expect("initial refresh");

        let state = agg.refresh(Some(&log)).await.expect("refresh");
        assert_eq!(state.refresh.parsed_projects, 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_run() {
        let tmp = TempDir::new().expect("temp dir");
        write_log(tmp.path(), "a", 10);
        write_log(tmp.path(), "b", 20);
        let (agg, _) = aggregator(tmp.path());

        let (left, right) = tokio::join!(agg.refresh(None), agg.refresh(None));
        let left = left.expect("left");
        let right = right.expect("right");
        assert!(Arc::ptr_eq(&left, &right));
    }

    #[tokio::test]
    async fn deleted_projects_drop_out() {
        let tmp = TempDir::new().expect("temp dir");
        write_log(tmp.path(), "keep", 10);
        write_log(tmp.path(), "gone", 10);
        let (agg, _) = aggregator(tmp.path());
        assert_eq!(agg.refresh(None).await.expect("refresh").projects.len(), 2);

        fs::remove_dir_all(tmp.path().join("gone")).expect("remove");
        let state = agg.refresh(None).await.expect("refresh");
        assert_eq!(state.projects.len(), 1);
        assert_eq!(state.projects[0].id, "keep");
        assert_eq!(agg.inner.cache.len().await, 1);
    }

    #[tokio::test]
    async fn missing_root_publishes_empty_state() {
        let tmp = TempDir::new().expect("temp dir");
        let (agg, _) = aggregator(&tmp.path().join("absent"));
        assert!(agg.snapshot().is_none());

        let state = agg.current().await;
        assert!(state.projects.is_empty());
        assert_eq!(state.total_estimated_cost, 0.0);
        assert!(agg.snapshot().is_some());
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_state() {
        let tmp = TempDir::new().expect("temp dir");
        let root = tmp.path().join("projects");
        write_log(&root, "a", 1_000_000);
        let (agg, _) = aggregator(&root);
        let first = agg.refresh(None).await.expect("first refresh");

        fs::remove_dir_all(&root).expect("remove root");
        fs::write(&root, "not a directory").expect("replace root");

        let err = agg.refresh(None).await.expect_err("listing a file fails");
        assert!(matches!(err, RefreshError::ListProjects { .. }));
        let kept = agg.snapshot().expect("previous state");
        assert!(Arc::ptr_eq(&first, &kept));
        assert_eq!(kept.total_estimated_cost, 1.0);
    }

    #[tokio::test]
    async fn notifies_after_publishing() {
        let tmp = TempDir::new().expect("temp dir");
        write_log(tmp.path(), "a", 10);
        let (agg, notifier) = aggregator(tmp.path());
        let mut sub = notifier.subscribe();

        agg.refresh(None).await.expect("refresh");
        let event = sub.try_recv().expect("refresh event");
        assert_eq!(event.kind, ChangeKind::Refresh);
        assert!(agg.snapshot().is_some());
    }

    #[tokio::test]
    async fn paths_outside_root_do_not_invalidate() {
        let tmp = TempDir::new().expect("temp dir");
        write_log(tmp.path(), "a", 10);
        let (agg, _) = aggregator(tmp.path());
        agg.refresh(None).await.expect("initial refresh");

        let state = agg
            .refresh(Some(Path::new("/somewhere/else/x.jsonl")))
            .await
            .expect("refresh");
        assert_eq!(state.refresh.parsed_projects, 0);
    }
}
