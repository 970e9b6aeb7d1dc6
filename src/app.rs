use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::ProjectCache;
use crate::config::{self, PulseConfig, RuntimeSettings};
use crate::cost::RateTable;
use crate::dispatcher::Dispatcher;
use crate::lifecycle::{LifecycleConfig, LifecycleTracker};
use crate::model::AggregateState;
use crate::notifier::{ChangeEvent, ChangeNotifier, Subscription};
use crate::parser;
use crate::process_guard::{self, RunningState};
use crate::scheduler::Aggregator;
use crate::util::{
    format_cost, format_local_time, format_percent, format_tokens, human_duration, truncate,
};
use crate::worker::{InProcessExecutor, IsolatedExecutor, ParseContext, ProcessExecutor};

const FEED_CAPACITY: usize = 256;
const TOP_PROJECTS: usize = 10;

pub fn default_executor(runtime: &RuntimeSettings) -> Arc<dyn IsolatedExecutor> {
    match ProcessExecutor::current_exe(runtime.worker_timeout) {
        Ok(executor) => Arc::new(executor),
        Err(err) => {
            warn!(error = %err, "cannot resolve current executable; parsing in process");
            Arc::new(InProcessExecutor)
        }
    }
}

pub fn build_aggregator(
    config: &PulseConfig,
    runtime: &RuntimeSettings,
    executor: Arc<dyn IsolatedExecutor>,
    notifier: Arc<ChangeNotifier>,
) -> Aggregator {
    let root = config.projects_root();
    let context = ParseContext {
        root: root.clone(),
        decoder: config.decoder,
        rates: Arc::new(RateTable::from_config(&config.pricing)),
    };
    let dispatcher = Dispatcher::new(executor, context, runtime.max_workers);
    Aggregator::new(ProjectCache::new(root), dispatcher, notifier)
}

pub async fn run(config: PulseConfig, runtime: RuntimeSettings, read_stdin: bool) -> Result<()> {
    let notifier = Arc::new(ChangeNotifier::default());
    let aggregator = build_aggregator(
        &config,
        &runtime,
        default_executor(&runtime),
        Arc::clone(&notifier),
    );
    let root = aggregator.root().to_path_buf();
    let tracker = LifecycleTracker::spawn(
        root.clone(),
        LifecycleConfig {
            idle_timeout: runtime.idle_timeout,
            grace_period: runtime.grace_period,
            shutdown_disabled: runtime.shutdown_disabled,
        },
        runtime.sweep_interval,
        Arc::clone(&notifier),
    );
    let heartbeat = notifier.spawn_heartbeat(runtime.heartbeat_interval);
    let mut events = notifier.subscribe();
    let mut exit = tracker.exit_signal();

    info!(
        root = %root.display(),
        max_workers = runtime.max_workers,
        subscribers = notifier.subscriber_count(),
        shutdown_disabled = runtime.shutdown_disabled,
        "usage pulse started"
    );
    let initial = aggregator.current().await;
    info!(
        projects = initial.projects.len(),
        cost = %format_cost(initial.total_estimated_cost),
        "initial aggregate ready"
    );

    let (path_tx, mut paths) = mpsc::channel::<PathBuf>(FEED_CAPACITY);
    let feed = if read_stdin {
        Some(tokio::spawn(forward_paths(
            BufReader::new(tokio::io::stdin()),
            path_tx,
        )))
    } else {
        drop(path_tx);
        None
    };

    let mut periodic = tokio::time::interval(runtime.refresh_interval);
    periodic.set_missed_tick_behavior(MissedTickBehavior::Delay);
    periodic.tick().await;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            biased;
            result = &mut ctrl_c => {
                if let Err(err) = result {
                    warn!(error = %err, "failed to listen for Ctrl+C");
                }
                info!("interrupt received; stopping");
                break;
            }
            Some(event) = events.recv() => emit_event(&mut io::stdout().lock(), &event),
            changed = exit.changed() => {
                if changed.is_err() || *exit.borrow() {
                    break;
                }
            }
            Some(path) = paths.recv() => {
                tracker.observe(path.clone()).await;
                spawn_refresh(&aggregator, Some(path));
            }
            _ = periodic.tick() => spawn_refresh(&aggregator, None),
        }
    }

    heartbeat.stop().await;
    tracker.stop().await;
    let flushed = drain_events(&mut events, &mut io::stdout().lock());
    debug!(flushed, "flushed pending change events");
    notifier.unsubscribe(events.id());
    if let Some(feed) = feed {
        feed.abort();
    }
    info!("usage pulse stopped");
    Ok(())
}

fn emit_event<W: Write>(out: &mut W, event: &ChangeEvent) {
    let written = serde_json::to_string(event)
        .map_err(io::Error::from)
        .and_then(|line| writeln!(out, "{line}"));
    if let Err(err) = written {
        warn!(error = %err, "failed to emit change event");
    }
}

// Writes whatever events are still queued, so a shutdown notice published
// right before the exit signal still reaches stdout.
fn drain_events<W: Write>(events: &mut Subscription, out: &mut W) -> usize {
    let mut drained = 0;
    while let Some(event) = events.try_recv() {
        emit_event(out, &event);
        drained += 1;
    }
    drained
}

fn spawn_refresh(aggregator: &Aggregator, changed: Option<PathBuf>) {
    let aggregator = aggregator.clone();
    tokio::spawn(async move {
        if let Err(err) = aggregator.refresh(changed.as_deref()).await {
            warn!(error = %err, "refresh failed");
        }
    });
}

async fn forward_paths<R>(reader: R, tx: mpsc::Sender<PathBuf>)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if tx.send(PathBuf::from(trimmed)).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                debug!("change feed closed");
                return;
            }
            Err(err) => {
                warn!(error = %err, "change feed read failed");
                return;
            }
        }
    }
}

pub async fn print_status(config: &PulseConfig, json: bool) -> Result<()> {
    let runtime = config::runtime_settings();
    let notifier = Arc::new(ChangeNotifier::default());
    let aggregator = build_aggregator(config, &runtime, default_executor(&runtime), notifier);
    let state = aggregator.current().await;

    if json {
        let payload =
            serde_json::to_string_pretty(state.as_ref()).context("failed to encode aggregate")?;
        println!("{payload}");
        return Ok(());
    }

    let running = process_guard::inspect_running_instance()?;
    println!("claude-usage-pulse status");
    match running {
        RunningState::NotRunning => println!("daemon: not running"),
        RunningState::Running { pid, started_at } => {
            let pid = pid.map_or_else(|| "unknown".to_string(), |pid| pid.to_string());
            match started_at {
                Some(at) => println!("daemon: running (pid {pid}, since {})", format_local_time(at)),
                None => println!("daemon: running (pid {pid})"),
            }
        }
    }
    println!("projects_dir: {}", aggregator.root().display());
    for line in status_lines(&state) {
        println!("{line}");
    }
    Ok(())
}

pub fn status_lines(state: &AggregateState) -> Vec<String> {
    let tokens = &state.total_tokens;
    let mut lines = vec![
        format!(
            "projects: {}  sessions: {}  messages: {}",
            state.projects.len(),
            state.total_sessions,
            state.total_messages
        ),
        format!(
            "tokens: input {} | output {} | cache read {} | cache write {}",
            format_tokens(tokens.input),
            format_tokens(tokens.output),
            format_tokens(tokens.cache_read),
            format_tokens(tokens.cache_creation)
        ),
        format!("estimated_cost: {}", format_cost(state.total_estimated_cost)),
        format!("cache_hit_ratio: {}", format_percent(state.cache_hit_ratio)),
        format!(
            "streak: current {} day(s), longest {} day(s)",
            state.streaks.current, state.streaks.longest
        ),
    ];
    if let Some(day) = &state.most_active_day {
        lines.push(format!(
            "most_active_day: {} ({} messages)",
            day.date, day.message_count
        ));
    }

    if !state.model_breakdown.is_empty() {
        lines.push("models:".to_string());
        for (family, usage) in &state.model_breakdown {
            lines.push(format!(
                "  {family:<8} {:>8} tokens  {}",
                format_tokens(usage.tokens.total()),
                format_cost(usage.estimated_cost)
            ));
        }
    }

    if !state.projects.is_empty() {
        lines.push("recent projects:".to_string());
        for project in state.projects.iter().take(TOP_PROJECTS) {
            let last = project
                .last_active
                .map(format_local_time)
                .unwrap_or_else(|| "never".to_string());
            lines.push(format!(
                "  {:<28} {:>4} sessions  {:>9}  {last}",
                truncate(&project.display_name, 28),
                project.session_count,
                format_cost(project.estimated_cost)
            ));
        }
    }

    lines.push(format!(
        "refresh: parsed {} cached {} via {:?} in {} ms",
        state.refresh.parsed_projects,
        state.refresh.cached_projects,
        state.refresh.strategy,
        state.refresh.duration_ms
    ));
    lines
}

pub fn doctor(config: &PulseConfig) -> Result<u8> {
    let mut issues = 0u8;
    let home = config::claude_home();
    let root = config.projects_root();

    println!("claude-usage-pulse doctor");
    println!("claude_home: {}", home.display());
    println!("config_path: {}", config::config_path().display());
    println!("projects_dir: {}", root.display());

    if home.is_dir() {
        println!("[OK] Claude home directory exists.");
    } else {
        issues += 1;
        println!("[WARN] Claude home directory not found.");
    }

    match parser::list_projects(&root) {
        Ok(ids) => println!("[OK] {} project directories found.", ids.len()),
        Err(err) => {
            issues += 1;
            println!("[WARN] Cannot read projects directory: {err}");
        }
    }

    match std::env::current_exe() {
        Ok(path) => println!("[OK] Worker executable: {}", path.display()),
        Err(err) => {
            issues += 1;
            println!("[WARN] Cannot resolve worker executable ({err}); parsing will stay in process.");
        }
    }

    match process_guard::inspect_running_instance()? {
        RunningState::NotRunning => println!("[OK] No daemon currently holds the lock."),
        RunningState::Running { pid, .. } => match pid {
            Some(pid) => println!("[INFO] Daemon running with PID {pid}."),
            None => println!("[INFO] Daemon running (PID unknown)."),
        },
    }

    let rates = RateTable::from_config(&config.pricing);
    println!(
        "[INFO] pricing families: {}",
        rates.families().collect::<Vec<_>>().join(", ")
    );

    let runtime = config::runtime_settings();
    println!(
        "[INFO] idle {}, grace {}, workers {}, shutdown {}",
        human_duration(runtime.idle_timeout),
        human_duration(runtime.grace_period),
        runtime.max_workers,
        if runtime.shutdown_disabled {
            "disabled"
        } else {
            "enabled"
        }
    );

    if issues == 0 {
        println!("Doctor: healthy");
        Ok(0)
    } else {
        println!("Doctor: {issues} issue(s) found");
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DailyActivity, ModelUsage, TokenUsage};
    use crate::notifier::ChangeKind;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn forwards_non_empty_lines_as_paths() {
        let (tx, mut rx) = mpsc::channel(8);
        let input: &[u8] = b"/p/a/s1.jsonl\n\n   \n/p/b/s2.jsonl\n";
        forward_paths(input, tx).await;

        assert_eq!(rx.recv().await, Some(PathBuf::from("/p/a/s1.jsonl")));
        assert_eq!(rx.recv().await, Some(PathBuf::from("/p/b/s2.jsonl")));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_notice_survives_the_exit_signal() {
        let notifier = Arc::new(ChangeNotifier::default());
        let mut events = notifier.subscribe();
        let tracker = LifecycleTracker::spawn(
            PathBuf::from("/projects"),
            LifecycleConfig {
                idle_timeout: Duration::from_secs(1),
                grace_period: Duration::from_secs(1),
                shutdown_disabled: false,
            },
            Duration::from_secs(1),
            Arc::clone(&notifier),
        );
        let mut exit = tracker.exit_signal();
        exit.wait_for(|flag| *flag).await.expect("exit signal");
        tracker.stop().await;

        let mut out: Vec<u8> = Vec::new();
        assert_eq!(drain_events(&mut events, &mut out), 1);
        let text = String::from_utf8(out).expect("utf8");
        let line: serde_json::Value = serde_json::from_str(text.trim()).expect("json line");
        assert_eq!(line["type"], "shutdown");
        assert_eq!(drain_events(&mut events, &mut Vec::<u8>::new()), 0);
    }

    #[test]
    fn emitted_events_are_one_json_object_per_line() {
        let mut out: Vec<u8> = Vec::new();
        emit_event(&mut out, &ChangeEvent::now(ChangeKind::Heartbeat));
        emit_event(&mut out, &ChangeEvent::now(ChangeKind::Refresh));
        let text = String::from_utf8(out).expect("utf8");
        let kinds: Vec<String> = text
            .lines()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).expect("json");
                value["type"].as_str().expect("type").to_string()
            })
            .collect();
        assert_eq!(kinds, vec!["heartbeat", "refresh"]);
    }

    #[tokio::test]
    async fn configured_pricing_flows_into_the_aggregate() {
        let tmp = TempDir::new().expect("temp dir");
        let dir = tmp.path().join("-work-site");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(
            dir.join("s.jsonl"),
            r#"{"type":"assistant","message":{"model":"in-house-7b","usage":{"input_tokens":2000000}}}"#,
        )
        .expect("write");

        let mut config = PulseConfig {
            projects_dir: Some(tmp.path().display().to_string()),
            ..PulseConfig::default()
        };
        config
            .pricing
            .aliases
            .insert("in-house".to_string(), "haiku".to_string());

        let aggregator = build_aggregator(
            &config,
            &RuntimeSettings::default(),
            Arc::new(InProcessExecutor),
            Arc::new(ChangeNotifier::default()),
        );
        let state = aggregator.current().await;
        assert_eq!(state.projects.len(), 1);
        assert!((state.total_estimated_cost - 2.0).abs() < 1e-9);
        assert!(state.model_breakdown.contains_key("haiku"));
    }

    #[test]
    fn status_lines_summarize_the_aggregate() {
        let mut state = AggregateState::default();
        state.total_estimated_cost = 12.5;
        state.total_tokens = TokenUsage::new(1_500, 200, 0, 0);
        state.model_breakdown.insert(
            "opus".to_string(),
            ModelUsage {
                tokens: TokenUsage::new(1_500, 200, 0, 0),
                estimated_cost: 12.5,
            },
        );
        state.most_active_day = Some(DailyActivity {
            message_count: 9,
            ..DailyActivity::default()
        });

        let lines = status_lines(&state);
        assert!(lines.iter().any(|line| line == "estimated_cost: $12.50"));
        assert!(lines.iter().any(|line| line.starts_with("  opus") && line.contains("1.7K")));
        assert!(lines.iter().any(|line| line.contains("(9 messages)")));
    }
}
