use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use futures::{StreamExt, future, stream};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::cost::RateTable;
use crate::decoder::{LineDecoder, LogRecords};
use crate::model::{DayActivity, ModelUsage, ProjectSummary, TokenUsage};

pub const INDEX_FILE: &str = "sessions-index.json";
pub const LOG_EXTENSION: &str = "jsonl";
const FILE_FANOUT: usize = 16;

#[derive(Debug, Deserialize)]
struct SessionIndex {
    entries: Vec<IndexEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexEntry {
    #[serde(default)]
    message_count: u64,
    #[serde(default)]
    modified: Option<String>,
    #[serde(default)]
    project_path: Option<String>,
}

struct Invocation {
    dedup_key: Option<String>,
    model: String,
    tokens: TokenUsage,
    day: Option<NaiveDate>,
}

#[derive(Default)]
struct SessionScan {
    records: usize,
    malformed: usize,
    invocations: Vec<Invocation>,
    messages: u64,
    messages_by_day: BTreeMap<NaiveDate, u64>,
    first_seen: Option<DateTime<Utc>>,
    last_seen: Option<DateTime<Utc>>,
    cwd: Option<String>,
}

pub fn list_projects(root: &Path) -> io::Result<Vec<String>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                debug!(error = %err, "skipping unreadable projects entry");
                continue;
            }
        };
        if !entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            ids.push(name.to_string());
        }
    }
    ids.sort();
    Ok(ids)
}

pub fn project_for_path(root: &Path, changed: &Path) -> Option<String> {
    let relative = changed.strip_prefix(root).ok()?;
    let mut components = relative.components();
    let project = components.next()?.as_os_str().to_str()?.to_string();
    components.next()?;
    Some(project)
}

// Claude Code encodes the working directory into the project folder name
// by replacing separators with `-`.
pub fn decode_project_dir(id: &str) -> String {
    id.replace('-', "/")
}

pub fn display_name_for(path: &str) -> String {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| path.to_string())
}

#[derive(Clone)]
pub struct ProjectParser {
    root: PathBuf,
    decoder: Arc<dyn LineDecoder>,
    rates: Arc<RateTable>,
}

impl ProjectParser {
    pub fn new(root: impl Into<PathBuf>, decoder: Arc<dyn LineDecoder>, rates: Arc<RateTable>) -> Self {
        Self {
            root: root.into(),
            decoder,
            rates,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn parse_many(&self, project_ids: &[String]) -> Vec<ProjectSummary> {
        let mut summaries = Vec::with_capacity(project_ids.len());
        for id in project_ids {
            if let Some(summary) = self.parse_project(id).await {
                summaries.push(summary);
            }
        }
        summaries
    }

    pub async fn parse_project(&self, project_id: &str) -> Option<ProjectSummary> {
        let dir = self.root.join(project_id);
        let listing = tokio::task::spawn_blocking(move || (read_index(&dir), log_files(&dir))).await;
        let (index, files) = match listing {
            Ok(found) => found,
            Err(err) => {
                warn!(project = %project_id, error = %err, "project listing task failed");
                return None;
            }
        };

        let mut scans: Vec<(PathBuf, SessionScan)> = stream::iter(files)
            .map(|path| {
                let decoder = self.decoder.clone();
                async move {
                    let target = path.clone();
                    match tokio::task::spawn_blocking(move || scan_session(&target, decoder)).await {
                        Ok(scan) => Some((path, scan)),
                        Err(err) => {
                            warn!(path = %path.display(), error = %err, "log scan task failed");
                            None
                        }
                    }
                }
            })
            .buffer_unordered(FILE_FANOUT)
            .filter_map(future::ready)
            .collect()
            .await;
        scans.sort_by(|a, b| a.0.cmp(&b.0));

        let records: usize = scans.iter().map(|(_, scan)| scan.records).sum();
        let malformed: usize = scans.iter().map(|(_, scan)| scan.malformed).sum();
        if malformed > 0 {
            debug!(project = %project_id, malformed, "skipped malformed log lines");
        }
        if records == 0 && index.is_none() {
            debug!(project = %project_id, "no records and no index; omitting project");
            return None;
        }

        Some(self.summarize(project_id, index, scans))
    }

    fn summarize(
        &self,
        project_id: &str,
        index: Option<SessionIndex>,
        scans: Vec<(PathBuf, SessionScan)>,
    ) -> ProjectSummary {
        let mut families: BTreeMap<String, TokenUsage> = BTreeMap::new();
        let mut daily: BTreeMap<NaiveDate, DayActivity> = BTreeMap::new();
        let mut seen_keys: HashSet<String> = HashSet::new();
        let mut session_count = 0u64;
        let mut message_count = 0u64;
        let mut last_active: Option<DateTime<Utc>> = None;
        let mut cwd_hint: Option<String> = None;

        for (_, scan) in scans {
            if scan.records > 0 {
                session_count += 1;
            }
            message_count += scan.messages;
            last_active = last_active.max(scan.last_seen);
            if cwd_hint.is_none() {
                cwd_hint = scan.cwd;
            }
            if let Some(first) = scan.first_seen {
                daily.entry(first.date_naive()).or_default().session_count += 1;
            }
            for (day, messages) in scan.messages_by_day {
                daily.entry(day).or_default().message_count += messages;
            }
            for invocation in scan.invocations {
                if let Some(key) = invocation.dedup_key
                    && !seen_keys.insert(key)
                {
                    continue;
                }
                let family = self.rates.family_of(&invocation.model);
                *families.entry(family).or_default() += invocation.tokens;
                if let Some(day) = invocation.day {
                    daily.entry(day).or_default().token_count += invocation.tokens.billable();
                }
            }
        }

        let mut index_path = None;
        if let Some(index) = index {
            session_count = index.entries.len() as u64;
            message_count = index.entries.iter().map(|entry| entry.message_count).sum();
            let indexed_last = index
                .entries
                .iter()
                .filter_map(|entry| entry.modified.as_deref().and_then(parse_timestamp))
                .max();
            if indexed_last.is_some() {
                last_active = indexed_last;
            }
            index_path = index
                .entries
                .into_iter()
                .filter_map(|entry| entry.project_path)
                .find(|path| !path.trim().is_empty());
        }

        let path = index_path
            .or(cwd_hint)
            .unwrap_or_else(|| decode_project_dir(project_id));

        let mut total_tokens = TokenUsage::default();
        let mut estimated_cost = 0.0;
        let models: BTreeMap<String, ModelUsage> = families
            .into_iter()
            .map(|(family, tokens)| {
                let cost = self.rates.family_cost(&family, &tokens);
                total_tokens += tokens;
                estimated_cost += cost;
                (
                    family,
                    ModelUsage {
                        tokens,
                        estimated_cost: cost,
                    },
                )
            })
            .collect();

        ProjectSummary {
            id: project_id.to_string(),
            display_name: display_name_for(&path),
            path,
            session_count,
            message_count,
            total_tokens,
            last_active,
            estimated_cost,
            models,
            daily,
        }
    }
}

fn read_index(dir: &Path) -> Option<SessionIndex> {
    let path = dir.join(INDEX_FILE);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to read session index");
            return None;
        }
    };
    match serde_json::from_str::<SessionIndex>(&raw) {
        Ok(index) => Some(index),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring malformed session index");
            None
        }
    }
}

fn log_files(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some(LOG_EXTENSION))
        .collect()
}

fn scan_session(path: &Path, decoder: Arc<dyn LineDecoder>) -> SessionScan {
    let mut scan = SessionScan::default();
    let mut records = match LogRecords::open(path, decoder) {
        Ok(records) => records,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to open session log");
            return scan;
        }
    };

    let mut keyed: HashMap<String, usize> = HashMap::new();
    for record in records.by_ref() {
        scan.records += 1;
        let timestamp = record
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(parse_timestamp);
        if let Some(ts) = timestamp {
            scan.first_seen = Some(scan.first_seen.map_or(ts, |first| first.min(ts)));
            scan.last_seen = scan.last_seen.max(Some(ts));
        }

        match role_of(&record) {
            Some("assistant") => {
                let Some(tokens) = usage_of(&record) else {
                    continue;
                };
                let invocation = Invocation {
                    dedup_key: dedup_key(&record),
                    model: record
                        .pointer("/message/model")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                    tokens,
                    day: timestamp.map(|ts| ts.date_naive()),
                };
                match invocation.dedup_key.clone() {
                    Some(key) => match keyed.get(&key) {
                        Some(&slot) => scan.invocations[slot] = invocation,
                        None => {
                            keyed.insert(key, scan.invocations.len());
                            scan.invocations.push(invocation);
                        }
                    },
                    None => scan.invocations.push(invocation),
                }
            }
            Some("user") => {
                if record.get("isMeta").and_then(Value::as_bool) == Some(true) {
                    continue;
                }
                scan.messages += 1;
                if let Some(ts) = timestamp {
                    *scan.messages_by_day.entry(ts.date_naive()).or_default() += 1;
                }
                if scan.cwd.is_none()
                    && let Some(cwd) = record.get("cwd").and_then(Value::as_str)
                    && !cwd.trim().is_empty()
                {
                    scan.cwd = Some(cwd.to_string());
                }
            }
            _ => {}
        }
    }
    scan.malformed = records.malformed();
    scan
}

fn role_of(record: &Value) -> Option<&str> {
    record
        .get("type")
        .and_then(Value::as_str)
        .or_else(|| record.pointer("/message/role").and_then(Value::as_str))
}

fn usage_of(record: &Value) -> Option<TokenUsage> {
    let usage = record.pointer("/message/usage")?;
    let field = |name: &str| usage.get(name).and_then(Value::as_u64).unwrap_or(0);
    let tokens = TokenUsage::new(
        field("input_tokens"),
        field("output_tokens"),
        field("cache_read_input_tokens"),
        field("cache_creation_input_tokens"),
    );
    (!tokens.is_zero()).then_some(tokens)
}

fn dedup_key(record: &Value) -> Option<String> {
    let message_id = record.pointer("/message/id").and_then(Value::as_str)?;
    let request_id = record.get("requestId").and_then(Value::as_str)?;
    Some(format!("{message_id}:{request_id}"))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}
