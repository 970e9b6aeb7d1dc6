use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

const WARN_LIMIT: usize = 3;
const PROBE_RECORD: &[u8] =
    br#"{"type":"assistant","message":{"model":"probe","usage":{"input_tokens":1}}}"#;

pub trait LineDecoder: Send + Sync {
    fn name(&self) -> &'static str;
    fn decode(&self, line: &[u8]) -> Result<Value, serde_json::Error>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StrictDecoder;

impl LineDecoder for StrictDecoder {
    fn name(&self) -> &'static str {
        "strict"
    }

    fn decode(&self, line: &[u8]) -> Result<Value, serde_json::Error> {
        serde_json::from_slice(line)
    }
}

// Replaces invalid UTF-8 sequences before decoding, so a stray byte inside
// a string value does not cost the whole record.
#[derive(Debug, Default, Clone, Copy)]
pub struct LossyDecoder;

impl LineDecoder for LossyDecoder {
    fn name(&self) -> &'static str {
        "lossy"
    }

    fn decode(&self, line: &[u8]) -> Result<Value, serde_json::Error> {
        let text = String::from_utf8_lossy(line);
        serde_json::from_str(&text)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DecoderKind {
    #[default]
    Auto,
    Strict,
    Lossy,
}

pub fn select_decoder(kind: DecoderKind) -> Arc<dyn LineDecoder> {
    match kind {
        DecoderKind::Strict => Arc::new(StrictDecoder),
        DecoderKind::Lossy => Arc::new(LossyDecoder),
        DecoderKind::Auto => {
            if probe(&StrictDecoder) {
                Arc::new(StrictDecoder)
            } else {
                warn!("strict decoder failed its probe; using lossy decoder");
                Arc::new(LossyDecoder)
            }
        }
    }
}

fn probe(decoder: &dyn LineDecoder) -> bool {
    decoder
        .decode(PROBE_RECORD)
        .ok()
        .and_then(|value| {
            value
                .pointer("/message/usage/input_tokens")
                .and_then(Value::as_u64)
        })
        == Some(1)
}

pub struct LogRecords {
    path: PathBuf,
    reader: BufReader<File>,
    decoder: Arc<dyn LineDecoder>,
    buf: Vec<u8>,
    line_no: usize,
    malformed: usize,
    done: bool,
}

impl LogRecords {
    pub fn open(path: &Path, decoder: Arc<dyn LineDecoder>) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            decoder,
            buf: Vec::new(),
            line_no: 0,
            malformed: 0,
            done: false,
        })
    }

    pub fn malformed(&self) -> usize {
        self.malformed
    }

    fn finish(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if self.malformed > WARN_LIMIT {
            debug!(
                path = %self.path.display(),
                malformed = self.malformed,
                suppressed = self.malformed - WARN_LIMIT,
                "suppressed further malformed line warnings"
            );
        }
    }
}

impl Iterator for LogRecords {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        if self.done {
            return None;
        }
        loop {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => {
                    self.finish();
                    return None;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(path = %self.path.display(), error = %err, "log read failed; stopping early");
                    self.finish();
                    return None;
                }
            }
            self.line_no += 1;

            let line = self.buf.trim_ascii();
            if line.is_empty() || is_comment(line) {
                continue;
            }
            match self.decoder.decode(line) {
                Ok(value) => return Some(value),
                Err(err) => {
                    self.malformed += 1;
                    if self.malformed <= WARN_LIMIT {
                        warn!(
                            path = %self.path.display(),
                            line = self.line_no,
                            error = %err,
                            "skipping malformed log line"
                        );
                    }
                }
            }
        }
    }
}

fn is_comment(line: &[u8]) -> bool {
    line.starts_with(b"#") || line.starts_with(b"//")
}
