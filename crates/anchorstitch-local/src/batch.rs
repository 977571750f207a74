//! Batch driver: many documents, independent sessions, bounded
//! concurrency.
//!
//! Resumption is idempotent at the file level: a document whose output
//! file already exists is skipped without touching the model
//! (at-least-once semantics; outputs are written atomically, so a
//! half-written file can never masquerade as a completed document).

use crate::normalize::prepare_transcript;
use crate::session::{run_session, SessionConfig};
use crate::store::{sha256_hex, write_atomic};
use crate::usage::UsageLedger;
use anchorstitch_core::{doc_id, ContentModel, Error, RawDocument, Segment};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub out_dir: PathBuf,
    pub debug_dir: PathBuf,
    /// Concurrent documents. Sessions never share anything but the ledger.
    pub workers: usize,
    pub session: SessionConfig,
    /// Apply [`prepare_transcript`] before indexing.
    pub prepare: bool,
}

#[derive(Debug, Serialize)]
pub struct DocReport {
    pub doc_id: String,
    #[serde(flatten)]
    pub status: DocStatus,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DocStatus {
    Written {
        path: PathBuf,
        segments: usize,
        attempts: u32,
        usage_tokens: u64,
    },
    SkippedExisting {
        path: PathBuf,
    },
    CapReached,
    Failed {
        error: String,
    },
}

#[derive(Debug, Serialize)]
struct ResultFile<'a> {
    doc_id: &'a str,
    model: &'a str,
    source_sha256: String,
    segments: &'a [Segment],
}

pub fn out_path(out_dir: &Path, doc_id: &str) -> PathBuf {
    out_dir.join(format!("topic_{doc_id}.json"))
}

async fn process_doc<M: ContentModel + ?Sized>(
    model: &M,
    input: &Path,
    instructions: &str,
    ledger: Option<&UsageLedger>,
    cfg: &BatchConfig,
) -> DocReport {
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| input.to_string_lossy().to_string());
    let id = doc_id(&name);
    let out = out_path(&cfg.out_dir, &id);

    if out.exists() {
        return DocReport {
            doc_id: id,
            status: DocStatus::SkippedExisting { path: out },
        };
    }
    if let Some(l) = ledger {
        if l.ensure_under_cap().is_err() {
            return DocReport {
                doc_id: id,
                status: DocStatus::CapReached,
            };
        }
    }

    let text = match tokio::fs::read_to_string(input).await {
        Ok(t) => t,
        Err(e) => {
            return DocReport {
                doc_id: id,
                status: DocStatus::Failed {
                    error: format!("read {}: {e}", input.display()),
                },
            }
        }
    };
    let text = if cfg.prepare {
        prepare_transcript(&text)
    } else {
        text
    };
    let doc = RawDocument {
        id: id.clone(),
        text,
    };

    let session_cfg = SessionConfig {
        debug_dir: Some(cfg.debug_dir.clone()),
        ..cfg.session.clone()
    };
    match run_session(model, &doc, instructions, &session_cfg, ledger).await {
        Ok(outcome) => {
            let body = ResultFile {
                doc_id: &id,
                model: model.name(),
                source_sha256: sha256_hex(doc.text.as_bytes()),
                segments: &outcome.segments,
            };
            let bytes = match serde_json::to_vec_pretty(&body) {
                Ok(b) => b,
                Err(e) => {
                    return DocReport {
                        doc_id: id,
                        status: DocStatus::Failed {
                            error: format!("serialize: {e}"),
                        },
                    }
                }
            };
            match write_atomic(&out, &bytes) {
                Ok(()) => DocReport {
                    doc_id: id,
                    status: DocStatus::Written {
                        path: out,
                        segments: outcome.segments.len(),
                        attempts: outcome.attempts,
                        usage_tokens: outcome.usage_tokens,
                    },
                },
                Err(e) => DocReport {
                    doc_id: id,
                    status: DocStatus::Failed {
                        error: e.to_string(),
                    },
                },
            }
        }
        Err(Error::CapExceeded { .. }) => DocReport {
            doc_id: id,
            status: DocStatus::CapReached,
        },
        Err(e) => DocReport {
            doc_id: id,
            status: DocStatus::Failed {
                error: e.to_string(),
            },
        },
    }
}

/// Process every input, one independent session per document, at most
/// `workers` documents in flight. A fatal error in one document never
/// touches another document's state; reports come back sorted by id.
pub async fn run_batch<M: ContentModel + ?Sized>(
    model: &M,
    inputs: &[PathBuf],
    instructions: &str,
    ledger: Option<&UsageLedger>,
    cfg: &BatchConfig,
) -> Vec<DocReport> {
    let mut inputs: Vec<PathBuf> = inputs.to_vec();
    inputs.sort();

    let mut reports: Vec<DocReport> = stream::iter(inputs.iter())
        .map(|p| process_doc(model, p, instructions, ledger, cfg))
        .buffer_unordered(cfg.workers.max(1))
        .collect()
        .await;
    reports.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));
    reports
}
