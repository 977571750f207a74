//! The resumable windowed extraction loop.
//!
//! One session covers one document: slice the raw text to the per-call
//! window, invoke the content model, resolve the returned anchor in the
//! normalized search space, advance the cursor, merge segments. The
//! session is strictly sequential within a document (each slice depends
//! on the previous call's resolved anchor) and generic over the
//! [`ContentModel`] capability, so every backend shares this one loop.

use crate::diagnostics::{capture, AlignmentDump};
use crate::normalize::NormIndex;
use crate::usage::UsageLedger;
use anchorstitch_core::{ContentModel, Error, GenOptions, RawDocument, Result, Segment};
use std::path::PathBuf;

/// How consecutive calls reconcile the boundary unit.
///
/// The anchor marks the start of "the next unit", which is usually the
/// last unit the previous call already emitted; the next call
/// re-derives it with a corrected boundary.
#[derive(Debug, Clone)]
pub enum MergePolicy {
    /// Pop the previously accumulated last segment before appending the
    /// new call's units, so the fresh derivation supersedes the stale
    /// one. The default.
    ReplaceLast,
    /// Start the next slice `chars` before the resolved anchor instead
    /// of popping. More reliable anchor resolution, but downstream
    /// consumers must de-duplicate the overlap.
    RewindOverlap { chars: usize },
}

#[derive(Debug, Clone)]
pub enum AnchorMode {
    /// Literal containment in the normalized view. The only valid mode
    /// when the model is contracted to copy anchors verbatim.
    Exact,
    /// Majority vote over fixed-width fragments; tolerates a corrupted
    /// minority of the anchor.
    ChunkVote { width: usize },
}

/// Sizing inputs for the per-call window. The window is fixed *before*
/// any call is issued: instructions + slice + expected output must fit
/// the model's context.
#[derive(Debug, Clone)]
pub struct CallBudget {
    pub ctx_tokens: u64,
    pub max_output_tokens: u64,
    pub instruction_tokens: u64,
    /// Conservative estimate for the transcript language.
    pub chars_per_token: f64,
}

impl Default for CallBudget {
    fn default() -> Self {
        Self {
            ctx_tokens: 8192,
            max_output_tokens: 2000,
            instruction_tokens: 1200,
            chars_per_token: 1.2,
        }
    }
}

impl CallBudget {
    pub fn window_chars(&self) -> usize {
        let input_tokens = self
            .ctx_tokens
            .saturating_sub(self.max_output_tokens)
            .saturating_sub(self.instruction_tokens);
        (((input_tokens as f64) * self.chars_per_token) as usize).max(1)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Per-call slice size in raw chars.
    pub window: usize,
    pub merge: MergePolicy,
    pub anchor: AnchorMode,
    pub opts: GenOptions,
    pub helper: Option<String>,
    /// Where alignment failures are dumped. `None` disables capture
    /// (tests); the batch driver always sets it.
    pub debug_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            window: CallBudget::default().window_chars(),
            merge: MergePolicy::ReplaceLast,
            anchor: AnchorMode::Exact,
            opts: GenOptions::default(),
            helper: None,
            debug_dir: None,
        }
    }
}

#[derive(Debug)]
pub struct SessionOutcome {
    pub segments: Vec<Segment>,
    pub attempts: u32,
    pub usage_tokens: u64,
}

#[allow(clippy::too_many_arguments)]
fn fail(
    cfg: &SessionConfig,
    doc_id: &str,
    attempt: u32,
    cursor: usize,
    slice: &str,
    raw_output: &str,
    anchor: &str,
    detail: &str,
) -> Error {
    if let Some(dir) = &cfg.debug_dir {
        let dump = AlignmentDump {
            doc_id,
            attempt,
            cursor,
            slice,
            raw_output,
            anchor,
            detail,
        };
        // Capture is best-effort; the alignment error is the primary signal.
        let _ = capture(dir, &dump);
    }
    Error::Alignment {
        doc_id: doc_id.to_string(),
        detail: format!("{detail}: {anchor:?}"),
    }
}

/// Run one document to completion or to its first fatal error.
///
/// The ledger, when present, gates each call (never start over the cap)
/// and records each call's spend as soon as it returns (a call in
/// flight always completes and is persisted before the re-check).
pub async fn run_session<M: ContentModel + ?Sized>(
    model: &M,
    doc: &RawDocument,
    instructions: &str,
    cfg: &SessionConfig,
    ledger: Option<&UsageLedger>,
) -> Result<SessionOutcome> {
    let chars: Vec<char> = doc.text.chars().collect();
    let total = chars.len();
    let mut segments: Vec<Segment> = Vec::new();
    if total == 0 {
        return Ok(SessionOutcome {
            segments,
            attempts: 0,
            usage_tokens: 0,
        });
    }

    let index = NormIndex::new(&doc.text);
    let mut cursor = 0usize;
    let mut attempt = 1u32;
    let mut usage_total = 0u64;
    // Vote metadata that resolved the current call's start offset.
    let mut pending_vote: Option<(i64, usize, usize)> = None;

    loop {
        if let Some(l) = ledger {
            l.ensure_under_cap()?;
        }

        let end = (cursor + cfg.window.max(1)).min(total);
        let slice: String = chars[cursor..end].iter().collect();
        let out = model
            .invoke(instructions, &slice, cfg.helper.as_deref(), &cfg.opts)
            .await?;
        usage_total += out.usage_tokens;
        if let Some(l) = ledger {
            l.add(out.usage_tokens)?;
        }

        if matches!(cfg.merge, MergePolicy::ReplaceLast) && attempt > 1 && !segments.is_empty() {
            segments.pop();
        }
        for unit in &out.units {
            let (normalized_index, win_votes, total_votes) = match pending_vote {
                Some((n, w, t)) => (Some(n), Some(w), Some(t)),
                None => (None, None, None),
            };
            segments.push(Segment {
                payload: unit.clone(),
                start_index: cursor,
                end_index: end - 1,
                normalized_index,
                win_votes,
                total_votes,
            });
        }

        if end >= total {
            return Ok(SessionOutcome {
                segments,
                attempts: attempt,
                usage_tokens: usage_total,
            });
        }

        let anchor = out.next_anchor.clone().ok_or_else(|| {
            Error::Format("non-final call produced no resumption anchor".to_string())
        })?;
        let start_norm = index.raw2norm(cursor).unwrap_or(0);
        let resolved = match cfg.anchor {
            AnchorMode::Exact => index.find(&anchor, start_norm).map(|h| (h.raw, None)),
            AnchorMode::ChunkVote { width } => {
                let v = index.find_by_chunk(&anchor, start_norm, width);
                if v.raw_idx >= 0 {
                    Some((
                        v.raw_idx as usize,
                        Some((v.normalized_idx, v.win_votes, v.total_votes)),
                    ))
                } else {
                    None
                }
            }
        };
        let (resolved_raw, vote) = match resolved {
            Some(r) => r,
            None => {
                return Err(fail(
                    cfg,
                    &doc.id,
                    attempt,
                    cursor,
                    &slice,
                    &out.raw_text,
                    &anchor,
                    "anchor not found from cursor onward",
                ))
            }
        };
        // Liveness: a resolution that does not move the cursor forward
        // would loop on the same slice forever.
        if resolved_raw <= cursor {
            return Err(fail(
                cfg,
                &doc.id,
                attempt,
                cursor,
                &slice,
                &out.raw_text,
                &anchor,
                "anchor resolution did not advance the cursor",
            ));
        }

        cursor = match cfg.merge {
            MergePolicy::RewindOverlap { chars: overlap } => {
                resolved_raw.saturating_sub(overlap).max(cursor + 1)
            }
            MergePolicy::ReplaceLast => resolved_raw,
        };
        pending_vote = vote;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anchorstitch_core::CallOutcome;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedModel {
        responses: Mutex<VecDeque<CallOutcome>>,
        slices: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    impl ScriptedModel {
        fn new(responses: Vec<CallOutcome>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                slices: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl ContentModel for ScriptedModel {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn invoke(
            &self,
            _instructions: &str,
            slice: &str,
            _helper: Option<&str>,
            _opts: &GenOptions,
        ) -> Result<CallOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.slices.lock().unwrap().push(slice.to_string());
            Ok(self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .expect("script exhausted"))
        }
    }

    fn outcome(units: Vec<serde_json::Value>, anchor: Option<&str>, usage: u64) -> CallOutcome {
        CallOutcome {
            units,
            next_anchor: anchor.map(|s| s.to_string()),
            usage_tokens: usage,
            raw_text: "{}".to_string(),
        }
    }

    fn doc(text: &str) -> RawDocument {
        RawDocument::new("20200711.txt", text.to_string())
    }

    #[tokio::test]
    async fn empty_document_needs_no_calls() {
        let model = ScriptedModel::new(vec![]);
        let out = run_session(&model, &doc(""), "inst", &SessionConfig::default(), None)
            .await
            .expect("ok");
        assert_eq!(out.segments.len(), 0);
        assert_eq!(out.attempts, 0);
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn single_window_covers_short_document() {
        let model = ScriptedModel::new(vec![outcome(
            vec![json!({"topic_label": "gold", "start_anchor": "今天谈黄金"})],
            Some("今天谈黄金"),
            11,
        )]);
        let d = doc("今天谈黄金。");
        let out = run_session(&model, &d, "inst", &SessionConfig::default(), None)
            .await
            .expect("ok");
        assert_eq!(model.calls(), 1);
        assert_eq!(out.attempts, 1);
        assert_eq!(out.usage_tokens, 11);
        assert_eq!(out.segments.len(), 1);
        assert_eq!(out.segments[0].start_index, 0);
        assert_eq!(out.segments[0].end_index, 5);
    }

    // The two-window case over a CJK document: the anchor resolves the
    // cursor to the raw index of "明" and the merged segments span the
    // whole document with no gap.
    #[tokio::test]
    async fn two_windows_stitch_gap_free() {
        let text = "今天谈黄金。\n\n明天谈原油和美股。";
        let model = ScriptedModel::new(vec![
            outcome(
                vec![
                    json!({"topic_label": "gold", "start_anchor": "今天谈黄金"}),
                    json!({"topic_label": "oil?", "start_anchor": "明天谈原油"}),
                ],
                Some("明天谈原油"),
                100,
            ),
            outcome(
                vec![json!({"topic_label": "oil+equities", "start_anchor": "明天谈原油"})],
                None,
                80,
            ),
        ]);
        let cfg = SessionConfig {
            window: 10,
            ..SessionConfig::default()
        };
        let d = doc(text);
        let out = run_session(&model, &d, "inst", &cfg, None).await.expect("ok");

        assert_eq!(model.calls(), 2);
        assert_eq!(out.attempts, 2);
        assert_eq!(out.segments.len(), 2);
        // "明" sits at raw char 8 (after six chars and two newlines).
        assert_eq!(out.segments[0].start_index, 0);
        assert_eq!(out.segments[0].end_index, 9);
        assert_eq!(out.segments[1].start_index, 8);
        assert_eq!(out.segments[1].end_index, text.chars().count() - 1);
        // Gap-free cover.
        assert!(out.segments[1].start_index <= out.segments[0].end_index + 1);
        // The re-derived boundary unit superseded the stale one.
        assert_eq!(out.segments[1].payload["topic_label"], "oil+equities");
        assert_eq!(out.usage_tokens, 180);
    }

    #[tokio::test]
    async fn cursor_strictly_advances_across_many_windows() {
        let text = "aaaa bbbb cccc dddd";
        let model = ScriptedModel::new(vec![
            outcome(vec![json!({"start_anchor": "aaaa"})], Some("bbbb"), 1),
            outcome(vec![json!({"start_anchor": "bbbb"})], Some("cccc"), 1),
            outcome(vec![json!({"start_anchor": "cccc"})], Some("dddd"), 1),
            outcome(vec![json!({"start_anchor": "dddd"})], None, 1),
        ]);
        let cfg = SessionConfig {
            window: 7,
            ..SessionConfig::default()
        };
        let out = run_session(&model, &doc(text), "inst", &cfg, None)
            .await
            .expect("ok");
        assert_eq!(out.attempts, 4);
        let slices = model.slices.lock().unwrap().clone();
        assert_eq!(slices, vec!["aaaa bb", "bbbb cc", "cccc dd", "dddd"]);
        // One unit per call and ReplaceLast means the final derivation wins.
        assert_eq!(out.segments.len(), 1);
        assert_eq!(out.segments[0].start_index, 15);
        assert_eq!(out.segments[0].end_index, 18);
    }

    #[tokio::test]
    async fn rewind_overlap_keeps_all_units_and_still_advances() {
        let text = "aaaa bbbb cccc dddd";
        let model = ScriptedModel::new(vec![
            outcome(vec![json!({"start_anchor": "aaaa"})], Some("cccc"), 1),
            outcome(vec![json!({"start_anchor": "cccc"})], None, 1),
        ]);
        let cfg = SessionConfig {
            window: 12,
            merge: MergePolicy::RewindOverlap { chars: 3 },
            ..SessionConfig::default()
        };
        let out = run_session(&model, &doc(text), "inst", &cfg, None)
            .await
            .expect("ok");
        // "cccc" resolves to raw 10; rewound by 3 the next slice starts at 7.
        assert_eq!(out.segments.len(), 2);
        assert_eq!(out.segments[0].start_index, 0);
        assert_eq!(out.segments[1].start_index, 7);
        assert_eq!(out.segments[1].end_index, 18);
    }

    #[tokio::test]
    async fn unresolved_anchor_is_fatal_and_captured() {
        let dir = tempfile::tempdir().expect("tempdir");
        let text = "aaaa bbbb cccc dddd";
        let model = ScriptedModel::new(vec![outcome(
            vec![json!({"start_anchor": "aaaa"})],
            Some("zzzz"),
            1,
        )]);
        let cfg = SessionConfig {
            window: 7,
            debug_dir: Some(dir.path().to_path_buf()),
            ..SessionConfig::default()
        };
        let err = run_session(&model, &doc(text), "inst", &cfg, None)
            .await
            .expect_err("must fail");
        assert!(matches!(err, Error::Alignment { .. }), "got {err}");
        assert_eq!(model.calls(), 1, "no automatic anchor retry");

        let dump_path = dir.path().join("align_fail_20200711_1.json");
        let v: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&dump_path).expect("dump exists")).unwrap();
        assert_eq!(v["slice"], "aaaa bb");
        assert_eq!(v["anchor"], "zzzz");
        assert_eq!(v["cursor"], 0);
    }

    #[tokio::test]
    async fn non_advancing_anchor_is_fatal() {
        let text = "abcdef ghijkl mnopqr";
        // The anchor resolves to the very start of the current slice.
        let model = ScriptedModel::new(vec![outcome(
            vec![json!({"start_anchor": "abcdef"})],
            Some("abcdef"),
            1,
        )]);
        let cfg = SessionConfig {
            window: 8,
            ..SessionConfig::default()
        };
        let err = run_session(&model, &doc(text), "inst", &cfg, None)
            .await
            .expect_err("must fail");
        assert!(matches!(err, Error::Alignment { .. }));
    }

    #[tokio::test]
    async fn missing_anchor_on_non_final_call_is_format_error() {
        let text = "aaaa bbbb cccc dddd";
        let model = ScriptedModel::new(vec![outcome(vec![json!({"t": 1})], None, 1)]);
        let cfg = SessionConfig {
            window: 7,
            ..SessionConfig::default()
        };
        let err = run_session(&model, &doc(text), "inst", &cfg, None)
            .await
            .expect_err("must fail");
        assert!(err.is_retryable(), "got {err}");
    }

    #[tokio::test]
    async fn chunk_vote_path_tags_vote_metadata() {
        let text = "header abcdefghijklmno footer padpadpad";
        let model = ScriptedModel::new(vec![
            // Corrupted middle chunk: exact match would fail.
            outcome(
                vec![json!({"t": "head"}), json!({"t": "boundary"})],
                Some("abcdeQQQQQklmno"),
                1,
            ),
            outcome(vec![json!({"t": "tail"})], None, 1),
        ]);
        let cfg = SessionConfig {
            window: 33,
            anchor: AnchorMode::ChunkVote { width: 5 },
            ..SessionConfig::default()
        };
        let out = run_session(&model, &doc(text), "inst", &cfg, None)
            .await
            .expect("ok");
        assert_eq!(out.segments.len(), 2);
        assert_eq!(out.segments[0].win_votes, None);
        // 'a' is normalized index 6, raw 7.
        assert_eq!(out.segments[1].start_index, 7);
        assert_eq!(out.segments[1].normalized_index, Some(6));
        assert_eq!(out.segments[1].win_votes, Some(2));
        assert_eq!(out.segments[1].total_votes, Some(3));
    }

    #[tokio::test]
    async fn ledger_gates_the_next_call_but_persists_the_one_in_flight() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = UsageLedger::new(dir.path().join("spent.json"), 10, "test");
        let text = "aaaa bbbb cccc dddd";
        let model = ScriptedModel::new(vec![outcome(
            vec![json!({"start_anchor": "aaaa"})],
            Some("bbbb"),
            50,
        )]);
        let cfg = SessionConfig {
            window: 7,
            ..SessionConfig::default()
        };
        let err = run_session(&model, &doc(text), "inst", &cfg, Some(&ledger))
            .await
            .expect_err("cap must stop the session");
        assert!(matches!(err, Error::CapExceeded { spent: 50, cap: 10 }));
        assert_eq!(model.calls(), 1);
        assert_eq!(ledger.spent(), 50, "in-flight spend is persisted");
    }
}
