//! Structured capture of alignment failures.
//!
//! Invoked exactly once, at the session's FAIL transition. The artifact
//! carries everything needed to replay the failing call offline: the
//! exact slice sent, the verbatim model output, and the anchor that did
//! not resolve.

use crate::store::write_atomic;
use anchorstitch_core::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize)]
pub struct AlignmentDump<'a> {
    pub doc_id: &'a str,
    pub attempt: u32,
    pub cursor: usize,
    pub slice: &'a str,
    pub raw_output: &'a str,
    pub anchor: &'a str,
    pub detail: &'a str,
}

/// Persist an alignment failure under `dir`, atomically. Returns the
/// artifact path.
pub fn capture(dir: &Path, dump: &AlignmentDump<'_>) -> Result<PathBuf> {
    let path = dir.join(format!("align_fail_{}_{}.json", dump.doc_id, dump.attempt));
    let bytes = serde_json::to_vec_pretty(dump)
        .map_err(|e| anchorstitch_core::Error::Store(e.to_string()))?;
    write_atomic(&path, &bytes)?;
    Ok(path)
}
