//! Anchor resolution over a [`NormIndex`].
//!
//! Exact mode is the contract when the model copies anchors verbatim.
//! Chunk-vote mode tolerates limited corruption: the needle is split
//! into fixed-width fragments, each located independently, and the
//! start offset most fragments agree on wins.

use crate::normalize::NormIndex;
use serde::Serialize;

/// Sentinel implied-start for a fragment that was not found. It is a
/// real vote value and can win the tally.
pub const NOT_FOUND: i64 = -1;

/// A resolved exact match, in both coordinate systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Hit {
    pub norm: usize,
    pub raw: usize,
}

/// Outcome of a chunk-vote resolution. `win_votes / total_votes` is the
/// caller's confidence signal; `raw_idx == -1` means the winning offset
/// could not be mapped (not found, or outside the normalized range).
#[derive(Debug, Clone, Serialize)]
pub struct ChunkVote {
    pub normalized_idx: i64,
    pub raw_idx: i64,
    pub win_votes: usize,
    pub total_votes: usize,
    /// Full tally in first-counted order, for offline debugging.
    pub tally: Vec<(i64, usize)>,
}

fn find_sub(hay: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    let last = hay.len().checked_sub(needle.len())?;
    if from > last {
        return None;
    }
    (from..=last).find(|&i| hay[i..i + needle.len()] == *needle)
}

impl NormIndex {
    /// Exact resolution: normalize the needle with the document's rule,
    /// search literally from `start_norm` (never earlier), map the hit
    /// back to raw coordinates. `None` is the only failure signal.
    pub fn find(&self, needle: &str, start_norm: usize) -> Option<Hit> {
        let needle_n = Self::normalize(needle);
        if needle_n.is_empty() {
            return None;
        }
        let norm = find_sub(self.norm_chars(), &needle_n, start_norm)?;
        let raw = self.norm2raw(norm)?;
        Some(Hit { norm, raw })
    }

    /// Approximate resolution by majority vote over fixed-width
    /// fragments of the normalized needle.
    ///
    /// Fragment `i` found at normalized position `p` implies the whole
    /// needle starts at `p - i*chunk_width`; a missing fragment votes
    /// the `-1` sentinel. The most frequent implied start wins, ties
    /// breaking to the first value counted.
    pub fn find_by_chunk(&self, needle: &str, start_norm: usize, chunk_width: usize) -> ChunkVote {
        let width = chunk_width.max(1);
        let needle_n = Self::normalize(needle);

        let mut tally: Vec<(i64, usize)> = Vec::new();
        let mut total = 0usize;
        for (i, chunk) in needle_n.chunks(width).enumerate() {
            let implied = match find_sub(self.norm_chars(), chunk, start_norm) {
                Some(p) => p as i64 - (i * width) as i64,
                None => NOT_FOUND,
            };
            total += 1;
            match tally.iter_mut().find(|(v, _)| *v == implied) {
                Some((_, n)) => *n += 1,
                None => tally.push((implied, 1)),
            }
        }

        let (winner, win_votes) = tally
            .iter()
            .copied()
            // Strict '>' keeps the first-counted value on ties.
            .fold((NOT_FOUND, 0usize), |best, (v, n)| {
                if n > best.1 {
                    (v, n)
                } else {
                    best
                }
            });

        let raw_idx = if winner >= 0 {
            self.norm2raw(winner as usize)
                .map(|r| r as i64)
                .unwrap_or(NOT_FOUND)
        } else {
            NOT_FOUND
        };

        ChunkVote {
            normalized_idx: winner,
            raw_idx,
            win_votes,
            total_votes: total,
            tally,
        }
    }
}
