//! Whitespace-insensitive search space over a raw transcript.
//!
//! Transcripts are free-flowing speech where whitespace is a formatting
//! artifact, so it is safe to drop for equality/containment tests.
//! Offsets handed back to callers must always be raw offsets, mapped
//! through the index, never normalized offsets pretending to be raw.
//!
//! All offsets are **character** offsets (the corpus is CJK-heavy; byte
//! offsets are useless to downstream consumers).

/// Normalized view of one document plus bidirectional position maps.
///
/// - `norm2raw` is strictly increasing: normalized char `j` came from
///   raw char `norm2raw[j]`.
/// - `raw2norm` covers every raw offset and is non-decreasing: a
///   whitespace offset inherits the normalized index of the nearest
///   preceding real character (offsets before the first real character
///   map to 0).
#[derive(Debug, Clone)]
pub struct NormIndex {
    norm: Vec<char>,
    norm2raw: Vec<usize>,
    raw2norm: Vec<usize>,
}

impl NormIndex {
    pub fn new(raw: &str) -> Self {
        let mut norm = Vec::new();
        let mut norm2raw = Vec::new();
        let mut raw_chars = 0usize;
        for (i, ch) in raw.chars().enumerate() {
            raw_chars = i + 1;
            if !ch.is_whitespace() {
                norm.push(ch);
                norm2raw.push(i);
            }
        }

        // Forward-fill: each raw offset resolves to the most recent
        // normalized index seen.
        let mut raw2norm = Vec::with_capacity(raw_chars);
        let mut next = 0usize;
        let mut prev = 0usize;
        for i in 0..raw_chars {
            if next < norm2raw.len() && norm2raw[next] == i {
                prev = next;
                next += 1;
            }
            raw2norm.push(prev);
        }

        Self {
            norm,
            norm2raw,
            raw2norm,
        }
    }

    /// The whitespace-collapse rule, applied to needles so both sides of
    /// every containment test agree.
    pub fn normalize(s: &str) -> Vec<char> {
        s.chars().filter(|c| !c.is_whitespace()).collect()
    }

    pub fn norm_chars(&self) -> &[char] {
        &self.norm
    }

    pub fn norm_string(&self) -> String {
        self.norm.iter().collect()
    }

    pub fn norm_len(&self) -> usize {
        self.norm.len()
    }

    pub fn raw_len(&self) -> usize {
        self.raw2norm.len()
    }

    /// Raw char offset of normalized char `j`.
    pub fn norm2raw(&self, j: usize) -> Option<usize> {
        self.norm2raw.get(j).copied()
    }

    /// Normalized index of the nearest real character at or before raw
    /// offset `i`.
    pub fn raw2norm(&self, i: usize) -> Option<usize> {
        self.raw2norm.get(i).copied()
    }
}

const TERMINAL_PUNCT: &[char] = &['。', '！', '？', '!', '?', '：', ':', '）', ')'];

/// Transcript preparation applied once before indexing: normalize line
/// endings, drop blank-line runs, join continuation lines onto a short
/// unterminated previous line, then collapse every whitespace run to a
/// single space.
pub fn prepare_transcript(text: &str) -> String {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut lines: Vec<String> = Vec::new();
    let mut last_blank = true;
    for line in text.trim().split('\n') {
        let line = line.trim();
        if line.is_empty() {
            if !last_blank {
                lines.push(String::new());
                last_blank = true;
            }
            continue;
        }
        let join = match lines.last() {
            Some(prev) if !prev.is_empty() => {
                let terminated = prev.chars().last().is_some_and(|c| TERMINAL_PUNCT.contains(&c));
                !terminated && prev.chars().count() < 60
            }
            _ => false,
        };
        if join {
            let prev = lines.last_mut().expect("non-empty checked above");
            prev.push(' ');
            prev.push_str(line);
        } else {
            lines.push(line.to_string());
        }
        last_blank = false;
    }

    let joined = lines.join("\n");
    let mut out = String::with_capacity(joined.len());
    let mut in_ws = false;
    for ch in joined.chars() {
        if ch.is_whitespace() {
            in_ws = true;
        } else {
            if in_ws && !out.is_empty() {
                out.push(' ');
            }
            in_ws = false;
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn collapsed_input_normalizes_unchanged() {
        // A string with no whitespace at all is its own normal form.
        let s = "今天谈黄金。明天谈原油。";
        let n: String = NormIndex::normalize(s).iter().collect();
        assert_eq!(n, s);
    }

    #[test]
    fn maps_skip_whitespace_runs() {
        let idx = NormIndex::new("AB  C");
        assert_eq!(idx.norm_string(), "ABC");
        assert_eq!(idx.norm2raw(0), Some(0));
        assert_eq!(idx.norm2raw(1), Some(1));
        assert_eq!(idx.norm2raw(2), Some(4));
        // Whitespace offsets inherit the preceding mapped value.
        assert_eq!(idx.raw2norm(1), Some(1));
        assert_eq!(idx.raw2norm(2), Some(1));
        assert_eq!(idx.raw2norm(3), Some(1));
        assert_eq!(idx.raw2norm(4), Some(2));
    }

    #[test]
    fn leading_whitespace_maps_to_zero() {
        let idx = NormIndex::new("  ab");
        assert_eq!(idx.raw2norm(0), Some(0));
        assert_eq!(idx.raw2norm(1), Some(0));
        assert_eq!(idx.raw2norm(2), Some(0));
        assert_eq!(idx.raw2norm(3), Some(1));
    }

    #[test]
    fn empty_document_yields_empty_maps() {
        let idx = NormIndex::new("");
        assert_eq!(idx.norm_len(), 0);
        assert_eq!(idx.raw_len(), 0);
        assert_eq!(idx.norm2raw(0), None);
        assert_eq!(idx.raw2norm(0), None);
    }

    proptest! {
        // Offset round trip: every non-whitespace raw offset survives
        // raw -> norm -> raw; every normalized offset survives the
        // reverse direction.
        #[test]
        fn offset_round_trip(s in "[ \tA-Za-z\u{4e00}-\u{4e20}\n]{0,64}") {
            let idx = NormIndex::new(&s);
            for j in 0..idx.norm_len() {
                let raw = idx.norm2raw(j).unwrap();
                prop_assert_eq!(idx.raw2norm(raw), Some(j));
            }
            for (i, ch) in s.chars().enumerate() {
                if !ch.is_whitespace() {
                    let j = idx.raw2norm(i).unwrap();
                    prop_assert_eq!(idx.norm2raw(j), Some(i));
                }
            }
        }

        #[test]
        fn norm2raw_strictly_increases(s in ".{0,64}") {
            let idx = NormIndex::new(&s);
            for j in 1..idx.norm_len() {
                prop_assert!(idx.norm2raw(j - 1).unwrap() < idx.norm2raw(j).unwrap());
            }
        }
    }

    #[test]
    fn prepare_joins_short_unterminated_lines() {
        let text = "大家好\n今天我们谈黄金。\n\n\n明天谈原油。\n";
        assert_eq!(
            prepare_transcript(text),
            "大家好 今天我们谈黄金。 明天谈原油。"
        );
    }

    #[test]
    fn prepare_respects_terminal_punctuation() {
        // A line ending in terminal punctuation never absorbs the next line
        // onto itself; the next line starts fresh.
        let text = "第一段。\n第二段";
        assert_eq!(prepare_transcript(text), "第一段。 第二段");
    }

    #[test]
    fn prepare_normalizes_crlf_and_blank_runs() {
        let text = "a。\r\n\r\n\r\nb。";
        assert_eq!(prepare_transcript(text), "a。 b。");
    }
}
