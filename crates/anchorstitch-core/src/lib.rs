use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("not configured: {0}")]
    NotConfigured(String),
    #[error("model call failed: {0}")]
    Model(String),
    #[error("malformed model output: {0}")]
    Format(String),
    #[error("anchor alignment failed ({doc_id}): {detail}")]
    Alignment { doc_id: String, detail: String },
    #[error("store error: {0}")]
    Store(String),
    #[error("usage cap exceeded: spent {spent} of {cap}")]
    CapExceeded { spent: u64, cap: u64 },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for failures the surrounding harness may retry with perturbed
    /// sampling. Alignment failures are contract violations and are final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Format(_))
    }
}

/// One source transcript, addressed by a stable id derived from its
/// filename. All offsets anywhere in this workspace are **character**
/// offsets into `text`, never byte offsets.
#[derive(Debug, Clone)]
pub struct RawDocument {
    pub id: String,
    pub text: String,
}

impl RawDocument {
    pub fn new(source_name: &str, text: String) -> Self {
        Self {
            id: doc_id(source_name),
            text,
        }
    }
}

/// Stable document key: the first run of ASCII digits in the file stem
/// (transcripts are named by date), else the whole stem.
pub fn doc_id(source_name: &str) -> String {
    let stem = std::path::Path::new(source_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(source_name);
    let mut digits = String::new();
    for ch in stem.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
        } else if !digits.is_empty() {
            break;
        }
    }
    if digits.is_empty() {
        stem.to_string()
    } else {
        digits
    }
}

/// One structured unit of output, tagged with the raw-character span of
/// the model call that produced it. The vote fields are present only
/// when the anchor was resolved via the chunk-vote path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub payload: serde_json::Value,
    pub start_index: usize,
    /// Inclusive.
    pub end_index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalized_index: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub win_votes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_votes: Option<usize>,
}

/// Sampling knobs forwarded to a backend. `None` means "backend
/// default"; backends skip unset fields when serializing requests.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GenOptions {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub seed: Option<u64>,
    pub max_tokens: Option<u64>,
    pub repeat_penalty: Option<f64>,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
}

/// What one model call produced, after the backend adapter has parsed
/// the provider response.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    /// Structural units in document order, schema-opaque to the session.
    pub units: Vec<serde_json::Value>,
    /// Resumption anchor: an explicit next-boundary anchor if the schema
    /// carries one, else the start phrase of the last unit.
    pub next_anchor: Option<String>,
    pub usage_tokens: u64,
    /// Verbatim provider text, kept for the diagnostic sink.
    pub raw_text: String,
}

/// The content-model capability the extraction session is generic over.
/// Adapters own prompt assembly and schema parsing; the session only
/// sees units and an anchor.
#[async_trait::async_trait]
pub trait ContentModel: Send + Sync {
    fn name(&self) -> &'static str;

    async fn invoke(
        &self,
        instructions: &str,
        slice: &str,
        helper: Option<&str>,
        opts: &GenOptions,
    ) -> Result<CallOutcome>;
}
