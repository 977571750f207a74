//! Local implementations for anchorstitch: the normalizer and anchor
//! locator, the resumable extraction session, the usage ledger and
//! diagnostic sink, the batch driver, and two HTTP content-model
//! backends.

pub mod batch;
pub mod diagnostics;
pub mod locate;
pub mod normalize;
pub mod ollama;
pub mod openai_compat;
pub mod payload;
pub mod retry;
pub mod session;
pub mod store;
pub mod usage;

pub(crate) fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub(crate) fn env_bool(key: &str) -> bool {
    matches!(
        std::env::var(key)
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str(),
        "1" | "true" | "yes" | "on"
    )
}

pub(crate) fn env_u64(key: &str, default: u64) -> u64 {
    env(key)
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default)
}
