//! Bounded retry with perturbed sampling, as a [`ContentModel`]
//! decorator.
//!
//! Formatting failures are usually a sampling accident: nudging the
//! penalties breaks the model out of whatever loop produced the
//! malformed output. Alignment failures are contract violations and are
//! never retried here (or anywhere).

use anchorstitch_core::{CallOutcome, ContentModel, GenOptions, Result};

#[derive(Debug)]
pub struct Retrying<M> {
    inner: M,
    max_retries: u32,
}

impl<M> Retrying<M> {
    pub fn new(inner: M, max_retries: u32) -> Self {
        Self { inner, max_retries }
    }
}

fn perturbed(opts: &GenOptions, attempt: u32) -> GenOptions {
    let a = f64::from(attempt);
    GenOptions {
        repeat_penalty: Some(1.1 + 0.05 * a),
        frequency_penalty: Some(0.1 * a),
        presence_penalty: Some(0.05 * a),
        ..opts.clone()
    }
}

#[async_trait::async_trait]
impl<M: ContentModel> ContentModel for Retrying<M> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn invoke(
        &self,
        instructions: &str,
        slice: &str,
        helper: Option<&str>,
        opts: &GenOptions,
    ) -> Result<CallOutcome> {
        let mut attempt = 0u32;
        loop {
            let effective = if attempt == 0 {
                opts.clone()
            } else {
                perturbed(opts, attempt)
            };
            match self.inner.invoke(instructions, slice, helper, &effective).await {
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
