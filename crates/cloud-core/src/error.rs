//! The typed error surface the engine raises at its public boundary.
//!
//! Internal plumbing (REST calls, SSH subprocesses, DNS lookups, YAML
//! parsing) uses `anyhow::Result` with `.context(...)` chains; each
//! component classifies those failures into one of these variants at its
//! own boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("malformed metadata: {0}")]
    MalformedMetadata(String),

    #[error("no schedulable node: {0}")]
    NoSchedulable(String),

    #[error("domain invalid: {0}")]
    DomainInvalid(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Fold an internal `anyhow::Error` into a `ResourceUnavailable`, truncating
    /// the message so raw shell/REST output never leaks past a short tail.
    pub fn resource_unavailable(context: &str, err: anyhow::Error) -> Self {
        let tail = truncate_tail(&err.to_string(), 400);
        EngineError::ResourceUnavailable(format!("{context}: {tail}"))
    }
}

fn truncate_tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("...{}", &s[s.len() - max..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_long_messages() {
        let long = "x".repeat(1000);
        let err = EngineError::resource_unavailable("step failed", anyhow::anyhow!(long));
        let msg = err.to_string();
        assert!(msg.len() < 500);
        assert!(msg.starts_with("resource unavailable: step failed: ..."));
    }

    #[test]
    fn short_messages_pass_through() {
        let err = EngineError::resource_unavailable("step failed", anyhow::anyhow!("boom"));
        assert_eq!(err.to_string(), "resource unavailable: step failed: boom");
    }
}
