use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::turn::TurnSignature;

/// Failures reported by a [`crate::session::Session`] implementation.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("browser error: {0}")]
    Browser(String),
    #[error("script error: {0}")]
    Script(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Phase of an exchange, used to tell the API layer where a failure happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangePhase {
    Compose,
    Submit,
    TurnAppearance,
    Completion,
    Extraction,
    Dispatch,
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("no locator matched for {what}")]
    LocatorMiss { what: &'static str, phase: ExchangePhase },
    #[error("no new reply turn appeared within {waited:?}")]
    TurnNotAppeared { waited: Duration },
    #[error("reply did not complete within {waited:?}")]
    CompletionTimeout { waited: Duration },
    #[error("reply turn {signature} yielded no content")]
    ExtractionEmpty { signature: TurnSignature },
    #[error("session error during {phase:?}: {source}")]
    Session {
        phase: ExchangePhase,
        #[source]
        source: SessionError,
    },
    #[error("relay worker is not running")]
    WorkerClosed,
}

impl ExchangeError {
    pub(crate) fn session(phase: ExchangePhase, source: SessionError) -> Self {
        ExchangeError::Session { phase, source }
    }

    pub fn phase(&self) -> ExchangePhase {
        match self {
            ExchangeError::LocatorMiss { phase, .. } => *phase,
            ExchangeError::TurnNotAppeared { .. } => ExchangePhase::TurnAppearance,
            ExchangeError::CompletionTimeout { .. } => ExchangePhase::Completion,
            ExchangeError::ExtractionEmpty { .. } => ExchangePhase::Extraction,
            ExchangeError::Session { phase, .. } => *phase,
            ExchangeError::WorkerClosed => ExchangePhase::Dispatch,
        }
    }

    /// HTTP-style status for the API boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            ExchangeError::LocatorMiss { .. } => 502,
            ExchangeError::TurnNotAppeared { .. } | ExchangeError::CompletionTimeout { .. } => 504,
            ExchangeError::ExtractionEmpty { .. } => 502,
            ExchangeError::Session { .. } => 500,
            ExchangeError::WorkerClosed => 503,
        }
    }
}

/// An image could not be saved locally. Logged, never fatal to the exchange.
#[derive(Debug, Error)]
pub enum AssetDownloadError {
    #[error("session fetch failed for {url}: {reason}")]
    SessionFetch { url: String, reason: String },
    #[error("direct fetch failed for {url}: {reason}")]
    DirectFetch { url: String, reason: String },
    #[error("empty body for {url}")]
    Empty { url: String },
    #[error("write failed for {url}: {source}")]
    Write {
        url: String,
        #[source]
        source: std::io::Error,
    },
}

/// Raised when a component is about to act on the turn that existed before
/// the request was sent. Never leaves the crate; callers turn it into a retry.
#[derive(Debug, Error)]
#[error("turn {0} is the pre-send turn")]
pub(crate) struct StaleTurnGuard(pub TurnSignature);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_and_status_codes() {
        let e = ExchangeError::TurnNotAppeared { waited: Duration::from_secs(30) };
        assert_eq!(e.phase(), ExchangePhase::TurnAppearance);
        assert_eq!(e.status_code(), 504);

        let e = ExchangeError::LocatorMiss { what: "chat input", phase: ExchangePhase::Compose };
        assert_eq!(e.phase(), ExchangePhase::Compose);
        assert!(e.to_string().contains("chat input"));

        let e = ExchangeError::session(ExchangePhase::Submit, SessionError::Browser("gone".into()));
        assert_eq!(e.phase(), ExchangePhase::Submit);
        assert_eq!(e.status_code(), 500);
    }

    #[test]
    fn extraction_empty_names_the_turn() {
        let e = ExchangeError::ExtractionEmpty { signature: TurnSignature::new(3, "msg-x") };
        assert_eq!(e.to_string(), "reply turn 3:msg-x yielded no content");
    }
}
