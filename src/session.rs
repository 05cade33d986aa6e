use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::error::SessionError;
use crate::images::ImageCandidate;
use crate::selectors::Locator;
use crate::turn::{TurnSignature, TurnSnapshot};

/// A resolved UI element. `id` is opaque to the core and only meaningful to
/// the session that produced it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementHandle {
    pub id: String,
    pub locator: Locator,
}

/// Controls that live inside a single reply turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnControl {
    Copy,
}

#[derive(Clone, Debug, Default)]
pub struct FetchedBytes {
    pub bytes: Vec<u8>,
    /// Content type reported by the transport, if any.
    pub content_type: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadLink {
    pub href: String,
    pub title: String,
}

// ========================= Session seam =========================

/// Everything the relay needs from the live page. Implementations must treat
/// "not found" as a normal answer; errors are reserved for a broken session.
#[async_trait]
pub trait Session: Send + Sync {
    /// Highest-ordinal turn that looks like a generated reply.
    async fn latest_reply_turn(&self) -> Result<Option<TurnSnapshot>, SessionError>;
    async fn count_reply_turns(&self) -> Result<usize, SessionError>;

    async fn find(&self, locator: &Locator, timeout: Duration) -> Result<Option<ElementHandle>, SessionError>;
    async fn click(&self, handle: &ElementHandle) -> Result<(), SessionError>;
    async fn insert_text(&self, handle: &ElementHandle, text: &str) -> Result<(), SessionError>;
    /// Generic confirm action on a focused input.
    async fn press_enter(&self, handle: &ElementHandle) -> Result<(), SessionError>;
    async fn attach_files(&self, handle: &ElementHandle, paths: &[PathBuf]) -> Result<(), SessionError>;

    async fn read_clipboard(&self) -> Result<String, SessionError>;

    /// `true` once any of `locators` is visible, `false` on timeout.
    async fn wait_visible(&self, locators: &[Locator], timeout: Duration) -> Result<bool, SessionError>;
    /// `true` once none of `locators` is visible, `false` on timeout.
    async fn wait_hidden(&self, locators: &[Locator], timeout: Duration) -> Result<bool, SessionError>;

    /// Activate `control` inside the turn identified by `signature`. Returns
    /// `false` when that turn or the control inside it cannot be found; a
    /// control belonging to any other turn must never be used.
    async fn click_control_in_turn(&self, signature: &TurnSignature, control: TurnControl) -> Result<bool, SessionError>;
    /// Rendered text of the turn, `None` if the signature no longer resolves.
    async fn turn_text(&self, signature: &TurnSignature) -> Result<Option<String>, SessionError>;
    /// Short caption/title texts rendered inside the turn.
    async fn turn_captions(&self, signature: &TurnSignature) -> Result<Vec<String>, SessionError>;
    async fn image_candidates(&self, signature: &TurnSignature) -> Result<Vec<ImageCandidate>, SessionError>;

    /// Fetch a resource with the page's own credentials.
    async fn fetch_with_session_auth(&self, url: &str) -> Result<FetchedBytes, SessionError>;

    async fn current_url(&self) -> Result<String, SessionError>;
    async fn navigate(&self, url: &str) -> Result<(), SessionError>;
    async fn thread_links(&self) -> Result<Vec<ThreadLink>, SessionError>;

    /// Low-impact liveness action (cursor drift). Must not change any turn.
    async fn idle_motion(&self) -> Result<(), SessionError>;
}

/// Try `candidates` in order and return the first that resolves.
///
/// Misses and per-locator errors are absorbed; `None` means every fallback
/// was exhausted.
pub async fn probe_first_match<S: Session + ?Sized>(
    session: &S,
    candidates: &[Locator],
    timeout: Duration,
) -> Option<ElementHandle> {
    for locator in candidates {
        match session.find(locator, timeout).await {
            Ok(Some(handle)) => {
                debug!(%locator, "locator matched");
                return Some(handle);
            }
            Ok(None) => debug!(%locator, "locator miss"),
            Err(e) => debug!(%locator, error = %e, "locator probe failed"),
        }
    }
    None
}
