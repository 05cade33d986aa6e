use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::completion::TransientFilter;
use crate::config::Timings;
use crate::error::ExchangeError;
use crate::images::{ImageAsset, ImageAssetHandler};
use crate::session::{Session, TurnControl};
use crate::turn::{SignatureTracker, TurnSignature, TurnSnapshot};

/// Which path produced the text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextSource {
    Clipboard,
    TurnText,
    Captions,
    None,
}

#[derive(Clone, Debug)]
pub struct ExtractedContent {
    pub text: String,
    pub text_source: TextSource,
    pub images: Vec<ImageAsset>,
}

pub struct ContentExtractor<'a, S: Session + ?Sized> {
    session: &'a S,
    timings: &'a Timings,
    filter: &'a TransientFilter,
    images: &'a ImageAssetHandler,
}

impl<'a, S: Session + ?Sized> ContentExtractor<'a, S> {
    pub fn new(
        session: &'a S,
        timings: &'a Timings,
        filter: &'a TransientFilter,
        images: &'a ImageAssetHandler,
    ) -> Self {
        Self { session, timings, filter, images }
    }

    /// Extract the final content of `turn`, which must not be the pre-send turn.
    pub async fn extract(
        &self,
        prior: Option<&TurnSignature>,
        turn: TurnSnapshot,
    ) -> Result<ExtractedContent, ExchangeError> {
        let turn = match SignatureTracker::<S>::guard(prior, turn) {
            Ok(turn) => turn,
            Err(stale) => {
                // Only reachable if the caller resolved the wrong turn; re-read instead.
                debug!(%stale, "refusing to extract from the pre-send turn");
                let tracker = SignatureTracker::new(self.session, self.timings.turn_poll);
                tracker
                    .new_turn(prior)
                    .await
                    .ok_or_else(|| ExchangeError::ExtractionEmpty { signature: stale.0.clone() })?
            }
        };
        let signature = &turn.signature;

        if turn.has_image_content {
            let images = self.images.collect(self.session, signature).await;
            let text = self.image_turn_text(signature).await;
            if images.is_empty() && text.is_empty() {
                return Err(ExchangeError::ExtractionEmpty { signature: signature.clone() });
            }
            let text_source = if text.is_empty() { TextSource::None } else { TextSource::Captions };
            return Ok(ExtractedContent { text, text_source, images });
        }

        if let Some(text) = self.copy_from_turn(signature).await {
            info!(%signature, chars = text.len(), "extracted via scoped copy");
            return Ok(ExtractedContent { text, text_source: TextSource::Clipboard, images: Vec::new() });
        }

        if let Some(text) = self.read_turn_text(signature).await {
            info!(%signature, chars = text.len(), "extracted via turn text");
            return Ok(ExtractedContent { text, text_source: TextSource::TurnText, images: Vec::new() });
        }

        warn!(%signature, "every extraction path came back empty");
        Err(ExchangeError::ExtractionEmpty { signature: signature.clone() })
    }

    /// Click the copy control of this turn only and read the clipboard back.
    /// Accepts the result only if it changed from the pre-click value.
    async fn copy_from_turn(&self, signature: &TurnSignature) -> Option<String> {
        let before = match self.session.read_clipboard().await {
            Ok(text) => text,
            Err(e) => {
                debug!(error = %e, "clipboard unreadable, skipping copy path");
                return None;
            }
        };
        match self.session.click_control_in_turn(signature, TurnControl::Copy).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(%signature, "no copy control inside the turn");
                return None;
            }
            Err(e) => {
                debug!(%signature, error = %e, "copy control click failed");
                return None;
            }
        }
        sleep(self.timings.copy_settle).await;
        let after = self.session.read_clipboard().await.ok()?;
        let after = after.trim();
        if after.is_empty() || after == before.trim() {
            debug!(%signature, "clipboard unchanged after copy");
            return None;
        }
        Some(after.to_string())
    }

    /// Direct text read of the turn, re-read while it still looks like a status banner.
    async fn read_turn_text(&self, signature: &TurnSignature) -> Option<String> {
        let attempts = self.timings.text_retry_attempts.max(1);
        for attempt in 1..=attempts {
            match self.session.turn_text(signature).await {
                Ok(Some(text)) => {
                    let text = text.trim();
                    if !text.is_empty() && !self.filter.is_transient(text) {
                        return Some(text.to_string());
                    }
                    debug!(%signature, attempt, "turn text empty or transient");
                }
                Ok(None) => {
                    debug!(%signature, "turn no longer resolves");
                    return None;
                }
                Err(e) => debug!(%signature, error = %e, "turn text read failed"),
            }
            if attempt < attempts {
                sleep(self.timings.completion_poll).await;
            }
        }
        None
    }

    /// Caption text of an image turn minus structural chrome.
    async fn image_turn_text(&self, signature: &TurnSignature) -> String {
        let captions = self.session.turn_captions(signature).await.unwrap_or_default();
        let parts: Vec<&str> = captions
            .iter()
            .map(|c| c.trim())
            .filter(|c| !is_chrome_text(c))
            .collect();
        if !parts.is_empty() {
            return parts.join(" ");
        }
        match self.session.turn_text(signature).await {
            Ok(Some(text)) => strip_speaker_prefix(&text).to_string(),
            _ => String::new(),
        }
    }
}

/// Speaker labels ("You said:") and tiny or oversized fragments.
fn is_chrome_text(text: &str) -> bool {
    let n = text.chars().count();
    n <= 3 || n >= 300 || text.contains("ChatGPT") || text.ends_with(" said:")
}

fn strip_speaker_prefix(text: &str) -> &str {
    let trimmed = text.trim();
    let lower = trimmed.to_ascii_lowercase();
    match lower.strip_prefix("chatgpt said:") {
        Some(_) => trimmed["chatgpt said:".len()..].trim(),
        None => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chrome_text_is_dropped() {
        assert!(is_chrome_text("ChatGPT said:"));
        assert!(is_chrome_text("…"));
        assert!(!is_chrome_text("Creating image • Harbour at dawn"));
        assert!(is_chrome_text("You said:"));
        assert!(!is_chrome_text("The cat said hi"));
    }

    #[test]
    fn speaker_prefix_is_stripped() {
        assert_eq!(strip_speaker_prefix("ChatGPT said:\n  A cat"), "A cat");
        assert_eq!(strip_speaker_prefix("A cat"), "A cat");
    }
}
