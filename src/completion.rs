//! Deciding when the new reply turn has finished generating.
//!
//! The page has no "done" event, so three signals are tried in order against
//! one shared deadline:
//!
//! 1. structural readiness: the turn grew a ready control or an image,
//! 2. busy-indicator lifecycle: the stop control appeared and went away,
//! 3. text stability: the turn's text stopped changing and is not a status banner.
//!
//! Every strategy looks only at the turn whose signature differs from the
//! pre-send one.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::{Timings, TransientFilterConfig};
use crate::selectors;
use crate::session::Session;
use crate::turn::{SignatureTracker, TurnSignature, TurnSnapshot};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionSignal {
    ReadyControl,
    ImageContent,
    BusyIndicatorCleared,
    TextStable,
}

#[derive(Clone, Debug)]
pub struct CompletionOutcome {
    pub signal: CompletionSignal,
    /// Latest observation of the finished turn.
    pub turn: TurnSnapshot,
}

// ========================= Transient-status filter =========================

/// Recognises interim banners such as "Thinking…" or "Searching the web".
///
/// This is a heuristic and errs toward waiting: a real answer that opens with
/// one of the keywords and is short will be held back.
#[derive(Clone, Debug)]
pub struct TransientFilter {
    keywords: Vec<String>,
    max_len: usize,
}

impl TransientFilter {
    pub fn new(cfg: &TransientFilterConfig) -> Self {
        Self {
            keywords: cfg.keywords.iter().map(|k| k.to_lowercase()).collect(),
            max_len: cfg.max_len,
        }
    }

    pub fn is_transient(&self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }
        let lower = text.to_lowercase();
        if !self.keywords.iter().any(|k| lower.contains(k.as_str())) {
            return false;
        }
        text.chars().count() < self.max_len || self.keywords.iter().any(|k| lower.starts_with(k.as_str()))
    }
}

impl Default for TransientFilter {
    fn default() -> Self {
        Self::new(&TransientFilterConfig::default())
    }
}

// ========================= Cascade =========================

pub struct CompletionCascade<'a, S: Session + ?Sized> {
    session: &'a S,
    tracker: SignatureTracker<'a, S>,
    timings: &'a Timings,
    filter: &'a TransientFilter,
}

impl<'a, S: Session + ?Sized> CompletionCascade<'a, S> {
    pub fn new(session: &'a S, timings: &'a Timings, filter: &'a TransientFilter) -> Self {
        Self {
            session,
            tracker: SignatureTracker::new(session, timings.turn_poll),
            timings,
            filter,
        }
    }

    /// Run all strategies until one fires or `timeout` is spent. `None` means
    /// no positive signal; the caller decides what that implies.
    pub async fn run(&self, prior: Option<&TurnSignature>, timeout: Duration) -> Option<CompletionOutcome> {
        let deadline = Instant::now() + timeout;

        let structural_deadline = deadline.min(Instant::now() + self.timings.structural_window);
        if let Some(outcome) = self.wait_structural(prior, structural_deadline).await {
            info!(signal = ?outcome.signal, signature = %outcome.turn.signature, "reply complete");
            return Some(outcome);
        }

        info!("no ready control yet, watching the busy indicator");
        if let Some(outcome) = self.wait_busy_lifecycle(prior, deadline).await {
            info!(signal = ?outcome.signal, signature = %outcome.turn.signature, "reply complete");
            return Some(outcome);
        }

        info!("falling back to text stability");
        if let Some(outcome) = self.wait_text_stable(prior, deadline).await {
            info!(signal = ?outcome.signal, signature = %outcome.turn.signature, "reply complete");
            return Some(outcome);
        }

        warn!(waited_ms = timeout.as_millis() as u64, "completion cascade exhausted");
        None
    }

    /// Strategy 1: the new turn reports a ready control or image content.
    pub async fn wait_structural(
        &self,
        prior: Option<&TurnSignature>,
        deadline: Instant,
    ) -> Option<CompletionOutcome> {
        let mut heartbeat = Heartbeat::new(self.timings.heartbeat);
        loop {
            if let Some(turn) = self.tracker.new_turn(prior).await {
                if turn.has_ready_control {
                    return Some(CompletionOutcome { signal: CompletionSignal::ReadyControl, turn });
                }
                if turn.has_image_content {
                    debug!(signature = %turn.signature, "image marker seen, letting assets settle");
                    sleep(self.timings.image_settle).await;
                    let turn = match self.tracker.new_turn(prior).await {
                        Some(settled) if settled.signature == turn.signature => settled,
                        _ => turn,
                    };
                    return Some(CompletionOutcome { signal: CompletionSignal::ImageContent, turn });
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            heartbeat.tick(self.session, "ready control").await;
            sleep(self.timings.completion_poll.min(remaining(deadline))).await;
        }
    }

    /// Strategy 2: the busy indicator shows up and disappears again.
    ///
    /// A cleared indicator only says "not busy", so a short structural pass
    /// follows to name the signal when possible.
    pub async fn wait_busy_lifecycle(
        &self,
        prior: Option<&TurnSignature>,
        deadline: Instant,
    ) -> Option<CompletionOutcome> {
        let busy = selectors::busy_indicator();
        let appear_bound = self.timings.busy_appear_timeout.min(remaining(deadline));
        match self.session.wait_visible(&busy, appear_bound).await {
            Ok(true) => debug!("busy indicator visible, reply is streaming"),
            Ok(false) => {
                debug!("busy indicator never appeared");
                return None;
            }
            Err(e) => {
                debug!(error = %e, "busy indicator probe failed");
                return None;
            }
        }

        let mut waited = Duration::ZERO;
        loop {
            let step = self.timings.busy_hidden_step.min(remaining(deadline));
            if step.is_zero() {
                warn!(waited_s = waited.as_secs(), "busy indicator still visible at deadline");
                return None;
            }
            match self.session.wait_hidden(&busy, step).await {
                Ok(true) => break,
                Ok(false) => {
                    waited += step;
                    debug!(waited_s = waited.as_secs(), "still streaming");
                    if let Err(e) = self.session.idle_motion().await {
                        debug!(error = %e, "idle motion failed");
                    }
                }
                Err(e) => {
                    debug!(error = %e, "busy indicator probe failed");
                    return None;
                }
            }
        }
        debug!("busy indicator cleared");

        let confirm_deadline = deadline.min(Instant::now() + self.timings.busy_confirm_window);
        if let Some(outcome) = self.wait_structural(prior, confirm_deadline).await {
            return Some(outcome);
        }
        let turn = self.tracker.new_turn(prior).await?;
        Some(CompletionOutcome { signal: CompletionSignal::BusyIndicatorCleared, turn })
    }

    /// Strategy 3: the new turn's text is non-empty, unchanged for
    /// `stable_reads` consecutive reads, and not a status banner.
    pub async fn wait_text_stable(
        &self,
        prior: Option<&TurnSignature>,
        deadline: Instant,
    ) -> Option<CompletionOutcome> {
        let mut heartbeat = Heartbeat::new(self.timings.heartbeat);
        let mut last: Option<(TurnSignature, String)> = None;
        let mut stable = 0usize;
        loop {
            match self.tracker.new_turn(prior).await {
                Some(turn) if !turn.raw_text.trim().is_empty() => {
                    let same = matches!(&last, Some((sig, text)) if *sig == turn.signature && *text == turn.raw_text);
                    if same {
                        stable += 1;
                    } else {
                        stable = 1;
                        last = Some((turn.signature.clone(), turn.raw_text.clone()));
                    }
                    if stable >= self.timings.stable_reads {
                        if self.filter.is_transient(&turn.raw_text) {
                            debug!(text = %turn.raw_text, "stable text is a status banner, waiting on");
                        } else {
                            return Some(CompletionOutcome { signal: CompletionSignal::TextStable, turn });
                        }
                    }
                }
                _ => {
                    stable = 0;
                    last = None;
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            heartbeat.tick(self.session, "stable text").await;
            sleep(self.timings.completion_poll.min(remaining(deadline))).await;
        }
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// Issues a liveness action every `every` while a wait loop runs.
struct Heartbeat {
    every: Duration,
    started: Instant,
    next: Instant,
}

impl Heartbeat {
    fn new(every: Duration) -> Self {
        let now = Instant::now();
        Self { every, started: now, next: now + every }
    }

    async fn tick<S: Session + ?Sized>(&mut self, session: &S, waiting_for: &str) {
        if self.every.is_zero() || Instant::now() < self.next {
            return;
        }
        self.next = Instant::now() + self.every;
        debug!(waiting_for, elapsed_s = self.started.elapsed().as_secs(), "still waiting");
        if let Err(e) = session.idle_motion().await {
            debug!(error = %e, "idle motion failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_status_banners_are_transient() {
        let f = TransientFilter::default();
        assert!(f.is_transient("Thinking about this…"));
        assert!(f.is_transient("Searching the web"));
        assert!(f.is_transient("  Please wait while I look into it  "));
        assert!(f.is_transient("Analyzing image"));
    }

    #[test]
    fn answers_are_not_transient() {
        let f = TransientFilter::default();
        assert!(!f.is_transient("The answer is 42."));
        assert!(!f.is_transient("Paris is the capital of France."));
        assert!(!f.is_transient(""));
    }

    #[test]
    fn long_text_is_only_transient_when_it_opens_with_a_keyword() {
        let f = TransientFilter::default();
        let body = "x".repeat(300);
        assert!(!f.is_transient(&format!("Here is a review of linear versus binary searching. {body}")));
        assert!(f.is_transient(&format!("Thinking {body}")));
    }

    #[test]
    fn long_banner_opening_with_a_later_keyword_is_transient() {
        let f = TransientFilter::default();
        let banner = format!("Searching the web for sources {} while thinking it over", "x".repeat(300));
        assert!(f.is_transient(&banner));
    }

    #[test]
    fn filter_is_tunable() {
        let f = TransientFilter::new(&TransientFilterConfig {
            keywords: vec!["Pondering".into()],
            max_len: 20,
        });
        assert!(f.is_transient("pondering..."));
        assert!(!f.is_transient("Thinking about this…"));
    }
}
