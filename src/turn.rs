//! Turn observations and the signature tracker that tells a new reply apart
//! from the one that was already on screen.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::error::StaleTurnGuard;
use crate::session::Session;

/// Point-in-time identity of a rendered turn. Two snapshots with equal
/// signatures are the same turn even if its text is still streaming.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnSignature {
    pub ordinal_index: usize,
    pub stable_id: String,
}

impl TurnSignature {
    pub fn new(ordinal_index: usize, stable_id: impl Into<String>) -> Self {
        Self { ordinal_index, stable_id: stable_id.into() }
    }
}

impl fmt::Display for TurnSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ordinal_index, self.stable_id)
    }
}

impl FromStr for TurnSignature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ordinal, id) = s
            .split_once(':')
            .ok_or_else(|| format!("missing ':' in signature {s:?}"))?;
        let ordinal_index = ordinal
            .trim()
            .parse::<usize>()
            .map_err(|e| format!("bad ordinal in {s:?}: {e}"))?;
        Ok(Self::new(ordinal_index, id))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    Text,
    Image,
    Mixed,
    Unknown,
}

impl TurnKind {
    pub fn infer(has_image_content: bool, raw_text: &str) -> Self {
        match (has_image_content, !raw_text.trim().is_empty()) {
            (true, true) => TurnKind::Mixed,
            (true, false) => TurnKind::Image,
            (false, true) => TurnKind::Text,
            (false, false) => TurnKind::Unknown,
        }
    }
}

/// Metadata of one reply turn as the renderer showed it at read time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnSnapshot {
    pub signature: TurnSignature,
    pub kind: TurnKind,
    pub has_ready_control: bool,
    pub has_image_content: bool,
    pub raw_text: String,
}

impl TurnSnapshot {
    pub fn new(
        signature: TurnSignature,
        has_ready_control: bool,
        has_image_content: bool,
        raw_text: impl Into<String>,
    ) -> Self {
        let raw_text = raw_text.into();
        Self {
            kind: TurnKind::infer(has_image_content, &raw_text),
            signature,
            has_ready_control,
            has_image_content,
            raw_text,
        }
    }
}

// ========================= Snapshot reader =========================

pub struct TurnReader<'a, S: Session + ?Sized> {
    session: &'a S,
}

impl<'a, S: Session + ?Sized> TurnReader<'a, S> {
    pub fn new(session: &'a S) -> Self {
        Self { session }
    }

    /// Latest reply turn, or `None`. Query failures read as "nothing yet".
    pub async fn latest(&self) -> Option<TurnSnapshot> {
        match self.session.latest_reply_turn().await {
            Ok(snap) => snap,
            Err(e) => {
                debug!(error = %e, "turn snapshot failed");
                None
            }
        }
    }

    pub async fn reply_count(&self) -> Option<usize> {
        self.session.count_reply_turns().await.ok()
    }
}

// ========================= Signature tracker =========================

/// What the conversation looked like right before a message was sent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Baseline {
    pub signature: Option<TurnSignature>,
    pub reply_count: usize,
}

impl Baseline {
    /// Reply turns that must exist once the answer to the next message shows up.
    pub fn expected_minimum_turn_count(&self) -> usize {
        self.reply_count + 1
    }
}

pub struct SignatureTracker<'a, S: Session + ?Sized> {
    reader: TurnReader<'a, S>,
    poll: Duration,
}

impl<'a, S: Session + ?Sized> SignatureTracker<'a, S> {
    pub fn new(session: &'a S, poll: Duration) -> Self {
        Self { reader: TurnReader::new(session), poll }
    }

    pub async fn capture_baseline(&self) -> Baseline {
        let signature = self.reader.latest().await.map(|s| s.signature);
        let reply_count = self.reader.reply_count().await.unwrap_or(0);
        debug!(signature = ?signature.as_ref().map(|s| s.to_string()), reply_count, "baseline captured");
        Baseline { signature, reply_count }
    }

    /// Refuse the pre-send turn.
    pub(crate) fn guard(
        prior: Option<&TurnSignature>,
        snap: TurnSnapshot,
    ) -> Result<TurnSnapshot, StaleTurnGuard> {
        match prior {
            Some(p) if *p == snap.signature => Err(StaleTurnGuard(snap.signature)),
            _ => Ok(snap),
        }
    }

    /// One poll: the latest reply turn if it is not the pre-send one.
    pub async fn new_turn(&self, prior: Option<&TurnSignature>) -> Option<TurnSnapshot> {
        let snap = self.reader.latest().await?;
        match Self::guard(prior, snap) {
            Ok(snap) => Some(snap),
            Err(stale) => {
                debug!(%stale, "still looking at the previous turn");
                None
            }
        }
    }

    /// Poll until a reply turn different from the baseline exists.
    ///
    /// A differing signature is accepted once the reply count reached the
    /// expected minimum, or the turn sits past the baseline's ordinal.
    pub async fn wait_for_new_signature(
        &self,
        baseline: &Baseline,
        timeout: Duration,
    ) -> Option<TurnSnapshot> {
        let prior = baseline.signature.as_ref();
        let expected = baseline.expected_minimum_turn_count();
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(snap) = self.new_turn(prior).await {
                let past_prior = prior.map_or(true, |p| snap.signature.ordinal_index > p.ordinal_index);
                let count_ok = match self.reader.reply_count().await {
                    Some(count) => count >= expected,
                    None => false,
                };
                if past_prior || count_ok {
                    info!(signature = %snap.signature, kind = ?snap.kind, "new reply turn appeared");
                    return Some(snap);
                }
                debug!(signature = %snap.signature, "turn changed but is not past the baseline yet");
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(self.poll).await;
        }
    }
}
