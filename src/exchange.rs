//! Per-message state machine and the single-flight gate around a session.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::completion::{CompletionCascade, CompletionSignal, TransientFilter};
use crate::config::RelayConfig;
use crate::error::{ExchangeError, ExchangePhase};
use crate::extract::{ContentExtractor, TextSource};
use crate::images::{ImageAsset, ImageAssetHandler};
use crate::selectors;
use crate::session::{probe_first_match, ElementHandle, Session};
use crate::turn::{Baseline, SignatureTracker, TurnSignature};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExchangeRequest {
    pub text: String,
    #[serde(default)]
    pub image_paths: Vec<PathBuf>,
    #[serde(default)]
    pub file_paths: Vec<PathBuf>,
}

impl ExchangeRequest {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), ..Default::default() }
    }

    pub fn with_images(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.image_paths.extend(paths);
        self
    }

    pub fn with_files(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.file_paths.extend(paths);
        self
    }

    fn attachments(&self) -> Vec<PathBuf> {
        self.image_paths.iter().chain(&self.file_paths).cloned().collect()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractedResponse {
    pub text: String,
    pub images: Vec<ImageAsset>,
    pub has_images: bool,
    pub elapsed_ms: u64,
    pub session_thread_id: String,
    pub completion: Option<CompletionSignal>,
    pub text_source: TextSource,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeState {
    Idle,
    Composing,
    Sent,
    AwaitingNewTurn,
    AwaitingCompletion,
    Extracting,
    Done,
    Failed,
}

/// One request cycle, alive from gate admission to a terminal state.
#[derive(Debug)]
pub struct PendingExchange {
    pub prior_signature: Option<TurnSignature>,
    pub expected_minimum_turn_count: usize,
    pub deadline: Instant,
    pub state: ExchangeState,
    pub result: Option<ExtractedResponse>,
    started: Instant,
}

impl PendingExchange {
    fn new(baseline: &Baseline, budget: Duration) -> Self {
        let started = Instant::now();
        Self {
            prior_signature: baseline.signature.clone(),
            expected_minimum_turn_count: baseline.expected_minimum_turn_count(),
            deadline: started + budget,
            state: ExchangeState::Idle,
            result: None,
            started,
        }
    }

    fn advance(&mut self, next: ExchangeState) {
        debug!(from = ?self.state, to = ?next, "exchange state");
        self.state = next;
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub id: String,
    pub title: String,
    pub url: String,
}

fn thread_id_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/c/([A-Za-z0-9-]+)").ok()).as_ref()
}

/// Conversation id from a page URL or link, empty when not inside a thread.
pub fn thread_id_from_url(url: &str) -> String {
    thread_id_re()
        .and_then(|re| re.captures(url))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

// ========================= Orchestrator =========================

/// Drives one session. Every public operation holds the gate for its whole
/// duration; tokio's mutex queues waiters in arrival order.
///
/// Shared as `Arc<ChatRelay<_>>`: an admitted exchange runs on its own task
/// that owns the gate, so dropping the caller's future abandons the reply
/// but not the exchange.
pub struct ChatRelay<S: Session> {
    session: S,
    cfg: RelayConfig,
    filter: TransientFilter,
    images: ImageAssetHandler,
    gate: Arc<Mutex<()>>,
}

impl<S: Session + 'static> ChatRelay<S> {
    /// Send one message and wait for its reply.
    ///
    /// The gate opens only when the exchange reaches `Done` or `Failed`,
    /// even if this future is dropped first.
    pub async fn send_exchange(self: &Arc<Self>, request: ExchangeRequest) -> Result<ExtractedResponse, ExchangeError> {
        let gate = Arc::clone(&self.gate).lock_owned().await;
        let relay = Arc::clone(self);
        let exchange = tokio::spawn(async move {
            let outcome = relay.run_exchange(request).await;
            drop(gate);
            outcome
        });
        match exchange.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => {
                warn!(error = %e, "exchange task cancelled");
                Err(ExchangeError::WorkerClosed)
            }
        }
    }
}

impl<S: Session> ChatRelay<S> {
    pub fn new(session: S, cfg: RelayConfig) -> Self {
        Self {
            filter: TransientFilter::new(&cfg.transient),
            images: ImageAssetHandler::new(&cfg.images_dir, cfg.base_url.clone()),
            session,
            cfg,
            gate: Arc::new(Mutex::new(())),
        }
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn config(&self) -> &RelayConfig {
        &self.cfg
    }

    async fn run_exchange(&self, request: ExchangeRequest) -> Result<ExtractedResponse, ExchangeError> {
        let timings = &self.cfg.timings;
        info!(
            chars = request.text.len(),
            attachments = request.image_paths.len() + request.file_paths.len(),
            "sending message"
        );

        let tracker = SignatureTracker::new(&self.session, timings.turn_poll);
        let baseline = tracker.capture_baseline().await;
        let mut pending = PendingExchange::new(&baseline, timings.turn_appear_timeout + timings.response_timeout);

        let outcome = self.drive(&mut pending, &tracker, &baseline, &request).await;
        match &outcome {
            Ok(resp) => {
                pending.advance(ExchangeState::Done);
                pending.result = Some(resp.clone());
                info!(
                    elapsed_ms = resp.elapsed_ms,
                    chars = resp.text.len(),
                    images = resp.images.len(),
                    thread = %resp.session_thread_id,
                    "reply received"
                );
            }
            Err(e) => {
                pending.advance(ExchangeState::Failed);
                warn!(phase = ?e.phase(), error = %e, "exchange failed");
            }
        }
        outcome
    }

    async fn drive(
        &self,
        pending: &mut PendingExchange,
        tracker: &SignatureTracker<'_, S>,
        baseline: &Baseline,
        request: &ExchangeRequest,
    ) -> Result<ExtractedResponse, ExchangeError> {
        let timings = &self.cfg.timings;

        pending.advance(ExchangeState::Composing);
        let input = self.compose(request).await?;

        self.submit(&input).await?;
        pending.advance(ExchangeState::Sent);

        pending.advance(ExchangeState::AwaitingNewTurn);
        let appeared = tracker
            .wait_for_new_signature(baseline, timings.turn_appear_timeout)
            .await
            .ok_or(ExchangeError::TurnNotAppeared { waited: timings.turn_appear_timeout })?;
        debug!(signature = %appeared.signature, "waiting for completion");

        pending.advance(ExchangeState::AwaitingCompletion);
        let prior = pending.prior_signature.clone();
        let budget = timings.response_timeout.min(pending.remaining());
        let cascade = CompletionCascade::new(&self.session, timings, &self.filter);
        let (turn, signal) = match cascade.run(prior.as_ref(), budget).await {
            Some(outcome) => (outcome.turn, Some(outcome.signal)),
            None if self.cfg.best_effort_on_timeout => {
                warn!("no completion signal, attempting best-effort extraction");
                let turn = tracker
                    .new_turn(prior.as_ref())
                    .await
                    .ok_or(ExchangeError::CompletionTimeout { waited: budget })?;
                (turn, None)
            }
            None => return Err(ExchangeError::CompletionTimeout { waited: budget }),
        };

        pending.advance(ExchangeState::Extracting);
        let extractor = ContentExtractor::new(&self.session, timings, &self.filter, &self.images);
        let content = match extractor.extract(prior.as_ref(), turn).await {
            Ok(content) => content,
            Err(ExchangeError::ExtractionEmpty { .. }) if signal.is_none() => {
                return Err(ExchangeError::CompletionTimeout { waited: budget });
            }
            Err(e) => return Err(e),
        };

        let session_thread_id = self
            .session
            .current_url()
            .await
            .map(|u| thread_id_from_url(&u))
            .unwrap_or_default();

        Ok(ExtractedResponse {
            has_images: !content.images.is_empty(),
            text: content.text,
            images: content.images,
            elapsed_ms: pending.elapsed().as_millis() as u64,
            session_thread_id,
            completion: signal,
            text_source: content.text_source,
        })
    }

    /// Attach files, then fill the chat input. Returns the input handle.
    async fn compose(&self, request: &ExchangeRequest) -> Result<ElementHandle, ExchangeError> {
        let timings = &self.cfg.timings;
        let attachments: Vec<PathBuf> = request
            .attachments()
            .into_iter()
            .filter(|p| {
                let ok = p.is_file();
                if !ok {
                    warn!(path = %p.display(), "attachment not found, skipping");
                }
                ok
            })
            .collect();

        if !attachments.is_empty() {
            let file_input = probe_first_match(&self.session, &selectors::file_input(), timings.selector_timeout)
                .await
                .ok_or(ExchangeError::LocatorMiss { what: "file input", phase: ExchangePhase::Compose })?;
            self.session
                .attach_files(&file_input, &attachments)
                .await
                .map_err(|e| ExchangeError::session(ExchangePhase::Compose, e))?;
            info!(count = attachments.len(), "attachments set");
            sleep(timings.attachment_settle_for(attachments.len())).await;
        }

        let input = probe_first_match(&self.session, &selectors::chat_input(), timings.selector_timeout)
            .await
            .ok_or(ExchangeError::LocatorMiss { what: "chat input", phase: ExchangePhase::Compose })?;
        self.session
            .click(&input)
            .await
            .map_err(|e| ExchangeError::session(ExchangePhase::Compose, e))?;
        self.session
            .insert_text(&input, &request.text)
            .await
            .map_err(|e| ExchangeError::session(ExchangePhase::Compose, e))?;
        Ok(input)
    }

    async fn submit(&self, input: &ElementHandle) -> Result<(), ExchangeError> {
        let timings = &self.cfg.timings;
        let submitted = match probe_first_match(&self.session, &selectors::send_button(), timings.selector_timeout).await {
            Some(button) => self.session.click(&button).await,
            None => {
                info!("send button not found, pressing Enter");
                self.session.press_enter(input).await
            }
        };
        submitted.map_err(|e| ExchangeError::session(ExchangePhase::Submit, e))
    }

    // ========================= Conversation navigation =========================

    /// Start a fresh conversation.
    pub async fn new_chat(&self) -> Result<(), ExchangeError> {
        let _gate = self.gate.lock().await;
        info!("starting new chat");
        self.navigate_and_wait(&self.cfg.base_url).await
    }

    pub async fn open_thread(&self, thread_id: &str) -> Result<(), ExchangeError> {
        let _gate = self.gate.lock().await;
        let url = format!("{}/c/{}", self.cfg.base_url.trim_end_matches('/'), thread_id);
        info!(thread_id, "opening thread");
        self.navigate_and_wait(&url).await
    }

    async fn navigate_and_wait(&self, url: &str) -> Result<(), ExchangeError> {
        let timings = &self.cfg.timings;
        self.session
            .navigate(url)
            .await
            .map_err(|e| ExchangeError::session(ExchangePhase::Dispatch, e))?;
        sleep(timings.navigation_settle).await;
        probe_first_match(&self.session, &selectors::chat_input(), timings.selector_timeout)
            .await
            .map(|_| ())
            .ok_or(ExchangeError::LocatorMiss { what: "chat input", phase: ExchangePhase::Dispatch })
    }

    /// Conversations listed in the sidebar, first match per id.
    pub async fn list_threads(&self) -> Result<Vec<ThreadInfo>, ExchangeError> {
        let _gate = self.gate.lock().await;
        let links = self
            .session
            .thread_links()
            .await
            .map_err(|e| ExchangeError::session(ExchangePhase::Dispatch, e))?;
        let base = self.cfg.base_url.trim_end_matches('/');
        let mut threads: Vec<ThreadInfo> = Vec::new();
        for link in links {
            let id = thread_id_from_url(&link.href);
            if id.is_empty() || threads.iter().any(|t| t.id == id) {
                continue;
            }
            let url = if link.href.starts_with("http") { link.href.clone() } else { format!("{base}{}", link.href) };
            threads.push(ThreadInfo { id, title: link.title.trim().to_string(), url });
        }
        info!(count = threads.len(), "threads listed");
        Ok(threads)
    }

    pub async fn current_thread_id(&self) -> String {
        let _gate = self.gate.lock().await;
        self.session
            .current_url()
            .await
            .map(|u| thread_id_from_url(&u))
            .unwrap_or_default()
    }

    /// `false` when a login prompt is on screen.
    pub async fn is_logged_in(&self) -> bool {
        let _gate = self.gate.lock().await;
        let probe = Duration::from_millis(500).min(self.cfg.timings.selector_timeout);
        probe_first_match(&self.session, &selectors::login_indicators(), probe)
            .await
            .is_none()
    }
}
