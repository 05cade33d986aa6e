//! Scripted in-memory page used by the integration tests. Replies unfold on
//! tokio's clock, so tests run with `start_paused = true`.

#![allow(dead_code)]

use async_trait::async_trait;
use chat_relay::config::{RelayConfig, Timings, TransientFilterConfig};
use chat_relay::images::ImageCandidate;
use chat_relay::selectors::{self, Locator};
use chat_relay::session::{ElementHandle, FetchedBytes, Session, ThreadLink, TurnControl};
use chat_relay::turn::{TurnSignature, TurnSnapshot};
use chat_relay::SessionError;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::{sleep, Instant};

pub const BASE_URL: &str = "https://chatgpt.com";

#[derive(Clone, Debug, Default)]
pub struct Stage {
    pub ready: bool,
    pub image: bool,
    pub text: String,
}

pub fn stage(ready: bool, text: &str) -> Stage {
    Stage { ready, image: false, text: text.to_string() }
}

#[derive(Clone, Debug)]
pub enum CopyBehavior {
    Text(String),
    /// "reply to <composed message>"
    Echo,
    /// Click lands but the clipboard keeps its old value.
    Broken,
}

#[derive(Clone, Debug)]
pub struct ReplyScript {
    pub signature: TurnSignature,
    pub appear_after: Duration,
    /// Offsets from submission; the latest one reached is what the page shows.
    pub stages: Vec<(Duration, Stage)>,
    /// Text keeps changing every second and never gets a ready control.
    pub streaming_forever: bool,
    pub copy: CopyBehavior,
    pub images: Vec<ImageCandidate>,
    pub image_bytes: Vec<u8>,
    pub captions: Vec<String>,
    /// Busy indicator visible between these offsets.
    pub busy: Option<(Duration, Duration)>,
}

impl ReplyScript {
    pub fn new(ordinal: usize, id: &str, appear_after_secs: u64) -> Self {
        Self {
            signature: TurnSignature::new(ordinal, id),
            appear_after: Duration::from_secs(appear_after_secs),
            stages: Vec::new(),
            streaming_forever: false,
            copy: CopyBehavior::Echo,
            images: Vec::new(),
            image_bytes: Vec::new(),
            captions: Vec::new(),
            busy: None,
        }
    }

    pub fn stage(mut self, at_secs: u64, stage: Stage) -> Self {
        self.stages.push((Duration::from_secs(at_secs), stage));
        self
    }

    pub fn copy(mut self, copy: CopyBehavior) -> Self {
        self.copy = copy;
        self
    }

    fn stage_at(&self, elapsed: Duration) -> Stage {
        if self.streaming_forever {
            return stage(false, &format!("partial chunk {}", elapsed.as_secs()));
        }
        self.stages
            .iter()
            .rev()
            .find(|(at, _)| *at <= elapsed)
            .map(|(_, s)| s.clone())
            .unwrap_or_default()
    }
}

struct Active {
    submitted: Instant,
    script: ReplyScript,
    composed: String,
}

impl Active {
    fn elapsed(&self) -> Duration {
        self.submitted.elapsed()
    }

    fn appeared(&self) -> bool {
        self.elapsed() >= self.script.appear_after
    }

    fn snapshot(&self) -> TurnSnapshot {
        let s = self.script.stage_at(self.elapsed());
        TurnSnapshot::new(self.script.signature.clone(), s.ready, s.image, s.text)
    }
}

struct State {
    baseline: Option<TurnSnapshot>,
    reply_count: usize,
    scripts: VecDeque<ReplyScript>,
    active: Option<Active>,
    composing: String,
    clipboard: String,
    url: String,
    thread_id: String,
    events: Vec<String>,
    idle_motions: usize,
}

#[derive(Default)]
pub struct Flags {
    pub chat_input_missing: bool,
    pub send_button_missing: bool,
    pub logged_out: bool,
}

pub struct FakeSession {
    state: Mutex<State>,
    flags: Flags,
    thread_links: Vec<ThreadLink>,
}

impl FakeSession {
    pub fn new(baseline: Option<TurnSnapshot>, clipboard: &str) -> Self {
        let reply_count = usize::from(baseline.is_some());
        Self {
            state: Mutex::new(State {
                baseline,
                reply_count,
                scripts: VecDeque::new(),
                active: None,
                composing: String::new(),
                clipboard: clipboard.to_string(),
                url: format!("{BASE_URL}/"),
                thread_id: "67a1b2c3-0000-4f00-9abc-0123456789ab".into(),
                events: Vec::new(),
                idle_motions: 0,
            }),
            flags: Flags::default(),
            thread_links: Vec::new(),
        }
    }

    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_thread_links(mut self, links: &[(&str, &str)]) -> Self {
        self.thread_links = links
            .iter()
            .map(|(href, title)| ThreadLink { href: href.to_string(), title: title.to_string() })
            .collect();
        self
    }

    pub fn push_reply(&self, script: ReplyScript) {
        self.state.lock().unwrap().scripts.push_back(script);
    }

    pub fn events(&self) -> Vec<String> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn idle_motions(&self) -> usize {
        self.state.lock().unwrap().idle_motions
    }

    fn log(&self, event: impl Into<String>) {
        self.state.lock().unwrap().events.push(event.into());
    }

    fn submit(&self) {
        let mut st = self.state.lock().unwrap();
        // The previous reply becomes the settled history of the page.
        if let Some(prev) = st.active.take() {
            if prev.appeared() {
                st.baseline = Some(prev.snapshot());
                st.reply_count += 1;
            }
        }
        let composed = std::mem::take(&mut st.composing);
        st.events.push("submit".into());
        if let Some(script) = st.scripts.pop_front() {
            st.active = Some(Active { submitted: Instant::now(), script, composed });
            st.url = format!("{BASE_URL}/c/{}", st.thread_id);
        }
    }

    fn busy_visible(&self) -> bool {
        let st = self.state.lock().unwrap();
        match &st.active {
            Some(a) => match a.script.busy {
                Some((from, to)) => {
                    let e = a.elapsed();
                    e >= from && e < to
                }
                None => false,
            },
            None => false,
        }
    }

    fn role_of(locator: &Locator) -> &'static str {
        if selectors::chat_input().contains(locator) {
            "chat_input"
        } else if selectors::send_button().contains(locator) {
            "send_button"
        } else if selectors::file_input().contains(locator) {
            "file_input"
        } else if selectors::login_indicators().contains(locator) {
            "login"
        } else {
            "other"
        }
    }

    async fn wait_busy(&self, want_visible: bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.busy_visible() == want_visible {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(Duration::from_millis(250).min(deadline - now)).await;
        }
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn latest_reply_turn(&self) -> Result<Option<TurnSnapshot>, SessionError> {
        let st = self.state.lock().unwrap();
        Ok(match &st.active {
            Some(a) if a.appeared() => Some(a.snapshot()),
            _ => st.baseline.clone(),
        })
    }

    async fn count_reply_turns(&self) -> Result<usize, SessionError> {
        let st = self.state.lock().unwrap();
        let live = st.active.as_ref().map_or(0, |a| usize::from(a.appeared()));
        Ok(st.reply_count + live)
    }

    async fn find(&self, locator: &Locator, _timeout: Duration) -> Result<Option<ElementHandle>, SessionError> {
        let role = Self::role_of(locator);
        let present = match role {
            "chat_input" => !self.flags.chat_input_missing,
            "send_button" => !self.flags.send_button_missing,
            "file_input" => true,
            "login" => self.flags.logged_out,
            _ => false,
        };
        Ok(present.then(|| ElementHandle { id: role.to_string(), locator: locator.clone() }))
    }

    async fn click(&self, handle: &ElementHandle) -> Result<(), SessionError> {
        match handle.id.as_str() {
            "send_button" => self.submit(),
            other => self.log(format!("click:{other}")),
        }
        Ok(())
    }

    async fn insert_text(&self, _handle: &ElementHandle, text: &str) -> Result<(), SessionError> {
        let mut st = self.state.lock().unwrap();
        st.composing.push_str(text);
        st.events.push(format!("type:{text}"));
        Ok(())
    }

    async fn press_enter(&self, _handle: &ElementHandle) -> Result<(), SessionError> {
        self.log("enter");
        self.submit();
        Ok(())
    }

    async fn attach_files(&self, _handle: &ElementHandle, paths: &[PathBuf]) -> Result<(), SessionError> {
        self.log(format!("attach:{}", paths.len()));
        Ok(())
    }

    async fn read_clipboard(&self) -> Result<String, SessionError> {
        Ok(self.state.lock().unwrap().clipboard.clone())
    }

    async fn wait_visible(&self, locators: &[Locator], timeout: Duration) -> Result<bool, SessionError> {
        if locators != selectors::busy_indicator().as_slice() {
            return Ok(false);
        }
        Ok(self.wait_busy(true, timeout).await)
    }

    async fn wait_hidden(&self, locators: &[Locator], timeout: Duration) -> Result<bool, SessionError> {
        if locators != selectors::busy_indicator().as_slice() {
            return Ok(true);
        }
        Ok(self.wait_busy(false, timeout).await)
    }

    async fn click_control_in_turn(&self, signature: &TurnSignature, control: TurnControl) -> Result<bool, SessionError> {
        assert_eq!(control, TurnControl::Copy);
        let mut st = self.state.lock().unwrap();
        st.events.push(format!("copy:{signature}"));
        let stale = st
            .baseline
            .as_ref()
            .filter(|b| b.signature == *signature)
            .map(|b| format!("STALE {}", b.raw_text));
        if let Some(stale) = stale {
            st.clipboard = stale;
            return Ok(true);
        }
        let Some(active) = st.active.as_ref().filter(|a| a.appeared() && a.script.signature == *signature) else {
            return Ok(false);
        };
        if !active.snapshot().has_ready_control {
            return Ok(false);
        }
        let copied = match &active.script.copy {
            CopyBehavior::Text(t) => Some(t.clone()),
            CopyBehavior::Echo => Some(format!("reply to {}", active.composed)),
            CopyBehavior::Broken => None,
        };
        if let Some(text) = copied {
            st.clipboard = text;
        }
        Ok(true)
    }

    async fn turn_text(&self, signature: &TurnSignature) -> Result<Option<String>, SessionError> {
        let st = self.state.lock().unwrap();
        if let Some(a) = st.active.as_ref().filter(|a| a.appeared() && a.script.signature == *signature) {
            return Ok(Some(a.snapshot().raw_text));
        }
        Ok(st
            .baseline
            .as_ref()
            .filter(|b| b.signature == *signature)
            .map(|b| b.raw_text.clone()))
    }

    async fn turn_captions(&self, signature: &TurnSignature) -> Result<Vec<String>, SessionError> {
        let st = self.state.lock().unwrap();
        Ok(st
            .active
            .as_ref()
            .filter(|a| a.script.signature == *signature)
            .map(|a| a.script.captions.clone())
            .unwrap_or_default())
    }

    async fn image_candidates(&self, signature: &TurnSignature) -> Result<Vec<ImageCandidate>, SessionError> {
        let st = self.state.lock().unwrap();
        Ok(st
            .active
            .as_ref()
            .filter(|a| a.script.signature == *signature)
            .map(|a| a.script.images.clone())
            .unwrap_or_default())
    }

    async fn fetch_with_session_auth(&self, url: &str) -> Result<FetchedBytes, SessionError> {
        let st = self.state.lock().unwrap();
        let bytes = st
            .active
            .as_ref()
            .filter(|a| a.script.images.iter().any(|i| i.src == url))
            .map(|a| a.script.image_bytes.clone())
            .unwrap_or_default();
        if bytes.is_empty() {
            return Err(SessionError::Browser(format!("no such asset {url}")));
        }
        Ok(FetchedBytes { bytes, content_type: Some("image/png".into()) })
    }

    async fn current_url(&self) -> Result<String, SessionError> {
        Ok(self.state.lock().unwrap().url.clone())
    }

    async fn navigate(&self, url: &str) -> Result<(), SessionError> {
        let mut st = self.state.lock().unwrap();
        st.url = url.to_string();
        st.events.push(format!("navigate:{url}"));
        Ok(())
    }

    async fn thread_links(&self) -> Result<Vec<ThreadLink>, SessionError> {
        Ok(self.thread_links.clone())
    }

    async fn idle_motion(&self) -> Result<(), SessionError> {
        self.state.lock().unwrap().idle_motions += 1;
        Ok(())
    }
}

pub fn config(images_dir: &Path) -> RelayConfig {
    RelayConfig {
        base_url: BASE_URL.to_string(),
        images_dir: images_dir.to_path_buf(),
        timings: Timings {
            response_timeout: Duration::from_secs(120),
            turn_appear_timeout: Duration::from_secs(30),
            selector_timeout: Duration::from_secs(2),
            ..Timings::default()
        },
        transient: TransientFilterConfig::default(),
        best_effort_on_timeout: false,
    }
}

pub const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
