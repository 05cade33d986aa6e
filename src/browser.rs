use anyhow::Result;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::browser::{GrantPermissionsParams, PermissionType};
use chromiumoxide::cdp::browser_protocol::dom::SetFileInputFilesParams;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::InsertTextParams;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::element::Element;
use chromiumoxide::layout::Point;
use chromiumoxide::page::Page;
use futures::StreamExt;
use nanoid::nanoid;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::error::SessionError;
use crate::images::ImageCandidate;
use crate::selectors::{self, dom, Locator};
use crate::session::{ElementHandle, FetchedBytes, Session, ThreadLink, TurnControl};
use crate::turn::{TurnSignature, TurnSnapshot};

const VIEWPORT: (i64, i64) = (1280, 800);
const HANDLE_ATTR: &str = "data-relay-handle";
const FIND_POLL: Duration = Duration::from_millis(200);

#[derive(Clone)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
    /// Persistent profile so a logged-in session survives restarts.
    pub user_data_dir: Option<PathBuf>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: false,
            user_agent: None,
            user_data_dir: std::env::var("BROWSER_PROFILE_DIR").ok().map(PathBuf::from),
        }
    }
}

pub struct Browser {
    page: Page,
    _browser: OxideBrowser,
}

impl Browser {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // Without a configured profile, use a unique dir per run to avoid
        // ProcessSingleton lock conflicts on rapid restarts.
        let profile_dir = match cfg.user_data_dir {
            Some(dir) => dir,
            None => {
                let ts = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis())
                    .unwrap_or_default();
                std::env::temp_dir().join(format!("chat-relay-profile-{}-{}", std::process::id(), ts))
            }
        };
        std::fs::create_dir_all(&profile_dir)?;
        builder = builder
            .user_data_dir(profile_dir.clone())
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder.build().map_err(|e| anyhow::anyhow!(e))?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg).await?;
        tokio::spawn(async move {
            while let Some(_ev) = handler.next().await {}
        });
        let page = browser.new_page("about:blank").await?;
        if let Some(ua) = cfg.user_agent {
            page.set_user_agent(ua).await?;
        }
        Self::set_viewport(&page).await;
        info!(profile = %profile_dir.display(), "browser launched");
        Ok(Self { page, _browser: browser })
    }

    /// Attach to an already running Chrome over its DevTools websocket and
    /// reuse its first tab.
    pub async fn connect(ws_url: &str) -> Result<Self> {
        let (mut browser, mut handler) = OxideBrowser::connect(ws_url).await?;
        tokio::spawn(async move {
            while let Some(_ev) = handler.next().await {}
        });
        if let Err(e) = browser.fetch_targets().await {
            debug!(error = %e, "target discovery failed, relying on known pages");
        }
        sleep(Duration::from_millis(100)).await;
        let page = match browser.pages().await?.into_iter().next() {
            Some(page) => page,
            None => browser.new_page("about:blank").await?,
        };
        info!(ws_url, "connected to running browser");
        Ok(Self { page, _browser: browser })
    }

    async fn set_viewport(page: &Page) {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(VIEWPORT.0)
            .height(VIEWPORT.1)
            .device_scale_factor(1.0)
            .mobile(false)
            .build();
        match params {
            Ok(params) => {
                if let Err(e) = page.execute(params).await {
                    debug!(error = %e, "viewport override failed");
                }
            }
            Err(e) => debug!(error = %e, "viewport params invalid"),
        }
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    pub async fn goto(&self, url: &str) -> Result<()> {
        self.page.goto(url).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    pub async fn url(&self) -> Result<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    pub async fn move_mouse(&self, x: i64, y: i64) -> Result<()> {
        self.page.move_mouse(Point { x: x as f64, y: y as f64 }).await?;
        Ok(())
    }

    pub async fn type_text(&self, text: &str) -> Result<()> {
        // CDP Input.insertText feeds the focused element in one shot
        self.page
            .execute(InsertTextParams { text: text.to_string() })
            .await?;
        Ok(())
    }

    /// Evaluate `js`, awaiting a returned promise, and decode the value.
    pub async fn eval<T: DeserializeOwned>(&self, js: String) -> Result<T> {
        let eval = EvaluateParams::builder()
            .expression(js)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(|e| anyhow::anyhow!(e))?;
        let result = self.page.evaluate_expression(eval).await?;
        Ok(result.into_value::<T>()?)
    }
}

// ========================= Page scripts =========================

fn js_str(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".into())
}

/// Shared helpers for every turn-scoped script. A turn is addressed by its
/// ordinal among all turns plus the stable id read from it.
fn turn_prelude() -> String {
    format!(
        r#"
        const TURN = {turn}, ASSISTANT = {assistant}, AGENT = {agent}, MSG_ATTR = {msg_attr};
        const GEN_IMG = {gen_img}, IMG_BOX = {img_box};
        const turns = () => Array.from(document.querySelectorAll(TURN));
        const hasImage = (el) => !!(el.querySelector(GEN_IMG) || el.querySelector(IMG_BOX));
        const isReply = (el) => !!(el.querySelector(ASSISTANT) || el.matches(AGENT) || el.querySelector(AGENT) || hasImage(el));
        const stableId = (el) => {{
          const m = el.querySelector('[' + MSG_ATTR + ']');
          return (m && m.getAttribute(MSG_ATTR)) || el.getAttribute('data-testid') || '';
        }};
        const findTurn = (ordinal, id) => {{
          const el = turns()[ordinal];
          return el && isReply(el) && stableId(el) === id ? el : null;
        }};
        const visible = (el) => {{
          const r = el.getBoundingClientRect();
          const s = getComputedStyle(el);
          return r.width > 0 && r.height > 0 && s.visibility !== 'hidden' && s.display !== 'none';
        }};
        "#,
        turn = js_str(dom::TURN),
        assistant = js_str(dom::ASSISTANT_ROLE),
        agent = js_str(dom::AGENT_TURN),
        msg_attr = js_str(dom::MESSAGE_ID_ATTR),
        gen_img = js_str(dom::GENERATED_IMAGE),
        img_box = js_str(dom::IMAGE_CONTAINER),
    )
}

fn turn_script(signature: &TurnSignature, body: &str) -> String {
    format!(
        "(() => {{ {prelude}\nconst el = findTurn({ordinal}, {id});\n{body}\n}})()",
        prelude = turn_prelude(),
        ordinal = signature.ordinal_index,
        id = js_str(&signature.stable_id),
    )
}

/// Resolve the first visible element for `locator` and tag it with `handle`.
fn find_script(locator: &Locator, handle: &str) -> String {
    let locator = serde_json::to_string(locator).unwrap_or_else(|_| "null".into());
    format!(
        r#"(() => {{
          const loc = {locator};
          if (!loc) return false;
          const ok = (el) => el.matches('input[type=file]') || (() => {{
            const r = el.getBoundingClientRect();
            const s = getComputedStyle(el);
            return r.width > 0 && r.height > 0 && s.visibility !== 'hidden' && s.display !== 'none' && !el.disabled;
          }})();
          let found = null;
          if (loc.by === 'css') {{
            found = Array.from(document.querySelectorAll(loc.selector)).find(ok) || null;
          }} else {{
            found = Array.from(document.querySelectorAll(loc.tag))
              .find((el) => ok(el) && (el.innerText || '').includes(loc.pattern)) || null;
          }}
          if (!found) return false;
          found.setAttribute({attr}, {handle});
          return true;
        }})()"#,
        attr = js_str(HANDLE_ATTR),
        handle = js_str(handle),
    )
}

fn any_visible_script(locators: &[Locator]) -> String {
    let locators = serde_json::to_string(locators).unwrap_or_else(|_| "[]".into());
    format!(
        r#"(() => {{
          const vis = (el) => {{
            const r = el.getBoundingClientRect();
            const s = getComputedStyle(el);
            return r.width > 0 && r.height > 0 && s.visibility !== 'hidden' && s.display !== 'none';
          }};
          return {locators}.some((loc) => {{
            const els = loc.by === 'css'
              ? Array.from(document.querySelectorAll(loc.selector))
              : Array.from(document.querySelectorAll(loc.tag)).filter((el) => (el.innerText || '').includes(loc.pattern));
            return els.some(vis);
          }});
        }})()"#
    )
}

#[derive(Debug, Deserialize)]
struct RawTurn {
    ordinal: usize,
    stable_id: String,
    ready: bool,
    image: bool,
    text: String,
}

#[derive(Debug, Deserialize)]
struct RawFetch {
    ok: bool,
    #[serde(default)]
    status: u16,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    data: String,
}

// ========================= Chromium session =========================

pub struct ChromiumSession {
    browser: Browser,
    clipboard_granted: AtomicBool,
}

fn browser_err(e: impl std::fmt::Display) -> SessionError {
    SessionError::Browser(e.to_string())
}

fn script_err(e: impl std::fmt::Display) -> SessionError {
    SessionError::Script(e.to_string())
}

impl ChromiumSession {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self, SessionError> {
        let browser = Browser::launch(cfg).await.map_err(browser_err)?;
        Ok(Self::new(browser))
    }

    pub async fn connect(ws_url: &str) -> Result<Self, SessionError> {
        let browser = Browser::connect(ws_url).await.map_err(browser_err)?;
        Ok(Self::new(browser))
    }

    pub fn new(browser: Browser) -> Self {
        Self { browser, clipboard_granted: AtomicBool::new(false) }
    }

    async fn eval<T: DeserializeOwned>(&self, js: String) -> Result<T, SessionError> {
        self.browser.eval(js).await.map_err(script_err)
    }

    async fn element(&self, handle: &ElementHandle) -> Result<Element, SessionError> {
        let selector = format!("[{HANDLE_ATTR}=\"{}\"]", handle.id);
        self.browser.page().find_element(selector).await.map_err(browser_err)
    }

    async fn grant_clipboard(&self) {
        if self.clipboard_granted.load(Ordering::Relaxed) {
            return;
        }
        let mut params = GrantPermissionsParams::new(vec![
            PermissionType::ClipboardReadWrite,
            PermissionType::ClipboardSanitizedWrite,
        ]);
        params.origin = self.browser.url().await.ok().and_then(|u| origin_of(&u));
        match self.browser.page().execute(params).await {
            Ok(_) => self.clipboard_granted.store(true, Ordering::Relaxed),
            Err(e) => debug!(error = %e, "clipboard permission grant failed"),
        }
    }

    async fn poll_visible(&self, locators: &[Locator], want: bool, timeout: Duration) -> Result<bool, SessionError> {
        let deadline = Instant::now() + timeout;
        let js = any_visible_script(locators);
        loop {
            let visible: bool = self.eval(js.clone()).await?;
            if visible == want {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(FIND_POLL).await;
        }
    }
}

fn origin_of(url: &str) -> Option<String> {
    let (scheme, rest) = url.split_once("://")?;
    let host = rest.split('/').next()?;
    Some(format!("{scheme}://{host}"))
}

fn decode_data_url(data: &str) -> Result<Vec<u8>, SessionError> {
    let (_, payload) = data
        .split_once(',')
        .ok_or_else(|| script_err("fetch did not return a data URL"))?;
    STANDARD.decode(payload).map_err(script_err)
}

#[async_trait]
impl Session for ChromiumSession {
    async fn latest_reply_turn(&self) -> Result<Option<TurnSnapshot>, SessionError> {
        let js = format!(
            r#"(() => {{ {prelude}
              const all = turns();
              const md = {markdown}, copy = {copy};
              for (let i = all.length - 1; i >= 0; i--) {{
                const el = all[i];
                if (!isReply(el)) continue;
                const body = el.querySelector(md);
                return {{
                  ordinal: i,
                  stable_id: stableId(el),
                  ready: !!el.querySelector(copy),
                  image: hasImage(el),
                  text: ((body ? body.innerText : el.innerText) || '').trim(),
                }};
              }}
              return null;
            }})()"#,
            prelude = turn_prelude(),
            markdown = js_str(dom::MARKDOWN),
            copy = js_str(dom::COPY_CONTROL),
        );
        let raw: Option<RawTurn> = self.eval(js).await?;
        Ok(raw.map(|t| TurnSnapshot::new(TurnSignature::new(t.ordinal, t.stable_id), t.ready, t.image, t.text)))
    }

    async fn count_reply_turns(&self) -> Result<usize, SessionError> {
        let js = format!("(() => {{ {} return turns().filter(isReply).length; }})()", turn_prelude());
        self.eval(js).await
    }

    async fn find(&self, locator: &Locator, timeout: Duration) -> Result<Option<ElementHandle>, SessionError> {
        let id = nanoid!(10);
        let js = find_script(locator, &id);
        let deadline = Instant::now() + timeout;
        loop {
            let found: bool = self.eval(js.clone()).await?;
            if found {
                return Ok(Some(ElementHandle { id, locator: locator.clone() }));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(FIND_POLL).await;
        }
    }

    async fn click(&self, handle: &ElementHandle) -> Result<(), SessionError> {
        let el = self.element(handle).await?;
        el.scroll_into_view().await.map_err(browser_err)?;
        el.click().await.map_err(browser_err)?;
        Ok(())
    }

    async fn insert_text(&self, handle: &ElementHandle, text: &str) -> Result<(), SessionError> {
        let el = self.element(handle).await?;
        el.focus().await.map_err(browser_err)?;
        self.browser.type_text(text).await.map_err(browser_err)
    }

    async fn press_enter(&self, handle: &ElementHandle) -> Result<(), SessionError> {
        let el = self.element(handle).await?;
        el.press_key("Enter").await.map_err(browser_err)?;
        Ok(())
    }

    async fn attach_files(&self, handle: &ElementHandle, paths: &[PathBuf]) -> Result<(), SessionError> {
        let el = self.element(handle).await?;
        let files = paths
            .iter()
            .map(|p| std::fs::canonicalize(p).map(|p| p.display().to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        let mut params = SetFileInputFilesParams::new(files);
        params.backend_node_id = Some(el.backend_node_id);
        self.browser.page().execute(params).await.map_err(browser_err)?;
        Ok(())
    }

    async fn read_clipboard(&self) -> Result<String, SessionError> {
        self.grant_clipboard().await;
        self.eval("(async () => { window.focus(); return await navigator.clipboard.readText(); })()".to_string())
            .await
    }

    async fn wait_visible(&self, locators: &[Locator], timeout: Duration) -> Result<bool, SessionError> {
        self.poll_visible(locators, true, timeout).await
    }

    async fn wait_hidden(&self, locators: &[Locator], timeout: Duration) -> Result<bool, SessionError> {
        self.poll_visible(locators, false, timeout).await
    }

    async fn click_control_in_turn(&self, signature: &TurnSignature, control: TurnControl) -> Result<bool, SessionError> {
        let selector = match control {
            TurnControl::Copy => dom::COPY_CONTROL,
        };
        let id = nanoid!(10);
        let js = turn_script(
            signature,
            &format!(
                "if (!el) return false;\n\
                 const btns = Array.from(el.querySelectorAll({sel}));\n\
                 const btn = btns[btns.length - 1];\n\
                 if (!btn) return false;\n\
                 btn.setAttribute({attr}, {id});\n\
                 return true;",
                sel = js_str(selector),
                attr = js_str(HANDLE_ATTR),
                id = js_str(&id),
            ),
        );
        let tagged: bool = self.eval(js).await?;
        if !tagged {
            return Ok(false);
        }
        let handle = ElementHandle { id, locator: Locator::css(selector) };
        self.click(&handle).await?;
        Ok(true)
    }

    async fn turn_text(&self, signature: &TurnSignature) -> Result<Option<String>, SessionError> {
        let js = turn_script(
            signature,
            &format!(
                "if (!el) return null;\n\
                 const body = el.querySelector({md});\n\
                 return ((body ? body.innerText : el.innerText) || '').trim();",
                md = js_str(dom::MARKDOWN),
            ),
        );
        self.eval(js).await
    }

    async fn turn_captions(&self, signature: &TurnSignature) -> Result<Vec<String>, SessionError> {
        let js = turn_script(
            signature,
            &format!(
                "if (!el) return [];\n\
                 return Array.from(el.querySelectorAll({cap}))\n\
                   .map((n) => (n.innerText || '').trim())\n\
                   .filter((t) => t.length > 0);",
                cap = js_str(dom::CAPTION),
            ),
        );
        self.eval(js).await
    }

    async fn image_candidates(&self, signature: &TurnSignature) -> Result<Vec<ImageCandidate>, SessionError> {
        let js = turn_script(
            signature,
            "if (!el) return [];\n\
             return Array.from(el.querySelectorAll('img')).map((img) => ({\n\
               src: img.currentSrc || img.src || '',\n\
               alt: img.alt || '',\n\
               source: img.matches(GEN_IMG) ? 'generated_marker' : (img.closest(IMG_BOX) ? 'container' : 'other'),\n\
               width: img.naturalWidth || img.width || 0,\n\
             }));",
        );
        self.eval(js).await
    }

    async fn fetch_with_session_auth(&self, url: &str) -> Result<FetchedBytes, SessionError> {
        let js = format!(
            r#"(async () => {{
              const r = await fetch({url}, {{ credentials: 'include' }});
              if (!r.ok) return {{ ok: false, status: r.status }};
              const blob = await r.blob();
              const data = await new Promise((resolve, reject) => {{
                const fr = new FileReader();
                fr.onload = () => resolve(fr.result);
                fr.onerror = () => reject(fr.error);
                fr.readAsDataURL(blob);
              }});
              return {{ ok: true, status: r.status, content_type: blob.type || null, data }};
            }})()"#,
            url = js_str(url),
        );
        let raw: RawFetch = self.eval(js).await?;
        if !raw.ok {
            return Err(SessionError::Browser(format!("in-page fetch returned status {}", raw.status)));
        }
        let bytes = decode_data_url(&raw.data)?;
        Ok(FetchedBytes { bytes, content_type: raw.content_type })
    }

    async fn current_url(&self) -> Result<String, SessionError> {
        self.browser.url().await.map_err(browser_err)
    }

    async fn navigate(&self, url: &str) -> Result<(), SessionError> {
        self.browser.goto(url).await.map_err(browser_err)
    }

    async fn thread_links(&self) -> Result<Vec<ThreadLink>, SessionError> {
        let selectors: Vec<String> = selectors::sidebar_thread_links()
            .into_iter()
            .filter_map(|l| match l {
                Locator::Css { selector } => Some(selector),
                Locator::Text { .. } => None,
            })
            .collect();
        let js = format!(
            r#"(() => Array.from(document.querySelectorAll({sel})).map((a) => ({{
              href: a.getAttribute('href') || '',
              title: (a.innerText || '').trim(),
            }})))()"#,
            sel = js_str(&selectors.join(", ")),
        );
        self.eval(js).await
    }

    async fn idle_motion(&self) -> Result<(), SessionError> {
        let (x, y) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(100..VIEWPORT.0 - 100), rng.gen_range(100..VIEWPORT.1 - 100))
        };
        self.browser.move_mouse(x, y).await.map_err(browser_err)
    }
}
