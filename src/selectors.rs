//! Ordered fallback locators for every UI affordance the relay touches.
//!
//! Each list is tried front to back by [`crate::session::probe_first_match`];
//! when the target application changes its markup only this file moves.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum Locator {
    Css { selector: String },
    /// First element of `tag` whose visible text contains `pattern`.
    Text { tag: String, pattern: String },
}

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Locator::Css { selector: selector.into() }
    }

    pub fn text(tag: impl Into<String>, pattern: impl Into<String>) -> Self {
        Locator::Text { tag: tag.into(), pattern: pattern.into() }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Css { selector } => write!(f, "css({selector})"),
            Locator::Text { tag, pattern } => write!(f, "text({tag}~{pattern:?})"),
        }
    }
}

fn css_list(selectors: &[&str]) -> Vec<Locator> {
    selectors.iter().map(|s| Locator::css(*s)).collect()
}

pub fn chat_input() -> Vec<Locator> {
    css_list(&[
        "#prompt-textarea",
        "div[contenteditable='true'][id='prompt-textarea']",
        "div[contenteditable='true']",
    ])
}

pub fn send_button() -> Vec<Locator> {
    css_list(&[
        "button[data-testid='send-button']",
        "button[aria-label='Send prompt']",
        "#prompt-textarea ~ button",
    ])
}

/// Visible only while a reply is being generated.
pub fn busy_indicator() -> Vec<Locator> {
    css_list(&[
        "button[data-testid='stop-button']",
        "button[aria-label='Stop generating']",
        "button.stop-button",
    ])
}

pub fn file_input() -> Vec<Locator> {
    css_list(&[
        "input[type='file']",
        "input[data-testid='file-upload']",
        "input[accept*='image']",
        "input[accept*='application']",
    ])
}

pub fn sidebar_thread_links() -> Vec<Locator> {
    css_list(&["nav a[href^='/c/']", "a[href^='/c/']"])
}

pub fn login_indicators() -> Vec<Locator> {
    vec![
        Locator::css("button[data-testid='login-button']"),
        Locator::text("button", "Log in"),
    ]
}

/// Selectors evaluated inside the page to classify turns. These are only
/// consumed by the Chromium adapter's query scripts.
pub mod dom {
    pub const TURN: &str = "article";
    pub const ASSISTANT_ROLE: &str = "[data-message-author-role='assistant']";
    pub const AGENT_TURN: &str = ".agent-turn";
    pub const MESSAGE_ID_ATTR: &str = "data-message-id";
    pub const GENERATED_IMAGE: &str = "img[alt='Generated image']";
    pub const IMAGE_CONTAINER: &str = "div[id^='image-'], div[class*='imagegen-image']";
    pub const COPY_CONTROL: &str =
        "button[data-testid='copy-turn-action-button'], button[aria-label='Copy']";
    pub const MARKDOWN: &str = ".markdown, .prose";
    pub const CAPTION: &str = "button, span.text-token-text-tertiary";
}
