pub mod browser;
pub mod completion;
pub mod config;
pub mod error;
pub mod exchange;
pub mod extract;
pub mod images;
pub mod selectors;
pub mod session;
pub mod tools;
pub mod turn;
pub mod worker;

pub use browser::{Browser, BrowserConfig, ChromiumSession};
pub use config::RelayConfig;
pub use error::{ExchangeError, SessionError};
pub use exchange::{ChatRelay, ExchangeRequest, ExtractedResponse, ThreadInfo};
pub use session::Session;
pub use worker::{RelayHandle, RelayWorker};
