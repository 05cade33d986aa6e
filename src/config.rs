use std::env;
use std::path::PathBuf;
use std::time::Duration;

fn env_ms(key: &str, default_ms: u64) -> Duration {
    let ms = env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default_ms);
    Duration::from_millis(ms)
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub base_url: String,         // e.g. "https://chatgpt.com"
    pub images_dir: PathBuf,      // env IMAGES_DIR
    pub timings: Timings,
    pub transient: TransientFilterConfig,
    /// Try extraction even when no completion signal fired.
    pub best_effort_on_timeout: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            base_url: env::var("CHAT_URL").unwrap_or_else(|_| "https://chatgpt.com".into()),
            images_dir: env::var("IMAGES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("downloads/images")),
            timings: Timings::default(),
            transient: TransientFilterConfig::default(),
            best_effort_on_timeout: env_flag("BEST_EFFORT_ON_TIMEOUT", false),
        }
    }
}

/// Every bound and poll interval used while waiting on the page.
#[derive(Clone, Debug)]
pub struct Timings {
    pub response_timeout: Duration,
    pub turn_appear_timeout: Duration,
    pub selector_timeout: Duration,
    pub turn_poll: Duration,
    pub completion_poll: Duration,
    /// Upper bound for the structural-readiness strategy inside the overall budget.
    pub structural_window: Duration,
    pub image_settle: Duration,
    pub busy_appear_timeout: Duration,
    pub busy_hidden_step: Duration,
    pub busy_confirm_window: Duration,
    pub stable_reads: usize,
    pub heartbeat: Duration,
    pub copy_settle: Duration,
    pub text_retry_attempts: usize,
    pub attachment_settle: Duration,
    pub attachment_settle_per_extra: Duration,
    pub navigation_settle: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            response_timeout: env_ms("RESPONSE_TIMEOUT", 120_000),
            turn_appear_timeout: env_ms("TURN_APPEAR_TIMEOUT", 30_000),
            selector_timeout: env_ms("SELECTOR_TIMEOUT", 2_000),
            turn_poll: Duration::from_millis(500),
            completion_poll: Duration::from_secs(1),
            structural_window: Duration::from_secs(60),
            image_settle: Duration::from_secs(2),
            busy_appear_timeout: Duration::from_secs(15),
            busy_hidden_step: Duration::from_secs(10),
            busy_confirm_window: Duration::from_secs(2),
            stable_reads: 5,
            heartbeat: Duration::from_secs(10),
            copy_settle: Duration::from_millis(800),
            text_retry_attempts: 5,
            attachment_settle: Duration::from_secs(3),
            attachment_settle_per_extra: Duration::from_secs(1),
            navigation_settle: Duration::from_secs(3),
        }
    }
}

impl Timings {
    /// Settle delay after attaching `count` files.
    pub fn attachment_settle_for(&self, count: usize) -> Duration {
        if count == 0 {
            return Duration::ZERO;
        }
        self.attachment_settle + self.attachment_settle_per_extra * (count as u32 - 1)
    }
}

/// Keyword/length policy for interim status banners ("Thinking…").
#[derive(Clone, Debug)]
pub struct TransientFilterConfig {
    pub keywords: Vec<String>,
    pub max_len: usize,
}

impl Default for TransientFilterConfig {
    fn default() -> Self {
        let keywords = [
            "thinking",
            "searching",
            "analyzing",
            "analysing",
            "please wait",
            "reasoning",
            "generating",
            "creating image",
            "working on it",
            "one moment",
        ];
        Self {
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            max_len: 240,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_settle_grows_per_file() {
        let t = Timings::default();
        assert_eq!(t.attachment_settle_for(0), Duration::ZERO);
        assert_eq!(t.attachment_settle_for(1), Duration::from_secs(3));
        assert_eq!(t.attachment_settle_for(3), Duration::from_secs(5));
    }

    #[test]
    fn defaults_match_documented_bounds() {
        let t = Timings::default();
        assert_eq!(t.stable_reads, 5);
        assert_eq!(t.busy_appear_timeout, Duration::from_secs(15));
        assert_eq!(TransientFilterConfig::default().max_len, 240);
    }
}
