// =============================================================================
// Alert sink — best-effort messenger push with duplicate collapsing
// =============================================================================
//
// Safe to call from any task: sends are fire-and-forget (spawned), failures
// are logged and never propagate to the caller. Every alert carries a stable
// key; identical keys inside the cooldown window are suppressed so a flapping
// condition cannot flood the channel.
//
// Without a configured bot token the sink degrades to structured logging,
// which is what shadow mode and tests run with.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::types::Severity;

/// Default suppression window for repeated identical alerts.
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30 * 60);

pub struct Alerter {
    bot_token: Option<String>,
    chat_id: Option<String>,
    client: reqwest::Client,
    cooldown: Duration,
    last_sent: Mutex<HashMap<String, Instant>>,
}

impl Alerter {
    /// Build from environment (`MERIDIAN_BOT_TOKEN`, `MERIDIAN_CHAT_ID`).
    pub fn from_env() -> Self {
        let bot_token = std::env::var("MERIDIAN_BOT_TOKEN").ok().filter(|s| !s.is_empty());
        let chat_id = std::env::var("MERIDIAN_CHAT_ID").ok().filter(|s| !s.is_empty());

        if bot_token.is_none() {
            info!("no messenger token configured — alerts go to the log only");
        }

        Self::new(bot_token, chat_id, DEFAULT_COOLDOWN)
    }

    pub fn new(bot_token: Option<String>, chat_id: Option<String>, cooldown: Duration) -> Self {
        Self {
            bot_token,
            chat_id,
            client: reqwest::Client::new(),
            cooldown,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Log-only sink used by tests and shadow bootstrap.
    pub fn disabled() -> Self {
        Self::new(None, None, DEFAULT_COOLDOWN)
    }

    // -------------------------------------------------------------------------
    // Sending
    // -------------------------------------------------------------------------

    /// Send an unkeyed alert. Delivery is best-effort.
    pub fn send(&self, text: &str, severity: Severity) {
        self.dispatch(text, severity);
    }

    /// Send an alert under a stable `key`. A second alert with the same key
    /// inside the cooldown window is suppressed.
    ///
    /// Returns `true` when the alert was dispatched, `false` when suppressed.
    pub fn send_keyed(&self, key: &str, text: &str, severity: Severity) -> bool {
        {
            let mut last = self.last_sent.lock();
            if let Some(at) = last.get(key) {
                if at.elapsed() < self.cooldown {
                    debug!(key, "alert suppressed inside cooldown");
                    return false;
                }
            }
            last.insert(key.to_string(), Instant::now());
        }
        self.dispatch(text, severity);
        true
    }

    pub fn send_critical(&self, key: &str, text: &str) -> bool {
        self.send_keyed(key, text, Severity::Critical)
    }

    fn dispatch(&self, text: &str, severity: Severity) {
        match severity {
            Severity::Info => info!(alert = %text, "alert"),
            Severity::Warning => warn!(alert = %text, "alert"),
            Severity::Critical => error!(alert = %text, "CRITICAL alert"),
        }

        let (Some(token), Some(chat_id)) = (self.bot_token.clone(), self.chat_id.clone()) else {
            return;
        };

        let client = self.client.clone();
        let body = format!("[{severity}] {text}");
        tokio::spawn(async move {
            let url = format!("https://api.telegram.org/bot{token}/sendMessage");
            let result = client
                .post(&url)
                .form(&[("chat_id", chat_id.as_str()), ("text", body.as_str())])
                .timeout(Duration::from_secs(5))
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => warn!(status = %resp.status(), "alert push rejected"),
                Err(e) => warn!(error = %e, "alert push failed"),
            }
        });
    }
}

impl std::fmt::Debug for Alerter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Alerter")
            .field("bot_token", &self.bot_token.as_ref().map(|_| "<redacted>"))
            .field("chat_id", &self.chat_id.as_ref().map(|_| "<redacted>"))
            .field("cooldown", &self.cooldown)
            .finish()
    }
}
