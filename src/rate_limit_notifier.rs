use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const DEFAULT_NOTIFY_INTERVAL_SECS: u64 = 60;

static RATE_LIMIT_NOTIFIER: Lazy<RateLimitNotifier> = Lazy::new(RateLimitNotifier::new);

pub fn notify_rate_limit(context: &str, detail: &str) {
    RATE_LIMIT_NOTIFIER.notify(context, detail);
}

struct RateLimitNotifier {
    market_name: String,
    interval: Duration,
    last_sent: Mutex<HashMap<String, Instant>>,
}

impl RateLimitNotifier {
    fn new() -> Self {
        let market_name = std::env::var("FUNDCARRY_BASE").unwrap_or_default();
        let interval = std::env::var("RATE_LIMIT_NOTIFY_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_NOTIFY_INTERVAL_SECS);
        Self {
            market_name,
            interval: Duration::from_secs(interval),
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// One warning per context per interval; repeats inside the window go to debug.
    fn should_send(&self, context: &str, now: Instant) -> bool {
        let mut last_sent = match self.last_sent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match last_sent.get(context) {
            Some(at) if now.saturating_duration_since(*at) < self.interval => false,
            _ => {
                last_sent.insert(context.to_string(), now);
                true
            }
        }
    }

    fn notify(&self, context: &str, detail: &str) {
        if !self.should_send(context, Instant::now()) {
            log::debug!("[RateLimit] suppressed repeat for '{}': {}", context, detail);
            return;
        }
        if self.market_name.is_empty() {
            log::warn!(
                "[RateLimit] HTTP 429 Too Many Requests while {} (detail: {})",
                context,
                detail
            );
        } else {
            log::warn!(
                "[RateLimit][{}] HTTP 429 Too Many Requests while {} (detail: {})",
                self.market_name,
                context,
                detail
            );
        }
    }
}
