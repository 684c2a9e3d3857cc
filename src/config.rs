//! Service configuration
//!
//! Every setting is environment-overridable with the defaults the service
//! ships with. The `send_url` template is configuration, never persisted
//! state: it is resolved once when a send task is created.

use std::collections::HashMap;

/// Runtime configuration for the broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub db_path: String,
    pub port: u16,
    /// Default inactivity budget for bot sessions (minutes).
    pub bot_max_inactive_minutes: i64,
    /// Default inactivity budget for human sessions (minutes).
    pub human_max_inactive_minutes: i64,
    /// How long a PENDING session may wait for its first send confirmation.
    pub pending_grace_seconds: i64,
    /// Silence gap after which an inbound batch opens a fresh session.
    pub session_gap_minutes: i64,
    /// Cadence of the queue reconciliation scan.
    pub reconcile_interval_seconds: u64,
    /// Cadence of the session reaper.
    pub reap_interval_seconds: u64,
    /// Look-back window when matching account messages to send tasks.
    pub intervention_window_minutes: i64,
    /// Human-notification endpoint; unset means deliveries are skipped.
    pub notifier_endpoint: Option<String>,
    /// Per-platform chat URL templates with a `{shop_id}` placeholder.
    pub send_url_templates: HashMap<String, String>,
}

impl BrokerConfig {
    pub fn from_env() -> Self {
        Self {
            db_path: std::env::var("PARLEY_DB_PATH").unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                format!("{home}/.parley/parley.db")
            }),
            port: env_parsed("PARLEY_PORT", 8000),
            bot_max_inactive_minutes: env_parsed("PARLEY_BOT_MAX_INACTIVE_MINUTES", 60),
            human_max_inactive_minutes: env_parsed("PARLEY_HUMAN_MAX_INACTIVE_MINUTES", 480),
            pending_grace_seconds: env_parsed("PARLEY_PENDING_GRACE_SECONDS", 60),
            session_gap_minutes: env_parsed("PARLEY_SESSION_GAP_MINUTES", 30),
            reconcile_interval_seconds: env_parsed("PARLEY_RECONCILE_INTERVAL_SECONDS", 30),
            reap_interval_seconds: env_parsed("PARLEY_REAP_INTERVAL_SECONDS", 30),
            intervention_window_minutes: env_parsed("PARLEY_INTERVENTION_WINDOW_MINUTES", 10),
            notifier_endpoint: std::env::var("PARLEY_NOTIFIER_ENDPOINT").ok(),
            send_url_templates: send_url_templates_from_env(),
        }
    }

    /// Default inactivity budget by session category.
    pub fn default_max_inactive_minutes(&self, is_bot: bool) -> i64 {
        if is_bot {
            self.bot_max_inactive_minutes
        } else {
            self.human_max_inactive_minutes
        }
    }

    /// Deterministic chat URL for a `(platform, shop)` pair.
    pub fn send_url(&self, platform: &str, shop_id: &str) -> String {
        let template = self
            .send_url_templates
            .get(platform)
            .map_or(GENERIC_SEND_URL_TEMPLATE, String::as_str);
        template.replace("{shop_id}", shop_id)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            db_path: ":memory:".to_string(),
            port: 8000,
            bot_max_inactive_minutes: 60,
            human_max_inactive_minutes: 480,
            pending_grace_seconds: 60,
            session_gap_minutes: 30,
            reconcile_interval_seconds: 30,
            reap_interval_seconds: 30,
            intervention_window_minutes: 10,
            notifier_endpoint: None,
            send_url_templates: builtin_templates(),
        }
    }
}

const GENERIC_SEND_URL_TEMPLATE: &str = "https://chat.example.com/shops/{shop_id}";

fn builtin_templates() -> HashMap<String, String> {
    HashMap::from([
        (
            "taobao".to_string(),
            "https://amos.alicdn.com/getcid.aw?groupid=0&s=1&charset=utf-8&uid={shop_id}".to_string(),
        ),
        (
            "jd".to_string(),
            "https://chat.jd.com/chat/index.action?venderId={shop_id}".to_string(),
        ),
    ])
}

/// Built-in templates plus any `PARLEY_SEND_URL_TEMPLATE_<PLATFORM>` overrides.
fn send_url_templates_from_env() -> HashMap<String, String> {
    let mut templates = builtin_templates();
    for (key, value) in std::env::vars() {
        if let Some(platform) = key.strip_prefix("PARLEY_SEND_URL_TEMPLATE_") {
            templates.insert(platform.to_lowercase(), value);
        }
    }
    templates
}

fn env_parsed<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_url_substitutes_shop_id() {
        let config = BrokerConfig::default();
        let url = config.send_url("jd", "42");
        assert_eq!(url, "https://chat.jd.com/chat/index.action?venderId=42");
    }

    #[test]
    fn unknown_platform_falls_back_to_generic_template() {
        let config = BrokerConfig::default();
        assert_eq!(
            config.send_url("pdd", "shop-9"),
            "https://chat.example.com/shops/shop-9"
        );
    }

    #[test]
    fn inactivity_default_splits_by_category() {
        let config = BrokerConfig::default();
        assert_eq!(config.default_max_inactive_minutes(true), 60);
        assert_eq!(config.default_max_inactive_minutes(false), 480);
    }
}
