use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::interactive::delivery::DeliveryOutcome;

pub const DEFAULT_API_URL: &str = "http://localhost:8080";
pub const DEFAULT_INTERACTIVE_PORT: u16 = 3721;
pub const DEFAULT_FALLBACK_PORTS: [u16; 9] = [3722, 3723, 3724, 3725, 3726, 3727, 3728, 3729, 3730];
pub const DEFAULT_SELECTION_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_NOTIFY_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_SESSION_TTL_SECS: u64 = 300;
pub const DEFAULT_ENV_FETCH_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_NOTIFY_HOSTS: &str = "codebuddy";

/// Wait bounds for an environment selection round trip.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InteractionTimeouts {
    /// Used when a browser page was opened (or at least attempted).
    pub selection: Duration,
    /// Used when only a push notification went out and nobody may ever see a page.
    pub notify: Duration,
}

impl Default for InteractionTimeouts {
    fn default() -> Self {
        Self {
            selection: Duration::from_secs(DEFAULT_SELECTION_TIMEOUT_SECS),
            notify: Duration::from_secs(DEFAULT_NOTIFY_TIMEOUT_SECS),
        }
    }
}

impl InteractionTimeouts {
    pub fn for_outcome(&self, outcome: DeliveryOutcome) -> Duration {
        if outcome.is_notification_only() {
            self.notify
        } else {
            self.selection
        }
    }
}

#[derive(Clone, Debug)]
pub struct InteractiveConfig {
    pub host: IpAddr,
    /// Ordered bind candidates: preferred port first, then fallbacks. `0` = ephemeral.
    pub ports: Vec<u16>,
    pub timeouts: InteractionTimeouts,
    pub session_ttl: Duration,
    pub stop_timeout: Duration,
}

impl Default for InteractiveConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ports: candidate_ports(DEFAULT_INTERACTIVE_PORT, &DEFAULT_FALLBACK_PORTS),
            timeouts: InteractionTimeouts::default(),
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
            stop_timeout: Duration::from_secs(DEFAULT_STOP_TIMEOUT_SECS),
        }
    }
}

impl InteractiveConfig {
    /// Ephemeral-port config for tests and embedded use.
    pub fn ephemeral() -> Self {
        Self {
            ports: vec![0],
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub api_url: String,
    pub no_auth: bool,
    pub explicit_token: Option<String>,
    /// Explicit environment id; takes priority over cache and interactive selection.
    pub env_id: Option<String>,
    /// Identity tag of the client application driving the tool calls.
    pub host_integration: Option<String>,
    /// Host tags that receive push notifications instead of a browser window.
    pub notify_hosts: Vec<String>,
    pub plugins_enabled: Option<String>,
    pub plugins_disabled: Option<String>,
    pub env_fetch_timeout: Duration,
    pub auto_select_single_env: bool,
    pub interactive: InteractiveConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            no_auth: false,
            explicit_token: None,
            env_id: None,
            host_integration: None,
            notify_hosts: parse_name_list(DEFAULT_NOTIFY_HOSTS),
            plugins_enabled: None,
            plugins_disabled: None,
            env_fetch_timeout: Duration::from_secs(DEFAULT_ENV_FETCH_TIMEOUT_SECS),
            auto_select_single_env: true,
            interactive: InteractiveConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Whether the configured host integration declared push-notification delivery.
    pub fn uses_push_notifications(&self) -> bool {
        let Some(host) = self.host_integration.as_deref() else {
            return false;
        };
        let host = host.trim().to_ascii_lowercase();
        !host.is_empty() && self.notify_hosts.iter().any(|candidate| *candidate == host)
    }
}

/// Preferred port first, then fallbacks in order, without duplicates.
pub fn candidate_ports(preferred: u16, fallbacks: &[u16]) -> Vec<u16> {
    let mut ports = vec![preferred];
    for port in fallbacks {
        if !ports.contains(port) {
            ports.push(*port);
        }
    }
    ports
}

/// Split a comma/whitespace separated list into lowercase names.
pub fn parse_name_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_ascii_lowercase)
        .collect()
}

pub(crate) fn non_empty(raw: Option<String>) -> Option<String> {
    raw.map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
