use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Heartbeat silence beyond this evicts a provider from the registry.
    pub provider_ttl: Duration,
    pub sweep_interval: Duration,
    /// How long a READY session may sit unattached before it is reclaimed.
    pub session_idle_ttl: Duration,
    pub session_reap_interval: Duration,
    /// Timeout for dialing a provider's terminal endpoint.
    pub dial_timeout: Duration,
    /// Short-class forwards: start/stop/file I/O.
    pub control_timeout: Duration,
    /// System info probes.
    pub info_timeout: Duration,
    /// Container creation (may pull layers on the provider side).
    pub create_timeout: Duration,
    /// Image pulls.
    pub pull_timeout: Duration,
    /// Honor X-Forwarded-For as the heartbeat origin. Only enable behind a
    /// trusted proxy.
    pub trust_forwarded_for: bool,
    /// Allow a session token to be re-attached after a clean client detach.
    pub session_reuse: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("WHARF_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            provider_ttl: secs_from_env("WHARF_PROVIDER_TTL", 30),
            sweep_interval: secs_from_env("WHARF_SWEEP_INTERVAL", 10),
            session_idle_ttl: secs_from_env("WHARF_SESSION_IDLE_TTL", 60),
            session_reap_interval: secs_from_env("WHARF_SESSION_REAP_INTERVAL", 15),
            dial_timeout: secs_from_env("WHARF_DIAL_TIMEOUT", 5),
            control_timeout: secs_from_env("WHARF_CONTROL_TIMEOUT", 5),
            info_timeout: secs_from_env("WHARF_INFO_TIMEOUT", 3),
            create_timeout: secs_from_env("WHARF_CREATE_TIMEOUT", 10),
            pull_timeout: secs_from_env("WHARF_PULL_TIMEOUT", 15),
            trust_forwarded_for: truthy_from_env("WHARF_TRUST_FORWARDED_FOR"),
            session_reuse: truthy_from_env("WHARF_SESSION_REUSE"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            provider_ttl: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            session_idle_ttl: Duration::from_secs(60),
            session_reap_interval: Duration::from_secs(15),
            dial_timeout: Duration::from_secs(5),
            control_timeout: Duration::from_secs(5),
            info_timeout: Duration::from_secs(3),
            create_timeout: Duration::from_secs(10),
            pull_timeout: Duration::from_secs(15),
            trust_forwarded_for: false,
            session_reuse: false,
        }
    }
}

fn secs_from_env(key: &str, default: u64) -> Duration {
    Duration::from_secs(
        env::var(key)
            .ok()
            .and_then(|val| val.parse().ok())
            .unwrap_or(default),
    )
}

fn truthy_from_env(key: &str) -> bool {
    env::var(key)
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false)
}
