use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::ApiError;
use crate::protocol::{HeartbeatRequest, ProviderStatus, ProviderView};

/// Liveness record for a single provider node.
#[derive(Debug, Clone)]
pub struct ProviderRecord {
    pub provider_id: String,
    pub provider_name: String,
    pub ip: IpAddr,
    pub port: u16,
    pub status: ProviderStatus,
    /// Monotonic clock for expiry arithmetic; never regressed.
    pub last_seen: Instant,
    /// Wall-clock twin of `last_seen`, reported to clients (ms since epoch).
    pub last_heartbeat_ms: i64,
    /// Set on the first report, immutable afterwards.
    pub registered_at: DateTime<Utc>,
}

impl ProviderRecord {
    pub fn view(&self) -> ProviderView {
        ProviderView {
            provider_id: self.provider_id.clone(),
            provider_name: self.provider_name.clone(),
            ip: self.ip.to_string(),
            port: self.port,
            status: self.status,
            last_heartbeat: self.last_heartbeat_ms,
            registered_at: self.registered_at,
        }
    }
}

/// In-process registry of provider liveness. The router only reads it; a
/// provider whose heartbeat has lapsed but not yet been swept is still
/// returned by `lookup` — unreachability is discovered by the forward itself.
pub struct ProviderRegistry {
    providers: DashMap<String, ProviderRecord>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: DashMap::new(),
        }
    }

    /// Record a liveness report. Re-registration updates every mutable field
    /// in place but preserves `registered_at`. Returns the ACK timestamp.
    pub fn register_heartbeat(
        &self,
        req: &HeartbeatRequest,
        origin: IpAddr,
    ) -> Result<i64, ApiError> {
        let provider_id = match req.provider_id.as_deref() {
            Some(id) if !id.trim().is_empty() => id.to_string(),
            _ => return Err(ApiError::Validation("providerID is required".into())),
        };
        let port = match req.port {
            Some(p) if p != 0 => p,
            _ => return Err(ApiError::Validation("port is required".into())),
        };

        let ip = canonical_ip(origin);
        let now = Instant::now();
        let now_ms = Utc::now().timestamp_millis();

        match self.providers.entry(provider_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.provider_name = req.provider_name.clone().unwrap_or_default();
                record.ip = ip;
                record.port = port;
                record.status = req.status;
                // An out-of-order report must never move the clock backwards.
                if now > record.last_seen {
                    record.last_seen = now;
                    record.last_heartbeat_ms = record.last_heartbeat_ms.max(now_ms);
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                info!(provider = %provider_id, %ip, port, "provider registered");
                entry.insert(ProviderRecord {
                    provider_id,
                    provider_name: req.provider_name.clone().unwrap_or_default(),
                    ip,
                    port,
                    status: req.status,
                    last_seen: now,
                    last_heartbeat_ms: now_ms,
                    registered_at: Utc::now(),
                });
            }
        }

        Ok(now_ms)
    }

    /// Pure read; no side effects on the record.
    pub fn lookup(&self, provider_id: &str) -> Option<ProviderRecord> {
        self.providers.get(provider_id).map(|r| r.clone())
    }

    /// `lookup` for the forwarding path: an unknown provider fails fast,
    /// before any network call is attempted.
    pub fn require(&self, provider_id: &str) -> Result<ProviderRecord, ApiError> {
        self.lookup(provider_id)
            .ok_or(ApiError::NotFound("provider"))
    }

    pub fn list(&self) -> Vec<ProviderView> {
        self.providers.iter().map(|r| r.view()).collect()
    }

    /// Evict every record silent for longer than `ttl`. The predicate runs
    /// under the same per-entry lock as heartbeat writes, so an in-flight
    /// heartbeat always wins over a sweep decision.
    pub fn sweep(&self, ttl: Duration) -> usize {
        // Counted per eviction; concurrent registrations make a before/after
        // length difference meaningless.
        let mut removed = 0;
        self.providers.retain(|id, record| {
            let keep = record.last_seen.elapsed() <= ttl;
            if !keep {
                info!(provider = %id, "removed inactive provider");
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Periodic expiry sweep, decoupled from any request path.
    pub fn spawn_sweeper(self: Arc<Self>, ttl: Duration, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                let removed = self.sweep(ttl);
                if removed > 0 {
                    debug!(removed, "expiry sweep completed");
                }
            }
        });
    }
}

/// Strip IPv4-mapped-IPv6 prefixing (`::ffff:a.b.c.d` -> `a.b.c.d`).
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Resolve the heartbeat origin address. The observed socket address is
/// authoritative unless a trusted proxy's X-Forwarded-For header is
/// explicitly configured as such.
pub fn resolve_origin(remote: IpAddr, forwarded_for: Option<&str>, trusted: bool) -> IpAddr {
    if trusted {
        if let Some(first) = forwarded_for
            .and_then(|header| header.split(',').next())
            .map(str::trim)
            .and_then(|hop| hop.parse::<IpAddr>().ok())
        {
            return canonical_ip(first);
        }
    }
    canonical_ip(remote)
}
