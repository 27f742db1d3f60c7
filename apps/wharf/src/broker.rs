//! Session broker: owns the upstream terminal connections and bridges them
//! to client WebSockets, one live bridge per token.
//!
//! A session moves `READY` (upstream open, unattached) -> `ATTACHED`
//! (bridged) -> removed. A failed upstream dial stores nothing. Each bridge
//! runs as two independent directional pumps so a stalled reader on one side
//! never blocks delivery on the other; awaiting the opposite sink is the
//! backpressure. Exactly one teardown path runs per session, driven by
//! whichever pump finishes first.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message as ClientMessage, WebSocket};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::registry::ProviderRecord;

pub type Upstream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found")]
    NotFound,
    #[error("session already attached")]
    Busy,
    #[error("terminal dial failed: {0}")]
    Dial(String),
}

enum SessionState {
    Ready(Box<Upstream>),
    Attached,
}

struct Session {
    provider_id: String,
    container_id: String,
    state: SessionState,
    created_at: Instant,
}

pub struct SessionBroker {
    sessions: DashMap<String, Session>,
    dial_timeout: Duration,
    idle_ttl: Duration,
    reuse: bool,
}

impl SessionBroker {
    pub fn new(config: &Config) -> Self {
        Self {
            sessions: DashMap::new(),
            dial_timeout: config.dial_timeout,
            idle_ttl: config.session_idle_ttl,
            reuse: config.session_reuse,
        }
    }

    /// Dial the provider's terminal endpoint for `container_id` and store the
    /// session as READY. On failure no entry exists for `token`.
    pub async fn create_session(
        &self,
        token: &str,
        provider: &ProviderRecord,
        container_id: &str,
    ) -> Result<(), SessionError> {
        if self.sessions.contains_key(token) {
            return Err(SessionError::Busy);
        }

        let url = terminal_url(provider, container_id);
        let upstream = match tokio::time::timeout(self.dial_timeout, connect_async(&url)).await {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(err)) => return Err(SessionError::Dial(format!("{url}: {err}"))),
            Err(_) => return Err(SessionError::Dial(format!("{url}: dial timed out"))),
        };

        match self.sessions.entry(token.to_string()) {
            Entry::Vacant(entry) => {
                debug!(provider = %provider.provider_id, container = %container_id, "session ready");
                entry.insert(Session {
                    provider_id: provider.provider_id.clone(),
                    container_id: container_id.to_string(),
                    state: SessionState::Ready(Box::new(upstream)),
                    created_at: Instant::now(),
                });
                Ok(())
            }
            // Lost a race against a concurrent create for the same token;
            // dropping the fresh dial closes it.
            Entry::Occupied(_) => Err(SessionError::Busy),
        }
    }

    /// Take exclusive ownership of the session's upstream. First attach wins:
    /// the READY -> ATTACHED swap happens under the table's entry lock, so of
    /// two concurrent attaches exactly one receives the upstream and the
    /// other observes ATTACHED. The claim is returned as a guard so a client
    /// that vanishes before its upgrade completes cannot strand the entry in
    /// ATTACHED.
    pub fn attach(self: &Arc<Self>, token: &str) -> Result<AttachGuard, SessionError> {
        let mut entry = self.sessions.get_mut(token).ok_or(SessionError::NotFound)?;
        match std::mem::replace(&mut entry.state, SessionState::Attached) {
            SessionState::Ready(upstream) => Ok(AttachGuard {
                broker: Arc::clone(self),
                token: token.to_string(),
                upstream: Some(upstream),
            }),
            SessionState::Attached => Err(SessionError::Busy),
        }
    }

    /// Relay bytes between the client connection and the upstream until
    /// either side closes or errors, then tear the session down. With session
    /// reuse enabled, a clean client detach that leaves the upstream healthy
    /// returns the session to READY instead.
    pub async fn bridge(&self, client: WebSocket, mut guard: AttachGuard) {
        let Some(upstream) = guard.upstream.take() else {
            return;
        };
        let token = guard.token.clone();
        let token = token.as_str();
        drop(guard);

        let (up_tx, up_rx) = (*upstream).split();
        let (cl_tx, cl_rx) = client.split();
        let cancel = CancellationToken::new();

        let c2u = tokio::spawn(pump_client_to_upstream(cl_rx, up_tx, cancel.clone()));
        let u2c = tokio::spawn(pump_upstream_to_client(up_rx, cl_tx, cancel.clone()));

        let (c2u_out, u2c_out) = match tokio::join!(c2u, u2c) {
            (Ok(a), Ok(b)) => (a, b),
            _ => {
                // A pump panicked; both halves are gone, drop the entry.
                warn!(%token, "relay pump aborted unexpectedly");
                self.sessions.remove(token);
                return;
            }
        };
        let (up_tx, client_end) = c2u_out;
        let (up_rx, mut cl_tx, upstream_end) = u2c_out;

        // The upstream stayed healthy only if its pump was cancelled rather
        // than finishing on its own.
        let client_detached = matches!(client_end, PumpEnd::Closed);
        let upstream_alive = matches!(upstream_end, PumpEnd::Cancelled);

        if self.reuse && client_detached && upstream_alive {
            if let Ok(upstream) = up_rx.reunite(up_tx) {
                if let Some(mut entry) = self.sessions.get_mut(token) {
                    entry.state = SessionState::Ready(Box::new(upstream));
                    entry.created_at = Instant::now();
                    info!(%token, "client detached, session returned to ready");
                    return;
                }
            }
            // Session vanished while bridged (reaper cannot touch ATTACHED,
            // so only an external remove); fall through to teardown.
        } else {
            let mut up_tx = up_tx;
            let _ = up_tx.close().await;
        }
        let _ = cl_tx.send(ClientMessage::Close(None)).await;

        if let Some((_, session)) = self.sessions.remove(token) {
            info!(
                %token,
                provider = %session.provider_id,
                container = %session.container_id,
                "session closed"
            );
        }
    }

    /// Reclaim READY sessions that were never attached within the idle
    /// window. Dropping the stored upstream closes its socket.
    pub fn reap_idle(&self) -> usize {
        // Counted per eviction; a create landing mid-reap can grow the table
        // past its pre-reap size.
        let mut removed = 0;
        self.sessions.retain(|token, session| {
            let expired = matches!(session.state, SessionState::Ready(_))
                && session.created_at.elapsed() > self.idle_ttl;
            if expired {
                info!(%token, container = %session.container_id, "reclaimed unattached session");
                removed += 1;
            }
            !expired
        });
        removed
    }

    pub fn spawn_reaper(self: Arc<Self>, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.reap_idle();
            }
        });
    }

    #[cfg(test)]
    fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// Exclusive claim on a session's upstream, handed from `attach` to
/// `bridge`. Dropping an unconsumed guard removes the session and closes the
/// upstream, so an ATTACHED entry never outlives a client that disappeared
/// between the handshake response and the protocol upgrade.
pub struct AttachGuard {
    broker: Arc<SessionBroker>,
    token: String,
    upstream: Option<Box<Upstream>>,
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        if self.upstream.is_some() && self.broker.sessions.remove(&self.token).is_some() {
            warn!(token = %self.token, "attach abandoned before bridging, session removed");
        }
    }
}

/// How a directional pump ended.
enum PumpEnd {
    /// The source closed cleanly (close frame or end of stream).
    Closed,
    /// Read or write error on either end of this direction.
    Failed,
    /// The opposite pump finished first.
    Cancelled,
}

async fn pump_client_to_upstream(
    mut source: SplitStream<WebSocket>,
    mut sink: SplitSink<Upstream, UpstreamMessage>,
    cancel: CancellationToken,
) -> (SplitSink<Upstream, UpstreamMessage>, PumpEnd) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return (sink, PumpEnd::Cancelled),
            msg = source.next() => {
                let forward = match msg {
                    Some(Ok(ClientMessage::Binary(data))) => UpstreamMessage::Binary(data.into()),
                    Some(Ok(ClientMessage::Text(text))) => UpstreamMessage::Text(text.into()),
                    // Transport-level keepalives are not payload.
                    Some(Ok(ClientMessage::Ping(_) | ClientMessage::Pong(_))) => continue,
                    Some(Ok(ClientMessage::Close(_))) | None => {
                        cancel.cancel();
                        return (sink, PumpEnd::Closed);
                    }
                    Some(Err(err)) => {
                        debug!("client read failed: {err}");
                        cancel.cancel();
                        return (sink, PumpEnd::Failed);
                    }
                };
                if sink.send(forward).await.is_err() {
                    cancel.cancel();
                    return (sink, PumpEnd::Failed);
                }
            }
        }
    }
}

async fn pump_upstream_to_client(
    mut source: SplitStream<Upstream>,
    mut sink: SplitSink<WebSocket, ClientMessage>,
    cancel: CancellationToken,
) -> (SplitStream<Upstream>, SplitSink<WebSocket, ClientMessage>, PumpEnd) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return (source, sink, PumpEnd::Cancelled),
            msg = source.next() => {
                let forward = match msg {
                    Some(Ok(UpstreamMessage::Binary(data))) => ClientMessage::Binary(data.to_vec()),
                    Some(Ok(UpstreamMessage::Text(text))) => ClientMessage::Text(text.to_string()),
                    Some(Ok(UpstreamMessage::Ping(_) | UpstreamMessage::Pong(_) | UpstreamMessage::Frame(_))) => continue,
                    Some(Ok(UpstreamMessage::Close(_))) | None => {
                        cancel.cancel();
                        return (source, sink, PumpEnd::Closed);
                    }
                    Some(Err(err)) => {
                        debug!("upstream read failed: {err}");
                        cancel.cancel();
                        return (source, sink, PumpEnd::Failed);
                    }
                };
                if sink.send(forward).await.is_err() {
                    cancel.cancel();
                    return (source, sink, PumpEnd::Failed);
                }
            }
        }
    }
}

fn terminal_url(provider: &ProviderRecord, container_id: &str) -> String {
    match provider.ip {
        std::net::IpAddr::V6(v6) => {
            format!("ws://[{}]:{}/terminal/{}", v6, provider.port, container_id)
        }
        v4 => format!("ws://{}:{}/terminal/{}", v4, provider.port, container_id),
    }
}

/// Derive the opaque session token from the caller's bearer credential so the
/// capability is bound to the credential that created the container. Callers
/// without a credential get a random token.
pub fn derive_session_token(credential: Option<&str>, container_id: &str) -> String {
    match credential {
        Some(credential) if !credential.trim().is_empty() => {
            let mut hasher = Sha256::new();
            hasher.update(credential.as_bytes());
            hasher.update(b":");
            hasher.update(container_id.as_bytes());
            format!("{:x}", hasher.finalize())
        }
        _ => Uuid::new_v4().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProviderStatus;
    use axum::extract::ws::WebSocketUpgrade;
    use axum::extract::Path;
    use axum::response::Response;
    use axum::routing::get;
    use axum::Router;
    use std::net::SocketAddr;

    fn record(addr: SocketAddr) -> ProviderRecord {
        ProviderRecord {
            provider_id: "p1".into(),
            provider_name: "test".into(),
            ip: addr.ip(),
            port: addr.port(),
            status: ProviderStatus::Active,
            last_seen: Instant::now(),
            last_heartbeat_ms: 0,
            registered_at: chrono::Utc::now(),
        }
    }

    /// Minimal stand-in for the provider agent's terminal endpoint: accepts
    /// the upgrade and echoes payload frames back.
    async fn spawn_echo_agent() -> SocketAddr {
        async fn terminal(ws: WebSocketUpgrade, Path(_id): Path<String>) -> Response {
            ws.on_upgrade(|mut socket| async move {
                while let Some(Ok(msg)) = socket.recv().await {
                    match msg {
                        ClientMessage::Binary(_) | ClientMessage::Text(_) => {
                            if socket.send(msg).await.is_err() {
                                break;
                            }
                        }
                        ClientMessage::Close(_) => break,
                        _ => {}
                    }
                }
            })
        }

        let router = Router::new().route("/terminal/:id", get(terminal));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn broker() -> SessionBroker {
        SessionBroker::new(&Config::default())
    }

    #[tokio::test]
    async fn create_then_attach_hands_over_the_upstream() {
        let agent = spawn_echo_agent().await;
        let broker = Arc::new(broker());

        broker
            .create_session("abc", &record(agent), "c1")
            .await
            .unwrap();
        assert_eq!(broker.session_count(), 1);

        // First attach wins; the session is ATTACHED while the claim is held.
        let claim = broker.attach("abc").unwrap();
        assert!(matches!(broker.attach("abc"), Err(SessionError::Busy)));
        drop(claim);
    }

    #[tokio::test]
    async fn abandoned_attach_releases_the_session() {
        let agent = spawn_echo_agent().await;
        let broker = Arc::new(broker());
        broker
            .create_session("abc", &record(agent), "c1")
            .await
            .unwrap();

        // The client can vanish between the handshake response and the
        // protocol upgrade, in which case the claim is dropped without a
        // bridge ever running. The session must not linger as ATTACHED.
        let claim = broker.attach("abc").unwrap();
        drop(claim);

        assert_eq!(broker.session_count(), 0);
        assert!(matches!(broker.attach("abc"), Err(SessionError::NotFound)));
    }

    #[tokio::test]
    async fn failed_dial_stores_no_session() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let broker = Arc::new(broker());
        let err = broker
            .create_session("abc", &record(addr), "c1")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Dial(_)), "got {err:?}");
        assert_eq!(broker.session_count(), 0);
        assert!(matches!(broker.attach("abc"), Err(SessionError::NotFound)));
    }

    #[tokio::test]
    async fn duplicate_token_is_refused_while_live() {
        let agent = spawn_echo_agent().await;
        let broker = broker();

        broker
            .create_session("abc", &record(agent), "c1")
            .await
            .unwrap();
        let err = broker
            .create_session("abc", &record(agent), "c2")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Busy));
        assert_eq!(broker.session_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_attaches_admit_exactly_one() {
        let agent = spawn_echo_agent().await;
        let broker = Arc::new(broker());
        broker
            .create_session("abc", &record(agent), "c1")
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for _ in 0..2 {
            let broker = broker.clone();
            tasks.push(tokio::spawn(async move { broker.attach("abc") }));
        }
        // Claims stay alive until both outcomes are tallied, so the loser
        // must have observed ATTACHED rather than a vacated entry.
        let mut claims = Vec::new();
        let mut losses = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(claim) => claims.push(claim),
                Err(err) => {
                    assert!(matches!(err, SessionError::Busy), "got {err:?}");
                    losses += 1;
                }
            }
        }
        assert_eq!(claims.len(), 1);
        assert_eq!(losses, 1);
    }

    #[tokio::test]
    async fn idle_sessions_are_reaped() {
        let agent = spawn_echo_agent().await;
        let mut config = Config::default();
        config.session_idle_ttl = Duration::from_millis(20);
        let broker = Arc::new(SessionBroker::new(&config));

        broker
            .create_session("abc", &record(agent), "c1")
            .await
            .unwrap();
        assert_eq!(broker.reap_idle(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.reap_idle(), 1);
        assert!(matches!(broker.attach("abc"), Err(SessionError::NotFound)));
    }

    #[tokio::test]
    async fn attached_sessions_are_not_reaped() {
        let agent = spawn_echo_agent().await;
        let mut config = Config::default();
        config.session_idle_ttl = Duration::from_millis(20);
        let broker = Arc::new(SessionBroker::new(&config));

        broker
            .create_session("abc", &record(agent), "c1")
            .await
            .unwrap();
        let _claim = broker.attach("abc").unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.reap_idle(), 0);
        assert_eq!(broker.session_count(), 1);
    }

    #[tokio::test]
    async fn reaping_runs_concurrently_with_session_creation() {
        let agent = spawn_echo_agent().await;
        let mut config = Config::default();
        config.session_idle_ttl = Duration::ZERO;
        let broker = Arc::new(SessionBroker::new(&config));

        // Creates landing mid-reap can grow the table past its pre-reap
        // size; the reaper must stay oblivious to that.
        let writer = {
            let broker = broker.clone();
            let provider = record(agent);
            tokio::spawn(async move {
                for i in 0..200u32 {
                    let _ = broker
                        .create_session(&format!("t{}", i % 4), &provider, "c1")
                        .await;
                }
            })
        };

        while !writer.is_finished() {
            broker.reap_idle();
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
        broker.reap_idle();
    }

    #[test]
    fn token_derivation_is_stable_per_credential() {
        let a = derive_session_token(Some("cred"), "c1");
        let b = derive_session_token(Some("cred"), "c1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        // Different credential or container produces a different capability.
        assert_ne!(a, derive_session_token(Some("other"), "c1"));
        assert_ne!(a, derive_session_token(Some("cred"), "c2"));
    }

    #[test]
    fn missing_credential_gets_a_random_token() {
        let a = derive_session_token(None, "c1");
        let b = derive_session_token(None, "c1");
        assert_ne!(a, b);
        assert_ne!(derive_session_token(Some("   "), "c1").len(), 64);
    }
}
