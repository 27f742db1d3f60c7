//! HTTP client for the provider agent's control endpoints.
//!
//! Each forward is a single attempt under a timeout sized to the operation's
//! cost class; timeouts cancel the in-flight request and release the
//! connection. The agent's response body is relayed untouched.

use std::time::Duration;

use axum::http::StatusCode;
use serde_json::{json, Value};
use tracing::warn;

use crate::config::Config;
use crate::error::ApiError;
use crate::registry::ProviderRecord;

#[derive(Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    control_timeout: Duration,
    info_timeout: Duration,
    create_timeout: Duration,
    pull_timeout: Duration,
}

impl AgentClient {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            control_timeout: config.control_timeout,
            info_timeout: config.info_timeout,
            create_timeout: config.create_timeout,
            pull_timeout: config.pull_timeout,
        }
    }

    pub async fn create_container(
        &self,
        provider: &ProviderRecord,
        image: &str,
        options: Option<&Value>,
    ) -> Result<Value, ApiError> {
        self.post(
            provider,
            "/containers/create",
            &json!({ "image": image, "options": options }),
            self.create_timeout,
        )
        .await
    }

    pub async fn start_container(
        &self,
        provider: &ProviderRecord,
        container_id: &str,
    ) -> Result<Value, ApiError> {
        self.post(
            provider,
            "/containers/start",
            &json!({ "containerId": container_id }),
            self.control_timeout,
        )
        .await
    }

    pub async fn stop_container(
        &self,
        provider: &ProviderRecord,
        container_id: &str,
    ) -> Result<Value, ApiError> {
        self.post(
            provider,
            "/containers/stop",
            &json!({ "containerId": container_id }),
            self.control_timeout,
        )
        .await
    }

    pub async fn pull_image(
        &self,
        provider: &ProviderRecord,
        image: &str,
    ) -> Result<Value, ApiError> {
        self.post(
            provider,
            "/images/pull",
            &json!({ "image": image }),
            self.pull_timeout,
        )
        .await
    }

    pub async fn system_info(&self, provider: &ProviderRecord) -> Result<Value, ApiError> {
        self.get(provider, "/system/info", &[], self.info_timeout)
            .await
    }

    pub async fn read_file(
        &self,
        provider: &ProviderRecord,
        container_id: &str,
        path: &str,
    ) -> Result<Value, ApiError> {
        self.get(
            provider,
            "/files/read",
            &[("containerId", container_id), ("path", path)],
            self.control_timeout,
        )
        .await
    }

    pub async fn write_file(
        &self,
        provider: &ProviderRecord,
        container_id: &str,
        path: &str,
        content: &str,
    ) -> Result<Value, ApiError> {
        self.post(
            provider,
            "/files/write",
            &json!({ "containerId": container_id, "path": path, "content": content }),
            self.control_timeout,
        )
        .await
    }

    pub async fn list_files(
        &self,
        provider: &ProviderRecord,
        container_id: &str,
        path: &str,
    ) -> Result<Value, ApiError> {
        self.get(
            provider,
            "/files/list",
            &[("containerId", container_id), ("path", path)],
            self.control_timeout,
        )
        .await
    }

    async fn post(
        &self,
        provider: &ProviderRecord,
        path: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<Value, ApiError> {
        let url = agent_url(provider, path);
        let response = self
            .http
            .post(&url)
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| classify_transport_error(&url, err))?;
        relay_response(response).await
    }

    async fn get(
        &self,
        provider: &ProviderRecord,
        path: &str,
        query: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<Value, ApiError> {
        let url = agent_url(provider, path);
        let response = self
            .http
            .get(&url)
            .query(query)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| classify_transport_error(&url, err))?;
        relay_response(response).await
    }
}

fn agent_url(provider: &ProviderRecord, path: &str) -> String {
    match provider.ip {
        std::net::IpAddr::V6(v6) => format!("http://[{}]:{}{}", v6, provider.port, path),
        v4 => format!("http://{}:{}{}", v4, provider.port, path),
    }
}

fn classify_transport_error(url: &str, err: reqwest::Error) -> ApiError {
    if err.is_timeout() || err.is_connect() {
        warn!(%url, "provider unreachable: {err}");
        ApiError::Unavailable(format!("{url}: {err}"))
    } else {
        ApiError::Internal(err.into())
    }
}

async fn relay_response(response: reqwest::Response) -> Result<Value, ApiError> {
    let status = response.status();
    let body = response
        .json::<Value>()
        .await
        .unwrap_or_else(|_| json!({ "error": "non-json response from provider agent" }));
    if status.is_success() {
        Ok(body)
    } else {
        Err(ApiError::Agent {
            status: StatusCode::from_u16(status.as_u16())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProviderStatus;
    use axum::{routing::get, routing::post, Json, Router};
    use std::net::{IpAddr, SocketAddr};
    use std::time::Instant;

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

    async fn serve(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn successful_forward_relays_body_unmodified() {
        let router = Router::new().route(
            "/system/info",
            get(|| async { Json(json!({ "cpus": 8, "arch": "x86_64" })) }),
        );
        let addr = serve(router).await;

        let client = AgentClient::new(&Config::default());
        let body = client.system_info(&record(addr)).await.unwrap();
        assert_eq!(body, json!({ "cpus": 8, "arch": "x86_64" }));
    }

    #[tokio::test]
    async fn agent_error_status_is_relayed() {
        let router = Router::new().route(
            "/containers/start",
            post(|| async {
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({ "error": "docker daemon down" })),
                )
            }),
        );
        let addr = serve(router).await;

        let client = AgentClient::new(&Config::default());
        let err = client
            .start_container(&record(addr), "c1")
            .await
            .unwrap_err();
        match err {
            ApiError::Agent { status, body } => {
                assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(body["error"], "docker daemon down");
            }
            other => panic!("expected agent error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dead_provider_is_unavailable() {
        // Bind then drop to obtain a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = AgentClient::new(&Config::default());
        let err = client.system_info(&record(addr)).await.unwrap_err();
        assert!(matches!(err, ApiError::Unavailable(_)), "got {err:?}");
    }

    #[test]
    fn agent_urls_use_registered_address() {
        let addr: SocketAddr = "10.0.0.5:9000".parse().unwrap();
        let record = record(addr);
        assert_eq!(
            agent_url(&record, "/containers/create"),
            "http://10.0.0.5:9000/containers/create"
        );
        let v6 = ProviderRecord {
            ip: "2001:db8::1".parse::<IpAddr>().unwrap(),
            ..record
        };
        assert_eq!(
            agent_url(&v6, "/system/info"),
            "http://[2001:db8::1]:9000/system/info"
        );
    }
}
