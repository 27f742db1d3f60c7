//! Wire shapes for the control-plane HTTP surface.
//!
//! Field names follow the provider agent's existing JSON contract
//! (`providerID`, `containerId`, ...), so they are renamed explicitly rather
//! than relying on a blanket rename rule.

use serde::{Deserialize, Serialize};

/// Inbound liveness report. `provider_id` and `port` are validated by the
/// registry, not by serde, so their absence yields a structured
/// `validation_error` instead of a deserialization failure.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(rename = "providerID")]
    pub provider_id: Option<String>,
    #[serde(rename = "providerName", default)]
    pub provider_name: Option<String>,
    pub port: Option<u16>,
    #[serde(default)]
    pub status: ProviderStatus,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatAck {
    pub status: &'static str,
    /// Milliseconds since the Unix epoch, matching the agent's own clock
    /// format.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    #[default]
    Active,
    Inactive,
}

/// Provider record as returned by the listing and lookup endpoints. Never
/// carries connection handles or internal clock state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderView {
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(rename = "providerName")]
    pub provider_name: String,
    pub ip: String,
    pub port: u16,
    pub status: ProviderStatus,
    #[serde(rename = "lastHeartbeat")]
    pub last_heartbeat: i64,
    #[serde(rename = "registeredAt")]
    pub registered_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ContainerRequest {
    #[serde(rename = "containerId")]
    pub container_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PullImageRequest {
    pub image: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateContainerRequest {
    pub image: String,
    #[serde(default)]
    pub options: Option<serde_json::Value>,
}

/// Composite create response: the new container plus the terminal session
/// token minted for it.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateContainerResponse {
    #[serde(rename = "containerId")]
    pub container_id: String,
    #[serde(rename = "sessionToken")]
    pub session_token: String,
}

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    #[serde(rename = "containerId")]
    pub container_id: String,
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WriteFileRequest {
    #[serde(rename = "containerId")]
    pub container_id: String,
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrphanedContainer {
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(rename = "containerId")]
    pub container_id: String,
}
