#![forbid(unsafe_code)]

// HTTP client for the media gateway's control API (MediaMTX-style). The
// gateway pulls camera streams over RTSP; this client only manages its path
// configuration.

use crate::room::{SessionError, SessionResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Camera path definition pushed to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraPath {
    pub name: String,
    /// RTSP or HTTP source URL the gateway pulls from.
    pub source: String,
    #[serde(default = "default_on_demand")]
    pub on_demand: bool,
    /// Force TCP interleaving for cameras behind NAT.
    #[serde(default)]
    pub force_tcp: bool,
}

fn default_on_demand() -> bool {
    true
}

#[derive(Clone)]
pub struct GatewayClient {
    base: String,
    http: reqwest::Client,
}

impl GatewayClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let http = reqwest::ClientBuilder::new()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            base: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Adds (or replaces) a camera path on the gateway.
    pub async fn add_path(&self, path: &CameraPath) -> SessionResult<()> {
        let url = format!("{}/v3/config/paths/add/{}", self.base, path.name);
        let mut body = serde_json::json!({
            "source": path.source,
            "sourceOnDemand": path.on_demand,
        });
        if path.force_tcp {
            body["rtspTransport"] = serde_json::json!("tcp");
        }
        debug!("Gateway add_path {} -> {}", path.name, path.source);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SessionError::Gateway {
                status: 0,
                message: e.to_string(),
            })?;
        Self::check(response).await?;
        Ok(())
    }

    /// Lists the gateway's configured paths, verbatim.
    pub async fn list_paths(&self) -> SessionResult<serde_json::Value> {
        let url = format!("{}/v3/paths/list", self.base);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| SessionError::Gateway {
                status: 0,
                message: e.to_string(),
            })?;
        let response = Self::check(response).await?;
        response.json().await.map_err(|e| SessionError::Gateway {
            status: 0,
            message: e.to_string(),
        })
    }

    /// Upstream errors keep their status and body; they are never swallowed.
    async fn check(response: reqwest::Response) -> SessionResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(SessionError::Gateway {
            status: status.as_u16(),
            message,
        })
    }
}
