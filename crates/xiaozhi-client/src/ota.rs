//! OTA bootstrap: one HTTP POST that hands back the WebSocket endpoint and
//! token to connect with. The response carries much more (activation,
//! firmware, server time); only `websocket.url` and `websocket.token` are
//! consumed here.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::ClientError;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebsocketBootstrap {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Deserialize)]
struct OtaResponse {
    #[serde(default)]
    websocket: Option<WebsocketBootstrap>,
}

/// POSTs `body` to the OTA endpoint with the device/client identity headers
/// and extracts the WebSocket endpoint from the response.
pub async fn fetch_websocket_bootstrap(
    ota_url: &str,
    device_id: &str,
    client_id: &str,
    body: &Value,
) -> Result<WebsocketBootstrap, ClientError> {
    let client = reqwest::Client::new();
    let mut request = client
        .post(ota_url)
        .json(body)
        .header("Device-Id", device_id);
    if !client_id.is_empty() {
        request = request.header("Client-Id", client_id);
    }

    info!(url = ota_url, device_id, "ota bootstrap request");
    let response = request
        .send()
        .await
        .map_err(|e| ClientError::Bootstrap(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(ClientError::Bootstrap(format!("ota status {status}")));
    }

    let parsed: OtaResponse = response
        .json()
        .await
        .map_err(|e| ClientError::Bootstrap(format!("ota response parse: {e}")))?;
    let websocket = parsed
        .websocket
        .filter(|ws| !ws.url.is_empty())
        .ok_or_else(|| ClientError::Bootstrap("ota response has no websocket endpoint".to_string()))?;
    debug!(ws_url = %websocket.url, "ota bootstrap response");
    Ok(websocket)
}
