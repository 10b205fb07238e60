//! Coordinator server integration
//!
//! Polls device and frontlight settings and posts heartbeats. Every call is
//! best-effort: failures are logged and replaced by a safe fallback, never
//! propagated into the push cycle.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::device::clamp_backlight;
use crate::error::{ConfigError, ConfigFetchError};

/// Total time allowed for any coordinator request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Device settings as served by `/api/config/kindle`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KindleConfigResponse {
    #[serde(default)]
    ip: Option<String>,
    /// Seconds between pushes
    #[serde(default, deserialize_with = "lenient_seconds")]
    refresh_interval: Option<f64>,
}

/// Accept seconds as an integer, a fraction or a numeric string
///
/// Anything else becomes `None` instead of failing the whole response, so a
/// malformed interval never discards the `ip` sent alongside it.
fn lenient_seconds<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let seconds = match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        Some(other) => {
            tracing::debug!("Ignoring refreshInterval {}", other);
            None
        }
        None => None,
    };

    Ok(seconds)
}

/// Overrides for the device endpoint and push period
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceConfigUpdate {
    pub address: Option<String>,
    pub push_interval: Option<Duration>,
}

impl From<KindleConfigResponse> for DeviceConfigUpdate {
    fn from(response: KindleConfigResponse) -> Self {
        Self {
            address: response
                .ip
                .map(|ip| ip.trim().to_string())
                .filter(|ip| !ip.is_empty()),
            push_interval: response
                .refresh_interval
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .filter(|interval| !interval.is_zero()),
        }
    }
}

/// Frontlight settings as served by `/api/config/frontlight`
///
/// The default (disabled, level 0) is the fallback when the coordinator is
/// unreachable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct BacklightSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, rename = "brightness")]
    pub level: i64,
}

impl BacklightSettings {
    /// Level to transmit: clamped when enabled, off otherwise
    pub fn effective_level(&self) -> u8 {
        if self.enabled {
            clamp_backlight(self.level)
        } else {
            0
        }
    }
}

/// Source of coordinator-controlled settings
#[async_trait]
pub trait ConfigSync: Send + Sync {
    /// Device address and push period; empty on failure
    async fn fetch_device_config(&self) -> DeviceConfigUpdate;

    /// Frontlight settings; disabled on failure
    async fn fetch_backlight_config(&self) -> BacklightSettings;
}

/// Sink for connectivity status
#[async_trait]
pub trait StatusReporter: Send + Sync {
    /// Deliver a heartbeat; delivery failures are discarded
    async fn report(&self, connected: bool, message: &str);
}

/// HTTP client for the coordinator server
pub struct CoordinatorClient {
    client: Client,
    base_url: String,
}

impl CoordinatorClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ConfigFetchError> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ConfigFetchError::Status(response.status()));
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl ConfigSync for CoordinatorClient {
    async fn fetch_device_config(&self) -> DeviceConfigUpdate {
        match self.get_json::<KindleConfigResponse>("/api/config/kindle").await {
            Ok(response) => response.into(),
            Err(e) => {
                tracing::debug!("Could not fetch device config: {}", e);
                DeviceConfigUpdate::default()
            }
        }
    }

    async fn fetch_backlight_config(&self) -> BacklightSettings {
        match self.get_json::<BacklightSettings>("/api/config/frontlight").await {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!("Could not fetch frontlight config: {}", e);
                BacklightSettings::default()
            }
        }
    }
}

#[async_trait]
impl StatusReporter for CoordinatorClient {
    async fn report(&self, connected: bool, message: &str) {
        let url = format!("{}/api/kindle/heartbeat", self.base_url);
        let body = serde_json::json!({
            "connected": connected,
            "message": message,
        });

        match self.client.post(&url).json(&body).send().await {
            Ok(response) if !response.status().is_success() => {
                tracing::debug!("Heartbeat rejected: {}", response.status());
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("Heartbeat not delivered: {}", e),
        }
    }
}

/// Scripted coordinator used by orchestrator tests
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    pub struct CoordinatorState {
        pub device: DeviceConfigUpdate,
        pub backlight: BacklightSettings,
        pub reports: Vec<(bool, String)>,
    }

    #[derive(Clone, Default)]
    pub struct MockCoordinator {
        pub state: Arc<Mutex<CoordinatorState>>,
    }

    impl MockCoordinator {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn state(&self) -> std::sync::MutexGuard<'_, CoordinatorState> {
            self.state.lock().unwrap()
        }

        pub fn reports(&self) -> Vec<(bool, String)> {
            self.state().reports.clone()
        }
    }

    #[async_trait]
    impl ConfigSync for MockCoordinator {
        async fn fetch_device_config(&self) -> DeviceConfigUpdate {
            self.state().device.clone()
        }

        async fn fetch_backlight_config(&self) -> BacklightSettings {
            self.state().backlight
        }
    }

    #[async_trait]
    impl StatusReporter for MockCoordinator {
        async fn report(&self, connected: bool, message: &str) {
            self.state().reports.push((connected, message.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::sync::{Arc, Mutex};

    type Heartbeats = Arc<Mutex<Vec<Value>>>;

    /// Serve `router` on an ephemeral port, returning its base URL
    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn coordinator_router(heartbeats: Heartbeats) -> Router {
        Router::new()
            .route(
                "/api/config/kindle",
                get(|| async { Json(serde_json::json!({ "ip": "10.0.0.5", "refreshInterval": 30 })) }),
            )
            .route(
                "/api/config/frontlight",
                get(|| async { Json(serde_json::json!({ "enabled": true, "brightness": 12 })) }),
            )
            .route(
                "/api/kindle/heartbeat",
                post(
                    |State(heartbeats): State<Heartbeats>, Json(body): Json<Value>| async move {
                        heartbeats.lock().unwrap().push(body);
                        StatusCode::NO_CONTENT
                    },
                ),
            )
            .with_state(heartbeats)
    }

    #[tokio::test]
    async fn test_fetch_device_config() {
        let url = serve(coordinator_router(Heartbeats::default())).await;
        let client = CoordinatorClient::new(url).unwrap();

        let update = client.fetch_device_config().await;

        assert_eq!(update.address.as_deref(), Some("10.0.0.5"));
        assert_eq!(update.push_interval, Some(Duration::from_millis(30_000)));
    }

    #[tokio::test]
    async fn test_fetch_backlight_config() {
        let url = serve(coordinator_router(Heartbeats::default())).await;
        let client = CoordinatorClient::new(url).unwrap();

        let settings = client.fetch_backlight_config().await;

        assert_eq!(
            settings,
            BacklightSettings {
                enabled: true,
                level: 12
            }
        );
        assert_eq!(settings.effective_level(), 12);
    }

    #[tokio::test]
    async fn test_report_posts_heartbeat() {
        let heartbeats = Heartbeats::default();
        let url = serve(coordinator_router(heartbeats.clone())).await;
        let client = CoordinatorClient::new(url).unwrap();

        client.report(false, "handshake timed out").await;

        let received = heartbeats.lock().unwrap().clone();
        assert_eq!(
            received,
            vec![serde_json::json!({ "connected": false, "message": "handshake timed out" })]
        );
    }

    #[tokio::test]
    async fn test_server_errors_fall_back_to_defaults() {
        let router = Router::new()
            .route("/api/config/kindle", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
            .route("/api/config/frontlight", get(|| async { "not json" }));
        let url = serve(router).await;
        let client = CoordinatorClient::new(url).unwrap();

        assert_eq!(client.fetch_device_config().await, DeviceConfigUpdate::default());
        assert_eq!(client.fetch_backlight_config().await, BacklightSettings::default());
        // Missing heartbeat route is silently ignored
        client.report(true, "ok").await;
    }

    #[tokio::test]
    async fn test_unreachable_coordinator() {
        // Bind then drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = CoordinatorClient::new(format!("http://{}/", addr)).unwrap();

        assert_eq!(client.fetch_device_config().await, DeviceConfigUpdate::default());
        assert_eq!(client.fetch_backlight_config().await.effective_level(), 0);
        client.report(false, "unreachable").await;
    }

    #[test]
    fn test_device_config_conversion() {
        let update: DeviceConfigUpdate = KindleConfigResponse {
            ip: Some("  ".to_string()),
            refresh_interval: Some(0.0),
        }
        .into();
        assert_eq!(update, DeviceConfigUpdate::default());

        let update: DeviceConfigUpdate = KindleConfigResponse {
            ip: None,
            refresh_interval: Some(-30.0),
        }
        .into();
        assert_eq!(update.push_interval, None);

        let parsed: KindleConfigResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(DeviceConfigUpdate::from(parsed), DeviceConfigUpdate::default());
    }

    #[test]
    fn test_refresh_interval_is_parsed_leniently() {
        let parse = |body: &str| -> DeviceConfigUpdate {
            serde_json::from_str::<KindleConfigResponse>(body)
                .unwrap()
                .into()
        };

        let update = parse(r#"{"ip": "10.0.0.5", "refreshInterval": 30.5}"#);
        assert_eq!(update.address.as_deref(), Some("10.0.0.5"));
        assert_eq!(update.push_interval, Some(Duration::from_millis(30_500)));

        let update = parse(r#"{"ip": "10.0.0.5", "refreshInterval": "30"}"#);
        assert_eq!(update.address.as_deref(), Some("10.0.0.5"));
        assert_eq!(update.push_interval, Some(Duration::from_secs(30)));

        // Unusable intervals are dropped without losing the address
        for body in [
            r#"{"ip": "10.0.0.5", "refreshInterval": "soon"}"#,
            r#"{"ip": "10.0.0.5", "refreshInterval": true}"#,
            r#"{"ip": "10.0.0.5", "refreshInterval": null}"#,
            r#"{"ip": "10.0.0.5", "refreshInterval": 1e300}"#,
        ] {
            let update = parse(body);
            assert_eq!(update.address.as_deref(), Some("10.0.0.5"), "{}", body);
            assert_eq!(update.push_interval, None, "{}", body);
        }
    }

    #[tokio::test]
    async fn test_string_interval_from_coordinator_keeps_address() {
        let router = Router::new().route(
            "/api/config/kindle",
            get(|| async { Json(serde_json::json!({ "ip": "10.0.0.7", "refreshInterval": "45" })) }),
        );
        let url = serve(router).await;
        let client = CoordinatorClient::new(url).unwrap();

        let update = client.fetch_device_config().await;

        assert_eq!(update.address.as_deref(), Some("10.0.0.7"));
        assert_eq!(update.push_interval, Some(Duration::from_secs(45)));
    }

    #[test]
    fn test_disabled_backlight_is_off() {
        let settings: BacklightSettings =
            serde_json::from_str(r#"{"enabled": false, "brightness": 12}"#).unwrap();
        assert_eq!(settings.effective_level(), 0);

        let settings: BacklightSettings =
            serde_json::from_str(r#"{"enabled": true, "brightness": 99}"#).unwrap();
        assert_eq!(settings.effective_level(), 24);
    }
}
