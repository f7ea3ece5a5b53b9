//! Diagnostics HTTP server configuration and startup
//!
//! `POST /` takes `{"id": .., "method": ..}` and answers with
//! `{"id": .., "result": ..}`. `GET /health` answers liveness checks.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use oracle_core::DiagnosticsSettings;

use crate::error::DiagnosticsError;
use crate::service::{Health, OracleService};

/// Server configuration
#[derive(Debug, Clone)]
pub struct DiagnosticsServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for DiagnosticsServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl From<&DiagnosticsSettings> for DiagnosticsServerConfig {
    fn from(s: &DiagnosticsSettings) -> Self {
        Self {
            host: s.host.clone(),
            port: s.port,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DiagnosticsRequest {
    #[serde(default, alias = "ID")]
    id: Value,
    #[serde(alias = "Method")]
    method: String,
}

/// Diagnostics server wrapper
pub struct DiagnosticsServer {
    config: DiagnosticsServerConfig,
    service: Arc<OracleService>,
}

impl DiagnosticsServer {
    pub fn new(config: DiagnosticsServerConfig, service: OracleService) -> Self {
        Self {
            config,
            service: Arc::new(service),
        }
    }

    /// Get reference to the service
    pub fn service(&self) -> &OracleService {
        &self.service
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", post(handle_request))
            .route("/health", get(handle_health))
            .with_state(Arc::clone(&self.service))
    }

    /// Bind the configured address
    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let addr: SocketAddr = self.address().parse()?;
        Ok(TcpListener::bind(addr).await?)
    }

    /// Serve on a bound listener until shutdown is signalled
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        info!("Diagnostics server listening on {}", listener.local_addr()?);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
                info!("Diagnostics server shutting down");
            })
            .await?;

        Ok(())
    }

    /// Start with graceful shutdown
    pub async fn start_with_shutdown(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Get server address
    pub fn address(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }
}

async fn handle_request(State(service): State<Arc<OracleService>>, body: String) -> Response {
    let request: DiagnosticsRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!("Rejected diagnostics request: {}", e);
            return DiagnosticsError::BadRequest(e.to_string()).into_response();
        }
    };

    debug!(method = %request.method, "Diagnostics request");
    match service.dispatch(&request.method) {
        Ok(result) => Json(json!({ "id": request.id, "result": result })).into_response(),
        Err(e) => {
            warn!(method = %request.method, "Diagnostics request failed: {}", e);
            e.with_id(request.id)
        }
    }
}

async fn handle_health(State(service): State<Arc<OracleService>>) -> Json<Health> {
    Json(service.health())
}

/// Builder for server configuration
pub struct DiagnosticsServerBuilder {
    config: DiagnosticsServerConfig,
    service: Option<OracleService>,
}

impl DiagnosticsServerBuilder {
    pub fn new() -> Self {
        Self {
            config: DiagnosticsServerConfig::default(),
            service: None,
        }
    }

    pub fn settings(mut self, settings: &DiagnosticsSettings) -> Self {
        self.config = DiagnosticsServerConfig::from(settings);
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn service(mut self, service: OracleService) -> Self {
        self.service = Some(service);
        self
    }

    pub fn build(self) -> anyhow::Result<DiagnosticsServer> {
        let service = self
            .service
            .ok_or_else(|| anyhow::anyhow!("diagnostics server needs a service"))?;
        Ok(DiagnosticsServer::new(self.config, service))
    }
}

impl Default for DiagnosticsServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oracle_core::{PluginConfig, Symbol};
    use oracle_plugins::mock::{MockLauncher, MockSource};
    use oracle_plugins::{PluginSpec, PluginSupervisor, SupervisorConfig};
    use oracle_round::ControllerStatus;
    use parking_lot::RwLock;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    async fn service() -> OracleService {
        let source = Arc::new(
            MockSource::new("forex").with_prices([("EUR-USD", dec!(1.08)), ("JPY-USD", dec!(0.0067))]),
        );
        let supervisor = Arc::new(PluginSupervisor::new(
            SupervisorConfig::default(),
            Arc::new(MockLauncher::new([source])),
        ));
        supervisor
            .start(PluginSpec::new(PluginConfig::named("forex"), "/plugins/forex".into()))
            .await
            .unwrap();
        supervisor
            .invoke("forex", &[Symbol::new("EUR-USD")], Duration::from_secs(1))
            .await
            .unwrap();

        let status = ControllerStatus {
            tracked_symbols: vec![Symbol::new("EUR-USD"), Symbol::new("JPY-USD")],
            ..Default::default()
        };
        OracleService::new(supervisor, Arc::new(RwLock::new(status)))
    }

    async fn spawn_server() -> (SocketAddr, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let server = DiagnosticsServerBuilder::new()
            .port(0)
            .service(service().await)
            .build()
            .unwrap();
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            server.serve(listener, rx).await.unwrap();
        });
        (addr, tx, handle)
    }

    async fn post(addr: SocketAddr, body: &str) -> (u16, Value) {
        let response = reqwest::Client::new()
            .post(format!("http://{addr}/"))
            .header("content-type", "application/json")
            .body(body.to_string())
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    #[test]
    fn test_default_config() {
        let config = DiagnosticsServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.host, "127.0.0.1");
    }

    #[tokio::test]
    async fn test_builder() {
        let server = DiagnosticsServerBuilder::new()
            .host("0.0.0.0")
            .port(9000)
            .service(service().await)
            .build()
            .unwrap();
        assert_eq!(server.address(), "0.0.0.0:9000");

        assert!(DiagnosticsServerBuilder::new().build().is_err());
    }

    #[tokio::test]
    async fn test_get_version_and_plugins() {
        let (addr, _tx, _handle) = spawn_server().await;

        let (status, body) = post(addr, r#"{"id": 1, "method": "get_version"}"#).await;
        assert_eq!(status, 200);
        assert_eq!(body["id"], 1);
        assert!(body["result"]["version"].as_str().unwrap().starts_with('v'));

        let (status, body) = post(addr, r#"{"ID": 2, "Method": "list_plugins"}"#).await;
        assert_eq!(status, 200);
        assert_eq!(body["id"], 2);
        assert_eq!(body["result"][0]["name"], "forex");
    }

    #[tokio::test]
    async fn test_get_prices() {
        let (addr, _tx, _handle) = spawn_server().await;

        let (status, body) = post(addr, r#"{"id": 3, "method": "get_prices"}"#).await;
        assert_eq!(status, 200);
        let result = &body["result"];
        assert_eq!(result["symbols"].as_array().unwrap().len(), 2);
        assert_eq!(result["prices"]["EUR-USD"]["sources"], 1);
    }

    #[tokio::test]
    async fn test_unknown_method_is_bad_request() {
        let (addr, _tx, _handle) = spawn_server().await;

        let (status, body) = post(addr, r#"{"id": 4, "method": "set_price"}"#).await;
        assert_eq!(status, 400);
        assert_eq!(body["id"], 4);
        assert_eq!(body["error"], "unknown method");
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let (addr, _tx, _handle) = spawn_server().await;

        let (status, body) = post(addr, "{not json").await;
        assert_eq!(status, 400);
        assert!(body["error"].as_str().unwrap().starts_with("invalid request"));
    }

    #[tokio::test]
    async fn test_health_and_shutdown() {
        let (addr, tx, handle) = spawn_server().await;

        let health: Value = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["plugins"], 1);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
