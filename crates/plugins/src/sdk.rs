//! Plugin-side runtime
//!
//! A plugin binary implements [`PriceProvider`] and hands it to [`serve`],
//! which speaks the wire protocol on stdin/stdout until the node closes
//! the pipe or sends `shutdown`.

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use oracle_core::PluginConfig;

use crate::protocol::{
    methods, FetchPricesParams, FetchPricesResult, HandshakeParams, HandshakeResult, Request,
    Response, RpcError, StateResult, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE, PLUGIN_CONF_ENV,
    PROTOCOL_VERSION,
};

/// What a price plugin has to provide
#[async_trait::async_trait]
pub trait PriceProvider: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    /// Symbols this vendor can quote, in its own notation
    async fn available_symbols(&self) -> anyhow::Result<Vec<String>>;

    /// Quote `symbols`; unknown ones go to `bad_symbols`
    async fn fetch(&self, symbols: &[String]) -> anyhow::Result<FetchPricesResult>;
}

/// Read this plugin's settings from the environment the node prepared
pub fn load_plugin_config() -> anyhow::Result<PluginConfig> {
    match std::env::var(PLUGIN_CONF_ENV) {
        Ok(raw) if !raw.trim().is_empty() => Ok(serde_json::from_str(&raw)?),
        _ => Ok(PluginConfig::default()),
    }
}

/// Log to stderr; stdout carries protocol traffic only
pub fn init_plugin_logging() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

/// Serve requests from stdin until EOF or `shutdown`.
///
/// Refuses to run unless started by a node, detected via the magic cookie.
pub async fn serve<P: PriceProvider>(provider: P) -> anyhow::Result<()> {
    if std::env::var(MAGIC_COOKIE_KEY).ok().as_deref() != Some(MAGIC_COOKIE_VALUE) {
        anyhow::bail!("this binary is an oracle plugin and must be started by the oracle node");
    }

    let provider = Arc::new(provider);
    let (tx, mut rx) = mpsc::channel::<Response>(64);

    // Single writer keeps response lines whole
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(response) = rx.recv().await {
            let mut line = match serde_json::to_string(&response) {
                Ok(line) => line,
                Err(e) => {
                    warn!("Dropping unserializable response: {}", e);
                    continue;
                }
            };
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    info!("{} {} serving", provider.name(), provider.version());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!("Unparseable request: {}", e);
                let _ = tx.send(Response::error(0, RpcError::parse_error())).await;
                continue;
            }
        };

        if request.method == methods::SHUTDOWN {
            debug!("Shutdown requested");
            break;
        }

        let provider = Arc::clone(&provider);
        let tx = tx.clone();
        tokio::spawn(async move {
            let response = dispatch(provider.as_ref(), request).await;
            let _ = tx.send(response).await;
        });
    }

    drop(tx);
    let _ = writer.await;
    info!("{} stopped", provider.name());
    Ok(())
}

async fn dispatch<P: PriceProvider>(provider: &P, request: Request) -> Response {
    let id = request.id;
    let result = match request.method.as_str() {
        methods::HANDSHAKE => handshake(provider, request.params),
        methods::STATE => state(provider).await,
        methods::FETCH_PRICES => fetch_prices(provider, request.params).await,
        other => Err(RpcError::method_not_found(other)),
    };

    match result {
        Ok(value) => Response::success(id, value),
        Err(error) => Response::error(id, error),
    }
}

fn handshake<P: PriceProvider>(provider: &P, params: serde_json::Value) -> Result<serde_json::Value, RpcError> {
    let params: HandshakeParams =
        serde_json::from_value(params).map_err(|e| RpcError::invalid_params(&e.to_string()))?;
    if params.magic_cookie != MAGIC_COOKIE_VALUE {
        return Err(RpcError::invalid_params("magic cookie mismatch"));
    }

    to_value(HandshakeResult {
        protocol_version: PROTOCOL_VERSION,
        name: provider.name().to_string(),
        version: provider.version().to_string(),
    })
}

async fn state<P: PriceProvider>(provider: &P) -> Result<serde_json::Value, RpcError> {
    let symbols = provider
        .available_symbols()
        .await
        .map_err(|e| RpcError::internal_error(&e.to_string()))?;
    to_value(StateResult {
        version: provider.version().to_string(),
        available_symbols: symbols,
    })
}

async fn fetch_prices<P: PriceProvider>(
    provider: &P,
    params: serde_json::Value,
) -> Result<serde_json::Value, RpcError> {
    let params: FetchPricesParams =
        serde_json::from_value(params).map_err(|e| RpcError::invalid_params(&e.to_string()))?;
    let result = provider
        .fetch(&params.symbols)
        .await
        .map_err(|e| RpcError::internal_error(&e.to_string()))?;
    to_value(result)
}

fn to_value<T: serde::Serialize>(value: T) -> Result<serde_json::Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::internal_error(&e.to_string()))
}
