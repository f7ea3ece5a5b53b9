//! Subprocess transport for plugins
//!
//! Each plugin runs as a child process. Requests are written to its stdin,
//! responses are read from its stdout by a dedicated task and routed back to
//! the waiting caller by request id. Stderr is forwarded into our log.

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use oracle_core::{PluginError, PluginResult};

use crate::protocol::{
    methods, FetchPricesParams, FetchPricesResult, HandshakeParams, HandshakeResult, Request,
    Response, StateResult, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE, PLUGIN_CONF_ENV,
    PROTOCOL_VERSION,
};
use crate::source::{DataSource, PluginSpec, SourceLauncher};

type PendingCalls = DashMap<u64, oneshot::Sender<PluginResult<Response>>>;

/// A plugin reached over its stdin/stdout
pub struct ProcessSource {
    name: String,
    version: String,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Child>,
    pending: Arc<PendingCalls>,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessSource {
    /// Spawn the plugin binary without talking to it yet
    pub fn spawn(spec: &PluginSpec) -> PluginResult<Self> {
        let spawn_err = |reason: String| PluginError::Spawn {
            name: spec.name.clone(),
            reason,
        };

        let conf = serde_json::to_string(&spec.config).map_err(|e| spawn_err(e.to_string()))?;

        let mut child = Command::new(&spec.path)
            .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
            .env(PLUGIN_CONF_ENV, conf)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_err(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_err("stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_err("stdout not captured".into()))?;

        let pending: Arc<PendingCalls> = Arc::new(DashMap::new());
        let alive = Arc::new(AtomicBool::new(true));

        let mut tasks = vec![tokio::spawn(read_responses(
            spec.name.clone(),
            stdout,
            Arc::clone(&pending),
            Arc::clone(&alive),
        ))];
        if let Some(stderr) = child.stderr.take() {
            tasks.push(tokio::spawn(forward_stderr(spec.name.clone(), stderr)));
        }

        debug!(plugin = %spec.name, pid = ?child.id(), "Spawned plugin process");

        Ok(Self {
            name: spec.name.clone(),
            version: String::new(),
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(child),
            pending,
            next_id: AtomicU64::new(1),
            alive,
            tasks: parking_lot::Mutex::new(tasks),
        })
    }

    /// Verify the plugin speaks our protocol, bounded by `timeout`
    pub async fn handshake(&mut self, timeout: Duration) -> PluginResult<()> {
        let params = HandshakeParams {
            protocol_version: PROTOCOL_VERSION,
            magic_cookie: MAGIC_COOKIE_VALUE.to_string(),
        };

        let result: HandshakeResult =
            match tokio::time::timeout(timeout, self.call(methods::HANDSHAKE, params)).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => return Err(self.handshake_error(e.to_string())),
                Err(_) => return Err(self.handshake_error(format!("no reply within {timeout:?}"))),
            };

        if result.protocol_version != PROTOCOL_VERSION {
            return Err(self.handshake_error(format!(
                "protocol version {} (expected {})",
                result.protocol_version, PROTOCOL_VERSION
            )));
        }

        self.version = result.version;
        Ok(())
    }

    fn handshake_error(&self, reason: String) -> PluginError {
        PluginError::Handshake {
            name: self.name.clone(),
            reason,
        }
    }

    async fn call<P: Serialize, R: DeserializeOwned>(&self, method: &str, params: P) -> PluginResult<R> {
        if !self.is_alive() {
            return Err(PluginError::ChannelClosed(self.name.clone()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let _guard = PendingGuard { pending: &self.pending, id };

        self.send(id, method, params).await?;

        let response = rx
            .await
            .map_err(|_| PluginError::ChannelClosed(self.name.clone()))??;
        decode(&self.name, response)
    }

    async fn send<P: Serialize>(&self, id: u64, method: &str, params: P) -> PluginResult<()> {
        let params = serde_json::to_value(params).map_err(|e| PluginError::Malformed {
            name: self.name.clone(),
            reason: e.to_string(),
        })?;
        let mut line = serde_json::to_string(&Request::new(id, method, params)).map_err(|e| {
            PluginError::Malformed {
                name: self.name.clone(),
                reason: e.to_string(),
            }
        })?;
        line.push('\n');

        let mut stdin = self.stdin.lock().await;
        let pipe = stdin
            .as_mut()
            .ok_or_else(|| PluginError::ChannelClosed(self.name.clone()))?;
        pipe.write_all(line.as_bytes())
            .await
            .map_err(|_| PluginError::ChannelClosed(self.name.clone()))?;
        pipe.flush()
            .await
            .map_err(|_| PluginError::ChannelClosed(self.name.clone()))
    }
}

#[async_trait::async_trait]
impl DataSource for ProcessSource {
    async fn fetch_prices(&self, symbols: &[String]) -> PluginResult<FetchPricesResult> {
        let params = FetchPricesParams {
            symbols: symbols.to_vec(),
        };
        self.call(methods::FETCH_PRICES, params).await
    }

    async fn state(&self) -> PluginResult<StateResult> {
        self.call(methods::STATE, serde_json::Value::Null).await
    }

    async fn close(&self) {
        if self.is_alive() {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let notify = self.send(id, methods::SHUTDOWN, serde_json::Value::Null);
            let _ = tokio::time::timeout(Duration::from_millis(500), notify).await;
        }

        // Dropping stdin gives the plugin EOF
        self.stdin.lock().await.take();

        if let Err(e) = self.child.lock().await.kill().await {
            debug!(plugin = %self.name, "Kill after shutdown: {}", e);
        }

        self.alive.store(false, Ordering::SeqCst);
        self.pending.clear();
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn version(&self) -> &str {
        &self.version
    }
}

/// Removes an abandoned call's slot, e.g. when the caller timed out
struct PendingGuard<'a> {
    pending: &'a PendingCalls,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

fn decode<R: DeserializeOwned>(name: &str, response: Response) -> PluginResult<R> {
    if let Some(error) = response.error {
        return Err(PluginError::Remote {
            name: name.to_string(),
            code: error.code,
            message: error.message,
        });
    }

    let value = response.result.ok_or_else(|| PluginError::Malformed {
        name: name.to_string(),
        reason: "response carries neither result nor error".into(),
    })?;

    serde_json::from_value(value).map_err(|e| PluginError::Malformed {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

async fn read_responses(
    name: String,
    stdout: ChildStdout,
    pending: Arc<PendingCalls>,
    alive: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Response>(&line) {
                    Ok(response) => match pending.remove(&response.id) {
                        Some((_, tx)) => {
                            let _ = tx.send(Ok(response));
                        }
                        None => debug!(plugin = %name, id = response.id, "Dropping reply to abandoned call"),
                    },
                    Err(e) => {
                        // The stream can no longer be trusted to frame replies
                        warn!(plugin = %name, "Unparseable plugin output, closing channel: {}", e);
                        alive.store(false, Ordering::SeqCst);
                        fail_pending(&name, &pending, &e.to_string());
                        break;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(plugin = %name, "Reading plugin stdout failed: {}", e);
                break;
            }
        }
    }

    info!(plugin = %name, "Plugin channel closed");
    alive.store(false, Ordering::SeqCst);
    // Dropping the senders fails every waiting call
    pending.clear();
}

fn fail_pending(name: &str, pending: &PendingCalls, reason: &str) {
    let ids: Vec<u64> = pending.iter().map(|e| *e.key()).collect();
    for id in ids {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(Err(PluginError::Malformed {
                name: name.to_string(),
                reason: reason.to_string(),
            }));
        }
    }
}

async fn forward_stderr(name: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "plugin", plugin = %name, "{}", line);
    }
}

/// Launches plugin binaries as subprocesses
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    handshake_timeout: Duration,
}

impl ProcessLauncher {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }
}

#[async_trait::async_trait]
impl SourceLauncher for ProcessLauncher {
    async fn launch(&self, spec: &PluginSpec) -> PluginResult<Arc<dyn DataSource>> {
        let mut source = ProcessSource::spawn(spec)?;

        if let Err(e) = source.handshake(self.handshake_timeout).await {
            source.close().await;
            return Err(e);
        }

        info!(plugin = %spec.name, version = %source.version(), "Plugin handshake complete");
        Ok(Arc::new(source))
    }
}
