//! Plugin process supervisor - owns every plugin's lifecycle
//!
//! One entry per plugin holds its source handle, lifecycle state and
//! resolver. A liveness task per plugin refreshes `state()` on a fixed
//! cadence and restarts crashed plugins with exponential backoff, off the
//! round's critical path.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use oracle_core::{
    unix_now, CachedObservation, PluginError, PluginInfo, PluginResult, PluginState,
    PriceObservation, Symbol, SupervisorSettings, UnixTimestamp,
};

use crate::resolver::SymbolResolver;
use crate::source::{DataSource, PluginSpec, SourceLauncher};

/// Supervisor configuration
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub handshake_timeout: Duration,
    pub call_timeout: Duration,
    pub refresh_interval: Duration,
    pub restart_backoff_initial: Duration,
    pub restart_backoff_max: Duration,
    pub max_restart_attempts: u32,
    pub max_consecutive_failures: u32,
    pub discovery_interval: Option<Duration>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(10),
            refresh_interval: Duration::from_secs(30),
            restart_backoff_initial: Duration::from_secs(1),
            restart_backoff_max: Duration::from_secs(60),
            max_restart_attempts: 10,
            max_consecutive_failures: 3,
            discovery_interval: Some(Duration::from_secs(10)),
        }
    }
}

impl From<&SupervisorSettings> for SupervisorConfig {
    fn from(s: &SupervisorSettings) -> Self {
        Self {
            handshake_timeout: Duration::from_millis(s.handshake_timeout_ms),
            call_timeout: Duration::from_millis(s.call_timeout_ms),
            refresh_interval: Duration::from_secs(s.state_refresh_interval_secs.max(1)),
            restart_backoff_initial: Duration::from_millis(s.restart_backoff_initial_ms),
            restart_backoff_max: Duration::from_millis(s.restart_backoff_max_ms),
            max_restart_attempts: s.max_restart_attempts,
            max_consecutive_failures: s.max_consecutive_failures.max(1),
            discovery_interval: (s.discovery_interval_secs > 0)
                .then(|| Duration::from_secs(s.discovery_interval_secs)),
        }
    }
}

impl SupervisorConfig {
    /// Delay before the n-th consecutive restart attempt (1-based)
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(16);
        self.restart_backoff_initial
            .saturating_mul(1u32 << exponent)
            .min(self.restart_backoff_max)
    }
}

/// One plugin's contribution to a round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginFetch {
    pub plugin: String,
    pub prices: Vec<PriceObservation>,
    pub bad_symbols: Vec<Symbol>,
    pub from_cache: bool,
}

#[derive(Debug)]
struct EntryStatus {
    state: PluginState,
    version: String,
    restarts: u32,
    consecutive_failures: u32,
    failed_launches: u32,
    next_restart_at: Option<Instant>,
    started_at: Option<UnixTimestamp>,
}

struct PluginEntry {
    spec: RwLock<PluginSpec>,
    status: RwLock<EntryStatus>,
    source: RwLock<Option<Arc<dyn DataSource>>>,
    resolver: SymbolResolver,
}

impl PluginEntry {
    fn new(spec: PluginSpec) -> Self {
        Self {
            resolver: SymbolResolver::new(spec.name.clone()),
            spec: RwLock::new(spec),
            status: RwLock::new(EntryStatus {
                state: PluginState::Starting,
                version: String::new(),
                restarts: 0,
                consecutive_failures: 0,
                failed_launches: 0,
                next_restart_at: None,
                started_at: None,
            }),
            source: RwLock::new(None),
        }
    }

    fn state(&self) -> PluginState {
        self.status.read().state
    }

    fn source(&self) -> Option<Arc<dyn DataSource>> {
        self.source.read().clone()
    }

    fn take_source(&self) -> Option<Arc<dyn DataSource>> {
        self.source.write().take()
    }

    fn update_interval_secs(&self) -> u64 {
        self.spec.read().config.data_update_interval_secs
    }
}

/// Supervises all plugin processes
pub struct PluginSupervisor {
    config: SupervisorConfig,
    launcher: Arc<dyn SourceLauncher>,
    plugins: DashMap<String, Arc<PluginEntry>>,
    tasks: DashMap<String, JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl PluginSupervisor {
    pub fn new(config: SupervisorConfig, launcher: Arc<dyn SourceLauncher>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            launcher,
            plugins: DashMap::new(),
            tasks: DashMap::new(),
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    fn entry(&self, name: &str) -> PluginResult<Arc<PluginEntry>> {
        self.plugins
            .get(name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| PluginError::NotFound(name.to_string()))
    }

    /// Start every plugin concurrently and attach a liveness task to each.
    ///
    /// Returns how many came up. Failed plugins stay registered as Crashed
    /// and are retried by their liveness task.
    pub async fn start_all(self: &Arc<Self>, specs: Vec<PluginSpec>) -> usize {
        let starts = specs.into_iter().map(|spec| {
            let name = spec.name.clone();
            async move { (name, self.start(spec).await) }
        });

        let mut started = 0;
        for (name, result) in futures::future::join_all(starts).await {
            match result {
                Ok(()) => started += 1,
                Err(e) => error!(plugin = %name, "Plugin failed to start: {}", e),
            }
            self.spawn_liveness(name);
        }
        started
    }

    /// Spawn a plugin, handshake and load its initial state.
    ///
    /// Failure leaves the plugin Crashed with a restart scheduled; it is
    /// reported, never retried here.
    pub async fn start(&self, spec: PluginSpec) -> PluginResult<()> {
        let name = spec.name.clone();
        let entry = Arc::new(PluginEntry::new(spec));

        if let Some(previous) = self.plugins.insert(name, Arc::clone(&entry)) {
            if let Some(source) = previous.take_source() {
                source.close().await;
            }
        }

        self.launch(&entry).await
    }

    async fn launch(&self, entry: &PluginEntry) -> PluginResult<()> {
        let spec = entry.spec.read().clone();
        entry.status.write().state = PluginState::Starting;

        let launched = async {
            let source = self.launcher.launch(&spec).await?;
            match self.call_state(&spec.name, source.as_ref()).await {
                Ok(state) => Ok::<_, PluginError>((source, state)),
                Err(e) => {
                    source.close().await;
                    Err(e)
                }
            }
        }
        .await;

        match launched {
            Ok((source, state)) => {
                entry.resolver.refresh_available(&state.available_symbols);
                *entry.source.write() = Some(source);

                let mut status = entry.status.write();
                status.state = PluginState::Running;
                status.version = state.version;
                status.consecutive_failures = 0;
                status.failed_launches = 0;
                status.next_restart_at = None;
                status.started_at = Some(unix_now());

                info!(
                    plugin = %spec.name,
                    version = %status.version,
                    symbols = state.available_symbols.len(),
                    "Plugin running"
                );
                Ok(())
            }
            Err(e) => {
                let mut status = entry.status.write();
                status.state = PluginState::Crashed;
                status.failed_launches += 1;
                status.next_restart_at =
                    Some(Instant::now() + self.config.backoff(status.failed_launches));
                Err(e)
            }
        }
    }

    async fn call_state(
        &self,
        name: &str,
        source: &dyn DataSource,
    ) -> PluginResult<crate::protocol::StateResult> {
        match tokio::time::timeout(self.config.call_timeout, source.state()).await {
            Ok(result) => result,
            Err(_) => Err(PluginError::Timeout {
                name: name.to_string(),
                after: self.config.call_timeout,
            }),
        }
    }

    /// Fetch prices for `symbols` from one plugin, bounded by `timeout`.
    ///
    /// The plugin's cache is consulted first. Symbols the plugin cannot
    /// resolve, or answers stale or not at all, come back as bad symbols.
    pub async fn invoke(
        &self,
        name: &str,
        symbols: &[Symbol],
        timeout: Duration,
    ) -> PluginResult<PluginFetch> {
        let entry = self.entry(name)?;
        let state = entry.state();
        let source = match entry.source() {
            Some(source) if state.is_live() => source,
            _ => {
                return Err(PluginError::NotLive {
                    name: name.to_string(),
                    state,
                })
            }
        };

        let resolution = entry.resolver.resolve(symbols);
        let mut fetch = PluginFetch {
            plugin: name.to_string(),
            prices: vec![],
            bad_symbols: resolution.bad.clone(),
            from_cache: false,
        };

        if resolution.native.is_empty() {
            debug!(plugin = %name, "No requested symbol is available from plugin");
            return Ok(fetch);
        }

        let now = unix_now();
        if let Ok(cached) = entry.resolver.get_cached(&resolution.native, now) {
            fetch.prices = cached;
            fetch.from_cache = true;
            return Ok(fetch);
        }

        let result = match tokio::time::timeout(timeout, source.fetch_prices(&resolution.native)).await {
            Ok(result) => result,
            Err(_) => Err(PluginError::Timeout {
                name: name.to_string(),
                after: timeout,
            }),
        };

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                self.record_failure(&entry, &e).await;
                return Err(e);
            }
        };
        self.record_success(&entry);

        let interval = entry.update_interval_secs();
        let mut served = HashSet::new();
        let mut fresh = Vec::with_capacity(report.prices.len());

        for wire in report.prices {
            let Some(canonical) = resolution.native_to_canonical.get(&wire.symbol) else {
                debug!(plugin = %name, symbol = %wire.symbol, "Ignoring unrequested symbol");
                continue;
            };
            let observation = PriceObservation {
                symbol: canonical.clone(),
                price: wire.price,
                timestamp: if wire.timestamp > 0 { wire.timestamp } else { now },
                source: name.to_string(),
            };
            if !CachedObservation::new(observation.clone(), interval).is_fresh(now) {
                continue;
            }
            if served.insert(wire.symbol.clone()) {
                fresh.push((wire.symbol, observation));
            }
        }

        for native in &resolution.native {
            if !served.contains(native) {
                fetch.bad_symbols.push(resolution.native_to_canonical[native].clone());
            }
        }

        entry.resolver.update(fresh.iter().cloned(), interval);
        fetch.prices = fresh.into_iter().map(|(_, o)| o).collect();
        Ok(fetch)
    }

    /// Re-query `state()` and update the available symbol set.
    ///
    /// A plugin that fails to answer is marked Crashed.
    pub async fn refresh_state(&self, name: &str) -> PluginResult<()> {
        let entry = self.entry(name)?;
        let state = entry.state();
        let source = match entry.source() {
            Some(source) if state.is_live() => source,
            _ => {
                return Err(PluginError::NotLive {
                    name: name.to_string(),
                    state,
                })
            }
        };

        match self.call_state(name, source.as_ref()).await {
            Ok(result) => {
                entry.resolver.refresh_available(&result.available_symbols);
                entry.status.write().version = result.version;
                self.record_success(&entry);
                Ok(())
            }
            Err(e) => {
                warn!(plugin = %name, "State refresh failed: {}", e);
                self.crash(&entry).await;
                Err(e)
            }
        }
    }

    /// Respawn a crashed plugin. Gives up after `max_restart_attempts`
    /// consecutive failures until the binary changes.
    pub async fn restart(&self, name: &str) -> PluginResult<()> {
        let entry = self.entry(name)?;

        {
            let status = entry.status.read();
            if status.failed_launches >= self.config.max_restart_attempts {
                return Err(PluginError::NotLive {
                    name: name.to_string(),
                    state: status.state,
                });
            }
        }

        if let Some(source) = entry.take_source() {
            source.close().await;
        }

        match self.launch(&entry).await {
            Ok(()) => {
                let restarts = {
                    let mut status = entry.status.write();
                    status.restarts += 1;
                    status.restarts
                };
                info!(plugin = %name, restarts, "Plugin restarted");
                Ok(())
            }
            Err(e) => {
                let status = entry.status.read();
                warn!(
                    plugin = %name,
                    attempt = status.failed_launches,
                    max = self.config.max_restart_attempts,
                    "Plugin restart failed: {}",
                    e
                );
                Err(e)
            }
        }
    }

    fn record_success(&self, entry: &PluginEntry) {
        let mut status = entry.status.write();
        status.consecutive_failures = 0;
        if status.state == PluginState::Degraded {
            status.state = PluginState::Running;
            info!(plugin = %entry.resolver.plugin(), "Plugin recovered");
        }
    }

    async fn record_failure(&self, entry: &PluginEntry, error: &PluginError) {
        let escalate = error.is_fatal() || {
            let mut status = entry.status.write();
            status.consecutive_failures += 1;
            if status.consecutive_failures < self.config.max_consecutive_failures {
                if status.state == PluginState::Running {
                    status.state = PluginState::Degraded;
                }
                false
            } else {
                true
            }
        };

        if escalate {
            self.crash(entry).await;
        } else {
            warn!(plugin = %entry.resolver.plugin(), "Plugin degraded: {}", error);
        }
    }

    async fn crash(&self, entry: &PluginEntry) {
        {
            let mut status = entry.status.write();
            if matches!(status.state, PluginState::Crashed | PluginState::Stopped) {
                return;
            }
            status.state = PluginState::Crashed;
            status.failed_launches = 0;
            status.next_restart_at = Some(Instant::now() + self.config.restart_backoff_initial);
        }
        error!(plugin = %entry.resolver.plugin(), "Plugin crashed, excluded until restart");

        if let Some(source) = entry.take_source() {
            source.close().await;
        }
    }

    fn spawn_liveness(self: &Arc<Self>, name: String) {
        let supervisor = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            loop {
                let wait = supervisor.next_check_delay(&task_name);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.changed() => break,
                }
                if !supervisor.check(&task_name).await {
                    break;
                }
            }
            debug!(plugin = %task_name, "Liveness task stopped");
        });

        if let Some(previous) = self.tasks.insert(name, handle) {
            previous.abort();
        }
    }

    fn next_check_delay(&self, name: &str) -> Duration {
        let Ok(entry) = self.entry(name) else {
            return Duration::ZERO;
        };
        let status = entry.status.read();
        match (status.state, status.next_restart_at) {
            (PluginState::Crashed, Some(at)) if status.failed_launches < self.config.max_restart_attempts => {
                at.saturating_duration_since(Instant::now())
            }
            _ => self.config.refresh_interval,
        }
    }

    /// One liveness pass. Returns false once the plugin is gone.
    async fn check(&self, name: &str) -> bool {
        let Ok(entry) = self.entry(name) else {
            return false;
        };

        let (state, due) = {
            let status = entry.status.read();
            let due = status.failed_launches < self.config.max_restart_attempts
                && status.next_restart_at.map_or(true, |at| at <= Instant::now());
            (status.state, due)
        };

        match state {
            PluginState::Running | PluginState::Degraded => {
                let _ = self.refresh_state(name).await;
            }
            PluginState::Crashed if due => {
                let _ = self.restart(name).await;
            }
            PluginState::Stopped => return false,
            _ => {}
        }
        true
    }

    /// Bring the running set in line with a fresh directory scan.
    ///
    /// New plugins are started, plugins whose binary changed are restarted
    /// and plugins whose binary vanished are stopped.
    pub async fn reconcile(self: &Arc<Self>, specs: Vec<PluginSpec>) {
        let wanted: HashSet<String> = specs.iter().map(|s| s.name.clone()).collect();

        let vanished: Vec<String> = self
            .plugins
            .iter()
            .filter(|e| !wanted.contains(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for name in vanished {
            info!(plugin = %name, "Plugin binary removed");
            self.stop(&name).await;
        }

        for spec in specs {
            let name = spec.name.clone();
            match self.entry(&name) {
                Err(_) => {
                    info!(plugin = %name, "New plugin discovered");
                    if let Err(e) = self.start(spec).await {
                        error!(plugin = %name, "Plugin failed to start: {}", e);
                    }
                    self.spawn_liveness(name);
                }
                Ok(entry) => {
                    let changed = {
                        let current = entry.spec.read();
                        current.modified != spec.modified || current.config != spec.config
                    };
                    if changed {
                        info!(plugin = %name, "Plugin binary or config changed, reloading");
                        *entry.spec.write() = spec;
                        entry.status.write().failed_launches = 0;
                        if let Err(e) = self.restart(&name).await {
                            error!(plugin = %name, "Plugin reload failed: {}", e);
                        }
                    }
                }
            }
        }
    }

    /// Stop one plugin and forget it
    pub async fn stop(&self, name: &str) {
        if let Some((_, handle)) = self.tasks.remove(name) {
            handle.abort();
        }
        if let Some((_, entry)) = self.plugins.remove(name) {
            entry.status.write().state = PluginState::Stopped;
            if let Some(source) = entry.take_source() {
                source.close().await;
            }
        }
    }

    /// Stop liveness tasks and release every plugin process
    pub async fn shutdown(&self) {
        info!("Stopping plugin supervisor");
        let _ = self.shutdown_tx.send(true);

        let names: Vec<String> = self.tasks.iter().map(|t| t.key().clone()).collect();
        for name in names {
            if let Some((_, handle)) = self.tasks.remove(&name) {
                handle.abort();
            }
        }

        let entries: Vec<Arc<PluginEntry>> =
            self.plugins.iter().map(|e| Arc::clone(e.value())).collect();
        let closes = entries.iter().map(|entry| async move {
            entry.status.write().state = PluginState::Stopped;
            if let Some(source) = entry.take_source() {
                source.close().await;
            }
        });
        futures::future::join_all(closes).await;
    }

    /// Plugins currently taking part in fan-outs, by name
    pub fn live_plugins(&self) -> Vec<String> {
        let mut live: Vec<String> = self
            .plugins
            .iter()
            .filter(|e| e.value().state().is_live())
            .map(|e| e.key().clone())
            .collect();
        live.sort();
        live
    }

    pub fn plugin_state(&self, name: &str) -> Option<PluginState> {
        self.plugins.get(name).map(|e| e.value().state())
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    /// Diagnostics view of every plugin
    pub fn snapshot(&self) -> Vec<PluginInfo> {
        let mut infos: Vec<PluginInfo> = self
            .plugins
            .iter()
            .map(|e| {
                let entry = e.value();
                let status = entry.status.read();
                PluginInfo {
                    name: e.key().clone(),
                    version: status.version.clone(),
                    state: status.state,
                    available_symbols: entry.resolver.available_count(),
                    restarts: status.restarts,
                    started_at: status.started_at,
                }
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Unexpired cached observations grouped by symbol
    pub fn cached_prices(&self) -> BTreeMap<Symbol, Vec<PriceObservation>> {
        let now = unix_now();
        let mut prices: BTreeMap<Symbol, Vec<PriceObservation>> = BTreeMap::new();
        for entry in self.plugins.iter() {
            for cached in entry.value().resolver.snapshot(now) {
                prices
                    .entry(cached.observation.symbol.clone())
                    .or_default()
                    .push(cached.observation);
            }
        }
        for observations in prices.values_mut() {
            observations.sort_by(|a, b| a.source.cmp(&b.source));
        }
        prices
    }
}
