//! Round controller
//!
//! Drives one round at a time through the phases in [`crate::machine`]:
//! wait for the chain's next round, fan out to every live plugin, aggregate,
//! submit and confirm. Symbol-set, committee and precision changes are
//! picked up in `Reconfiguring` before the next fetch uses them.

use alloy_primitives::Address;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use oracle_core::{
    unix_now, AggregationSettings, ChainError, ChainResult, RoundId, RoundSettings, RoundWindow, SupervisorSettings, Symbol,
};
use oracle_plugins::{PluginFetch, PluginSupervisor};
use oracle_reporter::{
    ChainGateway, Confirmation, Report, ReportBuilder, ReportSubmitter, SubmitOutcome,
    SubmitterConfig, TxHash,
};

use crate::aggregator::{AggregationPolicy, Aggregator, RoundAggregation};
use crate::machine::{transition, PhaseEvent, RoundPhase};

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Gateway polling cadence while waiting for a round
    pub poll_interval: Duration,
    /// Bound on a whole fan-out
    pub fetch_timeout: Duration,
    /// Bound on each plugin's call
    pub call_timeout: Duration,
    /// Submissions stop this long before the next round starts
    pub submit_guard: Duration,
    pub submitter: SubmitterConfig,
    pub aggregation: AggregationPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            fetch_timeout: Duration::from_secs(12),
            call_timeout: Duration::from_secs(10),
            submit_guard: Duration::from_secs(5),
            submitter: SubmitterConfig::default(),
            aggregation: AggregationPolicy::default(),
        }
    }
}

impl ControllerConfig {
    pub fn from_settings(
        round: &RoundSettings,
        supervisor: &SupervisorSettings,
        aggregation: &AggregationSettings,
    ) -> Self {
        Self {
            poll_interval: Duration::from_millis(round.poll_interval_ms.max(1)),
            fetch_timeout: Duration::from_millis(round.fetch_timeout_ms),
            call_timeout: Duration::from_millis(supervisor.call_timeout_ms),
            submit_guard: Duration::from_secs(round.submit_guard_secs),
            submitter: SubmitterConfig::from(round),
            aggregation: AggregationPolicy::from(aggregation),
        }
    }
}

/// Outcome of checking a previously reported symbol on-chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AuditOutcome {
    Reported,
    MissingOrRejected { status: u64 },
    Unavailable { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolAudit {
    pub round: RoundId,
    pub symbol: Symbol,
    #[serde(flatten)]
    pub outcome: AuditOutcome,
}

/// Snapshot of the controller for diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub phase: RoundPhase,
    pub round: Option<RoundId>,
    pub tracked_symbols: Vec<Symbol>,
    pub in_committee: bool,
    pub precision: u64,
    pub last_aggregation: Option<RoundAggregation>,
    pub last_submission: Option<String>,
    pub last_confirmation: Option<String>,
    pub last_audit: Vec<SymbolAudit>,
    pub rounds_completed: u64,
}

impl Default for ControllerStatus {
    fn default() -> Self {
        Self {
            phase: RoundPhase::Idle,
            round: None,
            tracked_symbols: vec![],
            in_committee: false,
            precision: 0,
            last_aggregation: None,
            last_submission: None,
            last_confirmation: None,
            last_audit: vec![],
            rounds_completed: 0,
        }
    }
}

pub type SharedStatus = Arc<RwLock<ControllerStatus>>;

/// On-chain parameters that, when changed, force a reconfiguration
#[derive(Debug, Clone, PartialEq, Eq)]
struct Tracked {
    symbols: Arc<Vec<Symbol>>,
    committee: Vec<Address>,
    precision: u64,
}

/// The round state machine driver
pub struct RoundController {
    config: ControllerConfig,
    supervisor: Arc<PluginSupervisor>,
    gateway: Arc<dyn ChainGateway>,
    aggregator: Aggregator,
    submitter: ReportSubmitter,
    phase: RoundPhase,
    tracked: Option<Tracked>,
    /// Last round a fetch started for
    last_round: Option<RoundId>,
    window: Option<RoundWindow>,
    fetches: Vec<PluginFetch>,
    report: Option<Report>,
    pending_tx: Option<TxHash>,
    /// Round and symbols of the last successful submission, audited next round
    reported: Option<(RoundId, Vec<Symbol>)>,
    status: SharedStatus,
}

impl RoundController {
    pub fn new(
        config: ControllerConfig,
        supervisor: Arc<PluginSupervisor>,
        gateway: Arc<dyn ChainGateway>,
    ) -> Self {
        let submitter = ReportSubmitter::new(config.submitter.clone(), Arc::clone(&gateway));
        Self {
            aggregator: Aggregator::new(config.aggregation),
            config,
            supervisor,
            gateway,
            submitter,
            phase: RoundPhase::Idle,
            tracked: None,
            last_round: None,
            window: None,
            fetches: vec![],
            report: None,
            pending_tx: None,
            reported: None,
            status: Arc::new(RwLock::new(ControllerStatus::default())),
        }
    }

    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    /// Handle for read-only status queries
    pub fn status_handle(&self) -> SharedStatus {
        Arc::clone(&self.status)
    }

    pub fn status(&self) -> ControllerStatus {
        self.status.read().clone()
    }

    /// Drive rounds until shutdown
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting round controller");
        while !*shutdown.borrow() {
            if self.step(&mut shutdown).await.is_none() {
                break;
            }
        }
        info!("Round controller stopped in {}", self.phase);
    }

    /// Run the current phase to completion and move to the next.
    ///
    /// Returns None when shutdown interrupted the phase.
    pub async fn step(&mut self, shutdown: &mut watch::Receiver<bool>) -> Option<RoundPhase> {
        let event = match self.phase {
            RoundPhase::Idle => PhaseEvent::Ready,
            RoundPhase::AwaitingRoundBoundary => self.await_boundary(shutdown).await?,
            RoundPhase::Reconfiguring => self.reconfigure(shutdown).await?,
            RoundPhase::Fetching => self.fetch(shutdown).await?,
            RoundPhase::Aggregating => self.aggregate(),
            RoundPhase::Submitting => self.submit(shutdown).await?,
            RoundPhase::Confirming => self.confirm(shutdown).await?,
        };
        Some(self.advance(event))
    }

    fn advance(&mut self, event: PhaseEvent) -> RoundPhase {
        let next = match transition(self.phase, event) {
            Ok(next) => next,
            Err(e) => {
                error!("{}, restarting cycle", e);
                RoundPhase::Idle
            }
        };
        debug!(from = %self.phase, to = %next, "Round phase transition");

        if next == RoundPhase::Idle && self.phase != RoundPhase::Idle {
            self.finish_round();
        }
        self.phase = next;
        self.status.write().phase = next;
        next
    }

    fn finish_round(&mut self) {
        self.fetches.clear();
        self.report = None;
        self.pending_tx = None;
        self.status.write().rounds_completed += 1;
    }

    async fn await_boundary(&mut self, shutdown: &mut watch::Receiver<bool>) -> Option<PhaseEvent> {
        let Some(tracked) = self.tracked.clone() else {
            return Some(PhaseEvent::ChangeDetected);
        };

        loop {
            match self.gateway.round_window().await {
                Ok(window) => {
                    if self.detect_change(&tracked).await {
                        return Some(PhaseEvent::ChangeDetected);
                    }
                    if self.last_round.map_or(true, |last| window.round_id > last) {
                        self.begin_round(window);
                        return Some(PhaseEvent::BoundaryReached);
                    }
                }
                Err(e) => warn!("Reading round window failed: {}", e),
            }

            if !pause(self.config.poll_interval, shutdown).await {
                return None;
            }
        }
    }

    async fn detect_change(&self, tracked: &Tracked) -> bool {
        let current = match self.read_tracked().await {
            Ok(current) => current,
            Err(e) => {
                debug!("Change detection skipped: {}", e);
                return false;
            }
        };
        if current != *tracked {
            info!("On-chain symbols, committee or precision changed");
            return true;
        }
        false
    }

    async fn read_tracked(&self) -> ChainResult<Tracked> {
        let mut symbols = self.gateway.symbols().await?;
        symbols.sort();
        symbols.dedup();
        let mut committee = self.gateway.committee_members().await?;
        committee.sort();
        let precision = self.gateway.precision().await?;
        if precision == 0 {
            return Err(ChainError::Malformed("price precision is zero".into()));
        }
        Ok(Tracked {
            symbols: Arc::new(symbols),
            committee,
            precision,
        })
    }

    fn begin_round(&mut self, window: RoundWindow) {
        info!(
            round = window.round_id,
            secs_left = window.secs_until_next(unix_now()),
            "Round boundary reached"
        );
        self.last_round = Some(window.round_id);
        self.window = Some(window);
        self.status.write().round = Some(window.round_id);

        if let Some((round, symbols)) = self.reported.take() {
            if round < window.round_id {
                tokio::spawn(audit_round(
                    Arc::clone(&self.gateway),
                    Arc::clone(&self.status),
                    round,
                    symbols,
                ));
            }
        }
    }

    async fn reconfigure(&mut self, shutdown: &mut watch::Receiver<bool>) -> Option<PhaseEvent> {
        match self.read_tracked().await {
            Ok(tracked) => {
                let in_committee = tracked.committee.contains(&self.gateway.node_address());
                info!(
                    symbols = tracked.symbols.len(),
                    committee = tracked.committee.len(),
                    precision = tracked.precision,
                    in_committee,
                    "Reconfigured"
                );
                {
                    let mut status = self.status.write();
                    status.tracked_symbols = tracked.symbols.to_vec();
                    status.in_committee = in_committee;
                    status.precision = tracked.precision;
                }
                self.tracked = Some(tracked);
            }
            Err(e) => {
                warn!("Reconfiguration failed, keeping previous parameters: {}", e);
                if !pause(self.config.poll_interval, shutdown).await {
                    return None;
                }
            }
        }
        Some(PhaseEvent::Reconfigured)
    }

    /// Fan out to every live plugin, bounded per call and as a whole
    async fn fetch(&mut self, shutdown: &mut watch::Receiver<bool>) -> Option<PhaseEvent> {
        let symbols = self
            .tracked
            .as_ref()
            .map(|t| Arc::clone(&t.symbols))
            .unwrap_or_default();
        let plugins = self.supervisor.live_plugins();
        let round = self.window.map(|w| w.round_id).unwrap_or_default();

        if plugins.is_empty() {
            warn!(round, "No live plugins this round");
        }

        let started = Instant::now();
        let deadline = started + self.config.fetch_timeout;
        let mut tasks = JoinSet::new();
        for name in plugins {
            let supervisor = Arc::clone(&self.supervisor);
            let symbols = Arc::clone(&symbols);
            let timeout = self.config.call_timeout;
            tasks.spawn(async move {
                let result = supervisor.invoke(&name, &symbols, timeout).await;
                (name, result)
            });
        }

        let mut fetches = Vec::new();
        loop {
            tokio::select! {
                joined = tokio::time::timeout_at(deadline, tasks.join_next()) => match joined {
                    Ok(Some(Ok((_, Ok(fetch))))) => {
                        if !fetch.bad_symbols.is_empty() {
                            debug!(plugin = %fetch.plugin, bad = fetch.bad_symbols.len(), "Plugin could not serve some symbols");
                        }
                        fetches.push(fetch);
                    }
                    Ok(Some(Ok((name, Err(e))))) => warn!(plugin = %name, round, "Fetch failed: {}", e),
                    Ok(Some(Err(e))) => error!(round, "Fetch task failed: {}", e),
                    Ok(None) => break,
                    Err(_) => {
                        // Stragglers run out their own call timeout and are marked degraded
                        warn!(round, outstanding = tasks.len(), "Fetch deadline reached, proceeding without stragglers");
                        tasks.detach_all();
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    tasks.abort_all();
                    return None;
                }
            }
        }

        fetches.sort_by(|a, b| a.plugin.cmp(&b.plugin));
        info!(
            round,
            plugins = fetches.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Fetch finished"
        );
        self.fetches = fetches;
        Some(PhaseEvent::FetchFinished)
    }

    fn aggregate(&mut self) -> PhaseEvent {
        let round = self.window.map(|w| w.round_id).unwrap_or_default();
        let (symbols, precision) = match &self.tracked {
            Some(t) => (Arc::clone(&t.symbols), t.precision),
            None => (Arc::default(), 0),
        };

        let aggregation = self.aggregator.aggregate(round, &symbols, &self.fetches);
        if !aggregation.bad_symbols.is_empty() {
            warn!(
                round,
                bad = ?aggregation.bad_symbols.iter().map(Symbol::as_str).collect::<Vec<_>>(),
                "Symbols left out of this round"
            );
        }

        let report = ReportBuilder::new(precision).build(round, &aggregation.prices);
        let in_committee = {
            let mut status = self.status.write();
            status.last_aggregation = Some(aggregation);
            status.in_committee
        };

        let reportable = if !in_committee {
            info!(round, "Node is not in the committee, skipping submission");
            false
        } else if report.is_empty() {
            warn!(target: "audit", round, "Nothing to report this round");
            false
        } else {
            true
        };

        self.report = Some(report);
        PhaseEvent::Aggregated { reportable }
    }

    async fn submit(&mut self, shutdown: &mut watch::Receiver<bool>) -> Option<PhaseEvent> {
        let Some(report) = self.report.clone() else {
            return Some(PhaseEvent::SubmissionEnded);
        };

        let deadline = self
            .next_boundary()
            .checked_sub(self.config.submit_guard)
            .unwrap_or_else(Instant::now);

        let outcome = self.submitter.submit(&report, deadline, shutdown).await;
        self.status.write().last_submission = Some(describe(&outcome));

        match outcome {
            SubmitOutcome::Submitted { tx, .. } => {
                self.pending_tx = Some(tx);
                self.reported = Some((report.round, report.symbols()));
                Some(PhaseEvent::Submitted)
            }
            SubmitOutcome::Cancelled => None,
            _ => Some(PhaseEvent::SubmissionEnded),
        }
    }

    /// When the next round starts, on the tokio clock
    fn next_boundary(&self) -> Instant {
        let until_next = self
            .window
            .map(|w| Duration::from_secs(w.secs_until_next(unix_now())))
            .unwrap_or_default();
        Instant::now() + until_next
    }

    async fn confirm(&mut self, shutdown: &mut watch::Receiver<bool>) -> Option<PhaseEvent> {
        let Some(tx) = self.pending_tx else {
            return Some(PhaseEvent::ConfirmationFinished);
        };

        let confirmation = self.submitter.confirm(&tx, self.next_boundary(), shutdown).await;
        let text = match confirmation {
            Confirmation::Included(block) => {
                info!(%tx, block, "Report included");
                format!("included in block {block}")
            }
            Confirmation::Failed => {
                warn!(target: "audit", %tx, "Report transaction failed");
                "failed".to_string()
            }
            Confirmation::TimedOut => {
                warn!(%tx, "Report not confirmed in time");
                "not confirmed in time".to_string()
            }
            Confirmation::Cancelled => return None,
        };
        self.status.write().last_confirmation = Some(text);
        Some(PhaseEvent::ConfirmationFinished)
    }
}

fn describe(outcome: &SubmitOutcome) -> String {
    match outcome {
        SubmitOutcome::Submitted { tx, attempts } => format!("submitted {tx} after {attempts} attempt(s)"),
        SubmitOutcome::Rejected(reason) => format!("rejected: {reason}"),
        SubmitOutcome::Failed(reason) => format!("failed: {reason}"),
        SubmitOutcome::Abandoned { attempts, last_error } => {
            format!("abandoned after {attempts} attempt(s): {last_error}")
        }
        SubmitOutcome::Cancelled => "cancelled".to_string(),
        SubmitOutcome::Duplicate => "duplicate round".to_string(),
    }
}

/// Sleep unless shutdown arrives first. False on shutdown.
async fn pause(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = shutdown.changed() => false,
    }
}

/// Check what the chain stored for the previous round's report
async fn audit_round(
    gateway: Arc<dyn ChainGateway>,
    status: SharedStatus,
    round: RoundId,
    symbols: Vec<Symbol>,
) {
    let mut audit = Vec::with_capacity(symbols.len());
    for symbol in symbols {
        let outcome = match gateway.round_data(round, &symbol).await {
            Ok(data) if data.is_success() => AuditOutcome::Reported,
            Ok(data) => {
                warn!(target: "audit", round, symbol = %symbol, status = data.status, "Report missing or rejected");
                AuditOutcome::MissingOrRejected { status: data.status }
            }
            Err(e) => {
                warn!(round, symbol = %symbol, "Round data unavailable: {}", e);
                AuditOutcome::Unavailable { reason: e.to_string() }
            }
        };
        audit.push(SymbolAudit { round, symbol, outcome });
    }

    let reported = audit.iter().filter(|a| a.outcome == AuditOutcome::Reported).count();
    info!(round, reported, total = audit.len(), "Previous round audited");
    status.write().last_audit = audit;
}
