//! Round controller scenarios against in-memory plugins and chain

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use oracle_core::{unix_now, ChainError, PluginConfig, PluginState, RoundWindow, Symbol};
use oracle_plugins::mock::{MockLauncher, MockSource};
use oracle_plugins::{PluginSpec, PluginSupervisor, SupervisorConfig};
use oracle_reporter::mock::MockGateway;
use oracle_reporter::{RoundData, TxStatus};
use oracle_round::{
    AggregationPolicy, AuditOutcome, ControllerConfig, RoundController, RoundPhase, SymbolAudit,
};

struct Harness {
    supervisor: Arc<PluginSupervisor>,
    gateway: Arc<MockGateway>,
    controller: RoundController,
    shutdown_tx: watch::Sender<bool>,
    shutdown: watch::Receiver<bool>,
}

fn source(name: &str, prices: &[(&str, Decimal)]) -> Arc<MockSource> {
    Arc::new(MockSource::new(name).with_prices(prices.iter().copied()))
}

fn controller_config(min_sources: usize) -> ControllerConfig {
    ControllerConfig {
        poll_interval: Duration::from_secs(1),
        fetch_timeout: Duration::from_secs(5),
        call_timeout: Duration::from_secs(2),
        submit_guard: Duration::from_secs(5),
        aggregation: AggregationPolicy { min_sources },
        ..Default::default()
    }
}

async fn harness(sources: Vec<Arc<MockSource>>, symbols: &[&str], min_sources: usize) -> Harness {
    let launcher = Arc::new(MockLauncher::new(sources.clone()));
    let supervisor = Arc::new(PluginSupervisor::new(
        SupervisorConfig {
            call_timeout: Duration::from_secs(2),
            ..Default::default()
        },
        launcher,
    ));
    for source in &sources {
        let spec = PluginSpec::new(
            PluginConfig::named(source.name()),
            PathBuf::from(format!("/plugins/{}", source.name())),
        );
        supervisor.start(spec).await.unwrap();
    }

    let gateway = Arc::new(MockGateway::new(symbols));
    let controller = RoundController::new(
        controller_config(min_sources),
        Arc::clone(&supervisor),
        gateway.clone(),
    );
    let (shutdown_tx, shutdown) = watch::channel(false);

    Harness {
        supervisor,
        gateway,
        controller,
        shutdown_tx,
        shutdown,
    }
}

impl Harness {
    /// Step until the controller is back in Idle, returning every phase entered
    async fn run_round(&mut self) -> Vec<RoundPhase> {
        let mut phases = Vec::new();
        for _ in 0..20 {
            let phase = self.controller.step(&mut self.shutdown).await.unwrap();
            phases.push(phase);
            if phase == RoundPhase::Idle {
                break;
            }
        }
        phases
    }

    async fn step_until(&mut self, target: RoundPhase) {
        while self.controller.phase() != target {
            self.controller.step(&mut self.shutdown).await.unwrap();
        }
    }

    fn last_sources(&self, symbol: &str) -> Option<usize> {
        self.controller
            .status()
            .last_aggregation?
            .price(&Symbol::new(symbol))
            .map(|p| p.sources)
    }
}

#[tokio::test(start_paused = true)]
async fn test_first_round_reconfigures_then_reports() {
    let sources = vec![
        source("a", &[("ETHUSD", dec!(200.0))]),
        source("b", &[("ETH/USD", dec!(201.0))]),
        source("c", &[("ETH-USD", dec!(199.0))]),
        source("d", &[("ETHUSD", dec!(1000.0))]),
    ];
    let mut h = harness(sources, &["ETH-USD"], 3).await;

    let phases = h.run_round().await;
    assert_eq!(
        phases,
        vec![
            RoundPhase::AwaitingRoundBoundary,
            RoundPhase::Reconfiguring,
            RoundPhase::AwaitingRoundBoundary,
            RoundPhase::Fetching,
            RoundPhase::Aggregating,
            RoundPhase::Submitting,
            RoundPhase::Confirming,
            RoundPhase::Idle,
        ]
    );

    let submitted = h.gateway.submitted();
    assert_eq!(submitted.len(), 1);
    let entry = &submitted[0].entries[0];
    assert_eq!(entry.symbol, Symbol::new("ETH-USD"));
    assert_eq!(entry.price, dec!(200.5));
    assert_eq!(entry.sources, 4);
    assert_eq!(entry.scaled, alloy_primitives::U256::from(2_005_000_000u64));

    let status = h.controller.status();
    assert_eq!(status.round, Some(1));
    assert_eq!(status.rounds_completed, 1);
    assert_eq!(status.last_confirmation.as_deref(), Some("included in block 1"));
}

#[tokio::test(start_paused = true)]
async fn test_insufficient_sources_excluded_from_report() {
    let both = |name: &str, btc: Decimal| {
        source(name, &[("BTC-USD", btc), ("NTN-USD", dec!(10))])
    };
    let sources = vec![
        both("a", dec!(100.0)),
        both("b", dec!(101.0)),
        both("c", dec!(99.5)),
        source("d", &[("NTN-USD", dec!(10.2))]),
    ];
    let mut h = harness(sources, &["BTC-USD", "NTN-USD"], 4).await;
    h.run_round().await;

    let submitted = h.gateway.submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].symbols(), vec![Symbol::new("NTN-USD")]);

    let aggregation = h.controller.status().last_aggregation.unwrap();
    assert!(aggregation.bad_symbols.contains(&Symbol::new("BTC-USD")));
    assert_eq!(aggregation.price(&Symbol::new("NTN-USD")).unwrap().price, dec!(10));
}

#[tokio::test(start_paused = true)]
async fn test_slow_plugins_bound_fetch_by_single_timeout() {
    let slow = |name: &str| {
        Arc::new(
            MockSource::new(name)
                .with_prices([("ETHUSD", dec!(205))])
                .with_delay(Duration::from_secs(60)),
        )
    };
    let sources = vec![source("fast", &[("ETHUSD", dec!(200))]), slow("s1"), slow("s2"), slow("s3")];
    let mut h = harness(sources, &["ETH-USD"], 1).await;

    h.step_until(RoundPhase::Fetching).await;
    let started = Instant::now();
    let next = h.controller.step(&mut h.shutdown).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(next, RoundPhase::Aggregating);
    assert!(elapsed >= Duration::from_secs(2), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
    assert_eq!(h.supervisor.plugin_state("s1"), Some(PluginState::Degraded));
    assert_eq!(h.supervisor.plugin_state("fast"), Some(PluginState::Running));

    h.step_until(RoundPhase::Idle).await;
    let submitted = h.gateway.submitted();
    assert_eq!(submitted[0].entries[0].price, dec!(200));
    assert_eq!(submitted[0].entries[0].sources, 1);
}

#[tokio::test(start_paused = true)]
async fn test_crashed_plugin_sits_out_until_restarted() {
    let b = source("b", &[("NTN-USD", dec!(10.1))]);
    let sources = vec![
        source("a", &[("NTN-USD", dec!(10.0))]),
        Arc::clone(&b),
        source("c", &[("NTN-USD", dec!(10.2))]),
    ];
    let mut h = harness(sources, &["NTN-USD"], 1).await;

    h.run_round().await;
    assert_eq!(h.last_sources("NTN-USD"), Some(3));

    b.set_alive(false);
    assert!(h.supervisor.refresh_state("b").await.is_err());
    assert_eq!(h.supervisor.plugin_state("b"), Some(PluginState::Crashed));

    h.gateway.advance_round();
    h.run_round().await;
    assert_eq!(h.last_sources("NTN-USD"), Some(2));

    h.supervisor.restart("b").await.unwrap();
    h.gateway.advance_round();
    h.run_round().await;
    assert_eq!(h.last_sources("NTN-USD"), Some(3));
    assert_eq!(h.gateway.submitted().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_symbol_change_reconfigures_before_fetching() {
    let sources = vec![source("a", &[("ETH-USD", dec!(200)), ("NTN-USD", dec!(10))])];
    let mut h = harness(sources, &["ETH-USD"], 1).await;

    h.run_round().await;
    assert_eq!(h.gateway.submitted()[0].symbols(), vec![Symbol::new("ETH-USD")]);

    h.gateway.set_symbols(&["ETH-USD", "NTN-USD"]);
    h.gateway.advance_round();
    let phases = h.run_round().await;

    let reconfigured = phases.iter().position(|p| *p == RoundPhase::Reconfiguring).unwrap();
    let fetched = phases.iter().position(|p| *p == RoundPhase::Fetching).unwrap();
    assert!(reconfigured < fetched);

    let second = &h.gateway.submitted()[1];
    assert_eq!(second.round, 2);
    assert_eq!(second.symbols(), vec![Symbol::new("ETH-USD"), Symbol::new("NTN-USD")]);
    assert_eq!(h.controller.status().tracked_symbols.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_node_outside_committee_does_not_submit() {
    let sources = vec![source("a", &[("NTN-USD", dec!(10))])];
    let mut h = harness(sources, &["NTN-USD"], 1).await;
    h.gateway.set_committee(vec![alloy_primitives::Address::repeat_byte(0x22)]);

    let phases = h.run_round().await;
    assert!(!phases.contains(&RoundPhase::Submitting));
    assert!(h.gateway.submitted().is_empty());

    let status = h.controller.status();
    assert!(!status.in_committee);
    assert!(status.last_aggregation.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_rejection_ends_round_without_retry() {
    let sources = vec![source("a", &[("NTN-USD", dec!(10))])];
    let mut h = harness(sources, &["NTN-USD"], 1).await;
    h.gateway
        .fail_submissions([ChainError::Rejected("round already reported".into())]);

    let phases = h.run_round().await;
    assert!(!phases.contains(&RoundPhase::Confirming));
    let status = h.controller.status();
    assert!(status.last_submission.unwrap().starts_with("rejected"));

    h.gateway.advance_round();
    h.run_round().await;
    assert_eq!(h.gateway.submitted().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stale_submission_is_abandoned() {
    let sources = vec![source("a", &[("NTN-USD", dec!(10))])];
    let mut h = harness(sources, &["NTN-USD"], 1).await;
    h.gateway
        .fail_submissions((0..50).map(|_| ChainError::Network("connection refused".into())));
    h.gateway.set_window(RoundWindow {
        round_id: 1,
        vote_period_secs: 30,
        started_at: unix_now() - 24,
    });

    h.run_round().await;
    assert!(h.gateway.submitted().is_empty());
    let status = h.controller.status();
    assert!(status.last_submission.unwrap().starts_with("abandoned"));
}

#[tokio::test(start_paused = true)]
async fn test_previous_round_is_audited() {
    let sources = vec![source("a", &[("ETH-USD", dec!(200)), ("NTN-USD", dec!(10))])];
    let mut h = harness(sources, &["ETH-USD", "NTN-USD"], 1).await;

    h.run_round().await;
    h.gateway.set_round_data(
        1,
        "NTN-USD",
        RoundData {
            price: Default::default(),
            timestamp: 0,
            status: 1,
        },
    );
    h.gateway.advance_round();
    h.run_round().await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let audit = h.controller.status().last_audit;
    assert_eq!(
        audit,
        vec![
            SymbolAudit {
                round: 1,
                symbol: Symbol::new("ETH-USD"),
                outcome: AuditOutcome::Reported,
            },
            SymbolAudit {
                round: 1,
                symbol: Symbol::new("NTN-USD"),
                outcome: AuditOutcome::MissingOrRejected { status: 1 },
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_fetching() {
    let slow = Arc::new(
        MockSource::new("slow")
            .with_prices([("NTN-USD", dec!(10))])
            .with_delay(Duration::from_secs(600)),
    );
    let h = harness(vec![slow], &["NTN-USD"], 1).await;
    let mut config = controller_config(1);
    config.call_timeout = Duration::from_secs(300);
    config.fetch_timeout = Duration::from_secs(300);
    let controller = RoundController::new(config, Arc::clone(&h.supervisor), h.gateway.clone());
    let status = controller.status_handle();

    let run = tokio::spawn(controller.run(h.shutdown.clone()));
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(status.read().phase, RoundPhase::Fetching);

    h.shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), run)
        .await
        .expect("controller did not stop")
        .unwrap();
    assert!(h.gateway.submitted().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_pending_confirmation_ends_by_next_boundary() {
    let sources = vec![source("a", &[("NTN-USD", dec!(10))])];
    let mut h = harness(sources, &["NTN-USD"], 1).await;
    h.gateway.set_tx_status(TxStatus::Pending);
    h.gateway.set_window(RoundWindow {
        round_id: 1,
        vote_period_secs: 30,
        started_at: unix_now() - 20,
    });

    h.step_until(RoundPhase::Confirming).await;
    let started = Instant::now();
    let next = h.controller.step(&mut h.shutdown).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(next, RoundPhase::Idle);
    assert!(elapsed <= Duration::from_secs(10), "{elapsed:?}");
    assert_eq!(
        h.controller.status().last_confirmation.as_deref(),
        Some("not confirmed in time")
    );
}

#[tokio::test(start_paused = true)]
async fn test_hung_plugin_degrades_when_timeouts_match() {
    let hung = Arc::new(
        MockSource::new("hung")
            .with_prices([("NTN-USD", dec!(11))])
            .with_delay(Duration::from_secs(600)),
    );
    let h = harness(vec![source("a", &[("NTN-USD", dec!(10))]), hung], &["NTN-USD"], 1).await;
    let mut config = controller_config(1);
    config.call_timeout = Duration::from_secs(2);
    config.fetch_timeout = Duration::from_secs(2);
    let mut controller = RoundController::new(config, Arc::clone(&h.supervisor), h.gateway.clone());
    let mut shutdown = h.shutdown.clone();

    while controller.phase() != RoundPhase::Fetching {
        controller.step(&mut shutdown).await.unwrap();
    }
    assert_eq!(controller.step(&mut shutdown).await, Some(RoundPhase::Aggregating));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.supervisor.plugin_state("hung"), Some(PluginState::Degraded));
    assert_eq!(h.supervisor.plugin_state("a"), Some(PluginState::Running));
}

#[tokio::test(start_paused = true)]
async fn test_zero_precision_is_never_reported() {
    let sources = vec![source("a", &[("NTN-USD", dec!(10))])];
    let mut h = harness(sources, &["NTN-USD"], 1).await;
    h.gateway.set_precision(0);

    for _ in 0..6 {
        let phase = h.controller.step(&mut h.shutdown).await.unwrap();
        assert!(
            matches!(phase, RoundPhase::AwaitingRoundBoundary | RoundPhase::Reconfiguring),
            "{phase}"
        );
    }
    assert!(h.gateway.submitted().is_empty());

    h.gateway.set_precision(10_000_000);
    h.run_round().await;
    assert_eq!(h.gateway.submitted().len(), 1);
    assert_eq!(h.controller.status().precision, 10_000_000);
}
