//! Drives the simulated plugin binary through the real subprocess transport

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use oracle_core::{PluginConfig, PluginState, Symbol};
use oracle_plugins::{
    DataSource, PluginSpec, PluginSupervisor, ProcessLauncher, SourceLauncher, SupervisorConfig,
};

fn simulated_spec() -> PluginSpec {
    PluginSpec::new(
        PluginConfig::named("simulated"),
        PathBuf::from(env!("CARGO_BIN_EXE_simulated-plugin")),
    )
}

#[tokio::test]
async fn test_handshake_and_state() {
    let launcher = ProcessLauncher::new(Duration::from_secs(5));
    let source = launcher.launch(&simulated_spec()).await.unwrap();

    assert_eq!(source.version(), "v0.1.0");
    let state = source.state().await.unwrap();
    assert!(state.available_symbols.contains(&"EUR/USD".to_string()));
    assert!(state.available_symbols.contains(&"NTN/USD".to_string()));

    source.close().await;
    assert!(!source.is_alive());
}

#[tokio::test]
async fn test_fetch_prices_over_pipe() {
    let launcher = ProcessLauncher::new(Duration::from_secs(5));
    let source = launcher.launch(&simulated_spec()).await.unwrap();

    let result = source
        .fetch_prices(&["EUR/USD".to_string(), "DOGE/USD".to_string()])
        .await
        .unwrap();
    assert_eq!(result.prices.len(), 1);
    assert_eq!(result.prices[0].symbol, "EUR/USD");
    assert!(result.prices[0].timestamp > 0);
    assert_eq!(result.bad_symbols, vec!["DOGE/USD".to_string()]);

    source.close().await;
}

#[tokio::test]
async fn test_concurrent_calls_are_routed_by_id() {
    let launcher = ProcessLauncher::new(Duration::from_secs(5));
    let source = launcher.launch(&simulated_spec()).await.unwrap();

    let symbols = ["EUR/USD", "JPY/USD", "GBP/USD", "NTN/SEK"];
    let calls = symbols.iter().map(|s| {
        let source = Arc::clone(&source);
        let symbol = s.to_string();
        async move { source.fetch_prices(&[symbol]).await }
    });
    let results = futures::future::join_all(calls).await;

    for (symbol, result) in symbols.iter().zip(results) {
        assert_eq!(result.unwrap().prices[0].symbol, *symbol);
    }
    source.close().await;
}

#[tokio::test]
async fn test_supervised_plugin_serves_canonical_symbols() {
    let supervisor = Arc::new(PluginSupervisor::new(
        SupervisorConfig::default(),
        Arc::new(ProcessLauncher::new(Duration::from_secs(5))),
    ));
    assert_eq!(supervisor.start_all(vec![simulated_spec()]).await, 1);
    assert_eq!(supervisor.plugin_state("simulated"), Some(PluginState::Running));

    let fetch = supervisor
        .invoke(
            "simulated",
            &[Symbol::new("EUR-USD"), Symbol::new("BTC-USD")],
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(fetch.prices.len(), 1);
    assert_eq!(fetch.prices[0].symbol, Symbol::new("EUR-USD"));
    assert_eq!(fetch.bad_symbols, vec![Symbol::new("BTC-USD")]);

    let info = supervisor.snapshot();
    assert_eq!(info[0].version, "v0.1.0");
    assert_eq!(info[0].available_symbols, 14);

    supervisor.shutdown().await;
    assert_eq!(supervisor.plugin_state("simulated"), Some(PluginState::Stopped));
}
