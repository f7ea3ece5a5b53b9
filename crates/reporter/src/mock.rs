//! In-memory chain gateway for testing.

use alloy_primitives::Address;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

use oracle_core::{unix_now, ChainError, ChainResult, RoundId, RoundWindow, Symbol};

use crate::builder::Report;
use crate::gateway::{ChainGateway, RoundData, TxHash, TxStatus};

#[derive(Debug)]
struct MockChain {
    window: RoundWindow,
    symbols: Vec<Symbol>,
    committee: Vec<Address>,
    precision: u64,
    submit_failures: VecDeque<ChainError>,
    window_failures: u32,
    tx_status: TxStatus,
    submitted: Vec<Report>,
    round_data: HashMap<(RoundId, Symbol), RoundData>,
}

/// Scriptable gateway that records every submitted report
#[derive(Debug)]
pub struct MockGateway {
    node_address: Address,
    chain: Mutex<MockChain>,
}

impl MockGateway {
    /// A gateway whose node is the sole committee member, with round 1
    /// starting now
    pub fn new(symbols: &[&str]) -> Self {
        let node_address = Address::repeat_byte(0x11);
        Self {
            node_address,
            chain: Mutex::new(MockChain {
                window: RoundWindow {
                    round_id: 1,
                    vote_period_secs: 30,
                    started_at: unix_now(),
                },
                symbols: symbols.iter().map(|s| Symbol::new(*s)).collect(),
                committee: vec![node_address],
                precision: 10_000_000,
                submit_failures: VecDeque::new(),
                window_failures: 0,
                tx_status: TxStatus::Included { block: 1 },
                submitted: Vec::new(),
                round_data: HashMap::new(),
            }),
        }
    }

    pub fn window(&self) -> RoundWindow {
        self.chain.lock().window
    }

    pub fn set_window(&self, window: RoundWindow) {
        self.chain.lock().window = window;
    }

    /// Move to the next round, starting now
    pub fn advance_round(&self) -> RoundId {
        let mut chain = self.chain.lock();
        chain.window.round_id += 1;
        chain.window.started_at = unix_now();
        chain.window.round_id
    }

    pub fn set_symbols(&self, symbols: &[&str]) {
        self.chain.lock().symbols = symbols.iter().map(|s| Symbol::new(*s)).collect();
    }

    pub fn set_committee(&self, members: Vec<Address>) {
        self.chain.lock().committee = members;
    }

    pub fn set_precision(&self, precision: u64) {
        self.chain.lock().precision = precision;
    }

    /// Queue errors returned by the next `submit_report` calls, in order
    pub fn fail_submissions(&self, errors: impl IntoIterator<Item = ChainError>) {
        self.chain.lock().submit_failures.extend(errors);
    }

    /// Make the next `n` round window reads fail with a network error
    pub fn fail_window_reads(&self, n: u32) {
        self.chain.lock().window_failures = n;
    }

    pub fn set_tx_status(&self, status: TxStatus) {
        self.chain.lock().tx_status = status;
    }

    pub fn set_round_data(&self, round: RoundId, symbol: &str, data: RoundData) {
        self.chain
            .lock()
            .round_data
            .insert((round, Symbol::new(symbol)), data);
    }

    pub fn submitted(&self) -> Vec<Report> {
        self.chain.lock().submitted.clone()
    }
}

#[async_trait::async_trait]
impl ChainGateway for MockGateway {
    async fn round_window(&self) -> ChainResult<RoundWindow> {
        let mut chain = self.chain.lock();
        if chain.window_failures > 0 {
            chain.window_failures -= 1;
            return Err(ChainError::Network("connection reset".into()));
        }
        Ok(chain.window)
    }

    async fn symbols(&self) -> ChainResult<Vec<Symbol>> {
        Ok(self.chain.lock().symbols.clone())
    }

    async fn committee_members(&self) -> ChainResult<Vec<Address>> {
        Ok(self.chain.lock().committee.clone())
    }

    async fn precision(&self) -> ChainResult<u64> {
        Ok(self.chain.lock().precision)
    }

    async fn submit_report(&self, report: &Report) -> ChainResult<TxHash> {
        let mut chain = self.chain.lock();
        if let Some(error) = chain.submit_failures.pop_front() {
            return Err(error);
        }
        chain.submitted.push(report.clone());
        Ok(TxHash::with_last_byte(chain.submitted.len() as u8))
    }

    async fn transaction_status(&self, _tx: &TxHash) -> ChainResult<TxStatus> {
        Ok(self.chain.lock().tx_status)
    }

    async fn round_data(&self, round: RoundId, symbol: &Symbol) -> ChainResult<RoundData> {
        let chain = self.chain.lock();
        if let Some(data) = chain.round_data.get(&(round, symbol.clone())) {
            return Ok(*data);
        }
        chain
            .submitted
            .iter()
            .filter(|r| r.round == round)
            .flat_map(|r| r.entries.iter())
            .find(|e| &e.symbol == symbol)
            .map(|e| RoundData {
                price: e.scaled,
                timestamp: unix_now().max(0) as u64,
                status: 0,
            })
            .ok_or_else(|| ChainError::MissingRoundData {
                round,
                symbol: symbol.clone(),
            })
    }

    fn node_address(&self) -> Address {
        self.node_address
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new(&[])
    }
}
