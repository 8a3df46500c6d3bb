//! In-process simulated ledger.
//!
//! [`SimulatedLedger`] models agreement contracts, principal balances and a
//! block-ordered event log. It enforces the same rules a deployed contract
//! does (who may call what, in which status, with which value) so tests and
//! the simulation binary exercise realistic rejections. Faults can be
//! injected: rejected submissions, failing reads, slow confirmations and
//! dropped event streams.
//!
//! Events are broadcast to subscribers over bounded channels. A subscriber
//! that falls behind is disconnected rather than allowed to stall the
//! ledger; it is expected to resubscribe from its last processed block.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use leasehold_core::agreement::{Address, AgreementKind, AgreementStatus, Parties, Terms};
use leasehold_core::amount::{Amount, BPS_DENOMINATOR};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{
    EVENT_COLLATERAL_MOVED, EVENT_PAYMENT_SETTLED, EVENT_PERIOD_SKIPPED, EVENT_STATUS_CHANGED,
    LedgerTransport, Operation, RawAgreementFields, RawCallArgs, RawEvent, SubmitReceipt,
    TransportError,
};

/// Default genesis timestamp.
const GENESIS_TIME: u64 = 1_700_000_000;

/// Default per-subscriber buffer beyond the replay backlog.
const DEFAULT_STREAM_CAPACITY: usize = 64;

/// Base of generated contract addresses.
const CONTRACT_ADDRESS_BASE: u64 = 0xc0_de00_0000;

#[derive(Debug, Clone)]
struct Contract {
    kind: AgreementKind,
    creditor: String,
    debtor: String,
    status: AgreementStatus,
    principal: u128,
    rate_bps: u32,
    duration: u32,
    grace_allowance: u32,
    grace_used: u32,
    period_secs: u64,
    collateral: u128,
    collateral_held: u128,
    escrow: u128,
    last_settled_period: u32,
    started_at: u64,
    total_repayment: u128,
    installment_amount: u128,
}

impl Contract {
    fn due_for(&self, period: u32) -> u128 {
        if period == self.duration {
            self.total_repayment
                - self.installment_amount * u128::from(self.duration.saturating_sub(1))
        } else {
            self.installment_amount
        }
    }
}

#[derive(Debug)]
struct LedgerState {
    block: u64,
    now: u64,
    next_contract: u64,
    next_tx: u64,
    contracts: HashMap<String, Contract>,
    balances: HashMap<String, u128>,
    events: HashMap<String, Vec<RawEvent>>,
    subscribers: HashMap<String, Vec<mpsc::Sender<RawEvent>>>,
    pending_rejections: VecDeque<TransportError>,
    failing_reads: u32,
    submit_delay: Option<Duration>,
    stream_capacity: usize,
}

/// A deterministic in-process ledger.
#[derive(Debug)]
pub struct SimulatedLedger {
    state: Mutex<LedgerState>,
}

impl Default for SimulatedLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedLedger {
    /// Creates an empty ledger at block 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState {
                block: 1,
                now: GENESIS_TIME,
                next_contract: 1,
                next_tx: 1,
                contracts: HashMap::new(),
                balances: HashMap::new(),
                events: HashMap::new(),
                subscribers: HashMap::new(),
                pending_rejections: VecDeque::new(),
                failing_reads: 0,
                submit_delay: None,
                stream_capacity: DEFAULT_STREAM_CAPACITY,
            }),
        }
    }

    /// Sets the per-subscriber buffer size.
    #[must_use]
    pub fn with_stream_capacity(self, capacity: usize) -> Self {
        self.lock().stream_capacity = capacity.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deploys an agreement contract and returns its address.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Reverted`] for a zero duration or when the
    /// total repayment overflows.
    pub fn deploy(&self, parties: &Parties, terms: &Terms) -> Result<Address, TransportError> {
        if terms.duration == 0 {
            return Err(TransportError::Reverted("duration must be positive".to_string()));
        }
        let principal = terms.principal.base_units();
        let total = principal
            .checked_mul(BPS_DENOMINATOR + u128::from(terms.rate.bps()))
            .map(|scaled| scaled / BPS_DENOMINATOR)
            .ok_or_else(|| TransportError::Reverted("total repayment overflows".to_string()))?;
        let installment = total / u128::from(terms.duration);

        let mut state = self.lock();
        let raw = format!("0x{:040x}", CONTRACT_ADDRESS_BASE + state.next_contract);
        let address =
            Address::parse(&raw).map_err(|e| TransportError::Network(e.to_string()))?;
        state.next_contract += 1;
        state.block += 1;
        state.contracts.insert(
            address.to_string(),
            Contract {
                kind: parties.kind,
                creditor: parties.creditor.to_string(),
                debtor: parties.debtor.to_string(),
                status: AgreementStatus::Initialized,
                principal,
                rate_bps: terms.rate.bps(),
                duration: terms.duration,
                grace_allowance: terms.grace_allowance,
                grace_used: 0,
                period_secs: terms.period_secs,
                collateral: terms.collateral.base_units(),
                collateral_held: 0,
                escrow: 0,
                last_settled_period: 0,
                started_at: 0,
                total_repayment: total,
                installment_amount: installment,
            },
        );
        info!(address = %address, kind = parties.kind.as_str(), "agreement deployed");
        Ok(address)
    }

    /// Adds `amount` to a principal's balance.
    pub fn credit(&self, principal: &Address, amount: Amount) {
        let mut state = self.lock();
        let balance = state.balances.entry(principal.to_string()).or_insert(0);
        *balance = balance.saturating_add(amount.base_units());
    }

    /// Returns a principal's balance.
    #[must_use]
    pub fn balance_of(&self, principal: &Address) -> Amount {
        Amount::from_base_units(
            self.lock()
                .balances
                .get(principal.as_str())
                .copied()
                .unwrap_or(0),
        )
    }

    /// Moves the ledger clock forward.
    pub fn advance_time(&self, secs: u64) {
        let mut state = self.lock();
        state.now = state.now.saturating_add(secs);
    }

    /// Current block height.
    #[must_use]
    pub fn current_block(&self) -> u64 {
        self.lock().block
    }

    /// Makes the next submission fail with `error` before it is applied.
    pub fn reject_next_submission(&self, error: TransportError) {
        self.lock().pending_rejections.push_back(error);
    }

    /// Makes the next `count` reads fail with a network error.
    pub fn fail_next_reads(&self, count: u32) {
        self.lock().failing_reads = count;
    }

    /// Delays confirmations after the call has been applied.
    pub fn set_submit_delay(&self, delay: Option<Duration>) {
        self.lock().submit_delay = delay;
    }

    /// Drops every live event stream.
    pub fn disconnect_all(&self) {
        let mut state = self.lock();
        let dropped: usize = state.subscribers.values().map(Vec::len).sum();
        state.subscribers.clear();
        info!(dropped, "all event streams disconnected");
    }

    /// Number of live event streams for `address`.
    #[must_use]
    pub fn subscriber_count(&self, address: &Address) -> usize {
        let mut state = self.lock();
        state.subscribers.get_mut(address.as_str()).map_or(0, |subs| {
            subs.retain(|s| !s.is_closed());
            subs.len()
        })
    }

    /// Overwrites the contract's reported installment amount.
    pub fn tamper_installment(&self, address: &Address, units: u128) {
        if let Some(contract) = self.lock().contracts.get_mut(address.as_str()) {
            contract.installment_amount = units;
        }
    }

    /// Emits an arbitrary event in a new transaction, as a misbehaving or
    /// lagging node would deliver it.
    pub fn inject_event(
        &self,
        address: &Address,
        name: &str,
        payload: serde_json::Value,
    ) -> SubmitReceipt {
        let mut state = self.lock();
        state.commit(address.as_str(), vec![(name.to_string(), payload)])
    }

    /// Moves a non-terminal agreement to `Defaulted` and hands any held
    /// collateral to the creditor.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotFound`] or [`TransportError::Reverted`]
    /// when the agreement is already terminal.
    pub fn declare_default(&self, address: &Address) -> Result<SubmitReceipt, TransportError> {
        let mut state = self.lock();
        let contract = state
            .contracts
            .get_mut(address.as_str())
            .ok_or(TransportError::NotFound)?;
        if contract.status.is_terminal() {
            return Err(TransportError::Reverted("agreement already closed".to_string()));
        }
        let from = contract.status;
        let seized = contract.collateral_held;
        let creditor = contract.creditor.clone();
        contract.status = AgreementStatus::Defaulted;
        contract.collateral_held = 0;

        let mut events = Vec::new();
        if seized > 0 {
            credit_balance(&mut state.balances, &creditor, seized);
            events.push(collateral_moved(seized, &creditor));
        }
        events.push(status_changed(from, AgreementStatus::Defaulted));
        Ok(state.commit(address.as_str(), events))
    }
}

impl LedgerState {
    /// Applies a call, returning the events it emits.
    fn apply(
        &mut self,
        address: &str,
        operation: Operation,
        args: &RawCallArgs,
    ) -> Result<Vec<(String, serde_json::Value)>, TransportError> {
        let now = self.now;
        let balance = self.balances.get(&args.caller).copied().unwrap_or(0);
        let contract = self
            .contracts
            .get_mut(address)
            .ok_or(TransportError::NotFound)?;
        let mut events = Vec::new();

        match operation {
            Operation::Fund => {
                require(args.caller == contract.creditor, "only the creditor may fund")?;
                require(
                    contract.status == AgreementStatus::Initialized,
                    "agreement is not awaiting funding",
                )?;
                require(args.value == contract.principal, "value must equal principal")?;
                require_funds(balance, args.value)?;

                contract.escrow += args.value;
                contract.status = AgreementStatus::Ready;
                events.push(status_changed(
                    AgreementStatus::Initialized,
                    AgreementStatus::Ready,
                ));
                debit_balance(&mut self.balances, &args.caller, args.value);
            },
            Operation::Activate => {
                require(args.caller == contract.debtor, "only the debtor may activate")?;
                require(
                    contract.status == AgreementStatus::Ready,
                    "agreement is not funded",
                )?;
                require(
                    args.value == contract.collateral,
                    "value must equal required collateral",
                )?;
                require_funds(balance, args.value)?;

                let released = contract.escrow;
                let debtor = contract.debtor.clone();
                contract.escrow = 0;
                contract.collateral_held += args.value;
                contract.started_at = now;
                contract.status = AgreementStatus::Active;
                if args.value > 0 {
                    events.push(collateral_moved(args.value, address));
                }
                events.push(status_changed(AgreementStatus::Ready, AgreementStatus::Active));
                debit_balance(&mut self.balances, &args.caller, args.value);
                credit_balance(&mut self.balances, &debtor, released);
            },
            Operation::Repay => {
                require(args.caller == contract.debtor, "only the debtor may repay")?;
                require(
                    matches!(
                        contract.status,
                        AgreementStatus::Active | AgreementStatus::Settling
                    ),
                    "agreement is not repayable",
                )?;
                let period = contract.last_settled_period + 1;
                require(period <= contract.duration, "schedule already settled")?;
                require(
                    args.value == contract.due_for(period),
                    "value must equal the installment due",
                )?;
                require_funds(balance, args.value)?;

                let creditor = contract.creditor.clone();
                let debtor = contract.debtor.clone();
                contract.last_settled_period = period;
                events.push((
                    EVENT_PAYMENT_SETTLED.to_string(),
                    json!({ "period": period, "amount": args.value.to_string() }),
                ));
                if contract.status == AgreementStatus::Active {
                    contract.status = AgreementStatus::Settling;
                    events.push(status_changed(
                        AgreementStatus::Active,
                        AgreementStatus::Settling,
                    ));
                }
                let mut released = 0;
                if period == contract.duration {
                    released = contract.collateral_held;
                    contract.collateral_held = 0;
                    contract.status = AgreementStatus::Completed;
                    if released > 0 {
                        events.push(collateral_moved(released, &debtor));
                    }
                    events.push(status_changed(
                        AgreementStatus::Settling,
                        AgreementStatus::Completed,
                    ));
                }
                debit_balance(&mut self.balances, &args.caller, args.value);
                credit_balance(&mut self.balances, &creditor, args.value);
                credit_balance(&mut self.balances, &debtor, released);
            },
            Operation::Skip => {
                require(args.caller == contract.debtor, "only the debtor may skip")?;
                require(
                    matches!(
                        contract.status,
                        AgreementStatus::Active | AgreementStatus::Settling
                    ),
                    "agreement is not repayable",
                )?;
                require(args.value == 0, "skip carries no value")?;
                require(
                    contract.grace_used < contract.grace_allowance,
                    "grace allowance exhausted",
                )?;
                contract.grace_used += 1;
                events.push((
                    EVENT_PERIOD_SKIPPED.to_string(),
                    json!({ "grace_used": contract.grace_used }),
                ));
            },
        }
        Ok(events)
    }

    /// Seals `events` into a new block and broadcasts them.
    fn commit(&mut self, address: &str, events: Vec<(String, serde_json::Value)>) -> SubmitReceipt {
        self.block += 1;
        let tx_ref = format!("0x{:064x}", self.next_tx);
        self.next_tx += 1;
        let block_number = self.block;

        let raw: Vec<RawEvent> = events
            .into_iter()
            .zip(0u32..)
            .map(|((name, payload), log_index)| RawEvent {
                address: address.to_string(),
                name,
                payload,
                tx_ref: tx_ref.clone(),
                log_index,
                block_number,
            })
            .collect();

        if let Some(subscribers) = self.subscribers.get_mut(address) {
            for event in &raw {
                subscribers.retain(|sender| match sender.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(address, "subscriber lagging, disconnecting");
                        false
                    },
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
            }
        }
        self.events
            .entry(address.to_string())
            .or_default()
            .extend(raw);

        SubmitReceipt {
            tx_ref,
            block_number,
        }
    }
}

fn require(condition: bool, reason: &str) -> Result<(), TransportError> {
    if condition {
        Ok(())
    } else {
        Err(TransportError::Reverted(reason.to_string()))
    }
}

const fn require_funds(balance: u128, value: u128) -> Result<(), TransportError> {
    if balance >= value {
        Ok(())
    } else {
        Err(TransportError::InsufficientFunds)
    }
}

fn debit_balance(balances: &mut HashMap<String, u128>, principal: &str, amount: u128) {
    if let Some(balance) = balances.get_mut(principal) {
        *balance = balance.saturating_sub(amount);
    }
}

fn credit_balance(balances: &mut HashMap<String, u128>, principal: &str, amount: u128) {
    if amount > 0 {
        let balance = balances.entry(principal.to_string()).or_insert(0);
        *balance = balance.saturating_add(amount);
    }
}

fn status_changed(from: AgreementStatus, to: AgreementStatus) -> (String, serde_json::Value) {
    (
        EVENT_STATUS_CHANGED.to_string(),
        json!({ "from": from.ledger_code(), "to": to.ledger_code() }),
    )
}

fn collateral_moved(amount: u128, to: &str) -> (String, serde_json::Value) {
    (
        EVENT_COLLATERAL_MOVED.to_string(),
        json!({ "amount": amount.to_string(), "to": to }),
    )
}

#[async_trait]
impl LedgerTransport for SimulatedLedger {
    async fn read_fields(&self, address: &str) -> Result<RawAgreementFields, TransportError> {
        let mut state = self.lock();
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(TransportError::Network("injected read failure".to_string()));
        }
        let block_number = state.block;
        let c = state
            .contracts
            .get(address)
            .ok_or(TransportError::NotFound)?;
        Ok(RawAgreementFields {
            kind: c.kind.ledger_code(),
            creditor: c.creditor.clone(),
            debtor: c.debtor.clone(),
            status: c.status.ledger_code(),
            principal: c.principal,
            rate_bps: c.rate_bps,
            duration: c.duration,
            grace_allowance: c.grace_allowance,
            grace_used: c.grace_used,
            period_secs: c.period_secs,
            collateral: c.collateral,
            collateral_held: c.collateral_held,
            last_settled_period: c.last_settled_period,
            started_at: c.started_at,
            total_repayment: c.total_repayment,
            installment_amount: c.installment_amount,
            block_number,
        })
    }

    async fn submit(
        &self,
        address: &str,
        operation: Operation,
        args: RawCallArgs,
    ) -> Result<SubmitReceipt, TransportError> {
        let (receipt, delay) = {
            let mut state = self.lock();
            if let Some(error) = state.pending_rejections.pop_front() {
                return Err(error);
            }
            let events = state.apply(address, operation, &args)?;
            (state.commit(address, events), state.submit_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(receipt)
    }

    async fn subscribe(
        &self,
        address: &str,
        from_block: u64,
    ) -> Result<mpsc::Receiver<RawEvent>, TransportError> {
        let mut state = self.lock();
        if !state.contracts.contains_key(address) {
            return Err(TransportError::NotFound);
        }
        let backlog: Vec<RawEvent> = state
            .events
            .get(address)
            .map(|log| {
                log.iter()
                    .filter(|e| e.block_number >= from_block)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let (sender, receiver) = mpsc::channel(backlog.len() + state.stream_capacity);
        for event in backlog {
            // Capacity covers the whole backlog.
            let _ = sender.try_send(event);
        }
        state
            .subscribers
            .entry(address.to_string())
            .or_default()
            .push(sender);
        Ok(receiver)
    }
}
