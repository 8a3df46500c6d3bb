//! In-process [`BackendStore`].
//!
//! Keeps records in memory and logs every successful write so tests can
//! assert on exact write counts. Write failures and latency can be injected.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use leasehold_core::agreement::Address;
use tracing::debug;

use super::{AgreementRecord, BackendStore, BackendWriteError, PaymentRecord, StatusUpdate};

/// One acknowledged write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendWrite {
    /// Agreement record created or replaced.
    Create(Address),
    /// Status and period updated.
    Status {
        /// Target agreement.
        address: Address,
        /// Written values.
        update: StatusUpdate,
    },
    /// Payment upserted.
    Payment {
        /// Target agreement.
        address: Address,
        /// Written payment.
        payment: PaymentRecord,
    },
}

#[derive(Debug, Default)]
struct MemoryState {
    agreements: HashMap<Address, AgreementRecord>,
    payments: HashMap<Address, BTreeMap<u32, PaymentRecord>>,
    writes: Vec<BackendWrite>,
    attempts: u64,
    queued_failures: VecDeque<BackendWriteError>,
    persistent_failure: Option<BackendWriteError>,
    latency: Option<Duration>,
}

impl MemoryState {
    /// Counts a write attempt and returns the injected failure, if any.
    fn take_failure(&mut self) -> Option<BackendWriteError> {
        self.attempts += 1;
        self.queued_failures
            .pop_front()
            .or_else(|| self.persistent_failure.clone())
    }
}

/// A [`BackendStore`] held in memory.
#[derive(Debug, Default)]
pub struct InMemoryBackendStore {
    state: Mutex<MemoryState>,
}

impl InMemoryBackendStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fails the next `count` write attempts with `error`.
    pub fn fail_next(&self, count: usize, error: &BackendWriteError) {
        let mut state = self.lock();
        state
            .queued_failures
            .extend(std::iter::repeat_n(error.clone(), count));
    }

    /// Fails every write attempt with `error` until cleared.
    pub fn fail_always(&self, error: BackendWriteError) {
        self.lock().persistent_failure = Some(error);
    }

    /// Removes all injected failures.
    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.queued_failures.clear();
        state.persistent_failure = None;
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    /// Acknowledged writes in order.
    #[must_use]
    pub fn writes(&self) -> Vec<BackendWrite> {
        self.lock().writes.clone()
    }

    /// Number of acknowledged writes.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.lock().writes.len()
    }

    /// Number of write attempts, failed ones included.
    #[must_use]
    pub fn attempt_count(&self) -> u64 {
        self.lock().attempts
    }

    /// The stored record for `address`.
    #[must_use]
    pub fn agreement(&self, address: &Address) -> Option<AgreementRecord> {
        self.lock().agreements.get(address).cloned()
    }

    /// Stored payments for `address`, ordered by period.
    #[must_use]
    pub fn payments(&self, address: &Address) -> Vec<PaymentRecord> {
        self.lock()
            .payments
            .get(address)
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default()
    }

    async fn delay(&self) {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl BackendStore for InMemoryBackendStore {
    async fn get_agreement(
        &self,
        address: &Address,
    ) -> Result<Option<AgreementRecord>, BackendWriteError> {
        self.delay().await;
        Ok(self.lock().agreements.get(address).cloned())
    }

    async fn create_agreement(&self, record: &AgreementRecord) -> Result<(), BackendWriteError> {
        self.delay().await;
        let mut state = self.lock();
        if let Some(error) = state.take_failure() {
            return Err(error);
        }
        state
            .agreements
            .insert(record.address.clone(), record.clone());
        state.writes.push(BackendWrite::Create(record.address.clone()));
        debug!(address = %record.address, "agreement record stored");
        Ok(())
    }

    async fn update_status(
        &self,
        address: &Address,
        update: &StatusUpdate,
    ) -> Result<(), BackendWriteError> {
        self.delay().await;
        let mut state = self.lock();
        if let Some(error) = state.take_failure() {
            return Err(error);
        }
        let record = state
            .agreements
            .get_mut(address)
            .ok_or_else(|| BackendWriteError::Permanent(format!("unknown agreement {address}")))?;
        record.status = update.status;
        record.period = update.period;
        state.writes.push(BackendWrite::Status {
            address: address.clone(),
            update: *update,
        });
        Ok(())
    }

    async fn record_payment(
        &self,
        address: &Address,
        payment: &PaymentRecord,
    ) -> Result<(), BackendWriteError> {
        self.delay().await;
        let mut state = self.lock();
        if let Some(error) = state.take_failure() {
            return Err(error);
        }
        if !state.agreements.contains_key(address) {
            return Err(BackendWriteError::Permanent(format!(
                "unknown agreement {address}"
            )));
        }
        state
            .payments
            .entry(address.clone())
            .or_default()
            .insert(payment.period, payment.clone());
        state.writes.push(BackendWrite::Payment {
            address: address.clone(),
            payment: payment.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use leasehold_core::agreement::{AgreementKind, AgreementStatus};
    use leasehold_core::amount::{Amount, Rate};

    use super::*;

    fn record() -> AgreementRecord {
        AgreementRecord {
            address: Address::parse(&format!("0x{}", "ab".repeat(20))).unwrap(),
            kind: AgreementKind::Loan,
            creditor: Address::parse(&format!("0x{}", "11".repeat(20))).unwrap(),
            debtor: Address::parse(&format!("0x{}", "22".repeat(20))).unwrap(),
            principal: "1".parse().unwrap(),
            rate: Rate::default(),
            duration: 2,
            grace_allowance: 0,
            status: AgreementStatus::Initialized,
            period: 0,
        }
    }

    #[tokio::test]
    async fn test_writes_are_upserts() {
        let store = InMemoryBackendStore::new();
        let record = record();
        store.create_agreement(&record).await.unwrap();
        store.create_agreement(&record).await.unwrap();

        let payment = PaymentRecord {
            period: 1,
            amount: Amount::from_base_units(5),
            tx_ref: None,
        };
        store.record_payment(&record.address, &payment).await.unwrap();
        store.record_payment(&record.address, &payment).await.unwrap();

        assert_eq!(store.payments(&record.address).len(), 1);
        assert_eq!(store.write_count(), 4);
        assert!(store.get_agreement(&record.address).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_injected_failures_then_success() {
        let store = InMemoryBackendStore::new();
        let record = record();
        store.fail_next(2, &BackendWriteError::Transient("503".to_string()));

        assert!(store.create_agreement(&record).await.is_err());
        assert!(store.create_agreement(&record).await.is_err());
        store.create_agreement(&record).await.unwrap();
        assert_eq!(store.attempt_count(), 3);
        assert_eq!(store.writes(), vec![BackendWrite::Create(record.address)]);
    }

    #[tokio::test]
    async fn test_status_update_requires_record() {
        let store = InMemoryBackendStore::new();
        let record = record();
        let update = StatusUpdate {
            status: AgreementStatus::Ready,
            period: 0,
        };
        let err = store
            .update_status(&record.address, &update)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendWriteError::Permanent(_)));

        store.create_agreement(&record).await.unwrap();
        store.update_status(&record.address, &update).await.unwrap();
        assert_eq!(
            store.agreement(&record.address).unwrap().status,
            AgreementStatus::Ready
        );
    }

    #[tokio::test]
    async fn test_persistent_failure_until_cleared() {
        let store = InMemoryBackendStore::new();
        store.fail_always(BackendWriteError::Permanent("403".to_string()));
        assert!(store.create_agreement(&record()).await.is_err());
        assert!(store.create_agreement(&record()).await.is_err());
        store.clear_failures();
        assert!(store.create_agreement(&record()).await.is_ok());
    }
}
