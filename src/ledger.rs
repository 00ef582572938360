//! Idempotent, sharded order ledger.
//!
//! Every write runs inside a transaction on the partition that owns the
//! order's key, behind a locking read of that key. Backend faults are logged
//! and turned into outcomes here; nothing propagates past this boundary.

use crate::backend::{OrderBackend, PartitionTx};
use crate::clock::{Clock, SystemClock};
use crate::config::ConfigError;
use crate::order::{generate_order_id, OrderKey, OrderRecord, OrderStatus};
use crate::partition::HashPartitioner;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Result of [`OrderLedger::create_order`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// A new `PENDING` order was committed.
    Created(String),
    /// The key already has an order; nothing was written.
    AlreadyExists,
    /// The backend failed; nothing was written.
    Failed,
}

impl CreateOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }

    pub fn order_id(&self) -> Option<&str> {
        match self {
            CreateOutcome::Created(id) => Some(id),
            _ => None,
        }
    }
}

/// Order store front end: partition routing, id generation, locking protocol.
#[derive(Debug)]
pub struct OrderLedger<B> {
    backend: B,
    partitioner: HashPartitioner,
    clock: Arc<dyn Clock>,
}

impl<B> OrderLedger<B>
where
    B: OrderBackend,
{
    /// Partition count comes from the backend.
    ///
    /// # Errors
    /// Returns `Err` if the backend reports zero partitions.
    pub fn new(backend: B) -> Result<Self, ConfigError> {
        let partitioner = HashPartitioner::new(backend.partitions())?;
        Ok(Self { backend, partitioner, clock: Arc::new(SystemClock) })
    }

    /// Override the clock used for `created_at` and order ids.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn partitioner(&self) -> &HashPartitioner {
        &self.partitioner
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn now(&self) -> DateTime<Utc> {
        i64::try_from(self.clock.now_millis())
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_else(Utc::now)
    }

    /// Create the single `PENDING` order for `(user_id, product_id, sale_id)`.
    ///
    /// Callers must have been admitted by the rate limiter first.
    pub async fn create_order(&self, user_id: u64, product_id: u64, sale_id: u64) -> CreateOutcome {
        let key = OrderKey::new(user_id, product_id, sale_id);
        let partition = self.partitioner.partition_for(&key);
        match self.create_in(partition, key).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(%key, partition, error = %e, "order creation failed");
                CreateOutcome::Failed
            }
        }
    }

    async fn create_in(&self, partition: usize, key: OrderKey) -> Result<CreateOutcome, B::Error> {
        let mut tx = self.backend.begin(partition).await?;
        if let Some(existing) = tx.lock_key(&key).await? {
            tx.rollback().await?;
            tracing::warn!(%key, order_id = %existing.order_id, "order already exists");
            return Ok(CreateOutcome::AlreadyExists);
        }

        let created_at = self.now();
        let order_id = generate_order_id(&key, created_at);
        tx.insert(OrderRecord::pending(order_id.clone(), key, created_at)).await?;
        tx.commit().await?;
        tracing::info!(%key, partition, order_id = %order_id, "order created");
        Ok(CreateOutcome::Created(order_id))
    }

    /// Move an order to `new_status`.
    ///
    /// `key` routes straight to the owning partition. Unknown statuses are
    /// rejected before touching the backend; missing rows and backend faults
    /// return `false`.
    pub async fn update_order_status(&self, order_id: &str, key: OrderKey, new_status: &str) -> bool {
        let status = match new_status.parse::<OrderStatus>() {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(order_id, error = %e, "invalid order status");
                return false;
            }
        };
        let partition = self.partitioner.partition_for(&key);
        match self.update_in(partition, order_id, status).await {
            Ok(true) => {
                tracing::info!(order_id, partition, %status, "order status updated");
                true
            }
            Ok(false) => {
                tracing::warn!(order_id, partition, "order not found");
                false
            }
            Err(e) => {
                tracing::error!(order_id, partition, error = %e, "order status update failed");
                false
            }
        }
    }

    async fn update_in(&self, partition: usize, order_id: &str, status: OrderStatus) -> Result<bool, B::Error> {
        let mut tx = self.backend.begin(partition).await?;
        if tx.lock_order(order_id).await?.is_none() {
            tx.rollback().await?;
            return Ok(false);
        }
        let updated = tx.update_status(order_id, status).await?;
        tx.commit().await?;
        Ok(updated)
    }

    /// Find an order by id alone, scanning partitions in index order.
    ///
    /// A miss is only logged as "not found" when every partition answered.
    pub async fn get_order(&self, order_id: &str) -> Option<OrderRecord> {
        let mut failed = 0usize;
        for partition in 0..self.partitioner.partitions() {
            match self.backend.find(partition, order_id).await {
                Ok(Some(record)) => return Some(record),
                Ok(None) => {}
                Err(e) => {
                    failed += 1;
                    tracing::error!(order_id, partition, error = %e, "order lookup failed");
                }
            }
        }
        if failed == 0 {
            tracing::warn!(order_id, "order not found");
        } else {
            tracing::warn!(order_id, failed, "order lookup incomplete");
        }
        None
    }

    /// Every order in every partition, partition by partition.
    ///
    /// Reporting path only. Partitions that cannot be read are logged and skipped.
    pub async fn get_all_orders(&self) -> Vec<OrderRecord> {
        let mut all = Vec::new();
        for partition in 0..self.partitioner.partitions() {
            match self.backend.scan(partition).await {
                Ok(rows) => all.extend(rows),
                Err(e) => tracing::error!(partition, error = %e, "partition scan failed"),
            }
        }
        all
    }

    /// Delete an order by id, stopping at the first partition that holds it.
    pub async fn delete_order(&self, order_id: &str) -> bool {
        let mut failed = 0usize;
        for partition in 0..self.partitioner.partitions() {
            match self.delete_in(partition, order_id).await {
                Ok(true) => {
                    tracing::info!(order_id, partition, "order deleted");
                    return true;
                }
                Ok(false) => {}
                Err(e) => {
                    failed += 1;
                    tracing::error!(order_id, partition, error = %e, "order deletion failed");
                }
            }
        }
        if failed == 0 {
            tracing::warn!(order_id, "order not found");
        }
        false
    }

    async fn delete_in(&self, partition: usize, order_id: &str) -> Result<bool, B::Error> {
        let mut tx = self.backend.begin(partition).await?;
        if tx.lock_order(order_id).await?.is_none() {
            tx.rollback().await?;
            return Ok(false);
        }
        let deleted = tx.delete(order_id).await?;
        tx.commit().await?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryOrderBackend;
    use crate::clock::ManualClock;
    use std::sync::Mutex;
    use std::time::Duration;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    // 2026-10-16T09:30:00Z
    const T0: u64 = 1_792_143_000_000;

    fn ledger(partitions: usize) -> OrderLedger<InMemoryOrderBackend> {
        OrderLedger::new(InMemoryOrderBackend::new(partitions))
            .unwrap()
            .with_clock(ManualClock::new(T0))
    }

    #[test]
    fn zero_partitions_is_rejected() {
        assert!(OrderLedger::new(InMemoryOrderBackend::new(0)).is_err());
    }

    #[tokio::test]
    async fn create_writes_pending_row_to_owning_partition() {
        let ledger = ledger(4);
        let outcome = ledger.create_order(7, 3, 9).await;
        let id = outcome.order_id().unwrap().to_string();
        assert!(id.starts_with("FSEEWBeA5N-"));

        let rows = ledger.backend().scan(3).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].order_id, id);
        assert_eq!(rows[0].status, OrderStatus::Pending);
        for other in [0, 1, 2] {
            assert!(ledger.backend().scan(other).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn created_at_and_id_come_from_clock() {
        let clock = ManualClock::new(T0);
        let ledger = OrderLedger::new(InMemoryOrderBackend::new(4)).unwrap().with_clock(clock.clone());
        clock.advance(Duration::from_millis(42));

        let id = ledger.create_order(1, 2, 3).await.order_id().unwrap().to_string();
        assert_eq!(id, "FSug99M4Ix-20261016093000042");
        let record = ledger.get_order(&id).await.unwrap();
        assert_eq!(record.created_at.timestamp_millis(), (T0 + 42) as i64);
    }

    #[tokio::test]
    async fn second_create_reports_already_exists() {
        let ledger = ledger(4);
        assert!(ledger.create_order(1, 2, 3).await.is_created());
        assert_eq!(ledger.create_order(1, 2, 3).await, CreateOutcome::AlreadyExists);
        assert_eq!(ledger.get_all_orders().await.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_and_invalid_status_are_logged() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let ledger = ledger(4);
        let id = ledger.create_order(1, 2, 3).await.order_id().unwrap().to_string();
        ledger.create_order(1, 2, 3).await;
        ledger.update_order_status(&id, OrderKey::new(1, 2, 3), "BOGUS").await;

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("order already exists"));
        assert!(logs.contains("invalid order status"));
        assert!(logs.contains(&id));
    }

    #[tokio::test]
    async fn outage_miss_is_not_logged_as_not_found() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let ledger = ledger(4);
        let id = ledger.create_order(1, 2, 3).await.order_id().unwrap().to_string();
        ledger.backend().set_available(false);
        assert!(ledger.get_order(&id).await.is_none());
        assert!(!ledger.delete_order(&id).await);

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("order lookup failed"));
        assert!(logs.contains("order lookup incomplete"));
        assert!(logs.contains("order deletion failed"));
        assert!(!logs.contains("order not found"));

        ledger.backend().set_available(true);
        assert!(ledger.get_order("FSnothing-20260101000000000").await.is_none());
        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("order not found"));
    }

    #[tokio::test]
    async fn backend_outage_fails_create() {
        let ledger = ledger(4);
        ledger.backend().set_available(false);
        assert_eq!(ledger.create_order(1, 2, 3).await, CreateOutcome::Failed);
        ledger.backend().set_available(true);
        assert!(ledger.get_all_orders().await.is_empty());
    }

    #[tokio::test]
    async fn update_routes_by_key_and_checks_existence() {
        let ledger = ledger(4);
        let key = OrderKey::new(1, 2, 3);
        let id = ledger.create_order(1, 2, 3).await.order_id().unwrap().to_string();

        assert!(ledger.update_order_status(&id, key, "COMPLETED").await);
        assert_eq!(ledger.get_order(&id).await.unwrap().status, OrderStatus::Completed);

        assert!(!ledger.update_order_status("FSmissing-0", key, "CANCELLED").await);
        // wrong key routes to a partition that does not hold the row
        assert!(!ledger.update_order_status(&id, OrderKey::new(7, 3, 9), "CANCELLED").await);
        assert_eq!(ledger.get_order(&id).await.unwrap().status, OrderStatus::Completed);
    }

    #[tokio::test]
    async fn invalid_status_never_reaches_backend() {
        let ledger = ledger(4);
        let id = ledger.create_order(1, 2, 3).await.order_id().unwrap().to_string();
        // an outage would fail any backend call, but the status is rejected first
        ledger.backend().set_available(false);
        assert!(!ledger.update_order_status(&id, OrderKey::new(1, 2, 3), "shipped").await);
        ledger.backend().set_available(true);
        assert_eq!(ledger.get_order(&id).await.unwrap().status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn get_order_misses_cleanly() {
        let ledger = ledger(4);
        assert!(ledger.get_order("FSnothing-20260101000000000").await.is_none());
    }

    #[tokio::test]
    async fn get_all_orders_spans_partitions() {
        let ledger = ledger(4);
        for user in 0..20 {
            assert!(ledger.create_order(user, 1, 1).await.is_created());
        }
        let all = ledger.get_all_orders().await;
        assert_eq!(all.len(), 20);

        let mut per_partition = vec![0usize; 4];
        for record in &all {
            per_partition[ledger.partitioner().partition_for(&record.key())] += 1;
        }
        let mut expected = vec![0usize; 4];
        for p in 0..4 {
            expected[p] = ledger.backend().scan(p).await.unwrap().len();
        }
        assert_eq!(per_partition, expected);
    }

    #[tokio::test]
    async fn delete_searches_every_partition() {
        let ledger = ledger(4);
        // (7, 3, 9) lives in the last partition
        let id = ledger.create_order(7, 3, 9).await.order_id().unwrap().to_string();

        assert!(ledger.delete_order(&id).await);
        assert!(ledger.get_order(&id).await.is_none());
        assert!(!ledger.delete_order(&id).await);

        // the key is free again
        assert!(ledger.create_order(7, 3, 9).await.is_created());
    }
}
