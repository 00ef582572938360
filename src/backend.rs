//! Partitioned, transactional order storage.
//!
//! [`OrderBackend`] is the seam to the relational store: `N` partitions, each a
//! table of order rows, with locking reads inside transactions. The ledger only
//! writes through a [`PartitionTx`]; the transaction's lock is held until
//! `commit`, `rollback`, or drop, whichever comes first. Dropping an
//! uncommitted transaction discards its writes.

use crate::order::{OrderKey, OrderRecord, OrderStatus};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One open transaction against a single partition.
#[async_trait]
pub trait PartitionTx: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    /// `SELECT ... WHERE user_id/product_id/sale_id = key FOR UPDATE`.
    async fn lock_key(&mut self, key: &OrderKey) -> Result<Option<OrderRecord>, Self::Error>;

    /// `SELECT ... WHERE order_id = ? FOR UPDATE`.
    async fn lock_order(&mut self, order_id: &str) -> Result<Option<OrderRecord>, Self::Error>;

    async fn insert(&mut self, record: OrderRecord) -> Result<(), Self::Error>;

    /// Returns `false` if no row has `order_id`.
    async fn update_status(&mut self, order_id: &str, status: OrderStatus) -> Result<bool, Self::Error>;

    /// Returns `false` if no row has `order_id`.
    async fn delete(&mut self, order_id: &str) -> Result<bool, Self::Error>;

    async fn commit(self) -> Result<(), Self::Error>;

    async fn rollback(self) -> Result<(), Self::Error>;
}

/// The partitioned order store.
#[async_trait]
pub trait OrderBackend: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;
    type Tx: PartitionTx<Error = Self::Error>;

    /// Number of partitions; fixed for the backend's lifetime.
    fn partitions(&self) -> usize;

    async fn begin(&self, partition: usize) -> Result<Self::Tx, Self::Error>;

    /// Non-locking point read.
    async fn find(&self, partition: usize, order_id: &str) -> Result<Option<OrderRecord>, Self::Error>;

    /// Every row of one partition.
    async fn scan(&self, partition: usize) -> Result<Vec<OrderRecord>, Self::Error>;
}

/// Errors from [`InMemoryOrderBackend`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The backend was switched off to simulate an outage.
    #[error("order backend unavailable")]
    Unavailable,
    #[error("partition {partition} out of range (backend has {partitions})")]
    NoSuchPartition { partition: usize, partitions: usize },
    /// Unique constraint on `order_id`.
    #[error("duplicate order id '{0}'")]
    DuplicateOrderId(String),
}

type Table = Vec<OrderRecord>;

/// In-process partitioned order store. Clones share the same tables.
///
/// Each partition is guarded by one async mutex, so a transaction locks its
/// whole partition rather than a single row. That is coarser than
/// `SELECT ... FOR UPDATE` but gives the same guarantee for the ledger: no two
/// operations on one key interleave.
#[derive(Clone, Debug)]
pub struct InMemoryOrderBackend {
    tables: Arc<Vec<Arc<Mutex<Table>>>>,
    offline: Arc<AtomicBool>,
}

impl InMemoryOrderBackend {
    pub fn new(partitions: usize) -> Self {
        let tables = (0..partitions).map(|_| Arc::new(Mutex::new(Vec::new()))).collect();
        Self { tables: Arc::new(tables), offline: Arc::new(AtomicBool::new(false)) }
    }

    /// Toggle a simulated outage; while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), BackendError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable);
        }
        Ok(())
    }

    fn table(&self, partition: usize) -> Result<&Arc<Mutex<Table>>, BackendError> {
        self.tables
            .get(partition)
            .ok_or(BackendError::NoSuchPartition { partition, partitions: self.tables.len() })
    }
}

#[async_trait]
impl OrderBackend for InMemoryOrderBackend {
    type Error = BackendError;
    type Tx = InMemoryTx;

    fn partitions(&self) -> usize {
        self.tables.len()
    }

    async fn begin(&self, partition: usize) -> Result<Self::Tx, Self::Error> {
        self.check_available()?;
        let guard = self.table(partition)?.clone().lock_owned().await;
        Ok(InMemoryTx { guard, working: None, offline: self.offline.clone() })
    }

    async fn find(&self, partition: usize, order_id: &str) -> Result<Option<OrderRecord>, Self::Error> {
        self.check_available()?;
        let table = self.table(partition)?.lock().await;
        Ok(table.iter().find(|r| r.order_id == order_id).cloned())
    }

    async fn scan(&self, partition: usize) -> Result<Vec<OrderRecord>, Self::Error> {
        self.check_available()?;
        let table = self.table(partition)?.lock().await;
        Ok(table.clone())
    }
}

/// Transaction over one [`InMemoryOrderBackend`] partition.
///
/// Writes go to a private copy of the table that replaces the original on commit.
#[derive(Debug)]
pub struct InMemoryTx {
    guard: OwnedMutexGuard<Table>,
    working: Option<Table>,
    offline: Arc<AtomicBool>,
}

impl InMemoryTx {
    fn check_available(&self) -> Result<(), BackendError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable);
        }
        Ok(())
    }

    fn rows(&self) -> &[OrderRecord] {
        self.working.as_deref().unwrap_or(self.guard.as_slice())
    }

    fn rows_mut(&mut self) -> &mut Table {
        let guard = &self.guard;
        self.working.get_or_insert_with(|| guard.to_vec())
    }
}

#[async_trait]
impl PartitionTx for InMemoryTx {
    type Error = BackendError;

    async fn lock_key(&mut self, key: &OrderKey) -> Result<Option<OrderRecord>, Self::Error> {
        self.check_available()?;
        Ok(self.rows().iter().find(|r| r.key() == *key).cloned())
    }

    async fn lock_order(&mut self, order_id: &str) -> Result<Option<OrderRecord>, Self::Error> {
        self.check_available()?;
        Ok(self.rows().iter().find(|r| r.order_id == order_id).cloned())
    }

    async fn insert(&mut self, record: OrderRecord) -> Result<(), Self::Error> {
        self.check_available()?;
        if self.rows().iter().any(|r| r.order_id == record.order_id) {
            return Err(BackendError::DuplicateOrderId(record.order_id));
        }
        self.rows_mut().push(record);
        Ok(())
    }

    async fn update_status(&mut self, order_id: &str, status: OrderStatus) -> Result<bool, Self::Error> {
        self.check_available()?;
        if !self.rows().iter().any(|r| r.order_id == order_id) {
            return Ok(false);
        }
        for row in self.rows_mut().iter_mut().filter(|r| r.order_id == order_id) {
            row.status = status;
        }
        Ok(true)
    }

    async fn delete(&mut self, order_id: &str) -> Result<bool, Self::Error> {
        self.check_available()?;
        if !self.rows().iter().any(|r| r.order_id == order_id) {
            return Ok(false);
        }
        self.rows_mut().retain(|r| r.order_id != order_id);
        Ok(true)
    }

    async fn commit(self) -> Result<(), Self::Error> {
        self.check_available()?;
        let InMemoryTx { mut guard, working, .. } = self;
        if let Some(rows) = working {
            *guard = rows;
        }
        Ok(())
    }

    async fn rollback(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    fn record(id: &str, user: u64) -> OrderRecord {
        OrderRecord::pending(id.to_string(), OrderKey::new(user, 1, 1), Utc::now())
    }

    #[tokio::test]
    async fn committed_writes_are_visible() {
        let backend = InMemoryOrderBackend::new(2);
        let mut tx = backend.begin(1).await.unwrap();
        tx.insert(record("a", 1)).await.unwrap();
        assert!(tx.lock_order("a").await.unwrap().is_some());
        tx.commit().await.unwrap();

        assert!(backend.find(1, "a").await.unwrap().is_some());
        assert!(backend.find(0, "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let backend = InMemoryOrderBackend::new(1);
        {
            let mut tx = backend.begin(0).await.unwrap();
            tx.insert(record("a", 1)).await.unwrap();
        }
        assert!(backend.scan(0).await.unwrap().is_empty());

        let mut tx = backend.begin(0).await.unwrap();
        tx.insert(record("b", 1)).await.unwrap();
        tx.rollback().await.unwrap();
        assert!(backend.scan(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn open_transaction_blocks_other_writers() {
        let backend = InMemoryOrderBackend::new(1);
        let tx = backend.begin(0).await.unwrap();

        let other = backend.clone();
        let waiter = tokio::spawn(async move { other.begin(0).await.map(|_| ()) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        tx.commit().await.unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn update_and_delete_report_missing_rows() {
        let backend = InMemoryOrderBackend::new(1);
        let mut tx = backend.begin(0).await.unwrap();
        assert!(!tx.update_status("nope", OrderStatus::Completed).await.unwrap());
        assert!(!tx.delete("nope").await.unwrap());

        tx.insert(record("a", 1)).await.unwrap();
        assert!(tx.update_status("a", OrderStatus::Completed).await.unwrap());
        assert_eq!(tx.lock_key(&OrderKey::new(1, 1, 1)).await.unwrap().unwrap().status, OrderStatus::Completed);
        assert!(tx.delete("a").await.unwrap());
        assert!(tx.lock_order("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn order_id_is_unique_within_partition() {
        let backend = InMemoryOrderBackend::new(1);
        let mut tx = backend.begin(0).await.unwrap();
        tx.insert(record("a", 1)).await.unwrap();
        let err = tx.insert(record("a", 2)).await.unwrap_err();
        assert_eq!(err, BackendError::DuplicateOrderId("a".into()));
    }

    #[tokio::test]
    async fn outage_and_bad_partition_are_errors() {
        let backend = InMemoryOrderBackend::new(2);
        assert!(matches!(
            backend.scan(5).await,
            Err(BackendError::NoSuchPartition { partition: 5, partitions: 2 })
        ));

        let mut tx = backend.begin(0).await.unwrap();
        tx.insert(record("a", 1)).await.unwrap();
        backend.set_available(false);
        assert_eq!(tx.commit().await.unwrap_err(), BackendError::Unavailable);
        assert_eq!(backend.find(0, "a").await.unwrap_err(), BackendError::Unavailable);

        backend.set_available(true);
        assert!(backend.find(0, "a").await.unwrap().is_none());
    }
}
