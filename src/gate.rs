//! Purchase flow: admission first, then the ledger.

use crate::backend::OrderBackend;
use crate::ledger::{CreateOutcome, OrderLedger};
use crate::rate_limit::{Admission, CounterStore, MultiLevelLimiter};
use std::time::Duration;

/// What happened to one purchase attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurchaseOutcome {
    /// Admitted and a new order was committed.
    Created(String),
    /// Admitted, but the customer already holds an order for this sale.
    AlreadyExists,
    /// Denied by the named limiter level; the ledger was not touched.
    RateLimited { limiter: String },
    /// Admitted, but the order could not be committed.
    Failed,
}

/// Admission chain in front of the order ledger.
#[derive(Debug)]
pub struct PurchaseGate<S, B> {
    limiter: MultiLevelLimiter<S>,
    ledger: OrderLedger<B>,
    cost: u32,
    admission_timeout: Duration,
}

impl<S, B> PurchaseGate<S, B>
where
    S: CounterStore + 'static,
    B: OrderBackend,
{
    /// One token per purchase, no waiting for admission.
    pub fn new(limiter: MultiLevelLimiter<S>, ledger: OrderLedger<B>) -> Self {
        Self { limiter, ledger, cost: 1, admission_timeout: Duration::ZERO }
    }

    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }

    /// How long a purchase may wait for tokens before it is turned away.
    pub fn with_admission_timeout(mut self, timeout: Duration) -> Self {
        self.admission_timeout = timeout;
        self
    }

    pub fn limiter(&self) -> &MultiLevelLimiter<S> {
        &self.limiter
    }

    pub fn ledger(&self) -> &OrderLedger<B> {
        &self.ledger
    }

    pub async fn purchase(&self, user_id: u64, product_id: u64, sale_id: u64) -> PurchaseOutcome {
        if let Admission::Denied { limiter } =
            self.limiter.admit(self.cost, self.admission_timeout).await
        {
            return PurchaseOutcome::RateLimited { limiter };
        }
        match self.ledger.create_order(user_id, product_id, sale_id).await {
            CreateOutcome::Created(id) => PurchaseOutcome::Created(id),
            CreateOutcome::AlreadyExists => PurchaseOutcome::AlreadyExists,
            CreateOutcome::Failed => PurchaseOutcome::Failed,
        }
    }
}
