use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tranche_schemas::OrderId;

/// In-process per-order mutex. Allocation, confirmation, cancellation and
/// repair of one order hold it for their whole duration, so a repair always
/// works on a snapshot no allocation is changing.
///
/// Only serializes callers sharing this value; other processes are held off
/// by the store's conditional writes.
#[derive(Debug, Default, Clone)]
pub struct OrderLocks {
    inner: Arc<Mutex<HashMap<OrderId, Arc<AsyncMutex<()>>>>>,
}

impl OrderLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, order_id: OrderId) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            // Drop slots nobody holds or waits on.
            map.retain(|_, m| Arc::strong_count(m) > 1);
            Arc::clone(map.entry(order_id).or_default())
        };
        slot.lock_owned().await
    }

    /// Number of orders currently locked or awaited.
    pub fn active(&self) -> usize {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.values().filter(|m| Arc::strong_count(m) > 1).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_order_is_serialized_other_orders_are_not() {
        let locks = OrderLocks::new();
        let g1 = locks.lock(OrderId(1)).await;

        // Different order: immediate.
        let g2 = tokio::time::timeout(Duration::from_millis(50), locks.lock(OrderId(2))).await;
        assert!(g2.is_ok());

        // Same order: blocks until g1 is dropped.
        let l = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = l.lock(OrderId(1)).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(g1);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
