//! Flow governor capability: outbound send permits.

use async_trait::async_trait;
use tokio::sync::Semaphore;

/// Governs how many frames a session may write before new permits are
/// granted. `acquire` is awaited once per outbound frame.
#[async_trait]
pub trait FlowGovernor: Send + Sync {
    async fn acquire(&self);
}

/// Default governor: never withholds a permit.
pub struct UnlimitedGovernor;

#[async_trait]
impl FlowGovernor for UnlimitedGovernor {
    async fn acquire(&self) {}
}

/// Permit-window governor. Each outbound frame consumes one permit;
/// `grant` replenishes the window.
pub struct WindowedGovernor {
    permits: Semaphore,
}

impl WindowedGovernor {
    pub fn new(window: usize) -> Self {
        Self {
            permits: Semaphore::new(window),
        }
    }

    pub fn grant(&self, n: usize) {
        self.permits.add_permits(n);
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl FlowGovernor for WindowedGovernor {
    async fn acquire(&self) {
        // The semaphore is never closed; a closed error cannot occur.
        if let Ok(permit) = self.permits.acquire().await {
            permit.forget();
        }
    }
}
