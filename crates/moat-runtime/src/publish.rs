// SPDX-License-Identifier: MIT OR Apache-2.0
//! Best-effort receipt publication seam.
//!
//! The on-chain publisher is an external collaborator. The pipeline hands
//! every finished receipt to this seam without awaiting durability:
//! failures are logged and counted, never retried by the core, and never
//! affect the returned receipt.

use async_trait::async_trait;
use moat_core::Receipt;
use tokio::sync::Mutex;

/// A sink for finished receipts.
#[async_trait]
pub trait ReceiptPublisher: Send + Sync {
    /// Publish one receipt. Errors are surfaced as a plain message; the
    /// core logs and counts them.
    async fn publish(&self, receipt: &Receipt) -> Result<(), String>;
}

/// Discards every receipt. The default when no publisher is wired.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPublisher;

#[async_trait]
impl ReceiptPublisher for NullPublisher {
    async fn publish(&self, _receipt: &Receipt) -> Result<(), String> {
        Ok(())
    }
}

/// Collects receipts in memory. Test double.
#[derive(Default)]
pub struct CollectingPublisher {
    published: Mutex<Vec<Receipt>>,
    fail: std::sync::atomic::AtomicBool,
}

impl CollectingPublisher {
    /// Create an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make future publications fail.
    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    /// Receipts published so far.
    pub async fn published(&self) -> Vec<Receipt> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl ReceiptPublisher for CollectingPublisher {
    async fn publish(&self, receipt: &Receipt) -> Result<(), String> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err("publisher offline".to_string());
        }
        self.published.lock().await.push(receipt.clone());
        Ok(())
    }
}
