// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! moat-idempotency
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use moat_core::{Clock, Receipt};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{debug, warn};

/// Errors from idempotency-store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdempotencyError {
    /// The backing store could not be reached. The pipeline fails the
    /// request with `GATEWAY_ERROR` — there is no best-effort fallback.
    #[error("idempotency store unreachable: {reason}")]
    Unreachable {
        /// Transport-level detail.
        reason: String,
    },

    /// The single-flight barrier was not released within the wait bound.
    #[error("timed out waiting on the single-flight barrier")]
    BarrierTimeout,

    /// The in-flight execution was abandoned without producing a receipt.
    #[error("in-flight execution abandoned before completion")]
    Abandoned,
}

/// Outcome of [`IdempotencyStore::begin`].
#[derive(Debug)]
pub enum BeginOutcome {
    /// An in-flight marker was installed; the caller owns the execution and
    /// must eventually `commit` or `abandon`.
    Started,
    /// A completed receipt is stored for this key and is still within TTL.
    Existing(Receipt),
    /// Another caller holds the in-flight marker; wait on the barrier.
    Join(Barrier),
}

/// Handle a joining caller waits on until the owner commits.
#[derive(Debug)]
pub struct Barrier {
    rx: watch::Receiver<Option<Receipt>>,
}

impl Barrier {
    /// Wait for the owner's receipt, bounded by `bound`.
    ///
    /// # Errors
    ///
    /// [`IdempotencyError::BarrierTimeout`] when the bound elapses first,
    /// [`IdempotencyError::Abandoned`] when the owner cleared the marker
    /// without storing a receipt (the key is absent again; a retry may
    /// re-execute).
    pub async fn wait(mut self, bound: Duration) -> Result<Receipt, IdempotencyError> {
        let deadline = tokio::time::Instant::now() + bound;
        loop {
            if let Some(receipt) = self.rx.borrow().clone() {
                return Ok(receipt);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(IdempotencyError::BarrierTimeout);
            }
            match tokio::time::timeout(remaining, self.rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(IdempotencyError::Abandoned),
                Err(_) => return Err(IdempotencyError::BarrierTimeout),
            }
        }
    }
}

enum EntryState {
    InFlight {
        tx: watch::Sender<Option<Receipt>>,
        deadline: DateTime<Utc>,
    },
    Completed {
        receipt: Receipt,
        expires_at: DateTime<Utc>,
    },
}

type Key = (String, String);

/// In-process idempotency store.
///
/// All transitions happen under one lock, which is what makes `begin`
/// atomic: two concurrent calls for the same key observe a consistent
/// absent / in-flight / completed state and exactly one of them becomes
/// the owner.
pub struct IdempotencyStore {
    entries: Mutex<HashMap<Key, EntryState>>,
    clock: Arc<dyn Clock>,
    unreachable: AtomicBool,
}

impl IdempotencyStore {
    /// Create an empty store using the given clock.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            unreachable: AtomicBool::new(false),
        }
    }

    /// Simulate a store outage (or recovery). Test hook.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), IdempotencyError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(IdempotencyError::Unreachable {
                reason: "idempotency store offline".into(),
            });
        }
        Ok(())
    }

    /// Atomically claim the key, replay a stored receipt, or join the
    /// in-flight barrier.
    ///
    /// `deadline` bounds the installed marker's life: if the owner never
    /// commits or abandons, later calls observe the marker expired and may
    /// re-execute.
    ///
    /// # Errors
    ///
    /// [`IdempotencyError::Unreachable`] when the store is down.
    pub async fn begin(
        &self,
        tenant_id: &str,
        key: &str,
        deadline: DateTime<Utc>,
    ) -> Result<BeginOutcome, IdempotencyError> {
        self.check()?;
        let now = self.clock.now_utc();
        let map_key = (tenant_id.to_string(), key.to_string());
        let mut entries = self.entries.lock().await;

        match entries.get(&map_key) {
            Some(EntryState::Completed { receipt, expires_at }) if *expires_at > now => {
                debug!(tenant = tenant_id, key, "idempotency hit");
                return Ok(BeginOutcome::Existing(receipt.clone()));
            }
            Some(EntryState::InFlight { tx, deadline: d }) if *d > now => {
                debug!(tenant = tenant_id, key, "joining in-flight execution");
                return Ok(BeginOutcome::Join(Barrier { rx: tx.subscribe() }));
            }
            Some(_) => {
                // Expired completed entry or stale marker: the key is
                // effectively absent again.
                warn!(tenant = tenant_id, key, "replacing expired idempotency entry");
            }
            None => {}
        }

        let (tx, _rx) = watch::channel(None);
        entries.insert(map_key, EntryState::InFlight { tx, deadline });
        Ok(BeginOutcome::Started)
    }

    /// Replace the in-flight marker with the finished receipt and wake all
    /// waiters. A zero `ttl` deletes the entry instead, so the next request
    /// with this key re-executes.
    ///
    /// # Errors
    ///
    /// [`IdempotencyError::Unreachable`] when the store is down.
    pub async fn commit(
        &self,
        tenant_id: &str,
        key: &str,
        receipt: Receipt,
        ttl: Duration,
    ) -> Result<(), IdempotencyError> {
        self.check()?;
        let now = self.clock.now_utc();
        let map_key = (tenant_id.to_string(), key.to_string());
        let mut entries = self.entries.lock().await;

        if let Some(EntryState::InFlight { tx, .. }) = entries.remove(&map_key) {
            // Wake every joined waiter with the finished receipt.
            let _ = tx.send(Some(receipt.clone()));
        }

        if !ttl.is_zero() {
            let expires_at = now
                + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::seconds(86_400));
            entries.insert(
                map_key,
                EntryState::Completed {
                    receipt,
                    expires_at,
                },
            );
        }
        Ok(())
    }

    /// Clear an in-flight marker without storing a receipt. Waiters observe
    /// the abandonment and may re-execute.
    ///
    /// # Errors
    ///
    /// [`IdempotencyError::Unreachable`] when the store is down.
    pub async fn abandon(&self, tenant_id: &str, key: &str) -> Result<(), IdempotencyError> {
        self.check()?;
        let map_key = (tenant_id.to_string(), key.to_string());
        let mut entries = self.entries.lock().await;
        if let Some(EntryState::InFlight { tx, .. }) = entries.remove(&map_key) {
            // Dropping the sender closes the channel; waiters map the
            // closure to `Abandoned`.
            drop(tx);
        }
        Ok(())
    }

    /// Remove expired completed entries and stale in-flight markers.
    /// Returns the number of entries removed.
    pub async fn sweep(&self) -> usize {
        let now = self.clock.now_utc();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, state| match state {
            EntryState::Completed { expires_at, .. } => *expires_at > now,
            EntryState::InFlight { deadline, .. } => *deadline > now,
        });
        before - entries.len()
    }

    /// Number of live entries (either state). Test/observability hook.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether the store holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

/// Spawn the background sweeper at `period` (the contract requires ≤ 60 s).
/// The task runs until aborted.
pub fn spawn_sweeper(store: Arc<IdempotencyStore>, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let removed = store.sweep().await;
            if removed > 0 {
                debug!(removed, "idempotency sweep");
            }
        }
    })
}
