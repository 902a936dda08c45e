// SPDX-License-Identifier: MIT OR Apache-2.0
//! bp-queue
#![deny(unsafe_code)]
//!
//! The per-scope FIFO transaction queue: enqueue, long-poll wait with a
//! claim/receipt handoff, and status reporting. `seq` is a single
//! process-wide monotonic counter shared across every scope — not reset or
//! re-based per scope — so two scopes enqueuing concurrently still produce
//! strictly increasing, globally comparable sequence numbers. This mirrors
//! the behavior being preserved rather than redesigned; see the design notes
//! on this choice.
//!
//! Waiters block on a [`tokio::sync::Notify`] rather than a condvar, the
//! async-idiomatic equivalent of the thread+condition-variable model this
//! crate's behavior is otherwise faithful to.

use bp_core::error::BackplaneError;
use bp_core::{new_token, Claim, QueueItem, Scope, Transaction};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::time::Duration as StdDuration;
use tokio::sync::{Mutex, Notify};

/// Summary of the most recent receipt recorded for a scope.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LastReceipt {
    /// Transaction id the receipt reported on.
    pub transaction_id: String,
    /// Number of paths/ids successfully applied.
    pub applied_count: usize,
    /// Number of per-action errors reported.
    pub errors_count: usize,
    /// Number of free-form notes attached.
    pub notes_count: usize,
    /// When this receipt was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Queue occupancy and claim counts for one scope.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct QueueStatus {
    /// Items waiting to be claimed.
    pub pending: usize,
    /// Items currently claimed (reserved, awaiting receipt).
    pub claimed: usize,
    /// The last receipt recorded for this scope, if any.
    pub last_receipt: Option<LastReceipt>,
    /// The configured per-scope queue length cap.
    pub max_queue: usize,
}

/// Outcome of a successful [`TransactionQueue::receipt`] call.
#[derive(Debug, Clone)]
pub struct ReceiptOutcome {
    /// The sequence number that was removed from the queue.
    pub removed_seq: u64,
    /// Items still pending for this scope afterward.
    pub remaining: usize,
    /// Number of paths/ids reported applied.
    pub applied_count: usize,
    /// Number of per-action errors reported.
    pub errors_count: usize,
    /// Number of notes reported.
    pub notes_count: usize,
}

struct ActiveClaim {
    claim: Claim,
}

/// A per-scope FIFO queue of transactions, globally seq-numbered.
pub struct TransactionQueue {
    items: Mutex<VecDeque<QueueItem>>,
    claims: Mutex<HashMap<String, ActiveClaim>>,
    last_receipts: Mutex<HashMap<Scope, LastReceipt>>,
    notify: Notify,
    seq: std::sync::atomic::AtomicU64,
    max_queue: usize,
    claim_ttl: chrono::Duration,
}

impl TransactionQueue {
    /// Build a queue with the given per-scope length cap and claim TTL (seconds).
    pub fn new(max_queue: usize, claim_ttl_sec: u64) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            claims: Mutex::new(HashMap::new()),
            last_receipts: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            seq: std::sync::atomic::AtomicU64::new(0),
            max_queue,
            claim_ttl: chrono::Duration::seconds(claim_ttl_sec as i64),
        }
    }

    /// Append `tx` to the tail of `scope`'s queue, failing `QueueFull` if the
    /// scope already holds `max_queue` items.
    pub async fn enqueue(&self, scope: Scope, tx: Transaction) -> Result<u64, BackplaneError> {
        let mut items = self.items.lock().await;
        let scoped_count = items.iter().filter(|i| i.scope == scope).count();
        if scoped_count >= self.max_queue {
            return Err(BackplaneError::QueueFull);
        }
        let seq = self.seq.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        items.push_back(QueueItem {
            seq,
            scope,
            tx,
            claim_token: None,
            claimed: false,
        });
        drop(items);
        self.notify.notify_waiters();
        Ok(seq)
    }

    /// Block until an unclaimed item with `scope` and `seq >= since` exists,
    /// the deadline elapses, or this call claims one. Returns `None` on
    /// timeout — distinguishable from a successful claim.
    pub async fn wait(
        &self,
        scope: &Scope,
        since: u64,
        timeout: StdDuration,
    ) -> Option<(Claim, Transaction)> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.sweep_expired_claims().await;
            if let Some(found) = self.try_claim(scope, since).await {
                return Some(found);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let remaining = deadline - now;
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(remaining) => {}
            }
        }
    }

    async fn try_claim(&self, scope: &Scope, since: u64) -> Option<(Claim, Transaction)> {
        let mut items = self.items.lock().await;
        let target = items
            .iter_mut()
            .find(|i| &i.scope == scope && i.seq >= since && !i.claimed)?;

        let claim_token = new_token();
        let expires_at = Utc::now() + self.claim_ttl;
        let claim = Claim {
            claim_token: claim_token.clone(),
            expires_at,
            seq: target.seq,
            transaction_id: target.tx.transaction_id.clone(),
            scope: target.scope.clone(),
        };
        target.claimed = true;
        target.claim_token = Some(claim_token.clone());
        let tx = target.tx.clone();
        drop(items);

        self.claims
            .lock()
            .await
            .insert(claim_token, ActiveClaim { claim: claim.clone() });
        Some((claim, tx))
    }

    /// Consume a claim, removing its queue item and recording the receipt.
    pub async fn receipt(
        &self,
        scope: &Scope,
        claim_token: &str,
        transaction_id: &str,
        applied: Vec<String>,
        errors: Vec<String>,
        notes: Vec<String>,
    ) -> Result<ReceiptOutcome, BackplaneError> {
        let claim = {
            let mut claims = self.claims.lock().await;
            match claims.remove(claim_token) {
                Some(active)
                    if &active.claim.scope == scope
                        && active.claim.transaction_id == transaction_id =>
                {
                    active.claim
                }
                Some(active) => {
                    claims.insert(claim_token.to_string(), active);
                    return Err(BackplaneError::ClaimInvalidOrExpired);
                }
                None => return Err(BackplaneError::ClaimInvalidOrExpired),
            }
        };

        let mut items = self.items.lock().await;
        items.retain(|i| i.seq != claim.seq);
        let remaining = items.iter().filter(|i| &i.scope == scope).count();
        drop(items);

        let outcome = ReceiptOutcome {
            removed_seq: claim.seq,
            remaining,
            applied_count: applied.len(),
            errors_count: errors.len(),
            notes_count: notes.len(),
        };

        self.last_receipts.lock().await.insert(
            scope.clone(),
            LastReceipt {
                transaction_id: transaction_id.to_string(),
                applied_count: outcome.applied_count,
                errors_count: outcome.errors_count,
                notes_count: outcome.notes_count,
                recorded_at: Utc::now(),
            },
        );

        self.notify.notify_waiters();
        Ok(outcome)
    }

    /// Release claims past their TTL back to the pending pool, so a quiet
    /// scope with no incoming `/wait` calls still frees items for later
    /// long-polls. Safe to call opportunistically or on a fixed interval.
    pub async fn sweep_expired_claims(&self) -> usize {
        let now = Utc::now();
        let mut claims = self.claims.lock().await;
        let expired: Vec<String> = claims
            .iter()
            .filter(|(_, active)| active.claim.expires_at <= now)
            .map(|(token, _)| token.clone())
            .collect();
        if expired.is_empty() {
            return 0;
        }
        let mut items = self.items.lock().await;
        for token in &expired {
            if let Some(active) = claims.remove(token) {
                if let Some(item) = items.iter_mut().find(|i| i.seq == active.claim.seq) {
                    item.claimed = false;
                    item.claim_token = None;
                }
            }
        }
        expired.len()
    }

    /// Current pending/claimed counts and last receipt for `scope`.
    pub async fn status(&self, scope: &Scope) -> QueueStatus {
        self.sweep_expired_claims().await;
        let items = self.items.lock().await;
        let pending = items.iter().filter(|i| &i.scope == scope && !i.claimed).count();
        let claimed = items.iter().filter(|i| &i.scope == scope && i.claimed).count();
        drop(items);
        let last_receipt = self.last_receipts.lock().await.get(scope).cloned();
        QueueStatus {
            pending,
            claimed,
            last_receipt,
            max_queue: self.max_queue,
        }
    }

    /// Clear every item and claim belonging to `scope`, used when a lease
    /// generation ends (release, expiry, or takeover).
    pub async fn clear_scope(&self, scope: &Scope) {
        let mut items = self.items.lock().await;
        items.retain(|i| &i.scope != scope);
        drop(items);
        let mut claims = self.claims.lock().await;
        claims.retain(|_, active| &active.claim.scope != scope);
    }

    /// Snapshot every item currently in the queue, in FIFO order, plus the
    /// current seq counter. Used to persist queue state across restarts;
    /// claim ownership is intentionally dropped — a restored item comes back
    /// unclaimed, since the claim tokens held by callers don't survive a
    /// restart either.
    pub async fn snapshot(&self) -> (u64, Vec<QueueItem>) {
        let items = self.items.lock().await;
        let snapshot = items
            .iter()
            .map(|item| QueueItem {
                seq: item.seq,
                scope: item.scope.clone(),
                tx: item.tx.clone(),
                claim_token: None,
                claimed: false,
            })
            .collect();
        (self.seq.load(std::sync::atomic::Ordering::SeqCst), snapshot)
    }

    /// Restore a previously persisted queue state. Only meaningful on a
    /// freshly constructed, empty queue at startup. The seq counter is
    /// advanced to at least `seq` so newly enqueued items never collide with
    /// restored ones.
    pub async fn restore(&self, seq: u64, restored: Vec<QueueItem>) {
        let mut items = self.items.lock().await;
        items.extend(restored);
        drop(items);
        self.seq.fetch_max(seq, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> Scope {
        Scope::new(10, "s1")
    }

    fn tx(id: &str) -> Transaction {
        Transaction {
            protocol_version: "backplane/v1".into(),
            transaction_id: id.into(),
            actions: vec![],
        }
    }

    #[tokio::test]
    async fn enqueue_then_wait_yields_claim_in_order() {
        let queue = TransactionQueue::new(10, 30);
        let seq = queue.enqueue(scope(), tx("tx1")).await.unwrap();
        assert_eq!(seq, 1);
        let (claim, got) = queue
            .wait(&scope(), 1, StdDuration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(claim.seq, 1);
        assert_eq!(got.transaction_id, "tx1");
    }

    #[tokio::test]
    async fn wait_times_out_when_nothing_arrives() {
        let queue = TransactionQueue::new(10, 30);
        let result = queue
            .wait(&scope(), 1, StdDuration::from_millis(20))
            .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn receipt_removes_item_and_records_summary() {
        let queue = TransactionQueue::new(10, 30);
        queue.enqueue(scope(), tx("tx1")).await.unwrap();
        let (claim, _) = queue
            .wait(&scope(), 1, StdDuration::from_millis(100))
            .await
            .unwrap();
        let outcome = queue
            .receipt(&scope(), &claim.claim_token, "tx1", vec!["game/A".into()], vec![], vec![])
            .await
            .unwrap();
        assert_eq!(outcome.removed_seq, 1);
        assert_eq!(outcome.remaining, 0);
        let status = queue.status(&scope()).await;
        assert_eq!(status.pending, 0);
        assert!(status.last_receipt.is_some());
    }

    #[tokio::test]
    async fn receipt_with_wrong_claim_token_fails() {
        let queue = TransactionQueue::new(10, 30);
        queue.enqueue(scope(), tx("tx1")).await.unwrap();
        queue
            .wait(&scope(), 1, StdDuration::from_millis(100))
            .await
            .unwrap();
        let err = queue
            .receipt(&scope(), "not-a-real-token", "tx1", vec![], vec![], vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, BackplaneError::ClaimInvalidOrExpired));
    }

    #[tokio::test]
    async fn queue_full_rejects_past_the_cap() {
        let queue = TransactionQueue::new(1, 30);
        queue.enqueue(scope(), tx("tx1")).await.unwrap();
        let err = queue.enqueue(scope(), tx("tx2")).await.unwrap_err();
        assert!(matches!(err, BackplaneError::QueueFull));
    }

    #[tokio::test]
    async fn expired_claim_is_released_back_to_pending() {
        let queue = TransactionQueue::new(10, 0);
        queue.enqueue(scope(), tx("tx1")).await.unwrap();
        queue
            .wait(&scope(), 1, StdDuration::from_millis(50))
            .await
            .unwrap();
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        let swept = queue.sweep_expired_claims().await;
        assert_eq!(swept, 1);
        let status = queue.status(&scope()).await;
        assert_eq!(status.pending, 1);
        assert_eq!(status.claimed, 0);
    }

    #[tokio::test]
    async fn snapshot_then_restore_round_trips_pending_items() {
        let queue = TransactionQueue::new(10, 30);
        queue.enqueue(scope(), tx("tx1")).await.unwrap();
        queue.enqueue(scope(), tx("tx2")).await.unwrap();
        let (seq, items) = queue.snapshot().await;
        assert_eq!(seq, 2);
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| !i.claimed));

        let restored = TransactionQueue::new(10, 30);
        restored.restore(seq, items).await;
        let status = restored.status(&scope()).await;
        assert_eq!(status.pending, 2);
        let next = restored.enqueue(scope(), tx("tx3")).await.unwrap();
        assert_eq!(next, 3);
    }

    #[tokio::test]
    async fn seq_is_global_not_per_scope() {
        let queue = TransactionQueue::new(10, 30);
        let other = Scope::new(20, "s2");
        let seq1 = queue.enqueue(scope(), tx("a")).await.unwrap();
        let seq2 = queue.enqueue(other, tx("b")).await.unwrap();
        assert_eq!(seq1, 1);
        assert_eq!(seq2, 2);
    }
}
