// SPDX-License-Identifier: MIT OR Apache-2.0
//! bp-lease
#![deny(unsafe_code)]
//!
//! Single-primary admission and monotonic fencing per [`Scope`]. At most one
//! lease is alive for a scope at any instant; the fence strictly increases on
//! every primary transition (new admit, takeover, or expiry followed by
//! re-admit) and never resets, even across releases.

use bp_core::{error::BackplaneError, new_token, Lease, Scope};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

struct ScopeState {
    lease: Option<Lease>,
    next_fence: u64,
}

impl ScopeState {
    fn new() -> Self {
        Self {
            lease: None,
            next_fence: 1,
        }
    }
}

/// Outcome of a successful [`LeaseManager::register`] call.
#[derive(Debug, Clone)]
pub struct RegisterOutcome {
    /// The admitted (or refreshed) lease.
    pub lease: Lease,
    /// The process-wide monotonic liveness counter at the time of this call.
    pub server_seq: u64,
    /// Whether this call started a fresh lease generation (new admit or
    /// takeover) — callers use this to decide whether to clear scoped queue
    /// and context state.
    pub reset: bool,
}

/// Tracks the single admitted primary, per scope, with monotonic fencing.
pub struct LeaseManager {
    scopes: Mutex<HashMap<Scope, ScopeState>>,
    /// Most recently registered scope, used to resolve "scope-auto" HTTP
    /// operations (`/status`, `/diagnostics`, `/debug/*`, context helpers)
    /// that fall back to the current primary when the caller omits a scope.
    /// This behavior is preserved literally per the design notes: callers
    /// rely on it to avoid threading scope through every tool call.
    last_scope: Mutex<Option<Scope>>,
    server_seq: AtomicU64,
    heartbeat_ttl: chrono::Duration,
}

impl LeaseManager {
    /// Build a lease manager with the given heartbeat TTL, in seconds.
    pub fn new(heartbeat_ttl_sec: u64) -> Self {
        Self {
            scopes: Mutex::new(HashMap::new()),
            last_scope: Mutex::new(None),
            server_seq: AtomicU64::new(0),
            heartbeat_ttl: chrono::Duration::seconds(heartbeat_ttl_sec as i64),
        }
    }

    /// The scope of the most recently registered lease that is still alive,
    /// used to resolve scope-auto HTTP operations. Returns `None` once that
    /// lease has been released or has expired.
    pub async fn primary_scope(&self) -> Option<Scope> {
        let scope = self.last_scope.lock().await.clone()?;
        self.current(&scope).await.map(|_| scope)
    }

    fn next_server_seq(&self) -> u64 {
        self.server_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Admit `client_id` as the primary for `scope`, per the register state
    /// machine: drop a dead lease, admit if free, refresh on idempotent
    /// reconnect, take over if requested, else fail.
    pub async fn register(
        &self,
        scope: Scope,
        client_id: String,
        takeover: bool,
    ) -> Result<RegisterOutcome, BackplaneError> {
        let now = Utc::now();
        *self.last_scope.lock().await = Some(scope.clone());
        let mut scopes = self.scopes.lock().await;
        let state = scopes.entry(scope.clone()).or_insert_with(ScopeState::new);

        if let Some(existing) = &state.lease {
            if !existing.is_alive(now, self.heartbeat_ttl) {
                state.lease = None;
            }
        }

        let outcome = match &state.lease {
            None => {
                let lease = admit(&mut state.next_fence, scope, client_id, now);
                state.lease = Some(lease.clone());
                RegisterOutcome {
                    lease,
                    server_seq: self.next_server_seq(),
                    reset: true,
                }
            }
            Some(existing) if existing.client_id == client_id => {
                let mut refreshed = existing.clone();
                refreshed.last_heartbeat_at = now;
                state.lease = Some(refreshed.clone());
                RegisterOutcome {
                    lease: refreshed,
                    server_seq: self.next_server_seq(),
                    reset: false,
                }
            }
            Some(_) if takeover => {
                let lease = admit(&mut state.next_fence, scope, client_id, now);
                state.lease = Some(lease.clone());
                RegisterOutcome {
                    lease,
                    server_seq: self.next_server_seq(),
                    reset: true,
                }
            }
            Some(_) => return Err(BackplaneError::PrimaryAlreadyRegistered),
        };

        Ok(outcome)
    }

    /// Release the lease if `lease_token`/`fence` match the current primary.
    pub async fn release(
        &self,
        scope: &Scope,
        lease_token: &str,
        fence: u64,
    ) -> Result<u64, BackplaneError> {
        let mut scopes = self.scopes.lock().await;
        let state = scopes.get_mut(scope).ok_or(BackplaneError::NoPrimary)?;
        match &state.lease {
            Some(lease) if lease.lease_token == lease_token && lease.fence == fence => {
                state.lease = None;
                Ok(self.next_server_seq())
            }
            _ => Err(BackplaneError::FenceMismatch),
        }
    }

    /// Refresh the heartbeat timestamp for the current primary.
    pub async fn heartbeat(
        &self,
        scope: &Scope,
        lease_token: &str,
        fence: u64,
    ) -> Result<u64, BackplaneError> {
        let mut scopes = self.scopes.lock().await;
        let state = scopes.get_mut(scope).ok_or(BackplaneError::NoPrimary)?;
        match &mut state.lease {
            Some(lease) if lease.lease_token == lease_token && lease.fence == fence => {
                lease.last_heartbeat_at = Utc::now();
                Ok(self.next_server_seq())
            }
            Some(_) => Err(BackplaneError::FenceMismatch),
            None => Err(BackplaneError::NoPrimary),
        }
    }

    /// Validate a presented `(scope, leaseToken, fence)` triple against the
    /// current primary, without mutating anything. Every lease-bound
    /// operation in the queue, context, and job bridge calls this first.
    pub async fn check(
        &self,
        scope: &Scope,
        lease_token: &str,
        fence: u64,
    ) -> Result<(), BackplaneError> {
        let scopes = self.scopes.lock().await;
        let state = scopes.get(scope).ok_or(BackplaneError::NoPrimary)?;
        match &state.lease {
            Some(lease) if lease.lease_token == lease_token && lease.fence == fence => Ok(()),
            Some(_) => Err(BackplaneError::FenceMismatch),
            None => Err(BackplaneError::NoPrimary),
        }
    }

    /// The current lease for `scope`, if one is alive right now.
    pub async fn current(&self, scope: &Scope) -> Option<Lease> {
        let now = Utc::now();
        let scopes = self.scopes.lock().await;
        scopes.get(scope).and_then(|state| {
            state
                .lease
                .as_ref()
                .filter(|lease| lease.is_alive(now, self.heartbeat_ttl))
                .cloned()
        })
    }
}

fn admit(next_fence: &mut u64, scope: Scope, client_id: String, now: DateTime<Utc>) -> Lease {
    let fence = *next_fence;
    *next_fence += 1;
    Lease {
        lease_token: new_token(),
        fence,
        client_id,
        scope,
        last_heartbeat_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> Scope {
        Scope::new(10, "s1")
    }

    #[tokio::test]
    async fn first_register_admits_with_fence_one() {
        let mgr = LeaseManager::new(15);
        let outcome = mgr.register(scope(), "c1".into(), false).await.unwrap();
        assert_eq!(outcome.lease.fence, 1);
        assert!(outcome.reset);
    }

    #[tokio::test]
    async fn reconnect_with_same_client_id_is_idempotent() {
        let mgr = LeaseManager::new(15);
        let first = mgr.register(scope(), "c1".into(), false).await.unwrap();
        let second = mgr.register(scope(), "c1".into(), false).await.unwrap();
        assert_eq!(first.lease.fence, second.lease.fence);
        assert_eq!(first.lease.lease_token, second.lease.lease_token);
        assert!(!second.reset);
    }

    #[tokio::test]
    async fn second_client_without_takeover_fails() {
        let mgr = LeaseManager::new(15);
        mgr.register(scope(), "c1".into(), false).await.unwrap();
        let err = mgr.register(scope(), "c2".into(), false).await.unwrap_err();
        assert!(matches!(err, BackplaneError::PrimaryAlreadyRegistered));
    }

    #[tokio::test]
    async fn takeover_bumps_fence() {
        let mgr = LeaseManager::new(15);
        let first = mgr.register(scope(), "c1".into(), false).await.unwrap();
        let second = mgr.register(scope(), "c2".into(), true).await.unwrap();
        assert!(second.lease.fence > first.lease.fence);
        assert!(second.reset);
    }

    #[tokio::test]
    async fn release_requires_matching_fence() {
        let mgr = LeaseManager::new(15);
        let lease = mgr.register(scope(), "c1".into(), false).await.unwrap().lease;
        let err = mgr
            .release(&scope(), &lease.lease_token, lease.fence + 1)
            .await
            .unwrap_err();
        assert!(matches!(err, BackplaneError::FenceMismatch));
        mgr.release(&scope(), &lease.lease_token, lease.fence)
            .await
            .unwrap();
        assert!(mgr.current(&scope()).await.is_none());
    }

    #[tokio::test]
    async fn fence_never_reuses_after_release() {
        let mgr = LeaseManager::new(15);
        let first = mgr.register(scope(), "c1".into(), false).await.unwrap().lease;
        mgr.release(&scope(), &first.lease_token, first.fence)
            .await
            .unwrap();
        let second = mgr.register(scope(), "c1".into(), false).await.unwrap().lease;
        assert!(second.fence > first.fence);
    }

    #[tokio::test]
    async fn primary_scope_tracks_last_registration_while_alive() {
        let mgr = LeaseManager::new(15);
        assert!(mgr.primary_scope().await.is_none());
        mgr.register(scope(), "c1".into(), false).await.unwrap();
        assert_eq!(mgr.primary_scope().await, Some(scope()));
        let lease = mgr.current(&scope()).await.unwrap();
        mgr.release(&scope(), &lease.lease_token, lease.fence)
            .await
            .unwrap();
        assert!(mgr.primary_scope().await.is_none());
    }

    #[tokio::test]
    async fn check_rejects_wrong_fence_but_accepts_matching() {
        let mgr = LeaseManager::new(15);
        let lease = mgr.register(scope(), "c1".into(), false).await.unwrap().lease;
        mgr.check(&scope(), &lease.lease_token, lease.fence)
            .await
            .unwrap();
        let err = mgr
            .check(&scope(), &lease.lease_token, lease.fence + 1)
            .await
            .unwrap_err();
        assert!(matches!(err, BackplaneError::FenceMismatch));
    }
}
