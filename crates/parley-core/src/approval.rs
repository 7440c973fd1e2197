//! Function-approval gate
//!
//! Tool calls attempted by the agent are parked here until a human approves
//! or rejects them through an out-of-band request. Each call id is a
//! single-use rendezvous: the first resolution removes the entry and wakes
//! the one waiter, later resolutions report "not found".

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Inspectable description of a parked tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCallView {
    pub id: String,
    pub plugin_name: String,
    pub function_name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

/// Outcome delivered to the waiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approved,
    Rejected,
    /// Nobody decided before the gate's expiry sweep
    Expired,
}

impl Decision {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }
}

struct PendingToolCall {
    view: PendingCallView,
    /// Distinguishes registrations that reuse an id
    serial: u64,
    decision: oneshot::Sender<Decision>,
}

/// Registry of tool calls awaiting a human decision
pub struct ApprovalGate {
    pending: DashMap<String, PendingToolCall>,
    next_serial: AtomicU64,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            next_serial: AtomicU64::new(0),
        }
    }

    /// Park a new call under a random id
    pub fn register(
        self: &Arc<Self>,
        plugin_name: &str,
        function_name: &str,
        args: Map<String, Value>,
    ) -> ApprovalTicket {
        let view = PendingCallView {
            id: uuid::Uuid::new_v4().to_string(),
            plugin_name: plugin_name.to_string(),
            function_name: function_name.to_string(),
            args,
            created_at: Utc::now(),
        };
        match self.register_call(view) {
            Ok(ticket) => ticket,
            Err(view) => {
                warn!("Approval id collision for {}, regenerating", view.id);
                self.register(plugin_name, function_name, view.args)
            }
        }
    }

    /// Park a call with a caller-chosen id; fails if the id is already pending
    pub fn register_call(
        self: &Arc<Self>,
        view: PendingCallView,
    ) -> Result<ApprovalTicket, PendingCallView> {
        let (tx, rx) = oneshot::channel();
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        match self.pending.entry(view.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(view),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                info!(
                    call_id = %view.id,
                    "Awaiting approval for {}.{}",
                    view.plugin_name, view.function_name
                );
                slot.insert(PendingToolCall {
                    view: view.clone(),
                    serial,
                    decision: tx,
                });
                Ok(ApprovalTicket {
                    gate: Arc::clone(self),
                    view,
                    serial,
                    receiver: Some(rx),
                })
            }
        }
    }

    /// Deliver a decision; returns whether a pending call with this id existed
    pub fn resolve(&self, id: &str, approved: bool) -> bool {
        let decision = if approved {
            Decision::Approved
        } else {
            Decision::Rejected
        };
        self.complete(id, decision)
    }

    pub fn approve(&self, id: &str) -> bool {
        self.resolve(id, true)
    }

    pub fn reject(&self, id: &str) -> bool {
        self.resolve(id, false)
    }

    /// Drop the registration made under `serial`, leaving any newer one alone
    fn withdraw(&self, id: &str, serial: u64) {
        if self
            .pending
            .remove_if(id, |_, call| call.serial == serial)
            .is_some()
        {
            debug!(call_id = %id, "Abandoned pending approval");
        }
    }

    /// Snapshot of every pending call, oldest first
    pub fn list_pending(&self) -> Vec<PendingCallView> {
        let mut calls: Vec<PendingCallView> =
            self.pending.iter().map(|entry| entry.view.clone()).collect();
        calls.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        calls
    }

    pub fn get(&self, id: &str) -> Option<PendingCallView> {
        self.pending.get(id).map(|entry| entry.view.clone())
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Expire every call older than `max_age`, returning how many were removed
    pub fn sweep_expired(&self, max_age: Duration) -> usize {
        let max_age =
            chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now() - max_age;
        let stale: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.view.created_at < cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        stale
            .iter()
            .filter(|id| self.complete(id, Decision::Expired))
            .count()
    }

    /// Run `sweep_expired` every `interval` until `shutdown` fires
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        max_age: Duration,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let gate = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let expired = gate.sweep_expired(max_age);
                        if expired > 0 {
                            info!("Expired {} stale approval request(s)", expired);
                        }
                    }
                }
            }
        })
    }

    fn complete(&self, id: &str, decision: Decision) -> bool {
        match self.pending.remove(id) {
            Some((_, call)) => {
                info!(
                    call_id = %id,
                    "{}.{} {:?}",
                    call.view.plugin_name, call.view.function_name, decision
                );
                // The waiter may already be gone (session cancelled); the id is consumed either way.
                let _ = call.decision.send(decision);
                true
            }
            None => {
                debug!(call_id = %id, "No pending approval to resolve");
                false
            }
        }
    }
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Waiter side of one parked call
///
/// Dropping the ticket before a decision arrives removes the registration.
pub struct ApprovalTicket {
    gate: Arc<ApprovalGate>,
    view: PendingCallView,
    serial: u64,
    receiver: Option<oneshot::Receiver<Decision>>,
}

impl ApprovalTicket {
    pub fn id(&self) -> &str {
        &self.view.id
    }

    pub fn call(&self) -> &PendingCallView {
        &self.view
    }

    /// Suspend until the call is resolved
    pub async fn wait(mut self) -> Decision {
        match self.receiver.take() {
            Some(rx) => rx.await.unwrap_or(Decision::Rejected),
            None => Decision::Rejected,
        }
    }
}

impl Drop for ApprovalTicket {
    fn drop(&mut self) {
        self.gate.withdraw(&self.view.id, self.serial);
    }
}
