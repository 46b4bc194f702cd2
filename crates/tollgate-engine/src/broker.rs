use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tollgate_core::approval::{ApprovalDecision, ApprovalOutcome, ApprovalRequest, CorrelationId};
use tollgate_core::event::EventBus;
use tollgate_core::types::{InstanceId, WorkflowEvent};

struct PendingApproval {
    request: ApprovalRequest,
    tx: oneshot::Sender<ApprovalDecision>,
}

type PendingTable = std::sync::Mutex<HashMap<CorrelationId, PendingApproval>>;

/// A submitted request whose decision has not been awaited yet.
///
/// Dropping a ticket withdraws its request, so an abandoned wait never leaves
/// an entry behind for listeners to answer.
pub struct Ticket {
    pub id: CorrelationId,
    instance_id: InstanceId,
    rx: oneshot::Receiver<ApprovalDecision>,
    pending: Weak<PendingTable>,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let Some(pending) = self.pending.upgrade() else {
            return;
        };
        if pending.lock().unwrap().remove(&self.id).is_some() {
            debug!(request_id = %self.id, "Approval request withdrawn");
        }
    }
}

/// Result of [`ApprovalBroker::submit`].
#[derive(Debug, Clone)]
pub struct Submission {
    pub id: CorrelationId,
    pub outcome: ApprovalOutcome,
}

/// A registered listener. New approval requests are delivered to `recv`.
pub struct Listener {
    pub id: u64,
    rx: mpsc::UnboundedReceiver<ApprovalRequest>,
}

impl Listener {
    /// Next broadcast request, or `None` once deregistered.
    pub async fn recv(&mut self) -> Option<ApprovalRequest> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ApprovalRequest> {
        self.rx.try_recv().ok()
    }
}

/// Matches approval requests to external responses by correlation id.
///
/// Shared by every workflow instance in the process. The pending table and the
/// listener set are each guarded by their own mutex; no lock is held across a
/// suspension point.
pub struct ApprovalBroker {
    pending: Arc<PendingTable>,
    listeners: Mutex<HashMap<u64, mpsc::UnboundedSender<ApprovalRequest>>>,
    next_seq: AtomicU64,
    next_listener: AtomicU64,
    event_bus: Arc<EventBus>,
}

impl ApprovalBroker {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            pending: Arc::new(std::sync::Mutex::new(HashMap::new())),
            listeners: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
            next_listener: AtomicU64::new(1),
            event_bus,
        }
    }

    /// Issue a fresh correlation id: random nonce, broker sequence number,
    /// owning instance.
    fn issue_id(&self, instance_id: &InstanceId) -> CorrelationId {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let nonce = Uuid::new_v4().simple().to_string();
        CorrelationId(format!("{}-{}-{}", &nonce[..8], seq, instance_id))
    }

    /// Register a request, broadcast it to current listeners and return the
    /// ticket to await.
    pub async fn request(
        &self,
        instance_id: &InstanceId,
        subject: &str,
        payload: serde_json::Value,
    ) -> Ticket {
        let (tx, rx) = oneshot::channel();
        let id = self.issue_id(instance_id);
        let request = ApprovalRequest {
            id: id.clone(),
            instance_id: instance_id.clone(),
            subject: subject.to_string(),
            payload,
            timestamp: Utc::now(),
        };

        // Insert before broadcasting so an immediate response finds the entry.
        self.pending.lock().unwrap().insert(
            id.clone(),
            PendingApproval {
                request: request.clone(),
                tx,
            },
        );

        self.event_bus.publish(WorkflowEvent::ApprovalRequested {
            request: request.clone(),
        });

        let delivered = self.broadcast(&request).await;
        if delivered == 0 {
            warn!(request_id = %id, subject, "No listeners registered for approval request");
        } else {
            debug!(request_id = %id, subject, delivered, "Approval request broadcast");
        }

        Ticket {
            id,
            instance_id: instance_id.clone(),
            rx,
            pending: Arc::downgrade(&self.pending),
        }
    }

    /// Wait for a ticket's decision.
    ///
    /// Resolves to `TimedOut` after `timeout` and to `Cancelled` when `cancel`
    /// fires or the entry is dropped by [`cancel_instance`](Self::cancel_instance).
    /// In both cases the correlation id is invalidated, so a late `respond` is a
    /// no-op. Dropping the returned future has the same effect.
    pub async fn wait(
        &self,
        mut ticket: Ticket,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> ApprovalOutcome {
        let expiry = async {
            match timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        let outcome = tokio::select! {
            res = &mut ticket.rx => match res {
                Ok(decision) => return ApprovalOutcome::Decided(decision),
                // Sender dropped (instance cancelled or broker cleaned up)
                Err(_) => ApprovalOutcome::Cancelled,
            },
            _ = expiry => ApprovalOutcome::TimedOut,
            _ = cancel.cancelled() => ApprovalOutcome::Cancelled,
        };

        let withdrawn = self.pending.lock().unwrap().remove(&ticket.id).is_some();
        if !withdrawn {
            // A response won the race against expiry/cancel; honour it.
            if let Ok(decision) = ticket.rx.try_recv() {
                return ApprovalOutcome::Decided(decision);
            }
        }

        info!(request_id = %ticket.id, outcome = %outcome, "Approval wait ended without a decision");
        self.event_bus.publish(WorkflowEvent::ApprovalResolved {
            request_id: ticket.id.clone(),
            instance_id: ticket.instance_id.clone(),
            outcome: outcome.label().to_string(),
        });
        outcome
    }

    /// Submit a payload for approval and suspend until it is resolved.
    pub async fn submit(
        &self,
        instance_id: &InstanceId,
        subject: &str,
        payload: serde_json::Value,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Submission {
        let ticket = self.request(instance_id, subject, payload).await;
        let id = ticket.id.clone();
        let outcome = self.wait(ticket, timeout, cancel).await;
        Submission { id, outcome }
    }

    /// Respond to a pending approval (called by any listener).
    /// Returns true if the request was found and resolved. Responses for
    /// unknown, expired or already-resolved ids are logged and dropped.
    pub async fn respond(&self, request_id: &str, decision: ApprovalDecision) -> bool {
        let id = CorrelationId::from_string(request_id);
        let entry = self.pending.lock().unwrap().remove(&id);
        if let Some(PendingApproval { request, tx }) = entry {
            let outcome = ApprovalOutcome::Decided(decision.clone());
            self.event_bus.publish(WorkflowEvent::ApprovalResolved {
                request_id: id,
                instance_id: request.instance_id,
                outcome: outcome.label().to_string(),
            });
            // Ignore send error (waiter may have been dropped)
            let _ = tx.send(decision);
            true
        } else {
            warn!(request_id, "Response for unknown or already-resolved approval, dropping");
            false
        }
    }

    /// Drop every pending request owned by an instance. Their waiters resolve
    /// as `Cancelled`; other instances are untouched.
    pub async fn cancel_instance(&self, instance_id: &InstanceId) -> usize {
        let removed = {
            let mut pending = self.pending.lock().unwrap();
            let before = pending.len();
            pending.retain(|_, p| &p.request.instance_id != instance_id);
            before - pending.len()
        };
        if removed > 0 {
            info!(instance_id = %instance_id, removed, "Cancelled pending approvals");
        }
        removed
    }

    /// Register a listener. Only requests submitted after this call are delivered.
    pub async fn register_listener(&self) -> Listener {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().await.insert(id, tx);
        debug!(listener_id = id, "Listener registered");
        Listener { id, rx }
    }

    /// Remove a listener. In-flight requests are unaffected.
    pub async fn deregister_listener(&self, listener_id: u64) -> bool {
        let removed = self.listeners.lock().await.remove(&listener_id).is_some();
        if removed {
            debug!(listener_id, "Listener deregistered");
        }
        removed
    }

    /// Deliver a request to every registered listener, pruning closed ones.
    /// Returns the number of deliveries.
    pub async fn broadcast(&self, request: &ApprovalRequest) -> usize {
        let mut listeners = self.listeners.lock().await;
        let mut delivered = 0;
        listeners.retain(|listener_id, tx| match tx.send(request.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(_) => {
                debug!(listener_id, "Pruning closed listener");
                false
            }
        });
        delivered
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.lock().await.len()
    }

    /// List all pending approvals.
    pub async fn pending_requests(&self) -> Vec<ApprovalRequest> {
        let mut requests: Vec<ApprovalRequest> = self
            .pending
            .lock()
            .unwrap()
            .values()
            .map(|p| p.request.clone())
            .collect();
        requests.sort_by_key(|r| r.timestamp);
        requests
    }

    /// Find a pending request by unambiguous prefix match on the id.
    pub async fn find_by_prefix(&self, prefix: &str) -> Option<CorrelationId> {
        let pending = self.pending.lock().unwrap();
        let mut matches = pending.keys().filter(|k| k.as_str().starts_with(prefix));
        let first = matches.next()?.clone();
        if matches.next().is_some() {
            return None;
        }
        Some(first)
    }
}
