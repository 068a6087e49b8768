//! Ordered pending-request queue with exactly-once resolution.
//!
//! Every decision removes its entry under the lock before any await, so two
//! decisions can never settle the same entry.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use relay_core::events::WalletEvent;
use relay_core::request::{
    ApprovedResponse, CallRequest, Decision, DuplicatePolicy, RejectedResponse, RequestId,
    CANCELLED_MESSAGE,
};
use relay_core::resolver::RequestResolver;
use relay_core::transport::SessionHandle;

use crate::error::EngineError;

/// Which entry a decision applies to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Target {
    /// Whatever sits at this position right now.
    Position(usize),
    /// The entry with `id`, expected at `position`. If it has moved, the
    /// first entry carrying `id` is used instead.
    Pinned { position: usize, id: RequestId },
}

impl From<usize> for Target {
    fn from(position: usize) -> Self {
        Self::Position(position)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued { position: usize },
    /// Duplicate id dropped under [`DuplicatePolicy::Ignore`].
    Ignored,
    /// Duplicate id refused under [`DuplicatePolicy::Reject`]; the caller
    /// owes the peer a rejection.
    Duplicate,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub version: u64,
    pub requests: Vec<CallRequest>,
}

impl QueueSnapshot {
    pub fn ids(&self) -> Vec<RequestId> {
        self.requests.iter().map(|r| r.id.clone()).collect()
    }
}

#[derive(Default)]
struct Entries {
    requests: Vec<CallRequest>,
    version: u64,
}

pub struct PendingRequestQueue {
    entries: Mutex<Entries>,
    resolver: Arc<dyn RequestResolver>,
    policy: DuplicatePolicy,
    events: broadcast::Sender<WalletEvent>,
}

impl PendingRequestQueue {
    pub fn new(
        resolver: Arc<dyn RequestResolver>,
        policy: DuplicatePolicy,
        events: broadcast::Sender<WalletEvent>,
    ) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            resolver,
            policy,
            events,
        }
    }

    /// Append `request` at the tail, subject to the duplicate-id policy.
    #[instrument(skip_all, fields(request_id = %request.id, method = %request.method))]
    pub fn enqueue(&self, request: CallRequest) -> EnqueueOutcome {
        let mut entries = self.entries.lock();
        if self.policy != DuplicatePolicy::Append
            && entries.requests.iter().any(|r| r.id == request.id)
        {
            warn!(policy = ?self.policy, "duplicate request id");
            return match self.policy {
                DuplicatePolicy::Reject => EnqueueOutcome::Duplicate,
                _ => EnqueueOutcome::Ignored,
            };
        }

        entries.requests.push(request);
        let position = entries.requests.len() - 1;
        self.publish_locked(&mut entries);
        debug!(position, "request queued");
        EnqueueOutcome::Queued { position }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().requests.is_empty()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let entries = self.entries.lock();
        QueueSnapshot {
            version: entries.version,
            requests: entries.requests.clone(),
        }
    }

    /// Capture the identity at `position` so a later decision survives
    /// positions shifting underneath it.
    pub fn pin(&self, position: usize) -> Result<Target, EngineError> {
        let entries = self.entries.lock();
        let request = entries.requests.get(position).ok_or(EngineError::OutOfRange {
            position,
            len: entries.requests.len(),
        })?;
        Ok(Target::Pinned {
            position,
            id: request.id.clone(),
        })
    }

    /// Drop every pending entry without answering any of them. Returns how
    /// many were discarded.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let discarded = entries.requests.len();
        if discarded > 0 {
            entries.requests.clear();
            self.publish_locked(&mut entries);
            info!(discarded, "pending requests discarded");
        }
        discarded
    }

    /// Remove the target, run it through the resolver, and answer the peer
    /// on `outbound`.
    ///
    /// Resolver failures and results carrying an embedded `error` both turn
    /// into a rejection of this one request; they are not returned as `Err`.
    pub async fn approve(
        &self,
        target: Target,
        outbound: &dyn SessionHandle,
    ) -> Result<Decision, EngineError> {
        let request = self.take(&target)?;

        let decision = match self.resolver.resolve(&request).await {
            Ok(result) => Decision::from_result(result),
            Err(e) => {
                warn!(request_id = %request.id, method = %request.method, error = %e, "resolver failed");
                Decision::Rejected(e.to_string())
            }
        };

        self.respond(outbound, &request.id, &decision).await;
        Ok(decision)
    }

    /// Remove the target and refuse it with the fixed cancellation reason.
    pub async fn reject(
        &self,
        target: Target,
        outbound: &dyn SessionHandle,
    ) -> Result<CallRequest, EngineError> {
        let request = self.take(&target)?;
        let decision = Decision::Rejected(CANCELLED_MESSAGE.to_owned());
        self.respond(outbound, &request.id, &decision).await;
        Ok(request)
    }

    fn take(&self, target: &Target) -> Result<CallRequest, EngineError> {
        let mut entries = self.entries.lock();
        let len = entries.requests.len();
        let index = match target {
            Target::Position(position) => {
                if *position >= len {
                    return Err(EngineError::OutOfRange {
                        position: *position,
                        len,
                    });
                }
                *position
            }
            Target::Pinned { position, id } => {
                if entries.requests.get(*position).is_some_and(|r| &r.id == id) {
                    *position
                } else {
                    entries
                        .requests
                        .iter()
                        .position(|r| &r.id == id)
                        .ok_or_else(|| EngineError::StaleSelection { id: id.clone() })?
                }
            }
        };

        let request = entries.requests.remove(index);
        self.publish_locked(&mut entries);
        debug!(request_id = %request.id, position = index, "request taken for decision");
        Ok(request)
    }

    async fn respond(&self, outbound: &dyn SessionHandle, id: &RequestId, decision: &Decision) {
        let sent = match decision {
            Decision::Approved(result) => {
                outbound
                    .approve_request(ApprovedResponse {
                        id: id.clone(),
                        result: result.clone(),
                    })
                    .await
            }
            Decision::Rejected(message) => {
                outbound
                    .reject_request(RejectedResponse::new(id.clone(), message.clone()))
                    .await
            }
        };
        match sent {
            Ok(()) => info!(request_id = %id, approved = decision.is_approved(), "request resolved"),
            Err(e) => warn!(request_id = %id, error = %e, "failed to deliver response"),
        }

        let _ = self.events.send(WalletEvent::RequestResolved {
            id: id.clone(),
            decision: decision.clone(),
        });
    }

    // Published under the lock so observers see versions in order.
    fn publish_locked(&self, entries: &mut Entries) {
        entries.version += 1;
        let _ = self.events.send(WalletEvent::QueueUpdated {
            version: entries.version,
            requests: entries.requests.clone(),
        });
    }
}
