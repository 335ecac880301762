//! Request/response correlation.
//!
//! Every outbound request gets an id and a pending entry holding the caller's
//! continuation. Exactly one of three events removes the entry: the matching
//! response, the timeout, or the caller dropping its [`RequestFuture`].
//! Removal from the table is the linearization point, so whichever event
//! removes the entry first decides the outcome and later events are no-ops.
//!
//! A response that arrives after its request timed out finds no entry and is
//! dropped. The caller has already observed the timeout and must never see a
//! second resolution.
//!
//! Ids of requests that timed out or were cancelled are retired: the peer may
//! still answer them, so the allocator passes over each retired id once before
//! handing it out again, or until the late answer arrives. A late response
//! therefore cannot settle a newer request unless it arrives more than a full
//! id cycle later.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::config::MaxRequestTime;
use crate::error::{Error, Result};
use crate::packet::{Outcome, RequestId, ResponsePacket};

type ResponseSender = oneshot::Sender<Result<Value>>;

/// Pending entries plus ids that must not be reused yet.
#[derive(Default)]
struct Table {
    pending: DashMap<RequestId, PendingRequest>,
    retired: DashSet<RequestId>,
}

impl Table {
    /// Removes the entry for `id` if it still belongs to `generation`,
    /// retiring the id.
    fn expire(&self, id: RequestId, generation: u64) -> Option<PendingRequest> {
        let (_, entry) = self
            .pending
            .remove_if(&id, |_, entry| entry.generation == generation)?;
        self.retired.insert(id);
        Some(entry)
    }
}

struct PendingRequest {
    /// Distinguishes this entry from a later one that reuses the same id.
    generation: u64,
    sender: ResponseSender,
    timer: Option<AbortHandle>,
}

impl PendingRequest {
    fn settle(self, result: Result<Value>) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The caller may have stopped listening; nothing to do then.
        let _ = self.sender.send(result);
    }
}

/// Wrapping request id counter.
///
/// Ids start at 1 and increase until the counter passes `ceiling`, at which
/// point the next id is 0 and counting resumes from there.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    last: u64,
    ceiling: u64,
}

impl IdAllocator {
    /// Creates an allocator that wraps after `ceiling`.
    #[must_use]
    pub const fn new(ceiling: u64) -> Self {
        Self { last: 0, ceiling }
    }

    /// Returns the next candidate id, which may still be in use.
    pub const fn next_candidate(&mut self) -> RequestId {
        if self.last <= self.ceiling {
            self.last += 1;
        } else {
            self.last = 0;
        }
        self.last
    }

    /// Number of distinct ids the allocator cycles through.
    #[must_use]
    pub const fn span(&self) -> u64 {
        self.ceiling.saturating_add(2)
    }
}

struct Allocation {
    ids: IdAllocator,
    generation: u64,
}

/// The pending request table plus id allocation.
pub struct Correlator {
    table: Arc<Table>,
    allocation: Mutex<Allocation>,
}

impl Correlator {
    /// Creates a correlator whose ids wrap after `id_ceiling`.
    pub fn new(id_ceiling: u64) -> Self {
        Self {
            table: Arc::new(Table::default()),
            allocation: Mutex::new(Allocation {
                ids: IdAllocator::new(id_ceiling),
                generation: 0,
            }),
        }
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.table.pending.len()
    }

    /// Allocates an id, stores the pending entry and arms its timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IdSpaceExhausted`] if every id is held by a pending
    /// or retired request, and [`Error::NoRuntime`] if a finite timeout is
    /// requested outside a Tokio runtime.
    pub fn register(
        &self,
        max_request_time: MaxRequestTime,
    ) -> Result<(RequestId, RequestFuture)> {
        let deadline = match max_request_time {
            MaxRequestTime::Finite(duration) => {
                let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
                Some((runtime, duration))
            }
            MaxRequestTime::Infinite => None,
        };
        let (sender, receiver) = oneshot::channel();

        let (id, generation) = {
            let mut allocation = self.allocation.lock();
            allocation.generation += 1;
            let generation = allocation.generation;

            // Skipping ids that are still pending keeps concurrent requests
            // unique across wraparound. Never more than one lap, so a retired
            // id is passed over at least once.
            let busy = self.table.pending.len() + self.table.retired.len();
            let attempts = allocation.ids.span().min(busy as u64 + 1);
            let mut slot = None;
            for _ in 0..attempts {
                let id = allocation.ids.next_candidate();
                if self.table.retired.remove(&id).is_some() {
                    trace!("request id {} recently expired, skipping", id);
                    continue;
                }
                if let Entry::Vacant(entry) = self.table.pending.entry(id) {
                    entry.insert(PendingRequest {
                        generation,
                        sender,
                        timer: None,
                    });
                    slot = Some(id);
                    break;
                }
                trace!("request id {} still pending, skipping", id);
            }

            match slot {
                Some(id) => (id, generation),
                None => return Err(Error::IdSpaceExhausted(allocation.ids.ceiling)),
            }
        };

        if let Some((runtime, duration)) = deadline {
            let timer = self.arm_timeout(&runtime, id, generation, duration);
            if let Some(mut entry) = self.table.pending.get_mut(&id) {
                if entry.generation == generation {
                    entry.timer = Some(timer);
                }
            }
        }

        let future = RequestFuture {
            state: State::Waiting {
                id,
                generation,
                receiver,
                table: Arc::clone(&self.table),
            },
        };
        Ok((id, future))
    }

    fn arm_timeout(
        &self,
        runtime: &Handle,
        id: RequestId,
        generation: u64,
        duration: Duration,
    ) -> AbortHandle {
        let table = Arc::clone(&self.table);
        runtime
            .spawn(async move {
                tokio::time::sleep(duration).await;
                if let Some(entry) = table.expire(id, generation) {
                    debug!("request {} timed out after {:?}", id, duration);
                    entry.sender.send(Err(Error::Timeout(duration))).ok();
                }
            })
            .abort_handle()
    }

    /// Settles the pending entry matching `response`.
    ///
    /// Returns `false` when no entry exists (late, duplicate or spurious
    /// response), which is not an error.
    pub fn resolve(&self, response: ResponsePacket) -> bool {
        let Some((_, entry)) = self.table.pending.remove(&response.id) else {
            // Once the peer has answered, a retired id is safe to reuse.
            if self.table.retired.remove(&response.id).is_some() {
                trace!("dropping late response for expired request {}", response.id);
            } else {
                trace!("dropping response for unknown request {}", response.id);
            }
            return false;
        };

        debug!("resolving request {}", response.id);
        entry.settle(match response.outcome {
            Outcome::Success(payload) => Ok(payload),
            Outcome::Failure(message) => Err(Error::Remote(message)),
        });
        true
    }
}

enum State {
    Failed(Error),
    Waiting {
        id: RequestId,
        generation: u64,
        receiver: oneshot::Receiver<Result<Value>>,
        table: Arc<Table>,
    },
    Done,
}

/// Future returned by [`Rpc::request`](crate::Rpc::request).
///
/// Resolves with the response payload, or fails with the peer's error, a
/// timeout, or the error that prevented the request from being sent. Dropping
/// it before completion cancels the request locally.
#[must_use = "dropping a RequestFuture cancels the request"]
pub struct RequestFuture {
    state: State,
}

impl RequestFuture {
    /// A future that fails immediately with `error`.
    pub(crate) const fn failed(error: Error) -> Self {
        Self {
            state: State::Failed(error),
        }
    }

    /// The id of the outbound request, if it was sent.
    #[must_use]
    pub const fn id(&self) -> Option<RequestId> {
        match &self.state {
            State::Waiting { id, .. } => Some(*id),
            State::Failed(_) | State::Done => None,
        }
    }

    /// Removes the pending entry without waiting for a response.
    ///
    /// Returns `true` if the request was still pending. A response arriving
    /// afterwards is ignored.
    pub fn cancel(mut self) -> bool {
        self.release()
    }

    fn release(&mut self) -> bool {
        match std::mem::replace(&mut self.state, State::Done) {
            State::Waiting {
                id,
                generation,
                table,
                ..
            } => table
                .expire(id, generation)
                .map(|entry| entry.settle(Err(Error::Cancelled)))
                .is_some(),
            State::Failed(_) | State::Done => false,
        }
    }
}

impl Future for RequestFuture {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let result = match &mut this.state {
            State::Waiting { receiver, .. } => match Pin::new(receiver).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(result)) => result,
                Poll::Ready(Err(_)) => Err(Error::ChannelClosed),
            },
            State::Failed(_) => match std::mem::replace(&mut this.state, State::Done) {
                State::Failed(error) => Err(error),
                _ => Err(Error::ChannelClosed),
            },
            State::Done => Err(Error::ChannelClosed),
        };

        this.state = State::Done;
        Poll::Ready(result)
    }
}

impl Drop for RequestFuture {
    fn drop(&mut self) {
        if self.release() {
            debug!("request cancelled before completion");
        }
    }
}
