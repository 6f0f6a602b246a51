//! The asynchronous request queue.
//!
//! Client calls become [`QueuedRequest`] records processed strictly in
//! enqueue order by the service's drive loop. A record stays queued while
//! its handler is parked on an authentication flow (`InProgress`) and is
//! removed only on terminal completion, so requests complete in arbitrary
//! order relative to one another.

use std::collections::VecDeque;
use std::sync::mpsc;

use tracing::{debug, warn};

use crate::error::{Error, SecretsResult};
use crate::types::{Pid, RequestArgs, RequestId, RequestKind, Response, ResponseBody};

/// Where a request's reply goes once it completes.
#[derive(Debug, Clone)]
pub enum ReplySink {
    /// A client connection's reply channel.
    Client(mpsc::Sender<Response>),
    /// An internal request made on behalf of the crypto subsystem.
    CryptoHelper { crypto_request_id: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestStatus {
    Pending,
    InProgress,
    Finished,
}

/// One tracked request.
pub(crate) struct QueuedRequest {
    pub id: RequestId,
    pub caller_pid: Pid,
    pub kind: RequestKind,
    /// Taken by the drive loop when the request is first dispatched.
    pub args: Option<RequestArgs>,
    pub reply: ReplySink,
    pub status: RequestStatus,
    /// Set by `request_finished` for asynchronously completed requests.
    pub outcome: Option<SecretsResult<ResponseBody>>,
}

/// Ordered store of tracked requests with id allocation.
pub(crate) struct RequestQueue {
    requests: VecDeque<QueuedRequest>,
    next_id: RequestId,
    id_space: u64,
}

impl RequestQueue {
    pub fn new(id_space: u64) -> Self {
        Self {
            requests: VecDeque::new(),
            next_id: 0,
            id_space: id_space.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Allocates a free request id.
    ///
    /// Ids are drawn from a wrapping counter; an id still held by a tracked
    /// request is skipped. With every id in the space in use the queue is
    /// full.
    fn allocate_id(&mut self) -> SecretsResult<RequestId> {
        if self.requests.len() as u64 >= self.id_space {
            return Err(Error::RequestQueueFull);
        }
        loop {
            let candidate = self.next_id % self.id_space;
            self.next_id = self.next_id.wrapping_add(1) % self.id_space;
            if !self.requests.iter().any(|r| r.id == candidate) {
                return Ok(candidate);
            }
        }
    }

    /// Enqueues a request, returning its id.
    ///
    /// # Errors
    ///
    /// Returns `RequestQueueFull` when no request id is free.
    pub fn enqueue(
        &mut self,
        caller_pid: Pid,
        args: RequestArgs,
        reply: ReplySink,
    ) -> SecretsResult<RequestId> {
        let kind = args.kind();
        let id = match self.allocate_id() {
            Ok(id) => id,
            Err(err) => {
                warn!(%kind, "cannot enqueue request: queue is full");
                return Err(err);
            }
        };
        debug!(%kind, request_id = id, "enqueuing request");
        self.requests.push_back(QueuedRequest {
            id,
            caller_pid,
            kind,
            args: Some(args),
            reply,
            status: RequestStatus::Pending,
            outcome: None,
        });
        Ok(id)
    }

    /// Marks an in-progress request finished with its outcome.
    ///
    /// Unknown ids are logged and dropped.
    pub fn finish(&mut self, request_id: RequestId, outcome: SecretsResult<ResponseBody>) -> bool {
        match self.requests.iter_mut().find(|r| r.id == request_id) {
            Some(request) => {
                request.status = RequestStatus::Finished;
                request.outcome = Some(outcome);
                true
            }
            None => {
                warn!(request_id, "unable to finish unknown request");
                false
            }
        }
    }

    pub fn status_at(&self, index: usize) -> Option<RequestStatus> {
        self.requests.get(index).map(|r| r.status)
    }

    /// Marks the request at `index` in progress and takes its arguments
    /// for dispatch.
    pub fn start_at(&mut self, index: usize) -> Option<(RequestId, Pid, RequestArgs)> {
        let request = self.requests.get_mut(index)?;
        let args = request.args.take()?;
        request.status = RequestStatus::InProgress;
        Some((request.id, request.caller_pid, args))
    }

    /// Removes the request at `index` for reply emission.
    pub fn remove_at(&mut self, index: usize) -> Option<QueuedRequest> {
        self.requests.remove(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_sink() -> (ReplySink, mpsc::Receiver<Response>) {
        let (tx, rx) = mpsc::channel();
        (ReplySink::Client(tx), rx)
    }

    #[test]
    fn test_ids_are_monotonic_among_tracked_requests() {
        let mut queue = RequestQueue::new(u64::MAX);
        let (sink, _rx) = client_sink();
        let first = queue.enqueue(1, RequestArgs::GetPluginInfo, sink.clone()).expect("enqueue");
        let second = queue.enqueue(1, RequestArgs::GetPluginInfo, sink).expect("enqueue");
        assert!(second > first);
    }

    #[test]
    fn test_queue_full_when_id_space_exhausted() {
        let mut queue = RequestQueue::new(2);
        let (sink, _rx) = client_sink();
        queue.enqueue(1, RequestArgs::GetPluginInfo, sink.clone()).expect("enqueue");
        queue.enqueue(1, RequestArgs::GetPluginInfo, sink.clone()).expect("enqueue");
        match queue.enqueue(1, RequestArgs::GetPluginInfo, sink) {
            Err(Error::RequestQueueFull) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_freed_ids_are_reused_after_wraparound() {
        let mut queue = RequestQueue::new(2);
        let (sink, _rx) = client_sink();
        let first = queue.enqueue(1, RequestArgs::GetPluginInfo, sink.clone()).expect("enqueue");
        let _second = queue.enqueue(1, RequestArgs::GetPluginInfo, sink.clone()).expect("enqueue");
        let index = (0..queue.len())
            .find(|i| queue.requests[*i].id == first)
            .expect("index");
        queue.remove_at(index);
        let third = queue.enqueue(1, RequestArgs::GetPluginInfo, sink).expect("enqueue");
        assert_eq!(third, first);
    }

    #[test]
    fn test_finish_unknown_request_is_dropped() {
        let mut queue = RequestQueue::new(u64::MAX);
        assert!(!queue.finish(42, Ok(ResponseBody::None)));
    }

    #[test]
    fn test_start_takes_args_once() {
        let mut queue = RequestQueue::new(u64::MAX);
        let (sink, _rx) = client_sink();
        queue.enqueue(7, RequestArgs::GetPluginInfo, sink).expect("enqueue");
        let (id, pid, _args) = queue.start_at(0).expect("start");
        assert_eq!(pid, 7);
        assert_eq!(queue.status_at(0), Some(RequestStatus::InProgress));
        assert!(queue.start_at(0).is_none());
        queue.finish(id, Ok(ResponseBody::None));
        assert_eq!(queue.status_at(0), Some(RequestStatus::Finished));
    }
}
