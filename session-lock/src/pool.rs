use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::errors::LockError;
use crate::lease::Lease;

pub(crate) const DEFAULT_POOL_SEED: usize = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum ReqKind {
    #[default]
    None,
    Lock,
    Unlock,
}

#[derive(Debug)]
pub(crate) enum Reply {
    Locked(Lease),
    Unlocked(Result<(), LockError>),
}

/// One request/reply envelope travelling between a manager and its
/// serializer. The key `String` keeps its allocation across uses.
#[derive(Debug, Default)]
pub(crate) struct Request {
    pub kind: ReqKind,
    pub key: String,
    pub reply: Option<oneshot::Sender<Reply>>,
}

/// Fixed-capacity pool of pre-allocated envelopes. Lock acquisition is the
/// hot path; reusing envelopes keeps it allocation-free in the steady state.
#[derive(Debug)]
pub(crate) struct RequestPool {
    ring: Mutex<Vec<Box<Request>>>,
    capacity: usize,
}

impl RequestPool {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_POOL_SEED
        } else {
            capacity
        };
        let mut ring = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            ring.push(Box::<Request>::default());
        }
        Self {
            ring: Mutex::new(ring),
            capacity,
        }
    }

    pub(crate) fn get(&self) -> Box<Request> {
        self.ring
            .lock()
            .expect("request pool mutex poisoned")
            .pop()
            .unwrap_or_default()
    }

    pub(crate) fn put(&self, mut req: Box<Request>) {
        req.key.clear();
        req.kind = ReqKind::None;
        // Reply slots are oneshot senders and never buffer a value; dropping
        // the sender is the entire drain.
        req.reply = None;
        let mut ring = self.ring.lock().expect("request pool mutex poisoned");
        if ring.len() < self.capacity {
            ring.push(req);
        }
    }
}
