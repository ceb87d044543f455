//! The winner/waiter concurrency core.
//!
//! Contending threads on one data node elect a single winner by CAS-ing
//! their context into the skip-list node's `ctx` slot. Losers hand their
//! operation over to the winner through an MPSC queue and spin on their
//! request's completion flag; the winner batches all pending work into one
//! remote round-trip. `max_depth` bounds how many losers may join a round:
//! it is decremented per joiner and parked at -1 while the winner works,
//! so late arrivals fall back to retry instead of queueing behind a closed
//! window.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;

use crate::{KeyBuf, ValueBuf};

/// How many losers a winner accepts per round.
pub const HANDOVER_WINDOW: i32 = 4;

/// Spinning losers give up after this long and retry from dispatch. The
/// winner may still complete the handed-over op afterwards; put and update
/// are idempotent, so the retried op lands on the already-applied state.
const HANDOVER_PATIENCE: Duration = Duration::from_millis(100);

/// Operation class a context is currently elected for. Losers only hand
/// over to a winner of the same class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OpType {
    Insert = 0,
    Update = 1,
    Delete = 2,
}

impl OpType {
    fn from_u8(v: u8) -> OpType {
        match v {
            0 => OpType::Insert,
            1 => OpType::Update,
            _ => OpType::Delete,
        }
    }
}

/// A loser's offer to the winner. The key and value are captured by copy,
/// so the submitter's stack can unwind freely once `wait` returns.
///
/// `target` names the data node the loser was contending on. A stale
/// loser can observe a context pointer just before its owner finishes a
/// round and enqueue into the owner's *next* election - possibly on a
/// different data node. Winners compare the tag and bounce mismatches as
/// retries instead of planting the pair in the wrong record.
pub struct Request {
    pub key: KeyBuf,
    pub value: ValueBuf,
    pub target: usize,
    done: AtomicBool,
    succeed: AtomicBool,
    retry: AtomicBool,
}

impl Request {
    pub fn new(key: &KeyBuf, value: &ValueBuf, target: usize) -> Arc<Request> {
        Arc::new(Request {
            key: *key,
            value: *value,
            target,
            done: AtomicBool::new(false),
            succeed: AtomicBool::new(false),
            retry: AtomicBool::new(false),
        })
    }

    /// Publish the outcome and release the spinning submitter.
    pub fn complete(&self, succeed: bool, retry: bool) {
        self.succeed.store(succeed, Ordering::Relaxed);
        self.retry.store(retry, Ordering::Relaxed);
        self.done.store(true, Ordering::Release);
    }

    /// Spin until completed. Returns `(succeed, retry)`.
    pub fn wait(&self) -> (bool, bool) {
        let start = Instant::now();
        let mut spins = 0u32;
        while !self.done.load(Ordering::Acquire) {
            std::hint::spin_loop();
            spins += 1;
            if spins & 0x3ff == 0 {
                std::thread::yield_now();
                if start.elapsed() > HANDOVER_PATIENCE {
                    return (false, true);
                }
            }
        }
        (
            self.succeed.load(Ordering::Relaxed),
            self.retry.load(Ordering::Relaxed),
        )
    }
}

/// Per-thread election context, published into a skip-list node's `ctx`
/// slot by the CAS winner. Lives as long as its owning compute node so a
/// loser's stale pointer never dangles.
pub struct ConcurrencyContext {
    op: AtomicU8,
    pub max_depth: AtomicI32,
    pub requests: SegQueue<Arc<Request>>,
}

impl ConcurrencyContext {
    pub fn new() -> Arc<ConcurrencyContext> {
        Arc::new(ConcurrencyContext {
            op: AtomicU8::new(OpType::Insert as u8),
            max_depth: AtomicI32::new(HANDOVER_WINDOW),
            requests: SegQueue::new(),
        })
    }

    pub fn op(&self) -> OpType {
        OpType::from_u8(self.op.load(Ordering::Acquire))
    }

    pub fn set_op(&self, op: OpType) {
        self.op.store(op as u8, Ordering::Release);
    }

    /// Close the submission window while the winner works on the fetched
    /// record.
    pub fn close_window(&self) {
        self.max_depth.store(-1, Ordering::Release);
    }

    /// Reopen the window for the next round. Callers reset the published
    /// `ctx` slot to null first, or a late request could queue behind a
    /// winner that will never drain it.
    pub fn open_window(&self) {
        self.max_depth.store(HANDOVER_WINDOW, Ordering::Release);
    }

    /// Loser-side handover: claim a window slot and enqueue, or report
    /// that the caller must retry from dispatch. Returns `(succeed,
    /// retry)`.
    pub fn hand_over(&self, key: &KeyBuf, value: &ValueBuf, target: usize) -> (bool, bool) {
        let depth = self.max_depth.fetch_sub(1, Ordering::AcqRel);
        if depth > 0 {
            let req = Request::new(key, value, target);
            self.requests.push(req.clone());
            req.wait()
        } else {
            (false, true)
        }
    }

    /// Finish every stale request with a retry verdict. Run by a context's
    /// owner before each winner attempt so no handover from a previous
    /// round is left spinning.
    pub fn drain_pending(&self) {
        while let Some(req) = self.requests.pop() {
            req.complete(false, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(n: u8) -> (KeyBuf, ValueBuf) {
        ([n; 16], [n.wrapping_add(1); 16])
    }

    #[test]
    fn request_completion_wakes_waiter() {
        let (k, v) = kv(1);
        let req = Request::new(&k, &v, 0);
        let waiter = req.clone();
        let t = std::thread::spawn(move || waiter.wait());
        req.complete(true, false);
        assert_eq!(t.join().unwrap(), (true, false));
    }

    #[test]
    fn window_counts_joiners() {
        let ctx = ConcurrencyContext::new();
        // winner working: everyone bounces
        ctx.close_window();
        let (k, v) = kv(2);
        assert_eq!(ctx.hand_over(&k, &v, 0), (false, true));
        assert_eq!(ctx.requests.len(), 0);

        ctx.open_window();
        // four slots, completed by a helper thread playing the winner
        let ctx2 = ctx.clone();
        let winner = std::thread::spawn(move || {
            let mut served = 0;
            while served < HANDOVER_WINDOW {
                if let Some(req) = ctx2.requests.pop() {
                    req.complete(true, false);
                    served += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        });
        let mut joins = Vec::new();
        for i in 0..HANDOVER_WINDOW as u8 {
            let ctx = ctx.clone();
            joins.push(std::thread::spawn(move || {
                let (k, v) = kv(10 + i);
                ctx.hand_over(&k, &v, 0)
            }));
        }
        for j in joins {
            assert_eq!(j.join().unwrap(), (true, false));
        }
        winner.join().unwrap();

        // window exhausted now
        let (k, v) = kv(99);
        assert_eq!(ctx.hand_over(&k, &v, 0), (false, true));
    }

    #[test]
    fn drain_pending_finishes_with_retry() {
        let ctx = ConcurrencyContext::new();
        let (k, v) = kv(3);
        let req = Request::new(&k, &v, 0);
        ctx.requests.push(req.clone());
        ctx.drain_pending();
        assert_eq!(req.wait(), (false, true));
    }

    #[test]
    fn mismatched_op_type_is_visible() {
        let ctx = ConcurrencyContext::new();
        ctx.set_op(OpType::Update);
        assert_eq!(ctx.op(), OpType::Update);
        ctx.set_op(OpType::Insert);
        assert_eq!(ctx.op(), OpType::Insert);
    }
}
