//! A lock-free multi-producer, multi-consumer queue of fixed-capacity byte
//! records.
//!
//! See the [`Queue`] type for details.

use crate::{
    cursor::{AtomicCursor, Cursor},
    loom::atomic::{AtomicUsize, Ordering::*},
    node::Node,
    util::{Backoff, CachePadded},
    Error,
};
use alloc::alloc::{handle_alloc_error, Layout};
use core::{fmt, ptr::NonNull};
use crossbeam_epoch::{Collector, Guard, LocalHandle};

/// The default record capacity, in bytes.
pub const RECORD_CAPACITY: usize = 512;

/// A lock-free, unbounded, multi-producer, multi-consumer FIFO queue of byte
/// records no longer than `CAP` bytes.
///
/// Records are copied in by [`enqueue`] and copied out by [`dequeue`]. Both
/// operations may be called concurrently from any number of threads through a
/// shared reference; neither ever blocks on a lock. Instead, threads
/// coordinate with compare-and-swap loops on the queue's `head` and `tail`
/// cursors, so an individual call may retry under contention, but some call
/// always completes.
///
/// # Implementation
///
/// The queue is a singly-linked list of heap-allocated nodes, each reserving
/// `CAP` bytes for its record. The list is never empty: the node at the
/// `head` is the next record to hand out, or a *placeholder* carrying no
/// record at all. A freshly created queue holds a single placeholder.
///
/// A record is taken by moving the `head` past the node that holds it. When
/// that node is also the last one in the list, a consumer first appends a new
/// placeholder behind it, so the `head` always has somewhere to move. Producers
/// collapse a placeholder sitting at the `head` as soon as a real record has
/// been linked behind it. Placeholders are never handed to callers.
///
/// Nodes that the `head` has moved past are reclaimed with epoch-based
/// reclamation: each queue owns a [`crossbeam_epoch::Collector`], every
/// operation runs pinned to it, and a retired node is released only once no
/// thread that could have observed it is still pinned.
///
/// Each operation made directly on the queue registers with its collector for
/// the duration of the call, which allocates a fresh participant record and
/// frees it again afterwards. That is fine for occasional calls, but a thread
/// that enqueues or dequeues in a loop should take a [`Handle`] once with
/// [`Queue::handle`] and go through it instead: a handle registers once and
/// reuses that registration for every operation.
///
/// ```
/// use lfqueue::Queue;
///
/// let q = Queue::<8>::new();
/// let handle = q.handle();
/// for i in 0u8..100 {
///     handle.enqueue(&[i]).unwrap();
/// }
/// let mut buf = [0u8; 8];
/// for i in 0u8..100 {
///     assert_eq!(handle.dequeue(&mut buf), Ok(1));
///     assert_eq!(buf[0], i);
/// }
/// ```
///
/// [`enqueue`]: Queue::enqueue
/// [`dequeue`]: Queue::dequeue
pub struct Queue<const CAP: usize = RECORD_CAPACITY> {
    /// The node holding the next record to dequeue.
    head: CachePadded<AtomicCursor<CAP>>,

    /// The last node in the list, or the one just before it while an append
    /// is still moving the tail.
    tail: CachePadded<AtomicCursor<CAP>>,

    /// Approximate number of records in the queue.
    len: CachePadded<AtomicUsize>,

    collector: Collector,
}

/// A handle that keeps the calling thread registered with a [`Queue`]'s
/// memory reclaimer between operations.
///
/// [`Queue::enqueue`] and [`Queue::dequeue`] register and unregister the
/// calling thread on every call. A `Handle` registers once, when it is
/// created by [`Queue::handle`], which is cheaper when one thread performs
/// many operations.
///
/// A `Handle` is bound to the thread that created it.
pub struct Handle<'q, const CAP: usize = RECORD_CAPACITY> {
    q: &'q Queue<CAP>,
    local: LocalHandle,
}

// === impl Queue ===

impl<const CAP: usize> Queue<CAP> {
    /// The maximum length, in bytes, of a record in this queue.
    pub const CAPACITY: usize = CAP;

    /// Returns a new, empty queue.
    ///
    /// # Panics
    ///
    /// If `CAP` is zero.
    ///
    /// If the queue's first node cannot be allocated, this calls
    /// [`handle_alloc_error`]. Use [`Queue::try_new`] to handle both cases
    /// as errors instead.
    #[must_use]
    pub fn new() -> Self {
        match Self::try_new() {
            Ok(q) => q,
            Err(Error::AllocationFailed) => handle_alloc_error(Layout::new::<Node<CAP>>()),
            Err(error) => panic!("cannot create a queue with record capacity {CAP}: {error}"),
        }
    }

    /// Returns a new, empty queue.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `CAP` is zero
    /// - [`Error::AllocationFailed`] if the queue's first node cannot be
    ///   allocated
    pub fn try_new() -> Result<Self, Error> {
        if CAP == 0 {
            debug!(capacity = CAP, "refusing to create a zero-capacity queue");
            return Err(Error::InvalidArgument);
        }

        let seed = Node::allocate(None)?;
        let cursor = Cursor::new(seed);
        debug!(capacity = CAP, seed = ?cursor, "initialized queue");

        Ok(Self {
            head: CachePadded(AtomicCursor::new(cursor)),
            tail: CachePadded(AtomicCursor::new(cursor)),
            len: CachePadded(AtomicUsize::new(0)),
            collector: Collector::new(),
        })
    }

    /// Returns the maximum length, in bytes, of a record in this queue.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        CAP
    }

    /// Returns the number of records in the queue.
    ///
    /// This is a snapshot which may already be stale by the time it is
    /// returned, if other threads are enqueueing or dequeueing concurrently.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Relaxed)
    }

    /// Returns `true` if the queue held no records at the moment it was
    /// inspected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let _guard = self.pin();
        let head = self.head.load();
        // Safety: the queue is pinned, so the head node cannot be released.
        let info = unsafe { head.node.as_ref() }.info();
        info.placeholder && info.next.is_none()
    }

    /// Appends a copy of `record` to the back of the queue.
    ///
    /// Each call registers with the queue's reclaimer anew; use a [`Handle`]
    /// for repeated calls from one thread.
    ///
    /// # Errors
    ///
    /// - [`Error::RecordTooLarge`] if `record` is longer than the queue's
    ///   record capacity
    /// - [`Error::AllocationFailed`] if a node for the record cannot be
    ///   allocated
    pub fn enqueue(&self, record: &[u8]) -> Result<(), Error> {
        self.enqueue_pinned(record, &self.pin())
    }

    /// Removes the record at the front of the queue, copying it into `buf`.
    ///
    /// Returns the number of bytes written to `buf`. If the record is longer
    /// than `buf`, only its first `buf.len()` bytes are written and the rest
    /// of the record is discarded.
    ///
    /// Like [`Queue::enqueue`], each call registers with the reclaimer anew.
    ///
    /// # Errors
    ///
    /// - [`Error::Empty`] if there are no records in the queue
    /// - [`Error::RecordTooLarge`] if `buf` is longer than the queue's record
    ///   capacity
    /// - [`Error::AllocationFailed`] if the queue needed a placeholder node
    ///   and could not allocate one
    pub fn dequeue(&self, buf: &mut [u8]) -> Result<usize, Error> {
        self.dequeue_pinned(buf, &self.pin())
    }

    /// Returns a [`Handle`] which keeps the calling thread registered with
    /// this queue until it is dropped.
    #[must_use]
    pub fn handle(&self) -> Handle<'_, CAP> {
        Handle {
            q: self,
            local: self.collector.register(),
        }
    }

    /// Registers with the collector just long enough to run one operation.
    ///
    /// Dropping the `LocalHandle` here is fine: a participant with a live
    /// guard is only unregistered once that guard is dropped as well.
    #[inline]
    fn pin(&self) -> Guard {
        self.collector.register().pin()
    }

    fn enqueue_pinned(&self, record: &[u8], guard: &Guard) -> Result<(), Error> {
        let len = record.len();
        if len > CAP {
            debug!(len, capacity = CAP, "record too large to enqueue");
            return Err(Error::RecordTooLarge { len, capacity: CAP });
        }

        let node = Node::allocate(Some(record))?;
        // Counted before the node is linked, so that a consumer can never
        // take the record before it is counted.
        self.len.fetch_add(1, Relaxed);
        self.append(node, guard);
        trace!(len, "enqueued record");
        Ok(())
    }

    fn dequeue_pinned(&self, buf: &mut [u8], guard: &Guard) -> Result<usize, Error> {
        if buf.len() > CAP {
            debug!(
                len = buf.len(),
                capacity = CAP,
                "dequeue buffer exceeds record capacity"
            );
            return Err(Error::RecordTooLarge {
                len: buf.len(),
                capacity: CAP,
            });
        }

        let mut boff = Backoff::new();
        loop {
            let head = self.head.load();
            // Safety: the queue is pinned, and nodes are only retired once
            // both cursors have moved past them.
            let node = unsafe { head.node.as_ref() };
            let info = node.info();

            let Some(next) = info.next else {
                if info.placeholder {
                    return Err(Error::Empty);
                }

                // The head holds the last record in the list. Give the head
                // somewhere to move once that record is taken.
                let placeholder = Node::allocate(None)?;
                self.append(placeholder, guard);
                trace!(?head, "appended placeholder behind last record");
                continue;
            };

            if !self.advance_head(head, next) {
                test_trace!(?head, "lost the race for the head; retrying");
                boff.spin();
                continue;
            }

            // The node is ours now. Placeholders have nothing to hand out;
            // throw them away and look at the new head.
            if info.placeholder {
                test_trace!(?head, "skipped placeholder");
                // Safety: this thread won the head swap that unlinked the
                // node, and the tail was moved off it first.
                unsafe { self.retire(head.node, guard) };
                continue;
            }

            let record = node.record();
            let n = record.len().min(buf.len());
            buf[..n].copy_from_slice(&record[..n]);
            self.len.fetch_sub(1, Relaxed);
            trace!(len = record.len(), ?head, "dequeued record");

            // Safety: as above. The record was copied out before retiring.
            unsafe { self.retire(head.node, guard) };
            return Ok(n);
        }
    }

    /// Links `node` after the last node in the list and moves the tail onto
    /// it.
    fn append(&self, node: NonNull<Node<CAP>>, guard: &Guard) {
        let mut boff = Backoff::new();
        let tail = loop {
            let tail = self.tail.load();
            // Safety: the queue is pinned, and a node is only retired after
            // the tail has moved off of it.
            let last = unsafe { tail.node.as_ref() };
            let info = last.info();

            if info.next.is_some() {
                // Another append has linked its node but not yet moved the
                // tail. Wait for it to catch up.
                test_trace!(?tail, ?info, "tail is lagging; retrying");
                boff.spin();
                continue;
            }

            match last.link(info, node) {
                Ok(()) => break tail,
                Err(_actual) => {
                    test_trace!(?tail, ?_actual, "lost the race to link; retrying");
                    boff.spin();
                }
            }
        };

        // The node is now part of the list. Only a consumer that found the
        // tail on the node it is retiring moves the tail besides us, and it
        // moves it onto the same node, so losing this swap is fine.
        let new_tail = tail.advance(node);
        if let Err(_actual) = self.tail.compare_exchange(tail, new_tail) {
            test_trace!(?tail, ?_actual, "tail was already moved onto the new node");
        }
        trace!(tail = ?new_tail, "appended node");

        self.collapse_placeholder(guard);
    }

    /// If the head is a placeholder with a successor, moves the head past it.
    fn collapse_placeholder(&self, guard: &Guard) {
        let head = self.head.load();
        // Safety: the queue is pinned.
        let info = unsafe { head.node.as_ref() }.info();
        let (true, Some(next)) = (info.placeholder, info.next) else {
            return;
        };

        if self.advance_head(head, next) {
            trace!(?head, "collapsed placeholder at head");
            // Safety: this thread won the head swap that unlinked the node,
            // and the tail was moved off it first.
            unsafe { self.retire(head.node, guard) };
        }
    }

    /// Moves the head from `head` onto `next`, which must be the successor of
    /// `head.node`. Returns `false` if the head moved first.
    fn advance_head(&self, head: Cursor<CAP>, next: NonNull<Node<CAP>>) -> bool {
        // The head must never pass the tail, or the tail could be left
        // pointing at a released node.
        let mut tail = self.tail.load();
        while tail.node == head.node {
            match self.tail.compare_exchange(tail, tail.advance(next)) {
                Ok(()) => {
                    test_trace!(?tail, "moved lagging tail before advancing head");
                    break;
                }
                Err(actual) => tail = actual,
            }
        }

        self.head.compare_exchange(head, head.advance(next)).is_ok()
    }

    /// Releases `node` once no pinned thread can still observe it.
    ///
    /// # Safety
    ///
    /// `node` must have been unlinked from the head by the calling thread and
    /// must no longer be the tail. Each node may be retired only once.
    unsafe fn retire(&self, node: NonNull<Node<CAP>>, guard: &Guard) {
        guard.defer_unchecked(move || Node::release(node));
    }
}

impl<const CAP: usize> Drop for Queue<CAP> {
    fn drop(&mut self) {
        // `&mut self` means no other thread can be pinned to this queue, so
        // every node still linked from the head can be released now. Nodes
        // already retired are released when the collector is dropped.
        let mut current = Some(self.head.load().node);
        while let Some(node) = current {
            unsafe {
                // Safety: we have exclusive access to the list, and nodes from
                // the head onward have not been retired.
                current = node.as_ref().info().next;
                Node::release(node);
            }
        }
    }
}

impl<const CAP: usize> Default for Queue<CAP> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CAP: usize> fmt::Debug for Queue<CAP> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("len", &self.len())
            .field("capacity", &CAP)
            .finish()
    }
}

// === impl Handle ===

impl<const CAP: usize> Handle<'_, CAP> {
    /// Appends a copy of `record` to the back of the queue.
    ///
    /// This is [`Queue::enqueue`] without registering with the queue's
    /// reclaimer on every call.
    ///
    /// # Errors
    ///
    /// - [`Error::RecordTooLarge`] if `record` is longer than the queue's
    ///   record capacity
    /// - [`Error::AllocationFailed`] if a node for the record cannot be
    ///   allocated
    #[inline]
    pub fn enqueue(&self, record: &[u8]) -> Result<(), Error> {
        self.q.enqueue_pinned(record, &self.local.pin())
    }

    /// Removes the record at the front of the queue, copying it into `buf`.
    ///
    /// This is [`Queue::dequeue`] without registering with the queue's
    /// reclaimer on every call.
    ///
    /// # Errors
    ///
    /// - [`Error::Empty`] if there are no records in the queue
    /// - [`Error::RecordTooLarge`] if `buf` is longer than the queue's record
    ///   capacity
    /// - [`Error::AllocationFailed`] if the queue needed a placeholder node
    ///   and could not allocate one
    #[inline]
    pub fn dequeue(&self, buf: &mut [u8]) -> Result<usize, Error> {
        self.q.dequeue_pinned(buf, &self.local.pin())
    }

    /// Returns the queue this handle operates on.
    #[inline]
    #[must_use]
    pub fn queue(&self) -> &Queue<CAP> {
        self.q
    }
}

impl<const CAP: usize> fmt::Debug for Handle<'_, CAP> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("queue", &self.q)
            .field("pinned", &self.local.is_pinned())
            .finish()
    }
}

#[cfg(all(loom, test))]
mod loom {
    use super::*;
    use crate::loom::{self, sync::Arc, thread};

    type Q = Queue<4>;

    fn model(f: impl Fn() + Send + Sync + 'static) {
        let mut builder = loom::model::Builder::new();
        builder.preemption_bound = Some(3);
        builder.check(f)
    }

    fn drain(q: &Q, expected: usize) -> Vec<u8> {
        let mut buf = [0u8; 4];
        let mut got = Vec::new();
        while got.len() < expected {
            match q.dequeue(&mut buf[..1]) {
                Ok(n) => {
                    assert_eq!(n, 1);
                    got.push(buf[0]);
                }
                Err(Error::Empty) => thread::yield_now(),
                Err(error) => panic!("unexpected dequeue error: {error}"),
            }
        }
        got
    }

    #[test]
    fn concurrent_producers() {
        model(|| {
            let q = Arc::new(Q::new());
            let producers: Vec<_> = (1..=2u8)
                .map(|tag| {
                    let q = q.clone();
                    thread::spawn(move || q.enqueue(&[tag]).unwrap())
                })
                .collect();

            let mut got = drain(&q, 2);
            for producer in producers {
                producer.join().unwrap();
            }

            got.sort_unstable();
            assert_eq!(got, [1, 2]);
            assert_eq!(q.dequeue(&mut [0u8; 1]), Err(Error::Empty));
        })
    }

    #[test]
    fn competing_consumers_take_each_record_once() {
        model(|| {
            let q = Arc::new(Q::new());
            q.enqueue(&[1]).unwrap();
            q.enqueue(&[2]).unwrap();

            let consumer = {
                let q = q.clone();
                thread::spawn(move || {
                    let mut buf = [0u8; 1];
                    q.dequeue(&mut buf).ok().map(|_| buf[0])
                })
            };

            let mut buf = [0u8; 1];
            let mine = q.dequeue(&mut buf).ok().map(|_| buf[0]);
            let theirs = consumer.join().unwrap();

            let mut got: Vec<u8> = mine.into_iter().chain(theirs).collect();
            got.sort_unstable();
            assert_eq!(got, [1, 2]);
        })
    }

    #[test]
    fn last_record_races_placeholder_collapse() {
        // A consumer taking the only record appends a placeholder, while a
        // producer appending behind it may collapse that placeholder.
        model(|| {
            let q = Arc::new(Q::new());
            q.enqueue(&[1]).unwrap();

            let producer = {
                let q = q.clone();
                thread::spawn(move || q.enqueue(&[2]).unwrap())
            };

            let got = drain(&q, 2);
            producer.join().unwrap();

            assert_eq!(got, [1, 2], "records must come out in link order");
            assert_eq!(q.dequeue(&mut [0u8; 1]), Err(Error::Empty));
            assert!(q.is_empty());
        })
    }
}
