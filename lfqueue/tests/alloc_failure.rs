#![cfg(not(loom))]
//! Heap exhaustion while allocating a node is reported, not fatal.
//!
//! This test binary installs a global allocator that refuses large
//! allocations on threads that ask it to. Queues here use a record capacity
//! large enough that only their nodes cross that threshold, so the
//! reclaimer's own bookkeeping keeps working while nodes cannot be
//! allocated.
use lfqueue::{Error, Queue};
use std::{
    alloc::{GlobalAlloc, Layout, System},
    cell::Cell,
    ptr,
};

mod util;

const CAP: usize = 8192;

struct RefuseLarge;

#[global_allocator]
static ALLOC: RefuseLarge = RefuseLarge;

thread_local! {
    static REFUSING: Cell<bool> = const { Cell::new(false) };
}

unsafe impl GlobalAlloc for RefuseLarge {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let refusing = REFUSING.try_with(Cell::get).unwrap_or(false);
        if refusing && layout.size() >= CAP {
            return ptr::null_mut();
        }
        System.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout)
    }
}

/// Refuses node allocations on this thread until dropped.
struct Refusing;

impl Refusing {
    fn start() -> Self {
        REFUSING.with(|refusing| refusing.set(true));
        Self
    }
}

impl Drop for Refusing {
    fn drop(&mut self) {
        REFUSING.with(|refusing| refusing.set(false));
    }
}

#[test]
fn try_new_reports_allocation_failure() {
    util::trace_init();
    let result = {
        let _refusing = Refusing::start();
        Queue::<CAP>::try_new()
    };
    assert_eq!(result.err(), Some(Error::AllocationFailed));

    // Nothing was left in a bad state.
    let q = Queue::<CAP>::try_new().unwrap();
    assert!(q.is_empty());
}

#[test]
fn enqueue_reports_allocation_failure() {
    util::trace_init();
    let q = Queue::<CAP>::new();
    q.enqueue(b"first").unwrap();

    {
        let _refusing = Refusing::start();
        assert_eq!(q.enqueue(b"second"), Err(Error::AllocationFailed));
        assert_eq!(q.len(), 1, "a failed enqueue is not counted");
    }

    q.enqueue(b"third").unwrap();
    assert_eq!(q.len(), 2);

    let mut buf = [0u8; 16];
    let n = q.dequeue(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"first");
    let n = q.dequeue(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"third");
    assert_eq!(q.dequeue(&mut buf), Err(Error::Empty));
}

#[test]
fn dequeue_needing_placeholder_reports_allocation_failure() {
    util::trace_init();
    let q = Queue::<CAP>::new();
    // The only record sits at the head with no successor, so taking it
    // requires a placeholder node.
    q.enqueue(b"last").unwrap();

    let mut buf = [0u8; 16];
    {
        let _refusing = Refusing::start();
        assert_eq!(q.dequeue(&mut buf), Err(Error::AllocationFailed));
        assert_eq!(buf, [0u8; 16], "nothing is written on failure");
        assert_eq!(q.len(), 1);
        assert!(!q.is_empty());
    }

    let n = q.dequeue(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"last");
    assert!(q.is_empty());

    // The queue keeps working afterwards.
    q.enqueue(b"again").unwrap();
    let n = q.dequeue(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"again");
    assert_eq!(q.dequeue(&mut buf), Err(Error::Empty));
}

#[test]
fn handle_survives_allocation_failure() {
    util::trace_init();
    let q = Queue::<CAP>::new();
    let handle = q.handle();

    {
        let _refusing = Refusing::start();
        assert_eq!(handle.enqueue(b"lost"), Err(Error::AllocationFailed));
        assert_eq!(handle.dequeue(&mut [0u8; 16]), Err(Error::Empty));
    }

    handle.enqueue(b"kept").unwrap();
    let mut buf = [0u8; 16];
    let n = handle.dequeue(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"kept");
}
