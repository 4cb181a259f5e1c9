/// Errors returned by [`Queue`](crate::Queue) operations.
///
/// Contention between threads is never reported: failed compare-and-swaps
/// are retried inside the operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    /// The queue cannot be used as configured.
    ///
    /// This is returned by [`Queue::try_new`](crate::Queue::try_new) when the
    /// record capacity is zero.
    #[error("invalid argument: a queue's record capacity must be non-zero")]
    InvalidArgument,

    /// A record, or the buffer a record would be dequeued into, is longer than
    /// the queue's record capacity.
    #[error("record length {len} exceeds the queue's record capacity of {capacity} bytes")]
    RecordTooLarge {
        /// The length that was requested.
        len: usize,
        /// The queue's record capacity.
        capacity: usize,
    },

    /// Storage for a node could not be allocated.
    #[error("failed to allocate a queue node")]
    AllocationFailed,

    /// The queue holds no records.
    #[error("queue is empty")]
    Empty,
}
