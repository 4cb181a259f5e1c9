use core::{fmt, ops::Deref};

#[cfg(any(test, feature = "tracing", loom))]
macro_rules! trace {
    ($($t:tt)*) => { tracing::trace!($($t)*) }
}

#[cfg(not(any(test, feature = "tracing", loom)))]
macro_rules! trace {
    ($($t:tt)*) => {};
}

#[cfg(any(test, feature = "tracing", loom))]
macro_rules! debug {
    ($($t:tt)*) => { tracing::debug!($($t)*) }
}

#[cfg(not(any(test, feature = "tracing", loom)))]
macro_rules! debug {
    ($($t:tt)*) => {};
}

macro_rules! test_trace {
    ($($tt:tt)*) => {
        #[cfg(test)]
        tracing::trace!($($tt)*)
    }
}

/// An exponential backoff for spin loops
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    exp: u8,
    max: u8,
}

pub(crate) use cache_pad::CachePadded;

/// When configured not to pad to cache alignment, just provide a no-op wrapper struct
/// This feature is useful for platforms with no data cache, such as many Cortex-M
/// targets.
#[cfg(feature = "no-cache-pad")]
mod cache_pad {
    pub(crate) struct CachePadded<T>(pub(crate) T);
}

/// When not inhibited, determine cache alignment based on target architecture.
/// Align to 128 bytes on 64-bit x86/ARM targets, otherwise align to 64 bytes.
#[cfg(not(feature = "no-cache-pad"))]
mod cache_pad {
    #[cfg_attr(any(target_arch = "x86_64", target_arch = "aarch64"), repr(align(128)))]
    #[cfg_attr(
        not(any(target_arch = "x86_64", target_arch = "aarch64")),
        repr(align(64))
    )]
    pub(crate) struct CachePadded<T>(pub(crate) T);
}

/// Packs an address and 64 bits of metadata into a single word, so that both
/// can be compared and swapped together.
///
/// The address occupies the low half of the word and the metadata the high
/// half.
#[inline(always)]
pub(crate) const fn pack(addr: usize, meta: u64) -> u128 {
    (addr as u64 as u128) | ((meta as u128) << 64)
}

/// Splits a word produced by [`pack`] back into its address and metadata.
#[inline(always)]
pub(crate) const fn unpack(word: u128) -> (usize, u64) {
    (word as u64 as usize, (word >> 64) as u64)
}

// === impl Backoff ===

impl Backoff {
    pub(crate) const DEFAULT_MAX_EXPONENT: u8 = 8;

    pub(crate) const fn new() -> Self {
        Self {
            exp: 0,
            max: Self::DEFAULT_MAX_EXPONENT,
        }
    }

    /// Perform one spin, squaring the backoff
    #[inline(always)]
    pub(crate) fn spin(&mut self) {
        // Issue 2^exp pause instructions.
        #[cfg_attr(loom, allow(unused_variables))]
        let spins = 1 << self.exp;

        #[cfg(not(loom))]
        for _ in 0..spins {
            crate::loom::hint::spin_loop();
        }

        // Loom cannot make progress inside a busy loop; hand control to
        // another modeled thread instead.
        #[cfg(loom)]
        crate::loom::thread::yield_now();

        if self.exp < self.max {
            self.exp += 1
        }
    }
}

// === impl CachePadded ===

impl<T> Deref for CachePadded<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: fmt::Debug> fmt::Debug for CachePadded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
pub(crate) fn assert_send_sync<T: Send + Sync>() {}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn pack_keeps_halves_apart() {
        let word = pack(usize::MAX, 0);
        assert_eq!(unpack(word), (usize::MAX, 0));

        let word = pack(0, u64::MAX);
        assert_eq!(unpack(word), (0, u64::MAX));
    }

    #[test]
    fn backoff_saturates() {
        let mut boff = Backoff::new();
        for _ in 0..(Backoff::DEFAULT_MAX_EXPONENT as usize + 4) {
            boff.spin();
        }
        assert_eq!(boff.exp, Backoff::DEFAULT_MAX_EXPONENT);
    }
}
