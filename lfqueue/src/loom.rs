pub(crate) use self::inner::*;

#[cfg(loom)]
mod inner {
    #[allow(unused_imports)]
    pub(crate) mod atomic {
        pub use core::sync::atomic::Ordering;
        pub use loom::sync::atomic::*;

        pub(crate) use super::wide::AtomicU128;
    }

    #[allow(unused_imports)]
    pub(crate) use loom::{hint, model, sync, thread};

    /// Loom has no 128-bit atomics, so a double-width word is modeled as a
    /// value behind a loom mutex. Every access is still a single, indivisible
    /// step from the point of view of the modeled threads, and each one is a
    /// point at which loom may preempt.
    mod wide {
        use super::atomic::Ordering;
        use loom::sync::Mutex;

        #[derive(Debug)]
        pub(crate) struct AtomicU128(Mutex<u128>);

        impl AtomicU128 {
            #[track_caller]
            pub(crate) fn new(value: u128) -> Self {
                Self(Mutex::new(value))
            }

            #[track_caller]
            pub(crate) fn load(&self, _: Ordering) -> u128 {
                *self.0.lock().expect("loom mutex will never poison")
            }

            #[track_caller]
            pub(crate) fn compare_exchange(
                &self,
                current: u128,
                new: u128,
                _: Ordering,
                _: Ordering,
            ) -> Result<u128, u128> {
                let mut word = self.0.lock().expect("loom mutex will never poison");
                if *word == current {
                    *word = new;
                    Ok(current)
                } else {
                    Err(*word)
                }
            }
        }
    }

    pub(crate) mod alloc {
        pub(crate) use loom::alloc::Track;
    }
}

#[cfg(not(loom))]
mod inner {
    pub(crate) mod atomic {
        pub use core::sync::atomic::{AtomicUsize, Ordering};
        pub use portable_atomic::AtomicU128;
    }

    #[cfg(test)]
    pub(crate) mod thread {
        pub(crate) use std::thread::{yield_now, JoinHandle};

        /// Spawns a thread that reports its allocations to the spawning
        /// thread's leak tracker.
        pub(crate) fn spawn<F, T>(f: F) -> JoinHandle<T>
        where
            F: FnOnce() -> T + Send + 'static,
            T: Send + 'static,
        {
            let track = super::alloc::track::Registry::current();
            std::thread::spawn(move || {
                let _tracking = track.map(|track| track.set_default());
                f()
            })
        }
    }

    pub(crate) mod hint {
        pub(crate) use core::hint::spin_loop;
    }


    #[cfg(test)]
    pub(crate) fn model(f: impl FnOnce()) {
        let collector = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .without_time()
            .with_thread_ids(true)
            .with_thread_names(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(collector);
        model::Builder::new().check(f)
    }

    pub(crate) mod alloc {
        #[cfg(test)]
        use std::sync::Arc;

        #[cfg(test)]
        pub(in crate::loom) mod track {
            use std::{
                cell::RefCell,
                sync::{
                    atomic::{AtomicBool, Ordering},
                    Arc, Mutex, Weak,
                },
            };

            #[derive(Clone, Debug, Default)]
            pub(crate) struct Registry(Arc<Mutex<RegistryInner>>);

            #[derive(Debug, Default)]
            struct RegistryInner {
                tracks: Vec<Weak<TrackData>>,
                next_id: usize,
            }

            #[derive(Debug)]
            pub(super) struct TrackData {
                was_leaked: AtomicBool,
                type_name: &'static str,
                location: &'static core::panic::Location<'static>,
                id: usize,
            }

            thread_local! {
                static REGISTRY: RefCell<Option<Registry>> = const { RefCell::new(None) };
            }

            impl Registry {
                pub(in crate::loom) fn current() -> Option<Registry> {
                    REGISTRY.with(|current| current.borrow().clone())
                }

                pub(in crate::loom) fn set_default(&self) -> impl Drop {
                    struct Unset(Option<Registry>);
                    impl Drop for Unset {
                        fn drop(&mut self) {
                            let _ =
                                REGISTRY.try_with(|current| *current.borrow_mut() = self.0.take());
                        }
                    }

                    REGISTRY.with(|current| {
                        let mut current = current.borrow_mut();
                        let unset = Unset(current.clone());
                        *current = Some(self.clone());
                        unset
                    })
                }

                #[track_caller]
                pub(super) fn start_tracking<T>() -> Option<Arc<TrackData>> {
                    // not `Option::map`: the closure would become the caller
                    // seen by `#[track_caller]`.
                    #[allow(clippy::manual_map)]
                    match Self::current() {
                        Some(registry) => Some(registry.insert::<T>()),
                        _ => None,
                    }
                }

                #[track_caller]
                pub(super) fn insert<T>(&self) -> Arc<TrackData> {
                    let mut inner = self.0.lock().unwrap();
                    let id = inner.next_id;
                    inner.next_id += 1;
                    let location = core::panic::Location::caller();
                    let type_name = std::any::type_name::<T>();
                    let data = Arc::new(TrackData {
                        type_name,
                        location,
                        id,
                        was_leaked: AtomicBool::new(false),
                    });
                    let weak = Arc::downgrade(&data);
                    test_trace!(
                        target: "lfqueue::alloc",
                        id,
                        "type" = %type_name,
                        %location,
                        "started tracking allocation",
                    );
                    inner.tracks.push(weak);
                    data
                }

                pub(in crate::loom) fn check(&self) {
                    let leaked = self
                        .0
                        .lock()
                        .unwrap()
                        .tracks
                        .iter()
                        .filter_map(|weak| {
                            let data = weak.upgrade()?;
                            data.was_leaked.store(true, Ordering::SeqCst);
                            Some(format!(
                                " - id {}, {} allocated at {}",
                                data.id, data.type_name, data.location
                            ))
                        })
                        .collect::<Vec<_>>();
                    if !leaked.is_empty() {
                        let leaked = leaked.join("\n  ");
                        panic!("the following allocations were leaked:\n  {leaked}");
                    }
                }
            }

            impl Drop for TrackData {
                fn drop(&mut self) {
                    if !self.was_leaked.load(Ordering::SeqCst) {
                        test_trace!(
                            target: "lfqueue::alloc",
                            id = self.id,
                            "type" = %self.type_name,
                            location = %self.location,
                            "released a tracked allocation",
                        );
                    }
                }
            }
        }

        /// Track allocations, detecting leaks
        #[derive(Debug)]
        pub struct Track<T> {
            _value: T,

            #[cfg(test)]
            _track: Option<Arc<track::TrackData>>,
        }

        impl<T> Track<T> {
            /// Track a value for leaks
            #[inline(always)]
            #[track_caller]
            pub fn new(value: T) -> Track<T> {
                Track {
                    _value: value,

                    #[cfg(test)]
                    _track: track::Registry::start_tracking::<T>(),
                }
            }
        }
    }
}
