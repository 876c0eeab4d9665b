//! Bounded-concurrency fan-out of a finite item list.
//!
//! One feeder (the calling thread) hands items over a rendezvous channel to
//! `concurrency` scoped workers. Every item is applied exactly once, no more
//! than `concurrency` applications overlap, and `distribute` returns only
//! after the last application has finished.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc;
use std::sync::{Mutex, PoisonError};
use std::thread;

use tracing::{debug, error};

/// Apply `apply` to every item with at most `concurrency` concurrent calls.
///
/// A `concurrency` of zero is treated as one. A panicking application is
/// logged and does not stop the remaining items. Returns the number of items
/// handed out.
pub fn distribute<I, T, F>(items: I, concurrency: usize, apply: F) -> usize
where
    I: IntoIterator<Item = T>,
    T: Send,
    F: Fn(T) + Sync,
{
    let workers = concurrency.max(1);
    let (tx, rx) = mpsc::sync_channel::<T>(0);
    let rx = Mutex::new(rx);
    let apply = &apply;
    let rx = &rx;

    thread::scope(|scope| {
        for worker in 0..workers {
            scope.spawn(move || {
                loop {
                    // The lock is held only while waiting for the next item.
                    let next = rx.lock().unwrap_or_else(PoisonError::into_inner).recv();
                    let Ok(item) = next else {
                        break;
                    };
                    if catch_unwind(AssertUnwindSafe(|| apply(item))).is_err() {
                        error!(worker, "fan-out item panicked");
                    }
                }
            });
        }

        let mut fed = 0usize;
        for item in items {
            if tx.send(item).is_err() {
                break;
            }
            fed += 1;
        }
        drop(tx);
        debug!(items = fed, workers, "fan-out fed");
        fed
    })
}
