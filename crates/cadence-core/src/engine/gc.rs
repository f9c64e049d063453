//! Deferred reclamation of published snapshots
//!
//! Snapshots reach the render thread as `basedrop::Shared<T>` values. When
//! the render thread drops the last reference to a replaced snapshot, the
//! drop only enqueues a pointer; the collector thread started here frees the
//! memory later, where deallocation cannot cost a deadline.
//!
//! ```ignore
//! use basedrop::Shared;
//! use crate::engine::gc::gc_handle;
//!
//! let snapshot = Shared::new(&gc_handle(), Snapshot::empty(0));
//! drop(snapshot); // queued for the collector, not freed here
//! ```

use basedrop::{Collector, Handle};
use std::sync::mpsc;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

/// Interval between collection passes
const COLLECT_INTERVAL: Duration = Duration::from_millis(50);

/// Process-wide handle for creating `Shared<T>` allocations
///
/// The `Collector` itself lives on the dedicated collector thread.
static GC_HANDLE: OnceLock<Handle> = OnceLock::new();

fn init_gc() -> Handle {
    let (tx, rx) = mpsc::channel();

    thread::Builder::new()
        .name("snapshot-gc".to_string())
        .spawn(move || {
            // Collector is !Sync, so it is created on the thread that runs it
            let mut collector = Collector::new();
            tx.send(collector.handle()).expect("Failed to send GC handle");

            log::info!("Snapshot collector thread started");

            loop {
                collector.collect();
                thread::sleep(COLLECT_INTERVAL);
            }
        })
        .expect("Failed to spawn snapshot collector thread");

    rx.recv().expect("Failed to receive GC handle")
}

/// Handle for wrapping values in `Shared<T>`
///
/// Starts the collector thread on first use.
pub fn gc_handle() -> Handle {
    GC_HANDLE.get_or_init(init_gc).clone()
}
