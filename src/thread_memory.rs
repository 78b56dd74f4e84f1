//! Tracking of per-thread heap allocations, so the main thread can
//! reclaim them after their owning threads exit. The registry is a
//! lock-free intrusive stack: nodes are prepended with a CAS on the head
//! and never recycled while another thread could still observe them.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

/// Which tracked allocations [`reap`] may reclaim.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reap {
    /// Only allocations whose owning thread has terminated.
    Unused,
    /// Dead threads' allocations plus the calling thread's own.
    All,
}

struct Tracker {
    memory: *mut (),
    free: unsafe fn(*mut ()),
    next: *mut Tracker,
    tid: ThreadId,
    /// Upgrading fails once the owning thread has exited; that is the
    /// liveness probe.
    alive: Weak<()>,
}

unsafe impl Send for Tracker {}

static TRACKERS: AtomicPtr<Tracker> = AtomicPtr::new(ptr::null_mut());

thread_local! {
    /// Per-thread liveness token, created lazily on the thread's first
    /// tracked allocation and dropped by the runtime when it exits.
    static LIVENESS: Arc<()> = Arc::new(());
}

unsafe fn drop_boxed<T>(memory: *mut ()) {
    drop(unsafe { Box::from_raw(memory.cast::<T>()) });
}

/// Allocate `value` on the heap under the tracker registry, so the main
/// thread can reclaim it with [`reap`] once this thread has exited.
///
/// The pointer stays valid until a `reap` call is entitled to free it:
/// after the owning thread's death, or after the owning thread itself
/// calls `reap(Reap::All)`.
pub fn track<T: Send + 'static>(value: T) -> NonNull<T> {
    let memory = Box::into_raw(Box::new(value));
    let tracker = Box::into_raw(Box::new(Tracker {
        memory: memory.cast(),
        free: drop_boxed::<T>,
        next: ptr::null_mut(),
        tid: thread::current().id(),
        alive: LIVENESS.with(Arc::downgrade),
    }));

    let mut head = TRACKERS.load(Ordering::Relaxed);

    loop {
        // Safety: the node is not yet published; this thread owns it.
        unsafe { (*tracker).next = head };

        match TRACKERS.compare_exchange_weak(head, tracker, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => break,
            Err(observed) => head = observed,
        }
    }

    log::trace!(
        "tracking {} bytes for thread {:?}",
        std::mem::size_of::<T>(),
        thread::current().id()
    );
    NonNull::new(memory).unwrap()
}

/// Free tracked allocations whose owning threads are dead (and, with
/// [`Reap::All`], the calling thread's own), returning the number of
/// allocations kept.
///
/// Intended to be called from the main or another reclaiming thread.
pub fn reap(what: Reap) -> usize {
    // Detach the whole list in one atomic step; after this, no other
    // thread can reach the detached nodes.
    let mut node = TRACKERS.swap(ptr::null_mut(), Ordering::AcqRel);
    let me = thread::current().id();
    let mut keepers: *mut Tracker = ptr::null_mut();
    let mut last: *mut Tracker = ptr::null_mut();
    let mut unfreed = 0usize;

    while !node.is_null() {
        // Safety: nodes in the detached list are exclusively ours.
        let tracker = unsafe { &mut *node };
        let next = tracker.next;

        let reclaim = if tracker.tid == me {
            what == Reap::All
        } else {
            tracker.alive.upgrade().is_none()
        };

        if reclaim {
            log::trace!("reaping memory of thread {:?}", tracker.tid);
            // Safety: the free function was built for this allocation.
            unsafe { (tracker.free)(tracker.memory) };
            drop(unsafe { Box::from_raw(node) });
        } else {
            tracker.next = keepers;

            if last.is_null() {
                last = node;
            }

            keepers = node;
            unfreed += 1;
        }

        node = next;
    }

    if !keepers.is_null() {
        // Re-prepend the survivors, retrying if the head moved.
        let mut head = TRACKERS.load(Ordering::Relaxed);

        loop {
            // Safety: keepers are still exclusively ours until the CAS
            // publishes them.
            unsafe { (*last).next = head };

            match TRACKERS.compare_exchange_weak(head, keepers, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }
    }

    unfreed
}
