//! Passive dependency discovery for derivations.
//!
//! While a derivation runs, every observer it reads is recorded into the
//! innermost open frame. Frames form a stack so derivations can nest (a
//! computed reading another computed that has to recompute), and each frame
//! is bound to the thread that opened it: a read on some other thread is
//! never attributed to a derivation it did not happen in.

use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::arena::ObserverId;
use crate::hash::{FastIndexSet, new_index_set};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FrameMode {
    Track,
    Suppress,
}

#[derive(Debug)]
struct Frame {
    thread: ThreadId,
    mode: FrameMode,
    observers: FastIndexSet<ObserverId>,
}

/// Per-runtime stack of tracking frames.
#[derive(Debug, Default)]
pub struct ComputedTracker {
    frames: Vec<Frame>,
}

impl ComputedTracker {
    /// Tracker with no open frames.
    pub const fn new() -> Self {
        Self { frames: Vec::new() }
    }

    fn push(&mut self, mode: FrameMode) {
        self.frames.push(Frame {
            thread: thread::current().id(),
            mode,
            observers: new_index_set(),
        });
    }

    fn innermost(&self) -> Option<usize> {
        let current = thread::current().id();
        self.frames.iter().rposition(|frame| frame.thread == current)
    }

    /// Open a tracking frame on the current thread.
    pub fn track(&mut self) {
        self.push(FrameMode::Track);
    }

    /// Open a frame that swallows reads, hiding them from enclosing frames.
    pub fn suppress(&mut self) {
        self.push(FrameMode::Suppress);
    }

    /// Whether a read on the current thread would be recorded.
    pub fn is_tracking(&self) -> bool {
        self.innermost()
            .is_some_and(|index| self.frames[index].mode == FrameMode::Track)
    }

    /// Record a read. Duplicates keep their first position.
    pub fn record(&mut self, id: ObserverId) -> bool {
        match self.innermost() {
            Some(index) if self.frames[index].mode == FrameMode::Track => {
                self.frames[index].observers.insert(id)
            }
            _ => false,
        }
    }

    /// Close the current thread's innermost frame and return what it recorded.
    ///
    /// A suppressing frame, or no frame at all, yields nothing.
    pub fn get_tracked_observers(&mut self) -> Vec<ObserverId> {
        let Some(index) = self.innermost() else {
            return Vec::new();
        };
        let frame = self.frames.remove(index);
        match frame.mode {
            FrameMode::Track => frame.observers.into_iter().collect(),
            FrameMode::Suppress => Vec::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn depth(&self) -> usize {
        self.frames.len()
    }
}

/// RAII guard that closes a frame even if the derivation panics.
pub(crate) struct FrameGuard<'a> {
    tracker: &'a Mutex<ComputedTracker>,
    open: bool,
}

impl<'a> FrameGuard<'a> {
    pub(crate) fn track(tracker: &'a Mutex<ComputedTracker>) -> Self {
        tracker.lock().track();
        Self {
            tracker,
            open: true,
        }
    }

    pub(crate) fn suppress(tracker: &'a Mutex<ComputedTracker>) -> Self {
        tracker.lock().suppress();
        Self {
            tracker,
            open: true,
        }
    }

    pub(crate) fn finish(mut self) -> Vec<ObserverId> {
        self.open = false;
        self.tracker.lock().get_tracked_observers()
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        if self.open {
            self.tracker.lock().get_tracked_observers();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;

    fn ids(n: usize) -> Vec<ObserverId> {
        let mut arena = Arena::new();
        (0..n).map(|_| ObserverId(arena.insert(()))).collect()
    }

    #[test]
    fn records_nothing_when_idle() {
        let [a] = ids(1)[..] else { unreachable!() };
        let mut tracker = ComputedTracker::new();
        assert!(!tracker.is_tracking());
        assert!(!tracker.record(a));
        assert!(tracker.get_tracked_observers().is_empty());
    }

    #[test]
    fn deduplicates_in_first_read_order() {
        let [a, b] = ids(2)[..] else { unreachable!() };
        let mut tracker = ComputedTracker::new();
        tracker.track();
        tracker.record(b);
        tracker.record(a);
        tracker.record(b);
        assert_eq!(tracker.get_tracked_observers(), vec![b, a]);
        assert!(!tracker.is_tracking());
    }

    #[test]
    fn nested_frames_are_isolated() {
        let [a, b, c] = ids(3)[..] else { unreachable!() };
        let mut tracker = ComputedTracker::new();
        tracker.track();
        tracker.record(a);

        tracker.track();
        tracker.record(b);
        assert_eq!(tracker.get_tracked_observers(), vec![b]);

        tracker.suppress();
        tracker.record(c);
        assert!(tracker.get_tracked_observers().is_empty());

        assert_eq!(tracker.get_tracked_observers(), vec![a]);
        assert_eq!(tracker.depth(), 0);
    }

    #[test]
    fn reads_on_other_threads_are_not_attributed() {
        let [a, b] = ids(2)[..] else { unreachable!() };
        let tracker = Mutex::new(ComputedTracker::new());
        let guard = FrameGuard::track(&tracker);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                assert!(!tracker.lock().is_tracking());
                assert!(!tracker.lock().record(b));
            });
        });
        tracker.lock().record(a);

        assert_eq!(guard.finish(), vec![a]);
    }

    #[test]
    fn guard_closes_frame_on_panic() {
        let tracker = Mutex::new(ComputedTracker::new());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = FrameGuard::track(&tracker);
            panic!("derivation failed");
        }));
        assert!(result.is_err());
        assert_eq!(tracker.lock().depth(), 0);
    }
}
