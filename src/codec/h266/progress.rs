// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Cross-frame decoding progress.
//!
//! With frame-parallel decoding, a picture can be used as a reference while it is still being
//! reconstructed. Each picture carries a `ProgressTracker` recording, per `ProgressKind`, how many
//! rows have been completed. Threads decoding a dependent picture either poll it with `check` or
//! register a `ProgressListener` that is handed back to them once the rows they need are ready.

use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;

use enumn::N;

/// Value of a counter before anything has been reported.
pub const PROGRESS_NONE: i32 = 0;
/// Value of a counter once the picture is completely decoded.
pub const PROGRESS_DONE: i32 = i32::MAX;

pub const NUM_PROGRESS_KINDS: usize = 2;

#[derive(N, Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProgressKind {
    /// Motion vectors are final up to the reported row.
    Mv = 0,
    /// Reconstructed and filtered pixels are final up to the reported row.
    Pixel = 1,
}

impl ProgressKind {
    /// Iterates over every kind, in index order.
    pub fn all() -> impl Iterator<Item = ProgressKind> {
        (0..).map_while(ProgressKind::n)
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// A waiter registered on a `ProgressTracker`.
///
/// The tracker owns the listener while it is pending and gives it back by calling
/// `progress_done` exactly once, without holding any lock.
pub trait ProgressListener: Send {
    fn kind(&self) -> ProgressKind;

    /// The row the listener is waiting for. The listener fires once progress goes past it.
    fn threshold(&self) -> i32;

    fn progress_done(self: Box<Self>);
}

/// A `ProgressListener` running a closure as its continuation.
pub struct FnListener<F: FnOnce() + Send> {
    kind: ProgressKind,
    y: i32,
    f: F,
}

impl<F: FnOnce() + Send> FnListener<F> {
    pub fn new(kind: ProgressKind, y: i32, f: F) -> Box<Self> {
        Box::new(Self { kind, y, f })
    }
}

impl<F: FnOnce() + Send> ProgressListener for FnListener<F> {
    fn kind(&self) -> ProgressKind {
        self.kind
    }

    fn threshold(&self) -> i32 {
        self.y
    }

    fn progress_done(self: Box<Self>) {
        (self.f)()
    }
}

type PendingListeners = [Vec<Box<dyn ProgressListener>>; NUM_PROGRESS_KINDS];

pub struct ProgressTracker {
    progress: [AtomicI32; NUM_PROGRESS_KINDS],
    /// Pending listeners. The lock also serializes updates of `progress`.
    listeners: Mutex<PendingListeners>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self {
            progress: [AtomicI32::new(PROGRESS_NONE), AtomicI32::new(PROGRESS_NONE)],
            listeners: Mutex::new(Default::default()),
        }
    }
}

impl ProgressTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Default::default())
    }

    fn lock(&self) -> MutexGuard<'_, PendingListeners> {
        // Listeners never run under the lock, so a poisoned lock can only come from a failed
        // monotonicity assertion, which leaves the state untouched.
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn load(&self, kind: ProgressKind) -> i32 {
        self.progress[kind.index()].load(Ordering::Acquire)
    }

    /// Returns the last reported value for `kind`, without taking the lock.
    pub fn progress(&self, kind: ProgressKind) -> i32 {
        self.load(kind)
    }

    /// Reports that `kind` has progressed up to `y`.
    ///
    /// Panics if `y` does not exceed the previously reported value. Reporting again after the
    /// picture has been marked as done is ignored.
    pub fn report(&self, kind: ProgressKind, y: i32) {
        let ready = {
            let mut listeners = self.lock();
            let prev = self.load(kind);

            if prev == PROGRESS_DONE {
                log::debug!("{:?} progress already complete, ignoring report of {}", kind, y);
                return;
            }

            assert!(prev < y, "{:?} progress went backwards: {} -> {}", kind, prev, y);
            self.progress[kind.index()].store(y, Ordering::Release);

            let (ready, pending): (Vec<_>, Vec<_>) =
                std::mem::take(&mut listeners[kind.index()])
                    .into_iter()
                    .partition(|l| y > l.threshold());
            listeners[kind.index()] = pending;
            ready
        };

        for listener in ready {
            listener.progress_done();
        }
    }

    /// Marks every kind of progress as complete.
    pub fn report_finished(&self) {
        for kind in ProgressKind::all() {
            self.report(kind, PROGRESS_DONE);
        }
    }

    /// Whether `kind` has progressed past row `y + 1`.
    pub fn check(&self, kind: ProgressKind, y: i32) -> bool {
        let _listeners = self.lock();
        let progress = self.load(kind);

        progress == PROGRESS_DONE || i64::from(progress) > i64::from(y) + 1
    }

    /// Registers `listener`. It is fired right away if its threshold has already been reached.
    pub fn add_listener(&self, listener: Box<dyn ProgressListener>) {
        let kind = listener.kind();
        let mut listeners = self.lock();

        if self.load(kind) > listener.threshold() {
            drop(listeners);
            listener.progress_done();
        } else {
            listeners[kind.index()].push(listener);
        }
    }

    /// Blocks the calling thread until `kind` has progressed past row `y`.
    pub fn wait(&self, kind: ProgressKind, y: i32) {
        let signal = Arc::new((Mutex::new(false), Condvar::new()));
        let notifier = Arc::clone(&signal);

        self.add_listener(FnListener::new(kind, y, move || {
            let (done, cvar) = &*notifier;
            *done.lock().unwrap_or_else(|e| e.into_inner()) = true;
            cvar.notify_all();
        }));

        let (done, cvar) = &*signal;
        let mut done = done.lock().unwrap_or_else(|e| e.into_inner());
        while !*done {
            done = cvar.wait(done).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Number of listeners still waiting on `kind`.
    pub fn num_pending(&self, kind: ProgressKind) -> usize {
        self.lock()[kind.index()].len()
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("mv", &self.load(ProgressKind::Mv))
            .field("pixel", &self.load(ProgressKind::Pixel))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn counting_listener(
        kind: ProgressKind,
        y: i32,
        count: &Arc<AtomicUsize>,
    ) -> Box<dyn ProgressListener> {
        let count = Arc::clone(count);
        FnListener::new(kind, y, move || {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn all_kinds_are_listed() {
        let kinds = ProgressKind::all().collect::<Vec<_>>();
        assert_eq!(kinds, vec![ProgressKind::Mv, ProgressKind::Pixel]);
        assert_eq!(kinds.len(), NUM_PROGRESS_KINDS);
    }

    #[test]
    fn check_follows_reports() {
        let tracker = ProgressTracker::new();

        assert!(!tracker.check(ProgressKind::Pixel, 0));
        tracker.report(ProgressKind::Pixel, 8);
        assert!(tracker.check(ProgressKind::Pixel, 6));
        assert!(!tracker.check(ProgressKind::Pixel, 7));
        // Other kinds are independent.
        assert!(!tracker.check(ProgressKind::Mv, 0));
    }

    #[test]
    #[should_panic]
    fn regression_panics() {
        let tracker = ProgressTracker::new();
        tracker.report(ProgressKind::Mv, 10);
        tracker.report(ProgressKind::Mv, 5);
    }

    #[test]
    #[should_panic]
    fn same_value_twice_panics() {
        let tracker = ProgressTracker::new();
        tracker.report(ProgressKind::Mv, 10);
        tracker.report(ProgressKind::Mv, 10);
    }

    #[test]
    fn finished_twice_is_tolerated() {
        let tracker = ProgressTracker::new();
        tracker.report_finished();
        tracker.report_finished();
        tracker.report(ProgressKind::Mv, 3);

        assert_eq!(tracker.progress(ProgressKind::Mv), PROGRESS_DONE);
        assert!(tracker.check(ProgressKind::Mv, i32::MAX));
        assert!(tracker.check(ProgressKind::Pixel, i32::MAX - 1));
    }

    #[test]
    fn listener_fires_once_when_satisfied() {
        let tracker = ProgressTracker::new();
        let count = Arc::new(AtomicUsize::new(0));

        tracker.add_listener(counting_listener(ProgressKind::Pixel, 4, &count));
        assert_eq!(tracker.num_pending(ProgressKind::Pixel), 1);

        tracker.report(ProgressKind::Pixel, 4);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tracker.report(ProgressKind::Pixel, 5);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.num_pending(ProgressKind::Pixel), 0);

        tracker.report(ProgressKind::Pixel, PROGRESS_DONE);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_fires_immediately_when_done() {
        let tracker = ProgressTracker::new();
        let count = Arc::new(AtomicUsize::new(0));

        tracker.report_finished();
        for kind in ProgressKind::all() {
            tracker.add_listener(counting_listener(kind, 1 << 20, &count));
        }

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.num_pending(ProgressKind::Mv), 0);
    }

    #[test]
    fn only_satisfied_listeners_are_detached() {
        let tracker = ProgressTracker::new();
        let count = Arc::new(AtomicUsize::new(0));

        for y in [2, 10, 3, 20] {
            tracker.add_listener(counting_listener(ProgressKind::Mv, y, &count));
        }
        tracker.report(ProgressKind::Mv, 5);

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.num_pending(ProgressKind::Mv), 2);
    }

    #[test]
    fn continuation_can_reenter_tracker() {
        let tracker = ProgressTracker::new();
        let inner = Arc::clone(&tracker);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_inner = Arc::clone(&seen);

        tracker.add_listener(FnListener::new(ProgressKind::Mv, 0, move || {
            // Would deadlock if run under the tracker lock.
            if inner.check(ProgressKind::Mv, -1) {
                seen_inner.fetch_add(1, Ordering::SeqCst);
            }
            inner.report(ProgressKind::Pixel, 1);
        }));
        tracker.report(ProgressKind::Mv, 1);

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.progress(ProgressKind::Pixel), 1);
    }

    #[test]
    fn wait_blocks_until_reported() {
        let tracker = ProgressTracker::new();
        let producer = Arc::clone(&tracker);

        let handle = thread::spawn(move || {
            for row in 1..=16 {
                producer.report(ProgressKind::Pixel, row);
            }
        });

        tracker.wait(ProgressKind::Pixel, 12);
        assert!(tracker.progress(ProgressKind::Pixel) > 12);
        handle.join().unwrap();
    }
}
