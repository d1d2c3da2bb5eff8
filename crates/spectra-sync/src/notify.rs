//! Frame publish/wait channel
//!
//! The notify cell is a single `AtomicU32` holding the sequence number of the last
//! published frame. Publishing stores the new sequence with `Release` ordering and then
//! wakes every waiter; waiters load it with `Acquire`, so the buffer write that preceded
//! a publish is visible to anyone who observes its sequence.
//!
//! Two wait implementations sit behind the same channel:
//!
//! ```text
//! Async path:    Notify::notified() ──enable──▶ re-check cell ──▶ await (≤ driver timeout)
//! Poll fallback: park_timeout(cell address, ≤ poll interval) ──▶ caller yields one tick
//! ```
//!
//! `publish` wakes both kinds of waiter, so producers don't need to know which path
//! their consumers selected.

use std::panic::catch_unwind;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::sync::Notify;

use crate::config::WaitMode;
use crate::frame::SharedFrame;

/// Advance a frame sequence number, wrapping at `wrap`
#[inline]
pub fn next_sequence(current: u32, wrap: u32) -> u32 {
    (current + 1) % wrap
}

/// Sequence counter and wake signal stored inside [`SharedFrame`]
pub(crate) struct NotifyCell {
    sequence: AtomicU32,
    /// Async waiters; blocked threads park on the address of `sequence` instead
    waiters: Notify,
}

impl NotifyCell {
    pub(crate) fn new() -> Self {
        Self {
            sequence: AtomicU32::new(0),
            waiters: Notify::new(),
        }
    }

    #[inline]
    pub(crate) fn load(&self) -> u32 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Parking key for the poll fallback
    #[inline]
    fn key(&self) -> usize {
        &self.sequence as *const AtomicU32 as usize
    }

    /// The current sequence if it differs from `last_seen`
    ///
    /// `None` as `last_seen` never matches, so a consumer's first wait always reports
    /// the frame currently in the buffer.
    #[inline]
    fn changed_since(&self, last_seen: Option<u32>) -> Option<u32> {
        let current = self.load();
        match last_seen {
            Some(seen) if seen == current => None,
            _ => Some(current),
        }
    }
}

/// Result of one bounded wait step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The cell now holds a sequence different from the one the caller had seen
    Changed(u32),
    /// The bound elapsed with no new publish. Never new data.
    TimedOut,
}

/// Which wait primitive consumers use
///
/// Chosen once per hub by [`WaitPath::detect`].
#[derive(Debug, Clone)]
pub enum WaitPath {
    /// Suspend tasks on a tokio runtime; no worker thread is held while waiting
    Async(Handle),
    /// Dedicated thread per consumer doing short bounded blocks
    PollFallback,
}

impl WaitPath {
    /// Choose the wait primitive for this session
    ///
    /// The async path needs a tokio runtime reachable from the calling thread, with its
    /// time driver enabled. The result is logged here, once; call sites never re-check.
    pub fn detect(mode: WaitMode) -> Self {
        if mode == WaitMode::ForcePoll {
            log::info!("[Notify] Poll fallback forced by configuration");
            return WaitPath::PollFallback;
        }

        match async_capable_handle() {
            Ok(handle) => {
                log::info!("[Notify] Async wait available, consumers will run as tasks");
                WaitPath::Async(handle)
            }
            Err(reason) if mode == WaitMode::ForceAsync => {
                log::warn!(
                    "[Notify] Async wait requested but {}, using poll fallback",
                    reason
                );
                WaitPath::PollFallback
            }
            Err(reason) => {
                log::info!(
                    "[Notify] {}, falling back to bounded-block polling",
                    reason
                );
                WaitPath::PollFallback
            }
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self, WaitPath::Async(_))
    }
}

/// Runtime handle usable for `wait_async`, or why there is none
fn async_capable_handle() -> Result<Handle, &'static str> {
    let handle = Handle::try_current().map_err(|_| "no async runtime available")?;

    // A runtime built without `enable_time()` panics when a timer is created
    let _guard = handle.enter();
    catch_unwind(|| drop(tokio::time::sleep(Duration::ZERO)))
        .map_err(|_| "async runtime has no time driver")?;

    Ok(handle)
}

/// Publish/wait view over a [`SharedFrame`]'s notify cell
///
/// Cheap to clone; every clone refers to the same cell.
#[derive(Clone)]
pub struct NotifyChannel {
    frame: Arc<SharedFrame>,
}

impl NotifyChannel {
    pub fn new(frame: Arc<SharedFrame>) -> Self {
        Self { frame }
    }

    #[inline]
    fn cell(&self) -> &NotifyCell {
        self.frame.notify_cell()
    }

    /// Sequence number of the last published frame
    #[inline]
    pub fn current(&self) -> u32 {
        self.cell().load()
    }

    /// Store `sequence` and wake every waiter
    ///
    /// Producer only, and only after the frame write for `sequence` has completed.
    pub fn publish(&self, sequence: u32) {
        let cell = self.cell();
        cell.sequence.store(sequence, Ordering::Release);

        // SAFETY: the key is the address of a live atomic owned by the shared frame,
        // which outlives every parked thread (they hold an Arc to it).
        unsafe {
            parking_lot_core::unpark_all(cell.key(), parking_lot_core::DEFAULT_UNPARK_TOKEN);
        }
        cell.waiters.notify_waiters();
    }

    /// Poll fallback step: block this thread until the cell differs from `last_seen` or
    /// `timeout` elapses
    pub fn wait_blocking(&self, last_seen: Option<u32>, timeout: Duration) -> WaitOutcome {
        let cell = self.cell();
        let seen = match last_seen {
            Some(seen) if seen == cell.load() => seen,
            _ => return WaitOutcome::Changed(cell.load()),
        };

        let deadline = Instant::now() + timeout;
        // SAFETY: the validate and timeout callbacks neither panic nor call back into
        // parking_lot_core, and the key stays valid for the duration of the park.
        unsafe {
            parking_lot_core::park(
                cell.key(),
                || cell.load() == seen,
                || {},
                |_, _| {},
                parking_lot_core::DEFAULT_PARK_TOKEN,
                Some(deadline),
            );
        }

        match cell.changed_since(last_seen) {
            Some(sequence) => WaitOutcome::Changed(sequence),
            None => WaitOutcome::TimedOut,
        }
    }

    /// Async step: suspend the calling task until the cell differs from `last_seen` or
    /// `timeout` elapses
    ///
    /// Must run on a runtime with the time driver enabled.
    pub async fn wait_async(&self, last_seen: Option<u32>, timeout: Duration) -> WaitOutcome {
        let cell = self.cell();
        let mut notified = std::pin::pin!(cell.waiters.notified());
        // Register interest first so a publish between the check and the await still wakes us
        notified.as_mut().enable();

        if let Some(sequence) = cell.changed_since(last_seen) {
            return WaitOutcome::Changed(sequence);
        }

        let _ = tokio::time::timeout(timeout, notified).await;

        match cell.changed_since(last_seen) {
            Some(sequence) => WaitOutcome::Changed(sequence),
            None => WaitOutcome::TimedOut,
        }
    }

    /// Block until a sequence other than `last_seen` is published
    ///
    /// Re-issues the bounded block after every timeout, yielding the thread in between.
    pub fn wait_for_next(&self, last_seen: Option<u32>, poll_interval: Duration) -> u32 {
        loop {
            match self.wait_blocking(last_seen, poll_interval) {
                WaitOutcome::Changed(sequence) => return sequence,
                WaitOutcome::TimedOut => thread::yield_now(),
            }
        }
    }

    /// Suspend until a sequence other than `last_seen` is published
    pub async fn wait_for_next_async(&self, last_seen: Option<u32>, driver_timeout: Duration) -> u32 {
        loop {
            if let WaitOutcome::Changed(sequence) = self.wait_async(last_seen, driver_timeout).await {
                return sequence;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferMode;

    fn channel(len: usize) -> (Arc<SharedFrame>, NotifyChannel) {
        let frame = Arc::new(SharedFrame::new(len, BufferMode::Single));
        let channel = NotifyChannel::new(frame.clone());
        (frame, channel)
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .build()
            .unwrap()
    }

    #[test]
    fn test_next_sequence_wraps() {
        assert_eq!(next_sequence(0, 100_000), 1);
        assert_eq!(next_sequence(99_998, 100_000), 99_999);
        assert_eq!(next_sequence(99_999, 100_000), 0);
        assert_eq!(next_sequence(1, 2), 0);
    }

    #[test]
    fn test_publish_updates_current() {
        let (_frame, channel) = channel(4);
        assert_eq!(channel.current(), 0);
        channel.publish(7);
        assert_eq!(channel.current(), 7);
    }

    #[test]
    fn test_first_wait_reports_current_frame() {
        let (_frame, channel) = channel(4);
        // Nothing published yet, but the sentinel still yields a frame
        assert_eq!(
            channel.wait_blocking(None, Duration::from_millis(5)),
            WaitOutcome::Changed(0)
        );
    }

    #[test]
    fn test_wait_blocking_times_out_without_publish() {
        let (_frame, channel) = channel(4);
        let start = Instant::now();
        let outcome = channel.wait_blocking(Some(0), Duration::from_millis(10));
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn test_wait_blocking_returns_immediately_when_stale() {
        let (_frame, channel) = channel(4);
        channel.publish(3);
        assert_eq!(
            channel.wait_blocking(Some(2), Duration::from_secs(5)),
            WaitOutcome::Changed(3)
        );
    }

    #[test]
    fn test_publish_wakes_blocked_thread() {
        let (_frame, channel) = channel(4);
        let publisher = channel.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            publisher.publish(1);
        });

        let start = Instant::now();
        let outcome = channel.wait_blocking(Some(0), Duration::from_secs(5));
        assert_eq!(outcome, WaitOutcome::Changed(1));
        assert!(start.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_for_next_skips_timeouts() {
        let (_frame, channel) = channel(4);
        let publisher = channel.clone();

        let handle = thread::spawn(move || {
            // Several poll intervals pass before anything is published
            thread::sleep(Duration::from_millis(30));
            publisher.publish(42);
        });

        assert_eq!(channel.wait_for_next(Some(0), Duration::from_millis(2)), 42);
        handle.join().unwrap();
    }

    #[test]
    fn test_write_visible_after_wake() {
        let (frame, channel) = channel(8);
        let (ack_tx, ack_rx) = flume::bounded::<()>(1);
        let producer_frame = frame.clone();
        let producer_channel = channel.clone();

        let producer = thread::spawn(move || {
            for seq in 1..=50u32 {
                producer_frame.write(&[seq as u8; 8]).unwrap();
                producer_channel.publish(seq);
                ack_rx.recv().unwrap();
            }
        });

        let mut last_seen = Some(0);
        let mut buf = [0u8; 8];
        for _ in 1..=50u32 {
            let seq = channel.wait_for_next(last_seen, Duration::from_millis(5));
            frame.read_into(&mut buf).unwrap();
            assert_eq!(buf, [seq as u8; 8], "stale buffer for sequence {}", seq);
            last_seen = Some(seq);
            ack_tx.send(()).unwrap();
        }
        producer.join().unwrap();
    }

    #[test]
    fn test_async_wait_wakes_on_publish() {
        let rt = runtime();
        let (_frame, channel) = channel(4);
        let publisher = channel.clone();

        let outcome = rt.block_on(async move {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                publisher.publish(5);
            });
            channel.wait_async(Some(0), Duration::from_secs(5)).await
        });
        assert_eq!(outcome, WaitOutcome::Changed(5));
    }

    #[test]
    fn test_async_wait_times_out() {
        let rt = runtime();
        let (_frame, channel) = channel(4);

        let outcome = rt.block_on(channel.wait_async(Some(0), Duration::from_millis(10)));
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[test]
    fn test_async_wait_for_next_from_thread_publisher() {
        let rt = runtime();
        let (_frame, channel) = channel(4);
        let publisher = channel.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            publisher.publish(9);
        });

        let seq = rt.block_on(channel.wait_for_next_async(Some(0), Duration::from_millis(5)));
        assert_eq!(seq, 9);
        handle.join().unwrap();
    }

    #[test]
    fn test_detect_without_runtime() {
        assert!(!WaitPath::detect(WaitMode::Auto).is_async());
        assert!(!WaitPath::detect(WaitMode::ForceAsync).is_async());
        assert!(!WaitPath::detect(WaitMode::ForcePoll).is_async());
    }

    #[test]
    fn test_detect_runtime_without_timer() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .build()
            .unwrap();
        let _guard = rt.enter();
        assert!(!WaitPath::detect(WaitMode::Auto).is_async());
        assert!(!WaitPath::detect(WaitMode::ForceAsync).is_async());
    }

    #[test]
    fn test_detect_inside_runtime() {
        let rt = runtime();
        let _guard = rt.enter();
        assert!(WaitPath::detect(WaitMode::Auto).is_async());
        assert!(WaitPath::detect(WaitMode::ForceAsync).is_async());
        assert!(!WaitPath::detect(WaitMode::ForcePoll).is_async());
    }
}
