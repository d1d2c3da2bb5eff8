//! Frame producer
//!
//! Dedicated thread that owns the spectral sampler. Once per display refresh it copies
//! the sampler's latest magnitudes into the shared frame and publishes the next
//! sequence number.
//!
//! The pause flag lives in its own atomic, separate from the sequence counter in the
//! notify cell. While paused the thread parks and never touches the sampler.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{SyncError, SyncResult};
use crate::frame::SharedFrame;
use crate::notify::{next_sequence, NotifyChannel};

/// Source of magnitude snapshots
///
/// Called only from the producer thread. `out` always has the session's frame length.
pub trait SpectralSampler: Send + 'static {
    /// Fill `out` with the latest frequency magnitudes
    fn sample(&mut self, out: &mut [u8]);
}

impl<F> SpectralSampler for F
where
    F: FnMut(&mut [u8]) + Send + 'static,
{
    fn sample(&mut self, out: &mut [u8]) {
        self(out)
    }
}

/// Display refresh cadence driving producer ticks
pub trait RefreshClock: Send + 'static {
    /// Block until the next refresh is due
    ///
    /// Returns false if the wait ended without a refresh (e.g. a host timeout); the
    /// producer then skips the tick and re-checks its flags.
    fn wait_for_refresh(&mut self) -> bool;
}

/// Fixed-rate refresh clock
///
/// Ticks on a regular grid. If the producer falls behind by more than one period the
/// grid is reset to now instead of bursting to catch up.
pub struct IntervalClock {
    period: Duration,
    next_deadline: Option<Instant>,
}

impl IntervalClock {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next_deadline: None,
        }
    }

    /// Clock ticking `rate_hz` times per second
    ///
    /// Rejects rates that are not finite and positive.
    pub fn from_rate_hz(rate_hz: f64) -> SyncResult<Self> {
        if !rate_hz.is_finite() || rate_hz <= 0.0 {
            return Err(SyncError::InvalidConfig(format!(
                "refresh rate must be a positive number of Hz, got {}",
                rate_hz
            )));
        }
        Ok(Self::new(Duration::from_secs_f64(1.0 / rate_hz)))
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl RefreshClock for IntervalClock {
    fn wait_for_refresh(&mut self) -> bool {
        let now = Instant::now();
        let deadline = match self.next_deadline {
            Some(deadline) if deadline + self.period >= now => deadline,
            _ => now,
        };

        if deadline > now {
            thread::sleep(deadline - now);
        }
        self.next_deadline = Some(deadline + self.period);
        true
    }
}

/// Per-tick work of the producer, owned by the producer thread
pub(crate) struct ProducerCore<S: SpectralSampler> {
    sampler: S,
    /// Private copy target; the sampler never writes shared memory directly
    scratch: Vec<u8>,
    frame: Arc<SharedFrame>,
    channel: NotifyChannel,
    frame_index: u32,
    sequence_wrap: u32,
}

impl<S: SpectralSampler> ProducerCore<S> {
    pub(crate) fn new(sampler: S, frame: Arc<SharedFrame>, sequence_wrap: u32) -> Self {
        let channel = NotifyChannel::new(frame.clone());
        Self {
            sampler,
            scratch: vec![0u8; frame.len()],
            frame_index: channel.current(),
            frame,
            channel,
            sequence_wrap,
        }
    }

    /// Sample, write, then publish. Returns the published sequence.
    pub(crate) fn tick(&mut self) -> SyncResult<u32> {
        self.sampler.sample(&mut self.scratch);
        self.frame.write(&self.scratch)?;

        self.frame_index = next_sequence(self.frame_index, self.sequence_wrap);
        self.channel.publish(self.frame_index);
        Ok(self.frame_index)
    }
}

/// State shared between the producer handle and its thread
struct ProducerControl {
    /// Pause flag: ticks only happen while true
    running: AtomicBool,
    /// Thread exit request
    shutdown: AtomicBool,
    /// Total frames published
    ticks: AtomicU64,
    /// Ticks lost to a panicking sampler
    sampler_panics: AtomicU64,
}

/// Handle to the producer thread
///
/// Created paused. Dropping the handle stops and joins the thread.
pub struct FrameProducer {
    control: Arc<ProducerControl>,
    channel: NotifyChannel,
    handle: Option<thread::JoinHandle<()>>,
    destroyed: bool,
}

impl FrameProducer {
    /// Spawn the producer thread
    ///
    /// - `sampler`: moved into the thread; it is never called from anywhere else
    /// - `clock`: refresh cadence the ticks follow
    /// - `frame`: shared frame to write and publish into
    /// - `sequence_wrap`: wraparound bound K for sequence numbers
    pub fn spawn<S, C>(
        sampler: S,
        clock: C,
        frame: Arc<SharedFrame>,
        sequence_wrap: u32,
    ) -> SyncResult<Self>
    where
        S: SpectralSampler,
        C: RefreshClock,
    {
        let control = Arc::new(ProducerControl {
            running: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
            sampler_panics: AtomicU64::new(0),
        });
        let channel = NotifyChannel::new(frame.clone());
        let core = ProducerCore::new(sampler, frame, sequence_wrap);
        let thread_control = control.clone();

        let handle = thread::Builder::new()
            .name("spectra-producer".into())
            .spawn(move || Self::run(core, clock, thread_control))?;

        Ok(Self {
            control,
            channel,
            handle: Some(handle),
            destroyed: false,
        })
    }

    /// Main loop running on the producer thread
    fn run<S, C>(mut core: ProducerCore<S>, mut clock: C, control: Arc<ProducerControl>)
    where
        S: SpectralSampler,
        C: RefreshClock,
    {
        log::info!("[Producer] Thread started");

        loop {
            if control.shutdown.load(Ordering::Acquire) {
                break;
            }
            if !control.running.load(Ordering::Acquire) {
                thread::park();
                continue;
            }

            // Scheduled tick: the pause flag is checked again once the refresh fires
            if !clock.wait_for_refresh() {
                continue;
            }
            if control.shutdown.load(Ordering::Acquire) {
                break;
            }
            if !control.running.load(Ordering::Acquire) {
                continue;
            }

            // A panicking sampler skips the tick; nothing was written or published
            match catch_unwind(AssertUnwindSafe(|| core.tick())) {
                Ok(Ok(sequence)) => {
                    control.ticks.fetch_add(1, Ordering::Relaxed);
                    log::trace!("[Producer] Published frame {}", sequence);
                }
                Ok(Err(e)) => log::error!("[Producer] Frame write failed: {}", e),
                Err(_) => {
                    control.sampler_panics.fetch_add(1, Ordering::Relaxed);
                    log::error!("[Producer] Sampler panicked, tick skipped");
                }
            }
        }

        log::info!("[Producer] Thread stopped");
    }

    /// Start (or continue) ticking on the refresh cadence
    pub fn resume(&self) {
        if self.destroyed {
            log::warn!("[Producer] resume() after destroy ignored");
            return;
        }
        self.control.running.store(true, Ordering::Release);
        if let Some(handle) = &self.handle {
            handle.thread().unpark();
        }
    }

    /// Stop ticking; an in-flight tick exits without sampling
    pub fn pause(&self) {
        self.control.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.control.running.load(Ordering::Acquire)
    }

    /// Sequence number of the last published frame
    pub fn frame_index(&self) -> u32 {
        self.channel.current()
    }

    /// Total frames published since spawn
    pub fn ticks(&self) -> u64 {
        self.control.ticks.load(Ordering::Relaxed)
    }

    /// Ticks skipped because the sampler panicked
    pub fn sampler_panics(&self) -> u64 {
        self.control.sampler_panics.load(Ordering::Relaxed)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Stop the thread and wait for it to exit
    ///
    /// Waits at most one refresh period. Calling it again is a no-op.
    pub fn destroy(&mut self) {
        if self.destroyed {
            log::warn!("[Producer] Already destroyed");
            return;
        }
        self.destroyed = true;
        self.shutdown_thread();
    }

    fn shutdown_thread(&mut self) {
        self.control.running.store(false, Ordering::Release);
        self.control.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            log::debug!("[Producer] Waiting for thread to stop...");
            if handle.join().is_err() {
                log::error!("[Producer] Thread panicked");
            }
        }
    }
}

impl Drop for FrameProducer {
    fn drop(&mut self) {
        if !self.destroyed {
            self.destroyed = true;
            self.shutdown_thread();
        }
    }
}

/// Refresh clock stepped by hand, for deterministic tests
#[cfg(test)]
pub(crate) mod test_clock {
    use super::RefreshClock;
    use std::time::Duration;

    /// Each `wait_for_refresh` consumes one step sent through the paired sender
    pub(crate) struct StepClock {
        steps: flume::Receiver<()>,
    }

    impl StepClock {
        pub(crate) fn new() -> (flume::Sender<()>, Self) {
            let (tx, rx) = flume::unbounded();
            (tx, Self { steps: rx })
        }
    }

    impl RefreshClock for StepClock {
        fn wait_for_refresh(&mut self) -> bool {
            // Short timeout so a shutdown request is never stuck behind a missing step
            match self.steps.recv_timeout(Duration::from_millis(20)) {
                Ok(()) => true,
                Err(flume::RecvTimeoutError::Timeout) => false,
                Err(flume::RecvTimeoutError::Disconnected) => {
                    std::thread::sleep(Duration::from_millis(20));
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_clock::StepClock;
    use super::*;
    use crate::config::BufferMode;
    use crate::notify::WaitOutcome;

    fn shared(len: usize) -> Arc<SharedFrame> {
        Arc::new(SharedFrame::new(len, BufferMode::Single))
    }

    /// Sampler that writes its own call count into every byte
    fn counting_sampler() -> impl SpectralSampler {
        let mut calls = 0u8;
        move |out: &mut [u8]| {
            calls = calls.wrapping_add(1);
            out.fill(calls);
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_tick_writes_then_publishes() {
        let frame = shared(4);
        let mut core = ProducerCore::new(counting_sampler(), frame.clone(), 100_000);

        assert_eq!(core.tick().unwrap(), 1);
        assert_eq!(frame.read(), vec![1, 1, 1, 1]);
        assert_eq!(frame.notify_cell().load(), 1);

        assert_eq!(core.tick().unwrap(), 2);
        assert_eq!(frame.read(), vec![2, 2, 2, 2]);
    }

    #[test]
    fn test_tick_sequence_wraps() {
        let frame = shared(2);
        let mut core = ProducerCore::new(counting_sampler(), frame, 3);
        let published: Vec<u32> = (0..7).map(|_| core.tick().unwrap()).collect();
        assert_eq!(published, vec![1, 2, 0, 1, 2, 0, 1]);
    }

    #[test]
    fn test_sampler_sees_frame_length() {
        let frame = shared(128);
        let mut core = ProducerCore::new(
            |out: &mut [u8]| assert_eq!(out.len(), 128),
            frame,
            100_000,
        );
        core.tick().unwrap();
    }

    #[test]
    fn test_interval_clock_paces_ticks() {
        let mut clock = IntervalClock::new(Duration::from_millis(5));
        let start = Instant::now();
        for _ in 0..5 {
            assert!(clock.wait_for_refresh());
        }
        // First call is immediate, the remaining four each wait a period
        assert!(start.elapsed() >= Duration::from_millis(18));
    }

    #[test]
    fn test_interval_clock_from_rate() {
        let clock = IntervalClock::from_rate_hz(50.0).unwrap();
        assert_eq!(clock.period(), Duration::from_millis(20));

        for bad in [0.0, -60.0, f64::NAN, f64::INFINITY] {
            assert!(
                matches!(
                    IntervalClock::from_rate_hz(bad),
                    Err(SyncError::InvalidConfig(_))
                ),
                "rate {} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_producer_starts_paused() {
        let frame = shared(4);
        let (_steps, clock) = StepClock::new();
        let producer = FrameProducer::spawn(counting_sampler(), clock, frame, 100_000).unwrap();

        assert!(!producer.is_running());
        thread::sleep(Duration::from_millis(50));
        assert_eq!(producer.ticks(), 0);
        assert_eq!(producer.frame_index(), 0);
    }

    #[test]
    fn test_producer_ticks_on_refresh() {
        let frame = shared(4);
        let channel = NotifyChannel::new(frame.clone());
        let (steps, clock) = StepClock::new();
        let producer =
            FrameProducer::spawn(counting_sampler(), clock, frame.clone(), 100_000).unwrap();

        producer.resume();
        steps.send(()).unwrap();
        assert_eq!(
            channel.wait_blocking(Some(0), Duration::from_secs(5)),
            WaitOutcome::Changed(1)
        );
        assert_eq!(frame.read(), vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_pause_stops_ticks() {
        let frame = shared(4);
        let clock = IntervalClock::new(Duration::from_millis(2));
        let mut producer =
            FrameProducer::spawn(counting_sampler(), clock, frame, 100_000).unwrap();

        producer.resume();
        assert!(wait_until(|| producer.ticks() >= 3));

        producer.pause();
        // Let any in-flight tick drain
        thread::sleep(Duration::from_millis(20));
        let paused_at = producer.ticks();
        let index_at = producer.frame_index();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(producer.ticks(), paused_at);
        assert_eq!(producer.frame_index(), index_at);

        producer.resume();
        assert!(wait_until(|| producer.ticks() > paused_at));

        producer.destroy();
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let _ = env_logger::builder().is_test(true).try_init();
        let frame = shared(4);
        let clock = IntervalClock::new(Duration::from_millis(2));
        let mut producer =
            FrameProducer::spawn(counting_sampler(), clock, frame, 100_000).unwrap();

        producer.resume();
        producer.destroy();
        assert!(producer.is_destroyed());
        assert!(!producer.is_running());

        let ticks = producer.ticks();
        producer.destroy();
        producer.resume();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(producer.ticks(), ticks);
    }

    #[test]
    fn test_sampler_panic_skips_tick() {
        let _ = env_logger::builder().is_test(true).try_init();
        let frame = shared(4);
        let channel = NotifyChannel::new(frame.clone());
        let (steps, clock) = StepClock::new();

        let mut calls = 0u8;
        let sampler = move |out: &mut [u8]| {
            calls += 1;
            if calls == 2 {
                panic!("sampler failure");
            }
            out.fill(calls);
        };
        let producer = FrameProducer::spawn(sampler, clock, frame.clone(), 100_000).unwrap();
        producer.resume();

        steps.send(()).unwrap();
        assert!(wait_until(|| producer.ticks() == 1));

        steps.send(()).unwrap();
        assert!(wait_until(|| producer.sampler_panics() == 1));
        assert_eq!(producer.frame_index(), 1);
        assert_eq!(frame.read(), vec![1, 1, 1, 1]);

        // The thread survives and keeps publishing
        steps.send(()).unwrap();
        assert_eq!(
            channel.wait_blocking(Some(1), Duration::from_secs(5)),
            WaitOutcome::Changed(2)
        );
        assert_eq!(frame.read(), vec![3, 3, 3, 3]);
        assert!(wait_until(|| producer.ticks() == 2));
    }
}
