//! Frame consumer
//!
//! Each consumer owns exactly one render context for its whole life: a tokio task on
//! the async path, or a dedicated thread on the poll fallback. The renderer is moved
//! into that context and never leaves it.
//!
//! # Lifecycle
//!
//! ```text
//!            start()                       stop() / generation change
//!   idle ────────────▶ wait loop (gen N) ──────────────────────────────▶ idle
//!    │  ▲                   │ wake: read frame ─▶ renderer.on_frame()
//!    │  └──── wake ─────────┘
//!    └── wake channel closed (destroy) ──▶ renderer.release() ──▶ exit
//! ```
//!
//! The wait loop captures the generation token when it starts and compares it after
//! every wake. A `stop()` + `start()` pair bumps the token, so the old loop notices on
//! its next wake and returns silently before the new one begins. Because both loops
//! would run in the same context, they can never render concurrently.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use flume::{Receiver, Sender, TryRecvError};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::frame::SharedFrame;
use crate::notify::{NotifyChannel, WaitOutcome, WaitPath};

/// One pending wake is enough: every wake re-reads all shared state
const WAKE_CHANNEL_CAPACITY: usize = 1;

/// Draws magnitude frames onto a surface it owns
///
/// All methods run on the consumer's render context. Errors are logged and counted;
/// they never stop the wait loop. Panics are caught and treated the same way.
pub trait FrameRenderer: Send + 'static {
    /// Draw one frame. `magnitudes` has the session's frame length.
    fn on_frame(&mut self, sequence: u32, magnitudes: &[u8]) -> anyhow::Result<()>;

    /// The view size or scale factor changed
    fn on_resize(&mut self, _view: ViewSize) -> anyhow::Result<()> {
        Ok(())
    }

    /// Free graphics resources. Called once, when the render context exits.
    fn release(&mut self) {}
}

/// Logical view size and integer device scale factor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewSize {
    pub width: u32,
    pub height: u32,
    pub scale_factor: u32,
}

impl Default for ViewSize {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            scale_factor: 1,
        }
    }
}

impl ViewSize {
    /// Size in physical pixels
    pub fn physical(&self) -> (u32, u32) {
        (
            self.width.saturating_mul(self.scale_factor),
            self.height.saturating_mul(self.scale_factor),
        )
    }
}

/// Bounds on a single wait step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTiming {
    /// Poll fallback: length of one bounded block
    pub poll_interval: Duration,
    /// Async path: internal timeout before the wait is re-issued
    pub driver_timeout: Duration,
}

impl WaitTiming {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            driver_timeout: config.driver_timeout(),
        }
    }
}

impl Default for WaitTiming {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

/// Snapshot of a consumer's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumerStats {
    /// Frames handed to the renderer successfully
    pub frames_rendered: u64,
    /// Frames whose render returned an error or panicked
    pub render_failures: u64,
    /// Sequence of the most recent frame handed to the renderer
    pub last_sequence: Option<u32>,
}

/// State shared between the consumer handle and its render context
struct ConsumerShared {
    running: AtomicBool,
    generation: AtomicU64,
    /// False once the render context has exited
    alive: AtomicBool,
    frames_rendered: AtomicU64,
    render_failures: AtomicU64,
    /// -1 until the first frame is rendered
    last_sequence: AtomicI64,
    /// Latest requested logical size, `width << 32 | height`
    pending_size: AtomicU64,
    pending_scale: AtomicU32,
    /// Set when the pending view differs from what the renderer last saw
    view_dirty: AtomicBool,
}

impl ConsumerShared {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            alive: AtomicBool::new(true),
            frames_rendered: AtomicU64::new(0),
            render_failures: AtomicU64::new(0),
            last_sequence: AtomicI64::new(-1),
            pending_size: AtomicU64::new(0),
            pending_scale: AtomicU32::new(1),
            view_dirty: AtomicBool::new(false),
        }
    }

    /// Latest requested view. Only the newest values survive repeated calls.
    fn pending_view(&self) -> ViewSize {
        let size = self.pending_size.load(Ordering::Acquire);
        ViewSize {
            width: (size >> 32) as u32,
            height: size as u32,
            scale_factor: self.pending_scale.load(Ordering::Acquire),
        }
    }

    #[inline]
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    #[inline]
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// What the wait loop does after handling a wake
enum LoopStep {
    Continue,
    Exit,
}

/// Everything owned by the render context
struct RenderContext<R: FrameRenderer> {
    id: String,
    frame: Arc<SharedFrame>,
    channel: NotifyChannel,
    shared: Arc<ConsumerShared>,
    wake_rx: Receiver<()>,
    renderer: R,
    /// Local copy of the frame handed to the renderer
    scratch: Vec<u8>,
    /// Last sequence rendered; `None` until the first frame
    last_seen: Option<u32>,
    view: ViewSize,
    timing: WaitTiming,
}

impl<R: FrameRenderer> RenderContext<R> {
    /// Render context body for the poll fallback (dedicated thread)
    fn run_blocking(mut self) {
        log::info!("[Consumer {}] Render context started (poll fallback)", self.id);

        loop {
            if !self.drain_wakes() {
                break;
            }
            if self.shared.is_running() {
                let generation = self.shared.generation();
                self.wait_loop_blocking(generation);
                continue;
            }
            match self.wake_rx.recv() {
                Ok(()) => self.apply_pending_view(),
                Err(_) => break,
            }
        }

        self.finish();
    }

    fn wait_loop_blocking(&mut self, generation: u64) {
        loop {
            let outcome = self
                .channel
                .wait_blocking(self.last_seen, self.timing.poll_interval);
            // One scheduler tick before re-checking
            thread::yield_now();

            if let LoopStep::Exit = self.on_wake(generation, outcome) {
                return;
            }
        }
    }

    /// Render context body for the async path (tokio task)
    async fn run_async(mut self) {
        log::info!("[Consumer {}] Render context started (async wait)", self.id);

        loop {
            if !self.drain_wakes() {
                break;
            }
            if self.shared.is_running() {
                let generation = self.shared.generation();
                self.wait_loop_async(generation).await;
                continue;
            }
            match self.wake_rx.recv_async().await {
                Ok(()) => self.apply_pending_view(),
                Err(_) => break,
            }
        }

        self.finish();
    }

    async fn wait_loop_async(&mut self, generation: u64) {
        loop {
            let outcome = self
                .channel
                .wait_async(self.last_seen, self.timing.driver_timeout)
                .await;

            if let LoopStep::Exit = self.on_wake(generation, outcome) {
                return;
            }
        }
    }

    /// Shared wait-loop body, run after every wake on either path
    fn on_wake(&mut self, generation: u64, outcome: WaitOutcome) -> LoopStep {
        // Stale loop: a newer start() owns this context now
        if self.shared.generation() != generation {
            return LoopStep::Exit;
        }
        if !self.shared.is_running() {
            return LoopStep::Exit;
        }

        if let WaitOutcome::Changed(sequence) = outcome {
            self.last_seen = Some(sequence);
            self.render(sequence);
        }

        if self.drain_wakes() {
            LoopStep::Continue
        } else {
            LoopStep::Exit
        }
    }

    fn render(&mut self, sequence: u32) {
        if let Err(e) = self.frame.read_into(&mut self.scratch) {
            log::error!("[Consumer {}] Frame read failed: {}", self.id, e);
            return;
        }

        let result = catch_unwind(AssertUnwindSafe(|| {
            self.renderer.on_frame(sequence, &self.scratch)
        }));

        match result {
            Ok(Ok(())) => {
                self.shared.frames_rendered.fetch_add(1, Ordering::Relaxed);
                self.shared
                    .last_sequence
                    .store(sequence as i64, Ordering::Relaxed);
                log::trace!("[Consumer {}] Rendered frame {}", self.id, sequence);
            }
            Ok(Err(e)) => {
                self.shared.render_failures.fetch_add(1, Ordering::Relaxed);
                log::error!(
                    "[Consumer {}] Render failed for frame {}: {:#}",
                    self.id,
                    sequence,
                    e
                );
            }
            Err(_) => {
                self.shared.render_failures.fetch_add(1, Ordering::Relaxed);
                log::error!(
                    "[Consumer {}] Renderer panicked on frame {}",
                    self.id,
                    sequence
                );
            }
        }
    }

    /// Consume pending wakes and apply the latest view. Returns false once the handle
    /// is gone.
    fn drain_wakes(&mut self) -> bool {
        loop {
            match self.wake_rx.try_recv() {
                Ok(()) => continue,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
        self.apply_pending_view();
        true
    }

    fn apply_pending_view(&mut self) {
        if !self.shared.view_dirty.swap(false, Ordering::AcqRel) {
            return;
        }
        let view = self.shared.pending_view();
        if view == self.view {
            return;
        }
        self.view = view;

        log::debug!("[Consumer {}] View changed to {:?}", self.id, view);
        match catch_unwind(AssertUnwindSafe(|| self.renderer.on_resize(view))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("[Consumer {}] Resize failed: {:#}", self.id, e),
            Err(_) => log::error!("[Consumer {}] Renderer panicked on resize", self.id),
        }
    }

    fn finish(mut self) {
        if catch_unwind(AssertUnwindSafe(|| self.renderer.release())).is_err() {
            log::error!("[Consumer {}] Renderer panicked on release", self.id);
        }
        self.shared.alive.store(false, Ordering::Release);
        log::info!("[Consumer {}] Render context stopped", self.id);
    }
}

/// Handle to one visualization's render context
///
/// Dropping the handle destroys the consumer.
pub struct FrameConsumer {
    id: String,
    shared: Arc<ConsumerShared>,
    /// Dropped on destroy, which tells the render context to exit
    wake_tx: Option<Sender<()>>,
    destroyed: bool,
}

impl FrameConsumer {
    /// Create the consumer and its render context (idle until `start()`)
    ///
    /// - `id`: name used for logging and for the context's thread
    /// - `renderer`: moved into the render context
    /// - `frame`: shared frame to read from
    /// - `path`: async task or poll-fallback thread
    /// - `timing`: bounds of one wait step
    pub fn spawn<R: FrameRenderer>(
        id: impl Into<String>,
        renderer: R,
        frame: Arc<SharedFrame>,
        path: &WaitPath,
        timing: WaitTiming,
    ) -> SyncResult<Self> {
        let id = id.into();
        let shared = Arc::new(ConsumerShared::new());
        let (wake_tx, wake_rx) = flume::bounded(WAKE_CHANNEL_CAPACITY);

        let context = RenderContext {
            id: id.clone(),
            channel: NotifyChannel::new(frame.clone()),
            scratch: vec![0u8; frame.len()],
            frame,
            shared: shared.clone(),
            wake_rx,
            renderer,
            last_seen: None,
            view: ViewSize::default(),
            timing,
        };

        match path {
            WaitPath::Async(handle) => {
                handle.spawn(context.run_async());
            }
            WaitPath::PollFallback => {
                thread::Builder::new()
                    .name(format!("spectra-consumer-{}", id))
                    .spawn(move || context.run_blocking())?;
            }
        }

        Ok(Self {
            id,
            shared,
            wake_tx: Some(wake_tx),
            destroyed: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Begin rendering under a new generation
    pub fn start(&self) {
        if self.destroyed {
            log::warn!("[Consumer {}] start() after destroy ignored", self.id);
            return;
        }
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        self.shared.running.store(true, Ordering::Release);
        self.wake();
    }

    /// Stop rendering
    ///
    /// Does not interrupt a wait in progress: the loop exits on its next wake, within
    /// one poll interval or one driver timeout.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
    }

    /// Stop and release the renderer. A second call only logs a warning.
    pub fn destroy(&mut self) {
        if self.destroyed {
            log::warn!("[Consumer {}] Already destroyed", self.id);
            return;
        }
        self.teardown();
    }

    fn teardown(&mut self) {
        self.destroyed = true;
        self.shared.running.store(false, Ordering::Release);
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        // Closing the channel wakes an idle context and makes a busy one exit
        self.wake_tx = None;
        log::debug!("[Consumer {}] Destroyed", self.id);
    }

    /// Set the integer device scale factor
    ///
    /// Rejects non-integer, non-finite and sub-1 values without touching any state.
    pub fn set_scale_factor(&self, scale_factor: f64) -> SyncResult<()> {
        if !scale_factor.is_finite()
            || scale_factor.fract() != 0.0
            || scale_factor < 1.0
            || scale_factor > u32::MAX as f64
        {
            return Err(SyncError::InvalidScaleFactor(scale_factor));
        }
        if self.destroyed {
            return Err(SyncError::ShutDown);
        }
        self.shared
            .pending_scale
            .store(scale_factor as u32, Ordering::Release);
        self.mark_view_dirty();
        Ok(())
    }

    /// Resize the logical view
    pub fn resize_view(&self, width: u32, height: u32) -> SyncResult<()> {
        if width == 0 || height == 0 {
            return Err(SyncError::InvalidViewSize { width, height });
        }
        if self.destroyed {
            return Err(SyncError::ShutDown);
        }
        let size = (u64::from(width) << 32) | u64::from(height);
        self.shared.pending_size.store(size, Ordering::Release);
        self.mark_view_dirty();
        Ok(())
    }

    /// Later changes overwrite earlier ones; the context applies whatever is newest
    fn mark_view_dirty(&self) {
        self.shared.view_dirty.store(true, Ordering::Release);
        self.wake();
    }

    fn wake(&self) {
        if let Some(tx) = &self.wake_tx {
            // Full means a wake is already pending
            let _ = tx.try_send(());
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Whether the render context is still alive
    ///
    /// Stays true for up to one wait step after `destroy()`.
    pub fn is_context_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    /// Current generation token
    pub fn generation(&self) -> u64 {
        self.shared.generation()
    }

    pub fn stats(&self) -> ConsumerStats {
        let last = self.shared.last_sequence.load(Ordering::Relaxed);
        ConsumerStats {
            frames_rendered: self.shared.frames_rendered.load(Ordering::Relaxed),
            render_failures: self.shared.render_failures.load(Ordering::Relaxed),
            last_sequence: u32::try_from(last).ok(),
        }
    }
}

impl Drop for FrameConsumer {
    fn drop(&mut self) {
        if !self.destroyed {
            self.teardown();
        }
    }
}
