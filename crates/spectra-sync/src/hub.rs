//! Synchronization hub
//!
//! Owns one analysis session: the shared frame, the producer and every attached
//! consumer. All lifecycle calls go through here.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::SyncConfig;
use crate::consumer::{FrameConsumer, FrameRenderer, WaitTiming};
use crate::error::{SyncError, SyncResult};
use crate::frame::SharedFrame;
use crate::notify::WaitPath;
use crate::producer::{FrameProducer, IntervalClock, RefreshClock, SpectralSampler};

/// One producer and any number of consumers over one shared frame
///
/// Starts paused. Dropping the hub shuts it down.
pub struct SynchronizationHub {
    config: SyncConfig,
    /// Released by `shutdown()`
    frame: Option<Arc<SharedFrame>>,
    producer: Option<FrameProducer>,
    consumers: HashMap<String, FrameConsumer>,
    wait_path: WaitPath,
    timing: WaitTiming,
    running: bool,
}

impl SynchronizationHub {
    /// Create a session ticking at `config.refresh_rate_hz`
    pub fn new<S: SpectralSampler>(config: SyncConfig, sampler: S) -> SyncResult<Self> {
        config.validate()?;
        let clock = IntervalClock::from_rate_hz(config.refresh_rate_hz)?;
        Self::with_clock(config, sampler, clock)
    }

    /// Create a session driven by a host-supplied refresh clock
    pub fn with_clock<S, C>(config: SyncConfig, sampler: S, clock: C) -> SyncResult<Self>
    where
        S: SpectralSampler,
        C: RefreshClock,
    {
        config.validate()?;
        let wait_path = WaitPath::detect(config.wait_mode);
        Self::with_parts(config, sampler, clock, wait_path)
    }

    /// Create a session with an explicit clock and wait path
    pub fn with_parts<S, C>(
        config: SyncConfig,
        sampler: S,
        clock: C,
        wait_path: WaitPath,
    ) -> SyncResult<Self>
    where
        S: SpectralSampler,
        C: RefreshClock,
    {
        config.validate()?;

        let frame = Arc::new(SharedFrame::new(config.frame_len(), config.buffer_mode));
        let producer =
            FrameProducer::spawn(sampler, clock, frame.clone(), config.sequence_wrap)?;

        log::info!(
            "[Hub] Session created: frame length {}, {:?} buffer, {} wait",
            frame.len(),
            config.buffer_mode,
            if wait_path.is_async() { "async" } else { "poll fallback" }
        );

        Ok(Self {
            timing: WaitTiming::from_config(&config),
            config,
            frame: Some(frame),
            producer: Some(producer),
            consumers: HashMap::new(),
            wait_path,
            running: false,
        })
    }

    fn ensure_live(&self) -> SyncResult<&Arc<SharedFrame>> {
        self.frame.as_ref().ok_or(SyncError::ShutDown)
    }

    /// Attach a visualization under `id`
    ///
    /// Starts it immediately if the hub is running. An existing consumer with the same
    /// id is destroyed and replaced.
    pub fn attach_consumer<R: FrameRenderer>(
        &mut self,
        id: impl Into<String>,
        renderer: R,
    ) -> SyncResult<&FrameConsumer> {
        let frame = self.ensure_live()?.clone();
        let id = id.into();

        if let Some(mut old) = self.consumers.remove(&id) {
            log::debug!("[Hub] Replacing consumer '{}'", id);
            old.destroy();
        }

        let consumer =
            FrameConsumer::spawn(id.clone(), renderer, frame, &self.wait_path, self.timing)?;
        if self.running {
            consumer.start();
        }
        log::debug!(
            "[Hub] Attached consumer '{}' ({} total)",
            id,
            self.consumers.len() + 1
        );

        Ok(&*self.consumers.entry(id).or_insert(consumer))
    }

    /// Destroy and remove a consumer. Returns false if `id` was not attached.
    pub fn detach_consumer(&mut self, id: &str) -> bool {
        match self.consumers.remove(id) {
            Some(mut consumer) => {
                consumer.destroy();
                log::debug!("[Hub] Detached consumer '{}'", id);
                true
            }
            None => false,
        }
    }

    /// Resume the producer, then start every consumer
    pub fn resume_all(&mut self) -> SyncResult<()> {
        self.ensure_live()?;
        if let Some(producer) = &self.producer {
            producer.resume();
        }
        for consumer in self.consumers.values() {
            consumer.start();
        }
        self.running = true;
        log::info!("[Hub] Resumed ({} consumers)", self.consumers.len());
        Ok(())
    }

    /// Pause the producer, then stop every consumer
    pub fn pause_all(&mut self) -> SyncResult<()> {
        self.ensure_live()?;
        if let Some(producer) = &self.producer {
            producer.pause();
        }
        for consumer in self.consumers.values() {
            consumer.stop();
        }
        self.running = false;
        log::info!("[Hub] Paused");
        Ok(())
    }

    /// Tear the session down
    ///
    /// Consumers are destroyed before the producer is joined. A second call only logs a
    /// warning.
    pub fn shutdown(&mut self) {
        if self.frame.is_none() {
            log::warn!("[Hub] Already shut down");
            return;
        }
        log::info!("[Hub] Shutting down...");
        self.teardown();
    }

    fn teardown(&mut self) {
        self.running = false;
        if let Some(producer) = &self.producer {
            producer.pause();
        }
        for (_, mut consumer) in self.consumers.drain() {
            consumer.destroy();
        }
        if let Some(mut producer) = self.producer.take() {
            producer.destroy();
        }
        // Consumer contexts still hold clones until they exit
        self.frame = None;
        log::info!("[Hub] Shut down");
    }

    pub fn consumer(&self, id: &str) -> Option<&FrameConsumer> {
        self.consumers.get(id)
    }

    /// Attached consumer ids, sorted
    pub fn consumer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.consumers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The shared frame, or `None` after shutdown
    pub fn frame(&self) -> Option<&Arc<SharedFrame>> {
        self.frame.as_ref()
    }

    pub fn producer(&self) -> Option<&FrameProducer> {
        self.producer.as_ref()
    }

    pub fn wait_path(&self) -> &WaitPath {
        &self.wait_path
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_shut_down(&self) -> bool {
        self.frame.is_none()
    }
}

impl Drop for SynchronizationHub {
    fn drop(&mut self) {
        if self.frame.is_some() {
            self.teardown();
        }
    }
}
