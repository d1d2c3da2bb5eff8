//! Frame synchronization between a spectrum sampler and its visualizations
//!
//! This crate provides:
//! - A fixed-length shared magnitude buffer written by one producer thread
//! - A sequence-numbered notify cell that wakes every waiting consumer
//! - Consumers that render at most one frame per wake and drop the ones they missed
//! - An async wait path on tokio, with a bounded-block poll fallback
//! - Session lifecycle (attach, pause, resume, shutdown) through one hub
//!
//! # Architecture
//!
//! ```text
//! sampler → producer thread → SharedFrame ─write─┐
//!                 │                              │ read_into
//!                 └─publish(seq)→ notify cell ─wake→ consumer context → renderer
//! ```
//!
//! The producer writes the frame, then stores the next sequence with `Release` and
//! wakes all waiters. Consumers observe the sequence with `Acquire` and copy the frame
//! out, so what they read is that frame or a newer one. Nothing on the frame path
//! takes a lock.

mod config;
mod consumer;
mod error;
mod frame;
mod hub;
mod notify;
mod producer;

pub use config::{
    default_config_path, load_config, save_config, BufferMode, SyncConfig, WaitMode,
    DEFAULT_DRIVER_TIMEOUT_MS, DEFAULT_FFT_SIZE, DEFAULT_POLL_INTERVAL_MS,
    DEFAULT_REFRESH_RATE_HZ, DEFAULT_SEQUENCE_WRAP, MAX_FFT_SIZE, MIN_FFT_SIZE,
};
pub use consumer::{ConsumerStats, FrameConsumer, FrameRenderer, ViewSize, WaitTiming};
pub use error::{SyncError, SyncResult};
pub use frame::SharedFrame;
pub use hub::SynchronizationHub;
pub use notify::{next_sequence, NotifyChannel, WaitOutcome, WaitPath};
pub use producer::{FrameProducer, IntervalClock, RefreshClock, SpectralSampler};
