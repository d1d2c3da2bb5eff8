//! Shared frame memory
//!
//! One fixed-length magnitude buffer plus the notify cell, allocated once per session
//! and shared (via `Arc`) by the producer and every consumer.
//!
//! Bytes are stored as `AtomicU8` so the producer can overwrite a frame while a
//! consumer is copying it out without either side taking a lock. Each byte is visible
//! on its own; a reader racing a writer can see a mix of two frames (a torn read).
//! `BufferMode::Double` narrows that window by writing into a back buffer and flipping
//! an index, without changing anything a caller sees.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

use crate::config::BufferMode;
use crate::error::{SyncError, SyncResult};
use crate::notify::NotifyCell;

/// Shared magnitude snapshot and its notify cell
pub struct SharedFrame {
    /// One buffer (single mode) or two (double mode)
    buffers: Box<[Box<[AtomicU8]>]>,
    /// Index of the buffer readers should copy from
    front: CachePadded<AtomicUsize>,
    /// Fixed frame length L
    len: usize,
    mode: BufferMode,
    /// Sequence counter + wake signal, kept off the buffer's cache lines
    notify: CachePadded<NotifyCell>,
}

impl SharedFrame {
    /// Allocate a zero-filled frame of `len` bytes
    pub fn new(len: usize, mode: BufferMode) -> Self {
        let count = match mode {
            BufferMode::Single => 1,
            BufferMode::Double => 2,
        };
        let buffers = (0..count)
            .map(|_| (0..len).map(|_| AtomicU8::new(0)).collect::<Box<[_]>>())
            .collect::<Box<[_]>>();

        Self {
            buffers,
            front: CachePadded::new(AtomicUsize::new(0)),
            len,
            mode,
            notify: CachePadded::new(NotifyCell::new()),
        }
    }

    /// Frame length L in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn mode(&self) -> BufferMode {
        self.mode
    }

    /// Replace the frame contents
    ///
    /// Rejects a payload of the wrong length before any byte is written. Must only be
    /// called from the producer context, and before the matching publish.
    pub fn write(&self, bytes: &[u8]) -> SyncResult<()> {
        self.check_len(bytes.len())?;

        let target = match self.mode {
            BufferMode::Single => 0,
            // Only the producer moves `front`, so a relaxed load sees its own last store
            BufferMode::Double => 1 - self.front.load(Ordering::Relaxed),
        };

        for (cell, &byte) in self.buffers[target].iter().zip(bytes) {
            cell.store(byte, Ordering::Relaxed);
        }

        if self.mode == BufferMode::Double {
            self.front.store(target, Ordering::Release);
        }
        Ok(())
    }

    /// Copy the current contents out
    ///
    /// Not synchronized against `write`; see the module docs on torn reads.
    pub fn read(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        self.copy_front(&mut out);
        out
    }

    /// Copy the current contents into `out` without allocating
    pub fn read_into(&self, out: &mut [u8]) -> SyncResult<()> {
        self.check_len(out.len())?;
        self.copy_front(out);
        Ok(())
    }

    pub(crate) fn notify_cell(&self) -> &NotifyCell {
        &self.notify
    }

    fn copy_front(&self, out: &mut [u8]) {
        let front = self.front.load(Ordering::Acquire);
        for (dst, cell) in out.iter_mut().zip(self.buffers[front].iter()) {
            *dst = cell.load(Ordering::Relaxed);
        }
    }

    fn check_len(&self, actual: usize) -> SyncResult<()> {
        if actual != self.len {
            return Err(SyncError::FrameLengthMismatch {
                expected: self.len,
                actual,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for SharedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedFrame")
            .field("len", &self.len)
            .field("mode", &self.mode)
            .field("sequence", &self.notify.load())
            .finish()
    }
}
