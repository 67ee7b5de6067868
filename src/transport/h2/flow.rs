//! Flow-control windows (RFC 9113 Section 5.2).

use super::frame::MAX_WINDOW_SIZE;

/// Credit the peer granted us for sending DATA.
///
/// Signed because a SETTINGS_INITIAL_WINDOW_SIZE decrease may push a stream
/// window below zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SendWindow(i64);

impl SendWindow {
    pub fn new(size: u32) -> Self {
        Self(size as i64)
    }

    /// Bytes that may be sent now.
    pub fn available(&self) -> usize {
        self.0.max(0) as usize
    }

    pub fn consume(&mut self, n: usize) {
        self.0 -= n as i64;
    }

    /// Apply a WINDOW_UPDATE. Fails if the window would exceed 2^31-1.
    pub fn grow(&mut self, increment: u32) -> Result<(), ()> {
        let next = self.0 + increment as i64;
        if next > MAX_WINDOW_SIZE as i64 {
            return Err(());
        }
        self.0 = next;
        Ok(())
    }

    /// Apply an INITIAL_WINDOW_SIZE change.
    pub fn adjust(&mut self, delta: i64) -> Result<(), ()> {
        let next = self.0 + delta;
        if next > MAX_WINDOW_SIZE as i64 {
            return Err(());
        }
        self.0 = next;
        Ok(())
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

/// Credit we granted the peer.
///
/// `window` is what the peer may still send. Data the consumer has taken is
/// collected in `released` and returned as one WINDOW_UPDATE once the window
/// falls under half of `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecvFlow {
    window: i64,
    target: u32,
    released: u32,
}

impl RecvFlow {
    pub fn new(target: u32) -> Self {
        Self {
            window: target as i64,
            target,
            released: 0,
        }
    }

    pub fn window(&self) -> i64 {
        self.window
    }

    /// Account for an inbound DATA frame. Fails if it exceeds the window.
    pub fn receive(&mut self, n: usize) -> Result<(), ()> {
        if n as i64 > self.window {
            return Err(());
        }
        self.window -= n as i64;
        Ok(())
    }

    /// The consumer took `n` bytes. Returns the WINDOW_UPDATE increment to
    /// send, if the window crossed the low-water mark.
    pub fn release(&mut self, n: usize) -> Option<u32> {
        self.released = self.released.saturating_add(n as u32);
        if self.window >= (self.target / 2) as i64 || self.released == 0 {
            return None;
        }
        let increment = self.released;
        self.window += increment as i64;
        self.released = 0;
        Some(increment)
    }
}
