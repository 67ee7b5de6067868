//! Driver configuration.
//!
//! Every limit the protocol drivers enforce lives here as a plain value.
//! The acceptor builds one [`Options`], validates it once, and shares it
//! across connections behind an `Arc`.
//!
//! # Usage
//!
//! ```rust,ignore
//! use drover::Options;
//! use std::time::Duration;
//!
//! let options = Options::new()
//!     .connection_timeout(Duration::from_secs(30))
//!     .body_size_limit(1 << 20)
//!     .allow_http2_upgrade(true);
//! options.validate()?;
//! ```

use std::time::Duration;

use crate::error::{Error, Result};
use crate::transport::h2::frame::{
    DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE, MAX_MAX_FRAME_SIZE, MAX_WINDOW_SIZE,
};

/// Limits and switches shared by the HTTP/1.x and HTTP/2 drivers.
///
/// # Timeout Semantics
///
/// - **connection_timeout**: RESETS on every read, write and frame. Idle
///   HTTP/1.x connections are closed; idle HTTP/2 connections get GOAWAY.
/// - **stream_timeout**: RESETS on activity of that stream. Expiry resets the
///   HTTP/2 stream with CANCEL.
#[derive(Clone, Debug)]
pub struct Options {
    /// Idle limit for a whole connection.
    ///
    /// Default: 15s
    pub connection_timeout: Duration,

    /// Idle limit for a single HTTP/2 stream.
    ///
    /// Default: 15s
    pub stream_timeout: Duration,

    /// Largest accepted request head (HTTP/1.x) or header block (HTTP/2), in octets.
    ///
    /// Default: 32 KiB
    pub header_size_limit: usize,

    /// Initial request body limit. Handlers may raise it per request.
    ///
    /// Default: 128 KiB
    pub body_size_limit: u64,

    /// Concurrent client streams per HTTP/2 connection.
    ///
    /// Default: 256
    pub concurrent_stream_limit: u32,

    /// Whether responses may carry server pushes.
    ///
    /// Default: true
    pub push_enabled: bool,

    /// Whether HTTP/1.1 connections may switch to HTTP/2 in-band (`Upgrade: h2c`
    /// or a prior-knowledge preface).
    ///
    /// Default: false
    pub allow_http2_upgrade: bool,

    /// Output buffer flush threshold and HTTP/1.x body read chunk size.
    ///
    /// Default: 8 KiB
    pub output_buffer_size: usize,

    /// Our SETTINGS_INITIAL_WINDOW_SIZE and connection receive window.
    ///
    /// Default: 65535
    pub initial_window_size: u32,

    /// Our SETTINGS_MAX_FRAME_SIZE.
    ///
    /// Default: 16384
    pub max_frame_size: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(15),
            stream_timeout: Duration::from_secs(15),
            header_size_limit: 32 * 1024,
            body_size_limit: 128 * 1024,
            concurrent_stream_limit: 256,
            push_enabled: true,
            allow_http2_upgrade: false,
            output_buffer_size: 8 * 1024,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    pub fn header_size_limit(mut self, limit: usize) -> Self {
        self.header_size_limit = limit;
        self
    }

    pub fn body_size_limit(mut self, limit: u64) -> Self {
        self.body_size_limit = limit;
        self
    }

    pub fn concurrent_stream_limit(mut self, limit: u32) -> Self {
        self.concurrent_stream_limit = limit;
        self
    }

    pub fn push_enabled(mut self, enabled: bool) -> Self {
        self.push_enabled = enabled;
        self
    }

    pub fn allow_http2_upgrade(mut self, allow: bool) -> Self {
        self.allow_http2_upgrade = allow;
        self
    }

    pub fn output_buffer_size(mut self, size: usize) -> Self {
        self.output_buffer_size = size;
        self
    }

    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.initial_window_size = size;
        self
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Reject values the drivers cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.connection_timeout.is_zero() || self.stream_timeout.is_zero() {
            return Err(Error::config("timeouts must be non-zero"));
        }
        if self.header_size_limit < 64 {
            return Err(Error::config("header_size_limit below 64 octets"));
        }
        if self.concurrent_stream_limit == 0 {
            return Err(Error::config("concurrent_stream_limit must be at least 1"));
        }
        if self.output_buffer_size == 0 {
            return Err(Error::config("output_buffer_size must be non-zero"));
        }
        if self.initial_window_size == 0 || self.initial_window_size > MAX_WINDOW_SIZE {
            return Err(Error::config(format!(
                "initial_window_size {} outside 1..=2^31-1",
                self.initial_window_size
            )));
        }
        if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&self.max_frame_size) {
            return Err(Error::config(format!(
                "max_frame_size {} outside 16384..=16777215",
                self.max_frame_size
            )));
        }
        Ok(())
    }

    /// Value advertised in the HTTP/1.x `keep-alive: timeout=` parameter.
    pub(crate) fn keep_alive_secs(&self) -> u64 {
        self.connection_timeout.as_secs().max(1)
    }
}
