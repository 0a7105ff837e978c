//! Configuration of a safe stream.

use {
    core::time::Duration,
    derive_more::{Display, Error},
};

/// Largest window which keeps every in-flight offset unambiguous on the ring.
pub const MAX_WINDOW_SIZE: usize = 1 << 15;

/// Tuning parameters for one direction of a safe stream.
///
/// Both peers should use the same configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SafeStreamConfig {
    /// Maximum number of bytes the sender buffers before rejecting writes.
    pub buffer_capacity: usize,
    /// Maximum number of unconfirmed bytes in flight.
    pub window_size: usize,
    /// Maximum number of payload bytes per data message.
    pub max_data_size: usize,
    /// How many times a chunk may be repeated before it is abandoned.
    pub max_repeat_count: u16,
    /// How long the sender waits for a confirmation before resending.
    pub wait_confirm_timeout: Duration,
    /// Minimum interval between confirmations sent by the receiver.
    pub send_confirm_timeout: Duration,
    /// Minimum interval between repeat requests sent by the receiver.
    pub send_repeat_timeout: Duration,
}

impl Default for SafeStreamConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 20 * 1024,
            window_size: 10 * 1024,
            max_data_size: 200,
            max_repeat_count: 10,
            wait_confirm_timeout: Duration::from_millis(200),
            send_confirm_timeout: Duration::from_millis(20),
            send_repeat_timeout: Duration::from_millis(50),
        }
    }
}

/// [`SafeStreamConfig`] has sizes which contradict each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
pub enum ConfigError {
    /// A message can carry more data than fits in the window.
    #[display("max data size larger than window - {max_data_size} / {window_size}")]
    DataLargerThanWindow {
        /// Configured max data size.
        max_data_size: usize,
        /// Configured window size.
        window_size: usize,
    },
    /// More data can be in flight than the buffer holds.
    #[display("window larger than buffer - {window_size} / {buffer_capacity}")]
    WindowLargerThanBuffer {
        /// Configured window size.
        window_size: usize,
        /// Configured buffer capacity.
        buffer_capacity: usize,
    },
    /// The window or buffer covers more than half of the offset ring.
    #[display("size exceeds half of the offset ring - {size} / {}", MAX_WINDOW_SIZE)]
    TooLargeForRing {
        /// Offending size.
        size: usize,
    },
    /// Messages could carry no data.
    #[display("max data size is zero")]
    ZeroDataSize,
}

impl SafeStreamConfig {
    /// Sets [`SafeStreamConfig::buffer_capacity`].
    #[must_use]
    pub const fn with_buffer_capacity(mut self, buffer_capacity: usize) -> Self {
        self.buffer_capacity = buffer_capacity;
        self
    }

    /// Sets [`SafeStreamConfig::window_size`].
    #[must_use]
    pub const fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    /// Sets [`SafeStreamConfig::max_data_size`].
    #[must_use]
    pub const fn with_max_data_size(mut self, max_data_size: usize) -> Self {
        self.max_data_size = max_data_size;
        self
    }

    /// Sets [`SafeStreamConfig::max_repeat_count`].
    #[must_use]
    pub const fn with_max_repeat_count(mut self, max_repeat_count: u16) -> Self {
        self.max_repeat_count = max_repeat_count;
        self
    }

    /// Sets [`SafeStreamConfig::wait_confirm_timeout`].
    #[must_use]
    pub const fn with_wait_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.wait_confirm_timeout = timeout;
        self
    }

    /// Sets [`SafeStreamConfig::send_confirm_timeout`].
    #[must_use]
    pub const fn with_send_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.send_confirm_timeout = timeout;
        self
    }

    /// Sets [`SafeStreamConfig::send_repeat_timeout`].
    #[must_use]
    pub const fn with_send_repeat_timeout(mut self, timeout: Duration) -> Self {
        self.send_repeat_timeout = timeout;
        self
    }

    /// Checks that `max_data_size <= window_size <= buffer_capacity`, and that
    /// the window fits in half of the offset ring.
    ///
    /// # Errors
    ///
    /// Errors if any of the sizes contradict each other.
    ///
    /// # Example
    ///
    /// ```
    /// # use aether_proto::config::{ConfigError, SafeStreamConfig};
    /// assert!(SafeStreamConfig::default().validate().is_ok());
    ///
    /// let config = SafeStreamConfig::default().with_window_size(100).with_max_data_size(200);
    /// assert!(matches!(config.validate(), Err(ConfigError::DataLargerThanWindow { .. })));
    /// ```
    pub const fn validate(&self) -> Result<(), ConfigError> {
        if self.max_data_size == 0 {
            return Err(ConfigError::ZeroDataSize);
        }
        if self.max_data_size > self.window_size {
            return Err(ConfigError::DataLargerThanWindow {
                max_data_size: self.max_data_size,
                window_size: self.window_size,
            });
        }
        if self.window_size > self.buffer_capacity {
            return Err(ConfigError::WindowLargerThanBuffer {
                window_size: self.window_size,
                buffer_capacity: self.buffer_capacity,
            });
        }
        if self.buffer_capacity > MAX_WINDOW_SIZE {
            return Err(ConfigError::TooLargeForRing {
                size: self.buffer_capacity,
            });
        }
        Ok(())
    }
}
