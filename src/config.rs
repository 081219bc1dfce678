use serde::{Deserialize, Serialize};

/// Per-instance defaults of an [`AtClient`](crate::asynch::AtClient).
///
/// Every value can also be changed at runtime through the accessors on the
/// client; the timeout can additionally be overridden for one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    pub(crate) timeout_ms: u32,
    pub(crate) delay_ms: u32,
    pub(crate) delimiter: u8,
    pub(crate) debug: bool,
    pub(crate) print_at: bool,
    pub(crate) urc_guard: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub const fn new() -> Self {
        Self {
            timeout_ms: 8000,
            delay_ms: 25,
            delimiter: b',',
            debug: false,
            print_at: false,
            urc_guard: 128,
        }
    }

    /// Time each blocking read may wait for the module. Must exceed any idle
    /// delay the module needs before its first response byte.
    #[must_use]
    pub const fn timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Minimum spacing between the end of one response and the next command.
    #[must_use]
    pub const fn delay_ms(mut self, delay_ms: u32) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    #[must_use]
    pub const fn delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Log parser internals.
    #[must_use]
    pub const fn debug(mut self, on: bool) -> Self {
        self.debug = on;
        self
    }

    /// Log every command sent and every line received.
    #[must_use]
    pub const fn print_at(mut self, on: bool) -> Self {
        self.print_at = on;
        self
    }

    /// Bytes of unrecognised data the URC dispatcher keeps buffered before
    /// discarding them to resynchronise.
    #[must_use]
    pub const fn urc_guard(mut self, bytes: usize) -> Self {
        self.urc_guard = bytes;
        self
    }
}
