/// The kind of failure the module reported in its final result line.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceErrorKind {
    /// The last exchange ended in `OK`.
    #[default]
    None,
    /// Plain `ERROR`.
    Error,
    /// `+CME ERROR: <n>`
    Cme,
    /// `+CMS ERROR: <n>`
    Cms,
    /// `ABORTED`
    Aborted,
}

/// Outcome recorded by `response_stop`, overwritten by every exchange.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceError {
    pub kind: DeviceErrorKind,
    /// Numeric code of a `+CME`/`+CMS` error, 0 otherwise or when the module
    /// is in verbose error mode.
    pub code: i32,
}

impl DeviceError {
    pub const fn ok() -> Self {
        Self {
            kind: DeviceErrorKind::None,
            code: 0,
        }
    }

    pub const fn is_ok(&self) -> bool {
        matches!(self.kind, DeviceErrorKind::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The expected bytes did not arrive within the configured timeout.
    Timeout,
    /// Expected prefix, delimiter, terminator or value format not found.
    Parse,
    /// The module actively reported a failure.
    Device(DeviceError),
    /// A buffer (receive buffer, caller output buffer, callback queue) is full.
    Overflow,
    /// Caller misuse, e.g. an oversize EDM payload.
    InvalidParameter,
    /// Writing to the underlying stream failed.
    Write,
    /// Reading from the underlying stream failed.
    Read,
}

impl Error {
    /// Negative status code for callers that bridge to integer error codes.
    pub const fn code(&self) -> i32 {
        match self {
            Error::Timeout => -1,
            Error::Parse => -2,
            Error::Device(e) => match e.kind {
                DeviceErrorKind::None => 0,
                DeviceErrorKind::Error => -3,
                DeviceErrorKind::Cme => -4,
                DeviceErrorKind::Cms => -5,
                DeviceErrorKind::Aborted => -6,
            },
            Error::Overflow => -7,
            Error::InvalidParameter => -8,
            Error::Write => -9,
            Error::Read => -10,
        }
    }
}

impl From<DeviceError> for Error {
    fn from(e: DeviceError) -> Self {
        Error::Device(e)
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Timeout => f.write_str("timed out waiting for the module"),
            Error::Parse => f.write_str("unexpected response format"),
            Error::Device(e) => write!(f, "module reported {:?} ({})", e.kind, e.code),
            Error::Overflow => f.write_str("buffer overflow"),
            Error::InvalidParameter => f.write_str("invalid parameter"),
            Error::Write => f.write_str("stream write failed"),
            Error::Read => f.write_str("stream read failed"),
        }
    }
}
