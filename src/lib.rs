#![cfg_attr(not(test), no_std)]
#![allow(async_fn_in_trait)]

extern crate alloc;

mod fmt;

pub mod asynch;
pub mod config;
#[cfg(feature = "edm")]
pub mod edm;
pub mod error;
pub mod params;

#[cfg(test)]
mod test_helpers;

pub use asynch::{AtClient, Callback, Intercept, Runner, Transaction};
pub use config::Config;
pub use error::{DeviceError, DeviceErrorKind, Error};
pub use params::Params;
