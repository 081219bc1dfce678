mod client;
mod runner;
pub(crate) mod state;
mod transaction;
mod urc;

pub use client::{AtClient, Intercept, CALLBACK_QUEUE_DEPTH};
pub use runner::Runner;
pub use transaction::Transaction;
pub use urc::{Callback, UrcHandler};
