use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex;
use embassy_time::Instant;
use embedded_io_async::{Read, Write};
use portable_atomic::{AtomicU32, Ordering};

use super::runner::Runner;
use super::state::{Ingress, RxBuffer};
use super::transaction::{Session, Transaction};
use super::urc::{Callback, UrcTable};
use crate::config::Config;
use crate::error::{DeviceError, Error};
use crate::fmt::LossyStr;
use crate::params::Params;

/// Callbacks that may be waiting to run at any time.
pub const CALLBACK_QUEUE_DEPTH: usize = 16;

/// Byte transform applied to everything sent or received on the stream.
///
/// Used to wrap the AT channel in a framing protocol, see `edm::EdmTx` and
/// `edm::EdmRx`.
///
/// On the receive side `transform` runs inside the runner's read loop with
/// the intercept locked, so it must not call out to user code. Work for user
/// code is handed back through [`Intercept::take_callback`] and runs on the
/// callback loop.
pub trait Intercept<'d> {
    /// Transforms `data`, appending the result to `out`. Implementations may
    /// hold bytes back until enough arrived to produce output.
    fn transform(&mut self, data: &[u8], out: &mut Vec<u8>);

    /// Next callback produced by `transform`. Only polled on the receive
    /// side, right after every `transform`.
    fn take_callback(&mut self) -> Option<Callback<'d>> {
        None
    }
}

impl<'d, F> Intercept<'d> for F
where
    F: FnMut(&[u8], &mut Vec<u8>),
{
    fn transform(&mut self, data: &[u8], out: &mut Vec<u8>) {
        self(data, out)
    }
}

pub(crate) type BoxedIntercept<'d> = Box<dyn Intercept<'d> + Send + 'd>;

type TimeoutCallback<'d> = Arc<dyn Fn(u32) + Send + Sync + 'd>;

/// AT client bound to one byte stream.
///
/// The write half is owned by the client, the read half is handed to the
/// [`Runner`], which must be polled for the client to make progress:
///
/// ```ignore
/// let client = AtClient::<NoopRawMutex, _, 1024>::new(tx, Config::default());
/// let mut runner = client.runner(rx);
/// select(runner.run(), async {
///     let mut t = client.lock().await;
///     t.command_start(Some("AT+CGMR")).await?;
///     t.command_stop().await?;
///     ...
///     t.unlock()
/// })
/// .await;
/// ```
///
/// `N` sizes both the ingress buffer and the receive buffer. Any single
/// response line or URC must fit into it.
pub struct AtClient<'d, M: RawMutex, W: Write, const N: usize> {
    pub(crate) inner: Mutex<M, Inner<'d, W, N>>,
    pub(crate) ingress: Ingress<M, N>,
    pub(crate) callbacks: Channel<M, Callback<'d>, CALLBACK_QUEUE_DEPTH>,
    pub(crate) intercept_rx: BlockingMutex<M, RefCell<Option<BoxedIntercept<'d>>>>,
    pub(crate) consecutive_timeouts: AtomicU32,
}

pub(crate) struct Inner<'d, W, const N: usize> {
    pub(crate) writer: W,
    pub(crate) rx: RxBuffer<N>,
    pub(crate) config: Config,
    pub(crate) urcs: UrcTable<'d>,
    pub(crate) device_error: DeviceError,
    pub(crate) intercept_tx: Option<BoxedIntercept<'d>>,
    pub(crate) timeout_callback: Option<TimeoutCallback<'d>>,
    /// When the previous transaction ended, for inter-command spacing.
    pub(crate) last_response: Option<Instant>,
    pub(crate) session: Session,
}

impl<'d, W: Write, const N: usize> Inner<'d, W, N> {
    /// Writes `data` to the stream through the transmit intercept.
    pub(crate) async fn write_out(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.config.print_at {
            info!("[AT] > {:?}", LossyStr(data));
        }

        let res = match self.intercept_tx.as_mut() {
            Some(intercept) => {
                let mut framed = Vec::with_capacity(data.len() + 8);
                intercept.transform(data, &mut framed);
                self.writer.write_all(&framed).await
            }
            None => self.writer.write_all(data).await,
        };
        res.map_err(|_| Error::Write)?;
        self.writer.flush().await.map_err(|_| Error::Write)
    }
}

impl<'d, M: RawMutex, W: Write, const N: usize> AtClient<'d, M, W, N> {
    pub fn new(writer: W, config: Config) -> Self {
        Self {
            inner: Mutex::new(Inner {
                writer,
                rx: RxBuffer::new(),
                config,
                urcs: UrcTable::new(),
                device_error: DeviceError::ok(),
                intercept_tx: None,
                timeout_callback: None,
                last_response: None,
                session: Session::new(),
            }),
            ingress: Ingress::new(),
            callbacks: Channel::new(),
            intercept_rx: BlockingMutex::new(RefCell::new(None)),
            consecutive_timeouts: AtomicU32::new(0),
        }
    }

    /// Background runner reading from `reader`. Must be run for the client to
    /// receive anything.
    pub fn runner<R: Read>(&self, reader: R) -> Runner<'_, 'd, M, W, R, N> {
        Runner::new(self, reader)
    }

    /// Takes exclusive use of the client for one command/response exchange.
    pub async fn lock(&self) -> Transaction<'_, 'd, M, W, N> {
        let mut inner = self.inner.lock().await;
        inner.session.reset();
        Transaction::new(self, inner)
    }

    /// Registers `handler` for lines starting with `prefix`. Registering the
    /// same prefix again replaces the handler.
    ///
    /// The handler runs with the client locked and may only parse the line.
    /// To talk to the module in reaction to a URC, return a callback.
    pub async fn set_urc_handler<F>(&self, prefix: &'d str, handler: F)
    where
        F: FnMut(&mut Params<'_>) -> Result<Option<Callback<'d>>, Error> + Send + 'd,
    {
        self.inner.lock().await.urcs.set(prefix, Box::new(handler));
    }

    pub async fn remove_urc_handler(&self, prefix: &str) -> bool {
        self.inner.lock().await.urcs.remove(prefix)
    }

    /// Queues `callback` to run on the runner's callback loop.
    pub fn defer(&self, callback: impl FnOnce() + Send + 'd) -> Result<(), Error> {
        self.callbacks
            .try_send(Box::new(callback))
            .map_err(|_| Error::Overflow)
    }

    pub(crate) fn queue(&self, callback: Callback<'d>) {
        if self.callbacks.try_send(callback).is_err() {
            warn!("Callback queue full, dropping callback");
        }
    }

    pub async fn config(&self) -> Config {
        self.inner.lock().await.config
    }

    pub async fn timeout_ms(&self) -> u32 {
        self.inner.lock().await.config.timeout_ms
    }

    pub async fn set_timeout_ms(&self, timeout_ms: u32) {
        self.inner.lock().await.config.timeout_ms = timeout_ms;
    }

    pub async fn delay_ms(&self) -> u32 {
        self.inner.lock().await.config.delay_ms
    }

    pub async fn set_delay_ms(&self, delay_ms: u32) {
        self.inner.lock().await.config.delay_ms = delay_ms;
    }

    pub async fn delimiter(&self) -> u8 {
        self.inner.lock().await.config.delimiter
    }

    pub async fn set_delimiter(&self, delimiter: u8) {
        self.inner.lock().await.config.delimiter = delimiter;
    }

    pub async fn debug(&self) -> bool {
        self.inner.lock().await.config.debug
    }

    pub async fn set_debug(&self, on: bool) {
        self.inner.lock().await.config.debug = on;
    }

    pub async fn print_at(&self) -> bool {
        self.inner.lock().await.config.print_at
    }

    pub async fn set_print_at(&self, on: bool) {
        self.inner.lock().await.config.print_at = on;
    }

    /// Outcome of the most recent final result line.
    pub async fn device_error(&self) -> DeviceError {
        self.inner.lock().await.device_error
    }

    /// Timeouts since the last exchange that got a final result.
    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts.load(Ordering::Relaxed)
    }

    /// Called, via the callback queue, with the running count after every
    /// timeout.
    pub async fn set_timeout_callback(&self, callback: impl Fn(u32) + Send + Sync + 'd) {
        self.inner.lock().await.timeout_callback = Some(Arc::new(callback));
    }

    pub async fn clear_timeout_callback(&self) {
        self.inner.lock().await.timeout_callback = None;
    }

    pub async fn set_intercept_tx(&self, intercept: impl Intercept<'d> + Send + 'd) {
        self.inner.lock().await.intercept_tx = Some(Box::new(intercept));
    }

    pub async fn clear_intercept_tx(&self) {
        self.inner.lock().await.intercept_tx = None;
    }

    /// Installs a transform on received bytes. Applies to bytes read after
    /// this call.
    pub fn set_intercept_rx(&self, intercept: impl Intercept<'d> + Send + 'd) {
        self.intercept_rx
            .lock(|slot| *slot.borrow_mut() = Some(Box::new(intercept)));
    }

    pub fn clear_intercept_rx(&self) {
        self.intercept_rx.lock(|slot| *slot.borrow_mut() = None);
    }

    /// Writes `parts` back to back, bypassing the transmit intercept.
    ///
    /// Waits for any ongoing transaction, so frames never interleave with a
    /// command.
    pub async fn write_raw(&self, parts: &[&[u8]]) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        for part in parts {
            inner.writer.write_all(part).await.map_err(|_| Error::Write)?;
        }
        inner.writer.flush().await.map_err(|_| Error::Write)
    }

    /// Discards all received but unprocessed bytes.
    pub async fn flush(&self) {
        let mut inner = self.inner.lock().await;
        inner.rx.clear();
        self.ingress.clear();
    }
}
