use alloc::vec::Vec;
use core::fmt::Write as _;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::MutexGuard;
use embassy_time::{with_timeout, Duration, Timer};
use embedded_io_async::Write;
use portable_atomic::Ordering;

use super::client::{AtClient, Inner};
use super::urc::{prefix_match, UrcMatch, UrcTable};
use crate::error::{DeviceError, DeviceErrorKind, Error};
use crate::fmt::LossyStr;
use crate::params::{parse_int, Params, QUOTE, STOP_TAG};

/// Final result lines, and whether a numeric code follows.
const FINAL_RESULTS: [(&[u8], DeviceErrorKind, bool); 5] = [
    (b"OK\r\n", DeviceErrorKind::None, false),
    (b"ERROR\r\n", DeviceErrorKind::Error, false),
    (b"ABORTED\r\n", DeviceErrorKind::Aborted, false),
    (b"+CME ERROR:", DeviceErrorKind::Cme, true),
    (b"+CMS ERROR:", DeviceErrorKind::Cms, true),
];

/// Per-transaction state, reset at lock and unlock.
pub(crate) struct Session {
    /// First failure of the transaction. Later operations are no-ops.
    error: Option<Error>,
    /// Command being assembled, flushed at `command_stop`.
    tx: Vec<u8>,
    command_open: bool,
    raw_command: bool,
    first_param: bool,
    in_response: bool,
    /// The final result arrived where information text was expected.
    no_info: bool,
    stop_hit: bool,
    ignore_stop_tag: bool,
    timeout_ms: Option<u32>,
}

impl Session {
    pub(crate) const fn new() -> Self {
        Self {
            error: None,
            tx: Vec::new(),
            command_open: false,
            raw_command: false,
            first_param: true,
            in_response: false,
            no_info: false,
            stop_hit: false,
            ignore_stop_tag: false,
            timeout_ms: None,
        }
    }

    pub(crate) fn reset(&mut self) {
        let mut tx = core::mem::take(&mut self.tx);
        tx.clear();
        *self = Self { tx, ..Self::new() };
    }
}

enum Want<'p> {
    Prefix(&'p [u8]),
    Data,
    Final,
}

enum Line {
    /// Information text starts after this many bytes.
    Wanted(usize),
    /// Final result spanning this many bytes.
    Final(DeviceError, usize),
    Urc { index: usize, prefix_len: usize },
    Other,
}

enum FinalMatch {
    Yes(DeviceError, usize),
    Undecided,
    No,
}

/// Exclusive use of an [`AtClient`] for one command/response exchange.
///
/// Failures are sticky: after the first error every further operation
/// returns it without touching the stream, and [`Transaction::unlock`]
/// reports it. Callers can therefore chain the whole exchange and only check
/// the result of `unlock`.
pub struct Transaction<'a, 'd, M: RawMutex, W: Write, const N: usize> {
    client: &'a AtClient<'d, M, W, N>,
    inner: MutexGuard<'a, M, Inner<'d, W, N>>,
}

impl<'a, 'd, M: RawMutex, W: Write, const N: usize> Transaction<'a, 'd, M, W, N> {
    pub(crate) fn new(
        client: &'a AtClient<'d, M, W, N>,
        inner: MutexGuard<'a, M, Inner<'d, W, N>>,
    ) -> Self {
        Self { client, inner }
    }

    /// Error recorded so far, if any.
    pub fn error(&self) -> Option<Error> {
        self.inner.session.error
    }

    /// Overrides the read timeout for the rest of this transaction.
    pub fn set_timeout_ms(&mut self, timeout_ms: u32) {
        self.inner.session.timeout_ms = Some(timeout_ms);
    }

    /// Starts a command. `None` starts raw mode, where nothing is added to
    /// the written bytes, not even the terminating `\r`.
    ///
    /// Waits until the configured delay has passed since the previous
    /// response.
    pub async fn command_start(&mut self, command: Option<&str>) -> Result<(), Error> {
        self.check()?;

        let inner = &mut *self.inner;
        if let Some(last) = inner.last_response {
            Timer::at(last + Duration::from_millis(u64::from(inner.config.delay_ms))).await;
        }

        let session = &mut inner.session;
        session.tx.clear();
        session.command_open = true;
        session.raw_command = command.is_none();
        session.first_param = true;
        if let Some(command) = command {
            session.tx.extend_from_slice(command.as_bytes());
        }
        Ok(())
    }

    pub async fn write_int(&mut self, value: i32) -> Result<(), Error> {
        let mut s = heapless::String::<12>::new();
        let res = write!(s, "{}", value).map_err(|_| Error::Overflow);
        self.write_param(res.map(|_| s.as_bytes()), true).await
    }

    pub async fn write_u64(&mut self, value: u64) -> Result<(), Error> {
        let mut s = heapless::String::<20>::new();
        let res = write!(s, "{}", value).map_err(|_| Error::Overflow);
        self.write_param(res.map(|_| s.as_bytes()), true).await
    }

    /// Writes a string parameter, in double quotes if `quoted`.
    pub async fn write_string(&mut self, value: &str, quoted: bool) -> Result<(), Error> {
        self.check()?;
        self.delimit();
        if quoted {
            self.push(b"\"").await?;
            self.push(value.as_bytes()).await?;
            self.push(b"\"").await
        } else {
            self.push(value.as_bytes()).await
        }
    }

    /// Writes `data` unmodified. A `standalone` write is not preceded by a
    /// delimiter and does not count as a parameter.
    pub async fn write_bytes(&mut self, data: &[u8], standalone: bool) -> Result<(), Error> {
        self.write_param(Ok(data), !standalone).await
    }

    /// Appends to the command without a delimiter or quotes, e.g. to build up
    /// a parameter from several pieces.
    pub async fn write_partial_string(&mut self, value: &str) -> Result<(), Error> {
        self.write_param(Ok(value.as_bytes()), false).await
    }

    async fn write_param(&mut self, data: Result<&[u8], Error>, delimit: bool) -> Result<(), Error> {
        self.check()?;
        let data = self.record(data)?;
        if delimit {
            self.delimit();
        }
        self.push(data).await
    }

    fn delimit(&mut self) {
        let delimiter = self.inner.config.delimiter;
        let session = &mut self.inner.session;
        if session.command_open && !session.first_param {
            session.tx.push(delimiter);
        }
        session.first_param = false;
    }

    /// Appends to the open command, or writes straight out when none is open.
    async fn push(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.inner.session.command_open {
            self.inner.session.tx.extend_from_slice(data);
            return Ok(());
        }
        let res = self.inner.write_out(data).await;
        self.record(res)
    }

    /// Terminates the command with `\r`, unless in raw mode, and sends it.
    pub async fn command_stop(&mut self) -> Result<(), Error> {
        self.check()?;

        let inner = &mut *self.inner;
        if !inner.session.command_open {
            return Ok(());
        }
        if !inner.session.raw_command {
            inner.session.tx.push(b'\r');
        }
        inner.session.command_open = false;

        let tx = core::mem::take(&mut inner.session.tx);
        let res = inner.write_out(&tx).await;
        inner.session.tx = tx;
        self.record(res)
    }

    /// Sends the command and expects nothing but a final result back.
    pub async fn command_stop_read_response(&mut self) -> Result<(), Error> {
        self.command_stop().await?;
        self.response_start(None).await?;
        self.response_stop().await
    }

    /// Waits for the information text starting with `prefix`, or for any
    /// information text when `prefix` is `None`.
    ///
    /// Calling this again moves on to the next line. URCs arriving meanwhile
    /// are dispatched, other lines are discarded. If the final result arrives
    /// first this still succeeds, but reads fail until `response_stop`.
    pub async fn response_start(&mut self, prefix: Option<&str>) -> Result<(), Error> {
        self.check()?;
        let res = self.find_response(prefix.map(str::as_bytes)).await;
        self.record(res)
    }

    async fn find_response(&mut self, prefix: Option<&[u8]>) -> Result<(), Error> {
        if self.inner.session.in_response && !self.inner.session.no_info {
            self.discard_line().await?;
        }
        let session = &mut self.inner.session;
        session.in_response = true;
        session.stop_hit = false;
        session.no_info = false;

        let want = match prefix {
            Some(prefix) => Want::Prefix(prefix),
            None => Want::Data,
        };
        loop {
            match self.next_line(&want).await? {
                Line::Wanted(len) => {
                    if self.inner.config.debug {
                        debug!("Response {:?}", LossyStr(&self.inner.rx.data()[..len]));
                    }
                    self.inner.rx.consume(len);
                    return Ok(());
                }
                Line::Final(..) => {
                    self.inner.session.no_info = true;
                    return Ok(());
                }
                Line::Urc { index, prefix_len } => self.handle_urc(index, prefix_len).await?,
                Line::Other => self.discard_line().await?,
            }
        }
    }

    /// Skips the rest of the response up to and including the final result.
    ///
    /// An `ERROR`, `+CME ERROR`, `+CMS ERROR` or `ABORTED` result fails the
    /// transaction with [`Error::Device`].
    pub async fn response_stop(&mut self) -> Result<(), Error> {
        self.check()?;
        let res = self.find_final().await;
        self.record(res)
    }

    async fn find_final(&mut self) -> Result<(), Error> {
        if self.inner.session.ignore_stop_tag {
            warn!("Response stop while the stop tag is ignored");
            self.inner.session.ignore_stop_tag = false;
        }
        if self.inner.session.in_response && !self.inner.session.no_info {
            self.discard_line().await?;
        }
        let session = &mut self.inner.session;
        session.in_response = false;
        session.stop_hit = false;
        session.no_info = false;

        loop {
            match self.next_line(&Want::Final).await? {
                Line::Final(outcome, len) => {
                    if self.inner.config.print_at {
                        info!("[AT] < {:?}", LossyStr(&self.inner.rx.data()[..len]));
                    }
                    self.inner.rx.consume(len);
                    self.inner.device_error = outcome;
                    self.client.consecutive_timeouts.store(0, Ordering::Relaxed);
                    return match outcome.is_ok() {
                        true => Ok(()),
                        false => Err(Error::Device(outcome)),
                    };
                }
                Line::Urc { index, prefix_len } => self.handle_urc(index, prefix_len).await?,
                Line::Wanted(_) | Line::Other => self.discard_line().await?,
            }
        }
    }

    /// Waits for the single character `c`, e.g. the `>` prompt of a data
    /// write. Dispatches URCs and drops anything else on the way.
    pub async fn wait_character(&mut self, c: u8) -> Result<(), Error> {
        self.check()?;
        let res = self.find_character(c).await;
        self.record(res)
    }

    async fn find_character(&mut self, c: u8) -> Result<(), Error> {
        let mut line_start = true;
        loop {
            let Some(&first) = self.inner.rx.data().first() else {
                self.fill().await?;
                continue;
            };
            if first == c {
                self.inner.rx.consume(1);
                return Ok(());
            }

            if line_start && first != b'\r' && first != b'\n' {
                let data = self.inner.rx.data();
                let found = self.inner.urcs.find(data, find_stop_tag(data).is_some());
                match found {
                    UrcMatch::Found { index, prefix_len } => {
                        self.handle_urc(index, prefix_len).await?;
                        continue;
                    }
                    UrcMatch::Undecided => {
                        self.fill().await?;
                        continue;
                    }
                    UrcMatch::None => {}
                }
            }
            line_start = first == b'\n';
            self.inner.rx.consume(1);
        }
    }

    pub async fn read_int(&mut self) -> Result<i32, Error> {
        self.read_with(|p| p.read_int()).await
    }

    pub async fn read_u64(&mut self) -> Result<u64, Error> {
        self.read_with(|p| p.read_u64()).await
    }

    /// Reads a string parameter into `out`, or discards it when `out` is
    /// `None`. Returns the length of the value.
    pub async fn read_string(&mut self, mut out: Option<&mut [u8]>) -> Result<usize, Error> {
        self.read_with(|p| p.read_string(out.as_deref_mut())).await
    }

    /// Reads `len` raw bytes into `out`, or discards them when `out` is
    /// `None`. A `standalone` read does not consume a delimiter or count as a
    /// parameter.
    pub async fn read_bytes(
        &mut self,
        mut out: Option<&mut [u8]>,
        len: usize,
        standalone: bool,
    ) -> Result<usize, Error> {
        self.read_with(|p| p.read_bytes(out.as_deref_mut(), len, standalone))
            .await
    }

    /// Reads the rest of the current line.
    pub async fn read_line(&mut self, mut out: Option<&mut [u8]>) -> Result<usize, Error> {
        self.read_with(|p| p.read_line(out.as_deref_mut())).await
    }

    pub async fn skip_parameters(&mut self, count: usize) -> Result<(), Error> {
        self.read_with(|p| p.skip_parameters(count)).await
    }

    /// Skips `count` raw bytes of the current line.
    pub async fn skip_bytes(&mut self, count: usize) -> Result<usize, Error> {
        self.read_with(|p| p.skip_bytes(count)).await
    }

    /// Treats `\r\n` as data until [`Transaction::restore_stop_tag`], for
    /// binary payloads. Must be restored before `response_stop`.
    pub fn ignore_stop_tag(&mut self) {
        self.inner.session.ignore_stop_tag = true;
    }

    pub fn restore_stop_tag(&mut self) {
        self.inner.session.ignore_stop_tag = false;
    }

    /// Ends the transaction, reporting the first error it ran into.
    pub fn unlock(mut self) -> Result<(), Error> {
        let inner = &mut *self.inner;
        let result = match inner.session.error {
            Some(e) => Err(e),
            None => Ok(()),
        };

        if result == Err(Error::Timeout) {
            // Whatever arrives late belongs to the failed exchange.
            inner.rx.clear();
        }
        inner.session.reset();
        inner.last_response = Some(embassy_time::Instant::now());

        if !inner.rx.is_empty() {
            self.client.ingress.kick();
        }
        result
    }

    async fn read_with<T>(
        &mut self,
        mut read: impl FnMut(&mut Params<'_>) -> Result<T, Error>,
    ) -> Result<T, Error> {
        self.check()?;
        if self.inner.session.no_info {
            return Err(Error::Parse);
        }

        loop {
            let inner = &mut *self.inner;
            let mut params = Params::new(
                inner.rx.data(),
                inner.config.delimiter,
                inner.session.ignore_stop_tag,
                inner.session.stop_hit,
            );
            match read(&mut params) {
                Ok(value) => {
                    let (consumed, stop_hit) = (params.consumed(), params.stop_hit());
                    inner.rx.consume(consumed);
                    inner.session.stop_hit = stop_hit;
                    return Ok(value);
                }
                Err(_) if params.incomplete() => {
                    let res = self.fill().await;
                    self.record(res)?;
                }
                Err(e) => return self.record(Err(e)),
            }
        }
    }

    /// Returns the next classified line, skipping empty ones.
    async fn next_line(&mut self, want: &Want<'_>) -> Result<Line, Error> {
        loop {
            let skip = leading_terminators(self.inner.rx.data());
            self.inner.rx.consume(skip);

            let inner = &*self.inner;
            if !inner.rx.is_empty() {
                if let Some(line) = classify(inner.rx.data(), want, &inner.urcs) {
                    return Ok(line);
                }
            }
            self.fill().await?;
        }
    }

    /// Drops the rest of the current line, terminator included.
    async fn discard_line(&mut self) -> Result<(), Error> {
        loop {
            let data = self.inner.rx.data();
            if let Some(end) = find_stop_tag(data) {
                if self.inner.config.debug && end > 0 {
                    debug!("Skipping {:?}", LossyStr(&data[..end]));
                }
                self.inner.rx.consume(end + STOP_TAG.len());
                return Ok(());
            }
            // A trailing '\r' may pair with the next byte.
            let keep = usize::from(data.last() == Some(&b'\r'));
            let n = data.len() - keep;
            self.inner.rx.consume(n);
            self.fill().await?;
        }
    }

    async fn handle_urc(&mut self, index: usize, prefix_len: usize) -> Result<(), Error> {
        let end = loop {
            if let Some(end) = find_line_end(self.inner.rx.data()) {
                break end;
            }
            self.fill().await?;
        };
        self.dispatch_line(index, prefix_len, end);
        Ok(())
    }

    fn dispatch_line(&mut self, index: usize, prefix_len: usize, end: usize) {
        let inner = &mut *self.inner;
        let len = end + STOP_TAG.len();
        let line = &inner.rx.data()[..len];
        if inner.config.print_at {
            info!("[AT] < {:?}", LossyStr(&line[..end]));
        }

        let callback = inner
            .urcs
            .dispatch(index, &line[prefix_len..], inner.config.delimiter);
        inner.rx.consume(len);
        if let Some(callback) = callback {
            self.client.queue(callback);
        }
    }

    /// Dispatches every complete URC line buffered while no transaction ran.
    ///
    /// Never waits: partial lines stay buffered until more bytes arrive.
    /// Unclaimed ones are dropped once they outgrow the configured guard, a
    /// partial URC only once it fills the receive buffer.
    pub(crate) fn dispatch_urcs(&mut self) {
        loop {
            self.client.ingress.take_into(&mut self.inner.rx);
            let skip = leading_terminators(self.inner.rx.data());
            self.inner.rx.consume(skip);

            let inner = &*self.inner;
            if inner.rx.is_empty() {
                return;
            }
            let data = inner.rx.data();
            let line_end = find_stop_tag(data);

            match inner.urcs.find(data, line_end.is_some()) {
                UrcMatch::Found { index, prefix_len } => {
                    if let Some(end) = find_line_end(data) {
                        self.dispatch_line(index, prefix_len, end);
                        continue;
                    }
                    // A registered URC is waited for regardless of the guard.
                    if self.inner.rx.is_full() {
                        warn!("Dropping URC that does not fit the receive buffer");
                        self.inner.rx.clear();
                    }
                    return;
                }
                UrcMatch::None => {
                    if let Some(end) = line_end {
                        debug!("Dropping unsolicited line {:?}", LossyStr(&data[..end]));
                        self.inner.rx.consume(end + STOP_TAG.len());
                        continue;
                    }
                }
                UrcMatch::Undecided => {}
            }

            // Partial line nobody claimed yet
            let len = self.inner.rx.len();
            if len >= self.inner.config.urc_guard || self.inner.rx.is_full() {
                warn!("Dropping {} unrecognised bytes", len);
                self.inner.rx.clear();
            }
            return;
        }
    }

    /// Waits for more bytes from the runner.
    async fn fill(&mut self) -> Result<(), Error> {
        let inner = &mut *self.inner;
        inner.rx.compact();
        if inner.rx.is_full() {
            return Err(Error::Overflow);
        }

        let timeout = inner.session.timeout_ms.unwrap_or(inner.config.timeout_ms);
        with_timeout(
            Duration::from_millis(u64::from(timeout)),
            self.client.ingress.read_into(&mut inner.rx),
        )
        .await
        .map(|_| ())
        .map_err(|_| Error::Timeout)
    }

    fn check(&self) -> Result<(), Error> {
        match self.inner.session.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn record<T>(&mut self, res: Result<T, Error>) -> Result<T, Error> {
        if let Err(e) = &res {
            self.fail(*e);
        }
        res
    }

    /// Records the first failure of the transaction.
    fn fail(&mut self, e: Error) {
        let inner = &mut *self.inner;
        if inner.session.error.is_some() {
            return;
        }
        inner.session.error = Some(e);

        if e == Error::Timeout {
            let count = self.client.consecutive_timeouts.fetch_add(1, Ordering::Relaxed) + 1;
            warn!("Timeout waiting for the module ({} in a row)", count);
            if let Some(callback) = inner.timeout_callback.clone() {
                self.client.queue(alloc::boxed::Box::new(move || callback(count)));
            }
        } else if inner.config.debug {
            debug!("Transaction failed: {:?}", e);
        }
    }
}

fn classify(data: &[u8], want: &Want<'_>, urcs: &UrcTable<'_>) -> Option<Line> {
    let line_end = find_stop_tag(data);
    let complete = line_end.is_some();

    if let Want::Prefix(prefix) = want {
        if prefix_match(data, prefix, complete)? {
            return Some(Line::Wanted(prefix.len()));
        }
    }

    match final_result(data, line_end) {
        FinalMatch::Yes(outcome, len) => return Some(Line::Final(outcome, len)),
        FinalMatch::Undecided => return None,
        FinalMatch::No => {}
    }

    match urcs.find(data, complete) {
        UrcMatch::Found { index, prefix_len } => return Some(Line::Urc { index, prefix_len }),
        UrcMatch::Undecided => return None,
        UrcMatch::None => {}
    }

    match want {
        Want::Data => Some(Line::Wanted(0)),
        _ => Some(Line::Other),
    }
}

fn final_result(data: &[u8], line_end: Option<usize>) -> FinalMatch {
    let mut undecided = false;
    for (pattern, kind, has_code) in FINAL_RESULTS {
        match prefix_match(data, pattern, line_end.is_some()) {
            Some(true) if has_code => {
                let Some(end) = line_end else {
                    return FinalMatch::Undecided;
                };
                let code = parse_int(&data[pattern.len()..end]).unwrap_or(0);
                return FinalMatch::Yes(DeviceError { kind, code }, end + STOP_TAG.len());
            }
            Some(true) => return FinalMatch::Yes(DeviceError { kind, code: 0 }, pattern.len()),
            Some(false) => {}
            None => undecided = true,
        }
    }
    match undecided {
        true => FinalMatch::Undecided,
        false => FinalMatch::No,
    }
}

fn find_stop_tag(data: &[u8]) -> Option<usize> {
    data.windows(STOP_TAG.len()).position(|w| w == STOP_TAG)
}

/// Like [`find_stop_tag`], but skips stop tags inside quoted values. `data`
/// must start at a line or value boundary.
fn find_line_end(data: &[u8]) -> Option<usize> {
    let mut quoted = false;
    for (i, &b) in data.iter().enumerate() {
        match b {
            QUOTE => quoted = !quoted,
            b'\r' if !quoted && data.get(i + 1) == Some(&b'\n') => return Some(i),
            _ => {}
        }
    }
    None
}

fn leading_terminators(data: &[u8]) -> usize {
    data.iter()
        .take_while(|&&b| b == b'\r' || b == b'\n')
        .count()
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use embassy_futures::join::join;
    use embassy_time::{Duration, Instant, Timer};

    use super::*;
    use crate::asynch::Callback;
    use crate::config::Config;
    use crate::test_helpers::{run, Modem};

    fn config() -> Config {
        Config::new().timeout_ms(500).delay_ms(0)
    }

    #[test]
    fn reads_integer_response() {
        let modem = Modem::new();
        let client = modem.client(config());

        let (value, result) = run(&client, &modem, async {
            let (_, out) = join(
                modem.respond(b"AT+INT2\r", b"\r\n+INT: 2147483647\r\n\r\nOK\r\n"),
                async {
                    let mut t = client.lock().await;
                    t.command_start(Some("AT+INT2")).await.ok();
                    t.command_stop().await.ok();
                    t.response_start(Some("+INT:")).await.ok();
                    let value = t.read_int().await;
                    t.response_stop().await.ok();
                    (value, t.unlock())
                },
            )
            .await;
            out
        });

        assert_eq!(value, Ok(i32::MAX));
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn writes_typed_parameters() {
        let modem = Modem::new();
        let client = modem.client(config());

        let result = run(&client, &modem, async {
            let (_, result) = join(
                modem.respond(
                    b"AT+SET=-2147483648,18446744073709551615,\"quo,ted\",plain,\x00\x01\xff\r",
                    b"\r\nOK\r\n",
                ),
                async {
                    let mut t = client.lock().await;
                    t.command_start(Some("AT+SET=")).await.ok();
                    t.write_int(i32::MIN).await.ok();
                    t.write_u64(u64::MAX).await.ok();
                    t.write_string("quo,ted", true).await.ok();
                    t.write_string("plain", false).await.ok();
                    t.write_bytes(&[0x00, 0x01, 0xff], false).await.ok();
                    t.command_stop_read_response().await.ok();
                    t.unlock()
                },
            )
            .await;
            result
        });

        assert_eq!(result, Ok(()));
    }

    #[test]
    fn all_byte_values_round_trip() {
        let modem = Modem::new();
        let client = modem.client(config());
        let payload: Vec<u8> = (0..=255u8).collect();

        let mut command = b"AT+BIN=256,".to_vec();
        command.extend_from_slice(&payload);
        command.push(b'\r');
        let mut response = b"\r\n+BIN: 256,".to_vec();
        response.extend_from_slice(&payload);
        response.extend_from_slice(b"\r\nOK\r\n");

        let (read, result) = run(&client, &modem, async {
            let (_, out) = join(modem.respond(&command, &response), async {
                let mut t = client.lock().await;
                t.command_start(Some("AT+BIN=")).await.ok();
                t.write_int(256).await.ok();
                t.write_bytes(&payload, false).await.ok();
                t.command_stop().await.ok();
                t.response_start(Some("+BIN:")).await.ok();
                let len = t.read_int().await.unwrap_or(0) as usize;
                let mut read = std::vec![0u8; len];
                t.ignore_stop_tag();
                t.read_bytes(Some(&mut read), len, true).await.ok();
                t.restore_stop_tag();
                t.response_stop().await.ok();
                (read, t.unlock())
            })
            .await;
            out
        });

        assert_eq!(result, Ok(()));
        assert_eq!(read, payload);
    }

    #[test]
    fn stop_tag_is_respected_across_parameters() {
        let modem = Modem::new();
        let client = modem.client(config());

        let out = run(&client, &modem, async {
            let (_, out) = join(
                modem.respond(
                    b"AT+LINES\r",
                    b"\r\n+L: 1,\"a\r\nb\"\r\n+L: 2\r\n\r\nOK\r\n",
                ),
                async {
                    let mut t = client.lock().await;
                    t.command_start(Some("AT+LINES")).await.ok();
                    t.command_stop().await.ok();

                    t.response_start(Some("+L:")).await.ok();
                    let first = t.read_int().await;
                    let mut text = [0u8; 8];
                    let len = t.read_string(Some(&mut text)).await;
                    let quoted = len.map(|len| text[..len].to_vec());

                    t.response_start(Some("+L:")).await.ok();
                    let second = t.read_int().await;
                    // The line is exhausted, nothing of the next one leaks.
                    let past_end = t.read_int().await;
                    t.response_stop().await.ok();
                    (first, quoted, second, past_end, t.unlock())
                },
            )
            .await;
            out
        });

        assert_eq!(out.0, Ok(1));
        assert_eq!(out.1, Ok(b"a\r\nb".to_vec()));
        assert_eq!(out.2, Ok(2));
        assert_eq!(out.3, Err(Error::Parse));
        // The failed read poisoned the transaction.
        assert_eq!(out.4, Err(Error::Parse));
    }

    #[test]
    fn urcs_interleaved_with_response_are_dispatched() {
        const URC: &[u8] = b"\r\n+UEVT: -7,18446744073709551615,\"x,\r\ny\",word,AB\r\n";

        let modem = Modem::new();
        let client = modem.client(config());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut response = Vec::new();
        response.extend_from_slice(URC);
        response.extend_from_slice(b"\r\n+RSP: 1\r\n");
        response.extend_from_slice(URC);
        response.extend_from_slice(b"+RSP: 2\r\n");
        response.extend_from_slice(URC);
        response.extend_from_slice(b"\r\nOK\r\n");
        response.extend_from_slice(URC);

        let (values, result) = run(&client, &modem, async {
            let sink = seen.clone();
            client
                .set_urc_handler("+UEVT:", move |p| {
                    let a = p.read_int()?;
                    let b = p.read_u64()?;
                    let mut text = [0u8; 8];
                    let len = p.read_string(Some(&mut text))?;
                    let word = p.read_str()?.to_owned();
                    let mut raw = [0u8; 2];
                    p.read_bytes(Some(&mut raw), 2, false)?;
                    let record = (a, b, text[..len].to_vec(), word, raw);
                    let sink = sink.clone();
                    Ok(Some(Box::new(move || sink.lock().unwrap().push(record)) as Callback))
                })
                .await;

            let (_, out) = join(modem.respond(b"AT+RSP\r", &response), async {
                let mut t = client.lock().await;
                t.command_start(Some("AT+RSP")).await.ok();
                t.command_stop().await.ok();
                t.response_start(Some("+RSP:")).await.ok();
                let first = t.read_int().await;
                t.response_start(Some("+RSP:")).await.ok();
                let second = t.read_int().await;
                t.response_stop().await.ok();
                ((first, second), t.unlock())
            })
            .await;

            // The URC after OK is picked up by the idle dispatcher.
            let deadline = Instant::now() + Duration::from_secs(2);
            while seen.lock().unwrap().len() < 4 && Instant::now() < deadline {
                Timer::after_millis(5).await;
            }
            out
        });

        assert_eq!(values, (Ok(1), Ok(2)));
        assert_eq!(result, Ok(()));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        for record in seen.iter() {
            assert_eq!(
                record,
                &(-7, u64::MAX, b"x,\r\ny".to_vec(), "word".to_owned(), *b"AB")
            );
        }
    }

    #[test]
    fn device_errors_are_reported() {
        let cases: [(&[u8], DeviceError); 4] = [
            (
                b"\r\nERROR\r\n",
                DeviceError {
                    kind: DeviceErrorKind::Error,
                    code: 0,
                },
            ),
            (
                b"\r\n+CME ERROR: 10\r\n",
                DeviceError {
                    kind: DeviceErrorKind::Cme,
                    code: 10,
                },
            ),
            (
                b"\r\n+CMS ERROR: 305\r\n",
                DeviceError {
                    kind: DeviceErrorKind::Cms,
                    code: 305,
                },
            ),
            (
                b"\r\nABORTED\r\n",
                DeviceError {
                    kind: DeviceErrorKind::Aborted,
                    code: 0,
                },
            ),
        ];

        for (response, expected) in cases {
            let modem = Modem::new();
            let client = modem.client(config());

            let (result, device_error) = run(&client, &modem, async {
                let (_, result) = join(modem.respond(b"AT+FAIL\r", response), async {
                    let mut t = client.lock().await;
                    t.command_start(Some("AT+FAIL")).await.ok();
                    t.command_stop_read_response().await.ok();
                    t.unlock()
                })
                .await;
                (result, client.device_error().await)
            });

            assert_eq!(result, Err(Error::Device(expected)));
            assert_eq!(device_error, expected);
        }
    }

    #[test]
    fn final_result_in_place_of_information_text() {
        let modem = Modem::new();
        let client = modem.client(config());

        let (read, result) = run(&client, &modem, async {
            let (_, out) = join(modem.respond(b"AT+EMPTY\r", b"\r\nOK\r\n"), async {
                let mut t = client.lock().await;
                t.command_start(Some("AT+EMPTY")).await.ok();
                t.command_stop().await.ok();
                t.response_start(Some("+EMPTY:")).await.ok();
                let read = t.read_int().await;
                t.response_stop().await.ok();
                (read, t.unlock())
            })
            .await;
            out
        });

        assert_eq!(read, Err(Error::Parse));
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn timeouts_are_counted_and_reset() {
        let modem = Modem::new();
        let client = modem.client(Config::new().timeout_ms(200).delay_ms(0));
        let counts = Arc::new(Mutex::new(Vec::new()));

        let (elapsed, first, second, after_success) = run(&client, &modem, async {
            let sink = counts.clone();
            client
                .set_timeout_callback(move |count| sink.lock().unwrap().push(count))
                .await;

            let hang = || async {
                let mut t = client.lock().await;
                t.command_start(Some("AT+HANG")).await.ok();
                t.command_stop_read_response().await.ok();
                // Sticky: nothing touches the stream after the timeout.
                let again = t.read_int().await;
                assert_eq!(again, Err(Error::Timeout));
                t.unlock()
            };

            let start = Instant::now();
            let (_, first) = join(modem.expect(b"AT+HANG\r"), hang()).await;
            let elapsed = start.elapsed();
            let (_, second) = join(modem.expect(b"AT+HANG\r"), hang()).await;
            assert_eq!(client.consecutive_timeouts(), 2);

            let (_, ok) = join(modem.respond(b"AT\r", b"\r\nOK\r\n"), async {
                let mut t = client.lock().await;
                t.command_start(Some("AT")).await.ok();
                t.command_stop_read_response().await.ok();
                t.unlock()
            })
            .await;
            assert_eq!(ok, Ok(()));
            Timer::after_millis(20).await;
            (elapsed, first, second, client.consecutive_timeouts())
        });

        assert_eq!(first, Err(Error::Timeout));
        assert_eq!(second, Err(Error::Timeout));
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(400));
        assert_eq!(after_success, 0);
        assert_eq!(*counts.lock().unwrap(), [1, 2]);
    }

    #[test]
    fn transaction_timeout_override() {
        let modem = Modem::new();
        let client = modem.client(Config::new().timeout_ms(5000).delay_ms(0));

        let (elapsed, result) = run(&client, &modem, async {
            let start = Instant::now();
            let (_, result) = join(modem.expect(b"AT+SLOW\r"), async {
                let mut t = client.lock().await;
                t.set_timeout_ms(100);
                t.command_start(Some("AT+SLOW")).await.ok();
                t.command_stop_read_response().await.ok();
                t.unlock()
            })
            .await;
            (start.elapsed(), result)
        });

        assert_eq!(result, Err(Error::Timeout));
        assert!(elapsed < Duration::from_millis(1000));
    }

    #[test]
    fn prompt_and_raw_payload() {
        let modem = Modem::new();
        let client = modem.client(config());

        let result = run(&client, &modem, async {
            let modem_side = async {
                modem.expect(b"AT+WRITE=0,5\r").await;
                modem.send(b"\r\n>").await;
                modem.expect(b"hello").await;
                modem.send(b"\r\n+WRITE: 5\r\nOK\r\n").await;
            };
            let (_, result) = join(modem_side, async {
                let mut t = client.lock().await;
                t.command_start(Some("AT+WRITE=")).await.ok();
                t.write_int(0).await.ok();
                t.write_int(5).await.ok();
                t.command_stop().await.ok();
                t.wait_character(b'>').await.ok();
                t.command_start(None).await.ok();
                t.write_bytes(b"hello", true).await.ok();
                t.command_stop().await.ok();
                t.response_start(Some("+WRITE:")).await.ok();
                let written = t.read_int().await;
                t.response_stop().await.ok();
                (written, t.unlock())
            })
            .await;
            result
        });

        assert_eq!(result, (Ok(5), Ok(())));
    }

    #[test]
    fn skips_parameters_and_echo() {
        let modem = Modem::new();
        let client = modem.client(config().delimiter(b';'));

        let out = run(&client, &modem, async {
            let (_, out) = join(
                modem.respond(b"AT+MULTI\r", b"AT+MULTI\r\r\n+MULTI: 1;\"two\";3;44\r\nOK\r\n"),
                async {
                    let mut t = client.lock().await;
                    t.command_start(Some("AT+MULTI")).await.ok();
                    t.command_stop().await.ok();
                    t.response_start(Some("+MULTI:")).await.ok();
                    t.skip_parameters(2).await.ok();
                    let third = t.read_int().await;
                    let skipped = t.skip_bytes(1).await;
                    let last = t.read_int().await;
                    t.response_stop().await.ok();
                    (third, skipped, last, t.unlock())
                },
            )
            .await;
            out
        });

        assert_eq!(out, (Ok(3), Ok(1), Ok(4), Ok(())));
    }

    #[test]
    fn commands_are_spaced_by_delay() {
        let modem = Modem::new();
        let client = modem.client(Config::new().timeout_ms(500).delay_ms(100));

        let gap = run(&client, &modem, async {
            let exchange = || async {
                let (_, result) = join(modem.respond(b"AT\r", b"\r\nOK\r\n"), async {
                    let mut t = client.lock().await;
                    t.command_start(Some("AT")).await.ok();
                    t.command_stop_read_response().await.ok();
                    t.unlock()
                })
                .await;
                assert_eq!(result, Ok(()));
            };
            exchange().await;
            let start = Instant::now();
            exchange().await;
            start.elapsed()
        });

        // Measured from slightly after the first response ended.
        assert!(gap >= Duration::from_millis(95));
    }

    #[test]
    fn session_helpers() {
        let mut session = Session::new();
        session.error = Some(Error::Parse);
        session.tx.extend_from_slice(b"AT");
        session.reset();
        assert!(session.error.is_none());
        assert!(session.tx.is_empty());
        assert!(session.first_param);
        assert_eq!(leading_terminators(b"\r\n\r\nOK"), 4);
        assert_eq!(find_stop_tag(b"abc\r\n"), Some(3));
        assert_eq!(find_line_end(b" \"a\r\n\",1\r\n"), Some(8));
        assert!(matches!(
            final_result(b"+CME ERROR: 3\r\n", Some(13)),
            FinalMatch::Yes(
                DeviceError {
                    kind: DeviceErrorKind::Cme,
                    code: 3
                },
                15
            )
        ));
        assert!(matches!(final_result(b"+CME", None), FinalMatch::Undecided));
        assert!(matches!(final_result(b"+UU: 1\r\n", Some(6)), FinalMatch::No));
    }
}
