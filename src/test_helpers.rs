//! In-memory module link for the async tests.

use core::convert::Infallible;
use core::future::Future;
use std::vec::Vec;

use embassy_futures::block_on;
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::pipe::Pipe;
use embedded_io_async::{ErrorType, Read, Write};

use crate::asynch::AtClient;
use crate::config::Config;
use crate::fmt::LossyStr;

const LINK_SIZE: usize = 2048;

type Link = Pipe<NoopRawMutex, LINK_SIZE>;

pub(crate) type TestClient<'d> = AtClient<'d, NoopRawMutex, LinkWriter<'d>, 512>;

pub(crate) struct LinkWriter<'a>(&'a Link);

impl ErrorType for LinkWriter<'_> {
    type Error = Infallible;
}

impl Write for LinkWriter<'_> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        Ok(self.0.write(buf).await)
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

pub(crate) struct LinkReader<'a>(&'a Link);

impl ErrorType for LinkReader<'_> {
    type Error = Infallible;
}

impl Read for LinkReader<'_> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        Ok(self.0.read(buf).await)
    }
}

/// The module end of a serial link.
pub(crate) struct Modem {
    to_host: Link,
    from_host: Link,
}

impl Modem {
    pub(crate) fn new() -> Self {
        init_log();
        Self {
            to_host: Pipe::new(),
            from_host: Pipe::new(),
        }
    }

    pub(crate) fn client(&self, config: Config) -> TestClient<'_> {
        AtClient::new(LinkWriter(&self.from_host), config)
    }

    pub(crate) fn reader(&self) -> LinkReader<'_> {
        LinkReader(&self.to_host)
    }

    /// Reads exactly `expected.len()` bytes from the host and compares.
    pub(crate) async fn expect(&self, expected: &[u8]) {
        let mut received = Vec::with_capacity(expected.len());
        let mut buf = [0u8; 64];
        while received.len() < expected.len() {
            let want = (expected.len() - received.len()).min(buf.len());
            let n = self.from_host.read(&mut buf[..want]).await;
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(
            received,
            expected,
            "host sent {:?}, expected {:?}",
            LossyStr(&received),
            LossyStr(expected)
        );
    }

    pub(crate) async fn send(&self, mut data: &[u8]) {
        while !data.is_empty() {
            let n = self.to_host.write(data).await;
            data = &data[n..];
        }
    }

    pub(crate) async fn respond(&self, command: &[u8], response: &[u8]) {
        self.expect(command).await;
        self.send(response).await;
    }
}

/// Runs `body` to completion with the client's runner in the background.
pub(crate) fn run<'d, F: Future>(client: &TestClient<'d>, modem: &Modem, body: F) -> F::Output {
    block_on(async {
        let mut runner = client.runner(modem.reader());
        match select(runner.run(), body).await {
            Either::First(never) => never,
            Either::Second(output) => output,
        }
    })
}

pub(crate) fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}
