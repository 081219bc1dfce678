use alloc::vec::Vec;

use embassy_futures::join::join3;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::Timer;
use embedded_io_async::{Read, Write};

use super::client::AtClient;
use super::urc::Callback;

/// Bytes read off the stream per call.
const INGRESS_CHUNK: usize = 64;

/// Background runner of an [`AtClient`].
///
/// You must call `.run()` in a background task for the client to operate. It
/// reads the stream, dispatches URCs while the client is idle and runs
/// queued callbacks.
pub struct Runner<'a, 'd, M: RawMutex, W: Write, R: Read, const N: usize> {
    client: &'a AtClient<'d, M, W, N>,
    reader: R,
}

impl<'a, 'd, M: RawMutex, W: Write, R: Read, const N: usize> Runner<'a, 'd, M, W, R, N> {
    pub(crate) fn new(client: &'a AtClient<'d, M, W, N>, reader: R) -> Self {
        Self { client, reader }
    }

    pub async fn run(&mut self) -> ! {
        let client = self.client;
        join3(
            ingress(client, &mut self.reader),
            dispatch_urcs(client),
            run_callbacks(client),
        )
        .await;

        core::unreachable!()
    }
}

async fn ingress<'d, M: RawMutex, W: Write, R: Read, const N: usize>(
    client: &AtClient<'d, M, W, N>,
    reader: &mut R,
) -> ! {
    let mut chunk = [0u8; INGRESS_CHUNK];
    let mut transformed = Vec::new();
    let mut deferred: Vec<Callback<'d>> = Vec::new();
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(n) => n,
            Err(_) => {
                error!("Failed to read from the stream");
                Timer::after_millis(10).await;
                continue;
            }
        };
        let data = &chunk[..n];

        let intercepted = client.intercept_rx.lock(|slot| match slot.borrow_mut().as_mut() {
            Some(intercept) => {
                transformed.clear();
                intercept.transform(data, &mut transformed);
                while let Some(callback) = intercept.take_callback() {
                    deferred.push(callback);
                }
                true
            }
            None => false,
        });

        match intercepted {
            true => client.ingress.push(&transformed).await,
            false => client.ingress.push(data).await,
        }
        for callback in deferred.drain(..) {
            client.callbacks.send(callback).await;
        }
    }
}

async fn dispatch_urcs<M: RawMutex, W: Write, const N: usize>(
    client: &AtClient<'_, M, W, N>,
) -> ! {
    loop {
        client.ingress.wait_urc_work().await;
        client.lock().await.dispatch_urcs();
    }
}

async fn run_callbacks<M: RawMutex, W: Write, const N: usize>(
    client: &AtClient<'_, M, W, N>,
) -> ! {
    loop {
        let callback = client.callbacks.receive().await;
        callback();
    }
}
