use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_io_async::Write;

use super::types::{ChannelId, EdmEvent, OwnedEdmEvent, ParseStatus, ENDBYTE, MAX_PAYLOAD_SIZE};
use super::{at_request_header, data_header, parse};
use crate::asynch::{AtClient, Callback, Intercept};
use crate::error::Error;

type Sink<'d> = Arc<dyn Fn(OwnedEdmEvent) + Send + Sync + 'd>;

/// Receive side of an EDM link, installed with
/// [`AtClient::set_intercept_rx`].
///
/// AT confirmations and events are unwrapped into the AT byte stream. Every
/// other event is copied and delivered to `sink` on the runner's callback
/// loop, never on the read path.
pub struct EdmRx<'d> {
    pending: Vec<u8>,
    sink: Sink<'d>,
    deliveries: VecDeque<Callback<'d>>,
}

impl<'d> EdmRx<'d> {
    pub fn new(sink: impl Fn(OwnedEdmEvent) + Send + Sync + 'd) -> Self {
        Self {
            pending: Vec::new(),
            sink: Arc::new(sink),
            deliveries: VecDeque::new(),
        }
    }

    /// Feeds raw stream bytes, appending AT channel bytes to `at`. Other
    /// events wait in [`Intercept::take_callback`].
    pub fn feed(&mut self, data: &[u8], at: &mut Vec<u8>) {
        self.pending.extend_from_slice(data);

        let mut offset = 0;
        while offset < self.pending.len() {
            let parsed = parse(&self.pending[offset..]);
            offset += parsed.consumed;
            match parsed.status {
                ParseStatus::Ok => match parsed.event {
                    EdmEvent::At(payload) => at.extend_from_slice(payload),
                    event => {
                        let event = event.into_owned();
                        let sink = self.sink.clone();
                        self.deliveries.push_back(Box::new(move || sink(event)));
                    }
                },
                ParseStatus::Invalid => {
                    debug!("Dropping {} bytes outside of EDM frames", parsed.consumed)
                }
                ParseStatus::SizeError | ParseStatus::Corrupted => {
                    debug!("Resynchronising EDM stream after {:?}", parsed.status)
                }
                ParseStatus::Incomplete => break,
            }
        }
        self.pending.drain(..offset);
    }
}

impl<'d> Intercept<'d> for EdmRx<'d> {
    fn transform(&mut self, data: &[u8], out: &mut Vec<u8>) {
        self.feed(data, out)
    }

    fn take_callback(&mut self) -> Option<Callback<'d>> {
        self.deliveries.pop_front()
    }
}

/// Transmit side of an EDM link, installed with
/// [`AtClient::set_intercept_tx`]. Wraps every AT write in AT request frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct EdmTx;

impl<'d> Intercept<'d> for EdmTx {
    fn transform(&mut self, data: &[u8], out: &mut Vec<u8>) {
        for chunk in data.chunks(MAX_PAYLOAD_SIZE) {
            if let Ok(header) = at_request_header(chunk.len()) {
                out.extend_from_slice(&header);
                out.extend_from_slice(chunk);
                out.push(ENDBYTE);
            }
        }
    }
}

/// Sends `payload` on data channel `channel`, bypassing AT formatting.
pub async fn send_data<M: RawMutex, W: Write, const N: usize>(
    client: &AtClient<'_, M, W, N>,
    channel: ChannelId,
    payload: &[u8],
) -> Result<(), Error> {
    let header = data_header(channel, payload.len())?;
    client.write_raw(&[&header, payload, &[ENDBYTE]]).await
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};
    use std::vec::Vec;

    use embassy_futures::join::join;
    use embassy_time::Timer;

    use super::*;
    use crate::config::Config;
    use crate::edm::OwnedEdmEvent;
    use crate::test_helpers::{run, Modem};

    #[test]
    fn rx_splits_at_and_data_across_chunks() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let mut rx = EdmRx::new(move |event| sink.lock().unwrap().push(event));

        let stream: &[u8] = &[
            0x13, 0x37, // line noise
            0xAA, 0x00, 0x08, 0x00, 0x45, b'\r', b'\n', b'O', b'K', b'\r', b'\n', 0x55, // AT
            0xAA, 0x00, 0x05, 0x00, 0x31, 0x02, 0x01, 0x02, 0x55, // data
            0xAA, 0x00, 0x03, 0x00, 0x21, 0x02, 0x00, // broken disconnect
            0xAA, 0x00, 0x03, 0x00, 0x21, 0x02, 0x55, // disconnect
        ];

        let mut at = Vec::new();
        for chunk in stream.chunks(5) {
            rx.feed(chunk, &mut at);
        }
        assert_eq!(at, b"\r\nOK\r\n");

        // Nothing reaches the sink until the deliveries are run.
        assert!(events.lock().unwrap().is_empty());
        while let Some(deliver) = rx.take_callback() {
            deliver();
        }
        assert_eq!(
            *events.lock().unwrap(),
            [
                OwnedEdmEvent::Data {
                    channel_id: ChannelId(2),
                    payload: std::vec![1, 2],
                },
                OwnedEdmEvent::Disconnect(ChannelId(2)),
            ]
        );
    }

    #[test]
    fn tx_frames_each_write() {
        let mut out = Vec::new();
        EdmTx.transform(b"AT\r", &mut out);
        assert_eq!(out, [0xAA, 0x00, 0x05, 0x00, 0x44, b'A', b'T', b'\r', 0x55]);

        out.clear();
        EdmTx.transform(&[b'x'; MAX_PAYLOAD_SIZE + 10], &mut out);
        assert_eq!(out.len(), MAX_PAYLOAD_SIZE + 10 + 2 * 6);
    }

    #[test]
    fn at_commands_and_data_over_edm() {
        let modem = Modem::new();
        let client = modem.client(Config::default().delay_ms(0));
        let received = Arc::new(Mutex::new(Vec::new()));

        let result = run(&client, &modem, async {
            let sink = received.clone();
            client.set_intercept_rx(EdmRx::new(move |event| sink.lock().unwrap().push(event)));
            client.set_intercept_tx(EdmTx).await;

            let modem_side = async {
                modem.expect(b"\xAA\x00\x0A\x00\x44AT+UMLA\r\x55").await;
                modem
                    .send(&[0xAA, 0x00, 0x05, 0x00, 0x31, 0x04, b'h', b'i', 0x55])
                    .await;
                modem
                    .send(b"\xAA\x00\x14\x00\x45\r\n+UMLA:\"D4CA6E\"\r\n\x55")
                    .await;
                modem.send(b"\xAA\x00\x08\x00\x45\r\nOK\r\n\x55").await;
            };
            let exchange = async {
                let mut t = client.lock().await;
                t.command_start(Some("AT+UMLA")).await.ok();
                t.command_stop().await.ok();
                t.response_start(Some("+UMLA:")).await.ok();
                let mut mac = [0u8; 12];
                let len = t.read_string(Some(&mut mac)).await;
                t.response_stop().await.ok();
                (len.map(|len| mac[..len].to_vec()), t.unlock())
            };
            let (_, (mac, result)) = join(modem_side, exchange).await;
            assert_eq!(mac, Ok(b"D4CA6E".to_vec()));

            let (_, sent) = join(
                modem.expect(&[0xAA, 0x00, 0x06, 0x00, 0x36, 0x04, b'y', b'o', b'!', 0x55]),
                send_data(&client, ChannelId(4), b"yo!"),
            )
            .await;
            assert_eq!(sent, Ok(()));
            Timer::after_millis(10).await;
            result
        });

        assert_eq!(result, Ok(()));
        assert_eq!(
            *received.lock().unwrap(),
            [OwnedEdmEvent::Data {
                channel_id: ChannelId(4),
                payload: b"hi".to_vec(),
            }]
        );
    }
}
