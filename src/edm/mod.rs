//! Extended Data Mode framing.
//!
//! Every frame is `0xAA LEN_HI LEN_LO <LEN bytes> 0x55`, where the 12-bit
//! length counts the bytes between the length field and the end byte. The
//! first two counted bytes hold the payload type.
//!
//! [`parse`] and the builders are pure functions over caller buffers. The
//! [`EdmRx`] and [`EdmTx`] intercepts plug them into an [`AtClient`] so
//! the AT channel and data channels can share one stream.
//!
//! [`AtClient`]: crate::asynch::AtClient

mod channel;
mod transport;
pub mod types;

pub use channel::{ChannelState, ChannelTable, Connection, Remote, Transport};
pub use transport::{send_data, EdmRx, EdmTx};
pub use types::{ChannelId, EdmEvent, OwnedEdmEvent, ParseStatus, Parsed};

use core::net::{Ipv4Addr, Ipv6Addr};

use crate::error::Error;
use types::*;

/// Makes the module send connect events for all open channels again.
pub const RESEND_CONNECT_EVENTS: [u8; 6] = [
    STARTBYTE,
    0x00,
    0x02,
    0x00,
    PayloadType::ResendConnectEventsCommand as u8,
    ENDBYTE,
];

/// AT command switching the module from command mode into EDM. The module
/// answers with a start event frame.
pub const SWITCH_TO_EDM: &[u8] = b"ATO2\r";

pub(crate) fn calc_payload_len(frame: &[u8]) -> usize {
    (u16::from_be_bytes([frame[1], frame[2]]) & EDM_FULL_SIZE_FILTER) as usize
}

/// Parses the first frame in `buf`.
///
/// Bytes in front of the start byte are skipped and counted as consumed.
/// Only on [`ParseStatus::Incomplete`] should the caller keep the consumed
/// bytes' successors and retry with more data.
pub fn parse(buf: &[u8]) -> Parsed<'_> {
    let Some(head) = buf.iter().position(|&b| b == STARTBYTE) else {
        return Parsed::failed(ParseStatus::Invalid, buf.len(), 0);
    };
    let frame = &buf[head..];
    if frame.len() < 3 {
        return Parsed::failed(ParseStatus::Incomplete, head, 0);
    }

    let len = calc_payload_len(frame);
    if frame.len() < len + EDM_OVERHEAD {
        return Parsed::failed(ParseStatus::Incomplete, head, len);
    }

    let consumed = head + len + EDM_OVERHEAD;
    if frame[len + 3] != ENDBYTE {
        warn!("EDM frame of {} bytes has no end byte", len);
        return Parsed::failed(ParseStatus::SizeError, consumed, len);
    }

    match decode(&frame[..len + EDM_OVERHEAD], len) {
        Some(event) => Parsed {
            event,
            consumed,
            expected_size: len,
            status: ParseStatus::Ok,
        },
        None => {
            warn!("Corrupted EDM frame of type {:#x}", frame.get(4).copied().unwrap_or(0));
            Parsed::failed(ParseStatus::Corrupted, consumed, len)
        }
    }
}

/// Decodes one complete frame, `len` being its length field.
fn decode(frame: &[u8], len: usize) -> Option<EdmEvent<'_>> {
    if len < 2 {
        return None;
    }

    match PayloadType::from(frame[4]) {
        PayloadType::ConnectEvent if len >= 4 => match ConnectType::from(frame[6]) {
            ConnectType::Bluetooth if len == 13 => {
                Some(EdmEvent::BluetoothConnect(BluetoothConnectEvent {
                    channel_id: ChannelId(frame[5]),
                    profile: BluetoothProfile::try_from(frame[7]).ok()?,
                    bd_address: frame[8..14].try_into().ok()?,
                    frame_size: be_u16(frame, 14),
                }))
            }
            ConnectType::IPv4 if len == 17 => Some(EdmEvent::Ipv4Connect(Ipv4ConnectEvent {
                channel_id: ChannelId(frame[5]),
                protocol: Protocol::try_from(frame[7]).ok()?,
                remote_ip: Ipv4Addr::from(<[u8; 4]>::try_from(&frame[8..12]).ok()?),
                remote_port: be_u16(frame, 12),
                local_ip: Ipv4Addr::from(<[u8; 4]>::try_from(&frame[14..18]).ok()?),
                local_port: be_u16(frame, 18),
            })),
            ConnectType::IPv6 if len == 41 => Some(EdmEvent::Ipv6Connect(Ipv6ConnectEvent {
                channel_id: ChannelId(frame[5]),
                protocol: Protocol::try_from(frame[7]).ok()?,
                remote_ip: Ipv6Addr::from(<[u8; 16]>::try_from(&frame[8..24]).ok()?),
                remote_port: be_u16(frame, 24),
                local_ip: Ipv6Addr::from(<[u8; 16]>::try_from(&frame[26..42]).ok()?),
                local_port: be_u16(frame, 42),
            })),
            _ => None,
        },
        PayloadType::DisconnectEvent if len == 3 => Some(EdmEvent::Disconnect(ChannelId(frame[5]))),
        PayloadType::DataEvent if len >= 3 => Some(EdmEvent::Data {
            channel_id: ChannelId(frame[5]),
            payload: &frame[DATA_POSITION..len + 3],
        }),
        PayloadType::ATEvent | PayloadType::ATConfirmation => {
            Some(EdmEvent::At(&frame[AT_COMMAND_POSITION..len + 3]))
        }
        PayloadType::StartEvent => Some(EdmEvent::StartUp),
        _ => None,
    }
}

fn be_u16(frame: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([frame[at], frame[at + 1]])
}

fn check_payload(len: usize) -> Result<(), Error> {
    if len > MAX_PAYLOAD_SIZE {
        return Err(Error::InvalidParameter);
    }
    Ok(())
}

/// Header of an AT request frame carrying `payload_len` bytes of command.
///
/// Write the header, the command and [`tail`] back to back.
pub fn at_request_header(payload_len: usize) -> Result<[u8; 5], Error> {
    check_payload(payload_len)?;
    let len = (payload_len + 2) as u16;
    Ok([
        STARTBYTE,
        (len >> 8) as u8 & EDM_SIZE_FILTER,
        (len & 0xff) as u8,
        0x00,
        PayloadType::ATRequest as u8,
    ])
}

/// Header of a data frame carrying `payload_len` bytes to `channel`.
pub fn data_header(channel: ChannelId, payload_len: usize) -> Result<[u8; 6], Error> {
    check_payload(payload_len)?;
    let len = (payload_len + 3) as u16;
    Ok([
        STARTBYTE,
        (len >> 8) as u8 & EDM_SIZE_FILTER,
        (len & 0xff) as u8,
        0x00,
        PayloadType::DataCommand as u8,
        channel.0,
    ])
}

pub const fn tail() -> u8 {
    ENDBYTE
}

/// Builds a complete AT request frame into `out`, returning its length.
pub fn build_at_request(command: &[u8], out: &mut [u8]) -> Result<usize, Error> {
    let header = at_request_header(command.len())?;
    assemble(&header, command, out)
}

/// Builds a complete data frame into `out`, returning its length.
pub fn build_data(channel: ChannelId, payload: &[u8], out: &mut [u8]) -> Result<usize, Error> {
    let header = data_header(channel, payload.len())?;
    assemble(&header, payload, out)
}

fn assemble(header: &[u8], payload: &[u8], out: &mut [u8]) -> Result<usize, Error> {
    let total = header.len() + payload.len() + 1;
    if out.len() < total {
        return Err(Error::InvalidParameter);
    }
    out[..header.len()].copy_from_slice(header);
    out[header.len()..total - 1].copy_from_slice(payload);
    out[total - 1] = ENDBYTE;
    Ok(total)
}
