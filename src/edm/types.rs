use alloc::vec::Vec;
use core::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

pub const STARTBYTE: u8 = 0xAA;
pub const ENDBYTE: u8 = 0x55;
pub const EDM_SIZE_FILTER: u8 = 0x0F;
pub const EDM_FULL_SIZE_FILTER: u16 = 0x0FFF;
/// Start byte, length and end byte around the counted part of a frame.
pub const EDM_OVERHEAD: usize = 4;
/// Index in packet at which AT-command starts
pub const AT_COMMAND_POSITION: usize = 5;
/// Index in packet at which data starts
pub const DATA_POSITION: usize = 6;
/// Largest payload accepted by the frame builders.
pub const MAX_PAYLOAD_SIZE: usize = 4091;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelId(pub u8);

#[derive(Debug, PartialEq)]
#[repr(u8)]
pub(crate) enum PayloadType {
    /// Sent by the module to inform the host about a new connection.
    ConnectEvent = 0x11,
    /// Sent by the module to inform the host about the loss of connection.
    DisconnectEvent = 0x21,
    /// Sent by the module when data is received over air.
    DataEvent = 0x31,
    /// Sent to the module to send data over air. No acknowledge is transmitted by the module.
    DataCommand = 0x36,
    /// Special packet to execute an AT command. One or many AT Confirmation packets are transmitted back by the module.
    ATRequest = 0x44,
    /// AT Response.
    ATConfirmation = 0x45,
    /// AT URC.
    ATEvent = 0x41,
    /// Makes the module re-transmit Connect Events for connections still
    /// active, e.g. after a host reset.
    ResendConnectEventsCommand = 0x56,
    /// Sent when the module recovers from reset or at power on, and on
    /// entering EDM.
    StartEvent = 0x71,
    Unknown = 0x00,
}

impl From<u8> for PayloadType {
    fn from(num: u8) -> Self {
        match num {
            0x11 => PayloadType::ConnectEvent,
            0x21 => PayloadType::DisconnectEvent,
            0x31 => PayloadType::DataEvent,
            0x36 => PayloadType::DataCommand,
            0x44 => PayloadType::ATRequest,
            0x45 => PayloadType::ATConfirmation,
            0x41 => PayloadType::ATEvent,
            0x56 => PayloadType::ResendConnectEventsCommand,
            0x71 => PayloadType::StartEvent,
            _ => PayloadType::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ConnectType {
    Bluetooth = 0x01,
    IPv4 = 0x02,
    IPv6 = 0x03,
    Unknown = 0,
}

impl From<u8> for ConnectType {
    fn from(num: u8) -> Self {
        match num {
            1 => ConnectType::Bluetooth,
            2 => ConnectType::IPv4,
            3 => ConnectType::IPv6,
            _ => ConnectType::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum BluetoothProfile {
    Spp = 0,
    Dun = 1,
    /// Serial port service over BLE.
    Sps = 14,
}

impl TryFrom<u8> for BluetoothProfile {
    type Error = ();

    fn try_from(num: u8) -> Result<Self, Self::Error> {
        match num {
            0 => Ok(BluetoothProfile::Spp),
            1 => Ok(BluetoothProfile::Dun),
            14 => Ok(BluetoothProfile::Sps),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Protocol {
    Tcp = 0x00,
    Udp = 0x01,
}

impl TryFrom<u8> for Protocol {
    type Error = ();

    fn try_from(num: u8) -> Result<Self, Self::Error> {
        match num {
            0 => Ok(Protocol::Tcp),
            1 => Ok(Protocol::Udp),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BluetoothConnectEvent {
    pub channel_id: ChannelId,
    pub profile: BluetoothProfile,
    pub bd_address: [u8; 6],
    pub frame_size: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4ConnectEvent {
    pub channel_id: ChannelId,
    pub protocol: Protocol,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
    pub local_ip: Ipv4Addr,
    pub local_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6ConnectEvent {
    pub channel_id: ChannelId,
    pub protocol: Protocol,
    pub remote_ip: Ipv6Addr,
    pub remote_port: u16,
    pub local_ip: Ipv6Addr,
    pub local_port: u16,
}

/// One decoded frame. `Data` and `At` borrow from the parsed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdmEvent<'a> {
    BluetoothConnect(BluetoothConnectEvent),
    Ipv4Connect(Ipv4ConnectEvent),
    Ipv6Connect(Ipv6ConnectEvent),
    Disconnect(ChannelId),
    Data {
        channel_id: ChannelId,
        payload: &'a [u8],
    },
    /// AT confirmation or AT event text.
    At(&'a [u8]),
    StartUp,
    /// No event, see the parse status.
    Invalid,
}

impl EdmEvent<'_> {
    /// Copies borrowed payloads so the event can outlive the parsed buffer.
    pub fn into_owned(self) -> OwnedEdmEvent {
        match self {
            EdmEvent::BluetoothConnect(e) => OwnedEdmEvent::BluetoothConnect(e),
            EdmEvent::Ipv4Connect(e) => OwnedEdmEvent::Ipv4Connect(e),
            EdmEvent::Ipv6Connect(e) => OwnedEdmEvent::Ipv6Connect(e),
            EdmEvent::Disconnect(channel_id) => OwnedEdmEvent::Disconnect(channel_id),
            EdmEvent::Data {
                channel_id,
                payload,
            } => OwnedEdmEvent::Data {
                channel_id,
                payload: payload.to_vec(),
            },
            EdmEvent::At(payload) => OwnedEdmEvent::At(payload.to_vec()),
            EdmEvent::StartUp => OwnedEdmEvent::StartUp,
            EdmEvent::Invalid => OwnedEdmEvent::Invalid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnedEdmEvent {
    BluetoothConnect(BluetoothConnectEvent),
    Ipv4Connect(Ipv4ConnectEvent),
    Ipv6Connect(Ipv6ConnectEvent),
    Disconnect(ChannelId),
    Data { channel_id: ChannelId, payload: Vec<u8> },
    At(Vec<u8>),
    StartUp,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseStatus {
    Ok,
    /// No start byte in the buffer.
    Invalid,
    /// The frame continues past the end of the buffer.
    Incomplete,
    /// No end byte where the length says it should be.
    SizeError,
    /// Well delimited, but the content makes no sense.
    Corrupted,
}

/// Result of [`parse`](super::parse).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parsed<'a> {
    pub event: EdmEvent<'a>,
    /// Bytes the caller can drop from the front of the buffer.
    pub consumed: usize,
    /// Length field of the frame found, 0 if none could be read.
    pub expected_size: usize,
    pub status: ParseStatus,
}

impl Parsed<'_> {
    pub(crate) const fn failed(status: ParseStatus, consumed: usize, expected_size: usize) -> Self {
        Self {
            event: EdmEvent::Invalid,
            consumed,
            expected_size,
            status,
        }
    }
}
