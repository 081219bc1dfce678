use core::net::{IpAddr, SocketAddr};

use heapless::Vec;

use super::types::{BluetoothProfile, ChannelId, EdmEvent, Protocol};
use crate::error::Error;

/// Far end of a connection, as reported both by the EDM connect event and by
/// the AT peer URC announcing the same connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remote {
    Bluetooth([u8; 6]),
    Ip(SocketAddr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Bluetooth {
        profile: BluetoothProfile,
        frame_size: u16,
    },
    Ip(Protocol),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub channel_id: ChannelId,
    pub remote: Remote,
    pub transport: Transport,
}

impl Connection {
    /// The connection described by a connect event, if `event` is one.
    pub fn from_event(event: &EdmEvent<'_>) -> Option<Self> {
        match event {
            EdmEvent::BluetoothConnect(e) => Some(Self {
                channel_id: e.channel_id,
                remote: Remote::Bluetooth(e.bd_address),
                transport: Transport::Bluetooth {
                    profile: e.profile,
                    frame_size: e.frame_size,
                },
            }),
            EdmEvent::Ipv4Connect(e) => Some(Self {
                channel_id: e.channel_id,
                remote: Remote::Ip(SocketAddr::new(IpAddr::V4(e.remote_ip), e.remote_port)),
                transport: Transport::Ip(e.protocol),
            }),
            EdmEvent::Ipv6Connect(e) => Some(Self {
                channel_id: e.channel_id,
                remote: Remote::Ip(SocketAddr::new(IpAddr::V6(e.remote_ip), e.remote_port)),
                transport: Transport::Ip(e.protocol),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Connect event seen, the AT peer URC for it not yet.
    Awaiting(Connection),
    Open {
        connection: Connection,
        peer_handle: u8,
    },
}

impl ChannelState {
    pub fn connection(&self) -> &Connection {
        match self {
            ChannelState::Awaiting(connection) => connection,
            ChannelState::Open { connection, .. } => connection,
        }
    }

    pub fn peer_handle(&self) -> Option<u8> {
        match self {
            ChannelState::Awaiting(_) => None,
            ChannelState::Open { peer_handle, .. } => Some(*peer_handle),
        }
    }
}

/// EDM data channels known to the host.
///
/// A channel is announced twice: once by the EDM connect event carrying the
/// channel id, and later by an AT URC carrying the peer handle. Channels wait
/// in [`ChannelState::Awaiting`] until [`ChannelTable::peer_connected`] pairs
/// them up by remote address.
#[derive(Debug, Default)]
pub struct ChannelTable<const N: usize> {
    channels: Vec<ChannelState, N>,
}

impl<const N: usize> ChannelTable<N> {
    pub const fn new() -> Self {
        Self {
            channels: Vec::new(),
        }
    }

    /// Tracks connect and disconnect events. Other events are ignored.
    pub fn handle_event(&mut self, event: &EdmEvent<'_>) -> Result<(), Error> {
        if let EdmEvent::Disconnect(channel_id) = event {
            if self.remove(*channel_id).is_none() {
                debug!("Disconnect for unknown channel {}", channel_id.0);
            }
            return Ok(());
        }

        let Some(connection) = Connection::from_event(event) else {
            return Ok(());
        };

        // Resent connect events replace what we had.
        self.remove(connection.channel_id);
        self.channels
            .push(ChannelState::Awaiting(connection))
            .map_err(|_| {
                warn!("No room to track channel {}", connection.channel_id.0);
                Error::Overflow
            })
    }

    /// Opens the oldest channel awaiting a peer at `remote`.
    pub fn peer_connected(&mut self, peer_handle: u8, remote: Remote) -> Option<ChannelId> {
        let state = self.channels.iter_mut().find(
            |state| matches!(state, ChannelState::Awaiting(connection) if connection.remote == remote),
        )?;

        let connection = *state.connection();
        *state = ChannelState::Open {
            connection,
            peer_handle,
        };
        Some(connection.channel_id)
    }

    /// Forgets the channel opened for `peer_handle`.
    pub fn peer_disconnected(&mut self, peer_handle: u8) -> Option<ChannelId> {
        let channel_id = self.channel_for_peer(peer_handle)?;
        self.remove(channel_id);
        Some(channel_id)
    }

    pub fn channel_for_peer(&self, peer_handle: u8) -> Option<ChannelId> {
        self.channels
            .iter()
            .find(|state| state.peer_handle() == Some(peer_handle))
            .map(|state| state.connection().channel_id)
    }

    pub fn get(&self, channel_id: ChannelId) -> Option<&ChannelState> {
        self.channels
            .iter()
            .find(|state| state.connection().channel_id == channel_id)
    }

    pub fn remove(&mut self, channel_id: ChannelId) -> Option<ChannelState> {
        let index = self
            .channels
            .iter()
            .position(|state| state.connection().channel_id == channel_id)?;
        Some(self.channels.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelState> {
        self.channels.iter()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn clear(&mut self) {
        self.channels.clear()
    }
}
