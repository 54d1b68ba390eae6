//! Transport Layer
//!
//! Reliable, per-connection ordered byte delivery between one authority and
//! its participants. Hosts are addressed by their platform identity, which is
//! what the rendezvous metadata publishes.
//!
//! A process can hold both roles at once: the authority listens and also
//! connects to itself as a participant (reported with `local: true`).

use thiserror::Error;

use crate::core::ids::{ConnectionId, ExternalId};

/// Events surfaced by [`Transport::poll`], in delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    // Listener side
    /// A participant connected to our listener.
    ParticipantConnected {
        /// Allocated id.
        connection: ConnectionId,
        /// Whether it is our own connection.
        local: bool,
    },
    /// A participant's connection closed.
    ParticipantDisconnected {
        /// Closed id.
        connection: ConnectionId,
    },
    /// A command arrived from a participant. `from` is assigned by the
    /// transport, not read from the payload.
    CommandReceived {
        /// Sending connection.
        from: ConnectionId,
        /// Encoded command.
        payload: Vec<u8>,
    },

    // Participant side
    /// Our connection to the authority is up.
    ConnectedToAuthority {
        /// Our id on the authority.
        connection: ConnectionId,
    },
    /// Our connection to the authority closed.
    DisconnectedFromAuthority,
    /// A message arrived from the authority.
    MessageReceived {
        /// Encoded message.
        payload: Vec<u8>,
    },
}

/// Transport failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// A listener is already open.
    #[error("already listening as {0}")]
    AlreadyListening(ExternalId),
    /// No listener open.
    #[error("not listening")]
    NotListening,
    /// Nobody listens at that identity.
    #[error("no listener at {0}")]
    NoListener(ExternalId),
    /// No authority connection.
    #[error("not connected to an authority")]
    NotConnected,
    /// No such connection on our listener.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    /// The other end is gone.
    #[error("peer endpoint closed")]
    Closed,
}

/// Reliable transport used by a session node.
pub trait Transport: Send {
    /// Accept connections addressed to `host`.
    fn start_listening(&mut self, host: ExternalId) -> Result<(), TransportError>;

    /// Stop accepting and close every participant connection.
    /// Drops any buffered-last message.
    fn stop_listening(&mut self);

    /// Connect to the authority listening at `host`.
    fn start_connecting(&mut self, host: ExternalId) -> Result<(), TransportError>;

    /// Close our participant connection, if any.
    fn stop_connecting(&mut self);

    /// Send to one participant.
    fn send_unicast(&mut self, to: ConnectionId, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Send to every participant. With `buffer_last`, the payload also
    /// replaces the listener's buffered message, which is replayed to
    /// connections opened later.
    fn send_broadcast(&mut self, payload: Vec<u8>, buffer_last: bool) -> Result<(), TransportError>;

    /// Send to the authority we are connected to.
    fn send_to_authority(&mut self, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Drain pending events.
    fn poll(&mut self) -> Vec<TransportEvent>;

    /// Whether we are listening.
    fn is_listening(&self) -> bool;

    /// Our participant connection id, if connected.
    fn connection(&self) -> Option<ConnectionId>;
}
