//! Loopback Transport
//!
//! In-process [`Transport`] for tests, demos and listen-server play.
//!
//! Every endpoint owns one unbounded channel that carries all of its events,
//! so sends on a connection arrive in send order. Listeners live in a shared
//! hub keyed by host identity.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::core::ids::{ConnectionId, ExternalId};
use crate::network::transport::{Transport, TransportError, TransportEvent};

type Inbox = mpsc::UnboundedSender<TransportEvent>;

/// One active listener.
struct Listener {
    inbox: Inbox,
    next_connection: u32,
    peers: BTreeMap<ConnectionId, Inbox>,
    buffered_last: Option<Vec<u8>>,
}

#[derive(Default)]
struct Hub {
    listeners: HashMap<ExternalId, Listener>,
}

/// Shared in-process network.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl LoopbackNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an endpoint for the process identified by `address`.
    pub fn endpoint(&self, address: ExternalId) -> LoopbackTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        LoopbackTransport {
            network: self.clone(),
            address,
            inbox_tx: tx,
            inbox_rx: rx,
            listening_as: None,
            connection: None,
        }
    }

    /// Whether someone is listening at `host`.
    pub fn is_listening(&self, host: ExternalId) -> bool {
        self.lock().listeners.contains_key(&host)
    }

    fn lock(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Endpoint on a [`LoopbackNetwork`].
pub struct LoopbackTransport {
    network: LoopbackNetwork,
    address: ExternalId,
    inbox_tx: Inbox,
    inbox_rx: mpsc::UnboundedReceiver<TransportEvent>,
    listening_as: Option<ExternalId>,
    connection: Option<(ExternalId, ConnectionId)>,
}

fn deliver(inbox: &Inbox, event: TransportEvent) -> Result<(), TransportError> {
    inbox.send(event).map_err(|_| TransportError::Closed)
}

impl Transport for LoopbackTransport {
    fn start_listening(&mut self, host: ExternalId) -> Result<(), TransportError> {
        let mut hub = self.network.lock();
        if hub.listeners.contains_key(&host) {
            return Err(TransportError::AlreadyListening(host));
        }

        hub.listeners.insert(host, Listener {
            inbox: self.inbox_tx.clone(),
            next_connection: 0,
            peers: BTreeMap::new(),
            buffered_last: None,
        });
        self.listening_as = Some(host);
        info!("Listening as {}", host);
        Ok(())
    }

    fn stop_listening(&mut self) {
        let Some(host) = self.listening_as.take() else { return };

        let removed = self.network.lock().listeners.remove(&host);
        if let Some(listener) = removed {
            for peer in listener.peers.values() {
                let _ = peer.send(TransportEvent::DisconnectedFromAuthority);
            }
            info!("Stopped listening as {} ({} peers closed)", host, listener.peers.len());
        }
    }

    fn start_connecting(&mut self, host: ExternalId) -> Result<(), TransportError> {
        if self.connection.is_some() {
            self.stop_connecting();
        }

        let mut hub = self.network.lock();
        let listener = hub
            .listeners
            .get_mut(&host)
            .ok_or(TransportError::NoListener(host))?;

        let connection = ConnectionId(listener.next_connection);
        listener.next_connection += 1;
        listener.peers.insert(connection, self.inbox_tx.clone());

        let local = host == self.address;
        deliver(&listener.inbox, TransportEvent::ParticipantConnected { connection, local })?;
        deliver(&self.inbox_tx, TransportEvent::ConnectedToAuthority { connection })?;
        if let Some(payload) = &listener.buffered_last {
            deliver(&self.inbox_tx, TransportEvent::MessageReceived { payload: payload.clone() })?;
        }

        self.connection = Some((host, connection));
        debug!("Connected to {} as {}", host, connection);
        Ok(())
    }

    fn stop_connecting(&mut self) {
        let Some((host, connection)) = self.connection.take() else { return };

        let mut hub = self.network.lock();
        if let Some(listener) = hub.listeners.get_mut(&host) {
            if listener.peers.remove(&connection).is_some() {
                let _ = listener
                    .inbox
                    .send(TransportEvent::ParticipantDisconnected { connection });
            }
        }
        let _ = self.inbox_tx.send(TransportEvent::DisconnectedFromAuthority);
        debug!("Disconnected {} from {}", connection, host);
    }

    fn send_unicast(&mut self, to: ConnectionId, payload: Vec<u8>) -> Result<(), TransportError> {
        let host = self.listening_as.ok_or(TransportError::NotListening)?;
        let hub = self.network.lock();
        let listener = hub.listeners.get(&host).ok_or(TransportError::NotListening)?;
        let peer = listener.peers.get(&to).ok_or(TransportError::UnknownConnection(to))?;
        deliver(peer, TransportEvent::MessageReceived { payload })
    }

    fn send_broadcast(&mut self, payload: Vec<u8>, buffer_last: bool) -> Result<(), TransportError> {
        let host = self.listening_as.ok_or(TransportError::NotListening)?;
        let mut hub = self.network.lock();
        let listener = hub.listeners.get_mut(&host).ok_or(TransportError::NotListening)?;

        for peer in listener.peers.values() {
            // A peer that vanished without closing is skipped, not fatal
            let _ = peer.send(TransportEvent::MessageReceived { payload: payload.clone() });
        }
        if buffer_last {
            listener.buffered_last = Some(payload);
        }
        Ok(())
    }

    fn send_to_authority(&mut self, payload: Vec<u8>) -> Result<(), TransportError> {
        let (host, from) = self.connection.ok_or(TransportError::NotConnected)?;
        let hub = self.network.lock();
        let listener = hub.listeners.get(&host).ok_or(TransportError::NotConnected)?;
        deliver(&listener.inbox, TransportEvent::CommandReceived { from, payload })
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.inbox_rx.try_recv() {
            if event == TransportEvent::DisconnectedFromAuthority {
                self.connection = None;
            }
            events.push(event);
        }
        events
    }

    fn is_listening(&self) -> bool {
        self.listening_as.is_some()
    }

    fn connection(&self) -> Option<ConnectionId> {
        self.connection.map(|(_, id)| id)
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.stop_connecting();
        self.stop_listening();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: ExternalId = ExternalId(100);
    const PEER: ExternalId = ExternalId(200);

    fn payloads(events: &[TransportEvent]) -> Vec<Vec<u8>> {
        events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::MessageReceived { payload } => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_host_connects_to_itself() {
        let net = LoopbackNetwork::new();
        let mut host = net.endpoint(HOST);

        host.start_listening(HOST).unwrap();
        host.start_connecting(HOST).unwrap();

        assert_eq!(
            host.poll(),
            vec![
                TransportEvent::ParticipantConnected { connection: ConnectionId(0), local: true },
                TransportEvent::ConnectedToAuthority { connection: ConnectionId(0) },
            ]
        );
        assert_eq!(host.connection(), Some(ConnectionId(0)));
    }

    #[test]
    fn test_commands_carry_sender() {
        let net = LoopbackNetwork::new();
        let mut host = net.endpoint(HOST);
        let mut peer = net.endpoint(PEER);

        host.start_listening(HOST).unwrap();
        peer.start_connecting(HOST).unwrap();
        host.poll();

        peer.send_to_authority(vec![1, 2, 3]).unwrap();
        assert_eq!(
            host.poll(),
            vec![TransportEvent::CommandReceived { from: ConnectionId(0), payload: vec![1, 2, 3] }]
        );
    }

    #[test]
    fn test_unicast_and_order() {
        let net = LoopbackNetwork::new();
        let mut host = net.endpoint(HOST);
        let mut a = net.endpoint(ExternalId(1));
        let mut b = net.endpoint(ExternalId(2));

        host.start_listening(HOST).unwrap();
        a.start_connecting(HOST).unwrap();
        b.start_connecting(HOST).unwrap();
        a.poll();
        b.poll();

        for i in 0..5u8 {
            host.send_unicast(ConnectionId(1), vec![i]).unwrap();
        }
        assert!(a.poll().is_empty());
        assert_eq!(payloads(&b.poll()), vec![vec![0], vec![1], vec![2], vec![3], vec![4]]);

        assert_eq!(
            host.send_unicast(ConnectionId(9), vec![0]),
            Err(TransportError::UnknownConnection(ConnectionId(9)))
        );
    }

    #[test]
    fn test_buffered_last_replayed_to_late_joiner() {
        let net = LoopbackNetwork::new();
        let mut host = net.endpoint(HOST);
        let mut early = net.endpoint(ExternalId(1));
        let mut late = net.endpoint(ExternalId(2));

        host.start_listening(HOST).unwrap();
        early.start_connecting(HOST).unwrap();
        early.poll();

        host.send_broadcast(vec![1], true).unwrap();
        host.send_broadcast(vec![2], true).unwrap();
        host.send_broadcast(vec![3], false).unwrap();
        assert_eq!(payloads(&early.poll()), vec![vec![1], vec![2], vec![3]]);

        // Only the most recent buffered payload is retained
        late.start_connecting(HOST).unwrap();
        assert_eq!(payloads(&late.poll()), vec![vec![2]]);
    }

    #[test]
    fn test_stop_listening_drops_buffer_and_peers() {
        let net = LoopbackNetwork::new();
        let mut host = net.endpoint(HOST);
        let mut peer = net.endpoint(PEER);

        host.start_listening(HOST).unwrap();
        peer.start_connecting(HOST).unwrap();
        peer.poll();
        host.send_broadcast(vec![9], true).unwrap();

        host.stop_listening();
        let events = peer.poll();
        assert_eq!(events.last(), Some(&TransportEvent::DisconnectedFromAuthority));
        assert_eq!(peer.connection(), None);
        assert!(!net.is_listening(HOST));

        host.start_listening(HOST).unwrap();
        peer.start_connecting(HOST).unwrap();
        assert!(payloads(&peer.poll()).is_empty());
    }

    #[test]
    fn test_stop_connecting_notifies_listener() {
        let net = LoopbackNetwork::new();
        let mut host = net.endpoint(HOST);
        let mut peer = net.endpoint(PEER);

        host.start_listening(HOST).unwrap();
        peer.start_connecting(HOST).unwrap();
        host.poll();

        peer.stop_connecting();
        assert_eq!(
            host.poll(),
            vec![TransportEvent::ParticipantDisconnected { connection: ConnectionId(0) }]
        );
        assert_eq!(peer.send_to_authority(vec![1]), Err(TransportError::NotConnected));
    }

    #[test]
    fn test_errors() {
        let net = LoopbackNetwork::new();
        let mut host = net.endpoint(HOST);
        let mut other = net.endpoint(PEER);

        assert_eq!(host.start_connecting(HOST), Err(TransportError::NoListener(HOST)));
        assert_eq!(host.send_broadcast(vec![], false), Err(TransportError::NotListening));

        host.start_listening(HOST).unwrap();
        assert_eq!(other.start_listening(HOST), Err(TransportError::AlreadyListening(HOST)));
    }

    #[test]
    fn test_ids_not_reused() {
        let net = LoopbackNetwork::new();
        let mut host = net.endpoint(HOST);
        let mut peer = net.endpoint(PEER);

        host.start_listening(HOST).unwrap();
        peer.start_connecting(HOST).unwrap();
        peer.stop_connecting();
        peer.start_connecting(HOST).unwrap();
        assert_eq!(peer.connection(), Some(ConnectionId(1)));
    }
}
