//! Presence Tracking
//!
//! Round-trip latency and identity cache per connection.
//!
//! ```text
//! participant                         authority
//!     |-- Ping{conn, t0, name, id} -->|  (upsert identity)
//!     |<------- Pong{conn, t0} -------|  (unicast to sender)
//!     |-- ReportRtt{conn, ms} ------->|  (upsert rtt)
//! ```
//!
//! The participant half is [`PingScheduler`]; the replicated tables are
//! [`PresenceTable`]. A pong with no pending ping is a stale discard, not an
//! error: the next cycle simply sends a fresh ping.

use std::collections::BTreeMap;
use serde::{Serialize, Deserialize};
use tracing::debug;

use crate::core::ids::{ConnectionId, ExternalId};
use crate::game::roster::fallback_name;
use crate::network::protocol::{AuthorityCommand, ParticipantMessage};
use crate::network::replica::{MapOp, Mirror, Owner, ReplicaRole, ReplicatedMap};

/// Highest reportable RTT in milliseconds.
pub const MAX_RTT_MS: u16 = 999;

/// Round trip in whole milliseconds between two timestamps in seconds,
/// clamped to `0..=999`.
pub fn rtt_ms(sent_at: f64, now: f64) -> u16 {
    let ms = ((now - sent_at) * 1000.0).round();
    if ms.is_nan() {
        return 0;
    }
    ms.clamp(0.0, MAX_RTT_MS as f64) as u16
}

// =============================================================================
// PARTICIPANT PING SCHEDULER
// =============================================================================

/// Participant-side ping scheduler.
#[derive(Debug, Clone)]
pub struct PingScheduler {
    interval: f64,
    next_ping_at: Option<f64>,
    pending: BTreeMap<ConnectionId, f64>,
}

impl PingScheduler {
    /// Create a scheduler that pings every `interval` seconds, first on the next poll.
    pub fn new(interval: f64) -> Self {
        Self { interval, next_ping_at: None, pending: BTreeMap::new() }
    }

    /// Emit a ping if one is due. Overwrites any unanswered ping.
    pub fn poll(
        &mut self,
        now: f64,
        connection: ConnectionId,
        display_name: &str,
        external_id: ExternalId,
    ) -> Option<AuthorityCommand> {
        if self.next_ping_at.map_or(false, |at| now < at) {
            return None;
        }
        self.next_ping_at = Some(now + self.interval);
        self.pending.insert(connection, now);

        Some(AuthorityCommand::Ping {
            connection,
            sent_at: now,
            display_name: display_name.to_string(),
            external_id,
        })
    }

    /// Resolve a pong. Returns the RTT to report, or `None` for a stale pong.
    pub fn on_pong(&mut self, connection: ConnectionId, now: f64) -> Option<u16> {
        match self.pending.remove(&connection) {
            Some(sent_at) => Some(rtt_ms(sent_at, now)),
            None => {
                debug!("Stale pong for {} discarded", connection);
                None
            }
        }
    }
}

// =============================================================================
// REPLICATED TABLES
// =============================================================================

/// Identity reported with each ping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    /// Name shown in lobby and scoreboard.
    pub display_name: String,
    /// Platform account id.
    pub external_id: ExternalId,
}

/// Scoreboard row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreRow {
    /// Row's connection.
    pub connection: ConnectionId,
    /// Cached name or `Client {id}`.
    pub display_name: String,
    /// Milliseconds, `-1` if never reported.
    pub rtt_ms: i32,
    /// Platform id, `0` if unknown.
    pub external_id: ExternalId,
}

/// Replicated RTT and identity caches.
#[derive(Debug, Clone, Default)]
pub struct PresenceTable<R: ReplicaRole = Owner> {
    rtt: ReplicatedMap<ConnectionId, u16, R>,
    identities: ReplicatedMap<ConnectionId, PeerIdentity, R>,
}

/// Participant-side mirror.
pub type PresenceView = PresenceTable<Mirror>;

impl<R: ReplicaRole> PresenceTable<R> {
    /// Create empty tables.
    pub fn new() -> Self {
        Self { rtt: ReplicatedMap::new(), identities: ReplicatedMap::new() }
    }

    /// RTT in milliseconds, `-1` if unknown.
    pub fn get_rtt(&self, connection: ConnectionId) -> i32 {
        self.rtt.get(&connection).map(|ms| *ms as i32).unwrap_or(-1)
    }

    /// Display name, `Client {id}` if unknown.
    pub fn get_name(&self, connection: ConnectionId) -> String {
        self.identities
            .get(&connection)
            .map(|p| p.display_name.clone())
            .unwrap_or_else(|| fallback_name(connection))
    }

    /// Platform identity, `0` if unknown.
    pub fn get_external_id(&self, connection: ConnectionId) -> ExternalId {
        self.identities
            .get(&connection)
            .map(|p| p.external_id)
            .unwrap_or(ExternalId::UNKNOWN)
    }

    /// Every connection with an RTT or identity row, ascending.
    pub fn connections(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .rtt
            .iter()
            .map(|(id, _)| *id)
            .chain(self.identities.iter().map(|(id, _)| *id))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// One row per connected id.
    pub fn scoreboard(&self, connected: &[ConnectionId]) -> Vec<ScoreRow> {
        connected
            .iter()
            .map(|&connection| ScoreRow {
                connection,
                display_name: self.get_name(connection),
                rtt_ms: self.get_rtt(connection),
                external_id: self.get_external_id(connection),
            })
            .collect()
    }
}

impl PresenceTable<Owner> {
    /// Handle a ping: cache the identity and build the pong for the sender.
    pub fn on_ping(
        &mut self,
        connection: ConnectionId,
        sent_at: f64,
        display_name: String,
        external_id: ExternalId,
    ) -> ParticipantMessage {
        let identity = PeerIdentity { display_name, external_id };
        if self.identities.get(&connection) != Some(&identity) {
            self.identities.insert(connection, identity);
        }
        ParticipantMessage::Pong { connection, sent_at }
    }

    /// Store a reported RTT.
    pub fn on_report(&mut self, connection: ConnectionId, rtt_ms: u16) {
        self.rtt.insert(connection, rtt_ms.min(MAX_RTT_MS));
    }

    /// Drop a departed connection from both tables.
    pub fn remove(&mut self, connection: ConnectionId) {
        self.rtt.remove(&connection);
        self.identities.remove(&connection);
    }

    /// Clear both tables.
    pub fn reset(&mut self) {
        self.rtt.clear();
        self.identities.clear();
    }

    /// Take pending RTT ops.
    pub fn drain_rtt_changes(&mut self) -> Vec<MapOp<ConnectionId, u16>> {
        self.rtt.drain_changes()
    }

    /// Take pending identity ops.
    pub fn drain_identity_changes(&mut self) -> Vec<MapOp<ConnectionId, PeerIdentity>> {
        self.identities.drain_changes()
    }

    /// Full RTT table.
    pub fn rtt_snapshot(&self) -> Vec<MapOp<ConnectionId, u16>> {
        self.rtt.snapshot()
    }

    /// Full identity table.
    pub fn identity_snapshot(&self) -> Vec<MapOp<ConnectionId, PeerIdentity>> {
        self.identities.snapshot()
    }
}

impl PresenceTable<Mirror> {
    pub(crate) fn apply_rtt(&mut self, op: MapOp<ConnectionId, u16>) {
        self.rtt.apply(op);
    }

    pub(crate) fn apply_identity(&mut self, op: MapOp<ConnectionId, PeerIdentity>) {
        self.identities.apply(op);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_rtt_example() {
        assert_eq!(rtt_ms(10.000, 10.035), 35);
        assert_eq!(rtt_ms(0.0, 0.0), 0);
        assert_eq!(rtt_ms(5.0, 4.0), 0);
        assert_eq!(rtt_ms(0.0, 2.5), 999);
    }

    #[test]
    fn test_ping_cycle() {
        let mut pinger = PingScheduler::new(2.0);
        let me = ConnectionId(1);

        let ping = pinger.poll(10.0, me, "Alice", ExternalId(111));
        assert!(matches!(ping, Some(AuthorityCommand::Ping { sent_at, .. }) if sent_at == 10.0));
        assert!(pinger.poll(11.0, me, "Alice", ExternalId(111)).is_none());

        assert_eq!(pinger.on_pong(me, 10.035), Some(35));

        // Duplicate pong is stale
        assert_eq!(pinger.on_pong(me, 10.040), None);

        assert!(pinger.poll(12.0, me, "Alice", ExternalId(111)).is_some());
    }

    #[test]
    fn test_lost_pong_superseded() {
        let mut pinger = PingScheduler::new(2.0);
        let me = ConnectionId(2);

        pinger.poll(0.0, me, "Bob", ExternalId(2));
        // pong lost; next cycle overwrites the pending timestamp
        pinger.poll(2.0, me, "Bob", ExternalId(2));
        assert_eq!(pinger.on_pong(me, 2.050), Some(50));
    }

    #[test]
    fn test_authority_tables() {
        let mut table = PresenceTable::new();
        let c = ConnectionId(5);

        assert_eq!(table.get_rtt(c), -1);
        assert_eq!(table.get_name(c), "Client 5");
        assert_eq!(table.get_external_id(c), ExternalId(0));

        let pong = table.on_ping(c, 3.25, "Carol".into(), ExternalId(333));
        assert_eq!(pong, ParticipantMessage::Pong { connection: c, sent_at: 3.25 });
        table.on_report(c, 48);

        assert_eq!(table.get_rtt(c), 48);
        assert_eq!(table.get_name(c), "Carol");
        assert_eq!(table.get_external_id(c), ExternalId(333));

        table.remove(c);
        assert_eq!(table.get_rtt(c), -1);
        assert_eq!(table.get_name(c), "Client 5");
    }

    #[test]
    fn test_repeated_ping_replicates_once() {
        let mut table = PresenceTable::new();
        table.on_ping(ConnectionId(1), 0.0, "A".into(), ExternalId(1));
        table.on_ping(ConnectionId(1), 2.0, "A".into(), ExternalId(1));
        assert_eq!(table.drain_identity_changes().len(), 1);
    }

    #[test]
    fn test_mirror_and_scoreboard() {
        let mut table = PresenceTable::new();
        table.on_ping(ConnectionId(0), 0.0, "Host".into(), ExternalId(10));
        table.on_report(ConnectionId(0), 3);

        let mut view = PresenceView::new();
        for op in table.drain_rtt_changes() {
            view.apply_rtt(op);
        }
        for op in table.drain_identity_changes() {
            view.apply_identity(op);
        }

        let rows = view.scoreboard(&[ConnectionId(0), ConnectionId(1)]);
        assert_eq!(
            rows[0],
            ScoreRow { connection: ConnectionId(0), display_name: "Host".into(), rtt_ms: 3, external_id: ExternalId(10) }
        );
        assert_eq!(rows[1].display_name, "Client 1");
        assert_eq!(rows[1].rtt_ms, -1);
    }

    proptest! {
        #[test]
        fn prop_rtt_clamped(t0 in -1.0e6f64..1.0e6, t1 in -1.0e6f64..1.0e6) {
            let expected = ((t1 - t0) * 1000.0).round().clamp(0.0, 999.0) as u16;
            let ms = rtt_ms(t0, t1);
            prop_assert_eq!(ms, expected);
            prop_assert!(ms <= 999);
        }
    }
}
