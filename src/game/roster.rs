//! Session Roster
//!
//! Replicated participant readiness, display names and platform identities,
//! keyed by connection id. The authority owns the table and issues the
//! force-start order; participants hold a read-only mirror.

use serde::{Serialize, Deserialize};
use tracing::{info, warn};

use crate::core::ids::{ConnectionId, ExternalId, LevelId};
use crate::game::context::SessionContext;
use crate::network::replica::{MapOp, Mirror, Owner, ReplicaRole, ReplicatedMap};

/// One roster row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    /// Ready to start.
    pub ready: bool,
    /// Display name as submitted.
    pub display_name: String,
    /// Platform identity as submitted.
    pub external_id: ExternalId,
}

/// Lobby list row for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobbyRow {
    /// Connection the row describes.
    pub connection: ConnectionId,
    /// Display name, or `Client {id}` before the participant reported one.
    pub display_name: String,
    /// Ready flag (absent entries are not ready).
    pub ready: bool,
    /// Platform identity, `0` if unknown.
    pub external_id: ExternalId,
}

/// Validated force-start request, ready for the node to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOrder {
    /// Level to load with replace-all semantics.
    pub level: LevelId,
    /// Requested match length in seconds.
    pub match_seconds: u32,
}

/// Roster errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RosterError {
    /// Force start without a level.
    #[error("no level selected for force start")]
    NoLevelSelected,
}

/// Fallback label for a connection without a reported name.
pub fn fallback_name(connection: ConnectionId) -> String {
    format!("Client {}", connection)
}

/// Replicated roster.
#[derive(Debug, Clone, Default)]
pub struct SessionRoster<R: ReplicaRole = Owner> {
    entries: ReplicatedMap<ConnectionId, RosterEntry, R>,
}

/// Participant-side roster mirror.
pub type RosterView = SessionRoster<Mirror>;

impl<R: ReplicaRole> SessionRoster<R> {
    /// Create an empty roster.
    pub fn new() -> Self {
        Self { entries: ReplicatedMap::new() }
    }

    /// Full row for a connection.
    pub fn get(&self, connection: ConnectionId) -> Option<&RosterEntry> {
        self.entries.get(&connection)
    }

    /// Readiness keyed by connection.
    pub fn readiness(&self) -> impl Iterator<Item = (ConnectionId, bool)> + '_ {
        self.entries.iter().map(|(id, e)| (*id, e.ready))
    }

    /// Display names keyed by connection.
    pub fn names(&self) -> impl Iterator<Item = (ConnectionId, &str)> + '_ {
        self.entries.iter().map(|(id, e)| (*id, e.display_name.as_str()))
    }

    /// Platform identities keyed by connection.
    pub fn external_ids(&self) -> impl Iterator<Item = (ConnectionId, ExternalId)> + '_ {
        self.entries.iter().map(|(id, e)| (*id, e.external_id))
    }

    /// Whether a connection is marked ready.
    pub fn is_ready(&self, connection: ConnectionId) -> bool {
        self.entries.get(&connection).map(|e| e.ready).unwrap_or(false)
    }

    /// Number of ready participants.
    pub fn ready_count(&self) -> usize {
        self.entries.iter().filter(|(_, e)| e.ready).count()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the roster is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One row per connected participant, in the order given.
    pub fn lobby_rows(&self, connected: &[ConnectionId]) -> Vec<LobbyRow> {
        connected
            .iter()
            .map(|&connection| match self.entries.get(&connection) {
                Some(e) => LobbyRow {
                    connection,
                    display_name: e.display_name.clone(),
                    ready: e.ready,
                    external_id: e.external_id,
                },
                None => LobbyRow {
                    connection,
                    display_name: fallback_name(connection),
                    ready: false,
                    external_id: ExternalId::UNKNOWN,
                },
            })
            .collect()
    }
}

impl SessionRoster<Owner> {
    /// Clear every row (authority start).
    pub fn reset(&mut self) {
        info!("Roster reset");
        self.entries.clear();
    }

    /// Upsert a row for `connection`.
    pub fn set_ready(
        &mut self,
        connection: ConnectionId,
        ready: bool,
        display_name: String,
        external_id: ExternalId,
    ) {
        info!("Ready[{}]={} {}", connection, ready, display_name);
        self.entries.insert(connection, RosterEntry { ready, display_name, external_id });
    }

    /// Drop a departed connection's row.
    pub fn remove(&mut self, connection: ConnectionId) -> bool {
        self.entries.remove(&connection).is_some()
    }

    /// Validate a force start and record it in the session context.
    ///
    /// An empty level is rejected and leaves the context untouched.
    pub fn force_start(
        &self,
        level: LevelId,
        match_seconds: u32,
        context: &mut SessionContext,
    ) -> Result<StartOrder, RosterError> {
        if level.is_empty() {
            warn!("Force start rejected: no level selected");
            return Err(RosterError::NoLevelSelected);
        }

        info!(
            "Force start level={} t={}s ({} of {} ready)",
            level, match_seconds, self.ready_count(), self.len()
        );
        context.populate(level.clone(), match_seconds);

        Ok(StartOrder { level, match_seconds })
    }

    /// Take pending replication ops.
    pub fn drain_changes(&mut self) -> Vec<MapOp<ConnectionId, RosterEntry>> {
        self.entries.drain_changes()
    }

    /// Full table for a late joiner.
    pub fn snapshot(&self) -> Vec<MapOp<ConnectionId, RosterEntry>> {
        self.entries.snapshot()
    }
}

impl SessionRoster<Mirror> {
    /// Apply a replicated op.
    pub(crate) fn apply(&mut self, op: MapOp<ConnectionId, RosterEntry>) {
        self.entries.apply(op);
    }
}
