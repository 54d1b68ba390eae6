//! Protocol Messages
//!
//! Wire format between the authority and its participants.
//!
//! Traffic is split by direction so each side only ever decodes what it may
//! act on:
//! - [`AuthorityCommand`]: participant -> authority requests.
//! - [`ParticipantMessage`]: authority -> participant replies, replication
//!   and scene orders.
//!
//! Payloads travel as bincode; JSON helpers exist for logs and debugging.
//! Enums are externally tagged so both encodings work.

use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::core::ids::{ConnectionId, EntityId, ExternalId, LevelId};
use crate::game::config_store::ConfigValue;
use crate::game::roster::RosterEntry;
use crate::network::presence::PeerIdentity;
use crate::network::replica::MapOp;

// =============================================================================
// PARTICIPANT -> AUTHORITY
// =============================================================================

/// Commands sent to the authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityCommand {
    /// Submit readiness and identity for the lobby roster.
    SetReady {
        /// Roster row to write.
        connection: ConnectionId,
        /// Readiness flag.
        ready: bool,
        /// Name shown in the lobby.
        display_name: String,
        /// Platform id.
        external_id: ExternalId,
    },

    /// Start the match on `level`.
    ForceStart {
        /// Level to load.
        level: LevelId,
        /// Match length in seconds.
        match_seconds: u32,
    },

    /// Latency ping. `sent_at` is the sender's clock in seconds.
    Ping {
        /// Pinging connection.
        connection: ConnectionId,
        /// Sender clock at send time.
        sent_at: f64,
        /// Name for the identity cache.
        display_name: String,
        /// Platform id for the identity cache.
        external_id: ExternalId,
    },

    /// Measured round trip for the presence table.
    ReportRtt {
        /// Reporting connection.
        connection: ConnectionId,
        /// Measured round trip.
        rtt_ms: u16,
    },

    /// Teleport an avatar back to the spawn zone.
    RequestRespawn {
        /// Avatar to respawn.
        entity: EntityId,
    },

    /// Set a tunable.
    SetConfig {
        /// Tunable name.
        key: String,
        /// New value.
        value: ConfigValue,
    },
}

// =============================================================================
// AUTHORITY -> PARTICIPANT
// =============================================================================

/// Messages sent to participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantMessage {
    /// Reply to a ping, sent only to the pinging connection.
    Pong {
        /// Connection that pinged.
        connection: ConnectionId,
        /// Echoed ping timestamp.
        sent_at: f64,
    },

    /// Replicated state changes, applied in order.
    Replicate(Vec<ReplicaChange>),

    /// Replace every loaded level with `level`.
    LoadLevel {
        /// Level to load.
        level: LevelId,
    },

    /// Match over: disconnect and load `menu`.
    ReturnToMenu {
        /// Menu level.
        menu: LevelId,
    },
}

/// One change to a replicated table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaChange {
    /// Lobby roster row.
    Roster(MapOp<ConnectionId, RosterEntry>),
    /// Round-trip time row.
    Rtt(MapOp<ConnectionId, u16>),
    /// Identity cache row.
    Identity(MapOp<ConnectionId, PeerIdentity>),
    /// Tunable.
    Config(MapOp<String, ConfigValue>),
    /// Match countdown.
    MatchTimer {
        /// Seconds left.
        remaining: u32,
    },
}

// =============================================================================
// ERRORS
// =============================================================================

/// Encoding failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Bincode failure.
    #[error("binary codec: {0}")]
    Binary(#[from] bincode::Error),
    /// JSON failure.
    #[error("json codec: {0}")]
    Json(#[from] serde_json::Error),
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl AuthorityCommand {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Serialize to binary.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(data)?)
    }

    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthorityCommand::SetReady { .. } => "set_ready",
            AuthorityCommand::ForceStart { .. } => "force_start",
            AuthorityCommand::Ping { .. } => "ping",
            AuthorityCommand::ReportRtt { .. } => "report_rtt",
            AuthorityCommand::RequestRespawn { .. } => "request_respawn",
            AuthorityCommand::SetConfig { .. } => "set_config",
        }
    }
}

impl ParticipantMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Serialize to binary.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_binary_roundtrip() {
        let cmd = AuthorityCommand::Ping {
            connection: ConnectionId(3),
            sent_at: 10.0,
            display_name: "Alice".to_string(),
            external_id: ExternalId(111),
        };

        let bytes = cmd.to_bytes().unwrap();
        assert_eq!(AuthorityCommand::from_bytes(&bytes).unwrap(), cmd);
    }

    #[test]
    fn test_replicate_binary_roundtrip() {
        let msg = ParticipantMessage::Replicate(vec![
            ReplicaChange::Roster(MapOp::Clear),
            ReplicaChange::Roster(MapOp::Set(
                ConnectionId(1),
                RosterEntry { ready: true, display_name: "Bob".into(), external_id: ExternalId(2) },
            )),
            ReplicaChange::Rtt(MapOp::Remove(ConnectionId(4))),
            ReplicaChange::Config(MapOp::Set("sv_autobhop".into(), ConfigValue::Int(0))),
            ReplicaChange::MatchTimer { remaining: 42 },
        ]);

        let bytes = msg.to_bytes().unwrap();
        assert_eq!(ParticipantMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_json_shape() {
        let cmd = AuthorityCommand::ForceStart { level: LevelId::new("Surf_Intro"), match_seconds: 180 };
        let json = cmd.to_json().unwrap();
        assert!(json.contains("force_start"));
        assert!(json.contains("Surf_Intro"));
        assert_eq!(AuthorityCommand::from_json(&json).unwrap(), cmd);

        let msg = ParticipantMessage::ReturnToMenu { menu: LevelId::new("MainMenu") };
        assert!(msg.to_json().unwrap().contains("return_to_menu"));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            AuthorityCommand::from_bytes(&[0xff, 0xff, 0xff, 0xff, 0x01]),
            Err(ProtocolError::Binary(_))
        ));
        assert!(matches!(
            ParticipantMessage::from_json("{\"nope\":1}"),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_command_kind() {
        assert_eq!(AuthorityCommand::RequestRespawn { entity: EntityId(1) }.kind(), "request_respawn");
    }
}
