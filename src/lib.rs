//! # Surf Lobby
//!
//! Session and match-lifecycle coordinator for listen-server surf matches:
//! one participant hosts, everyone else connects to it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        SURF LOBBY                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/              - Primitives                             │
//! │  ├── ids.rs         - Connection, session, level ids         │
//! │  ├── math.rs        - Vec3 / Quat / Transform                │
//! │  └── rng.rs         - Seeded Xorshift128+ for spawns         │
//! │                                                              │
//! │  game/              - Session state (time passed in)         │
//! │  ├── roster.rs      - Readiness and force start              │
//! │  ├── config_store.rs- Replicated movement tunables           │
//! │  ├── match_flow.rs  - Match timer, expiry, respawns          │
//! │  ├── spawn.rs       - Spawn zones                            │
//! │  └── death_watch.rs - Fall detection                         │
//! │                                                              │
//! │  network/           - Rendezvous, transport, dispatch        │
//! │  ├── rendezvous.rs  - Lobby formation                        │
//! │  ├── presence.rs    - Ping/pong RTT and identities           │
//! │  ├── protocol.rs    - Authority commands / participant msgs  │
//! │  ├── loopback.rs    - In-process transport                   │
//! │  └── node.rs        - SessionNode + async runner             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Session lifecycle
//!
//! `Forming` → (create or join) → `InLobby` → (host force start) →
//! `InGame` → (timer expiry + grace) → `Forming`.
//!
//! The authority is the single writer of the roster, presence and config
//! tables; participants hold read-only mirrors updated by one replication
//! broadcast per node update.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use core::ids::{ConnectionId, EntityId, ExternalId, LevelId, SessionId};
pub use core::rng::DeterministicRng;
pub use game::context::SessionContext;
pub use game::roster::SessionRoster;
pub use game::config_store::ConfigStore;
pub use game::match_flow::MatchController;
pub use network::node::{run_node, NodeConfig, SessionError, SessionNode};
pub use network::rendezvous::{RendezvousClient, SessionPhase};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
