//! Network Layer
//!
//! Rendezvous, transport and the session node that ties them to the game
//! state. Time and I/O enter here; `game/` only sees decoded commands.

pub mod replica;
pub mod protocol;
pub mod transport;
pub mod loopback;
pub mod presence;
pub mod rendezvous;
pub mod local_rendezvous;
pub mod node;

pub use replica::{MapOp, Mirror, Owner, ReplicaRole, ReplicatedMap};
pub use protocol::{AuthorityCommand, ParticipantMessage, ProtocolError, ReplicaChange};
pub use transport::{Transport, TransportError, TransportEvent};
pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use presence::{PeerIdentity, PingScheduler, PresenceTable, PresenceView, ScoreRow};
pub use rendezvous::{
    LobbyNotification, RendezvousClient, RendezvousError, RendezvousEvent, RendezvousService,
    Session, SessionPhase,
};
pub use local_rendezvous::{LocalRendezvous, RendezvousDirectory};
pub use node::{
    run_node, IdentityPolicy, LevelScene, LoadMode, NodeConfig, SceneLoader, SessionError,
    SessionNode,
};
#[cfg(any(test, feature = "demo"))]
pub use node::RecordingScenes;
