//! Rendezvous Client
//!
//! Lobby formation on top of an external session-discovery service.
//!
//! ## Flow
//!
//! ```text
//! host:   create_session ─> Created(Ok) ─> publish metadata ─> StartHosting
//! joiner: join_session / invite ─> Entered ─> read host_id ─> ConnectTo
//! ```
//!
//! The service is asynchronous: requests return immediately and results come
//! back as [`RendezvousEvent`]s, which [`RendezvousClient::handle`] turns into
//! transport actions for the node. Lobby notifications for the presentation
//! layer are published on a broadcast channel.

use serde::{Serialize, Deserialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::core::ids::{ExternalId, LevelId, SessionId};

// =============================================================================
// CONSTANTS
// =============================================================================

/// Metadata key: decimal platform identity of the host.
pub const META_HOST_ID: &str = "host_id";
/// Metadata key: `lobby` or `in_game`.
pub const META_STATE: &str = "state";
/// Metadata key: selected level id.
pub const META_LEVEL: &str = "level";
/// Metadata key: capacity.
pub const META_MAX: &str = "max";

/// `state` value while forming the lobby.
pub const STATE_LOBBY: &str = "lobby";
/// `state` value once the match started.
pub const STATE_IN_GAME: &str = "in_game";

/// Smallest lobby capacity.
pub const MIN_PARTICIPANTS: u32 = 2;
/// Largest lobby capacity.
pub const MAX_PARTICIPANTS: u32 = 10;

// =============================================================================
// SERVICE CONTRACT
// =============================================================================

/// Rendezvous failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RendezvousError {
    /// The service could not create a session.
    #[error("session creation failed: {0}")]
    CreateFailed(String),
    /// Only one session at a time.
    #[error("already in session {0}")]
    AlreadyInSession(SessionId),
    /// A create request is outstanding.
    #[error("a session is already being created")]
    CreatePending,
    /// No current session.
    #[error("not in a session")]
    NotInSession,
    /// Owner-only operation.
    #[error("only the host may do this")]
    NotHost,
    /// No such session.
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    /// Capacity reached.
    #[error("session {0} is full")]
    SessionFull(SessionId),
    /// Closed to new members.
    #[error("session {0} is not joinable")]
    NotJoinable(SessionId),
    /// Host id metadata absent or unparseable.
    #[error("session {0} has no usable host identity")]
    MissingHostIdentity(SessionId),
    /// Another handle holds this identity.
    #[error("identity {0} already acquired")]
    IdentityInUse(ExternalId),
}

/// Asynchronous results from the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RendezvousEvent {
    /// Outcome of a `create` request.
    Created(Result<SessionId, RendezvousError>),
    /// We are now a member of `session` (as creator or joiner).
    Entered {
        /// Session entered.
        session: SessionId,
    },
    /// A `join` request failed.
    JoinFailed {
        /// Session we tried to join.
        session: SessionId,
        /// Why the join failed.
        error: RendezvousError,
    },
    /// The platform asked us to join `session` (e.g. an accepted invite).
    JoinRequested {
        /// Session to join.
        session: SessionId,
    },
}

/// External session-discovery service.
pub trait RendezvousService: Send {
    /// Our platform identity.
    fn local_identity(&self) -> ExternalId;

    /// Request a new friends-only session. Answered by `Created`, then `Entered`.
    fn create(&mut self, capacity: u32);

    /// Request to join. Answered by `Entered` or `JoinFailed`.
    fn join(&mut self, session: SessionId);

    /// Leave a session.
    fn leave(&mut self, session: SessionId);

    /// Read a metadata value.
    fn metadata(&self, session: SessionId, key: &str) -> Option<String>;

    /// Write a metadata value (owner only).
    fn set_metadata(&mut self, session: SessionId, key: &str, value: &str) -> Result<(), RendezvousError>;

    /// Open or close the session to new members (owner only).
    fn set_joinable(&mut self, session: SessionId, joinable: bool) -> Result<(), RendezvousError>;

    /// Drain pending events.
    fn poll(&mut self) -> Vec<RendezvousEvent>;
}

// =============================================================================
// CLIENT STATE
// =============================================================================

/// Lifecycle of the session this process is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// No session yet.
    Forming,
    /// Gathering participants.
    InLobby,
    /// Match running; late joins blocked.
    InGame,
}

/// The session this process is a member of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Rendezvous session id.
    pub id: SessionId,
    /// Host identity.
    pub authority: ExternalId,
    /// Current lifecycle phase.
    pub phase: SessionPhase,
    /// Level published by the host.
    pub selected_level: LevelId,
    /// Capacity published by the host.
    pub max_participants: u32,
}

/// Transport work requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousAction {
    /// Listen as `host` and connect to ourselves.
    StartHosting {
        /// Our identity.
        host: ExternalId,
    },
    /// Connect to the authority at `host`.
    ConnectTo {
        /// Host identity.
        host: ExternalId,
    },
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LobbyNotification {
    /// We now host a session.
    Created {
        /// New session.
        session: SessionId,
    },
    /// Hosting failed.
    CreateFailed {
        /// Service error.
        error: RendezvousError,
    },
    /// We entered a session.
    Entered {
        /// Session entered.
        session: SessionId,
        /// Whether we host it.
        hosting: bool,
    },
    /// A join failed.
    JoinFailed {
        /// Session we tried to join.
        session: SessionId,
        /// Why the join failed.
        error: RendezvousError,
    },
    /// The hosted session went in game.
    InGame {
        /// Session now in game.
        session: SessionId,
        /// Match level.
        level: LevelId,
    },
    /// We left a session.
    Left {
        /// Session left.
        session: SessionId,
    },
}

#[derive(Debug, Clone)]
struct PendingCreate {
    max_participants: u32,
    level: LevelId,
}

/// Lobby-formation client.
pub struct RendezvousClient {
    service: Box<dyn RendezvousService>,
    session: Option<Session>,
    hosting: bool,
    pending_create: Option<PendingCreate>,
    notify_tx: broadcast::Sender<LobbyNotification>,
}

impl RendezvousClient {
    /// Wrap a service.
    pub fn new(service: Box<dyn RendezvousService>) -> Self {
        let (notify_tx, _) = broadcast::channel(64);
        Self {
            service,
            session: None,
            hosting: false,
            pending_create: None,
            notify_tx,
        }
    }

    /// Subscribe to lobby notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<LobbyNotification> {
        self.notify_tx.subscribe()
    }

    /// Our platform identity.
    pub fn local_identity(&self) -> ExternalId {
        self.service.local_identity()
    }

    /// Current session, if any.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Current phase (`Forming` outside a session).
    pub fn phase(&self) -> SessionPhase {
        self.session.as_ref().map(|s| s.phase).unwrap_or(SessionPhase::Forming)
    }

    /// Whether this process created the current session.
    pub fn is_hosting(&self) -> bool {
        self.hosting
    }

    /// Request a restricted-visibility session. Capacity is clamped to 2..=10.
    pub fn create_session(&mut self, max_participants: u32, level: LevelId) -> Result<(), RendezvousError> {
        if let Some(session) = &self.session {
            return Err(RendezvousError::AlreadyInSession(session.id));
        }
        if self.pending_create.is_some() {
            return Err(RendezvousError::CreatePending);
        }

        let max_participants = max_participants.clamp(MIN_PARTICIPANTS, MAX_PARTICIPANTS);
        info!("Creating session (max={}, level={})", max_participants, level);

        self.hosting = true;
        self.pending_create = Some(PendingCreate { max_participants, level });
        self.service.create(max_participants);
        Ok(())
    }

    /// Ask the service to join `session`.
    pub fn join_session(&mut self, session: SessionId) -> Result<(), RendezvousError> {
        if let Some(current) = &self.session {
            return Err(RendezvousError::AlreadyInSession(current.id));
        }
        info!("Joining session {}", session.short());
        self.service.join(session);
        Ok(())
    }

    /// Publish `in_game` and close the session to late joiners.
    ///
    /// The local phase switches first; service write failures are logged and
    /// do not roll it back.
    pub fn mark_in_game(&mut self, level: &LevelId) -> Result<(), RendezvousError> {
        let session = self.session.as_mut().ok_or(RendezvousError::NotInSession)?;
        if !self.hosting {
            return Err(RendezvousError::NotHost);
        }

        let id = session.id;
        session.phase = SessionPhase::InGame;
        session.selected_level = level.clone();

        for (key, value) in [(META_STATE, STATE_IN_GAME), (META_LEVEL, level.as_str())] {
            if let Err(e) = self.service.set_metadata(id, key, value) {
                error!("Failed to publish {}: {}", key, e);
            }
        }
        if let Err(e) = self.service.set_joinable(id, false) {
            error!("Failed to close session: {}", e);
        }

        info!("Session {} in game on {}", id.short(), level);
        let _ = self.notify_tx.send(LobbyNotification::InGame { session: id, level: level.clone() });
        Ok(())
    }

    /// Record a phase change observed through the transport (participants).
    pub fn set_local_phase(&mut self, phase: SessionPhase) {
        if let Some(session) = self.session.as_mut() {
            session.phase = phase;
        }
    }

    /// Leave the current session. No-op outside a session.
    pub fn leave_session(&mut self) {
        let Some(session) = self.session.take() else { return };

        self.service.leave(session.id);
        self.hosting = false;
        info!("Left session {}", session.short_id());
        let _ = self.notify_tx.send(LobbyNotification::Left { session: session.id });
    }

    /// Poll the service and handle every event.
    pub fn pump(&mut self) -> Vec<RendezvousAction> {
        let events = self.service.poll();
        events.into_iter().flat_map(|e| self.handle(e)).collect()
    }

    /// Handle one service event.
    pub fn handle(&mut self, event: RendezvousEvent) -> Vec<RendezvousAction> {
        match event {
            RendezvousEvent::Created(Ok(id)) => self.on_created(id),
            RendezvousEvent::Created(Err(error)) => {
                error!("Session create failed: {}", error);
                self.hosting = false;
                self.pending_create = None;
                let _ = self.notify_tx.send(LobbyNotification::CreateFailed { error });
                Vec::new()
            }
            RendezvousEvent::Entered { session } => self.on_entered(session),
            RendezvousEvent::JoinFailed { session, error } => {
                error!("Join {} failed: {}", session.short(), error);
                let _ = self.notify_tx.send(LobbyNotification::JoinFailed { session, error });
                Vec::new()
            }
            RendezvousEvent::JoinRequested { session } => {
                info!("Join requested for {}", session.short());
                if let Err(e) = self.join_session(session) {
                    warn!("Ignoring join request: {}", e);
                }
                Vec::new()
            }
        }
    }

    fn on_created(&mut self, id: SessionId) -> Vec<RendezvousAction> {
        let Some(pending) = self.pending_create.take() else {
            warn!("Unexpected create result for {}", id.short());
            return Vec::new();
        };

        let host = self.service.local_identity();
        let metadata = [
            (META_HOST_ID, host.to_string()),
            (META_STATE, STATE_LOBBY.to_string()),
            (META_LEVEL, pending.level.as_str().to_string()),
            (META_MAX, pending.max_participants.to_string()),
        ];
        for (key, value) in &metadata {
            if let Err(e) = self.service.set_metadata(id, key, value) {
                error!("Failed to publish {}: {}", key, e);
            }
        }
        if let Err(e) = self.service.set_joinable(id, true) {
            error!("Failed to open session: {}", e);
        }

        self.session = Some(Session {
            id,
            authority: host,
            phase: SessionPhase::InLobby,
            selected_level: pending.level,
            max_participants: pending.max_participants,
        });

        info!("Session {} created, hosting as {}", id.short(), host);
        let _ = self.notify_tx.send(LobbyNotification::Created { session: id });
        vec![RendezvousAction::StartHosting { host }]
    }

    fn on_entered(&mut self, id: SessionId) -> Vec<RendezvousAction> {
        if self.hosting {
            if self.session.as_ref().map(|s| s.id) == Some(id) {
                let _ = self.notify_tx.send(LobbyNotification::Entered { session: id, hosting: true });
            }
            return Vec::new();
        }

        let Some(host) = self
            .service
            .metadata(id, META_HOST_ID)
            .as_deref()
            .and_then(ExternalId::parse)
        else {
            let error = RendezvousError::MissingHostIdentity(id);
            error!("{}", error);
            self.service.leave(id);
            let _ = self.notify_tx.send(LobbyNotification::JoinFailed { session: id, error });
            return Vec::new();
        };

        let phase = match self.service.metadata(id, META_STATE).as_deref() {
            Some(STATE_IN_GAME) => SessionPhase::InGame,
            _ => SessionPhase::InLobby,
        };
        let selected_level = self
            .service
            .metadata(id, META_LEVEL)
            .map(LevelId::new)
            .unwrap_or_default();
        let max_participants = self
            .service
            .metadata(id, META_MAX)
            .and_then(|m| m.parse().ok())
            .unwrap_or(MAX_PARTICIPANTS);

        self.session = Some(Session {
            id,
            authority: host,
            phase,
            selected_level,
            max_participants,
        });

        info!("Entered session {}; connecting to host {}", id.short(), host);
        let _ = self.notify_tx.send(LobbyNotification::Entered { session: id, hosting: false });
        vec![RendezvousAction::ConnectTo { host }]
    }
}

impl Session {
    /// Short id for log lines.
    pub fn short_id(&self) -> String {
        self.id.short()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use crate::network::local_rendezvous::{LocalRendezvous, RendezvousDirectory};

    const HOST: ExternalId = ExternalId(76561198000000001);
    const GUEST: ExternalId = ExternalId(76561198000000002);

    fn client(dir: &RendezvousDirectory, identity: ExternalId) -> RendezvousClient {
        RendezvousClient::new(Box::new(LocalRendezvous::acquire(dir, identity).unwrap()))
    }

    fn hosted(dir: &RendezvousDirectory) -> (RendezvousClient, SessionId) {
        let mut host = client(dir, HOST);
        host.create_session(10, LevelId::new("Surf_Intro")).unwrap();
        let actions = host.pump();
        assert_eq!(actions, vec![RendezvousAction::StartHosting { host: HOST }]);
        let id = host.session().unwrap().id;
        (host, id)
    }

    /// Local service that rejects every owner write except `state` once locked.
    struct PartialWrites {
        inner: LocalRendezvous,
        locked: Arc<AtomicBool>,
    }

    impl RendezvousService for PartialWrites {
        fn local_identity(&self) -> ExternalId {
            self.inner.local_identity()
        }

        fn create(&mut self, capacity: u32) {
            self.inner.create(capacity);
        }

        fn join(&mut self, session: SessionId) {
            self.inner.join(session);
        }

        fn leave(&mut self, session: SessionId) {
            self.inner.leave(session);
        }

        fn metadata(&self, session: SessionId, key: &str) -> Option<String> {
            self.inner.metadata(session, key)
        }

        fn set_metadata(&mut self, session: SessionId, key: &str, value: &str) -> Result<(), RendezvousError> {
            if self.locked.load(Ordering::SeqCst) && key != META_STATE {
                return Err(RendezvousError::UnknownSession(session));
            }
            self.inner.set_metadata(session, key, value)
        }

        fn set_joinable(&mut self, session: SessionId, joinable: bool) -> Result<(), RendezvousError> {
            if self.locked.load(Ordering::SeqCst) {
                return Err(RendezvousError::UnknownSession(session));
            }
            self.inner.set_joinable(session, joinable)
        }

        fn poll(&mut self) -> Vec<RendezvousEvent> {
            self.inner.poll()
        }
    }

    #[test]
    fn test_create_publishes_metadata() {
        let dir = RendezvousDirectory::new();
        let (host, id) = hosted(&dir);

        assert_eq!(host.phase(), SessionPhase::InLobby);
        assert!(host.is_hosting());
        assert_eq!(dir.metadata(id, META_HOST_ID), Some(HOST.to_string()));
        assert_eq!(dir.metadata(id, META_STATE), Some("lobby".to_string()));
        assert_eq!(dir.metadata(id, META_LEVEL), Some("Surf_Intro".to_string()));
        assert_eq!(dir.metadata(id, META_MAX), Some("10".to_string()));
        assert_eq!(dir.is_joinable(id), Some(true));
    }

    #[test]
    fn test_capacity_clamped() {
        let dir = RendezvousDirectory::new();
        let mut host = client(&dir, HOST);
        host.create_session(64, LevelId::new("Surf_Intro")).unwrap();
        host.pump();

        let id = host.session().unwrap().id;
        assert_eq!(host.session().unwrap().max_participants, 10);
        assert_eq!(dir.capacity(id), Some(10));

        let mut small = client(&dir, GUEST);
        small.create_session(1, LevelId::new("Surf_Intro")).unwrap();
        small.pump();
        assert_eq!(small.session().unwrap().max_participants, 2);
    }

    #[test]
    fn test_create_failure_resets_hosting() {
        let dir = RendezvousDirectory::new();
        let mut host = client(&dir, HOST);
        let mut rx = host.subscribe();

        dir.fail_next_create();
        host.create_session(10, LevelId::new("Surf_Intro")).unwrap();
        assert!(host.pump().is_empty());

        assert!(!host.is_hosting());
        assert_eq!(host.phase(), SessionPhase::Forming);
        assert!(matches!(rx.try_recv(), Ok(LobbyNotification::CreateFailed { .. })));

        // Non-fatal: a retry works
        host.create_session(10, LevelId::new("Surf_Intro")).unwrap();
        assert_eq!(host.pump().len(), 1);
    }

    #[test]
    fn test_one_session_at_a_time() {
        let dir = RendezvousDirectory::new();
        let (mut host, id) = hosted(&dir);

        assert_eq!(
            host.create_session(4, LevelId::new("Surf_Intro")),
            Err(RendezvousError::AlreadyInSession(id))
        );
    }

    #[test]
    fn test_joiner_connects_to_host() {
        let dir = RendezvousDirectory::new();
        let (_host, id) = hosted(&dir);
        let mut guest = client(&dir, GUEST);

        guest.join_session(id).unwrap();
        assert_eq!(guest.pump(), vec![RendezvousAction::ConnectTo { host: HOST }]);
        assert!(!guest.is_hosting());
        assert_eq!(guest.session().unwrap().authority, HOST);
    }

    #[test]
    fn test_invite_joins() {
        let dir = RendezvousDirectory::new();
        let (_host, id) = hosted(&dir);
        let mut guest = client(&dir, GUEST);

        dir.invite(id, GUEST);
        assert!(guest.pump().is_empty());
        assert_eq!(guest.pump(), vec![RendezvousAction::ConnectTo { host: HOST }]);
    }

    #[test]
    fn test_missing_host_identity_aborts() {
        let dir = RendezvousDirectory::new();
        let (mut host, id) = hosted(&dir);
        dir.remove_metadata(id, META_HOST_ID);

        let mut guest = client(&dir, GUEST);
        let mut rx = guest.subscribe();
        guest.join_session(id).unwrap();

        assert!(guest.pump().is_empty());
        assert_eq!(
            rx.try_recv().unwrap(),
            LobbyNotification::JoinFailed { session: id, error: RendezvousError::MissingHostIdentity(id) }
        );
        // No retry on later polls
        assert!(guest.pump().is_empty());
        assert!(guest.session().is_none());
        assert_eq!(dir.members(id), vec![HOST]);

        // A later join is not blocked by the failed one
        host.service.set_metadata(id, META_HOST_ID, &HOST.to_string()).unwrap();
        guest.join_session(id).unwrap();
        assert_eq!(guest.pump(), vec![RendezvousAction::ConnectTo { host: HOST }]);
        assert_eq!(guest.session().unwrap().authority, HOST);
    }

    #[test]
    fn test_mark_in_game_blocks_late_join() {
        let dir = RendezvousDirectory::new();
        let (mut host, id) = hosted(&dir);

        host.mark_in_game(&LevelId::new("Surf_Intro")).unwrap();
        assert_eq!(host.phase(), SessionPhase::InGame);
        assert_eq!(dir.metadata(id, META_STATE), Some("in_game".to_string()));
        assert_eq!(dir.is_joinable(id), Some(false));

        let mut late = client(&dir, GUEST);
        late.join_session(id).unwrap();
        assert!(late.pump().is_empty());
        assert!(late.session().is_none());
    }

    #[test]
    fn test_mark_in_game_survives_rejected_writes() {
        let dir = RendezvousDirectory::new();
        let locked = Arc::new(AtomicBool::new(false));
        let service = PartialWrites {
            inner: LocalRendezvous::acquire(&dir, HOST).unwrap(),
            locked: locked.clone(),
        };
        let mut host = RendezvousClient::new(Box::new(service));
        let mut rx = host.subscribe();
        host.create_session(10, LevelId::new("Surf_Intro")).unwrap();
        host.pump();
        let id = host.session().unwrap().id;

        locked.store(true, Ordering::SeqCst);
        host.mark_in_game(&LevelId::new("Surf_Utopia")).unwrap();

        assert_eq!(host.phase(), SessionPhase::InGame);
        assert_eq!(host.session().unwrap().selected_level, LevelId::new("Surf_Utopia"));
        assert_eq!(dir.metadata(id, META_STATE), Some("in_game".to_string()));
        assert_eq!(dir.metadata(id, META_LEVEL), Some("Surf_Intro".to_string()));
        assert_eq!(dir.is_joinable(id), Some(true));

        let notes: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(notes.contains(&LobbyNotification::InGame { session: id, level: LevelId::new("Surf_Utopia") }));
    }

    #[test]
    fn test_mark_in_game_requires_host() {
        let dir = RendezvousDirectory::new();
        let (_host, id) = hosted(&dir);
        let mut guest = client(&dir, GUEST);
        guest.join_session(id).unwrap();
        guest.pump();

        assert_eq!(guest.mark_in_game(&LevelId::new("Surf_Intro")), Err(RendezvousError::NotHost));
    }

    #[test]
    fn test_leave_session() {
        let dir = RendezvousDirectory::new();
        let (mut host, id) = hosted(&dir);
        let mut rx = host.subscribe();

        host.leave_session();
        assert_eq!(host.phase(), SessionPhase::Forming);
        assert!(!host.is_hosting());
        assert_eq!(rx.try_recv().unwrap(), LobbyNotification::Left { session: id });

        // Second leave is a no-op
        host.leave_session();
        assert!(rx.try_recv().is_err());
    }
}
