//! Session Node
//!
//! One process's view of a session: the authority half (when hosting), the
//! participant half (when connected) and the rendezvous client that forms
//! the lobby.
//!
//! ## Dispatch
//!
//! ```text
//!                ┌──────────────── SessionNode::update(now) ────────────────┐
//! rendezvous ──> │ actions: StartHosting / ConnectTo                        │
//! transport  ──> │ CommandReceived  ──> authority handlers (roster, match,  │
//!                │                      presence, config)                   │
//!                │ MessageReceived  ──> participant handlers (mirrors,      │
//!                │                      pings, scene orders)                │
//!                │ match tick ─> replication flush ─> end-of-match order    │
//!                └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Commands are decoded as [`AuthorityCommand`] and only ever reach the
//! authority state; messages are decoded as [`ParticipantMessage`] and only
//! ever reach the participant state. Replicated tables change once per
//! update, as one `Replicate` broadcast.

use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::core::ids::{ConnectionId, EntityId, ExternalId, LevelId, SessionId};
use crate::core::rng::DeterministicRng;
use crate::game::catalog::LevelCatalog;
use crate::game::config_store::{ConfigStore, ConfigValue, ConfigView, MotorTuning};
use crate::game::console::{ConsoleCommand, ConsoleError};
use crate::game::context::SessionContext;
use crate::game::death_watch::DeathWatch;
use crate::game::match_flow::{AvatarDriver, MatchController, MatchError, MatchSettings, MatchSignal};
use crate::game::roster::{LobbyRow, RosterEntry, RosterView, SessionRoster};
use crate::game::spawn::SpawnZone;
use crate::network::presence::{PingScheduler, PresenceTable, PresenceView, ScoreRow};
use crate::network::protocol::{AuthorityCommand, ParticipantMessage, ProtocolError, ReplicaChange};
use crate::network::rendezvous::{
    LobbyNotification, RendezvousAction, RendezvousClient, RendezvousError, SessionPhase,
    MAX_PARTICIPANTS, MIN_PARTICIPANTS,
};
use crate::network::transport::{Transport, TransportError, TransportEvent};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Where command identities come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityPolicy {
    /// Key roster/presence updates by the transport sender, check respawn
    /// ownership, and accept force start only from the host's own connection.
    SenderVerified,
    /// Trust ids carried in payloads (closed friends-only sessions). Default.
    TrustPayload,
}

impl IdentityPolicy {
    /// Parse `sender_verified` / `trust_payload`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sender_verified" => Some(Self::SenderVerified),
            "trust_payload" => Some(Self::TrustPayload),
            _ => None,
        }
    }
}

/// Node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Default lobby capacity (clamped 2..=10).
    pub max_participants: u32,
    /// Level loaded when leaving a session or after a match.
    pub menu_level: LevelId,
    /// Level loaded on entering a session.
    pub lobby_level: LevelId,
    /// Name this process reports for itself.
    pub display_name: String,
    /// Height below which avatars count as fallen.
    pub kill_y: f32,
    /// Seconds between presence pings.
    pub ping_interval: f64,
    /// Seconds between match expiry and teardown.
    pub teardown_grace: f64,
    /// Seconds between a fall and the respawn request.
    pub respawn_delay: f64,
    /// Update rate of [`run_node`] (Hz).
    pub tick_rate: u32,
    /// Identity handling for incoming commands.
    pub identity_policy: IdentityPolicy,
    /// Keep roster/presence rows of disconnected participants.
    pub retain_departed: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            max_participants: MAX_PARTICIPANTS,
            menu_level: LevelId::new("MainMenu"),
            lobby_level: LevelId::new("Lobby"),
            display_name: "Player".to_string(),
            kill_y: -100.0,
            ping_interval: 2.0,
            teardown_grace: 0.5,
            respawn_delay: 5.0,
            tick_rate: 60,
            identity_policy: IdentityPolicy::TrustPayload,
            retain_departed: false,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl NodeConfig {
    /// Load from `SURF_*` environment variables; unset or invalid values keep defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_participants: env_parse::<u32>("SURF_MAX_PARTICIPANTS")
                .unwrap_or(d.max_participants)
                .clamp(MIN_PARTICIPANTS, MAX_PARTICIPANTS),
            menu_level: std::env::var("SURF_MENU_LEVEL").map(LevelId::new).unwrap_or(d.menu_level),
            lobby_level: std::env::var("SURF_LOBBY_LEVEL").map(LevelId::new).unwrap_or(d.lobby_level),
            display_name: std::env::var("SURF_DISPLAY_NAME").unwrap_or(d.display_name),
            kill_y: env_parse("SURF_KILL_Y").unwrap_or(d.kill_y),
            tick_rate: env_parse::<u32>("SURF_TICK_RATE").unwrap_or(d.tick_rate).max(1),
            identity_policy: std::env::var("SURF_IDENTITY_POLICY")
                .ok()
                .and_then(|v| IdentityPolicy::parse(&v))
                .unwrap_or(d.identity_policy),
            retain_departed: std::env::var("SURF_RETAIN_DEPARTED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            ..d
        }
    }

    fn match_settings(&self) -> MatchSettings {
        MatchSettings { kill_y: self.kill_y, teardown_grace: self.teardown_grace }
    }
}

// =============================================================================
// SCENE FACILITY
// =============================================================================

/// How a level load treats already-loaded levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Unload everything, then load the level.
    ReplaceAll,
}

/// Scene loading facility. Loads complete asynchronously; the host application
/// reports completion through [`SessionNode::on_level_entered`].
pub trait SceneLoader: Send {
    /// Request a level load.
    fn load(&mut self, level: &LevelId, mode: LoadMode);
}

/// A loaded level as reported by the host application.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelScene {
    /// Level that finished loading.
    pub level: LevelId,
    /// Spawn zones found in the level, in discovery order.
    pub spawn_zones: Vec<SpawnZone>,
}

#[cfg(any(test, feature = "demo"))]
pub use recording::RecordingScenes;

#[cfg(any(test, feature = "demo"))]
mod recording {
    use std::sync::{Arc, Mutex, PoisonError};

    use super::{LoadMode, SceneLoader};
    use crate::core::ids::LevelId;

    /// Scene loader that records requested loads. Clones share the log.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingScenes {
        loads: Arc<Mutex<Vec<LevelId>>>,
    }

    impl RecordingScenes {
        /// Create with an empty log.
        pub fn new() -> Self {
            Self::default()
        }

        /// Every level requested so far.
        pub fn loads(&self) -> Vec<LevelId> {
            self.loads.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }

        /// Most recent load.
        pub fn current(&self) -> Option<LevelId> {
            self.loads().last().cloned()
        }
    }

    impl SceneLoader for RecordingScenes {
        fn load(&mut self, level: &LevelId, _mode: LoadMode) {
            self.loads.lock().unwrap_or_else(PoisonError::into_inner).push(level.clone());
        }
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Failures of user-facing node operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The operation needs an authority connection.
    #[error("not connected to an authority")]
    NotConnected,
    /// Force start without a level.
    #[error("no level selected")]
    NoLevelSelected,
    /// Rendezvous failure.
    #[error(transparent)]
    Rendezvous(#[from] RendezvousError),
    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Encoding failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// Bad console line.
    #[error(transparent)]
    Console(#[from] ConsoleError),
}

// =============================================================================
// ROLE STATE
// =============================================================================

/// Authority half.
struct AuthorityState {
    roster: SessionRoster,
    presence: PresenceTable,
    config: ConfigStore,
    match_ctl: Option<MatchController>,
    pending_level: Option<LevelId>,
    local_connection: Option<ConnectionId>,
    connections: BTreeSet<ConnectionId>,
    timer_dirty: Option<u32>,
}

impl AuthorityState {
    fn new() -> Self {
        let mut roster = SessionRoster::new();
        roster.reset();
        let mut presence = PresenceTable::new();
        presence.reset();
        let mut config = ConfigStore::new();
        config.initialize_defaults();

        Self {
            roster,
            presence,
            config,
            match_ctl: None,
            pending_level: None,
            local_connection: None,
            connections: BTreeSet::new(),
            timer_dirty: None,
        }
    }

    fn snapshot(&self) -> Vec<ReplicaChange> {
        let mut changes = Vec::new();
        changes.extend(self.roster.snapshot().into_iter().map(ReplicaChange::Roster));
        changes.extend(self.presence.rtt_snapshot().into_iter().map(ReplicaChange::Rtt));
        changes.extend(self.presence.identity_snapshot().into_iter().map(ReplicaChange::Identity));
        changes.extend(self.config.snapshot().into_iter().map(ReplicaChange::Config));
        if let Some(ctl) = &self.match_ctl {
            changes.push(ReplicaChange::MatchTimer { remaining: ctl.remaining() });
        }
        changes
    }

    fn drain_changes(&mut self) -> Vec<ReplicaChange> {
        let mut changes = Vec::new();
        changes.extend(self.roster.drain_changes().into_iter().map(ReplicaChange::Roster));
        changes.extend(self.presence.drain_rtt_changes().into_iter().map(ReplicaChange::Rtt));
        changes.extend(self.presence.drain_identity_changes().into_iter().map(ReplicaChange::Identity));
        changes.extend(self.config.drain_changes().into_iter().map(ReplicaChange::Config));
        if let Some(remaining) = self.timer_dirty.take() {
            changes.push(ReplicaChange::MatchTimer { remaining });
        }
        changes
    }
}

/// Participant half.
struct ParticipantState {
    connection: ConnectionId,
    roster: RosterView,
    presence: PresenceView,
    config: ConfigView,
    pinger: PingScheduler,
    timer: Option<u32>,
    death_watch: DeathWatch,
}

impl ParticipantState {
    fn new(connection: ConnectionId, config: &NodeConfig) -> Self {
        Self {
            connection,
            roster: RosterView::new(),
            presence: PresenceView::new(),
            config: ConfigView::new(),
            pinger: PingScheduler::new(config.ping_interval),
            timer: None,
            death_watch: DeathWatch::new(config.kill_y, config.respawn_delay),
        }
    }

    fn known_connections(&self) -> Vec<ConnectionId> {
        let mut ids: BTreeSet<ConnectionId> = self.roster.readiness().map(|(id, _)| id).collect();
        ids.extend(self.presence.connections());
        ids.insert(self.connection);
        ids.into_iter().collect()
    }

    fn apply(&mut self, change: ReplicaChange) {
        match change {
            ReplicaChange::Roster(op) => self.roster.apply(op),
            ReplicaChange::Rtt(op) => self.presence.apply_rtt(op),
            ReplicaChange::Identity(op) => self.presence.apply_identity(op),
            ReplicaChange::Config(op) => self.config.apply(op),
            ReplicaChange::MatchTimer { remaining } => self.timer = Some(remaining),
        }
    }
}

// =============================================================================
// NODE
// =============================================================================

/// A session participant process, optionally also the authority.
pub struct SessionNode {
    config: NodeConfig,
    transport: Box<dyn Transport>,
    rendezvous: RendezvousClient,
    lobby_rx: broadcast::Receiver<LobbyNotification>,
    scenes: Box<dyn SceneLoader>,
    avatars: Box<dyn AvatarDriver>,
    catalog: LevelCatalog,
    context: SessionContext,
    authority: Option<AuthorityState>,
    participant: Option<ParticipantState>,
    current_level: Option<LevelId>,
    match_index: u32,
}

impl SessionNode {
    /// Assemble a node from its collaborators.
    pub fn new(
        config: NodeConfig,
        transport: Box<dyn Transport>,
        rendezvous: RendezvousClient,
        scenes: Box<dyn SceneLoader>,
        avatars: Box<dyn AvatarDriver>,
    ) -> Self {
        let lobby_rx = rendezvous.subscribe();
        Self {
            config,
            transport,
            rendezvous,
            lobby_rx,
            scenes,
            avatars,
            catalog: LevelCatalog::default(),
            context: SessionContext::default(),
            authority: None,
            participant: None,
            current_level: None,
            match_index: 0,
        }
    }

    /// Replace the level catalog offered when hosting.
    pub fn with_catalog(mut self, catalog: LevelCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    // -------------------------------------------------------------------------
    // UI operations
    // -------------------------------------------------------------------------

    /// Host a session for `level`.
    pub fn create_session(&mut self, max_participants: u32, level: LevelId) -> Result<(), SessionError> {
        self.rendezvous.create_session(max_participants, level.clone())?;
        self.context.selected_level = level;
        Ok(())
    }

    /// Host a session for a catalog entry, using the configured capacity.
    pub fn host_from_catalog(&mut self, index: usize) -> Result<(), SessionError> {
        let context = SessionContext::from_selection(&self.catalog, index);
        self.rendezvous
            .create_session(self.config.max_participants, context.selected_level.clone())?;
        self.context = context;
        Ok(())
    }

    /// Join a session (e.g. from an invite).
    pub fn join_session(&mut self, session: SessionId) -> Result<(), SessionError> {
        self.rendezvous.join_session(session)?;
        Ok(())
    }

    /// Submit our readiness to the authority.
    pub fn set_ready(&mut self, ready: bool) -> Result<(), SessionError> {
        let connection = self.participant.as_ref().ok_or(SessionError::NotConnected)?.connection;
        let cmd = AuthorityCommand::SetReady {
            connection,
            ready,
            display_name: self.config.display_name.clone(),
            external_id: self.rendezvous.local_identity(),
        };
        self.send_command(&cmd)
    }

    /// Ask the authority to start the match on `level`.
    pub fn force_start(&mut self, level: LevelId, match_seconds: u32) -> Result<(), SessionError> {
        if level.is_empty() {
            return Err(SessionError::NoLevelSelected);
        }
        self.send_command(&AuthorityCommand::ForceStart { level, match_seconds })
    }

    /// Force start with the level and duration chosen when hosting.
    pub fn force_start_selected(&mut self) -> Result<(), SessionError> {
        let level = self.context.selected_level.clone();
        let seconds = self.context.match_seconds;
        self.force_start(level, seconds)
    }

    /// Ask the authority to respawn an avatar.
    pub fn request_respawn(&mut self, entity: EntityId) -> Result<(), SessionError> {
        self.send_command(&AuthorityCommand::RequestRespawn { entity })
    }

    /// Set a float tunable.
    pub fn mutate_float(&mut self, key: &str, value: f32) -> Result<(), SessionError> {
        self.send_command(&AuthorityCommand::SetConfig { key: key.to_string(), value: ConfigValue::Float(value) })
    }

    /// Set an int tunable.
    pub fn mutate_int(&mut self, key: &str, value: i32) -> Result<(), SessionError> {
        self.send_command(&AuthorityCommand::SetConfig { key: key.to_string(), value: ConfigValue::Int(value) })
    }

    /// Run a console line such as `sv_gravity 30`.
    pub fn submit_console(&mut self, line: &str) -> Result<(), SessionError> {
        let cmd = ConsoleCommand::parse(line)?;
        self.send_command(&AuthorityCommand::SetConfig { key: cmd.key, value: cmd.value })
    }

    /// Report an avatar height for fall detection. Only owned avatars count.
    pub fn observe_avatar_height(&mut self, entity: EntityId, height: f32, now: f64) {
        let Some(p) = self.participant.as_mut() else { return };
        if self.avatars.owner_of(entity) == Some(p.connection) {
            p.death_watch.observe(entity, height, now);
        }
    }

    /// Lobby leave: disconnect, leave the rendezvous session and load the menu.
    pub fn leave(&mut self) {
        info!("Leaving session");
        self.shutdown_transport();
        self.rendezvous.leave_session();
        self.load_level(self.config.menu_level.clone());
    }

    /// Escape-menu exit: disconnect and load the menu; the rendezvous session
    /// is left as is.
    pub fn exit_to_menu(&mut self) {
        info!("Exiting to menu");
        self.shutdown_transport();
        self.load_level(self.config.menu_level.clone());
    }

    // -------------------------------------------------------------------------
    // Read accessors
    // -------------------------------------------------------------------------

    /// Node configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Session lifecycle phase.
    pub fn phase(&self) -> SessionPhase {
        self.rendezvous.phase()
    }

    /// Rendezvous client.
    pub fn rendezvous(&self) -> &RendezvousClient {
        &self.rendezvous
    }

    /// Lobby-to-match settings.
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Level catalog.
    pub fn catalog(&self) -> &LevelCatalog {
        &self.catalog
    }

    /// Whether this node is the authority.
    pub fn is_authority(&self) -> bool {
        self.authority.is_some()
    }

    /// Our participant connection id.
    pub fn connection(&self) -> Option<ConnectionId> {
        self.participant.as_ref().map(|p| p.connection)
    }

    /// Roster row for a connection.
    pub fn roster_entry(&self, connection: ConnectionId) -> Option<RosterEntry> {
        match (&self.authority, &self.participant) {
            (Some(a), _) => a.roster.get(connection).cloned(),
            (None, Some(p)) => p.roster.get(connection).cloned(),
            _ => None,
        }
    }

    /// Number of ready participants.
    pub fn ready_count(&self) -> usize {
        match (&self.authority, &self.participant) {
            (Some(a), _) => a.roster.ready_count(),
            (None, Some(p)) => p.roster.ready_count(),
            _ => 0,
        }
    }

    /// Lobby list.
    pub fn lobby_rows(&self) -> Vec<LobbyRow> {
        match (&self.authority, &self.participant) {
            (Some(a), _) => {
                let ids: Vec<_> = a.connections.iter().copied().collect();
                a.roster.lobby_rows(&ids)
            }
            (None, Some(p)) => p.roster.lobby_rows(&p.known_connections()),
            _ => Vec::new(),
        }
    }

    /// Scoreboard rows.
    pub fn scoreboard(&self) -> Vec<ScoreRow> {
        match (&self.authority, &self.participant) {
            (Some(a), _) => {
                let ids: Vec<_> = a.connections.iter().copied().collect();
                a.presence.scoreboard(&ids)
            }
            (None, Some(p)) => p.presence.scoreboard(&p.known_connections()),
            _ => Vec::new(),
        }
    }

    /// RTT in milliseconds, `-1` if unknown.
    pub fn rtt(&self, connection: ConnectionId) -> i32 {
        match (&self.authority, &self.participant) {
            (Some(a), _) => a.presence.get_rtt(connection),
            (None, Some(p)) => p.presence.get_rtt(connection),
            _ => -1,
        }
    }

    /// Display name, `Client {id}` if unknown.
    pub fn display_name(&self, connection: ConnectionId) -> String {
        match (&self.authority, &self.participant) {
            (Some(a), _) => a.presence.get_name(connection),
            (None, Some(p)) => p.presence.get_name(connection),
            _ => crate::game::roster::fallback_name(connection),
        }
    }

    /// Platform identity, `0` if unknown.
    pub fn external_id(&self, connection: ConnectionId) -> ExternalId {
        match (&self.authority, &self.participant) {
            (Some(a), _) => a.presence.get_external_id(connection),
            (None, Some(p)) => p.presence.get_external_id(connection),
            _ => ExternalId::UNKNOWN,
        }
    }

    /// Float tunable, or `default`.
    pub fn config_float(&self, key: &str, default: f32) -> f32 {
        match (&self.authority, &self.participant) {
            (Some(a), _) => a.config.get_float(key, default),
            (None, Some(p)) => p.config.get_float(key, default),
            _ => default,
        }
    }

    /// Int tunable, or `default`.
    pub fn config_int(&self, key: &str, default: i32) -> i32 {
        match (&self.authority, &self.participant) {
            (Some(a), _) => a.config.get_int(key, default),
            (None, Some(p)) => p.config.get_int(key, default),
            _ => default,
        }
    }

    /// Movement parameters for the motor.
    pub fn motor_tuning(&self) -> MotorTuning {
        match (&self.authority, &self.participant) {
            (Some(a), _) => MotorTuning::from_config(&a.config),
            (None, Some(p)) => MotorTuning::from_config(&p.config),
            _ => MotorTuning::default(),
        }
    }

    /// Match seconds left: the authority's value on the host, the mirror elsewhere.
    pub fn timer_remaining(&self) -> Option<u32> {
        if let Some(ctl) = self.authority.as_ref().and_then(|a| a.match_ctl.as_ref()) {
            return Some(ctl.remaining());
        }
        self.participant.as_ref().and_then(|p| p.timer)
    }

    /// Fall height threshold.
    pub fn kill_y(&self) -> f32 {
        self.config.kill_y
    }

    /// Spawn zone of the running match (authority only).
    pub fn spawn_zone(&self) -> Option<&SpawnZone> {
        self.authority.as_ref()?.match_ctl.as_ref()?.spawn_zone()
    }

    /// Seconds until a fallen avatar's respawn request.
    pub fn respawn_countdown(&self, entity: EntityId, now: f64) -> Option<u32> {
        self.participant.as_ref()?.death_watch.remaining_seconds(entity, now)
    }

    // -------------------------------------------------------------------------
    // Driving
    // -------------------------------------------------------------------------

    /// Report that a requested level finished loading.
    pub fn on_level_entered(&mut self, scene: LevelScene, now: f64) {
        info!("Entered level {} ({} spawn zones)", scene.level, scene.spawn_zones.len());

        let Some(auth) = self.authority.as_mut() else { return };
        if auth.pending_level.as_ref() != Some(&scene.level) {
            return;
        }
        auth.pending_level = None;

        let session = self.rendezvous.session().map(|s| s.id).unwrap_or(SessionId(0));
        let rng = DeterministicRng::for_match(session, &scene.level, self.match_index);
        let ctl = MatchController::start(
            &self.context,
            &scene.spawn_zones,
            now,
            rng,
            self.config.match_settings(),
        );
        auth.timer_dirty = Some(ctl.remaining());
        auth.match_ctl = Some(ctl);
    }

    /// Advance the node to `now` (seconds on a monotonic clock).
    pub fn update(&mut self, now: f64) {
        for action in self.rendezvous.pump() {
            self.apply_rendezvous_action(action);
        }
        self.drain_lobby_notifications();

        for event in self.transport.poll() {
            self.dispatch(event, now);
        }

        self.tick_participant(now);

        let mut expired = false;
        let mut teardown = false;
        if let Some(auth) = self.authority.as_mut() {
            if let Some(ctl) = auth.match_ctl.as_mut() {
                for signal in ctl.update(now) {
                    match signal {
                        MatchSignal::TimerChanged(remaining) => auth.timer_dirty = Some(remaining),
                        MatchSignal::Expired => expired = true,
                        MatchSignal::TeardownDue => teardown = true,
                    }
                }
            }
        }

        self.flush_replication();

        if expired {
            let menu = self.config.menu_level.clone();
            info!("Match over; returning everyone to {}", menu);
            self.broadcast(&ParticipantMessage::ReturnToMenu { menu }, true);
        }
        if teardown {
            self.teardown();
        }
    }

    fn apply_rendezvous_action(&mut self, action: RendezvousAction) {
        match action {
            RendezvousAction::StartHosting { host } => {
                self.authority = Some(AuthorityState::new());
                if let Err(e) = self.transport.start_listening(host) {
                    error!("Failed to start hosting: {}", e);
                    self.authority = None;
                    self.rendezvous.leave_session();
                    return;
                }
                if let Err(e) = self.transport.start_connecting(host) {
                    error!("Host failed to connect to itself: {}", e);
                }
            }
            RendezvousAction::ConnectTo { host } => {
                if let Err(e) = self.transport.start_connecting(host) {
                    error!("Failed to connect to host {}: {}", host, e);
                }
            }
        }
    }

    fn drain_lobby_notifications(&mut self) {
        loop {
            match self.lobby_rx.try_recv() {
                Ok(LobbyNotification::Entered { session, .. }) => {
                    debug!("Entered {}; loading lobby", session.short());
                    self.load_level(self.config.lobby_level.clone());
                }
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!("Dropped {} lobby notifications", n);
                }
                Err(_) => break,
            }
        }
    }

    fn dispatch(&mut self, event: TransportEvent, now: f64) {
        match event {
            TransportEvent::ParticipantConnected { connection, local } => {
                self.on_participant_connected(connection, local)
            }
            TransportEvent::ParticipantDisconnected { connection } => {
                self.on_participant_disconnected(connection)
            }
            TransportEvent::CommandReceived { from, payload } => {
                match AuthorityCommand::from_bytes(&payload) {
                    Ok(cmd) => {
                        if cfg!(feature = "debug-tracing") {
                            if let Ok(json) = cmd.to_json() {
                                debug!("<- {} {}", from, json);
                            }
                        }
                        self.handle_command(from, cmd)
                    }
                    Err(e) => warn!("Undecodable command from {}: {}", from, e),
                }
            }
            TransportEvent::ConnectedToAuthority { connection } => {
                info!("Connected to authority as {}", connection);
                self.participant = Some(ParticipantState::new(connection, &self.config));
            }
            TransportEvent::DisconnectedFromAuthority => self.on_disconnected_from_authority(),
            TransportEvent::MessageReceived { payload } => {
                match ParticipantMessage::from_bytes(&payload) {
                    Ok(msg) => {
                        if cfg!(feature = "debug-tracing") {
                            if let Ok(json) = msg.to_json() {
                                debug!("-> {}", json);
                            }
                        }
                        self.handle_message(msg, now)
                    }
                    Err(e) => warn!("Undecodable message from authority: {}", e),
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Authority handlers
    // -------------------------------------------------------------------------

    fn on_participant_connected(&mut self, connection: ConnectionId, local: bool) {
        let Some(auth) = self.authority.as_mut() else { return };
        info!("Participant {} connected{}", connection, if local { " (local)" } else { "" });

        auth.connections.insert(connection);
        if local {
            auth.local_connection = Some(connection);
        }
        let snapshot = ParticipantMessage::Replicate(auth.snapshot());
        self.unicast(connection, &snapshot);
    }

    fn on_participant_disconnected(&mut self, connection: ConnectionId) {
        let retain = self.config.retain_departed;
        let Some(auth) = self.authority.as_mut() else { return };
        info!("Participant {} disconnected", connection);

        auth.connections.remove(&connection);
        if auth.local_connection == Some(connection) {
            auth.local_connection = None;
        }
        if !retain {
            auth.roster.remove(connection);
            auth.presence.remove(connection);
        }
    }

    /// Key a command by the sender or by its payload, per policy.
    fn resolve_identity(&self, from: ConnectionId, claimed: ConnectionId, what: &str) -> ConnectionId {
        match self.config.identity_policy {
            IdentityPolicy::TrustPayload => claimed,
            IdentityPolicy::SenderVerified => {
                if claimed != from {
                    warn!("{} from {} claimed connection {}; using sender", what, from, claimed);
                }
                from
            }
        }
    }

    fn handle_command(&mut self, from: ConnectionId, cmd: AuthorityCommand) {
        if self.authority.is_none() {
            debug!("Dropping {} from {}: not the authority", cmd.kind(), from);
            return;
        }

        match cmd {
            AuthorityCommand::SetReady { connection, ready, display_name, external_id } => {
                let key = self.resolve_identity(from, connection, "set_ready");
                if let Some(auth) = self.authority.as_mut() {
                    auth.roster.set_ready(key, ready, display_name, external_id);
                }
            }
            AuthorityCommand::ForceStart { level, match_seconds } => {
                self.on_force_start(from, level, match_seconds);
            }
            AuthorityCommand::Ping { connection, sent_at, display_name, external_id } => {
                let key = self.resolve_identity(from, connection, "ping");
                let pong = match self.authority.as_mut() {
                    Some(auth) => auth.presence.on_ping(key, sent_at, display_name, external_id),
                    None => return,
                };
                self.unicast(from, &pong);
            }
            AuthorityCommand::ReportRtt { connection, rtt_ms } => {
                let key = self.resolve_identity(from, connection, "report_rtt");
                if let Some(auth) = self.authority.as_mut() {
                    auth.presence.on_report(key, rtt_ms);
                }
            }
            AuthorityCommand::RequestRespawn { entity } => self.on_respawn(from, entity),
            AuthorityCommand::SetConfig { key, value } => {
                if let Some(auth) = self.authority.as_mut() {
                    auth.config.set(&key, value);
                }
            }
        }
    }

    fn on_force_start(&mut self, from: ConnectionId, level: LevelId, match_seconds: u32) {
        let policy = self.config.identity_policy;
        let Some(auth) = self.authority.as_mut() else { return };

        if policy == IdentityPolicy::SenderVerified && auth.local_connection != Some(from) {
            warn!("Force start from {} rejected: only the host may start", from);
            return;
        }
        if auth.match_ctl.is_some() || auth.pending_level.is_some() {
            warn!("Force start from {} ignored: match already started", from);
            return;
        }

        let order = match auth.roster.force_start(level, match_seconds, &mut self.context) {
            Ok(order) => order,
            Err(_) => return,
        };
        auth.pending_level = Some(order.level.clone());
        let remote: Vec<ConnectionId> = auth
            .connections
            .iter()
            .copied()
            .filter(|c| Some(*c) != auth.local_connection)
            .collect();

        self.match_index += 1;
        self.load_level(order.level.clone());
        let msg = ParticipantMessage::LoadLevel { level: order.level.clone() };
        for connection in remote {
            self.unicast(connection, &msg);
        }

        if let Err(e) = self.rendezvous.mark_in_game(&order.level) {
            error!("Failed to mark session in game: {}", e);
        }
    }

    fn on_respawn(&mut self, from: ConnectionId, entity: EntityId) {
        let policy = self.config.identity_policy;
        let Some(ctl) = self.authority.as_mut().and_then(|a| a.match_ctl.as_mut()) else {
            debug!("Respawn of {} ignored: no match running", entity);
            return;
        };

        if policy == IdentityPolicy::SenderVerified {
            if let Some(owner) = self.avatars.owner_of(entity) {
                if owner != from {
                    warn!("{}", MatchError::NotOwner { entity, sender: from });
                    return;
                }
            }
        }

        if let Err(e) = ctl.respawn(entity, self.avatars.as_mut()) {
            warn!("Respawn of {} for {} failed: {}", entity, from, e);
        }
    }

    fn flush_replication(&mut self) {
        let Some(auth) = self.authority.as_mut() else { return };
        let changes = auth.drain_changes();
        if !changes.is_empty() {
            self.broadcast(&ParticipantMessage::Replicate(changes), false);
        }
    }

    /// End-of-match shutdown: stop serving, drop our own connection, load the
    /// menu and leave the rendezvous session.
    fn teardown(&mut self) {
        info!("Tearing down session");
        self.transport.stop_listening();
        self.transport.stop_connecting();
        self.authority = None;
        self.participant = None;
        self.load_level(self.config.menu_level.clone());
        self.rendezvous.leave_session();
    }

    // -------------------------------------------------------------------------
    // Participant handlers
    // -------------------------------------------------------------------------

    fn handle_message(&mut self, msg: ParticipantMessage, now: f64) {
        let Some(p) = self.participant.as_mut() else {
            debug!("Dropping message: not connected");
            return;
        };

        match msg {
            ParticipantMessage::Pong { connection, .. } => {
                if let Some(rtt_ms) = p.pinger.on_pong(connection, now) {
                    debug!("RTT {} ms", rtt_ms);
                    self.send_internal(&AuthorityCommand::ReportRtt { connection, rtt_ms });
                }
            }
            ParticipantMessage::Replicate(changes) => {
                for change in changes {
                    p.apply(change);
                }
            }
            ParticipantMessage::LoadLevel { level } => {
                p.death_watch.reset();
                self.rendezvous.set_local_phase(SessionPhase::InGame);
                self.load_level(level);
            }
            ParticipantMessage::ReturnToMenu { menu } => {
                p.death_watch.reset();
                self.load_level(menu);
            }
        }
    }

    fn on_disconnected_from_authority(&mut self) {
        if self.participant.take().is_none() {
            return;
        }
        if self.authority.is_some() {
            return;
        }
        info!("Authority closed the connection");
        self.rendezvous.leave_session();
        self.load_level(self.config.menu_level.clone());
    }

    fn tick_participant(&mut self, now: f64) {
        let name = self.config.display_name.clone();
        let identity = self.rendezvous.local_identity();
        let Some(p) = self.participant.as_mut() else { return };

        let mut outgoing = Vec::new();
        if let Some(ping) = p.pinger.poll(now, p.connection, &name, identity) {
            outgoing.push(ping);
        }
        for entity in p.death_watch.update(now) {
            info!("Requesting respawn of {}", entity);
            outgoing.push(AuthorityCommand::RequestRespawn { entity });
        }

        for cmd in outgoing {
            self.send_internal(&cmd);
        }
    }

    // -------------------------------------------------------------------------
    // Plumbing
    // -------------------------------------------------------------------------

    fn load_level(&mut self, level: LevelId) {
        if self.current_level.as_ref() == Some(&level) {
            debug!("{} already loaded", level);
            return;
        }
        info!("Loading level {}", level);
        self.scenes.load(&level, LoadMode::ReplaceAll);
        self.current_level = Some(level);
    }

    fn shutdown_transport(&mut self) {
        self.participant = None;
        self.authority = None;
        self.transport.stop_connecting();
        self.transport.stop_listening();
    }

    fn send_command(&mut self, cmd: &AuthorityCommand) -> Result<(), SessionError> {
        if self.participant.is_none() {
            return Err(SessionError::NotConnected);
        }
        let bytes = cmd.to_bytes()?;
        self.transport.send_to_authority(bytes)?;
        Ok(())
    }

    /// Send a command the node generated itself; failures are only logged.
    fn send_internal(&mut self, cmd: &AuthorityCommand) {
        if let Err(e) = self.send_command(cmd) {
            debug!("Could not send {}: {}", cmd.kind(), e);
        }
    }

    fn unicast(&mut self, to: ConnectionId, msg: &ParticipantMessage) {
        match msg.to_bytes() {
            Ok(bytes) => {
                if let Err(e) = self.transport.send_unicast(to, bytes) {
                    warn!("Send to {} failed: {}", to, e);
                }
            }
            Err(e) => error!("Failed to encode message: {}", e),
        }
    }

    fn broadcast(&mut self, msg: &ParticipantMessage, buffer_last: bool) {
        match msg.to_bytes() {
            Ok(bytes) => {
                if let Err(e) = self.transport.send_broadcast(bytes, buffer_last) {
                    warn!("Broadcast failed: {}", e);
                }
            }
            Err(e) => error!("Failed to encode message: {}", e),
        }
    }
}

// =============================================================================
// ASYNC RUNNER
// =============================================================================

/// Drive a node at its configured tick rate until `shutdown` fires.
/// Returns the node so the caller can inspect or reuse it.
#[instrument(skip(node, shutdown))]
pub async fn run_node(mut node: SessionNode, mut shutdown: broadcast::Receiver<()>) -> SessionNode {
    let rate = node.config.tick_rate.max(1);
    let mut ticker = interval(Duration::from_secs_f64(1.0 / rate as f64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let started = Instant::now();

    info!("Node running at {} Hz", rate);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                node.update(started.elapsed().as_secs_f64());
            }
            _ = shutdown.recv() => {
                info!("Node shutdown signal received");
                break;
            }
        }
    }
    node
}

// =============================================================================
// TESTS
// =============================================================================
