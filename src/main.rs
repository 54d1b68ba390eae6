//! Surf Lobby Demo
//!
//! Runs a host and two participants over the in-process transport and
//! rendezvous: lobby, readiness, force start, a fall and respawn, match
//! expiry and teardown. Time is simulated so the whole match runs instantly.
//!
//! Set `RUST_LOG=surf_lobby=debug` for per-message logs.

use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use surf_lobby::{
    VERSION,
    core::{EntityId, ExternalId, LevelId, Transform, Vec3},
    game::{
        spawn::DEFAULT_ZONE_SIZE, AvatarRegistry, LevelCatalog, LevelEntry, SpawnZone,
    },
    network::{
        run_node, LevelScene, LocalRendezvous, LoopbackNetwork, NodeConfig, RecordingScenes,
        RendezvousClient, RendezvousDirectory, SessionNode, SessionPhase,
    },
};

/// Simulated seconds per demo step.
const STEP: f64 = 0.05;

const HOST_ID: ExternalId = ExternalId(76561198000000001);
const ALICE_ID: ExternalId = ExternalId(76561198000000002);
const BOB_ID: ExternalId = ExternalId(76561198000000003);

struct Player {
    node: SessionNode,
    scenes: RecordingScenes,
    avatar: EntityId,
}

struct Demo {
    net: LoopbackNetwork,
    directory: RendezvousDirectory,
    avatars: AvatarRegistry,
    now: f64,
}

impl Demo {
    fn player(&self, identity: ExternalId, name: &str, avatar: u32) -> anyhow::Result<Player> {
        let scenes = RecordingScenes::new();
        let config = NodeConfig { display_name: name.to_string(), ..NodeConfig::from_env() };
        let service = LocalRendezvous::acquire(&self.directory, identity)?;
        let catalog = LevelCatalog::new(vec![LevelEntry::new("Surf Intro", "Surf_Intro", 30)]);

        let node = SessionNode::new(
            config,
            Box::new(self.net.endpoint(identity)),
            RendezvousClient::new(Box::new(service)),
            Box::new(scenes.clone()),
            Box::new(self.avatars.clone()),
        )
        .with_catalog(catalog);

        Ok(Player { node, scenes, avatar: EntityId(avatar) })
    }

    /// Advance every node by `seconds` of simulated time.
    fn run(&mut self, players: &mut [Player], seconds: f64) {
        let steps = (seconds / STEP).round() as u32;
        for _ in 0..steps.max(1) {
            self.now += STEP;
            for p in players.iter_mut() {
                if let Some(state) = self.avatars.get(p.avatar) {
                    p.node.observe_avatar_height(p.avatar, state.position.y, self.now);
                }
                p.node.update(self.now);
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Surf Lobby v{}", VERSION);

    demo_match()?;
    demo_runner().await?;
    Ok(())
}

/// One full session on a simulated clock.
fn demo_match() -> anyhow::Result<()> {
    info!("=== Starting Demo Session ===");

    let mut demo = Demo {
        net: LoopbackNetwork::new(),
        directory: RendezvousDirectory::new(),
        avatars: AvatarRegistry::new(),
        now: 0.0,
    };
    let mut players = vec![
        demo.player(HOST_ID, "Host", 1)?,
        demo.player(ALICE_ID, "Alice", 2)?,
        demo.player(BOB_ID, "Bob", 3)?,
    ];

    // Lobby
    players[0].node.host_from_catalog(0)?;
    demo.run(&mut players, 0.1);
    let session = players[0]
        .node
        .rendezvous()
        .session()
        .map(|s| s.id)
        .ok_or_else(|| anyhow::anyhow!("host did not enter a session"))?;
    info!("Session {} open", session);

    players[1].node.join_session(session)?;
    demo.directory.invite(session, BOB_ID);
    demo.run(&mut players, 0.5);

    for p in players.iter_mut() {
        p.node.set_ready(true)?;
    }
    players[1].node.submit_console("sv_airaccelerate 150")?;
    demo.run(&mut players, 0.5);

    for row in players[0].node.lobby_rows() {
        info!("Lobby: {} {} ready={}", row.connection, row.display_name, row.ready);
    }

    // Match
    players[0].node.force_start_selected()?;
    demo.run(&mut players, 0.1);

    let level = players[0].node.context().selected_level.clone();
    let zone = SpawnZone::from_size(Transform::from_origin(Vec3::new(0.0, 50.0, 0.0)), DEFAULT_ZONE_SIZE);
    players[0].node.on_level_entered(
        LevelScene { level: level.clone(), spawn_zones: vec![zone] },
        demo.now,
    );
    for p in &players {
        if let Some(connection) = p.node.connection() {
            demo.avatars.spawn(p.avatar, connection, Vec3::new(0.0, 50.2, 0.0));
        }
    }
    info!(
        "Alice sees sv_airaccelerate={}",
        players[1].node.motor_tuning().air_accelerate
    );

    demo.run(&mut players, 3.0);
    info!("Bob falls off the ramp");
    demo.avatars.set_position(players[2].avatar, Vec3::new(0.0, -150.0, 0.0));

    let mut last_report = demo.now;
    while players[0].node.phase() == SessionPhase::InGame {
        demo.run(&mut players, 1.0);
        if demo.now - last_report >= 10.0 {
            last_report = demo.now;
            info!("Timer: {:?}s", players[1].node.timer_remaining());
            for row in players[1].node.scoreboard() {
                info!("  {} {} rtt={}ms", row.connection, row.display_name, row.rtt_ms);
            }
        }
    }
    demo.run(&mut players, 1.0);

    // Results
    info!("=== Session Over ===");
    if let Some(bob) = demo.avatars.get(players[2].avatar) {
        info!("Bob respawned {} time(s), now at {}", bob.teleports, bob.position);
    }
    for p in &players {
        let levels: Vec<String> = p.scenes.loads().into_iter().map(|l| l.0).collect();
        info!(
            "{} ({:?}) loaded {}",
            p.node.config().display_name,
            p.node.phase(),
            levels.join(" -> ")
        );
    }
    Ok(())
}

/// Drive a lobby with the async runner for a moment.
async fn demo_runner() -> anyhow::Result<()> {
    info!("=== Async Runner ===");

    let demo = Demo {
        net: LoopbackNetwork::new(),
        directory: RendezvousDirectory::new(),
        avatars: AvatarRegistry::new(),
        now: 0.0,
    };
    let mut host = demo.player(HOST_ID, "Host", 1)?;
    host.node.create_session(4, LevelId::new("Surf_Intro"))?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(run_node(host.node, shutdown_rx));

    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    let _ = shutdown_tx.send(());
    let node = handle.await?;

    info!("Runner stopped in phase {:?} (hosting={})", node.phase(), node.is_authority());
    Ok(())
}
