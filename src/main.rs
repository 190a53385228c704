//! Chapita Presence
//!
//! `chapita-presence relay` hosts the development relay.
//! `chapita-presence demo` (the default) walks two players around an
//! in-process store and logs what each one sees.

use anyhow::{bail, Context};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::info;
use tracing_subscriber::EnvFilter;

use chapita::{
    core::clock::SystemClock,
    game::map::TileMap,
    identity::{IdentityService, MemoryIdentityService},
    presence::{PresenceClient, SessionCommand, SessionStatus, SharedStore},
    store::{MemoryStore, RelayServer},
    Facing, PresenceConfig, RelayConfig, VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Chapita Presence v{}", VERSION);

    match std::env::args().nth(1).as_deref() {
        Some("relay") => run_relay().await,
        Some("demo") | None => run_demo().await,
        Some(other) => bail!("unknown command {other:?} (expected `relay` or `demo`)"),
    }
}

async fn run_relay() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    info!("Max connections: {}", config.max_connections);
    let server = RelayServer::new(config, Arc::new(MemoryStore::new()));

    let serving = server.run();
    tokio::pin!(serving);
    tokio::select! {
        result = &mut serving => return result.context("relay stopped"),
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for ctrl-c")?;
            info!("Ctrl-C received, shutting down");
            server.shutdown();
        }
    }
    serving.await.context("relay stopped")
}

/// One demo player: its own sign-in plus a presence client.
struct DemoPlayer {
    identity: Arc<MemoryIdentityService>,
    commands: mpsc::Sender<SessionCommand>,
    task: tokio::task::JoinHandle<()>,
}

impl DemoPlayer {
    fn spawn(store: &Arc<MemoryStore>, config: &PresenceConfig, map: &Arc<TileMap>) -> Self {
        let identity = Arc::new(MemoryIdentityService::new("chapita-demo"));
        let client = PresenceClient::new(
            identity.clone(),
            Arc::new(SharedStore(store.clone())),
            Arc::new(SystemClock::new()),
            config.clone(),
            map.clone(),
        );
        let (commands, rx) = mpsc::channel(32);
        let task = tokio::spawn(client.run(rx));
        Self { identity, commands, task }
    }

    async fn send(&self, command: SessionCommand) -> anyhow::Result<()> {
        self.commands.send(command).await.context("presence client stopped")
    }

    async fn status(&self) -> anyhow::Result<Option<SessionStatus>> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Status(tx)).await?;
        rx.await.context("presence client stopped")
    }

    async fn walk(&self, direction: Facing, steps: usize, cooldown: Duration) -> anyhow::Result<()> {
        for _ in 0..steps {
            self.send(SessionCommand::Move(direction)).await?;
            tokio::time::sleep(cooldown).await;
        }
        Ok(())
    }
}

async fn run_demo() -> anyhow::Result<()> {
    info!("=== Starting Presence Demo ===");

    let store = Arc::new(MemoryStore::new());
    let config = PresenceConfig::from_env();
    let map = Arc::new(TileMap::meadow());
    let step = config.step_cooldown() + Duration::from_millis(10);

    let ana = DemoPlayer::spawn(&store, &config, &map);
    let bo = DemoPlayer::spawn(&store, &config, &map);

    ana.identity.sign_up("ana@chapita.dev", "ana-secret", "ana").await?;
    bo.identity.sign_up("bo@chapita.dev", "bo-secret", "bo").await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    ana.walk(Facing::Right, 3, step).await?;
    ana.send(SessionCommand::Chat("hola!".into())).await?;
    bo.walk(Facing::Down, 2, step).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    for player in [&ana, &bo] {
        let Some(status) = player.status().await? else {
            continue;
        };
        info!(
            "{} at {} facing {:?} (moving: {})",
            status.identity, status.position, status.facing, status.is_moving
        );
        for remote in status.remote.iter() {
            info!(
                "  sees {} ({}) at {} facing {:?}, moving {}, chat {:?}",
                remote.record.display_name,
                remote.identity,
                remote.record.position,
                remote.display_facing,
                remote.display_moving,
                remote.record.chat_message
            );
        }
    }

    info!("=== Signing out ===");
    ana.identity.sign_out().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    if let Some(status) = bo.status().await? {
        info!("{} now sees {} other players", status.identity, status.remote.len());
    }

    drop(ana.commands);
    drop(bo.commands);
    ana.task.await.context("presence client panicked")?;
    bo.task.await.context("presence client panicked")?;
    info!("Demo finished");
    Ok(())
}
