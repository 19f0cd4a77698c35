/// Listener wiring and engine lifecycle.
///
/// The server owns two TCP listeners (solvers and clients), the session
/// registry with its sweeper task, the subscription bus, and the engine.
/// Teardown interrupts all sessions, waits briefly for them to drain, then
/// stops the dispatcher.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::error::WmResult;
use crate::model::WorldModel;
use crate::sessions::{client, solver, SessionKind, SessionRegistry};
use crate::store::{AttributeStore, NullStore, PgStore};
use crate::subscriptions::SubscriptionBus;
use crate::types::now_ms;

/// A running world model server.
pub struct Server {
    model: Arc<WorldModel>,
    bus: Arc<SubscriptionBus>,
    registry: Arc<SessionRegistry>,
    solver_addr: SocketAddr,
    client_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    /// Start with the store selected by the configuration: SQL-backed when
    /// a database identity is present, otherwise non-persistent.
    pub async fn start(config: Config) -> WmResult<Self> {
        let store: Arc<dyn AttributeStore> = if config.persistence_enabled() {
            Arc::new(PgStore::new(&config)?)
        } else {
            info!("no database identity configured; running without persistent storage");
            Arc::new(NullStore)
        };
        Self::start_with_store(config, store).await
    }

    /// Start over an explicit store collaborator.
    pub async fn start_with_store(
        config: Config,
        store: Arc<dyn AttributeStore>,
    ) -> WmResult<Self> {
        let bus = SubscriptionBus::new();
        let model = WorldModel::new(store, Arc::clone(&bus)).await;
        let registry = SessionRegistry::new();

        let solver_listener = TcpListener::bind(("0.0.0.0", config.solver_port)).await?;
        let client_listener = TcpListener::bind(("0.0.0.0", config.client_port)).await?;
        let solver_addr = solver_listener.local_addr()?;
        let client_addr = client_listener.local_addr()?;
        info!(%solver_addr, "listening for solver connections");
        info!(%client_addr, "listening for client connections");

        let (shutdown, _) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(accept_loop(
                solver_listener,
                SessionKind::Solver,
                Arc::clone(&model),
                Arc::clone(&registry),
                shutdown.subscribe(),
            )),
            tokio::spawn(accept_loop(
                client_listener,
                SessionKind::Client,
                Arc::clone(&model),
                Arc::clone(&registry),
                shutdown.subscribe(),
            )),
            tokio::spawn(sweeper(Arc::clone(&registry), shutdown.subscribe())),
        ];

        Ok(Self { model, bus, registry, solver_addr, client_addr, shutdown, tasks })
    }

    /// Address of the solver listener (useful with an ephemeral port).
    pub fn solver_addr(&self) -> SocketAddr {
        self.solver_addr
    }

    /// Address of the client listener.
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// The engine behind this server.
    pub fn model(&self) -> Arc<WorldModel> {
        Arc::clone(&self.model)
    }

    /// Number of currently connected peers.
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Stop accepting, interrupt sessions, drain, and stop the dispatcher.
    pub async fn shutdown(self) {
        info!("world model server shutting down");
        let _ = self.shutdown.send(true);
        futures::future::join_all(self.tasks).await;

        self.registry.interrupt_all();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while !self.registry.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.bus.shutdown().await;
        info!("world model server stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    kind: SessionKind,
    model: Arc<WorldModel>,
    registry: Arc<SessionRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let model = Arc::clone(&model);
                        let registry = Arc::clone(&registry);
                        match kind {
                            SessionKind::Solver => {
                                tokio::spawn(solver::run(stream, peer, model, registry));
                            }
                            SessionKind::Client => {
                                tokio::spawn(client::run(stream, peer, model, registry));
                            }
                        }
                    }
                    Err(err) => error!(%err, ?kind, "accept failed"),
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

/// Reap sessions whose both directions have been silent past the timeout.
async fn sweeper(registry: Arc<SessionRegistry>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tick.tick() => {
                registry.sweep(now_ms());
            }
            _ = shutdown.changed() => return,
        }
    }
}
