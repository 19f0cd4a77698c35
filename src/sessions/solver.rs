/// Solver connection state machine.
///
/// After the handshake the session accepts type announcements (which
/// establish aliases and register on-demand types), solution data, and
/// lifecycle messages. Solution entries bearing an unknown alias are
/// dropped with a log. The session also forwards on-demand start/stop
/// instructions that the subscription bus pushes when client interest
/// changes.
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{WmError, WmResult};
use crate::model::WorldModel;
use crate::protocol::{solver, SolverMessageId};
use crate::sessions::{
    exchange_handshake, send_frame, spawn_reader, SessionHandle, SessionKind, SessionRegistry,
    DEFAULT_TIMEOUT_SECS,
};
use crate::subscriptions::OnDemandCommand;
use crate::types::{now_ms, Attribute, Uri, WorldState};

/// Serve one solver connection to completion.
pub(crate) async fn run(
    stream: TcpStream,
    peer: SocketAddr,
    model: Arc<WorldModel>,
    registry: Arc<SessionRegistry>,
) {
    let handle = SessionHandle::new(SessionKind::Solver, DEFAULT_TIMEOUT_SECS);
    registry.register(handle.clone());
    info!(session = %handle.id, %peer, "solver connected");

    if let Err(err) = serve(stream, &model, &handle).await {
        warn!(session = %handle.id, %err, "solver session closed with error");
    }

    registry.unregister(&handle.id);
    info!(session = %handle.id, remaining = registry.len(), "solver disconnected");
}

struct SolverSession {
    model: Arc<WorldModel>,
    handle: SessionHandle,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    /// Alias → attribute name, from type announcements.
    types: HashMap<u32, String>,
    /// Attribute name → alias, for on-demand instructions.
    aliases: HashMap<String, u32>,
    /// Origin string of this solver, from the type announcement.
    origin: String,
    /// On-demand attribute names announced on this connection.
    on_demand_names: Vec<String>,
    /// Sender registered with the bus for on-demand transitions.
    on_demand_tx: mpsc::UnboundedSender<OnDemandCommand>,
}

async fn serve(
    mut stream: TcpStream,
    model: &Arc<WorldModel>,
    handle: &SessionHandle,
) -> WmResult<()> {
    exchange_handshake(&mut stream, handle).await?;

    let (read_half, write_half) = stream.into_split();
    let mut frames = spawn_reader(read_half, handle.clone());
    let (on_demand_tx, mut on_demand_rx) = mpsc::unbounded_channel();

    let mut session = SolverSession {
        model: Arc::clone(model),
        handle: handle.clone(),
        writer: Arc::new(Mutex::new(write_half)),
        types: HashMap::new(),
        aliases: HashMap::new(),
        origin: String::new(),
        on_demand_names: Vec::new(),
        on_demand_tx,
    };

    let mut tick = tokio::time::interval(Duration::from_millis(250));
    let result = loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some((id, payload)) = frame else {
                    break Ok(());
                };
                if let Err(err) = session.handle_message(id, &payload).await {
                    break Err(err);
                }
            }
            command = on_demand_rx.recv() => {
                if let Some(command) = command {
                    if let Err(err) = session.forward_on_demand(command).await {
                        break Err(err);
                    }
                }
            }
            _ = tick.tick() => {
                if session.handle.is_interrupted() {
                    break Ok(());
                }
                if session.handle.keep_alive_due(now_ms()) {
                    let frame = crate::protocol::solver_keep_alive();
                    if let Err(err) = send_frame(&session.writer, &session.handle, &frame).await {
                        break Err(err);
                    }
                }
            }
        }
    };

    session.model.bus().unregister_on_demand_solver(&session.on_demand_names);
    result
}

impl SolverSession {
    async fn handle_message(&mut self, id: u8, payload: &[u8]) -> WmResult<()> {
        match SolverMessageId::try_from(id)? {
            SolverMessageId::KeepAlive => {}
            SolverMessageId::TypeAnnounce => {
                let announce = solver::TypeAnnounce::decode(payload)?;
                self.apply_type_announce(announce);
            }
            SolverMessageId::SolverData => {
                let data = solver::SolverData::decode(payload)?;
                self.insert_solutions(data).await;
            }
            SolverMessageId::CreateUri => {
                let message = solver::CreateUri::decode(payload)?;
                debug!(session = %self.handle.id, uri = %message.uri, "create URI");
                self.model.create_uri(message.uri, message.origin, message.creation).await;
            }
            SolverMessageId::ExpireUri => {
                let message = solver::ExpireUri::decode(payload)?;
                self.model.expire_uri(message.uri, message.expiration).await;
            }
            SolverMessageId::DeleteUri => {
                let message = solver::DeleteUri::decode(payload)?;
                debug!(session = %self.handle.id, uri = %message.uri, "delete URI");
                self.model.delete_uri(message.uri).await;
            }
            SolverMessageId::ExpireAttribute => {
                let message = solver::ExpireAttribute::decode(payload)?;
                let slot = Attribute::new(message.name, message.creation, message.origin, Vec::new());
                self.model.expire_attributes(message.uri, vec![slot], message.expiration).await;
            }
            SolverMessageId::DeleteAttribute => {
                let message = solver::DeleteAttribute::decode(payload)?;
                self.model
                    .delete_attributes(message.uri, vec![(message.name, message.origin)])
                    .await;
            }
            SolverMessageId::StartOnDemand | SolverMessageId::StopOnDemand => {
                return Err(WmError::Protocol(
                    "on-demand instructions flow engine to solver only".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn apply_type_announce(&mut self, announce: solver::TypeAnnounce) {
        self.origin = announce.origin.clone();
        let mut new_names: HashSet<String> = HashSet::new();
        for entry in announce.types {
            if entry.on_demand {
                // On-demand data starts silent; it is also never persisted,
                // only relayed, so it enters the transient registry.
                self.model.bus().register_on_demand(&entry.name, self.on_demand_tx.clone());
                self.model.register_transient(entry.name.clone(), self.origin.clone());
                self.on_demand_names.push(entry.name.clone());
            }
            debug!(
                session = %self.handle.id,
                name = %entry.name,
                alias = entry.alias,
                on_demand = entry.on_demand,
                "type announced"
            );
            self.types.insert(entry.alias, entry.name.clone());
            self.aliases.insert(entry.name.clone(), entry.alias);
            new_names.insert(entry.name);
        }
        self.model.bus().add_origin_attributes(&self.origin, new_names);
    }

    async fn insert_solutions(&mut self, data: solver::SolverData) {
        let mut new_data: WorldState = WorldState::new();
        for solution in data.solutions {
            let Some(name) = self.types.get(&solution.type_alias) else {
                warn!(
                    session = %self.handle.id,
                    alias = solution.type_alias,
                    "dropping solution with unknown alias"
                );
                continue;
            };
            new_data
                .entry(solution.target)
                .or_default()
                .push(Attribute::new(name.clone(), solution.time, self.origin.clone(), solution.data));
        }
        if new_data.is_empty() {
            return;
        }
        // Don't let a large batch time the session out mid-insert.
        self.handle.touch_received();
        let batch: Vec<(Uri, Vec<Attribute>)> = new_data.into_iter().collect();
        self.model.insert_data(batch, data.create_uris).await;
    }

    async fn forward_on_demand(&mut self, command: OnDemandCommand) -> WmResult<()> {
        let (name, patterns, start) = match command {
            OnDemandCommand::Start { name, patterns } => (name, patterns, true),
            OnDemandCommand::Stop { name, patterns } => (name, patterns, false),
        };
        let Some(&alias) = self.aliases.get(&name) else {
            // Commands can only target names this session announced.
            return Ok(());
        };
        debug!(
            session = %self.handle.id,
            attribute = %name,
            start,
            "forwarding on-demand instruction"
        );
        let message = solver::OnDemandMessage {
            entries: vec![solver::OnDemandEntry { alias, patterns }],
        };
        send_frame(&self.writer, &self.handle, &message.encode(start)).await
    }
}
