/// Client connection state machine.
///
/// A client session answers one-shot snapshot, range, and URI-search
/// requests, and maintains streaming subscriptions driven by a single
/// per-session streaming task that wakes at the earliest due cadence.
/// Attribute names and origins are aliased lazily and announced before any
/// data that uses them. Cancellation is synchronous from the client's
/// view: the subscription leaves the streaming list and the bus before
/// `request_complete` is sent, so no further data for that ticket can
/// follow the acknowledgement.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{WmError, WmResult};
use crate::model::WorldModel;
use crate::protocol::{client as proto, client_keep_alive, ClientMessageId};
use crate::sessions::{
    exchange_handshake, send_frame, spawn_reader, SessionHandle, SessionKind, SessionRegistry,
    DEFAULT_TIMEOUT_SECS,
};
use crate::subscriptions::StandingQuery;
use crate::types::{now_ms, Timestamp, Uri, WorldState};

/// Serve one client connection to completion.
pub(crate) async fn run(
    stream: TcpStream,
    peer: SocketAddr,
    model: Arc<WorldModel>,
    registry: Arc<SessionRegistry>,
) {
    let handle = SessionHandle::new(SessionKind::Client, DEFAULT_TIMEOUT_SECS);
    registry.register(handle.clone());
    info!(session = %handle.id, %peer, "client connected");

    if let Err(err) = serve(stream, &model, &handle).await {
        warn!(session = %handle.id, %err, "client session closed with error");
    }

    registry.unregister(&handle.id);
    info!(session = %handle.id, remaining = registry.len(), "client disconnected");
}

/// Session-local aliases for attribute names and origins.
#[derive(Default)]
struct AliasTables {
    attributes: HashMap<String, u32>,
    origins: HashMap<String, u32>,
}

/// Origin preference levels and the highest level yet observed per
/// `(uri, attribute name)`.
#[derive(Default)]
struct PreferenceState {
    levels: HashMap<String, i32>,
    highest: HashMap<(Uri, String), i32>,
}

/// State of one streaming subscription.
struct StreamRequest {
    ticket: u32,
    interval: Timestamp,
    last_serviced: Timestamp,
    uri_pattern: String,
    /// Attribute names counted in the on-demand table for this request.
    on_demand: Vec<String>,
    query: Arc<StandingQuery>,
}

struct ClientSession {
    model: Arc<WorldModel>,
    handle: SessionHandle,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    aliases: Arc<StdMutex<AliasTables>>,
    preferences: Arc<StdMutex<PreferenceState>>,
    streams: Arc<Mutex<Vec<StreamRequest>>>,
}

async fn serve(
    mut stream: TcpStream,
    model: &Arc<WorldModel>,
    handle: &SessionHandle,
) -> WmResult<()> {
    exchange_handshake(&mut stream, handle).await?;

    let (read_half, write_half) = stream.into_split();
    let mut frames = spawn_reader(read_half, handle.clone());

    let session = ClientSession {
        model: Arc::clone(model),
        handle: handle.clone(),
        writer: Arc::new(Mutex::new(write_half)),
        aliases: Arc::new(StdMutex::new(AliasTables::default())),
        preferences: Arc::new(StdMutex::new(PreferenceState::default())),
        streams: Arc::new(Mutex::new(Vec::new())),
    };

    let streaming = tokio::spawn(streaming_loop(
        Arc::clone(&session.streams),
        Arc::clone(&session.writer),
        handle.clone(),
        Arc::clone(&session.aliases),
        Arc::clone(&session.preferences),
    ));

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
            _ = tick.tick() => {
                if session.handle.is_interrupted() {
                    break Ok(());
                }
                if session.handle.keep_alive_due(now_ms()) {
                    if let Err(err) =
                        send_frame(&session.writer, &session.handle, &client_keep_alive()).await
                    {
                        break Err(err);
                    }
                }
            }
        }
    };

    // Teardown order: stop and join the streaming task, then release the
    // subscriptions from the bus, then let the socket drop.
    session.handle.interrupt();
    let _ = streaming.await;
    let remaining: Vec<StreamRequest> = session.streams.lock().await.drain(..).collect();
    for request in remaining {
        session.release(request);
    }
    result
}

impl ClientSession {
    async fn handle_message(&self, id: u8, payload: &[u8]) -> WmResult<()> {
        match ClientMessageId::try_from(id)? {
            ClientMessageId::KeepAlive => {}
            ClientMessageId::SnapshotRequest => {
                let request = proto::Request::decode(payload)?;
                debug!(
                    session = %self.handle.id,
                    ticket = request.ticket,
                    pattern = %request.uri_pattern,
                    "snapshot request"
                );
                let state = if request.start == 0 && request.stop == 0 {
                    self.model
                        .snapshot_current(&request.uri_pattern, &request.attributes, true)
                        .await
                } else {
                    self.model
                        .snapshot_at(&request.uri_pattern, &request.attributes, request.stop)
                        .await
                };
                self.deliver(request.ticket, state).await?;
                self.complete(request.ticket).await?;
            }
            ClientMessageId::RangeRequest => {
                let request = proto::Request::decode(payload)?;
                debug!(
                    session = %self.handle.id,
                    ticket = request.ticket,
                    start = request.start,
                    stop = request.stop,
                    "range request"
                );
                let state = self
                    .model
                    .range(&request.uri_pattern, &request.attributes, request.start, request.stop)
                    .await;
                self.deliver(request.ticket, state).await?;
                self.complete(request.ticket).await?;
            }
            ClientMessageId::StreamRequest => {
                let request = proto::Request::decode(payload)?;
                self.start_stream(request).await?;
            }
            ClientMessageId::CancelRequest => {
                let cancel = proto::CancelRequest::decode(payload)?;
                self.cancel(cancel.ticket).await?;
            }
            ClientMessageId::UriSearch => {
                let search = proto::UriSearch::decode(payload)?;
                let uris = self.model.search_uri(&search.pattern).await;
                let response = proto::UriSearchResponse { uris };
                send_frame(&self.writer, &self.handle, &response.encode()).await?;
            }
            ClientMessageId::OriginPreference => {
                let message = proto::OriginPreference::decode(payload)?;
                let mut preferences = self.preferences.lock().unwrap();
                for (origin, level) in message.preferences {
                    preferences.levels.insert(origin, level);
                }
            }
            ClientMessageId::AttributeAlias
            | ClientMessageId::OriginAlias
            | ClientMessageId::RequestComplete
            | ClientMessageId::DataResponse
            | ClientMessageId::UriSearchResponse => {
                return Err(WmError::Protocol(format!(
                    "engine-to-client message id {id} received from client"
                )));
            }
        }
        Ok(())
    }

    /// Register a new streaming subscription, replacing any earlier one on
    /// the same ticket.
    async fn start_stream(&self, request: proto::Request) -> WmResult<()> {
        if request.stop < 0 {
            return Err(WmError::InvalidArgument(format!(
                "subscription with negative cadence {}",
                request.stop
            )));
        }
        debug!(
            session = %self.handle.id,
            ticket = request.ticket,
            pattern = %request.uri_pattern,
            cadence_ms = request.stop,
            "stream request"
        );
        self.remove_stream(request.ticket).await;

        let mut on_demand = Vec::new();
        for name in &request.attributes {
            // Literal names announced as on-demand start their producers.
            if self.model.bus().add_on_demand_request(name, &request.uri_pattern) {
                on_demand.push(name.clone());
            }
        }

        let query = self
            .model
            .standing_query(&request.uri_pattern, request.attributes.clone(), true)
            .await;

        // The seeded current state goes out before the cadence starts.
        let initial = query.take_data();
        if !initial.is_empty() {
            self.deliver(request.ticket, initial).await?;
        }

        self.streams.lock().await.push(StreamRequest {
            ticket: request.ticket,
            interval: request.stop,
            last_serviced: now_ms(),
            uri_pattern: request.uri_pattern,
            on_demand,
            query,
        });
        Ok(())
    }

    /// Remove a subscription and release its bus bookkeeping. Returns true
    /// if the ticket existed.
    async fn remove_stream(&self, ticket: u32) -> bool {
        let request = {
            let mut streams = self.streams.lock().await;
            let Some(index) = streams.iter().position(|request| request.ticket == ticket) else {
                return false;
            };
            streams.remove(index)
        };
        self.release(request);
        true
    }

    fn release(&self, request: StreamRequest) {
        for name in &request.on_demand {
            self.model.bus().remove_on_demand_request(name, &request.uri_pattern);
        }
        self.model.bus().remove(request.query.id());
    }

    async fn cancel(&self, ticket: u32) -> WmResult<()> {
        debug!(session = %self.handle.id, ticket, "cancel request");
        if self.remove_stream(ticket).await {
            self.complete(ticket).await?;
        }
        Ok(())
    }

    async fn deliver(&self, ticket: u32, state: WorldState) -> WmResult<()> {
        deliver_state(&self.writer, &self.handle, &self.aliases, &self.preferences, ticket, state)
            .await
    }

    async fn complete(&self, ticket: u32) -> WmResult<()> {
        let frame = proto::RequestComplete { ticket }.encode();
        send_frame(&self.writer, &self.handle, &frame).await
    }
}

/// Drive all of the session's subscriptions at their cadences.
async fn streaming_loop(
    streams: Arc<Mutex<Vec<StreamRequest>>>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    handle: SessionHandle,
    aliases: Arc<StdMutex<AliasTables>>,
    preferences: Arc<StdMutex<PreferenceState>>,
) {
    loop {
        if handle.is_interrupted() {
            return;
        }
        let mut next_due: Timestamp = Timestamp::MAX;
        {
            // Holding the list lock across delivery is what makes
            // cancellation synchronous: once cancel removes a request, no
            // further data for its ticket can be in flight.
            let mut guard = streams.lock().await;
            let now = now_ms();
            for request in guard.iter_mut() {
                if request.last_serviced + request.interval <= now {
                    request.last_serviced = now;
                    let data = request.query.take_data();
                    if data.is_empty() {
                        continue;
                    }
                    if let Err(err) = deliver_state(
                        &writer,
                        &handle,
                        &aliases,
                        &preferences,
                        request.ticket,
                        data,
                    )
                    .await
                    {
                        warn!(session = %handle.id, %err, "streaming delivery failed");
                        handle.interrupt();
                        return;
                    }
                } else {
                    next_due = next_due.min(request.last_serviced + request.interval - now);
                }
            }
        }
        // Wake at the earliest due subscription, bounded to [10µs, 10ms].
        let sleep_micros = if next_due == Timestamp::MAX {
            10_000
        } else {
            next_due.saturating_mul(1000).clamp(10, 10_000) as u64
        };
        tokio::time::sleep(Duration::from_micros(sleep_micros)).await;
    }
}

/// Apply origin preferences, alias names and origins, and send the state
/// as `data_response` frames, preceded by any new alias announcements.
async fn deliver_state(
    writer: &Arc<Mutex<OwnedWriteHalf>>,
    handle: &SessionHandle,
    aliases: &Arc<StdMutex<AliasTables>>,
    preferences: &Arc<StdMutex<PreferenceState>>,
    ticket: u32,
    mut state: WorldState,
) -> WmResult<()> {
    apply_preferences(preferences, &mut state);

    let (new_attributes, new_origins, responses) = {
        let mut tables = aliases.lock().unwrap();
        let mut new_attributes = Vec::new();
        let mut new_origins = Vec::new();
        let mut responses = Vec::new();
        for (uri, attributes) in state {
            if attributes.is_empty() {
                continue;
            }
            let mut aliased = Vec::with_capacity(attributes.len());
            for attribute in attributes {
                let name_alias =
                    alias_for(&mut tables.attributes, &attribute.name, &mut new_attributes);
                let origin_alias =
                    alias_for(&mut tables.origins, &attribute.origin, &mut new_origins);
                aliased.push(proto::AliasedAttribute {
                    name_alias,
                    creation: attribute.creation,
                    expiration: attribute.expiration,
                    origin_alias,
                    data: attribute.data,
                });
            }
            responses.push(proto::DataResponse { object_uri: uri, ticket, attributes: aliased });
        }
        (new_attributes, new_origins, responses)
    };

    if !new_attributes.is_empty() {
        let frame = proto::AliasMessage { entries: new_attributes }
            .encode(ClientMessageId::AttributeAlias);
        send_frame(writer, handle, &frame).await?;
    }
    if !new_origins.is_empty() {
        let frame =
            proto::AliasMessage { entries: new_origins }.encode(ClientMessageId::OriginAlias);
        send_frame(writer, handle, &frame).await?;
    }
    for response in responses {
        send_frame(writer, handle, &response.encode()).await?;
    }
    Ok(())
}

fn alias_for(
    table: &mut HashMap<String, u32>,
    name: &str,
    announcements: &mut Vec<proto::AliasEntry>,
) -> u32 {
    if let Some(&alias) = table.get(name) {
        return alias;
    }
    let alias = table.len() as u32 + 1;
    table.insert(name.to_string(), alias);
    announcements.push(proto::AliasEntry { alias, name: name.to_string() });
    alias
}

/// Drop attributes whose origin is suppressed or outranked for that
/// `(uri, name)` pair. Ties are kept.
fn apply_preferences(preferences: &Arc<StdMutex<PreferenceState>>, state: &mut WorldState) {
    let mut prefs = preferences.lock().unwrap();
    if prefs.levels.is_empty() {
        return;
    }
    for (uri, attributes) in state.iter_mut() {
        for attribute in attributes.iter() {
            let level = *prefs.levels.entry(attribute.origin.clone()).or_insert(1);
            let best = prefs.highest.entry((uri.clone(), attribute.name.clone())).or_insert(level);
            if *best < level {
                *best = level;
            }
        }
        attributes.retain(|attribute| {
            let level = prefs.levels.get(&attribute.origin).copied().unwrap_or(1);
            let best = prefs
                .highest
                .get(&(uri.clone(), attribute.name.clone()))
                .copied()
                .unwrap_or(level);
            level >= 0 && level >= best
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Attribute;

    fn state_with(entries: Vec<(&str, &str, &str)>) -> WorldState {
        let mut state = WorldState::new();
        for (uri, name, origin) in entries {
            state
                .entry(uri.to_string())
                .or_default()
                .push(Attribute::new(name, 100, origin, vec![1]));
        }
        state
    }

    #[test]
    fn test_preferences_drop_outranked_origin() {
        let preferences = Arc::new(StdMutex::new(PreferenceState::default()));
        preferences.lock().unwrap().levels.insert("hi".into(), 10);
        preferences.lock().unwrap().levels.insert("lo".into(), 1);

        let mut state = state_with(vec![("o1", "loc", "hi"), ("o1", "loc", "lo")]);
        apply_preferences(&preferences, &mut state);
        let attributes = &state["o1"];
        assert_eq!(attributes.len(), 1);
        assert_eq!(attributes[0].origin, "hi");
    }

    #[test]
    fn test_preferences_remember_highest_across_deliveries() {
        let preferences = Arc::new(StdMutex::new(PreferenceState::default()));
        preferences.lock().unwrap().levels.insert("hi".into(), 10);
        preferences.lock().unwrap().levels.insert("lo".into(), 1);

        let mut first = state_with(vec![("o1", "loc", "hi")]);
        apply_preferences(&preferences, &mut first);
        assert_eq!(first["o1"].len(), 1);

        // A later delivery from the weaker origin alone is suppressed.
        let mut second = state_with(vec![("o1", "loc", "lo")]);
        apply_preferences(&preferences, &mut second);
        assert!(second["o1"].is_empty());
    }

    #[test]
    fn test_negative_preference_suppresses_outright() {
        let preferences = Arc::new(StdMutex::new(PreferenceState::default()));
        preferences.lock().unwrap().levels.insert("noisy".into(), -1);

        let mut state = state_with(vec![("o1", "loc", "noisy")]);
        apply_preferences(&preferences, &mut state);
        assert!(state["o1"].is_empty());
    }

    #[test]
    fn test_ties_are_kept() {
        let preferences = Arc::new(StdMutex::new(PreferenceState::default()));
        preferences.lock().unwrap().levels.insert("a".into(), 5);
        preferences.lock().unwrap().levels.insert("b".into(), 5);

        let mut state = state_with(vec![("o1", "loc", "a"), ("o1", "loc", "b")]);
        apply_preferences(&preferences, &mut state);
        assert_eq!(state["o1"].len(), 2);
    }

    #[test]
    fn test_no_preferences_is_passthrough() {
        let preferences = Arc::new(StdMutex::new(PreferenceState::default()));
        let mut state = state_with(vec![("o1", "loc", "anyone")]);
        apply_preferences(&preferences, &mut state);
        assert_eq!(state["o1"].len(), 1);
    }

    #[test]
    fn test_alias_assignment_is_stable() {
        let mut table = HashMap::new();
        let mut announced = Vec::new();
        assert_eq!(alias_for(&mut table, "temp", &mut announced), 1);
        assert_eq!(alias_for(&mut table, "hum", &mut announced), 2);
        assert_eq!(alias_for(&mut table, "temp", &mut announced), 1);
        assert_eq!(announced.len(), 2);
    }
}
