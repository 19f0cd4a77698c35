/// End-to-end tests over real TCP connections on both listener ports.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mundus::protocol::{client as cproto, codec, solver as sproto, ClientMessageId};
use mundus::{Config, MemoryStore, Server};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};

async fn start_server() -> Server {
    let config = Config { solver_port: 0, client_port: 0, ..Config::default() };
    Server::start_with_store(config, Arc::new(MemoryStore::new())).await.unwrap()
}

async fn handshake(stream: &mut TcpStream) {
    let ours = codec::handshake_bytes();
    stream.write_all(&ours).await.unwrap();
    let mut theirs = vec![0u8; ours.len()];
    stream.read_exact(&mut theirs).await.unwrap();
    assert_eq!(theirs, ours, "handshake must be identical in both directions");
}

struct TestSolver {
    stream: TcpStream,
}

impl TestSolver {
    async fn connect(addr: SocketAddr, origin: &str, types: &[(u32, &str, bool)]) -> Self {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        handshake(&mut stream).await;
        let announce = sproto::TypeAnnounce {
            types: types
                .iter()
                .map(|(alias, name, on_demand)| sproto::TypeAlias {
                    alias: *alias,
                    name: (*name).to_string(),
                    on_demand: *on_demand,
                })
                .collect(),
            origin: origin.to_string(),
        };
        stream.write_all(&announce.encode()).await.unwrap();
        Self { stream }
    }

    async fn create_uri(&mut self, uri: &str, creation: i64, origin: &str) {
        let message = sproto::CreateUri {
            uri: uri.to_string(),
            creation,
            origin: origin.to_string(),
        };
        self.stream.write_all(&message.encode()).await.unwrap();
    }

    async fn publish(&mut self, alias: u32, time: i64, target: &str, data: Vec<u8>, autocreate: bool) {
        let message = sproto::SolverData {
            create_uris: autocreate,
            solutions: vec![sproto::Solution {
                type_alias: alias,
                time,
                target: target.to_string(),
                data,
            }],
        };
        self.stream.write_all(&message.encode()).await.unwrap();
    }
}

#[derive(Debug)]
struct ReceivedAttribute {
    name: String,
    creation: i64,
    expiration: i64,
    origin: String,
    data: Vec<u8>,
}

#[derive(Debug)]
enum ClientEvent {
    Data { uri: String, ticket: u32, attributes: Vec<ReceivedAttribute> },
    Complete { ticket: u32 },
    SearchResult { uris: Vec<String> },
}

struct TestClient {
    stream: TcpStream,
    attr_aliases: HashMap<u32, String>,
    origin_aliases: HashMap<u32, String>,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        handshake(&mut stream).await;
        Self { stream, attr_aliases: HashMap::new(), origin_aliases: HashMap::new() }
    }

    async fn send(&mut self, frame: Vec<u8>) {
        self.stream.write_all(&frame).await.unwrap();
    }

    async fn subscribe(&mut self, ticket: u32, uri: &str, attrs: &[&str], cadence_ms: i64) {
        let request = cproto::Request {
            ticket,
            uri_pattern: uri.to_string(),
            attributes: attrs.iter().map(|s| s.to_string()).collect(),
            start: 0,
            stop: cadence_ms,
        };
        self.send(request.encode(ClientMessageId::StreamRequest)).await;
    }

    async fn snapshot(&mut self, ticket: u32, uri: &str, attrs: &[&str]) {
        let request = cproto::Request {
            ticket,
            uri_pattern: uri.to_string(),
            attributes: attrs.iter().map(|s| s.to_string()).collect(),
            start: 0,
            stop: 0,
        };
        self.send(request.encode(ClientMessageId::SnapshotRequest)).await;
    }

    async fn range(&mut self, ticket: u32, uri: &str, attrs: &[&str], start: i64, stop: i64) {
        let request = cproto::Request {
            ticket,
            uri_pattern: uri.to_string(),
            attributes: attrs.iter().map(|s| s.to_string()).collect(),
            start,
            stop,
        };
        self.send(request.encode(ClientMessageId::RangeRequest)).await;
    }

    /// Read frames, folding alias announcements into the session tables,
    /// until a visible event arrives or the timeout passes.
    async fn next_event(&mut self, wait: Duration) -> Option<ClientEvent> {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let frame = match timeout(remaining, codec::read_frame(&mut self.stream)).await {
                Ok(Ok(frame)) => frame,
                _ => return None,
            };
            let (id, payload) = frame;
            match ClientMessageId::try_from(id).unwrap() {
                ClientMessageId::KeepAlive => continue,
                ClientMessageId::AttributeAlias => {
                    for entry in cproto::AliasMessage::decode(&payload).unwrap().entries {
                        self.attr_aliases.insert(entry.alias, entry.name);
                    }
                }
                ClientMessageId::OriginAlias => {
                    for entry in cproto::AliasMessage::decode(&payload).unwrap().entries {
                        self.origin_aliases.insert(entry.alias, entry.name);
                    }
                }
                ClientMessageId::DataResponse => {
                    let response = cproto::DataResponse::decode(&payload).unwrap();
                    let attributes = response
                        .attributes
                        .into_iter()
                        .map(|attribute| ReceivedAttribute {
                            name: self.attr_aliases[&attribute.name_alias].clone(),
                            creation: attribute.creation,
                            expiration: attribute.expiration,
                            origin: self
                                .origin_aliases
                                .get(&attribute.origin_alias)
                                .cloned()
                                .unwrap_or_default(),
                            data: attribute.data,
                        })
                        .collect();
                    return Some(ClientEvent::Data {
                        uri: response.object_uri,
                        ticket: response.ticket,
                        attributes,
                    });
                }
                ClientMessageId::RequestComplete => {
                    let complete = cproto::RequestComplete::decode(&payload).unwrap();
                    return Some(ClientEvent::Complete { ticket: complete.ticket });
                }
                ClientMessageId::UriSearchResponse => {
                    let response = cproto::UriSearchResponse::decode(&payload).unwrap();
                    return Some(ClientEvent::SearchResult { uris: response.uris });
                }
                other => panic!("unexpected message from engine: {other:?}"),
            }
        }
    }

    /// A request/response barrier that also proves the connection is
    /// healthy: every preceding message has been processed once the search
    /// response arrives.
    async fn search(&mut self, pattern: &str) -> Vec<String> {
        let message = cproto::UriSearch { pattern: pattern.to_string() };
        self.send(message.encode()).await;
        loop {
            match self.next_event(Duration::from_secs(2)).await {
                Some(ClientEvent::SearchResult { uris }) => return uris,
                Some(_) => continue,
                None => panic!("no search response"),
            }
        }
    }

    /// Collect data events until `request_complete` for the ticket.
    async fn collect_until_complete(&mut self, ticket: u32) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        loop {
            match self.next_event(Duration::from_secs(2)).await {
                Some(ClientEvent::Complete { ticket: t }) if t == ticket => return events,
                Some(event) => events.push(event),
                None => panic!("request {ticket} never completed"),
            }
        }
    }
}

#[tokio::test]
async fn test_snapshot_and_range_over_the_wire() {
    let server = start_server().await;
    let mut solver =
        TestSolver::connect(server.solver_addr(), "s", &[(1, "temp", false)]).await;
    solver.create_uri("room.1", 100, "s").await;
    solver.publish(1, 200, "room.1", vec![0x10], false).await;
    solver.publish(1, 300, "room.1", vec![0x20], false).await;

    let mut client = TestClient::connect(server.client_addr()).await;

    // Poll until the writes are visible.
    let mut attributes = None;
    for attempt in 0..40u32 {
        let ticket = 10 + attempt;
        client.snapshot(ticket, ".*", &["temp"]).await;
        let events = client.collect_until_complete(ticket).await;
        attributes = events.into_iter().find_map(|event| match event {
            ClientEvent::Data { uri, attributes, .. } if uri == "room.1" => Some(attributes),
            _ => None,
        });
        if attributes.is_some() {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    let attributes = attributes.expect("writes never became visible");
    assert_eq!(attributes.len(), 1);
    assert_eq!(attributes[0].name, "temp");
    assert_eq!(attributes[0].creation, 300);
    assert_eq!(attributes[0].origin, "s");
    assert_eq!(attributes[0].data, vec![0x20]);

    // The superseded row shows up in a range scan with its expiration.
    client.range(77, ".*", &["temp"], 0, 400).await;
    let events = client.collect_until_complete(77).await;
    let rows = events
        .iter()
        .find_map(|event| match event {
            ClientEvent::Data { uri, attributes, .. } if uri == "room.1" => Some(attributes),
            _ => None,
        })
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].creation, 200);
    assert_eq!(rows[0].expiration, 300);
    assert_eq!(rows[1].creation, 300);
    assert_eq!(rows[1].expiration, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_stream_coverage_then_cancel_ordering() {
    let server = start_server().await;
    let mut solver =
        TestSolver::connect(server.solver_addr(), "s", &[(1, "a", false), (2, "b", false)]).await;

    let mut client = TestClient::connect(server.client_addr()).await;
    client.subscribe(7, "room.*", &["^a$", "^b$"], 50).await;
    // Barrier: the subscription is live once the search answers.
    client.search("nothing-matches").await;

    // One pattern satisfied: nothing may be delivered.
    solver.publish(1, 100, "room.1", vec![1], true).await;
    assert!(client.next_event(Duration::from_millis(300)).await.is_none());

    // Full coverage: both attributes arrive together.
    solver.publish(2, 110, "room.1", vec![2], false).await;
    let Some(ClientEvent::Data { uri, ticket, attributes }) =
        client.next_event(Duration::from_secs(2)).await
    else {
        panic!("expected coverage delivery");
    };
    assert_eq!(uri, "room.1");
    assert_eq!(ticket, 7);
    let mut names: Vec<&str> = attributes.iter().map(|a| a.name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["a", "b"]);

    // Covered URI: only the newer value flows.
    solver.publish(1, 200, "room.1", vec![3], false).await;
    let Some(ClientEvent::Data { attributes, .. }) =
        client.next_event(Duration::from_secs(2)).await
    else {
        panic!("expected update delivery");
    };
    assert_eq!(attributes.len(), 1);
    assert_eq!(attributes[0].name, "a");
    assert_eq!(attributes[0].creation, 200);

    // Cancel: the next message on the ticket is request_complete, and
    // nothing follows it even though the solver keeps writing.
    client.send(cproto::CancelRequest { ticket: 7 }.encode()).await;
    let Some(ClientEvent::Complete { ticket }) = client.next_event(Duration::from_secs(2)).await
    else {
        panic!("expected cancellation acknowledgement");
    };
    assert_eq!(ticket, 7);

    solver.publish(1, 300, "room.1", vec![4], false).await;
    solver.publish(2, 300, "room.1", vec![5], false).await;
    assert!(client.next_event(Duration::from_millis(300)).await.is_none());

    server.shutdown().await;
}

#[tokio::test]
async fn test_origin_preference_suppresses_weaker_origin() {
    let server = start_server().await;
    let mut hi = TestSolver::connect(server.solver_addr(), "hi", &[(1, "loc", false)]).await;
    let mut lo = TestSolver::connect(server.solver_addr(), "lo", &[(1, "loc", false)]).await;

    let mut client = TestClient::connect(server.client_addr()).await;
    let preferences = cproto::OriginPreference {
        preferences: vec![("hi".to_string(), 10), ("lo".to_string(), 1)],
    };
    client.send(preferences.encode()).await;
    client.subscribe(3, "o1", &["^loc$"], 30).await;
    client.search("barrier").await;

    hi.publish(1, 100, "o1", vec![0x01], true).await;
    let Some(ClientEvent::Data { attributes, .. }) =
        client.next_event(Duration::from_secs(2)).await
    else {
        panic!("expected delivery from the preferred origin");
    };
    assert_eq!(attributes.len(), 1);
    assert_eq!(attributes[0].origin, "hi");

    // The weaker origin's concurrent publish is suppressed.
    lo.publish(1, 150, "o1", vec![0x02], false).await;
    assert!(client.next_event(Duration::from_millis(400)).await.is_none());

    server.shutdown().await;
}

#[tokio::test]
async fn test_uri_search_bad_regex_keeps_connection() {
    let server = start_server().await;
    let mut solver = TestSolver::connect(server.solver_addr(), "s", &[(1, "temp", false)]).await;
    solver.create_uri("room.1", 100, "s").await;

    let mut client = TestClient::connect(server.client_addr()).await;
    // An invalid pattern returns an empty result and does not close the
    // connection.
    assert!(client.search("room[").await.is_empty());

    // Poll for the creation to become visible through a valid search.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let uris = client.search("room\\.1").await;
        if uris == vec!["room.1".to_string()] {
            break;
        }
        assert!(Instant::now() < deadline, "URI never became searchable");
        sleep(Duration::from_millis(25)).await;
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_handshake_mismatch_closes_connection() {
    let server = start_server().await;
    let mut stream = TcpStream::connect(server.client_addr()).await.unwrap();

    // Read and ignore the server's handshake, then answer with garbage of
    // the right length.
    let expected = codec::handshake_bytes();
    let mut greeting = vec![0u8; expected.len()];
    stream.read_exact(&mut greeting).await.unwrap();
    let garbage = vec![0xFFu8; expected.len()];
    stream.write_all(&garbage).await.unwrap();

    // The engine drops the connection: the next read hits EOF.
    let mut probe = [0u8; 1];
    let read = timeout(Duration::from_secs(2), stream.read(&mut probe)).await;
    assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_))));

    server.shutdown().await;
}

#[tokio::test]
async fn test_on_demand_start_and_stop_reach_solver() {
    let server = start_server().await;
    let mut solver =
        TestSolver::connect(server.solver_addr(), "cam", &[(5, "camera.frame", true)]).await;

    let mut client = TestClient::connect(server.client_addr()).await;
    client.subscribe(9, "room.*", &["camera.frame"], 50).await;
    client.search("barrier").await;

    // The solver is told to start producing for the subscribed pattern.
    let (id, payload) =
        timeout(Duration::from_secs(2), codec::read_frame(&mut solver.stream))
            .await
            .unwrap()
            .unwrap();
    assert_eq!(id, mundus::protocol::SolverMessageId::StartOnDemand as u8);
    let message = sproto::OnDemandMessage::decode(&payload).unwrap();
    assert_eq!(message.entries[0].alias, 5);
    assert_eq!(message.entries[0].patterns, vec!["room.*".to_string()]);

    // Cancelling the last interested subscription stops production.
    client.send(cproto::CancelRequest { ticket: 9 }.encode()).await;
    let (id, payload) =
        timeout(Duration::from_secs(2), codec::read_frame(&mut solver.stream))
            .await
            .unwrap()
            .unwrap();
    assert_eq!(id, mundus::protocol::SolverMessageId::StopOnDemand as u8);
    let message = sproto::OnDemandMessage::decode(&payload).unwrap();
    assert_eq!(message.entries[0].patterns, vec!["room.*".to_string()]);

    server.shutdown().await;
}
