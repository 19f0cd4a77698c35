/// Messages exchanged on the client channel.
///
/// Every client request carries a ticket the engine echoes on each
/// `data_response`; `request_complete` with the same ticket ends a one-shot
/// request or acknowledges a cancellation. Attribute names and origins are
/// aliased per session and announced before first use.
use crate::error::WmResult;
use crate::types::{Timestamp, Uri};

use super::codec::{self, frame_bytes, Reader};
use super::ClientMessageId;

/// Shared shape of `snapshot_request`, `range_request`, and
/// `stream_request`.
///
/// For snapshots `start == stop == 0` asks for the current state and any
/// other pair for a historic snapshot at `stop`; for range requests the
/// pair bounds the scan; for stream requests `stop` is the delivery cadence
/// in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub ticket: u32,
    pub uri_pattern: String,
    pub attributes: Vec<String>,
    pub start: Timestamp,
    pub stop: Timestamp,
}

impl Request {
    pub fn encode(&self, id: ClientMessageId) -> Vec<u8> {
        let mut payload = Vec::new();
        codec::put_u32(&mut payload, self.ticket);
        codec::put_string(&mut payload, &self.uri_pattern);
        codec::put_u32(&mut payload, self.attributes.len() as u32);
        for attribute in &self.attributes {
            codec::put_string(&mut payload, attribute);
        }
        codec::put_i64(&mut payload, self.start);
        codec::put_i64(&mut payload, self.stop);
        frame_bytes(id as u8, &payload)
    }

    pub fn decode(payload: &[u8]) -> WmResult<Self> {
        let mut reader = Reader::new(payload);
        let ticket = reader.u32()?;
        let uri_pattern = reader.string()?;
        let count = reader.u32()?;
        let mut attributes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            attributes.push(reader.string()?);
        }
        let start = reader.i64()?;
        let stop = reader.i64()?;
        reader.finish()?;
        Ok(Self { ticket, uri_pattern, attributes, start, stop })
    }
}

/// `cancel_request`: stop the subscription or request with this ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelRequest {
    pub ticket: u32,
}

impl CancelRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        codec::put_u32(&mut payload, self.ticket);
        frame_bytes(ClientMessageId::CancelRequest as u8, &payload)
    }

    pub fn decode(payload: &[u8]) -> WmResult<Self> {
        let mut reader = Reader::new(payload);
        let ticket = reader.u32()?;
        reader.finish()?;
        Ok(Self { ticket })
    }
}

/// `request_complete`: a one-shot request finished or a subscription was
/// cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestComplete {
    pub ticket: u32,
}

impl RequestComplete {
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        codec::put_u32(&mut payload, self.ticket);
        frame_bytes(ClientMessageId::RequestComplete as u8, &payload)
    }

    pub fn decode(payload: &[u8]) -> WmResult<Self> {
        let mut reader = Reader::new(payload);
        let ticket = reader.u32()?;
        reader.finish()?;
        Ok(Self { ticket })
    }
}

/// `uri_search`: list current URIs matching a pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriSearch {
    pub pattern: String,
}

impl UriSearch {
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        codec::put_string(&mut payload, &self.pattern);
        frame_bytes(ClientMessageId::UriSearch as u8, &payload)
    }

    pub fn decode(payload: &[u8]) -> WmResult<Self> {
        let mut reader = Reader::new(payload);
        let pattern = reader.string()?;
        reader.finish()?;
        Ok(Self { pattern })
    }
}

/// `uri_search_response`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriSearchResponse {
    pub uris: Vec<Uri>,
}

impl UriSearchResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        codec::put_u32(&mut payload, self.uris.len() as u32);
        for uri in &self.uris {
            codec::put_string(&mut payload, uri);
        }
        frame_bytes(ClientMessageId::UriSearchResponse as u8, &payload)
    }

    pub fn decode(payload: &[u8]) -> WmResult<Self> {
        let mut reader = Reader::new(payload);
        let count = reader.u32()?;
        let mut uris = Vec::with_capacity(count as usize);
        for _ in 0..count {
            uris.push(reader.string()?);
        }
        reader.finish()?;
        Ok(Self { uris })
    }
}

/// `origin_preference`: per-origin integer preferences; negative suppresses
/// an origin outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginPreference {
    pub preferences: Vec<(String, i32)>,
}

impl OriginPreference {
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        codec::put_u32(&mut payload, self.preferences.len() as u32);
        for (origin, level) in &self.preferences {
            codec::put_string(&mut payload, origin);
            codec::put_i32(&mut payload, *level);
        }
        frame_bytes(ClientMessageId::OriginPreference as u8, &payload)
    }

    pub fn decode(payload: &[u8]) -> WmResult<Self> {
        let mut reader = Reader::new(payload);
        let count = reader.u32()?;
        let mut preferences = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let origin = reader.string()?;
            let level = reader.i32()?;
            preferences.push((origin, level));
        }
        reader.finish()?;
        Ok(Self { preferences })
    }
}

/// One alias assignment inside an `attribute_alias` or `origin_alias`
/// message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasEntry {
    pub alias: u32,
    pub name: String,
}

/// `attribute_alias` / `origin_alias`, engine to client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasMessage {
    pub entries: Vec<AliasEntry>,
}

impl AliasMessage {
    pub fn encode(&self, id: ClientMessageId) -> Vec<u8> {
        debug_assert!(matches!(
            id,
            ClientMessageId::AttributeAlias | ClientMessageId::OriginAlias
        ));
        let mut payload = Vec::new();
        codec::put_u32(&mut payload, self.entries.len() as u32);
        for entry in &self.entries {
            codec::put_u32(&mut payload, entry.alias);
            codec::put_string(&mut payload, &entry.name);
        }
        frame_bytes(id as u8, &payload)
    }

    pub fn decode(payload: &[u8]) -> WmResult<Self> {
        let mut reader = Reader::new(payload);
        let count = reader.u32()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let alias = reader.u32()?;
            let name = reader.string()?;
            entries.push(AliasEntry { alias, name });
        }
        reader.finish()?;
        Ok(Self { entries })
    }
}

/// An attribute with its name and origin replaced by session aliases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasedAttribute {
    pub name_alias: u32,
    pub creation: Timestamp,
    pub expiration: Timestamp,
    pub origin_alias: u32,
    pub data: Vec<u8>,
}

/// `data_response`: one object's attributes for the given ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataResponse {
    pub object_uri: Uri,
    pub ticket: u32,
    pub attributes: Vec<AliasedAttribute>,
}

impl DataResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        codec::put_string(&mut payload, &self.object_uri);
        codec::put_u32(&mut payload, self.ticket);
        codec::put_u32(&mut payload, self.attributes.len() as u32);
        for attribute in &self.attributes {
            codec::put_u32(&mut payload, attribute.name_alias);
            codec::put_i64(&mut payload, attribute.creation);
            codec::put_i64(&mut payload, attribute.expiration);
            codec::put_u32(&mut payload, attribute.origin_alias);
            codec::put_bytes(&mut payload, &attribute.data);
        }
        frame_bytes(ClientMessageId::DataResponse as u8, &payload)
    }

    pub fn decode(payload: &[u8]) -> WmResult<Self> {
        let mut reader = Reader::new(payload);
        let object_uri = reader.string()?;
        let ticket = reader.u32()?;
        let count = reader.u32()?;
        let mut attributes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name_alias = reader.u32()?;
            let creation = reader.i64()?;
            let expiration = reader.i64()?;
            let origin_alias = reader.u32()?;
            let data = reader.bytes()?;
            attributes.push(AliasedAttribute {
                name_alias,
                creation,
                expiration,
                origin_alias,
                data,
            });
        }
        reader.finish()?;
        Ok(Self { object_uri, ticket, attributes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::read_frame;

    async fn frame_payload(frame: Vec<u8>, expect_id: ClientMessageId) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(frame);
        let (id, payload) = read_frame(&mut cursor).await.unwrap();
        assert_eq!(id, expect_id as u8);
        payload
    }

    #[tokio::test]
    async fn test_stream_request_round_trip() {
        let request = Request {
            ticket: 7,
            uri_pattern: "room\\..*".into(),
            attributes: vec!["^a$".into(), "^b$".into()],
            start: 0,
            stop: 50,
        };
        let payload =
            frame_payload(request.encode(ClientMessageId::StreamRequest), ClientMessageId::StreamRequest)
                .await;
        assert_eq!(Request::decode(&payload).unwrap(), request);
    }

    #[tokio::test]
    async fn test_data_response_round_trip() {
        let response = DataResponse {
            object_uri: "room.1".into(),
            ticket: 3,
            attributes: vec![AliasedAttribute {
                name_alias: 1,
                creation: 200,
                expiration: 0,
                origin_alias: 1,
                data: vec![0x10],
            }],
        };
        let payload = frame_payload(response.encode(), ClientMessageId::DataResponse).await;
        assert_eq!(DataResponse::decode(&payload).unwrap(), response);
    }

    #[tokio::test]
    async fn test_alias_message_round_trip() {
        let message = AliasMessage {
            entries: vec![AliasEntry { alias: 1, name: "temperature".into() }],
        };
        let payload =
            frame_payload(message.encode(ClientMessageId::OriginAlias), ClientMessageId::OriginAlias)
                .await;
        assert_eq!(AliasMessage::decode(&payload).unwrap(), message);
    }

    #[tokio::test]
    async fn test_origin_preference_negative_levels() {
        let message = OriginPreference {
            preferences: vec![("hi".into(), 10), ("lo".into(), -1)],
        };
        let payload =
            frame_payload(message.encode(), ClientMessageId::OriginPreference).await;
        let decoded = OriginPreference::decode(&payload).unwrap();
        assert_eq!(decoded.preferences[1], ("lo".to_string(), -1));
    }
}
