/// Messages exchanged on the solver channel.
///
/// Solvers announce attribute types (with session-local aliases), push
/// solution data, and drive object lifecycle; the engine answers with
/// on-demand start/stop instructions and keep-alives.
use crate::error::WmResult;
use crate::types::{Timestamp, Uri};

use super::codec::{self, frame_bytes, Reader};
use super::SolverMessageId;

/// One announced attribute type and its session alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeAlias {
    pub alias: u32,
    pub name: String,
    /// On-demand types start silent and are produced only while requested.
    pub on_demand: bool,
}

/// `type_announce`: aliases for the attribute names a solver will send,
/// plus the solver's origin string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeAnnounce {
    pub types: Vec<TypeAlias>,
    pub origin: String,
}

impl TypeAnnounce {
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        codec::put_u32(&mut payload, self.types.len() as u32);
        for entry in &self.types {
            codec::put_u32(&mut payload, entry.alias);
            codec::put_string(&mut payload, &entry.name);
            codec::put_u8(&mut payload, entry.on_demand as u8);
        }
        codec::put_string(&mut payload, &self.origin);
        frame_bytes(SolverMessageId::TypeAnnounce as u8, &payload)
    }

    pub fn decode(payload: &[u8]) -> WmResult<Self> {
        let mut reader = Reader::new(payload);
        let count = reader.u32()?;
        let mut types = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let alias = reader.u32()?;
            let name = reader.string()?;
            let on_demand = reader.u8()? != 0;
            types.push(TypeAlias { alias, name, on_demand });
        }
        let origin = reader.string()?;
        reader.finish()?;
        Ok(Self { types, origin })
    }
}

/// One attribute assertion inside a `solver_data` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Solution {
    pub type_alias: u32,
    pub time: Timestamp,
    pub target: Uri,
    pub data: Vec<u8>,
}

/// `solver_data`: a batch of solutions, optionally autocreating targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolverData {
    pub create_uris: bool,
    pub solutions: Vec<Solution>,
}

impl SolverData {
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        codec::put_u8(&mut payload, self.create_uris as u8);
        codec::put_u32(&mut payload, self.solutions.len() as u32);
        for solution in &self.solutions {
            codec::put_u32(&mut payload, solution.type_alias);
            codec::put_i64(&mut payload, solution.time);
            codec::put_string(&mut payload, &solution.target);
            codec::put_bytes(&mut payload, &solution.data);
        }
        frame_bytes(SolverMessageId::SolverData as u8, &payload)
    }

    pub fn decode(payload: &[u8]) -> WmResult<Self> {
        let mut reader = Reader::new(payload);
        let create_uris = reader.u8()? != 0;
        let count = reader.u32()?;
        let mut solutions = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let type_alias = reader.u32()?;
            let time = reader.i64()?;
            let target = reader.string()?;
            let data = reader.bytes()?;
            solutions.push(Solution { type_alias, time, target, data });
        }
        reader.finish()?;
        Ok(Self { create_uris, solutions })
    }
}

/// `create_uri`: explicit object creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateUri {
    pub uri: Uri,
    pub creation: Timestamp,
    pub origin: String,
}

impl CreateUri {
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        codec::put_string(&mut payload, &self.uri);
        codec::put_i64(&mut payload, self.creation);
        codec::put_string(&mut payload, &self.origin);
        frame_bytes(SolverMessageId::CreateUri as u8, &payload)
    }

    pub fn decode(payload: &[u8]) -> WmResult<Self> {
        let mut reader = Reader::new(payload);
        let uri = reader.string()?;
        let creation = reader.i64()?;
        let origin = reader.string()?;
        reader.finish()?;
        Ok(Self { uri, creation, origin })
    }
}

/// `expire_uri`: remove an object from the current state, keeping history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpireUri {
    pub uri: Uri,
    pub expiration: Timestamp,
    pub origin: String,
}

impl ExpireUri {
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        codec::put_string(&mut payload, &self.uri);
        codec::put_i64(&mut payload, self.expiration);
        codec::put_string(&mut payload, &self.origin);
        frame_bytes(SolverMessageId::ExpireUri as u8, &payload)
    }

    pub fn decode(payload: &[u8]) -> WmResult<Self> {
        let mut reader = Reader::new(payload);
        let uri = reader.string()?;
        let expiration = reader.i64()?;
        let origin = reader.string()?;
        reader.finish()?;
        Ok(Self { uri, expiration, origin })
    }
}

/// `delete_uri`: purge an object and its history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteUri {
    pub uri: Uri,
    pub origin: String,
}

impl DeleteUri {
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        codec::put_string(&mut payload, &self.uri);
        codec::put_string(&mut payload, &self.origin);
        frame_bytes(SolverMessageId::DeleteUri as u8, &payload)
    }

    pub fn decode(payload: &[u8]) -> WmResult<Self> {
        let mut reader = Reader::new(payload);
        let uri = reader.string()?;
        let origin = reader.string()?;
        reader.finish()?;
        Ok(Self { uri, origin })
    }
}

/// `expire_attribute`: expire one exact attribute slot.
///
/// The slot's creation timestamp travels along so only the exact current
/// value is matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpireAttribute {
    pub uri: Uri,
    pub name: String,
    pub creation: Timestamp,
    pub expiration: Timestamp,
    pub origin: String,
}

impl ExpireAttribute {
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        codec::put_string(&mut payload, &self.uri);
        codec::put_string(&mut payload, &self.name);
        codec::put_i64(&mut payload, self.creation);
        codec::put_i64(&mut payload, self.expiration);
        codec::put_string(&mut payload, &self.origin);
        frame_bytes(SolverMessageId::ExpireAttribute as u8, &payload)
    }

    pub fn decode(payload: &[u8]) -> WmResult<Self> {
        let mut reader = Reader::new(payload);
        let uri = reader.string()?;
        let name = reader.string()?;
        let creation = reader.i64()?;
        let expiration = reader.i64()?;
        let origin = reader.string()?;
        reader.finish()?;
        Ok(Self { uri, name, creation, expiration, origin })
    }
}

/// `delete_attribute`: purge one `(name, origin)` slot and its history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteAttribute {
    pub uri: Uri,
    pub name: String,
    pub origin: String,
}

impl DeleteAttribute {
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        codec::put_string(&mut payload, &self.uri);
        codec::put_string(&mut payload, &self.name);
        codec::put_string(&mut payload, &self.origin);
        frame_bytes(SolverMessageId::DeleteAttribute as u8, &payload)
    }

    pub fn decode(payload: &[u8]) -> WmResult<Self> {
        let mut reader = Reader::new(payload);
        let uri = reader.string()?;
        let name = reader.string()?;
        let origin = reader.string()?;
        reader.finish()?;
        Ok(Self { uri, name, origin })
    }
}

/// One on-demand instruction: an aliased attribute and the URI patterns it
/// should be produced for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnDemandEntry {
    pub alias: u32,
    pub patterns: Vec<String>,
}

/// `start_on_demand` / `stop_on_demand`, engine to solver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnDemandMessage {
    pub entries: Vec<OnDemandEntry>,
}

impl OnDemandMessage {
    pub fn encode(&self, start: bool) -> Vec<u8> {
        let id = if start {
            SolverMessageId::StartOnDemand
        } else {
            SolverMessageId::StopOnDemand
        };
        let mut payload = Vec::new();
        codec::put_u32(&mut payload, self.entries.len() as u32);
        for entry in &self.entries {
            codec::put_u32(&mut payload, entry.alias);
            codec::put_u32(&mut payload, entry.patterns.len() as u32);
            for pattern in &entry.patterns {
                codec::put_string(&mut payload, pattern);
            }
        }
        frame_bytes(id as u8, &payload)
    }

    pub fn decode(payload: &[u8]) -> WmResult<Self> {
        let mut reader = Reader::new(payload);
        let count = reader.u32()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let alias = reader.u32()?;
            let pattern_count = reader.u32()?;
            let mut patterns = Vec::with_capacity(pattern_count as usize);
            for _ in 0..pattern_count {
                patterns.push(reader.string()?);
            }
            entries.push(OnDemandEntry { alias, patterns });
        }
        reader.finish()?;
        Ok(Self { entries })
    }
}
