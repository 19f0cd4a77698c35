/// Common types used throughout Mundus.
///
/// This module defines the data model shared by the write path, the
/// subscription bus, the persistence layer, and the wire protocol: objects
/// are named by a `Uri` and carry a set of time-stamped [`Attribute`]
/// values, each tagged with the solver (`origin`) that produced it.
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// User-supplied text identifier of an object.
///
/// Stored as UTF-8 in memory; the wire protocol carries it as UTF-16BE.
pub type Uri = String;

/// Signed 64-bit millisecond timestamp.
pub type Timestamp = i64;

/// Reserved attribute name denoting an object's own lifecycle.
///
/// Its creation time is the object's birth and its expiration time the
/// object's death. Every live URI carries exactly one such attribute and
/// attribute-scoped deletion silently skips it.
pub const CREATION_NAME: &str = "creation";

/// Expiration value of an attribute that has not expired.
pub const NEVER_EXPIRED: Timestamp = 0;

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_ms() -> Timestamp {
    Utc::now().timestamp_millis()
}

/// A time-stamped named value attached to a URI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    /// Categorizes the fact (e.g. `location.x`).
    pub name: String,
    /// When this value became true.
    pub creation: Timestamp,
    /// When this value stopped being true; [`NEVER_EXPIRED`] while current.
    pub expiration: Timestamp,
    /// Identifier of the solver that produced the value.
    pub origin: String,
    /// Opaque payload bytes (may be empty).
    pub data: Vec<u8>,
}

impl Attribute {
    /// Create a live attribute.
    pub fn new(
        name: impl Into<String>,
        creation: Timestamp,
        origin: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            name: name.into(),
            creation,
            expiration: NEVER_EXPIRED,
            origin: origin.into(),
            data,
        }
    }

    /// The lifecycle marker inserted when an object is created.
    pub fn creation_marker(origin: impl Into<String>, creation: Timestamp) -> Self {
        Self::new(CREATION_NAME, creation, origin, Vec::new())
    }

    /// True while the attribute is part of the current state.
    pub fn is_live(&self) -> bool {
        self.expiration == NEVER_EXPIRED
    }

    /// Historic visibility: true iff the attribute was current at `at`.
    pub fn visible_at(&self, at: Timestamp) -> bool {
        self.creation <= at && (self.expiration == NEVER_EXPIRED || self.expiration > at)
    }

    /// True if `other` occupies the same `(name, origin)` slot.
    pub fn same_slot(&self, other: &Attribute) -> bool {
        self.name == other.name && self.origin == other.origin
    }

    /// Copy with the payload elided, for requests that skip data.
    pub fn without_data(&self) -> Self {
        Self {
            name: self.name.clone(),
            creation: self.creation,
            expiration: self.expiration,
            origin: self.origin.clone(),
            data: Vec::new(),
        }
    }
}

/// A set of objects and their attributes, as moved between the engine,
/// the subscription bus, and the persistence layer.
pub type WorldState = HashMap<Uri, Vec<Attribute>>;

/// Merge `from` into `into`, appending attributes per URI.
pub fn merge_state(into: &mut WorldState, from: WorldState) {
    for (uri, mut attributes) in from {
        into.entry(uri).or_default().append(&mut attributes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visibility_window() {
        let mut attr = Attribute::new("temp", 100, "solver", vec![1]);
        assert!(!attr.visible_at(99));
        assert!(attr.visible_at(100));
        assert!(attr.visible_at(i64::MAX));

        attr.expiration = 200;
        assert!(attr.visible_at(150));
        // Expiration instant itself is no longer visible.
        assert!(!attr.visible_at(200));
        assert!(!attr.visible_at(300));
    }

    #[test]
    fn test_creation_marker() {
        let marker = Attribute::creation_marker("solver", 42);
        assert_eq!(marker.name, CREATION_NAME);
        assert_eq!(marker.creation, 42);
        assert!(marker.is_live());
        assert!(marker.data.is_empty());
    }

    #[test]
    fn test_same_slot_ignores_times() {
        let a = Attribute::new("temp", 100, "s", vec![]);
        let b = Attribute::new("temp", 999, "s", vec![7]);
        let c = Attribute::new("temp", 100, "t", vec![]);
        assert!(a.same_slot(&b));
        assert!(!a.same_slot(&c));
    }

    #[test]
    fn test_merge_state_appends() {
        let mut left: WorldState = HashMap::new();
        left.insert("obj".into(), vec![Attribute::new("a", 1, "s", vec![])]);
        let mut right: WorldState = HashMap::new();
        right.insert("obj".into(), vec![Attribute::new("b", 2, "s", vec![])]);
        right.insert("other".into(), vec![Attribute::new("c", 3, "s", vec![])]);

        merge_state(&mut left, right);
        assert_eq!(left["obj"].len(), 2);
        assert_eq!(left["other"].len(), 1);
    }
}
