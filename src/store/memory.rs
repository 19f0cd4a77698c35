/// In-process attribute store with full temporal semantics.
///
/// Keeps every row in memory and answers historic queries exactly like the
/// SQL backend, without the database. Useful for embedding the engine in a
/// single process and as the persistence double in tests.
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::WmResult;
use crate::types::{Attribute, Timestamp, Uri, WorldState, CREATION_NAME, NEVER_EXPIRED};

use super::{compile_anchored, AttributeStore};

#[derive(Debug, Clone)]
struct Row {
    uri: Uri,
    attribute: Attribute,
}

/// A store whose "disk" is a vector of rows.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<Row>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows currently held, including history.
    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }
}

#[async_trait]
impl AttributeStore for MemoryStore {
    async fn store_attributes(&self, uri: &Uri, entries: &[Attribute]) -> WorldState {
        let mut rows = self.rows.lock().unwrap();
        let mut stored = WorldState::new();
        for entry in entries {
            let duplicate = rows.iter().any(|row| {
                row.uri == *uri
                    && row.attribute.name == entry.name
                    && row.attribute.origin == entry.origin
                    && row.attribute.creation == entry.creation
            });
            if duplicate {
                continue;
            }
            // Older live rows in the same slot end where this row begins.
            let mut next_creation: Option<Timestamp> = None;
            for row in rows.iter_mut() {
                if row.uri != *uri
                    || row.attribute.name != entry.name
                    || row.attribute.origin != entry.origin
                {
                    continue;
                }
                if row.attribute.creation < entry.creation
                    && row.attribute.expiration == NEVER_EXPIRED
                {
                    row.attribute.expiration = entry.creation;
                }
                if row.attribute.creation > entry.creation {
                    next_creation = Some(match next_creation {
                        Some(existing) => existing.min(row.attribute.creation),
                        None => row.attribute.creation,
                    });
                }
            }
            // A row arriving behind a newer one enters history pre-expired.
            let mut attribute = entry.clone();
            attribute.expiration = match next_creation {
                Some(created) => created,
                None => entry.expiration,
            };
            rows.push(Row { uri: uri.clone(), attribute });
            stored.entry(uri.clone()).or_default().push(entry.clone());
        }
        stored
    }

    async fn update_expiration(&self, uri: &Uri, entries: &[Attribute]) -> WorldState {
        let mut rows = self.rows.lock().unwrap();
        let mut updated = WorldState::new();
        let expire_whole_uri = entries.len() == 1 && entries[0].name == CREATION_NAME;
        if expire_whole_uri {
            let expiration = entries[0].expiration;
            for row in rows.iter_mut() {
                if row.uri == *uri && row.attribute.expiration == NEVER_EXPIRED {
                    row.attribute.expiration = expiration;
                    updated.entry(uri.clone()).or_default().push(row.attribute.clone());
                }
            }
        } else {
            for entry in entries {
                for row in rows.iter_mut() {
                    if row.uri == *uri
                        && row.attribute.name == entry.name
                        && row.attribute.origin == entry.origin
                        && row.attribute.creation == entry.creation
                        && row.attribute.expiration == NEVER_EXPIRED
                    {
                        row.attribute.expiration = entry.expiration;
                        updated.entry(uri.clone()).or_default().push(row.attribute.clone());
                    }
                }
            }
        }
        updated
    }

    async fn delete_uri(&self, uri: &Uri) -> WmResult<()> {
        self.rows.lock().unwrap().retain(|row| row.uri != *uri);
        Ok(())
    }

    async fn delete_attributes(&self, uri: &Uri, entries: &[(String, String)]) -> WorldState {
        let mut rows = self.rows.lock().unwrap();
        let mut deleted = WorldState::new();
        rows.retain(|row| {
            let matched = row.uri == *uri
                && entries
                    .iter()
                    .any(|(name, origin)| row.attribute.name == *name && row.attribute.origin == *origin);
            if matched {
                deleted.entry(uri.clone()).or_default().push(row.attribute.clone());
            }
            !matched
        });
        deleted
    }

    async fn fetch_current(
        &self,
        uri_pattern: &str,
        attr_pattern: &str,
        origin_pattern: &str,
    ) -> WorldState {
        self.fetch_where(uri_pattern, attr_pattern, origin_pattern, |attribute| {
            attribute.expiration == NEVER_EXPIRED
        })
    }

    async fn fetch_snapshot_at(
        &self,
        uri_pattern: &str,
        attr_pattern: &str,
        origin_pattern: &str,
        at: Timestamp,
    ) -> WorldState {
        self.fetch_where(uri_pattern, attr_pattern, origin_pattern, |attribute| {
            attribute.visible_at(at)
        })
    }

    async fn fetch_range(
        &self,
        uri_pattern: &str,
        attr_pattern: &str,
        origin_pattern: &str,
        from: Timestamp,
        to: Timestamp,
    ) -> WorldState {
        let mut result = self.fetch_where(uri_pattern, attr_pattern, origin_pattern, |attribute| {
            attribute.creation >= from && attribute.creation <= to
        });
        for attributes in result.values_mut() {
            attributes.sort_by_key(|attribute| attribute.creation);
        }
        result
    }
}

impl MemoryStore {
    fn fetch_where(
        &self,
        uri_pattern: &str,
        attr_pattern: &str,
        origin_pattern: &str,
        keep: impl Fn(&Attribute) -> bool,
    ) -> WorldState {
        let (Some(uri_re), Some(attr_re), Some(origin_re)) = (
            compile_anchored(uri_pattern),
            compile_anchored(attr_pattern),
            compile_anchored(origin_pattern),
        ) else {
            return WorldState::new();
        };
        let rows = self.rows.lock().unwrap();
        let mut result = WorldState::new();
        for row in rows.iter() {
            if keep(&row.attribute)
                && uri_re.is_match(&row.uri)
                && attr_re.is_match(&row.attribute.name)
                && origin_re.is_match(&row.attribute.origin)
            {
                result.entry(row.uri.clone()).or_default().push(row.attribute.clone());
            }
        }
        result
    }
}
