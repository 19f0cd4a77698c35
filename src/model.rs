/// The in-memory world model and its write path.
///
/// The current state is a URI → attributes map behind a readers-writers
/// gate: any number of read requests are serviced simultaneously while a
/// write operation takes the exclusive side. Within one URI at most one
/// attribute exists per `(name, origin)` pair; a newer value moves the
/// previous one to history with its expiration stamped to the newcomer's
/// creation time.
///
/// Durability is best-effort by design: writes always land in memory and
/// notify subscriptions, and persistence failures are logged by the store
/// collaborator rather than surfaced to the caller.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use regex::Regex;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::patterns::compile_anchored;
use crate::store::AttributeStore;
use crate::subscriptions::{Delta, StandingQuery, SubscriptionBus};
use crate::types::{
    merge_state, Attribute, Timestamp, Uri, WorldState, CREATION_NAME,
};

/// The engine: current state, transient registry, persistence collaborator,
/// and subscription bus.
pub struct WorldModel {
    state: RwLock<HashMap<Uri, Vec<Attribute>>>,
    transients: Mutex<HashSet<(String, String)>>,
    store: Arc<dyn AttributeStore>,
    bus: Arc<SubscriptionBus>,
}

impl WorldModel {
    /// Build the engine, rehydrating the current state from the store.
    pub async fn new(store: Arc<dyn AttributeStore>, bus: Arc<SubscriptionBus>) -> Arc<Self> {
        let current = store.fetch_current(".*", ".*", ".*").await;
        if !current.is_empty() {
            info!(objects = current.len(), "current state loaded from store");
        }
        Arc::new(Self {
            state: RwLock::new(current),
            transients: Mutex::new(HashSet::new()),
            store,
            bus,
        })
    }

    /// The subscription bus this engine feeds.
    pub fn bus(&self) -> &Arc<SubscriptionBus> {
        &self.bus
    }

    /// Create a new URI. Returns true iff the URI was newly created; a URI
    /// that already exists is a state conflict with no side effects.
    pub async fn create_uri(
        &self,
        uri: Uri,
        origin: impl Into<String>,
        creation: Timestamp,
    ) -> bool {
        let marker = Attribute::creation_marker(origin, creation);
        {
            let mut state = self.state.write().await;
            if state.contains_key(&uri) {
                debug!(%uri, "create of existing URI refused");
                return false;
            }
            state.insert(uri.clone(), vec![marker.clone()]);
        }
        self.store.store_attributes(&uri, &[marker]).await;
        true
    }

    /// Insert attribute data, one write-lock acquisition per URI.
    ///
    /// Transient-registered `(name, origin)` pairs never touch the current
    /// state or the store; they are relayed to subscriptions under strict
    /// matching. Data for an unknown URI is discarded unless `autocreate`
    /// is set, in which case a lifecycle attribute is synthesized from the
    /// first entry. An entry whose creation time does not exceed the
    /// current slot's is dropped from the current state but still persisted
    /// as history.
    pub async fn insert_data(
        &self,
        new_data: Vec<(Uri, Vec<Attribute>)>,
        autocreate: bool,
    ) -> bool {
        // Split out transients first, without holding the state gate.
        let mut transient_state = WorldState::new();
        let mut remaining: Vec<(Uri, Vec<Attribute>)> = Vec::with_capacity(new_data.len());
        {
            let transients = self.transients.lock().unwrap();
            for (uri, entries) in new_data {
                let mut kept = Vec::with_capacity(entries.len());
                for entry in entries {
                    if transients.contains(&(entry.name.clone(), entry.origin.clone())) {
                        transient_state.entry(uri.clone()).or_default().push(entry);
                    } else {
                        kept.push(entry);
                    }
                }
                if !kept.is_empty() {
                    remaining.push((uri, kept));
                }
            }
        }

        let mut delta_state = WorldState::new();
        let mut to_persist: Vec<(Uri, Vec<Attribute>)> = Vec::new();
        for (uri, mut entries) in remaining {
            let mut state = self.state.write().await;
            if !state.contains_key(&uri) {
                if autocreate {
                    let marker = Attribute::creation_marker(
                        entries[0].origin.clone(),
                        entries[0].creation,
                    );
                    state.insert(uri.clone(), vec![marker.clone()]);
                    delta_state.entry(uri.clone()).or_default().push(marker.clone());
                    // The synthesized lifecycle attribute is persisted with
                    // the batch.
                    entries.push(marker);
                } else {
                    debug!(%uri, "discarding data for unknown URI");
                    continue;
                }
            }
            let attributes = state.entry(uri.clone()).or_default();
            for entry in &entries {
                match attributes.iter().position(|held| held.same_slot(entry)) {
                    None => attributes.push(entry.clone()),
                    Some(index) if attributes[index].creation < entry.creation => {
                        // The previous value moves to history; the store
                        // stamps its expiration with this creation time.
                        attributes[index] = entry.clone();
                    }
                    Some(_) => {
                        // Equal or older than the current value: stays out
                        // of the current state, still reaches history.
                    }
                }
                delta_state.entry(uri.clone()).or_default().push(entry.clone());
            }
            drop(state);
            to_persist.push((uri, entries));
        }

        // Persist after releasing the gate; the blocking submit is the
        // write path's backpressure.
        for (uri, entries) in &to_persist {
            self.store.store_attributes(uri, entries).await;
        }

        if !delta_state.is_empty() || !transient_state.is_empty() {
            let origin = single_origin(&delta_state, &transient_state);
            self.bus.offer(Delta::Insert {
                state: delta_state,
                transients: transient_state,
                origin,
            });
        }
        true
    }

    /// Remove a URI from the current state and stamp its rows with an
    /// expiration time. History survives.
    pub async fn expire_uri(&self, uri: Uri, when: Timestamp) {
        {
            let mut state = self.state.write().await;
            if state.remove(&uri).is_none() {
                return;
            }
        }
        let mut marker = Attribute::creation_marker(String::new(), 0);
        marker.expiration = when;
        self.store.update_expiration(&uri, &[marker.clone()]).await;

        let mut changed = WorldState::new();
        changed.insert(uri, vec![marker]);
        self.bus.offer(Delta::InvalidateObjects { state: changed });
    }

    /// Expire exact attribute slots: each entry must match the current
    /// slot's `(name, origin, creation)`. Other attributes persist.
    pub async fn expire_attributes(
        &self,
        uri: Uri,
        entries: Vec<Attribute>,
        when: Timestamp,
    ) {
        let mut expired = Vec::new();
        {
            let mut state = self.state.write().await;
            let Some(attributes) = state.get_mut(&uri) else {
                return;
            };
            for entry in &entries {
                let slot = attributes.iter().position(|held| {
                    held.name == entry.name
                        && held.origin == entry.origin
                        && held.creation == entry.creation
                });
                if let Some(index) = slot {
                    let mut gone = attributes.remove(index);
                    gone.expiration = when;
                    expired.push(gone);
                }
            }
        }
        if expired.is_empty() {
            return;
        }
        self.store.update_expiration(&uri, &expired).await;

        let mut changed = WorldState::new();
        changed.insert(uri, expired);
        self.bus.offer(Delta::InvalidateAttributes { state: changed });
    }

    /// Remove a URI from the current state and purge all of its rows.
    /// History-destructive.
    pub async fn delete_uri(&self, uri: Uri) {
        {
            let mut state = self.state.write().await;
            if state.remove(&uri).is_none() {
                return;
            }
        }
        if let Err(err) = self.store.delete_uri(&uri).await {
            warn!(%uri, %err, "could not purge deleted URI from the store");
        }
        // Deletions look like expirations to subscribers; a negative
        // timestamp marks the object as deleted rather than expired.
        let mut marker = Attribute::creation_marker(String::new(), -1);
        marker.expiration = -1;
        let mut changed = WorldState::new();
        changed.insert(uri, vec![marker]);
        self.bus.offer(Delta::InvalidateObjects { state: changed });
    }

    /// Purge `(name, origin)` slots and their history. Requests naming the
    /// lifecycle attribute are silently dropped.
    pub async fn delete_attributes(&self, uri: Uri, entries: Vec<(String, String)>) {
        let entries: Vec<(String, String)> =
            entries.into_iter().filter(|(name, _)| name != CREATION_NAME).collect();
        if entries.is_empty() {
            return;
        }
        {
            let mut state = self.state.write().await;
            let Some(attributes) = state.get_mut(&uri) else {
                return;
            };
            attributes.retain(|held| {
                !entries
                    .iter()
                    .any(|(name, origin)| held.name == *name && held.origin == *origin)
            });
        }
        self.store.delete_attributes(&uri, &entries).await;

        let removed: Vec<Attribute> = entries
            .into_iter()
            .map(|(name, origin)| {
                let mut attribute = Attribute::new(name, -1, origin, Vec::new());
                attribute.expiration = -1;
                attribute
            })
            .collect();
        let mut changed = WorldState::new();
        changed.insert(uri, removed);
        self.bus.offer(Delta::InvalidateAttributes { state: changed });
    }

    /// Register a `(name, origin)` pair as transient.
    pub fn register_transient(&self, name: impl Into<String>, origin: impl Into<String>) {
        self.transients.lock().unwrap().insert((name.into(), origin.into()));
    }

    /// List current URIs fully matching the pattern. An invalid pattern
    /// matches nothing.
    pub async fn search_uri(&self, pattern: &str) -> Vec<Uri> {
        let Some(regex) = compile_anchored(pattern) else {
            debug!(pattern, "search with invalid pattern");
            return Vec::new();
        };
        let state = self.state.read().await;
        state.keys().filter(|uri| regex.is_match(uri)).cloned().collect()
    }

    /// Current-state snapshot: a URI is included iff every attribute
    /// pattern has at least one match among its attributes; within a URI,
    /// attributes matching any pattern are kept.
    pub async fn snapshot_current(
        &self,
        uri_pattern: &str,
        attr_patterns: &[String],
        include_data: bool,
    ) -> WorldState {
        if attr_patterns.is_empty() {
            return WorldState::new();
        }
        let Some(uri_regex) = compile_anchored(uri_pattern) else {
            return WorldState::new();
        };
        let mut regexes: Vec<Regex> = Vec::with_capacity(attr_patterns.len());
        for pattern in attr_patterns {
            match compile_anchored(pattern) {
                Some(regex) => regexes.push(regex),
                None => debug!(pattern, "invalid attribute pattern in snapshot request"),
            }
        }

        let state = self.state.read().await;
        let mut result = WorldState::new();
        for (uri, attributes) in state.iter() {
            if !uri_regex.is_match(uri) {
                continue;
            }
            let mut pattern_hit = vec![false; regexes.len()];
            let mut kept = Vec::new();
            for attribute in attributes {
                let mut matched = false;
                for (index, regex) in regexes.iter().enumerate() {
                    if regex.is_match(&attribute.name) {
                        pattern_hit[index] = true;
                        matched = true;
                    }
                }
                if matched {
                    kept.push(if include_data {
                        attribute.clone()
                    } else {
                        attribute.without_data()
                    });
                }
            }
            if pattern_hit.iter().all(|hit| *hit) {
                result.insert(uri.clone(), kept);
            }
        }
        result
    }

    /// The world state as of `at`, reconstructed from the store.
    pub async fn snapshot_at(
        &self,
        uri_pattern: &str,
        attr_patterns: &[String],
        at: Timestamp,
    ) -> WorldState {
        if attr_patterns.is_empty() {
            return WorldState::new();
        }
        let mut result = WorldState::new();
        for pattern in attr_patterns {
            merge_state(
                &mut result,
                self.store.fetch_snapshot_at(uri_pattern, pattern, ".*", at).await,
            );
        }
        result
    }

    /// All stored rows created within `[from, to]`, sorted by creation time
    /// ascending per URI.
    pub async fn range(
        &self,
        uri_pattern: &str,
        attr_patterns: &[String],
        from: Timestamp,
        to: Timestamp,
    ) -> WorldState {
        if attr_patterns.is_empty() {
            return WorldState::new();
        }
        let mut result = WorldState::new();
        for pattern in attr_patterns {
            merge_state(
                &mut result,
                self.store.fetch_range(uri_pattern, pattern, ".*", from, to).await,
            );
        }
        for attributes in result.values_mut() {
            attributes.sort_by_key(|attribute| attribute.creation);
        }
        result
    }

    /// Create a standing query, seeded from the current state, and add it
    /// to the bus.
    pub async fn standing_query(
        &self,
        uri_pattern: &str,
        attr_patterns: Vec<String>,
        include_data: bool,
    ) -> Arc<StandingQuery> {
        let query = Arc::new(StandingQuery::new(
            self.bus.next_query_id(),
            uri_pattern,
            attr_patterns,
            include_data,
        ));
        {
            let state = self.state.read().await;
            let seeded = query.show_interested(&state, None, None);
            if !seeded.is_empty() {
                query.insert(seeded);
            }
        }
        self.bus.register(Arc::clone(&query));
        query
    }
}

/// The origin shared by every attribute of the delta, if there is one.
fn single_origin(state: &WorldState, transients: &WorldState) -> Option<String> {
    let mut origin: Option<&str> = None;
    for attributes in state.values().chain(transients.values()) {
        for attribute in attributes {
            match origin {
                None => origin = Some(&attribute.origin),
                Some(seen) if seen == attribute.origin => {}
                Some(_) => return None,
            }
        }
    }
    origin.map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn engine() -> (Arc<WorldModel>, Arc<SubscriptionBus>) {
        let bus = SubscriptionBus::new();
        let model = WorldModel::new(Arc::new(MemoryStore::new()), Arc::clone(&bus)).await;
        (model, bus)
    }

    fn temp(creation: Timestamp, data: u8) -> Attribute {
        Attribute::new("temp", creation, "s", vec![data])
    }

    #[tokio::test]
    async fn test_create_insert_snapshot() {
        let (model, _bus) = engine().await;
        assert!(model.create_uri("room.1".into(), "s", 100).await);
        assert!(
            model
                .insert_data(vec![("room.1".into(), vec![temp(200, 0x10)])], false)
                .await
        );

        let snapshot = model.snapshot_current(".*", &["temp".into()], true).await;
        let attributes = &snapshot["room.1"];
        assert_eq!(attributes.len(), 1);
        assert_eq!(attributes[0].creation, 200);
        assert_eq!(attributes[0].data, vec![0x10]);
        assert_eq!(attributes[0].origin, "s");
    }

    #[tokio::test]
    async fn test_create_existing_uri_is_conflict() {
        let (model, _bus) = engine().await;
        assert!(model.create_uri("room.1".into(), "s", 100).await);
        assert!(!model.create_uri("room.1".into(), "s", 500).await);

        // The original creation time survives.
        let snapshot = model.snapshot_current(".*", &[CREATION_NAME.into()], true).await;
        assert_eq!(snapshot["room.1"][0].creation, 100);
    }

    #[tokio::test]
    async fn test_insert_without_autocreate_discards() {
        let (model, _bus) = engine().await;
        model.insert_data(vec![("ghost".into(), vec![temp(1, 0)])], false).await;
        assert!(model.snapshot_current(".*", &[".*".into()], true).await.is_empty());
    }

    #[tokio::test]
    async fn test_autocreate_synthesizes_lifecycle() {
        let (model, _bus) = engine().await;
        model.insert_data(vec![("room.2".into(), vec![temp(300, 0x7)])], true).await;

        let snapshot = model.snapshot_current("room.2", &[".*".into()], true).await;
        let attributes = &snapshot["room.2"];
        assert_eq!(attributes.len(), 2);
        let marker = attributes.iter().find(|a| a.name == CREATION_NAME).unwrap();
        assert_eq!(marker.creation, 300);
        assert_eq!(marker.origin, "s");
    }

    #[tokio::test]
    async fn test_newer_value_supersedes() {
        let (model, _bus) = engine().await;
        model.insert_data(vec![("room.1".into(), vec![temp(200, 0x10)])], true).await;
        model.insert_data(vec![("room.1".into(), vec![temp(300, 0x20)])], false).await;

        let snapshot = model.snapshot_current(".*", &["temp".into()], true).await;
        assert_eq!(snapshot["room.1"].len(), 1);
        assert_eq!(snapshot["room.1"][0].creation, 300);

        // History keeps both rows, the first one stamped.
        let range = model.range(".*", &["temp".into()], 0, 400).await;
        let rows = &range["room.1"];
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].expiration, 300);
        assert_eq!(rows[1].expiration, 0);
    }

    #[tokio::test]
    async fn test_equal_creation_dropped_from_current() {
        let (model, _bus) = engine().await;
        model.insert_data(vec![("room.1".into(), vec![temp(200, 0x10)])], true).await;
        model.insert_data(vec![("room.1".into(), vec![temp(200, 0x99)])], false).await;

        let snapshot = model.snapshot_current(".*", &["temp".into()], true).await;
        assert_eq!(snapshot["room.1"][0].data, vec![0x10]);
    }

    #[tokio::test]
    async fn test_expire_then_rehydrate() {
        let (model, _bus) = engine().await;
        model.insert_data(vec![("room.1".into(), vec![temp(200, 0x10)])], true).await;
        model.insert_data(vec![("room.1".into(), vec![temp(300, 0x20)])], false).await;
        model.expire_uri("room.1".into(), 500).await;

        assert!(model.snapshot_current(".*", &["temp".into()], true).await.is_empty());

        // Before the expiration instant the superseding value is visible.
        let at_400 = model.snapshot_at("room.1", &["temp".into()], 400).await;
        assert_eq!(at_400["room.1"].len(), 1);
        assert_eq!(at_400["room.1"][0].creation, 300);

        // After it, nothing is.
        assert!(model.snapshot_at("room.1", &["temp".into()], 600).await.is_empty());
    }

    #[tokio::test]
    async fn test_expire_attribute_matches_exact_creation() {
        let (model, _bus) = engine().await;
        model.insert_data(vec![("room.1".into(), vec![temp(200, 0x10)])], true).await;

        // Wrong creation time: no effect.
        model
            .expire_attributes("room.1".into(), vec![Attribute::new("temp", 999, "s", vec![])], 500)
            .await;
        assert!(!model.snapshot_current(".*", &["temp".into()], true).await.is_empty());

        model
            .expire_attributes("room.1".into(), vec![Attribute::new("temp", 200, "s", vec![])], 500)
            .await;
        assert!(model.snapshot_current(".*", &["temp".into()], true).await.is_empty());
        // The lifecycle attribute is untouched.
        assert!(!model.snapshot_current(".*", &[CREATION_NAME.into()], true).await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_attributes_skips_lifecycle() {
        let (model, _bus) = engine().await;
        model.insert_data(vec![("room.1".into(), vec![temp(200, 0x10)])], true).await;
        model
            .delete_attributes(
                "room.1".into(),
                vec![
                    (CREATION_NAME.to_string(), "s".to_string()),
                    ("temp".to_string(), "s".to_string()),
                ],
            )
            .await;

        let snapshot = model.snapshot_current(".*", &[".*".into()], true).await;
        let attributes = &snapshot["room.1"];
        assert_eq!(attributes.len(), 1);
        assert_eq!(attributes[0].name, CREATION_NAME);

        // History for the deleted slot is gone.
        assert!(model.range(".*", &["temp".into()], 0, i64::MAX).await.is_empty());
    }

    #[tokio::test]
    async fn test_transients_never_reach_state_or_store() {
        let (model, _bus) = engine().await;
        model.create_uri("room.1".into(), "s", 100).await;
        model.register_transient("pulse", "s");
        model
            .insert_data(
                vec![("room.1".into(), vec![Attribute::new("pulse", 200, "s", vec![1])])],
                false,
            )
            .await;

        assert!(model.snapshot_current(".*", &["pulse".into()], true).await.is_empty());
        assert!(model.range(".*", &["pulse".into()], 0, i64::MAX).await.is_empty());
    }

    #[tokio::test]
    async fn test_search_uri_full_match_and_invalid() {
        let (model, _bus) = engine().await;
        model.create_uri("room.1".into(), "s", 1).await;
        model.create_uri("room.12".into(), "s", 1).await;
        model.create_uri("hall.1".into(), "s", 1).await;

        let mut found = model.search_uri("room\\..").await;
        found.sort();
        assert_eq!(found, vec!["room.1"]);

        let mut all = model.search_uri(".*").await;
        all.sort();
        assert_eq!(all.len(), 3);

        assert!(model.search_uri("room[").await.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_conjunctive_across_patterns() {
        let (model, _bus) = engine().await;
        model
            .insert_data(
                vec![(
                    "room.1".into(),
                    vec![
                        Attribute::new("a", 100, "s", vec![]),
                        Attribute::new("b", 100, "s", vec![]),
                    ],
                )],
                true,
            )
            .await;
        model
            .insert_data(vec![("room.2".into(), vec![Attribute::new("a", 100, "s", vec![])])], true)
            .await;

        let snapshot =
            model.snapshot_current("room.*", &["^a$".into(), "^b$".into()], true).await;
        assert!(snapshot.contains_key("room.1"));
        assert!(!snapshot.contains_key("room.2"));
    }

    #[tokio::test]
    async fn test_snapshot_without_payload() {
        let (model, _bus) = engine().await;
        model.insert_data(vec![("room.1".into(), vec![temp(200, 0x10)])], true).await;
        let snapshot = model.snapshot_current(".*", &["temp".into()], false).await;
        assert!(snapshot["room.1"][0].data.is_empty());
    }

    #[tokio::test]
    async fn test_rehydration_restores_current_state() {
        let store = Arc::new(MemoryStore::new());
        {
            let bus = SubscriptionBus::new();
            let model = WorldModel::new(store.clone() as Arc<dyn AttributeStore>, bus).await;
            model.insert_data(vec![("room.1".into(), vec![temp(200, 0x10)])], true).await;
        }
        // A fresh engine over the same store sees the current rows.
        let bus = SubscriptionBus::new();
        let model = WorldModel::new(store as Arc<dyn AttributeStore>, bus).await;
        let snapshot = model.snapshot_current(".*", &["temp".into()], true).await;
        assert_eq!(snapshot["room.1"][0].data, vec![0x10]);
    }

    #[tokio::test]
    async fn test_standing_query_seeded_from_current_state() {
        let (model, _bus) = engine().await;
        model.insert_data(vec![("room.1".into(), vec![temp(200, 0x10)])], true).await;

        let query = model.standing_query("room.*", vec!["temp".into()], true).await;
        let seeded = query.take_data();
        assert_eq!(seeded["room.1"].len(), 1);
        assert_eq!(seeded["room.1"][0].creation, 200);
    }

    #[test]
    fn test_single_origin_detection() {
        let mut state = WorldState::new();
        state.insert("u".into(), vec![Attribute::new("a", 1, "s", vec![])]);
        assert_eq!(single_origin(&state, &WorldState::new()), Some("s".to_string()));

        let mut mixed = state.clone();
        mixed.insert("v".into(), vec![Attribute::new("b", 1, "t", vec![])]);
        assert_eq!(single_origin(&mixed, &WorldState::new()), None);

        assert_eq!(single_origin(&WorldState::new(), &WorldState::new()), None);
    }
}
