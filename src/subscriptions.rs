/// Standing queries and the subscription bus.
///
/// The bus holds the process-global set of active standing queries and a
/// single dispatcher task draining a shared input queue of world-state
/// deltas. Write-path operations enqueue an insert, an
/// attribute-invalidate, or an object-invalidate delta; the dispatcher
/// delivers each delta to every query.
///
/// Matching is memoized per query: a URI accept/reject cache, a map from
/// attribute names to the pattern indices they satisfy, and a per-URI
/// partial-match buffer that emits its whole contents the first time every
/// attribute pattern has at least one match and only the changed attributes
/// afterwards.
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use regex::Regex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::patterns::compile_anchored;
use crate::types::{Attribute, Uri, WorldState, CREATION_NAME};

/// A change offered to the bus by the write path.
#[derive(Debug, Clone)]
pub enum Delta {
    /// New attribute values. `origin` is set when every entry comes from a
    /// single solver, enabling the origin prefilter; `transients` are
    /// matched strictly and never buffered.
    Insert {
        state: WorldState,
        transients: WorldState,
        origin: Option<String>,
    },
    /// Specific attributes were expired or deleted.
    InvalidateAttributes { state: WorldState },
    /// Entire objects were expired or deleted; each URI carries its
    /// lifecycle attribute with the death timestamp.
    InvalidateObjects { state: WorldState },
}

/// Commands pushed to a solver session when on-demand interest changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnDemandCommand {
    Start { name: String, patterns: Vec<String> },
    Stop { name: String, patterns: Vec<String> },
}

// ---------------------------------------------------------------------------
// Standing query
// ---------------------------------------------------------------------------

/// Memoized matching state, guarded by the query's own mutex.
#[derive(Debug, Default)]
struct MatchState {
    /// URI → does it match the URI pattern.
    uri_accepted: HashMap<Uri, bool>,
    /// URI → attribute pattern indices matched so far.
    uri_matches: HashMap<Uri, HashSet<usize>>,
    /// Attribute name → pattern indices the name satisfies (empty set for
    /// names that match nothing).
    attribute_accepted: HashMap<String, HashSet<usize>>,
    /// Attributes already matched per URI, replayed when coverage first
    /// completes.
    partial: WorldState,
    /// Attribute names ever delivered per URI, for invalidation.
    current_matches: HashMap<Uri, HashSet<String>>,
    /// Data waiting to be drained by the owning connection.
    output: WorldState,
}

/// One live subscription.
pub struct StandingQuery {
    id: u64,
    uri_pattern: String,
    attr_patterns: Vec<String>,
    include_data: bool,
    uri_regex: Option<Regex>,
    attr_regexes: Vec<Regex>,
    /// True only once every pattern compiled.
    valid: bool,
    state: Mutex<MatchState>,
}

impl StandingQuery {
    pub(crate) fn new(
        id: u64,
        uri_pattern: impl Into<String>,
        attr_patterns: Vec<String>,
        include_data: bool,
    ) -> Self {
        let uri_pattern = uri_pattern.into();
        let uri_regex = compile_anchored(&uri_pattern);
        let mut attr_regexes = Vec::with_capacity(attr_patterns.len());
        let mut valid = uri_regex.is_some();
        for pattern in &attr_patterns {
            match compile_anchored(pattern) {
                Some(regex) => attr_regexes.push(regex),
                None => {
                    valid = false;
                    break;
                }
            }
        }
        if !valid {
            warn!(%uri_pattern, "standing query with invalid pattern matches nothing");
        }
        Self {
            id,
            uri_pattern,
            attr_patterns,
            include_data,
            uri_regex,
            attr_regexes,
            valid,
            state: Mutex::new(MatchState::default()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn uri_pattern(&self) -> &str {
        &self.uri_pattern
    }

    pub fn attr_patterns(&self) -> &[String] {
        &self.attr_patterns
    }

    /// Check the URI against the pattern through the memo table. The
    /// caller holds the state lock.
    fn uri_accepted(&self, state: &mut MatchState, uri: &Uri) -> bool {
        if let Some(&accepted) = state.uri_accepted.get(uri) {
            return accepted;
        }
        let accepted =
            self.uri_regex.as_ref().map(|regex| regex.is_match(uri)).unwrap_or(false);
        state.uri_accepted.insert(uri.clone(), accepted);
        if accepted {
            state.uri_matches.entry(uri.clone()).or_default();
            state.current_matches.entry(uri.clone()).or_default();
        }
        accepted
    }

    /// Pattern indices an attribute name satisfies, via the memo table.
    /// The caller holds the state lock.
    fn name_matches(&self, state: &mut MatchState, name: &str) -> HashSet<usize> {
        if let Some(matched) = state.attribute_accepted.get(name) {
            return matched.clone();
        }
        let matched: HashSet<usize> = self
            .attr_regexes
            .iter()
            .enumerate()
            .filter(|(_, regex)| regex.is_match(name))
            .map(|(index, _)| index)
            .collect();
        state.attribute_accepted.insert(name.to_string(), matched.clone());
        matched
    }

    /// True if any attribute this origin announces can satisfy one of the
    /// query's patterns. Origins absent from the index must be checked the
    /// slow way, so they count as interesting.
    fn origin_interesting(
        &self,
        state: &mut MatchState,
        origin: &str,
        origin_index: &HashMap<String, HashSet<String>>,
    ) -> bool {
        let Some(names) = origin_index.get(origin) else {
            return true;
        };
        names.iter().any(|name| !self.name_matches(state, name).is_empty())
    }

    /// Return the subset of `ws` this query is interested in, remembering
    /// partial matches so later deltas only need to carry updates.
    pub(crate) fn show_interested(
        &self,
        ws: &WorldState,
        single_origin: Option<&str>,
        origin_index: Option<&HashMap<String, HashSet<String>>>,
    ) -> WorldState {
        if !self.valid {
            return WorldState::new();
        }
        let mut state = self.state.lock().unwrap();

        if let (Some(origin), Some(index)) = (single_origin, origin_index) {
            if !self.origin_interesting(&mut state, origin, index) {
                trace!(query = self.id, origin, "origin prefilter discarded delta");
                return WorldState::new();
            }
        }

        let mut result = WorldState::new();
        for (uri, attributes) in ws {
            if !self.uri_accepted(&mut state, uri) {
                continue;
            }
            let previous_count =
                state.uri_matches.get(uri).map(|set| set.len()).unwrap_or(0);
            let mut matched_attributes = Vec::new();
            for attribute in attributes {
                let matched = self.name_matches(&mut state, &attribute.name);
                if matched.is_empty() {
                    continue;
                }
                state.uri_matches.entry(uri.clone()).or_default().extend(matched);
                matched_attributes.push(attribute.clone());
                // Update the partial buffer slot for this (name, origin).
                let buffer = state.partial.entry(uri.clone()).or_default();
                match buffer.iter().position(|held| held.same_slot(attribute)) {
                    Some(index) => buffer[index] = attribute.clone(),
                    None => buffer.push(attribute.clone()),
                }
            }
            let covered = state.uri_matches.get(uri).map(|set| set.len()).unwrap_or(0);
            if covered == self.attr_patterns.len() && !self.attr_patterns.is_empty() {
                if previous_count == self.attr_patterns.len() {
                    // Already covered: only the changes flow out.
                    result.insert(uri.clone(), matched_attributes);
                } else {
                    // First full coverage: replay the whole buffer.
                    result.insert(
                        uri.clone(),
                        state.partial.get(uri).cloned().unwrap_or_default(),
                    );
                }
            }
        }
        result
    }

    /// Transient variant: names compare by literal equality and contribute
    /// to coverage only for this one delta; nothing enters the buffer or
    /// the memo tables.
    pub(crate) fn show_interested_transient(&self, ws: &WorldState) -> WorldState {
        if !self.valid {
            return WorldState::new();
        }
        let mut state = self.state.lock().unwrap();
        let mut result = WorldState::new();
        for (uri, attributes) in ws {
            if !self.uri_accepted(&mut state, uri) {
                continue;
            }
            let mut transient_indices: HashSet<usize> = HashSet::new();
            let mut matched_attributes = Vec::new();
            for attribute in attributes {
                let matched: Vec<usize> = self
                    .attr_patterns
                    .iter()
                    .enumerate()
                    .filter(|(_, pattern)| **pattern == attribute.name)
                    .map(|(index, _)| index)
                    .collect();
                if !matched.is_empty() {
                    transient_indices.extend(matched);
                    matched_attributes.push(attribute.clone());
                }
            }
            if matched_attributes.is_empty() {
                continue;
            }
            let durable = state.uri_matches.get(uri).cloned().unwrap_or_default();
            let durable_count = durable.len();
            let mut covered = durable;
            covered.extend(&transient_indices);
            if covered.len() == self.attr_patterns.len() {
                if durable_count == self.attr_patterns.len() {
                    result.insert(uri.clone(), matched_attributes);
                } else {
                    let mut combined = state.partial.get(uri).cloned().unwrap_or_default();
                    combined.extend(matched_attributes);
                    result.insert(uri.clone(), combined);
                }
            }
        }
        result
    }

    /// Queue matched data for delivery. The caller has already filtered
    /// through [`Self::show_interested`].
    pub(crate) fn insert(&self, ws: WorldState) {
        let mut state = self.state.lock().unwrap();
        for (uri, attributes) in ws {
            for attribute in attributes {
                state
                    .current_matches
                    .entry(uri.clone())
                    .or_default()
                    .insert(attribute.name.clone());
                let queued = state.output.entry(uri.clone()).or_default();
                match queued.iter().position(|held| held.same_slot(&attribute)) {
                    Some(index) => queued[index] = attribute,
                    None => queued.push(attribute),
                }
            }
        }
    }

    /// Apply expiration or deletion of specific attributes.
    pub(crate) fn invalidate_attributes(&self, uri: &Uri, removed: &[Attribute]) {
        let mut state = self.state.lock().unwrap();
        let gone: HashSet<(String, String)> = removed
            .iter()
            .map(|attribute| (attribute.name.clone(), attribute.origin.clone()))
            .collect();

        // Drop the attributes from the partial buffer, then recompute which
        // pattern indices the URI still covers; losing the only attribute
        // behind an index reverts the URI to partial.
        if let Some(buffer) = state.partial.get_mut(uri) {
            buffer.retain(|held| !gone.contains(&(held.name.clone(), held.origin.clone())));
        }
        if state.uri_matches.contains_key(uri) {
            let remaining: Vec<String> = state
                .partial
                .get(uri)
                .map(|buffer| buffer.iter().map(|attribute| attribute.name.clone()).collect())
                .unwrap_or_default();
            let mut still_covered: HashSet<usize> = HashSet::new();
            for name in remaining {
                still_covered.extend(self.name_matches(&mut state, &name));
            }
            state.uri_matches.insert(uri.clone(), still_covered);
        }

        let expiration_for =
            |name: &str| removed.iter().find(|attribute| attribute.name == name);

        // Stamp queued attributes in place and forget them as matched.
        let mut stamped: HashSet<String> = HashSet::new();
        if let Some(queued) = state.output.get_mut(uri) {
            for attribute in queued.iter_mut() {
                if let Some(source) = expiration_for(&attribute.name) {
                    attribute.expiration = source.expiration;
                    stamped.insert(attribute.name.clone());
                }
            }
        }
        if let Some(names) = state.current_matches.get_mut(uri) {
            for name in &stamped {
                names.remove(name);
            }
        }

        // Attributes delivered earlier but no longer queued get a synthetic
        // expired entry so the client still observes the change.
        let pending: Vec<Attribute> = state
            .current_matches
            .get(uri)
            .map(|names| {
                names
                    .iter()
                    .filter_map(|name| expiration_for(name))
                    .map(|source| Attribute {
                        name: source.name.clone(),
                        creation: source.expiration,
                        expiration: source.expiration,
                        origin: String::new(),
                        data: Vec::new(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        if !pending.is_empty() {
            if let Some(names) = state.current_matches.get_mut(uri) {
                for attribute in &pending {
                    names.remove(&attribute.name);
                }
            }
            state.output.entry(uri.clone()).or_default().extend(pending);
        }
    }

    /// Apply expiration or deletion of an entire object. `marker` is the
    /// lifecycle attribute carrying the death timestamp.
    pub(crate) fn invalidate_object(&self, uri: &Uri, marker: &Attribute) {
        let mut state = self.state.lock().unwrap();
        state.partial.remove(uri);
        state.uri_accepted.remove(uri);
        state.uri_matches.remove(uri);

        if let Some(queued) = state.output.get_mut(uri) {
            for attribute in queued.iter_mut() {
                attribute.expiration = marker.expiration;
            }
        }
        let ever_sent = state.current_matches.remove(uri).unwrap_or_default();
        let queued = state.output.entry(uri.clone()).or_default();
        for name in ever_sent {
            if queued.iter().any(|attribute| attribute.name == name) {
                continue;
            }
            queued.push(Attribute {
                name,
                creation: marker.expiration,
                expiration: marker.expiration,
                origin: String::new(),
                data: Vec::new(),
            });
        }
        // The death itself is announced through the lifecycle attribute.
        if !queued.iter().any(|attribute| attribute.name == CREATION_NAME) {
            queued.push(Attribute {
                name: CREATION_NAME.to_string(),
                creation: marker.expiration,
                expiration: marker.expiration,
                origin: marker.origin.clone(),
                data: Vec::new(),
            });
        }
    }

    /// Drain everything queued since the last call.
    pub fn take_data(&self) -> WorldState {
        let mut state = self.state.lock().unwrap();
        let mut data = std::mem::take(&mut state.output);
        drop(state);
        if !self.include_data {
            for attributes in data.values_mut() {
                for attribute in attributes.iter_mut() {
                    attribute.data.clear();
                }
            }
        }
        data
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

#[derive(Default)]
struct OnDemandTable {
    /// Attribute name → URI pattern → request count.
    counts: HashMap<String, HashMap<String, usize>>,
    /// Attribute name → notifier of the owning solver session.
    notifiers: HashMap<String, mpsc::UnboundedSender<OnDemandCommand>>,
}

/// Shared pieces the dispatcher task works on.
#[derive(Default)]
struct BusShared {
    queries: Mutex<HashMap<u64, Arc<StandingQuery>>>,
    origin_attributes: Mutex<HashMap<String, HashSet<String>>>,
    on_demand: Mutex<OnDemandTable>,
}

/// Process-global subscription fan-out.
pub struct SubscriptionBus {
    shared: Arc<BusShared>,
    input: Mutex<Option<mpsc::UnboundedSender<Delta>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl SubscriptionBus {
    /// Create the bus and start its dispatcher task.
    pub fn new() -> Arc<Self> {
        let shared = Arc::new(BusShared::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(dispatch_loop(rx, Arc::clone(&shared)));
        Arc::new(Self {
            shared,
            input: Mutex::new(Some(tx)),
            dispatcher: Mutex::new(Some(dispatcher)),
            next_id: AtomicU64::new(1),
        })
    }

    /// Allocate an id for a new standing query.
    pub fn next_query_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Add a query to the fan-out set.
    pub fn register(&self, query: Arc<StandingQuery>) {
        debug!(query = query.id(), pattern = query.uri_pattern(), "standing query registered");
        self.shared.queries.lock().unwrap().insert(query.id(), query);
    }

    /// Remove a query from the fan-out set.
    pub fn remove(&self, id: u64) {
        if self.shared.queries.lock().unwrap().remove(&id).is_some() {
            debug!(query = id, "standing query removed");
        }
    }

    /// Number of registered queries.
    pub fn query_count(&self) -> usize {
        self.shared.queries.lock().unwrap().len()
    }

    /// Enqueue a delta for the dispatcher.
    pub fn offer(&self, delta: Delta) {
        let input = self.input.lock().unwrap();
        match input.as_ref() {
            Some(tx) => {
                // The receiver lives as long as the dispatcher task.
                let _ = tx.send(delta);
            }
            None => warn!("delta offered after bus shutdown"),
        }
    }

    /// Record the attribute names an origin announces, for the prefilter.
    pub fn add_origin_attributes(&self, origin: &str, names: impl IntoIterator<Item = String>) {
        self.shared
            .origin_attributes
            .lock()
            .unwrap()
            .entry(origin.to_string())
            .or_default()
            .extend(names);
    }

    /// Register an announced on-demand attribute and the channel of the
    /// solver session producing it. Pending requests recorded while the
    /// solver was away are replayed immediately.
    pub fn register_on_demand(
        &self,
        name: &str,
        notifier: mpsc::UnboundedSender<OnDemandCommand>,
    ) {
        let mut table = self.shared.on_demand.lock().unwrap();
        let counts = table.counts.entry(name.to_string()).or_default();
        let pending: Vec<String> = counts.keys().cloned().collect();
        if !pending.is_empty() {
            let _ = notifier.send(OnDemandCommand::Start {
                name: name.to_string(),
                patterns: pending,
            });
        }
        table.notifiers.insert(name.to_string(), notifier);
    }

    /// Forget the notifier channels of a departing solver session.
    pub fn unregister_on_demand_solver(&self, names: &[String]) {
        let mut table = self.shared.on_demand.lock().unwrap();
        for name in names {
            table.notifiers.remove(name);
        }
    }

    /// True if the attribute name was announced as on-demand.
    pub fn is_on_demand(&self, name: &str) -> bool {
        self.shared.on_demand.lock().unwrap().counts.contains_key(name)
    }

    /// Count one subscription's interest in an on-demand attribute.
    /// Returns false when the name is not on-demand.
    pub fn add_on_demand_request(&self, name: &str, uri_pattern: &str) -> bool {
        let mut table = self.shared.on_demand.lock().unwrap();
        let Some(counts) = table.counts.get_mut(name) else {
            return false;
        };
        let count = counts.entry(uri_pattern.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            debug!(attribute = name, pattern = uri_pattern, "on-demand production starts");
            if let Some(notifier) = table.notifiers.get(name) {
                let _ = notifier.send(OnDemandCommand::Start {
                    name: name.to_string(),
                    patterns: vec![uri_pattern.to_string()],
                });
            }
        }
        true
    }

    /// Drop one subscription's interest in an on-demand attribute.
    pub fn remove_on_demand_request(&self, name: &str, uri_pattern: &str) {
        let mut table = self.shared.on_demand.lock().unwrap();
        let Some(counts) = table.counts.get_mut(name) else {
            return;
        };
        let Some(count) = counts.get_mut(uri_pattern) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            counts.remove(uri_pattern);
            debug!(attribute = name, pattern = uri_pattern, "on-demand production stops");
            if let Some(notifier) = table.notifiers.get(name) {
                let _ = notifier.send(OnDemandCommand::Stop {
                    name: name.to_string(),
                    patterns: vec![uri_pattern.to_string()],
                });
            }
        }
    }

    /// Stop the dispatcher and wait for it to drain.
    pub async fn shutdown(&self) {
        self.input.lock().unwrap().take();
        let handle = self.dispatcher.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// The single consumer of the input queue.
async fn dispatch_loop(mut rx: mpsc::UnboundedReceiver<Delta>, shared: Arc<BusShared>) {
    while let Some(delta) = rx.recv().await {
        let queries: Vec<Arc<StandingQuery>> =
            shared.queries.lock().unwrap().values().cloned().collect();
        match delta {
            Delta::Insert { state, transients, origin } => {
                let origin_index = if origin.is_some() {
                    Some(shared.origin_attributes.lock().unwrap().clone())
                } else {
                    None
                };
                for query in &queries {
                    if !state.is_empty() {
                        let interested =
                            query.show_interested(&state, origin.as_deref(), origin_index.as_ref());
                        if !interested.is_empty() {
                            query.insert(interested);
                        }
                    }
                    if !transients.is_empty() {
                        let interested = query.show_interested_transient(&transients);
                        if !interested.is_empty() {
                            query.insert(interested);
                        }
                    }
                }
            }
            Delta::InvalidateAttributes { state } => {
                for query in &queries {
                    for (uri, attributes) in &state {
                        query.invalidate_attributes(uri, attributes);
                    }
                }
            }
            Delta::InvalidateObjects { state } => {
                for query in &queries {
                    for (uri, attributes) in &state {
                        // A single lifecycle attribute announces the death.
                        if let Some(first) = attributes.first() {
                            if first.name == CREATION_NAME {
                                query.invalidate_object(uri, first);
                            }
                        }
                    }
                }
            }
        }
    }
    debug!("subscription dispatcher stopped");
}
