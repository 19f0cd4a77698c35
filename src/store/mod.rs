/// Persistence capability boundary.
///
/// The engine persists through the [`AttributeStore`] trait and never sees
/// a concrete backend: the SQL implementation ([`PgStore`]), the in-process
/// [`MemoryStore`], and the no-op [`NullStore`] for non-persistent mode all
/// satisfy the same seven operations. Durable rows are uniquely identified
/// by `(uri, name, origin, creation)` and expiration updates are
/// idempotent.
///
/// Write-path callers treat every fragment-returning operation as
/// infallible: a backend that cannot complete an operation logs locally and
/// returns the empty fragment, keeping the in-memory state authoritative.
pub mod memory;
pub mod null;
pub mod pool;
pub mod postgres;

pub use memory::MemoryStore;
pub use null::NullStore;
pub use postgres::PgStore;

use async_trait::async_trait;

use crate::error::WmResult;
pub(crate) use crate::patterns::{anchored_source, compile_anchored};
use crate::types::{Attribute, Timestamp, Uri, WorldState};

/// The seven durable operations consumed by the core.
#[async_trait]
pub trait AttributeStore: Send + Sync + 'static {
    /// Persist attribute values. Each stored row supersedes any live row in
    /// the same `(name, origin)` slot with an older creation time, stamping
    /// the older row's expiration with the newcomer's creation time. A row
    /// older than an existing one is stored already expired; a duplicate
    /// row identity is ignored. Returns the rows actually stored.
    async fn store_attributes(&self, uri: &Uri, entries: &[Attribute]) -> WorldState;

    /// Stamp expiration times onto live rows. A single entry named
    /// `creation` expires every live row of the URI; otherwise each entry
    /// targets the exact `(name, origin, creation)` row. Only rows with a
    /// zero expiration are touched, so replays are harmless. Returns the
    /// rows actually updated.
    async fn update_expiration(&self, uri: &Uri, entries: &[Attribute]) -> WorldState;

    /// Purge every row of a URI. History-destructive.
    async fn delete_uri(&self, uri: &Uri) -> WmResult<()>;

    /// Purge all rows matching the given `(name, origin)` pairs.
    /// History-destructive. Returns the identities that matched rows.
    async fn delete_attributes(&self, uri: &Uri, entries: &[(String, String)]) -> WorldState;

    /// Fetch live rows matching the three full-string regex patterns.
    async fn fetch_current(
        &self,
        uri_pattern: &str,
        attr_pattern: &str,
        origin_pattern: &str,
    ) -> WorldState;

    /// Fetch the rows visible at `at`: created no later than `at` and not
    /// yet expired then.
    async fn fetch_snapshot_at(
        &self,
        uri_pattern: &str,
        attr_pattern: &str,
        origin_pattern: &str,
        at: Timestamp,
    ) -> WorldState;

    /// Fetch rows created within `[from, to]`, sorted by creation time
    /// ascending within each URI.
    async fn fetch_range(
        &self,
        uri_pattern: &str,
        attr_pattern: &str,
        origin_pattern: &str,
        from: Timestamp,
        to: Timestamp,
    ) -> WorldState;
}

