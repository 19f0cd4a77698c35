/// No-op persistence collaborator for non-persistent mode.
///
/// Every durable operation succeeds without doing anything and every fetch
/// returns the empty fragment; the in-memory current state is the only
/// truth.
use async_trait::async_trait;

use crate::error::WmResult;
use crate::types::{Attribute, Timestamp, Uri, WorldState};

use super::AttributeStore;

/// The store used when no database identity is configured.
#[derive(Debug, Default)]
pub struct NullStore;

#[async_trait]
impl AttributeStore for NullStore {
    async fn store_attributes(&self, _uri: &Uri, _entries: &[Attribute]) -> WorldState {
        WorldState::new()
    }

    async fn update_expiration(&self, _uri: &Uri, _entries: &[Attribute]) -> WorldState {
        WorldState::new()
    }

    async fn delete_uri(&self, _uri: &Uri) -> WmResult<()> {
        Ok(())
    }

    async fn delete_attributes(&self, _uri: &Uri, _entries: &[(String, String)]) -> WorldState {
        WorldState::new()
    }

    async fn fetch_current(
        &self,
        _uri_pattern: &str,
        _attr_pattern: &str,
        _origin_pattern: &str,
    ) -> WorldState {
        WorldState::new()
    }

    async fn fetch_snapshot_at(
        &self,
        _uri_pattern: &str,
        _attr_pattern: &str,
        _origin_pattern: &str,
        _at: Timestamp,
    ) -> WorldState {
        WorldState::new()
    }

    async fn fetch_range(
        &self,
        _uri_pattern: &str,
        _attr_pattern: &str,
        _origin_pattern: &str,
        _from: Timestamp,
        _to: Timestamp,
    ) -> WorldState {
        WorldState::new()
    }
}
