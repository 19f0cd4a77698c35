/// SQL-backed attribute store.
///
/// Rows live in a single `attributes` table keyed by
/// `(uri, name, origin, created)`; `expires = 0` marks the current value of
/// a slot. The regex predicates required by the read paths use the
/// backend's `~` operator with the same `^(?:…)$` anchoring as the
/// in-memory matcher.
///
/// All statements run on pool workers ([`super::pool`]); every worker
/// connects with the configured identity, sets the client encoding, and
/// creates the database and schema if they are absent.
use async_trait::async_trait;
use sqlx::postgres::PgConnectOptions;
use sqlx::{ConnectOptions, PgConnection};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{WmError, WmResult};
use crate::types::{Attribute, Timestamp, Uri, WorldState, CREATION_NAME};

use super::pool::{StoreReply, StoreRequest, WorkerPool};
use super::{anchored_source, AttributeStore};

/// Connection identity for the worker pool.
#[derive(Clone)]
pub(crate) struct PgSettings {
    pub host: String,
    pub db_name: String,
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for PgSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgSettings")
            .field("host", &self.host)
            .field("db_name", &self.db_name)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Attribute store backed by PostgreSQL through the worker pool.
pub struct PgStore {
    pool: WorkerPool,
}

impl PgStore {
    /// Build a store from a configuration carrying a full database
    /// identity. Workers connect lazily on their first task.
    pub fn new(config: &Config) -> WmResult<Self> {
        let (Some(db_name), Some(user), Some(password)) =
            (config.db_name.clone(), config.user.clone(), config.password.clone())
        else {
            return Err(WmError::Config(
                "db_name, user, and password are required for the SQL store".to_string(),
            ));
        };
        let settings = PgSettings { host: config.db_host.clone(), db_name, user, password };
        info!(host = %settings.host, db = %settings.db_name, "SQL store configured");
        Ok(Self { pool: WorkerPool::new(settings) })
    }

    async fn fetch(&self, request: StoreRequest) -> WorldState {
        match self.pool.submit(request).await {
            StoreReply::Fragment(state) => state,
            StoreReply::Unit(_) => WorldState::new(),
        }
    }
}

#[async_trait]
impl AttributeStore for PgStore {
    async fn store_attributes(&self, uri: &Uri, entries: &[Attribute]) -> WorldState {
        self.fetch(StoreRequest::Store { uri: uri.clone(), entries: entries.to_vec() }).await
    }

    async fn update_expiration(&self, uri: &Uri, entries: &[Attribute]) -> WorldState {
        self.fetch(StoreRequest::UpdateExpiration { uri: uri.clone(), entries: entries.to_vec() })
            .await
    }

    async fn delete_uri(&self, uri: &Uri) -> WmResult<()> {
        match self.pool.submit(StoreRequest::DeleteUri { uri: uri.clone() }).await {
            StoreReply::Unit(result) => result,
            StoreReply::Fragment(_) => Ok(()),
        }
    }

    async fn delete_attributes(&self, uri: &Uri, entries: &[(String, String)]) -> WorldState {
        self.fetch(StoreRequest::DeleteAttributes { uri: uri.clone(), entries: entries.to_vec() })
            .await
    }

    async fn fetch_current(
        &self,
        uri_pattern: &str,
        attr_pattern: &str,
        origin_pattern: &str,
    ) -> WorldState {
        self.fetch(StoreRequest::FetchCurrent {
            uri_pattern: uri_pattern.to_string(),
            attr_pattern: attr_pattern.to_string(),
            origin_pattern: origin_pattern.to_string(),
        })
        .await
    }

    async fn fetch_snapshot_at(
        &self,
        uri_pattern: &str,
        attr_pattern: &str,
        origin_pattern: &str,
        at: Timestamp,
    ) -> WorldState {
        self.fetch(StoreRequest::FetchSnapshotAt {
            uri_pattern: uri_pattern.to_string(),
            attr_pattern: attr_pattern.to_string(),
            origin_pattern: origin_pattern.to_string(),
            at,
        })
        .await
    }

    async fn fetch_range(
        &self,
        uri_pattern: &str,
        attr_pattern: &str,
        origin_pattern: &str,
        from: Timestamp,
        to: Timestamp,
    ) -> WorldState {
        self.fetch(StoreRequest::FetchRange {
            uri_pattern: uri_pattern.to_string(),
            attr_pattern: attr_pattern.to_string(),
            origin_pattern: origin_pattern.to_string(),
            from,
            to,
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Worker-side connection setup and statement execution
// ---------------------------------------------------------------------------

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS attributes (
    uri     TEXT   NOT NULL,
    name    TEXT   NOT NULL,
    origin  TEXT   NOT NULL,
    created BIGINT NOT NULL,
    expires BIGINT NOT NULL DEFAULT 0,
    data    BYTEA  NOT NULL,
    PRIMARY KEY (uri, name, origin, created)
)
"#;

const CURRENT_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS attributes_current_idx ON attributes (uri) WHERE expires = 0";

fn options(settings: &PgSettings, database: &str) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(&settings.host)
        .username(&settings.user)
        .password(&settings.password)
        .database(database)
}

/// Connect with the configured identity, creating the database and schema
/// on first contact.
pub(crate) async fn establish(settings: &PgSettings) -> WmResult<PgConnection> {
    let mut connection = match options(settings, &settings.db_name).connect().await {
        Ok(connection) => connection,
        Err(first_err) => {
            // The database may simply not exist yet; create it through the
            // maintenance database and try once more.
            warn!(db = %settings.db_name, %first_err, "connect failed, creating database");
            let mut admin = options(settings, "postgres").connect().await?;
            let create = format!(
                "CREATE DATABASE \"{}\"",
                settings.db_name.replace('"', "\"\"")
            );
            if let Err(err) = sqlx::query(&create).execute(&mut admin).await {
                // Racing workers may have created it in the meantime.
                warn!(%err, "create database failed, retrying connect");
            }
            options(settings, &settings.db_name).connect().await?
        }
    };
    // Persisted text is compared under a Unicode collation.
    sqlx::query("SET client_encoding TO 'UTF8'").execute(&mut connection).await?;
    sqlx::query(SCHEMA).execute(&mut connection).await?;
    sqlx::query(CURRENT_INDEX).execute(&mut connection).await?;
    Ok(connection)
}

type RowTuple = (String, String, String, i64, i64, Vec<u8>);

fn rows_to_state(rows: Vec<RowTuple>) -> WorldState {
    let mut state = WorldState::new();
    for (uri, name, origin, created, expires, data) in rows {
        state.entry(uri).or_default().push(Attribute {
            name,
            creation: created,
            expiration: expires,
            origin,
            data,
        });
    }
    state
}

/// Run one staged operation on a worker's connection.
pub(crate) async fn execute(
    conn: &mut PgConnection,
    request: &StoreRequest,
) -> WmResult<StoreReply> {
    match request {
        StoreRequest::Store { uri, entries } => {
            let mut stored = WorldState::new();
            for entry in entries {
                // The previous value of this slot ends where the new one
                // begins.
                sqlx::query(
                    "UPDATE attributes SET expires = $4 \
                     WHERE uri = $1 AND name = $2 AND origin = $3 \
                       AND expires = 0 AND created < $4",
                )
                .bind(uri)
                .bind(&entry.name)
                .bind(&entry.origin)
                .bind(entry.creation)
                .execute(&mut *conn)
                .await?;
                // A row behind an already-newer value enters history
                // pre-expired at that value's creation time.
                let result = sqlx::query(
                    "INSERT INTO attributes (uri, name, origin, created, expires, data) \
                     VALUES ($1, $2, $3, $4, \
                             COALESCE((SELECT MIN(created) FROM attributes \
                                       WHERE uri = $1 AND name = $2 AND origin = $3 \
                                         AND created > $4), $5), $6) \
                     ON CONFLICT DO NOTHING",
                )
                .bind(uri)
                .bind(&entry.name)
                .bind(&entry.origin)
                .bind(entry.creation)
                .bind(entry.expiration)
                .bind(&entry.data)
                .execute(&mut *conn)
                .await?;
                if result.rows_affected() > 0 {
                    stored.entry(uri.clone()).or_default().push(entry.clone());
                }
            }
            Ok(StoreReply::Fragment(stored))
        }
        StoreRequest::UpdateExpiration { uri, entries } => {
            let mut updated = WorldState::new();
            let whole_uri = entries.len() == 1 && entries[0].name == CREATION_NAME;
            if whole_uri {
                let result = sqlx::query(
                    "UPDATE attributes SET expires = $2 WHERE uri = $1 AND expires = 0",
                )
                .bind(uri)
                .bind(entries[0].expiration)
                .execute(&mut *conn)
                .await?;
                if result.rows_affected() > 0 {
                    updated.entry(uri.clone()).or_default().push(entries[0].clone());
                }
            } else {
                for entry in entries {
                    let result = sqlx::query(
                        "UPDATE attributes SET expires = $5 \
                         WHERE uri = $1 AND name = $2 AND origin = $3 \
                           AND created = $4 AND expires = 0",
                    )
                    .bind(uri)
                    .bind(&entry.name)
                    .bind(&entry.origin)
                    .bind(entry.creation)
                    .bind(entry.expiration)
                    .execute(&mut *conn)
                    .await?;
                    if result.rows_affected() > 0 {
                        updated.entry(uri.clone()).or_default().push(entry.clone());
                    }
                }
            }
            Ok(StoreReply::Fragment(updated))
        }
        StoreRequest::DeleteUri { uri } => {
            sqlx::query("DELETE FROM attributes WHERE uri = $1")
                .bind(uri)
                .execute(&mut *conn)
                .await?;
            Ok(StoreReply::Unit(Ok(())))
        }
        StoreRequest::DeleteAttributes { uri, entries } => {
            let mut deleted = WorldState::new();
            for (name, origin) in entries {
                let result = sqlx::query(
                    "DELETE FROM attributes WHERE uri = $1 AND name = $2 AND origin = $3",
                )
                .bind(uri)
                .bind(name)
                .bind(origin)
                .execute(&mut *conn)
                .await?;
                if result.rows_affected() > 0 {
                    deleted.entry(uri.clone()).or_default().push(Attribute::new(
                        name.clone(),
                        0,
                        origin.clone(),
                        Vec::new(),
                    ));
                }
            }
            Ok(StoreReply::Fragment(deleted))
        }
        StoreRequest::FetchCurrent { uri_pattern, attr_pattern, origin_pattern } => {
            let rows: Vec<RowTuple> = sqlx::query_as(
                "SELECT uri, name, origin, created, expires, data FROM attributes \
                 WHERE expires = 0 AND uri ~ $1 AND name ~ $2 AND origin ~ $3",
            )
            .bind(anchored_source(uri_pattern))
            .bind(anchored_source(attr_pattern))
            .bind(anchored_source(origin_pattern))
            .fetch_all(&mut *conn)
            .await?;
            Ok(StoreReply::Fragment(rows_to_state(rows)))
        }
        StoreRequest::FetchSnapshotAt { uri_pattern, attr_pattern, origin_pattern, at } => {
            let rows: Vec<RowTuple> = sqlx::query_as(
                "SELECT uri, name, origin, created, expires, data FROM attributes \
                 WHERE created <= $4 AND (expires = 0 OR expires > $4) \
                   AND uri ~ $1 AND name ~ $2 AND origin ~ $3",
            )
            .bind(anchored_source(uri_pattern))
            .bind(anchored_source(attr_pattern))
            .bind(anchored_source(origin_pattern))
            .bind(at)
            .fetch_all(&mut *conn)
            .await?;
            Ok(StoreReply::Fragment(rows_to_state(rows)))
        }
        StoreRequest::FetchRange { uri_pattern, attr_pattern, origin_pattern, from, to } => {
            let rows: Vec<RowTuple> = sqlx::query_as(
                "SELECT uri, name, origin, created, expires, data FROM attributes \
                 WHERE created >= $4 AND created <= $5 \
                   AND uri ~ $1 AND name ~ $2 AND origin ~ $3 \
                 ORDER BY uri, created ASC",
            )
            .bind(anchored_source(uri_pattern))
            .bind(anchored_source(attr_pattern))
            .bind(anchored_source(origin_pattern))
            .bind(from)
            .bind(to)
            .fetch_all(&mut *conn)
            .await?;
            Ok(StoreReply::Fragment(rows_to_state(rows)))
        }
    }
}
