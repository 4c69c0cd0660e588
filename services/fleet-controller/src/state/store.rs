//! SQLite-based checkpoint store.

use std::path::Path;

use chrono::{DateTime, Utc};
use fleet_reconcile::LabelSet;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::debug;

use crate::node::{NodeHandle, NodeId, NodeState};

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Invalid record for node {node_id}: {reason}")]
    Invalid { node_id: String, reason: String },
}

/// One checkpointed node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub id: NodeId,
    pub labels: LabelSet,
    pub state: NodeState,
    pub stop_on_reclaim: bool,
    pub image: String,
    pub size: String,
    pub endpoint: Option<String>,
    pub handshake_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl NodeRecord {
    pub fn from_handle(handle: &NodeHandle) -> Self {
        Self {
            id: handle.id().clone(),
            labels: handle.label_set().clone(),
            state: handle.state(),
            stop_on_reclaim: handle.stop_on_reclaim(),
            image: handle.image.clone(),
            size: handle.size.clone(),
            endpoint: handle.endpoint.clone(),
            handshake_token: handle.handshake_token.clone(),
            created_at: handle.created_at(),
            last_activity_at: handle.last_activity_at(),
        }
    }

    /// Rebuild the handle in `state`, which may differ from the recorded one
    /// after reconciliation against the backend.
    pub fn into_handle(self, state: NodeState) -> NodeHandle {
        let mut handle = NodeHandle::restore(
            self.id,
            self.labels,
            state,
            self.stop_on_reclaim,
            self.created_at,
            self.last_activity_at,
        );
        handle.image = self.image;
        handle.size = self.size;
        handle.endpoint = self.endpoint;
        handle.handshake_token = self.handshake_token;
        handle
    }
}

/// Raw row as stored; converted into a `NodeRecord` outside the row closure.
struct NodeRow {
    node_id: String,
    labels: String,
    state: String,
    stop_on_reclaim: bool,
    image: String,
    size: String,
    endpoint: Option<String>,
    handshake_token: Option<String>,
    created_at: i64,
    last_activity_at: i64,
}

impl NodeRow {
    fn into_record(self) -> Result<NodeRecord, StateStoreError> {
        let invalid = |reason: String| StateStoreError::Invalid {
            node_id: self.node_id.clone(),
            reason,
        };

        let labels: LabelSet = self
            .labels
            .parse()
            .map_err(|e| invalid(format!("labels: {}", e)))?;
        let state = NodeState::parse(&self.state)
            .ok_or_else(|| invalid(format!("unknown state '{}'", self.state)))?;
        let created_at = DateTime::from_timestamp_millis(self.created_at)
            .ok_or_else(|| invalid("created_at out of range".to_string()))?;
        let last_activity_at = DateTime::from_timestamp_millis(self.last_activity_at)
            .ok_or_else(|| invalid("last_activity_at out of range".to_string()))?;

        Ok(NodeRecord {
            id: NodeId::new(self.node_id),
            labels,
            state,
            stop_on_reclaim: self.stop_on_reclaim,
            image: self.image,
            size: self.size,
            endpoint: self.endpoint,
            handshake_token: self.handshake_token,
            created_at,
            last_activity_at,
        })
    }
}

const SELECT_NODE: &str = "SELECT node_id, labels, state, stop_on_reclaim, image, size, endpoint, handshake_token, created_at, last_activity_at FROM nodes";

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<NodeRow> {
    Ok(NodeRow {
        node_id: row.get(0)?,
        labels: row.get(1)?,
        state: row.get(2)?,
        stop_on_reclaim: row.get(3)?,
        image: row.get(4)?,
        size: row.get(5)?,
        endpoint: row.get(6)?,
        handshake_token: row.get(7)?,
        created_at: row.get(8)?,
        last_activity_at: row.get(9)?,
    })
}

/// SQLite checkpoint store.
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    /// Open or create a state store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self { conn };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StateStoreError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                node_id TEXT NOT NULL UNIQUE,
                labels TEXT NOT NULL,
                state TEXT NOT NULL,
                stop_on_reclaim INTEGER NOT NULL,
                image TEXT NOT NULL,
                size TEXT NOT NULL,
                endpoint TEXT,
                handshake_token TEXT,
                created_at INTEGER NOT NULL,
                last_activity_at INTEGER NOT NULL
            );
            "#,
        )?;

        debug!("State store schema initialized");
        Ok(())
    }

    /// Insert or update a node record. Updates keep the original position.
    pub fn upsert_node(&self, record: &NodeRecord) -> Result<(), StateStoreError> {
        self.conn.execute(
            r#"
            INSERT INTO nodes (node_id, labels, state, stop_on_reclaim, image, size, endpoint, handshake_token, created_at, last_activity_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(node_id) DO UPDATE SET
                labels = excluded.labels,
                state = excluded.state,
                stop_on_reclaim = excluded.stop_on_reclaim,
                image = excluded.image,
                size = excluded.size,
                endpoint = excluded.endpoint,
                handshake_token = excluded.handshake_token,
                last_activity_at = excluded.last_activity_at
            "#,
            params![
                record.id.as_str(),
                record.labels.to_string(),
                record.state.as_str(),
                record.stop_on_reclaim,
                record.image,
                record.size,
                record.endpoint,
                record.handshake_token,
                record.created_at.timestamp_millis(),
                record.last_activity_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Get a node record.
    pub fn get_node(&self, id: &NodeId) -> Result<Option<NodeRecord>, StateStoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} WHERE node_id = ?1", SELECT_NODE))?;

        stmt.query_row(params![id.as_str()], read_row)
            .optional()?
            .map(NodeRow::into_record)
            .transpose()
    }

    /// Delete a node record. Deleting a missing record succeeds.
    pub fn delete_node(&self, id: &NodeId) -> Result<(), StateStoreError> {
        self.conn
            .execute("DELETE FROM nodes WHERE node_id = ?1", params![id.as_str()])?;
        Ok(())
    }

    /// List all node records in insertion order.
    pub fn list_nodes(&self) -> Result<Vec<NodeRecord>, StateStoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} ORDER BY seq", SELECT_NODE))?;

        let rows = stmt
            .query_map([], read_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(NodeRow::into_record).collect()
    }
}
