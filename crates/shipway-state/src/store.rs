//! StateStore: redb-backed persistence for deployment records and events.
//!
//! Values are JSON-serialized into redb's `&[u8]` columns. The store
//! supports both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Storage))?;
        txn.open_table(EVENTS).map_err(map_err!(Storage))?;
        txn.open_table(META).map_err(map_err!(Storage))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Bump a counter in `META` and return the new value, in its own transaction.
    fn next_seq(&self, counter: &str) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let next;
        {
            let mut meta = txn.open_table(META).map_err(map_err!(Storage))?;
            let current = meta
                .get(counter)
                .map_err(map_err!(Storage))?
                .map(|guard| guard.value())
                .unwrap_or(0);
            next = current + 1;
            meta.insert(counter, next).map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(next)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Allocate the next deployment id.
    pub fn next_deployment_id(&self) -> StateResult<DeploymentId> {
        Ok(deployment_id(self.next_seq(DEPLOYMENT_SEQ)?))
    }

    /// Insert or update a deployment record.
    pub fn put_deployment(&self, record: &DeploymentRecord) -> StateResult<()> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Encode))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Storage))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(deployment = %key, state = %record.state, "deployment stored");
        Ok(())
    }

    /// Get a deployment record by id.
    pub fn get_deployment(&self, id: &str) -> StateResult<Option<DeploymentRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Storage))?;
        match table.get(id).map_err(map_err!(Storage))? {
            Some(guard) => Ok(Some(decode(id, guard.value())?)),
            None => Ok(None),
        }
    }

    /// Get a deployment record, failing with `NotFound` if it is absent.
    pub fn require_deployment(&self, id: &str) -> StateResult<DeploymentRecord> {
        self.get_deployment(id)?
            .ok_or_else(|| StateError::NotFound(id.to_string()))
    }

    /// All deployment records, oldest first.
    pub fn list_deployments(&self) -> StateResult<Vec<DeploymentRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Storage))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Storage))? {
            let (key, value) = entry.map_err(map_err!(Storage))?;
            results.push(decode(key.value(), value.value())?);
        }
        Ok(results)
    }

    /// The most recent deployment that succeeded, optionally skipping one id.
    pub fn latest_succeeded(&self, excluding: Option<&str>) -> StateResult<Option<DeploymentRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Storage))?;
        for entry in table.iter().map_err(map_err!(Storage))?.rev() {
            let (key, value) = entry.map_err(map_err!(Storage))?;
            if Some(key.value()) == excluding {
                continue;
            }
            let record: DeploymentRecord = decode(key.value(), value.value())?;
            if record.outcome == Some(DeploymentOutcome::Succeeded) && record.artifact.is_some() {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Close records left in flight by a previous process as `Aborted`.
    ///
    /// Returns the ids that were closed.
    pub fn close_stale(&self, reason: &str) -> StateResult<Vec<DeploymentId>> {
        let stale: Vec<DeploymentRecord> = self
            .list_deployments()?
            .into_iter()
            .filter(|r| !r.is_terminal())
            .collect();

        let mut closed = Vec::with_capacity(stale.len());
        for mut record in stale {
            let from = record.state;
            record.state = DeploymentState::Idle;
            record.outcome = Some(DeploymentOutcome::Aborted);
            record.warnings.push(reason.to_string());
            record.finished_at = Some(epoch_millis());
            self.put_deployment(&record)?;
            self.append_event(
                NewEvent::transition(&record.id, from, DeploymentState::Idle, reason, "shipd")
                    .with_severity(Severity::Warning),
            )?;
            closed.push(record.id);
        }
        if !closed.is_empty() {
            info!(count = closed.len(), "closed stale deployments");
        }
        Ok(closed)
    }

    // ── Events ─────────────────────────────────────────────────────

    /// Append an event, assigning the next sequence number and a timestamp.
    pub fn append_event(&self, event: NewEvent) -> StateResult<DeploymentEvent> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stored;
        {
            let mut meta = txn.open_table(META).map_err(map_err!(Storage))?;
            let seq = meta
                .get(EVENT_SEQ)
                .map_err(map_err!(Storage))?
                .map(|guard| guard.value())
                .unwrap_or(0)
                + 1;
            meta.insert(EVENT_SEQ, seq).map_err(map_err!(Storage))?;

            stored = DeploymentEvent::from_new(seq, epoch_millis(), event);
            let value = serde_json::to_vec(&stored).map_err(map_err!(Encode))?;
            let mut events = txn.open_table(EVENTS).map_err(map_err!(Storage))?;
            events
                .insert(seq, value.as_slice())
                .map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(stored)
    }

    /// Events with a sequence number greater than `seq`, in order.
    pub fn list_events_since(&self, seq: u64) -> StateResult<Vec<DeploymentEvent>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EVENTS).map_err(map_err!(Storage))?;
        let mut results = Vec::new();
        for entry in table.range(seq.saturating_add(1)..).map_err(map_err!(Storage))? {
            let (key, value) = entry.map_err(map_err!(Storage))?;
            results.push(decode(&key.value().to_string(), value.value())?);
        }
        Ok(results)
    }

    /// All events of one deployment, in order.
    pub fn list_events_for(&self, deployment_id: &str) -> StateResult<Vec<DeploymentEvent>> {
        Ok(self
            .list_events_since(0)?
            .into_iter()
            .filter(|e| e.deployment_id == deployment_id)
            .collect())
    }
}

fn decode<T: serde::de::DeserializeOwned>(key: &str, bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StateError::Decode {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
