//! redb table definitions for the shipway state store.

use redb::TableDefinition;

/// Deployment records keyed by deployment id (`dep-000001`).
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Deployment events keyed by their sequence number.
pub const EVENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("events");

/// Counters (`deployment_seq`, `event_seq`).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

pub const DEPLOYMENT_SEQ: &str = "deployment_seq";
pub const EVENT_SEQ: &str = "event_seq";
