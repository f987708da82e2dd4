//! In-process store implementing the session seam
//!
//! `MemoryCluster` keeps keyspaces and tables in memory behind a single mutex, so
//! every statement (including conditional writes) is linearizable, the same
//! guarantee a Cassandra lightweight transaction gives on one partition.
//! It honors table `default_time_to_live` against an adjustable clock, can be
//! told to fail specific raw statements or to become unreachable, and counts
//! open sessions.
//!
//! Raw statements (migration scripts) are not interpreted; they are recorded in
//! the execution log and succeed unless a failure was scripted for their text.
//!
//! # Example
//!
//! ```rust
//! use harbormaster::memory::MemoryCluster;
//! use harbormaster::{Cluster, CqlSession, Statement};
//!
//! let cluster = MemoryCluster::new();
//! cluster.fail_statement("drop table missing", "unconfigured table missing");
//!
//! let session = cluster.connect().unwrap();
//! assert!(session.execute(&Statement::raw("drop table missing")).is_err());
//! session.close();
//! assert_eq!(cluster.open_sessions(), 0);
//! ```

use crate::cql::{CqlValue, ResultSet, Row, Statement, TableDef};
use crate::health::{ClusterState, HostState};
use crate::session::{Cluster, CqlSession, StoreError};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct StoredRow {
    values: BTreeMap<String, CqlValue>,
    expires_at: Option<Instant>,
}

impl StoredRow {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| now < deadline)
    }

    fn to_row(&self, columns: &[String]) -> Row {
        Row::new(
            columns.to_vec(),
            columns
                .iter()
                .map(|c| self.values.get(c).cloned().unwrap_or(CqlValue::Null))
                .collect(),
        )
    }
}

#[derive(Debug)]
struct TableState {
    def: TableDef,
    rows: BTreeMap<String, StoredRow>,
}

impl TableState {
    fn column_names(&self) -> Vec<String> {
        self.def.columns.iter().map(|(c, _)| c.clone()).collect()
    }

    /// Live row for `key`, dropping it first if its TTL elapsed
    fn live_row(&mut self, key: &str, now: Instant) -> Option<&mut StoredRow> {
        if self.rows.get(key).is_some_and(|row| !row.is_live(now)) {
            self.rows.remove(key);
        }
        self.rows.get_mut(key)
    }

    fn expires_at(&self, now: Instant) -> Option<Instant> {
        self.def
            .default_ttl
            .map(|ttl| now + Duration::from_secs(u64::from(ttl)))
    }
}

#[derive(Debug, Default)]
struct StoreState {
    keyspaces: BTreeMap<String, u32>,
    tables: HashMap<String, TableState>,
    executed: Vec<String>,
    failures: HashMap<String, String>,
    unreachable: bool,
    open_sessions: usize,
    sessions_opened: usize,
    hosts: Vec<HostState>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<StoreState>,
    clock_offset: Mutex<Duration>,
}

/// In-memory cluster; clones share the same data
#[derive(Debug, Clone)]
pub struct MemoryCluster {
    inner: Arc<Inner>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

fn table_key(keyspace: &str, table: &str) -> String {
    format!("{keyspace}.{table}")
}

fn key_text(value: &CqlValue) -> Result<String, StoreError> {
    match value {
        CqlValue::Text(s) => Ok(s.clone()),
        CqlValue::Int(n) => Ok(n.to_string()),
        other => Err(StoreError::InvalidQuery(format!(
            "Invalid primary key value {other}"
        ))),
    }
}

fn valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl MemoryCluster {
    pub fn new() -> Self {
        let state = StoreState {
            hosts: vec![HostState::new("127.0.0.1", "UP")],
            ..StoreState::default()
        };
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                clock_offset: Mutex::new(Duration::ZERO),
            }),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, StoreState>, StoreError> {
        self.inner
            .state
            .lock()
            .map_err(|_| StoreError::Other("in-memory store lock poisoned".to_string()))
    }

    fn now(&self) -> Instant {
        let offset = self
            .inner
            .clock_offset
            .lock()
            .map(|o| *o)
            .unwrap_or(Duration::ZERO);
        Instant::now() + offset
    }

    /// Move the store clock forward, e.g. past a lease TTL
    pub fn advance_clock(&self, by: Duration) {
        if let Ok(mut offset) = self.inner.clock_offset.lock() {
            *offset += by;
        }
    }

    /// Make every execution of the raw statement `statement` fail with `message`
    pub fn fail_statement(&self, statement: &str, message: &str) {
        if let Ok(mut state) = self.state() {
            state.failures.insert(statement.to_string(), message.to_string());
        }
    }

    /// Remove a failure registered with [`fail_statement`](Self::fail_statement)
    pub fn clear_failure(&self, statement: &str) {
        if let Ok(mut state) = self.state() {
            state.failures.remove(statement);
        }
    }

    /// Simulate losing (or regaining) every host
    pub fn set_unreachable(&self, unreachable: bool) {
        if let Ok(mut state) = self.state() {
            state.unreachable = unreachable;
        }
    }

    /// Replace the reported host list
    pub fn set_hosts(&self, hosts: Vec<HostState>) {
        if let Ok(mut state) = self.state() {
            state.hosts = hosts;
        }
    }

    /// Rendered text of every statement executed so far, in order
    #[must_use]
    pub fn executed(&self) -> Vec<String> {
        self.state().map(|s| s.executed.clone()).unwrap_or_default()
    }

    /// Number of times exactly `statement` was executed
    #[must_use]
    pub fn execution_count(&self, statement: &str) -> usize {
        self.state()
            .map(|s| s.executed.iter().filter(|e| *e == statement).count())
            .unwrap_or(0)
    }

    #[must_use]
    pub fn open_sessions(&self) -> usize {
        self.state().map(|s| s.open_sessions).unwrap_or(0)
    }

    #[must_use]
    pub fn sessions_opened(&self) -> usize {
        self.state().map(|s| s.sessions_opened).unwrap_or(0)
    }

    #[must_use]
    pub fn has_keyspace(&self, keyspace: &str) -> bool {
        self.state()
            .map(|s| s.keyspaces.contains_key(keyspace))
            .unwrap_or(false)
    }

    /// Replication factor the keyspace was created with
    #[must_use]
    pub fn replication_factor(&self, keyspace: &str) -> Option<u32> {
        self.state().ok().and_then(|s| s.keyspaces.get(keyspace).copied())
    }

    /// Column definitions of a table, if it exists
    #[must_use]
    pub fn table(&self, keyspace: &str, table: &str) -> Option<TableDef> {
        self.state()
            .ok()
            .and_then(|s| s.tables.get(&table_key(keyspace, table)).map(|t| t.def.clone()))
    }

    /// Live row stored under `key`, with all table columns
    #[must_use]
    pub fn row(&self, keyspace: &str, table: &str, key: &str) -> Option<Row> {
        let now = self.now();
        let mut state = self.state().ok()?;
        let table = state.tables.get_mut(&table_key(keyspace, table))?;
        let columns = table.column_names();
        table.live_row(key, now).map(|row| row.to_row(&columns))
    }

    /// Number of live rows in a table
    #[must_use]
    pub fn row_count(&self, keyspace: &str, table: &str) -> usize {
        let now = self.now();
        self.state()
            .ok()
            .and_then(|s| {
                s.tables
                    .get(&table_key(keyspace, table))
                    .map(|t| t.rows.values().filter(|r| r.is_live(now)).count())
            })
            .unwrap_or(0)
    }

    fn execute_on(&self, session_keyspace: &Mutex<Option<String>>, statement: &Statement) -> Result<ResultSet, StoreError> {
        let now = self.now();
        let mut state = self.state()?;
        if state.unreachable {
            return Err(StoreError::Unavailable(
                "All host(s) tried for query failed".to_string(),
            ));
        }
        state.executed.push(statement.to_string());

        match statement {
            Statement::CreateKeyspace { keyspace, replication_factor } => {
                if !valid_identifier(keyspace) {
                    return Err(StoreError::InvalidQuery(format!(
                        "line 1:29 no viable alternative at input '{keyspace}'"
                    )));
                }
                state
                    .keyspaces
                    .entry(keyspace.clone())
                    .or_insert(*replication_factor);
                Ok(ResultSet::applied())
            }
            Statement::UseKeyspace(keyspace) => {
                if !state.keyspaces.contains_key(keyspace) {
                    return Err(StoreError::InvalidQuery(format!(
                        "Keyspace '{keyspace}' does not exist"
                    )));
                }
                if let Ok(mut current) = session_keyspace.lock() {
                    *current = Some(keyspace.clone());
                }
                Ok(ResultSet::applied())
            }
            Statement::CreateTable(def) => {
                if !state.keyspaces.contains_key(&def.keyspace) {
                    return Err(StoreError::InvalidQuery(format!(
                        "Keyspace {} does not exist",
                        def.keyspace
                    )));
                }
                state
                    .tables
                    .entry(table_key(&def.keyspace, &def.name))
                    .or_insert_with(|| TableState {
                        def: def.clone(),
                        rows: BTreeMap::new(),
                    });
                Ok(ResultSet::applied())
            }
            Statement::Insert(insert) => {
                let table = state.table_mut(&insert.keyspace, &insert.table)?;
                let pk = table.def.primary_key.clone();
                let key_value = insert
                    .values
                    .iter()
                    .find(|(c, _)| *c == pk)
                    .map(|(_, v)| v)
                    .ok_or_else(|| {
                        StoreError::InvalidQuery(format!("Missing PRIMARY KEY part {pk}"))
                    })?;
                let key = key_text(key_value)?;
                let columns = table.column_names();
                let expires_at = table.expires_at(now);

                let existing = table.live_row(&key, now);
                if let Some(condition) = &insert.condition {
                    let exists = existing.is_some();
                    if !condition.holds(|_| None, exists) {
                        let current = existing.map(|r| r.to_row(&columns)).into_iter().collect();
                        return Ok(ResultSet::not_applied(current));
                    }
                }

                let values = insert
                    .values
                    .iter()
                    .map(|(c, v)| (c.clone(), materialize(v)))
                    .collect();
                table.rows.insert(key, StoredRow { values, expires_at });
                Ok(ResultSet::applied())
            }
            Statement::Update(update) => {
                let table = state.table_mut(&update.keyspace, &update.table)?;
                let key = key_text(&update.key.1)?;
                let columns = table.column_names();
                let expires_at = table.expires_at(now);

                let existing = table.live_row(&key, now);
                if let Some(condition) = &update.condition {
                    let holds = match &existing {
                        Some(row) => condition.holds(|c| row.values.get(c), true),
                        None => condition.holds(|_| None, false),
                    };
                    if !holds {
                        let current = existing.map(|r| r.to_row(&columns)).into_iter().collect();
                        return Ok(ResultSet::not_applied(current));
                    }
                }

                let row = table.rows.entry(key.clone()).or_insert_with(|| StoredRow {
                    values: BTreeMap::from([(update.key.0.clone(), CqlValue::Text(key))]),
                    expires_at,
                });
                for (column, value) in &update.assignments {
                    row.values.insert(column.clone(), materialize(value));
                }
                Ok(ResultSet::applied())
            }
            Statement::Delete(delete) => {
                let table = state.table_mut(&delete.keyspace, &delete.table)?;
                let key = key_text(&delete.key.1)?;
                let columns = table.column_names();

                let existing = table.live_row(&key, now);
                if let Some(condition) = &delete.condition {
                    let holds = match &existing {
                        Some(row) => condition.holds(|c| row.values.get(c), true),
                        None => condition.holds(|_| None, false),
                    };
                    if !holds {
                        let current = existing.map(|r| r.to_row(&columns)).into_iter().collect();
                        return Ok(ResultSet::not_applied(current));
                    }
                }
                table.rows.remove(&key);
                Ok(ResultSet::applied())
            }
            Statement::Select(select) => {
                let table = state.table_mut(&select.keyspace, &select.table)?;
                table.rows.retain(|_, row| row.is_live(now));
                let rows = match &select.key {
                    Some((_, value)) => {
                        let key = key_text(value)?;
                        table
                            .rows
                            .get(&key)
                            .map(|r| r.to_row(&select.columns))
                            .into_iter()
                            .collect()
                    }
                    None => table
                        .rows
                        .values()
                        .map(|r| r.to_row(&select.columns))
                        .collect(),
                };
                Ok(ResultSet::with_rows(rows))
            }
            Statement::Raw(text) => {
                if let Some(message) = state.failures.get(text) {
                    return Err(StoreError::InvalidQuery(message.clone()));
                }
                Ok(ResultSet::applied())
            }
        }
    }
}

impl StoreState {
    fn table_mut(&mut self, keyspace: &str, table: &str) -> Result<&mut TableState, StoreError> {
        self.tables.get_mut(&table_key(keyspace, table)).ok_or_else(|| {
            StoreError::InvalidQuery(format!("unconfigured table {table}"))
        })
    }
}

fn materialize(value: &CqlValue) -> CqlValue {
    match value {
        CqlValue::Now => CqlValue::Timestamp(Utc::now()),
        other => other.clone(),
    }
}

/// Session over a [`MemoryCluster`]
pub struct MemorySession {
    cluster: MemoryCluster,
    keyspace: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl MemorySession {
    /// Keyspace selected with `USE`, if any
    #[must_use]
    pub fn keyspace(&self) -> Option<String> {
        self.keyspace.lock().ok().and_then(|k| k.clone())
    }
}

impl CqlSession for MemorySession {
    fn execute(&self, statement: &Statement) -> Result<ResultSet, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Other("session is closed".to_string()));
        }
        self.cluster.execute_on(&self.keyspace, statement)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut state) = self.cluster.state() {
            state.open_sessions = state.open_sessions.saturating_sub(1);
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.close();
    }
}

impl Cluster for MemoryCluster {
    fn connect(&self) -> Result<Arc<dyn CqlSession>, StoreError> {
        let mut state = self.state()?;
        if state.unreachable {
            return Err(StoreError::Unavailable(
                "All host(s) tried for query failed".to_string(),
            ));
        }
        state.open_sessions += 1;
        state.sessions_opened += 1;
        drop(state);

        Ok(Arc::new(MemorySession {
            cluster: self.clone(),
            keyspace: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }
}

impl ClusterState for MemoryCluster {
    fn open_connections(&self) -> usize {
        self.open_sessions()
    }

    fn connected_hosts(&self) -> Vec<HostState> {
        self.state().map(|s| s.hosts.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cql::{ColumnType, Delete, Insert, Select, Update};

    fn setup() -> (MemoryCluster, Arc<dyn CqlSession>) {
        let cluster = MemoryCluster::new();
        let session = cluster.connect().unwrap();
        session
            .execute(&Statement::CreateKeyspace {
                keyspace: "ks".into(),
                replication_factor: 1,
            })
            .unwrap();
        session
            .execute(
                &TableDef::new("ks", "kv")
                    .key("k", ColumnType::Text)
                    .col("v", ColumnType::Text)
                    .default_ttl(10)
                    .into(),
            )
            .unwrap();
        (cluster, session)
    }

    #[test]
    fn test_insert_if_not_exists_returns_current_row_when_rejected() {
        let (cluster, session) = setup();
        let first = Insert::into("ks", "kv").value("k", "a").value("v", "1").if_not_exists();
        let second = Insert::into("ks", "kv").value("k", "a").value("v", "2").if_not_exists();

        assert!(session.execute(&first.into()).unwrap().was_applied());
        let rejected = session.execute(&second.into()).unwrap();
        assert!(!rejected.was_applied());
        assert_eq!(rejected.rows()[0].get_by_name("v"), Some(&CqlValue::from("1")));
        assert_eq!(cluster.row("ks", "kv", "a").unwrap().get_text(1), Some("1"));
    }

    #[test]
    fn test_rows_expire_after_default_ttl() {
        let (cluster, session) = setup();
        session
            .execute(&Insert::into("ks", "kv").value("k", "a").if_not_exists().into())
            .unwrap();
        cluster.advance_clock(Duration::from_secs(11));

        assert!(cluster.row("ks", "kv", "a").is_none());
        assert!(session
            .execute(&Insert::into("ks", "kv").value("k", "a").if_not_exists().into())
            .unwrap()
            .was_applied());
    }

    #[test]
    fn test_conditional_update_and_delete() {
        let (cluster, session) = setup();
        session
            .execute(&Insert::into("ks", "kv").value("k", "a").value("v", "x").into())
            .unwrap();

        let guarded = Update::table("ks", "kv")
            .set("v", "y")
            .where_eq("k", "a")
            .only_if_in("v", ["nope"]);
        assert!(!session.execute(&guarded.into()).unwrap().was_applied());

        let missing = Delete::from("ks", "kv").where_eq("k", "zzz").only_if_eq("v", "x");
        assert!(!session.execute(&missing.into()).unwrap().was_applied());

        let delete = Delete::from("ks", "kv").where_eq("k", "a").only_if_eq("v", "x");
        assert!(session.execute(&delete.into()).unwrap().was_applied());
        assert_eq!(cluster.row_count("ks", "kv"), 0);
    }

    #[test]
    fn test_unknown_table_and_unreachable() {
        let (cluster, session) = setup();
        let err = session
            .execute(&Select::columns(&["k"]).from("ks", "nope").into())
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidQuery(_)));

        cluster.set_unreachable(true);
        assert!(matches!(
            session.execute(&Statement::raw("select 1")),
            Err(StoreError::Unavailable(_))
        ));
        assert!(cluster.connect().is_err());
    }

    #[test]
    fn test_use_keyspace_and_session_accounting() {
        let cluster = MemoryCluster::new();
        let session = cluster.connect().unwrap();
        assert!(session.execute(&Statement::UseKeyspace("missing".into())).is_err());
        assert_eq!(cluster.open_sessions(), 1);
        session.close();
        session.close();
        assert_eq!(cluster.open_sessions(), 0);
        assert_eq!(cluster.sessions_opened(), 1);
        assert!(session.execute(&Statement::raw("select 1")).is_err());
    }
}
