//! Typed CQL statements
//!
//! Every statement the coordination layer sends to the store is built here so
//! that the conditional (`IF ...`) part of a write is part of the statement's
//! structure rather than a string fragment. A [`CqlSession`](crate::CqlSession)
//! implementation may interpret the typed form directly or send the rendered
//! text (`Display`) over the wire.
//!
//! # Example
//!
//! ```rust
//! use harbormaster::cql::{Delete, Insert, Statement};
//!
//! let acquire: Statement = Insert::into("app", "leases")
//!     .value("name", "migration")
//!     .value("owner", "host-a")
//!     .if_not_exists()
//!     .into();
//! assert_eq!(
//!     acquire.to_string(),
//!     "INSERT INTO app.leases (name,owner) VALUES ('migration','host-a') IF NOT EXISTS"
//! );
//!
//! let release: Statement = Delete::from("app", "leases")
//!     .where_eq("name", "migration")
//!     .only_if_eq("owner", "host-a")
//!     .into();
//! assert_eq!(
//!     release.to_string(),
//!     "DELETE FROM app.leases WHERE name='migration' IF owner='host-a'"
//! );
//! ```

use chrono::{DateTime, Utc};
use std::fmt;

/// A literal value in a CQL statement or result row
#[derive(Debug, Clone, PartialEq)]
pub enum CqlValue {
    /// `text` column value
    Text(String),
    /// `int`/`bigint` column value
    Int(i64),
    /// `timestamp` column value
    Timestamp(DateTime<Utc>),
    /// Store-generated current timestamp, rendered as `toTimestamp(now())`
    Now,
    /// `null`
    Null,
}

impl CqlValue {
    /// Text content, if this is a text value
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            CqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Timestamp content, if this is a timestamp value
    #[must_use]
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            CqlValue::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, CqlValue::Null)
    }
}

impl fmt::Display for CqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CqlValue::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            CqlValue::Int(n) => write!(f, "{n}"),
            CqlValue::Timestamp(ts) => write!(f, "{}", ts.timestamp_millis()),
            CqlValue::Now => f.write_str("toTimestamp(now())"),
            CqlValue::Null => f.write_str("null"),
        }
    }
}

impl From<&str> for CqlValue {
    fn from(value: &str) -> Self {
        CqlValue::Text(value.to_string())
    }
}

impl From<String> for CqlValue {
    fn from(value: String) -> Self {
        CqlValue::Text(value)
    }
}

impl From<i64> for CqlValue {
    fn from(value: i64) -> Self {
        CqlValue::Int(value)
    }
}

impl From<DateTime<Utc>> for CqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        CqlValue::Timestamp(value)
    }
}

impl<T: Into<CqlValue>> From<Option<T>> for CqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(CqlValue::Null, Into::into)
    }
}

/// Column types used by the control tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Timestamp,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Text => f.write_str("text"),
            ColumnType::Timestamp => f.write_str("timestamp"),
        }
    }
}

/// `CREATE TABLE IF NOT EXISTS` definition with a single-column primary key
#[derive(Debug, Clone, PartialEq)]
pub struct TableDef {
    pub keyspace: String,
    pub name: String,
    pub columns: Vec<(String, ColumnType)>,
    pub primary_key: String,
    /// `default_time_to_live` in seconds
    pub default_ttl: Option<u32>,
}

impl TableDef {
    pub fn new(keyspace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            name: name.into(),
            columns: Vec::new(),
            primary_key: String::new(),
            default_ttl: None,
        }
    }

    /// Add the primary key column
    #[must_use]
    pub fn key(mut self, column: &str, ty: ColumnType) -> Self {
        self.primary_key = column.to_string();
        self.columns.push((column.to_string(), ty));
        self
    }

    #[must_use]
    pub fn col(mut self, column: &str, ty: ColumnType) -> Self {
        self.columns.push((column.to_string(), ty));
        self
    }

    #[must_use]
    pub fn default_ttl(mut self, seconds: u32) -> Self {
        self.default_ttl = Some(seconds);
        self
    }
}

/// Precondition of a conditional (lightweight transaction) write
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `IF NOT EXISTS`
    NotExists,
    /// `IF <column>=<value>`
    Eq(String, CqlValue),
    /// `IF <column> IN (<values>)`
    In(String, Vec<CqlValue>),
}

impl Condition {
    /// Evaluate the condition against the current row, `None` when the row is absent
    pub fn holds<'a>(&self, mut current: impl FnMut(&str) -> Option<&'a CqlValue>, exists: bool) -> bool {
        match self {
            Condition::NotExists => !exists,
            Condition::Eq(column, expected) => {
                exists && current(column).unwrap_or(&CqlValue::Null) == expected
            }
            Condition::In(column, allowed) => {
                exists && allowed.contains(current(column).unwrap_or(&CqlValue::Null))
            }
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::NotExists => f.write_str("IF NOT EXISTS"),
            Condition::Eq(column, value) => write!(f, "IF {column}={value}"),
            Condition::In(column, values) => {
                write!(f, "IF {column} IN (")?;
                write_joined(f, values.iter().map(ToString::to_string))?;
                f.write_str(")")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub keyspace: String,
    pub table: String,
    pub values: Vec<(String, CqlValue)>,
    pub condition: Option<Condition>,
}

impl Insert {
    pub fn into(keyspace: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            table: table.into(),
            values: Vec::new(),
            condition: None,
        }
    }

    #[must_use]
    pub fn value(mut self, column: &str, value: impl Into<CqlValue>) -> Self {
        self.values.push((column.to_string(), value.into()));
        self
    }

    #[must_use]
    pub fn if_not_exists(mut self) -> Self {
        self.condition = Some(Condition::NotExists);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub keyspace: String,
    pub table: String,
    pub assignments: Vec<(String, CqlValue)>,
    pub key: (String, CqlValue),
    pub condition: Option<Condition>,
}

impl Update {
    pub fn table(keyspace: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            table: table.into(),
            assignments: Vec::new(),
            key: (String::new(), CqlValue::Null),
            condition: None,
        }
    }

    #[must_use]
    pub fn set(mut self, column: &str, value: impl Into<CqlValue>) -> Self {
        self.assignments.push((column.to_string(), value.into()));
        self
    }

    #[must_use]
    pub fn where_eq(mut self, column: &str, value: impl Into<CqlValue>) -> Self {
        self.key = (column.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn only_if_in<V: Into<CqlValue>>(mut self, column: &str, values: impl IntoIterator<Item = V>) -> Self {
        self.condition = Some(Condition::In(
            column.to_string(),
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub keyspace: String,
    pub table: String,
    pub key: (String, CqlValue),
    pub condition: Option<Condition>,
}

impl Delete {
    pub fn from(keyspace: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            table: table.into(),
            key: (String::new(), CqlValue::Null),
            condition: None,
        }
    }

    #[must_use]
    pub fn where_eq(mut self, column: &str, value: impl Into<CqlValue>) -> Self {
        self.key = (column.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn only_if_eq(mut self, column: &str, value: impl Into<CqlValue>) -> Self {
        self.condition = Some(Condition::Eq(column.to_string(), value.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub keyspace: String,
    pub table: String,
    pub columns: Vec<String>,
    pub key: Option<(String, CqlValue)>,
}

impl Select {
    pub fn columns(columns: &[&str]) -> SelectFrom {
        SelectFrom {
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
        }
    }

    #[must_use]
    pub fn where_eq(mut self, column: &str, value: impl Into<CqlValue>) -> Self {
        self.key = Some((column.to_string(), value.into()));
        self
    }
}

/// Intermediate step of [`Select::columns`]
pub struct SelectFrom {
    columns: Vec<String>,
}

impl SelectFrom {
    pub fn from(self, keyspace: impl Into<String>, table: impl Into<String>) -> Select {
        Select {
            keyspace: keyspace.into(),
            table: table.into(),
            columns: self.columns,
            key: None,
        }
    }
}

/// A statement sent to the store
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    CreateKeyspace {
        keyspace: String,
        replication_factor: u32,
    },
    UseKeyspace(String),
    CreateTable(TableDef),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
    Select(Select),
    /// Opaque script text, e.g. the body of a migration
    Raw(String),
}

impl Statement {
    pub fn raw(text: impl Into<String>) -> Self {
        Statement::Raw(text.into())
    }

    /// Whether the store must evaluate a precondition before applying this write
    #[must_use]
    pub fn is_conditional(&self) -> bool {
        match self {
            Statement::Insert(i) => i.condition.is_some(),
            Statement::Update(u) => u.condition.is_some(),
            Statement::Delete(d) => d.condition.is_some(),
            _ => false,
        }
    }
}

impl From<Insert> for Statement {
    fn from(value: Insert) -> Self {
        Statement::Insert(value)
    }
}

impl From<Update> for Statement {
    fn from(value: Update) -> Self {
        Statement::Update(value)
    }
}

impl From<Delete> for Statement {
    fn from(value: Delete) -> Self {
        Statement::Delete(value)
    }
}

impl From<Select> for Statement {
    fn from(value: Select) -> Self {
        Statement::Select(value)
    }
}

impl From<TableDef> for Statement {
    fn from(value: TableDef) -> Self {
        Statement::CreateTable(value)
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, items: impl Iterator<Item = String>) -> fmt::Result {
    for (i, item) in items.enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        f.write_str(&item)?;
    }
    Ok(())
}

fn write_condition(f: &mut fmt::Formatter<'_>, condition: &Option<Condition>) -> fmt::Result {
    match condition {
        Some(c) => write!(f, " {c}"),
        None => Ok(()),
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::CreateKeyspace { keyspace, replication_factor } => write!(
                f,
                "CREATE KEYSPACE IF NOT EXISTS {keyspace} WITH replication = \
                 {{'class': 'SimpleStrategy', 'replication_factor': {replication_factor}}}"
            ),
            Statement::UseKeyspace(keyspace) => write!(f, "USE {keyspace}"),
            Statement::CreateTable(def) => {
                write!(f, "CREATE TABLE IF NOT EXISTS {}.{} (", def.keyspace, def.name)?;
                for (i, (column, ty)) in def.columns.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{column} {ty}")?;
                    if *column == def.primary_key {
                        f.write_str(" PRIMARY KEY")?;
                    }
                }
                f.write_str(")")?;
                if let Some(ttl) = def.default_ttl {
                    write!(f, " WITH default_time_to_live = {ttl}")?;
                }
                Ok(())
            }
            Statement::Insert(insert) => {
                write!(f, "INSERT INTO {}.{} (", insert.keyspace, insert.table)?;
                write_joined(f, insert.values.iter().map(|(c, _)| c.clone()))?;
                f.write_str(") VALUES (")?;
                write_joined(f, insert.values.iter().map(|(_, v)| v.to_string()))?;
                f.write_str(")")?;
                write_condition(f, &insert.condition)
            }
            Statement::Update(update) => {
                write!(f, "UPDATE {}.{} SET ", update.keyspace, update.table)?;
                write_joined(
                    f,
                    update.assignments.iter().map(|(c, v)| format!("{c}={v}")),
                )?;
                write!(f, " WHERE {}={}", update.key.0, update.key.1)?;
                write_condition(f, &update.condition)
            }
            Statement::Delete(delete) => {
                write!(
                    f,
                    "DELETE FROM {}.{} WHERE {}={}",
                    delete.keyspace, delete.table, delete.key.0, delete.key.1
                )?;
                write_condition(f, &delete.condition)
            }
            Statement::Select(select) => {
                f.write_str("SELECT ")?;
                write_joined(f, select.columns.iter().cloned())?;
                write!(f, " FROM {}.{}", select.keyspace, select.table)?;
                if let Some((column, value)) = &select.key {
                    write!(f, " WHERE {column}={value}")?;
                }
                Ok(())
            }
            Statement::Raw(text) => f.write_str(text),
        }
    }
}

/// One row of a [`ResultSet`]
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<CqlValue>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<CqlValue>) -> Self {
        Self { columns, values }
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&CqlValue> {
        self.values.get(index)
    }

    #[must_use]
    pub fn get_by_name(&self, column: &str) -> Option<&CqlValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    /// Text value at `index`; `None` for null, missing or non-text cells
    #[must_use]
    pub fn get_text(&self, index: usize) -> Option<&str> {
        self.get(index).and_then(CqlValue::as_text)
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Result of executing a [`Statement`]
///
/// For conditional writes `applied` reports whether the precondition held; on a
/// rejected write the store returns the current row, as Cassandra does.
/// Unconditional statements are always applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSet {
    applied: bool,
    rows: Vec<Row>,
}

impl ResultSet {
    #[must_use]
    pub fn applied() -> Self {
        Self { applied: true, rows: Vec::new() }
    }

    #[must_use]
    pub fn not_applied(current: Vec<Row>) -> Self {
        Self { applied: false, rows: current }
    }

    #[must_use]
    pub fn with_rows(rows: Vec<Row>) -> Self {
        Self { applied: true, rows }
    }

    #[must_use]
    pub fn was_applied(&self) -> bool {
        self.applied
    }

    #[must_use]
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    #[must_use]
    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_values_are_quoted_and_escaped() {
        assert_eq!(CqlValue::from("it's").to_string(), "'it''s'");
        assert_eq!(CqlValue::from(None::<String>).to_string(), "null");
        assert_eq!(CqlValue::Now.to_string(), "toTimestamp(now())");
    }

    #[test]
    fn test_create_table_with_ttl() {
        let table = TableDef::new("test", "leases")
            .key("name", ColumnType::Text)
            .col("owner", ColumnType::Text)
            .col("value", ColumnType::Text)
            .default_ttl(180);

        assert_eq!(
            Statement::from(table).to_string(),
            "CREATE TABLE IF NOT EXISTS test.leases (name text PRIMARY KEY, owner text, value text) \
             WITH default_time_to_live = 180"
        );
    }

    #[test]
    fn test_conditional_update_rendering() {
        let update: Statement = Update::table("test", "migrations")
            .set("status", "FAILED")
            .set("reason", Some("unit test"))
            .where_eq("name", "001_init.cql")
            .only_if_in("status", ["APPLYING", "FAILED"])
            .into();

        assert_eq!(
            update.to_string(),
            "UPDATE test.migrations SET status='FAILED',reason='unit test' \
             WHERE name='001_init.cql' IF status IN ('APPLYING','FAILED')"
        );
        assert!(update.is_conditional());
    }

    #[test]
    fn test_select_rendering() {
        let select: Statement = Select::columns(&["name", "status"])
            .from("test", "migrations")
            .into();
        assert_eq!(select.to_string(), "SELECT name,status FROM test.migrations");
        assert!(!select.is_conditional());
    }

    #[test]
    fn test_condition_evaluation() {
        let status = CqlValue::from("APPLIED");
        let guard = Condition::In(
            "status".into(),
            vec![CqlValue::from("APPLYING"), CqlValue::from("FAILED")],
        );
        assert!(!guard.holds(|_| Some(&status), true));
        assert!(!guard.holds(|_| None, false));
        assert!(Condition::NotExists.holds(|_| None, false));

        let owner = CqlValue::from("a");
        let eq = Condition::Eq("owner".into(), CqlValue::from("a"));
        assert!(eq.holds(|_| Some(&owner), true));
    }

    #[test]
    fn test_row_accessors() {
        let row = Row::new(
            vec!["name".into(), "status".into()],
            vec![CqlValue::from("001"), CqlValue::Null],
        );
        assert_eq!(row.get_text(0), Some("001"));
        assert_eq!(row.get_text(1), None);
        assert_eq!(row.get_by_name("status"), Some(&CqlValue::Null));
        assert_eq!(row.len(), 2);
    }
}
