//! Migration definition and ordering

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// A named schema-change script
///
/// Equality and ordering use the name only; two migrations with the same name
/// are the same migration regardless of their statement text.
#[derive(Debug, Clone)]
pub struct Migration {
    name: String,
    statement: String,
}

impl Migration {
    pub fn new(name: impl Into<String>, statement: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            statement: statement.into(),
        }
    }

    /// Unique identifier, usually the source file name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Script text sent to the store
    pub fn statement(&self) -> &str {
        &self.statement
    }
}

impl PartialEq for Migration {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Migration {}

impl PartialOrd for Migration {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Migration {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name.cmp(&other.name)
    }
}

impl fmt::Display for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Migration({})", self.name)
    }
}

/// Order in which pending migrations are applied
pub type MigrationOrder = Arc<dyn Fn(&Migration, &Migration) -> Ordering + Send + Sync>;

/// Lexical order of migration names, e.g. `001_init.cql` before `002_add.cql`
pub fn by_name() -> MigrationOrder {
    Arc::new(|a: &Migration, b: &Migration| a.name().cmp(b.name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_ignores_statement() {
        assert_eq!(
            Migration::new("001_init.cql", "create table a (id int primary key)"),
            Migration::new("001_init.cql", "create table b (id int primary key)")
        );
    }

    #[test]
    fn test_default_order_is_by_name() {
        let mut migrations = vec![
            Migration::new("002_x.cql", ""),
            Migration::new("001_y.cql", ""),
        ];
        let order = by_name();
        migrations.sort_by(|a, b| order(a, b));
        let names: Vec<_> = migrations.iter().map(Migration::name).collect();
        assert_eq!(names, ["001_y.cql", "002_x.cql"]);
    }
}
