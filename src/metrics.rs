#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
    KeyValue,
};
#[cfg(feature = "metrics")]
use std::time::Duration;

#[cfg(feature = "metrics")]
pub static METRICS: Lazy<HarbormasterMetrics> = Lazy::new(HarbormasterMetrics::init);

#[cfg(feature = "metrics")]
pub struct HarbormasterMetrics {
    pub migrations_applied: Counter<u64>,
    pub migrations_failed: Counter<u64>,
    pub lease_attempts: Counter<u64>,
    pub migration_duration: Histogram<f64>,
}

#[cfg(feature = "metrics")]
impl HarbormasterMetrics {
    pub fn init() -> Self {
        let meter = global::meter("harbormaster");

        let migrations_applied = meter.u64_counter("harbormaster_migrations_applied_total")
            .with_description("Migrations applied successfully").build();

        let migrations_failed = meter.u64_counter("harbormaster_migrations_failed_total")
            .with_description("Migrations that failed or were not applied").build();

        let lease_attempts = meter.u64_counter("harbormaster_lease_attempts_total")
            .with_description("Migration lease acquire attempts, by outcome").build();

        let migration_duration = meter.f64_histogram("harbormaster_migration_duration_seconds")
            .with_description("Execution time of successful migrations").build();

        Self {
            migrations_applied,
            migrations_failed,
            lease_attempts,
            migration_duration,
        }
    }

    pub fn record_applied(&self, elapsed: Duration) {
        self.migrations_applied.add(1, &[]);
        self.migration_duration.record(elapsed.as_secs_f64(), &[]);
    }

    pub fn record_failed(&self) {
        self.migrations_failed.add(1, &[]);
    }

    pub fn record_lease_attempt(&self, acquired: bool) {
        self.lease_attempts.add(1, &[KeyValue::new("acquired", acquired)]);
    }
}

/// Span helpers for migration runs
#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::Span;

    /// Span covering one `Migrator::execute` call
    pub fn run_span(keyspace: &str, owner: &str) -> Span {
        tracing::info_span!("harbormaster.migrate", keyspace = %keyspace, owner = %owner)
    }

    /// Span covering a single migration
    pub fn migration_span(name: &str) -> Span {
        tracing::info_span!("harbormaster.migration", migration = %name)
    }
}
