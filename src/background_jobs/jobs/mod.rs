//! Maintenance jobs shipped with the scheduler binary.

pub mod expired_lease_prune;
pub mod lease_schema_migration;

pub use expired_lease_prune::ExpiredLeasePruneJob;
pub use lease_schema_migration::LeaseSchemaMigrationJob;
