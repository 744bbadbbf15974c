//! sqldeploy: declarative SQL Server deployments.
//!
//! A YAML manifest names targets; each target lists SQL Server instances and
//! the operations to ensure on them (logins, databases, replication, backup,
//! restore, mirroring). Manifests compile into an immutable plan that is then
//! executed in dependency order, with independent targets running in parallel.

pub mod cli;
pub mod config;
pub mod core;
pub mod operations;
pub mod transport;
