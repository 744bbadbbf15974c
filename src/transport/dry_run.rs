//! SD-012: Dry-run transport that records statements instead of running them.
//!
//! Queries return no rows, so every existence guard reports "absent" and the
//! recorded log shows the full set of statements a first run would issue.

use super::{mask_secrets, Connection, Connector, Row, TransportError};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// A statement that would have been sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub instance: String,
    pub database: Option<String>,
    pub sql: String,
}

/// Connector that logs instead of connecting.
#[derive(Debug, Clone, Default)]
pub struct DryRunConnector {
    log: Arc<Mutex<Vec<Statement>>>,
}

impl DryRunConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far, in issue order.
    pub fn statements(&self) -> Vec<Statement> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Connector for DryRunConnector {
    async fn connect(&self, instance: &str) -> Result<Box<dyn Connection>, TransportError> {
        Ok(Box::new(DryRunConnection {
            instance: instance.to_string(),
            database: None,
            log: Arc::clone(&self.log),
        }))
    }
}

struct DryRunConnection {
    instance: String,
    database: Option<String>,
    log: Arc<Mutex<Vec<Statement>>>,
}

impl DryRunConnection {
    fn record(&self, sql: &str) {
        tracing::info!(
            instance = %self.instance,
            database = self.database.as_deref().unwrap_or("master"),
            "[dry-run]\n{}",
            mask_secrets(sql)
        );
        if let Ok(mut log) = self.log.lock() {
            log.push(Statement {
                instance: self.instance.clone(),
                database: self.database.clone(),
                sql: sql.to_string(),
            });
        }
    }
}

#[async_trait]
impl Connection for DryRunConnection {
    fn instance(&self) -> &str {
        &self.instance
    }

    fn use_database(&mut self, database: &str) {
        self.database = Some(database.to_string());
    }

    async fn execute(&mut self, sql: &str) -> Result<(), TransportError> {
        self.record(sql);
        Ok(())
    }

    async fn query(&mut self, sql: &str) -> Result<Vec<Row>, TransportError> {
        self.record(sql);
        Ok(Vec::new())
    }
}
