//! SD-010: Transport abstraction over connections to named instances.
//!
//! Steps never talk to a database directly. They ask the [`ExecuteContext`]
//! for a [`Session`], which checks the cancellation token before every
//! connection open and command round-trip.

pub mod dry_run;
pub mod sqlcmd;

use crate::core::error::StepError;
use async_trait::async_trait;
use regex::Regex;
use std::borrow::Cow;
use std::sync::{Arc, LazyLock};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

static PASSWORD_LITERAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(password\s*=\s*)N?'(?:[^']|'')*'").expect("valid regex")
});

/// SQL text fit for logs: password literals are replaced with `N'***'`.
pub fn mask_secrets(sql: &str) -> Cow<'_, str> {
    PASSWORD_LITERAL.replace_all(sql, "${1}N'***'")
}

/// One result row, columns as text.
pub type Row = Vec<String>;

/// Connection-level failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("cannot connect to instance '{instance}': {message}")]
    Connect { instance: String, message: String },

    #[error("command failed on '{instance}' (exit code {exit_code}): {message}")]
    Command {
        instance: String,
        exit_code: i32,
        message: String,
    },

    #[error("failed to run {program}: {message}")]
    Spawn { program: String, message: String },
}

/// An open, authenticated connection to one instance.
#[async_trait]
pub trait Connection: Send {
    fn instance(&self) -> &str;

    /// Switch the database subsequent commands run in.
    fn use_database(&mut self, database: &str);

    /// Run a batch that returns no rows.
    async fn execute(&mut self, sql: &str) -> Result<(), TransportError>;

    /// Run a batch and return its rows.
    async fn query(&mut self, sql: &str) -> Result<Vec<Row>, TransportError>;
}

/// Opens connections to instances by name.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, instance: &str) -> Result<Box<dyn Connection>, TransportError>;
}

/// Run-time facility handing out connections during execution.
#[derive(Clone)]
pub struct ExecuteContext {
    connector: Arc<dyn Connector>,
}

impl ExecuteContext {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    /// Open a session to `instance`, unless cancellation was requested.
    pub async fn open(
        &self,
        instance: &str,
        cancel: &CancellationToken,
    ) -> Result<Session, StepError> {
        if cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        let conn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StepError::Cancelled),
            conn = self.connector.connect(instance) => conn?,
        };
        tracing::debug!(instance, "connection opened");
        Ok(Session {
            conn,
            cancel: cancel.clone(),
        })
    }
}

impl std::fmt::Debug for ExecuteContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecuteContext").finish_non_exhaustive()
    }
}

/// A connection scoped to one step, observing the run's cancellation token.
pub struct Session {
    conn: Box<dyn Connection>,
    cancel: CancellationToken,
}

impl Session {
    pub fn instance(&self) -> &str {
        self.conn.instance()
    }

    pub fn use_database(&mut self, database: &str) {
        self.conn.use_database(database);
    }

    pub async fn execute(&mut self, sql: &str) -> Result<(), StepError> {
        if self.cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        tracing::trace!(instance = self.conn.instance(), sql = %mask_secrets(sql), "execute");
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StepError::Cancelled),
            r = self.conn.execute(sql) => r.map_err(StepError::from),
        }
    }

    pub async fn query(&mut self, sql: &str) -> Result<Vec<Row>, StepError> {
        if self.cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        tracing::trace!(instance = self.conn.instance(), sql = %mask_secrets(sql), "query");
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StepError::Cancelled),
            r = self.conn.query(sql) => r.map_err(StepError::from),
        }
    }
}
