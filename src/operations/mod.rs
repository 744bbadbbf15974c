//! Operation handlers: compile descriptors into steps, execute steps as T-SQL.
//!
//! Each handler provides:
//! 1. A manifest descriptor (`*Op`) whose fields are expressions
//! 2. `compile`, expanding the descriptor into one or more concrete steps
//! 3. A step (`*Step`) that guards every mutating statement with an
//!    existence or state check, so a re-run is a no-op once applied

pub mod backup;
pub mod database;
pub mod distributor;
pub mod login;
pub mod mirroring;
pub mod publication;
pub mod restore;
pub mod subscription;

use crate::core::error::StepError;
use crate::core::types::Step;
use crate::transport::ExecuteContext;
use async_trait::async_trait;
use serde::Serializer;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Uniform execution surface every concrete step implements.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Instance the step is bound to.
    fn instance(&self) -> &str;

    /// Short human-readable summary, e.g. `login app_user`.
    fn describe(&self) -> String;

    async fn execute(
        &self,
        ctx: &ExecuteContext,
        cancel: &CancellationToken,
    ) -> Result<(), StepError>;
}

impl Step {
    fn executor(&self) -> &dyn StepExecutor {
        match self {
            Self::Login(s) => s,
            Self::Database(s) => s,
            Self::Distributor(s) => s,
            Self::Publication(s) => s,
            Self::PullSubscription(s) => s,
            Self::Backup(s) => s,
            Self::Restore(s) => s,
            Self::MirroringEndpoint(s) => s,
            Self::MirroringPartner(s) => s,
        }
    }

    pub fn instance(&self) -> &str {
        self.executor().instance()
    }

    pub fn describe(&self) -> String {
        self.executor().describe()
    }

    pub async fn execute(
        &self,
        ctx: &ExecuteContext,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        self.executor().execute(ctx, cancel).await
    }
}

/// Run a sub-operation whose failure must not fail the step.
///
/// Failures are logged as warnings and swallowed; cancellation still
/// propagates.
pub async fn best_effort<T>(
    instance: &str,
    what: &str,
    fut: impl Future<Output = Result<T, StepError>>,
) -> Result<Option<T>, StepError> {
    match fut.await {
        Ok(v) => Ok(Some(v)),
        Err(StepError::Cancelled) => Err(StepError::Cancelled),
        Err(e) => {
            tracing::warn!(instance, operation = what, error = %e, "best-effort operation failed");
            Ok(None)
        }
    }
}

/// Quote a T-SQL identifier: `[name]`.
pub fn ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// Quote a T-SQL unicode string literal: `N'text'`.
pub fn literal(text: &str) -> String {
    format!("N'{}'", text.replace('\'', "''"))
}

/// Serialize secrets as a fixed marker so plans can be printed and hashed.
pub(crate) fn redact<S: Serializer>(value: &Option<String>, s: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(_) => s.serialize_some("***"),
        None => s.serialize_none(),
    }
}

/// Append `, @name = value` for each present argument.
pub(crate) fn push_args(sql: &mut String, args: &[(&str, Option<String>)]) {
    for (name, value) in args {
        if let Some(v) = value {
            sql.push_str(&format!(", @{} = {}", name, v));
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::transport::dry_run::{DryRunConnector, Statement};
    use std::sync::Arc;

    /// Run a step against the dry-run connector and return what it sent.
    pub async fn dry_run(step: &Step) -> Vec<Statement> {
        let connector = Arc::new(DryRunConnector::new());
        let ctx = ExecuteContext::new(connector.clone());
        step.execute(&ctx, &CancellationToken::new()).await.unwrap();
        connector.statements()
    }

    /// Every mutating statement must sit behind an IF guard.
    pub fn assert_guarded(sql: &str, mutation: &str) {
        let at = sql
            .find(mutation)
            .unwrap_or_else(|| panic!("missing '{}' in:\n{}", mutation, sql));
        assert!(
            sql[..at].contains("IF "),
            "'{}' is not guarded in:\n{}",
            mutation,
            sql
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sd007_ident_escapes_brackets() {
        assert_eq!(ident("Sales"), "[Sales]");
        assert_eq!(ident("we]ird"), "[we]]ird]");
    }

    #[test]
    fn test_sd007_literal_escapes_quotes() {
        assert_eq!(literal("O'Brien"), "N'O''Brien'");
        assert_eq!(literal(""), "N''");
    }

    #[test]
    fn test_sd007_push_args_skips_absent() {
        let mut sql = "EXEC sp_x @a = 1".to_string();
        push_args(&mut sql, &[("b", Some("2".to_string())), ("c", None)]);
        assert_eq!(sql, "EXEC sp_x @a = 1, @b = 2");
    }

    #[tokio::test]
    async fn test_sd007_best_effort_swallows_failures() {
        let r = best_effort("SQL01", "start agent", async {
            Err::<(), _>(StepError::Io {
                path: "x".to_string(),
                message: "boom".to_string(),
            })
        })
        .await
        .unwrap();
        assert!(r.is_none());
    }

    #[tokio::test]
    async fn test_sd007_best_effort_keeps_cancellation() {
        let r = best_effort("SQL01", "start agent", async {
            Err::<(), _>(StepError::Cancelled)
        })
        .await;
        assert!(r.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_sd007_best_effort_passes_value() {
        let r = best_effort("SQL01", "lookup", async { Ok::<_, StepError>(7) })
            .await
            .unwrap();
        assert_eq!(r, Some(7));
    }
}
