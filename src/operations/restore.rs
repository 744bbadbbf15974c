//! SD-026: Database restore handler.

use super::{ident, literal, StepExecutor};
use crate::core::compiler::CompileContext;
use crate::core::error::{CompileError, StepError};
use crate::core::expression::Expression;
use crate::core::types::Step;
use crate::transport::ExecuteContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// `type: restore`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestoreOp {
    pub database_name: Expression,

    /// Backup file, relative to the manifest directory unless rooted
    pub path: Expression,

    /// `false` leaves the database restoring (e.g. to become a mirror)
    #[serde(default)]
    pub recovery: Option<Expression>,
}

impl RestoreOp {
    pub fn compile(&self, ctx: &CompileContext) -> Result<Vec<Step>, CompileError> {
        Ok(vec![Step::Restore(RestoreStep {
            instance: ctx.instance().to_string(),
            database_name: ctx.expand(&self.database_name)?,
            path: ctx.resolve_path(&ctx.expand(&self.path)?),
            recovery: ctx.expand_typed_opt(&self.recovery)?.unwrap_or(true),
        })])
    }

    pub fn expressions(&self) -> Vec<&Expression> {
        let mut out = vec![&self.database_name, &self.path];
        out.extend(&self.recovery);
        out
    }
}

/// Restores a database from a backup file unless the database exists.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoreStep {
    pub instance: String,
    pub database_name: String,
    pub path: PathBuf,
    pub recovery: bool,
}

impl RestoreStep {
    pub fn restore_script(&self) -> String {
        format!(
            "IF DB_ID({}) IS NULL\n    RESTORE DATABASE {} FROM DISK = {} WITH {}",
            literal(&self.database_name),
            ident(&self.database_name),
            literal(&self.path.display().to_string()),
            if self.recovery { "RECOVERY" } else { "NORECOVERY" }
        )
    }
}

#[async_trait]
impl StepExecutor for RestoreStep {
    fn instance(&self) -> &str {
        &self.instance
    }

    fn describe(&self) -> String {
        format!("restore {} <- {}", self.database_name, self.path.display())
    }

    async fn execute(
        &self,
        ctx: &ExecuteContext,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        let mut session = ctx.open(&self.instance, cancel).await?;
        session.execute(&self.restore_script()).await
    }
}
