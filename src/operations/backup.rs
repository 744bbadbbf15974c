//! SD-025: Full database backup handler.

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

/// `type: backup`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupOp {
    pub database_name: Expression,

    /// Backup file, relative to the manifest directory unless rooted
    pub path: Expression,

    #[serde(default)]
    pub copy_only: Option<Expression>,
}

impl BackupOp {
    pub fn compile(&self, ctx: &CompileContext) -> Result<Vec<Step>, CompileError> {
        Ok(vec![Step::Backup(BackupStep {
            instance: ctx.instance().to_string(),
            database_name: ctx.expand(&self.database_name)?,
            path: ctx.resolve_path(&ctx.expand(&self.path)?),
            copy_only: ctx.expand_typed_opt(&self.copy_only)?.unwrap_or(false),
        })])
    }

    pub fn expressions(&self) -> Vec<&Expression> {
        let mut out = vec![&self.database_name, &self.path];
        out.extend(&self.copy_only);
        out
    }
}

/// Takes a full backup to a file unless that file already holds one of
/// this database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupStep {
    pub instance: String,
    pub database_name: String,
    pub path: PathBuf,
    pub copy_only: bool,
}

impl BackupStep {
    pub fn backup_script(&self) -> String {
        let path = self.path.display().to_string();
        let mut options = vec!["INIT"];
        if self.copy_only {
            options.push("COPY_ONLY");
        }
        format!(
            "IF NOT EXISTS (SELECT 1 FROM msdb.dbo.backupset b \
             JOIN msdb.dbo.backupmediafamily m ON m.media_set_id = b.media_set_id \
             WHERE b.database_name = {} AND b.type = 'D' AND m.physical_device_name = {})\n    \
             BACKUP DATABASE {} TO DISK = {} WITH {}",
            literal(&self.database_name),
            literal(&path),
            ident(&self.database_name),
            literal(&path),
            options.join(", ")
        )
    }
}

#[async_trait]
impl StepExecutor for BackupStep {
    fn instance(&self) -> &str {
        &self.instance
    }

    fn describe(&self) -> String {
        format!("backup {} -> {}", self.database_name, self.path.display())
    }

    async fn execute(
        &self,
        ctx: &ExecuteContext,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        let mut session = ctx.open(&self.instance, cancel).await?;
        session.execute(&self.backup_script()).await
    }
}
