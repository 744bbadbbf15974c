//! SD-021: Database handler (create, recovery model, owner, setup scripts).

use super::{ident, literal, StepExecutor};
use crate::core::compiler::CompileContext;
use crate::core::error::{CompileError, StepError};
use crate::core::expression::Expression;
use crate::core::types::Step;
use crate::transport::ExecuteContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

/// `type: database`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseOp {
    pub name: Expression,

    /// `full`, `bulk_logged` or `simple`
    #[serde(default)]
    pub recovery_model: Option<Expression>,

    #[serde(default)]
    pub owner: Option<Expression>,

    /// T-SQL files run inside the database after creation, relative to the
    /// manifest directory. They must be safe to re-run.
    #[serde(default)]
    pub scripts: Vec<Expression>,
}

impl DatabaseOp {
    pub fn compile(&self, ctx: &CompileContext) -> Result<Vec<Step>, CompileError> {
        let scripts = ctx
            .expand_all(&self.scripts)?
            .iter()
            .map(|s| ctx.resolve_path(s))
            .collect();
        Ok(vec![Step::Database(DatabaseStep {
            instance: ctx.instance().to_string(),
            name: ctx.expand(&self.name)?,
            recovery_model: ctx.expand_typed_opt(&self.recovery_model)?,
            owner: ctx.expand_opt(&self.owner)?,
            scripts,
        })])
    }

    pub fn expressions(&self) -> Vec<&Expression> {
        let mut out = vec![&self.name];
        out.extend(&self.recovery_model);
        out.extend(&self.owner);
        out.extend(&self.scripts);
        out
    }
}

/// Database recovery model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryModel {
    Full,
    BulkLogged,
    Simple,
}

impl RecoveryModel {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Full => "FULL",
            Self::BulkLogged => "BULK_LOGGED",
            Self::Simple => "SIMPLE",
        }
    }
}

impl FromStr for RecoveryModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "bulk_logged" | "bulk-logged" => Ok(Self::BulkLogged),
            "simple" => Ok(Self::Simple),
            other => Err(format!("unknown recovery model '{}'", other)),
        }
    }
}

impl fmt::Display for RecoveryModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Ensures a database exists with the requested settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseStep {
    pub instance: String,
    pub name: String,
    pub recovery_model: Option<RecoveryModel>,
    pub owner: Option<String>,
    pub scripts: Vec<PathBuf>,
}

impl DatabaseStep {
    pub fn create_script(&self) -> String {
        format!(
            "IF DB_ID({}) IS NULL\n    CREATE DATABASE {}",
            literal(&self.name),
            ident(&self.name)
        )
    }

    pub fn recovery_script(&self, model: RecoveryModel) -> String {
        format!(
            "IF EXISTS (SELECT 1 FROM sys.databases WHERE name = {} AND recovery_model_desc <> {})\n    \
             ALTER DATABASE {} SET RECOVERY {}",
            literal(&self.name),
            literal(model.as_sql()),
            ident(&self.name),
            model.as_sql()
        )
    }

    pub fn owner_script(&self, owner: &str) -> String {
        format!(
            "IF NOT EXISTS (SELECT 1 FROM sys.databases d \
             JOIN sys.server_principals p ON p.sid = d.owner_sid \
             WHERE d.name = {} AND p.name = {})\n    \
             ALTER AUTHORIZATION ON DATABASE::{} TO {}",
            literal(&self.name),
            literal(owner),
            ident(&self.name),
            ident(owner)
        )
    }

    async fn read_scripts(&self) -> Result<Vec<String>, StepError> {
        let mut out = Vec::with_capacity(self.scripts.len());
        for path in &self.scripts {
            let text = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| StepError::Io {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;
            out.push(text);
        }
        Ok(out)
    }
}

#[async_trait]
impl StepExecutor for DatabaseStep {
    fn instance(&self) -> &str {
        &self.instance
    }

    fn describe(&self) -> String {
        format!("database {}", self.name)
    }

    async fn execute(
        &self,
        ctx: &ExecuteContext,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        // Missing script files fail the step before anything is changed.
        let scripts = self.read_scripts().await?;

        let mut session = ctx.open(&self.instance, cancel).await?;
        session.execute(&self.create_script()).await?;
        if let Some(model) = self.recovery_model {
            session.execute(&self.recovery_script(model)).await?;
        }
        if let Some(ref owner) = self.owner {
            session.execute(&self.owner_script(owner)).await?;
        }

        if !scripts.is_empty() {
            session.use_database(&self.name);
            for (path, text) in self.scripts.iter().zip(&scripts) {
                tracing::debug!(
                    instance = %self.instance,
                    script = %path.display(),
                    "running setup script"
                );
                session.execute(text).await?;
            }
        }
        Ok(())
    }
}
