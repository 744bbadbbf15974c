//! SD-022: Replication distributor handler.
//!
//! Configures the instance as its own distributor: registers the
//! distributor, creates the distribution database, and registers the local
//! server as a publisher using that distributor.

use super::{best_effort, literal, push_args, StepExecutor};
use crate::core::compiler::CompileContext;
use crate::core::error::{CompileError, StepError};
use crate::core::expression::Expression;
use crate::core::types::Step;
use crate::transport::ExecuteContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Distribution database name used when none is given.
pub const DEFAULT_DISTRIBUTION_DATABASE: &str = "distribution";

/// `type: distributor`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DistributorOp {
    #[serde(default)]
    pub database_name: Option<Expression>,

    #[serde(default)]
    pub admin_password: Option<Expression>,

    /// Hours
    #[serde(default)]
    pub min_retention: Option<Expression>,

    /// Hours
    #[serde(default)]
    pub max_retention: Option<Expression>,

    /// Hours
    #[serde(default)]
    pub history_retention: Option<Expression>,

    #[serde(default)]
    pub snapshot_path: Option<Expression>,
}

impl DistributorOp {
    pub fn compile(&self, ctx: &CompileContext) -> Result<Vec<Step>, CompileError> {
        Ok(vec![Step::Distributor(DistributorStep {
            instance: ctx.instance().to_string(),
            database_name: ctx.expand_opt(&self.database_name)?,
            admin_password: ctx.expand_opt(&self.admin_password)?,
            min_retention: ctx.expand_typed_opt(&self.min_retention)?,
            max_retention: ctx.expand_typed_opt(&self.max_retention)?,
            history_retention: ctx.expand_typed_opt(&self.history_retention)?,
            snapshot_path: ctx.expand_opt(&self.snapshot_path)?,
        })])
    }

    pub fn expressions(&self) -> Vec<&Expression> {
        [
            &self.database_name,
            &self.admin_password,
            &self.min_retention,
            &self.max_retention,
            &self.history_retention,
            &self.snapshot_path,
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// Ensures the instance is a distributor and a publisher on itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistributorStep {
    pub instance: String,
    pub database_name: Option<String>,
    #[serde(serialize_with = "super::redact")]
    pub admin_password: Option<String>,
    pub min_retention: Option<i32>,
    pub max_retention: Option<i32>,
    pub history_retention: Option<i32>,
    pub snapshot_path: Option<String>,
}

impl DistributorStep {
    pub fn database(&self) -> &str {
        self.database_name
            .as_deref()
            .unwrap_or(DEFAULT_DISTRIBUTION_DATABASE)
    }

    pub fn add_distributor_script(&self) -> String {
        let mut exec = "EXEC sp_adddistributor @distributor = @server".to_string();
        push_args(
            &mut exec,
            &[("password", self.admin_password.as_deref().map(literal))],
        );
        format!(
            "DECLARE @server sysname = @@SERVERNAME;\n\
             IF NOT EXISTS (SELECT 1 FROM sys.servers WHERE is_distributor = 1)\n    {}",
            exec
        )
    }

    pub fn add_distribution_db_script(&self) -> String {
        let mut exec = format!(
            "EXEC sp_adddistributiondb @database = {}, @security_mode = 1",
            literal(self.database())
        );
        push_args(
            &mut exec,
            &[
                ("min_distretention", self.min_retention.map(|v| v.to_string())),
                ("max_distretention", self.max_retention.map(|v| v.to_string())),
                ("history_retention", self.history_retention.map(|v| v.to_string())),
            ],
        );
        format!("IF DB_ID({}) IS NULL\n    {}", literal(self.database()), exec)
    }

    pub fn add_publisher_script(&self) -> String {
        let mut exec = format!(
            "EXEC sp_adddistpublisher @publisher = @server, @distribution_db = {}, @security_mode = 1",
            literal(self.database())
        );
        push_args(
            &mut exec,
            &[("working_directory", self.snapshot_path.as_deref().map(literal))],
        );
        format!(
            "DECLARE @server sysname = @@SERVERNAME;\n\
             IF NOT EXISTS (SELECT 1 FROM msdb.dbo.MSdistpublishers WHERE name = @server)\n    {}",
            exec
        )
    }
}

#[async_trait]
impl StepExecutor for DistributorStep {
    fn instance(&self) -> &str {
        &self.instance
    }

    fn describe(&self) -> String {
        format!("distributor {}", self.database())
    }

    async fn execute(
        &self,
        ctx: &ExecuteContext,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        let mut session = ctx.open(&self.instance, cancel).await?;

        // Replication jobs need the agent; it may already be running or be
        // managed outside SQL Server.
        best_effort(
            &self.instance,
            "start SQL Server Agent",
            session.execute("EXEC master.dbo.xp_servicecontrol N'START', N'SQLServerAGENT'"),
        )
        .await?;

        session.execute(&self.add_distributor_script()).await?;
        session.execute(&self.add_distribution_db_script()).await?;
        session.execute(&self.add_publisher_script()).await?;
        Ok(())
    }
}
