//! SD-027: Database mirroring handler.
//!
//! A mirroring descriptor in the principal's instance block compiles to four
//! steps: a mirroring endpoint on each side, then `SET PARTNER` on the mirror
//! (pointing at the principal), then on the principal. The mirror database is
//! expected to be restoring already, e.g. from a `restore` with
//! `recovery: false`.

use super::{ident, literal, StepExecutor};
use crate::core::compiler::CompileContext;
use crate::core::error::{CompileError, StepError};
use crate::core::expression::Expression;
use crate::core::types::Step;
use crate::transport::ExecuteContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Listener port used when none is given.
pub const DEFAULT_MIRRORING_PORT: u16 = 5022;

const ENDPOINT_NAME: &str = "Mirroring";

/// `type: mirroring`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MirroringOp {
    pub database_name: Expression,

    /// Instance hosting the mirror copy
    pub partner_instance: Expression,

    #[serde(default)]
    pub port: Option<Expression>,

    /// Overrides the derived `TCP://host:port` address of the mirror
    #[serde(default)]
    pub partner_address: Option<Expression>,

    /// Overrides the derived `TCP://host:port` address of the principal
    #[serde(default)]
    pub principal_address: Option<Expression>,
}

impl MirroringOp {
    pub fn compile(&self, ctx: &CompileContext) -> Result<Vec<Step>, CompileError> {
        let principal = ctx.instance().to_string();
        let partner = ctx.expand(&self.partner_instance)?;
        let database_name = ctx.expand(&self.database_name)?;
        let port = ctx
            .expand_typed_opt(&self.port)?
            .unwrap_or(DEFAULT_MIRRORING_PORT);
        let partner_address = ctx
            .expand_opt(&self.partner_address)?
            .unwrap_or_else(|| endpoint_address(&partner, port));
        let principal_address = ctx
            .expand_opt(&self.principal_address)?
            .unwrap_or_else(|| endpoint_address(&principal, port));

        Ok(vec![
            Step::MirroringEndpoint(MirroringEndpointStep {
                instance: principal.clone(),
                port,
            }),
            Step::MirroringEndpoint(MirroringEndpointStep {
                instance: partner.clone(),
                port,
            }),
            Step::MirroringPartner(MirroringPartnerStep {
                instance: partner,
                database_name: database_name.clone(),
                partner_address: principal_address,
            }),
            Step::MirroringPartner(MirroringPartnerStep {
                instance: principal,
                database_name,
                partner_address,
            }),
        ])
    }

    pub fn expressions(&self) -> Vec<&Expression> {
        let mut out = vec![&self.database_name, &self.partner_instance];
        out.extend(&self.port);
        out.extend(&self.partner_address);
        out.extend(&self.principal_address);
        out
    }
}

/// `TCP://host:port` for an instance name like `SQL01\MAIN` or `sql01,1433`.
pub fn endpoint_address(instance: &str, port: u16) -> String {
    let host = instance
        .split(['\\', ','])
        .next()
        .unwrap_or(instance)
        .trim();
    format!("TCP://{}:{}", host, port)
}

/// Ensures a database mirroring endpoint is listening.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MirroringEndpointStep {
    pub instance: String,
    pub port: u16,
}

impl MirroringEndpointStep {
    pub fn endpoint_script(&self) -> String {
        format!(
            "IF NOT EXISTS (SELECT 1 FROM sys.database_mirroring_endpoints)\n    \
             CREATE ENDPOINT {} STATE = STARTED AS TCP (LISTENER_PORT = {}) \
             FOR DATABASE_MIRRORING (ROLE = PARTNER)",
            ident(ENDPOINT_NAME),
            self.port
        )
    }
}

#[async_trait]
impl StepExecutor for MirroringEndpointStep {
    fn instance(&self) -> &str {
        &self.instance
    }

    fn describe(&self) -> String {
        format!("mirroring endpoint :{}", self.port)
    }

    async fn execute(
        &self,
        ctx: &ExecuteContext,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        let mut session = ctx.open(&self.instance, cancel).await?;
        session.execute(&self.endpoint_script()).await
    }
}

/// Points one side of a mirroring session at the other.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MirroringPartnerStep {
    pub instance: String,
    pub database_name: String,
    pub partner_address: String,
}

impl MirroringPartnerStep {
    pub fn partner_script(&self) -> String {
        format!(
            "IF EXISTS (SELECT 1 FROM sys.database_mirroring \
             WHERE database_id = DB_ID({}) AND mirroring_guid IS NULL)\n    \
             ALTER DATABASE {} SET PARTNER = {}",
            literal(&self.database_name),
            ident(&self.database_name),
            literal(&self.partner_address)
        )
    }
}

#[async_trait]
impl StepExecutor for MirroringPartnerStep {
    fn instance(&self) -> &str {
        &self.instance
    }

    fn describe(&self) -> String {
        format!(
            "mirroring partner {} -> {}",
            self.database_name, self.partner_address
        )
    }

    async fn execute(
        &self,
        ctx: &ExecuteContext,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        let mut session = ctx.open(&self.instance, cancel).await?;
        session.execute(&self.partner_script()).await
    }
}
