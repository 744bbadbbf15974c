//! SD-023: Transactional publication handler.

use super::{best_effort, ident, literal, push_args, StepExecutor};
use crate::core::compiler::CompileContext;
use crate::core::error::{CompileError, StepError};
use crate::core::expression::Expression;
use crate::core::types::Step;
use crate::transport::ExecuteContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

const DEFAULT_SCHEMA: &str = "dbo";

/// `type: publication`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublicationOp {
    pub database_name: Expression,
    pub name: Expression,

    /// Remote distributor; the publisher distributes for itself when absent
    #[serde(default)]
    pub distributor_instance: Option<Expression>,

    #[serde(default)]
    pub description: Option<Expression>,

    /// Published tables, `table` or `schema.table`
    #[serde(default)]
    pub articles: Vec<Expression>,
}

impl PublicationOp {
    pub fn compile(&self, ctx: &CompileContext) -> Result<Vec<Step>, CompileError> {
        Ok(vec![Step::Publication(PublicationStep {
            instance: ctx.instance().to_string(),
            database_name: ctx.expand(&self.database_name)?,
            name: ctx.expand(&self.name)?,
            distributor_instance: ctx.expand_opt(&self.distributor_instance)?,
            description: ctx.expand_opt(&self.description)?,
            articles: ctx
                .expand_all(&self.articles)?
                .iter()
                .map(|a| Article::parse(a))
                .collect(),
        })])
    }

    pub fn expressions(&self) -> Vec<&Expression> {
        let mut out = vec![&self.database_name, &self.name];
        out.extend(&self.distributor_instance);
        out.extend(&self.description);
        out.extend(&self.articles);
        out
    }
}

/// A published table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Article {
    pub schema: String,
    pub table: String,
}

impl Article {
    /// Split `schema.table`; a bare name lives in `dbo`.
    pub fn parse(text: &str) -> Self {
        match text.split_once('.') {
            Some((schema, table)) => Self {
                schema: schema.trim().to_string(),
                table: table.trim().to_string(),
            },
            None => Self {
                schema: DEFAULT_SCHEMA.to_string(),
                table: text.trim().to_string(),
            },
        }
    }
}

/// Ensures a publication with its snapshot agent and articles exists.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublicationStep {
    pub instance: String,
    pub database_name: String,
    pub name: String,
    pub distributor_instance: Option<String>,
    pub description: Option<String>,
    pub articles: Vec<Article>,
}

impl PublicationStep {
    /// Register a remote distributor, if one is named.
    pub fn remote_distributor_script(&self) -> Option<String> {
        let distributor = self.distributor_instance.as_deref()?;
        if distributor.eq_ignore_ascii_case(&self.instance) {
            return None;
        }
        Some(format!(
            "IF NOT EXISTS (SELECT 1 FROM sys.servers WHERE is_distributor = 1)\n    \
             EXEC sp_adddistributor @distributor = {}",
            literal(distributor)
        ))
    }

    pub fn enable_publishing_script(&self) -> String {
        format!(
            "IF ISNULL(DATABASEPROPERTYEX({}, 'IsPublished'), 0) = 0\n    \
             EXEC sp_replicationdboption @dbname = {}, @optname = N'publish', @value = N'true'",
            literal(&self.database_name),
            literal(&self.database_name)
        )
    }

    pub fn add_publication_script(&self) -> String {
        let mut exec = format!(
            "EXEC sp_addpublication @publication = {}, @status = N'active', @allow_pull = N'true', @repl_freq = N'continuous'",
            literal(&self.name)
        );
        push_args(
            &mut exec,
            &[("description", self.description.as_deref().map(literal))],
        );
        format!(
            "IF NOT EXISTS (SELECT 1 FROM syspublications WHERE name = {})\n    {}",
            literal(&self.name),
            exec
        )
    }

    pub fn add_snapshot_agent_script(&self) -> String {
        format!(
            "IF EXISTS (SELECT 1 FROM syspublications WHERE name = {} AND snapshot_jobid IS NULL)\n    \
             EXEC sp_addpublication_snapshot @publication = {}",
            literal(&self.name),
            literal(&self.name)
        )
    }

    pub fn add_article_script(&self, article: &Article) -> String {
        format!(
            "IF NOT EXISTS (SELECT 1 FROM sysarticles a \
             JOIN syspublications p ON p.pubid = a.pubid \
             WHERE p.name = {} AND a.name = {})\n    \
             EXEC sp_addarticle @publication = {}, @article = {}, @source_owner = {}, @source_object = {}",
            literal(&self.name),
            literal(&article.table),
            literal(&self.name),
            literal(&article.table),
            literal(&article.schema),
            literal(&article.table)
        )
    }
}

#[async_trait]
impl StepExecutor for PublicationStep {
    fn instance(&self) -> &str {
        &self.instance
    }

    fn describe(&self) -> String {
        format!("publication {}.{}", self.database_name, self.name)
    }

    async fn execute(
        &self,
        ctx: &ExecuteContext,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        let mut session = ctx.open(&self.instance, cancel).await?;
        if let Some(sql) = self.remote_distributor_script() {
            session.execute(&sql).await?;
        }
        session.execute(&self.enable_publishing_script()).await?;

        session.use_database(&self.database_name);
        session.execute(&self.add_publication_script()).await?;
        session.execute(&self.add_snapshot_agent_script()).await?;
        for article in &self.articles {
            session.execute(&self.add_article_script(article)).await?;
        }

        best_effort(
            &self.instance,
            "start publication snapshot",
            session.execute(&format!(
                "EXEC sp_startpublication_snapshot @publication = {}",
                literal(&self.name)
            )),
        )
        .await?;
        tracing::debug!(
            instance = %self.instance,
            publication = %ident(&self.name),
            articles = self.articles.len(),
            "publication ensured"
        );
        Ok(())
    }
}
