//! SD-024: Pull subscription handler.
//!
//! Spans two instances: the subscription and its articles are registered at
//! the publisher, the pull subscription and its agent at the subscriber.

use super::{best_effort, literal, StepExecutor};
use crate::core::compiler::CompileContext;
use crate::core::error::{CompileError, StepError};
use crate::core::expression::Expression;
use crate::core::types::Step;
use crate::transport::{ExecuteContext, Row};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// `type: subscription` is bound to the subscriber instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubscriptionOp {
    /// Subscriber database
    pub database_name: Expression,
    pub publisher_instance: Expression,
    pub publisher_database_name: Expression,
    pub publication_name: Expression,
}

impl SubscriptionOp {
    pub fn compile(&self, ctx: &CompileContext) -> Result<Vec<Step>, CompileError> {
        Ok(vec![Step::PullSubscription(PullSubscriptionStep {
            instance: ctx.instance().to_string(),
            database_name: ctx.expand(&self.database_name)?,
            publisher_instance: ctx.expand(&self.publisher_instance)?,
            publisher_database_name: ctx.expand(&self.publisher_database_name)?,
            publication_name: ctx.expand(&self.publication_name)?,
        })])
    }

    pub fn expressions(&self) -> Vec<&Expression> {
        vec![
            &self.database_name,
            &self.publisher_instance,
            &self.publisher_database_name,
            &self.publication_name,
        ]
    }
}

/// Ensures a pull subscription to a publication is in place.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PullSubscriptionStep {
    pub instance: String,
    pub database_name: String,
    pub publisher_instance: String,
    pub publisher_database_name: String,
    pub publication_name: String,
}

impl PullSubscriptionStep {
    fn add_subscription_exec(&self, article: &str) -> String {
        format!(
            "EXEC sp_addsubscription @publication = {}, @subscriber = {}, @destination_db = {}, \
             @subscription_type = N'Pull', @sync_type = N'automatic', @article = {}, \
             @update_mode = N'read only', @subscriber_type = 0",
            literal(&self.publication_name),
            literal(&self.instance),
            literal(&self.database_name),
            literal(article)
        )
    }

    /// Publisher side: subscribe to all articles.
    pub fn add_subscription_script(&self) -> String {
        format!(
            "IF NOT EXISTS (SELECT 1 FROM syssubscriptions WHERE srvname = {} AND dest_db = {})\n    {}",
            literal(&self.instance),
            literal(&self.database_name),
            self.add_subscription_exec("all")
        )
    }

    /// Publisher side: every article with this subscriber's name, or an
    /// empty second column when the subscriber does not have it yet.
    pub fn articles_query(&self) -> String {
        format!(
            "SELECT DISTINCT a.name, COALESCE(u.srvname, N'')\n\
             FROM syspublications p\n\
             JOIN sysarticles a ON a.pubid = p.pubid\n\
             LEFT JOIN syssubscriptions u ON u.artid = a.artid AND u.srvname = {}\n\
             WHERE p.name = {}",
            literal(&self.instance),
            literal(&self.publication_name)
        )
    }

    /// Publisher side: add one article added after the subscription was made.
    pub fn add_article_script(&self, article: &str) -> String {
        format!(
            "IF NOT EXISTS (SELECT 1 FROM syssubscriptions u \
             JOIN sysarticles a ON a.artid = u.artid \
             WHERE u.srvname = {} AND a.name = {})\n    {}",
            literal(&self.instance),
            literal(article),
            self.add_subscription_exec(article)
        )
    }

    /// Subscriber side. `MSreplication_subscriptions` only exists once the
    /// database has a subscription, so it is checked through dynamic SQL.
    pub fn add_pull_subscription_script(&self) -> String {
        format!(
            "DECLARE @exists int = 0;\n\
             IF OBJECT_ID(N'dbo.MSreplication_subscriptions') IS NOT NULL\n    \
             EXEC sp_executesql N'SELECT @e = COUNT(*) FROM dbo.MSreplication_subscriptions \
             WHERE publisher = @p AND publisher_db = @d AND publication = @n', \
             N'@e int OUTPUT, @p sysname, @d sysname, @n sysname', \
             @e = @exists OUTPUT, @p = {pub}, @d = {db}, @n = {name};\n\
             IF @exists = 0\n    \
             EXEC sp_addpullsubscription @publisher = {pub}, @publisher_db = {db}, \
             @publication = {name}, @update_mode = N'read only'",
            pub = literal(&self.publisher_instance),
            db = literal(&self.publisher_database_name),
            name = literal(&self.publication_name)
        )
    }

    pub fn add_agent_script(&self) -> String {
        format!(
            "EXEC sp_addpullsubscription_agent @publisher = {}, @publisher_db = {}, \
             @publication = {}, @subscriber = {}, @subscriber_db = {}, @subscriber_security_mode = 1",
            literal(&self.publisher_instance),
            literal(&self.publisher_database_name),
            literal(&self.publication_name),
            literal(&self.instance),
            literal(&self.database_name)
        )
    }
}

/// Articles from [`PullSubscriptionStep::articles_query`] rows that the
/// subscriber is missing.
pub fn missing_articles(rows: &[Row]) -> Vec<&str> {
    rows.iter()
        .filter_map(|row| {
            let name = row.first().map(String::as_str).unwrap_or_default();
            let subscriber = row.get(1).map(String::as_str).unwrap_or_default();
            (!name.is_empty() && subscriber.is_empty()).then_some(name)
        })
        .collect()
}

#[async_trait]
impl StepExecutor for PullSubscriptionStep {
    fn instance(&self) -> &str {
        &self.instance
    }

    fn describe(&self) -> String {
        format!(
            "pull subscription {} <- {}.{}.{}",
            self.database_name,
            self.publisher_instance,
            self.publisher_database_name,
            self.publication_name
        )
    }

    async fn execute(
        &self,
        ctx: &ExecuteContext,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        let mut sub = ctx.open(&self.instance, cancel).await?;
        sub.use_database(&self.database_name);

        let mut publisher = ctx.open(&self.publisher_instance, cancel).await?;
        publisher.use_database(&self.publisher_database_name);

        publisher.execute(&self.add_subscription_script()).await?;
        let rows = publisher.query(&self.articles_query()).await?;
        for article in missing_articles(&rows) {
            tracing::info!(
                instance = %self.instance,
                publication = %self.publication_name,
                article,
                "adding article to subscription"
            );
            publisher.execute(&self.add_article_script(article)).await?;
        }

        sub.execute(&self.add_pull_subscription_script()).await?;

        best_effort(
            &self.instance,
            "add pull subscription agent",
            sub.execute(&self.add_agent_script()),
        )
        .await?;
        best_effort(
            &self.publisher_instance,
            "start publication snapshot",
            publisher.execute(&format!(
                "EXEC sp_startpublication_snapshot @publication = {}",
                literal(&self.publication_name)
            )),
        )
        .await?;
        Ok(())
    }
}
