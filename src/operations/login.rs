//! SD-020: Server login handler.

use super::{ident, literal, StepExecutor};
use crate::core::compiler::CompileContext;
use crate::core::error::{CompileError, StepError};
use crate::core::expression::Expression;
use crate::core::types::Step;
use crate::transport::ExecuteContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// `type: login`: a SQL or Windows login with optional server roles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginOp {
    pub name: Expression,

    /// SQL authentication password; a Windows login is created when absent
    #[serde(default)]
    pub password: Option<Expression>,

    #[serde(default)]
    pub default_database: Option<Expression>,

    #[serde(default)]
    pub server_roles: Vec<Expression>,
}

impl LoginOp {
    pub fn compile(&self, ctx: &CompileContext) -> Result<Vec<Step>, CompileError> {
        Ok(vec![Step::Login(LoginStep {
            instance: ctx.instance().to_string(),
            name: ctx.expand(&self.name)?,
            password: ctx.expand_opt(&self.password)?,
            default_database: ctx.expand_opt(&self.default_database)?,
            server_roles: ctx.expand_all(&self.server_roles)?,
        })])
    }

    pub fn expressions(&self) -> Vec<&Expression> {
        let mut out = vec![&self.name];
        out.extend(&self.password);
        out.extend(&self.default_database);
        out.extend(&self.server_roles);
        out
    }
}

/// Ensures a login exists and holds the listed server roles.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoginStep {
    pub instance: String,
    pub name: String,
    #[serde(serialize_with = "super::redact")]
    pub password: Option<String>,
    pub default_database: Option<String>,
    pub server_roles: Vec<String>,
}

impl LoginStep {
    /// Create the login unless a principal of that name exists.
    pub fn create_script(&self) -> String {
        let mut with = Vec::new();
        if let Some(ref password) = self.password {
            with.push(format!("PASSWORD = {}", literal(password)));
        }
        if let Some(ref db) = self.default_database {
            with.push(format!("DEFAULT_DATABASE = {}", ident(db)));
        }

        let mut create = format!("CREATE LOGIN {}", ident(&self.name));
        if self.password.is_none() {
            create.push_str(" FROM WINDOWS");
        }
        if !with.is_empty() {
            create.push_str(" WITH ");
            create.push_str(&with.join(", "));
        }

        format!(
            "IF NOT EXISTS (SELECT 1 FROM sys.server_principals WHERE name = {})\n    {}",
            literal(&self.name),
            create
        )
    }

    /// Add the login to one server role unless already a member.
    pub fn role_script(&self, role: &str) -> String {
        format!(
            "IF ISNULL(IS_SRVROLEMEMBER({}, {}), 0) = 0\n    ALTER SERVER ROLE {} ADD MEMBER {}",
            literal(role),
            literal(&self.name),
            ident(role),
            ident(&self.name)
        )
    }
}

#[async_trait]
impl StepExecutor for LoginStep {
    fn instance(&self) -> &str {
        &self.instance
    }

    fn describe(&self) -> String {
        format!("login {}", self.name)
    }

    async fn execute(
        &self,
        ctx: &ExecuteContext,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        let mut session = ctx.open(&self.instance, cancel).await?;
        session.execute(&self.create_script()).await?;
        for role in &self.server_roles {
            session.execute(&self.role_script(role)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::expression::Params;
    use crate::operations::testing::{assert_guarded, dry_run};
    use std::path::Path;

    fn step(password: Option<&str>, roles: &[&str]) -> LoginStep {
        LoginStep {
            instance: "SQL01".to_string(),
            name: "app_user".to_string(),
            password: password.map(String::from),
            default_database: Some("Sales".to_string()),
            server_roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    #[test]
    fn test_sd020_compile_expands_fields() {
        let op: LoginOp = serde_yaml_ng::from_str(
            "name: \"{{ params.user }}\"\npassword: \"{{ params.pw }}\"\nserver_roles: [dbcreator]\n",
        )
        .unwrap();
        let params: Params = [("user", "app"), ("pw", "secret")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let ctx = CompileContext::new(&params, Path::new("/")).with_instance("SQL01");
        let steps = op.compile(&ctx).unwrap();
        assert_eq!(
            steps,
            vec![Step::Login(LoginStep {
                instance: "SQL01".to_string(),
                name: "app".to_string(),
                password: Some("secret".to_string()),
                default_database: None,
                server_roles: vec!["dbcreator".to_string()],
            })]
        );
    }

    #[test]
    fn test_sd020_unknown_field_rejected() {
        let r: Result<LoginOp, _> = serde_yaml_ng::from_str("name: a\npasword: x\n");
        assert!(r.is_err());
    }

    #[test]
    fn test_sd020_sql_login_script() {
        let sql = step(Some("p'w"), &[]).create_script();
        assert_guarded(&sql, "CREATE LOGIN [app_user]");
        assert!(sql.contains("PASSWORD = N'p''w'"));
        assert!(sql.contains("DEFAULT_DATABASE = [Sales]"));
        assert!(!sql.contains("FROM WINDOWS"));
    }

    #[test]
    fn test_sd020_windows_login_script() {
        let sql = step(None, &[]).create_script();
        assert!(sql.contains("CREATE LOGIN [app_user] FROM WINDOWS WITH DEFAULT_DATABASE = [Sales]"));
    }

    #[test]
    fn test_sd020_password_redacted_in_plan() {
        let json = serde_json::to_string(&step(Some("hunter2"), &[])).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(json.contains("***"));
    }

    #[tokio::test]
    async fn test_sd020_execute_issues_create_then_roles() {
        let s = Step::Login(step(Some("pw"), &["sysadmin", "dbcreator"]));
        let log = dry_run(&s).await;
        assert_eq!(log.len(), 3);
        assert!(log.iter().all(|st| st.instance == "SQL01"));
        assert!(log[0].sql.contains("CREATE LOGIN"));
        assert_guarded(&log[1].sql, "ALTER SERVER ROLE [sysadmin]");
        assert_guarded(&log[2].sql, "ALTER SERVER ROLE [dbcreator]");
    }
}
