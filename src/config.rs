//! SD-016: Tool configuration (`sqldeploy.toml`).
//!
//! Connection settings live outside the manifest so the same manifest can be
//! deployed to different environments. Everything is threaded explicitly into
//! the executor; nothing is read from process-wide state after startup.
//!
//! ```toml
//! [execution]
//! max_parallel = 4
//!
//! [sqlcmd]
//! program = "sqlcmd"
//! login_timeout = 15
//!
//! [instances.SQL01]
//! server = "sql01.corp.example,1433"
//! user = "deploy"
//! password_env = "SQL01_PASSWORD"
//! ```

use crate::core::executor::DEFAULT_MAX_PARALLEL;
use crate::transport::sqlcmd::{Auth, Endpoint, SqlcmdConnector};
use indexmap::IndexMap;
use serde::Deserialize;
use std::path::Path;

/// Root of `sqldeploy.toml`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub execution: ExecutionSettings,
    pub sqlcmd: SqlcmdSettings,
    pub instances: IndexMap<String, InstanceSettings>,
}

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Upper bound on targets running at once
    pub max_parallel: usize,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
        }
    }
}

/// How to invoke the `sqlcmd` client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SqlcmdSettings {
    pub program: String,
    /// Login timeout in seconds
    pub login_timeout: u32,
    /// Query timeout in seconds (0 = none)
    pub query_timeout: u32,
}

impl Default for SqlcmdSettings {
    fn default() -> Self {
        Self {
            program: "sqlcmd".to_string(),
            login_timeout: 15,
            query_timeout: 0,
        }
    }
}

/// Per-instance connection overrides.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct InstanceSettings {
    /// Server address passed to `-S` (defaults to the instance name)
    pub server: Option<String>,
    /// SQL login; integrated security when absent
    pub user: Option<String>,
    /// Environment variable holding the SQL login's password
    pub password_env: Option<String>,
    pub trust_server_certificate: bool,
}

/// Load a config file from disk.
pub fn load_config(path: &Path) -> Result<ToolConfig, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    parse_config(&content).map_err(|e| format!("{}: {}", path.display(), e))
}

/// Parse config from a TOML string.
pub fn parse_config(text: &str) -> Result<ToolConfig, String> {
    let config: ToolConfig =
        toml::from_str(text).map_err(|e| format!("TOML parse error: {}", e))?;
    if config.execution.max_parallel == 0 {
        return Err("execution.max_parallel must be at least 1".to_string());
    }
    Ok(config)
}

impl ToolConfig {
    /// Resolve per-instance endpoints. `lookup` reads secrets by variable name.
    pub fn endpoints(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<IndexMap<String, Endpoint>, String> {
        let mut endpoints = IndexMap::new();
        for (name, settings) in &self.instances {
            let auth = match settings.user {
                None => Auth::Integrated,
                Some(ref user) => {
                    let var = settings.password_env.as_deref().ok_or_else(|| {
                        format!("instance '{}' sets user but no password_env", name)
                    })?;
                    let password = lookup(var).ok_or_else(|| {
                        format!("instance '{}': environment variable {} is not set", name, var)
                    })?;
                    Auth::Sql {
                        user: user.clone(),
                        password,
                    }
                }
            };
            endpoints.insert(
                name.clone(),
                Endpoint {
                    server: settings.server.clone().unwrap_or_else(|| name.clone()),
                    auth,
                    trust_server_certificate: settings.trust_server_certificate,
                },
            );
        }
        Ok(endpoints)
    }

    /// Build the `sqlcmd` connector for this configuration.
    pub fn sqlcmd_connector(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<SqlcmdConnector, String> {
        Ok(SqlcmdConnector::new(
            self.sqlcmd.clone(),
            self.endpoints(lookup)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sd016_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.execution.max_parallel, DEFAULT_MAX_PARALLEL);
        assert_eq!(config.sqlcmd.program, "sqlcmd");
        assert_eq!(config.sqlcmd.login_timeout, 15);
        assert!(config.instances.is_empty());
    }

    #[test]
    fn test_sd016_full_config() {
        let config = parse_config(
            r#"
[execution]
max_parallel = 2

[sqlcmd]
program = "/opt/mssql-tools18/bin/sqlcmd"
query_timeout = 600

[instances.SQL01]
server = "sql01.corp,1433"
user = "deploy"
password_env = "SQL01_PASSWORD"
trust_server_certificate = true

[instances.SQL02]
"#,
        )
        .unwrap();
        assert_eq!(config.execution.max_parallel, 2);
        assert_eq!(config.sqlcmd.query_timeout, 600);
        assert_eq!(config.sqlcmd.login_timeout, 15);

        let endpoints = config
            .endpoints(|var| (var == "SQL01_PASSWORD").then(|| "pw".to_string()))
            .unwrap();
        assert_eq!(endpoints["SQL01"].server, "sql01.corp,1433");
        assert_eq!(
            endpoints["SQL01"].auth,
            Auth::Sql {
                user: "deploy".to_string(),
                password: "pw".to_string()
            }
        );
        assert!(endpoints["SQL01"].trust_server_certificate);
        assert_eq!(endpoints["SQL02"], Endpoint::integrated("SQL02"));
    }

    #[test]
    fn test_sd016_zero_parallel_rejected() {
        let err = parse_config("[execution]\nmax_parallel = 0\n").unwrap_err();
        assert!(err.contains("max_parallel"));
    }

    #[test]
    fn test_sd016_missing_password_variable() {
        let config = parse_config(
            "[instances.SQL01]\nuser = \"deploy\"\npassword_env = \"NOPE\"\n",
        )
        .unwrap();
        let err = config.endpoints(|_| None).unwrap_err();
        assert!(err.contains("NOPE"));
    }

    #[test]
    fn test_sd016_user_without_password_env() {
        let config = parse_config("[instances.SQL01]\nuser = \"deploy\"\n").unwrap();
        let err = config.endpoints(|_| None).unwrap_err();
        assert!(err.contains("password_env"));
    }

    #[test]
    fn test_sd016_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sqldeploy.toml");
        std::fs::write(&path, "[execution]\nmax_parallel = 8\n").unwrap();
        assert_eq!(load_config(&path).unwrap().execution.max_parallel, 8);
        assert!(load_config(&dir.path().join("missing.toml")).is_err());
    }
}
