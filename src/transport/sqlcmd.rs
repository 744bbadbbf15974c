//! SD-011: sqlcmd transport.
//!
//! Uses the `sqlcmd` binary directly; there is no TDS implementation in-process.
//! Each batch is piped to stdin (not passed as `-Q`) to avoid argument
//! length limits and quoting issues; `-b` turns server errors into a
//! non-zero exit code and `-x` leaves `$(name)` text in batches alone.
//! Passwords travel in `SQLCMDPASSWORD`, never argv.

use super::{Connection, Connector, Row, TransportError};
use crate::config::SqlcmdSettings;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

const COLUMN_SEPARATOR: &str = "\t";

/// How to authenticate against an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    /// Windows / Kerberos integrated security (`-E`)
    Integrated,
    /// SQL authentication
    Sql { user: String, password: String },
}

/// Where and how to reach one named instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub server: String,
    pub auth: Auth,
    pub trust_server_certificate: bool,
}

impl Endpoint {
    /// An instance reached by its own name with integrated security.
    pub fn integrated(server: &str) -> Self {
        Self {
            server: server.to_string(),
            auth: Auth::Integrated,
            trust_server_certificate: false,
        }
    }
}

/// Connector that shells out to `sqlcmd`.
#[derive(Debug, Clone)]
pub struct SqlcmdConnector {
    settings: SqlcmdSettings,
    endpoints: IndexMap<String, Endpoint>,
}

impl SqlcmdConnector {
    pub fn new(settings: SqlcmdSettings, endpoints: IndexMap<String, Endpoint>) -> Self {
        Self {
            settings,
            endpoints,
        }
    }

    /// Endpoint for an instance; unconfigured instances are addressed by name.
    pub fn endpoint(&self, instance: &str) -> Endpoint {
        self.endpoints
            .get(instance)
            .cloned()
            .unwrap_or_else(|| Endpoint::integrated(instance))
    }
}

#[async_trait]
impl Connector for SqlcmdConnector {
    async fn connect(&self, instance: &str) -> Result<Box<dyn Connection>, TransportError> {
        let conn = SqlcmdConnection {
            instance: instance.to_string(),
            endpoint: self.endpoint(instance),
            settings: self.settings.clone(),
            database: None,
        };
        // Probe once so authentication failures surface at open, not mid-step.
        conn.run("SELECT 1")
            .await
            .map_err(|e| TransportError::Connect {
                instance: instance.to_string(),
                message: e.to_string(),
            })?;
        Ok(Box::new(conn))
    }
}

/// One logical connection; each batch is a separate `sqlcmd` invocation.
#[derive(Debug, Clone)]
pub struct SqlcmdConnection {
    instance: String,
    endpoint: Endpoint,
    settings: SqlcmdSettings,
    database: Option<String>,
}

impl SqlcmdConnection {
    /// Command-line arguments for one invocation.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-S".to_string(),
            self.endpoint.server.clone(),
            "-b".to_string(),
            "-x".to_string(),
            "-I".to_string(),
            "-h".to_string(),
            "-1".to_string(),
            "-W".to_string(),
            "-s".to_string(),
            COLUMN_SEPARATOR.to_string(),
            "-l".to_string(),
            self.settings.login_timeout.to_string(),
        ];
        if self.settings.query_timeout > 0 {
            args.push("-t".to_string());
            args.push(self.settings.query_timeout.to_string());
        }
        if let Some(ref db) = self.database {
            args.push("-d".to_string());
            args.push(db.clone());
        }
        match self.endpoint.auth {
            Auth::Integrated => args.push("-E".to_string()),
            Auth::Sql { ref user, .. } => {
                args.push("-U".to_string());
                args.push(user.clone());
            }
        }
        if self.endpoint.trust_server_certificate {
            args.push("-C".to_string());
        }
        args
    }

    async fn run(&self, script: &str) -> Result<String, TransportError> {
        let mut cmd = Command::new(&self.settings.program);
        cmd.args(self.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Auth::Sql { ref password, .. } = self.endpoint.auth {
            cmd.env("SQLCMDPASSWORD", password);
        }

        let child = cmd.spawn().map_err(|e| TransportError::Spawn {
            program: self.settings.program.clone(),
            message: e.to_string(),
        })?;

        let output = feed_and_wait(child, format!("{}\nGO\n", script))
            .await
            .map_err(|e| TransportError::Spawn {
                program: self.settings.program.clone(),
                message: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if output.status.success() {
            return Ok(stdout);
        }

        // sqlcmd reports server errors on stdout, client errors on stderr
        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        Err(TransportError::Command {
            instance: self.instance.clone(),
            exit_code: output.status.code().unwrap_or(-1),
            message,
        })
    }
}

/// Write `input` to the child's stdin while its output is being drained, so
/// neither side blocks on a full pipe.
async fn feed_and_wait(mut child: Child, input: String) -> std::io::Result<Output> {
    let writer = child.stdin.take().map(|mut stdin| {
        tokio::spawn(async move {
            stdin.write_all(input.as_bytes()).await?;
            stdin.shutdown().await
        })
    });
    let output = child.wait_with_output().await?;
    if let Some(writer) = writer {
        match writer.await {
            Ok(Ok(())) => {}
            // The child may exit without reading everything
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Ok(Err(e)) => return Err(e),
            Err(e) => return Err(std::io::Error::other(e)),
        }
    }
    Ok(output)
}

#[async_trait]
impl Connection for SqlcmdConnection {
    fn instance(&self) -> &str {
        &self.instance
    }

    fn use_database(&mut self, database: &str) {
        self.database = Some(database.to_string());
    }

    async fn execute(&mut self, sql: &str) -> Result<(), TransportError> {
        self.run(sql).await.map(|_| ())
    }

    async fn query(&mut self, sql: &str) -> Result<Vec<Row>, TransportError> {
        let stdout = self.run(&format!("SET NOCOUNT ON;\n{}", sql)).await?;
        Ok(parse_rows(&stdout))
    }
}

/// Split headerless, tab-separated sqlcmd output into rows.
pub fn parse_rows(stdout: &str) -> Vec<Row> {
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            l.split(COLUMN_SEPARATOR)
                .map(|c| c.trim().to_string())
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(auth: Auth) -> SqlcmdConnection {
        SqlcmdConnection {
            instance: "SQL01".to_string(),
            endpoint: Endpoint {
                server: "sql01.corp,1433".to_string(),
                auth,
                trust_server_certificate: false,
            },
            settings: SqlcmdSettings::default(),
            database: None,
        }
    }

    #[test]
    fn test_sd011_args_integrated() {
        let conn = connection(Auth::Integrated);
        let args = conn.args();
        assert_eq!(args[0], "-S");
        assert_eq!(args[1], "sql01.corp,1433");
        assert!(args.contains(&"-b".to_string()));
        assert!(args.contains(&"-x".to_string()));
        assert!(args.contains(&"-E".to_string()));
        assert!(!args.contains(&"-U".to_string()));
        assert!(!args.contains(&"-d".to_string()));
    }

    #[test]
    fn test_sd011_args_sql_auth_never_contains_password() {
        let mut conn = connection(Auth::Sql {
            user: "deploy".to_string(),
            password: "s3cret".to_string(),
        });
        conn.use_database("Sales");
        let args = conn.args();
        let u = args.iter().position(|a| a == "-U").unwrap();
        assert_eq!(args[u + 1], "deploy");
        let d = args.iter().position(|a| a == "-d").unwrap();
        assert_eq!(args[d + 1], "Sales");
        assert!(!args.iter().any(|a| a.contains("s3cret")));
        assert!(!args.contains(&"-E".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sd011_large_batch_does_not_block_on_output() {
        // cat echoes stdin, so output fills its pipe while input is still being written
        let input = "SELECT 1;\n".repeat(200_000);
        let child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let output = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            feed_and_wait(child, input.clone()),
        )
        .await
        .expect("child output was not drained while writing")
        .unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout.len(), input.len());
    }

    #[test]
    fn test_sd011_query_timeout_only_when_set() {
        let mut conn = connection(Auth::Integrated);
        assert!(!conn.args().contains(&"-t".to_string()));
        conn.settings.query_timeout = 30;
        assert!(conn.args().contains(&"-t".to_string()));
    }

    #[test]
    fn test_sd011_parse_rows() {
        let rows = parse_rows("Orders\t\nCustomers\tSQL02\n\n");
        assert_eq!(
            rows,
            vec![
                vec!["Orders".to_string(), String::new()],
                vec!["Customers".to_string(), "SQL02".to_string()],
            ]
        );
    }

    #[test]
    fn test_sd011_unconfigured_instance_uses_name() {
        let connector = SqlcmdConnector::new(SqlcmdSettings::default(), IndexMap::new());
        assert_eq!(connector.endpoint("SQL09"), Endpoint::integrated("SQL09"));
    }

    #[cfg(unix)]
    fn fake_sqlcmd(dir: &std::path::Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("sqlcmd");
        std::fs::write(&path, format!("#!/bin/sh\ncat >/dev/null\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sd011_query_through_fake_binary() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = connection(Auth::Integrated);
        conn.settings.program = fake_sqlcmd(dir.path(), "printf 'a\\tb\\nc\\td\\n'");
        let rows = conn.query("SELECT 1").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1], vec!["c".to_string(), "d".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sd011_nonzero_exit_is_command_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = connection(Auth::Integrated);
        conn.settings.program = fake_sqlcmd(dir.path(), "echo 'Msg 2714, Level 16' ; exit 1");
        let err = conn.execute("CREATE TABLE t (x int)").await.unwrap_err();
        match err {
            TransportError::Command {
                instance,
                exit_code,
                message,
            } => {
                assert_eq!(instance, "SQL01");
                assert_eq!(exit_code, 1);
                assert!(message.contains("Msg 2714"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sd011_missing_binary_is_spawn_error() {
        let mut conn = connection(Auth::Integrated);
        conn.settings.program = "/nonexistent/sqlcmd".to_string();
        let err = conn.execute("SELECT 1").await.unwrap_err();
        assert!(matches!(err, TransportError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_sd011_connect_failure_is_connect_error() {
        let settings = SqlcmdSettings {
            program: "/nonexistent/sqlcmd".to_string(),
            ..SqlcmdSettings::default()
        };
        let connector = SqlcmdConnector::new(settings, IndexMap::new());
        let err = connector.connect("SQL01").await.err().unwrap();
        assert!(matches!(err, TransportError::Connect { .. }));
    }
}
