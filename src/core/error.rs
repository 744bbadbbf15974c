//! SD-006: Error taxonomy for compile and execute.
//!
//! Compile errors abort before anything runs. Execution errors are per target;
//! the aggregate error is the only partial outcome a run can produce.

use super::types::{ExecutionReport, TargetStatus};
use crate::transport::TransportError;
use thiserror::Error;

/// Anything that stops a plan from being built or a run from starting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("missing value for parameter '{name}'")]
    MissingParameter { name: String },

    #[error("expression '{template}' references unknown parameter '{name}'")]
    MissingExpressionParameter { template: String, name: String },

    #[error("malformed expression '{template}': {reason}")]
    MalformedExpression { template: String, reason: String },

    #[error("expression '{template}' expanded to '{value}', which is not a valid {expected}")]
    Conversion {
        template: String,
        value: String,
        expected: &'static str,
    },

    #[error("target '{target}' depends on unknown target '{dependency}'")]
    UnknownTargetReference { target: String, dependency: String },

    #[error("target '{target}' depends on itself")]
    SelfDependency { target: String },

    #[error("unknown target '{name}'")]
    UnknownTarget { name: String },

    #[error("dependency cycle detected involving: {}", .targets.join(", "))]
    DependencyCycle { targets: Vec<String> },
}

/// Failure of a single step, as seen from inside the step.
#[derive(Debug, Clone, Error)]
pub enum StepError {
    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("cannot read {path}: {message}")]
    Io { path: String, message: String },
}

impl StepError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// A step failure tagged with the target and instance it belongs to.
#[derive(Debug, Clone, Error)]
#[error("target '{target}' failed on instance '{instance}' at '{step}': {source}")]
pub struct ExecutionError {
    pub target: String,
    pub instance: String,
    pub step: String,
    #[source]
    pub source: StepError,
}

/// Final per-target report of a run in which not every target completed.
#[derive(Debug, Clone, Error)]
#[error("{}", summarize(.report))]
pub struct AggregateExecutionError {
    pub report: ExecutionReport,
}

fn summarize(report: &ExecutionReport) -> String {
    let failed = report.names_with(|s| matches!(s, TargetStatus::Failed { .. }));
    let skipped = report.names_with(|s| matches!(s, TargetStatus::Skipped { .. }));
    format!(
        "deployment failed: {} failed [{}], {} skipped [{}]",
        failed.len(),
        failed.join(", "),
        skipped.len(),
        skipped.join(", ")
    )
}

/// Error returned by the executor.
#[derive(Debug, Clone, Error)]
pub enum DeployError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Execution(#[from] AggregateExecutionError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SkipReason;
    use indexmap::IndexMap;
    use std::time::Duration;

    #[test]
    fn test_sd006_missing_parameter_names_it() {
        let e = CompileError::MissingParameter {
            name: "adminPassword".to_string(),
        };
        assert_eq!(e.to_string(), "missing value for parameter 'adminPassword'");
    }

    #[test]
    fn test_sd006_cycle_lists_members() {
        let e = CompileError::DependencyCycle {
            targets: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(e.to_string(), "dependency cycle detected involving: a, b");
    }

    #[test]
    fn test_sd006_execution_error_tags_target_and_instance() {
        let e = ExecutionError {
            target: "pub".to_string(),
            instance: "SQL01".to_string(),
            step: "publication SalesPub".to_string(),
            source: StepError::Cancelled,
        };
        let msg = e.to_string();
        assert!(msg.contains("'pub'"));
        assert!(msg.contains("'SQL01'"));
        assert!(msg.ends_with("cancelled"));
    }

    #[test]
    fn test_sd006_aggregate_summary() {
        let mut statuses = IndexMap::new();
        statuses.insert("a".to_string(), TargetStatus::Completed);
        statuses.insert(
            "b".to_string(),
            TargetStatus::Failed {
                error: ExecutionError {
                    target: "b".to_string(),
                    instance: "i".to_string(),
                    step: "s".to_string(),
                    source: StepError::Cancelled,
                },
            },
        );
        statuses.insert(
            "c".to_string(),
            TargetStatus::Skipped {
                reason: SkipReason::DependencyFailed {
                    dependency: "b".to_string(),
                },
            },
        );
        let err = AggregateExecutionError {
            report: ExecutionReport {
                statuses,
                duration: Duration::ZERO,
            },
        };
        assert_eq!(
            err.to_string(),
            "deployment failed: 1 failed [b], 1 skipped [c]"
        );
    }
}
