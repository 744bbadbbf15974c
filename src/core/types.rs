//! SD-001: Manifest, plan, and run-status types.
//!
//! Defines the YAML schema for deployments (parameters, targets, instance
//! blocks, operations), the compiled plan, and the per-target outcome of a
//! run. Manifest types derive Deserialize; maps are order-preserving so that
//! declaration order drives compile and scheduling order.

use super::expression::Expression;
use super::error::ExecutionError;
use crate::operations::{
    backup::{BackupOp, BackupStep},
    database::{DatabaseOp, DatabaseStep},
    distributor::{DistributorOp, DistributorStep},
    login::{LoginOp, LoginStep},
    mirroring::{MirroringEndpointStep, MirroringOp, MirroringPartnerStep},
    publication::{PublicationOp, PublicationStep},
    restore::{RestoreOp, RestoreStep},
    subscription::{PullSubscriptionStep, SubscriptionOp},
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Manifest
// ============================================================================

/// A loaded deployment manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Deployment {
    /// Human-readable deployment name
    #[serde(default)]
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Declared parameters (order-preserving)
    #[serde(default)]
    pub parameters: IndexMap<String, ParameterDecl>,

    /// Declared targets (order-preserving)
    #[serde(default)]
    pub targets: IndexMap<String, Target>,

    /// Where the manifest was read from, if it came from a file
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl Deployment {
    /// Directory of the manifest file, used to resolve relative file references.
    pub fn source_dir(&self) -> Option<PathBuf> {
        self.source_path
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
    }
}

/// A parameter declaration. A parameter without a default is required.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParameterDecl {
    #[serde(default)]
    pub default: Option<serde_yaml_ng::Value>,

    #[serde(default)]
    pub description: Option<String>,
}

impl ParameterDecl {
    /// The default rendered as text, if one is declared.
    pub fn default_text(&self) -> Option<String> {
        match self.default.as_ref()? {
            serde_yaml_ng::Value::Null => None,
            other => Some(yaml_value_to_string(other)),
        }
    }
}

/// A named deployable unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Target {
    /// Targets that must complete before this one starts
    #[serde(default, alias = "dependsOn")]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub description: Option<String>,

    /// Instance blocks, compiled in order
    #[serde(default)]
    pub instances: Vec<InstanceBlock>,
}

impl Target {
    /// All operations of the target, in manifest order.
    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.instances.iter().flat_map(|b| b.operations.iter())
    }
}

/// Operations bound to one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceBlock {
    /// Instance name (templatable)
    pub name: Expression,

    #[serde(default)]
    pub operations: Vec<Operation>,
}

/// An operation descriptor, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    Login(LoginOp),
    Database(DatabaseOp),
    Distributor(DistributorOp),
    Publication(PublicationOp),
    Subscription(SubscriptionOp),
    Backup(BackupOp),
    Restore(RestoreOp),
    Mirroring(MirroringOp),
}

impl Operation {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Login(_) => "login",
            Self::Database(_) => "database",
            Self::Distributor(_) => "distributor",
            Self::Publication(_) => "publication",
            Self::Subscription(_) => "subscription",
            Self::Backup(_) => "backup",
            Self::Restore(_) => "restore",
            Self::Mirroring(_) => "mirroring",
        }
    }

    /// Every expression the descriptor carries, for static checks.
    pub fn expressions(&self) -> Vec<&Expression> {
        match self {
            Self::Login(op) => op.expressions(),
            Self::Database(op) => op.expressions(),
            Self::Distributor(op) => op.expressions(),
            Self::Publication(op) => op.expressions(),
            Self::Subscription(op) => op.expressions(),
            Self::Backup(op) => op.expressions(),
            Self::Restore(op) => op.expressions(),
            Self::Mirroring(op) => op.expressions(),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

// ============================================================================
// Plan
// ============================================================================

/// A concrete unit of work bound to one instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Login(LoginStep),
    Database(DatabaseStep),
    Distributor(DistributorStep),
    Publication(PublicationStep),
    PullSubscription(PullSubscriptionStep),
    Backup(BackupStep),
    Restore(RestoreStep),
    MirroringEndpoint(MirroringEndpointStep),
    MirroringPartner(MirroringPartnerStep),
}

/// Compiled target: raw dependency names and its ordered steps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanTarget {
    pub depends_on: Vec<String>,
    pub steps: Vec<Step>,
}

/// Compiled deployment, keyed by target name in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Plan {
    pub targets: IndexMap<String, PlanTarget>,
}

impl Plan {
    pub fn get(&self, name: &str) -> Option<&PlanTarget> {
        self.targets.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.targets.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn step_count(&self) -> usize {
        self.targets.values().map(|t| t.steps.len()).sum()
    }
}

// ============================================================================
// Run status
// ============================================================================

/// Why a target never started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    DependencyFailed { dependency: String },
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DependencyFailed { dependency } => {
                write!(f, "dependency '{}' did not complete", dependency)
            }
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Lifecycle of a target within one run.
#[derive(Debug, Clone)]
pub enum TargetStatus {
    Pending,
    Running,
    Completed,
    Failed { error: ExecutionError },
    Skipped { reason: SkipReason },
}

impl TargetStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed { .. } => "FAILED",
            Self::Skipped { .. } => "SKIPPED",
        }
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Final status of every selected target, in execution order.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub statuses: IndexMap<String, TargetStatus>,
    pub duration: Duration,
}

impl ExecutionReport {
    pub fn status(&self, target: &str) -> Option<&TargetStatus> {
        self.statuses.get(target)
    }

    pub fn is_success(&self) -> bool {
        self.statuses
            .values()
            .all(|s| matches!(s, TargetStatus::Completed))
    }

    /// Names of targets whose status satisfies `pred`, in execution order.
    pub fn names_with(&self, pred: impl Fn(&TargetStatus) -> bool) -> Vec<&str> {
        self.statuses
            .iter()
            .filter(|(_, s)| pred(s))
            .map(|(n, _)| n.as_str())
            .collect()
    }

    pub fn completed(&self) -> Vec<&str> {
        self.names_with(|s| matches!(s, TargetStatus::Completed))
    }

    pub fn failed(&self) -> Vec<&str> {
        self.names_with(|s| matches!(s, TargetStatus::Failed { .. }))
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.names_with(|s| matches!(s, TargetStatus::Skipped { .. }))
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Convert a YAML scalar to the text an expression would see.
pub fn yaml_value_to_string(val: &serde_yaml_ng::Value) -> String {
    match val {
        serde_yaml_ng::Value::String(s) => s.clone(),
        serde_yaml_ng::Value::Number(n) => n.to_string(),
        serde_yaml_ng::Value::Bool(b) => b.to_string(),
        serde_yaml_ng::Value::Null => String::new(),
        other => format!("{:?}", other),
    }
}
