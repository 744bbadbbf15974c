//! SD-002: Manifest loading and validation.
//!
//! Loads a deployment manifest from YAML and validates structural
//! constraints:
//! - Target and parameter names are well formed
//! - depends_on references exist and are not self-references
//! - Instance names are not blank
//! - Every expression is syntactically valid

use super::types::Deployment;
use regex::Regex;
use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

static TARGET_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.\-]*$").expect("valid regex"));

static PARAMETER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"));

/// Validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl ValidationError {
    fn new(message: String) -> Self {
        Self { message }
    }
}

/// Load a manifest file, remembering where it came from.
pub fn load_deployment_file(path: &Path) -> Result<Deployment, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    let mut deployment =
        load_deployment(&content).map_err(|e| format!("{}: {}", path.display(), e))?;
    deployment.source_path = Some(path.to_path_buf());
    Ok(deployment)
}

/// Load a manifest from a YAML string.
pub fn load_deployment(yaml: &str) -> Result<Deployment, String> {
    serde_yaml_ng::from_str(yaml).map_err(|e| format!("YAML parse error: {}", e))
}

/// Validate a loaded manifest. Returns a list of errors (empty = valid).
pub fn validate_deployment(deployment: &Deployment) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    for name in deployment.parameters.keys() {
        if !PARAMETER_NAME.is_match(name) {
            errors.push(ValidationError::new(format!(
                "parameter name '{}' must be an identifier",
                name
            )));
        }
    }

    for (name, target) in &deployment.targets {
        if !TARGET_NAME.is_match(name) {
            errors.push(ValidationError::new(format!(
                "target name '{}' contains invalid characters",
                name
            )));
        }

        for dep in &target.depends_on {
            if dep == name {
                errors.push(ValidationError::new(format!(
                    "target '{}' depends on itself",
                    name
                )));
            } else if !deployment.targets.contains_key(dep) {
                errors.push(ValidationError::new(format!(
                    "target '{}' depends on unknown target '{}'",
                    name, dep
                )));
            }
        }

        for (i, block) in target.instances.iter().enumerate() {
            if block.name.template().trim().is_empty() {
                errors.push(ValidationError::new(format!(
                    "target '{}' instance block {} has no name",
                    name,
                    i + 1
                )));
            }
            if let Err(e) = block.name.check_syntax() {
                errors.push(ValidationError::new(format!("target '{}': {}", name, e)));
            }
            for op in &block.operations {
                for expr in op.expressions() {
                    if let Err(e) = expr.check_syntax() {
                        errors.push(ValidationError::new(format!(
                            "target '{}' ({}): {}",
                            name, op, e
                        )));
                    }
                }
            }
        }
    }

    errors
}

/// `(target, parameter)` pairs where an expression references a parameter
/// the manifest does not declare. Such references only compile when the
/// value is supplied as an argument.
pub fn undeclared_references(deployment: &Deployment) -> Vec<(String, String)> {
    let mut found = Vec::new();
    for (name, target) in &deployment.targets {
        let exprs = target.instances.iter().flat_map(|b| {
            std::iter::once(&b.name).chain(b.operations.iter().flat_map(|op| op.expressions()))
        });
        for expr in exprs {
            for param in expr.references() {
                let pair = (name.clone(), param);
                if !deployment.parameters.contains_key(&pair.1) && !found.contains(&pair) {
                    found.push(pair);
                }
            }
        }
    }
    found
}

/// Targets that declare no operations. They compile to an empty step list
/// and complete immediately, which usually means a manifest mistake.
pub fn empty_targets(deployment: &Deployment) -> Vec<&str> {
    deployment
        .targets
        .iter()
        .filter(|(_, t)| t.operations().next().is_none())
        .map(|(name, _)| name.as_str())
        .collect()
}
