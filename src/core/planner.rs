//! SD-004: Plan assembly (manifest + arguments + base path → immutable Plan).
//!
//! Compilation fails fast: the first missing parameter, bad reference or
//! invalid expression aborts the whole call and no partial plan is returned.

use super::compiler::compile_target;
use super::error::CompileError;
use super::resolver::resolve_parameters;
use super::types::{Deployment, Plan, PlanTarget};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Compile a deployment into a plan.
///
/// Relative file references resolve against `base_path` when given, else the
/// manifest's directory, else the current directory.
pub fn compile(
    deployment: &Deployment,
    args: &HashMap<String, String>,
    base_path: Option<&Path>,
) -> Result<Plan, CompileError> {
    let params = resolve_parameters(&deployment.parameters, args)?;
    check_references(deployment)?;

    let base: PathBuf = base_path
        .map(Path::to_path_buf)
        .or_else(|| deployment.source_dir())
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from("."));

    let mut plan = Plan::default();
    for (name, target) in &deployment.targets {
        let steps = compile_target(target, &params, &base)?;
        tracing::debug!(target_name = %name, steps = steps.len(), "compiled target");
        plan.targets.insert(
            name.clone(),
            PlanTarget {
                depends_on: target.depends_on.clone(),
                steps,
            },
        );
    }
    Ok(plan)
}

/// Every dependency must name a declared target other than itself.
fn check_references(deployment: &Deployment) -> Result<(), CompileError> {
    for (name, target) in &deployment.targets {
        for dep in &target.depends_on {
            if dep == name {
                return Err(CompileError::SelfDependency {
                    target: name.clone(),
                });
            }
            if !deployment.targets.contains_key(dep) {
                return Err(CompileError::UnknownTargetReference {
                    target: name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Content hash of a plan; identical inputs give identical fingerprints.
/// Secrets are redacted before hashing.
pub fn fingerprint(plan: &Plan) -> String {
    let bytes = serde_json::to_vec(plan).unwrap_or_default();
    format!("blake3:{}", blake3::hash(&bytes).to_hex())
}

/// One line per step, for human-readable plan output.
pub fn describe_plan(plan: &Plan, order: &[String]) -> Vec<String> {
    let mut lines = Vec::new();
    for name in order {
        let Some(target) = plan.get(name) else {
            continue;
        };
        if target.depends_on.is_empty() {
            lines.push(format!("{}:", name));
        } else {
            lines.push(format!("{} (after {}):", name, target.depends_on.join(", ")));
        }
        if target.steps.is_empty() {
            lines.push("  (no steps)".to_string());
        }
        for (i, step) in target.steps.iter().enumerate() {
            lines.push(format!("  {}. [{}] {}", i + 1, step.instance(), step.describe()));
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Step;

    const MANIFEST: &str = r#"
name: replication
parameters:
  adminPassword: {}
  publisher:
    default: SQL01
targets:
  A:
    instances:
      - name: "{{ params.publisher }}"
        operations:
          - type: distributor
            admin_password: "{{ params.adminPassword }}"
  B:
    depends_on: [A]
    instances:
      - name: "{{ params.publisher }}"
        operations:
          - type: database
            name: Sales
            scripts: [sql/schema.sql]
"#;

    fn deployment(yaml: &str) -> Deployment {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    fn args(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_sd004_missing_required_parameter() {
        let err = compile(&deployment(MANIFEST), &HashMap::new(), None).unwrap_err();
        assert_eq!(
            err,
            CompileError::MissingParameter {
                name: "adminPassword".to_string()
            }
        );
        assert_eq!(err.to_string(), "missing value for parameter 'adminPassword'");
    }

    #[test]
    fn test_sd004_plan_covers_every_target() {
        let d = deployment(MANIFEST);
        let plan = compile(&d, &args(&[("adminPassword", "x")]), None).unwrap();
        let keys: Vec<_> = plan.targets.keys().collect();
        assert_eq!(keys, vec!["A", "B"]);
        assert_eq!(plan.targets["B"].depends_on, vec!["A"]);
        assert_eq!(plan.step_count(), 2);
        assert_eq!(plan.targets["A"].steps[0].instance(), "SQL01");
    }

    #[test]
    fn test_sd004_deterministic() {
        let d = deployment(MANIFEST);
        let a = args(&[("adminPassword", "x"), ("publisher", "SQL09")]);
        let first = compile(&d, &a, Some(Path::new("/deploy"))).unwrap();
        let second = compile(&d, &a, Some(Path::new("/deploy"))).unwrap();
        assert_eq!(first, second);
        assert_eq!(fingerprint(&first), fingerprint(&second));
        assert!(fingerprint(&first).starts_with("blake3:"));
    }

    #[test]
    fn test_sd004_fingerprint_changes_with_arguments() {
        let d = deployment(MANIFEST);
        let one = compile(&d, &args(&[("adminPassword", "x")]), None).unwrap();
        let two = compile(
            &d,
            &args(&[("adminPassword", "x"), ("publisher", "SQL02")]),
            None,
        )
        .unwrap();
        assert_ne!(fingerprint(&one), fingerprint(&two));
    }

    #[test]
    fn test_sd004_base_path_precedence() {
        let mut d = deployment(MANIFEST);
        d.source_path = Some(PathBuf::from("/manifests/deploy.yaml"));
        let a = args(&[("adminPassword", "x")]);

        let script = |plan: &Plan| match &plan.targets["B"].steps[0] {
            Step::Database(s) => s.scripts[0].clone(),
            other => panic!("unexpected step: {:?}", other),
        };

        let from_manifest = compile(&d, &a, None).unwrap();
        assert_eq!(script(&from_manifest), PathBuf::from("/manifests/sql/schema.sql"));

        let overridden = compile(&d, &a, Some(Path::new("/override"))).unwrap();
        assert_eq!(script(&overridden), PathBuf::from("/override/sql/schema.sql"));

        d.source_path = None;
        let fallback = compile(&d, &a, None).unwrap();
        assert_eq!(script(&fallback), PathBuf::from("sql/schema.sql"));
    }

    #[test]
    fn test_sd004_unknown_dependency_fails_at_compile() {
        let d = deployment(
            r#"
targets:
  A:
    depends_on: [Ghost]
"#,
        );
        assert_eq!(
            compile(&d, &HashMap::new(), None).unwrap_err(),
            CompileError::UnknownTargetReference {
                target: "A".to_string(),
                dependency: "Ghost".to_string(),
            }
        );
    }

    #[test]
    fn test_sd004_self_dependency_rejected() {
        let d = deployment("targets:\n  A:\n    depends_on: [A]\n");
        assert_eq!(
            compile(&d, &HashMap::new(), None).unwrap_err(),
            CompileError::SelfDependency {
                target: "A".to_string()
            }
        );
    }

    #[test]
    fn test_sd004_bad_expression_aborts_whole_compile() {
        let d = deployment(
            r#"
targets:
  good:
    instances:
      - name: SQL01
        operations:
          - { type: login, name: app }
  bad:
    instances:
      - name: SQL01
        operations:
          - { type: login, name: "{{ params.nope }}" }
"#,
        );
        assert!(matches!(
            compile(&d, &HashMap::new(), None).unwrap_err(),
            CompileError::MissingExpressionParameter { .. }
        ));
    }

    #[test]
    fn test_sd004_expanded_values_not_rescanned() {
        let d = deployment(
            r#"
parameters:
  user: {}
targets:
  A:
    instances:
      - name: SQL01
        operations:
          - { type: login, name: "{{ params.user }}" }
"#,
        );
        let plan = compile(&d, &args(&[("user", "{{ params.other }}")]), None).unwrap();
        assert_eq!(plan.targets["A"].steps[0].describe(), "login {{ params.other }}");
    }

    #[test]
    fn test_sd004_describe_plan() {
        let d = deployment(MANIFEST);
        let plan = compile(&d, &args(&[("adminPassword", "x")]), None).unwrap();
        let lines = describe_plan(&plan, &["A".to_string(), "B".to_string()]);
        assert_eq!(lines[0], "A:");
        assert_eq!(lines[1], "  1. [SQL01] distributor distribution");
        assert_eq!(lines[2], "B (after A):");
        assert_eq!(lines[3], "  1. [SQL01] database Sales");
    }
}
