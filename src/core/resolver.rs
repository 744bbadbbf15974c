//! SD-009: Parameter resolution, target selection, and execution order.
//!
//! Merges supplied arguments with declared defaults, computes the upstream
//! dependency closure of requested targets, and orders the selection using
//! Kahn's algorithm with deterministic (declaration-order) tie-breaking.

use super::error::CompileError;
use super::expression::Params;
use super::types::{ParameterDecl, Plan};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet, VecDeque};

/// Merge supplied arguments with declared defaults.
///
/// Supplied values win; undeclared arguments pass through unchanged. The
/// first declared parameter left without a value is reported.
pub fn resolve_parameters(
    declared: &IndexMap<String, ParameterDecl>,
    supplied: &HashMap<String, String>,
) -> Result<Params, CompileError> {
    let mut resolved: Params = supplied.clone();
    for (name, decl) in declared {
        if resolved.contains_key(name) {
            continue;
        }
        let value = decl
            .default_text()
            .ok_or_else(|| CompileError::MissingParameter { name: name.clone() })?;
        resolved.insert(name.clone(), value);
    }
    Ok(resolved)
}

/// Requested targets plus everything they transitively depend on, in plan
/// declaration order. An empty request selects every target.
pub fn select_targets(plan: &Plan, requested: &[String]) -> Result<Vec<String>, CompileError> {
    if requested.is_empty() {
        return Ok(plan.targets.keys().cloned().collect());
    }

    let mut selected: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&str> = Vec::new();
    for name in requested {
        if !plan.contains(name) {
            return Err(CompileError::UnknownTarget { name: name.clone() });
        }
        stack.push(name);
    }

    while let Some(name) = stack.pop() {
        if !selected.insert(name) {
            continue;
        }
        let Some(target) = plan.get(name) else {
            continue;
        };
        for dep in &target.depends_on {
            if !plan.contains(dep) {
                return Err(CompileError::UnknownTargetReference {
                    target: name.to_string(),
                    dependency: dep.clone(),
                });
            }
            stack.push(dep);
        }
    }

    Ok(plan
        .targets
        .keys()
        .filter(|k| selected.contains(k.as_str()))
        .cloned()
        .collect())
}

/// Topological order of `selected`, which must be closed under dependencies.
/// Ties are broken by declaration order.
pub fn build_execution_order(
    plan: &Plan,
    selected: &[String],
) -> Result<Vec<String>, CompileError> {
    let position = |name: &str| plan.targets.get_index_of(name).unwrap_or(usize::MAX);
    let members: HashSet<&str> = selected.iter().map(String::as_str).collect();
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();

    // Initialize
    for &name in &members {
        in_degree.insert(name, 0);
        adjacency.insert(name, Vec::new());
    }

    // Build edges from depends_on, restricted to the selection
    for &name in &members {
        let Some(target) = plan.get(name) else {
            return Err(CompileError::UnknownTarget {
                name: name.to_string(),
            });
        };
        for dep in &target.depends_on {
            let Some(neighbors) = adjacency.get_mut(dep.as_str()) else {
                continue;
            };
            neighbors.push(name);
            *in_degree.entry(name).or_default() += 1;
        }
    }

    // Kahn's algorithm with declaration-order tie-breaking
    let mut queue: VecDeque<&str> = VecDeque::new();
    let mut zero_degree: Vec<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(name, _)| *name)
        .collect();
    zero_degree.sort_by_key(|n| position(*n));
    queue.extend(zero_degree);

    let mut order: Vec<String> = Vec::with_capacity(members.len());
    while let Some(current) = queue.pop_front() {
        order.push(current.to_string());

        let mut next_ready: Vec<&str> = Vec::new();
        if let Some(neighbors) = adjacency.get(current) {
            for neighbor in neighbors {
                if let Some(degree) = in_degree.get_mut(neighbor) {
                    *degree -= 1;
                    if *degree == 0 {
                        next_ready.push(*neighbor);
                    }
                }
            }
        }
        next_ready.sort_by_key(|n| position(*n));
        queue.extend(next_ready);
    }

    if order.len() != members.len() {
        let ordered: HashSet<&str> = order.iter().map(String::as_str).collect();
        let remaining: HashSet<&str> = members.difference(&ordered).copied().collect();
        let mut targets: Vec<String> = cycle_members(&remaining, &adjacency)
            .into_iter()
            .map(String::from)
            .collect();
        targets.sort_by_key(|n| position(n.as_str()));
        return Err(CompileError::DependencyCycle { targets });
    }

    Ok(order)
}

/// Unordered targets that lie on a cycle, i.e. can reach themselves through
/// other unordered targets. Targets merely downstream of (or between)
/// cycles are left out.
fn cycle_members<'a>(
    remaining: &HashSet<&'a str>,
    adjacency: &HashMap<&str, Vec<&'a str>>,
) -> Vec<&'a str> {
    remaining
        .iter()
        .copied()
        .filter(|&start| {
            let mut seen: HashSet<&str> = HashSet::new();
            let mut stack: Vec<&str> = vec![start];
            while let Some(node) = stack.pop() {
                for &next in adjacency.get(node).into_iter().flatten() {
                    if next == start {
                        return true;
                    }
                    if remaining.contains(next) && seen.insert(next) {
                        stack.push(next);
                    }
                }
            }
            false
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::PlanTarget;

    fn plan(targets: &[(&str, &[&str])]) -> Plan {
        Plan {
            targets: targets
                .iter()
                .map(|(name, deps)| {
                    (
                        name.to_string(),
                        PlanTarget {
                            depends_on: deps.iter().map(|d| d.to_string()).collect(),
                            steps: vec![],
                        },
                    )
                })
                .collect(),
        }
    }

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn declared(yaml: &str) -> IndexMap<String, ParameterDecl> {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    #[test]
    fn test_sd009_defaults_fill_gaps() {
        let decl = declared("a: {default: x}\nb: {default: 5}\n");
        let supplied: HashMap<String, String> = [("a".to_string(), "over".to_string())].into();
        let params = resolve_parameters(&decl, &supplied).unwrap();
        assert_eq!(params["a"], "over");
        assert_eq!(params["b"], "5");
    }

    #[test]
    fn test_sd009_missing_required_named() {
        let decl = declared("adminPassword: {}\nother: {default: y}\n");
        let err = resolve_parameters(&decl, &HashMap::new()).unwrap_err();
        assert_eq!(
            err,
            CompileError::MissingParameter {
                name: "adminPassword".to_string()
            }
        );
    }

    #[test]
    fn test_sd009_null_default_is_required() {
        let decl = declared("p: {default: ~}\n");
        assert!(resolve_parameters(&decl, &HashMap::new()).is_err());
    }

    #[test]
    fn test_sd009_undeclared_arguments_pass_through() {
        let supplied: HashMap<String, String> = [("extra".to_string(), "1".to_string())].into();
        let params = resolve_parameters(&IndexMap::new(), &supplied).unwrap();
        assert_eq!(params["extra"], "1");
    }

    #[test]
    fn test_sd009_topo_linear() {
        let p = plan(&[("c", &["b"]), ("b", &["a"]), ("a", &[])]);
        let order = build_execution_order(&p, &names(&["c", "b", "a"])).unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_sd009_topo_parallel_declaration_order() {
        let p = plan(&[("beta", &[]), ("alpha", &[])]);
        let order = build_execution_order(&p, &names(&["beta", "alpha"])).unwrap();
        // Declaration order, not alphabetical
        assert_eq!(order, vec!["beta", "alpha"]);
    }

    #[test]
    fn test_sd009_topo_diamond() {
        let p = plan(&[
            ("top", &[]),
            ("right", &["top"]),
            ("left", &["top"]),
            ("bottom", &["left", "right"]),
        ]);
        let all = select_targets(&p, &[]).unwrap();
        let order = build_execution_order(&p, &all).unwrap();
        assert_eq!(order, vec!["top", "right", "left", "bottom"]);
    }

    #[test]
    fn test_sd009_topo_cycle_names_members_only() {
        let p = plan(&[("a", &["b"]), ("b", &["a"]), ("c", &["a"]), ("d", &[])]);
        let all = select_targets(&p, &[]).unwrap();
        let err = build_execution_order(&p, &all).unwrap_err();
        assert_eq!(
            err,
            CompileError::DependencyCycle {
                targets: names(&["a", "b"])
            }
        );
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_sd009_target_between_cycles_not_reported() {
        // a <-> b feeds c, which feeds d <-> e
        let p = plan(&[
            ("a", &["b"]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["c", "e"]),
            ("e", &["d"]),
        ]);
        let all = select_targets(&p, &[]).unwrap();
        assert_eq!(
            build_execution_order(&p, &all).unwrap_err(),
            CompileError::DependencyCycle {
                targets: names(&["a", "b", "d", "e"])
            }
        );
    }

    #[test]
    fn test_sd009_self_loop_is_cycle() {
        let p = plan(&[("a", &["a"])]);
        let err = build_execution_order(&p, &names(&["a"])).unwrap_err();
        assert!(matches!(err, CompileError::DependencyCycle { .. }));
    }

    #[test]
    fn test_sd009_cycle_outside_selection_ignored() {
        let p = plan(&[("a", &[]), ("x", &["y"]), ("y", &["x"])]);
        let selected = select_targets(&p, &names(&["a"])).unwrap();
        assert_eq!(build_execution_order(&p, &selected).unwrap(), vec!["a"]);
    }

    #[test]
    fn test_sd009_select_upstream_closure() {
        let p = plan(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["b"]),
            ("d", &["a"]),
            ("e", &[]),
        ]);
        assert_eq!(
            select_targets(&p, &names(&["c"])).unwrap(),
            names(&["a", "b", "c"])
        );
        // Downstream dependents are never pulled in
        assert_eq!(select_targets(&p, &names(&["a"])).unwrap(), names(&["a"]));
        assert_eq!(
            select_targets(&p, &names(&["d", "e"])).unwrap(),
            names(&["a", "d", "e"])
        );
    }

    #[test]
    fn test_sd009_select_all_when_empty() {
        let p = plan(&[("x", &[]), ("y", &["x"])]);
        assert_eq!(select_targets(&p, &[]).unwrap(), names(&["x", "y"]));
    }

    #[test]
    fn test_sd009_select_unknown_target() {
        let p = plan(&[("x", &[])]);
        assert_eq!(
            select_targets(&p, &names(&["nope"])).unwrap_err(),
            CompileError::UnknownTarget {
                name: "nope".to_string()
            }
        );
    }
}
