//! SD-008: Dependency-ordered, failure-isolated plan execution.
//!
//! select → toposort → launch ready targets (bounded) → collect outcomes →
//! skip dependents of failures → report. Targets run concurrently when
//! independent; a target's own steps always run sequentially, in order.

use super::error::{AggregateExecutionError, DeployError, ExecutionError, StepError};
use super::resolver::{build_execution_order, select_targets};
use super::types::{ExecutionReport, Plan, SkipReason, TargetStatus};
use crate::transport::ExecuteContext;
use futures_util::stream::{FuturesUnordered, StreamExt};
use indexmap::IndexMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Targets running at once unless configured otherwise.
pub const DEFAULT_MAX_PARALLEL: usize = 4;

/// Runs a compiled plan against live (or dry-run) instances.
#[derive(Debug)]
pub struct Executor<'a> {
    plan: &'a Plan,
    ctx: ExecuteContext,
    max_parallel: usize,
}

impl<'a> Executor<'a> {
    pub fn new(plan: &'a Plan, ctx: ExecuteContext) -> Self {
        Self {
            plan,
            ctx,
            max_parallel: DEFAULT_MAX_PARALLEL,
        }
    }

    /// Set maximum parallel target executions (at least one).
    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = max.max(1);
        self
    }

    /// Execute `requested` targets and their upstream dependencies; all
    /// targets when `requested` is empty.
    ///
    /// A dependency cycle within the selection is reported before anything
    /// starts. Otherwise every selected target ends Completed, Failed or
    /// Skipped, and anything short of all Completed is an aggregate error.
    pub async fn execute(
        &self,
        requested: &[String],
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport, DeployError> {
        let start = Instant::now();
        let selected = select_targets(self.plan, requested)?;
        let order = build_execution_order(self.plan, &selected)?;
        tracing::info!(
            targets = order.len(),
            max_parallel = self.max_parallel,
            "execution started"
        );

        let mut statuses: IndexMap<String, TargetStatus> = order
            .iter()
            .map(|name| (name.clone(), TargetStatus::Pending))
            .collect();
        let mut in_flight = FuturesUnordered::new();
        let mut cancel_observed = false;

        loop {
            if !cancel_observed && cancel.is_cancelled() {
                cancel_observed = true;
                tracing::warn!("cancellation requested; no further targets will start");
                for (name, status) in statuses.iter_mut() {
                    if matches!(status, TargetStatus::Pending) {
                        tracing::warn!(target_name = %name, "target skipped (cancelled)");
                        *status = TargetStatus::Skipped {
                            reason: SkipReason::Cancelled,
                        };
                    }
                }
            }

            self.skip_dependents(&order, &mut statuses);

            if !cancel_observed {
                for name in &order {
                    if in_flight.len() >= self.max_parallel {
                        break;
                    }
                    if !self.is_ready(name, &statuses) {
                        continue;
                    }
                    statuses.insert(name.clone(), TargetStatus::Running);
                    in_flight.push(self.run_target(name.clone(), cancel));
                }
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                Some((name, result)) = in_flight.next() => {
                    let status = match result {
                        Ok(()) => TargetStatus::Completed,
                        Err(error) => TargetStatus::Failed { error },
                    };
                    statuses.insert(name, status);
                }
                _ = cancel.cancelled(), if !cancel_observed => {}
                else => break,
            }
        }

        let report = ExecutionReport {
            statuses,
            duration: start.elapsed(),
        };
        tracing::info!(
            completed = report.completed().len(),
            failed = report.failed().len(),
            skipped = report.skipped().len(),
            duration_ms = report.duration.as_millis() as u64,
            "execution finished"
        );
        if report.is_success() {
            Ok(report)
        } else {
            Err(AggregateExecutionError { report }.into())
        }
    }

    /// Pending and every dependency Completed.
    fn is_ready(&self, name: &str, statuses: &IndexMap<String, TargetStatus>) -> bool {
        if !matches!(statuses.get(name), Some(TargetStatus::Pending)) {
            return false;
        }
        self.plan.get(name).is_some_and(|t| {
            t.depends_on
                .iter()
                .all(|dep| matches!(statuses.get(dep), Some(TargetStatus::Completed)))
        })
    }

    /// Skip pending targets with a Failed or Skipped dependency. One pass in
    /// topological order reaches transitive dependents.
    fn skip_dependents(&self, order: &[String], statuses: &mut IndexMap<String, TargetStatus>) {
        for name in order {
            if !matches!(statuses.get(name), Some(TargetStatus::Pending)) {
                continue;
            }
            let Some(target) = self.plan.get(name) else {
                continue;
            };
            let blocked = target.depends_on.iter().find(|dep| {
                matches!(
                    statuses.get(dep.as_str()),
                    Some(TargetStatus::Failed { .. } | TargetStatus::Skipped { .. })
                )
            });
            if let Some(dep) = blocked {
                tracing::warn!(target_name = %name, dependency = %dep, "target skipped");
                let reason = SkipReason::DependencyFailed {
                    dependency: dep.clone(),
                };
                statuses.insert(name.clone(), TargetStatus::Skipped { reason });
            }
        }
    }

    /// Run one target's steps strictly in order, stopping at the first failure.
    async fn run_target(
        &self,
        name: String,
        cancel: &CancellationToken,
    ) -> (String, Result<(), ExecutionError>) {
        let Some(target) = self.plan.get(&name) else {
            return (name, Ok(()));
        };
        let start = Instant::now();
        tracing::info!(target_name = %name, steps = target.steps.len(), "target started");

        for step in &target.steps {
            let description = step.describe();
            tracing::info!(
                target_name = %name,
                instance = step.instance(),
                step = %description,
                "step started"
            );
            let result = if cancel.is_cancelled() {
                Err(StepError::Cancelled)
            } else {
                step.execute(&self.ctx, cancel).await
            };
            if let Err(source) = result {
                tracing::error!(
                    target_name = %name,
                    instance = step.instance(),
                    step = %description,
                    error = %source,
                    "step failed"
                );
                let error = ExecutionError {
                    target: name.clone(),
                    instance: step.instance().to_string(),
                    step: description,
                    source,
                };
                return (name, Err(error));
            }
        }

        tracing::info!(
            target_name = %name,
            duration_ms = start.elapsed().as_millis() as u64,
            "target completed"
        );
        (name, Ok(()))
    }
}
