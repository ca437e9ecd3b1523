// query.rs — Review and Audit.
//
// Both queries run under the registry read lock, so any number of them can
// proceed concurrently against a stable snapshot. Per target:
//   1. pick the participating constraints (Review also runs matchers),
//   2. group them by the template's resolved driver,
//   3. query each driver once, in priority order,
//   4. decorate, collect and sort the results.
// Failures are recorded under the target key and never discard results
// already obtained for other targets or drivers.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::client::Client;
use crate::constraint::EnforcementAction;
use crate::context::Context;
use crate::error::{ClientError, DriverError, ErrorMap, Result};
use crate::registry::{ConstraintEntry, Registry};
use crate::result::{QueryOpts, Response, Responses, ViolationResult};
use crate::target::TargetHandler;

/// Prefix of the message carried by automatic rejections.
pub const MATCH_ERROR_PREFIX: &str = "unable to match constraints";

/// Constraints selected for one target, grouped by driver name, plus the
/// results produced without consulting any driver.
#[derive(Default)]
struct QueryPlan<'a> {
    by_driver: BTreeMap<&'a str, Vec<&'a ConstraintEntry>>,
    rejections: Vec<ViolationResult>,
}

impl<'a> QueryPlan<'a> {
    fn add(&mut self, driver: &'a str, entry: &'a ConstraintEntry) {
        self.by_driver.entry(driver).or_default().push(entry);
    }
}

impl Client {
    /// Evaluate a single object against every applicable constraint.
    ///
    /// Targets that do not claim the object are skipped. A matcher that
    /// cannot decide whether a constraint applies produces a `deny` result
    /// instead of silently dropping the constraint.
    pub fn review(&self, ctx: &Context, object: &Value, opts: &QueryOpts) -> Result<Responses> {
        let registry = self.read()?;
        let mut resp = Responses::new();

        for (name, handler) in &self.targets {
            let review = match handler.handle_review(object) {
                Ok(Some(review)) => review,
                Ok(None) => continue,
                Err(source) => {
                    tracing::debug!("target '{}' failed to shape review: {}", name, source);
                    resp.errors.insert(
                        name,
                        ClientError::Target {
                            target: name.clone(),
                            source,
                        },
                    );
                    continue;
                }
            };
            resp.handle(name);

            let plan = review_plan(&registry, name, &review, opts);
            let response = self.run_plan(
                ctx,
                handler.as_ref(),
                plan,
                Some(&review),
                opts,
                &mut resp.errors,
            );
            resp.by_target.insert(name.clone(), response);
        }

        tracing::debug!(
            "review finished: {} results, {} targets with errors",
            resp.results().len(),
            resp.errors.len()
        );
        Ok(resp)
    }

    /// Evaluate every ingested object against the current constraint set.
    /// Drivers receive no review payload; matching is theirs to do.
    pub fn audit(&self, ctx: &Context, opts: &QueryOpts) -> Result<Responses> {
        let registry = self.read()?;
        let mut resp = Responses::new();

        for (name, handler) in &self.targets {
            resp.handle(name);
            let mut plan = QueryPlan::default();
            for entry in registry.templates.values() {
                if entry.target_name() != name {
                    continue;
                }
                for cached in entry.constraints.values() {
                    if cached.enforcement.applies_to(&opts.enforcement_points) {
                        plan.add(&entry.driver, cached);
                    }
                }
            }
            let response = self.run_plan(ctx, handler.as_ref(), plan, None, opts, &mut resp.errors);
            resp.by_target.insert(name.clone(), response);
        }

        tracing::debug!(
            "audit finished: {} results, {} targets with errors",
            resp.results().len(),
            resp.errors.len()
        );
        Ok(resp)
    }

    /// Query each driver of `plan` in priority order and assemble the
    /// target's sorted response.
    fn run_plan(
        &self,
        ctx: &Context,
        handler: &dyn TargetHandler,
        plan: QueryPlan<'_>,
        review: Option<&Value>,
        opts: &QueryOpts,
        errors: &mut ErrorMap,
    ) -> Response {
        let target = handler.name();
        let mut response = Response::new(target);
        let mut traces = Vec::new();

        for driver in &self.drivers {
            let Some(entries) = plan.by_driver.get(driver.name()) else {
                continue;
            };
            let constraints: Vec<_> = entries.iter().map(|e| e.constraint.clone()).collect();
            let lookup: BTreeMap<(&str, &str), &ConstraintEntry> = entries
                .iter()
                .map(|e| ((e.constraint.kind.as_str(), e.constraint.name()), *e))
                .collect();

            let answer = match driver.query(ctx, target, &constraints, review, opts) {
                Ok(answer) => answer,
                Err(source) => {
                    tracing::warn!(
                        "driver '{}' failed on target '{}': {}",
                        driver.name(),
                        target,
                        source
                    );
                    errors.insert(
                        target,
                        ClientError::Driver {
                            driver: driver.name().to_string(),
                            source,
                        },
                    );
                    continue;
                }
            };

            for mut result in answer.results {
                let key = (result.constraint.kind.as_str(), result.constraint.name());
                let Some(cached) = lookup.get(&key).copied() else {
                    tracing::warn!(
                        "driver '{}' returned a result for unknown constraint {}",
                        driver.name(),
                        result.constraint
                    );
                    errors.insert(
                        target,
                        ClientError::Driver {
                            driver: driver.name().to_string(),
                            source: DriverError::Query(format!(
                                "result for unknown constraint {}",
                                result.constraint
                            )),
                        },
                    );
                    continue;
                };
                result.enforcement_action = cached.enforcement.action.to_string();
                result.scoped_enforcement_actions =
                    cached.enforcement.scoped_actions_for(&opts.enforcement_points);
                finish_result(handler, &mut result, review, errors);
                response.results.push(result);
            }

            if opts.stats_enabled {
                response.stats.extend(answer.stats);
            }
            if opts.tracing_enabled {
                if let Some(trace) = answer.trace {
                    traces.push(trace);
                }
            }
        }

        for mut rejection in plan.rejections {
            finish_result(handler, &mut rejection, review, errors);
            response.results.push(rejection);
        }

        if !traces.is_empty() {
            response.trace = Some(traces.join("\n"));
        }
        response.sort();
        response
    }
}

/// Constraints of `target` that take part in the requested points and
/// match `review`.
fn review_plan<'a>(
    registry: &'a Registry,
    target: &str,
    review: &Value,
    opts: &QueryOpts,
) -> QueryPlan<'a> {
    let mut plan = QueryPlan::default();
    for entry in registry.templates.values() {
        if entry.target_name() != target {
            continue;
        }
        for cached in entry.constraints.values() {
            if !cached.enforcement.applies_to(&opts.enforcement_points) {
                continue;
            }
            match cached.matcher.matches(review) {
                Ok(true) => plan.add(&entry.driver, cached),
                Ok(false) => {}
                Err(e) => {
                    tracing::debug!(
                        "rejecting review: constraint {} could not be matched: {}",
                        cached.constraint,
                        e
                    );
                    let mut rejection = ViolationResult::new(
                        &cached.constraint,
                        format!("{}: {}", MATCH_ERROR_PREFIX, e),
                    );
                    rejection.enforcement_action = EnforcementAction::Deny.to_string();
                    plan.rejections.push(rejection);
                }
            }
        }
    }
    plan
}

/// Attach target and review, then let the handler add its own details.
/// Audit results keep whatever review the driver attached.
fn finish_result(
    handler: &dyn TargetHandler,
    result: &mut ViolationResult,
    review: Option<&Value>,
    errors: &mut ErrorMap,
) {
    result.target = handler.name().to_string();
    if let Some(review) = review {
        result.review = Some(review.clone());
    }
    if let Err(source) = handler.handle_violation(result) {
        errors.insert(
            handler.name(),
            ClientError::Target {
                target: handler.name().to_string(),
                source,
            },
        );
    }
}
