// fakes.rs — In-memory Driver and TargetHandler doubles.
//
// FakeDriver evaluates templates whose code source names a rule registered
// as a Rust closure, and records every call it receives into a log that can
// be shared between drivers so tests can assert cross-driver ordering.
// Given a target handler, its audit shapes stored objects through that
// target and applies each constraint's matcher, as a real driver does with
// the target's policy library.
// FakeTarget claims every JSON object and understands a tiny `spec.match`
// language: `{"name": "..."}` and `{"error": "..."}`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{json, Value};

use crate::constraint::Constraint;
use crate::context::Context;
use crate::driver::{Driver, DriverResult, QueryResponse, StoragePath};
use crate::error::{DriverError, TargetError};
use crate::result::{QueryOpts, Stat, StatsEntry, ViolationResult};
use crate::target::{DataCache, Matcher, TargetHandler, TargetResult};
use crate::template::ConstraintTemplate;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What a rule sees for one constraint.
///
/// During Review `review` is the target's review payload. During Audit the
/// rule runs once per stored data value: shaped by the target's
/// `handle_review` when the driver was given that target, otherwise wrapped
/// as `{"object": value}`.
pub struct RuleInput<'a> {
    pub review: &'a Value,
    pub parameters: &'a Value,
}

/// A policy rule: returns one message per violation.
pub type Rule = Arc<dyn Fn(&RuleInput<'_>) -> Vec<String> + Send + Sync>;

/// A call received by a FakeDriver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    AddTemplate(String),
    RemoveTemplate(String),
    /// "Kind/name"
    AddConstraint(String),
    RemoveConstraint(String),
    AddData(String, StoragePath),
    RemoveData(String, StoragePath),
    /// Target and number of constraints queried.
    Query(String, usize),
}

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FailOn {
    AddTemplate,
    RemoveTemplate,
    AddConstraint,
    RemoveConstraint,
    AddData,
    RemoveData,
    Query,
}

/// Call log shared between drivers: (driver name, call).
pub type CallLog = Arc<Mutex<Vec<(String, DriverCall)>>>;

#[derive(Default)]
struct DriverState {
    /// Constraint Kind → rule key.
    templates: BTreeMap<String, String>,
    /// (Kind, name) → constraint.
    constraints: BTreeMap<(String, String), Constraint>,
    /// Target → storage path → value.
    data: BTreeMap<String, BTreeMap<StoragePath, Value>>,
}

pub struct FakeDriver {
    name: String,
    referential: bool,
    rules: BTreeMap<String, Rule>,
    /// Targets whose matchers filter audited objects.
    targets: BTreeMap<String, Arc<dyn TargetHandler>>,
    state: Mutex<DriverState>,
    failures: Mutex<BTreeSet<FailOn>>,
    log: CallLog,
}

impl FakeDriver {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            referential: true,
            rules: BTreeMap::new(),
            targets: BTreeMap::new(),
            state: Mutex::new(DriverState::default()),
            failures: Mutex::new(BTreeSet::new()),
            log: CallLog::default(),
        }
    }

    /// Register `rule` for templates whose code source is `key` or declares
    /// `package key`.
    pub fn with_rule<F>(mut self, key: &str, rule: F) -> Self
    where
        F: Fn(&RuleInput<'_>) -> Vec<String> + Send + Sync + 'static,
    {
        self.rules.insert(key.to_string(), Arc::new(rule));
        self
    }

    /// Audit objects stored for `target` the way the target reviews them,
    /// skipping constraints whose `spec.match` rejects the object.
    pub fn with_target(mut self, target: Arc<dyn TargetHandler>) -> Self {
        self.targets.insert(target.name().to_string(), target);
        self
    }

    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }

    pub fn without_referential_data(mut self) -> Self {
        self.referential = false;
        self
    }

    pub fn fail_on(&self, op: FailOn) {
        lock(&self.failures).insert(op);
    }

    pub fn clear_failures(&self) {
        lock(&self.failures).clear();
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        lock(&self.log)
            .iter()
            .filter(|(driver, _)| *driver == self.name)
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub fn count(&self, matches: impl Fn(&DriverCall) -> bool) -> usize {
        self.calls().iter().filter(|c| matches(c)).count()
    }

    pub fn has_template(&self, kind: &str) -> bool {
        lock(&self.state).templates.contains_key(kind)
    }

    /// Names of the constraints currently stored, as "Kind/name".
    pub fn constraint_names(&self) -> Vec<String> {
        lock(&self.state)
            .constraints
            .keys()
            .map(|(kind, name)| format!("{}/{}", kind, name))
            .collect()
    }

    pub fn data(&self, target: &str, key: &[String]) -> Option<Value> {
        lock(&self.state)
            .data
            .get(target)
            .and_then(|entries| entries.get(key))
            .cloned()
    }

    fn record(&self, ctx: &Context, op: FailOn, call: DriverCall) -> DriverResult<()> {
        lock(&self.log).push((self.name.clone(), call));
        if lock(&self.failures).contains(&op) {
            return Err(DriverError::Storage(format!("injected {:?} failure", op)));
        }
        if ctx.is_done() {
            return Err(DriverError::Cancelled);
        }
        Ok(())
    }

    /// Stored objects of `target` as audit subjects.
    fn audit_subjects(&self, target: &str, stored: Vec<&Value>) -> DriverResult<Vec<Value>> {
        let Some(handler) = self.targets.get(target) else {
            return Ok(stored.into_iter().map(|v| json!({ "object": v })).collect());
        };
        let mut subjects = Vec::new();
        for value in stored {
            let review = handler
                .handle_review(value)
                .map_err(|e| DriverError::Query(e.to_string()))?;
            subjects.extend(review);
        }
        Ok(subjects)
    }

    /// Compiled match criteria for audit, when the target is known.
    fn audit_matcher(
        &self,
        target: &str,
        constraint: &Constraint,
    ) -> DriverResult<Option<Box<dyn Matcher>>> {
        self.targets
            .get(target)
            .map(|handler| handler.to_matcher(constraint))
            .transpose()
            .map_err(|e| DriverError::Query(e.to_string()))
    }

    fn run(&self, rule_key: &str, input: &RuleInput<'_>) -> Vec<String> {
        match self.rules.get(rule_key) {
            Some(rule) => rule(input),
            None => Vec::new(),
        }
    }
}

/// The rule key of `template`'s code for `engine`: the declared Rego
/// package when there is one, otherwise the source text itself.
fn rule_key(template: &ConstraintTemplate, engine: &str) -> Option<String> {
    let code = template.code_for(engine)?;
    let text = match &code.source {
        Value::String(s) => s.clone(),
        other => match other.get("rego").and_then(Value::as_str) {
            Some(rego) => rego.to_string(),
            None => other.to_string(),
        },
    };
    let package = text
        .lines()
        .find_map(|line| line.trim().strip_prefix("package "))
        .map(|name| name.trim().to_string());
    Some(package.unwrap_or(text))
}

/// Match errors during audit leave the object unreported.
fn audit_matches(matcher: Option<&dyn Matcher>, constraint: &Constraint, subject: &Value) -> bool {
    let Some(matcher) = matcher else {
        return true;
    };
    matcher.matches(subject).unwrap_or_else(|e| {
        tracing::debug!("audit skipped an object for {}: {}", constraint, e);
        false
    })
}

fn constraint_key(constraint: &Constraint) -> (String, String) {
    (constraint.kind.clone(), constraint.name().to_string())
}

impl Driver for FakeDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_template(&self, ctx: &Context, template: &ConstraintTemplate) -> DriverResult<()> {
        self.record(
            ctx,
            FailOn::AddTemplate,
            DriverCall::AddTemplate(template.name().to_string()),
        )?;
        let key = rule_key(template, &self.name).ok_or_else(|| DriverError::Compile {
            template: template.name().to_string(),
            message: format!("no code for engine {}", self.name),
        })?;
        lock(&self.state)
            .templates
            .insert(template.constraint_kind().to_string(), key);
        Ok(())
    }

    fn remove_template(&self, ctx: &Context, template: &ConstraintTemplate) -> DriverResult<()> {
        self.record(
            ctx,
            FailOn::RemoveTemplate,
            DriverCall::RemoveTemplate(template.name().to_string()),
        )?;
        lock(&self.state).templates.remove(template.constraint_kind());
        Ok(())
    }

    fn add_constraint(&self, ctx: &Context, constraint: &Constraint) -> DriverResult<()> {
        self.record(
            ctx,
            FailOn::AddConstraint,
            DriverCall::AddConstraint(constraint.to_string()),
        )?;
        let mut state = lock(&self.state);
        if !state.templates.contains_key(&constraint.kind) {
            return Err(DriverError::UnknownTemplate(constraint.template_name()));
        }
        state
            .constraints
            .insert(constraint_key(constraint), constraint.clone());
        Ok(())
    }

    fn remove_constraint(&self, ctx: &Context, constraint: &Constraint) -> DriverResult<()> {
        self.record(
            ctx,
            FailOn::RemoveConstraint,
            DriverCall::RemoveConstraint(constraint.to_string()),
        )?;
        lock(&self.state)
            .constraints
            .remove(&constraint_key(constraint));
        Ok(())
    }

    fn supports_referential_data(&self) -> bool {
        self.referential
    }

    fn add_data(
        &self,
        ctx: &Context,
        target: &str,
        key: &[String],
        value: &Value,
    ) -> DriverResult<()> {
        self.record(
            ctx,
            FailOn::AddData,
            DriverCall::AddData(target.to_string(), key.to_vec()),
        )?;
        lock(&self.state)
            .data
            .entry(target.to_string())
            .or_default()
            .insert(key.to_vec(), value.clone());
        Ok(())
    }

    fn remove_data(&self, ctx: &Context, target: &str, key: &[String]) -> DriverResult<()> {
        self.record(
            ctx,
            FailOn::RemoveData,
            DriverCall::RemoveData(target.to_string(), key.to_vec()),
        )?;
        if let Some(entries) = lock(&self.state).data.get_mut(target) {
            entries.remove(key);
        }
        Ok(())
    }

    fn query(
        &self,
        ctx: &Context,
        target: &str,
        constraints: &[Constraint],
        review: Option<&Value>,
        opts: &QueryOpts,
    ) -> DriverResult<QueryResponse> {
        self.record(
            ctx,
            FailOn::Query,
            DriverCall::Query(target.to_string(), constraints.len()),
        )?;

        let state = lock(&self.state);
        let audited: Vec<Value> = match review {
            Some(_) => Vec::new(),
            None => self.audit_subjects(
                target,
                state
                    .data
                    .get(target)
                    .map(|entries| entries.values().collect())
                    .unwrap_or_default(),
            )?,
        };

        let mut response = QueryResponse::default();
        let mut per_kind: BTreeMap<&str, usize> = BTreeMap::new();
        for constraint in constraints {
            let key = state
                .templates
                .get(&constraint.kind)
                .ok_or_else(|| DriverError::UnknownTemplate(constraint.template_name()))?;
            *per_kind.entry(constraint.kind.as_str()).or_default() += 1;

            let reviews: Vec<&Value> = match review {
                Some(review) => vec![review],
                None => {
                    let matcher = self.audit_matcher(target, constraint)?;
                    audited
                        .iter()
                        .filter(|subject| audit_matches(matcher.as_deref(), constraint, subject))
                        .collect()
                }
            };
            for subject in reviews {
                let input = RuleInput {
                    review: subject,
                    parameters: constraint.parameters(),
                };
                for msg in self.run(key, &input) {
                    let mut result = ViolationResult::new(constraint, msg);
                    if review.is_none() {
                        result.review = Some(subject.clone());
                    }
                    response.results.push(result);
                }
            }
        }

        if opts.stats_enabled {
            response.stats = per_kind
                .into_iter()
                .map(|(kind, count)| StatsEntry {
                    scope: "template".to_string(),
                    stats_for: kind.to_string(),
                    stats: vec![Stat {
                        name: "constraintCount".to_string(),
                        value: json!(count),
                        source: self.name.clone(),
                    }],
                })
                .collect();
        }
        if opts.tracing_enabled {
            response.trace = Some(format!(
                "{}: evaluated {} constraints on {}",
                self.name,
                constraints.len(),
                target
            ));
        }
        Ok(response)
    }

    fn dump(&self, _ctx: &Context) -> DriverResult<String> {
        let state = lock(&self.state);
        let mut out = String::new();
        for (kind, key) in &state.templates {
            out.push_str(&format!("template {} -> {}\n", kind, key));
        }
        for (kind, name) in state.constraints.keys() {
            out.push_str(&format!("constraint {}/{}\n", kind, name));
        }
        Ok(out)
    }
}

/// Matcher over `spec.match` of FakeTarget constraints.
struct FakeMatcher {
    name: Option<String>,
    error: Option<String>,
}

impl Matcher for FakeMatcher {
    fn matches(&self, review: &Value) -> TargetResult<bool> {
        if let Some(error) = &self.error {
            return Err(TargetError::Match(error.clone()));
        }
        Ok(match &self.name {
            Some(name) => review.get("name").and_then(Value::as_str) == Some(name),
            None => true,
        })
    }
}

/// Referential data cache keyed by storage path.
#[derive(Default)]
pub struct FakeCache {
    entries: Mutex<BTreeMap<StoragePath, Value>>,
    failing: AtomicBool,
}

impl FakeCache {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn get(&self, key: &[String]) -> Option<Value> {
        lock(&self.entries).get(key).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DataCache for FakeCache {
    fn add(&self, key: &[String], value: &Value) -> TargetResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TargetError::Cache("injected cache failure".to_string()));
        }
        lock(&self.entries).insert(key.to_vec(), value.clone());
        Ok(())
    }

    fn remove(&self, key: &[String]) {
        lock(&self.entries).remove(key);
    }

    fn lookup(&self, key: &[String]) -> Option<Value> {
        self.get(key)
    }
}

/// A target that claims every JSON object.
///
/// Referential data is any object with a string `name`, stored under
/// `["data", name]`. Constraints with `parameters.invalid == true` fail
/// target validation.
pub struct FakeTarget {
    name: String,
    review_error: Option<String>,
    cache: Option<FakeCache>,
}

impl FakeTarget {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            review_error: None,
            cache: None,
        }
    }

    /// Make every HandleReview call fail with `message`.
    pub fn failing_review(mut self, message: &str) -> Self {
        self.review_error = Some(message.to_string());
        self
    }

    pub fn with_cache(mut self) -> Self {
        self.cache = Some(FakeCache::default());
        self
    }

    pub fn data_cache(&self) -> Option<&FakeCache> {
        self.cache.as_ref()
    }
}

impl TargetHandler for FakeTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn match_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string" },
                "error": { "type": "string" }
            }
        })
    }

    fn process_data(&self, object: &Value) -> TargetResult<Option<(StoragePath, Value)>> {
        if !object.is_object() {
            return Err(TargetError::Malformed("data must be an object".to_string()));
        }
        Ok(object
            .get("name")
            .and_then(Value::as_str)
            .map(|name| (vec!["data".to_string(), name.to_string()], object.clone())))
    }

    fn handle_review(&self, object: &Value) -> TargetResult<Option<Value>> {
        if let Some(message) = &self.review_error {
            return Err(TargetError::Malformed(message.clone()));
        }
        Ok(object.is_object().then(|| object.clone()))
    }

    fn handle_violation(&self, result: &mut ViolationResult) -> TargetResult<()> {
        result.resource = result.review.clone();
        Ok(())
    }

    fn validate_constraint(&self, constraint: &Constraint) -> TargetResult<()> {
        if constraint.parameters().get("invalid") == Some(&Value::Bool(true)) {
            return Err(TargetError::InvalidConstraint(
                "parameters.invalid is set".to_string(),
            ));
        }
        Ok(())
    }

    fn to_matcher(&self, constraint: &Constraint) -> TargetResult<Box<dyn Matcher>> {
        let criteria = constraint.spec.match_criteria.as_ref();
        let field = |key: &str| {
            criteria
                .and_then(|c| c.get(key))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        Ok(Box::new(FakeMatcher {
            name: field("name"),
            error: field("error"),
        }))
    }

    fn library(&self) -> &str {
        ""
    }

    fn cache(&self) -> Option<&dyn DataCache> {
        self.cache.as_ref().map(|c| c as &dyn DataCache)
    }
}
