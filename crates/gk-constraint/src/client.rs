// client.rs — The constraint engine client.
//
// The Client owns the template registry and constraint store behind a
// single RwLock, plus fixed lookup tables of target handlers and drivers
// built once at construction.
//
// Locking:
//   - AddTemplate / RemoveTemplate / AddConstraint / RemoveConstraint take
//     the write lock for their whole duration, driver calls included, so a
//     driver migration can never interleave with another structural change.
//   - Review / Audit / Get* / validation take the read lock.
//   - AddData / RemoveData take no registry lock at all.
//
// Concurrent mutations are not supported even though the lock serializes
// them: callers that need ordering guarantees across mutations must
// serialize those calls themselves.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;

use crate::config::ClientConfig;
use crate::constraint::{Constraint, EnforcementSettings};
use crate::context::Context;
use crate::driver::Driver;
use crate::error::{ClientError, Result};
use crate::registry::{ConstraintEntry, Registry, TemplateEntry};
use crate::result::Responses;
use crate::schema;
use crate::target::{Matcher, TargetHandler};
use crate::template::ConstraintTemplate;

/// Builds a [`Client`] and validates its lookup tables.
#[derive(Default)]
pub struct ClientBuilder {
    config: ClientConfig,
    targets: Vec<Arc<dyn TargetHandler>>,
    drivers: Vec<Arc<dyn Driver>>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn target(mut self, handler: Arc<dyn TargetHandler>) -> Self {
        self.targets.push(handler);
        self
    }

    pub fn driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.drivers.push(driver);
        self
    }

    /// Requires at least one target and one driver, unique names, and a
    /// priority list that only names registered drivers.
    pub fn build(self) -> Result<Client> {
        if self.targets.is_empty() {
            return Err(ClientError::InvalidClient(
                "at least one target handler is required".to_string(),
            ));
        }
        if self.drivers.is_empty() {
            return Err(ClientError::InvalidClient(
                "at least one driver is required".to_string(),
            ));
        }

        let mut targets = BTreeMap::new();
        for handler in self.targets {
            let name = handler.name().to_string();
            if name.is_empty() {
                return Err(ClientError::InvalidClient(
                    "target handler with empty name".to_string(),
                ));
            }
            if targets.insert(name.clone(), handler).is_some() {
                return Err(ClientError::InvalidClient(format!(
                    "target '{}' registered twice",
                    name
                )));
            }
        }

        let mut registered: Vec<Arc<dyn Driver>> = Vec::new();
        for driver in self.drivers {
            if driver.name().is_empty() {
                return Err(ClientError::InvalidClient(
                    "driver with empty name".to_string(),
                ));
            }
            if registered.iter().any(|d| d.name() == driver.name()) {
                return Err(ClientError::InvalidClient(format!(
                    "driver '{}' registered twice",
                    driver.name()
                )));
            }
            registered.push(driver);
        }

        // Priority order: configured names first, then registration order.
        let mut drivers = Vec::with_capacity(registered.len());
        for name in &self.config.driver_priority {
            match registered.iter().position(|d| d.name() == name) {
                Some(i) => drivers.push(registered.remove(i)),
                None if drivers.iter().any(|d: &Arc<dyn Driver>| d.name() == name) => {
                    return Err(ClientError::InvalidClient(format!(
                        "driver '{}' listed twice in driver_priority",
                        name
                    )))
                }
                None => {
                    return Err(ClientError::InvalidClient(format!(
                        "driver_priority names unregistered driver '{}'",
                        name
                    )))
                }
            }
        }
        drivers.extend(registered);

        tracing::info!(
            "constraint client ready: targets={:?} drivers={:?}",
            targets.keys().collect::<Vec<_>>(),
            drivers.iter().map(|d| d.name()).collect::<Vec<_>>()
        );

        Ok(Client {
            config: self.config,
            targets,
            drivers,
            registry: RwLock::new(Registry::default()),
        })
    }
}

/// The constraint compilation and evaluation engine.
pub struct Client {
    pub(crate) config: ClientConfig,
    pub(crate) targets: BTreeMap<String, Arc<dyn TargetHandler>>,
    /// In priority order; index 0 wins engine selection.
    pub(crate) drivers: Vec<Arc<dyn Driver>>,
    pub(crate) registry: RwLock<Registry>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Registered driver names in priority order.
    pub fn driver_names(&self) -> Vec<&str> {
        self.drivers.iter().map(|d| d.name()).collect()
    }

    pub fn target_names(&self) -> Vec<&str> {
        self.targets.keys().map(String::as_str).collect()
    }

    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, Registry>> {
        self.registry.read().map_err(|_| ClientError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Registry>> {
        self.registry.write().map_err(|_| ClientError::LockPoisoned)
    }

    pub(crate) fn driver(&self, name: &str) -> Option<&Arc<dyn Driver>> {
        self.drivers.iter().find(|d| d.name() == name)
    }

    /// Highest-priority driver whose engine the template declares code for.
    fn resolve_driver(&self, template: &ConstraintTemplate) -> Result<Arc<dyn Driver>> {
        let engines = template.engines();
        self.drivers
            .iter()
            .find(|d| engines.iter().any(|e| e == d.name()))
            .cloned()
            .ok_or_else(|| ClientError::NoDriver {
                template: template.name().to_string(),
                engines,
            })
    }

    /// Metadata checks, target lookup and schema generation shared by
    /// AddTemplate and CreateSchema.
    fn compile_template(
        &self,
        template: &ConstraintTemplate,
    ) -> Result<(Arc<dyn TargetHandler>, Value)> {
        let declared = template.validate_metadata()?;
        let handler = self.targets.get(&declared.target).cloned().ok_or_else(|| {
            ClientError::InvalidConstraintTemplate(format!(
                "template '{}' declares unrecognized target '{}'",
                template.name(),
                declared.target
            ))
        })?;
        let schema = schema::generate(template, handler.as_ref())?;
        Ok((handler, schema))
    }

    // ── Templates ────────────────────────────────────────────────

    /// Validate `template` and generate its constraint schema without
    /// registering anything.
    pub fn create_schema(&self, template: &ConstraintTemplate) -> Result<Value> {
        self.compile_template(template).map(|(_, schema)| schema)
    }

    /// Register or update a template.
    ///
    /// A semantically identical template is a no-op unless an earlier
    /// driver migration was left unfinished. When the resolved engine
    /// changes, the new driver receives the template and every cached
    /// constraint before old drivers drop the template. Failures are not
    /// rolled back; callers retry or remove.
    pub fn add_template(&self, ctx: &Context, template: &ConstraintTemplate) -> Result<Responses> {
        let mut registry = self.write()?;

        let (handler, schema) = self.compile_template(template)?;
        let driver = self.resolve_driver(template)?;
        let name = template.name().to_string();

        let mut resp = Responses::new();
        resp.handle(handler.name());

        if let Some(entry) = registry.templates.get_mut(&name) {
            if entry.is_settled_on(driver.name()) && entry.template.semantic_eq(template) {
                tracing::debug!("template '{}' unchanged; skipping driver update", name);
                return Ok(resp);
            }
            if !entry.constraints.is_empty() && !same_targets(&entry.template, template) {
                return Err(ClientError::ChangeTargets {
                    template: name,
                    old: sorted_targets(&entry.template),
                    new: sorted_targets(template),
                });
            }
            if entry.driver != driver.name() {
                tracing::info!(
                    "template '{}' moving from driver '{}' to '{}'",
                    name,
                    entry.driver,
                    driver.name()
                );
                entry.needs_replay = true;
            }
        }

        driver
            .add_template(ctx, template)
            .map_err(|source| ClientError::Driver {
                driver: driver.name().to_string(),
                source,
            })?;

        let entry = registry
            .templates
            .entry(name.clone())
            .or_insert_with(|| {
                TemplateEntry::new(template.clone(), schema.clone(), handler.clone(), driver.name())
            });
        entry.update(template.clone(), schema, handler, driver.name());
        entry.active_drivers.insert(driver.name());

        if entry.needs_replay {
            for cached in entry.constraints.values() {
                driver
                    .add_constraint(ctx, &cached.constraint)
                    .map_err(|source| ClientError::Driver {
                        driver: driver.name().to_string(),
                        source,
                    })?;
            }
            tracing::info!(
                "replayed {} constraints of template '{}' onto driver '{}'",
                entry.constraints.len(),
                name,
                driver.name()
            );
            entry.needs_replay = false;
        }

        // Old drivers are emptied only once the new one holds everything.
        for stale in entry.active_drivers.others(driver.name()) {
            match self.driver(&stale) {
                Some(old) => {
                    let driver_err = |source| ClientError::Driver {
                        driver: stale.clone(),
                        source,
                    };
                    for cached in entry.constraints.values() {
                        old.remove_constraint(ctx, &cached.constraint)
                            .map_err(driver_err)?;
                    }
                    old.remove_template(ctx, template).map_err(driver_err)?;
                }
                None => tracing::warn!("template '{}' held by unknown driver '{}'", name, stale),
            }
            entry.active_drivers.remove(&stale);
        }

        tracing::info!("template '{}' registered on driver '{}'", name, driver.name());
        Ok(resp)
    }

    /// Unregister a template and cascade-delete its constraints.
    ///
    /// Every cached constraint is removed from every active driver before
    /// the template itself, so no driver is trusted to cascade on its own.
    pub fn remove_template(
        &self,
        ctx: &Context,
        template: &ConstraintTemplate,
    ) -> Result<Responses> {
        let mut registry = self.write()?;
        let mut resp = Responses::new();

        let name = template.name();
        let Some(entry) = registry.templates.get(name) else {
            tracing::debug!("remove of unknown template '{}' is a no-op", name);
            return Ok(resp);
        };
        let target = entry.target_name().to_string();

        for driver_name in entry.active_drivers.iter() {
            let Some(driver) = self.driver(driver_name) else {
                tracing::warn!("template '{}' held by unknown driver '{}'", name, driver_name);
                continue;
            };
            let driver_err = |source| ClientError::Driver {
                driver: driver_name.to_string(),
                source,
            };
            for cached in entry.constraints.values() {
                driver
                    .remove_constraint(ctx, &cached.constraint)
                    .map_err(driver_err)?;
            }
            driver
                .remove_template(ctx, &entry.template)
                .map_err(driver_err)?;
        }

        let removed = registry.templates.remove(name);
        tracing::info!(
            "template '{}' removed with {} constraints",
            name,
            removed.map(|e| e.constraints.len()).unwrap_or(0)
        );
        resp.handle(&target);
        Ok(resp)
    }

    /// A copy of the registered template.
    pub fn get_template(&self, template: &ConstraintTemplate) -> Result<ConstraintTemplate> {
        let registry = self.read()?;
        registry
            .templates
            .get(template.name())
            .map(|entry| entry.template.clone())
            .ok_or_else(|| ClientError::MissingConstraintTemplate(template.name().to_string()))
    }

    /// Names of every registered template, sorted.
    pub fn template_names(&self) -> Result<Vec<String>> {
        Ok(self.read()?.templates.keys().cloned().collect())
    }

    // ── Constraints ──────────────────────────────────────────────

    /// Defaults, schema validation, target validation, enforcement
    /// settings and matcher for `constraint` under `entry`.
    fn check_constraint(
        &self,
        entry: &TemplateEntry,
        constraint: &Constraint,
    ) -> Result<(EnforcementSettings, Box<dyn Matcher>)> {
        schema::validate_constraint(&entry.schema, constraint)?;
        entry
            .target
            .validate_constraint(constraint)
            .map_err(|e| ClientError::InvalidConstraint(format!("{}: {}", constraint, e)))?;
        let enforcement = EnforcementSettings::from_constraint(constraint)?;
        for point in enforcement.named_points() {
            if !self.config.enforcement_points.iter().any(|p| p == point) {
                tracing::warn!(
                    "constraint {} names enforcement point '{}' which is not configured",
                    constraint,
                    point
                );
            }
        }
        let matcher = entry
            .target
            .to_matcher(constraint)
            .map_err(|e| ClientError::InvalidConstraint(format!("{}: {}", constraint, e)))?;
        Ok((enforcement, matcher))
    }

    /// Run every AddConstraint check without changing any state.
    pub fn validate_constraint(&self, constraint: &Constraint) -> Result<()> {
        constraint.validate_metadata()?;
        let registry = self.read()?;
        let entry = registry
            .templates
            .get(&constraint.template_name())
            .ok_or_else(|| ClientError::MissingConstraintTemplate(constraint.template_name()))?;
        let defaulted = schema::defaulted(&entry.schema, constraint)?;
        self.check_constraint(entry, &defaulted).map(|_| ())
    }

    /// Register or update a constraint.
    ///
    /// Template defaults are applied first; a constraint that is then
    /// semantically equal to the cached one is a no-op.
    pub fn add_constraint(&self, ctx: &Context, constraint: &Constraint) -> Result<Responses> {
        constraint.validate_metadata()?;
        let mut registry = self.write()?;

        let template_name = constraint.template_name();
        let entry = registry
            .templates
            .get_mut(&template_name)
            .ok_or_else(|| ClientError::MissingConstraintTemplate(template_name.clone()))?;

        let mut resp = Responses::new();
        resp.handle(entry.target_name());

        let candidate = schema::defaulted(&entry.schema, constraint)?;
        if let Some(cached) = entry.constraints.get(candidate.name()) {
            if cached.constraint.semantic_eq(&candidate) {
                tracing::debug!("constraint {} unchanged; skipping driver update", candidate);
                return Ok(resp);
            }
        }

        let (enforcement, matcher) = self.check_constraint(entry, &candidate)?;
        let driver = self.driver(&entry.driver).ok_or_else(|| ClientError::NoDriver {
            template: template_name.clone(),
            engines: entry.template.engines(),
        })?;
        driver
            .add_constraint(ctx, &candidate)
            .map_err(|source| ClientError::Driver {
                driver: entry.driver.clone(),
                source,
            })?;

        tracing::info!("constraint {} stored on driver '{}'", candidate, entry.driver);
        entry.constraints.insert(
            candidate.name().to_string(),
            ConstraintEntry {
                constraint: candidate,
                enforcement,
                matcher,
            },
        );
        Ok(resp)
    }

    /// Unregister a constraint. Unknown templates and unknown constraints
    /// are no-ops.
    pub fn remove_constraint(&self, ctx: &Context, constraint: &Constraint) -> Result<Responses> {
        constraint.validate_metadata()?;
        let mut registry = self.write()?;
        let mut resp = Responses::new();

        let Some(entry) = registry.templates.get_mut(&constraint.template_name()) else {
            tracing::debug!("constraint {} has no template; nothing to remove", constraint);
            return Ok(resp);
        };
        resp.handle(entry.target_name());

        let Some(cached) = entry.constraints.get(constraint.name()) else {
            tracing::debug!("constraint {} is not registered; nothing to remove", constraint);
            return Ok(resp);
        };
        for driver_name in entry.active_drivers.iter() {
            if let Some(driver) = self.driver(driver_name) {
                driver
                    .remove_constraint(ctx, &cached.constraint)
                    .map_err(|source| ClientError::Driver {
                        driver: driver_name.to_string(),
                        source,
                    })?;
            }
        }
        entry.constraints.remove(constraint.name());
        tracing::info!("constraint {} removed", constraint);
        Ok(resp)
    }

    /// A copy of the registered constraint, defaults applied.
    pub fn get_constraint(&self, constraint: &Constraint) -> Result<Constraint> {
        let registry = self.read()?;
        let entry = registry
            .templates
            .get(&constraint.template_name())
            .ok_or_else(|| ClientError::MissingConstraintTemplate(constraint.template_name()))?;
        entry
            .constraints
            .get(constraint.name())
            .map(|cached| cached.constraint.clone())
            .ok_or_else(|| ClientError::MissingConstraint {
                kind: constraint.kind.clone(),
                name: constraint.name().to_string(),
            })
    }

    // ── Referential data ─────────────────────────────────────────

    /// Drivers that store referential data, or the configured reaction
    /// when there are none.
    fn referential_drivers(&self) -> Result<Vec<&Arc<dyn Driver>>> {
        let drivers: Vec<_> = self
            .drivers
            .iter()
            .filter(|d| d.supports_referential_data())
            .collect();
        if drivers.is_empty() {
            if self.config.ignore_no_referential_driver {
                tracing::warn!("no driver supports referential data; ignoring data update");
            } else {
                return Err(ClientError::NoReferentialDriver);
            }
        }
        Ok(drivers)
    }

    /// Ingest a side-channel object for cross-object policies.
    ///
    /// Per target: cache first, then every referential driver. A driver
    /// failure rolls the write back on the cache and on the drivers that
    /// already took it: to the previously cached value when the cache held
    /// one, otherwise by removing the entry. Per-target failures are
    /// collected in `Responses::errors`.
    pub fn add_data(&self, ctx: &Context, data: &Value) -> Result<Responses> {
        let drivers = self.referential_drivers()?;
        let mut resp = Responses::new();
        if drivers.is_empty() {
            return Ok(resp);
        }

        'targets: for (name, handler) in &self.targets {
            let (key, value) = match handler.process_data(data) {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(source) => {
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

            let cache = handler.cache();
            let previous = cache.and_then(|cache| cache.lookup(&key));
            if let Some(cache) = cache {
                if let Err(source) = cache.add(&key, &value) {
                    resp.errors.insert(
                        name,
                        ClientError::Target {
                            target: name.clone(),
                            source,
                        },
                    );
                    continue;
                }
            }

            for (stored, driver) in drivers.iter().enumerate() {
                if let Err(source) = driver.add_data(ctx, name, &key, &value) {
                    resp.errors.insert(
                        name,
                        ClientError::Driver {
                            driver: driver.name().to_string(),
                            source,
                        },
                    );
                    rollback_data(ctx, name, &key, previous.as_ref(), &drivers[..stored]);
                    if let Some(cache) = cache {
                        match &previous {
                            Some(old) => {
                                if let Err(e) = cache.add(&key, old) {
                                    tracing::warn!("cache rollback of {:?} failed: {}", key, e);
                                }
                            }
                            None => cache.remove(&key),
                        }
                    }
                    continue 'targets;
                }
            }
            tracing::debug!("data {:?} stored for target '{}'", key, name);
            resp.handle(name);
        }
        Ok(resp)
    }

    /// Remove a side-channel object: drivers first, then the cache, so the
    /// cache never points at data the drivers no longer hold.
    pub fn remove_data(&self, ctx: &Context, data: &Value) -> Result<Responses> {
        let drivers = self.referential_drivers()?;
        let mut resp = Responses::new();
        if drivers.is_empty() {
            return Ok(resp);
        }

        'targets: for (name, handler) in &self.targets {
            let key = match handler.process_data(data) {
                Ok(Some((key, _))) => key,
                Ok(None) => continue,
                Err(source) => {
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

            for driver in &drivers {
                if let Err(source) = driver.remove_data(ctx, name, &key) {
                    resp.errors.insert(
                        name,
                        ClientError::Driver {
                            driver: driver.name().to_string(),
                            source,
                        },
                    );
                    continue 'targets;
                }
            }
            if let Some(cache) = handler.cache() {
                cache.remove(&key);
            }
            tracing::debug!("data {:?} removed for target '{}'", key, name);
            resp.handle(name);
        }
        Ok(resp)
    }

    // ── Diagnostics ──────────────────────────────────────────────

    /// Concatenated dumps of every driver, in priority order.
    pub fn dump(&self, ctx: &Context) -> Result<String> {
        let mut out = String::new();
        for driver in &self.drivers {
            let dump = driver.dump(ctx).map_err(|source| ClientError::Driver {
                driver: driver.name().to_string(),
                source,
            })?;
            out.push_str(&format!("--- Begin Dump for {} ---\n", driver.name()));
            out.push_str(&dump);
            if !dump.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&format!("--- End Dump for {} ---\n", driver.name()));
        }
        Ok(out)
    }
}

fn sorted_targets(template: &ConstraintTemplate) -> Vec<String> {
    let mut targets: Vec<String> = template
        .target_names()
        .into_iter()
        .map(str::to_string)
        .collect();
    targets.sort();
    targets
}

/// Order-insensitive comparison of declared targets.
fn same_targets(a: &ConstraintTemplate, b: &ConstraintTemplate) -> bool {
    sorted_targets(a) == sorted_targets(b)
}

/// Undo a partial AddData on `drivers`. Failures are logged; the caller
/// already reports the error that triggered the rollback.
fn rollback_data(
    ctx: &Context,
    target: &str,
    key: &[String],
    previous: Option<&Value>,
    drivers: &[&Arc<dyn Driver>],
) {
    for driver in drivers {
        let undone = match previous {
            Some(old) => driver.add_data(ctx, target, key, old),
            None => driver.remove_data(ctx, target, key),
        };
        if let Err(e) = undone {
            tracing::warn!(
                "rollback of {:?} on driver '{}' failed: {}",
                key,
                driver.name(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::context::Context;
    use crate::error::DriverError;
    use crate::fakes::{CallLog, DriverCall, FailOn, FakeDriver, FakeTarget, RuleInput};
    use crate::template::{Code, REGO_ENGINE};
    use serde_json::json;

    const TARGET: &str = "test.gatekeeper.sh";
    const OTHER_TARGET: &str = "other.gatekeeper.sh";

    fn required_labels(input: &RuleInput<'_>) -> Vec<String> {
        let present = input.review.get("labels");
        input
            .parameters
            .get("labels")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .filter(|label| present.and_then(|p| p.get(*label)).is_none())
            .map(|label| format!("missing label: {}", label))
            .collect()
    }

    fn fake_driver(name: &str) -> FakeDriver {
        FakeDriver::new(name)
            .with_rule("required", required_labels)
            .with_rule("always", |_| vec!["denied".to_string()])
    }

    fn client_with(driver: Arc<FakeDriver>) -> Client {
        Client::builder()
            .target(Arc::new(FakeTarget::new(TARGET)))
            .target(Arc::new(FakeTarget::new(OTHER_TARGET)))
            .driver(driver)
            .build()
            .unwrap()
    }

    fn template(kind: &str, rule: &str) -> ConstraintTemplate {
        ConstraintTemplate::new(kind).with_target(TARGET, REGO_ENGINE, json!(rule))
    }

    fn labels_template() -> ConstraintTemplate {
        template("K8sRequiredLabels", "required").with_parameter_schema(json!({
            "properties": {
                "labels": { "type": "array", "items": { "type": "string" } },
                "mode": { "type": "string", "default": "strict" }
            }
        }))
    }

    fn labels_constraint(name: &str) -> Constraint {
        Constraint::new("K8sRequiredLabels", name).with_parameters(json!({ "labels": ["owner"] }))
    }

    fn position(log: &CallLog, driver: &str, call: &DriverCall) -> usize {
        log.lock()
            .unwrap()
            .iter()
            .position(|(d, c)| d == driver && c == call)
            .unwrap_or_else(|| panic!("{} never received {:?}", driver, call))
    }

    #[test]
    fn builder_validates_lookup_tables() {
        let err = Client::builder()
            .driver(Arc::new(fake_driver("Rego")))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::InvalidClient(_)));

        let err = Client::builder()
            .target(Arc::new(FakeTarget::new(TARGET)))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::InvalidClient(_)));

        let err = Client::builder()
            .target(Arc::new(FakeTarget::new(TARGET)))
            .target(Arc::new(FakeTarget::new(TARGET)))
            .driver(Arc::new(fake_driver("Rego")))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("registered twice"));

        let err = Client::builder()
            .config(ClientConfig {
                driver_priority: vec!["CEL".to_string()],
                ..ClientConfig::default()
            })
            .target(Arc::new(FakeTarget::new(TARGET)))
            .driver(Arc::new(fake_driver("Rego")))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("unregistered driver 'CEL'"));
    }

    #[test]
    fn driver_priority_orders_drivers() {
        let client = Client::builder()
            .config(ClientConfig {
                driver_priority: vec!["CEL".to_string()],
                ..ClientConfig::default()
            })
            .target(Arc::new(FakeTarget::new(TARGET)))
            .driver(Arc::new(fake_driver("Rego")))
            .driver(Arc::new(fake_driver("Wasm")))
            .driver(Arc::new(fake_driver("CEL")))
            .build()
            .unwrap();
        assert_eq!(client.driver_names(), vec!["CEL", "Rego", "Wasm"]);
        assert_eq!(client.target_names(), vec![TARGET]);
    }

    #[test]
    fn identical_template_reaches_driver_once() {
        let ctx = Context::background();
        let driver = Arc::new(fake_driver("Rego"));
        let client = client_with(driver.clone());

        let first = client.add_template(&ctx, &labels_template()).unwrap();
        let mut relabeled = labels_template();
        relabeled
            .metadata
            .labels
            .insert("team".to_string(), "platform".to_string());
        let second = client.add_template(&ctx, &relabeled).unwrap();

        assert_eq!(first.handled, second.handled);
        assert!(second.handled_for(TARGET));
        assert_eq!(
            driver.count(|c| matches!(c, DriverCall::AddTemplate(_))),
            1
        );
    }

    #[test]
    fn changed_template_is_pushed_again() {
        let ctx = Context::background();
        let driver = Arc::new(fake_driver("Rego"));
        let client = client_with(driver.clone());

        client.add_template(&ctx, &template("K8sThing", "required")).unwrap();
        client.add_template(&ctx, &template("K8sThing", "always")).unwrap();

        assert_eq!(
            driver.count(|c| matches!(c, DriverCall::AddTemplate(_))),
            2
        );
        let cached = client.get_template(&template("K8sThing", "")).unwrap();
        assert_eq!(cached.code_for(REGO_ENGINE).unwrap().source, json!("always"));
    }

    #[test]
    fn name_must_match_lowercased_kind() {
        let ctx = Context::background();
        let driver = Arc::new(fake_driver("Rego"));
        let client = client_with(driver.clone());

        let mut bad = template("K8sThing", "always");
        bad.metadata.name = "something-else".to_string();
        let err = client.add_template(&ctx, &bad).unwrap_err();

        assert!(matches!(err, ClientError::InvalidConstraintTemplate(_)));
        assert!(client.template_names().unwrap().is_empty());
        assert!(driver.calls().is_empty());
    }

    #[test]
    fn unknown_target_is_rejected() {
        let ctx = Context::background();
        let client = client_with(Arc::new(fake_driver("Rego")));
        let bad = ConstraintTemplate::new("K8sThing").with_target("nowhere", REGO_ENGINE, json!("always"));
        let err = client.add_template(&ctx, &bad).unwrap_err();
        assert!(matches!(err, ClientError::InvalidConstraintTemplate(_)));
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn template_without_usable_engine_has_no_driver() {
        let ctx = Context::background();
        let client = client_with(Arc::new(fake_driver("Rego")));
        let cel_only = ConstraintTemplate::new("K8sThing").with_target(TARGET, "CEL", json!("always"));
        match client.add_template(&ctx, &cel_only).unwrap_err() {
            ClientError::NoDriver { template, engines } => {
                assert_eq!(template, "k8sthing");
                assert_eq!(engines, vec!["CEL"]);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(client.template_names().unwrap().is_empty());
    }

    #[test]
    fn create_schema_registers_nothing() {
        let driver = Arc::new(fake_driver("Rego"));
        let client = client_with(driver.clone());

        let schema = client.create_schema(&labels_template()).unwrap();
        assert_eq!(
            schema["properties"]["spec"]["properties"]["parameters"]["properties"]["mode"]["default"],
            json!("strict")
        );
        assert!(client.template_names().unwrap().is_empty());
        assert!(driver.calls().is_empty());
    }

    #[test]
    fn constraint_for_unknown_kind_changes_nothing() {
        let ctx = Context::background();
        let driver = Arc::new(fake_driver("Rego"));
        let client = client_with(driver.clone());
        client.add_template(&ctx, &labels_template()).unwrap();

        let err = client
            .add_constraint(&ctx, &Constraint::new("K8sUnknown", "x"))
            .unwrap_err();
        assert!(matches!(err, ClientError::MissingConstraintTemplate(ref t) if t == "k8sunknown"));
        assert_eq!(
            driver.count(|c| matches!(c, DriverCall::AddConstraint(_))),
            0
        );
    }

    #[test]
    fn constraint_metadata_is_checked_first() {
        let ctx = Context::background();
        let client = client_with(Arc::new(fake_driver("Rego")));
        client.add_template(&ctx, &labels_template()).unwrap();

        let mut wrong_group = labels_constraint("c");
        wrong_group.api_version = "example.com/v1".to_string();
        assert!(matches!(
            client.add_constraint(&ctx, &wrong_group).unwrap_err(),
            ClientError::InvalidConstraint(_)
        ));
        assert!(matches!(
            client.add_constraint(&ctx, &labels_constraint("")).unwrap_err(),
            ClientError::InvalidConstraint(_)
        ));
    }

    #[test]
    fn constraint_gets_defaults_and_is_deduplicated() {
        let ctx = Context::background();
        let driver = Arc::new(fake_driver("Rego"));
        let client = client_with(driver.clone());
        client.add_template(&ctx, &labels_template()).unwrap();

        let resp = client.add_constraint(&ctx, &labels_constraint("must-have-owner")).unwrap();
        assert!(resp.handled_for(TARGET));
        client.add_constraint(&ctx, &labels_constraint("must-have-owner")).unwrap();

        let stored = client.get_constraint(&labels_constraint("must-have-owner")).unwrap();
        assert_eq!(stored.parameters()["mode"], json!("strict"));
        assert_eq!(
            driver.count(|c| matches!(c, DriverCall::AddConstraint(_))),
            1
        );

        let changed = Constraint::new("K8sRequiredLabels", "must-have-owner")
            .with_parameters(json!({ "labels": ["team"] }));
        client.add_constraint(&ctx, &changed).unwrap();
        assert_eq!(
            driver.count(|c| matches!(c, DriverCall::AddConstraint(_))),
            2
        );
    }

    #[test]
    fn invalid_constraints_are_rejected() {
        let ctx = Context::background();
        let driver = Arc::new(fake_driver("Rego"));
        let client = client_with(driver.clone());
        client.add_template(&ctx, &labels_template()).unwrap();

        let bad_params = Constraint::new("K8sRequiredLabels", "a")
            .with_parameters(json!({ "labels": "owner" }));
        let err = client.add_constraint(&ctx, &bad_params).unwrap_err();
        assert!(err.to_string().contains("parameters.labels"));

        let bad_match = labels_constraint("b").with_match(json!({ "name": 5 }));
        assert!(matches!(
            client.add_constraint(&ctx, &bad_match).unwrap_err(),
            ClientError::InvalidConstraint(_)
        ));

        let rejected_by_target = Constraint::new("K8sRequiredLabels", "c")
            .with_parameters(json!({ "invalid": true }));
        assert!(matches!(
            client.add_constraint(&ctx, &rejected_by_target).unwrap_err(),
            ClientError::InvalidConstraint(_)
        ));

        let bad_action = labels_constraint("d").with_enforcement_action("explode");
        assert!(matches!(
            client.validate_constraint(&bad_action).unwrap_err(),
            ClientError::InvalidConstraint(_)
        ));

        assert!(client.validate_constraint(&labels_constraint("e")).is_ok());
        assert!(driver.constraint_names().is_empty());
    }

    #[test]
    fn removing_template_cascades_to_constraints() {
        let ctx = Context::background();
        let driver = Arc::new(fake_driver("Rego"));
        let client = client_with(driver.clone());
        client.add_template(&ctx, &labels_template()).unwrap();
        for name in ["a", "b", "c"] {
            client.add_constraint(&ctx, &labels_constraint(name)).unwrap();
        }
        assert_eq!(driver.constraint_names().len(), 3);

        let resp = client.remove_template(&ctx, &labels_template()).unwrap();
        assert!(resp.handled_for(TARGET));

        assert!(driver.constraint_names().is_empty());
        assert!(!driver.has_template("K8sRequiredLabels"));
        assert_eq!(
            driver.count(|c| matches!(c, DriverCall::RemoveConstraint(_))),
            3
        );
        assert!(matches!(
            client.get_constraint(&labels_constraint("a")).unwrap_err(),
            ClientError::MissingConstraintTemplate(_)
        ));
        assert!(matches!(
            client.get_template(&labels_template()).unwrap_err(),
            ClientError::MissingConstraintTemplate(_)
        ));

        // Removing again is a no-op.
        let resp = client.remove_template(&ctx, &labels_template()).unwrap();
        assert!(resp.handled.is_empty());
    }

    #[test]
    fn removing_constraints() {
        let ctx = Context::background();
        let driver = Arc::new(fake_driver("Rego"));
        let client = client_with(driver.clone());

        // Unknown template: no-op.
        client.remove_constraint(&ctx, &labels_constraint("a")).unwrap();

        client.add_template(&ctx, &labels_template()).unwrap();
        client.add_constraint(&ctx, &labels_constraint("a")).unwrap();
        client.remove_constraint(&ctx, &labels_constraint("a")).unwrap();
        // Unknown constraint: no-op.
        client.remove_constraint(&ctx, &labels_constraint("a")).unwrap();

        assert!(driver.constraint_names().is_empty());
        assert_eq!(
            driver.count(|c| matches!(c, DriverCall::RemoveConstraint(_))),
            1
        );
        assert!(matches!(
            client.get_constraint(&labels_constraint("a")).unwrap_err(),
            ClientError::MissingConstraint { .. }
        ));
    }

    #[test]
    fn target_cannot_change_under_live_constraints() {
        let ctx = Context::background();
        let client = client_with(Arc::new(fake_driver("Rego")));
        client.add_template(&ctx, &template("K8sThing", "always")).unwrap();

        let moved = ConstraintTemplate::new("K8sThing").with_target(OTHER_TARGET, REGO_ENGINE, json!("always"));
        // No constraints yet: allowed.
        client.add_template(&ctx, &moved).unwrap();
        client.add_template(&ctx, &template("K8sThing", "always")).unwrap();

        client.add_constraint(&ctx, &Constraint::new("K8sThing", "c")).unwrap();
        match client.add_template(&ctx, &moved).unwrap_err() {
            ClientError::ChangeTargets { old, new, .. } => {
                assert_eq!(old, vec![TARGET]);
                assert_eq!(new, vec![OTHER_TARGET]);
            }
            other => panic!("unexpected error: {}", other),
        }

        // Same target, different code: accepted.
        client.add_template(&ctx, &template("K8sThing", "required")).unwrap();
        assert!(client.get_constraint(&Constraint::new("K8sThing", "c")).is_ok());
    }

    fn migrating_client(log: &CallLog) -> (Client, Arc<FakeDriver>, Arc<FakeDriver>) {
        let cel = Arc::new(fake_driver("CEL").with_log(log.clone()));
        let rego = Arc::new(fake_driver("Rego").with_log(log.clone()));
        let client = Client::builder()
            .config(ClientConfig {
                driver_priority: vec!["CEL".to_string(), "Rego".to_string()],
                ..ClientConfig::default()
            })
            .target(Arc::new(FakeTarget::new(TARGET)))
            .driver(cel.clone())
            .driver(rego.clone())
            .build()
            .unwrap();
        (client, cel, rego)
    }

    fn with_cel(template: ConstraintTemplate) -> ConstraintTemplate {
        let mut template = template;
        template.spec.targets[0].code.push(Code {
            engine: "CEL".to_string(),
            source: json!("always"),
        });
        template
    }

    #[test]
    fn engine_change_replays_constraints_before_teardown() {
        let ctx = Context::background();
        let log = CallLog::default();
        let (client, cel, rego) = migrating_client(&log);

        client.add_template(&ctx, &template("K8sThing", "always")).unwrap();
        client.add_constraint(&ctx, &Constraint::new("K8sThing", "a")).unwrap();
        client.add_constraint(&ctx, &Constraint::new("K8sThing", "b")).unwrap();
        assert!(cel.calls().is_empty());

        client.add_template(&ctx, &with_cel(template("K8sThing", "always"))).unwrap();

        let teardown = position(&log, "Rego", &DriverCall::RemoveTemplate("k8sthing".to_string()));
        for name in ["a", "b"] {
            let replay = position(
                &log,
                "CEL",
                &DriverCall::AddConstraint(format!("K8sThing/{}", name)),
            );
            assert!(replay < teardown);
        }
        assert_eq!(cel.constraint_names(), vec!["K8sThing/a", "K8sThing/b"]);
        assert!(rego.constraint_names().is_empty());
        assert!(!rego.has_template("K8sThing"));

        // Removal now only involves the new driver.
        client.remove_template(&ctx, &template("K8sThing", "always")).unwrap();
        assert!(cel.constraint_names().is_empty());
        assert_eq!(
            rego.count(|c| matches!(c, DriverCall::RemoveTemplate(_))),
            1
        );
    }

    #[test]
    fn interrupted_migration_converges_on_retry() {
        let ctx = Context::background();
        let log = CallLog::default();
        let (client, cel, rego) = migrating_client(&log);
        let migrated = with_cel(template("K8sThing", "always"));

        client.add_template(&ctx, &template("K8sThing", "always")).unwrap();
        client.add_constraint(&ctx, &Constraint::new("K8sThing", "a")).unwrap();

        cel.fail_on(FailOn::AddConstraint);
        let err = client.add_template(&ctx, &migrated).unwrap_err();
        assert!(matches!(err, ClientError::Driver { ref driver, .. } if driver == "CEL"));
        // The old driver still enforces.
        assert!(rego.has_template("K8sThing"));
        assert_eq!(rego.constraint_names(), vec!["K8sThing/a"]);

        cel.clear_failures();
        client.add_template(&ctx, &migrated).unwrap();
        assert_eq!(cel.constraint_names(), vec!["K8sThing/a"]);
        assert!(!rego.has_template("K8sThing"));

        // Settled: a third identical add does nothing.
        client.add_template(&ctx, &migrated).unwrap();
        assert_eq!(
            cel.count(|c| matches!(c, DriverCall::AddTemplate(_))),
            2
        );
    }

    #[test]
    fn get_returns_copies() {
        let ctx = Context::background();
        let client = client_with(Arc::new(fake_driver("Rego")));
        client.add_template(&ctx, &labels_template()).unwrap();
        client.add_constraint(&ctx, &labels_constraint("a")).unwrap();

        let mut template = client.get_template(&labels_template()).unwrap();
        template.spec.targets.clear();
        let mut constraint = client.get_constraint(&labels_constraint("a")).unwrap();
        constraint.spec.parameters = None;

        assert_eq!(client.get_template(&labels_template()).unwrap().spec.targets.len(), 1);
        assert!(client
            .get_constraint(&labels_constraint("a"))
            .unwrap()
            .spec
            .parameters
            .is_some());
    }

    #[test]
    fn mutations_pass_caller_context_to_drivers() {
        let ctx = Context::background();
        let client = client_with(Arc::new(fake_driver("Rego")));
        client.add_template(&ctx, &labels_template()).unwrap();

        let cancelled = Context::background();
        cancelled.cancel();
        let is_cancelled = |err: ClientError| {
            matches!(err, ClientError::Driver { source: DriverError::Cancelled, .. })
        };
        assert!(is_cancelled(
            client.add_constraint(&cancelled, &labels_constraint("a")).unwrap_err()
        ));
        assert!(client.get_constraint(&labels_constraint("a")).is_err());

        client.add_constraint(&ctx, &labels_constraint("a")).unwrap();
        assert!(is_cancelled(
            client.remove_constraint(&cancelled, &labels_constraint("a")).unwrap_err()
        ));
        assert!(is_cancelled(
            client.remove_template(&cancelled, &labels_template()).unwrap_err()
        ));
        assert!(client.get_constraint(&labels_constraint("a")).is_ok());
    }

    fn data_client()-> (Client, Arc<FakeTarget>, Arc<FakeDriver>) {
        let target = Arc::new(FakeTarget::new(TARGET).with_cache());
        let driver = Arc::new(fake_driver("Rego"));
        let client = Client::builder()
            .target(target.clone())
            .driver(driver.clone())
            .build()
            .unwrap();
        (client, target, driver)
    }

    fn key(name: &str) -> Vec<String> {
        vec!["data".to_string(), name.to_string()]
    }

    #[test]
    fn data_goes_to_cache_and_driver() {
        let (client, target, driver) = data_client();
        let ctx = Context::background();
        let ns = json!({ "name": "prod", "labels": { "env": "prod" } });

        let resp = client.add_data(&ctx, &ns).unwrap();
        assert!(resp.handled_for(TARGET));
        assert!(resp.errors.is_empty());
        let cache = target.data_cache().unwrap();
        assert_eq!(cache.get(&key("prod")), Some(ns.clone()));
        assert_eq!(driver.data(TARGET, &key("prod")), Some(ns.clone()));

        // Unclaimed data is skipped.
        let resp = client.add_data(&ctx, &json!({ "labels": {} })).unwrap();
        assert!(resp.handled.is_empty());

        let resp = client.remove_data(&ctx, &ns).unwrap();
        assert!(resp.handled_for(TARGET));
        assert!(cache.is_empty());
        assert_eq!(driver.data(TARGET, &key("prod")), None);
    }

    #[test]
    fn driver_failure_rolls_back_cache() {
        let (client, target, driver) = data_client();
        let ctx = Context::background();
        driver.fail_on(FailOn::AddData);

        let resp = client.add_data(&ctx, &json!({ "name": "prod" })).unwrap();
        assert!(resp.errors.contains(TARGET));
        assert!(!resp.handled_for(TARGET));
        assert!(target.data_cache().unwrap().is_empty());
    }

    #[test]
    fn later_driver_failure_rolls_back_earlier_drivers() {
        let target = Arc::new(FakeTarget::new(TARGET).with_cache());
        let rego = Arc::new(fake_driver("Rego"));
        let cel = Arc::new(fake_driver("CEL"));
        let client = Client::builder()
            .target(target.clone())
            .driver(rego.clone())
            .driver(cel.clone())
            .build()
            .unwrap();
        let ctx = Context::background();
        let cache = target.data_cache().unwrap();

        // New entry: removed again from the driver that took it.
        cel.fail_on(FailOn::AddData);
        let resp = client.add_data(&ctx, &json!({ "name": "prod" })).unwrap();
        assert!(resp.errors.contains(TARGET));
        assert_eq!(rego.data(TARGET, &key("prod")), None);
        assert!(rego.calls().contains(&DriverCall::RemoveData(TARGET.to_string(), key("prod"))));
        assert!(cache.is_empty());

        // Update: the previous value comes back everywhere.
        cel.clear_failures();
        let v1 = json!({ "name": "prod", "labels": { "env": "prod" } });
        client.add_data(&ctx, &v1).unwrap();
        cel.fail_on(FailOn::AddData);
        let v2 = json!({ "name": "prod", "labels": { "env": "staging" } });
        let resp = client.add_data(&ctx, &v2).unwrap();
        assert!(resp.errors.contains(TARGET));
        assert_eq!(cache.get(&key("prod")), Some(v1.clone()));
        assert_eq!(rego.data(TARGET, &key("prod")), Some(v1.clone()));
        assert_eq!(cel.data(TARGET, &key("prod")), Some(v1));
    }

    #[test]
    fn cache_failure_skips_driver() {
        let (client, target, driver) = data_client();
        let ctx = Context::background();
        target.data_cache().unwrap().set_failing(true);

        let resp = client.add_data(&ctx, &json!({ "name": "prod" })).unwrap();
        assert!(resp.errors.contains(TARGET));
        assert_eq!(driver.count(|c| matches!(c, DriverCall::AddData(..))), 0);
    }

    #[test]
    fn failed_driver_removal_keeps_cache_entry() {
        let (client, target, driver) = data_client();
        let ctx = Context::background();
        let ns = json!({ "name": "prod" });
        client.add_data(&ctx, &ns).unwrap();

        driver.fail_on(FailOn::RemoveData);
        let resp = client.remove_data(&ctx, &ns).unwrap();
        assert!(resp.errors.contains(TARGET));
        assert_eq!(target.data_cache().unwrap().len(), 1);
    }

    #[test]
    fn malformed_data_is_reported_per_target() {
        let ctx = Context::background();
        let (client, _, _) = data_client();
        let resp = client.add_data(&ctx, &json!("prod")).unwrap();
        let errors = resp.errors.get(TARGET).unwrap();
        assert!(matches!(errors[0], ClientError::Target { .. }));
    }

    #[test]
    fn data_without_referential_driver() {
        let ctx = Context::background();
        let driver = Arc::new(fake_driver("Rego").without_referential_data());
        let client = client_with(driver.clone());
        let err = client
            .add_data(&ctx, &json!({ "name": "prod" }))
            .unwrap_err();
        assert!(matches!(err, ClientError::NoReferentialDriver));

        let client = Client::builder()
            .config(ClientConfig {
                ignore_no_referential_driver: true,
                ..ClientConfig::default()
            })
            .target(Arc::new(FakeTarget::new(TARGET)))
            .driver(driver.clone())
            .build()
            .unwrap();
        let resp = client
            .remove_data(&ctx, &json!({ "name": "prod" }))
            .unwrap();
        assert!(resp.handled.is_empty());
        assert!(driver.calls().is_empty());
    }

    #[test]
    fn dump_frames_each_driver() {
        let ctx = Context::background();
        let log = CallLog::default();
        let (client, _, _) = migrating_client(&log);
        client.add_template(&ctx, &template("K8sThing", "always")).unwrap();

        let dump = client.dump(&ctx).unwrap();
        assert_eq!(
            dump,
            "--- Begin Dump for CEL ---\n\
             \n\
             --- End Dump for CEL ---\n\
             --- Begin Dump for Rego ---\n\
             template K8sThing -> always\n\
             --- End Dump for Rego ---\n"
        );
    }
}
