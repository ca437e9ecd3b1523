// registry.rs — Template registry and per-template constraint store.
//
// Everything here lives behind the client's single RwLock. Entries are
// mutated in place on template updates so constraints survive them.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::constraint::{Constraint, EnforcementSettings};
use crate::target::{Matcher, TargetHandler};
use crate::template::ConstraintTemplate;

/// Drivers currently holding a template, in the order they were added.
///
/// Normally a single driver. A second one appears while a template migrates
/// between engines and stays if a migration is interrupted; the next
/// successful AddTemplate prunes back to one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveDrivers(Vec<String>);

impl ActiveDrivers {
    /// Add `driver`; adding a driver twice is a no-op.
    pub fn insert(&mut self, driver: &str) {
        if !self.contains(driver) {
            self.0.push(driver.to_string());
        }
    }

    pub fn remove(&mut self, driver: &str) {
        self.0.retain(|d| d != driver);
    }

    pub fn contains(&self, driver: &str) -> bool {
        self.0.iter().any(|d| d == driver)
    }

    /// True when `driver` is the one and only active driver.
    pub fn is_only(&self, driver: &str) -> bool {
        self.0.len() == 1 && self.0[0] == driver
    }

    /// Every active driver except `keep`.
    pub fn others(&self, keep: &str) -> Vec<String> {
        self.0.iter().filter(|d| *d != keep).cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// A stored constraint with everything queries need precomputed.
pub(crate) struct ConstraintEntry {
    pub constraint: Constraint,
    pub enforcement: EnforcementSettings,
    pub matcher: Box<dyn Matcher>,
}

pub(crate) struct TemplateEntry {
    pub template: ConstraintTemplate,
    pub schema: Value,
    pub target: Arc<dyn TargetHandler>,
    /// Driver resolved for the current template's engines.
    pub driver: String,
    pub active_drivers: ActiveDrivers,
    /// Set when the resolved driver changed and cached constraints still
    /// have to be replayed onto it.
    pub needs_replay: bool,
    pub constraints: BTreeMap<String, ConstraintEntry>,
}

impl TemplateEntry {
    pub fn new(
        template: ConstraintTemplate,
        schema: Value,
        target: Arc<dyn TargetHandler>,
        driver: &str,
    ) -> Self {
        Self {
            template,
            schema,
            target,
            driver: driver.to_string(),
            active_drivers: ActiveDrivers::default(),
            needs_replay: false,
            constraints: BTreeMap::new(),
        }
    }

    /// Replace template, schema, target and resolved driver in place.
    pub fn update(
        &mut self,
        template: ConstraintTemplate,
        schema: Value,
        target: Arc<dyn TargetHandler>,
        driver: &str,
    ) {
        self.template = template;
        self.schema = schema;
        self.target = target;
        self.driver = driver.to_string();
    }

    /// Nothing left to do for `driver`: no pending replay and no leftover
    /// drivers from an earlier migration.
    pub fn is_settled_on(&self, driver: &str) -> bool {
        !self.needs_replay && self.active_drivers.is_only(driver)
    }

    pub fn target_name(&self) -> &str {
        self.target.name()
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    pub templates: BTreeMap<String, TemplateEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_drivers_is_an_ordered_set() {
        let mut drivers = ActiveDrivers::default();
        assert_eq!(drivers.iter().count(), 0);
        drivers.insert("Rego");
        drivers.insert("CEL");
        drivers.insert("Rego");
        assert_eq!(drivers.iter().collect::<Vec<_>>(), vec!["Rego", "CEL"]);
        assert!(!drivers.is_only("CEL"));
        assert_eq!(drivers.others("CEL"), vec!["Rego"]);

        drivers.remove("Rego");
        drivers.remove("Rego");
        assert!(drivers.is_only("CEL"));
        assert!(drivers.contains("CEL"));
    }
}
