// cache.rs — Namespaces synced as referential data.
//
// Reviews of namespaced objects carry their namespace so namespaceSelector
// can be evaluated without asking the cluster. Only Namespace entries are
// kept; every other data key is ignored.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde_json::Value;

use gk_constraint::{DataCache, TargetError, TargetResult};

#[derive(Debug, Default)]
pub struct NamespaceCache {
    namespaces: RwLock<BTreeMap<String, Value>>,
}

/// The namespace name when `key` addresses a Namespace object.
fn namespace_name(key: &[String]) -> Option<&str> {
    match key {
        [scope, version, kind, name]
            if scope == "cluster" && version == "v1" && kind == "Namespace" =>
        {
            Some(name.as_str())
        }
        _ => None,
    }
}

impl NamespaceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        match self.namespaces.read() {
            Ok(namespaces) => namespaces.get(name).cloned(),
            Err(_) => {
                tracing::warn!("namespace cache lock poisoned; treating '{}' as uncached", name);
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.namespaces.read().map(|n| n.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DataCache for NamespaceCache {
    fn add(&self, key: &[String], value: &Value) -> TargetResult<()> {
        let Some(name) = namespace_name(key) else {
            return Ok(());
        };
        let mut namespaces = self
            .namespaces
            .write()
            .map_err(|_| TargetError::Cache("namespace cache lock poisoned".to_string()))?;
        namespaces.insert(name.to_string(), value.clone());
        tracing::debug!("cached namespace '{}'", name);
        Ok(())
    }

    fn remove(&self, key: &[String]) {
        let Some(name) = namespace_name(key) else {
            return;
        };
        let mut namespaces = self
            .namespaces
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if namespaces.remove(name).is_some() {
            tracing::debug!("evicted namespace '{}'", name);
        }
    }

    fn lookup(&self, key: &[String]) -> Option<Value> {
        namespace_name(key).and_then(|name| self.get(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn keeps_only_namespaces() {
        let cache = NamespaceCache::new();
        let ns = json!({ "metadata": { "name": "web" } });
        cache.add(&key(&["cluster", "v1", "Namespace", "web"]), &ns).unwrap();
        cache
            .add(&key(&["namespace", "web", "v1", "Pod", "nginx"]), &json!({}))
            .unwrap();
        cache.add(&key(&["cluster", "v1", "Node", "n1"]), &json!({})).unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("web"), Some(ns.clone()));
        assert_eq!(cache.lookup(&key(&["cluster", "v1", "Namespace", "web"])), Some(ns));
        assert_eq!(cache.lookup(&key(&["namespace", "web", "v1", "Pod", "nginx"])), None);

        cache.remove(&key(&["cluster", "v1", "Node", "n1"]));
        assert_eq!(cache.len(), 1);
        cache.remove(&key(&["cluster", "v1", "Namespace", "web"]));
        assert!(cache.is_empty());
        assert_eq!(cache.get("web"), None);
    }
}
