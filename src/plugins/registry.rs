//! Plugin registry and dependency resolution

use super::base::{PluginConfig, PluginFactory, PluginMetadata};
use super::manifest::PluginManifest;
use crate::error::{EngineError, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where a registered plugin came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginSource {
    /// Compiled-in factory
    Builtin,
    /// Manifest file in a plugin directory
    Manifest(PathBuf),
}

/// A plugin that can be loaded
#[derive(Clone)]
pub struct RegisteredPlugin {
    pub name: String,
    pub factory: Arc<dyn PluginFactory>,
    pub metadata: PluginMetadata,
    pub config: PluginConfig,
    pub source: PluginSource,
}

/// Factories by kind, plugin entries by name, in registration order
#[derive(Default)]
pub struct PluginRegistry {
    factories: HashMap<String, Arc<dyn PluginFactory>>,
    entries: HashMap<String, RegisteredPlugin>,
    order: Vec<String>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a factory kind available to manifests
    pub fn add_factory(&mut self, factory: Arc<dyn PluginFactory>) -> String {
        let kind = factory.metadata().name;
        self.factories.insert(kind.clone(), factory);
        kind
    }

    pub fn factory(&self, kind: &str) -> Option<Arc<dyn PluginFactory>> {
        self.factories.get(kind).cloned()
    }

    /// Register (or replace) the compiled-in plugin for a factory
    pub fn register_builtin(&mut self, factory: Arc<dyn PluginFactory>, config: PluginConfig) -> String {
        let kind = self.add_factory(factory.clone());
        let metadata = factory.metadata();
        self.insert(RegisteredPlugin {
            name: kind.clone(),
            factory,
            metadata,
            config,
            source: PluginSource::Builtin,
        });
        kind
    }

    /// Register (or replace) a manifest-declared plugin
    pub fn register_manifest(
        &mut self,
        path: &Path,
        manifest: &PluginManifest,
        base_config: PluginConfig,
    ) -> Result<String> {
        let factory = self.factory(&manifest.plugin.kind).ok_or_else(|| {
            EngineError::plugin_load(format!(
                "manifest {} references unknown plugin kind '{}'",
                path.display(),
                manifest.plugin.kind
            ))
        })?;

        let mut metadata = factory.metadata();
        metadata.name = manifest.plugin.name.clone();
        if let Some(description) = &manifest.plugin.description {
            metadata.description = description.clone();
        }
        for dependency in &manifest.plugin.dependencies {
            if !metadata.dependencies.contains(dependency) {
                metadata.dependencies.push(dependency.clone());
            }
        }

        let name = manifest.plugin.name.clone();
        if let Some(existing) = self.entries.get(&name) {
            if existing.source != PluginSource::Manifest(path.to_path_buf()) {
                return Err(EngineError::plugin_load(format!(
                    "plugin '{name}' from {} is already registered from another source",
                    path.display()
                )));
            }
        }

        self.insert(RegisteredPlugin {
            name: name.clone(),
            factory,
            metadata,
            config: manifest.apply_to(base_config),
            source: PluginSource::Manifest(path.to_path_buf()),
        });
        Ok(name)
    }

    fn insert(&mut self, plugin: RegisteredPlugin) {
        if !self.entries.contains_key(&plugin.name) {
            self.order.push(plugin.name.clone());
        }
        self.entries.insert(plugin.name.clone(), plugin);
    }

    pub fn unregister(&mut self, name: &str) -> Option<RegisteredPlugin> {
        self.order.retain(|n| n != name);
        self.entries.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredPlugin> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Names in registration order
    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find_by_path(&self, path: &Path) -> Option<String> {
        self.entries
            .values()
            .find(|p| matches!(&p.source, PluginSource::Manifest(source) if source == path))
            .map(|p| p.name.clone())
    }

    pub fn dependencies_of(&self, name: &str) -> Vec<String> {
        self.entries
            .get(name)
            .map(|p| p.metadata.dependencies.clone())
            .unwrap_or_default()
    }

    /// Registered plugins declaring `name` as a dependency
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        self.order
            .iter()
            .filter(|n| {
                self.entries
                    .get(*n)
                    .map(|p| p.metadata.dependencies.iter().any(|d| d == name))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Dependency-first order covering `roots` and everything they need.
    ///
    /// A missing dependency or a cycle is a load error naming the chain.
    pub fn resolve_load_order(&self, roots: &[String]) -> Result<Vec<String>> {
        let mut order = Vec::new();
        let mut done = HashSet::new();
        let mut path = Vec::new();

        for root in roots {
            self.visit(root, &mut path, &mut done, &mut order)?;
        }
        Ok(order)
    }

    fn visit(
        &self,
        name: &str,
        path: &mut Vec<String>,
        done: &mut HashSet<String>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        if done.contains(name) {
            return Ok(());
        }
        if let Some(start) = path.iter().position(|n| n == name) {
            let mut cycle = path[start..].to_vec();
            cycle.push(name.to_string());
            return Err(EngineError::plugin_load(format!(
                "Circular dependency detected: {}",
                cycle.join(" -> ")
            )));
        }

        let plugin = self.entries.get(name).ok_or_else(|| match path.last() {
            Some(parent) => EngineError::plugin_load(format!(
                "plugin '{parent}' depends on missing plugin '{name}'"
            )),
            None => EngineError::not_found(format!("plugin '{name}' is not registered")),
        })?;

        path.push(name.to_string());
        for dependency in &plugin.metadata.dependencies {
            self.visit(dependency, path, done, order)?;
        }
        path.pop();

        done.insert(name.to_string());
        order.push(name.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::base::{factory_fn, DiscoveryPlugin};

    fn factory(name: &str, deps: &[&str]) -> Arc<dyn PluginFactory> {
        let mut metadata = PluginMetadata::new(name, "1.0").with_protocol(name);
        for dep in deps {
            metadata = metadata.with_dependency(*dep);
        }
        factory_fn(metadata, |_| -> Result<Arc<dyn DiscoveryPlugin>> {
            Err(EngineError::plugin_load("not used"))
        })
    }

    fn registry(specs: Vec<(&str, Vec<&str>)>) -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        for (name, deps) in specs {
            registry.register_builtin(factory(name, &deps), PluginConfig::new(name));
        }
        registry
    }

    #[test]
    fn test_dependencies_come_first() {
        let registry = registry(vec![
            ("app", vec!["net", "dns"]),
            ("dns", vec!["net"]),
            ("net", vec![]),
        ]);
        let order = registry.resolve_load_order(&["app".to_string()]).unwrap();
        assert_eq!(order, vec!["net", "dns", "app"]);
        assert_eq!(registry.dependents_of("net"), vec!["app", "dns"]);
    }

    #[test]
    fn test_cycle_is_reported() {
        let registry = registry(vec![("a", vec!["b"]), ("b", vec!["c"]), ("c", vec!["a"])]);
        let err = registry.resolve_load_order(&["a".to_string()]).unwrap_err();
        assert!(matches!(err, EngineError::PluginLoad(_)));
        assert!(err.to_string().contains("a -> b -> c -> a"));
    }

    #[test]
    fn test_missing_dependency_is_reported() {
        let registry = registry(vec![("snmp", vec!["credentials"])]);
        let err = registry.resolve_load_order(&["snmp".to_string()]).unwrap_err();
        assert!(err.to_string().contains("missing plugin 'credentials'"));
    }

    #[test]
    fn test_manifest_needs_known_kind() {
        let mut registry = registry(vec![("mdns", vec![])]);
        let manifest = PluginManifest::parse(
            "[plugin]\nname = \"lab_mdns\"\nkind = \"mdns\"\ndependencies = [\"mdns\"]\n",
        )
        .unwrap();
        let name = registry
            .register_manifest(Path::new("/plugins/lab.toml"), &manifest, PluginConfig::new("mdns"))
            .unwrap();
        assert_eq!(name, "lab_mdns");
        assert_eq!(registry.find_by_path(Path::new("/plugins/lab.toml")), Some(name));
        assert_eq!(registry.dependencies_of("lab_mdns"), vec!["mdns"]);

        let unknown = PluginManifest::parse("[plugin]\nname = \"x\"\nkind = \"zigbee\"\n").unwrap();
        assert!(registry
            .register_manifest(Path::new("/plugins/x.toml"), &unknown, PluginConfig::new("x"))
            .is_err());
    }
}
