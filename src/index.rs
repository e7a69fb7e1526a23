use std::collections::HashMap;
use std::sync::Arc;

use kube::runtime::reflector::{Lookup, ObjectRef, Store};

use crate::crd::{CatalogKind, RegistryDeployment};
use crate::error::{AppError, AppResult};

// Canonical index names. Reconcilers register the indexes they need before
// the controllers start; reading an unregistered index is a programmer
// error.
pub const INDEX_CATALOG_NAME: &str = "catalog.name";
pub const INDEX_CATALOG_IS_LATEST: &str = "catalog.isLatest";
pub const INDEX_CATALOG_PUBLISHED: &str = "catalog.published";
pub const INDEX_DEPLOYMENT_RESOURCE_NAME: &str = "deployment.resourceName";
pub const INDEX_DEPLOYMENT_RESOURCE_TYPE: &str = "deployment.resourceType";
pub const INDEX_DEPLOYMENT_RUNTIME: &str = "deployment.runtime";

type Extractor<K> = Box<dyn Fn(&K) -> Option<String> + Send + Sync>;

/// Named secondary indexes over an informer cache. Reads scan the shared
/// reflector store and apply the registered extractor, giving the
/// informer-cache contract: eventually consistent reads over linearizable
/// per-object writes.
pub struct FieldIndex<K>
where
    K: Lookup + Clone + 'static,
    K::DynamicType: std::hash::Hash + Eq + Clone,
{
    store: Store<K>,
    extractors: HashMap<&'static str, Extractor<K>>,
}

impl<K> FieldIndex<K>
where
    K: Lookup + Clone + 'static,
    K::DynamicType: std::hash::Hash + Eq + Clone + Default,
{
    pub fn new(store: Store<K>) -> Self {
        FieldIndex {
            store,
            extractors: HashMap::new(),
        }
    }

    /// Register an extractor under a field name. Registering the same field
    /// twice is a startup bug and panics rather than silently shadowing.
    pub fn with(mut self, field: &'static str, extract: Extractor<K>) -> Self {
        if self.extractors.insert(field, extract).is_some() {
            panic!("index {field} registered twice");
        }
        self
    }

    /// All cached objects whose extracted field equals `value`
    pub fn list_by(&self, field: &str, value: &str) -> AppResult<Vec<Arc<K>>> {
        let extract = self
            .extractors
            .get(field)
            .ok_or_else(|| AppError::Internal(format!("index {field} is not registered")))?;

        Ok(self
            .store
            .state()
            .into_iter()
            .filter(|obj| extract(obj).as_deref() == Some(value))
            .collect())
    }

    /// Every cached object, in no particular order
    pub fn all(&self) -> Vec<Arc<K>> {
        self.store.state()
    }

    /// Point read from the cache
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        let mut key: ObjectRef<K> = ObjectRef::new_with(name, Default::default());
        key.namespace = Some(namespace.to_string());
        self.store.get(&key)
    }

    /// Blocks until the underlying reflector has completed its initial list
    pub async fn wait_until_ready(&self) -> AppResult<()> {
        self.store
            .wait_until_ready()
            .await
            .map_err(|e| AppError::Internal(format!("cache never became ready: {e}")))
    }
}

/// The canonical catalog indexes, shared by all four catalog kinds
pub fn catalog_index<K>(store: Store<K>) -> FieldIndex<K>
where
    K: CatalogKind,
{
    FieldIndex::new(store)
        .with(
            INDEX_CATALOG_NAME,
            Box::new(|obj: &K| Some(obj.entry().name.clone())),
        )
        .with(
            INDEX_CATALOG_IS_LATEST,
            Box::new(|obj: &K| {
                Some(
                    obj.status()
                        .map(|s| s.is_latest)
                        .unwrap_or(false)
                        .to_string(),
                )
            }),
        )
        .with(
            INDEX_CATALOG_PUBLISHED,
            Box::new(|obj: &K| {
                Some(
                    obj.status()
                        .and_then(|s| s.published)
                        .unwrap_or(false)
                        .to_string(),
                )
            }),
        )
}

/// The canonical deployment indexes
pub fn deployment_index(store: Store<RegistryDeployment>) -> FieldIndex<RegistryDeployment> {
    FieldIndex::new(store)
        .with(
            INDEX_DEPLOYMENT_RESOURCE_NAME,
            Box::new(|rd: &RegistryDeployment| Some(rd.spec.resource_name.clone())),
        )
        .with(
            INDEX_DEPLOYMENT_RESOURCE_TYPE,
            Box::new(|rd: &RegistryDeployment| Some(rd.spec.resource_type.to_string())),
        )
        .with(
            INDEX_DEPLOYMENT_RUNTIME,
            Box::new(|rd: &RegistryDeployment| Some(rd.spec.runtime.to_string())),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CatalogEntry, MCPServerCatalog};
    use kube::runtime::reflector::store::Writer;
    use kube::runtime::watcher;

    fn record(name: &str, spec_name: &str, version: &str, latest: bool) -> MCPServerCatalog {
        let mut obj = MCPServerCatalog::from_discovered(
            name,
            CatalogEntry {
                name: spec_name.to_string(),
                version: version.to_string(),
                ..Default::default()
            },
        );
        obj.metadata.namespace = Some("registry".to_string());
        obj.status = Some(crate::crd::CatalogStatus {
            is_latest: latest,
            ..Default::default()
        });
        obj
    }

    fn populated_index(records: Vec<MCPServerCatalog>) -> FieldIndex<MCPServerCatalog> {
        let mut writer: Writer<MCPServerCatalog> = Writer::default();
        for r in records {
            writer.apply_watcher_event(&watcher::Event::Apply(r));
        }
        catalog_index(writer.as_reader())
    }

    #[test]
    fn list_by_name_returns_the_whole_version_group() {
        let index = populated_index(vec![
            record("tool-1-0-0", "tool", "1.0.0", false),
            record("tool-2-0-0", "tool", "2.0.0", true),
            record("other-1-0-0", "other", "1.0.0", true),
        ]);

        let group = index
            .list_by(INDEX_CATALOG_NAME, "tool")
            .expect("registered index");
        assert_eq!(group.len(), 2);
        assert!(group.iter().all(|r| r.entry().name == "tool"));
    }

    #[test]
    fn latest_index_projects_status_booleans() {
        let index = populated_index(vec![
            record("tool-1-0-0", "tool", "1.0.0", false),
            record("tool-2-0-0", "tool", "2.0.0", true),
        ]);

        let latest = index
            .list_by(INDEX_CATALOG_IS_LATEST, "true")
            .expect("registered index");
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].entry().version, "2.0.0");
    }

    #[test]
    fn unregistered_index_is_an_error() {
        let index = populated_index(vec![]);
        let err = index
            .list_by("catalog.bogus", "x")
            .expect_err("unregistered");
        assert!(matches!(err, AppError::Internal(_)));
    }

    #[test]
    fn point_reads_hit_the_cache() {
        let index = populated_index(vec![record("tool-1-0-0", "tool", "1.0.0", false)]);
        assert!(index.get("registry", "tool-1-0-0").is_some());
        assert!(index.get("registry", "missing").is_none());
        assert!(index.get("elsewhere", "tool-1-0-0").is_none());
    }
}
