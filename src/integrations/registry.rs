//! Lazy, failure-isolated integration catalog.
//!
//! Integrations register a factory at startup and are instantiated on
//! first use. A factory that fails (or panics) is recorded in the
//! registry's status table and never poisons the other entries.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::error;

use crate::error::{Error, Result};

use super::Integration;

type Factory = Box<dyn Fn() -> Result<Arc<dyn Integration>> + Send + Sync>;

struct Registration {
    factory: Factory,
    enabled: bool,
}

/// Status of one registered integration.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub id: String,
    pub registered: bool,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_init_error: Option<String>,
}

/// String-keyed catalog of integrations with lazy instantiation.
///
/// Registration happens at startup and is not concurrent with dispatch;
/// the interior locks only guard the instance cache and error table.
pub struct IntegrationRegistry {
    order: Vec<String>,
    registrations: HashMap<String, Registration>,
    instances: RwLock<HashMap<String, Arc<dyn Integration>>>,
    init_errors: RwLock<HashMap<String, String>>,
}

impl IntegrationRegistry {
    pub fn new() -> Self {
        Self {
            order: Vec::new(),
            registrations: HashMap::new(),
            instances: RwLock::new(HashMap::new()),
            init_errors: RwLock::new(HashMap::new()),
        }
    }

    /// Register an integration factory under `id`. Re-registering an id
    /// replaces the previous entry but keeps its position.
    pub fn register<F>(&mut self, id: impl Into<String>, enabled: bool, factory: F)
    where
        F: Fn() -> Result<Arc<dyn Integration>> + Send + Sync + 'static,
    {
        let id = id.into();
        if !self.order.contains(&id) {
            self.order.push(id.clone());
        }
        self.registrations.insert(
            id,
            Registration {
                factory: Box::new(factory),
                enabled,
            },
        );
    }

    /// Get an integration, instantiating and caching it on first use.
    ///
    /// Disabled integrations are never instantiated. Factory failures are
    /// recorded in `status(id)` and returned as `IntegrationInit`.
    pub fn get(&self, id: &str) -> Result<Arc<dyn Integration>> {
        if let Some(instance) = self.instances.read().expect("registry lock").get(id) {
            return Ok(Arc::clone(instance));
        }

        let registration = self
            .registrations
            .get(id)
            .ok_or_else(|| Error::integration_init(id, "not registered"))?;
        if !registration.enabled {
            return Err(Error::integration_init(id, "disabled by configuration"));
        }

        // A panicking factory must not take the registry down with it.
        let built = catch_unwind(AssertUnwindSafe(|| (registration.factory)()))
            .unwrap_or_else(|_| Err(Error::integration_init(id, "factory panicked")));

        match built {
            Ok(instance) => {
                self.instances
                    .write()
                    .expect("registry lock")
                    .insert(id.to_string(), Arc::clone(&instance));
                self.init_errors.write().expect("registry lock").remove(id);
                Ok(instance)
            }
            Err(err) => {
                error!(id, error = %err, "integration failed to initialize");
                self.init_errors
                    .write()
                    .expect("registry lock")
                    .insert(id.to_string(), err.to_string());
                Err(err)
            }
        }
    }

    /// Enabled integration ids in registration order.
    pub fn list_enabled(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                self.registrations
                    .get(*id)
                    .is_some_and(|registration| registration.enabled)
            })
            .cloned()
            .collect()
    }

    /// Status for one id; `None` when the id was never registered.
    pub fn status(&self, id: &str) -> SourceStatus {
        let registration = self.registrations.get(id);
        SourceStatus {
            id: id.to_string(),
            registered: registration.is_some(),
            enabled: registration.is_some_and(|r| r.enabled),
            last_init_error: self
                .init_errors
                .read()
                .expect("registry lock")
                .get(id)
                .cloned(),
        }
    }

    /// Statuses for every registered id, in registration order.
    pub fn statuses(&self) -> Vec<SourceStatus> {
        self.order.iter().map(|id| self.status(id)).collect()
    }
}

impl Default for IntegrationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::types::{
        QueryParams, QueryResult, Question, SourceCategory, SourceMetadata,
    };
    use crate::llm::JsonSchema;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubIntegration {
        metadata: SourceMetadata,
    }

    impl StubIntegration {
        fn boxed(id: &str) -> Arc<dyn Integration> {
            Arc::new(Self {
                metadata: SourceMetadata::new(id, SourceCategory::WebSearch),
            })
        }
    }

    #[async_trait]
    impl Integration for StubIntegration {
        fn metadata(&self) -> &SourceMetadata {
            &self.metadata
        }

        fn query_schema(&self) -> JsonSchema {
            JsonSchema::object("stub", vec![])
        }

        async fn generate_query(&self, _question: &Question) -> crate::error::Result<Option<QueryParams>> {
            Ok(Some(QueryParams::new()))
        }

        async fn execute_search(
            &self,
            _params: &QueryParams,
            _credential: Option<&str>,
            _limit: usize,
        ) -> QueryResult {
            QueryResult::ok(&self.metadata.id, vec![], 0, 1, None)
        }
    }

    #[test]
    fn test_lazy_instantiation_and_caching() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = IntegrationRegistry::new();
        let counter = Arc::clone(&calls);
        registry.register("web-search", true, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(StubIntegration::boxed("web-search"))
        });

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        registry.get("web-search").unwrap();
        registry.get("web-search").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_one_bad_factory_does_not_poison_the_registry() {
        let mut registry = IntegrationRegistry::new();
        registry.register("broken", true, || {
            Err(Error::integration_init("broken", "no headless browser found"))
        });
        registry.register("working", true, || Ok(StubIntegration::boxed("working")));

        assert!(registry.get("broken").is_err());
        assert!(registry.get("working").is_ok());

        let status = registry.status("broken");
        assert!(status.registered);
        assert!(status
            .last_init_error
            .as_deref()
            .unwrap()
            .contains("no headless browser"));
        assert!(registry.status("working").last_init_error.is_none());
    }

    #[test]
    fn test_panicking_factory_is_contained() {
        let mut registry = IntegrationRegistry::new();
        registry.register("explosive", true, || panic!("boom"));
        registry.register("calm", true, || Ok(StubIntegration::boxed("calm")));

        assert!(registry.get("explosive").is_err());
        assert_eq!(
            registry.status("explosive").last_init_error.as_deref(),
            Some("Integration 'explosive' failed to initialize: factory panicked")
        );
        assert!(registry.get("calm").is_ok());
    }

    #[test]
    fn test_disabled_is_never_instantiated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = IntegrationRegistry::new();
        let counter = Arc::clone(&calls);
        registry.register("dormant", false, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(StubIntegration::boxed("dormant"))
        });

        assert!(registry.get("dormant").is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!registry.list_enabled().contains(&"dormant".to_string()));
    }

    #[test]
    fn test_list_enabled_preserves_registration_order() {
        let mut registry = IntegrationRegistry::new();
        for id in ["c", "a", "b"] {
            registry.register(id, true, move || Ok(StubIntegration::boxed("x")));
        }
        registry.register("a", false, || Ok(StubIntegration::boxed("a")));

        assert_eq!(registry.list_enabled(), vec!["c", "b"]);
        assert_eq!(registry.statuses().len(), 3);
    }

    #[test]
    fn test_unregistered_status() {
        let registry = IntegrationRegistry::new();
        let status = registry.status("ghost");
        assert!(!status.registered);
        assert!(!status.enabled);
    }
}
