use crate::error::{Error, Result};
use crate::model::actor::Actor;
use crate::model::enums::ActorType;
use crate::plugin::processor::Processor;
use crate::plugin::source::SourcePlugin;
use crate::registry::MetadataRegistry;
use crate::string::SmallString;
use num_traits::ToPrimitive;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Stable hash identifying a logical actor: same type, plugin and canonical
/// config always hash to the same key, regardless of the actor's name.
pub fn identity_key(actor_type: ActorType, plugin_id: &str, config: &serde_json::Value) -> SmallString {
    // serde_json orders object keys, so `to_string` is the canonical form.
    let config_json = if config.is_null() {
        "{}".to_owned()
    } else {
        config.to_string()
    };
    let payload = format!("{}|{plugin_id}|{config_json}", actor_type.to_i64().unwrap());
    let digest = Sha256::digest(payload.as_bytes());
    SmallString::new(hex::encode(digest))
}

pub type SourceFactory =
    Arc<dyn Fn(&Actor, &Arc<MetadataRegistry>) -> Result<Arc<dyn SourcePlugin>> + Send + Sync>;
pub type ProcessorFactory =
    Arc<dyn Fn(&Actor, &Arc<MetadataRegistry>) -> Result<Arc<dyn Processor>> + Send + Sync>;

type InstanceKey = (SmallString, SmallString);

/// Maps plugin-id strings to factories and caches constructed instances per
/// `(plugin_id, identity_key)`. Factories validate the actor config before
/// construction; registration is idempotent (last registration wins).
#[derive(Default)]
pub struct PluginRegistry {
    sources: HashMap<SmallString, SourceFactory>,
    processors: HashMap<SmallString, ProcessorFactory>,
    source_instances: Mutex<HashMap<InstanceKey, Arc<dyn SourcePlugin>>>,
    processor_instances: Mutex<HashMap<InstanceKey, Arc<dyn Processor>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_source<F>(&mut self, plugin_id: &str, factory: F)
    where
        F: Fn(&Actor, &Arc<MetadataRegistry>) -> Result<Arc<dyn SourcePlugin>> + Send + Sync + 'static,
    {
        self.sources.insert(SmallString::new(plugin_id), Arc::new(factory));
    }

    pub fn register_processor<F>(&mut self, plugin_id: &str, factory: F)
    where
        F: Fn(&Actor, &Arc<MetadataRegistry>) -> Result<Arc<dyn Processor>> + Send + Sync + 'static,
    {
        self.processors.insert(SmallString::new(plugin_id), Arc::new(factory));
    }

    /// Drops cached instances so the next lookup reconstructs them.
    pub fn refresh(&self) {
        self.source_instances.lock().unwrap().clear();
        self.processor_instances.lock().unwrap().clear();
    }

    /// The source instance for an actor, constructed on first use and shared
    /// afterwards.
    pub fn source_instance(&self, actor: &Actor, registry: &Arc<MetadataRegistry>) -> Result<Arc<dyn SourcePlugin>> {
        let plugin_id = actor
            .plugin_id
            .clone()
            .ok_or_else(|| Error::PluginNotFound(format!("actor {} has no plugin id", actor.id)))?;
        let cache_key = instance_key(actor, &plugin_id);
        if let Some(instance) = self.source_instances.lock().unwrap().get(&cache_key) {
            return Ok(Arc::clone(instance));
        }
        let factory = self
            .sources
            .get(&plugin_id)
            .ok_or_else(|| Error::PluginNotFound(plugin_id.to_string()))?;
        let instance = factory(actor, registry)?;
        self.source_instances
            .lock()
            .unwrap()
            .insert(cache_key, Arc::clone(&instance));
        Ok(instance)
    }

    /// The processor instance for an actor, constructed on first use and
    /// shared afterwards.
    pub fn processor_instance(&self, actor: &Actor, registry: &Arc<MetadataRegistry>) -> Result<Arc<dyn Processor>> {
        let plugin_id = actor
            .plugin_id
            .clone()
            .ok_or_else(|| Error::PluginNotFound(format!("actor {} has no plugin id", actor.id)))?;
        let cache_key = instance_key(actor, &plugin_id);
        if let Some(instance) = self.processor_instances.lock().unwrap().get(&cache_key) {
            return Ok(Arc::clone(instance));
        }
        let factory = self
            .processors
            .get(&plugin_id)
            .ok_or_else(|| Error::PluginNotFound(plugin_id.to_string()))?;
        let instance = factory(actor, registry)?;
        self.processor_instances
            .lock()
            .unwrap()
            .insert(cache_key, Arc::clone(&instance));
        Ok(instance)
    }
}

fn instance_key(actor: &Actor, plugin_id: &SmallString) -> InstanceKey {
    let identity = actor
        .identity_key
        .clone()
        .unwrap_or_else(|| identity_key(actor.type_, plugin_id, &actor.config_value()));
    (plugin_id.clone(), identity)
}

/// Deserializes an actor's config into a plugin's config model, reporting
/// validation failures as config errors.
pub fn parse_config<C: serde::de::DeserializeOwned>(plugin_id: &str, actor: &Actor) -> Result<C> {
    serde_json::from_value(actor.config_value()).map_err(|err| Error::PluginConfig {
        plugin_id: plugin_id.to_owned(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn identity_is_config_order_insensitive() {
        let left: serde_json::Value = serde_json::from_str(r#"{"root":"/a","depth":2}"#).unwrap();
        let right: serde_json::Value = serde_json::from_str(r#"{"depth":2,"root":"/a"}"#).unwrap();
        assert_eq!(
            identity_key(ActorType::Source, "katalog.sources.fs", &left),
            identity_key(ActorType::Source, "katalog.sources.fs", &right),
        );
    }

    #[test]
    fn identity_differs_by_type_plugin_and_config() {
        let config = json!({"root": "/a"});
        let base = identity_key(ActorType::Source, "katalog.sources.fs", &config);
        assert_ne!(base, identity_key(ActorType::Processor, "katalog.sources.fs", &config));
        assert_ne!(base, identity_key(ActorType::Source, "katalog.sources.web", &config));
        assert_ne!(
            base,
            identity_key(ActorType::Source, "katalog.sources.fs", &json!({"root": "/b"}))
        );
    }

    #[test]
    fn null_config_hashes_like_empty_object() {
        assert_eq!(
            identity_key(ActorType::Source, "p", &serde_json::Value::Null),
            identity_key(ActorType::Source, "p", &json!({})),
        );
    }

    #[test]
    fn instance_cache_reuses_constructions() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let constructed = Arc::new(AtomicUsize::new(0));
        let mut registry = PluginRegistry::new();
        let counter = Arc::clone(&constructed);
        registry.register_processor("katalog.test.counting", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(crate::test::CountingProcessor))
        });

        let metadata_registry = Arc::new(crate::registry::MetadataRegistry::with_builtin_keys());
        let actor = crate::test::actor_stub(7, "katalog.test.counting", ActorType::Processor);
        registry.processor_instance(&actor, &metadata_registry).unwrap();
        registry.processor_instance(&actor, &metadata_registry).unwrap();
        assert_eq!(constructed.load(Ordering::SeqCst), 1);

        registry.refresh();
        registry.processor_instance(&actor, &metadata_registry).unwrap();
        assert_eq!(constructed.load(Ordering::SeqCst), 2);
    }
}
