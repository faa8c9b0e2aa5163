//! Encryption module registry and enablement state.
//!
//! One registry is built at startup and shared via `Arc`. Descriptors keep
//! registration order; instances are created lazily and cached per id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use sfe_core::config::{ConfigStore, CORE_APP, DEFAULT_MODULE_KEY, ENCRYPTION_ENABLED_KEY};
use sfe_core::{SfeError, SfeResult};
use tracing::{debug, info, warn};

use crate::header::{get_encryption_module_id, Header};
use crate::module::{EncryptionModule, EncryptionModuleDescriptor, ModuleFactory};

pub struct ModuleRegistry {
    config: Arc<dyn ConfigStore>,
    modules: RwLock<Vec<EncryptionModuleDescriptor>>,
    instances: Mutex<HashMap<String, Arc<dyn EncryptionModule>>>,
}

impl ModuleRegistry {
    pub fn new(config: Arc<dyn ConfigStore>) -> Self {
        Self {
            config,
            modules: RwLock::new(Vec::new()),
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Arc<dyn ConfigStore> {
        &self.config
    }

    // ── Enablement ────────────────────────────────────────────────────────────

    /// The config flag is on and at least one module is registered.
    pub fn is_enabled(&self) -> bool {
        if self.module_count() == 0 {
            return false;
        }
        let fallback = if self
            .config
            .get_system_value_bool(ENCRYPTION_ENABLED_KEY, false)
        {
            "yes"
        } else {
            "no"
        };
        self.config
            .get_app_value(CORE_APP, ENCRYPTION_ENABLED_KEY, fallback)
            == "yes"
    }

    pub fn set_enabled(&self, enabled: bool) -> SfeResult<()> {
        let value = if enabled { "yes" } else { "no" };
        self.config
            .set_app_value(CORE_APP, ENCRYPTION_ENABLED_KEY, value)?;
        info!(enabled, "server-side encryption flag changed");
        Ok(())
    }

    // ── Registration ──────────────────────────────────────────────────────────

    pub fn register_encryption_module<F>(
        &self,
        id: &str,
        display_name: &str,
        factory: F,
    ) -> SfeResult<()>
    where
        F: Fn() -> Arc<dyn EncryptionModule> + Send + Sync + 'static,
    {
        let mut modules = self.modules.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = modules.iter().find(|m| m.id == id) {
            return Err(SfeError::ModuleAlreadyExists {
                id: id.to_string(),
                display_name: existing.display_name.clone(),
            });
        }
        let factory: ModuleFactory = Arc::new(factory);
        modules.push(EncryptionModuleDescriptor {
            id: id.to_string(),
            display_name: display_name.to_string(),
            factory,
        });
        debug!(module = %id, display_name, "encryption module registered");
        Ok(())
    }

    pub fn unregister_encryption_module(&self, id: &str) {
        let removed = {
            let mut modules = self.modules.write().unwrap_or_else(PoisonError::into_inner);
            let before = modules.len();
            modules.retain(|m| m.id != id);
            modules.len() != before
        };
        if removed {
            self.instances
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(id);
            debug!(module = %id, "encryption module unregistered");
        }
    }

    /// Descriptors in registration order.
    pub fn get_encryption_modules(&self) -> Vec<EncryptionModuleDescriptor> {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn module_count(&self) -> usize {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    // ── Lookup ────────────────────────────────────────────────────────────────

    /// Resolve a module by id, or the default module when `id` is `None`.
    pub fn get_encryption_module(&self, id: Option<&str>) -> SfeResult<Arc<dyn EncryptionModule>> {
        match id {
            Some(id) => self.instantiate(id),
            None => self.default_module(),
        }
    }

    /// Configured default id, `""` when unset.
    pub fn get_default_encryption_module_id(&self) -> String {
        self.config.get_app_value(CORE_APP, DEFAULT_MODULE_KEY, "")
    }

    /// Persist `id` as the default. Returns false (and keeps the previous
    /// default) if `id` is not registered or the store refuses the write.
    pub fn set_default_encryption_module(&self, id: &str) -> bool {
        if !self.contains(id) {
            warn!(module = %id, "refusing to set unknown module as default");
            return false;
        }
        match self.config.set_app_value(CORE_APP, DEFAULT_MODULE_KEY, id) {
            Ok(()) => {
                info!(module = %id, "default encryption module changed");
                true
            }
            Err(e) => {
                warn!(module = %id, "failed to persist default module: {e}");
                false
            }
        }
    }

    /// The module that wrote a file, falling back to the default for headers
    /// that carry no module id.
    pub fn get_module_for_header(&self, header: &Header) -> SfeResult<Arc<dyn EncryptionModule>> {
        match get_encryption_module_id(header) {
            "" => self.default_module(),
            id => self.instantiate(id),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|m| m.id == id)
    }

    fn default_module(&self) -> SfeResult<Arc<dyn EncryptionModule>> {
        let configured = self.get_default_encryption_module_id();
        if !configured.is_empty() {
            return self.instantiate(&configured);
        }

        let only = {
            let modules = self.modules.read().unwrap_or_else(PoisonError::into_inner);
            match modules.as_slice() {
                [single] => single.id.clone(),
                [] => {
                    return Err(SfeError::ModuleDoesNotExist(
                        "no encryption module registered".into(),
                    ))
                }
                _ => {
                    return Err(SfeError::ModuleDoesNotExist(
                        "no default encryption module configured and more than one module registered"
                            .into(),
                    ))
                }
            }
        };
        self.instantiate(&only)
    }

    fn instantiate(&self, id: &str) -> SfeResult<Arc<dyn EncryptionModule>> {
        if let Some(module) = self
            .instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
        {
            return Ok(Arc::clone(module));
        }

        let factory = self
            .modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|m| m.id == id)
            .map(|m| Arc::clone(&m.factory))
            .ok_or_else(|| SfeError::ModuleDoesNotExist(id.to_string()))?;

        let module = factory();
        if module.id() != id {
            return Err(SfeError::ModuleDoesNotExist(format!(
                "factory registered as \"{id}\" built module \"{}\"",
                module.id()
            )));
        }
        // factories run unlocked; a concurrent build loses to the first insert
        let module = Arc::clone(
            self.instances
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(id.to_string())
                .or_insert(module),
        );
        debug!(module = %id, "encryption module instantiated");
        Ok(module)
    }
}
