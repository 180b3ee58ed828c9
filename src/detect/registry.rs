use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use super::backend::DetectorBackend;
use super::backends::StubBackend;
use super::labels::Labels;
use crate::config::DetectorSettings;

/// Registry of loaded detector backends.
///
/// Backends are shared as `Arc<dyn DetectorBackend>`; `detect` takes `&self`,
/// so no lock is needed around them.
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn DetectorBackend>>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: BTreeMap::new(),
            default_name: None,
        }
    }

    /// Load the backends available for `settings` and make the configured one
    /// the default.
    pub fn from_settings(settings: &DetectorSettings) -> Result<Self> {
        let labels = match &settings.labels_path {
            Some(path) => Labels::from_file(path)?,
            None => Labels::coco(),
        };

        let mut registry = Self::new();
        registry.register(StubBackend::new().with_labels(labels.clone()));

        #[cfg(feature = "backend-tract")]
        if let Some(model_path) = &settings.model_path {
            let backend = super::backends::TractBackend::new(model_path, settings.input_size)?
                .with_iou_threshold(settings.iou_threshold)
                .with_labels(labels);
            registry.register(backend);
        }

        registry.set_default(&settings.backend)?;
        Ok(registry)
    }

    /// Register a backend. The first registered backend becomes the default.
    pub fn register<B: DetectorBackend + 'static>(&mut self, backend: B) {
        let name = backend.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.backends.insert(name, Arc::new(backend));
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(anyhow!(
                "detector backend '{}' not available (loaded: {})",
                name,
                self.list().join(", ")
            ));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DetectorBackend>> {
        self.backends.get(name).cloned()
    }

    pub fn default_backend(&self) -> Result<Arc<dyn DetectorBackend>> {
        self.default_name
            .as_ref()
            .and_then(|name| self.get(name))
            .ok_or_else(|| anyhow!("no detector backend registered"))
    }

    /// Registered backend names in sorted order.
    pub fn list(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
