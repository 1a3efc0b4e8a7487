//! In-process configurators.
//!
//! Native configurators are functions registered by name at startup. A
//! configurator resource refers to one by its entry name and carries the
//! arguments passed to it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::ProviderError;
use crate::resources::VmResource;

type NativeEntry = Arc<dyn Fn(&VmResource, &Value) -> Result<Value, String> + Send + Sync>;

/// Table of native configuration entry points.
#[derive(Clone, Default)]
pub struct NativeConfigurators {
    entries: HashMap<String, NativeEntry>,
}

impl NativeConfigurators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, entry: F) -> &mut Self
    where
        F: Fn(&VmResource, &Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.entries.insert(name.into(), Arc::new(entry));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn run(&self, name: &str, vm: &VmResource, args: &Value) -> Result<Value, ProviderError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| ProviderError::UnknownNativeEntry(name.to_string()))?;
        entry(vm, args).map_err(ProviderError::ConfigurationFailed)
    }
}

impl fmt::Debug for NativeConfigurators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.entries.keys().collect();
        names.sort();
        f.debug_struct("NativeConfigurators")
            .field("entries", &names)
            .finish()
    }
}
