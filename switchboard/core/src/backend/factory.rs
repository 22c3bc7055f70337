//! Backend Factory
//!
//! Maps a [`BackendType`] to the constructor that builds it. The factory is an
//! ordinary value owned by whoever builds the registry: it is filled by
//! explicit `register` calls, never by load-time side effects.
//!
//! ```ignore
//! let mut factory = BackendFactory::with_builtin();
//! factory.register(BackendType::Anthropic, |d| Ok(Arc::new(AnthropicBackend::new(d)?)));
//! let registry = Registry::new(config, &factory).await?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::mock::MockBackend;
use super::traits::Backend;
use crate::config::{BackendDescriptor, BackendType};
use crate::error::BackendError;

/// Builds one backend handle from its descriptor
pub type BackendConstructor =
    Arc<dyn Fn(&BackendDescriptor) -> Result<Arc<dyn Backend>, BackendError> + Send + Sync>;

/// Constructor registry keyed by backend type
#[derive(Clone, Default)]
pub struct BackendFactory {
    constructors: HashMap<BackendType, BackendConstructor>,
}

impl BackendFactory {
    /// Empty factory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory holding every backend type this crate ships
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut factory = Self::new();
        factory.register(BackendType::Mock, |descriptor| {
            Ok(Arc::new(MockBackend::from_descriptor(descriptor)) as Arc<dyn Backend>)
        });
        factory
    }

    /// Add or replace the constructor for a type
    pub fn register<F>(&mut self, kind: BackendType, constructor: F) -> &mut Self
    where
        F: Fn(&BackendDescriptor) -> Result<Arc<dyn Backend>, BackendError> + Send + Sync + 'static,
    {
        if self.constructors.insert(kind, Arc::new(constructor)).is_some() {
            tracing::debug!(kind = %kind, "Replaced backend constructor");
        }
        self
    }

    /// Whether a constructor exists for the type
    #[must_use]
    pub fn supports(&self, kind: BackendType) -> bool {
        self.constructors.contains_key(&kind)
    }

    /// Build a handle; `None` when the type has no constructor
    pub fn create(
        &self,
        descriptor: &BackendDescriptor,
    ) -> Option<Result<Arc<dyn Backend>, BackendError>> {
        self.constructors
            .get(&descriptor.kind)
            .map(|constructor| constructor(descriptor))
    }
}

impl fmt::Debug for BackendFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&str> = self.constructors.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("BackendFactory").field("kinds", &kinds).finish()
    }
}
