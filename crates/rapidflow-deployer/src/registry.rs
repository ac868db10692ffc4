//! Keyed lookup from output-type tag to provider.

use std::collections::HashMap;
use std::sync::Arc;

use crate::provider::OutputProvider;

/// Registry of output providers, populated once at startup.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<&'static str, Arc<dyn OutputProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The full built-in provider set.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::s3::S3Provider::new()));
        registry.register(Arc::new(crate::local::LocalProvider::new()));
        registry.register(Arc::new(crate::webhook::WebhookProvider::new()));
        registry.register(Arc::new(crate::email::EmailProvider::new()));
        registry.register(Arc::new(crate::vps::VpsProvider::new()));
        registry.register(Arc::new(crate::nginx::NginxProvider::new()));
        registry
    }

    /// Store a provider under its own type tag. A later registration for the
    /// same tag replaces the earlier one.
    pub fn register(&mut self, provider: Arc<dyn OutputProvider>) {
        self.providers.insert(provider.output_type(), provider);
    }

    pub fn lookup(&self, output_type: &str) -> Option<Arc<dyn OutputProvider>> {
        self.providers.get(output_type).cloned()
    }
}
