//! Connection modules.
//!
//! A module contributes state descriptors to the graph and, per
//! connection, an instance its states can look up. Transport modules also
//! hand the connection a [`Transport`].

use std::any::Any;
use std::sync::Arc;

use crate::descriptor::StateDescriptor;
use crate::error::ConfigurationError;
use crate::internal::ConnectionInternal;
use crate::transport::Transport;

pub trait ModuleDescriptor: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Descriptors this module adds to the graph.
    fn state_descriptors(&self) -> Vec<StateDescriptor>;

    /// Create the per-connection instance.
    fn construct(
        &self,
        internal: &Arc<ConnectionInternal>,
    ) -> Result<ConnectionModule, ConfigurationError>;
}

/// A constructed module.
pub struct ConnectionModule {
    name: &'static str,
    instance: Arc<dyn Any + Send + Sync>,
    transport: Option<Arc<dyn Transport>>,
}

impl ConnectionModule {
    #[must_use]
    pub fn new<T: Any + Send + Sync>(name: &'static str, instance: Arc<T>) -> Self {
        Self {
            name,
            instance,
            transport: None,
        }
    }

    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn transport(&self) -> Option<&Arc<dyn Transport>> {
        self.transport.as_ref()
    }
}

impl std::fmt::Debug for ConnectionModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionModule")
            .field("name", &self.name)
            .field("transport", &self.transport.as_ref().map(|t| t.name().to_owned()))
            .finish_non_exhaustive()
    }
}

/// Every module of one connection.
#[derive(Debug, Default)]
pub(crate) struct ModuleSet {
    modules: Vec<ConnectionModule>,
}

impl ModuleSet {
    pub(crate) fn new(modules: Vec<ConnectionModule>) -> Self {
        Self { modules }
    }

    pub(crate) fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.modules
            .iter()
            .find_map(|module| Arc::clone(&module.instance).downcast::<T>().ok())
    }

    pub(crate) fn transports(&self) -> Vec<Arc<dyn Transport>> {
        self.modules
            .iter()
            .filter_map(|module| module.transport.clone())
            .collect()
    }

    pub(crate) fn names(&self) -> Vec<&'static str> {
        self.modules.iter().map(ConnectionModule::name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct First(u32);
    struct Second;

    #[test]
    fn lookup_by_type() {
        let set = ModuleSet::new(vec![
            ConnectionModule::new("first", Arc::new(First(7))),
            ConnectionModule::new("second", Arc::new(Second)),
        ]);
        assert_eq!(set.get::<First>().map(|m| m.0), Some(7));
        assert!(set.get::<Second>().is_some());
        assert!(set.get::<String>().is_none());
        assert!(set.transports().is_empty());
        assert_eq!(set.names(), vec!["first", "second"]);
    }
}
