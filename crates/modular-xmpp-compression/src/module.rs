//! The compression module and its state.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use modular_xmpp_fsm::internal::NonzaResponse;
use modular_xmpp_fsm::states::{AUTHENTICATED_BUT_UNBOUND, RESOURCE_BINDING};
use modular_xmpp_fsm::state::AttemptResult;
use modular_xmpp_fsm::{
    ConfigurationError, ConnectionError, ConnectionInternal, ConnectionModule, InputOutputFilter,
    ModuleDescriptor, State, StateBinding, StateDescriptor, StateId, TransitionFailure,
    TransitionImpossible, TransitionSuccess, WalkStateGraphContext,
};
use modular_xmpp_types::{ElementName, Nonza};
use tracing::{debug, info};

use crate::filter::ZlibFilter;

pub const COMPRESSION: StateId = StateId::new("Compression");

/// Namespace of the stream feature advertising compression methods.
pub const COMPRESS_FEATURE_NAMESPACE: &str = "http://jabber.org/features/compress";
/// Namespace of the negotiation elements.
pub const COMPRESS_NAMESPACE: &str = "http://jabber.org/protocol/compress";
pub const ZLIB: &str = "zlib";

const MODULE_NAME: &str = "compression";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Adds the `Compression` state. It re-enters `AuthenticatedButUnbound`
/// and is tried before resource binding.
#[derive(Debug, Clone, Copy)]
pub struct CompressionModuleDescriptor {
    level: u32,
}

impl CompressionModuleDescriptor {
    #[must_use]
    pub fn new(level: u32) -> Self {
        Self { level: level.min(9) }
    }
}

impl Default for CompressionModuleDescriptor {
    fn default() -> Self {
        Self::new(6)
    }
}

impl ModuleDescriptor for CompressionModuleDescriptor {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn state_descriptors(&self) -> Vec<StateDescriptor> {
        vec![StateDescriptor::builder(COMPRESSION)
            .predecessor(AUTHENTICATED_BUT_UNBOUND)
            .successor(AUTHENTICATED_BUT_UNBOUND)
            .precedence_over(RESOURCE_BINDING)
            .reference("XEP-0138")
            .factory(|binding| Ok(Arc::new(CompressionState::new(binding)?)))
            .build()]
    }

    fn construct(
        &self,
        _internal: &Arc<ConnectionInternal>,
    ) -> Result<ConnectionModule, ConfigurationError> {
        Ok(ConnectionModule::new(
            MODULE_NAME,
            Arc::new(CompressionModule { level: self.level }),
        ))
    }
}

/// Per-connection compression settings.
#[derive(Debug)]
pub struct CompressionModule {
    level: u32,
}

impl CompressionModule {
    #[must_use]
    pub fn level(&self) -> u32 {
        self.level
    }
}

/// Negotiates zlib compression and restarts the stream through the new
/// filter.
pub struct CompressionState {
    descriptor: Arc<StateDescriptor>,
    internal: Arc<ConnectionInternal>,
    module: Arc<CompressionModule>,
    selected_method: Mutex<Option<&'static str>>,
    installed_filter: Mutex<Option<Arc<dyn InputOutputFilter>>>,
}

impl CompressionState {
    pub fn new(binding: &StateBinding<'_>) -> Result<Self, ConfigurationError> {
        Ok(Self {
            descriptor: binding.descriptor(),
            internal: binding.internal(),
            module: binding.module::<CompressionModule>()?,
            selected_method: Mutex::new(None),
            installed_filter: Mutex::new(None),
        })
    }
}

#[async_trait]
impl State for CompressionState {
    fn descriptor(&self) -> &Arc<StateDescriptor> {
        &self.descriptor
    }

    async fn is_transition_to_possible(
        &self,
        _ctx: &WalkStateGraphContext,
    ) -> Result<Option<TransitionImpossible>, ConnectionError> {
        if !self.internal.config().connection.compression {
            return Ok(Some(TransitionImpossible::new("stream compression disabled")));
        }
        let Some(feature) = self.internal.feature("compression", COMPRESS_FEATURE_NAMESPACE)
        else {
            return Ok(Some(TransitionImpossible::new(
                "stream compression not supported by the server",
            )));
        };
        if !feature.has_value(ZLIB) {
            return Ok(Some(TransitionImpossible::new(
                "no matching compression method offered",
            )));
        }
        *lock(&self.selected_method) = Some(ZLIB);
        Ok(None)
    }

    async fn transition_into(
        &self,
        _ctx: &WalkStateGraphContext,
    ) -> Result<AttemptResult, ConnectionError> {
        let method = lock(&self.selected_method).unwrap_or(ZLIB);
        let request =
            Nonza::new("compress", COMPRESS_NAMESPACE).with_payload(format!("<method>{method}</method>"));
        let response = self
            .internal
            .send_and_wait_for_response(
                request,
                ElementName::new("compressed", COMPRESS_NAMESPACE),
                ElementName::new("failure", COMPRESS_NAMESPACE),
            )
            .await?;

        if let NonzaResponse::Failure(failure) = response {
            debug!(payload = %failure.payload, "server rejected compression");
            return Ok(TransitionFailure::new(format!(
                "server rejected {method} compression"
            ))
            .into());
        }

        let filter: Arc<dyn InputOutputFilter> = Arc::new(ZlibFilter::new(self.module.level()));
        self.internal.add_filter(Arc::clone(&filter));
        *lock(&self.installed_filter) = Some(filter);

        self.internal
            .new_stream_open_wait_for_features_sequence(
                "server stream features after compression enabled",
            )
            .await?;
        self.internal.set_compression_enabled(true);
        info!(%method, "stream compression enabled");

        Ok(TransitionSuccess::new(format!("{method} compression enabled")).into())
    }

    fn reset_state(&self) {
        *lock(&self.selected_method) = None;
        self.internal.set_compression_enabled(false);
        if let Some(filter) = lock(&self.installed_filter).take() {
            self.internal.filters().remove(&filter);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modular_xmpp_fsm::states::core_descriptors;
    use modular_xmpp_fsm::StateDescriptorGraph;

    #[test]
    fn compression_is_tried_before_resource_binding() {
        let mut descriptors = core_descriptors();
        descriptors.extend(CompressionModuleDescriptor::default().state_descriptors());
        descriptors.push(
            StateDescriptor::builder(StateId::new("EstablishingTestConnection"))
                .predecessor(modular_xmpp_fsm::states::LOOKUP_REMOTE_CONNECTION_ENDPOINTS)
                .successor(modular_xmpp_fsm::states::CONNECTED_BUT_UNAUTHENTICATED)
                .build(),
        );
        let graph = StateDescriptorGraph::build(descriptors).unwrap();

        assert_eq!(
            graph.successors_of(AUTHENTICATED_BUT_UNBOUND).unwrap(),
            vec![COMPRESSION, RESOURCE_BINDING]
        );
        assert_eq!(
            graph.successors_of(COMPRESSION).unwrap(),
            vec![AUTHENTICATED_BUT_UNBOUND]
        );
    }

    #[test]
    fn descriptor_names_its_reference() {
        let descriptors = CompressionModuleDescriptor::default().state_descriptors();
        assert_eq!(descriptors[0].full_state_name(false), "Compression (XEP-0138)");
    }

    #[test]
    fn level_is_clamped() {
        assert_eq!(CompressionModuleDescriptor::new(42).level, 9);
    }
}
