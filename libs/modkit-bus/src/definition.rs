//! Consumer and endpoint definitions, and their per-consumer resolution.
//!
//! A [`ConsumerDefinition`] carries consumer-level behavior (explicit endpoint name,
//! concurrency, a configuration hook). An [`EndpointDefinition`] carries endpoint-level
//! settings and may be registered separately; when present it overrides whatever endpoint
//! settings the consumer definition declares.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::configurator::ConsumerConfigurator;
use crate::endpoint::ReceiveEndpointBuilder;
use crate::error::BusError;
use crate::hub::ServiceHub;
use crate::naming::{EndpointNameFormatter, short_type_name};
use crate::registration::Consumer;

/// Receive endpoint settings. Unset fields are filled from the bus defaults when the endpoint
/// is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EndpointSettings {
    /// Explicit endpoint name; generated by the name formatter when `None`.
    pub name: Option<String>,
    pub prefetch_count: Option<u16>,
    pub concurrent_message_limit: Option<usize>,
    /// Temporary endpoints are removed when the bus stops.
    pub temporary: bool,
}

impl EndpointSettings {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Copy with every unset field taken from `defaults`.
    #[must_use]
    pub fn or_defaults(&self, defaults: &EndpointSettings) -> EndpointSettings {
        EndpointSettings {
            name: self.name.clone().or_else(|| defaults.name.clone()),
            prefetch_count: self.prefetch_count.or(defaults.prefetch_count),
            concurrent_message_limit: self
                .concurrent_message_limit
                .or(defaults.concurrent_message_limit),
            temporary: self.temporary || defaults.temporary,
        }
    }
}

/// Endpoint-level policy for consumer `C`, registered in the hub as
/// `dyn EndpointDefinition<C>`.
pub trait EndpointDefinition<C: ?Sized>: Send + Sync {
    fn settings(&self) -> EndpointSettings;
}

impl<C: ?Sized> EndpointDefinition<C> for EndpointSettings {
    fn settings(&self) -> EndpointSettings {
        self.clone()
    }
}

/// Consumer-level policy for consumer `C`, registered in the hub as
/// `dyn ConsumerDefinition<C>`. Every method has a framework default.
pub trait ConsumerDefinition<C: Consumer>: Send + Sync {
    /// Endpoint name used when no endpoint definition names the endpoint.
    fn endpoint_name(&self) -> Option<String> {
        None
    }

    fn concurrent_message_limit(&self) -> Option<usize> {
        None
    }

    /// Endpoint settings used when no separate endpoint definition is registered.
    fn endpoint_settings(&self) -> EndpointSettings {
        EndpointSettings::default()
    }

    /// Runs before any queued configure action.
    fn configure(
        &self,
        _endpoint: &mut dyn ReceiveEndpointBuilder,
        _consumer: &mut ConsumerConfigurator<C>,
        _hub: &ServiceHub,
    ) {
    }
}

/// Baseline definition used for consumers without a registered one.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConsumerDefinition;

impl<C: Consumer> ConsumerDefinition<C> for DefaultConsumerDefinition {}

/// The resolved policy for one consumer type: its consumer definition plus the attached
/// endpoint definition, if any.
pub struct Definition<C: Consumer> {
    consumer: Arc<dyn ConsumerDefinition<C>>,
    endpoint: Option<Arc<dyn EndpointDefinition<C>>>,
    is_default: bool,
}

impl<C: Consumer> Definition<C> {
    #[must_use]
    pub fn new(consumer: Arc<dyn ConsumerDefinition<C>>) -> Self {
        Self {
            consumer,
            endpoint: None,
            is_default: false,
        }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        Self {
            consumer: Arc::new(DefaultConsumerDefinition),
            endpoint: None,
            is_default: true,
        }
    }

    /// Attach an endpoint definition, replacing any previous one.
    pub fn set_endpoint_definition(&mut self, endpoint: Arc<dyn EndpointDefinition<C>>) {
        self.endpoint = Some(endpoint);
    }

    #[must_use]
    pub fn consumer_definition(&self) -> &Arc<dyn ConsumerDefinition<C>> {
        &self.consumer
    }

    #[must_use]
    pub fn endpoint_definition(&self) -> Option<&Arc<dyn EndpointDefinition<C>>> {
        self.endpoint.as_ref()
    }

    /// `true` when no consumer definition was registered for `C`.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.is_default
    }

    #[must_use]
    pub fn endpoint_settings(&self) -> EndpointSettings {
        match &self.endpoint {
            Some(endpoint) => endpoint.settings(),
            None => self.consumer.endpoint_settings(),
        }
    }

    /// Explicit endpoint setting, then the consumer definition's name, then the formatter.
    #[must_use]
    pub fn endpoint_name(&self, formatter: &dyn EndpointNameFormatter) -> String {
        if let Some(name) = self.endpoint_settings().name {
            return name;
        }
        self.consumer
            .endpoint_name()
            .unwrap_or_else(|| formatter.consumer(short_type_name::<C>()))
    }

    /// Apply the definition to a consumer being wired onto `endpoint`.
    pub fn configure(
        &self,
        endpoint: &mut dyn ReceiveEndpointBuilder,
        consumer: &mut ConsumerConfigurator<C>,
        hub: &ServiceHub,
    ) {
        if let Some(limit) = self.consumer.concurrent_message_limit() {
            consumer.set_concurrent_message_limit(limit);
        }
        self.consumer.configure(endpoint, consumer, hub);
    }
}

impl<C: Consumer> std::fmt::Debug for Definition<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Definition")
            .field("consumer", &short_type_name::<C>())
            .field("is_default", &self.is_default)
            .field("endpoint_settings", &self.endpoint_settings())
            .finish()
    }
}

/// Resolve the definition for `C` from `hub`.
///
/// Falls back to [`DefaultConsumerDefinition`] when no consumer definition is registered, then
/// attaches a separately registered endpoint definition if one exists.
///
/// # Errors
/// `ResolutionFailure` when a registration in the hub is malformed.
pub fn resolve_definition<C: Consumer>(hub: &ServiceHub) -> Result<Definition<C>, BusError> {
    let mut definition = match hub.find::<dyn ConsumerDefinition<C>>()? {
        Some(registered) => Definition::new(registered),
        None => Definition::with_defaults(),
    };

    if let Some(endpoint) = hub.find::<dyn EndpointDefinition<C>>()? {
        definition.set_endpoint_definition(endpoint);
    }

    tracing::debug!(
        consumer = short_type_name::<C>(),
        default = definition.is_default(),
        endpoint_override = definition.endpoint_definition().is_some(),
        "Resolved consumer definition"
    );
    Ok(definition)
}
