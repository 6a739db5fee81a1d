//! Receive endpoint collaborators and their in-memory implementations.

use std::any::Any;

use serde_json::json;
use url::Url;

use crate::config::ConsumersConfig;
use crate::definition::EndpointSettings;
use crate::error::BusError;

/// Default base address of [`InMemoryBus`] endpoints.
pub const LOOPBACK_BASE_ADDRESS: &str = "loopback://localhost/";

/// A finished unit of endpoint configuration (one wired consumer).
pub trait EndpointSpecification: Send + Sync + 'static {
    /// Short type name of the consumer this specification runs.
    fn consumer_name(&self) -> &'static str;

    /// # Errors
    /// `InvalidSpecification` when the accumulated configuration cannot produce a runnable
    /// endpoint.
    fn validate(&self) -> Result<(), BusError>;

    /// Diagnostic snapshot of the specification.
    fn probe(&self) -> serde_json::Value;

    fn as_any(&self) -> &dyn Any;
}

/// Endpoint under construction.
pub trait ReceiveEndpointBuilder: Send {
    fn input_address(&self) -> &Url;

    fn settings(&self) -> &EndpointSettings;

    fn settings_mut(&mut self) -> &mut EndpointSettings;

    /// Specifications accumulate; adding never replaces an earlier one.
    fn add_endpoint_specification(&mut self, specification: Box<dyn EndpointSpecification>);
}

/// Creates (or reuses) receive endpoints by name.
pub trait BusFactoryConfigurator {
    /// Run `configure` against the endpoint called `name`, creating it with `settings` first if
    /// it does not exist yet.
    ///
    /// # Errors
    /// Propagates errors from `configure`; `InvalidEndpointAddress` when `name` cannot form an
    /// address.
    fn receive_endpoint(
        &mut self,
        name: &str,
        settings: &EndpointSettings,
        configure: &mut dyn FnMut(&mut dyn ReceiveEndpointBuilder) -> Result<(), BusError>,
    ) -> Result<(), BusError>;
}

/// Receive endpoint that only records its configuration.
pub struct InMemoryReceiveEndpoint {
    address: Url,
    settings: EndpointSettings,
    specifications: Vec<Box<dyn EndpointSpecification>>,
}

impl InMemoryReceiveEndpoint {
    #[must_use]
    pub fn new(address: Url) -> Self {
        Self::with_settings(address, EndpointSettings::default())
    }

    #[must_use]
    pub fn with_settings(address: Url, settings: EndpointSettings) -> Self {
        Self {
            address,
            settings,
            specifications: Vec::new(),
        }
    }

    #[must_use]
    pub fn specifications(&self) -> &[Box<dyn EndpointSpecification>] {
        &self.specifications
    }

    /// Specifications of concrete type `S`, in registration order.
    pub fn specifications_of<S: EndpointSpecification>(&self) -> impl Iterator<Item = &S> {
        self.specifications
            .iter()
            .filter_map(|s| s.as_any().downcast_ref::<S>())
    }

    /// # Errors
    /// The first specification error.
    pub fn validate(&self) -> Result<(), BusError> {
        self.specifications.iter().try_for_each(|s| s.validate())
    }

    #[must_use]
    pub fn probe(&self) -> serde_json::Value {
        json!({
            "address": self.address.as_str(),
            "settings": self.settings,
            "consumers": self.specifications.iter().map(|s| s.probe()).collect::<Vec<_>>(),
        })
    }
}

impl ReceiveEndpointBuilder for InMemoryReceiveEndpoint {
    fn input_address(&self) -> &Url {
        &self.address
    }

    fn settings(&self) -> &EndpointSettings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut EndpointSettings {
        &mut self.settings
    }

    fn add_endpoint_specification(&mut self, specification: Box<dyn EndpointSpecification>) {
        self.specifications.push(specification);
    }
}

/// In-process bus configurator keeping endpoints in creation order.
pub struct InMemoryBus {
    base_address: Url,
    defaults: EndpointSettings,
    endpoints: Vec<(String, InMemoryReceiveEndpoint)>,
}

impl InMemoryBus {
    #[must_use]
    pub fn new(base_address: Url) -> Self {
        Self {
            base_address,
            defaults: EndpointSettings::default(),
            endpoints: Vec::new(),
        }
    }

    /// Loopback bus using the endpoint defaults from `config`.
    ///
    /// # Errors
    /// Never fails for the built-in loopback address; kept fallible for custom bases.
    pub fn from_config(config: &ConsumersConfig) -> Result<Self, BusError> {
        let base = Url::parse(LOOPBACK_BASE_ADDRESS).map_err(|_| BusError::InvalidEndpointAddress {
            address: LOOPBACK_BASE_ADDRESS.to_owned(),
            reason: "malformed base address",
        })?;
        Ok(Self::new(base).with_defaults(config.endpoint_defaults.clone()))
    }

    #[must_use]
    pub fn with_defaults(mut self, defaults: EndpointSettings) -> Self {
        self.defaults = defaults;
        self
    }

    #[must_use]
    pub fn base_address(&self) -> &Url {
        &self.base_address
    }

    /// Input address for the endpoint called `name`: the base address with `name` appended as one
    /// percent-encoded path segment.
    ///
    /// # Errors
    /// `InvalidEndpointAddress` when `name` is empty, `.`, `..` or contains `/`, or when the base
    /// address cannot carry a path.
    pub fn endpoint_address(&self, name: &str) -> Result<Url, BusError> {
        let invalid = |reason| BusError::InvalidEndpointAddress {
            address: format!("{}{name}", self.base_address),
            reason,
        };
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(invalid("endpoint name must be a single path segment"));
        }
        let mut address = self.base_address.clone();
        address
            .path_segments_mut()
            .map_err(|()| invalid("base address cannot carry a path"))?
            .pop_if_empty()
            .push(name);
        Ok(address)
    }

    #[must_use]
    pub fn endpoint(&self, name: &str) -> Option<&InMemoryReceiveEndpoint> {
        self.endpoints
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, e)| e)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = (&str, &InMemoryReceiveEndpoint)> {
        self.endpoints.iter().map(|(n, e)| (n.as_str(), e))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

impl BusFactoryConfigurator for InMemoryBus {
    fn receive_endpoint(
        &mut self,
        name: &str,
        settings: &EndpointSettings,
        configure: &mut dyn FnMut(&mut dyn ReceiveEndpointBuilder) -> Result<(), BusError>,
    ) -> Result<(), BusError> {
        if let Some((_, endpoint)) = self.endpoints.iter_mut().find(|(n, _)| n == name) {
            return configure(endpoint);
        }

        let address = self.endpoint_address(name)?;
        let settings = settings.or_defaults(&self.defaults);
        tracing::debug!(endpoint = name, address = %address, "Creating receive endpoint");
        let mut endpoint = InMemoryReceiveEndpoint::with_settings(address, settings);
        configure(&mut endpoint)?;
        self.endpoints.push((name.to_owned(), endpoint));
        Ok(())
    }
}
