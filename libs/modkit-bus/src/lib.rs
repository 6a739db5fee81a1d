//! Consumer registration and receive endpoint wiring.
//!
//! A [`ConsumerRegistry`] owns one [`ConsumerRegistration`] per consumer type. At endpoint-build
//! time a registration resolves its [`Definition`] once from the [`ServiceHub`], builds a
//! (possibly decorated) scoped consumer factory, lets the definition and the queued actions
//! configure a [`ConsumerConfigurator`], and hands the result to the endpoint as an
//! [`EndpointSpecification`].
//!
//! ```ignore
//! let hub = Arc::new(ServiceHub::new());
//! ConsumersConfig::load(&provider)?.install(&hub);
//!
//! let registry = ConsumerRegistry::new(hub);
//! registry
//!     .add_consumer::<OrderHandler>()
//!     .configure(|c| {
//!         c.set_concurrent_message_limit(4);
//!     });
//!
//! let mut bus = InMemoryBus::from_config(&config)?;
//! registry.configure_endpoints(&mut bus)?;
//! ```
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod config;
pub mod configurator;
pub mod definition;
pub mod endpoint;
pub mod error;
pub mod factory;
pub mod hub;
pub mod naming;
pub mod registration;
pub mod registry;

pub use config::{ConfigError, ConfigProvider, ConsumersConfig, JsonConfigProvider};
pub use configurator::{
    BatchOptions, ConsumerConfigurator, ConsumerOption, ReceiveEndpointConfigurator,
};
pub use definition::{
    ConsumerDefinition, DefaultConsumerDefinition, Definition, EndpointDefinition, EndpointSettings,
};
pub use endpoint::{
    BusFactoryConfigurator, EndpointSpecification, InMemoryBus, InMemoryReceiveEndpoint,
    ReceiveEndpointBuilder,
};
pub use error::BusError;
pub use factory::{
    ConsumeContext, ConsumerFactory, FactoryDecorator, FactoryDecorators, ScopedConsumer,
    ScopedConsumerFactory,
};
pub use hub::{ServiceHub, ServiceHubError, ServiceScope};
pub use naming::{DefaultEndpointNameFormatter, EndpointNameFormatter, NameFormatting};
pub use registration::{
    Consumer, ConsumerRegistration, ConsumerRegistrationConfigurator, Registration,
    RegistrationState,
};
pub use registry::ConsumerRegistry;
