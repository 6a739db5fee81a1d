//! Per-endpoint consumer configuration.
//!
//! A [`ConsumerConfigurator`] is built fresh for every wiring pass around the consumer's
//! factory. Definitions and queued actions mutate it; options that also need to touch the
//! receive endpoint expose a [`ReceiveEndpointConfigurator`]. Once complete it is handed to the
//! endpoint as its [`EndpointSpecification`].

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::endpoint::{EndpointSpecification, ReceiveEndpointBuilder};
use crate::error::BusError;
use crate::factory::{ConsumeContext, ConsumerFactory, ScopedConsumer};
use crate::naming::short_type_name;
use crate::registration::Consumer;

/// Capability of an option to adjust the receive endpoint its consumer is wired onto.
pub trait ReceiveEndpointConfigurator: Send + Sync {
    fn configure_receive_endpoint(
        &self,
        endpoint_name: &str,
        endpoint: &mut dyn ReceiveEndpointBuilder,
    );
}

/// Typed, consumer-scoped option stored on a [`ConsumerConfigurator`].
pub trait ConsumerOption: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// `Some` when the option must also configure the receive endpoint.
    fn receive_endpoint_configurator(&self) -> Option<&dyn ReceiveEndpointConfigurator> {
        None
    }

    /// # Errors
    /// `reason` describing why the option is unusable.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }

    fn probe(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Batch delivery limits. The receive endpoint must prefetch and run enough messages
/// concurrently to fill `message_limit` batches `concurrency_limit` times over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOptions {
    pub message_limit: usize,
    pub time_limit: Duration,
    pub concurrency_limit: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            message_limit: 10,
            time_limit: Duration::from_secs(1),
            concurrency_limit: 1,
        }
    }
}

impl BatchOptions {
    #[must_use]
    pub fn required_messages(&self) -> usize {
        self.message_limit.saturating_mul(self.concurrency_limit)
    }
}

impl ReceiveEndpointConfigurator for BatchOptions {
    fn configure_receive_endpoint(
        &self,
        endpoint_name: &str,
        endpoint: &mut dyn ReceiveEndpointBuilder,
    ) {
        let required = self.required_messages();
        let prefetch = u16::try_from(required).unwrap_or(u16::MAX);
        let settings = endpoint.settings_mut();

        settings.prefetch_count =
            Some(settings.prefetch_count.map_or(prefetch, |p| p.max(prefetch)));
        settings.concurrent_message_limit = Some(
            settings
                .concurrent_message_limit
                .map_or(required, |l| l.max(required)),
        );
        tracing::debug!(
            endpoint = endpoint_name,
            prefetch_count = settings.prefetch_count,
            concurrent_message_limit = settings.concurrent_message_limit,
            "Adjusted endpoint for batch consumer"
        );
    }
}

impl ConsumerOption for BatchOptions {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn receive_endpoint_configurator(&self) -> Option<&dyn ReceiveEndpointConfigurator> {
        Some(self)
    }

    fn validate(&self) -> Result<(), String> {
        if self.message_limit == 0 {
            return Err("batch message limit must be greater than zero".to_owned());
        }
        if self.concurrency_limit == 0 {
            return Err("batch concurrency limit must be greater than zero".to_owned());
        }
        if self.time_limit.is_zero() {
            return Err("batch time limit must be greater than zero".to_owned());
        }
        Ok(())
    }

    fn probe(&self) -> serde_json::Value {
        json!({
            "batch": {
                "message_limit": self.message_limit,
                "time_limit_ms": u64::try_from(self.time_limit.as_millis()).unwrap_or(u64::MAX),
                "concurrency_limit": self.concurrency_limit,
            }
        })
    }
}

/// Configuration accumulated for one consumer on one endpoint.
pub struct ConsumerConfigurator<C: Consumer> {
    factory: Arc<dyn ConsumerFactory<C>>,
    concurrent_message_limit: Option<usize>,
    retry_limit: Option<u32>,
    options: Vec<Box<dyn ConsumerOption>>,
}

impl<C: Consumer> ConsumerConfigurator<C> {
    #[must_use]
    pub fn new(factory: Arc<dyn ConsumerFactory<C>>) -> Self {
        Self {
            factory,
            concurrent_message_limit: None,
            retry_limit: None,
            options: Vec::new(),
        }
    }

    /// Factory the endpoint will use to create consumers.
    #[must_use]
    pub fn factory(&self) -> &Arc<dyn ConsumerFactory<C>> {
        &self.factory
    }

    pub fn set_concurrent_message_limit(&mut self, limit: usize) -> &mut Self {
        self.concurrent_message_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn concurrent_message_limit(&self) -> Option<usize> {
        self.concurrent_message_limit
    }

    /// Number of redeliveries attempted before a message is faulted.
    pub fn set_retry_limit(&mut self, limit: u32) -> &mut Self {
        self.retry_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn retry_limit(&self) -> Option<u32> {
        self.retry_limit
    }

    pub fn add_option(&mut self, option: impl ConsumerOption) -> &mut Self {
        self.options.push(Box::new(option));
        self
    }

    /// Get-or-add the option of type `O` and let `configure` adjust it.
    pub fn options<O>(&mut self, configure: impl FnOnce(&mut O)) -> &mut Self
    where
        O: ConsumerOption + Default,
    {
        let index = match self
            .options
            .iter()
            .position(|o| o.as_any().is::<O>())
        {
            Some(index) => index,
            None => {
                self.options.push(Box::new(O::default()));
                self.options.len() - 1
            }
        };
        if let Some(option) = self.options[index].as_any_mut().downcast_mut::<O>() {
            configure(option);
        }
        self
    }

    #[must_use]
    pub fn option<O: ConsumerOption>(&self) -> Option<&O> {
        self.options
            .iter()
            .find_map(|o| o.as_any().downcast_ref::<O>())
    }

    /// Options exposing the receive endpoint capability, in the order they were added.
    pub fn receive_endpoint_configurators(
        &self,
    ) -> impl Iterator<Item = &dyn ReceiveEndpointConfigurator> {
        self.options
            .iter()
            .filter_map(|o| o.receive_endpoint_configurator())
    }

    /// Create a consumer for one message using the configured factory.
    ///
    /// # Errors
    /// `ResolutionFailure` when the factory cannot resolve the consumer.
    pub fn create_consumer(&self, context: ConsumeContext) -> Result<ScopedConsumer<C>, BusError> {
        self.factory.create(context)
    }

    fn invalid(reason: impl Into<String>) -> BusError {
        BusError::InvalidSpecification {
            consumer: short_type_name::<C>().to_owned(),
            reason: reason.into(),
        }
    }
}

impl<C: Consumer> EndpointSpecification for ConsumerConfigurator<C> {
    fn consumer_name(&self) -> &'static str {
        short_type_name::<C>()
    }

    fn validate(&self) -> Result<(), BusError> {
        if self.concurrent_message_limit == Some(0) {
            return Err(Self::invalid("concurrent message limit must be greater than zero"));
        }
        self.options
            .iter()
            .try_for_each(|o| o.validate().map_err(Self::invalid))
    }

    fn probe(&self) -> serde_json::Value {
        json!({
            "consumer": short_type_name::<C>(),
            "factory": self.factory.name(),
            "concurrent_message_limit": self.concurrent_message_limit,
            "retry_limit": self.retry_limit,
            "options": self.options.iter().map(|o| o.probe()).collect::<Vec<_>>(),
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
