//! Per-consumer registration: queued configuration, memoized definition, endpoint wiring.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::configurator::ConsumerConfigurator;
use crate::definition::{
    ConsumerDefinition, Definition, EndpointDefinition, EndpointSettings, resolve_definition,
};
use crate::endpoint::ReceiveEndpointBuilder;
use crate::error::BusError;
use crate::factory::{FactoryDecorator, FactoryDecorators, build_consumer_factory};
use crate::hub::{ServiceHub, ServiceScope, TypeKey};
use crate::naming::{
    DefaultEndpointNameFormatter, EndpointNameFormatter, endpoint_name_from_address,
    short_type_name,
};
use crate::registry::ConsumerRegistry;

/// A message handler type that can be bound to a receive endpoint.
pub trait Consumer: Send + Sync + Sized + 'static {
    /// Consumers marked here are never wired by [`ConsumerRegistry::configure_endpoints`]; they
    /// must be configured explicitly.
    const EXCLUDE_FROM_CONFIGURE_ENDPOINTS: bool = false;

    /// Construct the consumer inside a per-message scope.
    ///
    /// # Errors
    /// Any failure resolving the consumer's dependencies.
    fn build(scope: &ServiceScope) -> anyhow::Result<Self>;
}

/// Wiring state of a registration.
///
/// Advisory only: the bulk pass reads it to skip consumers that were already wired. It does not
/// serialize concurrent `configure` calls; two concurrent calls both wire the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unconfigured,
    Configured,
}

/// Configuration callback queued on a registration.
pub type ConfigureAction<C> = Arc<dyn Fn(&mut ConsumerConfigurator<C>) + Send + Sync>;

/// Type-erased view of a [`ConsumerRegistration`], used by the registry.
pub trait Registration: Send + Sync {
    fn consumer_type(&self) -> TypeKey;

    /// Short display name of the consumer type.
    fn consumer_name(&self) -> &'static str;

    fn state(&self) -> RegistrationState;

    fn is_excluded(&self) -> bool;

    /// Whether the bulk pass should still wire this consumer.
    fn include_in_configure_endpoints(&self) -> bool {
        self.state() == RegistrationState::Unconfigured && !self.is_excluded()
    }

    /// # Errors
    /// `ResolutionFailure` when the definition or the name formatter cannot be resolved.
    fn endpoint_name(&self, hub: &ServiceHub) -> Result<String, BusError>;

    /// # Errors
    /// `ResolutionFailure` when the definition cannot be resolved.
    fn endpoint_settings(&self, hub: &ServiceHub) -> Result<EndpointSettings, BusError>;

    /// Wire the consumer onto `endpoint`.
    ///
    /// # Errors
    /// `ResolutionFailure` from the hub, `InvalidEndpointAddress` when the endpoint name cannot
    /// be derived from its input address.
    fn configure(
        &self,
        endpoint: &mut dyn ReceiveEndpointBuilder,
        hub: &Arc<ServiceHub>,
    ) -> Result<(), BusError>;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Registration of consumer `C`, created once and owned by the registry.
pub struct ConsumerRegistration<C: Consumer> {
    actions: RwLock<Vec<ConfigureAction<C>>>,
    definition: OnceLock<Arc<Definition<C>>>,
    configured: AtomicBool,
    excluded: AtomicBool,
}

impl<C: Consumer> ConsumerRegistration<C> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            actions: RwLock::new(Vec::new()),
            definition: OnceLock::new(),
            configured: AtomicBool::new(false),
            excluded: AtomicBool::new(C::EXCLUDE_FROM_CONFIGURE_ENDPOINTS),
        }
    }

    /// Queue an action; actions run in insertion order after the definition's own configuration.
    pub fn add_configure_action<F>(&self, action: F)
    where
        F: Fn(&mut ConsumerConfigurator<C>) + Send + Sync + 'static,
    {
        self.actions.write().push(Arc::new(action));
    }

    #[must_use]
    pub fn configure_action_count(&self) -> usize {
        self.actions.read().len()
    }

    /// Keep the bulk pass from wiring this consumer.
    pub fn exclude_from_configure_endpoints(&self) {
        self.excluded.store(true, Ordering::Release);
    }

    /// The consumer's definition, resolved from `hub` on first use and reused afterwards.
    ///
    /// Concurrent first calls may each resolve, but only one result is stored and every caller
    /// observes that one.
    ///
    /// # Errors
    /// `ResolutionFailure` when the hub holds a malformed registration.
    pub fn get_definition(&self, hub: &ServiceHub) -> Result<Arc<Definition<C>>, BusError> {
        if let Some(definition) = self.definition.get() {
            return Ok(Arc::clone(definition));
        }
        let resolved = Arc::new(resolve_definition::<C>(hub)?);
        Ok(Arc::clone(self.definition.get_or_init(|| resolved)))
    }

    /// Typed configurator bound to this registration and to `registry`.
    #[must_use]
    pub fn consumer_registration_configurator<'a>(
        self: &Arc<Self>,
        registry: &'a ConsumerRegistry,
    ) -> ConsumerRegistrationConfigurator<'a, C> {
        ConsumerRegistrationConfigurator {
            registration: Arc::clone(self),
            registry,
        }
    }

    /// Wire the consumer onto `endpoint`.
    ///
    /// Order: definition, factory (decorated when decorators are registered), definition
    /// configuration, queued actions, endpoint-level options, specification registration.
    /// The registration is marked [`RegistrationState::Configured`] afterwards.
    ///
    /// # Errors
    /// `ResolutionFailure` from the hub, `InvalidEndpointAddress` when the endpoint name cannot
    /// be derived from its input address.
    pub fn configure(
        &self,
        endpoint: &mut dyn ReceiveEndpointBuilder,
        hub: &Arc<ServiceHub>,
    ) -> Result<(), BusError> {
        let definition = self.get_definition(hub)?;
        let factory = build_consumer_factory::<C>(hub)?;
        let mut configurator = ConsumerConfigurator::new(factory);

        definition.configure(endpoint, &mut configurator, hub);

        // Snapshot so an action may queue further actions without deadlocking.
        let actions: Vec<ConfigureAction<C>> = self.actions.read().clone();
        for action in &actions {
            action(&mut configurator);
        }

        let endpoint_name = endpoint_name_from_address(endpoint.input_address())?;
        for option in configurator.receive_endpoint_configurators() {
            option.configure_receive_endpoint(&endpoint_name, endpoint);
        }

        tracing::info!(
            endpoint = %endpoint_name,
            consumer = %short_type_name::<C>(),
            "Configuring consumer"
        );

        endpoint.add_endpoint_specification(Box::new(configurator));
        self.configured.store(true, Ordering::Release);
        Ok(())
    }

    #[must_use]
    pub fn state(&self) -> RegistrationState {
        if self.configured.load(Ordering::Acquire) {
            RegistrationState::Configured
        } else {
            RegistrationState::Unconfigured
        }
    }
}

impl<C: Consumer> Default for ConsumerRegistration<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Consumer> fmt::Debug for ConsumerRegistration<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerRegistration")
            .field("consumer", &short_type_name::<C>())
            .field("actions", &self.configure_action_count())
            .field("state", &self.state())
            .field("excluded", &self.excluded.load(Ordering::Acquire))
            .field("definition", &self.definition.get())
            .finish()
    }
}

fn endpoint_name_formatter(hub: &ServiceHub) -> Result<Arc<dyn EndpointNameFormatter>, BusError> {
    Ok(hub
        .find::<dyn EndpointNameFormatter>()?
        .unwrap_or_else(|| Arc::new(DefaultEndpointNameFormatter::default())))
}

impl<C: Consumer> Registration for ConsumerRegistration<C> {
    fn consumer_type(&self) -> TypeKey {
        TypeKey::of::<C>()
    }

    fn consumer_name(&self) -> &'static str {
        short_type_name::<C>()
    }

    fn state(&self) -> RegistrationState {
        Self::state(self)
    }

    fn is_excluded(&self) -> bool {
        self.excluded.load(Ordering::Acquire)
    }

    fn endpoint_name(&self, hub: &ServiceHub) -> Result<String, BusError> {
        let formatter = endpoint_name_formatter(hub)?;
        Ok(self.get_definition(hub)?.endpoint_name(formatter.as_ref()))
    }

    fn endpoint_settings(&self, hub: &ServiceHub) -> Result<EndpointSettings, BusError> {
        Ok(self.get_definition(hub)?.endpoint_settings())
    }

    fn configure(
        &self,
        endpoint: &mut dyn ReceiveEndpointBuilder,
        hub: &Arc<ServiceHub>,
    ) -> Result<(), BusError> {
        Self::configure(self, endpoint, hub)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Type-safe surface for configuring one consumer's registration at composition time.
///
/// Definitions, endpoint settings and decorators are registered in the registry's hub; they
/// take effect when the registration first resolves its definition or builds its factory.
pub struct ConsumerRegistrationConfigurator<'a, C: Consumer> {
    registration: Arc<ConsumerRegistration<C>>,
    registry: &'a ConsumerRegistry,
}

impl<C: Consumer> ConsumerRegistrationConfigurator<'_, C> {
    #[must_use]
    pub fn registration(&self) -> &Arc<ConsumerRegistration<C>> {
        &self.registration
    }

    /// Queue a configuration action.
    pub fn configure<F>(&self, action: F) -> &Self
    where
        F: Fn(&mut ConsumerConfigurator<C>) + Send + Sync + 'static,
    {
        self.registration.add_configure_action(action);
        self
    }

    /// Register a consumer definition for `C`, replacing any previous one.
    pub fn definition(&self, definition: impl ConsumerDefinition<C> + 'static) -> &Self {
        let definition: Arc<dyn ConsumerDefinition<C>> = Arc::new(definition);
        self.registry.hub().register::<dyn ConsumerDefinition<C>>(definition);
        self
    }

    /// Register endpoint settings for `C`; they override the consumer definition's.
    pub fn endpoint(&self, settings: EndpointSettings) -> &Self {
        let endpoint: Arc<dyn EndpointDefinition<C>> = Arc::new(settings);
        self.registry.hub().register::<dyn EndpointDefinition<C>>(endpoint);
        self
    }

    /// Append a factory decorator; decorators apply in the order they were added.
    ///
    /// # Errors
    /// `ResolutionFailure` when the hub holds a malformed decorator list for `C`; the entry is
    /// left untouched.
    pub fn decorate(
        &self,
        decorator: impl FactoryDecorator<C> + 'static,
    ) -> Result<&Self, BusError> {
        let hub = self.registry.hub();
        let mut decorators = match hub.find::<FactoryDecorators<C>>()? {
            Some(existing) => existing.as_ref().clone(),
            None => FactoryDecorators::new(),
        };
        decorators.push(Arc::new(decorator));
        hub.register(Arc::new(decorators));
        Ok(self)
    }

    pub fn exclude_from_configure_endpoints(&self) -> &Self {
        self.registration.exclude_from_configure_endpoints();
        self
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::endpoint::{EndpointSpecification, InMemoryReceiveEndpoint};
    use crate::factory::{ConsumeContext, ConsumerFactory, ScopedConsumer};
    use parking_lot::Mutex;
    use url::Url;

    type Journal = Arc<Mutex<Vec<String>>>;
    type OrderFactory = Arc<dyn ConsumerFactory<OrderHandler>>;

    struct OrderHandler;

    impl Consumer for OrderHandler {
        fn build(_scope: &ServiceScope) -> anyhow::Result<Self> {
            Ok(Self)
        }
    }

    struct ManualOnly;

    impl Consumer for ManualOnly {
        const EXCLUDE_FROM_CONFIGURE_ENDPOINTS: bool = true;

        fn build(_scope: &ServiceScope) -> anyhow::Result<Self> {
            Ok(Self)
        }
    }

    struct JournalingDefinition(Journal);

    impl ConsumerDefinition<OrderHandler> for JournalingDefinition {
        fn concurrent_message_limit(&self) -> Option<usize> {
            Some(1)
        }

        fn configure(
            &self,
            _endpoint: &mut dyn ReceiveEndpointBuilder,
            _consumer: &mut ConsumerConfigurator<OrderHandler>,
            _hub: &ServiceHub,
        ) {
            self.0.lock().push("definition".to_owned());
        }
    }

    /// Endpoint builder that journals every specification it receives.
    struct JournalingEndpoint {
        inner: InMemoryReceiveEndpoint,
        journal: Journal,
    }

    impl ReceiveEndpointBuilder for JournalingEndpoint {
        fn input_address(&self) -> &Url {
            self.inner.input_address()
        }

        fn settings(&self) -> &EndpointSettings {
            self.inner.settings()
        }

        fn settings_mut(&mut self) -> &mut EndpointSettings {
            self.inner.settings_mut()
        }

        fn add_endpoint_specification(&mut self, specification: Box<dyn EndpointSpecification>) {
            self.journal.lock().push("specification".to_owned());
            self.inner.add_endpoint_specification(specification);
        }
    }

    struct Marked(OrderFactory);

    impl ConsumerFactory<OrderHandler> for Marked {
        fn create(
            &self,
            context: ConsumeContext,
        ) -> Result<ScopedConsumer<OrderHandler>, BusError> {
            self.0.create(context)
        }

        fn name(&self) -> String {
            "marked".to_owned()
        }
    }

    fn endpoint(name: &str) -> InMemoryReceiveEndpoint {
        InMemoryReceiveEndpoint::new(Url::parse(&format!("loopback://localhost/{name}")).unwrap())
    }

    fn hub() -> Arc<ServiceHub> {
        let hub = Arc::new(ServiceHub::new());
        hub.register_factory::<OrderHandler, _>(|scope| {
            OrderHandler::build(scope).map(Arc::new)
        });
        hub
    }

    #[test]
    fn definition_is_memoized() {
        let hub = hub();
        let registration = ConsumerRegistration::<OrderHandler>::new();

        let first = registration.get_definition(&hub).unwrap();
        let late: Arc<dyn EndpointDefinition<OrderHandler>> =
            Arc::new(EndpointSettings::named("late"));
        hub.register(late);
        let second = registration.get_definition(&hub).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(second.endpoint_definition().is_none());
    }

    #[test]
    fn concurrent_first_calls_observe_one_definition() {
        let hub = hub();
        let registration = ConsumerRegistration::<OrderHandler>::new();

        let definitions: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| registration.get_definition(&hub).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let stored = registration.get_definition(&hub).unwrap();
        assert!(definitions.iter().all(|d| Arc::ptr_eq(d, &stored)));
    }

    #[test]
    fn actions_run_after_definition_and_before_specification() {
        let hub = hub();
        let journal = Journal::default();
        let definition: Arc<dyn ConsumerDefinition<OrderHandler>> =
            Arc::new(JournalingDefinition(journal.clone()));
        hub.register(definition);

        let registration = ConsumerRegistration::<OrderHandler>::new();
        for n in 1..=3 {
            let journal = journal.clone();
            registration.add_configure_action(move |_| journal.lock().push(format!("action-{n}")));
        }

        let mut e = JournalingEndpoint {
            inner: endpoint("orders"),
            journal: journal.clone(),
        };
        registration.configure(&mut e, &hub).unwrap();

        assert_eq!(
            *journal.lock(),
            ["definition", "action-1", "action-2", "action-3", "specification"]
        );
    }

    #[test]
    fn actions_override_definition_settings() {
        let hub = hub();
        let definition: Arc<dyn ConsumerDefinition<OrderHandler>> =
            Arc::new(JournalingDefinition(Journal::default()));
        hub.register(definition);

        let registration = ConsumerRegistration::<OrderHandler>::new();
        registration.add_configure_action(|c| {
            c.set_concurrent_message_limit(8);
        });

        let mut e = endpoint("orders");
        registration.configure(&mut e, &hub).unwrap();

        let spec = e.specifications_of::<ConsumerConfigurator<OrderHandler>>().next().unwrap();
        assert_eq!(spec.concurrent_message_limit(), Some(8));
    }

    #[test]
    fn action_may_queue_another_action() {
        let hub = hub();
        let registration = Arc::new(ConsumerRegistration::<OrderHandler>::new());
        let inner = Arc::clone(&registration);
        registration.add_configure_action(move |_| inner.add_configure_action(|_| {}));

        registration.configure(&mut endpoint("orders"), &hub).unwrap();
        assert_eq!(registration.configure_action_count(), 2);
    }

    #[test]
    fn configure_marks_registration_configured() {
        let hub = hub();
        let registration = ConsumerRegistration::<OrderHandler>::new();
        assert_eq!(registration.state(), RegistrationState::Unconfigured);
        assert!(registration.include_in_configure_endpoints());

        registration.configure(&mut endpoint("orders"), &hub).unwrap();

        assert_eq!(registration.state(), RegistrationState::Configured);
        assert!(!registration.include_in_configure_endpoints());
    }

    #[test]
    fn repeated_configure_adds_specifications() {
        let hub = hub();
        let registration = ConsumerRegistration::<OrderHandler>::new();
        let mut e = endpoint("orders");

        registration.configure(&mut e, &hub).unwrap();
        registration.configure(&mut e, &hub).unwrap();
        assert_eq!(e.specifications().len(), 2);
    }

    #[test]
    fn excluded_consumer_is_not_included() {
        let registration = ConsumerRegistration::<ManualOnly>::new();
        assert!(registration.is_excluded());
        assert!(!registration.include_in_configure_endpoints());

        let other = ConsumerRegistration::<OrderHandler>::new();
        other.exclude_from_configure_endpoints();
        assert!(!other.include_in_configure_endpoints());
    }

    #[test]
    fn decorated_factory_is_installed() {
        let hub = hub();
        let installed: Arc<Mutex<Option<OrderFactory>>> = Arc::default();
        let slot = installed.clone();
        hub.register(Arc::new(FactoryDecorators::<OrderHandler>::new().with(
            move |base: OrderFactory| -> OrderFactory {
                let wrapped: OrderFactory = Arc::new(Marked(base));
                *slot.lock() = Some(wrapped.clone());
                wrapped
            },
        )));

        let registration = ConsumerRegistration::<OrderHandler>::new();
        let mut e = endpoint("orders");
        registration.configure(&mut e, &hub).unwrap();

        let spec = e.specifications_of::<ConsumerConfigurator<OrderHandler>>().next().unwrap();
        let decorated = installed.lock().clone().unwrap();
        assert!(Arc::ptr_eq(spec.factory(), &decorated));
        assert_eq!(spec.factory().name(), "marked");
        assert!(spec.create_consumer(ConsumeContext::new("orders")).is_ok());
    }

    #[test]
    fn endpoint_name_comes_from_input_address() {
        let hub = hub();
        let registration = ConsumerRegistration::<OrderHandler>::new();
        let mut e = InMemoryReceiveEndpoint::new(Url::parse("loopback://localhost/").unwrap());

        let err = registration.configure(&mut e, &hub).unwrap_err();
        assert!(matches!(err, BusError::InvalidEndpointAddress { .. }));
        assert_eq!(registration.state(), RegistrationState::Unconfigured);
        assert!(e.specifications().is_empty());
    }

    #[test]
    fn endpoint_name_uses_registered_formatter() {
        let hub = hub();
        let registration = ConsumerRegistration::<OrderHandler>::new();
        assert_eq!(
            Registration::endpoint_name(&registration, &hub).unwrap(),
            "OrderHandler"
        );

        // The definition is memoized, the formatter is not.
        let formatter: Arc<dyn EndpointNameFormatter> =
            Arc::new(DefaultEndpointNameFormatter::kebab_case());
        hub.register(formatter);
        assert_eq!(
            Registration::endpoint_name(&registration, &hub).unwrap(),
            "order-handler"
        );
    }

    #[test]
    fn malformed_decorator_list_is_reported() {
        let registry = ConsumerRegistry::new(hub());
        registry.hub().register_mismatched::<FactoryDecorators<OrderHandler>>();

        let configurator = registry.add_consumer::<OrderHandler>();
        let err = configurator
            .decorate(|base: OrderFactory| base)
            .map(|_| ())
            .unwrap_err();
        assert!(err.is_resolution_failure());

        let mut e = endpoint("orders");
        let err = configurator
            .registration()
            .configure(&mut e, registry.hub())
            .unwrap_err();
        assert!(err.is_resolution_failure());
        assert!(e.specifications().is_empty());
        assert_eq!(configurator.registration().state(), RegistrationState::Unconfigured);
    }

    #[test]
    fn decorators_registered_through_configurator_stack() {
        let registry = ConsumerRegistry::new(hub());
        let configurator = registry.add_consumer::<OrderHandler>();
        configurator
            .decorate(|base: OrderFactory| -> OrderFactory { Arc::new(Marked(base)) })
            .unwrap()
            .decorate(|base: OrderFactory| -> OrderFactory { Arc::new(Marked(base)) })
            .unwrap();

        let decorators = registry.hub().get::<FactoryDecorators<OrderHandler>>().unwrap();
        assert_eq!(decorators.len(), 2);
    }
}
