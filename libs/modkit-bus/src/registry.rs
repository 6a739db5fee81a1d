//! Registry of consumer registrations and the bulk endpoint configuration pass.
//!
//! Flow:
//! - At composition time the application calls [`ConsumerRegistry::add_consumer`] for every
//!   consumer type and configures it through the returned typed configurator.
//! - Consumers that need a dedicated endpoint are wired explicitly with
//!   [`ConsumerRegistry::configure_consumer_endpoint`].
//! - [`ConsumerRegistry::configure_endpoints`] then wires everything that is still unconfigured
//!   and not excluded, one endpoint per endpoint name.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::configurator::ConsumerConfigurator;
use crate::endpoint::{BusFactoryConfigurator, ReceiveEndpointBuilder};
use crate::error::BusError;
use crate::hub::ServiceHub;
use crate::naming::short_type_name;
use crate::registration::{
    Consumer, ConsumerRegistration, ConsumerRegistrationConfigurator, Registration,
};

#[derive(Default)]
struct Registrations {
    ordered: Vec<Arc<dyn Registration>>,
    by_type: HashMap<TypeId, usize>,
}

impl Registrations {
    fn get<C: Consumer>(&self) -> Option<Arc<ConsumerRegistration<C>>> {
        let index = *self.by_type.get(&TypeId::of::<C>())?;
        let registration = Arc::clone(self.ordered.get(index)?);
        registration.into_any().downcast::<ConsumerRegistration<C>>().ok()
    }
}

/// Owns one [`ConsumerRegistration`] per consumer type, in registration order.
pub struct ConsumerRegistry {
    hub: Arc<ServiceHub>,
    registrations: RwLock<Registrations>,
}

impl ConsumerRegistry {
    #[must_use]
    pub fn new(hub: Arc<ServiceHub>) -> Self {
        Self {
            hub,
            registrations: RwLock::new(Registrations::default()),
        }
    }

    #[inline]
    #[must_use]
    pub fn hub(&self) -> &Arc<ServiceHub> {
        &self.hub
    }

    /// Register consumer `C`, or return the existing registration's configurator.
    ///
    /// Also registers `C` as a scoped service built with [`Consumer::build`], unless the hub
    /// already has a factory for it.
    pub fn add_consumer<C: Consumer>(&self) -> ConsumerRegistrationConfigurator<'_, C> {
        let registration = {
            let mut registrations = self.registrations.write();
            if let Some(existing) = registrations.get::<C>() {
                existing
            } else {
                let created = Arc::new(ConsumerRegistration::<C>::new());
                let index = registrations.ordered.len();
                registrations.ordered.push(created.clone());
                registrations.by_type.insert(TypeId::of::<C>(), index);
                tracing::debug!(consumer = short_type_name::<C>(), "Registered consumer");
                created
            }
        };

        if !self.hub.has_factory::<C>() {
            self.hub
                .register_factory::<C, _>(|scope| C::build(scope).map(Arc::new));
        }

        registration.consumer_registration_configurator(self)
    }

    #[must_use]
    pub fn consumer<C: Consumer>(&self) -> Option<Arc<ConsumerRegistration<C>>> {
        self.registrations.read().get::<C>()
    }

    fn required<C: Consumer>(&self) -> Result<Arc<ConsumerRegistration<C>>, BusError> {
        self.consumer::<C>().ok_or(BusError::ConsumerNotRegistered {
            consumer: short_type_name::<C>(),
        })
    }

    /// Queue a configuration action on the registration of `C`.
    ///
    /// # Errors
    /// `ConsumerNotRegistered` when `C` was never added.
    pub fn configure_consumer<C, F>(&self, action: F) -> Result<(), BusError>
    where
        C: Consumer,
        F: Fn(&mut ConsumerConfigurator<C>) + Send + Sync + 'static,
    {
        self.required::<C>()?.add_configure_action(action);
        Ok(())
    }

    /// Explicitly wire `C` onto `endpoint`; the bulk pass skips it afterwards.
    ///
    /// # Errors
    /// `ConsumerNotRegistered` when `C` was never added, otherwise whatever wiring reports.
    pub fn configure_consumer_endpoint<C: Consumer>(
        &self,
        endpoint: &mut dyn ReceiveEndpointBuilder,
    ) -> Result<(), BusError> {
        self.required::<C>()?.configure(endpoint, &self.hub)
    }

    /// Snapshot of all registrations in registration order.
    #[must_use]
    pub fn registrations(&self) -> Vec<Arc<dyn Registration>> {
        self.registrations.read().ordered.clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.registrations.read().ordered.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wire every registration that is still included, grouped by endpoint name.
    ///
    /// Groups keep registration order; each endpoint is created with the settings of the first
    /// consumer in its group. Returns the number of endpoints configured.
    ///
    /// # Errors
    /// The first wiring or resolution error; endpoints configured before it stay configured.
    pub fn configure_endpoints(
        &self,
        bus: &mut dyn BusFactoryConfigurator,
    ) -> Result<usize, BusError> {
        let mut groups: Vec<(String, Vec<Arc<dyn Registration>>)> = Vec::new();

        for registration in self.registrations() {
            if !registration.include_in_configure_endpoints() {
                tracing::debug!(
                    consumer = registration.consumer_name(),
                    state = ?registration.state(),
                    excluded = registration.is_excluded(),
                    "Skipping consumer already wired or excluded"
                );
                continue;
            }
            let name = registration.endpoint_name(&self.hub)?;
            match groups.iter_mut().find(|(n, _)| *n == name) {
                Some((_, members)) => members.push(registration),
                None => groups.push((name, vec![registration])),
            }
        }

        for (name, members) in &groups {
            let settings = match members.first() {
                Some(first) => first.endpoint_settings(&self.hub)?,
                None => continue,
            };
            bus.receive_endpoint(name, &settings, &mut |endpoint| {
                members
                    .iter()
                    .try_for_each(|registration| registration.configure(endpoint, &self.hub))
            })?;
            tracing::info!(
                endpoint = %name,
                consumers = members.len(),
                "Configured receive endpoint"
            );
        }

        Ok(groups.len())
    }
}

impl std::fmt::Debug for ConsumerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self
            .registrations()
            .iter()
            .map(|r| r.consumer_name())
            .collect();
        f.debug_struct("ConsumerRegistry")
            .field("consumers", &names)
            .finish_non_exhaustive()
    }
}
