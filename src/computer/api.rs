//! Host APIs exposed to machines.

use std::any::Any;
use std::sync::Arc;

use tracing::debug;

use super::ComputerHandle;

/// A capability made available to a computer's machine.
///
/// One instance exists per computer per boot. The lifecycle hooks run on
/// worker threads (`startup`, `shutdown`) and on the host thread (`update`).
pub trait Api: Send + Sync + 'static {
    /// Name the API is registered under.
    fn name(&self) -> &str;

    /// Called when the computer turns on, before the machine is created.
    fn startup(&self) {}

    /// Called every host tick while the computer is on.
    fn update(&self) {}

    /// Called when the computer turns off or crashes.
    fn shutdown(&self) {}

    /// Used by [`ApiRegistry::get`] to recover the concrete type.
    fn as_any(&self) -> &dyn Any;
}

/// Builds an [`Api`] for a computer. Returning `None` skips the API.
pub trait ApiFactory: Send + Sync {
    fn create(&self, computer: &ComputerHandle) -> Option<Arc<dyn Api>>;
}

impl<F> ApiFactory for F
where
    F: Fn(&ComputerHandle) -> Option<Arc<dyn Api>> + Send + Sync,
{
    fn create(&self, computer: &ComputerHandle) -> Option<Arc<dyn Api>> {
        self(computer)
    }
}

/// The APIs of one computer, in registration order.
#[derive(Default)]
pub struct ApiRegistry {
    apis: Vec<Arc<dyn Api>>,
}

impl ApiRegistry {
    /// Instantiate every factory for `computer`.
    pub fn build(factories: &[Arc<dyn ApiFactory>], computer: &ComputerHandle) -> Self {
        let apis: Vec<Arc<dyn Api>> = factories
            .iter()
            .filter_map(|factory| factory.create(computer))
            .collect();
        debug!(computer_id = computer.id(), apis = apis.len(), "Built API registry");
        Self { apis }
    }

    /// Registered API names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.apis.iter().map(|api| api.name())
    }

    /// Look up an API by name.
    pub fn get_dyn(&self, name: &str) -> Option<&Arc<dyn Api>> {
        self.apis.iter().find(|api| api.name() == name)
    }

    /// Look up an API by name and downcast it to its concrete type.
    pub fn get<T: Api>(&self, name: &str) -> Option<&T> {
        self.get_dyn(name)?.as_any().downcast_ref::<T>()
    }

    pub fn len(&self) -> usize {
        self.apis.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apis.is_empty()
    }

    pub(crate) fn startup(&self) {
        self.apis.iter().for_each(|api| api.startup());
    }

    pub(crate) fn update(&self) {
        self.apis.iter().for_each(|api| api.update());
    }

    pub(crate) fn shutdown(&self) {
        self.apis.iter().for_each(|api| api.shutdown());
    }
}

impl std::fmt::Debug for ApiRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
