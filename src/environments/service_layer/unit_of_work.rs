use std::ops::{Deref, DerefMut};

use tracing::debug;

use crate::environments::adapters::{BackendError, Registry};
use crate::environments::domain::Event;

/// Transactional boundary around one registry.
///
/// Work happens inside a [`Transaction`]. Leaving the transaction without
/// committing it rolls everything back.
#[derive(Debug)]
pub struct UnitOfWork<G> {
    registry: G,
}

impl<G> UnitOfWork<G>
where
    G: Registry,
{
    pub fn new(registry: G) -> Self {
        Self { registry }
    }

    pub fn begin(&mut self) -> Transaction<'_, G> {
        Transaction {
            registry: &mut self.registry,
        }
    }

    /// Drains undelivered events, oldest first. The iterator is lazy and
    /// picks up events recorded after it was exhausted only when called again.
    pub fn collect_new_events(&mut self) -> NewEvents<'_, G> {
        NewEvents {
            registry: &mut self.registry,
        }
    }

    pub fn registry(&self) -> &G {
        &self.registry
    }

    pub fn into_registry(self) -> G {
        self.registry
    }
}

/// Proof that a transaction was committed.
#[must_use = "a committed transaction should be acknowledged"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Committed;

pub struct Transaction<'u, G>
where
    G: Registry,
{
    registry: &'u mut G,
}

impl<G> Transaction<'_, G>
where
    G: Registry,
{
    /// Commits every provisional container. Whatever could not be committed
    /// is rolled back when the transaction is dropped.
    pub fn commit(self) -> Result<Committed, BackendError> {
        self.registry.commit()?;
        debug!("unit of work committed");
        Ok(Committed)
    }

    pub fn rollback(self) {}
}

impl<G> Deref for Transaction<'_, G>
where
    G: Registry,
{
    type Target = G;

    fn deref(&self) -> &G {
        self.registry
    }
}

impl<G> DerefMut for Transaction<'_, G>
where
    G: Registry,
{
    fn deref_mut(&mut self) -> &mut G {
        self.registry
    }
}

impl<G> Drop for Transaction<'_, G>
where
    G: Registry,
{
    fn drop(&mut self) {
        if self.registry.has_provisional() {
            debug!("rolling back unit of work");
        }
        self.registry.rollback();
    }
}

pub struct NewEvents<'u, G> {
    registry: &'u mut G,
}

impl<G> Iterator for NewEvents<'_, G>
where
    G: Registry,
{
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        self.registry.next_event()
    }
}
