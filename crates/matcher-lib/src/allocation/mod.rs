//! Allocation: offer capacity, bindings and the matching coordinator

mod acceptor;
mod binding;
mod catalog;
mod coordinator;
mod rematch;

#[cfg(test)]
mod tests;

pub use acceptor::{AcceptAll, OfferAcceptor};
pub use binding::{Binding, BindingId, BindingStatus};
pub use catalog::{CapacityAudit, CommitError, OfferCatalog, Preempted};
pub use coordinator::{Coordinator, CoordinatorBuilder, RematchSummary};
pub use rematch::RematchWorker;
