//! Offer acceptance
//!
//! A provisional binding is handed to the offering provider before it is
//! confirmed. Remote providers may refuse (their capacity changed, the peer
//! is unreachable); refusal sends the coordinator down the ranking.

use super::Binding;
use crate::features::OfferVector;

/// Trait for the provider-side acquire step
pub trait OfferAcceptor: Send + Sync {
    /// Return `false` to refuse the binding
    fn acquire(&self, offer: &OfferVector, binding: &Binding) -> bool;
}

/// Accepts every binding; used for offers whose capacity the engine owns
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl OfferAcceptor for AcceptAll {
    fn acquire(&self, _offer: &OfferVector, _binding: &Binding) -> bool {
        true
    }
}

impl<F> OfferAcceptor for F
where
    F: Fn(&OfferVector, &Binding) -> bool + Send + Sync,
{
    fn acquire(&self, offer: &OfferVector, binding: &Binding) -> bool {
        self(offer, binding)
    }
}
