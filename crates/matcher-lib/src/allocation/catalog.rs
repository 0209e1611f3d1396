//! Offer catalog with per-offer critical sections
//!
//! Each offer lives in its own mutex-guarded slot together with the
//! bindings that reserve its capacity. Every capacity change for an offer
//! (commit, revoke, capacity update, withdrawal) happens inside that
//! offer's critical section, which keeps `reserved + remaining ==
//! advertised` and makes commits linearizable per offer.

use super::{Binding, BindingId, BindingStatus};
use crate::error::{EngineError, EngineResult};
use crate::features::{IntentVector, OfferVector, ResourceVector};
use crate::models::{OfferId, PriorityTier};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error};

/// Why a compare-and-commit did not happen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommitError {
    #[error("remaining capacity no longer covers the request")]
    Conflict,
    #[error("offer was withdrawn")]
    Gone,
}

/// Result of a preempting commit
#[derive(Debug, Clone)]
pub struct Preempted {
    pub binding: Binding,
    pub offer: OfferVector,
    pub victims: Vec<Binding>,
}

/// Outcome of a capacity audit
#[derive(Debug, Clone, Default)]
pub struct CapacityAudit {
    pub offers_checked: usize,
    pub violations: Vec<String>,
}

impl CapacityAudit {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

struct OfferSlot {
    offer: OfferVector,
    bindings: BTreeMap<BindingId, Binding>,
    withdrawn: bool,
}

impl OfferSlot {
    fn reserved(&self) -> Option<ResourceVector> {
        self.bindings
            .values()
            .try_fold(ResourceVector::zeros(self.offer.advertised.dims()), |acc, b| {
                acc.checked_add(&b.reserved)
            })
    }

    fn release(&mut self, binding: &Binding) {
        match self.offer.remaining.checked_add(&binding.reserved) {
            Some(remaining) if self.offer.advertised.covers(&remaining) => {
                self.offer.remaining = remaining;
            }
            _ => {
                error!(
                    offer_id = %self.offer.offer_id,
                    binding_id = %binding.id,
                    "Released capacity exceeds advertised capacity, resetting from bindings"
                );
                self.recompute_remaining();
            }
        }
    }

    fn recompute_remaining(&mut self) {
        let reserved = self.reserved();
        self.offer.remaining = reserved
            .and_then(|r| self.offer.advertised.checked_sub(&r))
            .unwrap_or_else(|| ResourceVector::zeros(self.offer.advertised.dims()));
    }
}

/// Registry of advertised offers and the bindings against them
pub struct OfferCatalog {
    offers: DashMap<OfferId, Arc<Mutex<OfferSlot>>>,
    epoch: watch::Sender<u64>,
    next_binding: AtomicU64,
}

impl Default for OfferCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl OfferCatalog {
    pub fn new() -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            offers: DashMap::new(),
            epoch,
            next_binding: AtomicU64::new(1),
        }
    }

    /// Add a new offer; ids are unique for as long as the offer is advertised
    pub fn insert(&self, offer: OfferVector) -> EngineResult<()> {
        match self.offers.entry(offer.offer_id.clone()) {
            Entry::Occupied(_) => return Err(EngineError::DuplicateOffer(offer.offer_id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(OfferSlot {
                    offer,
                    bindings: BTreeMap::new(),
                    withdrawn: false,
                })));
            }
        }
        self.bump_epoch();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }

    pub fn contains(&self, offer_id: &str) -> bool {
        self.offers.contains_key(offer_id)
    }

    /// Consistent per-offer copies of every live offer, ordered by id
    pub fn snapshot(&self) -> Vec<OfferVector> {
        let mut offers: Vec<OfferVector> = self
            .slots()
            .into_iter()
            .filter_map(|slot| {
                let slot = lock(&slot);
                (!slot.withdrawn).then(|| slot.offer.clone())
            })
            .collect();
        offers.sort_by(|a, b| a.offer_id.cmp(&b.offer_id));
        offers
    }

    pub fn offer(&self, offer_id: &str) -> Option<OfferVector> {
        let slot = self.slot(offer_id)?;
        let slot = lock(&slot);
        (!slot.withdrawn).then(|| slot.offer.clone())
    }

    /// Re-check remaining capacity and reserve it for the intent
    pub fn try_commit(
        &self,
        offer_id: &str,
        intent: &IntentVector,
    ) -> Result<(Binding, OfferVector), CommitError> {
        let slot = self.slot(offer_id).ok_or(CommitError::Gone)?;
        let mut slot = lock(&slot);

        if slot.withdrawn {
            return Err(CommitError::Gone);
        }

        let remaining = slot
            .offer
            .remaining
            .checked_sub(&intent.requested)
            .ok_or(CommitError::Conflict)?;

        let binding = Binding::provisional(
            self.next_binding_id(),
            intent.intent_id.clone(),
            offer_id.to_string(),
            intent.requested.clone(),
            intent.priority,
        );

        slot.offer.remaining = remaining;
        slot.bindings.insert(binding.id.clone(), binding.clone());

        debug!(
            offer_id = %offer_id,
            binding_id = %binding.id,
            intent_id = %intent.intent_id,
            "Provisional binding created"
        );

        Ok((binding, slot.offer.clone()))
    }

    /// Revoke the lowest-priority strictly-lower-tier confirmed bindings
    /// until the intent fits, then reserve capacity for it
    pub fn try_preempt(&self, offer_id: &str, intent: &IntentVector) -> Result<Preempted, CommitError> {
        let slot = self.slot(offer_id).ok_or(CommitError::Gone)?;
        let mut slot = lock(&slot);

        if slot.withdrawn {
            return Err(CommitError::Gone);
        }

        let mut candidates: Vec<&Binding> = slot
            .bindings
            .values()
            .filter(|b| b.is_confirmed() && b.priority < intent.priority)
            .collect();
        // Lowest tier first; within a tier the newest binding goes first
        candidates.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| b.id.cmp(&a.id))
        });

        let mut available = slot.offer.remaining.clone();
        let mut chosen: Vec<BindingId> = Vec::new();
        for victim in candidates {
            if available.covers(&intent.requested) {
                break;
            }
            available = available
                .checked_add(&victim.reserved)
                .ok_or(CommitError::Conflict)?;
            chosen.push(victim.id.clone());
        }

        if chosen.is_empty() || !available.covers(&intent.requested) {
            return Err(CommitError::Conflict);
        }

        let mut victims = Vec::with_capacity(chosen.len());
        for id in chosen {
            if let Some(mut victim) = slot.bindings.remove(&id) {
                victim.status = BindingStatus::Revoked;
                slot.release(&victim);
                victims.push(victim);
            }
        }

        let remaining = slot
            .offer
            .remaining
            .checked_sub(&intent.requested)
            .ok_or(CommitError::Conflict)?;

        let binding = Binding::provisional(
            self.next_binding_id(),
            intent.intent_id.clone(),
            offer_id.to_string(),
            intent.requested.clone(),
            intent.priority,
        );
        slot.offer.remaining = remaining;
        slot.bindings.insert(binding.id.clone(), binding.clone());

        Ok(Preempted {
            binding,
            offer: slot.offer.clone(),
            victims,
        })
    }

    /// Promote a provisional binding; `false` if it was revoked meanwhile
    pub fn confirm(&self, offer_id: &str, binding_id: &str) -> bool {
        let Some(slot) = self.slot(offer_id) else {
            return false;
        };
        let mut slot = lock(&slot);
        if slot.withdrawn {
            return false;
        }
        match slot.bindings.get_mut(binding_id) {
            Some(binding) => {
                binding.status = BindingStatus::Confirmed;
                true
            }
            None => false,
        }
    }

    /// Remove a binding and return its capacity to the offer
    pub fn revoke(&self, offer_id: &str, binding_id: &str) -> Option<(Binding, OfferVector)> {
        let slot = self.slot(offer_id)?;
        let mut slot = lock(&slot);

        let mut binding = slot.bindings.remove(binding_id)?;
        binding.status = BindingStatus::Revoked;
        slot.release(&binding);

        Some((binding, slot.offer.clone()))
    }

    /// Remove an offer, revoking all of its bindings in the same critical section
    pub fn withdraw(&self, offer_id: &str) -> EngineResult<(OfferVector, Vec<Binding>)> {
        let slot_ref = self
            .slot(offer_id)
            .ok_or_else(|| EngineError::OfferNotFound(offer_id.to_string()))?;

        let (offer, revoked) = {
            let mut slot = lock(&slot_ref);
            if slot.withdrawn {
                return Err(EngineError::OfferNotFound(offer_id.to_string()));
            }
            slot.withdrawn = true;

            let revoked: Vec<Binding> = std::mem::take(&mut slot.bindings)
                .into_values()
                .map(|mut b| {
                    b.status = BindingStatus::Revoked;
                    b
                })
                .collect();
            slot.offer.remaining = slot.offer.advertised.clone();
            (slot.offer.clone(), revoked)
        };

        self.offers
            .remove_if(offer_id, |_, current| Arc::ptr_eq(current, &slot_ref));
        self.bump_epoch();

        Ok((offer, revoked))
    }

    /// Apply a signed delta to advertised capacity
    ///
    /// Fails if advertised capacity would go negative or drop below what
    /// bindings already reserve.
    pub fn update_capacity(&self, offer_id: &str, delta: &[i64]) -> EngineResult<OfferVector> {
        let slot = self
            .slot(offer_id)
            .ok_or_else(|| EngineError::OfferNotFound(offer_id.to_string()))?;

        let offer = {
            let mut slot = lock(&slot);
            if slot.withdrawn {
                return Err(EngineError::OfferNotFound(offer_id.to_string()));
            }

            let advertised = slot.offer.advertised.apply_delta(delta).ok_or_else(|| {
                EngineError::invalid(format!(
                    "capacity delta for {} would make advertised capacity negative",
                    offer_id
                ))
            })?;
            let reserved = slot
                .offer
                .advertised
                .checked_sub(&slot.offer.remaining)
                .ok_or_else(|| EngineError::invalid("offer bookkeeping is inconsistent"))?;
            let remaining = advertised.checked_sub(&reserved).ok_or_else(|| {
                EngineError::invalid(format!(
                    "capacity delta for {} drops below reserved capacity",
                    offer_id
                ))
            })?;

            slot.offer.advertised = advertised;
            slot.offer.remaining = remaining;
            slot.offer.clone()
        };

        self.bump_epoch();
        Ok(offer)
    }

    /// Live bindings across all offers, ordered by binding id
    pub fn bindings(&self) -> Vec<Binding> {
        let mut bindings: Vec<Binding> = self
            .slots()
            .into_iter()
            .flat_map(|slot| {
                let slot = lock(&slot);
                slot.bindings.values().cloned().collect::<Vec<_>>()
            })
            .collect();
        bindings.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        bindings
    }

    /// Number of confirmed bindings
    pub fn confirmed_count(&self) -> usize {
        self.slots()
            .into_iter()
            .map(|slot| lock(&slot).bindings.values().filter(|b| b.is_confirmed()).count())
            .sum()
    }

    /// Verify `reserved + remaining == advertised` on every offer
    pub fn audit(&self) -> CapacityAudit {
        let mut audit = CapacityAudit::default();

        for slot in self.slots() {
            let slot = lock(&slot);
            if slot.withdrawn {
                continue;
            }
            audit.offers_checked += 1;

            let offer = &slot.offer;
            match slot.reserved() {
                Some(reserved) => {
                    let accounted = reserved.checked_add(&offer.remaining);
                    if accounted.as_ref() != Some(&offer.advertised) {
                        audit.violations.push(format!(
                            "{}: reserved {:?} + remaining {:?} != advertised {:?}",
                            offer.offer_id,
                            reserved.as_slice(),
                            offer.remaining.as_slice(),
                            offer.advertised.as_slice()
                        ));
                    }
                }
                None => audit
                    .violations
                    .push(format!("{}: reserved capacity overflows", offer.offer_id)),
            }
        }

        audit
    }

    pub fn epoch(&self) -> u64 {
        *self.epoch.borrow()
    }

    /// Receiver that observes every catalog change
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }

    /// Signal that capacity may have become available
    pub fn bump_epoch(&self) {
        self.epoch.send_modify(|epoch| *epoch += 1);
    }

    fn slot(&self, offer_id: &str) -> Option<Arc<Mutex<OfferSlot>>> {
        self.offers.get(offer_id).map(|entry| entry.value().clone())
    }

    // Collected before locking any slot so no shard lock is held across an offer lock
    fn slots(&self) -> Vec<Arc<Mutex<OfferSlot>>> {
        self.offers.iter().map(|entry| entry.value().clone()).collect()
    }

    fn next_binding_id(&self) -> BindingId {
        format!("bnd-{}", self.next_binding.fetch_add(1, Ordering::Relaxed))
    }
}

fn lock(slot: &Mutex<OfferSlot>) -> MutexGuard<'_, OfferSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}
