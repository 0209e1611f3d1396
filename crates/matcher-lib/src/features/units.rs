//! Unit conversion into canonical base units
//!
//! Capacity bookkeeping happens on integer base units so that reserving
//! and releasing the same request always round-trips exactly.

use crate::config::{ResourceKindConfig, UnitFamily};
use crate::error::{EngineError, EngineResult};
use crate::models::Quantity;
use std::collections::{BTreeMap, HashSet};

const KIB: f64 = 1024.0;

/// Convert a non-negative quantity of the given family into base units
pub fn to_base_units(kind: &str, family: UnitFamily, quantity: &Quantity) -> EngineResult<u64> {
    if !quantity.amount.is_finite() {
        return Err(EngineError::invalid(format!(
            "{}: quantity {} is not finite",
            kind, quantity
        )));
    }
    if quantity.amount < 0.0 {
        return Err(EngineError::invalid(format!(
            "{}: quantity {} is negative",
            kind, quantity
        )));
    }

    let multiplier = unit_multiplier(kind, family, &quantity.unit)?;
    let base = (quantity.amount * multiplier).round();

    if base >= u64::MAX as f64 {
        return Err(EngineError::invalid(format!(
            "{}: quantity {} overflows",
            kind, quantity
        )));
    }

    Ok(base as u64)
}

/// Convert a signed quantity (capacity delta) into base units
pub fn to_signed_base_units(
    kind: &str,
    family: UnitFamily,
    quantity: &Quantity,
) -> EngineResult<i64> {
    let magnitude = Quantity::new(quantity.amount.abs(), quantity.unit.clone());
    let base = to_base_units(kind, family, &magnitude)?;
    let base = i64::try_from(base)
        .map_err(|_| EngineError::invalid(format!("{}: delta {} overflows", kind, quantity)))?;

    Ok(if quantity.amount < 0.0 { -base } else { base })
}

fn unit_multiplier(kind: &str, family: UnitFamily, unit: &str) -> EngineResult<f64> {
    let multiplier = match family {
        UnitFamily::Cores => match unit {
            "" => Some(1e9),
            "m" => Some(1e6),
            "u" => Some(1e3),
            "n" => Some(1.0),
            _ => None,
        },
        UnitFamily::Bytes => match unit {
            "" => {
                return Err(EngineError::invalid(format!(
                    "{}: a unit is required (e.g. Mi, Gi)",
                    kind
                )))
            }
            "B" => Some(1.0),
            "k" | "K" => Some(1e3),
            "M" => Some(1e6),
            "G" => Some(1e9),
            "T" => Some(1e12),
            "Ki" => Some(KIB),
            "Mi" => Some(KIB * KIB),
            "Gi" => Some(KIB * KIB * KIB),
            "Ti" => Some(KIB * KIB * KIB * KIB),
            _ => None,
        },
        UnitFamily::Count => match unit {
            "" => Some(1.0),
            _ => None,
        },
    };

    multiplier.ok_or_else(|| {
        EngineError::invalid(format!("{}: unknown unit '{}' for {:?}", kind, unit, family))
    })
}

/// One configured resource dimension, with its scale in base units
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceKind {
    pub name: String,
    pub unit: UnitFamily,
    pub scale: u64,
}

/// Fixed ordering of resource kinds shared by every vector in the engine
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSchema {
    kinds: Vec<ResourceKind>,
}

impl ResourceSchema {
    pub fn from_config(kinds: &[ResourceKindConfig]) -> EngineResult<Self> {
        if kinds.is_empty() {
            return Err(EngineError::invalid("at least one resource kind is required"));
        }

        let mut seen = HashSet::new();
        let mut resolved = Vec::with_capacity(kinds.len());

        for kind in kinds {
            if kind.name.trim().is_empty() {
                return Err(EngineError::invalid("resource kind name is empty"));
            }
            if !seen.insert(kind.name.as_str()) {
                return Err(EngineError::invalid(format!(
                    "resource kind '{}' configured twice",
                    kind.name
                )));
            }

            let scale = to_base_units(&kind.name, kind.unit, &kind.scale)?;
            if scale == 0 {
                return Err(EngineError::invalid(format!(
                    "{}: normalization scale must be positive",
                    kind.name
                )));
            }

            resolved.push(ResourceKind {
                name: kind.name.clone(),
                unit: kind.unit,
                scale,
            });
        }

        Ok(Self { kinds: resolved })
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    pub fn kinds(&self) -> &[ResourceKind] {
        &self.kinds
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.kinds.iter().position(|k| k.name == name)
    }

    pub fn kind(&self, name: &str) -> EngineResult<(usize, &ResourceKind)> {
        self.index_of(name)
            .map(|i| (i, &self.kinds[i]))
            .ok_or_else(|| EngineError::invalid(format!("unknown resource kind '{}'", name)))
    }

    /// Normalization scales as floats, in dimension order
    pub fn scales(&self) -> Vec<f64> {
        self.kinds.iter().map(|k| k.scale as f64).collect()
    }

    /// Name each dimension of a base-unit vector
    pub fn describe(&self, values: &[u64]) -> BTreeMap<String, u64> {
        self.kinds
            .iter()
            .zip(values)
            .map(|(k, v)| (k.name.clone(), *v))
            .collect()
    }
}
