//! Implicit intents from workload annotations
//!
//! Workloads that do not carry an explicit intent can describe their needs
//! with annotations under a common prefix, e.g.
//! `intent.continuum.io/location: eu-west/a, eu-central`. Qualities such as
//! compliance or energy source become mandatory `<key>=<value>` tags.

use crate::error::{EngineError, EngineResult};
use crate::models::{IntentSpec, LatencyClass, LocalityConstraint, PriorityTier, Quantity};
use std::collections::BTreeMap;
use tracing::debug;

/// Builds an [`IntentSpec`] from prefixed annotations
#[derive(Debug, Clone)]
pub struct AnnotationParser {
    prefix: String,
}

impl AnnotationParser {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Parse every annotation under the prefix into one intent
    ///
    /// Annotations outside the prefix are not ours and are skipped silently;
    /// unknown keys inside it are skipped with a debug log.
    pub fn parse(
        &self,
        intent_id: &str,
        annotations: &BTreeMap<String, String>,
    ) -> EngineResult<IntentSpec> {
        let mut spec = IntentSpec::new(intent_id);
        let mut recognized = 0usize;

        for (key, raw) in annotations {
            let Some(name) = key.strip_prefix(&self.prefix) else {
                continue;
            };
            let name = name.to_ascii_lowercase();
            let value = raw.trim();
            if value.is_empty() {
                return Err(EngineError::invalid(format!(
                    "annotation {} has an empty value",
                    key
                )));
            }

            match name.as_str() {
                "location" => spec.locality = parse_location(key, value)?,
                "latency" => spec.max_latency = Some(value.parse::<LatencyClass>()?),
                "priority" => spec.priority = value.parse::<PriorityTier>()?,
                "compliance" => {
                    spec.mandatory_tags
                        .insert(format!("compliance={}", value.to_lowercase()));
                }
                "architecture" => {
                    spec.mandatory_tags
                        .insert(format!("arch={}", value.to_lowercase()));
                }
                // Offers advertise these qualities as `<key>=<value>` tags
                "throughput" | "energy" | "battery" => {
                    spec.mandatory_tags
                        .insert(format!("{}={}", name, value.to_lowercase()));
                }
                "cpu" | "memory" | "gpu" => {
                    spec.requests.insert(name.clone(), value.parse::<Quantity>()?);
                }
                _ => {
                    debug!(intent_id = %intent_id, annotation = %key, "Ignoring unknown intent annotation");
                    continue;
                }
            }
            recognized += 1;
        }

        debug!(intent_id = %intent_id, recognized, "Extracted intent from annotations");
        Ok(spec)
    }
}

fn parse_location(key: &str, value: &str) -> EngineResult<LocalityConstraint> {
    let entries: Vec<String> = value
        .split(',')
        .map(|entry| entry.trim().to_lowercase())
        .collect();
    if entries.iter().any(String::is_empty) {
        return Err(EngineError::invalid(format!(
            "annotation {} has a blank location entry",
            key
        )));
    }
    Ok(LocalityConstraint::one_of(entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_ANNOTATION_PREFIX;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (format!("{}{}", DEFAULT_ANNOTATION_PREFIX, k), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_full_set() {
        let parser = AnnotationParser::new(DEFAULT_ANNOTATION_PREFIX);
        let spec = parser
            .parse(
                "web",
                &annotations(&[
                    ("location", "eu-west/a, EU-Central"),
                    ("latency", "Low"),
                    ("compliance", "GDPR"),
                    ("architecture", "arm64"),
                    ("gpu", "1"),
                    ("cpu", "500m"),
                    ("memory", "2Gi"),
                    ("priority", "high"),
                ]),
            )
            .unwrap();

        assert_eq!(spec.id, "web");
        assert_eq!(
            spec.locality,
            LocalityConstraint::one_of(["eu-west/a", "eu-central"])
        );
        assert_eq!(spec.max_latency, Some(LatencyClass::Low));
        assert_eq!(spec.priority, PriorityTier::High);
        assert!(spec.mandatory_tags.contains("compliance=gdpr"));
        assert!(spec.mandatory_tags.contains("arch=arm64"));
        assert_eq!(spec.requests["cpu"], Quantity::millicores(500.0));
        assert_eq!(spec.requests["memory"], Quantity::gib(2.0));
        assert_eq!(spec.requests["gpu"], Quantity::count(1.0));
    }

    #[test]
    fn test_unknown_and_foreign_keys_ignored() {
        let parser = AnnotationParser::new(DEFAULT_ANNOTATION_PREFIX);
        let mut input = annotations(&[("cpu", "2"), ("replicas", "3")]);
        input.insert("app.kubernetes.io/name".to_string(), "web".to_string());

        let spec = parser.parse("web", &input).unwrap();
        assert_eq!(spec.requests.len(), 1);
        assert!(spec.mandatory_tags.is_empty());
        assert_eq!(spec.locality, LocalityConstraint::Any);
    }

    #[test]
    fn test_quality_keys_become_tags() {
        let parser = AnnotationParser::new(DEFAULT_ANNOTATION_PREFIX);
        let spec = parser
            .parse(
                "sensor",
                &annotations(&[
                    ("cpu", "1"),
                    ("throughput", "High"),
                    ("energy", "renewable"),
                    ("battery", "LOW"),
                ]),
            )
            .unwrap();

        assert_eq!(
            spec.mandatory_tags.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["battery=low", "energy=renewable", "throughput=high"]
        );
    }

    #[test]
    fn test_malformed_values_rejected() {
        let parser = AnnotationParser::new(DEFAULT_ANNOTATION_PREFIX);

        for (key, value) in [
            ("latency", "instant"),
            ("priority", "urgent"),
            ("cpu", "lots"),
            ("location", "eu-west,,eu-central"),
            ("compliance", "  "),
        ] {
            let result = parser.parse("web", &annotations(&[(key, value)]));
            assert!(
                matches!(result, Err(EngineError::InvalidInput(_))),
                "{}={} should be rejected",
                key,
                value
            );
        }
    }

    #[test]
    fn test_custom_prefix() {
        let parser = AnnotationParser::new("fluidos-intent-");
        let input = BTreeMap::from([("fluidos-intent-cpu".to_string(), "1".to_string())]);

        let spec = parser.parse("job", &input).unwrap();
        assert_eq!(spec.requests["cpu"], Quantity::count(1.0));
    }
}
