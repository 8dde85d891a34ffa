//! Conflict detection logic

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ConflictType, ResolutionAction};
use crate::error::Result;
use crate::sync::config::{ConflictRule, SyncConfiguration};
use crate::types::Entity;

/// One differing field and what the rules made of it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingConflict {
    pub field: String,
    pub conflict_type: ConflictType,
    pub source: Value,
    pub destination: Value,
    /// `None` when the field needs a manual decision
    pub resolution_action: Option<ResolutionAction>,
}

/// Outcome of comparing an incoming record with its stored copy
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// Same content; nothing to write
    Unchanged,
    /// Timestamps ordered the change; `source_won` tells which side it was
    Ordered { merged: Entity, source_won: bool },
    /// Field-by-field outcome under the configuration's rules
    Fields {
        merged: Entity,
        conflicts: Vec<PendingConflict>,
    },
}

impl Detection {
    /// Record to persist, if anything changed
    pub fn merged(&self) -> Option<&Entity> {
        match self {
            Detection::Unchanged => None,
            Detection::Ordered { merged, .. } | Detection::Fields { merged, .. } => Some(merged),
        }
    }

    pub fn conflicts(&self) -> &[PendingConflict] {
        match self {
            Detection::Fields { conflicts, .. } => conflicts,
            _ => &[],
        }
    }
}

/// Compares overlapping fields of an incoming (source) record and the
/// stored (destination) record
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictDetector;

impl ConflictDetector {
    pub fn new() -> Self {
        Self
    }

    /// Fields the source carries (non-null) whose value differs from the
    /// destination, in field-name order
    pub fn differing_fields(
        &self,
        source: &Entity,
        destination: &Entity,
    ) -> Result<Vec<(String, Value, Value)>> {
        let src = source.field_map()?;
        let dst = destination.field_map()?;
        Ok(src
            .into_iter()
            .filter(|(_, value)| !value.is_null())
            .filter_map(|(field, value)| {
                let current = dst.get(&field).cloned().unwrap_or(Value::Null);
                (current != value).then_some((field, value, current))
            })
            .collect())
    }

    pub fn detect(
        &self,
        config: &SyncConfiguration,
        source: &Entity,
        destination: &Entity,
    ) -> Result<Detection> {
        let differences = self.differing_fields(source, destination)?;
        if differences.is_empty() {
            return Ok(Detection::Unchanged);
        }

        let (src_ts, dst_ts) = (source.updated_at(), destination.updated_at());

        if config.auto_resolve_conflicts {
            if let (Some(s), Some(d)) = (src_ts, dst_ts) {
                if s != d {
                    let source_won = s > d;
                    let merged = if source_won {
                        let patch = differences.into_iter().map(|(f, v, _)| (f, v)).collect();
                        let mut merged = destination.with_fields(patch)?;
                        merged.set_updated_at(src_ts);
                        merged
                    } else {
                        destination.clone()
                    };
                    return Ok(Detection::Ordered { merged, source_won });
                }
            }
        }

        let conflict_type = match (src_ts, dst_ts) {
            _ if !config.auto_resolve_conflicts => ConflictType::VersionConflict,
            (Some(s), Some(d)) if s == d => ConflictType::VersionConflict,
            _ => ConflictType::DataMismatch,
        };

        let mut patch = serde_json::Map::new();
        let mut conflicts = Vec::with_capacity(differences.len());
        for (field, source_value, destination_value) in differences {
            let resolution_action = match config.rule_for(&field) {
                Some(ConflictRule::SourceWins) => {
                    patch.insert(field.clone(), source_value.clone());
                    Some(ResolutionAction::SourceWins)
                }
                Some(ConflictRule::DestinationWins) => Some(ResolutionAction::DestinationWins),
                Some(ConflictRule::ManualReview) | None => None,
            };
            conflicts.push(PendingConflict {
                field,
                conflict_type,
                source: source_value,
                destination: destination_value,
                resolution_action,
            });
        }

        let merged = if patch.is_empty() {
            destination.clone()
        } else {
            let mut merged = destination.with_fields(patch)?;
            merged.set_updated_at(src_ts.max(dst_ts));
            merged
        };

        Ok(Detection::Fields { merged, conflicts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::config::{SyncDirection, SyncFrequency};
    use crate::types::{EntityType, Product};
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;

    fn config(auto: bool, rules: &[(&str, ConflictRule)]) -> SyncConfiguration {
        let now = Utc::now();
        SyncConfiguration {
            id: "c".into(),
            owner_id: "o".into(),
            adapter_id: "a".into(),
            direction: SyncDirection::Import,
            frequency: SyncFrequency::Manual,
            entities: vec![EntityType::Products],
            auto_resolve_conflicts: auto,
            conflict_rules: rules
                .iter()
                .map(|(f, r)| (f.to_string(), *r))
                .collect::<BTreeMap<_, _>>(),
            is_active: true,
            last_sync_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn product(price: f64, title: &str, updated: Option<chrono::DateTime<Utc>>) -> Entity {
        Entity::Product(Product {
            id: "p1".into(),
            sku: Some("S1".into()),
            title: title.into(),
            price: Some(price),
            updated_at: updated,
            ..Default::default()
        })
    }

    fn price_of(entity: &Entity) -> Option<f64> {
        match entity {
            Entity::Product(p) => p.price,
            _ => None,
        }
    }

    #[test]
    fn test_unchanged() {
        let detector = ConflictDetector::new();
        let a = product(10.0, "Shoe", None);
        let detection = detector.detect(&config(true, &[]), &a, &a.clone()).unwrap();
        assert_eq!(detection, Detection::Unchanged);
    }

    #[test]
    fn test_null_source_fields_do_not_conflict() {
        let detector = ConflictDetector::new();
        let source = Entity::Product(Product {
            id: "p1".into(),
            sku: Some("S1".into()),
            ..Default::default()
        });
        let destination = Entity::Product(Product {
            id: "p1".into(),
            sku: Some("S1".into()),
            cost_price: Some(3.0),
            ..Default::default()
        });
        let diffs = detector.differing_fields(&source, &destination).unwrap();
        assert!(diffs.is_empty());
    }

    #[test]
    fn test_newer_source_wins_when_auto_resolving() {
        let detector = ConflictDetector::new();
        let t = Utc::now();
        let source = product(12.0, "Shoe", Some(t));
        let destination = product(10.0, "Shoe", Some(t - Duration::hours(1)));

        let detection = detector.detect(&config(true, &[]), &source, &destination).unwrap();
        match detection {
            Detection::Ordered { merged, source_won } => {
                assert!(source_won);
                assert_eq!(price_of(&merged), Some(12.0));
                assert_eq!(merged.updated_at(), Some(t));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rules_when_not_auto_resolving() {
        let detector = ConflictDetector::new();
        let t = Utc::now();
        let source = product(12.0, "New title", Some(t));
        let destination = product(10.0, "Old title", Some(t - Duration::hours(1)));
        let cfg = config(false, &[("price", ConflictRule::SourceWins)]);

        let detection = detector.detect(&cfg, &source, &destination).unwrap();
        let merged = detection.merged().cloned().unwrap();
        assert_eq!(price_of(&merged), Some(12.0));
        match &merged {
            Entity::Product(p) => assert_eq!(p.title, "Old title"),
            _ => unreachable!(),
        }

        let conflicts = detection.conflicts();
        assert_eq!(conflicts.len(), 2);
        let price = conflicts.iter().find(|c| c.field == "price").unwrap();
        assert_eq!(price.resolution_action, Some(ResolutionAction::SourceWins));
        assert_eq!(price.conflict_type, ConflictType::VersionConflict);
        let title = conflicts.iter().find(|c| c.field == "title").unwrap();
        assert_eq!(title.resolution_action, None);
    }

    #[test]
    fn test_equal_timestamps_are_version_conflicts() {
        let detector = ConflictDetector::new();
        let t = Utc::now();
        let source = product(12.0, "Shoe", Some(t));
        let destination = product(10.0, "Shoe", Some(t));
        let cfg = config(true, &[("price", ConflictRule::DestinationWins)]);

        let detection = detector.detect(&cfg, &source, &destination).unwrap();
        let conflicts = detection.conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::VersionConflict);
        assert_eq!(
            conflicts[0].resolution_action,
            Some(ResolutionAction::DestinationWins)
        );
        assert_eq!(detection.merged().and_then(price_of), Some(10.0));
    }

    #[test]
    fn test_missing_timestamp_is_data_mismatch() {
        let detector = ConflictDetector::new();
        let source = product(12.0, "Shoe", None);
        let destination = product(10.0, "Shoe", Some(Utc::now()));
        let detection = detector
            .detect(&config(true, &[]), &source, &destination)
            .unwrap();
        assert_eq!(detection.conflicts()[0].conflict_type, ConflictType::DataMismatch);
        assert_eq!(detection.conflicts()[0].resolution_action, None);
    }
}
