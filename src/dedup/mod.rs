//! Deduplication engine
//!
//! Collapses likely duplicates in a batch of incoming records (plus the
//! stored records they may collide with) before anything is persisted.
//! Three passes run in order, each over records not claimed by an earlier
//! pass: exact primary key, alternate key (EAN/GTIN), fuzzy title.

mod normalize;
mod quality;

pub use normalize::{
    normalize_key, normalize_title, significant_tokens, title_similarity, token_similarity,
};
pub use quality::quality_score;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::config::DedupConfig;
use crate::types::{Entity, EntityType};

/// Why a set of records was considered duplicates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateReason {
    ExactKey,
    AlternateKey,
    FuzzyTitle,
}

impl DuplicateReason {
    pub fn confidence(&self) -> f32 {
        match self {
            DuplicateReason::ExactKey => 1.0,
            DuplicateReason::AlternateKey => 0.95,
            DuplicateReason::FuzzyTitle => 0.8,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicateReason::ExactKey => "exact_key",
            DuplicateReason::AlternateKey => "alternate_key",
            DuplicateReason::FuzzyTitle => "fuzzy_title",
        }
    }
}

/// Where a group member came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Incoming,
    Existing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMember {
    pub id: String,
    pub origin: Origin,
    pub score: u32,
}

/// One resolved group of duplicates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub entity_type: EntityType,
    pub reason: DuplicateReason,
    pub confidence: f32,
    pub members: Vec<GroupMember>,
    pub selected_id: String,
    pub selected_origin: Origin,
    pub discarded_ids: Vec<String>,
    /// Stored record the incoming survivor is written over, when the group
    /// also contained stored records
    pub persist_as: Option<String>,
}

impl DuplicateGroup {
    /// True when nothing from this group needs to be written
    pub fn keeps_existing(&self) -> bool {
        self.selected_origin == Origin::Existing
    }
}

/// Outcome of one deduplication pass
#[derive(Debug, Clone, Default)]
pub struct DedupReport {
    /// Incoming records to persist, in incoming order
    pub entities: Vec<Entity>,
    /// Every duplicate group found
    pub groups: Vec<DuplicateGroup>,
}

struct Candidate<'a> {
    entity: &'a Entity,
    origin: Origin,
    score: u32,
}

/// Groups likely duplicates and picks one survivor per group
#[derive(Debug, Clone, Default)]
pub struct DeduplicationEngine {
    config: DedupConfig,
}

impl DeduplicationEngine {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    /// Return the subset of `incoming` to persist after collapsing
    /// duplicates within `incoming ∪ existing`.
    ///
    /// A stored record with the same id as an incoming record is the stored
    /// copy of that record; it is superseded rather than treated as a
    /// duplicate.
    pub fn deduplicate(&self, incoming: Vec<Entity>, existing: &[Entity]) -> DedupReport {
        if incoming.is_empty() {
            return DedupReport::default();
        }

        let incoming_ids: HashSet<&str> = incoming.iter().map(|e| e.id()).collect();
        let mut seen_existing: HashSet<&str> = HashSet::new();

        // Seen order: stored records first, then the incoming batch
        let mut candidates: Vec<Candidate<'_>> = existing
            .iter()
            .filter(|e| !incoming_ids.contains(e.id()) && seen_existing.insert(e.id()))
            .map(|entity| Candidate {
                entity,
                origin: Origin::Existing,
                score: quality_score(entity),
            })
            .collect();
        candidates.extend(incoming.iter().map(|entity| Candidate {
            entity,
            origin: Origin::Incoming,
            score: quality_score(entity),
        }));

        let mut claimed = vec![false; candidates.len()];
        let mut raw_groups: Vec<(DuplicateReason, Vec<usize>)> = Vec::new();

        let exact = Self::group_by_key(&candidates, &claimed, |e| e.primary_key());
        Self::claim(&mut claimed, &mut raw_groups, DuplicateReason::ExactKey, exact);

        let alternate = Self::group_by_key(&candidates, &claimed, |e| e.alternate_key());
        Self::claim(
            &mut claimed,
            &mut raw_groups,
            DuplicateReason::AlternateKey,
            alternate,
        );

        let fuzzy = self.group_by_title(&candidates, &claimed);
        Self::claim(
            &mut claimed,
            &mut raw_groups,
            DuplicateReason::FuzzyTitle,
            fuzzy,
        );

        let mut groups = Vec::with_capacity(raw_groups.len());
        // incoming index -> Some(new id) when it survives, None when discarded
        let mut decisions: HashMap<usize, Option<Option<String>>> = HashMap::new();
        let incoming_offset = candidates.len() - incoming.len();

        for (reason, members) in raw_groups {
            let survivor = Self::select_survivor(&candidates, &members);
            let persist_as = if candidates[survivor].origin == Origin::Incoming {
                Self::select_existing(&candidates, &members).map(|i| candidates[i].entity.id().to_string())
            } else {
                None
            };

            for &m in &members {
                if candidates[m].origin == Origin::Incoming {
                    let decision = if m == survivor {
                        Some(persist_as.clone())
                    } else {
                        None
                    };
                    decisions.insert(m - incoming_offset, decision);
                }
            }

            let group = DuplicateGroup {
                entity_type: candidates[survivor].entity.entity_type(),
                reason,
                confidence: reason.confidence(),
                members: members
                    .iter()
                    .map(|&m| GroupMember {
                        id: candidates[m].entity.id().to_string(),
                        origin: candidates[m].origin,
                        score: candidates[m].score,
                    })
                    .collect(),
                selected_id: candidates[survivor].entity.id().to_string(),
                selected_origin: candidates[survivor].origin,
                discarded_ids: members
                    .iter()
                    .filter(|&&m| m != survivor)
                    .map(|&m| candidates[m].entity.id().to_string())
                    .collect(),
                persist_as,
            };

            tracing::debug!(
                reason = group.reason.as_str(),
                selected = %group.selected_id,
                discarded = ?group.discarded_ids,
                "Duplicate group resolved"
            );
            groups.push(group);
        }

        drop(candidates);

        let entities = incoming
            .into_iter()
            .enumerate()
            .filter_map(|(i, mut entity)| match decisions.remove(&i) {
                None => Some(entity),
                Some(None) => None,
                Some(Some(persist_as)) => {
                    if let Some(id) = persist_as {
                        entity.set_id(id);
                    }
                    Some(entity)
                }
            })
            .collect();

        DedupReport { entities, groups }
    }

    fn claim(
        claimed: &mut [bool],
        out: &mut Vec<(DuplicateReason, Vec<usize>)>,
        reason: DuplicateReason,
        groups: Vec<Vec<usize>>,
    ) {
        for members in groups {
            for &m in &members {
                claimed[m] = true;
            }
            out.push((reason, members));
        }
    }

    /// Groups of size > 1 sharing a normalized key, in first-seen order
    fn group_by_key<F>(candidates: &[Candidate<'_>], claimed: &[bool], key_of: F) -> Vec<Vec<usize>>
    where
        F: Fn(&Entity) -> Option<&str>,
    {
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut buckets: Vec<Vec<usize>> = Vec::new();

        for (i, candidate) in candidates.iter().enumerate() {
            if claimed[i] {
                continue;
            }
            let Some(key) = key_of(candidate.entity) else {
                continue;
            };
            let key = normalize_key(key);
            if key.is_empty() {
                continue;
            }
            match index.get(&key) {
                Some(&bucket) => buckets[bucket].push(i),
                None => {
                    index.insert(key, buckets.len());
                    buckets.push(vec![i]);
                }
            }
        }

        buckets.into_iter().filter(|b| b.len() > 1).collect()
    }

    /// Transitive fuzzy grouping; the first-seen record anchors each group
    fn group_by_title(&self, candidates: &[Candidate<'_>], claimed: &[bool]) -> Vec<Vec<usize>> {
        let tokens: Vec<Option<HashSet<String>>> = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| {
                if claimed[i] {
                    return None;
                }
                c.entity
                    .title()
                    .map(|t| significant_tokens(&normalize_title(t)))
                    .filter(|t| !t.is_empty())
            })
            .collect();

        let mut taken = vec![false; candidates.len()];
        let mut groups = Vec::new();

        for anchor in 0..candidates.len() {
            if taken[anchor] || tokens[anchor].is_none() {
                continue;
            }
            let mut group = vec![anchor];
            let mut cursor = 0;
            while cursor < group.len() {
                let member = group[cursor];
                for j in (anchor + 1)..candidates.len() {
                    if taken[j] || group.contains(&j) {
                        continue;
                    }
                    let (Some(a), Some(b)) = (&tokens[member], &tokens[j]) else {
                        continue;
                    };
                    if token_similarity(a, b) > self.config.fuzzy_threshold {
                        group.push(j);
                    }
                }
                cursor += 1;
            }

            if group.len() > 1 {
                for &m in &group {
                    taken[m] = true;
                }
                groups.push(group);
            }
        }

        groups
    }

    /// Highest score wins; ties go to the earliest-seen record
    fn select_survivor(candidates: &[Candidate<'_>], members: &[usize]) -> usize {
        let mut best = members[0];
        for &m in &members[1..] {
            if candidates[m].score > candidates[best].score {
                best = m;
            }
        }
        best
    }

    fn select_existing(candidates: &[Candidate<'_>], members: &[usize]) -> Option<usize> {
        let existing: Vec<usize> = members
            .iter()
            .copied()
            .filter(|&m| candidates[m].origin == Origin::Existing)
            .collect();
        if existing.is_empty() {
            None
        } else {
            Some(Self::select_survivor(candidates, &existing))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Product;
    use pretty_assertions::assert_eq;

    fn product(id: &str) -> Product {
        Product {
            id: id.to_string(),
            ..Default::default()
        }
    }

    fn with_sku(id: &str, sku: &str) -> Entity {
        Entity::Product(Product {
            sku: Some(sku.to_string()),
            ..product(id)
        })
    }

    fn ids(entities: &[Entity]) -> Vec<&str> {
        entities.iter().map(|e| e.id()).collect()
    }

    #[test]
    fn test_empty_incoming() {
        let engine = DeduplicationEngine::default();
        let report = engine.deduplicate(vec![], &[with_sku("e1", "X")]);
        assert!(report.entities.is_empty());
        assert!(report.groups.is_empty());
    }

    #[test]
    fn test_exact_key_collapses_to_one() {
        let engine = DeduplicationEngine::default();
        let report = engine.deduplicate(vec![with_sku("a", "X"), with_sku("b", " x ")], &[]);

        assert_eq!(report.entities.len(), 1);
        assert_eq!(report.groups.len(), 1);
        let group = &report.groups[0];
        assert_eq!(group.reason, DuplicateReason::ExactKey);
        assert_eq!(group.confidence, 1.0);
        // Equal scores: earliest seen wins
        assert_eq!(group.selected_id, "a");
        assert_eq!(group.discarded_ids, vec!["b".to_string()]);
    }

    #[test]
    fn test_higher_score_survives() {
        let engine = DeduplicationEngine::default();
        let low = Entity::Product(Product {
            sku: Some("A1".into()),
            stock: Some(5),
            ..product("first")
        });
        let high = Entity::Product(Product {
            sku: Some("A1".into()),
            stock: Some(12),
            images: vec!["x".into()],
            ..product("second")
        });

        let report = engine.deduplicate(vec![low, high], &[]);
        assert_eq!(ids(&report.entities), vec!["second"]);
        match &report.entities[0] {
            Entity::Product(p) => {
                assert_eq!(p.stock, Some(12));
                assert_eq!(p.images, vec!["x".to_string()]);
            }
            _ => panic!("expected product"),
        }
    }

    #[test]
    fn test_images_and_cost_price_win() {
        let engine = DeduplicationEngine::default();
        let plain = Entity::Product(Product {
            ean: Some("4006381333931".into()),
            price: Some(10.0),
            ..product("plain")
        });
        let rich = Entity::Product(Product {
            ean: Some("4006381333931".into()),
            price: Some(10.0),
            images: vec!["img.jpg".into()],
            cost_price: Some(4.0),
            ..product("rich")
        });

        let report = engine.deduplicate(vec![plain, rich], &[]);
        assert_eq!(ids(&report.entities), vec!["rich"]);
        assert_eq!(report.groups[0].reason, DuplicateReason::AlternateKey);
        assert!((report.groups[0].confidence - 0.95).abs() < f32::EPSILON);
    }

    #[test]
    fn test_fuzzy_title_group() {
        let engine = DeduplicationEngine::default();
        let a = Entity::Product(Product {
            title: "Red Running Shoe Size 9".into(),
            ..product("a")
        });
        let b = Entity::Product(Product {
            title: "red running shoe size 9!!".into(),
            ..product("b")
        });
        let c = Entity::Product(Product {
            title: "Leather wallet brown".into(),
            ..product("c")
        });

        let report = engine.deduplicate(vec![a, b, c], &[]);
        assert_eq!(report.groups.len(), 1);
        assert_eq!(report.groups[0].reason, DuplicateReason::FuzzyTitle);
        assert_eq!(ids(&report.entities), vec!["a", "c"]);
    }

    #[test]
    fn test_fuzzy_grouping_is_transitive() {
        let engine = DeduplicationEngine::new(DedupConfig {
            fuzzy_threshold: 0.7,
        });
        let titled = |id: &str, title: &str| {
            Entity::Product(Product {
                title: title.into(),
                ..product(id)
            })
        };
        // a~b (3/4) and b~c (3/4) but a and c share only 2 of 4 tokens
        let report = engine.deduplicate(
            vec![
                titled("a", "alpha bravo charlie delta"),
                titled("b", "alpha bravo charlie echo"),
                titled("c", "alpha bravo foxtrot echo"),
            ],
            &[],
        );
        assert_eq!(report.groups.len(), 1);
        assert_eq!(report.groups[0].members.len(), 3);
        assert_eq!(report.entities.len(), 1);
    }

    #[test]
    fn test_earlier_pass_claims_first() {
        let engine = DeduplicationEngine::default();
        let a = Entity::Product(Product {
            sku: Some("S1".into()),
            ean: Some("111".into()),
            ..product("a")
        });
        let b = Entity::Product(Product {
            sku: Some("S1".into()),
            ..product("b")
        });
        let c = Entity::Product(Product {
            ean: Some("111".into()),
            ..product("c")
        });

        let report = engine.deduplicate(vec![a, b, c], &[]);
        // a and b share a SKU; c is then alone on its EAN
        assert_eq!(report.groups.len(), 1);
        assert_eq!(report.groups[0].reason, DuplicateReason::ExactKey);
        assert_eq!(ids(&report.entities), vec!["a", "c"]);
    }

    #[test]
    fn test_existing_survivor_produces_no_output() {
        let engine = DeduplicationEngine::default();
        let stored = Entity::Product(Product {
            sku: Some("X".into()),
            price: Some(10.0),
            images: vec!["a.jpg".into()],
            ..product("stored")
        });
        let report = engine.deduplicate(vec![with_sku("new", "X")], &[stored]);

        assert!(report.entities.is_empty());
        assert!(report.groups[0].keeps_existing());
        assert_eq!(report.groups[0].selected_id, "stored");
    }

    #[test]
    fn test_incoming_survivor_is_written_over_stored_record() {
        let engine = DeduplicationEngine::default();
        let stored = with_sku("stored", "X");
        let better = Entity::Product(Product {
            sku: Some("X".into()),
            price: Some(10.0),
            ..product("remote-1")
        });
        let report = engine.deduplicate(vec![better], &[stored]);

        assert_eq!(ids(&report.entities), vec!["stored"]);
        assert_eq!(report.groups[0].selected_id, "remote-1");
        assert_eq!(report.groups[0].persist_as.as_deref(), Some("stored"));
    }

    #[test]
    fn test_same_id_is_not_a_duplicate() {
        let engine = DeduplicationEngine::default();
        let report = engine.deduplicate(vec![with_sku("p1", "X")], &[with_sku("p1", "X")]);
        assert!(report.groups.is_empty());
        assert_eq!(ids(&report.entities), vec!["p1"]);
    }

    #[test]
    fn test_fuzzy_title_spans_different_skus() {
        let engine = DeduplicationEngine::default();
        let shoe = |id: &str, sku: &str, title: &str| {
            Entity::Product(Product {
                sku: Some(sku.into()),
                title: title.into(),
                ..product(id)
            })
        };
        let report = engine.deduplicate(
            vec![
                shoe("a", "SKU-A", "Red Running Shoe Size 9"),
                shoe("b", "SKU-B", "red running shoe size 9!!"),
            ],
            &[],
        );
        assert_eq!(report.groups.len(), 1);
        assert_eq!(report.groups[0].reason, DuplicateReason::FuzzyTitle);
        assert_eq!(report.entities.len(), 1);

        // Dissimilar titles stay apart
        let report = engine.deduplicate(
            vec![
                shoe("a", "SKU-A", "Red Running Shoe Size 9"),
                shoe("c", "SKU-C", "Wool Beanie Hat"),
            ],
            &[],
        );
        assert!(report.groups.is_empty());
        assert_eq!(report.entities.len(), 2);
    }

    #[test]
    fn test_records_without_keys_only_fuzzy() {
        let engine = DeduplicationEngine::default();
        let report = engine.deduplicate(
            vec![Entity::Product(product("a")), Entity::Product(product("b"))],
            &[],
        );
        assert!(report.groups.is_empty());
        assert_eq!(report.entities.len(), 2);
    }
}
