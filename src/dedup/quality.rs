//! Record quality scoring
//!
//! The score decides which member of a duplicate group survives: the most
//! complete record wins.

use crate::types::Entity;

/// Completeness score of a record; higher is better
pub fn quality_score(entity: &Entity) -> u32 {
    match entity {
        Entity::Product(p) => {
            let mut score = 0;
            if p.title.trim().chars().count() > 10 {
                score += 10;
            }
            if p
                .description
                .as_deref()
                .is_some_and(|d| d.trim().chars().count() > 50)
            {
                score += 10;
            }
            if !p.images.is_empty() {
                score += 10;
            }
            if has_text(p.category.as_deref()) {
                score += 5;
            }
            if has_text(p.brand.as_deref()) {
                score += 5;
            }
            if p.price.is_some_and(|price| price > 0.0) {
                score += 15;
            }
            if p.cost_price.is_some() {
                score += 15;
            }
            if let Some(stock) = p.stock {
                if stock > 0 {
                    score += 10;
                }
                if stock > 10 {
                    score += 10;
                }
            }
            if p.weight.is_some() {
                score += 3;
            }
            if has_text(p.ean.as_deref()) {
                score += 4;
            }
            if !p.variants.is_empty() {
                score += 3;
            }
            score
        }
        Entity::Order(o) => {
            let mut score = 0;
            if has_text(o.order_number.as_deref()) {
                score += 10;
            }
            if has_text(o.external_reference.as_deref()) {
                score += 4;
            }
            if has_text(o.customer_email.as_deref()) {
                score += 10;
            }
            if has_text(o.status.as_deref()) {
                score += 5;
            }
            if o.total.is_some_and(|t| t > 0.0) {
                score += 15;
            }
            if !o.lines.is_empty() {
                score += 15;
            }
            if o.placed_at.is_some() {
                score += 5;
            }
            score
        }
        Entity::Customer(c) => {
            [
                (c.email.as_deref(), 15),
                (c.phone.as_deref(), 4),
                (c.first_name.as_deref(), 5),
                (c.last_name.as_deref(), 5),
                (c.company.as_deref(), 3),
                (c.address.as_deref(), 10),
            ]
            .into_iter()
            .filter(|(value, _)| has_text(*value))
            .map(|(_, points)| points)
            .sum()
        }
        Entity::Inventory(i) => {
            let mut score = 0;
            if i.quantity > 0 {
                score += 10;
            }
            if has_text(i.location.as_deref()) {
                score += 5;
            }
            score
        }
    }
}

fn has_text(value: Option<&str>) -> bool {
    value.is_some_and(|v| !v.trim().is_empty())
}
