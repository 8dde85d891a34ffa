//! Core types for Syncwright
//!
//! The canonical entity model shared by every adapter, plus storage
//! configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Result, SyncwrightError};

/// Identifier of a canonical record (stable across adapters)
pub type EntityId = String;

/// Kinds of records that can be synchronized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Products,
    Orders,
    Customers,
    Inventory,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [
        EntityType::Products,
        EntityType::Orders,
        EntityType::Customers,
        EntityType::Inventory,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Products => "products",
            EntityType::Orders => "orders",
            EntityType::Customers => "customers",
            EntityType::Inventory => "inventory",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "products" | "product" => Ok(EntityType::Products),
            "orders" | "order" => Ok(EntityType::Orders),
            "customers" | "customer" => Ok(EntityType::Customers),
            "inventory" => Ok(EntityType::Inventory),
            _ => Err(format!("Unknown entity type: {}", s)),
        }
    }
}

/// A purchasable variant of a product (size, colour, ...)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductVariant {
    pub sku: Option<String>,
    pub title: Option<String>,
    pub price: Option<f64>,
    pub stock: Option<i64>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

/// Catalog product
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: EntityId,
    /// Primary merchant SKU
    pub sku: Option<String>,
    /// EAN / GTIN barcode
    pub ean: Option<String>,
    #[serde(default)]
    pub title: String,
    pub description: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
    pub category: Option<String>,
    pub brand: Option<String>,
    pub price: Option<f64>,
    pub cost_price: Option<f64>,
    pub stock: Option<i64>,
    /// Weight in kilograms
    pub weight: Option<f64>,
    #[serde(default)]
    pub variants: Vec<ProductVariant>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// One line of an order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    pub sku: Option<String>,
    pub quantity: i64,
    pub unit_price: Option<f64>,
}

/// Sales order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: EntityId,
    pub order_number: Option<String>,
    /// Reference assigned by the marketplace or storefront
    pub external_reference: Option<String>,
    pub customer_email: Option<String>,
    pub status: Option<String>,
    pub currency: Option<String>,
    pub total: Option<f64>,
    #[serde(default)]
    pub lines: Vec<OrderLine>,
    pub placed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Customer record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: EntityId,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company: Option<String>,
    pub address: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Stock level of one SKU at one location
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InventoryLevel {
    pub id: EntityId,
    pub sku: Option<String>,
    pub quantity: i64,
    pub location: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Platform-neutral record, whatever system it came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    Product(Product),
    Order(Order),
    Customer(Customer),
    Inventory(InventoryLevel),
}

/// Fields that never take part in field-level comparison
const BOOKKEEPING_FIELDS: &[&str] = &["kind", "id", "updated_at"];

impl Entity {
    pub fn entity_type(&self) -> EntityType {
        match self {
            Entity::Product(_) => EntityType::Products,
            Entity::Order(_) => EntityType::Orders,
            Entity::Customer(_) => EntityType::Customers,
            Entity::Inventory(_) => EntityType::Inventory,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Entity::Product(p) => &p.id,
            Entity::Order(o) => &o.id,
            Entity::Customer(c) => &c.id,
            Entity::Inventory(i) => &i.id,
        }
    }

    pub fn set_id(&mut self, id: impl Into<EntityId>) {
        let id = id.into();
        match self {
            Entity::Product(p) => p.id = id,
            Entity::Order(o) => o.id = id,
            Entity::Customer(c) => c.id = id,
            Entity::Inventory(i) => i.id = id,
        }
    }

    /// Business key used for exact-key matching (SKU, order number, email)
    pub fn primary_key(&self) -> Option<&str> {
        let key = match self {
            Entity::Product(p) => p.sku.as_deref(),
            Entity::Order(o) => o.order_number.as_deref(),
            Entity::Customer(c) => c.email.as_deref(),
            Entity::Inventory(i) => i.sku.as_deref(),
        };
        key.filter(|k| !k.trim().is_empty())
    }

    /// Secondary key (EAN/GTIN for products)
    pub fn alternate_key(&self) -> Option<&str> {
        let key = match self {
            Entity::Product(p) => p.ean.as_deref(),
            Entity::Order(o) => o.external_reference.as_deref(),
            Entity::Customer(c) => c.phone.as_deref(),
            Entity::Inventory(_) => None,
        };
        key.filter(|k| !k.trim().is_empty())
    }

    /// Title used for fuzzy matching; only products carry one
    pub fn title(&self) -> Option<&str> {
        match self {
            Entity::Product(p) if !p.title.trim().is_empty() => Some(&p.title),
            _ => None,
        }
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Entity::Product(p) => p.updated_at,
            Entity::Order(o) => o.updated_at,
            Entity::Customer(c) => c.updated_at,
            Entity::Inventory(i) => i.updated_at,
        }
    }

    pub fn set_updated_at(&mut self, at: Option<DateTime<Utc>>) {
        match self {
            Entity::Product(p) => p.updated_at = at,
            Entity::Order(o) => o.updated_at = at,
            Entity::Customer(c) => c.updated_at = at,
            Entity::Inventory(i) => i.updated_at = at,
        }
    }

    /// Comparable fields as a JSON object, bookkeeping fields removed
    pub fn field_map(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        let value = serde_json::to_value(self)?;
        let mut map = match value {
            serde_json::Value::Object(map) => map,
            other => {
                return Err(SyncwrightError::Internal(format!(
                    "Entity serialized to non-object: {}",
                    other
                )))
            }
        };
        for field in BOOKKEEPING_FIELDS {
            map.remove(*field);
        }
        Ok(map)
    }

    /// Rebuild an entity of the same kind and id from a (possibly patched) field map
    pub fn with_fields(&self, fields: serde_json::Map<String, serde_json::Value>) -> Result<Entity> {
        let mut full = serde_json::to_value(self)?;
        if let Some(obj) = full.as_object_mut() {
            for (key, value) in fields {
                if !BOOKKEEPING_FIELDS.contains(&key.as_str()) {
                    obj.insert(key, value);
                }
            }
        }
        Ok(serde_json::from_value(full)?)
    }

    /// Short hash of the comparable content, used to skip no-op writes
    pub fn content_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        // Key order of serde_json::Map is sorted, so the hash is stable
        let fields = self
            .field_map()
            .map(serde_json::Value::Object)
            .unwrap_or_default();
        hasher.update(fields.to_string().as_bytes());
        hex::encode(hasher.finalize())[..16].to_string()
    }

    /// Basic shape validation performed before an entity is persisted
    pub fn validate(&self) -> Result<()> {
        if self.id().trim().is_empty() {
            return Err(SyncwrightError::InvalidInput(format!(
                "{} record without id",
                self.entity_type()
            )));
        }
        match self {
            Entity::Product(p) => {
                if p.price.is_some_and(|price| price < 0.0) {
                    return Err(SyncwrightError::InvalidInput(format!(
                        "Product {} has negative price",
                        p.id
                    )));
                }
            }
            Entity::Order(o) => {
                if o.lines.iter().any(|l| l.quantity <= 0) {
                    return Err(SyncwrightError::InvalidInput(format!(
                        "Order {} has a non-positive line quantity",
                        o.id
                    )));
                }
            }
            Entity::Inventory(i) => {
                if i.sku.is_none() {
                    return Err(SyncwrightError::InvalidInput(format!(
                        "Inventory level {} has no SKU",
                        i.id
                    )));
                }
            }
            Entity::Customer(_) => {}
        }
        Ok(())
    }
}

/// Configuration for the storage engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Storage mode (local or cloud-safe)
    #[serde(default)]
    pub storage_mode: StorageMode,
}

fn default_db_path() -> String {
    "~/.local/share/syncwright/syncwright.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            storage_mode: StorageMode::Local,
        }
    }
}

/// Storage mode for SQLite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    #[default]
    Local,
    CloudSafe,
}

impl std::str::FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "local" => Ok(StorageMode::Local),
            "cloud-safe" => Ok(StorageMode::CloudSafe),
            _ => Err(format!("Unknown storage mode: {}", s)),
        }
    }
}

/// Parse an RFC 3339 column value
pub(crate) fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(id: &str, sku: &str) -> Entity {
        Entity::Product(Product {
            id: id.to_string(),
            sku: Some(sku.to_string()),
            title: "Trail Runner".to_string(),
            price: Some(49.0),
            ..Default::default()
        })
    }

    #[test]
    fn test_entity_keys() {
        let e = product("p1", "  ");
        assert_eq!(e.primary_key(), None);
        assert_eq!(e.alternate_key(), None);
        assert_eq!(e.title(), Some("Trail Runner"));
        assert_eq!(e.entity_type(), EntityType::Products);

        let c = Entity::Customer(Customer {
            id: "c1".into(),
            email: Some("ana@example.com".into()),
            ..Default::default()
        });
        assert_eq!(c.primary_key(), Some("ana@example.com"));
        assert_eq!(c.title(), None);
    }

    #[test]
    fn test_field_map_excludes_bookkeeping() {
        let e = product("p1", "SKU-1");
        let map = e.field_map().unwrap();
        assert!(!map.contains_key("id"));
        assert!(!map.contains_key("kind"));
        assert!(!map.contains_key("updated_at"));
        assert_eq!(map.get("sku"), Some(&serde_json::json!("SKU-1")));
    }

    #[test]
    fn test_with_fields_patches_values() {
        let e = product("p1", "SKU-1");
        let mut map = serde_json::Map::new();
        map.insert("price".into(), serde_json::json!(55.5));
        map.insert("id".into(), serde_json::json!("ignored"));
        let patched = e.with_fields(map).unwrap();
        match patched {
            Entity::Product(p) => {
                assert_eq!(p.id, "p1");
                assert_eq!(p.price, Some(55.5));
            }
            _ => panic!("expected product"),
        }
    }

    #[test]
    fn test_content_hash_ignores_timestamps() {
        let a = product("p1", "SKU-1");
        let mut b = a.clone();
        b.set_updated_at(Some(Utc::now()));
        assert_eq!(a.content_hash(), b.content_hash());

        let c = product("p1", "SKU-2");
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn test_validate() {
        assert!(product("p1", "A").validate().is_ok());
        assert!(product("", "A").validate().is_err());
        let inv = Entity::Inventory(InventoryLevel {
            id: "i1".into(),
            ..Default::default()
        });
        assert!(inv.validate().is_err());
    }

    #[test]
    fn test_entity_type_parse() {
        assert_eq!("Products".parse::<EntityType>(), Ok(EntityType::Products));
        assert_eq!("inventory".parse::<EntityType>(), Ok(EntityType::Inventory));
        assert!("widgets".parse::<EntityType>().is_err());
    }
}
