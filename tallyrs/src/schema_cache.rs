use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::config::SchemaCacheConfig;

#[derive(Debug, Clone)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TableSchema {
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn column_names(&self) -> HashSet<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// Cache entry with timestamp for TTL tracking.
#[derive(Debug, Clone)]
struct CacheEntry {
    schema: TableSchema,
    inserted_at: Instant,
}

/// Warehouse table schemas keyed by table path, with TTL and size limits.
#[derive(Debug)]
pub struct SchemaCache {
    schemas: HashMap<String, CacheEntry>,
    ttl: Duration,
    max_size: usize,
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::with_config(&SchemaCacheConfig::default())
    }

    pub fn with_config(config: &SchemaCacheConfig) -> Self {
        Self {
            schemas: HashMap::new(),
            ttl: Duration::from_secs(config.ttl_secs),
            max_size: config.max_size.max(1),
        }
    }

    pub fn insert(&mut self, table: String, schema: TableSchema) {
        if self.schemas.len() >= self.max_size && !self.schemas.contains_key(&table) {
            self.evict_oldest();
        }
        self.schemas.insert(
            table,
            CacheEntry {
                schema,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Cached schema if present and younger than the TTL.
    pub fn get(&self, table: &str) -> Option<&TableSchema> {
        self.schemas
            .get(table)
            .filter(|entry| entry.inserted_at.elapsed() < self.ttl)
            .map(|entry| &entry.schema)
    }

    /// Drop a table's schema, e.g. after it was rebuilt.
    pub fn invalidate(&mut self, table: &str) {
        self.schemas.remove(table);
    }

    pub fn evict_expired(&mut self) {
        self.schemas
            .retain(|_, entry| entry.inserted_at.elapsed() < self.ttl);
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest_key) = self
            .schemas
            .iter()
            .min_by_key(|(_, entry)| entry.inserted_at)
            .map(|(k, _)| k.clone())
        {
            tracing::debug!(table = %oldest_key, "evicting oldest schema from cache");
            self.schemas.remove(&oldest_key);
        }
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
