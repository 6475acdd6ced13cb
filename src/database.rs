use std::path::Path;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rusqlite::{params_from_iter, types::Value as SqliteValue, types::ValueRef, Connection};
use tracing::debug;

use crate::pipeline::types::{SqlValue, StructuredQuery};

/// One row from a read-only catalog query, keyed by column name in statement
/// order. Generated SELECTs are arbitrary (aggregates included), so rows are
/// kept generic instead of being bound to a fixed record type.
#[derive(Debug, Clone, Default)]
pub struct CatalogRow {
    pub columns: Vec<(String, SqlValue)>,
}

impl CatalogRow {
    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(column, _)| column.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(SqlValue::as_f64)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(SqlValue::as_str)
    }
}

/// Read-only access to the product catalog. The guard validates statements
/// before they reach this trait; implementations reject non-read-only input
/// again at the store boundary as a second line of defense.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn execute_readonly(
        &self,
        query: &StructuredQuery,
        request_id: &str,
    ) -> Result<Vec<CatalogRow>>;
}

/// A catalog record used to seed the SQLite store.
#[derive(Debug, Clone)]
pub struct CatalogItem {
    pub item_id: String,
    pub title: String,
    pub description: String,
    pub price: Option<f64>,
    pub rating: Option<f64>,
    pub rating_count: Option<i64>,
    pub category: Option<String>,
}

const CATALOG_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS products (
    item_id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    price REAL,
    rating REAL,
    rating_count INTEGER,
    category TEXT
);
CREATE INDEX IF NOT EXISTS idx_products_price ON products (price);
CREATE INDEX IF NOT EXISTS idx_products_rating ON products (rating);
CREATE INDEX IF NOT EXISTS idx_products_category ON products (category);
";

/// SQLite-backed catalog store.
pub struct SqliteCatalog {
    conn: Mutex<Connection>,
}

impl SqliteCatalog {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open catalog at {}", path.display()))?;
        conn.execute_batch(CATALOG_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CATALOG_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Seed helper for the demo binary and tests. Not part of the read-only
    /// store contract.
    pub fn insert_items(&self, items: &[CatalogItem]) -> Result<()> {
        let conn = self.conn.lock().expect("catalog lock poisoned");
        for item in items {
            conn.execute(
                "INSERT OR REPLACE INTO products
                     (item_id, title, description, price, rating, rating_count, category)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    item.item_id,
                    item.title,
                    item.description,
                    item.price,
                    item.rating,
                    item.rating_count,
                    item.category,
                ],
            )?;
        }
        Ok(())
    }
}

fn bind_value(value: &SqlValue) -> SqliteValue {
    match value {
        SqlValue::Null => SqliteValue::Null,
        SqlValue::Int(n) => SqliteValue::Integer(*n),
        SqlValue::Float(f) => SqliteValue::Real(*f),
        SqlValue::Text(s) => SqliteValue::Text(s.clone()),
    }
}

fn read_value(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(n) => SqlValue::Int(n),
        ValueRef::Real(f) => SqlValue::Float(f),
        ValueRef::Text(bytes) => SqlValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(_) => SqlValue::Null,
    }
}

#[async_trait]
impl CatalogStore for SqliteCatalog {
    async fn execute_readonly(
        &self,
        query: &StructuredQuery,
        request_id: &str,
    ) -> Result<Vec<CatalogRow>> {
        let conn = self.conn.lock().expect("catalog lock poisoned");
        let mut stmt = conn.prepare(&query.sql)?;

        // Second line of defense behind the guard: SQLite knows whether the
        // prepared statement writes.
        if !stmt.readonly() {
            bail!("catalog store refused a non-read-only statement");
        }

        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let bound: Vec<SqliteValue> = query.params.iter().map(bind_value).collect();

        let mut rows = stmt.query(params_from_iter(bound))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut columns = Vec::with_capacity(names.len());
            for (i, name) in names.iter().enumerate() {
                columns.push((name.clone(), read_value(row.get_ref(i)?)));
            }
            out.push(CatalogRow { columns });
        }

        debug!(request_id, rows = out.len(), "catalog query executed");
        Ok(out)
    }
}
