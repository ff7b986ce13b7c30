//! Variable/context store
//!
//! One logical store per process. Reads are served from an in-memory map;
//! writes go through to SQLite before the map is updated, so a failed write
//! leaves the previous value visible.

use chrono::Utc;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool},
    Row,
};
use std::{
    collections::HashMap,
    path::Path,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use tokio::sync::Mutex;

use crate::context::variable::{ContextRecord, Scope, Variable};
use crate::error::{FlowError, Result};

type ScopeMap = HashMap<String, HashMap<String, ContextRecord>>;

/// Scoped key-value store shared by every flow
#[derive(Debug)]
pub struct ContextStore {
    /// scope key -> variable name -> record
    records: RwLock<ScopeMap>,
    /// `None` for a purely in-memory store
    pool: Option<SqlitePool>,
    /// Serializes write-through so the map and the database agree per key
    write_gate: Mutex<()>,
}

impl ContextStore {
    /// Open (or create) the SQLite-backed store and load every persisted record
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        tracing::info!("Opening context store: {}", db_path.display());
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        Self::init_schema(&pool).await?;

        let records = Self::load_all(&pool).await?;
        let count: usize = records.values().map(HashMap::len).sum();
        tracing::info!("Context store loaded {} records", count);

        Ok(Self {
            records: RwLock::new(records),
            pool: Some(pool),
            write_gate: Mutex::new(()),
        })
    }

    /// Store without persistence
    pub fn in_memory() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            pool: None,
            write_gate: Mutex::new(()),
        }
    }

    async fn init_schema(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS context_records (
                scope TEXT NOT NULL,
                name TEXT NOT NULL,
                value_type TEXT NOT NULL,
                value JSON NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                updated_at TEXT NOT NULL,
                PRIMARY KEY (scope, name)
            )
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    async fn load_all(pool: &SqlitePool) -> Result<ScopeMap> {
        let rows = sqlx::query(
            "SELECT scope, name, value_type, value, description, updated_at FROM context_records",
        )
        .fetch_all(pool)
        .await?;

        let mut records: ScopeMap = HashMap::new();
        for row in rows {
            let scope: String = row.get("scope");
            let name: String = row.get("name");
            let raw_value: String = row.get("value");
            let updated_at: String = row.get("updated_at");

            let value = match serde_json::from_str(&raw_value) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!("Skipping unreadable context record {}/{}: {}", scope, name, e);
                    continue;
                }
            };
            let updated_at = chrono::DateTime::parse_from_rfc3339(&updated_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());

            let record = ContextRecord {
                name: name.clone(),
                description: row.get("description"),
                updated_at,
                variable: Variable::new(row.get::<String, _>("value_type").as_str(), value),
                in_memory: false,
            };
            records.entry(scope).or_default().insert(name, record);
        }
        Ok(records)
    }

    fn read(&self) -> RwLockReadGuard<'_, ScopeMap> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ScopeMap> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read a variable; `NotFound` if the scope has no such name
    pub fn get_variable(&self, name: &str, scope: &Scope) -> Result<Variable> {
        self.get_record(name, scope).map(|r| r.variable)
    }

    pub fn get_record(&self, name: &str, scope: &Scope) -> Result<ContextRecord> {
        self.read()
            .get(scope.as_str())
            .and_then(|vars| vars.get(name))
            .cloned()
            .ok_or_else(|| FlowError::NotFound(format!("variable '{}' in scope '{}'", name, scope)))
    }

    /// Write-through set; last writer wins per key
    pub async fn set_variable(&self, name: &str, scope: &Scope, variable: Variable) -> Result<()> {
        self.store(name, scope, variable, false).await
    }

    /// Set a variable that is kept in memory only
    pub async fn set_transient_variable(&self, name: &str, scope: &Scope, variable: Variable) -> Result<()> {
        self.store(name, scope, variable, true).await
    }

    async fn store(&self, name: &str, scope: &Scope, variable: Variable, in_memory: bool) -> Result<()> {
        if name.is_empty() {
            return Err(FlowError::Validation("variable name can't be empty".into()));
        }
        let _gate = self.write_gate.lock().await;

        let description = self
            .read()
            .get(scope.as_str())
            .and_then(|vars| vars.get(name))
            .map(|r| r.description.clone())
            .unwrap_or_default();
        let record = ContextRecord {
            name: name.to_string(),
            description,
            updated_at: Utc::now(),
            variable,
            in_memory,
        };

        if let Some(pool) = &self.pool {
            if in_memory {
                sqlx::query("DELETE FROM context_records WHERE scope = ? AND name = ?")
                    .bind(scope.as_str())
                    .bind(name)
                    .execute(pool)
                    .await?;
            } else {
                let raw_value = serde_json::to_string(&record.variable.value)?;
                sqlx::query(
                    r#"
                    INSERT INTO context_records (scope, name, value_type, value, description, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?)
                    ON CONFLICT(scope, name) DO UPDATE SET
                        value_type = excluded.value_type,
                        value = excluded.value,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(scope.as_str())
                .bind(name)
                .bind(&record.variable.value_type)
                .bind(&raw_value)
                .bind(&record.description)
                .bind(record.updated_at.to_rfc3339())
                .execute(pool)
                .await?;
            }
        }

        self.write()
            .entry(scope.as_str().to_string())
            .or_default()
            .insert(name.to_string(), record);
        tracing::debug!("Context variable set: {}/{}", scope, name);
        Ok(())
    }

    /// All records of a scope, ordered by name
    pub fn get_records(&self, scope: &Scope) -> Vec<ContextRecord> {
        let mut records: Vec<ContextRecord> = self
            .read()
            .get(scope.as_str())
            .map(|vars| vars.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub async fn delete_variable(&self, name: &str, scope: &Scope) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        if let Some(pool) = &self.pool {
            sqlx::query("DELETE FROM context_records WHERE scope = ? AND name = ?")
                .bind(scope.as_str())
                .bind(name)
                .execute(pool)
                .await?;
        }
        if let Some(vars) = self.write().get_mut(scope.as_str()) {
            vars.remove(name);
        }
        Ok(())
    }

    /// Drop every variable of a scope (used when a flow is deleted)
    pub async fn delete_scope(&self, scope: &Scope) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        if let Some(pool) = &self.pool {
            sqlx::query("DELETE FROM context_records WHERE scope = ?")
                .bind(scope.as_str())
                .execute(pool)
                .await?;
        }
        self.write().remove(scope.as_str());
        Ok(())
    }
}
