//! Engine instance registry
//!
//! Tracks the names of live engine instances sharing one journal. The only
//! consumer is `disownRecovery`: before reclaiming the flights an owner left
//! behind, the engine calls `delete` on that owner's name inside the same
//! transaction, so a second instance racing the same recovery scan cannot
//! also claim to be disowning it (§4.7).

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::PgPool;

#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("backend error: {0}")]
    Backend(String),
}

/// Name-keyed registry of engine instances.
#[async_trait]
pub trait InstanceRegistry: Send + Sync {
    async fn initialize(&self) -> Result<(), InstanceError>;

    /// Register `name` if it is not already present. Idempotent: calling
    /// this again for an instance that is already registered is a no-op.
    async fn find_or_create(&self, name: &str) -> Result<String, InstanceError>;

    async fn list(&self) -> Result<Vec<String>, InstanceError>;

    /// Forget `name`. Returns whether it was present.
    async fn delete(&self, name: &str) -> Result<bool, InstanceError>;
}

/// In-process `InstanceRegistry`, for tests and single-binary demos.
#[derive(Default)]
pub struct InMemoryInstanceRegistry {
    names: Mutex<HashSet<String>>,
}

impl InMemoryInstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceRegistry for InMemoryInstanceRegistry {
    async fn initialize(&self) -> Result<(), InstanceError> {
        Ok(())
    }

    async fn find_or_create(&self, name: &str) -> Result<String, InstanceError> {
        self.names.lock().insert(name.to_string());
        Ok(name.to_string())
    }

    async fn list(&self) -> Result<Vec<String>, InstanceError> {
        Ok(self.names.lock().iter().cloned().collect())
    }

    async fn delete(&self, name: &str) -> Result<bool, InstanceError> {
        Ok(self.names.lock().remove(name))
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS stairway_instances (
    instance_name TEXT PRIMARY KEY,
    created_at    TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

/// `InstanceRegistry` backed by a shared `PgPool`.
pub struct PostgresInstanceRegistry {
    pool: PgPool,
}

impl PostgresInstanceRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InstanceRegistry for PostgresInstanceRegistry {
    async fn initialize(&self) -> Result<(), InstanceError> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| InstanceError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn find_or_create(&self, name: &str) -> Result<String, InstanceError> {
        sqlx::query(
            "INSERT INTO stairway_instances (instance_name) VALUES ($1)
             ON CONFLICT (instance_name) DO NOTHING",
        )
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(|e| InstanceError::Backend(e.to_string()))?;
        Ok(name.to_string())
    }

    async fn list(&self) -> Result<Vec<String>, InstanceError> {
        use sqlx::Row;
        let rows = sqlx::query("SELECT instance_name FROM stairway_instances")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| InstanceError::Backend(e.to_string()))?;
        rows.into_iter()
            .map(|row| row.try_get("instance_name").map_err(|e| InstanceError::Backend(e.to_string())))
            .collect()
    }

    async fn delete(&self, name: &str) -> Result<bool, InstanceError> {
        let result = sqlx::query("DELETE FROM stairway_instances WHERE instance_name = $1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| InstanceError::Backend(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }
}

/// Convenience alias for the shared-ownership form engine code holds.
pub type SharedInstanceRegistry = Arc<dyn InstanceRegistry>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn find_or_create_is_idempotent() {
        let registry = InMemoryInstanceRegistry::new();
        registry.find_or_create("engine-a").await.unwrap();
        registry.find_or_create("engine-a").await.unwrap();
        assert_eq!(registry.list().await.unwrap(), vec!["engine-a".to_string()]);
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let registry = InMemoryInstanceRegistry::new();
        registry.find_or_create("engine-a").await.unwrap();
        assert!(registry.delete("engine-a").await.unwrap());
        assert!(!registry.delete("engine-a").await.unwrap());
    }

    #[tokio::test]
    async fn list_reflects_all_registered_instances() {
        let registry = InMemoryInstanceRegistry::new();
        registry.find_or_create("engine-a").await.unwrap();
        registry.find_or_create("engine-b").await.unwrap();
        let mut names = registry.list().await.unwrap();
        names.sort();
        assert_eq!(names, vec!["engine-a".to_string(), "engine-b".to_string()]);
    }
}
