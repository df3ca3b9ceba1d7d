use claimwatch_domain::storage::{StorageError, StorageResult};

use crate::{open, SeaOrmStorage};

#[derive(Default)]
pub struct StorageBuilder {
    database_url: Option<String>,
}

impl StorageBuilder {
    pub fn new() -> Self {
        Self { database_url: None }
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub async fn build(self) -> StorageResult<SeaOrmStorage> {
        let url = self
            .database_url
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| StorageError::Database("missing database url".into()))?;
        let db = open(&url).await?;
        SeaOrmStorage::from_connection(db).await
    }
}
