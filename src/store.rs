//! In-memory record store behind the CRUD routes.
//!
//! Records are opaque JSON objects with a unique `code` per collection.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::error::ApiError;

pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Codes seeded by `init-defaults`.
pub const DEFAULT_COMPOUND_CODES: [&str; 3] = ["BGB-21447", "BGB-16673", "BGB-43395"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Compounds,
    Templates,
    Documents,
}

impl Collection {
    pub const ALL: [Collection; 3] = [Self::Compounds, Self::Templates, Self::Documents];

    pub fn segment(&self) -> &'static str {
        match self {
            Self::Compounds => "compounds",
            Self::Templates => "templates",
            Self::Documents => "documents",
        }
    }

    /// Capitalized singular used in error details.
    pub fn singular(&self) -> &'static str {
        match self {
            Self::Compounds => "Compound",
            Self::Templates => "Template",
            Self::Documents => "Document",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.segment())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub id: Uuid,
    pub code: String,
    #[serde(flatten)]
    pub data: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Body of create and update requests. Every field except `code` is kept
/// as-is in `data`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordInput {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl RecordInput {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            data: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordList {
    pub data: Vec<Record>,
    pub total: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{} with id {id} not found", .collection.singular())]
    NotFound { collection: Collection, id: Uuid },

    #[error("{} with code {code} already exists", .collection.singular())]
    DuplicateCode { collection: Collection, code: String },

    #[error("field `code` is required")]
    MissingCode,
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            StoreError::DuplicateCode { .. } | StoreError::MissingCode => {
                ApiError::BadRequest(err.to_string())
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct RecordStore {
    collections: RwLock<HashMap<Collection, Vec<Record>>>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn list(&self, collection: Collection, skip: usize, limit: usize) -> RecordList {
        let collections = self.collections.read().await;
        let records = collections.get(&collection).map(Vec::as_slice).unwrap_or_default();
        RecordList {
            data: records.iter().skip(skip).take(limit).cloned().collect(),
            total: records.len(),
        }
    }

    pub async fn get(&self, collection: Collection, id: Uuid) -> Result<Record, StoreError> {
        let collections = self.collections.read().await;
        collections
            .get(&collection)
            .and_then(|records| records.iter().find(|r| r.id == id))
            .cloned()
            .ok_or(StoreError::NotFound { collection, id })
    }

    pub async fn create(
        &self,
        collection: Collection,
        input: RecordInput,
    ) -> Result<Record, StoreError> {
        let code = input.code.filter(|c| !c.is_empty()).ok_or(StoreError::MissingCode)?;

        let mut collections = self.collections.write().await;
        let records = collections.entry(collection).or_default();
        if records.iter().any(|r| r.code == code) {
            return Err(StoreError::DuplicateCode { collection, code });
        }

        let now = Utc::now();
        let record = Record {
            id: Uuid::new_v4(),
            code,
            data: input.data,
            created_at: now,
            updated_at: now,
        };
        records.push(record.clone());
        Ok(record)
    }

    /// Partial update: only the fields present in `input` change.
    pub async fn update(
        &self,
        collection: Collection,
        id: Uuid,
        input: RecordInput,
    ) -> Result<Record, StoreError> {
        let mut collections = self.collections.write().await;
        let records = collections.entry(collection).or_default();

        if let Some(code) = input.code.as_deref() {
            if records.iter().any(|r| r.code == code && r.id != id) {
                return Err(StoreError::DuplicateCode {
                    collection,
                    code: code.to_string(),
                });
            }
        }

        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound { collection, id })?;

        if let Some(code) = input.code.filter(|c| !c.is_empty()) {
            record.code = code;
        }
        record.data.extend(input.data);
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    pub async fn delete(&self, collection: Collection, id: Uuid) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let records = collections.entry(collection).or_default();
        let index = records
            .iter()
            .position(|r| r.id == id)
            .ok_or(StoreError::NotFound { collection, id })?;
        records.remove(index);
        Ok(())
    }

    /// Create whichever default compounds are missing; returns those created.
    pub async fn seed_default_compounds(&self) -> Vec<Record> {
        let mut created = Vec::new();
        for (index, code) in DEFAULT_COMPOUND_CODES.iter().enumerate() {
            let input = RecordInput::new(*code)
                .with("name", format!("Compound {}", code))
                .with("description", format!("Default compound {}", index + 1));
            if let Ok(record) = self.create(Collection::Compounds, input).await {
                created.push(record);
            }
        }
        info!(created = created.len(), "Seeded default compounds");
        created
    }
}
