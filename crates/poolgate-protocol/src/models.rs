use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelEntry>,
}

impl ModelList {
    pub fn new(data: Vec<ModelEntry>) -> Self {
        Self {
            object: "list".to_string(),
            data,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
    pub root: String,
    pub permission: Vec<JsonValue>,
}

impl ModelEntry {
    pub fn new(id: impl Into<String>, created: i64) -> Self {
        let id = id.into();
        Self {
            object: "model".to_string(),
            created,
            owned_by: "poolgate".to_string(),
            root: id.clone(),
            permission: Vec::new(),
            id,
        }
    }
}
