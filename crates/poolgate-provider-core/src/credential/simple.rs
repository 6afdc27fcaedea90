use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map as JsonMap, Value as JsonValue};

use super::env::{looks_like_placeholder, resolve_env};
use super::store::StoreBackend;
use super::{Credential, CredentialError, SimpleCredential};
use crate::config::StoreType;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SimpleStoreSettings {
    api_key: Option<String>,
    api_key_var: Option<String>,
}

/// Plain API-key store: inline value or an environment variable reference.
pub struct SimpleStoreBackend {
    name: String,
    settings: SimpleStoreSettings,
}

impl SimpleStoreBackend {
    pub fn from_config(
        name: impl Into<String>,
        config: &JsonMap<String, JsonValue>,
    ) -> Result<Self, CredentialError> {
        let settings: SimpleStoreSettings =
            serde_json::from_value(JsonValue::Object(config.clone()))
                .map_err(|err| CredentialError::Init(err.to_string()))?;
        Ok(Self {
            name: name.into(),
            settings,
        })
    }
}

#[async_trait]
impl StoreBackend for SimpleStoreBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn store_type(&self) -> StoreType {
        StoreType::Simple
    }

    async fn do_resolve(&self) -> Result<Credential, CredentialError> {
        let api_key = if let Some(var) = &self.settings.api_key_var {
            resolve_env(var, true)?.ok_or_else(|| CredentialError::MissingEnv(var.clone()))?
        } else if let Some(inline) = &self.settings.api_key {
            if looks_like_placeholder(inline) {
                return Err(CredentialError::UnresolvedPlaceholder(self.name.clone()));
            }
            inline.clone()
        } else {
            return Err(CredentialError::Init(format!(
                "store {} has neither apiKey nor apiKeyVar",
                self.name
            )));
        };
        Ok(Credential::Simple(SimpleCredential { api_key }))
    }
}
