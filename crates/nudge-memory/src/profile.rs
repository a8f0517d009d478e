use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::DocumentStore;

pub const PROFILE_DOC: &str = "profile";
pub const SCHEDULE_DOC: &str = "schedule";

const PROFILE_SECTIONS: [&str; 7] = [
    "medical",
    "glucose_preferences",
    "diet",
    "lifestyle",
    "personality",
    "interests",
    "assistant_prefs",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProfileError {
    #[error("profile path is empty")]
    EmptyPath,
    #[error("field not found at path '{0}'")]
    FieldNotFound(String),
}

/// A single field edit, as sent by the profile editor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilePatch {
    pub path: String,
    pub value: Value,
    #[serde(default = "default_layer")]
    pub layer: String,
    #[serde(default = "default_patch_source")]
    pub source: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_layer() -> String {
    "confirmed".to_string()
}

fn default_patch_source() -> String {
    "user_edit".to_string()
}

fn default_confidence() -> f64 {
    1.0
}

/// Envelope stored for every profile field.
pub fn field_value(value: Value, layer: &str, source: &str, confidence: f64) -> Value {
    json!({
        "value": value,
        "layer": layer,
        "confidence": confidence,
        "source": source,
        "updated_at": Utc::now().to_rfc3339(),
        "revoked": false,
    })
}

/// `basic.name`, whether stored plain or inside a field envelope.
pub fn display_name(profile: &Value) -> Option<String> {
    let name = profile.get("basic")?.get("name")?;
    let name = match name {
        Value::Object(envelope) => {
            if envelope.get("revoked").and_then(Value::as_bool) == Some(true) {
                return None;
            }
            envelope.get("value")?
        }
        other => other,
    };
    name.as_str()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
}

fn bootstrap_profile(user_id: &str) -> Value {
    let mut profile = Map::new();
    profile.insert(
        "basic".to_string(),
        json!({ "user_id": field_value(json!(user_id), "confirmed", "bootstrap", 1.0) }),
    );
    for section in PROFILE_SECTIONS {
        profile.insert(section.to_string(), json!({}));
    }
    Value::Object(profile)
}

fn ensure_object(value: &mut Value) -> Option<&mut Map<String, Value>> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    value.as_object_mut()
}

fn walk_to_parent<'a>(
    profile: &'a mut Value,
    path: &str,
) -> Result<(&'a mut Map<String, Value>, String), ProfileError> {
    let mut parts: Vec<&str> = path.split('.').filter(|p| !p.is_empty()).collect();
    let leaf = parts.pop().ok_or(ProfileError::EmptyPath)?.to_string();
    let missing = || ProfileError::FieldNotFound(path.to_string());

    let mut node = ensure_object(profile).ok_or_else(missing)?;
    for part in parts {
        let child = node
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        node = ensure_object(child).ok_or_else(missing)?;
    }
    Ok((node, leaf))
}

/// Profile and schedule documents on top of a [`DocumentStore`].
#[derive(Clone)]
pub struct ProfileStore {
    docs: Arc<dyn DocumentStore>,
}

impl ProfileStore {
    pub fn new(docs: Arc<dyn DocumentStore>) -> Self {
        Self { docs }
    }

    pub fn documents(&self) -> &Arc<dyn DocumentStore> {
        &self.docs
    }

    /// Loads the profile, creating and persisting a minimal one on first access.
    pub async fn load(&self, user_id: &str) -> Result<Value> {
        if let Some(profile) = self.docs.get(user_id, PROFILE_DOC).await? {
            return Ok(profile);
        }
        let profile = bootstrap_profile(user_id);
        self.docs.put(user_id, PROFILE_DOC, &profile).await?;
        tracing::info!(user_id, "bootstrapped empty profile");
        Ok(profile)
    }

    pub async fn patch(&self, user_id: &str, patch: &ProfilePatch) -> Result<Value> {
        let mut profile = self.load(user_id).await?;
        {
            let (parent, leaf) = walk_to_parent(&mut profile, &patch.path)?;
            parent.insert(
                leaf,
                field_value(
                    patch.value.clone(),
                    &patch.layer,
                    &patch.source,
                    patch.confidence,
                ),
            );
        }
        self.docs.put(user_id, PROFILE_DOC, &profile).await?;
        Ok(profile)
    }

    /// Marks an existing field revoked, recording `reason` as its source.
    pub async fn revoke(&self, user_id: &str, path: &str, reason: &str) -> Result<Value> {
        let mut profile = self.load(user_id).await?;
        {
            let (parent, leaf) = walk_to_parent(&mut profile, path)?;
            let Some(Value::Object(field)) = parent.get_mut(&leaf) else {
                return Err(ProfileError::FieldNotFound(path.to_string()).into());
            };
            field.insert("revoked".to_string(), Value::Bool(true));
            field.insert("source".to_string(), Value::String(reason.to_string()));
            field.insert(
                "updated_at".to_string(),
                Value::String(Utc::now().to_rfc3339()),
            );
        }
        self.docs.put(user_id, PROFILE_DOC, &profile).await?;
        Ok(profile)
    }

    pub async fn schedule(&self, user_id: &str) -> Result<Option<Value>> {
        self.docs.get(user_id, SCHEDULE_DOC).await
    }
}
