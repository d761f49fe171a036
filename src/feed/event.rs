use serde::Deserialize;

use crate::error::RelayError;

/// Post-change state of a user record as carried by the change feed.
///
/// Accepts both the document-store field names (`_id`, `Coins`) and the
/// Postgres column names (`id`, `coins`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserDocument {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    #[serde(rename = "Coins", alias = "coins", default)]
    pub coins: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDescription {
    #[serde(default)]
    pub updated_fields: Vec<String>,
    #[serde(default)]
    pub removed_fields: Vec<String>,
}

impl UpdateDescription {
    pub fn touches(&self, field: &str) -> bool {
        self.updated_fields
            .iter()
            .chain(self.removed_fields.iter())
            .any(|f| f.eq_ignore_ascii_case(field))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DocumentKey {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
}

/// One committed mutation of the users collection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "operationType", rename_all = "lowercase")]
pub enum ChangeEvent {
    #[serde(rename_all = "camelCase")]
    Insert {
        #[serde(default)]
        full_document: Option<UserDocument>,
    },
    #[serde(rename_all = "camelCase")]
    Update {
        #[serde(default)]
        full_document: Option<UserDocument>,
        #[serde(default)]
        update_description: Option<UpdateDescription>,
    },
    #[serde(rename_all = "camelCase")]
    Replace {
        #[serde(default)]
        full_document: Option<UserDocument>,
    },
    #[serde(rename_all = "camelCase")]
    Delete {
        #[serde(default)]
        document_key: Option<DocumentKey>,
    },
    /// drop, rename, invalidate and anything newer
    #[serde(other)]
    Other,
}

impl ChangeEvent {
    pub fn from_payload(payload: &str) -> Result<Self, RelayError> {
        serde_json::from_str(payload).map_err(|e| RelayError::MalformedEvent(e.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::Insert { .. } => "insert",
            ChangeEvent::Update { .. } => "update",
            ChangeEvent::Replace { .. } => "replace",
            ChangeEvent::Delete { .. } => "delete",
            ChangeEvent::Other => "other",
        }
    }
}
