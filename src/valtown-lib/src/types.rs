use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValType {
    Script,
    Http,
    Interval,
    Email,
    #[serde(other)]
    Unknown,
}

impl ValType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValType::Script => "script",
            ValType::Http => "http",
            ValType::Interval => "interval",
            ValType::Email => "email",
            ValType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValPrivacy {
    Public,
    Private,
    Unlisted,
}

impl Default for ValPrivacy {
    fn default() -> Self {
        ValPrivacy::Unlisted
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ValAuthor {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ValLinks {
    #[serde(default)]
    pub website: String,
    #[serde(default)]
    pub module: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Full val record as returned by `GET /vals/{id}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Val {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub val_type: ValType,
    #[serde(default)]
    pub privacy: ValPrivacy,
    pub version: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub code: String,
    #[serde(default)]
    pub readme: Option<String>,
    #[serde(default)]
    pub author: Option<ValAuthor>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub links: ValLinks,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Entry of the vals listing. Code may be absent; the readme and links are
/// not relied upon.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValSummary {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub val_type: ValType,
    #[serde(default)]
    pub privacy: ValPrivacy,
    pub version: u64,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl From<&Val> for ValSummary {
    fn from(val: &Val) -> Self {
        Self {
            id: val.id.clone(),
            name: val.name.clone(),
            val_type: val.val_type,
            privacy: val.privacy,
            version: val.version,
            code: Some(val.code.clone()),
            created_at: val.created_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobInfo {
    pub key: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValCreateRequest {
    pub code: String,
    pub name: String,
    #[serde(rename = "type")]
    pub val_type: ValType,
    pub privacy: ValPrivacy,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValVersionRequest {
    pub code: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ValUpdateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub val_type: Option<ValType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub privacy: Option<ValPrivacy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readme: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_val_decodes_null_code_and_links() {
        let val: Val = serde_json::from_value(serde_json::json!({
            "id": "abc",
            "name": "hello",
            "type": "script",
            "privacy": "public",
            "version": 3,
            "code": null,
            "readme": null,
            "links": null,
        }))
        .unwrap();
        assert_eq!(val.code, "");
        assert_eq!(val.links, ValLinks::default());
        assert_eq!(val.val_type, ValType::Script);
    }

    #[test]
    fn test_unknown_val_type_is_tolerated() {
        let summary: ValSummary = serde_json::from_value(serde_json::json!({
            "id": "abc",
            "name": "hello",
            "type": "rpc",
            "version": 0,
        }))
        .unwrap();
        assert_eq!(summary.val_type, ValType::Unknown);
        assert_eq!(summary.privacy, ValPrivacy::Unlisted);
    }

    #[test]
    fn test_update_request_omits_unset_fields() {
        let req = ValUpdateRequest {
            privacy: Some(ValPrivacy::Public),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            serde_json::json!({ "privacy": "public" })
        );
    }
}
