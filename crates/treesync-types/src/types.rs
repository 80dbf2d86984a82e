//! Wire-level data types shared by the server and the client
//!
//! Field names on the wire are PascalCase (`Hashes`, `PatchFile`, `NewHash`, ...)
//! so that existing clients of the update protocol keep working.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Relative, slash-separated path to content hash
pub type Fingerprints = BTreeMap<String, String>;

/// Changed files keyed by relative, slash-separated path
pub type DiffMap = BTreeMap<String, DiffEntry>;

/// One changed file in a diff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DiffEntry {
    /// Hash of the server's current content
    pub new_hash: String,
    /// Hash the requester reported, `None` when the file is new to it
    #[serde(default, with = "empty_as_none")]
    pub old_hash: Option<String>,
    /// Size of the new content in bytes
    pub new_size: u64,
    /// Permission bits of the server copy
    pub mode: u32,
    /// Modification time of the server copy
    pub mod_time: DateTime<Utc>,
}

impl DiffEntry {
    /// Whether the requester did not have this file at all
    pub fn is_new(&self) -> bool {
        self.old_hash.is_none()
    }
}

/// How the client fetches changed content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferMode {
    /// One gzip-compressed tar archive per diff
    #[default]
    Archive,
    /// One request per changed file, gzip-encoded by the server cache
    PerFile,
}

impl TransferMode {
    /// First protocol version whose clients download file by file
    pub const PER_FILE_CLIENT_VERSION: u32 = 2;

    /// Protocol version a client announces for this mode
    pub fn client_version(self) -> u32 {
        match self {
            Self::Archive => 0,
            Self::PerFile => Self::PER_FILE_CLIENT_VERSION,
        }
    }

    /// Mode implied by the version a client announced
    pub fn from_client_version(version: u32) -> Self {
        if version >= Self::PER_FILE_CLIENT_VERSION {
            Self::PerFile
        } else {
            Self::Archive
        }
    }
}

/// Body of `POST /hasupdate/{app}` (sent as the `req` form field)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateRequest {
    /// Fingerprints of every non-ignored file on the client
    #[serde(default, deserialize_with = "null_as_default")]
    pub hashes: Fingerprints,
    /// Protocol version of the client, see [`TransferMode`]
    #[serde(default)]
    pub client_version: u32,
}

impl UpdateRequest {
    /// Build a request from a fingerprint map
    pub fn new(hashes: Fingerprints) -> Self {
        Self {
            hashes,
            client_version: 0,
        }
    }

    /// Announce the transfer mode the client intends to use
    pub fn with_transfer_mode(mut self, mode: TransferMode) -> Self {
        self.client_version = mode.client_version();
        self
    }

    /// Transfer mode implied by `client_version`
    pub fn transfer_mode(&self) -> TransferMode {
        TransferMode::from_client_version(self.client_version)
    }
}

/// Response of `POST /hasupdate/{app}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateResponse {
    /// Server-relative URL of the patch archive, empty when none was built
    #[serde(default)]
    pub patch_file: String,
    /// Size of the patch archive in bytes
    #[serde(default)]
    pub patch_size: u64,
    /// Changed files; empty means the client is current
    #[serde(default, deserialize_with = "null_as_default")]
    pub diff: DiffMap,
}

impl UpdateResponse {
    /// Whether the client already has every file
    pub fn is_up_to_date(&self) -> bool {
        self.diff.is_empty()
    }

    /// Sum of the new sizes of every changed file
    pub fn total_size(&self) -> u64 {
        self.diff.values().map(|entry| entry.new_size).sum()
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// `Option<String>` that travels as `""` when absent
mod empty_as_none {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value.as_deref().unwrap_or(""))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<String>::deserialize(deserializer)?;
        Ok(value.filter(|hash| !hash.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn entry(old_hash: Option<&str>) -> DiffEntry {
        DiffEntry {
            new_hash: "0123456789abcdef0123456789abcdef".to_string(),
            old_hash: old_hash.map(str::to_string),
            new_size: 12,
            mode: 0o644,
            mod_time: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_diff_entry_wire_field_names() {
        let json = serde_json::to_value(entry(None)).unwrap();

        assert_eq!(json["NewHash"], "0123456789abcdef0123456789abcdef");
        assert_eq!(json["OldHash"], "");
        assert_eq!(json["NewSize"], 12);
        assert_eq!(json["Mode"], 0o644);
        assert!(json["ModTime"].as_str().unwrap().starts_with("2024-05-01T12:00:00"));
    }

    #[rstest]
    #[case(r#""OldHash":"""#, None)]
    #[case(r#""OldHash":null"#, None)]
    #[case(r#""OldHash":"ab12""#, Some("ab12"))]
    fn test_old_hash_absent_forms(#[case] field: &str, #[case] expected: Option<&str>) {
        let json = format!(
            r#"{{"NewHash":"ff",{},"NewSize":1,"Mode":420,"ModTime":"2024-05-01T12:00:00Z"}}"#,
            field
        );
        let parsed: DiffEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.old_hash.as_deref(), expected);
        assert_eq!(parsed.is_new(), expected.is_none());
    }

    #[test]
    fn test_old_hash_field_may_be_missing() {
        let json = r#"{"NewHash":"ff","NewSize":1,"Mode":420,"ModTime":"2024-05-01T12:00:00Z"}"#;
        let parsed: DiffEntry = serde_json::from_str(json).unwrap();
        assert!(parsed.is_new());
    }

    #[test]
    fn test_request_accepts_null_hashes() {
        let parsed: UpdateRequest = serde_json::from_str(r#"{"Hashes":null}"#).unwrap();
        assert!(parsed.hashes.is_empty());
        assert_eq!(parsed.transfer_mode(), TransferMode::Archive);
    }

    #[rstest]
    #[case(0, TransferMode::Archive)]
    #[case(1, TransferMode::Archive)]
    #[case(2, TransferMode::PerFile)]
    #[case(7, TransferMode::PerFile)]
    fn test_transfer_mode_from_version(#[case] version: u32, #[case] mode: TransferMode) {
        assert_eq!(TransferMode::from_client_version(version), mode);
    }

    #[test]
    fn test_response_totals() {
        let mut response = UpdateResponse::default();
        assert!(response.is_up_to_date());

        response.diff.insert("a.txt".to_string(), entry(None));
        response.diff.insert("b/c.txt".to_string(), entry(Some("00")));

        assert!(!response.is_up_to_date());
        assert_eq!(response.total_size(), 24);

        let round: UpdateResponse =
            serde_json::from_str(&serde_json::to_string(&response).unwrap()).unwrap();
        assert_eq!(round, response);
    }
}
