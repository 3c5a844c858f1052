use std::collections::HashMap;

use serde::Deserialize;

// Column names as they appear in the archive's spreadsheet exports
pub const COLLECTION_LEVEL_1: &str = "Collection Level 1";
pub const COLLECTION_LEVEL_2: &str = "Collection Level 2";
pub const COLLECTION_LEVEL_3: &str = "Collection Level 3";
pub const ARTIFACT_TYPE: &str = "Type of Artifact";
pub const EXTRA_FIELD_1: &str = "Extra Hierarchical field1";
pub const EXTRA_FIELD_2: &str = "Extra Hierarchical field2";
pub const FILENAME: &str = "Filename";

/// One input row. Records carry no key; their position in the stream is their identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: HashMap<String, String>,
}

impl Record {
    /// Field value, or "" when the column is absent.
    pub fn get(&self, name: &str) -> &str {
        self.fields.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn filename(&self) -> &str {
        self.get(FILENAME)
    }

    /// True when the identifying field is empty or whitespace-only.
    pub fn is_unidentified(&self) -> bool {
        self.filename().trim().is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Record
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}
