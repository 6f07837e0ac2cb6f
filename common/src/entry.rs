use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::utils::{new_entry_id, now};

/// Fixed id of the tree root.
pub const ROOT_ID: &str = "0000000000";

/// `type` value carried by folders; files carry a MIME type.
pub const FOLDER_TYPE: &str = "folder";

/// Lifecycle of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryState {
    /// Upload in progress
    Temp,
    Active,
}

/// One sealed blob backing a slice of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    #[serde(rename = "messageid")]
    pub message_id: i64,

    #[serde(rename = "originalfilename")]
    pub original_filename: String,

    pub hash: Option<String>,

    #[serde(rename = "fileid")]
    pub file_id: String,

    pub size: u64,

    pub index: u32,

    /// Set only while the part lives in a different channel than its entry,
    /// which happens when a cross-channel move stops half way.
    #[serde(default)]
    pub channel: Option<String>,
}

impl Part {
    /// Channel the part's message is posted in.
    pub fn channel_or<'a>(&'a self, entry_channel: &'a str) -> &'a str {
        self.channel.as_deref().unwrap_or(entry_channel)
    }
}

/// A file or folder in the tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,

    pub filename: String,

    pub channel: Option<String>,

    pub parts: Vec<Part>,

    #[serde(rename = "parentfolder")]
    pub parent_id: Option<String>,

    /// `folder` or a MIME type
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub info: BTreeMap<String, String>,

    #[serde(default, with = "content_base64")]
    pub content: Option<Bytes>,

    pub state: EntryState,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub ctime: DateTime<Utc>,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub mtime: DateTime<Utc>,
}

impl Entry {
    pub fn root() -> Self {
        let now = now();
        Self {
            id: ROOT_ID.to_string(),
            filename: String::new(),
            channel: None,
            parts: Vec::new(),
            parent_id: None,
            kind: FOLDER_TYPE.to_string(),
            info: BTreeMap::new(),
            content: None,
            state: EntryState::Active,
            ctime: now,
            mtime: now,
        }
    }

    pub fn new_folder(parent_id: &str, filename: &str) -> Self {
        Self {
            id: new_entry_id(),
            filename: crate::path::sanitize_filename(filename),
            parent_id: Some(parent_id.to_string()),
            ..Self::root()
        }
    }

    pub fn new_file(parent_id: &str, filename: &str, mime: &str, channel: &str) -> Self {
        Self {
            id: new_entry_id(),
            filename: crate::path::sanitize_filename(filename),
            channel: Some(channel.to_string()),
            parent_id: Some(parent_id.to_string()),
            kind: mime.to_string(),
            ..Self::root()
        }
    }

    pub fn is_root(&self) -> bool {
        self.id == ROOT_ID
    }

    pub fn is_folder(&self) -> bool {
        self.kind == FOLDER_TYPE
    }

    pub fn is_temp(&self) -> bool {
        self.state == EntryState::Temp
    }

    /// Stored in metadata rather than on the backend
    pub fn is_inline(&self) -> bool {
        self.parts.is_empty()
    }

    /// Total byte length of the file.
    pub fn size(&self) -> u64 {
        if self.is_folder() {
            return 0;
        }
        match &self.content {
            Some(content) if self.parts.is_empty() => content.len() as u64,
            _ => self.parts.iter().map(|p| p.size).sum(),
        }
    }

    pub fn touch(&mut self) {
        self.mtime = now();
    }
}

mod content_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Bytes>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Bytes>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s).map(Bytes::from).map_err(serde::de::Error::custom))
            .transpose()
    }
}
