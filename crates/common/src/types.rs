// Core domain types shared by the relay and its clients.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

const MAX_DOCUMENT_ID_LEN: usize = 200;

/// A caller's role on the project that owns a document.
///
/// Ordered from least to most privileged so `role >= Role::Editor` reads
/// naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    Editor,
    Owner,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::Editor => "editor",
            Self::Owner => "owner",
        }
    }

    /// Parses the role column as stored by the REST layer.
    pub fn from_db_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "viewer" => Some(Self::Viewer),
            "editor" => Some(Self::Editor),
            "owner" => Some(Self::Owner),
            _ => None,
        }
    }

    /// Whether this role may originate state-mutating updates.
    pub const fn can_write(self) -> bool {
        matches!(self, Self::Editor | Self::Owner)
    }

    pub fn allows(self, required: Role) -> bool {
        self >= required
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentIdError {
    #[error("document id must not be empty")]
    Empty,
    #[error("document id exceeds {MAX_DOCUMENT_ID_LEN} characters")]
    TooLong,
    #[error("document id contains invalid character {0:?}")]
    InvalidCharacter(char),
}

/// Key of one collaboratively edited unit, e.g. `tab.<uuid>` or
/// `document:<uuid>`. Stable for the lifetime of the document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentId(String);

impl DocumentId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, DocumentIdError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(DocumentIdError::Empty);
        }
        if raw.chars().count() > MAX_DOCUMENT_ID_LEN {
            return Err(DocumentIdError::TooLong);
        }
        if let Some(invalid) = raw
            .chars()
            .find(|&ch| !(ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | ':' | '-')))
        {
            return Err(DocumentIdError::InvalidCharacter(invalid));
        }

        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The UUID after the last `.` or `:` separator, if the key carries one.
    /// A bare UUID key is accepted as well.
    pub fn entity_id(&self) -> Option<Uuid> {
        let tail = self.0.rsplit(|ch: char| ch == '.' || ch == ':').next().unwrap_or(&self.0);
        Uuid::parse_str(tail).ok()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DocumentId {
    type Error = DocumentIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<DocumentId> for String {
    fn from(value: DocumentId) -> Self {
        value.0
    }
}
