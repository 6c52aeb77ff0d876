use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::SealedText;

pub const MAX_DOMAIN_NAME_CHARS: usize = 64;

pub type ChunkId = i64;

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

opaque_id!(UserId);
opaque_id!(DomainId);
opaque_id!(FileId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    #[default]
    Free,
    Premium,
}

impl PlanTier {
    pub fn as_str(self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Premium => "premium",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "free" => Some(PlanTier::Free),
            "premium" => Some(PlanTier::Premium),
            _ => None,
        }
    }
}

/// The (user, domain, optional file set) triple bounding a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub user_id: UserId,
    pub domain_id: DomainId,
    /// Empty means every file in the domain.
    pub file_ids: Vec<FileId>,
}

impl Scope {
    pub fn domain(user_id: UserId, domain_id: DomainId) -> Self {
        Self {
            user_id,
            domain_id,
            file_ids: Vec::new(),
        }
    }

    pub fn with_files(mut self, file_ids: Vec<FileId>) -> Self {
        self.file_ids = file_ids;
        self
    }
}

/// One chunk as produced by the ingestion pipeline, before sealing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkInput {
    pub sentence: String,
    #[serde(default)]
    pub is_header: bool,
    #[serde(default)]
    pub is_table: bool,
    pub page_number: u32,
    pub embedding: Vec<f32>,
}

/// File row written together with its chunks.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub file_id: FileId,
    pub domain_id: DomainId,
    pub user_id: UserId,
    pub file_name: String,
    pub modified_at: Option<DateTime<Utc>>,
}

/// A chunk ready for persistence: encoded embedding plus sealed text.
#[derive(Debug, Clone)]
pub struct SealedChunk {
    pub ordinal: u32,
    pub page_number: u32,
    pub is_header: bool,
    pub is_table: bool,
    pub embedding: Vec<u8>,
    pub sealed: SealedText,
}

/// Structural metadata carried alongside a candidate embedding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkMeta {
    pub chunk_id: ChunkId,
    pub file_id: FileId,
    pub file_name: String,
    pub ordinal: u32,
    pub page_number: u32,
    pub is_header: bool,
    pub is_table: bool,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub meta: ChunkMeta,
    pub embedding: Vec<f32>,
}

/// Sealed text fetched lazily for a shortlisted chunk.
#[derive(Debug, Clone)]
pub struct StoredText {
    pub chunk_id: ChunkId,
    pub file_id: FileId,
    pub sealed: SealedText,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileSummary {
    pub file_id: FileId,
    pub file_name: String,
    pub uploaded_at: DateTime<Utc>,
    pub modified_at: Option<DateTime<Utc>>,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainSummary {
    pub domain_id: DomainId,
    pub name: String,
    pub files: Vec<FileSummary>,
}

/// Counters read by plan enforcement outside the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub tier: PlanTier,
    pub domains: usize,
    pub files: usize,
}

pub fn normalize_domain_name(name: &str) -> Option<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.chars().count() > MAX_DOMAIN_NAME_CHARS {
        return None;
    }
    Some(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_names_are_trimmed_and_bounded() {
        assert_eq!(normalize_domain_name("  Taxes "), Some("Taxes".to_string()));
        assert_eq!(normalize_domain_name("   "), None);
        let long = "x".repeat(MAX_DOMAIN_NAME_CHARS + 1);
        assert_eq!(normalize_domain_name(&long), None);
    }

    #[test]
    fn plan_tier_parses_case_insensitively() {
        assert_eq!(PlanTier::parse("Premium"), Some(PlanTier::Premium));
        assert_eq!(PlanTier::parse("gold"), None);
    }

    #[test]
    fn chunk_input_flags_default_to_false() {
        let json = r#"{"sentence":"Revenue grew 10%","page_number":1,"embedding":[1.0,0.0]}"#;
        let chunk: ChunkInput = serde_json::from_str(json).unwrap();
        assert!(!chunk.is_header);
        assert!(!chunk.is_table);
    }
}
