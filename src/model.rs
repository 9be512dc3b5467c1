use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::vector::EncodedVector;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    DecisionText,
    Bio,
    Website,
    Hashtags,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 4] = [
        ComponentKind::DecisionText,
        ComponentKind::Bio,
        ComponentKind::Website,
        ComponentKind::Hashtags,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DecisionText => "decision_text",
            Self::Bio => "bio",
            Self::Website => "website",
            Self::Hashtags => "hashtags",
        }
    }

    pub fn column(self) -> &'static str {
        match self {
            Self::DecisionText => "embedding_d2p",
            Self::Bio => "embedding_bio",
            Self::Website => "embedding_website",
            Self::Hashtags => "embedding_hashtags",
        }
    }

    pub fn weight(self) -> f64 {
        match self {
            Self::DecisionText => 0.40,
            Self::Bio => 0.25,
            Self::Website => 0.20,
            Self::Hashtags => 0.15,
        }
    }
}

/// Component vectors of one lead as read in a single row snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct LeadComponents {
    pub lead_id: String,
    pub components_version: Option<i64>,
    pub vectors: Vec<(ComponentKind, EncodedVector)>,
}

impl LeadComponents {
    pub fn empty(lead_id: &str) -> Self {
        Self {
            lead_id: lead_id.to_string(),
            components_version: None,
            vectors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FinalVectorWrite {
    pub lead_id: String,
    pub vector: Vec<f32>,
    pub computed_at: DateTime<Utc>,
    pub expected_version: Option<i64>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlagClear {
    Cleared,
    Superseded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeadPage {
    pub lead_ids: Vec<String>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreSummary {
    pub total_leads: u64,
    pub dirty_leads: u64,
    pub leads_with_final: u64,
    pub leads_without_components: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepCounts {
    pub read: usize,
    pub computed: usize,
    pub skipped_no_component: usize,
    pub errors: usize,
    pub flag_superseded: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentWeight {
    pub component: ComponentKind,
    pub weight: f64,
}

#[derive(Debug, Serialize)]
pub struct RecomputeRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub generated_at: String,
    pub backend: String,
    pub selector: String,
    pub lead_id: Option<String>,
    pub embedding_dim: usize,
    pub weights: Vec<ComponentWeight>,
    pub config_checksum: String,
    pub page_size: usize,
    pub write_chunk_size: usize,
    pub max_count: Option<usize>,
    pub start_cursor: Option<String>,
    pub end_cursor: Option<String>,
    pub pages: usize,
    pub retries: usize,
    pub counts: SweepCounts,
    pub outcome: String,
    pub duration_ms: u128,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepCheckpoint {
    pub manifest_version: u32,
    pub run_id: String,
    pub selector: String,
    pub cursor: Option<String>,
    pub status: String,
    pub updated_at: String,
}
