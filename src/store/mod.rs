use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::cli::{PendingSelector, StoreArgs, StoreBackend};
use crate::model::{FinalVectorWrite, FlagClear, LeadComponents, LeadPage, StoreSummary};

#[cfg(test)]
pub mod memory;
pub mod rest;
pub mod sqlite;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(String),

    #[error("store operation timed out: {0}")]
    Timeout(String),

    #[error("store rejected request (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("store query failed: {0}")]
    Query(String),

    #[error("invalid lead identifier: {0:?}")]
    InvalidLeadId(String),

    #[error("failed to decode store response: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout(_) => true,
            Self::Api { status, .. } => matches!(status, 408 | 429) || *status >= 500,
            Self::Query(_) | Self::InvalidLeadId(_) | Self::Decode(_) => false,
        }
    }
}

/// Row-store access used by the composer. The composer is the only writer of
/// final vectors and the only party that clears the dirty flag.
pub trait LeadStore {
    fn backend_name(&self) -> &'static str;

    fn reconnect(&mut self) -> Result<(), StoreError>;

    /// Ids strictly greater than `cursor`, ascending, at most `page_size`.
    fn list_pending_lead_ids(
        &mut self,
        selector: PendingSelector,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<LeadPage, StoreError>;

    /// One entry per requested id, in request order. Unknown ids come back
    /// with no vectors.
    fn get_components(&mut self, lead_ids: &[String]) -> Result<Vec<LeadComponents>, StoreError>;

    fn upsert_final(
        &mut self,
        lead_id: &str,
        vector: &[f32],
        computed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Clears the flag, conditional on `expected_version` when one is given.
    fn clear_dirty_flag(
        &mut self,
        lead_id: &str,
        embedded_at: DateTime<Utc>,
        expected_version: Option<i64>,
    ) -> Result<FlagClear, StoreError>;

    fn commit_finals(&mut self, writes: &[FinalVectorWrite]) -> Result<Vec<FlagClear>, StoreError> {
        let mut outcomes = Vec::with_capacity(writes.len());
        for write in writes {
            self.upsert_final(&write.lead_id, &write.vector, write.computed_at)?;
            outcomes.push(self.clear_dirty_flag(
                &write.lead_id,
                write.computed_at,
                write.expected_version,
            )?);
        }
        Ok(outcomes)
    }

    fn summary(&mut self) -> Result<StoreSummary, StoreError>;
}

pub fn open_store(args: &StoreArgs) -> Result<Box<dyn LeadStore>> {
    let timeout = Duration::from_millis(args.timeout_ms.max(1));

    match args.backend {
        StoreBackend::Sqlite => {
            let db_path = args
                .db_path
                .clone()
                .unwrap_or_else(|| args.cache_root.join("leadvec.sqlite"));
            let store = sqlite::SqliteLeadStore::open(&db_path, timeout)
                .with_context(|| format!("failed to open sqlite store: {}", db_path.display()))?;
            Ok(Box::new(store))
        }
        StoreBackend::Rest => {
            let Some(base_url) = args.rest_url.as_deref() else {
                bail!("--rest-url (or LEADVEC_REST_URL) is required for the rest backend");
            };
            let Some(api_key) = args.rest_key.as_deref() else {
                bail!("--rest-key (or LEADVEC_REST_KEY) is required for the rest backend");
            };
            let store = rest::RestLeadStore::new(
                base_url,
                api_key,
                &args.rest_table,
                timeout,
                args.rest_version_column,
            )
            .context("failed to build rest store client")?;
            Ok(Box::new(store))
        }
    }
}
