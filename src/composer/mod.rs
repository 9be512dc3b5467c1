use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::cli::PendingSelector;
use crate::compose::compose_final;
use crate::model::{ComponentKind, FinalVectorWrite, FlagClear, LeadComponents};
use crate::retry::{RetryError, RetryPolicy};
use crate::store::LeadStore;
use crate::vector::VectorError;

mod sweep;

pub use sweep::{SweepOutcome, SweepReport};

#[derive(Debug, Clone)]
pub struct ComposerConfig {
    pub dimensions: usize,
    pub selector: PendingSelector,
    pub page_size: usize,
    pub write_chunk_size: usize,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LeadOutcome {
    Computed(FlagClear),
    NoComponents,
    Malformed {
        component: ComponentKind,
        error: VectorError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LeadPlan {
    Compose(FinalVectorWrite),
    NoComponents,
    Malformed {
        component: ComponentKind,
        error: VectorError,
    },
}

/// Keeps each lead's final vector in line with its component vectors.
/// Owns the only write path to `embedding_final` and to the flag clear.
pub struct Composer<'a> {
    store: &'a mut dyn LeadStore,
    config: ComposerConfig,
}

impl<'a> Composer<'a> {
    pub fn new(store: &'a mut dyn LeadStore, config: ComposerConfig) -> Self {
        Self { store, config }
    }

    pub fn recompute_final(&mut self, lead_id: &str) -> Result<LeadOutcome, RetryError> {
        let retry = self.config.retry;
        let lead_ids = [lead_id.to_string()];

        let components = retry.run(&mut *self.store, "read components", |store| {
            store.get_components(&lead_ids)
        })?;
        let Some(components) = components.into_iter().next() else {
            return Ok(LeadOutcome::NoComponents);
        };

        match plan_lead(&components, self.config.dimensions, Utc::now()) {
            LeadPlan::NoComponents => {
                info!(lead_id, "lead has no component vectors, nothing to compose");
                Ok(LeadOutcome::NoComponents)
            }
            LeadPlan::Malformed { component, error } => {
                warn!(
                    lead_id,
                    component = component.as_str(),
                    error = %error,
                    "malformed component vector, leaving lead dirty"
                );
                Ok(LeadOutcome::Malformed { component, error })
            }
            LeadPlan::Compose(write) => {
                let writes = [write];
                let outcomes = retry.run(&mut *self.store, "commit final", |store| {
                    store.commit_finals(&writes)
                })?;
                let flag = outcomes.first().copied().unwrap_or(FlagClear::Superseded);
                info!(lead_id, flag = ?flag, "final vector recomputed");
                Ok(LeadOutcome::Computed(flag))
            }
        }
    }
}

pub(crate) fn plan_lead(
    components: &LeadComponents,
    dimensions: usize,
    computed_at: DateTime<Utc>,
) -> LeadPlan {
    let mut decoded = Vec::<(ComponentKind, Vec<f32>)>::with_capacity(components.vectors.len());
    for (kind, encoded) in &components.vectors {
        match encoded.decode(dimensions) {
            Ok(values) => decoded.push((*kind, values)),
            Err(error) => {
                return LeadPlan::Malformed {
                    component: *kind,
                    error,
                };
            }
        }
    }

    let present = decoded
        .iter()
        .map(|(kind, values)| (*kind, values.as_slice()))
        .collect::<Vec<(ComponentKind, &[f32])>>();

    match compose_final(&present) {
        Some(vector) => LeadPlan::Compose(FinalVectorWrite {
            lead_id: components.lead_id.clone(),
            vector,
            computed_at,
            expected_version: components.components_version,
        }),
        None => LeadPlan::NoComponents,
    }
}
