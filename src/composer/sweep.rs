use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::{Composer, ComposerConfig, LeadPlan, plan_lead};
use crate::model::{FlagClear, SweepCounts};
use crate::retry::RetryError;
use crate::store::{LeadStore, StoreError};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SweepOutcome {
    Completed,
    LimitReached,
    Aborted,
}

impl SweepOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::LimitReached => "limit_reached",
            Self::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SweepReport {
    pub counts: SweepCounts,
    pub start_cursor: Option<String>,
    pub cursor: Option<String>,
    pub pages: usize,
    pub retries: usize,
    pub warnings: Vec<String>,
    pub outcome: SweepOutcome,
    pub abort_reason: Option<String>,
}

enum PageStatus {
    Empty,
    Processed { more: bool },
}

struct SweepState {
    cursor: Option<String>,
    remaining: Option<usize>,
    counts: SweepCounts,
    pending: Vec<String>,
    page_attempts: usize,
}

impl SweepState {
    fn page_size(&self, configured: usize) -> usize {
        let page_size = configured.max(1);
        match self.remaining {
            Some(remaining) => page_size.min(remaining),
            None => page_size,
        }
    }

    fn conclude(&mut self, lead_ids: &[String], counts: SweepCounts) {
        let Some(last) = lead_ids.last() else {
            return;
        };

        self.counts.read += counts.read;
        self.counts.computed += counts.computed;
        self.counts.skipped_no_component += counts.skipped_no_component;
        self.counts.errors += counts.errors;
        self.counts.flag_superseded += counts.flag_superseded;

        self.cursor = Some(last.clone());
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(lead_ids.len());
        }
        let concluded = lead_ids.len().min(self.pending.len());
        self.pending.drain(..concluded);
    }
}

impl Composer<'_> {
    /// Sweeps pending leads in ascending id order starting after
    /// `start_cursor`. The cursor advances only past committed write chunks,
    /// so a retried page never recomputes what already landed.
    pub fn recompute_batch(
        &mut self,
        max_count: Option<usize>,
        start_cursor: Option<String>,
    ) -> SweepReport {
        let retry = self.config.retry;
        let config = self.config.clone();
        let mut state = SweepState {
            cursor: start_cursor.clone(),
            remaining: max_count,
            counts: SweepCounts::default(),
            pending: Vec::new(),
            page_attempts: 0,
        };
        let mut pages = 0usize;
        let mut runs = 0usize;
        let mut warnings = Vec::<String>::new();
        let mut abort_reason = None;

        info!(
            backend = self.store.backend_name(),
            selector = config.selector.as_str(),
            cursor = start_cursor.as_deref().unwrap_or(""),
            max_count = max_count.unwrap_or(0),
            "recompute sweep started"
        );

        let outcome = loop {
            if state.remaining == Some(0) {
                break SweepOutcome::LimitReached;
            }

            runs += 1;
            let result = retry.run(&mut *self.store, "sweep page", |store| {
                process_page(store, &config, &mut state)
            });

            match result {
                Ok(PageStatus::Empty) => break SweepOutcome::Completed,
                Ok(PageStatus::Processed { more }) => {
                    pages += 1;
                    info!(
                        page = pages,
                        cursor = state.cursor.as_deref().unwrap_or(""),
                        read = state.counts.read,
                        computed = state.counts.computed,
                        errors = state.counts.errors,
                        "sweep page committed"
                    );
                    if !more {
                        break SweepOutcome::Completed;
                    }
                }
                Err(err @ RetryError::Exhausted { .. }) if !state.pending.is_empty() => {
                    let skipped = state.pending.clone();
                    let message = format!(
                        "skipped {} leads after {} (retries exhausted): {}",
                        skipped.len(),
                        state.cursor.as_deref().unwrap_or("<start>"),
                        err
                    );
                    warn!(skipped = skipped.len(), error = %err, "page abandoned, continuing with next page");
                    warnings.push(message);

                    state.conclude(
                        &skipped,
                        SweepCounts {
                            read: skipped.len(),
                            errors: skipped.len(),
                            ..SweepCounts::default()
                        },
                    );
                    pages += 1;
                }
                Err(err) => {
                    error!(
                        error = %err,
                        cursor = state.cursor.as_deref().unwrap_or(""),
                        "sweep aborted, cursor preserved"
                    );
                    abort_reason = Some(err.to_string());
                    break SweepOutcome::Aborted;
                }
            }
        };

        let retries = state.page_attempts.saturating_sub(runs);

        info!(
            outcome = outcome.as_str(),
            read = state.counts.read,
            computed = state.counts.computed,
            skipped_no_component = state.counts.skipped_no_component,
            errors = state.counts.errors,
            flag_superseded = state.counts.flag_superseded,
            "recompute sweep finished"
        );

        SweepReport {
            counts: state.counts,
            start_cursor,
            cursor: state.cursor,
            pages,
            retries,
            warnings,
            outcome,
            abort_reason,
        }
    }
}

fn process_page(
    store: &mut dyn LeadStore,
    config: &ComposerConfig,
    state: &mut SweepState,
) -> Result<PageStatus, StoreError> {
    state.page_attempts += 1;
    state.pending.clear();

    let page = store.list_pending_lead_ids(
        config.selector,
        state.cursor.as_deref(),
        state.page_size(config.page_size),
    )?;
    if page.lead_ids.is_empty() {
        return Ok(PageStatus::Empty);
    }
    state.pending = page.lead_ids.clone();

    let components = store.get_components(&page.lead_ids)?;
    for chunk in components.chunks(config.write_chunk_size.max(1)) {
        let computed_at = Utc::now();
        let mut counts = SweepCounts::default();
        let mut writes = Vec::with_capacity(chunk.len());

        for lead in chunk {
            counts.read += 1;
            match plan_lead(lead, config.dimensions, computed_at) {
                LeadPlan::Compose(write) => writes.push(write),
                LeadPlan::NoComponents => {
                    debug!(lead_id = %lead.lead_id, "no component vectors, skipping");
                    counts.skipped_no_component += 1;
                }
                LeadPlan::Malformed { component, error } => {
                    warn!(
                        lead_id = %lead.lead_id,
                        component = component.as_str(),
                        error = %error,
                        "malformed component vector, leaving lead dirty"
                    );
                    counts.errors += 1;
                }
            }
        }

        let outcomes = if writes.is_empty() {
            Vec::new()
        } else {
            store.commit_finals(&writes)?
        };
        for outcome in outcomes {
            counts.computed += 1;
            if outcome == FlagClear::Superseded {
                counts.flag_superseded += 1;
            }
        }

        let lead_ids = chunk
            .iter()
            .map(|lead| lead.lead_id.clone())
            .collect::<Vec<String>>();
        state.conclude(&lead_ids, counts);
    }

    Ok(PageStatus::Processed {
        more: page.next_cursor.is_some(),
    })
}
