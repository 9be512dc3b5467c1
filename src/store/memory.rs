use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use super::{LeadStore, StoreError};
use crate::cli::PendingSelector;
use crate::model::{ComponentKind, FlagClear, LeadComponents, LeadPage, StoreSummary};
use crate::vector::EncodedVector;

#[derive(Debug, Clone, Default)]
pub struct MemoryLead {
    pub components: BTreeMap<ComponentKind, EncodedVector>,
    pub final_vector: Option<Vec<f32>>,
    pub final_computed_at: Option<DateTime<Utc>>,
    pub needs_final_recompute: bool,
    pub embedded_at: Option<DateTime<Utc>>,
    pub components_version: i64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Operation {
    List,
    GetComponents,
    Upsert,
    ClearFlag,
}

/// In-process store with scripted failures. A failure queued for the n-th
/// call of an operation drops the connection; every call fails until
/// `reconnect` succeeds.
#[derive(Debug, Default)]
pub struct MemoryLeadStore {
    pub leads: BTreeMap<String, MemoryLead>,
    pub calls: HashMap<Operation, usize>,
    pub list_cursors: Vec<Option<String>>,
    pub upserts: HashMap<String, usize>,
    pub reconnects: usize,
    pub failing_reconnects: usize,
    pub permanent_failure_on: Option<Operation>,
    disconnect_at: Vec<(Operation, usize)>,
    disconnected: bool,
}

impl MemoryLeadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_component(&mut self, lead_id: &str, kind: ComponentKind, encoded: EncodedVector) {
        let lead = self.leads.entry(lead_id.to_string()).or_default();
        lead.components.insert(kind, encoded);
        lead.needs_final_recompute = true;
        lead.components_version += 1;
    }

    pub fn put_vector(&mut self, lead_id: &str, kind: ComponentKind, values: &[f64]) {
        self.put_component(lead_id, kind, EncodedVector::Values(values.to_vec()));
    }

    pub fn put_empty_lead(&mut self, lead_id: &str, dirty: bool) {
        let lead = self.leads.entry(lead_id.to_string()).or_default();
        lead.needs_final_recompute = dirty;
    }

    pub fn disconnect_on(&mut self, operation: Operation, call_number: usize) {
        self.disconnect_at.push((operation, call_number));
    }

    pub fn lead(&self, lead_id: &str) -> &MemoryLead {
        self.leads.get(lead_id).expect("lead should exist")
    }

    fn enter(&mut self, operation: Operation) -> Result<(), StoreError> {
        let count = self.calls.entry(operation).or_insert(0);
        *count += 1;
        let call_number = *count;

        if self.permanent_failure_on == Some(operation) {
            return Err(StoreError::Query(format!("{operation:?} rejected")));
        }
        if self.disconnected {
            return Err(StoreError::Connection("connection closed".to_string()));
        }
        if self.disconnect_at.contains(&(operation, call_number)) {
            self.disconnected = true;
            return Err(StoreError::Connection(format!(
                "connection reset during {operation:?} #{call_number}"
            )));
        }
        Ok(())
    }
}

impl LeadStore for MemoryLeadStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn reconnect(&mut self) -> Result<(), StoreError> {
        self.reconnects += 1;
        if self.failing_reconnects > 0 {
            self.failing_reconnects -= 1;
            return Err(StoreError::Connection("connection refused".to_string()));
        }
        self.disconnected = false;
        Ok(())
    }

    fn list_pending_lead_ids(
        &mut self,
        selector: PendingSelector,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<LeadPage, StoreError> {
        self.list_cursors.push(cursor.map(str::to_string));
        self.enter(Operation::List)?;

        let page_size = page_size.max(1);
        let lead_ids = self
            .leads
            .iter()
            .filter(|(lead_id, _)| cursor.is_none_or(|value| lead_id.as_str() > value))
            .filter(|(_, lead)| match selector {
                PendingSelector::Dirty => lead.needs_final_recompute,
                PendingSelector::NeverComposed => {
                    lead.final_vector.is_none() && !lead.components.is_empty()
                }
            })
            .take(page_size)
            .map(|(lead_id, _)| lead_id.clone())
            .collect::<Vec<String>>();

        let next_cursor = if lead_ids.len() == page_size {
            lead_ids.last().cloned()
        } else {
            None
        };
        Ok(LeadPage {
            lead_ids,
            next_cursor,
        })
    }

    fn get_components(&mut self, lead_ids: &[String]) -> Result<Vec<LeadComponents>, StoreError> {
        self.enter(Operation::GetComponents)?;

        Ok(lead_ids
            .iter()
            .map(|lead_id| match self.leads.get(lead_id) {
                Some(lead) => LeadComponents {
                    lead_id: lead_id.clone(),
                    components_version: Some(lead.components_version),
                    vectors: lead
                        .components
                        .iter()
                        .map(|(kind, encoded)| (*kind, encoded.clone()))
                        .collect(),
                },
                None => LeadComponents::empty(lead_id),
            })
            .collect())
    }

    fn upsert_final(
        &mut self,
        lead_id: &str,
        vector: &[f32],
        computed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.enter(Operation::Upsert)?;

        let lead = self.leads.entry(lead_id.to_string()).or_default();
        lead.final_vector = Some(vector.to_vec());
        lead.final_computed_at = Some(computed_at);
        *self.upserts.entry(lead_id.to_string()).or_insert(0) += 1;
        Ok(())
    }

    fn clear_dirty_flag(
        &mut self,
        lead_id: &str,
        embedded_at: DateTime<Utc>,
        expected_version: Option<i64>,
    ) -> Result<FlagClear, StoreError> {
        self.enter(Operation::ClearFlag)?;

        let Some(lead) = self.leads.get_mut(lead_id) else {
            return Ok(FlagClear::Superseded);
        };
        if expected_version.is_some_and(|version| version != lead.components_version) {
            return Ok(FlagClear::Superseded);
        }
        lead.needs_final_recompute = false;
        lead.embedded_at = Some(embedded_at);
        Ok(FlagClear::Cleared)
    }

    fn summary(&mut self) -> Result<StoreSummary, StoreError> {
        Ok(StoreSummary {
            total_leads: self.leads.len() as u64,
            dirty_leads: self
                .leads
                .values()
                .filter(|lead| lead.needs_final_recompute)
                .count() as u64,
            leads_with_final: self
                .leads
                .values()
                .filter(|lead| lead.final_vector.is_some())
                .count() as u64,
            leads_without_components: self
                .leads
                .values()
                .filter(|lead| lead.components.is_empty())
                .count() as u64,
        })
    }
}
