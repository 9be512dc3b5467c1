use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use reqwest::Method;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{LeadStore, StoreError};
use crate::cli::PendingSelector;
use crate::model::{
    ComponentKind, FinalVectorWrite, FlagClear, LeadComponents, LeadPage, StoreSummary,
};
use crate::vector::{EncodedVector, format_vector_text};

const REST_READ_CHUNK: usize = 100;
const LEAD_ID_PATTERN: &str = r"^[A-Za-z0-9_.:\-]{1,128}$";

/// PostgREST (Supabase) access to the `lead_embeddings` table.
pub struct RestLeadStore {
    endpoint: String,
    api_key: String,
    timeout: Duration,
    versioned: bool,
    lead_id_pattern: Regex,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct LeadIdRow {
    lead_id: String,
}

#[derive(Debug, Deserialize)]
struct ComponentRow {
    lead_id: String,
    #[serde(default)]
    components_version: Option<i64>,
    #[serde(flatten)]
    columns: HashMap<String, Value>,
}

#[derive(Debug, Serialize)]
struct FinalRow<'a> {
    lead_id: &'a str,
    embedding_final: String,
    final_computed_at: String,
}

#[derive(Debug, Serialize)]
struct FlagClearBody {
    needs_final_recompute: bool,
    embedded_at: String,
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            StoreError::Timeout(err.to_string())
        } else if err.is_decode() {
            StoreError::Decode(err.to_string())
        } else if err.is_builder() {
            StoreError::Query(err.to_string())
        } else {
            StoreError::Connection(err.to_string())
        }
    }
}

impl RestLeadStore {
    /// `versioned` selects whether the table carries `components_version`.
    /// Without it, flag clears are unconditional.
    pub fn new(
        base_url: &str,
        api_key: &str,
        table: &str,
        timeout: Duration,
        versioned: bool,
    ) -> Result<Self> {
        let lead_id_pattern =
            Regex::new(LEAD_ID_PATTERN).context("failed to compile lead id pattern")?;
        let client = build_client(timeout).context("failed to build http client")?;

        Ok(Self {
            endpoint: table_endpoint(base_url, table),
            api_key: api_key.to_string(),
            timeout,
            versioned,
            lead_id_pattern,
            client,
        })
    }

    fn check_lead_id(&self, lead_id: &str) -> Result<(), StoreError> {
        if self.lead_id_pattern.is_match(lead_id) {
            Ok(())
        } else {
            Err(StoreError::InvalidLeadId(lead_id.to_string()))
        }
    }

    fn request(&self, method: Method, query: &[(&str, String)]) -> RequestBuilder {
        self.client
            .request(method, &self.endpoint)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .query(query)
    }

    fn component_select(&self) -> String {
        let mut columns = vec!["lead_id"];
        if self.versioned {
            columns.push("components_version");
        }
        columns.extend(ComponentKind::ALL.iter().map(|kind| kind.column()));
        columns.join(",")
    }

    fn count(&self, filters: &[(&str, String)]) -> Result<u64, StoreError> {
        let mut query = vec![("select", "lead_id".to_string())];
        query.extend(filters.iter().cloned());

        let response = send(
            self.request(Method::HEAD, &query)
                .header("Prefer", "count=exact")
                .header("Range-Unit", "items")
                .header("Range", "0-0"),
        )?;
        let header = response
            .headers()
            .get("content-range")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        parse_content_range_total(header)
            .ok_or_else(|| StoreError::Decode(format!("unusable content-range {header:?}")))
    }
}

fn build_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
}

fn send(builder: RequestBuilder) -> Result<Response, StoreError> {
    let response = builder.send()?;
    let status = response.status();
    if !status.is_success() {
        let message = response.text().unwrap_or_default();
        return Err(StoreError::Api {
            status: status.as_u16(),
            message,
        });
    }
    Ok(response)
}

fn table_endpoint(base_url: &str, table: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    if base.ends_with("/rest/v1") {
        format!("{base}/{table}")
    } else {
        format!("{base}/rest/v1/{table}")
    }
}

fn selector_filters(selector: PendingSelector) -> Vec<(&'static str, String)> {
    match selector {
        PendingSelector::Dirty => vec![("needs_final_recompute", "eq.true".to_string())],
        PendingSelector::NeverComposed => {
            let any_component = ComponentKind::ALL
                .iter()
                .map(|kind| format!("{}.not.is.null", kind.column()))
                .collect::<Vec<String>>()
                .join(",");
            vec![
                ("embedding_final", "is.null".to_string()),
                ("or", format!("({any_component})")),
            ]
        }
    }
}

fn parse_content_range_total(header: &str) -> Option<u64> {
    let (_, total) = header.trim().rsplit_once('/')?;
    total.trim().parse::<u64>().ok()
}

fn encoded_from_json(value: &Value) -> Option<EncodedVector> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(EncodedVector::Text(text.clone())),
        Value::Array(items) => Some(
            items
                .iter()
                .map(Value::as_f64)
                .collect::<Option<Vec<f64>>>()
                .map(EncodedVector::Values)
                .unwrap_or_else(|| {
                    EncodedVector::Unsupported("array with non-numeric entries".to_string())
                }),
        ),
        Value::Bool(_) => Some(EncodedVector::Unsupported("boolean".to_string())),
        Value::Number(_) => Some(EncodedVector::Unsupported("number".to_string())),
        Value::Object(_) => Some(EncodedVector::Unsupported("object".to_string())),
    }
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl LeadStore for RestLeadStore {
    fn backend_name(&self) -> &'static str {
        "rest"
    }

    fn reconnect(&mut self) -> Result<(), StoreError> {
        self.client = build_client(self.timeout)?;
        Ok(())
    }

    fn list_pending_lead_ids(
        &mut self,
        selector: PendingSelector,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<LeadPage, StoreError> {
        let page_size = page_size.max(1);
        let mut query = vec![
            ("select", "lead_id".to_string()),
            ("order", "lead_id.asc".to_string()),
            ("limit", page_size.to_string()),
        ];
        query.extend(selector_filters(selector));
        if let Some(cursor) = cursor {
            self.check_lead_id(cursor)?;
            query.push(("lead_id", format!("gt.{cursor}")));
        }

        let rows: Vec<LeadIdRow> = send(self.request(Method::GET, &query))?.json()?;
        let lead_ids = rows.into_iter().map(|row| row.lead_id).collect::<Vec<String>>();
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
        let select = self.component_select();
        let mut found = HashMap::<String, LeadComponents>::with_capacity(lead_ids.len());

        for chunk in lead_ids.chunks(REST_READ_CHUNK) {
            for lead_id in chunk {
                self.check_lead_id(lead_id)?;
            }
            let query = vec![
                ("select", select.clone()),
                ("lead_id", format!("in.({})", chunk.join(","))),
            ];

            let rows: Vec<ComponentRow> = send(self.request(Method::GET, &query))?.json()?;
            for row in rows {
                let vectors = ComponentKind::ALL
                    .iter()
                    .filter_map(|kind| {
                        row.columns
                            .get(kind.column())
                            .and_then(encoded_from_json)
                            .map(|encoded| (*kind, encoded))
                    })
                    .collect();
                found.insert(
                    row.lead_id.clone(),
                    LeadComponents {
                        lead_id: row.lead_id,
                        components_version: row.components_version.filter(|_| self.versioned),
                        vectors,
                    },
                );
            }
        }

        Ok(lead_ids
            .iter()
            .map(|lead_id| {
                found
                    .remove(lead_id)
                    .unwrap_or_else(|| LeadComponents::empty(lead_id))
            })
            .collect())
    }

    fn upsert_final(
        &mut self,
        lead_id: &str,
        vector: &[f32],
        computed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let write = FinalVectorWrite {
            lead_id: lead_id.to_string(),
            vector: vector.to_vec(),
            computed_at,
            expected_version: None,
        };
        self.upsert_final_rows(std::slice::from_ref(&write))
    }

    fn clear_dirty_flag(
        &mut self,
        lead_id: &str,
        embedded_at: DateTime<Utc>,
        expected_version: Option<i64>,
    ) -> Result<FlagClear, StoreError> {
        self.check_lead_id(lead_id)?;
        let mut query = vec![
            ("select", "lead_id".to_string()),
            ("lead_id", format!("eq.{lead_id}")),
        ];
        if let Some(version) = expected_version {
            query.push(("components_version", format!("eq.{version}")));
        }

        let body = FlagClearBody {
            needs_final_recompute: false,
            embedded_at: rfc3339(embedded_at),
        };
        let rows: Vec<LeadIdRow> = send(
            self.request(Method::PATCH, &query)
                .header("Prefer", "return=representation")
                .json(&body),
        )?
        .json()?;

        Ok(if rows.is_empty() {
            FlagClear::Superseded
        } else {
            FlagClear::Cleared
        })
    }

    fn commit_finals(&mut self, writes: &[FinalVectorWrite]) -> Result<Vec<FlagClear>, StoreError> {
        self.upsert_final_rows(writes)?;
        writes
            .iter()
            .map(|write| {
                self.clear_dirty_flag(&write.lead_id, write.computed_at, write.expected_version)
            })
            .collect()
    }

    fn summary(&mut self) -> Result<StoreSummary, StoreError> {
        let no_components = ComponentKind::ALL
            .iter()
            .map(|kind| (kind.column(), "is.null".to_string()))
            .collect::<Vec<(&str, String)>>();

        Ok(StoreSummary {
            total_leads: self.count(&[])?,
            dirty_leads: self.count(&selector_filters(PendingSelector::Dirty))?,
            leads_with_final: self.count(&[("embedding_final", "not.is.null".to_string())])?,
            leads_without_components: self.count(&no_components)?,
        })
    }
}

impl RestLeadStore {
    fn upsert_final_rows(&mut self, writes: &[FinalVectorWrite]) -> Result<(), StoreError> {
        if writes.is_empty() {
            return Ok(());
        }

        let mut rows = Vec::with_capacity(writes.len());
        for write in writes {
            self.check_lead_id(&write.lead_id)?;
            rows.push(FinalRow {
                lead_id: &write.lead_id,
                embedding_final: format_vector_text(&write.vector),
                final_computed_at: rfc3339(write.computed_at),
            });
        }

        send(
            self.request(Method::POST, &[("on_conflict", "lead_id".to_string())])
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(&rows),
        )?;
        Ok(())
    }
}
