use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, OpenFlags, params, params_from_iter};

use super::{LeadStore, StoreError};
use crate::cli::PendingSelector;
use crate::model::{
    ComponentKind, FinalVectorWrite, FlagClear, LeadComponents, LeadPage, StoreSummary,
};
use crate::vector::{EncodedVector, encode_embedding_blob};

const SQLITE_READ_CHUNK: usize = 400;

pub struct SqliteLeadStore {
    db_path: Option<PathBuf>,
    timeout: Duration,
    connection: Connection,
}

impl SqliteLeadStore {
    pub fn open(db_path: &Path, timeout: Duration) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    StoreError::Connection(format!(
                        "failed to create directory {}: {err}",
                        parent.display()
                    ))
                })?;
            }
        }

        let connection = open_connection(db_path, timeout)?;
        Ok(Self {
            db_path: Some(db_path.to_path_buf()),
            timeout,
            connection,
        })
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        let connection = Connection::open_in_memory().expect("in-memory DB should open");
        ensure_schema(&connection).expect("schema should apply");
        Self {
            db_path: None,
            timeout: Duration::from_secs(1),
            connection,
        }
    }

    #[cfg(test)]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    StoreError::Timeout(err.to_string())
                }
                ErrorCode::CannotOpen | ErrorCode::SystemIoFailure | ErrorCode::NotADatabase => {
                    StoreError::Connection(err.to_string())
                }
                _ => StoreError::Query(err.to_string()),
            },
            _ => StoreError::Query(err.to_string()),
        }
    }
}

fn open_connection(db_path: &Path, timeout: Duration) -> Result<Connection, StoreError> {
    let connection = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;

    connection.pragma_update(None, "journal_mode", "WAL")?;
    connection.pragma_update(None, "synchronous", "NORMAL")?;
    connection.busy_timeout(timeout)?;
    ensure_schema(&connection)?;

    Ok(connection)
}

fn ensure_schema(connection: &Connection) -> Result<(), StoreError> {
    connection.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS lead_embeddings (
          lead_id TEXT PRIMARY KEY,
          embedding_bio BLOB,
          embedding_website BLOB,
          embedding_hashtags BLOB,
          embedding_d2p BLOB,
          embedding_final BLOB,
          final_computed_at TEXT,
          needs_final_recompute INTEGER NOT NULL DEFAULT 1,
          embedded_at TEXT,
          components_version INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_lead_embeddings_dirty
          ON lead_embeddings(needs_final_recompute, lead_id);

        CREATE TRIGGER IF NOT EXISTS trg_lead_embeddings_component_change
        AFTER UPDATE OF embedding_bio, embedding_website, embedding_hashtags, embedding_d2p
        ON lead_embeddings
        BEGIN
          UPDATE lead_embeddings
          SET needs_final_recompute = 1,
              components_version = components_version + 1
          WHERE lead_id = NEW.lead_id;
        END;
        ",
    )?;
    Ok(())
}

fn pending_filter(selector: PendingSelector) -> &'static str {
    match selector {
        PendingSelector::Dirty => "needs_final_recompute = 1",
        PendingSelector::NeverComposed => {
            "embedding_final IS NULL AND (embedding_bio IS NOT NULL OR embedding_website IS NOT NULL \
             OR embedding_hashtags IS NOT NULL OR embedding_d2p IS NOT NULL)"
        }
    }
}

fn encoded_from_value(value: ValueRef<'_>) -> Option<EncodedVector> {
    match value {
        ValueRef::Null => None,
        ValueRef::Blob(blob) => Some(EncodedVector::Blob(blob.to_vec())),
        ValueRef::Text(text) => Some(EncodedVector::Text(
            String::from_utf8_lossy(text).into_owned(),
        )),
        ValueRef::Integer(_) => Some(EncodedVector::Unsupported("integer".to_string())),
        ValueRef::Real(_) => Some(EncodedVector::Unsupported("real".to_string())),
    }
}

fn upsert_final_row(
    connection: &Connection,
    lead_id: &str,
    vector: &[f32],
    computed_at: DateTime<Utc>,
) -> Result<(), StoreError> {
    connection.execute(
        "
        INSERT INTO lead_embeddings(lead_id, embedding_final, final_computed_at)
        VALUES(?1, ?2, ?3)
        ON CONFLICT(lead_id) DO UPDATE SET
          embedding_final=excluded.embedding_final,
          final_computed_at=excluded.final_computed_at
        ",
        params![lead_id, encode_embedding_blob(vector), computed_at],
    )?;
    Ok(())
}

fn clear_dirty_flag_row(
    connection: &Connection,
    lead_id: &str,
    embedded_at: DateTime<Utc>,
    expected_version: Option<i64>,
) -> Result<FlagClear, StoreError> {
    let updated = match expected_version {
        Some(version) => connection.execute(
            "
            UPDATE lead_embeddings
            SET needs_final_recompute = 0, embedded_at = ?2
            WHERE lead_id = ?1 AND components_version = ?3
            ",
            params![lead_id, embedded_at, version],
        )?,
        None => connection.execute(
            "
            UPDATE lead_embeddings
            SET needs_final_recompute = 0, embedded_at = ?2
            WHERE lead_id = ?1
            ",
            params![lead_id, embedded_at],
        )?,
    };

    Ok(if updated == 0 {
        FlagClear::Superseded
    } else {
        FlagClear::Cleared
    })
}

impl LeadStore for SqliteLeadStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn reconnect(&mut self) -> Result<(), StoreError> {
        let Some(db_path) = self.db_path.as_deref() else {
            return Ok(());
        };
        self.connection = open_connection(db_path, self.timeout)?;
        Ok(())
    }

    fn list_pending_lead_ids(
        &mut self,
        selector: PendingSelector,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<LeadPage, StoreError> {
        let page_size = page_size.max(1);
        let sql = format!(
            "
            SELECT lead_id
            FROM lead_embeddings
            WHERE {} AND (?1 IS NULL OR lead_id > ?1)
            ORDER BY lead_id ASC
            LIMIT ?2
            ",
            pending_filter(selector)
        );

        let mut statement = self.connection.prepare_cached(&sql)?;
        let lead_ids = statement
            .query_map(params![cursor, page_size as i64], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<String>, _>>()?;

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
        let columns = ComponentKind::ALL
            .iter()
            .map(|kind| kind.column())
            .collect::<Vec<&str>>()
            .join(", ");
        let mut found = HashMap::<String, LeadComponents>::with_capacity(lead_ids.len());

        let tx = self.connection.transaction()?;
        for chunk in lead_ids.chunks(SQLITE_READ_CHUNK) {
            let placeholders = (1..=chunk.len())
                .map(|index| format!("?{index}"))
                .collect::<Vec<String>>()
                .join(",");
            let sql = format!(
                "SELECT lead_id, components_version, {columns} FROM lead_embeddings WHERE lead_id IN ({placeholders})"
            );

            let mut statement = tx.prepare(&sql)?;
            let mut rows = statement.query(params_from_iter(chunk.iter()))?;
            while let Some(row) = rows.next()? {
                let lead_id: String = row.get(0)?;
                let version: i64 = row.get(1)?;
                let mut vectors = Vec::new();
                for (offset, kind) in ComponentKind::ALL.iter().enumerate() {
                    if let Some(encoded) = encoded_from_value(row.get_ref(2 + offset)?) {
                        vectors.push((*kind, encoded));
                    }
                }
                found.insert(
                    lead_id.clone(),
                    LeadComponents {
                        lead_id,
                        components_version: Some(version),
                        vectors,
                    },
                );
            }
        }
        tx.commit()?;

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
        upsert_final_row(&self.connection, lead_id, vector, computed_at)
    }

    fn clear_dirty_flag(
        &mut self,
        lead_id: &str,
        embedded_at: DateTime<Utc>,
        expected_version: Option<i64>,
    ) -> Result<FlagClear, StoreError> {
        clear_dirty_flag_row(&self.connection, lead_id, embedded_at, expected_version)
    }

    fn commit_finals(&mut self, writes: &[FinalVectorWrite]) -> Result<Vec<FlagClear>, StoreError> {
        let tx = self.connection.transaction()?;
        let mut outcomes = Vec::with_capacity(writes.len());
        for write in writes {
            upsert_final_row(&tx, &write.lead_id, &write.vector, write.computed_at)?;
            outcomes.push(clear_dirty_flag_row(
                &tx,
                &write.lead_id,
                write.computed_at,
                write.expected_version,
            )?);
        }
        tx.commit()?;
        Ok(outcomes)
    }

    fn summary(&mut self) -> Result<StoreSummary, StoreError> {
        let summary = self.connection.query_row(
            "
            SELECT
              COUNT(*),
              COALESCE(SUM(needs_final_recompute = 1), 0),
              COALESCE(SUM(embedding_final IS NOT NULL), 0),
              COALESCE(SUM(
                embedding_bio IS NULL AND embedding_website IS NULL
                AND embedding_hashtags IS NULL AND embedding_d2p IS NULL
              ), 0)
            FROM lead_embeddings
            ",
            [],
            |row| {
                Ok(StoreSummary {
                    total_leads: row.get::<_, i64>(0)? as u64,
                    dirty_leads: row.get::<_, i64>(1)? as u64,
                    leads_with_final: row.get::<_, i64>(2)? as u64,
                    leads_without_components: row.get::<_, i64>(3)? as u64,
                })
            },
        )?;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::decode_embedding_blob;

    fn insert_lead(store: &SqliteLeadStore, lead_id: &str, bio: Option<&[f32]>, d2p: Option<&str>) {
        store
            .connection()
            .execute(
                "INSERT INTO lead_embeddings(lead_id, embedding_bio, embedding_d2p) VALUES(?1, ?2, ?3)",
                params![lead_id, bio.map(encode_embedding_blob), d2p],
            )
            .expect("lead insert should succeed");
    }

    fn flag_and_version(store: &SqliteLeadStore, lead_id: &str) -> (i64, i64) {
        store
            .connection()
            .query_row(
                "SELECT needs_final_recompute, components_version FROM lead_embeddings WHERE lead_id = ?1",
                params![lead_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .expect("lead row should exist")
    }

    #[test]
    fn component_update_marks_lead_dirty_and_bumps_version() {
        let mut store = SqliteLeadStore::in_memory();
        insert_lead(&store, "lead-a", Some(&[1.0, 0.0]), None);
        assert_eq!(
            store
                .clear_dirty_flag("lead-a", Utc::now(), Some(0))
                .expect("clear should succeed"),
            FlagClear::Cleared
        );
        assert_eq!(flag_and_version(&store, "lead-a"), (0, 0));

        store
            .connection()
            .execute(
                "UPDATE lead_embeddings SET embedding_website = ?2 WHERE lead_id = ?1",
                params!["lead-a", encode_embedding_blob(&[0.0, 1.0])],
            )
            .expect("component update should succeed");
        assert_eq!(flag_and_version(&store, "lead-a"), (1, 1));
    }

    #[test]
    fn final_write_does_not_re_dirty_the_lead() {
        let mut store = SqliteLeadStore::in_memory();
        insert_lead(&store, "lead-a", Some(&[1.0, 0.0]), None);
        let write = FinalVectorWrite {
            lead_id: "lead-a".to_string(),
            vector: vec![1.0, 0.0],
            computed_at: Utc::now(),
            expected_version: Some(0),
        };
        let outcomes = store.commit_finals(&[write]).expect("commit should succeed");
        assert_eq!(outcomes, vec![FlagClear::Cleared]);
        assert_eq!(flag_and_version(&store, "lead-a"), (0, 0));

        let blob: Vec<u8> = store
            .connection()
            .query_row(
                "SELECT embedding_final FROM lead_embeddings WHERE lead_id = 'lead-a'",
                [],
                |row| row.get(0),
            )
            .expect("final should be stored");
        assert_eq!(decode_embedding_blob(&blob, 2), Ok(vec![1.0, 0.0]));
    }

    #[test]
    fn listing_walks_cursor_in_ascending_order() {
        let mut store = SqliteLeadStore::in_memory();
        for lead_id in ["c", "a", "e", "b", "d"] {
            insert_lead(&store, lead_id, Some(&[1.0]), None);
        }
        store
            .clear_dirty_flag("c", Utc::now(), None)
            .expect("clear should succeed");

        let first = store
            .list_pending_lead_ids(PendingSelector::Dirty, None, 2)
            .expect("first page");
        assert_eq!(first.lead_ids, vec!["a", "b"]);
        assert_eq!(first.next_cursor.as_deref(), Some("b"));

        let second = store
            .list_pending_lead_ids(PendingSelector::Dirty, Some("b"), 2)
            .expect("second page");
        assert_eq!(second.lead_ids, vec!["d", "e"]);

        let third = store
            .list_pending_lead_ids(PendingSelector::Dirty, Some("e"), 2)
            .expect("third page");
        assert!(third.lead_ids.is_empty());
        assert_eq!(third.next_cursor, None);
    }

    #[test]
    fn never_composed_selector_requires_a_component_and_no_final() {
        let mut store = SqliteLeadStore::in_memory();
        insert_lead(&store, "with-bio", Some(&[1.0]), None);
        insert_lead(&store, "empty", None, None);
        insert_lead(&store, "composed", None, Some("[1]"));
        store
            .upsert_final("composed", &[1.0], Utc::now())
            .expect("upsert should succeed");

        let page = store
            .list_pending_lead_ids(PendingSelector::NeverComposed, None, 10)
            .expect("page");
        assert_eq!(page.lead_ids, vec!["with-bio"]);
    }

    #[test]
    fn get_components_keeps_request_order_and_encodings() {
        let mut store = SqliteLeadStore::in_memory();
        insert_lead(&store, "lead-b", Some(&[0.5, 0.5]), Some("[0.25,0.75]"));
        insert_lead(&store, "lead-a", None, None);

        let ids = vec![
            "lead-b".to_string(),
            "missing".to_string(),
            "lead-a".to_string(),
        ];
        let components = store.get_components(&ids).expect("read should succeed");
        assert_eq!(components.len(), 3);

        assert_eq!(components[0].lead_id, "lead-b");
        assert_eq!(components[0].components_version, Some(0));
        assert_eq!(
            components[0].vectors,
            vec![
                (
                    ComponentKind::DecisionText,
                    EncodedVector::Text("[0.25,0.75]".to_string())
                ),
                (
                    ComponentKind::Bio,
                    EncodedVector::Blob(encode_embedding_blob(&[0.5, 0.5]))
                ),
            ]
        );
        assert_eq!(components[1], LeadComponents::empty("missing"));
        assert!(components[2].vectors.is_empty());
        assert_eq!(components[2].components_version, Some(0));
    }

    #[test]
    fn stale_version_leaves_flag_set_after_final_write() {
        let mut store = SqliteLeadStore::in_memory();
        insert_lead(&store, "lead-a", Some(&[1.0, 0.0]), None);
        let snapshot = store
            .get_components(&["lead-a".to_string()])
            .expect("read should succeed");

        store
            .connection()
            .execute(
                "UPDATE lead_embeddings SET embedding_bio = ?2 WHERE lead_id = ?1",
                params!["lead-a", encode_embedding_blob(&[0.0, 1.0])],
            )
            .expect("component update should succeed");

        let write = FinalVectorWrite {
            lead_id: "lead-a".to_string(),
            vector: vec![1.0, 0.0],
            computed_at: Utc::now(),
            expected_version: snapshot[0].components_version,
        };
        let outcomes = store.commit_finals(&[write]).expect("commit should succeed");
        assert_eq!(outcomes, vec![FlagClear::Superseded]);
        assert_eq!(flag_and_version(&store, "lead-a"), (1, 1));
    }

    #[test]
    fn summary_counts_dirty_final_and_empty_rows() {
        let mut store = SqliteLeadStore::in_memory();
        insert_lead(&store, "a", Some(&[1.0]), None);
        insert_lead(&store, "b", None, None);
        insert_lead(&store, "c", Some(&[1.0]), None);
        store
            .commit_finals(&[FinalVectorWrite {
                lead_id: "c".to_string(),
                vector: vec![1.0],
                computed_at: Utc::now(),
                expected_version: None,
            }])
            .expect("commit should succeed");

        let summary = store.summary().expect("summary should succeed");
        assert_eq!(summary.total_leads, 3);
        assert_eq!(summary.dirty_leads, 2);
        assert_eq!(summary.leads_with_final, 1);
        assert_eq!(summary.leads_without_components, 1);
    }
}
