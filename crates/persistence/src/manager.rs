use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};

use crate::models::{CallRecord, Contact, Transcription};
use crate::{DbError, DbPool, DbRuntimeSettings, create_pool, run_migrations};

const CALL_COLUMNS: &str = "call_sid, stream_sid, call_ended, user_context, system_message, \
     initial_message, start_time, end_time, final_status, to_number, from_number, contact_id";

/// Async facade over the call database.
///
/// Writes touching the same call are serialized; different calls proceed in
/// parallel, bounded by the pool size.
#[derive(Clone)]
pub struct DatabaseManager {
    pool: DbPool,
    call_locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl DatabaseManager {
    /// Opens (creating if needed) the database at `path` and migrates it.
    pub fn open(path: &str, settings: DbRuntimeSettings) -> Result<Self, DbError> {
        let pool = create_pool(path, settings)?;
        let conn = pool.get()?;
        let applied = run_migrations(&conn)?;
        tracing::info!("database ready at {} ({} migrations applied)", path, applied);
        Ok(Self {
            pool,
            call_locks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, DbError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, DbError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| DbError::Task(e.to_string()))?
    }

    fn call_locks(&self) -> MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        match self.call_locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn call_lock(&self, call_sid: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.call_locks()
            .entry(call_sid.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drops the lock entry for `call_sid` unless another writer holds or awaits it.
    fn release_call_lock(&self, call_sid: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.call_locks();
        // One reference in the map, one in `lock`.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(call_sid);
        }
    }

    /// Runs a write for `call_sid` while holding that call's lock.
    async fn write_call<T, F>(&self, call_sid: &str, f: F) -> Result<T, DbError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, DbError> + Send + 'static,
    {
        let lock = self.call_lock(call_sid);
        let result = {
            let _guard = lock.lock().await;
            self.with_conn(f).await
        };
        self.release_call_lock(call_sid, lock);
        result
    }

    pub async fn create_call_context(&self, record: CallRecord) -> Result<(), DbError> {
        let call_sid = record.call_sid.clone();
        self.write_call(&call_sid, move |conn| {
            conn.execute(
                &format!("INSERT INTO call_contexts ({CALL_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"),
                params_from_iter(call_params(&record)?),
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_call_context(&self, call_sid: &str) -> Result<Option<CallRecord>, DbError> {
        let call_sid = call_sid.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {CALL_COLUMNS} FROM call_contexts WHERE call_sid = ?1"),
                    [&call_sid],
                    RawCall::from_row,
                )
                .optional()?;
            row.map(RawCall::into_record).transpose()
        })
        .await
    }

    /// Overwrites a stored call; `false` when no such call exists.
    pub async fn update_call_context(&self, record: CallRecord) -> Result<bool, DbError> {
        let call_sid = record.call_sid.clone();
        self.write_call(&call_sid, move |conn| {
            let changed = conn.execute(
                "UPDATE call_contexts SET stream_sid = ?2, call_ended = ?3, user_context = ?4,
                     system_message = ?5, initial_message = ?6, start_time = ?7, end_time = ?8,
                     final_status = ?9, to_number = ?10, from_number = ?11, contact_id = ?12
                 WHERE call_sid = ?1",
                params_from_iter(call_params(&record)?),
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Deletes a call and its transcripts; `false` when no such call exists.
    pub async fn delete_call_context(&self, call_sid: &str) -> Result<bool, DbError> {
        let sid = call_sid.to_string();
        self.write_call(call_sid, move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM transcriptions WHERE call_id = ?1", [&sid])?;
            let changed = tx.execute("DELETE FROM call_contexts WHERE call_sid = ?1", [&sid])?;
            tx.commit()?;
            Ok(changed > 0)
        })
        .await
    }

    /// Every stored call, newest first.
    pub async fn list_call_contexts(&self) -> Result<Vec<CallRecord>, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CALL_COLUMNS} FROM call_contexts ORDER BY start_time DESC"
            ))?;
            let rows = stmt.query_map([], RawCall::from_row)?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row?.into_record()?);
            }
            Ok(records)
        })
        .await
    }

    pub async fn create_transcription(&self, call_sid: &str, text: &str) -> Result<i64, DbError> {
        let sid = call_sid.to_string();
        let text = text.to_string();
        self.write_call(call_sid, move |conn| {
            conn.execute(
                "INSERT INTO transcriptions (call_id, transcription_text, created_at) VALUES (?1, ?2, ?3)",
                params![sid, text, Utc::now().to_rfc3339()],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// The most recent transcript of a call.
    pub async fn get_transcription(&self, call_sid: &str) -> Result<Option<Transcription>, DbError> {
        let sid = call_sid.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT transcription_id, call_id, transcription_text, created_at
                     FROM transcriptions WHERE call_id = ?1
                     ORDER BY transcription_id DESC LIMIT 1",
                    [&sid],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()?;
            row.map(|(transcription_id, call_sid, text, created_at)| {
                Ok(Transcription {
                    transcription_id,
                    call_sid,
                    text,
                    created_at: parse_time("created_at", &created_at)?,
                })
            })
            .transpose()
        })
        .await
    }

    /// Deletes every transcript of a call, returning how many were removed.
    pub async fn delete_transcription(&self, call_sid: &str) -> Result<usize, DbError> {
        let sid = call_sid.to_string();
        self.write_call(call_sid, move |conn| {
            Ok(conn.execute("DELETE FROM transcriptions WHERE call_id = ?1", [&sid])?)
        })
        .await
    }

    pub async fn list_contacts(&self) -> Result<Vec<Contact>, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT contact_id, phone_number, created_at FROM contacts ORDER BY contact_id",
            )?;
            let rows = stmt.query_map([], raw_contact)?;
            let mut contacts = Vec::new();
            for row in rows {
                contacts.push(into_contact(row?)?);
            }
            Ok(contacts)
        })
        .await
    }

    pub async fn get_contact_by_phone(&self, phone_number: &str) -> Result<Option<Contact>, DbError> {
        let phone_number = phone_number.to_string();
        self.with_conn(move |conn| find_contact(conn, &phone_number))
            .await
    }

    /// Returns the contact for `phone_number`, creating it if needed.
    pub async fn ensure_contact(&self, phone_number: &str) -> Result<Contact, DbError> {
        let phone_number = phone_number.to_string();
        self.with_conn(move |conn| upsert_contact(conn, &phone_number))
            .await
    }

    /// Stores a finished call and its transcript in one transaction.
    ///
    /// The call is linked to the contact for `contact_phone`, which is created
    /// on first sight. An existing record for the same call is replaced.
    pub async fn persist_completed_call(
        &self,
        mut record: CallRecord,
        transcript: Option<String>,
        contact_phone: Option<String>,
    ) -> Result<(), DbError> {
        let call_sid = record.call_sid.clone();
        self.write_call(&call_sid, move |conn| {
            let tx = conn.transaction()?;
            if let Some(phone) = contact_phone.filter(|p| !p.is_empty()) {
                record.contact_id = Some(upsert_contact(&tx, &phone)?.contact_id);
            }
            tx.execute(
                &format!(
                    "INSERT INTO call_contexts ({CALL_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                     ON CONFLICT(call_sid) DO UPDATE SET
                         stream_sid = excluded.stream_sid, call_ended = excluded.call_ended,
                         user_context = excluded.user_context, system_message = excluded.system_message,
                         initial_message = excluded.initial_message, start_time = excluded.start_time,
                         end_time = excluded.end_time, final_status = excluded.final_status,
                         to_number = excluded.to_number, from_number = excluded.from_number,
                         contact_id = excluded.contact_id"
                ),
                params_from_iter(call_params(&record)?),
            )?;
            if let Some(text) = transcript.filter(|t| !t.trim().is_empty()) {
                tx.execute("DELETE FROM transcriptions WHERE call_id = ?1", [&record.call_sid])?;
                tx.execute(
                    "INSERT INTO transcriptions (call_id, transcription_text, created_at) VALUES (?1, ?2, ?3)",
                    params![record.call_sid, text, Utc::now().to_rfc3339()],
                )?;
            }
            tx.commit()?;
            tracing::info!("persisted call {}", record.call_sid);
            Ok(())
        })
        .await
    }
}

fn call_params(record: &CallRecord) -> Result<[Box<dyn rusqlite::ToSql>; 12], DbError> {
    Ok([
        Box::new(record.call_sid.clone()),
        Box::new(record.stream_sid.clone()),
        Box::new(record.call_ended),
        Box::new(serde_json::to_string(&record.user_context)?),
        Box::new(record.system_message.clone()),
        Box::new(record.initial_message.clone()),
        Box::new(record.start_time.to_rfc3339()),
        Box::new(record.end_time.map(|t| t.to_rfc3339())),
        Box::new(record.final_status.clone()),
        Box::new(record.to_number.clone()),
        Box::new(record.from_number.clone()),
        Box::new(record.contact_id),
    ])
}

fn parse_time(column: &'static str, value: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| DbError::InvalidTimestamp {
            column,
            value: value.to_string(),
        })
}

/// A call row before its JSON and timestamps are decoded.
struct RawCall {
    call_sid: String,
    stream_sid: Option<String>,
    call_ended: bool,
    user_context: String,
    system_message: String,
    initial_message: String,
    start_time: String,
    end_time: Option<String>,
    final_status: Option<String>,
    to_number: String,
    from_number: String,
    contact_id: Option<i64>,
}

impl RawCall {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            call_sid: row.get(0)?,
            stream_sid: row.get(1)?,
            call_ended: row.get(2)?,
            user_context: row.get(3)?,
            system_message: row.get(4)?,
            initial_message: row.get(5)?,
            start_time: row.get(6)?,
            end_time: row.get(7)?,
            final_status: row.get(8)?,
            to_number: row.get(9)?,
            from_number: row.get(10)?,
            contact_id: row.get(11)?,
        })
    }

    fn into_record(self) -> Result<CallRecord, DbError> {
        Ok(CallRecord {
            user_context: serde_json::from_str(&self.user_context)?,
            start_time: parse_time("start_time", &self.start_time)?,
            end_time: self
                .end_time
                .as_deref()
                .map(|t| parse_time("end_time", t))
                .transpose()?,
            call_sid: self.call_sid,
            stream_sid: self.stream_sid,
            call_ended: self.call_ended,
            system_message: self.system_message,
            initial_message: self.initial_message,
            final_status: self.final_status,
            to_number: self.to_number,
            from_number: self.from_number,
            contact_id: self.contact_id,
        })
    }
}

fn raw_contact(row: &Row<'_>) -> rusqlite::Result<(i64, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn into_contact((contact_id, phone_number, created_at): (i64, String, String)) -> Result<Contact, DbError> {
    Ok(Contact {
        contact_id,
        phone_number,
        created_at: parse_time("created_at", &created_at)?,
    })
}

fn find_contact(conn: &Connection, phone_number: &str) -> Result<Option<Contact>, DbError> {
    conn.query_row(
        "SELECT contact_id, phone_number, created_at FROM contacts WHERE phone_number = ?1",
        [phone_number],
        raw_contact,
    )
    .optional()?
    .map(into_contact)
    .transpose()
}

fn upsert_contact(conn: &Connection, phone_number: &str) -> Result<Contact, DbError> {
    conn.execute(
        "INSERT OR IGNORE INTO contacts (phone_number, created_at) VALUES (?1, ?2)",
        params![phone_number, Utc::now().to_rfc3339()],
    )?;
    find_contact(conn, phone_number)?
        .ok_or_else(|| DbError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open() -> (TempDir, DatabaseManager) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calls.db");
        let db = DatabaseManager::open(path.to_str().unwrap(), DbRuntimeSettings::default()).unwrap();
        (dir, db)
    }

    fn record(call_sid: &str) -> CallRecord {
        CallRecord {
            system_message: "Be brief.".into(),
            initial_message: "Hello!".into(),
            to_number: "+15550001".into(),
            from_number: "+15550002".into(),
            user_context: serde_json::json!([{"role": "assistant", "content": "Hello!"}]),
            ..CallRecord::new(call_sid)
        }
    }

    #[tokio::test]
    async fn call_context_crud() {
        let (_dir, db) = open();
        let mut call = record("CA1");
        db.create_call_context(call.clone()).await.unwrap();

        let stored = db.get_call_context("CA1").await.unwrap().unwrap();
        assert_eq!(stored.user_context, call.user_context);
        assert_eq!(stored.start_time.timestamp(), call.start_time.timestamp());

        call.call_ended = true;
        call.final_status = Some("completed".into());
        call.end_time = Some(Utc::now());
        assert!(db.update_call_context(call).await.unwrap());
        let stored = db.get_call_context("CA1").await.unwrap().unwrap();
        assert!(stored.call_ended);
        assert_eq!(stored.final_status.as_deref(), Some("completed"));
        assert!(stored.end_time.is_some());

        assert!(!db.update_call_context(record("CA404")).await.unwrap());
        assert_eq!(db.list_call_contexts().await.unwrap().len(), 1);

        assert!(db.delete_call_context("CA1").await.unwrap());
        assert!(db.get_call_context("CA1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_call_is_rejected() {
        let (_dir, db) = open();
        db.create_call_context(record("CA1")).await.unwrap();
        assert!(matches!(
            db.create_call_context(record("CA1")).await,
            Err(DbError::Sqlite(_))
        ));
    }

    #[tokio::test]
    async fn transcripts_follow_their_call() {
        let (_dir, db) = open();
        db.create_call_context(record("CA1")).await.unwrap();
        db.create_transcription("CA1", "assistant: Hello!").await.unwrap();
        db.create_transcription("CA1", "assistant: Hello!\nuser: Hi").await.unwrap();

        let latest = db.get_transcription("CA1").await.unwrap().unwrap();
        assert_eq!(latest.text, "assistant: Hello!\nuser: Hi");

        assert_eq!(db.delete_transcription("CA1").await.unwrap(), 2);
        assert!(db.get_transcription("CA1").await.unwrap().is_none());

        // The foreign key refuses transcripts for unknown calls.
        assert!(db.create_transcription("CA404", "orphan").await.is_err());
    }

    #[tokio::test]
    async fn contacts_are_unique_by_phone() {
        let (_dir, db) = open();
        let first = db.ensure_contact("+15550002").await.unwrap();
        let again = db.ensure_contact("+15550002").await.unwrap();
        assert_eq!(first.contact_id, again.contact_id);

        db.ensure_contact("+15550003").await.unwrap();
        assert_eq!(db.list_contacts().await.unwrap().len(), 2);
        assert_eq!(
            db.get_contact_by_phone("+15550003").await.unwrap().map(|c| c.phone_number),
            Some("+15550003".to_string())
        );
        assert!(db.get_contact_by_phone("+1999").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn persisting_a_call_twice_replaces_it() {
        let (_dir, db) = open();
        db.persist_completed_call(record("CA1"), Some("user: hi".into()), Some("+15550002".into()))
            .await
            .unwrap();

        let mut finished = record("CA1");
        finished.call_ended = true;
        finished.final_status = Some("completed".into());
        db.persist_completed_call(finished, Some("user: hi\nassistant: bye".into()), Some("+15550002".into()))
            .await
            .unwrap();

        let stored = db.get_call_context("CA1").await.unwrap().unwrap();
        assert!(stored.call_ended);
        let contact = db.get_contact_by_phone("+15550002").await.unwrap().unwrap();
        assert_eq!(stored.contact_id, Some(contact.contact_id));
        assert_eq!(
            db.get_transcription("CA1").await.unwrap().unwrap().text,
            "user: hi\nassistant: bye"
        );
        assert_eq!(db.list_call_contexts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_writes_to_one_call_are_serialized() {
        let (_dir, db) = open();
        db.create_call_context(record("CA1")).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..8 {
            let db = db.clone();
            tasks.push(tokio::spawn(async move {
                db.create_transcription("CA1", &format!("line {i}")).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(db.delete_transcription("CA1").await.unwrap(), 8);
        assert!(db.call_locks().is_empty());
    }

    #[tokio::test]
    async fn finished_calls_leave_no_lock_behind() {
        let (_dir, db) = open();
        for sid in ["CA1", "CA2", "CA3"] {
            db.persist_completed_call(record(sid), Some("user: hi".into()), None)
                .await
                .unwrap();
        }
        db.delete_call_context("CA2").await.unwrap();

        assert!(db.call_locks().is_empty());
        assert_eq!(db.list_call_contexts().await.unwrap().len(), 2);
    }
}
