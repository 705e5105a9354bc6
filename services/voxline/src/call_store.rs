use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use voxline_core::call_context::{CallContext, SharedCallContext, close_call};
use voxline_persistence::{CallRecord, DatabaseManager};

/// Live calls by call SID.
#[derive(Clone, Default)]
pub struct CallStore {
    calls: Arc<Mutex<HashMap<String, SharedCallContext>>>,
}

impl CallStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn calls(&self) -> MutexGuard<'_, HashMap<String, SharedCallContext>> {
        match self.calls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(&self, call_sid: &str) -> Option<SharedCallContext> {
        self.calls().get(call_sid).cloned()
    }

    /// Registers `ctx`, replacing any context under the same SID.
    pub fn insert(&self, ctx: CallContext) -> SharedCallContext {
        let call_sid = ctx.call_sid.clone();
        let shared = ctx.shared();
        self.calls().insert(call_sid, shared.clone());
        shared
    }

    /// Returns the context for `call_sid`, creating it with `create` when absent.
    pub fn get_or_insert_with(
        &self,
        call_sid: &str,
        create: impl FnOnce() -> CallContext,
    ) -> SharedCallContext {
        self.calls()
            .entry(call_sid.to_string())
            .or_insert_with(|| create().shared())
            .clone()
    }

    pub fn remove(&self, call_sid: &str) -> Option<SharedCallContext> {
        self.calls().remove(call_sid)
    }

    pub fn list(&self) -> Vec<SharedCallContext> {
        self.calls().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.calls().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls().is_empty()
    }

    /// Closes and stores every live call; used at shutdown.
    pub async fn close_all(&self, db: &DatabaseManager, status: &str) {
        let calls: Vec<_> = self.calls().drain().map(|(_, ctx)| ctx).collect();
        if !calls.is_empty() {
            tracing::info!("closing {} live call(s)", calls.len());
        }
        for ctx in calls {
            close_call(&ctx, status).await;
            persist_call(db, &ctx).await;
        }
    }
}

/// Writes a closed call and its transcript to the database.
pub async fn persist_call(db: &DatabaseManager, ctx: &SharedCallContext) {
    let (call_sid, persisted) = {
        let guard = ctx.lock().await;
        let persisted = call_record(&guard)
            .map(|record| (record, guard.transcript_text(), contact_phone(&guard)));
        (guard.call_sid.clone(), persisted)
    };
    match persisted {
        Ok((record, transcript, phone)) => {
            if let Err(e) = db.persist_completed_call(record, Some(transcript), phone).await {
                tracing::error!("failed to store call {}: {}", call_sid, e);
            }
        }
        Err(e) => tracing::error!("failed to serialize call {}: {}", call_sid, e),
    }
}

/// The persisted form of a call; the transcript is stored as `user_context`.
pub fn call_record(ctx: &CallContext) -> Result<CallRecord, serde_json::Error> {
    Ok(CallRecord {
        call_sid: ctx.call_sid.clone(),
        stream_sid: ctx.stream_sid.clone(),
        call_ended: ctx.call_ended,
        user_context: serde_json::to_value(ctx.transcript())?,
        system_message: ctx.system_message.clone(),
        initial_message: ctx.initial_message.clone(),
        start_time: ctx.start_time,
        end_time: ctx.end_time,
        final_status: ctx.final_status.clone(),
        to_number: ctx.to_number.clone().unwrap_or_default(),
        from_number: ctx.from_number.clone().unwrap_or_default(),
        contact_id: None,
    })
}

/// The party on the other end: the callee of an outbound call, else the caller.
pub fn contact_phone(ctx: &CallContext) -> Option<String> {
    ctx.to_number.clone().or_else(|| ctx.from_number.clone())
}
