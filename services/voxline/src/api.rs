//! HTTP and WebSocket surface.
//!
//! *   `POST /incoming`: TwiML that connects the call to `/connection`.
//! *   `GET /connection`: the Twilio media stream.
//! *   `POST /start_call`, `POST /end_call`, `GET /call_status/{call_sid}`: call control.
//! *   `GET /transcript/{call_sid}`, `GET /all_transcripts`: conversation history.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::rejection::FormRejection;
use axum::extract::{Form, Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use twilio::{CallControl, InboundMessage, OutboundMessage, twiml};
use voxline_core::call_context::{CallContext, close_call};
use voxline_core::tools::ToolInvoker;
use voxline_persistence::DatabaseManager;

use crate::call_store::{CallStore, call_record};
use crate::config::Config;
use crate::factory::ServiceFactory;
use crate::pipeline::{Pipeline, STATUS_COMPLETED};
use crate::prompt_loader::Prompts;

const SOCKET_BUFFER: usize = 256;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: CallStore,
    pub db: DatabaseManager,
    pub calls: Arc<dyn CallControl>,
    pub pipeline: Pipeline,
    prompts: Arc<Prompts>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        db: DatabaseManager,
        calls: Arc<dyn CallControl>,
        factory: Arc<dyn ServiceFactory>,
        tools: Arc<dyn ToolInvoker>,
        prompts: Prompts,
    ) -> Self {
        let store = CallStore::new();
        let pipeline = Pipeline::new(
            store.clone(),
            db.clone(),
            calls.clone(),
            factory,
            tools,
            prompts.clone(),
        );
        Self {
            config,
            store,
            db,
            calls,
            pipeline,
            prompts: Arc::new(prompts),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/incoming", post(incoming))
        .route("/connection", get(connection))
        .route("/start_call", post(start_call))
        .route("/call_status/{call_sid}", get(call_status))
        .route("/end_call", post(end_call))
        .route("/transcript/{call_sid}", get(transcript))
        .route("/all_transcripts", get(all_transcripts))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// The fields of Twilio's voice webhook the stream needs.
#[derive(Debug, Default, Deserialize)]
struct IncomingCall {
    #[serde(rename = "From", default)]
    from: String,
}

/// Answers with TwiML that streams the call's audio back to `/connection`.
/// The caller's number rides along as a stream parameter.
async fn incoming(
    State(state): State<AppState>,
    form: Result<Form<IncomingCall>, FormRejection>,
) -> Response {
    let call = form.map(|Form(call)| call).unwrap_or_default();
    let parameters: Vec<(&str, &str)> = if call.from.is_empty() {
        Vec::new()
    } else {
        vec![("from", call.from.as_str())]
    };
    let body = twiml::connect_stream(&state.config.stream_url(), &parameters);
    ([(header::CONTENT_TYPE, "text/xml")], body).into_response()
}

async fn connection(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    tracing::info!("media stream upgrade requested");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Bridges the socket to the pipeline: one task decodes Twilio messages, one
/// writes outbound ones, and the pipeline runs in between.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (inbound_tx, inbound_rx) = mpsc::channel::<InboundMessage>(SOCKET_BUFFER);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(SOCKET_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("failed to encode media stream message: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                tracing::warn!("media stream socket closed, stopping writer task.");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reader = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => match serde_json::from_str::<InboundMessage>(text.as_str()) {
                    Ok(message) => {
                        if inbound_tx.send(message).await.is_err() {
                            tracing::warn!("Inbound receiver dropped, stopping reader task.");
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("unreadable media stream message: {}", e),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::info!("media stream socket error: {}", e);
                    break;
                }
            }
        }
    });

    if let Err(e) = state.pipeline.run(inbound_rx, outbound_tx).await {
        tracing::error!("media stream ended with error: {}", e);
    }
    reader.abort();
    let _ = writer.await;
    tracing::info!("media stream connection closed");
}

#[derive(Debug, Deserialize)]
struct StartCallRequest {
    #[serde(default)]
    to_number: Option<String>,
}

async fn start_call(State(state): State<AppState>, Json(request): Json<StartCallRequest>) -> Response {
    let Some(to_number) = request.to_number.filter(|n| !n.trim().is_empty()) else {
        return error(StatusCode::BAD_REQUEST, "Missing 'to_number' in request");
    };
    let from_number = state.config.app_number.clone().unwrap_or_default();

    let call_sid = match state
        .calls
        .create_call(&to_number, &from_number, &state.config.incoming_url())
        .await
    {
        Ok(call_sid) => call_sid,
        Err(e) => {
            tracing::error!("Error initiating call: {}", e);
            return error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to initiate call: {e}"),
            );
        }
    };
    tracing::info!("placed call {} to {}", call_sid, to_number);

    let mut ctx = CallContext::new(
        call_sid.as_str(),
        state.prompts.system_message.as_str(),
        state.prompts.initial_message.as_str(),
    );
    ctx.to_number = Some(to_number);
    ctx.from_number = Some(from_number).filter(|n| !n.is_empty());
    match call_record(&ctx) {
        Ok(record) => {
            if let Err(e) = state.db.create_call_context(record).await {
                tracing::warn!("failed to record call {}: {}", call_sid, e);
            }
        }
        Err(e) => tracing::warn!("failed to serialize call {}: {}", call_sid, e),
    }
    state.store.insert(ctx);

    Json(json!({ "call_sid": call_sid })).into_response()
}

async fn call_status(State(state): State<AppState>, Path(call_sid): Path<String>) -> Response {
    match state.calls.fetch_status(&call_sid).await {
        Ok(status) => Json(json!({ "status": status })).into_response(),
        Err(e) => {
            tracing::error!("Error fetching call status: {}", e);
            Json(json!({ "error": format!("Failed to fetch call status: {e}") })).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct EndCallRequest {
    #[serde(default)]
    call_sid: Option<String>,
}

async fn end_call(State(state): State<AppState>, Json(request): Json<EndCallRequest>) -> Response {
    let Some(call_sid) = request.call_sid.filter(|s| !s.trim().is_empty()) else {
        return error(StatusCode::BAD_REQUEST, "Missing 'call_sid' in request");
    };

    if let Err(e) = state.calls.complete_call(&call_sid).await {
        tracing::error!("Error ending call: {}", e);
        return Json(json!({ "error": format!("Failed to end requested call: {e}") })).into_response();
    }
    if let Some(ctx) = state.store.remove(&call_sid) {
        close_call(&ctx, STATUS_COMPLETED).await;
    }
    Json(json!({ "status": "success" })).into_response()
}

/// The live transcript if the call is in progress, else the stored one.
async fn transcript(State(state): State<AppState>, Path(call_sid): Path<String>) -> Response {
    if let Some(ctx) = state.store.get(&call_sid) {
        let guard = ctx.lock().await;
        return match serde_json::to_value(guard.transcript()) {
            Ok(transcript) => Json(json!({ "transcript": transcript })).into_response(),
            Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
    }

    match state.db.get_call_context(&call_sid).await {
        Ok(Some(record)) => Json(json!({ "transcript": record.user_context })).into_response(),
        Ok(None) => Json(json!({ "error": "Call not found" })).into_response(),
        Err(e) => {
            tracing::error!("failed to load call {}: {}", call_sid, e);
            error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn all_transcripts(State(state): State<AppState>) -> Response {
    let mut transcripts = Vec::new();
    let mut seen = HashSet::new();

    for ctx in state.store.list() {
        let guard = ctx.lock().await;
        let transcript = serde_json::to_value(guard.transcript()).unwrap_or(Value::Null);
        seen.insert(guard.call_sid.clone());
        transcripts.push(json!({ "call_sid": guard.call_sid, "transcript": transcript }));
    }

    match state.db.list_call_contexts().await {
        Ok(records) => {
            for record in records.into_iter().filter(|r| !seen.contains(&r.call_sid)) {
                transcripts.push(json!({ "call_sid": record.call_sid, "transcript": record.user_context }));
            }
        }
        Err(e) => {
            tracing::error!("failed to list calls: {}", e);
            return error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    }

    Json(json!({ "transcripts": transcripts })).into_response()
}
