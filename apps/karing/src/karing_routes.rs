//! Slot endpoints: `/`, `/search`, `/restore` and `/health`.

use std::collections::HashMap;

use axum::body::{Body, Bytes};
use axum::extract::multipart::MultipartError;
use axum::extract::{Extension, FromRequest, Multipart, Query, Request, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{Value, json};

use crate::access_gate::{AccessContext, QUERY_API_KEY};
use crate::api_envelope::{
    ApiDataEnvelope, ApiErrorCode, ApiErrorTuple, created, error_response,
    error_response_with_details, internal_error, not_found_error, ok_data, ok_data_with_meta,
    query_error, validation_error,
};
use crate::config::{HARD_MAX_FILE_BYTES, HARD_MAX_TEXT_BYTES, MAX_LIMIT};
use crate::cursor::Cursor;
use crate::db::{self, StoreError};
use crate::slot_filter::{PagePosition, SlotFilter, SortOrder};
use crate::slot_store::{FilePatch, FileUpload, OverwriteActor, SlotBody, SlotRecord};
use crate::{AppState, run_blocking};

const DEFAULT_UPLOAD_NAME: &str = "upload";
const FALLBACK_MIME: &str = "application/octet-stream";

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/",
            get(get_root)
                .post(post_root)
                .put(put_root)
                .patch(patch_root)
                .delete(delete_root),
        )
        .route("/search", get(search_get).post(search_post))
        .route("/restore", post(restore))
}

/// Maps store failures onto the response envelope. Only unexpected storage
/// failures are logged as errors.
pub(crate) fn store_error(error: StoreError) -> ApiErrorTuple {
    match error {
        StoreError::NotFound => not_found_error("Not found"),
        StoreError::Conflict { message } => error_response(ApiErrorCode::Conflict, message),
        StoreError::Validation { field, message } => error_response_with_details(
            ApiErrorCode::Validation,
            message,
            Some(json!({ "field": field })),
        ),
        StoreError::QueryInvalid { reason } => {
            query_error("Invalid search query", Some(reason.as_str()))
        }
        StoreError::SearchUnavailable => {
            error_response(ApiErrorCode::FtsUnavailable, "Full-text search unavailable")
        }
        StoreError::Open { .. } => {
            tracing::error!(reason = %error, "database unavailable");
            error_response(ApiErrorCode::Database, "Database unavailable")
        }
        other => {
            tracing::error!(reason = %other, "storage operation failed");
            internal_error("Internal error")
        }
    }
}

pub(crate) fn record_json(record: &SlotRecord) -> Value {
    let mut item = json!({
        "id": record.id,
        "is_file": record.is_file(),
        "created_at": record.created_at,
        "updated_at": record.updated_at,
        "revision": record.revision,
        "is_active": record.is_active,
    });
    match &record.body {
        SlotBody::Text { content } => {
            item["content"] = json!(content);
        }
        SlotBody::File {
            filename,
            mime,
            size,
        } => {
            item["filename"] = json!(filename);
            item["mime"] = json!(mime);
            item["size"] = json!(size);
        }
        SlotBody::Empty => {}
    }
    item
}

fn actor(context: Option<Extension<AccessContext>>) -> OverwriteActor {
    match context {
        Some(Extension(context)) => OverwriteActor {
            api_key_id: context.api_key_id,
            from_ip: Some(context.client_ip),
        },
        None => OverwriteActor::default(),
    }
}

pub(crate) fn required_id(params: &HashMap<String, String>) -> Result<i64, ApiErrorTuple> {
    let raw = params
        .get("id")
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| validation_error("Id required"))?;
    raw.parse::<i64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| validation_error("Invalid id"))
}

/// `asc` or `desc`, newest first when absent.
pub(crate) fn order_param(raw: Option<&str>) -> Result<SortOrder, ApiErrorTuple> {
    match raw {
        None => Ok(SortOrder::Desc),
        Some(raw) => SortOrder::parse(raw)
            .ok_or_else(|| query_error("Invalid order", Some("expected asc or desc"))),
    }
}

fn is_allowed_upload_mime(mime: &str) -> bool {
    let mime = mime.trim().to_ascii_lowercase();
    mime.starts_with("image/") || mime.starts_with("audio/")
}

fn content_disposition(kind: &str, filename: &str) -> HeaderValue {
    let safe: String = filename
        .chars()
        .map(|c| if c == '"' || c == '\\' || c.is_control() { '_' } else { c })
        .collect();
    HeaderValue::from_str(&format!("{kind}; filename=\"{safe}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

async fn get_root(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiErrorTuple> {
    let mut id = None;
    let mut download = false;
    let mut want_json = false;
    for (name, value) in &params {
        match name.as_str() {
            "id" => id = Some(required_id(&params)?),
            "as" => download = value == "download",
            "json" => want_json = value == "true",
            QUERY_API_KEY => {}
            _ => {
                return Err(error_response(
                    ApiErrorCode::Query,
                    "Unsupported query on root path",
                ));
            }
        }
    }

    let slots = state.slots.clone();
    let record = run_blocking(move || {
        let id = match id {
            Some(id) => id,
            None => slots.latest_id()?.ok_or(StoreError::NotFound)?,
        };
        slots.get_by_id(id)
    })
    .await
    .map_err(|error| match (error, id) {
        (StoreError::NotFound, None) => not_found_error("No content"),
        (error, _) => store_error(error),
    })?;

    if want_json {
        return Ok(ok_data(vec![record_json(&record)]).into_response());
    }

    match record.body {
        SlotBody::Text { content } => Ok((
            StatusCode::OK,
            [(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"))],
            content,
        )
            .into_response()),
        _ => {
            let slots = state.slots.clone();
            let record_id = record.id;
            let blob = run_blocking(move || slots.get_file_blob(record_id))
                .await
                .map_err(|error| match error {
                    StoreError::NotFound => not_found_error("File not found"),
                    other => store_error(other),
                })?;
            let disposition = if download { "attachment" } else { "inline" };
            let content_type = HeaderValue::from_str(&blob.mime)
                .unwrap_or_else(|_| HeaderValue::from_static(FALLBACK_MIME));
            Ok((
                StatusCode::OK,
                [
                    (CONTENT_TYPE, content_type),
                    (
                        CONTENT_DISPOSITION,
                        content_disposition(disposition, &blob.filename),
                    ),
                ],
                Body::from(blob.data),
            )
                .into_response())
        }
    }
}

/// Multipart form contents: the first file part and every text field.
#[derive(Debug, Default)]
struct UploadForm {
    data: Option<Vec<u8>>,
    part_mime: Option<String>,
    part_filename: Option<String>,
    fields: HashMap<String, String>,
}

impl UploadForm {
    /// Form field first, then query parameter.
    fn param(&self, params: &HashMap<String, String>, name: &str) -> Option<String> {
        self.fields
            .get(name)
            .or_else(|| params.get(name))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

enum WriteBody {
    Json(Value),
    Form(UploadForm),
}

fn multipart_error(error: MultipartError) -> ApiErrorTuple {
    if error.status() == StatusCode::PAYLOAD_TOO_LARGE {
        error_response(ApiErrorCode::Size, "File too large")
    } else {
        validation_error("Multipart parse error")
    }
}

async fn read_upload_form(mut multipart: Multipart) -> Result<UploadForm, ApiErrorTuple> {
    let mut form = UploadForm::default();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        let is_file = name == "file" || field.file_name().is_some();
        if is_file && form.data.is_none() {
            form.part_mime = field.content_type().map(ToString::to_string);
            form.part_filename = field.file_name().map(ToString::to_string);
            form.data = Some(field.bytes().await.map_err(multipart_error)?.to_vec());
        } else if !is_file {
            let value = field.text().await.map_err(multipart_error)?;
            form.fields.insert(name, value);
        }
    }
    Ok(form)
}

async fn read_write_body(state: &AppState, request: Request) -> Result<WriteBody, ApiErrorTuple> {
    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("application/json") {
        let body = Bytes::from_request(request, state).await.map_err(|rejection| {
            if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                error_response(ApiErrorCode::Size, "Text too large")
            } else {
                validation_error("Request body unreadable")
            }
        })?;
        let value = serde_json::from_slice::<Value>(&body)
            .map_err(|_| validation_error("JSON required"))?;
        return Ok(WriteBody::Json(value));
    }
    if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(request, state)
            .await
            .map_err(|_| validation_error("Multipart parse error"))?;
        return Ok(WriteBody::Form(read_upload_form(multipart).await?));
    }
    Err(error_response(
        ApiErrorCode::Mime,
        "Unsupported content-type",
    ))
}

fn check_text(content: &str, max_text_bytes: u64) -> Result<(), ApiErrorTuple> {
    if content.len() as u64 > max_text_bytes {
        return Err(error_response(ApiErrorCode::Size, "Text too large"));
    }
    Ok(())
}

fn check_file(data: &[u8], max_file_bytes: u64) -> Result<(), ApiErrorTuple> {
    if data.len() as u64 > max_file_bytes {
        return Err(error_response(ApiErrorCode::Size, "File too large"));
    }
    Ok(())
}

fn check_mime(mime: &str) -> Result<(), ApiErrorTuple> {
    if !is_allowed_upload_mime(mime) {
        return Err(error_response(ApiErrorCode::Mime, "Unsupported media type"));
    }
    Ok(())
}

fn required_text(body: &Value, max_text_bytes: u64) -> Result<String, ApiErrorTuple> {
    let content = body
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(|| validation_error("Content required"))?;
    check_text(content, max_text_bytes)?;
    Ok(content.to_string())
}

/// Complete upload for a create or full replace.
fn required_upload(
    form: UploadForm,
    params: &HashMap<String, String>,
    max_file_bytes: u64,
) -> Result<FileUpload, ApiErrorTuple> {
    let mime = form
        .param(params, "mime")
        .or_else(|| form.part_mime.clone())
        .unwrap_or_else(|| FALLBACK_MIME.to_string());
    let filename = form
        .param(params, "filename")
        .or_else(|| form.part_filename.clone())
        .unwrap_or_else(|| DEFAULT_UPLOAD_NAME.to_string());
    let Some(data) = form.data else {
        return Err(validation_error("File required"));
    };
    check_mime(&mime)?;
    check_file(&data, max_file_bytes)?;
    Ok(FileUpload {
        filename,
        mime,
        data,
    })
}

async fn post_root(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    request: Request,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let config = state.config.clone();
    let slots = state.slots.clone();
    let outcome = match read_write_body(&state, request).await? {
        WriteBody::Json(body) => {
            let content = required_text(&body, config.max_text_bytes)?;
            run_blocking(move || slots.insert_text(&content)).await
        }
        WriteBody::Form(form) => {
            let upload = required_upload(form, &params, config.max_file_bytes)?;
            run_blocking(move || slots.insert_file(upload)).await
        }
    };
    let id = outcome.map_err(store_error)?;
    tracing::debug!(slot_id = id, "slot created");
    Ok(created(id))
}

async fn put_root(
    State(state): State<AppState>,
    context: Option<Extension<AccessContext>>,
    Query(params): Query<HashMap<String, String>>,
    request: Request,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let id = required_id(&params)?;
    let actor = actor(context);
    let config = state.config.clone();
    let slots = state.slots.clone();
    let outcome = match read_write_body(&state, request).await? {
        WriteBody::Json(body) => {
            let content = required_text(&body, config.max_text_bytes)?;
            run_blocking(move || slots.update_text(id, &content, &actor)).await
        }
        WriteBody::Form(form) => {
            let upload = required_upload(form, &params, config.max_file_bytes)?;
            run_blocking(move || slots.update_file(id, upload, &actor)).await
        }
    };
    outcome.map_err(|error| match error {
        StoreError::NotFound => not_found_error("Update failed"),
        other => store_error(other),
    })?;
    Ok(ok_data(json!({ "id": id })))
}

async fn patch_root(
    State(state): State<AppState>,
    context: Option<Extension<AccessContext>>,
    Query(params): Query<HashMap<String, String>>,
    request: Request,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let id = required_id(&params)?;
    let actor = actor(context);
    let config = state.config.clone();
    let slots = state.slots.clone();
    let outcome = match read_write_body(&state, request).await? {
        WriteBody::Json(body) => {
            let content = match body.get("content") {
                None | Some(Value::Null) => None,
                Some(Value::String(content)) => {
                    check_text(content, config.max_text_bytes)?;
                    Some(content.clone())
                }
                Some(_) => return Err(validation_error("Content must be a string")),
            };
            run_blocking(move || slots.patch_text(id, content.as_deref(), &actor)).await
        }
        WriteBody::Form(form) => {
            if let Some(data) = form.data.as_deref() {
                check_file(data, config.max_file_bytes)?;
            }
            let mime = form.param(&params, "mime");
            if let Some(mime) = mime.as_deref() {
                check_mime(mime)?;
            }
            let patch = FilePatch {
                filename: form.param(&params, "filename"),
                mime,
                data: form.data,
            };
            run_blocking(move || slots.patch_file(id, patch, &actor)).await
        }
    };
    outcome.map_err(|error| match error {
        StoreError::Conflict { .. } | StoreError::NotFound => {
            error_response(ApiErrorCode::Conflict, "Patch failed")
        }
        other => store_error(other),
    })?;
    Ok(ok_data(json!({ "id": id })))
}

async fn delete_root(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let id = required_id(&params)?;
    let slots = state.slots.clone();
    run_blocking(move || slots.logical_delete(id))
        .await
        .map_err(store_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn restore(
    State(state): State<AppState>,
    context: Option<Extension<AccessContext>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let id = required_id(&params)?;
    let actor = actor(context);
    let slots = state.slots.clone();
    run_blocking(move || slots.restore_latest_snapshot(id, &actor))
        .await
        .map_err(store_error)?;
    Ok(ok_data(json!({ "id": id })))
}

/// Search and listing parameters, merged from the query string and an
/// optional JSON body. Body values win.
#[derive(Debug, Default)]
struct SearchParams {
    values: HashMap<String, String>,
}

impl SearchParams {
    fn merge(query: HashMap<String, String>, body: Option<&Value>) -> Self {
        let mut values = query;
        if let Some(Value::Object(object)) = body {
            for (name, value) in object {
                let value = match value {
                    Value::String(text) => text.clone(),
                    Value::Number(number) => number.to_string(),
                    Value::Bool(flag) => flag.to_string(),
                    _ => continue,
                };
                values.insert(name.clone(), value);
            }
        }
        Self { values }
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.values
            .get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }
}

async fn search_get(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    run_search(&state, SearchParams::merge(params, None)).await
}

async fn search_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.to_ascii_lowercase().starts_with("application/json"));
    let body = if is_json && !body.is_empty() {
        let value = serde_json::from_slice::<Value>(&body)
            .map_err(|_| validation_error("Invalid JSON body"))?;
        Some(value)
    } else {
        None
    };
    run_search(&state, SearchParams::merge(params, body.as_ref())).await
}

async fn run_search(
    state: &AppState,
    params: SearchParams,
) -> Result<(StatusCode, Json<ApiDataEnvelope<Vec<Value>>>), ApiErrorTuple> {
    let runtime_limit = state.config.runtime_limit;
    let limit = params
        .get("limit")
        .and_then(|value| value.parse::<i64>().ok())
        .map_or(runtime_limit, |value| {
            u32::try_from(value.clamp(1, i64::from(runtime_limit))).unwrap_or(runtime_limit)
        });

    let order = order_param(params.get("order"))?;
    let filter = SlotFilter {
        include_inactive: false,
        is_file: match params.get("type") {
            Some("text") => Some(false),
            Some("file") => Some(true),
            _ => None,
        },
        mime: params.get("mime").map(ToString::to_string),
        filename: params.get("filename").map(ToString::to_string),
        order,
    };
    let position = match (params.get("cursor"), params.get("offset")) {
        (Some(raw), _) => {
            let cursor = raw.parse::<Cursor>().map_err(|error| {
                query_error("Invalid cursor", Some(error.to_string().as_str()))
            })?;
            PagePosition::After(cursor)
        }
        (None, Some(raw)) => {
            let offset = raw.parse::<u64>().map_err(|_| {
                query_error("Invalid offset", Some("expected a non-negative integer"))
            })?;
            PagePosition::Offset(offset)
        }
        (None, None) => PagePosition::default(),
    };
    let query = params.get("q").map(ToString::to_string);

    let slots = state.slots.clone();
    let (records, total, engine) = run_blocking(move || match query {
        Some(query) => {
            let outcome = slots.search(&query, limit, &filter, position)?;
            Ok((outcome.records, outcome.total, Some(outcome.engine)))
        }
        None => {
            let records = slots.list_filtered(limit, &filter, position)?;
            let total = slots.count_filtered(&filter)?;
            Ok((records, total, None))
        }
    })
    .await
    .map_err(store_error)?;

    let has_more = records.len() == limit as usize;
    let next_cursor = records
        .last()
        .filter(|_| has_more)
        .map(|record| record.cursor().to_string());
    let mut meta = json!({
        "count": records.len(),
        "limit": limit,
        "total": total,
        "has_more": has_more,
        "next_cursor": next_cursor,
    });
    if let Some(engine) = engine {
        meta["engine"] = json!(engine.as_str());
    }
    let data = records.iter().map(record_json).collect::<Vec<_>>();
    Ok(ok_data_with_meta(data, Some(meta)))
}

#[derive(Debug, Serialize)]
pub(crate) struct HealthSizes {
    max_file_bytes: u64,
    max_text_bytes: u64,
    hard_file_bytes: u64,
    hard_text_bytes: u64,
    request_body_limit: usize,
}

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    status: &'static str,
    version: &'static str,
    db_path: String,
    limit_build: u32,
    limit_runtime: u32,
    limit_max: u32,
    sizes: HealthSizes,
    base_path: String,
    fts: bool,
    active_count: u64,
    uptime_seconds: u64,
}

pub(crate) async fn health(
    State(state): State<AppState>,
) -> Result<Json<HealthResponse>, ApiErrorTuple> {
    let slots = state.slots.clone();
    let (fts, active_count) = run_blocking(move || {
        let conn = db::open(slots.db_path())?;
        let fts = db::fts_available(&conn)?;
        Ok((fts, slots.count_active()?))
    })
    .await
    .map_err(store_error)?;

    let config = &state.config;
    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        db_path: config.db_path.display().to_string(),
        limit_build: crate::config::BUILD_LIMIT,
        limit_runtime: config.runtime_limit,
        limit_max: MAX_LIMIT,
        sizes: HealthSizes {
            max_file_bytes: config.max_file_bytes,
            max_text_bytes: config.max_text_bytes,
            hard_file_bytes: HARD_MAX_FILE_BYTES,
            hard_text_bytes: HARD_MAX_TEXT_BYTES,
            request_body_limit: config.request_body_limit(),
        },
        base_path: config.base_path.clone(),
        fts,
        active_count,
        uptime_seconds: state.started_at.elapsed().as_secs(),
    }))
}
