//! Admin-only endpoints under `/admin`: credentials, IP lists and the
//! unfiltered slot listing.

use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router, middleware};
use serde::Deserialize;
use serde_json::json;

use crate::access_gate;
use crate::access_store::{ApiKeyRole, IpList};
use crate::api_envelope::{ApiErrorTuple, ok_data, ok_data_with_meta, validation_error};
use crate::config::is_truthy;
use crate::karing_routes::{order_param, record_json, required_id, store_error};
use crate::slot_filter::{PagePosition, SlotFilter};
use crate::{AppState, run_blocking};

pub(crate) fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/admin/auth", get(auth_overview))
        .route("/admin/slots", get(list_slots))
        .route(
            "/admin/keys",
            post(create_key).patch(update_key).delete(delete_key),
        )
        .route("/admin/ip", post(add_ip).delete(remove_ip))
        .route_layer(middleware::from_fn_with_state(
            state,
            access_gate::admin_gate,
        ))
}

fn role_param(raw: &str) -> Result<ApiKeyRole, ApiErrorTuple> {
    raw.parse::<ApiKeyRole>().map_err(store_error)
}

fn list_param(raw: &str) -> Result<IpList, ApiErrorTuple> {
    raw.parse::<IpList>().map_err(store_error)
}

async fn auth_overview(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let access = state.access.clone();
    let (keys, allow, deny) = run_blocking(move || {
        Ok((
            access.list_keys()?,
            access.list_ip_rules(IpList::Allow)?,
            access.list_ip_rules(IpList::Deny)?,
        ))
    })
    .await
    .map_err(store_error)?;
    Ok(ok_data(json!({ "keys": keys, "allow": allow, "deny": deny })))
}

async fn list_slots(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let param = |name: &str| {
        params
            .get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    };
    let runtime_limit = state.config.runtime_limit;
    let limit = param("limit")
        .and_then(|value| value.parse::<u32>().ok())
        .map_or(runtime_limit, |value| value.clamp(1, runtime_limit));
    let offset = match param("offset") {
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|_| validation_error("Invalid offset"))?,
        None => 0,
    };
    let order = order_param(param("order"))?;
    let filter = SlotFilter {
        include_inactive: param("include_inactive").is_some_and(is_truthy),
        is_file: match param("type") {
            Some("text") => Some(false),
            Some("file") => Some(true),
            _ => None,
        },
        mime: param("mime").map(ToString::to_string),
        filename: param("filename").map(ToString::to_string),
        order,
    };

    let slots = state.slots.clone();
    let (records, total) = run_blocking(move || {
        let records = slots.list_filtered(limit, &filter, PagePosition::Offset(offset))?;
        let total = slots.count_filtered(&filter)?;
        Ok((records, total))
    })
    .await
    .map_err(store_error)?;

    let meta = json!({
        "count": records.len(),
        "limit": limit,
        "offset": offset,
        "total": total,
    });
    let data = records.iter().map(record_json).collect::<Vec<_>>();
    Ok(ok_data_with_meta(data, Some(meta)))
}

#[derive(Debug, Default, Deserialize)]
struct CreateKeyBody {
    role: Option<String>,
    label: Option<String>,
    enabled: Option<bool>,
}

async fn create_key(
    State(state): State<AppState>,
    body: Option<Json<CreateKeyBody>>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let role = match body.role.as_deref() {
        Some(raw) => role_param(raw)?,
        None => ApiKeyRole::Write,
    };
    let label = body.label.filter(|label| !label.trim().is_empty());
    let enabled = body.enabled.unwrap_or(true);
    let access = state.access.clone();
    let record = run_blocking(move || access.issue_key(role, label.as_deref(), enabled))
        .await
        .map_err(store_error)?;
    let (_, body) = ok_data(record);
    Ok((StatusCode::CREATED, body))
}

#[derive(Debug, Default, Deserialize)]
struct UpdateKeyBody {
    role: Option<String>,
    label: Option<String>,
    enabled: Option<bool>,
}

async fn update_key(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    Json(body): Json<UpdateKeyBody>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let id = required_id(&params)?;
    let role = body.role.as_deref().map(role_param).transpose()?;
    if role.is_none() && body.label.is_none() && body.enabled.is_none() {
        return Err(validation_error("Nothing to update"));
    }
    let access = state.access.clone();
    let record = run_blocking(move || {
        if let Some(role) = role {
            access.set_role(id, role)?;
        }
        if let Some(label) = body.label.as_deref() {
            let label = Some(label.trim()).filter(|label| !label.is_empty());
            access.set_label(id, label)?;
        }
        if let Some(enabled) = body.enabled {
            access.set_enabled(id, enabled)?;
        }
        access.get_key(id)
    })
    .await
    .map_err(store_error)?;
    Ok(ok_data(record))
}

/// Soft delete disables the key; `hard=true` removes the row.
async fn delete_key(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let id = required_id(&params)?;
    let hard = params.get("hard").is_some_and(|value| is_truthy(value));
    let access = state.access.clone();
    run_blocking(move || {
        if hard {
            access.delete_key(id)
        } else {
            access.set_enabled(id, false)
        }
    })
    .await
    .map_err(store_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct AddIpBody {
    list: String,
    cidr: String,
}

async fn add_ip(
    State(state): State<AppState>,
    Json(body): Json<AddIpBody>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let list = list_param(&body.list)?;
    let access = state.access.clone();
    let rule = run_blocking(move || access.add_ip_rule(list, &body.cidr))
        .await
        .map_err(store_error)?;
    let (_, body) = ok_data(json!({ "list": list.as_str(), "rule": rule }));
    Ok((StatusCode::CREATED, body))
}

async fn remove_ip(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let list = params
        .get("list")
        .ok_or_else(|| validation_error("List required"))
        .and_then(|raw| list_param(raw))?;
    let id = required_id(&params)?;
    let access = state.access.clone();
    run_blocking(move || access.remove_ip_rule(list, id))
        .await
        .map_err(store_error)?;
    Ok(StatusCode::NO_CONTENT)
}
