//! Request admission: IP policy, API keys and roles.
//!
//! `evaluate` runs the checks in a fixed order and stops at the first decisive
//! one. The middleware wraps it and stores an `AccessContext` on admitted
//! requests for handlers that audit writes.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::{HeaderMap, Method, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;

use crate::AppState;
use crate::access_store::{AccessStore, ApiKeyRole, IpList};
use crate::api_envelope::{
    ApiErrorCode, ApiErrorTuple, error_response, error_response_with_details, internal_error,
};
use crate::cidr::{ip_in_list, is_loopback};
use crate::client_ip::{peer_ip_string, resolve_client_ip};
use crate::config::Config;
use crate::db::StoreError;

pub const HEADER_API_KEY: &str = "x-api-key";
pub const QUERY_API_KEY: &str = "api_key";
const SEARCH_PATH: &str = "/search";
const ADMIN_PREFIX: &str = "/admin/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredRole {
    Read,
    Write,
    Admin,
}

impl RequiredRole {
    pub fn for_request(method: &Method, path: &str) -> Self {
        if path.starts_with(ADMIN_PREFIX) || path == "/admin" {
            Self::Admin
        } else if is_read_request(method, path) {
            Self::Read
        } else {
            Self::Write
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Admin => "admin",
        }
    }

    const fn describe(self) -> &'static str {
        match self {
            Self::Read => "read or higher",
            Self::Write => "write or admin",
            Self::Admin => "admin",
        }
    }

    /// Unparseable stored roles never satisfy a requirement.
    pub fn is_satisfied_by(self, role: Option<ApiKeyRole>) -> bool {
        match (self, role) {
            (_, None) => false,
            (Self::Read, Some(_)) => true,
            (Self::Write, Some(role)) => role >= ApiKeyRole::Write,
            (Self::Admin, Some(role)) => role == ApiKeyRole::Admin,
        }
    }
}

/// Safe methods read; so does `POST /search`.
pub fn is_read_request(method: &Method, path: &str) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
        || (*method == Method::POST && path == SEARCH_PATH)
}

/// Who is behind an admitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessContext {
    pub client_ip: String,
    pub api_key_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDenial {
    IpDenied { ip: String },
    MissingKey { required: RequiredRole },
    InvalidKey,
    InsufficientRole { role: String, required: RequiredRole },
    AdminRequired,
}

impl AccessDenial {
    pub fn into_error(self) -> ApiErrorTuple {
        match self {
            Self::IpDenied { ip } => error_response_with_details(
                ApiErrorCode::IpDenied,
                "Access denied by IP policy",
                Some(json!({ "ip": ip, "reason": "Matched deny list" })),
            ),
            Self::MissingKey { required } => error_response_with_details(
                ApiErrorCode::NoApiKey,
                "API key required",
                Some(json!({
                    "hint": "Provide API key via X-API-Key header or ?api_key= query.",
                    "required": required.as_str(),
                })),
            ),
            Self::InvalidKey => error_response_with_details(
                ApiErrorCode::InvalidApiKey,
                "Invalid API key",
                Some(json!({ "hint": "Key not found or disabled" })),
            ),
            Self::InsufficientRole { role, required } => error_response_with_details(
                ApiErrorCode::Forbidden,
                "Insufficient role",
                Some(json!({ "role": role, "required": required.describe() })),
            ),
            Self::AdminRequired => error_response(
                ApiErrorCode::Forbidden,
                "Insufficient role (admin required)",
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allow(AccessContext),
    Deny(AccessDenial),
}

/// The parts of a request the gate looks at.
#[derive(Debug, Clone)]
pub struct GateRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub api_key: Option<String>,
    pub peer_ip: String,
}

impl GateRequest {
    pub fn from_parts(method: Method, uri: &Uri, headers: HeaderMap, peer: IpAddr) -> Self {
        let api_key = presented_key(&headers, uri);
        Self {
            method,
            path: uri.path().to_string(),
            headers,
            api_key,
            peer_ip: peer_ip_string(peer),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiKeyQuery {
    api_key: Option<String>,
}

/// `X-API-Key` first, then `?api_key=`. Blank values count as absent.
pub fn presented_key(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    let from_header = headers
        .get(HEADER_API_KEY)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string);
    from_header.or_else(|| {
        Query::<ApiKeyQuery>::try_from_uri(uri)
            .ok()
            .and_then(|Query(query)| query.api_key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

pub fn evaluate(
    config: &Config,
    access: &AccessStore,
    request: &GateRequest,
) -> Result<AccessDecision, StoreError> {
    let client_ip = resolve_client_ip(
        &request.peer_ip,
        &request.headers,
        config.trust_proxy,
        &config.trusted_proxies,
    );
    let admit = |api_key_id: Option<i64>| {
        AccessDecision::Allow(AccessContext {
            client_ip: client_ip.clone(),
            api_key_id,
        })
    };

    if config.no_auth {
        return Ok(admit(None));
    }

    let is_read = is_read_request(&request.method, &request.path);
    if config.allow_localhost && is_read && is_loopback(&client_ip) {
        return Ok(admit(None));
    }

    if ip_in_list(&access.enabled_cidrs(IpList::Deny)?, &client_ip) {
        return Ok(AccessDecision::Deny(AccessDenial::IpDenied {
            ip: client_ip.clone(),
        }));
    }
    if ip_in_list(&access.enabled_cidrs(IpList::Allow)?, &client_ip) {
        return Ok(admit(None));
    }

    if access.count_keys()? == 0 {
        return Ok(admit(None));
    }

    let required = RequiredRole::for_request(&request.method, &request.path);
    let Some(key) = request.api_key.as_deref() else {
        return Ok(AccessDecision::Deny(AccessDenial::MissingKey { required }));
    };
    let Some(found) = access.find_enabled_key(key)? else {
        return Ok(AccessDecision::Deny(AccessDenial::InvalidKey));
    };
    if !required.is_satisfied_by(found.role()) {
        return Ok(AccessDecision::Deny(AccessDenial::InsufficientRole {
            role: found.role,
            required,
        }));
    }

    access.touch_key(found.id, &client_ip)?;
    Ok(admit(Some(found.id)))
}

/// Admin-only endpoints: a presented key must be an enabled admin key. No key
/// at all is left to the decision already made by `evaluate`.
pub fn evaluate_admin(
    access: &AccessStore,
    api_key: Option<&str>,
) -> Result<Option<AccessDenial>, StoreError> {
    let Some(key) = api_key else {
        return Ok(None);
    };
    let found = access.find_enabled_key(key)?;
    match found.and_then(|found| found.role()) {
        Some(ApiKeyRole::Admin) => Ok(None),
        _ => Ok(Some(AccessDenial::AdminRequired)),
    }
}

fn peer_address(request: &Request) -> IpAddr {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

fn gate_failure(error: StoreError) -> Response {
    tracing::error!(reason = %error, "access gate could not read the credential store");
    error_response(ApiErrorCode::Database, "Database unavailable").into_response()
}

pub(crate) async fn access_gate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let gate_request = GateRequest::from_parts(
        request.method().clone(),
        request.uri(),
        request.headers().clone(),
        peer_address(&request),
    );
    let config = state.config.clone();
    let access = state.access.clone();
    let outcome =
        tokio::task::spawn_blocking(move || evaluate(&config, &access, &gate_request)).await;

    match outcome {
        Ok(Ok(AccessDecision::Allow(context))) => {
            request.extensions_mut().insert(context);
            next.run(request).await
        }
        Ok(Ok(AccessDecision::Deny(denial))) => {
            tracing::info!(
                path = %request.uri().path(),
                denial = ?denial,
                "request rejected by access gate"
            );
            denial.into_error().into_response()
        }
        Ok(Err(error)) => gate_failure(error),
        Err(error) => {
            tracing::error!(reason = %error, "access gate task failed");
            internal_error("Internal error").into_response()
        }
    }
}

pub(crate) async fn admin_gate(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let api_key = presented_key(request.headers(), request.uri());
    let access = state.access.clone();
    let outcome =
        tokio::task::spawn_blocking(move || evaluate_admin(&access, api_key.as_deref())).await;

    match outcome {
        Ok(Ok(None)) => next.run(request).await,
        Ok(Ok(Some(denial))) => denial.into_error().into_response(),
        Ok(Err(error)) => gate_failure(error),
        Err(error) => {
            tracing::error!(reason = %error, "admin gate task failed");
            internal_error("Internal error").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::HeaderValue;
    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::clock::SteppingClock;
    use crate::db;

    fn fixture() -> (TempDir, Config, AccessStore) {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("karing.db");
        db::init_schema(&path, false).expect("schema");
        let config = Config::for_tests(path.clone());
        let access = AccessStore::new(path, Arc::new(SteppingClock::starting_at(1)));
        (dir, config, access)
    }

    fn request(method: Method, path: &str, ip: &str, key: Option<&str>) -> GateRequest {
        GateRequest {
            method,
            path: path.to_string(),
            headers: HeaderMap::new(),
            api_key: key.map(ToString::to_string),
            peer_ip: ip.to_string(),
        }
    }

    fn decide(config: &Config, access: &AccessStore, request: &GateRequest) -> AccessDecision {
        evaluate(config, access, request).expect("evaluate")
    }

    #[test]
    fn keyless_deployment_admits_everyone() {
        let (_dir, config, access) = fixture();
        let decision = decide(&config, &access, &request(Method::POST, "/", "8.8.8.8", None));
        assert!(matches!(decision, AccessDecision::Allow(_)));
    }

    #[test]
    fn missing_key_is_rejected_once_any_key_exists() {
        let (_dir, config, access) = fixture();
        access
            .issue_key(ApiKeyRole::Write, None, true)
            .expect("issue");
        let decision = decide(&config, &access, &request(Method::GET, "/", "8.8.8.8", None));
        assert_eq!(
            decision,
            AccessDecision::Deny(AccessDenial::MissingKey {
                required: RequiredRole::Read
            })
        );

        let invalid = decide(
            &config,
            &access,
            &request(Method::GET, "/", "8.8.8.8", Some("nope")),
        );
        assert_eq!(invalid, AccessDecision::Deny(AccessDenial::InvalidKey));
    }

    #[test]
    fn deny_list_beats_a_narrower_allow_rule() {
        let (_dir, config, access) = fixture();
        access
            .add_ip_rule(IpList::Deny, "10.0.0.0/24")
            .expect("deny");
        access
            .add_ip_rule(IpList::Allow, "10.0.0.5/32")
            .expect("allow");
        let decision = decide(&config, &access, &request(Method::GET, "/", "10.0.0.5", None));
        assert_eq!(
            decision,
            AccessDecision::Deny(AccessDenial::IpDenied {
                ip: "10.0.0.5".to_string()
            })
        );
    }

    #[test]
    fn allow_list_bypasses_key_validation() {
        let (_dir, config, access) = fixture();
        access
            .issue_key(ApiKeyRole::Read, None, true)
            .expect("issue");
        access
            .add_ip_rule(IpList::Allow, "192.168.0.0/16")
            .expect("allow");
        let decision = decide(
            &config,
            &access,
            &request(Method::DELETE, "/", "192.168.4.4", Some("garbage")),
        );
        assert!(matches!(decision, AccessDecision::Allow(_)));
    }

    #[test]
    fn role_hierarchy_governs_write_and_admin_paths() {
        let (_dir, config, access) = fixture();
        let read = access.issue_key(ApiKeyRole::Read, None, true).expect("read");
        let write = access
            .issue_key(ApiKeyRole::Write, None, true)
            .expect("write");
        let admin = access
            .issue_key(ApiKeyRole::Admin, None, true)
            .expect("admin");
        let ip = "203.0.113.7";

        let read_post = decide(&config, &access, &request(Method::POST, "/", ip, Some(&read.key)));
        assert_eq!(
            read_post,
            AccessDecision::Deny(AccessDenial::InsufficientRole {
                role: "read".to_string(),
                required: RequiredRole::Write,
            })
        );
        let read_search = decide(
            &config,
            &access,
            &request(Method::POST, "/search", ip, Some(&read.key)),
        );
        assert!(matches!(read_search, AccessDecision::Allow(_)));

        for method in [Method::POST, Method::PUT, Method::PATCH, Method::DELETE] {
            for key in [&write.key, &admin.key] {
                let decision = decide(&config, &access, &request(method.clone(), "/", ip, Some(key)));
                assert!(matches!(decision, AccessDecision::Allow(_)), "{method}");
            }
        }

        let write_admin = decide(
            &config,
            &access,
            &request(Method::GET, "/admin/auth", ip, Some(&write.key)),
        );
        assert!(matches!(
            write_admin,
            AccessDecision::Deny(AccessDenial::InsufficientRole { .. })
        ));
        let admin_admin = decide(
            &config,
            &access,
            &request(Method::GET, "/admin/auth", ip, Some(&admin.key)),
        );
        assert_eq!(
            admin_admin,
            AccessDecision::Allow(AccessContext {
                client_ip: ip.to_string(),
                api_key_id: Some(admin.id),
            })
        );
        let touched = access.get_key(admin.id).expect("admin key");
        assert_eq!(touched.last_ip.as_deref(), Some(ip));
    }

    #[test]
    fn unknown_stored_role_is_forbidden() {
        let (_dir, config, access) = fixture();
        let key = access.issue_key(ApiKeyRole::Read, None, true).expect("issue");
        let conn = db::open(&config.db_path).expect("open");
        conn.execute(
            "UPDATE api_keys SET role = 'owner' WHERE id = ?1",
            rusqlite::params![key.id],
        )
        .expect("corrupt role");
        let decision = decide(&config, &access, &request(Method::GET, "/", "1.2.3.4", Some(&key.key)));
        assert!(matches!(
            decision,
            AccessDecision::Deny(AccessDenial::InsufficientRole { .. })
        ));
    }

    #[test]
    fn localhost_fast_path_only_covers_reads() {
        let (_dir, mut config, access) = fixture();
        config.allow_localhost = true;
        access
            .issue_key(ApiKeyRole::Write, None, true)
            .expect("issue");
        let read = decide(&config, &access, &request(Method::GET, "/", "127.0.0.1", None));
        assert!(matches!(read, AccessDecision::Allow(_)));
        let write = decide(&config, &access, &request(Method::POST, "/", "127.0.0.1", None));
        assert!(matches!(
            write,
            AccessDecision::Deny(AccessDenial::MissingKey {
                required: RequiredRole::Write
            })
        ));
    }

    #[test]
    fn no_auth_skips_every_check() {
        let (_dir, mut config, access) = fixture();
        config.no_auth = true;
        access
            .add_ip_rule(IpList::Deny, "0.0.0.0/0")
            .expect("deny all");
        let decision = decide(&config, &access, &request(Method::DELETE, "/", "9.9.9.9", None));
        assert!(matches!(decision, AccessDecision::Allow(_)));
    }

    #[test]
    fn trusted_proxy_header_decides_the_client_ip() {
        let (_dir, mut config, access) = fixture();
        config.trust_proxy = true;
        config.trusted_proxies = vec!["10.0.0.0/8".to_string()];
        access
            .add_ip_rule(IpList::Deny, "198.51.100.0/24")
            .expect("deny");
        let mut gate_request = request(Method::GET, "/", "10.0.0.2", None);
        gate_request.headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("198.51.100.20, 10.0.0.9"),
        );
        let decision = decide(&config, &access, &gate_request);
        assert_eq!(
            decision,
            AccessDecision::Deny(AccessDenial::IpDenied {
                ip: "198.51.100.20".to_string()
            })
        );
    }

    #[test]
    fn admin_filter_only_judges_presented_keys() {
        let (_dir, _config, access) = fixture();
        let write = access
            .issue_key(ApiKeyRole::Write, None, true)
            .expect("write");
        let admin = access
            .issue_key(ApiKeyRole::Admin, None, true)
            .expect("admin");
        assert_eq!(evaluate_admin(&access, None).expect("no key"), None);
        assert_eq!(
            evaluate_admin(&access, Some(&admin.key)).expect("admin"),
            None
        );
        assert_eq!(
            evaluate_admin(&access, Some(&write.key)).expect("write"),
            Some(AccessDenial::AdminRequired)
        );
    }

    #[test]
    fn key_comes_from_header_before_query() {
        let mut headers = HeaderMap::new();
        let uri: Uri = "/search?q=x&api_key=from-query".parse().expect("uri");
        assert_eq!(presented_key(&headers, &uri).as_deref(), Some("from-query"));
        headers.insert(HEADER_API_KEY, HeaderValue::from_static("from-header"));
        assert_eq!(presented_key(&headers, &uri).as_deref(), Some("from-header"));
        let bare: Uri = "/".parse().expect("uri");
        assert_eq!(presented_key(&HeaderMap::new(), &bare), None);
    }
}
