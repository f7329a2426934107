use axum::Json;
use axum::http::StatusCode;
use serde::Serialize;
use serde_json::Value;

pub type ApiErrorTuple = (StatusCode, Json<ApiErrorResponse>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorCode {
    Validation,
    Size,
    Mime,
    NotFound,
    Conflict,
    NoApiKey,
    InvalidApiKey,
    Forbidden,
    IpDenied,
    Query,
    FtsUnavailable,
    Database,
    Internal,
}

impl ApiErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "E_VALIDATION",
            Self::Size => "E_SIZE",
            Self::Mime => "E_MIME",
            Self::NotFound => "E_NOT_FOUND",
            Self::Conflict => "E_CONFLICT",
            Self::NoApiKey => "E_NO_API_KEY",
            Self::InvalidApiKey => "E_INVALID_API_KEY",
            Self::Forbidden => "E_FORBIDDEN",
            Self::IpDenied => "E_IP_DENY",
            Self::Query => "E_QUERY",
            Self::FtsUnavailable => "E_FTS_UNAVAILABLE",
            Self::Database => "E_DB",
            Self::Internal => "E_INTERNAL",
        }
    }

    pub const fn default_status(self) -> StatusCode {
        match self {
            Self::Validation => StatusCode::BAD_REQUEST,
            Self::Size => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Mime => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::NoApiKey => StatusCode::UNAUTHORIZED,
            Self::InvalidApiKey => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::IpDenied => StatusCode::FORBIDDEN,
            Self::Query => StatusCode::BAD_REQUEST,
            Self::FtsUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Database => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiErrorDetail {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ApiDataEnvelope<T> {
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    pub error: Option<()>,
}

#[derive(Debug, Serialize)]
pub struct ApiCreatedEnvelope {
    pub id: i64,
    pub error: Option<()>,
}

pub fn ok_data<T: Serialize>(data: T) -> (StatusCode, Json<ApiDataEnvelope<T>>) {
    ok_data_with_meta(data, None)
}

pub fn ok_data_with_meta<T: Serialize>(
    data: T,
    meta: Option<Value>,
) -> (StatusCode, Json<ApiDataEnvelope<T>>) {
    (
        StatusCode::OK,
        Json(ApiDataEnvelope {
            data,
            meta,
            error: None,
        }),
    )
}

pub fn created(id: i64) -> (StatusCode, Json<ApiCreatedEnvelope>) {
    (
        StatusCode::CREATED,
        Json(ApiCreatedEnvelope { id, error: None }),
    )
}

pub fn error_response(code: ApiErrorCode, message: impl Into<String>) -> ApiErrorTuple {
    error_response_with_details(code, message, None)
}

pub fn error_response_with_details(
    code: ApiErrorCode,
    message: impl Into<String>,
    details: Option<Value>,
) -> ApiErrorTuple {
    (
        code.default_status(),
        Json(ApiErrorResponse {
            error: ApiErrorDetail {
                code: code.as_str(),
                message: message.into(),
                details,
            },
        }),
    )
}

pub fn validation_error(message: impl Into<String>) -> ApiErrorTuple {
    error_response(ApiErrorCode::Validation, message)
}

pub fn not_found_error(message: impl Into<String>) -> ApiErrorTuple {
    error_response(ApiErrorCode::NotFound, message)
}

pub fn query_error(message: impl Into<String>, reason: Option<&str>) -> ApiErrorTuple {
    error_response_with_details(
        ApiErrorCode::Query,
        message,
        reason.map(|reason| serde_json::json!({ "reason": reason })),
    )
}

pub fn internal_error(message: impl Into<String>) -> ApiErrorTuple {
    error_response(ApiErrorCode::Internal, message)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiErrorMatrixEntry {
    pub code: &'static str,
    pub status: u16,
    pub kind: &'static str,
}

const API_ERROR_MATRIX: [ApiErrorMatrixEntry; 13] = [
    ApiErrorMatrixEntry {
        code: "E_VALIDATION",
        status: 400,
        kind: "validation",
    },
    ApiErrorMatrixEntry {
        code: "E_SIZE",
        status: 413,
        kind: "size-exceeded",
    },
    ApiErrorMatrixEntry {
        code: "E_MIME",
        status: 415,
        kind: "validation",
    },
    ApiErrorMatrixEntry {
        code: "E_NOT_FOUND",
        status: 404,
        kind: "not-found",
    },
    ApiErrorMatrixEntry {
        code: "E_CONFLICT",
        status: 409,
        kind: "conflict",
    },
    ApiErrorMatrixEntry {
        code: "E_NO_API_KEY",
        status: 401,
        kind: "unauthorized",
    },
    ApiErrorMatrixEntry {
        code: "E_INVALID_API_KEY",
        status: 401,
        kind: "unauthorized",
    },
    ApiErrorMatrixEntry {
        code: "E_FORBIDDEN",
        status: 403,
        kind: "forbidden",
    },
    ApiErrorMatrixEntry {
        code: "E_IP_DENY",
        status: 403,
        kind: "forbidden",
    },
    ApiErrorMatrixEntry {
        code: "E_QUERY",
        status: 400,
        kind: "query-invalid",
    },
    ApiErrorMatrixEntry {
        code: "E_FTS_UNAVAILABLE",
        status: 503,
        kind: "search-unavailable",
    },
    ApiErrorMatrixEntry {
        code: "E_DB",
        status: 500,
        kind: "internal",
    },
    ApiErrorMatrixEntry {
        code: "E_INTERNAL",
        status: 500,
        kind: "internal",
    },
];

pub fn api_error_matrix() -> &'static [ApiErrorMatrixEntry] {
    &API_ERROR_MATRIX
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_CODES: [ApiErrorCode; 13] = [
        ApiErrorCode::Validation,
        ApiErrorCode::Size,
        ApiErrorCode::Mime,
        ApiErrorCode::NotFound,
        ApiErrorCode::Conflict,
        ApiErrorCode::NoApiKey,
        ApiErrorCode::InvalidApiKey,
        ApiErrorCode::Forbidden,
        ApiErrorCode::IpDenied,
        ApiErrorCode::Query,
        ApiErrorCode::FtsUnavailable,
        ApiErrorCode::Database,
        ApiErrorCode::Internal,
    ];

    #[test]
    fn error_matrix_codes_are_unique() {
        let mut codes = std::collections::HashSet::new();
        for row in api_error_matrix() {
            assert!(
                codes.insert(row.code),
                "duplicate error code in matrix: {}",
                row.code
            );
        }
    }

    #[test]
    fn error_matrix_agrees_with_code_table() {
        for code in ALL_CODES {
            let row = api_error_matrix()
                .iter()
                .find(|row| row.code == code.as_str())
                .expect("matrix row for every code");
            assert_eq!(row.status, code.default_status().as_u16());
        }
    }

    #[test]
    fn error_body_carries_code_message_and_details() {
        let (status, payload) = query_error("Invalid search query", Some("unclosed quote"));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let body = serde_json::to_value(payload.0).expect("serialize payload");
        assert_eq!(body["error"]["code"], "E_QUERY");
        assert_eq!(body["error"]["message"], "Invalid search query");
        assert_eq!(body["error"]["details"]["reason"], "unclosed quote");

        let (_status, payload) = not_found_error("Not found");
        let body = serde_json::to_value(payload.0).expect("serialize payload");
        assert!(body["error"].get("details").is_none());
    }

    #[test]
    fn ok_data_wraps_payload_with_null_error() {
        let (_status, payload) = ok_data_with_meta(
            serde_json::json!([1, 2]),
            Some(serde_json::json!({"count": 2})),
        );
        let body = serde_json::to_value(payload.0).expect("serialize payload");
        assert_eq!(body["data"][1], 2);
        assert_eq!(body["meta"]["count"], 2);
        assert!(body["error"].is_null());

        let (status, payload) = created(7);
        assert_eq!(status, StatusCode::CREATED);
        let body = serde_json::to_value(payload.0).expect("serialize payload");
        assert_eq!(body["id"], 7);
        assert!(body["error"].is_null());
    }
}
