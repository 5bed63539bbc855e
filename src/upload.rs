//! Handler for the payroll upload endpoint.
//!
//! The host owns the listener and body buffering; this module turns one buffered request into
//! one JSON response and persists accepted uploads through an [`UploadStore`].

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::store::{StoreError, UploadStore};

pub const UPLOAD_PATH: &str = "/api/payroll/upload";

/// Keys a payroll record normally carries (employee number, name). Their absence is only logged.
pub const PAYROLL_KEY_FIELDS: [&str; 2] = ["사번", "성명"];

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("malformed JSON: {0}")]
    Malformed(String),
    #[error("payload is not an array")]
    NotAnArray,
    #[error("payload is empty")]
    Empty,
    #[error("unsupported content type")]
    UnsupportedContentType,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl UploadError {
    pub fn status(&self) -> u16 {
        match self {
            UploadError::Store(_) => 500,
            _ => 400,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    file_name: String,
    #[serde(default)]
    file_type: Option<String>,
    #[serde(default)]
    upload_date: Option<String>,
    data: Value,
}

/// A validated upload: a non-empty list of records, either row arrays or objects.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadPayload {
    pub file_name: Option<String>,
    pub file_type: Option<String>,
    pub upload_date: Option<String>,
    pub records: Vec<Value>,
}

impl UploadPayload {
    /// Accepts `{fileName, fileType, uploadDate, data}` or a bare array.
    pub fn parse(body: &str) -> Result<Self, UploadError> {
        let value: Value = serde_json::from_str(&sanitize_json(body))
            .map_err(|e| UploadError::Malformed(e.to_string()))?;

        let is_envelope = value
            .as_object()
            .is_some_and(|o| o.contains_key("fileName") && o.contains_key("data"));
        let (file_name, file_type, upload_date, data) = if is_envelope {
            let envelope: Envelope =
                serde_json::from_value(value).map_err(|e| UploadError::Malformed(e.to_string()))?;
            (
                Some(envelope.file_name),
                envelope.file_type,
                envelope.upload_date,
                envelope.data,
            )
        } else {
            (None, None, None, value)
        };

        let Value::Array(records) = data else {
            return Err(UploadError::NotAnArray);
        };
        if records.is_empty() {
            return Err(UploadError::Empty);
        }
        if !has_payroll_keys(&records[0]) {
            tracing::warn!(
                fields = ?PAYROLL_KEY_FIELDS,
                "first record has no payroll key field; accepting anyway"
            );
        }

        Ok(Self {
            file_name,
            file_type,
            upload_date,
            records,
        })
    }
}

fn has_payroll_keys(record: &Value) -> bool {
    match record {
        Value::Object(map) => PAYROLL_KEY_FIELDS.iter().any(|k| map.contains_key(*k)),
        Value::Array(cells) => cells
            .iter()
            .filter_map(Value::as_str)
            .any(|cell| PAYROLL_KEY_FIELDS.contains(&cell.trim())),
        _ => false,
    }
}

/// Make spreadsheet-exported JSON parseable: bare `NaN`, `undefined`, `Infinity` and
/// `-Infinity` values become `null` and trailing commas before `}`/`]` are dropped.
/// String contents are never touched.
pub fn sanitize_json(text: &str) -> String {
    const BARE: [&str; 4] = ["-Infinity", "Infinity", "NaN", "undefined"];

    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;

    while let Some(ch) = text[i..].chars().next() {
        let rest = &text[i..];
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            i += ch.len_utf8();
            continue;
        }

        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            ',' => {
                let next = rest[1..].trim_start().chars().next();
                if !matches!(next, Some('}' | ']')) {
                    out.push(ch);
                }
            }
            _ => {
                let bare = BARE.iter().find(|tok| {
                    rest.starts_with(**tok)
                        && !rest[tok.len()..]
                            .chars()
                            .next()
                            .is_some_and(|c| c.is_alphanumeric() || c == '_')
                });
                if let Some(tok) = bare {
                    out.push_str("null");
                    i += tok.len();
                    continue;
                }
                out.push(ch);
            }
        }
        i += ch.len_utf8();
    }
    out
}

/// One buffered request.
#[derive(Debug, Clone, Copy)]
pub struct ApiRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub content_type: Option<&'a str>,
    pub body: &'a [u8],
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "success": false, "error": message.into() }),
        }
    }
}

/// Route a request. Only the upload endpoint exists; everything else is 404.
pub async fn handle_api(store: &UploadStore, req: ApiRequest<'_>) -> ApiResponse {
    tracing::debug!(method = req.method, path = req.path, "api request");
    match (req.method, req.path) {
        ("OPTIONS", _) => ApiResponse {
            status: 200,
            body: Value::Null,
        },
        ("POST", UPLOAD_PATH) => match handle_upload(store, &req).await {
            Ok(body) => ApiResponse { status: 200, body },
            Err(e) => {
                tracing::warn!(error = %e, "upload rejected");
                ApiResponse::error(e.status(), e.to_string())
            }
        },
        _ => ApiResponse::error(404, "API endpoint not found"),
    }
}

async fn handle_upload(store: &UploadStore, req: &ApiRequest<'_>) -> Result<Value, UploadError> {
    let is_json = req
        .content_type
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("application/json"));
    if !is_json {
        return Err(UploadError::UnsupportedContentType);
    }
    let body =
        std::str::from_utf8(req.body).map_err(|e| UploadError::Malformed(e.to_string()))?;
    let payload = UploadPayload::parse(body)?;

    let records = Value::Array(payload.records);
    let saved = store.save(payload.file_name.as_deref(), &records).await?;
    Ok(json!({
        "success": true,
        "message": "upload succeeded",
        "recordCount": saved.record_count,
        "fileName": saved.file_name,
        "savedAt": saved.saved_at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
    }))
}
