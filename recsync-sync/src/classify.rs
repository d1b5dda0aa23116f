//! Map a remote response to the outcome of one attempt.

use recsync_core::config::EndpointConfig;
use recsync_core::{Action, TableSpec};
use serde_json::Value;

use crate::error::UnitError;
use crate::remote::ApiResponse;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    /// 2xx with a usable remote id.
    Accepted { remote_id: String },
    /// 4xx on an update whose target no longer exists remotely.
    StaleReference { status: u16, detail: String },
    /// Any other 4xx.
    Rejected { status: u16, detail: String },
    /// 2xx whose body carried no usable id.
    Unusable { detail: String },
    /// Network failure, 5xx, or a request that was never sent.
    Transient { detail: String },
}

impl Attempt {
    /// Final per-unit result. A `StaleReference` that reaches here was not
    /// recovered and counts as a rejection.
    pub fn into_result(self) -> Result<String, UnitError> {
        match self {
            Attempt::Accepted { remote_id } => Ok(remote_id),
            Attempt::StaleReference { status, detail } => {
                Err(UnitError::RemoteRejected { status, detail })
            }
            Attempt::Rejected { status, detail } => Err(UnitError::RemoteRejected { status, detail }),
            Attempt::Unusable { detail } => Err(UnitError::InvalidResponse(detail)),
            Attempt::Transient { detail } => Err(UnitError::RemoteTransient(detail)),
        }
    }
}

/// `known_remote_id` is the id an `Update` was sent for; an update that
/// succeeds without echoing an id keeps it.
pub fn classify(
    action: Action,
    known_remote_id: Option<&str>,
    response: &ApiResponse,
    endpoints: &EndpointConfig,
    table: &TableSpec,
) -> Attempt {
    if response.is_success() {
        let returned = response
            .data
            .as_ref()
            .and_then(|data| extract_id(data, &endpoints.id_field))
            .filter(|id| !table.is_sentinel(id));
        return match (returned, action, known_remote_id) {
            (Some(remote_id), _, _) => Attempt::Accepted { remote_id },
            (None, Action::Update, Some(known)) if !table.is_sentinel(known) => Attempt::Accepted {
                remote_id: known.trim().to_owned(),
            },
            _ => Attempt::Unusable {
                detail: format!(
                    "HTTP {} without a usable '{}' in the response",
                    response.status_code, endpoints.id_field
                ),
            },
        };
    }

    let detail = response.detail();
    if response.is_client_error() {
        if action == Action::Update && looks_stale(response.status_code, &detail, endpoints) {
            return Attempt::StaleReference {
                status: response.status_code,
                detail,
            };
        }
        return Attempt::Rejected {
            status: response.status_code,
            detail,
        };
    }
    Attempt::Transient { detail }
}

fn looks_stale(status: u16, detail: &str, endpoints: &EndpointConfig) -> bool {
    if status == 404 {
        return true;
    }
    let detail = detail.to_lowercase();
    endpoints
        .not_found_markers
        .iter()
        .any(|marker| !marker.is_empty() && detail.contains(&marker.to_lowercase()))
}

/// The id under `field` at the top level, or inside a `data` envelope.
fn extract_id(data: &Value, field: &str) -> Option<String> {
    let value = data
        .get(field)
        .or_else(|| data.get("data").and_then(|inner| inner.get(field)))?;
    match value {
        Value::String(s) => Some(s.trim().to_owned()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn endpoints() -> EndpointConfig {
        serde_json::from_value(json!({
            "create": {"method": "POST", "path": "/w"},
            "update": {"method": "PUT", "path": "/w/{id}"},
        }))
        .expect("endpoints")
    }

    fn table() -> TableSpec {
        serde_json::from_value(json!({
            "table": "widget", "primary_key": "vid", "remote_id": "aid",
        }))
        .expect("table")
    }

    fn run(action: Action, known: Option<&str>, response: ApiResponse) -> Attempt {
        classify(action, known, &response, &endpoints(), &table())
    }

    #[test]
    fn success_with_id() {
        assert_eq!(
            run(Action::Create, None, ApiResponse::ok(201, Some(json!({"id": 42})))),
            Attempt::Accepted { remote_id: "42".into() }
        );
        assert_eq!(
            run(Action::Create, None, ApiResponse::ok(200, Some(json!({"data": {"id": "x9"}})))),
            Attempt::Accepted { remote_id: "x9".into() }
        );
    }

    #[test]
    fn update_success_without_id_keeps_known() {
        assert_eq!(
            run(Action::Update, Some("5"), ApiResponse::ok(204, None)),
            Attempt::Accepted { remote_id: "5".into() }
        );
    }

    #[test]
    fn create_success_without_id_or_with_sentinel_is_unusable() {
        assert!(matches!(
            run(Action::Create, None, ApiResponse::ok(200, Some(json!({"ok": true})))),
            Attempt::Unusable { .. }
        ));
        assert!(matches!(
            run(Action::Create, None, ApiResponse::ok(200, Some(json!({"id": 0})))),
            Attempt::Unusable { .. }
        ));
    }

    #[test]
    fn stale_update_detection() {
        assert!(matches!(
            run(Action::Update, Some("5"), ApiResponse::failed(404, "gone")),
            Attempt::StaleReference { status: 404, .. }
        ));
        assert!(matches!(
            run(Action::Update, Some("5"), ApiResponse::failed(400, "Widget Not Found")),
            Attempt::StaleReference { status: 400, .. }
        ));
        // Creates are never stale.
        assert!(matches!(
            run(Action::Create, None, ApiResponse::failed(404, "not found")),
            Attempt::Rejected { status: 404, .. }
        ));
    }

    #[test]
    fn other_client_errors_are_rejections() {
        assert_eq!(
            run(Action::Update, Some("5"), ApiResponse::failed(422, "title required")),
            Attempt::Rejected { status: 422, detail: "title required".into() }
        );
    }

    #[test]
    fn server_and_transport_errors_are_transient() {
        for status in [0, 500, 503, 504] {
            assert!(matches!(
                run(Action::Create, None, ApiResponse::failed(status, "x")),
                Attempt::Transient { .. }
            ));
        }
    }

    #[test]
    fn results_map_to_unit_errors() {
        assert_eq!(Attempt::Accepted { remote_id: "1".into() }.into_result(), Ok("1".into()));
        assert!(matches!(
            Attempt::Transient { detail: "x".into() }.into_result(),
            Err(UnitError::RemoteTransient(_))
        ));
        assert!(matches!(
            Attempt::StaleReference { status: 404, detail: "x".into() }.into_result(),
            Err(UnitError::RemoteRejected { status: 404, .. })
        ));
        assert_eq!(
            Attempt::StaleReference { status: 400, detail: "Widget Not Found".into() }.into_result(),
            Err(UnitError::RemoteRejected { status: 400, detail: "Widget Not Found".into() })
        );
    }
}
