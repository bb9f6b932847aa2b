use crate::{auth::AuthUser, request_meta::RequestMeta};

/// Fire-and-forget audit trail. Events go to the `audit` tracing target; shipping them
/// anywhere durable is the subscriber's concern.
pub fn record(
    meta: &RequestMeta,
    user: &AuthUser,
    action: &str,
    target: &str,
    detail: Option<serde_json::Value>,
) {
    let detail = detail.map(|d| d.to_string()).unwrap_or_default();
    tracing::info!(
        target: "audit",
        request_id = %meta.request_id,
        user_id = %user.user_id,
        action,
        target_id = target,
        detail = %detail,
        "audit event"
    );
}
