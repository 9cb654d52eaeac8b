//! Audit log read route

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    audit::AuditLogRecord,
    auth::AuthUser,
    error::ApiResult,
    routes::{require_member, Pagination},
    state::AppState,
};

#[derive(Debug, Default, Deserialize)]
pub struct AuditLogQuery {
    pub action: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_audit_logs(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(org_id): Path<Uuid>,
    Query(query): Query<AuditLogQuery>,
) -> ApiResult<Json<Vec<AuditLogRecord>>> {
    require_member(&state.pool, org_id, auth_user.user_id).await?;
    state
        .authz
        .authorize(auth_user.user_id, org_id, "audit.view")
        .await?;

    let (limit, offset) = Pagination {
        limit: query.limit,
        offset: query.offset,
    }
    .bounds();
    let records = state
        .audit
        .list(org_id, query.action.as_deref(), limit, offset)
        .await?;

    Ok(Json(records))
}
