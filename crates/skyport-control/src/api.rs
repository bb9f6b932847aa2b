use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    middleware,
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use skyport_model::{Instance, Node, PowerAction, User, Workflow};

use crate::{
    audit,
    auth::{AuthUser, require_admin},
    error::{ApiError, ControlError},
    fleet::{ConfigureNodeRequest, CreateNodeRequest},
    node_health::SweepReport,
    orchestrator::{DeployRequest, PurgeReport, RedeployRequest},
    reconcile::ReconcileTask,
    relay,
    request_meta::{self, RequestMeta},
    scheduler::JobInfo,
    state::AppState,
};

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    reconciliations: usize,
    workflow_jobs: usize,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthzResponse> {
    let reconciliations = state.reconciler.list().await.map(|t| t.len()).unwrap_or(0);
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        reconciliations,
        workflow_jobs: state.scheduler.list().await.len(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    scope: Option<String>,
}

async fn list_instances(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    auth: AuthUser,
    Query(q): Query<ListQuery>,
) -> ApiResult<Vec<Instance>> {
    let run = async {
        let user = state.current_user(&auth).await?;
        if q.scope.as_deref() == Some("all") {
            require_admin(&user)?;
            return state.registry.list_all_instances().await;
        }
        state.registry.list_user_instances(&user.id).await
    };
    run.await.map(Json).map_err(meta.fail())
}

async fn deploy_instance(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    auth: AuthUser,
    Json(req): Json<DeployRequest>,
) -> ApiResult<Instance> {
    let run = async {
        require_admin(&state.current_user(&auth).await?)?;
        state.orchestrator.deploy(req).await
    };
    let instance = run.await.map_err(meta.fail())?;
    audit::record(
        &meta,
        &auth,
        "instance.deploy",
        &instance.id,
        Some(serde_json::json!({ "node": instance.node.id, "user": instance.user })),
    );
    Ok(Json(instance))
}

async fn get_instance(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Instance> {
    let run = async {
        let user = state.current_user(&auth).await?;
        state.guard.authorize(&user, &id).await?;
        state.registry.require_instance(&id).await
    };
    run.await.map(Json).map_err(meta.fail())
}

async fn delete_instance(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Instance> {
    let run = async {
        require_admin(&state.current_user(&auth).await?)?;
        state.orchestrator.delete(&id).await
    };
    let instance = run.await.map_err(meta.fail())?;
    audit::record(&meta, &auth, "instance.delete", &id, None);
    Ok(Json(instance))
}

async fn redeploy_instance(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    auth: AuthUser,
    Path(id): Path<String>,
    Json(req): Json<RedeployRequest>,
) -> ApiResult<Instance> {
    let run = async {
        require_admin(&state.current_user(&auth).await?)?;
        state.orchestrator.redeploy(&id, req).await
    };
    let instance = run.await.map_err(meta.fail())?;
    audit::record(
        &meta,
        &auth,
        "instance.redeploy",
        &id,
        Some(serde_json::json!({ "container": instance.container_id })),
    );
    Ok(Json(instance))
}

async fn reinstall_instance(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Instance> {
    let run = async {
        let user = state.current_user(&auth).await?;
        state.guard.authorize_active(&user, &id).await?;
        state.orchestrator.reinstall(&id).await
    };
    let instance = run.await.map_err(meta.fail())?;
    audit::record(&meta, &auth, "instance.reinstall", &id, None);
    Ok(Json(instance))
}

#[derive(Debug, Serialize)]
struct PowerResponse {
    action: PowerAction,
    node_status: u16,
}

async fn power_instance(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    auth: AuthUser,
    Path((id, action)): Path<(String, String)>,
) -> ApiResult<PowerResponse> {
    let run = async {
        let action: PowerAction = action
            .parse()
            .map_err(|msg: String| ControlError::parameter("action", msg))?;
        let user = state.current_user(&auth).await?;
        let instance = state.guard.authorize_active(&user, &id).await?;
        let node_status = state.orchestrator.power(&instance, action).await?;
        Ok::<_, ControlError>(PowerResponse {
            action,
            node_status,
        })
    };
    let resp = run.await.map_err(meta.fail())?;
    audit::record(&meta, &auth, "instance.power", &id, Some(serde_json::json!({ "action": resp.action })));
    Ok(Json(resp))
}

async fn set_suspension(
    state: &AppState,
    meta: &RequestMeta,
    auth: &AuthUser,
    id: &str,
    suspended: bool,
) -> ApiResult<Instance> {
    let run = async {
        require_admin(&state.current_user(auth).await?)?;
        state.orchestrator.set_suspended(id, suspended).await
    };
    let instance = run.await.map_err(meta.fail())?;
    let action = if suspended {
        "instance.suspend"
    } else {
        "instance.unsuspend"
    };
    audit::record(meta, auth, action, id, None);
    Ok(Json(instance))
}

async fn suspend_instance(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Instance> {
    set_suspension(&state, &meta, &auth, &id, true).await
}

async fn unsuspend_instance(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Instance> {
    set_suspension(&state, &meta, &auth, &id, false).await
}

#[derive(Debug, Deserialize)]
struct RenameRequest {
    name: String,
}

async fn rename_instance(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    auth: AuthUser,
    Path(id): Path<String>,
    Json(req): Json<RenameRequest>,
) -> ApiResult<Instance> {
    let run = async {
        let user = state.current_user(&auth).await?;
        state.guard.authorize_active(&user, &id).await?;
        state.orchestrator.rename(&id, &req.name).await
    };
    let instance = run.await.map_err(meta.fail())?;
    audit::record(&meta, &auth, "instance.rename", &id, Some(serde_json::json!({ "name": instance.name })));
    Ok(Json(instance))
}

async fn get_workflow(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Workflow> {
    let run = async {
        let user = state.current_user(&auth).await?;
        state.guard.authorize(&user, &id).await?;
        state
            .registry
            .get_workflow(&id)
            .await?
            .ok_or_else(|| ControlError::not_found(format!("workflow for {id}")))
    };
    run.await.map(Json).map_err(meta.fail())
}

async fn put_workflow(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    auth: AuthUser,
    Path(id): Path<String>,
    Json(workflow): Json<Workflow>,
) -> ApiResult<JobInfo> {
    let run = async {
        let user = state.current_user(&auth).await?;
        state.guard.authorize_active(&user, &id).await?;
        state.scheduler.save(&id, &workflow).await
    };
    let job = run.await.map_err(meta.fail())?;
    audit::record(
        &meta,
        &auth,
        "workflow.save",
        &id,
        Some(serde_json::json!({ "every_minutes": job.every_minutes })),
    );
    Ok(Json(job))
}

#[derive(Debug, Serialize)]
struct Removed {
    removed: bool,
}

async fn delete_workflow(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Removed> {
    let run = async {
        let user = state.current_user(&auth).await?;
        state.guard.authorize_active(&user, &id).await?;
        state.scheduler.remove(&id).await
    };
    run.await.map_err(meta.fail())?;
    audit::record(&meta, &auth, "workflow.delete", &id, None);
    Ok(Json(Removed { removed: true }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrantRequest {
    user_id: String,
}

async fn grant_access(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    auth: AuthUser,
    Path(id): Path<String>,
    Json(req): Json<GrantRequest>,
) -> ApiResult<User> {
    let run = async {
        let user = state.current_user(&auth).await?;
        state.guard.authorize_active(&user, &id).await?;
        state.guard.grant_access(&req.user_id, &id).await
    };
    let user = run.await.map_err(meta.fail())?;
    audit::record(&meta, &auth, "access.grant", &id, Some(serde_json::json!({ "user": user.id })));
    Ok(Json(user))
}

async fn revoke_access(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    auth: AuthUser,
    Path((id, user_id)): Path<(String, String)>,
) -> ApiResult<User> {
    let run = async {
        let user = state.current_user(&auth).await?;
        state.guard.authorize_owner(&user, &id).await?;
        state.guard.revoke_access(&user_id, &id).await
    };
    let user = run.await.map_err(meta.fail())?;
    audit::record(&meta, &auth, "access.revoke", &id, Some(serde_json::json!({ "user": user.id })));
    Ok(Json(user))
}

async fn list_nodes(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    auth: AuthUser,
) -> ApiResult<Vec<Node>> {
    let run = async {
        require_admin(&state.current_user(&auth).await?)?;
        state.health.probe_all().await?;
        state.registry.list_nodes().await
    };
    run.await.map(Json).map_err(meta.fail())
}

async fn create_node(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    auth: AuthUser,
    Json(req): Json<CreateNodeRequest>,
) -> ApiResult<Node> {
    let run = async {
        require_admin(&state.current_user(&auth).await?)?;
        state.fleet.create_node(req).await
    };
    let node = run.await.map_err(meta.fail())?;
    audit::record(&meta, &auth, "node.create", &node.id, None);
    Ok(Json(node))
}

async fn delete_node(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Removed> {
    let run = async {
        require_admin(&state.current_user(&auth).await?)?;
        state.fleet.delete_node(&id).await
    };
    run.await.map_err(meta.fail())?;
    audit::record(&meta, &auth, "node.delete", &id, None);
    Ok(Json(Removed { removed: true }))
}

async fn purge_node(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<PurgeReport> {
    let run = async {
        require_admin(&state.current_user(&auth).await?)?;
        state.orchestrator.purge_node(&id).await
    };
    let report = run.await.map_err(meta.fail())?;
    audit::record(
        &meta,
        &auth,
        "node.purge",
        &id,
        Some(serde_json::json!({ "removed": report.removed_instances.len() })),
    );
    Ok(Json(report))
}

// Called by the node agent during provisioning; the one-time key is the credential.
async fn configure_node(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Path(id): Path<String>,
    Json(req): Json<ConfigureNodeRequest>,
) -> ApiResult<Node> {
    let mut node = state
        .fleet
        .configure_node(&id, req)
        .await
        .map_err(meta.fail())?;
    node.api_key = None;
    Ok(Json(node))
}

async fn sweep_fleet(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    auth: AuthUser,
) -> ApiResult<SweepReport> {
    let run = async {
        require_admin(&state.current_user(&auth).await?)?;
        state.health.sweep().await
    };
    let report = run.await.map_err(meta.fail())?;
    audit::record(
        &meta,
        &auth,
        "fleet.sweep",
        "*",
        Some(serde_json::json!({ "suspended": report.suspended })),
    );
    Ok(Json(report))
}

async fn list_reconciliations(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    auth: AuthUser,
) -> ApiResult<Vec<ReconcileTask>> {
    let run = async {
        require_admin(&state.current_user(&auth).await?)?;
        state.reconciler.list().await
    };
    run.await.map(Json).map_err(meta.fail())
}

async fn cancel_reconciliation(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Removed> {
    let run = async {
        require_admin(&state.current_user(&auth).await?)?;
        state.reconciler.cancel(&id).await
    };
    let removed = run.await.map_err(meta.fail())?;
    audit::record(&meta, &auth, "reconcile.cancel", &id, None);
    Ok(Json(Removed { removed }))
}

async fn list_jobs(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    auth: AuthUser,
) -> ApiResult<Vec<JobInfo>> {
    let run = async {
        require_admin(&state.current_user(&auth).await?)?;
        Ok::<_, ControlError>(state.scheduler.list().await)
    };
    run.await.map(Json).map_err(meta.fail())
}

pub fn router(state: AppState) -> Router {
    let instances = Router::new()
        .route("/", get(list_instances).post(deploy_instance))
        .route("/:id", get(get_instance).delete(delete_instance))
        .route("/:id/redeploy", post(redeploy_instance))
        .route("/:id/reinstall", post(reinstall_instance))
        .route("/:id/power/:action", post(power_instance))
        .route("/:id/suspend", post(suspend_instance))
        .route("/:id/unsuspend", post(unsuspend_instance))
        .route("/:id/rename", post(rename_instance))
        .route(
            "/:id/workflow",
            get(get_workflow).put(put_workflow).delete(delete_workflow),
        )
        .route("/:id/access", post(grant_access))
        .route("/:id/access/:user_id", delete(revoke_access));

    let nodes = Router::new()
        .route("/", get(list_nodes).post(create_node))
        .route("/:id", delete(delete_node))
        .route("/:id/purge", post(purge_node))
        .route("/:id/configure", post(configure_node));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api/instances", instances)
        .nest("/api/nodes", nodes)
        .route("/api/fleet/sweep", post(sweep_fleet))
        .route("/api/reconciliations", get(list_reconciliations))
        .route("/api/reconciliations/:id", delete(cancel_reconciliation))
        .route("/api/workflows/jobs", get(list_jobs))
        .route("/ws/instances/:id/console", get(relay::console_ws))
        .route("/ws/instances/:id/stats", get(relay::stats_ws))
        .layer(middleware::from_fn(request_meta::request_id))
        .with_state(state)
}
