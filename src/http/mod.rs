//! Minimal admin/submission HTTP surface.
//!
//! This is not the "front end" `spec.md` places out of scope as a
//! collaborator — it is the same kind of thin `axum` binding a local
//! developer or the load-test harness uses to poke the engine directly,
//! documented with `utoipa` the way the rest of the ambient stack is
//! kept observable. It owns no business logic: every handler is a
//! direct call into [`crate::supervisor::Supervisor`] or
//! [`crate::persistence::PersistenceAdapter`].

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

use crate::cache::CacheIndex;
use crate::model::{GraphNode, TaskGraph, Workflow, WorkflowId, WorkflowOptions, WorkflowStatus};
use crate::persistence::{PersistenceAdapter, StoreError};
use crate::supervisor::{Supervisor, SupervisorError};

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub persistence: Arc<dyn PersistenceAdapter>,
}

/// Body of `POST /workflows`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct SubmitRequest {
    pub source_reference: String,
    pub backend: String,
    pub root_output_location: String,
    #[serde(default)]
    pub labels: std::collections::BTreeMap<String, String>,
    /// Workflow input document (spec.md §3's typed input map). Not
    /// schema-checked here — that is the front end's job.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub inputs: serde_json::Map<String, serde_json::Value>,
    /// Pre-planned task graph (spec.md §1's external collaborator
    /// output). The admin surface accepts it already built rather than
    /// parsing a workflow document itself.
    #[schema(value_type = Vec<Object>)]
    pub graph: Vec<GraphNode>,
}

/// Response of `POST /workflows`: the engine has accepted the
/// submission, not that it has finished running.
#[derive(Debug, Serialize, ToSchema)]
pub struct SubmitAccepted {
    pub id: Uuid,
}

/// Response of `GET /workflows/{id}`.
#[derive(Debug, Serialize, ToSchema)]
pub struct WorkflowSummary {
    pub id: Uuid,
    pub source_reference: String,
    pub status: WorkflowStatus,
}

impl From<&Workflow> for WorkflowSummary {
    fn from(workflow: &Workflow) -> Self {
        Self {
            id: workflow.id.0,
            source_reference: workflow.source_reference.clone(),
            status: workflow.status,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("invalid task graph: {0}")]
    InvalidGraph(#[from] crate::model::GraphError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = match &self {
            HttpError::InvalidGraph(_) => StatusCode::BAD_REQUEST,
            HttpError::Supervisor(SupervisorError::UnknownBackend(_)) => StatusCode::BAD_REQUEST,
            HttpError::Supervisor(SupervisorError::ShuttingDown) => StatusCode::SERVICE_UNAVAILABLE,
            HttpError::Supervisor(SupervisorError::Engine(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            HttpError::Store(StoreError::WorkflowNotFound(_))
            | HttpError::Store(StoreError::CallNotFound(_)) => StatusCode::NOT_FOUND,
            HttpError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// `POST /workflows`
///
/// Builds the workflow, hands it to the supervisor, and returns as
/// soon as it is admitted — the supervisor drives it to completion in
/// the background. Poll `GET /workflows/{id}` for terminal status.
#[utoipa::path(
    post,
    path = "/workflows",
    request_body = SubmitRequest,
    responses(
        (status = 202, description = "workflow admitted", body = SubmitAccepted),
        (status = 400, description = "invalid graph or unknown backend"),
        (status = 503, description = "engine is shutting down"),
    ),
)]
async fn submit_workflow(
    State(state): State<AppState>,
    Json(body): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitAccepted>), HttpError> {
    let graph = TaskGraph::new(body.graph)?;
    let workflow = Workflow::new(
        body.source_reference,
        body.inputs,
        WorkflowOptions::default(),
        body.labels,
        body.root_output_location,
        body.backend.clone(),
    );
    let id = workflow.id;

    let supervisor = state.supervisor.clone();
    tokio::spawn(async move {
        if let Err(err) = supervisor.submit(workflow, graph, &body.backend).await {
            tracing::warn!(workflow_id = %id, error = %err, "workflow submission ended in error");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(SubmitAccepted { id: id.0 })))
}

/// `GET /workflows/{id}`
#[utoipa::path(
    get,
    path = "/workflows/{id}",
    responses(
        (status = 200, description = "workflow found", body = WorkflowSummary),
        (status = 404, description = "no such workflow"),
    ),
    params(("id" = Uuid, Path, description = "workflow id")),
)]
async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<WorkflowSummary>, HttpError> {
    let workflow = state.persistence.get_workflow(WorkflowId(id)).await?;
    Ok(Json(WorkflowSummary::from(&workflow)))
}

#[derive(OpenApi)]
#[openapi(
    paths(submit_workflow, get_workflow),
    components(schemas(SubmitRequest, SubmitAccepted, WorkflowSummary)),
    tags((name = "dagrunner-engine", description = "workflow admission and status"))
)]
pub struct ApiDoc;

/// Builds the admin router. `cache` is accepted but unused today beyond
/// keeping the signature symmetric with [`Supervisor::new`]'s
/// collaborators; it is here so a future `/cache` inspection route has
/// somewhere to land without reshaping this function's callers.
pub fn router(
    supervisor: Arc<Supervisor>,
    persistence: Arc<dyn PersistenceAdapter>,
    _cache: Arc<dyn CacheIndex>,
) -> Router {
    let state = AppState {
        supervisor,
        persistence,
    };
    Router::new()
        .route("/workflows", post(submit_workflow))
        .route("/workflows/:id", get(get_workflow))
        .with_state(state)
}
