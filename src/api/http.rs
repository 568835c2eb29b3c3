//! Read-only HTTP surface over [`ExperimentQueryApi`] (feature `server`).
//!
//! | method | path                          | returns                          |
//! |--------|-------------------------------|----------------------------------|
//! | GET    | `/executions`                 | execution names                  |
//! | GET    | `/executions/:name/runs`      | run records, declaration order   |
//! | GET    | `/runs/:run_id`               | one run record                   |
//! | GET    | `/runs/:run_id/predictions`   | run record plus predictions      |
//! | POST   | `/select`                     | best run and leaderboard         |
//!
//! Repository reads are blocking, so every handler hops onto the blocking
//! pool.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

use super::{ExperimentQueryApi, RunWithPredictions};
use crate::repository::RunRecord;
use crate::selector::{MetricCriterion, Selection, SelectionScope};
use crate::Error;

/// Error body returned by every route.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, format!("Not found: {msg}")),
            Error::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            other => {
                error!(detail = %other, "query failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": true, "message": message }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// Body of `POST /select`.
#[derive(Debug, Clone, Deserialize)]
pub struct SelectRequest {
    /// Candidate runs
    #[serde(flatten)]
    pub scope: SelectionScope,
    /// Ranking metrics
    pub criteria: Vec<MetricCriterion>,
    /// Truncate the leaderboard
    #[serde(default)]
    pub limit: Option<usize>,
}

async fn blocking<T, F>(api: Arc<ExperimentQueryApi>, f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&ExperimentQueryApi) -> crate::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&api))
        .await
        .map_err(|e| ApiError(Error::Other(format!("query task failed: {e}"))))?
        .map(Json)
        .map_err(ApiError)
}

async fn list_executions(State(api): State<Arc<ExperimentQueryApi>>) -> ApiResult<Vec<String>> {
    blocking(api, ExperimentQueryApi::list_executions).await
}

async fn list_runs(
    State(api): State<Arc<ExperimentQueryApi>>,
    Path(name): Path<String>,
) -> ApiResult<Vec<RunRecord>> {
    blocking(api, move |api| api.list_runs(&name)).await
}

async fn get_run(
    State(api): State<Arc<ExperimentQueryApi>>,
    Path(run_id): Path<String>,
) -> ApiResult<RunRecord> {
    blocking(api, move |api| api.get_run(&run_id)).await
}

async fn get_predictions(
    State(api): State<Arc<ExperimentQueryApi>>,
    Path(run_id): Path<String>,
) -> ApiResult<RunWithPredictions> {
    blocking(api, move |api| api.get_run_with_predictions(&run_id)).await
}

async fn select(
    State(api): State<Arc<ExperimentQueryApi>>,
    Json(request): Json<SelectRequest>,
) -> ApiResult<Selection> {
    blocking(api, move |api| {
        let mut selection = api.select(&request.scope, &request.criteria)?;
        if let (Selection::Selected { leaderboard, .. }, Some(limit)) = (&mut selection, request.limit) {
            leaderboard.truncate(limit);
        }
        Ok(selection)
    })
    .await
}

/// Router with every query route.
pub fn router(api: Arc<ExperimentQueryApi>) -> Router {
    Router::new()
        .route("/executions", get(list_executions))
        .route("/executions/:name/runs", get(list_runs))
        .route("/runs/:run_id", get(get_run))
        .route("/runs/:run_id/predictions", get(get_predictions))
        .route("/select", post(select))
        .with_state(api)
}

/// Serve the query routes on `addr` until ctrl+c.
///
/// # Errors
///
/// Fails if the address cannot be parsed or bound.
pub async fn serve(api: ExperimentQueryApi, addr: &str) -> crate::Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::InvalidInput(format!("bind address '{addr}': {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "query server listening");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install ctrl+c handler");
        }
        info!("shutdown signal received");
    };
    axum::serve(listener, router(Arc::new(api)))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("query server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::RunRepository;
    use crate::runner::EngineContext;
    use crate::selector::Direction;
    use crate::storage::TabularStore;

    fn api() -> Arc<ExperimentQueryApi> {
        let context = EngineContext::in_memory(Arc::new(TabularStore::default()));
        for (id, rmse) in [("r1", 1.2), ("r2", 0.9), ("r3", 1.0)] {
            context
                .repository
                .append(
                    RunRecord::builder(id, "sweep", format!("exp-{id}"))
                        .store_context("A")
                        .metric("val.rmse", rmse)
                        .build(),
                )
                .unwrap();
        }
        Arc::new(ExperimentQueryApi::new(context))
    }

    #[test]
    fn test_select_request_parses_flattened_scope() {
        let request: SelectRequest = serde_json::from_str(
            r#"{"execution_name": "sweep",
                "criteria": [{"metric_name": "val.rmse", "direction": "minimize"}],
                "limit": 2}"#,
        )
        .unwrap();
        assert_eq!(request.scope, SelectionScope::execution("sweep"));
        assert_eq!(request.criteria[0].direction, Direction::Minimize);
        assert_eq!(request.limit, Some(2));
    }

    #[test]
    fn test_error_status_codes() {
        let not_found = ApiError(Error::NotFound("run 'x'".into())).into_response();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);
        let bad = ApiError(Error::InvalidInput("empty criteria".into())).into_response();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
        let internal = ApiError(Error::StorageError("disk".into())).into_response();
        assert_eq!(internal.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_handlers() {
        let api = api();
        let Json(names) = list_executions(State(api.clone())).await.unwrap();
        assert_eq!(names, vec!["sweep"]);

        let Json(runs) = list_runs(State(api.clone()), Path("sweep".to_string()))
            .await
            .unwrap();
        assert_eq!(runs.len(), 3);

        let missing = get_run(State(api.clone()), Path("nope".to_string())).await;
        assert!(matches!(missing, Err(ApiError(Error::NotFound(_)))));

        let request = SelectRequest {
            scope: SelectionScope::execution("sweep"),
            criteria: vec![MetricCriterion::minimize("val.rmse")],
            limit: Some(2),
        };
        let Json(selection) = select(State(api), Json(request)).await.unwrap();
        assert_eq!(selection.best().map(RunRecord::run_id), Some("r2"));
        assert_eq!(selection.leaderboard().len(), 2);
    }
}
