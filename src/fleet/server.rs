use std::sync::Arc;
use std::sync::Weak;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use fleet_common::{ExecutorError, InstructionExecutor, Job, JobOutput, ProgressReporter};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::api::{self, AppState, SharedState};
use super::db::{DbHandle, FleetDb};
use super::logs::OutputSource;
use super::metrics::MetricsSource;
use super::sandbox::DockerSandbox;
use super::ws;
use crate::config::FleetConfig;

/// Runtime switches that come from the command line rather than the config
/// file.
#[derive(Debug, Clone, Default)]
pub struct ServeOptions {
    /// Skip Docker entirely; instructions fail as terminal.
    pub no_docker: bool,
    pub permissive_cors: bool,
}

/// Executor used when Docker is disabled or unreachable.
pub struct UnavailableExecutor {
    reason: String,
}

impl UnavailableExecutor {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait::async_trait]
impl InstructionExecutor for UnavailableExecutor {
    async fn execute(
        &self,
        _job: &Job,
        _progress: ProgressReporter,
    ) -> Result<JobOutput, ExecutorError> {
        Err(ExecutorError::terminal(format!(
            "no executor available: {}",
            self.reason
        )))
    }
}

/// Build the full application router with API and WebSocket routes.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Connect to Docker unless disabled and assemble the shared state.
pub async fn build_state(
    config: &FleetConfig,
    db: DbHandle,
    options: &ServeOptions,
) -> SharedState {
    if options.no_docker || !config.sandbox.enabled {
        tracing::warn!("docker disabled, instructions will fail until a sandbox is available");
        return AppState::new(
            config,
            db,
            Arc::new(UnavailableExecutor::new("docker disabled")),
            None,
            None,
        );
    }
    match DockerSandbox::connect(config.sandbox.clone()).await {
        Ok(sandbox) => {
            tracing::info!("connected to docker");
            let sandbox = Arc::new(sandbox);
            AppState::new(
                config,
                db,
                Arc::clone(&sandbox) as Arc<dyn InstructionExecutor>,
                Some(Arc::clone(&sandbox) as Arc<dyn OutputSource>),
                Some(sandbox as Arc<dyn MetricsSource>),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "docker unavailable, running without a sandbox");
            AppState::new(
                config,
                db,
                Arc::new(UnavailableExecutor::new(format!("{:#}", e))),
                None,
                None,
            )
        }
    }
}

/// Periodically sweep idle rate-limit entries until `token` is cancelled.
pub fn spawn_maintenance(state: &SharedState, token: CancellationToken) -> JoinHandle<()> {
    let weak: Weak<AppState> = Arc::downgrade(state);
    let every = state.limiter.config().sweep_interval;
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(state) = weak.upgrade() else { break };
                    let removed = state.limiter.sweep(tokio::time::Instant::now());
                    if removed > 0 {
                        tracing::debug!(removed, "swept idle rate-limit entries");
                    }
                }
            }
        }
    })
}

/// Stop background work and close every queue.
pub async fn shutdown(state: &SharedState) {
    state.queues.destroy_all(state.shutdown_grace).await;
    state.logs.shutdown();
    state.metrics.shutdown();
}

/// Start the fleet server and block until Ctrl+C.
pub async fn start_server(config: FleetConfig, options: ServeOptions) -> Result<()> {
    if let Some(parent) = config.server.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = FleetDb::new(&config.server.db_path).context("Failed to initialize fleet database")?;
    let db = DbHandle::new(db);

    let state = build_state(&config, db, &options).await;
    let maintenance = CancellationToken::new();
    let maintenance_task = spawn_maintenance(&state, maintenance.clone());
    let sweeper = state.logs.spawn_sweeper();

    let mut app = build_router(Arc::clone(&state));
    if options.permissive_cors {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    state.broadcaster.mark_ready();
    if let Err(e) = state.queues.recover().await {
        tracing::warn!(error = %e, "failed to recover queues from the previous run");
    }
    tracing::info!(%local_addr, "fleet server listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    maintenance.cancel();
    shutdown(&state).await;
    let _ = maintenance_task.await;
    let _ = sweeper.await;
    tracing::info!("server shut down gracefully");
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::models::QueueEvent;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn test_state() -> SharedState {
        let options = ServeOptions {
            no_docker: true,
            ..ServeOptions::default()
        };
        build_state(&FleetConfig::default(), DbHandle::in_memory().unwrap(), &options).await
    }

    #[tokio::test]
    async fn test_router_serves_health_and_ws_route() {
        let app = build_router(test_state().await);
        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // Without upgrade headers the ws route rejects the request.
        let resp = app
            .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn test_stats_endpoint() {
        let app = build_router(test_state().await);
        let resp = app
            .oneshot(Request::builder().uri("/api/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["connections"], 0);
        assert_eq!(body["logs"]["droppedTotal"], 0);
    }

    #[tokio::test]
    async fn test_unavailable_executor_fails_jobs_terminally() {
        let state = test_state().await;
        state.broadcaster.mark_ready();
        let queue = state.queues.queue("c1").await.unwrap();
        let mut events = queue.events().unwrap();
        queue
            .enqueue("hello", fleet_common::InstructionMode::Interactive, Default::default())
            .await
            .unwrap();

        let (will_retry, dead_letter, attempts_made) =
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    match events.recv().await {
                        Ok(QueueEvent::Failed {
                            will_retry,
                            dead_letter,
                            attempts_made,
                            ..
                        }) => return (will_retry, dead_letter, attempts_made),
                        Ok(_) => continue,
                        Err(e) => panic!("event stream ended: {}", e),
                    }
                }
            })
            .await
            .unwrap();
        assert!(!will_retry);
        assert!(!dead_letter);
        assert_eq!(attempts_made, 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_queues() {
        let state = test_state().await;
        state.queues.queue("c1").await.unwrap();
        assert_eq!(state.queues.active_queues().await, 1);
        shutdown(&state).await;
        assert_eq!(state.queues.active_queues().await, 0);
    }

    #[tokio::test]
    async fn test_maintenance_stops_on_cancel() {
        let state = test_state().await;
        let token = CancellationToken::new();
        let handle = spawn_maintenance(&state, token.clone());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
