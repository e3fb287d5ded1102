//! HTTP server implementation
//!
//! Uses hyper http1 with TokioIo for async handling. Every service is built
//! once into [`AppState`] and shared by all connections.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::config::Args;
use crate::dashboard::DashboardService;
use crate::kpi::{KpiService, StatsAggregator, StatusLedger};
use crate::members::MemberDirectory;
use crate::metrics::MetricsService;
use crate::notify::{Mailer, NotificationDispatcher, PushHub, ReminderScheduler};
use crate::routes;
use crate::server::websocket;
use crate::store::EntityStore;
use crate::types::BarracksError;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub store: Arc<dyn EntityStore>,
    /// 'mongodb' or 'memory'
    pub storage_kind: &'static str,
    pub push: Arc<PushHub>,
    pub stats: Arc<StatsAggregator>,
    pub ledger: Arc<StatusLedger>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub kpis: Arc<KpiService>,
    pub members: Arc<MemberDirectory>,
    pub dashboard: Arc<DashboardService>,
    pub metrics: Arc<MetricsService>,
    pub reminders: Arc<ReminderScheduler>,
    pub started_at: Instant,
}

impl AppState {
    /// Wire every service over `store` and `mailer`
    ///
    /// Background tasks are not started; call [`AppState::start_background`].
    pub fn new(
        args: Args,
        store: Arc<dyn EntityStore>,
        storage_kind: &'static str,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        let push = Arc::new(PushHub::new(args.heartbeat_interval()));
        let stats = Arc::new(StatsAggregator::new(
            Arc::clone(&store),
            args.stats_config(),
        ));
        let ledger = Arc::new(StatusLedger::new(Arc::clone(&store), Arc::clone(&stats)));
        let dispatcher = Arc::new(NotificationDispatcher::new(
            mailer,
            Arc::clone(&store),
            Arc::clone(&push),
            args.dispatch_config(),
        ));
        let kpis = Arc::new(KpiService::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            Arc::clone(&stats),
            Arc::clone(&dispatcher),
        ));
        let members = Arc::new(MemberDirectory::new(
            Arc::clone(&store),
            Arc::clone(&stats),
            Arc::clone(&dispatcher),
        ));
        let dashboard = Arc::new(DashboardService::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
        ));
        let metrics = Arc::new(MetricsService::new(Arc::clone(&store)));
        let reminders = Arc::new(ReminderScheduler::new(
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            args.reminder_interval(),
        ));

        Self {
            args,
            store,
            storage_kind,
            push,
            stats,
            ledger,
            dispatcher,
            kpis,
            members,
            dashboard,
            metrics,
            reminders,
            started_at: Instant::now(),
        }
    }

    /// Start the push heartbeat, stats sweeper and reminder scheduler
    pub async fn start_background(&self) {
        self.push.start().await;
        self.stats.start().await;
        self.reminders.start().await;
        info!("Background tasks started (heartbeat, stats sweeper, reminders)");
    }

    pub async fn stop_background(&self) {
        self.reminders.stop().await;
        self.stats.stop().await;
        self.push.stop().await;
        info!("Background tasks stopped");
    }
}

/// Accept connections until the listener fails to bind
pub async fn run(state: Arc<AppState>) -> Result<(), BarracksError> {
    let listener = TcpListener::bind(state.args.listen).await?;

    info!(
        "Barracks listening on {} (storage: {})",
        state.args.listen, state.storage_kind
    );

    if state.args.dev_mode {
        warn!("Development mode enabled - emails are logged, not sent");
    }

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .serve_connection(io, service)
                        .with_upgrades()
                        .await
                    {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route incoming HTTP requests
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!("[{}] {} {}", addr, method, path);

    let response = match (method, path.as_str()) {
        // Liveness check
        (Method::GET, "/health") | (Method::GET, "/healthz") => {
            to_boxed(routes::health_check(Arc::clone(&state)).await)
        }

        // Version info for deployment verification
        (Method::GET, "/version") => to_boxed(routes::version_info()),

        // Push feed
        (Method::GET, "/ws") => to_boxed(websocket::handle_push_upgrade(Arc::clone(&state), req).await),

        // CORS preflight
        (Method::OPTIONS, _) => to_boxed(preflight_response()),

        (_, p) if p == "/api/kpis" || p.starts_with("/api/kpis/") => {
            to_boxed(routes::handle_kpi_request(req, Arc::clone(&state), p).await)
        }
        (_, p) if p.starts_with("/api/statuses/") => {
            to_boxed(routes::handle_status_request(req, Arc::clone(&state), p).await)
        }
        (_, p) if p.starts_with("/api/me/") => {
            to_boxed(routes::handle_me_request(req, Arc::clone(&state), p).await)
        }
        (_, p) if p.starts_with("/api/dashboard/") => {
            to_boxed(routes::handle_dashboard_request(req, Arc::clone(&state), p).await)
        }
        (_, p) if p.starts_with("/api/metrics/") => {
            to_boxed(routes::handle_metrics_request(req, Arc::clone(&state), p).await)
        }
        (_, p) if p.starts_with("/api/notifications/") => {
            to_boxed(routes::handle_notification_request(req, Arc::clone(&state), p).await)
        }
        (_, p) if p == "/api/users" || p.starts_with("/api/users/") => {
            to_boxed(routes::handle_user_request(req, Arc::clone(&state), p).await)
        }

        _ => to_boxed(not_found_response(&path)),
    };

    Ok(response)
}

/// Convert a Full<Bytes> body to BoxBody
fn to_boxed(response: Response<Full<Bytes>>) -> Response<BoxBody> {
    response.map(|body| body.map_err(|never| match never {}).boxed())
}

/// CORS preflight response
fn preflight_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Headers", "*")
        .header(
            "Access-Control-Allow-Methods",
            "GET, POST, PUT, DELETE, OPTIONS",
        )
        .body(Full::new(Bytes::new()))
        .unwrap()
}

/// Not found response
fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "error": "Not Found",
        "path": path,
        "hint": "API routes live under /api; push feed at /ws"
    });

    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}
