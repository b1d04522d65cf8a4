pub mod api;
pub mod config;
pub mod db;
pub mod engine;
pub mod notifications;

pub use db::DbPool;

use config::Config;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::api::auth::LoginTracker;
use crate::api::rate_limit::RateLimiter;
use crate::engine::AnalysisJob;
use crate::notifications::Mailer;

pub struct AppState {
    pub config: Config,
    pub db: DbPool,
    pub analysis_tx: mpsc::Sender<AnalysisJob>,
    pub rate_limiter: Arc<RateLimiter>,
    pub login_tracker: LoginTracker,
    pub mailer: Mailer,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(config: Config, db: DbPool, analysis_tx: mpsc::Sender<AnalysisJob>) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let login_tracker = LoginTracker::new(&config.auth);
        let mailer = Mailer::new(config.smtp.clone());
        Self {
            config,
            db,
            analysis_tx,
            rate_limiter,
            login_tracker,
            mailer,
            metrics_handle: None,
        }
    }

    /// Set the Prometheus metrics handle
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }
}
