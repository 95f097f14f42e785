use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use once_cell::sync::OnceCell;
use salvo::http::header::AUTHORIZATION;
use salvo::prelude::*;
use serde_json::json;
use tracing::info;

use crate::bridge::BridgeCore;
use crate::config::Config;
use crate::db::DatabaseManager;

mod health;
pub mod metrics;
mod provisioning;
mod webhooks;

use health::{get_status, health_check, readiness_check};
use metrics::{Metrics, metrics_endpoint};
use provisioning::{create_link, delete_link, list_links};
use webhooks::{changes_webhook, lifecycle_webhook, local_hook};

#[derive(Clone)]
pub struct WebState {
    pub db_manager: Arc<DatabaseManager>,
    pub bridge: Arc<BridgeCore>,
    pub started_at: Instant,
}

static WEB_STATE: OnceCell<WebState> = OnceCell::new();

pub fn web_state() -> &'static WebState {
    WEB_STATE
        .get()
        .expect("web state is not initialized before handler execution")
}

#[derive(Clone)]
pub struct WebServer {
    config: Arc<Config>,
}

impl WebServer {
    pub fn new(
        config: Arc<Config>,
        db_manager: Arc<DatabaseManager>,
        bridge: Arc<BridgeCore>,
    ) -> Result<Self> {
        let _ = WEB_STATE.set(WebState {
            db_manager,
            bridge,
            started_at: Instant::now(),
        });

        Ok(Self { config })
    }

    pub async fn start(&self) -> Result<()> {
        let bind_addr = format!(
            "{}:{}",
            self.config.bridge.bind_address, self.config.bridge.port
        );
        info!("starting web server on {}", bind_addr);

        let acceptor = TcpListener::new(bind_addr).bind().await;
        Server::new(acceptor).serve(root_router()).await;

        Ok(())
    }
}

pub fn root_router() -> Router {
    Router::new()
        .hoop(count_requests)
        .push(Router::with_path("health").get(health_check))
        .push(Router::with_path("ready").get(readiness_check))
        .push(Router::with_path("status").get(get_status))
        .push(Router::with_path("metrics").get(metrics_endpoint))
        .push(Router::with_path("changes").post(changes_webhook))
        .push(Router::with_path("lifecycle").post(lifecycle_webhook))
        .push(Router::with_path("hooks/local").post(local_hook))
        .push(
            Router::with_path("admin")
                .hoop(require_admin_token)
                .push(Router::with_path("links").get(list_links).post(create_link))
                .push(Router::with_path("links/{id}").delete(delete_link)),
        )
}

#[handler]
async fn count_requests(req: &mut Request, depot: &mut Depot, res: &mut Response, ctrl: &mut FlowCtrl) {
    Metrics::increment_http_requests();
    ctrl.call_next(req, depot, res).await;
    if res
        .status_code
        .is_some_and(|status| !status.is_success())
    {
        Metrics::increment_http_errors();
    }
}

#[handler]
async fn require_admin_token(req: &mut Request, res: &mut Response, ctrl: &mut FlowCtrl) {
    let presented = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token);
    if !token_matches(presented, web_state().bridge.hook_token()) {
        render_error(res, StatusCode::UNAUTHORIZED, "missing or invalid admin token");
        ctrl.skip_rest();
    }
}

pub(crate) fn render_error(res: &mut Response, status: StatusCode, message: &str) {
    res.status_code(status);
    res.render(Json(json!({ "error": message })));
}

fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|token| !token.is_empty())
}

/// Compares a presented secret without short-circuiting on the first
/// differing byte. An empty configured secret never matches.
pub(crate) fn token_matches(presented: Option<&str>, expected: &str) -> bool {
    let Some(presented) = presented else {
        return false;
    };
    if expected.is_empty() || presented.len() != expected.len() {
        return false;
    }
    presented
        .bytes()
        .zip(expected.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
