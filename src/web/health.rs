use salvo::prelude::*;
use serde_json::json;

use crate::web::web_state;

#[handler]
pub async fn health_check(res: &mut Response) {
    res.render("OK");
}

/// Ready once the workers run and until shutdown begins.
#[handler]
pub async fn readiness_check(res: &mut Response) {
    if web_state().bridge.is_ready() {
        res.render("OK");
    } else {
        res.status_code(StatusCode::SERVICE_UNAVAILABLE);
        res.render("NOT READY");
    }
}

#[handler]
pub async fn get_status(res: &mut Response) {
    let state = web_state();
    let uptime_seconds = state.started_at.elapsed().as_secs();
    let linked = state
        .db_manager
        .link_store()
        .list()
        .await
        .map(|links| links.len())
        .ok();

    res.render(Json(json!({
        "status": if state.bridge.is_accepting() { "running" } else { "stopping" },
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime_seconds,
        "linked_conversations": linked,
    })));
}
