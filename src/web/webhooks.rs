use salvo::prelude::*;
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

use crate::bridge::IngestOutcome;
use crate::mattermost::LocalHookEvent;
use crate::msteams::NotificationBatch;
use crate::web::{render_error, token_matches, web_state};

const VALIDATION_TOKEN_PARAM: &str = "validationToken";

fn ingest_status(outcome: IngestOutcome) -> StatusCode {
    match outcome {
        IngestOutcome::Accepted(_) => StatusCode::ACCEPTED,
        IngestOutcome::Duplicate => StatusCode::OK,
        IngestOutcome::Unauthorized => StatusCode::UNAUTHORIZED,
        IngestOutcome::QueueFull => StatusCode::TOO_MANY_REQUESTS,
        IngestOutcome::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Answers a subscription validation handshake. Returns `true` when the
/// request was one.
fn echo_validation(req: &Request, res: &mut Response) -> bool {
    let Some(token) = req.query::<String>(VALIDATION_TOKEN_PARAM) else {
        return false;
    };
    res.status_code(StatusCode::OK);
    res.render(Text::Plain(token));
    true
}

async fn parse_body<T: DeserializeOwned>(req: &mut Request, res: &mut Response) -> Option<T> {
    let body = match req.payload().await {
        Ok(body) => body,
        Err(err) => {
            render_error(res, StatusCode::BAD_REQUEST, &format!("unreadable body: {err}"));
            return None;
        }
    };
    match serde_json::from_slice(body) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            debug!("malformed webhook body error={}", err);
            render_error(res, StatusCode::BAD_REQUEST, "malformed body");
            None
        }
    }
}

#[handler]
pub async fn changes_webhook(req: &mut Request, res: &mut Response) {
    if echo_validation(req, res) {
        return;
    }
    let Some(batch) = parse_body::<NotificationBatch>(req, res).await else {
        return;
    };

    match web_state().bridge.ingest_changes(batch).await {
        Ok(outcome) => res.status_code(ingest_status(outcome)),
        Err(err) => {
            error!("change ingest failed error={}", err);
            res.status_code(StatusCode::INTERNAL_SERVER_ERROR)
        }
    };
}

#[handler]
pub async fn lifecycle_webhook(req: &mut Request, res: &mut Response) {
    if echo_validation(req, res) {
        return;
    }
    let Some(batch) = parse_body::<NotificationBatch>(req, res).await else {
        return;
    };

    let status = match web_state().bridge.ingest_lifecycle(batch).await {
        Ok(IngestOutcome::Unauthorized) => StatusCode::UNAUTHORIZED,
        Ok(IngestOutcome::ShuttingDown) => StatusCode::SERVICE_UNAVAILABLE,
        Ok(_) => StatusCode::OK,
        Err(err) => {
            error!("lifecycle ingest failed error={}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    res.status_code(status);
}

/// Entry point for post and reaction events relayed by the local server.
/// The event is mirrored in the background; the relay only learns whether
/// it was accepted.
#[handler]
pub async fn local_hook(req: &mut Request, res: &mut Response) {
    let Some(event) = parse_body::<LocalHookEvent>(req, res).await else {
        return;
    };
    let bridge = &web_state().bridge;
    if !token_matches(event.token.as_deref(), bridge.hook_token()) {
        warn!("local hook rejected event={}", event.event.as_str());
        render_error(res, StatusCode::UNAUTHORIZED, "invalid hook token");
        return;
    }
    if !bridge.is_accepting() {
        res.status_code(StatusCode::SERVICE_UNAVAILABLE);
        return;
    }

    bridge.submit_local_event(event).await;
    res.status_code(StatusCode::OK);
}
