use salvo::prelude::*;
use serde_json::json;

use crate::bridge::provisioning::{LinkRequest, ProvisioningError};
use crate::web::{render_error, web_state};

fn provisioning_status(err: &ProvisioningError) -> StatusCode {
    match err {
        ProvisioningError::InvalidTarget
        | ProvisioningError::KindMismatch
        | ProvisioningError::DirectMessagesDisabled => StatusCode::BAD_REQUEST,
        ProvisioningError::UnknownLocalChannel(_) | ProvisioningError::NotFound(_) => {
            StatusCode::NOT_FOUND
        }
        ProvisioningError::AlreadyLinked => StatusCode::CONFLICT,
        ProvisioningError::Local(_) => StatusCode::BAD_GATEWAY,
        ProvisioningError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[handler]
pub async fn list_links(res: &mut Response) {
    match web_state().bridge.provisioning().list().await {
        Ok(links) => {
            res.render(Json(json!({
                "links": links,
                "count": links.len(),
            })));
        }
        Err(err) => render_error(res, provisioning_status(&err), &err.to_string()),
    }
}

#[handler]
pub async fn create_link(req: &mut Request, res: &mut Response) {
    let request = match req.parse_json::<LinkRequest>().await {
        Ok(request) if !request.local_channel_id.trim().is_empty() => request,
        Ok(_) => {
            render_error(res, StatusCode::BAD_REQUEST, "missing local_channel_id");
            return;
        }
        Err(err) => {
            render_error(res, StatusCode::BAD_REQUEST, &format!("invalid link request: {err}"));
            return;
        }
    };

    match web_state().bridge.provisioning().create(&request).await {
        Ok(link) => {
            res.status_code(StatusCode::CREATED);
            res.render(Json(json!({ "ok": true, "link": link })));
        }
        Err(err) => render_error(res, provisioning_status(&err), &err.to_string()),
    }
}

#[handler]
pub async fn delete_link(req: &mut Request, res: &mut Response) {
    let link_id = match req.param::<String>("id") {
        Some(id) if !id.is_empty() => id,
        _ => {
            render_error(res, StatusCode::BAD_REQUEST, "invalid link id");
            return;
        }
    };

    match web_state().bridge.provisioning().unlink(&link_id).await {
        Ok(link) => res.render(Json(json!({ "ok": true, "link": link }))),
        Err(err) => render_error(res, provisioning_status(&err), &err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_mistakes_are_not_server_errors() {
        assert_eq!(
            provisioning_status(&ProvisioningError::AlreadyLinked),
            StatusCode::CONFLICT
        );
        assert_eq!(
            provisioning_status(&ProvisioningError::NotFound("l1".to_string())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            provisioning_status(&ProvisioningError::InvalidTarget),
            StatusCode::BAD_REQUEST
        );
    }
}
