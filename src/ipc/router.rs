use super::handlers;
use super::types::{AppState, Reply, Request};
use crate::ipc::error::{err, ok, ApiResult};
use serde_json::Value;
use tracing::debug;

fn dispatch(state: &mut AppState, req: &Request) -> Option<ApiResult<Reply>> {
    if let Some(resp) = handlers::core::try_handle(state, req) {
        return Some(resp);
    }
    if let Some(resp) = handlers::users::try_handle(state, req) {
        return Some(resp);
    }
    if let Some(resp) = handlers::classes::try_handle(state, req) {
        return Some(resp);
    }
    if let Some(resp) = handlers::reference::try_handle(state, req) {
        return Some(resp);
    }
    if let Some(resp) = handlers::timetable::try_handle(state, req) {
        return Some(resp);
    }
    if let Some(resp) = handlers::grades::try_handle(state, req) {
        return Some(resp);
    }
    if let Some(resp) = handlers::leave::try_handle(state, req) {
        return Some(resp);
    }
    if let Some(resp) = handlers::notifications::try_handle(state, req) {
        return Some(resp);
    }
    if let Some(resp) = handlers::feedback::try_handle(state, req) {
        return Some(resp);
    }
    None
}

pub fn handle_request(state: &mut AppState, req: Request) -> Value {
    debug!(id = %req.id, method = %req.method, "request");
    match dispatch(state, &req) {
        Some(Ok(reply)) => ok(&req.id, reply.status, reply.data, reply.pagination),
        Some(Err(e)) => e.response(&req.id, &req.method),
        None => err(
            &req.id,
            "not_implemented",
            404,
            format!("unknown method: {}", req.method),
        ),
    }
}
