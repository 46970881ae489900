use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    if let Some(resp) = handlers::core::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::passes::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::queue::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::changes::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::exports::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::schedule::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::setup::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::backgrounds::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::backup::try_handle(state, &req) {
        return resp;
    }

    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
