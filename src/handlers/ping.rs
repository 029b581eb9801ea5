//! `ping`: zero-param liveness probe. Runs entirely on the event-loop
//! thread, no worker job, no lock.

use crate::engine::Engine;
use crate::rpc::dispatcher::HandlerFuture;
use serde_json::{json, Value};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub fn handle(_engine: Arc<Engine>, _params: Value, _alive: Arc<AtomicBool>) -> HandlerFuture {
    Box::pin(async move { Ok(json!("pong")) })
}
