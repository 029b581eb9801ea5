//! RPC dispatcher: the method table, per-line request processing, and the
//! per-connection `tokio` task that frames reads and writes over
//! `tokio::net::UnixListener` with line-buffered I/O.

use crate::engine::Engine;
use crate::error::EngineResult;
use crate::handlers;
use crate::rpc::protocol::{self, ParseOutcome};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

pub type HandlerFuture = Pin<Box<dyn Future<Output = EngineResult<Value>> + Send>>;
pub type HandlerFn = fn(Arc<Engine>, Value, Arc<AtomicBool>) -> HandlerFuture;

/// Immutable, shared, read-mostly method-to-handler table, built once at
/// startup.
pub struct MethodTable {
    handlers: HashMap<&'static str, HandlerFn>,
}

impl MethodTable {
    pub fn new() -> Self {
        let mut handlers: HashMap<&'static str, HandlerFn> = HashMap::new();

        handlers.insert("ping", handlers::ping::handle);

        handlers.insert("vm.create", handlers::create::handle);
        handlers.insert("vm.start", handlers::start::handle);
        handlers.insert("vm.stop", handlers::stop::handle);
        handlers.insert("vm.delete", handlers::delete::handle);
        handlers.insert("vm.list", handlers::list::handle);
        handlers.insert("vm.metrics", handlers::metrics::handle);
        handlers.insert("vm.limit", handlers::hotplug::limit);
        handlers.insert("vm.set_memory", handlers::hotplug::set_memory);
        handlers.insert("vm.set_vcpu", handlers::hotplug::set_vcpu);

        handlers.insert("vm.snapshot.create", handlers::snapshot::create);
        handlers.insert("vm.snapshot.list", handlers::snapshot::list);
        handlers.insert("vm.snapshot.rollback", handlers::snapshot::rollback);
        handlers.insert("vm.snapshot.delete", handlers::snapshot::delete);

        handlers.insert("device.disk.attach", handlers::disk::attach);
        handlers.insert("device.disk.detach", handlers::disk::detach);

        handlers.insert("get_vnc_info", handlers::vnc::handle);

        handlers.insert("network.create", handlers::network::create);
        handlers.insert("network.delete", handlers::network::delete);

        handlers.insert("storage.pool.list", handlers::storage::pool_list);
        handlers.insert("storage.zvol.list", handlers::storage::zvol_list);
        handlers.insert("storage.zvol.create", handlers::storage::zvol_create);
        handlers.insert("storage.zvol.delete", handlers::storage::zvol_delete);

        MethodTable { handlers }
    }

    pub async fn dispatch(
        &self,
        engine: Arc<Engine>,
        method: &str,
        params: Value,
        client_alive: Arc<AtomicBool>,
    ) -> EngineResult<Value> {
        match self.handlers.get(method) {
            Some(handler) => handler(engine, params, client_alive).await,
            None => Err(crate::error::EngineError::MethodNotFound(method.to_string())),
        }
    }

    #[cfg(test)]
    pub fn is_routable(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }
}

impl Default for MethodTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Processes exactly one input line. Returns `None` for notifications (no
/// response is ever written), `Some(value)` otherwise (success or error,
/// always a single JSON object).
pub async fn process_line(
    engine: &Arc<Engine>,
    table: &MethodTable,
    line: &str,
    client_alive: Arc<AtomicBool>,
) -> Option<Value> {
    match protocol::parse_line(line) {
        ParseOutcome::Error { id, code, message } => {
            let id = id.unwrap_or(Value::Null);
            Some(protocol::error_response(&id, code, &message))
        }
        ParseOutcome::Request(req) => {
            let result = table
                .dispatch(engine.clone(), &req.method, req.params, client_alive)
                .await;
            req.id.map(|id| match result {
                Ok(value) => protocol::success_response(&id, value),
                Err(e) => protocol::error_response(&id, e.rpc_code(), &e.to_string()),
            })
        }
    }
}

/// Owns one client connection: reads line-framed requests, dispatches
/// them, and writes line-framed responses back, in the order each request
/// finished processing. A dead client (write failure) ends the connection
/// task quietly rather than panicking it.
pub async fn handle_connection(engine: Arc<Engine>, table: Arc<MethodTable>, stream: UnixStream) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let client_alive = Arc::new(AtomicBool::new(true));

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::debug!("connection read error: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        if let Some(response) = process_line(&engine, &table, &line, client_alive.clone()).await {
            let mut bytes = match serde_json::to_vec(&response) {
                Ok(b) => b,
                Err(e) => {
                    log::error!("failed to serialize response: {}", e);
                    continue;
                }
            };
            bytes.push(b'\n');
            if let Err(e) = writer.write_all(&bytes).await {
                log::debug!("client disconnected during write: {}", e);
                break;
            }
        }
    }

    client_alive.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_cataloged_method_routes() {
        let table = MethodTable::new();
        let methods = [
            "ping",
            "vm.create",
            "vm.start",
            "vm.stop",
            "vm.delete",
            "vm.list",
            "vm.metrics",
            "vm.limit",
            "vm.set_memory",
            "vm.set_vcpu",
            "vm.snapshot.create",
            "vm.snapshot.list",
            "vm.snapshot.rollback",
            "vm.snapshot.delete",
            "device.disk.attach",
            "device.disk.detach",
            "get_vnc_info",
            "network.create",
            "network.delete",
            "storage.pool.list",
            "storage.zvol.list",
            "storage.zvol.create",
            "storage.zvol.delete",
        ];
        for m in methods {
            assert!(table.is_routable(m), "{} should route", m);
        }
        assert!(!table.is_routable("vm.frobnicate"));
    }
}
