//! Entry point: parse CLI flags, refuse to run unprivileged, wire up the
//! Engine, and drive it to completion.

use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd::Uid;
use purecvisor_engine::config::EngineConfig;
use purecvisor_engine::engine::Engine;
use std::sync::Arc;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if !Uid::effective().is_root() {
        eprintln!("purecvisord must run as root (libvirt/ZFS operations require it)");
        std::process::exit(1);
    }

    // A client disconnecting mid-write would otherwise kill the process
    // with SIGPIPE; the response writer already handles a dead socket as
    // an ordinary I/O error.
    unsafe {
        if let Err(e) = signal::signal(Signal::SIGPIPE, SigHandler::SigIgn) {
            eprintln!("failed to ignore SIGPIPE: {}", e);
            std::process::exit(1);
        }
    }

    let config = EngineConfig::from_args();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    let engine = Arc::new(Engine::new(config));
    if let Err(e) = runtime.block_on(engine.run()) {
        log::error!("engine exited with error: {}", e);
        std::process::exit(1);
    }
}
