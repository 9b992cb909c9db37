//! hupcheck-host: serves one toy server over the bridge on stdin/stdout.
//!
//! # Usage
//!
//! ```bash
//! hupcheck-host --server thread-pool --cookie-file /tmp/cookie \
//!     --state-dir /tmp/state --variant pidfile --workers 4
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use hupcheck::bridge::{Dispatcher, ServeOutcome};
use hupcheck::config::DEFAULT_WORKERS;
use hupcheck::{HookKind, ServerKind};
use hupcheck_host::{ProtocolHandler, Server, bridge_file, registry, variants};

#[derive(Parser, Debug)]
#[command(name = "hupcheck-host")]
#[command(about = "Serve a toy protocol server over the hupcheck bridge")]
struct Args {
    /// Server variant (simple, event, thread, process, thread-pool, process-pool)
    #[arg(long)]
    server: ServerKind,

    /// File holding this generation's cookie
    #[arg(long)]
    cookie_file: PathBuf,

    /// Bookkeeping hook to enable (repeatable)
    #[arg(long = "variant")]
    variants: Vec<HookKind>,

    /// Directory for pid and lock files
    #[arg(long, default_value = ".")]
    state_dir: PathBuf,

    /// Pool size for pool variants
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,
}

fn main() -> anyhow::Result<()> {
    hupcheck::init_tracing();
    let args = Args::parse();

    let handler = ProtocolHandler::from_file(&args.cookie_file)
        .with_context(|| format!("reading cookie from {}", args.cookie_file.display()))?;
    tracing::info!(
        pid = std::process::id(),
        server = %args.server,
        cookie = handler.cookie(),
        variants = ?args.variants,
        "Host starting"
    );

    let server = Arc::new(Server::new(args.server, handler, args.workers));
    let hooks = variants::hooks(&args.variants, &args.state_dir);

    let reader = bridge_file(std::io::stdin()).context("duplicating stdin")?;
    let writer = bridge_file(std::io::stdout()).context("duplicating stdout")?;

    let outcome = Dispatcher::new(registry(), Arc::clone(&server))
        .with_hooks(hooks)
        .serve(reader, writer)
        .context("bridge dispatch failed")?;

    match outcome {
        ServeOutcome::EndOfStream => {
            server.close().context("closing server")?;
            tracing::info!("Bridge closed, host exiting");
            Ok(())
        }
        ServeOutcome::Retired => {
            // The next generation owns the bridge; keep serving existing
            // connections until the restart tool or a signal ends us.
            tracing::info!("Retired, serving remaining connections");
            loop {
                std::thread::park();
            }
        }
    }
}
