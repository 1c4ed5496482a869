//! Startup configuration: CLI flags layered over environment variables, following the
//! teacher's `clap`-derive shape (its `main.rs` parses a `Cli` via
//! `Cli::command().get_matches()`/`Cli::from_arg_matches`). Unlike the teacher's
//! `AppConfig` (read from an `.ini` file because the daemon has no long-lived process
//! supervisor to hand it flags), this service is expected to run under one, so flags +
//! env (`clap`'s `env` feature) replace the file.

use std::net::SocketAddr;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(version, about = "Collaborative text-document editing backend.")]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "COEDIT_BIND_ADDR", default_value = "127.0.0.1:8080")]
    pub bind_addr: SocketAddr,

    /// Redis URL backing the pub/sub bus, inbound queue, and processing lease. When
    /// unset, all three run in-memory, single-process only — fine for local
    /// development, not for a multi-process deployment.
    #[arg(long, env = "COEDIT_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Emit debug-level logs.
    #[arg(long, env = "COEDIT_DEBUG")]
    pub debug: bool,
}

impl Cli {
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// The runtime configuration downstream modules depend on, separate from argument
/// parsing itself — mirrors the teacher's `AppConfig`/CLI split.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub redis_url: Option<String>,
}

impl From<&Cli> for AppConfig {
    fn from(cli: &Cli) -> Self {
        Self {
            bind_addr: cli.bind_addr,
            redis_url: cli.redis_url.clone(),
        }
    }
}

impl AppConfig {
    #[must_use]
    pub const fn uses_redis(&self) -> bool {
        self.redis_url.is_some()
    }
}
