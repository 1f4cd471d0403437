//! # baton-conductor
//!
//! The conductor sits between an interactive client (an editor or an
//! orchestration script) and an AI agent process, optionally interposing an
//! ordered chain of proxies between them. From the client's perspective the
//! whole pipeline looks like a single agent on stdin/stdout.
//!
//! ```text
//! Client ← stdio → Conductor → Proxy 1 → ... → Proxy N → Agent
//! ```
//!
//! The conductor:
//!
//! 1. Connects every component up front (child processes over stdio, or
//!    in-process channels when embedded)
//! 2. Drives the `initialize` handshake, offering each proxy the
//!    successor-wrapping contract via `_meta.proxy`
//! 3. Routes every frame through one ordered queue, rewriting request ids so
//!    each hop has its own id space
//! 4. Bridges in-process MCP tool servers (`acp:` URLs in `session/new`)
//!    to the agent as ordinary MCP-over-HTTP servers on localhost
//!
//! ## Usage
//!
//! ```bash
//! # Zero or more proxy commands followed by the agent command:
//! baton-conductor run "python guard-proxy.py" "python agent.py"
//! ```
//!
//! Any component exiting, closing its channel, or emitting an unparseable
//! frame brings the whole pipeline down with a non-zero exit; the client
//! closing stdin is a normal shutdown.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::Instrument;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod conductor;

pub use conductor::Conductor;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct ConductorArgs {
    /// Log filter (e.g. "debug" or "baton_conductor=trace").
    /// Overrides the RUST_LOG and BATON_LOG environment variables.
    #[arg(long)]
    pub log: Option<String>,

    #[command(subcommand)]
    pub command: ConductorCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConductorCommand {
    /// Run a pipeline of proxy commands in front of an agent command
    Run {
        /// Name used in diagnostics
        #[arg(short, long, default_value = "conductor")]
        name: String,

        /// Component command lines: zero or more proxies followed by the agent
        components: Vec<String>,
    },
}

impl ConductorArgs {
    /// Entry point: set up tracing, then run the conductor on stdio.
    pub async fn main(self) -> anyhow::Result<()> {
        let pid = std::process::id();

        // Log level: --log beats BATON_LOG beats RUST_LOG.
        let log_level = self
            .log
            .clone()
            .or_else(|| std::env::var("BATON_LOG").ok())
            .or_else(|| std::env::var("RUST_LOG").ok());
        let env_filter = match &log_level {
            Some(level) => EnvFilter::new(level),
            None => EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("baton_conductor=info")),
        };

        // BATON_LOG also switches on file logging so stderr stays quiet when
        // the conductor runs under an editor.
        if std::env::var("BATON_LOG").is_ok() {
            let home = std::env::var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("."));
            let log_dir = home.join(".baton");
            std::fs::create_dir_all(&log_dir)?;
            let file_appender = tracing_appender::rolling::daily(log_dir, "logs");

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(true)
                        .with_writer(file_appender),
                )
                .init();
        } else {
            // Stdout carries the protocol; diagnostics always go to stderr.
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(true)
                        .with_writer(std::io::stderr),
                )
                .init();
        }

        tracing::info!(pid, level = ?log_level, "conductor starting");

        self.run()
            .instrument(tracing::info_span!("conductor", pid))
            .await
            .map_err(|err| anyhow::anyhow!("{err}"))
    }

    async fn run(self) -> Result<(), baton::Error> {
        match self.command {
            ConductorCommand::Run { name, components } => {
                if components.is_empty() {
                    return Err(baton::Error::invalid_params()
                        .with_data("expected at least an agent command"));
                }
                let mut conductor = Conductor::new(name);
                for line in &components {
                    conductor =
                        conductor.with_component(baton::ChildProcess::from_command_line(line)?);
                }
                conductor.run(baton::Stdio).await
            }
        }
    }
}
