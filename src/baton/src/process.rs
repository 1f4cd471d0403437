//! Child-process components spoken to over stdio.

use std::process::Stdio;

use futures::future;

use crate::connector::{Channel, Connector, IoFuture};
use crate::transport::{read_frames, write_frames};
use crate::Error;

/// A component spawned as a child process, exchanging frames over its
/// stdin/stdout. Stderr is inherited so the child's diagnostics land next to
/// the conductor's own. The child is killed when the connection is dropped.
#[derive(Debug, Clone)]
pub struct ChildProcess {
    program: String,
    args: Vec<String>,
}

impl ChildProcess {
    pub fn new(program: impl ToString, args: impl IntoIterator<Item = impl ToString>) -> Self {
        ChildProcess {
            program: program.to_string(),
            args: args.into_iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Parse a whitespace-separated command line, e.g. `"python agent.py --verbose"`.
    pub fn from_command_line(line: &str) -> Result<Self, Error> {
        let mut words = line.split_whitespace();
        let program = words
            .next()
            .ok_or_else(|| Error::invalid_params().with_data("empty component command line"))?;
        Ok(ChildProcess::new(program, words))
    }
}

impl Connector for ChildProcess {
    fn connect(self: Box<Self>) -> Result<(Channel, IoFuture), Error> {
        tracing::debug!(program = %self.program, args = ?self.args, "spawning component");
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                Error::internal_error()
                    .with_data(format!("failed to spawn `{}`: {err}", self.program))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::internal_error().with_data("child has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::internal_error().with_data("child has no stdout"))?;

        let (near, far) = Channel::duplex();
        let driver = async move {
            // Holding the child here ties its lifetime to the connection;
            // kill_on_drop reaps it when the conductor tears down.
            let _child = child;
            future::try_join(read_frames(stdout, far.tx), write_frames(far.rx, stdin)).await?;
            Ok(())
        };
        Ok((near, Box::pin(driver)))
    }
}
