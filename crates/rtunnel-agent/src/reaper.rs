//! Stale-tunnel reaper
//!
//! A previous agent that died without closing its session can leave a process
//! on the relay host holding the remote port. Before binding a new listener we
//! run one remote command that finds and kills whatever owns the port.
//!
//! This is best effort. Finding nothing to kill is the normal case; any other
//! failure is reported to the caller as a warning and the bind proceeds anyway.

use rtunnel_transport::{CommandOutput, ControlSession, TransportError};
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur while reaping a port
#[derive(Error, Debug)]
pub enum ReapError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Reap command for port {port} failed (exit status {exit_status:?}): {output}")]
    CommandFailed {
        port: u16,
        exit_status: Option<u32>,
        output: String,
    },
}

/// Messages a shell prints when `kill` is run without a PID.
/// Matched against lowercased output since dash capitalises `Usage`.
const NOTHING_TO_KILL: &[&str] = &["not enough arguments", "kill: usage", "usage: kill"];

/// Remote command that finds and terminates the owner of a TCP port
///
/// The template must contain a `{port}` placeholder. It is expected to print
/// the PID it killed on stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReapCommand {
    template: String,
}

impl ReapCommand {
    /// Fails with status 127 when `lsof` is missing, so that case is never
    /// mistaken for an empty port.
    pub const DEFAULT_TEMPLATE: &'static str = "command -v lsof >/dev/null || { echo 'lsof: not found' >&2; exit 127; }; \
         pids=$(lsof -t -i tcp:{port} -s tcp:listen 2>/dev/null); echo $pids; kill $pids";

    pub fn new(template: impl Into<String>) -> Result<Self, String> {
        let template = template.into();
        if !template.contains("{port}") {
            return Err(format!(
                "Reap command '{}' must contain a {{port}} placeholder",
                template
            ));
        }
        Ok(Self { template })
    }

    pub fn render(&self, port: u16) -> String {
        self.template.replace("{port}", &port.to_string())
    }

    pub fn template(&self) -> &str {
        &self.template
    }
}

impl Default for ReapCommand {
    fn default() -> Self {
        Self {
            template: Self::DEFAULT_TEMPLATE.to_string(),
        }
    }
}

/// Kill whatever process holds `port` on the relay host.
///
/// Returns the killed PID, or `None` when nothing was bound to the port.
pub async fn clear_port<S: ControlSession>(
    session: &S,
    command: &ReapCommand,
    port: u16,
) -> Result<Option<u32>, ReapError> {
    let command = command.render(port);
    info!(port = port, relay = %session.remote_address(), "Reaping stale listener");

    let output = session.run_command(&command).await?;
    debug!(
        port = port,
        exit_status = ?output.exit_status,
        output = %output.combined().trim(),
        "Reap command finished"
    );

    let killed = interpret(port, &output)?;
    match killed {
        Some(pid) => info!(port = port, pid = pid, "Killed stale process holding port"),
        None => info!(port = port, "No stale process on port"),
    }
    Ok(killed)
}

fn interpret(port: u16, output: &CommandOutput) -> Result<Option<u32>, ReapError> {
    let pid = output
        .stdout
        .split_whitespace()
        .find(|token| token.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|token| token.parse::<u32>().ok());

    let failed = || ReapError::CommandFailed {
        port,
        exit_status: output.exit_status,
        output: output.combined().trim().to_string(),
    };

    if output.success() {
        return Ok(pid);
    }

    match pid {
        Some(_) => Err(failed()),
        None => {
            let combined = output.combined().to_ascii_lowercase();
            if NOTHING_TO_KILL.iter().any(|marker| combined.contains(marker)) {
                Ok(None)
            } else {
                Err(failed())
            }
        }
    }
}
