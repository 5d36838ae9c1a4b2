//! Line-oriented command driver
//!
//! Lets an external controller drive the provisioner over a pipe: one JSON
//! command per input line, one JSON outcome per output line. Commands run
//! concurrently; each gets its own child of the shutdown token, and a
//! command cancelled by shutdown still rolls back and reports before
//! `serve` returns.

use crate::provisioner::rollback::CLEANUP_DEADLINE;
use crate::provisioner::Provisioner;
use crate::shutdown::ShutdownCoordinator;
use isilon_common::{VolumeClaimRequest, VolumeDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A request from the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Command {
    Provision { request: VolumeClaimRequest },
    Delete { descriptor: VolumeDescriptor },
}

impl Command {
    /// Volume name the command is about
    pub fn name(&self) -> &str {
        match self {
            Command::Provision { request } => &request.volume_name,
            Command::Delete { descriptor } => &descriptor.name,
        }
    }
}

/// Result reported back to the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    Provisioned {
        descriptor: VolumeDescriptor,
        annotations: BTreeMap<String, String>,
    },
    Deleted {
        name: String,
    },
    /// Not ours, or never fully provisioned: do not retry, do not alarm
    Ignored {
        name: String,
        reason: String,
    },
    Failed {
        name: String,
        error: String,
        retryable: bool,
    },
}

/// Run one command to completion
pub async fn execute(provisioner: &Provisioner, command: Command, cancel: &CancellationToken) -> Outcome {
    let name = command.name().to_string();

    let result = match command {
        Command::Provision { request } => provisioner
            .provision(&request, cancel)
            .await
            .map(|descriptor| Outcome::Provisioned {
                annotations: descriptor.annotations(),
                descriptor,
            }),
        Command::Delete { descriptor } => provisioner
            .delete(&descriptor, cancel)
            .await
            .map(|()| Outcome::Deleted { name: name.clone() }),
    };

    match result {
        Ok(outcome) => outcome,
        Err(e) if e.is_ignorable() => {
            info!(volume = %name, reason = %e, "Ignoring volume");
            Outcome::Ignored {
                name,
                reason: e.to_string(),
            }
        }
        Err(e) => {
            error!(volume = %name, error = %e, root_cause = %e.root_cause(), "Operation failed");
            Outcome::Failed {
                name,
                retryable: e.is_retryable(),
                error: e.to_string(),
            }
        }
    }
}

async fn write_outcome<W: AsyncWrite + Unpin>(output: &mut W, outcome: &Outcome) -> std::io::Result<()> {
    let mut line = serde_json::to_string(outcome)?;
    line.push('\n');
    output.write_all(line.as_bytes()).await?;
    output.flush().await
}

/// Extra time in-flight commands get to roll back once they are cancelled
const CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Read commands from `input` until EOF or shutdown, writing outcomes to
/// `output`. Returns the number of commands handled.
///
/// Commands still running when input ends get the shutdown timeout to
/// finish. After that, or right away on shutdown, they are cancelled and
/// given time to roll back, so every command gets an outcome line.
pub async fn serve<R, W>(
    provisioner: Arc<Provisioner>,
    input: R,
    mut output: W,
    shutdown: ShutdownCoordinator,
) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(input).lines();
    let mut tasks: JoinSet<Outcome> = JoinSet::new();
    let stop = shutdown.subscribe();
    // Parent of every command token; cancelled by shutdown or by a drain timeout
    let in_flight = shutdown.subscribe();
    let mut handled = 0;

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                info!(in_flight = tasks.len(), "Shutdown requested, no longer accepting commands");
                break;
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                write_outcome(&mut output, &joined_outcome(joined)).await?;
                handled += 1;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }

                match serde_json::from_str::<Command>(&line) {
                    Ok(command) => {
                        let provisioner = provisioner.clone();
                        let cancel = in_flight.child_token();
                        tasks.spawn(async move { execute(&provisioner, command, &cancel).await });
                    }
                    Err(e) => {
                        warn!(error = %e, "Malformed command");
                        let outcome = Outcome::Failed {
                            name: String::new(),
                            error: format!("malformed command: {}", e),
                            retryable: false,
                        };
                        write_outcome(&mut output, &outcome).await?;
                        handled += 1;
                    }
                }
            }
        }
    }

    if drain(&mut tasks, &mut output, &mut handled, shutdown.timeout()).await? {
        return Ok(handled);
    }

    warn!(in_flight = tasks.len(), "In-flight operations did not finish in time, cancelling them");
    in_flight.cancel();
    if drain(&mut tasks, &mut output, &mut handled, CLEANUP_DEADLINE + CANCEL_GRACE).await? {
        return Ok(handled);
    }

    error!(in_flight = tasks.len(), "In-flight operations ignored cancellation, aborting them");
    tasks.abort_all();
    while let Some(joined) = tasks.join_next().await {
        write_outcome(&mut output, &joined_outcome(joined)).await?;
        handled += 1;
    }

    Ok(handled)
}

/// Report finished tasks until none are left or `limit` passes.
/// Returns whether every task finished.
async fn drain<W: AsyncWrite + Unpin>(
    tasks: &mut JoinSet<Outcome>,
    output: &mut W,
    handled: &mut usize,
    limit: Duration,
) -> std::io::Result<bool> {
    let deadline = Instant::now() + limit;
    while !tasks.is_empty() {
        match timeout_at(deadline, tasks.join_next()).await {
            Ok(Some(joined)) => {
                write_outcome(output, &joined_outcome(joined)).await?;
                *handled += 1;
            }
            Ok(None) => break,
            Err(_) => return Ok(false),
        }
    }
    Ok(true)
}

fn joined_outcome(joined: Result<Outcome, tokio::task::JoinError>) -> Outcome {
    joined.unwrap_or_else(|e| Outcome::Failed {
        name: String::new(),
        error: format!("operation aborted: {}", e),
        retryable: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::ProvisionerConfig;
    use isilon_common::ReclaimPolicy;

    fn provisioner(root: &std::path::Path) -> Arc<Provisioner> {
        let mut config = ProvisionerConfig::default();
        config.isilon.server = "isi".to_string();
        config.isilon.export_root = "/ifs/k8s".to_string();
        config.provisioner.mount_root = Some(root.to_path_buf());
        Arc::new(Provisioner::new(&config, Arc::new(MemoryBackend::new())))
    }

    fn request(name: &str) -> VolumeClaimRequest {
        VolumeClaimRequest {
            namespace: "ns".to_string(),
            claim_name: "claim".to_string(),
            volume_name: name.to_string(),
            capacity_bytes: Some(1 << 20),
            access_modes: vec![],
            reclaim_policy: ReclaimPolicy::Delete,
        }
    }

    #[test]
    fn test_command_wire_format() {
        let line = r#"{"action":"provision","request":{"namespace":"a","claim_name":"data","volume_name":"pv1","capacity_bytes":10}}"#;
        let command: Command = serde_json::from_str(line).unwrap();
        assert_eq!(command.name(), "pv1");
        match command {
            Command::Provision { request } => {
                assert_eq!(request.requested_capacity(), 10);
                assert_eq!(request.reclaim_policy, ReclaimPolicy::Delete);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_foreign_volume_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = provisioner(dir.path());
        let cancel = CancellationToken::new();

        let mut descriptor = match execute(
            &provisioner,
            Command::Provision { request: request("pv1") },
            &cancel,
        )
        .await
        {
            Outcome::Provisioned { descriptor, .. } => descriptor,
            other => panic!("unexpected outcome: {:?}", other),
        };
        descriptor.provisioner_identity = "someone-else".to_string();

        let outcome = execute(&provisioner, Command::Delete { descriptor }, &cancel).await;
        assert!(matches!(outcome, Outcome::Ignored { .. }));
    }

    #[tokio::test]
    async fn test_serve_handles_every_line() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = provisioner(dir.path());

        let mut input = String::new();
        for name in ["pv1", "pv2"] {
            let command = Command::Provision { request: request(name) };
            input.push_str(&serde_json::to_string(&command).unwrap());
            input.push('\n');
        }
        input.push_str("not json\n");

        let mut output = Vec::new();
        let handled = serve(
            provisioner,
            input.as_bytes(),
            &mut output,
            ShutdownCoordinator::new(),
        )
        .await
        .unwrap();
        assert_eq!(handled, 3);

        let outcomes: Vec<Outcome> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        let provisioned = outcomes
            .iter()
            .filter(|o| matches!(o, Outcome::Provisioned { .. }))
            .count();
        assert_eq!(provisioned, 2);
        assert!(outcomes
            .iter()
            .any(|o| matches!(o, Outcome::Failed { retryable: false, .. })));
    }
}
