// ABOUTME: `corral exec` runs one command in an environment's primary pod and waits for it
// ABOUTME: Relays captured stdout and stderr and hands back the remote exit code

use anyhow::Result;
use std::io::Write;
use tracing::debug;

use corral_sandbox::SandboxManager;

pub async fn handle_exec_command(
    manager: &SandboxManager,
    environment_id: &str,
    command: Vec<String>,
    timeout_secs: Option<u64>,
) -> Result<i32> {
    let result = manager
        .exec_sync(environment_id, command, timeout_secs)
        .await?;
    debug!(
        exit_code = result.exit_code,
        duration_ms = result.duration_ms,
        "Command finished"
    );

    let mut stdout = std::io::stdout();
    stdout.write_all(result.stdout.as_bytes())?;
    stdout.flush()?;
    let mut stderr = std::io::stderr();
    stderr.write_all(result.stderr.as_bytes())?;
    stderr.flush()?;

    Ok(exit_status(result.exit_code))
}

/// Clamp a remote exit code into the range a process can return
pub fn exit_status(code: i64) -> i32 {
    if (0..=255).contains(&code) {
        code as i32
    } else {
        1
    }
}
