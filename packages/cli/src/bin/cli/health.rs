// ABOUTME: `corral health` reports gateway reachability, cluster version and capacity
// ABOUTME: An unreachable cluster is reported as a failing check rather than an error

use anyhow::{bail, Result};
use colored::*;

use corral_sandbox::SandboxManager;

use super::output;

const GIB: f64 = (1u64 << 30) as f64;

pub async fn handle_health_command(manager: &SandboxManager, json: bool) -> Result<()> {
    let health = manager.health_info().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&health)?);
    } else {
        let mut table = output::new_table();
        table.set_header(vec!["Check", "Value"]);
        table.add_row(vec!["Gateway".to_string(), health.gateway.clone()]);
        let connected = if health.cluster_connected {
            "connected".green()
        } else {
            "unreachable".red()
        };
        table.add_row(vec!["Cluster".to_string(), connected.to_string()]);
        table.add_row(vec![
            "Version".to_string(),
            health.cluster_version.clone().unwrap_or_else(|| "-".to_string()),
        ]);
        if let Some(capacity) = &health.capacity {
            table.add_row(vec!["Nodes".to_string(), capacity.nodes.to_string()]);
            table.add_row(vec![
                "CPU cores".to_string(),
                format!("{:.1}", capacity.cpu_cores),
            ]);
            table.add_row(vec![
                "Memory".to_string(),
                format!("{:.1} GiB", capacity.memory_bytes as f64 / GIB),
            ]);
            table.add_row(vec![
                "Running pods".to_string(),
                capacity.running_pods.to_string(),
            ]);
        }
        table.add_row(vec![
            "Active sessions".to_string(),
            health.active_sessions.to_string(),
        ]);
        if let Some(error) = &health.error {
            table.add_row(vec!["Error".to_string(), error.red().to_string()]);
        }
        println!("{}", table);
    }

    if !health.cluster_connected {
        bail!("cluster is unreachable");
    }
    Ok(())
}
