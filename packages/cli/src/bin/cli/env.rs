// ABOUTME: `corral env` subcommands for declaring, inspecting, retrying and deleting environments
// ABOUTME: Translates command line flags into manager requests and renders the results

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use colored::*;
use std::collections::BTreeMap;
use std::path::PathBuf;

use corral_sandbox::{
    CreateEnvironmentRequest, DeletionOutcome, EnvironmentFilter, EnvironmentStatus,
    IsolationPolicy, NetworkPolicy, ResourceSpec, SandboxManager, StandbyPoolPolicy,
};

use super::output;

#[derive(Subcommand)]
pub enum EnvCommands {
    /// Declare a new environment
    Create(CreateArgs),
    /// List environments
    List {
        /// Only show environments in these statuses (repeatable)
        #[arg(long = "status")]
        statuses: Vec<String>,
        /// Label selector, e.g. "team=infra,tier=batch"
        #[arg(long)]
        selector: Option<String>,
        /// Only show environments owned by this principal
        #[arg(long)]
        owner: Option<String>,
        #[arg(long, default_value = "50")]
        limit: u32,
        #[arg(long, default_value = "0")]
        offset: u32,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show one environment
    Show {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Reset the retry budget of a failed or pending environment
    Retry { id: String },
    /// Delete an environment
    Delete {
        id: String,
        /// Tear down cluster resources now and remove the record
        #[arg(long)]
        force: bool,
    },
    /// Show the lifecycle event log of an environment
    Events {
        id: String,
        #[arg(long, default_value = "50")]
        limit: u32,
    },
}

#[derive(Args, Debug, Default)]
pub struct CreateArgs {
    /// Read the full declaration from a JSON file
    #[arg(long, conflicts_with_all = ["name", "image"])]
    pub from_file: Option<PathBuf>,

    #[arg(long, required_unless_present = "from_file")]
    pub name: Option<String>,

    #[arg(long, required_unless_present = "from_file")]
    pub image: Option<String>,

    /// CPU request, e.g. "500m" or "2"
    #[arg(long)]
    pub cpu: Option<String>,

    /// Memory request, e.g. "512Mi"
    #[arg(long)]
    pub memory: Option<String>,

    /// Ephemeral storage request, e.g. "1Gi"
    #[arg(long)]
    pub storage: Option<String>,

    /// Container runtime class for kernel-level isolation
    #[arg(long)]
    pub runtime_class: Option<String>,

    /// Block all outbound traffic
    #[arg(long)]
    pub deny_egress: bool,

    /// Keep this many warm standby pods for executions
    #[arg(long, default_value = "0")]
    pub pool_size: u32,

    /// Label as KEY=VALUE (repeatable)
    #[arg(long = "label", value_parser = parse_key_value)]
    pub labels: Vec<(String, String)>,

    /// Environment variable as KEY=VALUE (repeatable)
    #[arg(long = "env", value_parser = parse_key_value)]
    pub env_vars: Vec<(String, String)>,

    /// Principal recorded as the owner
    #[arg(long, default_value = "operator")]
    pub owner: String,
}

pub fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

/// Build the declaration from flags, or from a JSON file with the owner filled in when absent
pub fn build_create_request(args: &CreateArgs) -> Result<CreateEnvironmentRequest> {
    if let Some(path) = &args.from_file {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut value: serde_json::Value =
            serde_json::from_str(&raw).with_context(|| format!("Invalid JSON in {}", path.display()))?;
        let Some(object) = value.as_object_mut() else {
            bail!("{} must contain a JSON object", path.display());
        };
        object
            .entry("owner_id")
            .or_insert_with(|| serde_json::Value::String(args.owner.clone()));
        return serde_json::from_value(value)
            .with_context(|| format!("Invalid environment declaration in {}", path.display()));
    }

    let resources = if args.cpu.is_some() || args.memory.is_some() || args.storage.is_some() {
        let defaults = ResourceSpec::default();
        Some(ResourceSpec {
            cpu: args.cpu.clone().unwrap_or(defaults.cpu),
            memory: args.memory.clone().unwrap_or(defaults.memory),
            storage: args.storage.clone().unwrap_or(defaults.storage),
        })
    } else {
        None
    };

    let isolation = if args.runtime_class.is_some() || args.deny_egress {
        Some(IsolationPolicy {
            runtime_class: args.runtime_class.clone(),
            network_policy: args.deny_egress.then(|| NetworkPolicy {
                deny_egress: true,
                ..Default::default()
            }),
            ..Default::default()
        })
    } else {
        None
    };

    let standby_pool = (args.pool_size > 0).then(|| StandbyPoolPolicy {
        enabled: true,
        size: args.pool_size,
        min_ready: 0,
    });

    Ok(CreateEnvironmentRequest {
        name: args.name.clone().unwrap_or_default(),
        image: args.image.clone().unwrap_or_default(),
        resources,
        isolation,
        node_affinity: None,
        standby_pool,
        labels: args.labels.iter().cloned().collect::<BTreeMap<_, _>>(),
        env_vars: args.env_vars.iter().cloned().collect::<BTreeMap<_, _>>(),
        owner_id: args.owner.clone(),
    })
}

pub async fn handle_env_command(manager: &SandboxManager, command: EnvCommands) -> Result<()> {
    match command {
        EnvCommands::Create(args) => {
            let request = build_create_request(&args)?;
            let env = manager.create_environment(request).await?;
            println!(
                "{} Declared environment {} ({})",
                "✓".green(),
                env.name.bold(),
                env.id.cyan()
            );
            println!("The reconciler will provision it on its next pass.");
        }
        EnvCommands::List {
            statuses,
            selector,
            owner,
            limit,
            offset,
            json,
        } => {
            let statuses = statuses
                .iter()
                .map(|s| EnvironmentStatus::from_str(s))
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("Invalid --status value")?;
            let labels = match selector {
                Some(raw) => corral_sandbox::validation::parse_label_selector(&raw)?,
                None => BTreeMap::new(),
            };
            let filter = EnvironmentFilter {
                statuses,
                owner_id: owner,
                labels,
                limit: Some(limit),
                offset: Some(offset),
            };
            let environments = manager.list_environments(&filter).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&environments)?);
            } else if environments.is_empty() {
                println!("{}", "No environments found".yellow());
            } else {
                println!("{}", output::environments_table(&environments));
                println!("\n{} {}", "Total:".cyan(), environments.len());
            }
        }
        EnvCommands::Show { id, json } => {
            let env = manager.get_environment(&id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&env)?);
            } else {
                println!("{}", output::environment_detail(&env));
            }
        }
        EnvCommands::Retry { id } => {
            let env = manager.retry_reconciliation(&id).await?;
            println!(
                "{} Retry budget reset for {} (status {})",
                "✓".green(),
                env.id.cyan(),
                output::status_label(env.status)
            );
        }
        EnvCommands::Delete { id, force } => match manager.delete_environment(&id, force).await? {
            DeletionOutcome::Removed => {
                println!("{} Environment {} removed", "✓".green(), id.cyan());
            }
            DeletionOutcome::Terminating(env) => match env.last_error.as_deref() {
                Some(error) if force => {
                    println!(
                        "{} Teardown of {} failed: {}",
                        "!".yellow(),
                        env.id.cyan(),
                        error
                    );
                    println!("The reconciler will keep retrying the teardown.");
                }
                _ => {
                    println!(
                        "{} Environment {} marked for deletion",
                        "✓".green(),
                        env.id.cyan()
                    );
                }
            },
        },
        EnvCommands::Events { id, limit } => {
            let events = manager.list_events(&id, limit).await?;
            if events.is_empty() {
                println!("{}", "No events recorded".yellow());
            } else {
                println!("{}", output::events_table(&events));
                println!("\n{} {}", "Total:".cyan(), events.len());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("team=infra").unwrap(),
            ("team".to_string(), "infra".to_string())
        );
        assert_eq!(
            parse_key_value("URL=a=b").unwrap(),
            ("URL".to_string(), "a=b".to_string())
        );
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
    }

    #[test]
    fn test_build_request_from_flags() {
        let args = CreateArgs {
            name: Some("build-box".to_string()),
            image: Some("python:3.11-slim".to_string()),
            memory: Some("2Gi".to_string()),
            runtime_class: Some("gvisor".to_string()),
            deny_egress: true,
            pool_size: 2,
            labels: vec![("team".to_string(), "infra".to_string())],
            owner: "user-1".to_string(),
            ..Default::default()
        };

        let request = build_create_request(&args).unwrap();
        assert_eq!(request.name, "build-box");
        let resources = request.resources.unwrap();
        assert_eq!(resources.cpu, "500m");
        assert_eq!(resources.memory, "2Gi");
        let isolation = request.isolation.unwrap();
        assert_eq!(isolation.runtime_class.as_deref(), Some("gvisor"));
        assert!(isolation.network_policy.unwrap().deny_egress);
        assert_eq!(request.standby_pool.unwrap().size, 2);
        assert_eq!(request.labels.get("team").map(String::as_str), Some("infra"));
        assert_eq!(request.owner_id, "user-1");
    }

    #[test]
    fn test_minimal_flags_leave_optional_parts_unset() {
        let args = CreateArgs {
            name: Some("plain".to_string()),
            image: Some("alpine:3".to_string()),
            owner: "operator".to_string(),
            ..Default::default()
        };
        let request = build_create_request(&args).unwrap();
        assert!(request.resources.is_none());
        assert!(request.isolation.is_none());
        assert!(request.standby_pool.is_none());
    }

    #[test]
    fn test_build_request_from_file_fills_owner() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"name": "from-file", "image": "node:20", "labels": {{"tier": "batch"}}}}"#
        )
        .unwrap();

        let args = CreateArgs {
            from_file: Some(file.path().to_path_buf()),
            owner: "ops".to_string(),
            ..Default::default()
        };
        let request = build_create_request(&args).unwrap();
        assert_eq!(request.name, "from-file");
        assert_eq!(request.owner_id, "ops");
        assert_eq!(request.labels.get("tier").map(String::as_str), Some("batch"));
    }

    #[test]
    fn test_build_request_from_file_rejects_non_object() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[1, 2, 3]").unwrap();
        let args = CreateArgs {
            from_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert!(build_create_request(&args).is_err());
    }
}
