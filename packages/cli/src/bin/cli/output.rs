// ABOUTME: Terminal rendering helpers shared by the corral subcommands
// ABOUTME: comfy-table layouts for environments and events plus colored status labels

use chrono::{DateTime, Utc};
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};

use corral_sandbox::{Environment, EnvironmentEvent, EnvironmentStatus};

pub fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

pub fn status_label(status: EnvironmentStatus) -> ColoredString {
    match status {
        EnvironmentStatus::Running => status.as_str().green(),
        EnvironmentStatus::Pending => status.as_str().yellow(),
        EnvironmentStatus::Failed => status.as_str().red(),
        EnvironmentStatus::Terminating | EnvironmentStatus::Terminated => {
            status.as_str().dimmed()
        }
    }
}

pub fn format_time(time: &DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn format_optional_time(time: Option<&DateTime<Utc>>) -> String {
    time.map(format_time).unwrap_or_else(|| "-".to_string())
}

pub fn environments_table(environments: &[Environment]) -> Table {
    let mut table = new_table();
    table.set_header(vec![
        "ID", "Name", "Image", "Status", "Namespace", "Owner", "Retries", "Created",
    ]);

    for env in environments {
        table.add_row(vec![
            env.id.clone(),
            env.name.clone(),
            env.image.clone(),
            status_label(env.status).to_string(),
            env.namespace.clone(),
            env.owner_id.clone(),
            env.retry_count.to_string(),
            format_time(&env.created_at),
        ]);
    }
    table
}

/// Two-column property view of one environment
pub fn environment_detail(env: &Environment) -> Table {
    let mut table = new_table();
    table.set_header(vec!["Field", "Value"]);

    let labels = if env.labels.is_empty() {
        "-".to_string()
    } else {
        env.labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let runtime_class = env.runtime_class().unwrap_or("-").to_string();
    let pool = match &env.standby_pool {
        Some(policy) if policy.enabled => format!("{} pods", policy.size),
        _ => "disabled".to_string(),
    };

    let rows: Vec<(&str, String)> = vec![
        ("ID", env.id.clone()),
        ("Name", env.name.clone()),
        ("Image", env.image.clone()),
        ("Status", status_label(env.status).to_string()),
        ("Namespace", env.namespace.clone()),
        ("Pod", env.pod_name.clone().unwrap_or_else(|| "-".to_string())),
        ("CPU", env.resources.cpu.clone()),
        ("Memory", env.resources.memory.clone()),
        ("Storage", env.resources.storage.clone()),
        ("Runtime class", runtime_class),
        ("Standby pool", pool),
        ("Labels", labels),
        ("Owner", env.owner_id.clone()),
        ("Created", format_time(&env.created_at)),
        ("Started", format_optional_time(env.started_at.as_ref())),
        ("Last activity", format_optional_time(env.last_activity_at.as_ref())),
        ("Terminated", format_optional_time(env.terminated_at.as_ref())),
        ("Retries", env.retry_count.to_string()),
        (
            "Last error",
            env.last_error.clone().unwrap_or_else(|| "-".to_string()),
        ),
    ];
    for (field, value) in rows {
        table.add_row(vec![field.to_string(), value]);
    }
    table
}

pub fn events_table(events: &[EnvironmentEvent]) -> Table {
    let mut table = new_table();
    table.set_header(vec!["Time", "Event", "Message"]);

    for event in events {
        table.add_row(vec![
            format_time(&event.created_at),
            event.event_type.as_str().to_string(),
            event.message.clone(),
        ]);
    }
    table
}
