// ABOUTME: Declaration validation applied before anything is persisted or sent to the cluster
// ABOUTME: Quantity parsing, ceilings, isolation, toleration, pool policy, command and selector checks

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use crate::error::{Result, SandboxError};
use crate::settings::OrchestratorSettings;
use crate::types::{
    IsolationPolicy, NetworkPolicy, NodeAffinity, ResourceSpec, SecurityContext,
    StandbyPoolPolicy, Toleration, TolerationOperator,
};

const MAX_NAME_LEN: usize = 63;
const VALID_EFFECTS: [&str; 3] = ["NoSchedule", "PreferNoSchedule", "NoExecute"];

/// Parses a CPU quantity (`500m`, `2`, `0.5`) into millicores
pub fn parse_cpu_millis(raw: &str) -> std::result::Result<u64, String> {
    let s = raw.trim();
    let invalid = || format!("invalid CPU quantity: {:?}", raw);
    let millis = if let Some(m) = s.strip_suffix('m') {
        m.parse::<u64>().map_err(|_| invalid())?
    } else {
        let cores = s.parse::<f64>().map_err(|_| invalid())?;
        if !cores.is_finite() || cores < 0.0 {
            return Err(invalid());
        }
        (cores * 1000.0).round() as u64
    };
    if millis == 0 {
        return Err(format!("CPU quantity must be positive: {:?}", raw));
    }
    Ok(millis)
}

/// Parses a byte quantity with binary (`Ki`, `Mi`, `Gi`, `Ti`) or decimal (`k`, `M`, `G`, `T`) suffixes
pub fn parse_bytes(raw: &str) -> std::result::Result<u64, String> {
    let s = raw.trim();
    let invalid = || format!("invalid byte quantity: {:?}", raw);
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    let multiplier: u64 = match suffix {
        "" => 1,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "k" | "K" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        _ => return Err(invalid()),
    };
    let value = number.parse::<f64>().map_err(|_| invalid())?;
    if !value.is_finite() || value <= 0.0 {
        return Err(format!("byte quantity must be positive: {:?}", raw));
    }
    Ok((value * multiplier as f64).round() as u64)
}

pub fn validate_name(name: &str) -> Result<()> {
    let name = name.trim();
    if name.is_empty() {
        return Err(SandboxError::Validation("name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(SandboxError::Validation(format!(
            "name must be at most {} characters",
            MAX_NAME_LEN
        )));
    }
    Ok(())
}

pub fn validate_image(image: &str) -> Result<()> {
    if image.trim().is_empty() {
        return Err(SandboxError::Validation("image must not be empty".into()));
    }
    if image.chars().any(char::is_whitespace) {
        return Err(SandboxError::Validation(format!(
            "image reference contains whitespace: {:?}",
            image
        )));
    }
    Ok(())
}

pub fn validate_resources(resources: &ResourceSpec, settings: &OrchestratorSettings) -> Result<()> {
    let cpu = parse_cpu_millis(&resources.cpu).map_err(SandboxError::Validation)?;
    let memory = parse_bytes(&resources.memory).map_err(SandboxError::Validation)?;
    let storage = parse_bytes(&resources.storage).map_err(SandboxError::Validation)?;

    if let Some(max) = &settings.max_cpu {
        if cpu > parse_cpu_millis(max).map_err(SandboxError::Config)? {
            return Err(SandboxError::Validation(format!(
                "cpu {} exceeds the allowed maximum {}",
                resources.cpu, max
            )));
        }
    }
    if let Some(max) = &settings.max_memory {
        if memory > parse_bytes(max).map_err(SandboxError::Config)? {
            return Err(SandboxError::Validation(format!(
                "memory {} exceeds the allowed maximum {}",
                resources.memory, max
            )));
        }
    }
    if let Some(max) = &settings.max_storage {
        if storage > parse_bytes(max).map_err(SandboxError::Config)? {
            return Err(SandboxError::Validation(format!(
                "storage {} exceeds the allowed maximum {}",
                resources.storage, max
            )));
        }
    }
    Ok(())
}

pub fn validate_isolation(policy: &IsolationPolicy, settings: &OrchestratorSettings) -> Result<()> {
    if let Some(runtime_class) = &policy.runtime_class {
        if runtime_class.trim().is_empty() {
            return Err(SandboxError::Validation(
                "runtime class must not be empty".into(),
            ));
        }
        if !settings.allowed_runtime_classes.is_empty()
            && !settings.allowed_runtime_classes.contains(runtime_class)
        {
            return Err(SandboxError::Validation(format!(
                "runtime class {:?} is not allowed (allowed: {})",
                runtime_class,
                settings.allowed_runtime_classes.join(", ")
            )));
        }
    }
    if let Some(network) = &policy.network_policy {
        validate_network_policy(network)?;
    }
    if let Some(security) = &policy.security_context {
        validate_security_context(security)?;
    }
    Ok(())
}

fn validate_network_policy(policy: &NetworkPolicy) -> Result<()> {
    for cidr in &policy.allowed_egress_cidrs {
        parse_cidr(cidr).map_err(SandboxError::Validation)?;
    }
    if policy.allowed_egress_ports.contains(&0) {
        return Err(SandboxError::Validation(
            "egress port 0 is not a valid port".into(),
        ));
    }
    Ok(())
}

fn parse_cidr(cidr: &str) -> std::result::Result<(IpAddr, u8), String> {
    let invalid = || format!("invalid CIDR: {:?}", cidr);
    let (addr, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(invalid());
    }
    Ok((addr, prefix))
}

fn validate_security_context(ctx: &SecurityContext) -> Result<()> {
    if ctx.run_as_non_root && ctx.run_as_user == Some(0) {
        return Err(SandboxError::Validation(
            "run_as_non_root conflicts with run_as_user = 0".into(),
        ));
    }
    if ctx.run_as_user.is_some_and(|u| u < 0) || ctx.run_as_group.is_some_and(|g| g < 0) {
        return Err(SandboxError::Validation(
            "user and group IDs must be non-negative".into(),
        ));
    }
    Ok(())
}

pub fn validate_node_affinity(affinity: &NodeAffinity) -> Result<()> {
    for key in affinity.node_selector.keys() {
        if key.trim().is_empty() {
            return Err(SandboxError::Validation(
                "node selector keys must not be empty".into(),
            ));
        }
    }
    affinity.tolerations.iter().try_for_each(validate_toleration)
}

fn validate_toleration(toleration: &Toleration) -> Result<()> {
    if toleration.operator == TolerationOperator::Exists && toleration.value.is_some() {
        return Err(SandboxError::Validation(
            "toleration with operator Exists must not carry a value".into(),
        ));
    }
    if toleration.operator == TolerationOperator::Equal && toleration.key.is_none() {
        return Err(SandboxError::Validation(
            "toleration with operator Equal requires a key".into(),
        ));
    }
    if let Some(effect) = &toleration.effect {
        if !VALID_EFFECTS.contains(&effect.as_str()) {
            return Err(SandboxError::Validation(format!(
                "unknown toleration effect {:?}",
                effect
            )));
        }
    }
    if toleration.toleration_seconds.is_some() && toleration.effect.as_deref() != Some("NoExecute")
    {
        return Err(SandboxError::Validation(
            "toleration_seconds is only valid with effect NoExecute".into(),
        ));
    }
    Ok(())
}

pub fn validate_pool_policy(policy: &StandbyPoolPolicy) -> Result<()> {
    if !policy.enabled {
        return Ok(());
    }
    if policy.size == 0 {
        return Err(SandboxError::Validation(
            "standby pool size must be at least 1 when enabled".into(),
        ));
    }
    if policy.min_ready > policy.size {
        return Err(SandboxError::Validation(format!(
            "standby pool min_ready ({}) exceeds size ({})",
            policy.min_ready, policy.size
        )));
    }
    Ok(())
}

pub fn validate_command(command: &[String]) -> Result<()> {
    match command.first() {
        Some(program) if !program.trim().is_empty() => Ok(()),
        _ => Err(SandboxError::Validation("command must not be empty".into())),
    }
}

/// Applies the default when absent and clamps to the configured maximum
pub fn resolve_timeout(requested: Option<u64>, settings: &OrchestratorSettings) -> Result<Duration> {
    match requested {
        Some(0) => Err(SandboxError::Validation(
            "timeout must be positive".into(),
        )),
        Some(secs) => Ok(Duration::from_secs(secs).min(settings.max_execution_timeout)),
        None => Ok(settings.default_execution_timeout),
    }
}

/// Parses an equality label selector such as `team=infra,tier=batch`
pub fn parse_label_selector(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = part.split_once('=').ok_or_else(|| {
            SandboxError::Validation(format!("invalid label selector term: {:?}", part))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(SandboxError::Validation(format!(
                "invalid label selector term: {:?}",
                part
            )));
        }
        out.insert(key.to_string(), value.trim().to_string());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("500m", 500)]
    #[case("2", 2000)]
    #[case("0.25", 250)]
    #[case(" 1500m ", 1500)]
    fn test_parse_cpu(#[case] raw: &str, #[case] expected: u64) {
        assert_eq!(parse_cpu_millis(raw).unwrap(), expected);
    }

    #[rstest]
    #[case("512Mi", 512 * 1024 * 1024)]
    #[case("1Gi", 1 << 30)]
    #[case("1G", 1_000_000_000)]
    #[case("2048", 2048)]
    #[case("1.5Gi", 3 << 29)]
    fn test_parse_bytes(#[case] raw: &str, #[case] expected: u64) {
        assert_eq!(parse_bytes(raw).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("abc")]
    #[case("0")]
    #[case("-1m")]
    fn test_parse_cpu_rejects(#[case] raw: &str) {
        assert!(parse_cpu_millis(raw).is_err());
    }

    #[rstest]
    #[case("12Xi")]
    #[case("Mi")]
    #[case("0Gi")]
    fn test_parse_bytes_rejects(#[case] raw: &str) {
        assert!(parse_bytes(raw).is_err());
    }

    #[test]
    fn test_resource_ceilings() {
        let settings = OrchestratorSettings {
            max_cpu: Some("2".into()),
            max_memory: Some("4Gi".into()),
            ..Default::default()
        };
        let ok = ResourceSpec {
            cpu: "1500m".into(),
            memory: "2Gi".into(),
            storage: "1Gi".into(),
        };
        assert!(validate_resources(&ok, &settings).is_ok());

        let too_big = ResourceSpec {
            cpu: "3".into(),
            ..ok.clone()
        };
        assert!(matches!(
            validate_resources(&too_big, &settings),
            Err(SandboxError::Validation(_))
        ));
    }

    #[test]
    fn test_runtime_class_allow_list() {
        let settings = OrchestratorSettings {
            allowed_runtime_classes: vec!["gvisor".into()],
            ..Default::default()
        };
        let allowed = IsolationPolicy {
            runtime_class: Some("gvisor".into()),
            ..Default::default()
        };
        let denied = IsolationPolicy {
            runtime_class: Some("kata".into()),
            ..Default::default()
        };
        assert!(validate_isolation(&allowed, &settings).is_ok());
        assert!(validate_isolation(&denied, &settings).is_err());
        assert!(validate_isolation(&denied, &OrchestratorSettings::default()).is_ok());
    }

    #[test]
    fn test_security_context_conflict() {
        let policy = IsolationPolicy {
            security_context: Some(SecurityContext {
                run_as_non_root: true,
                run_as_user: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(validate_isolation(&policy, &OrchestratorSettings::default()).is_err());
    }

    #[rstest]
    #[case("10.0.0.0/8", true)]
    #[case("fd00::/8", true)]
    #[case("10.0.0.0/33", false)]
    #[case("10.0.0.0", false)]
    #[case("example.com/24", false)]
    fn test_egress_cidrs(#[case] cidr: &str, #[case] valid: bool) {
        let policy = NetworkPolicy {
            allowed_egress_cidrs: vec![cidr.to_string()],
            ..Default::default()
        };
        assert_eq!(validate_network_policy(&policy).is_ok(), valid);
    }

    #[rstest]
    #[case(TolerationOperator::Exists, Some("gpu"), None, None, false)]
    #[case(TolerationOperator::Exists, None, Some("NoSchedule"), None, true)]
    #[case(TolerationOperator::Equal, Some("a100"), Some("Sometimes"), None, false)]
    #[case(TolerationOperator::Equal, Some("a100"), Some("NoSchedule"), Some(30), false)]
    #[case(TolerationOperator::Equal, Some("a100"), Some("NoExecute"), Some(30), true)]
    fn test_tolerations(
        #[case] operator: TolerationOperator,
        #[case] value: Option<&str>,
        #[case] effect: Option<&str>,
        #[case] seconds: Option<i64>,
        #[case] valid: bool,
    ) {
        let affinity = NodeAffinity {
            node_selector: BTreeMap::new(),
            tolerations: vec![Toleration {
                key: Some("nvidia.com/gpu".into()),
                operator,
                value: value.map(str::to_string),
                effect: effect.map(str::to_string),
                toleration_seconds: seconds,
            }],
        };
        assert_eq!(validate_node_affinity(&affinity).is_ok(), valid);
    }

    #[test]
    fn test_pool_policy() {
        let ok = StandbyPoolPolicy {
            enabled: true,
            size: 3,
            min_ready: 2,
        };
        assert!(validate_pool_policy(&ok).is_ok());
        assert!(validate_pool_policy(&StandbyPoolPolicy { size: 0, ..ok.clone() }).is_err());
        assert!(validate_pool_policy(&StandbyPoolPolicy { min_ready: 4, ..ok.clone() }).is_err());
        assert!(validate_pool_policy(&StandbyPoolPolicy {
            enabled: false,
            size: 0,
            min_ready: 0
        })
        .is_ok());
    }

    #[test]
    fn test_timeout_resolution() {
        let settings = OrchestratorSettings::default();
        assert_eq!(
            resolve_timeout(None, &settings).unwrap(),
            settings.default_execution_timeout
        );
        assert_eq!(
            resolve_timeout(Some(999_999), &settings).unwrap(),
            settings.max_execution_timeout
        );
        assert!(resolve_timeout(Some(0), &settings).is_err());
    }

    #[test]
    fn test_label_selector_and_command() {
        let selector = parse_label_selector("team=infra, tier = batch").unwrap();
        assert_eq!(selector.get("tier").map(String::as_str), Some("batch"));
        assert!(parse_label_selector("team").is_err());
        assert!(parse_label_selector("").unwrap().is_empty());

        assert!(validate_command(&[]).is_err());
        assert!(validate_command(&["  ".to_string()]).is_err());
        assert!(validate_command(&["ls".to_string()]).is_ok());
    }
}
