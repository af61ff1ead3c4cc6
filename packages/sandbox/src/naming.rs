// ABOUTME: Deterministic cluster names derived from entity IDs
// ABOUTME: Namespaces, primary, ephemeral and standby pod names are all valid DNS-1123 labels

use crate::types::ResourceSpec;

pub const NAMESPACE_PREFIX: &str = "corral-";
pub const PRIMARY_POD: &str = "primary";
const MAX_LABEL_LEN: usize = 63;

pub fn new_environment_id() -> String {
    format!("env-{}", uuid::Uuid::new_v4().simple())
}

pub fn new_execution_id() -> String {
    format!("exec-{}", uuid::Uuid::new_v4().simple())
}

pub fn new_session_id() -> String {
    format!("sess-{}", nanoid::nanoid!(12, &LOWER_ALNUM))
}

const LOWER_ALNUM: [char; 36] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's',
    't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

pub fn namespace_for(environment_id: &str) -> String {
    dns_label(&format!("{}{}", NAMESPACE_PREFIX, environment_id))
}

pub fn ephemeral_pod_for(execution_id: &str) -> String {
    dns_label(execution_id)
}

pub fn standby_pod_name(pool_key: &PoolKey) -> String {
    let suffix = nanoid::nanoid!(8, &LOWER_ALNUM);
    dns_label(&format!("standby-{:08x}-{}", pool_key.hash32(), suffix))
}

/// Lowercases, replaces invalid characters with `-`, and trims to 63 characters
pub fn dns_label(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    out.truncate(MAX_LABEL_LEN);
    out.trim_matches('-').to_string()
}

/// Identity of a standby pool: pods under one key are interchangeable
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey {
    pub image: String,
    pub cpu: String,
    pub memory: String,
    pub storage: String,
    pub runtime_class: Option<String>,
}

impl PoolKey {
    pub fn new(image: &str, resources: &ResourceSpec, runtime_class: Option<&str>) -> Self {
        Self {
            image: image.to_string(),
            cpu: resources.cpu.clone(),
            memory: resources.memory.clone(),
            storage: resources.storage.clone(),
            runtime_class: runtime_class.map(str::to_string),
        }
    }

    pub fn resources(&self) -> ResourceSpec {
        ResourceSpec {
            cpu: self.cpu.clone(),
            memory: self.memory.clone(),
            storage: self.storage.clone(),
        }
    }

    /// FNV-1a over the key fields; stable across processes so leftover pods can be matched
    pub fn hash32(&self) -> u32 {
        let mut hash: u32 = 0x811c_9dc5;
        let runtime = self.runtime_class.as_deref().unwrap_or("");
        for part in [
            self.image.as_str(),
            self.cpu.as_str(),
            self.memory.as_str(),
            self.storage.as_str(),
            runtime,
        ] {
            for byte in part.bytes().chain(std::iter::once(0u8)) {
                hash ^= byte as u32;
                hash = hash.wrapping_mul(0x0100_0193);
            }
        }
        hash
    }

    pub fn label_value(&self) -> String {
        format!("{:08x}", self.hash32())
    }
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}/{}/{}", self.image, self.cpu, self.memory, self.storage)?;
        if let Some(rc) = &self.runtime_class {
            write!(f, ", {}", rc)?;
        }
        f.write_str(")")
    }
}
