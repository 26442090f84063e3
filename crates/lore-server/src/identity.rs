// crates/lore-server/src/identity.rs
// Workstation/project isolation keys for cross-machine session indexing

use sha2::{Digest, Sha256};

/// First 8 hex characters of SHA-256 over the input bytes.
fn short_hash(input: &[u8]) -> String {
    let digest = Sha256::digest(input);
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..8].to_string()
}

/// Read the machine's hostname.
///
/// Fallback chain: HOSTNAME env var, /proc/sys/kernel/hostname (Linux),
/// "localhost".
pub fn hostname() -> String {
    if let Ok(h) = std::env::var("HOSTNAME") {
        let h = h.trim().to_string();
        if !h.is_empty() {
            return h;
        }
    }
    if let Ok(h) = std::fs::read_to_string("/proc/sys/kernel/hostname") {
        let h = h.trim().to_string();
        if !h.is_empty() {
            return h;
        }
    }
    "localhost".to_string()
}

/// Read /etc/machine-id where available; otherwise the hostname repeated.
fn machine_id(host: &str) -> String {
    match std::fs::read_to_string("/etc/machine-id") {
        Ok(id) if !id.trim().is_empty() => id.trim().to_string(),
        _ => format!("{}{}", host, host),
    }
}

/// Stable id for this machine: first 8 hex of SHA-256(hostname || machine-id).
pub fn workstation_id() -> String {
    let host = hostname();
    let machine = machine_id(&host);
    short_hash(format!("{}{}", host, machine).as_bytes())
}

/// Stable id for a project path: first 8 hex of SHA-256(project_path).
pub fn project_id(project_path: &str) -> String {
    short_hash(project_path.as_bytes())
}

/// Composite key isolating a session across machines and projects.
pub fn composite_key(workstation: &str, project: &str, session: &str) -> String {
    format!("{}:{}:{}", workstation, project, session)
}
