use sha2::Digest as _;

/// Deterministic identity for the logical worker this process belongs to.
///
/// Derived from the site identity plus a version marker, never from
/// per-process randomness, so the same logical worker presents the same id
/// across restarts and a stuck claim can be traced back to it.
pub fn worker_id() -> String {
    let site = site_id();
    derive_worker_id(&site, env!("CARGO_PKG_VERSION"))
}

/// Stable site identity; `STEWARD_SITE_ID` wins, hostname is the fallback.
pub fn site_id() -> String {
    if let Ok(s) = std::env::var("STEWARD_SITE_ID") {
        let s = s.trim().to_string();
        if !s.is_empty() {
            return s;
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string())
}

pub fn derive_worker_id(site: &str, version: &str) -> String {
    let mut h = sha2::Sha256::new();
    h.update(site.as_bytes());
    h.update(b"|");
    h.update(version.as_bytes());
    let digest = h.finalize();
    let hex: String = digest.iter().take(6).map(|b| format!("{:02x}", b)).collect();
    format!("w-{}", hex)
}
