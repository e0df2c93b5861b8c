//! Version information reported by the plugin.

/// Version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Source revision, baked in at build time through
/// `PACKER_PROVISIONER_ITAMAE_REVISION` when set.
pub const REVISION: Option<&str> = option_env!("PACKER_PROVISIONER_ITAMAE_REVISION");

/// Returns the banner logged once the provisioner is prepared.
pub fn banner() -> String {
    banner_with(REVISION)
}

/// Returns the banner for an explicit revision.
pub fn banner_with(revision: Option<&str>) -> String {
    match revision.filter(|r| !r.is_empty()) {
        Some(revision) => format!("[INFO] Provisioner Itamae v{} ({})", VERSION, revision),
        None => format!("[INFO] Provisioner Itamae v{}", VERSION),
    }
}
