//! OS-appropriate shell snippets for staging directory management.
//!
//! The provisioner never hard-codes `mkdir`/`chmod`/`rm` invocations; it asks
//! [`GuestCommands`] for the snippet matching the guest OS type, with `sudo`
//! applied on Unix guests unless it has been prevented.

use strum::{Display, EnumString};

use crate::error::ProvisionerError;

/// Family of operating systems a guest command set exists for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum GuestOsType {
    Unix,
    Windows,
}

impl GuestOsType {
    /// Maps an operating system name (as in `std::env::consts::OS`) to its family.
    ///
    /// # Errors
    ///
    /// Returns `ProvisionerError::UnsupportedOs` for systems without a command set.
    pub fn from_os_name(os: &str) -> Result<Self, ProvisionerError> {
        match os {
            "linux" | "macos" | "darwin" | "freebsd" | "openbsd" | "netbsd" | "dragonfly" => {
                Ok(Self::Unix)
            }
            other => other
                .parse()
                .map_err(|_| ProvisionerError::UnsupportedOs(other.to_string())),
        }
    }

    /// Returns the family of the platform this binary runs on.
    pub fn detect() -> Result<Self, ProvisionerError> {
        Self::from_os_name(std::env::consts::OS)
    }
}

/// Produces guest shell commands for one OS family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestCommands {
    os_type: GuestOsType,
    sudo: bool,
}

impl GuestCommands {
    pub fn new(os_type: GuestOsType, sudo: bool) -> Self {
        Self { os_type, sudo }
    }

    pub fn os_type(&self) -> GuestOsType {
        self.os_type
    }

    /// Command creating `path` and any missing parents.
    pub fn create_dir(&self, path: &str) -> String {
        let path = self.escape_path(path);
        match self.os_type {
            GuestOsType::Unix => self.with_sudo(format!("mkdir -p '{}'", path)),
            GuestOsType::Windows => format!(
                "powershell.exe -Command \"New-Item -ItemType directory -Force \
                -ErrorAction SilentlyContinue -Path {}\"",
                path
            ),
        }
    }

    /// Command changing the permission bits of `path` to `mode` (e.g. `0777`).
    pub fn chmod(&self, path: &str, mode: &str) -> String {
        let path = self.escape_path(path);
        match self.os_type {
            GuestOsType::Unix => self.with_sudo(format!("chmod {} '{}'", mode, path)),
            GuestOsType::Windows => format!("echo 'skipping chmod {}'", path),
        }
    }

    /// Command removing `path` recursively.
    pub fn remove_dir(&self, path: &str) -> String {
        let path = self.escape_path(path);
        match self.os_type {
            GuestOsType::Unix => self.with_sudo(format!("rm -rf '{}'", path)),
            GuestOsType::Windows => {
                format!("powershell.exe -Command \"rm {} -recurse -force\"", path)
            }
        }
    }

    fn escape_path(&self, path: &str) -> String {
        match self.os_type {
            GuestOsType::Unix => path.to_string(),
            GuestOsType::Windows => path.replace('/', "\\").replace(' ', "` "),
        }
    }

    fn with_sudo(&self, command: String) -> String {
        if self.sudo && self.os_type == GuestOsType::Unix {
            format!("sudo {}", command)
        } else {
            command
        }
    }
}
