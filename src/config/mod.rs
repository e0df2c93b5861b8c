//! Configuration resolution.
//!
//! Raw configuration arrives as an ordered list of loosely typed fragments
//! (YAML mappings from a file, or JSON objects sent by the host converted to
//! YAML values). [`resolve`] decodes them against the schema in [`schema`],
//! applies defaults, validates the result and produces an immutable
//! [`ProvisionerConfig`].

mod schema;

use std::fs::File;
use std::io::BufReader;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::Utf8Path;
use serde_yaml::Value;
use tracing::debug;

use crate::error::{MultiError, ProvisionerError};

pub use schema::quote_env_var;

/// Binary invoked on the guest.
pub const DEFAULT_COMMAND: &str = "itamae";

/// Guest directory recipes are uploaded to.
pub const DEFAULT_STAGING_DIR: &str = "/tmp/packer-itamae";

/// Gems installed when `gems` is not configured.
pub const DEFAULT_GEMS: &[&str] = &["itamae", "specinfra-ec2_metadata-tags"];

/// How long a failing install is retried.
pub const DEFAULT_INSTALL_RETRY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub const DEFAULT_INSTALL_COMMAND: &str = "{{if .Sudo}}sudo -E {{end}}\
    gem install --quiet --no-document --no-suggestions {{.Gems}}";

pub const DEFAULT_EXECUTE_COMMAND: &str = concat!(
    "cd {{.StagingDir}} && ",
    "{{.Vars}} {{if .Sudo}}sudo -E {{end}}",
    "{{.Command}} local --detailed-exitcode ",
    "{{if .Color}}--color='{{printf \"%t\" .ColorValue}}' {{end}}",
    "{{if ne .LogLevel \"\"}}--log-level='{{.LogLevel}}' {{end}}",
    "{{if ne .Shell \"\"}}--shell='{{.Shell}}' {{end}}",
    "{{if ne .NodeJSON \"\"}}--node-json='{{.NodeJSON}}' {{end}}",
    "{{if ne .NodeYAML \"\"}}--node-yaml='{{.NodeYAML}}' {{end}}",
    "{{if ne .ConfigFile \"\"}}--config='{{.ConfigFile}}' {{end}}",
    "{{if ne .ExtraArguments \"\"}}{{.ExtraArguments}} {{end}}",
    "{{.Recipes}}",
);

/// Identity of the running build, supplied by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildIdentity {
    /// Value of `packer_build_name`.
    pub name: String,
    /// Value of `packer_builder_type`.
    pub builder_type: String,
}

/// Fully resolved provisioner configuration.
///
/// Every field is concrete: defaults have been applied and every validation
/// rule has passed. Environment variables are already quoted as
/// `KEY='VALUE'`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionerConfig {
    pub command: String,
    pub gems: Vec<String>,
    pub vars: Vec<String>,
    pub install_command: String,
    pub install_retry_timeout: Duration,
    pub skip_install: bool,
    pub execute_command: String,
    pub prevent_sudo: bool,
    pub staging_dir: String,
    pub clean_staging_dir: bool,
    pub source_dir: Option<String>,
    pub log_level: Option<String>,
    pub shell: Option<String>,
    pub node_json: Option<String>,
    pub node_yaml: Option<String>,
    pub config_file: Option<String>,
    pub color: bool,
    pub extra_arguments: Vec<String>,
    pub recipes: Vec<String>,
    pub ignore_exit_codes: bool,
    pub build: BuildIdentity,
}

impl ProvisionerConfig {
    fn from_decoded(decoded: &schema::Decoded) -> Self {
        let list = |key: &str| decoded.list(key).map(<[String]>::to_vec).unwrap_or_default();
        Self {
            command: decoded.string("command"),
            gems: list("gems"),
            vars: list("environment_vars"),
            install_command: decoded.string("install_command"),
            install_retry_timeout: decoded.duration("install_retry_timeout"),
            skip_install: decoded.flag("skip_install"),
            execute_command: decoded.string("execute_command"),
            prevent_sudo: decoded.flag("prevent_sudo"),
            staging_dir: decoded.string("staging_directory"),
            clean_staging_dir: decoded.flag("clean_staging_directory"),
            source_dir: decoded.opt_string("source_directory"),
            log_level: decoded.opt_string("log_level"),
            shell: decoded.opt_string("shell"),
            node_json: decoded.opt_string("node_json"),
            node_yaml: decoded.opt_string("node_yaml"),
            config_file: decoded.opt_string("config_file"),
            color: decoded.flag("color"),
            extra_arguments: list("extra_arguments"),
            recipes: list("recipes"),
            ignore_exit_codes: decoded.flag("ignore_exit_codes"),
            build: BuildIdentity {
                name: decoded.string("packer_build_name"),
                builder_type: decoded.string("packer_builder_type"),
            },
        }
    }
}

/// Decodes, defaults and validates configuration fragments.
///
/// # Errors
///
/// Returns `ProvisionerError::Decode` when a key is unknown or a value cannot
/// be coerced; validation does not run in that case. Otherwise returns
/// `ProvisionerError::Config` listing every violated validation rule.
pub fn resolve(fragments: &[Value]) -> Result<ProvisionerConfig, ProvisionerError> {
    let mut decoded = schema::decode(fragments)?;

    let mut errs = MultiError::new();
    schema::validate(&mut decoded, &mut errs);
    errs.into_result(ProvisionerError::Config)?;

    let config = ProvisionerConfig::from_decoded(&decoded);
    debug!("resolved configuration: {:?}", config);
    Ok(config)
}

/// Loads configuration fragments from a YAML file.
///
/// The document is either a single mapping or a sequence of mappings, which
/// are overlaid in order.
pub fn load_fragments(path: &Utf8Path) -> Result<Vec<Value>> {
    let file = File::open(path).with_context(|| format!("failed to load file: {}", path))?;
    let reader = BufReader::new(file);
    let document: Value = serde_yaml::from_reader(reader)
        .with_context(|| format!("failed to parse yaml: {}", path))?;

    Ok(match document {
        Value::Sequence(fragments) => fragments,
        Value::Null => Vec::new(),
        other => vec![other],
    })
}
