//! The Itamae provisioner.
//!
//! [`Provisioner::prepare`] resolves the configuration; [`Provisioner::provision`]
//! then drives a fixed sequence of steps against a [`Communicator`]:
//!
//! 1. install Itamae (unless skipped), retried until a deadline
//! 2. create the staging directory
//! 3. upload the source directory, or each recipe
//! 4. run `itamae local`
//! 5. remove the staging directory (when requested)
//!
//! The first failing step aborts the run.

use std::fs::File;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_yaml::Value as RawValue;
use tracing::{debug, info};

use crate::communicator::{Communicator, RemoteCmd};
use crate::config::{self, ProvisionerConfig, quote_env_var};
use crate::error::ProvisionerError;
use crate::guest::{GuestCommands, GuestOsType};
use crate::path;
use crate::retry::{self, DEFAULT_RETRY_INTERVAL, RetryPolicy};
use crate::template::{self, TemplateData, Value};
use crate::ui::Ui;
use crate::version;

/// Exit status with which `itamae local --detailed-exitcode` reports
/// a successful run that changed something.
const EXIT_CODE_CHANGED: i32 = 2;

/// Data available to the install command template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallTemplate {
    /// Gems joined with spaces.
    pub gems: String,
    pub sudo: bool,
}

impl TemplateData for InstallTemplate {
    fn field(&self, name: &str) -> Option<Value> {
        match name {
            "Gems" => Some(self.gems.as_str().into()),
            "Sudo" => Some(self.sudo.into()),
            _ => None,
        }
    }
}

/// Data available to the execute command template.
///
/// `Color` tells whether a color setting is rendered at all, `ColorValue`
/// carries the setting itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecuteTemplate {
    pub command: String,
    /// Quoted environment variables joined with spaces.
    pub vars: String,
    pub sudo: bool,
    pub staging_dir: String,
    pub log_level: String,
    pub shell: String,
    pub node_json: String,
    pub node_yaml: String,
    pub color: bool,
    pub color_value: bool,
    pub config_file: String,
    /// Extra arguments joined with spaces.
    pub extra_arguments: String,
    /// Recipes joined with spaces.
    pub recipes: String,
}

impl TemplateData for ExecuteTemplate {
    fn field(&self, name: &str) -> Option<Value> {
        let value: Value = match name {
            "Command" => self.command.as_str().into(),
            "Vars" => self.vars.as_str().into(),
            "Sudo" => self.sudo.into(),
            "StagingDir" => self.staging_dir.as_str().into(),
            "LogLevel" => self.log_level.as_str().into(),
            "Shell" => self.shell.as_str().into(),
            "NodeJSON" | "JsonPath" => self.node_json.as_str().into(),
            "NodeYAML" | "YamlPath" => self.node_yaml.as_str().into(),
            "Color" => self.color.into(),
            "ColorValue" => self.color_value.into(),
            "ConfigFile" => self.config_file.as_str().into(),
            "ExtraArguments" => self.extra_arguments.as_str().into(),
            "Recipes" => self.recipes.as_str().into(),
            _ => return None,
        };
        Some(value)
    }
}

impl ExecuteTemplate {
    /// Builds the template data for `config`.
    ///
    /// The build identity is exported as `PACKER_BUILD_NAME` and
    /// `PACKER_BUILDER_TYPE` ahead of the configured environment variables.
    pub fn from_config(config: &ProvisionerConfig) -> Self {
        let identity = [
            format!("PACKER_BUILD_NAME={}", config.build.name),
            format!("PACKER_BUILDER_TYPE={}", config.build.builder_type),
        ];
        let vars: Vec<String> = identity
            .iter()
            .filter_map(|kv| quote_env_var(kv))
            .chain(config.vars.iter().cloned())
            .collect();

        Self {
            command: config.command.clone(),
            vars: vars.join(" "),
            sudo: !config.prevent_sudo,
            staging_dir: config.staging_dir.clone(),
            log_level: config.log_level.clone().unwrap_or_default(),
            shell: config.shell.clone().unwrap_or_default(),
            node_json: config.node_json.clone().unwrap_or_default(),
            node_yaml: config.node_yaml.clone().unwrap_or_default(),
            color: true,
            color_value: config.color,
            config_file: config.config_file.clone().unwrap_or_default(),
            extra_arguments: config.extra_arguments.join(" "),
            recipes: config.recipes.join(" "),
        }
    }
}

/// Renders the install command for `config`.
pub fn render_install_command(config: &ProvisionerConfig) -> Result<String, ProvisionerError> {
    let data = InstallTemplate {
        gems: config.gems.join(" "),
        sudo: !config.prevent_sudo,
    };
    template::render(&config.install_command, &data)
        .map_err(|e| ProvisionerError::template("install_command", e.to_string()))
}

/// Renders the execute command for `config`.
pub fn render_execute_command(config: &ProvisionerConfig) -> Result<String, ProvisionerError> {
    let data = ExecuteTemplate::from_config(config);
    template::render(&config.execute_command, &data)
        .map_err(|e| ProvisionerError::template("execute_command", e.to_string()))
}

/// Provisions a machine with Itamae.
#[derive(Debug)]
pub struct Provisioner {
    config: Option<ProvisionerConfig>,
    guest: Option<GuestCommands>,
    guest_os: Option<GuestOsType>,
    retry_interval: Duration,
}

impl Default for Provisioner {
    fn default() -> Self {
        Self {
            config: None,
            guest: None,
            guest_os: None,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

impl Provisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the pause between two install attempts.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Overrides the guest OS type, which otherwise follows the host platform.
    pub fn with_guest_os(mut self, os_type: GuestOsType) -> Self {
        self.guest_os = Some(os_type);
        self
    }

    /// Returns the resolved configuration once [`prepare()`](Self::prepare) succeeded.
    pub fn config(&self) -> Option<&ProvisionerConfig> {
        self.config.as_ref()
    }

    /// Resolves and validates the configuration fragments.
    ///
    /// # Errors
    ///
    /// Fails immediately when the guest OS type has no guest command set.
    /// Otherwise returns the decode or validation error produced by
    /// [`config::resolve`].
    pub fn prepare(&mut self, fragments: &[RawValue]) -> Result<(), ProvisionerError> {
        let os_type = match self.guest_os {
            Some(os_type) => os_type,
            None => GuestOsType::detect()?,
        };

        let config = config::resolve(fragments)?;
        self.guest = Some(GuestCommands::new(os_type, !config.prevent_sudo));
        self.config = Some(config);

        info!("{}", version::banner());
        Ok(())
    }

    /// Runs every provisioning step against `comm`, reporting progress to `ui`.
    pub fn provision(&self, ui: &dyn Ui, comm: &dyn Communicator) -> Result<()> {
        let (Some(config), Some(guest)) = (self.config.as_ref(), self.guest.as_ref()) else {
            return Err(ProvisionerError::NotPrepared.into());
        };

        ui.say("Provisioning with Itamae...");

        if !config.skip_install {
            let policy = RetryPolicy::new(config.install_retry_timeout, self.retry_interval);
            retry::retry(&policy, || install_itamae(config, ui, comm))
                .context("Error installing Itamae")?;
        }

        ui.message("Creating staging directory...");
        create_dir(guest, &config.staging_dir, ui, comm)
            .context("Error creating staging directory")?;

        match &config.source_dir {
            Some(source_dir) => {
                ui.message("Uploading source directory to staging directory...");
                upload_dir(&config.staging_dir, source_dir, ui, comm)
                    .context("Error uploading source directory")?;
            }
            None => {
                ui.message("Uploading recipes...");
                for recipe in &config.recipes {
                    let destination = path::join(&config.staging_dir, recipe);
                    upload_file(&destination, recipe, ui, comm)
                        .context("Error uploading recipe")?;
                }
            }
        }

        execute_itamae(config, ui, comm).context("Error executing Itamae")?;

        if config.clean_staging_dir {
            ui.message("Removing staging directory...");
            remove_dir(guest, &config.staging_dir, ui, comm)
                .context("Error removing staging directory")?;
        }

        info!("provisioning completed successfully");
        Ok(())
    }

    /// Aborts provisioning by terminating the process.
    ///
    /// Nothing is rolled back; the staging directory may be left behind.
    pub fn cancel(&self) -> ! {
        info!("cancelling provisioning");
        std::process::exit(0)
    }
}

fn install_itamae(config: &ProvisionerConfig, ui: &dyn Ui, comm: &dyn Communicator) -> Result<()> {
    ui.message("Installing Itamae...");
    let command = render_install_command(config)?;
    ui.message(&format!("Executing: {}", command));
    RemoteCmd::new(command).run_checked(comm, ui)
}

fn execute_itamae(config: &ProvisionerConfig, ui: &dyn Ui, comm: &dyn Communicator) -> Result<()> {
    ui.message("Executing Itamae...");
    let command = render_execute_command(config)?;
    ui.message(&format!("Executing: {}", command));

    let mut cmd = RemoteCmd::new(command);
    let status = cmd.run(comm, ui)?;
    if config.ignore_exit_codes {
        debug!("ignoring exit status {}", status);
        return Ok(());
    }
    if status != 0 && status != EXIT_CODE_CHANGED {
        return Err(ProvisionerError::exit_status(cmd.command(), status).into());
    }
    Ok(())
}

fn create_dir(guest: &GuestCommands, dir: &str, ui: &dyn Ui, comm: &dyn Communicator) -> Result<()> {
    ui.message(&format!("Creating directory: {}", dir));
    RemoteCmd::new(guest.create_dir(dir)).run_checked(comm, ui)?;
    RemoteCmd::new(guest.chmod(dir, "0777")).run_checked(comm, ui)
}

fn remove_dir(guest: &GuestCommands, dir: &str, ui: &dyn Ui, comm: &dyn Communicator) -> Result<()> {
    ui.message(&format!("Removing directory: {}", dir));
    RemoteCmd::new(guest.remove_dir(dir)).run_checked(comm, ui)
}

fn upload_file(destination: &str, source: &str, ui: &dyn Ui, comm: &dyn Communicator) -> Result<()> {
    ui.message(&format!("Uploading file: {}", source));
    let mut file = File::open(source)
        .map_err(|e| ProvisionerError::io(format!("failed to open {}", source), e))?;
    comm.upload(destination, &mut file)
}

fn upload_dir(destination: &str, source: &str, ui: &dyn Ui, comm: &dyn Communicator) -> Result<()> {
    ui.message(&format!("Uploading directory: {}", source));
    comm.upload_dir(destination, &path::with_trailing_slash(source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::Template;

    fn base_config() -> ProvisionerConfig {
        ProvisionerConfig {
            command: config::DEFAULT_COMMAND.to_string(),
            gems: vec!["itamae".to_string()],
            vars: Vec::new(),
            install_command: config::DEFAULT_INSTALL_COMMAND.to_string(),
            install_retry_timeout: config::DEFAULT_INSTALL_RETRY_TIMEOUT,
            skip_install: false,
            execute_command: config::DEFAULT_EXECUTE_COMMAND.to_string(),
            prevent_sudo: false,
            staging_dir: config::DEFAULT_STAGING_DIR.to_string(),
            clean_staging_dir: false,
            source_dir: None,
            log_level: None,
            shell: None,
            node_json: None,
            node_yaml: None,
            config_file: None,
            color: false,
            extra_arguments: Vec::new(),
            recipes: vec!["r.rb".to_string()],
            ignore_exit_codes: false,
            build: config::BuildIdentity {
                name: "virtualbox".to_string(),
                builder_type: "iso".to_string(),
            },
        }
    }

    #[test]
    fn test_render_default_execute_command() {
        let command = render_execute_command(&base_config()).unwrap();
        assert_eq!(
            command,
            "cd /tmp/packer-itamae && PACKER_BUILD_NAME='virtualbox' \
            PACKER_BUILDER_TYPE='iso' sudo -E itamae local --detailed-exitcode \
            --color='false' r.rb"
        );
    }

    #[test]
    fn test_render_execute_command_with_every_option() {
        let mut config = base_config();
        config.vars = vec!["FOO='bar'".to_string()];
        config.prevent_sudo = true;
        config.color = true;
        config.log_level = Some("debug".to_string());
        config.shell = Some("/bin/bash".to_string());
        config.node_json = Some("node.json".to_string());
        config.node_yaml = Some("node.yml".to_string());
        config.config_file = Some("itamae.yml".to_string());
        config.extra_arguments = vec!["--dry-run".to_string(), "--no-sudo".to_string()];
        config.recipes = vec!["a.rb".to_string(), "b.rb".to_string()];

        let command = render_execute_command(&config).unwrap();
        assert_eq!(
            command,
            "cd /tmp/packer-itamae && PACKER_BUILD_NAME='virtualbox' \
            PACKER_BUILDER_TYPE='iso' FOO='bar' itamae local --detailed-exitcode \
            --color='true' --log-level='debug' --shell='/bin/bash' \
            --node-json='node.json' --node-yaml='node.yml' --config='itamae.yml' \
            --dry-run --no-sudo a.rb b.rb"
        );
    }

    #[test]
    fn test_render_install_command() {
        let mut config = base_config();
        config.gems = vec!["itamae".to_string(), "specinfra-ec2_metadata-tags".to_string()];
        assert_eq!(
            render_install_command(&config).unwrap(),
            "sudo -E gem install --quiet --no-document --no-suggestions \
            itamae specinfra-ec2_metadata-tags"
        );

        config.prevent_sudo = true;
        assert_eq!(
            render_install_command(&config).unwrap(),
            "gem install --quiet --no-document --no-suggestions itamae specinfra-ec2_metadata-tags"
        );
    }

    #[test]
    fn test_execute_template_legacy_field_names() {
        let mut config = base_config();
        config.node_json = Some("n.json".to_string());
        config.node_yaml = Some("n.yml".to_string());
        let data = ExecuteTemplate::from_config(&config);
        let rendered = Template::parse("{{.JsonPath}} {{.YamlPath}}")
            .unwrap()
            .render(&data)
            .unwrap();
        assert_eq!(rendered, "n.json n.yml");
    }

    #[test]
    fn test_build_identity_is_quoted() {
        let mut config = base_config();
        config.build.name = "it's".to_string();
        let data = ExecuteTemplate::from_config(&config);
        assert!(data.vars.starts_with(r#"PACKER_BUILD_NAME='it'"'"'s'"#));
    }

    #[test]
    fn test_zero_valued_templates_render_defaults() {
        let install = template::render(config::DEFAULT_INSTALL_COMMAND, &InstallTemplate::default());
        assert!(install.is_ok());
        let execute = template::render(config::DEFAULT_EXECUTE_COMMAND, &ExecuteTemplate::default());
        assert!(execute.is_ok());
    }

    #[test]
    fn test_render_error_names_template() {
        let mut config = base_config();
        config.execute_command = "{{.Nope}}".to_string();
        let err = render_execute_command(&config).unwrap_err();
        assert!(matches!(err, ProvisionerError::Template { ref name, .. } if name == "execute_command"));
    }
}
