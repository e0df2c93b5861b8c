mod helpers;

use std::time::Duration;

use anyhow::Result;
use packer_provisioner_itamae::error::ProvisionerError;
use packer_provisioner_itamae::guest::GuestOsType;
use packer_provisioner_itamae::provisioner::{Provisioner, render_execute_command};

use helpers::{MockCommunicator, RecipeDir, RecordingUi, fragment, prepared, provisioner};

const E2E_COMMAND: &str = "cd /tmp/packer-itamae && PACKER_BUILD_NAME='virtualbox' \
    PACKER_BUILDER_TYPE='iso' sudo -E itamae local --detailed-exitcode --color='false' r.rb";

/// Configuration with a single `r.rb` recipe inside a source directory.
fn source_dir_config(recipes: &RecipeDir, extra: &str) -> String {
    recipes.write("r.rb", "package 'nginx'\n");
    format!(
        "source_directory: '{}'\nrecipes: [r.rb]\npacker_build_name: virtualbox\n\
        packer_builder_type: iso\n{}",
        recipes.path(),
        extra
    )
}

#[test]
fn test_provision_end_to_end() -> Result<()> {
    let recipes = RecipeDir::new();
    let provisioner = prepared(&[&source_dir_config(&recipes, "")]);
    let comm = MockCommunicator::new();
    let ui = RecordingUi::new();

    provisioner.provision(&ui, &comm)?;

    assert_eq!(
        comm.commands(),
        vec![
            "sudo -E gem install --quiet --no-document --no-suggestions \
            itamae specinfra-ec2_metadata-tags"
                .to_string(),
            "sudo mkdir -p '/tmp/packer-itamae'".to_string(),
            "sudo chmod 0777 '/tmp/packer-itamae'".to_string(),
            E2E_COMMAND.to_string(),
        ]
    );
    assert_eq!(
        *comm.dir_uploads.borrow(),
        vec![("/tmp/packer-itamae".to_string(), format!("{}/", recipes.path()))]
    );
    assert!(comm.uploads.borrow().is_empty());

    assert_eq!(*ui.says.borrow(), vec!["Provisioning with Itamae..."]);
    let messages = ui.messages.borrow();
    assert!(messages.contains(&"Installing Itamae...".to_string()));
    assert!(messages.contains(&"Uploading source directory to staging directory...".to_string()));
    assert!(messages.contains(&format!("Executing: {}", E2E_COMMAND)));
    Ok(())
}

#[test]
fn test_rendered_execute_command_is_deterministic() {
    let recipes = RecipeDir::new();
    let provisioner = prepared(&[&source_dir_config(&recipes, "")]);
    let config = provisioner.config().unwrap();

    let first = render_execute_command(config).unwrap();
    let second = render_execute_command(config).unwrap();
    assert_eq!(first, E2E_COMMAND);
    assert_eq!(first, second);
}

#[test]
fn test_recipes_are_uploaded_individually_without_source_directory() -> Result<()> {
    let recipes = RecipeDir::new();
    let first = recipes.write("a.rb", "a");
    let second = recipes.write("roles/b.rb", "b");
    let provisioner = prepared(&[&format!(
        "recipes: ['{}', '{}']\nskip_install: true",
        first, second
    )]);
    let comm = MockCommunicator::new();

    provisioner.provision(&RecordingUi::new(), &comm)?;

    let uploads = comm.uploads.borrow();
    assert_eq!(uploads.len(), 2);
    assert_eq!(uploads[0].0, format!("/tmp/packer-itamae{}", first));
    assert_eq!(uploads[0].1, b"a");
    assert_eq!(uploads[1].0, format!("/tmp/packer-itamae{}", second));
    assert_eq!(uploads[1].1, b"b");
    assert!(comm.dir_uploads.borrow().is_empty());
    Ok(())
}

#[test]
fn test_skip_install_never_renders_install_command() -> Result<()> {
    let recipes = RecipeDir::new();
    let provisioner = prepared(&[&source_dir_config(&recipes, "skip_install: true")]);
    let comm = MockCommunicator::new();
    let ui = RecordingUi::new();

    provisioner.provision(&ui, &comm)?;

    assert_eq!(comm.count("gem install"), 0);
    assert!(!ui.output().contains("gem install"));
    assert!(!ui.output().contains("Installing Itamae..."));
    Ok(())
}

#[test]
fn test_prevent_sudo_removes_sudo_everywhere() -> Result<()> {
    let recipes = RecipeDir::new();
    let provisioner = prepared(&[&source_dir_config(&recipes, "prevent_sudo: true")]);
    let comm = MockCommunicator::new();

    provisioner.provision(&RecordingUi::new(), &comm)?;

    let commands = comm.commands();
    assert_eq!(commands.len(), 4);
    for command in &commands {
        assert!(!command.contains("sudo"), "unexpected sudo in {}", command);
    }
    assert_eq!(commands[1], "mkdir -p '/tmp/packer-itamae'");
    Ok(())
}

#[test]
fn test_exit_status_policy() {
    let cases = [
        (0, false, true),
        (1, false, false),
        (2, false, true),
        (3, false, false),
        (1, true, true),
        (127, true, true),
    ];

    for (status, ignore, should_pass) in cases {
        let recipes = RecipeDir::new();
        let extra = format!("skip_install: true\nignore_exit_codes: {}", ignore);
        let provisioner = prepared(&[&source_dir_config(&recipes, &extra)]);
        let comm = MockCommunicator::new().with_statuses("itamae local", &[status]);

        let result = provisioner.provision(&RecordingUi::new(), &comm);
        assert_eq!(
            result.is_ok(),
            should_pass,
            "status {} with ignore_exit_codes={}: {:?}",
            status,
            ignore,
            result
        );
        if let Err(err) = result {
            let message = format!("{:#}", err);
            assert!(message.starts_with("Error executing Itamae: "), "{}", message);
            assert!(message.contains(&format!("non-zero exit status {}", status)));
        }
    }
}

#[test]
fn test_install_is_retried_until_success() -> Result<()> {
    let recipes = RecipeDir::new();
    let provisioner = prepared(&[&source_dir_config(&recipes, "install_retry_timeout: 10s")]);
    let comm = MockCommunicator::new().with_statuses("gem install", &[1, 1, 0]);

    provisioner.provision(&RecordingUi::new(), &comm)?;

    assert_eq!(comm.count("gem install"), 3);
    assert_eq!(comm.count("itamae local"), 1);
    Ok(())
}

#[test]
fn test_install_failure_after_deadline() {
    let recipes = RecipeDir::new();
    let provisioner = prepared(&[&source_dir_config(&recipes, "install_retry_timeout: 50ms")])
        .with_retry_interval(Duration::from_millis(5));
    let comm = MockCommunicator::new().with_statuses("gem install", &[1]);

    let err = provisioner
        .provision(&RecordingUi::new(), &comm)
        .unwrap_err();

    assert!(format!("{:#}", err).starts_with("Error installing Itamae: "));
    assert!(comm.count("gem install") >= 2);
    assert_eq!(comm.count("mkdir"), 0);
}

#[test]
fn test_oversized_install_timeout_is_rejected_by_prepare() {
    let recipes = RecipeDir::new();
    let mut provisioner = provisioner();

    let err = provisioner
        .prepare(&[fragment(&source_dir_config(
            &recipes,
            "install_retry_timeout: 18446744073709551615",
        ))])
        .unwrap_err();

    assert!(matches!(err, ProvisionerError::Decode(_)), "{:?}", err);
    assert!(err.to_string().contains("invalid duration"));
    assert!(provisioner.config().is_none());
}

#[test]
fn test_longest_install_timeout_provisions_without_overflow() -> Result<()> {
    let recipes = RecipeDir::new();
    let provisioner = prepared(&[&source_dir_config(&recipes, "install_retry_timeout: 2562047h")]);
    let comm = MockCommunicator::new().with_statuses("gem install", &[1, 0]);

    provisioner.provision(&RecordingUi::new(), &comm)?;

    assert_eq!(comm.count("gem install"), 2);
    assert_eq!(comm.count("itamae local"), 1);
    Ok(())
}

#[test]
fn test_staging_directory_failure_stops_the_run() {
    let recipes = RecipeDir::new();
    let provisioner = prepared(&[&source_dir_config(&recipes, "skip_install: true")]);
    let comm = MockCommunicator::new().with_statuses("chmod", &[1]);

    let err = provisioner
        .provision(&RecordingUi::new(), &comm)
        .unwrap_err();

    assert!(format!("{:#}", err).starts_with("Error creating staging directory: "));
    assert_eq!(comm.count("itamae local"), 0);
    assert!(comm.dir_uploads.borrow().is_empty());
}

#[test]
fn test_upload_failures_are_wrapped() {
    let recipes = RecipeDir::new();
    let provisioner = prepared(&[&source_dir_config(&recipes, "skip_install: true")]);
    let comm = MockCommunicator::new().with_failing_uploads();
    let err = provisioner
        .provision(&RecordingUi::new(), &comm)
        .unwrap_err();
    assert!(format!("{:#}", err).starts_with("Error uploading source directory: "));

    let recipe = recipes.write("single.rb", "");
    let provisioner = prepared(&[&format!("recipes: ['{}']\nskip_install: true", recipe)]);
    let comm = MockCommunicator::new().with_failing_uploads();
    let err = provisioner
        .provision(&RecordingUi::new(), &comm)
        .unwrap_err();
    assert!(format!("{:#}", err).starts_with("Error uploading recipe: "));
}

#[test]
fn test_clean_staging_directory() -> Result<()> {
    let recipes = RecipeDir::new();
    let provisioner = prepared(&[&source_dir_config(
        &recipes,
        "skip_install: true\nclean_staging_directory: true",
    )]);
    let comm = MockCommunicator::new();

    provisioner.provision(&RecordingUi::new(), &comm)?;
    assert_eq!(
        comm.commands().last().map(String::as_str),
        Some("sudo rm -rf '/tmp/packer-itamae'")
    );

    let comm = MockCommunicator::new().with_statuses("rm -rf", &[1]);
    let err = provisioner
        .provision(&RecordingUi::new(), &comm)
        .unwrap_err();
    assert!(format!("{:#}", err).starts_with("Error removing staging directory: "));
    Ok(())
}

#[test]
fn test_windows_guest_commands() -> Result<()> {
    let recipes = RecipeDir::new();
    let mut provisioner = Provisioner::new().with_guest_os(GuestOsType::Windows);
    provisioner.prepare(&[fragment(&source_dir_config(
        &recipes,
        "skip_install: true\nstaging_directory: C:/Windows/Temp/itamae",
    ))])?;
    let comm = MockCommunicator::new();

    provisioner.provision(&RecordingUi::new(), &comm)?;

    let commands = comm.commands();
    assert!(commands[0].starts_with("powershell.exe -Command \"New-Item"));
    assert!(commands[0].contains("C:\\Windows\\Temp\\itamae"));
    assert_eq!(commands[1], "echo 'skipping chmod C:\\Windows\\Temp\\itamae'");
    Ok(())
}

#[test]
fn test_provision_requires_prepare() {
    let err = provisioner()
        .provision(&RecordingUi::new(), &MockCommunicator::new())
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ProvisionerError>(),
        Some(ProvisionerError::NotPrepared)
    ));
    assert_eq!(err.to_string(), "provisioner has not been prepared");
}

#[test]
fn test_failed_prepare_leaves_provisioner_unprepared() {
    let mut provisioner = provisioner();
    assert!(provisioner.prepare(&[fragment("recipes: []")]).is_err());
    assert!(provisioner.config().is_none());
}
