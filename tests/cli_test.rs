use anyhow::Result;
use clap::Parser;
use packer_provisioner_itamae::cli::{Cli, Commands, LogLevel};

#[test]
fn test_no_subcommand_serves() -> Result<()> {
    let args = Cli::parse_from(["packer-provisioner-itamae"]);
    assert!(args.command.is_none());
    assert!(!args.version);
    assert_eq!(args.log_level, LogLevel::Info);
    Ok(())
}

#[test]
fn test_parse_serve_command() -> Result<()> {
    let args = Cli::parse_from(["packer-provisioner-itamae", "serve"]);
    assert!(matches!(args.command, Some(Commands::Serve)));
    Ok(())
}

#[test]
fn test_parse_version_flags() -> Result<()> {
    for flag in ["-v", "--version"] {
        let args = Cli::parse_from(["packer-provisioner-itamae", flag]);
        assert!(args.version, "expected {} to set the version flag", flag);
    }

    let args = Cli::parse_from(["packer-provisioner-itamae", "version"]);
    assert!(matches!(args.command, Some(Commands::Version)));
    assert!(!args.version);
    Ok(())
}

#[test]
fn test_parse_apply_command() -> Result<()> {
    let args = Cli::parse_from(["packer-provisioner-itamae", "apply", "--file", "test.yml"]);

    match args.command {
        Some(Commands::Apply(opts)) => {
            assert_eq!(opts.file, "test.yml");
            assert!(!opts.dry_run);
        }
        _ => panic!("Expected Apply command"),
    }

    Ok(())
}

#[test]
fn test_parse_apply_command_with_flags() -> Result<()> {
    let args = Cli::parse_from([
        "packer-provisioner-itamae",
        "apply",
        "--file",
        "test.yml",
        "--dry-run",
        "--log-level",
        "debug",
    ]);

    match args.command {
        Some(Commands::Apply(opts)) => {
            assert_eq!(opts.file, "test.yml");
            assert!(opts.dry_run);
        }
        _ => panic!("Expected Apply command"),
    }
    assert_eq!(args.log_level, LogLevel::Debug);

    Ok(())
}

#[test]
fn test_parse_validate_command() -> Result<()> {
    let args = Cli::parse_from(["packer-provisioner-itamae", "validate", "--file", "test.yml"]);

    match args.command {
        Some(Commands::Validate(opts)) => {
            assert_eq!(opts.file, "test.yml");
        }
        _ => panic!("Expected Validate command"),
    }

    Ok(())
}

#[test]
fn test_default_file_argument() -> Result<()> {
    let args = Cli::parse_from(["packer-provisioner-itamae", "validate"]);
    match args.command {
        Some(Commands::Validate(opts)) => assert_eq!(opts.file, "itamae.yaml"),
        _ => panic!("Expected Validate command"),
    }
    Ok(())
}

#[test]
fn test_help_is_reported_as_display_help() {
    for flag in ["-h", "--help", "help"] {
        let err = Cli::try_parse_from(["packer-provisioner-itamae", flag]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp, "flag {}", flag);
        assert_eq!(err.exit_code(), 0);
    }
}

#[test]
fn test_invalid_log_level_is_rejected() {
    let result = Cli::try_parse_from(["packer-provisioner-itamae", "--log-level", "verbose"]);
    assert!(result.is_err());
}
