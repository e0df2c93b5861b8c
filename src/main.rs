use std::io;
use std::process;

use anyhow::Result;
use tracing::error;

use packer_provisioner_itamae::cli::{self, Commands};
use packer_provisioner_itamae::communicator::LocalCommunicator;
use packer_provisioner_itamae::ui::ConsoleUi;
use packer_provisioner_itamae::{init_logging, run_apply, run_serve, run_validate, version};

fn main() -> Result<()> {
    let args = cli::parse_args()?;

    if args.version {
        println!("{}", version::banner());
        return Ok(());
    }

    init_logging(args.log_level)?;

    let result = match &args.command {
        None | Some(Commands::Serve) => run_serve(),
        Some(Commands::Version) => {
            println!("{}", version::banner());
            Ok(())
        }
        Some(Commands::Validate(opts)) => run_validate(opts),
        Some(Commands::Apply(opts)) => {
            let comm = LocalCommunicator::new(opts.dry_run);
            run_apply(opts, &comm, &ConsoleUi::stdout())
        }
        Some(Commands::Completions(opts)) => {
            packer_provisioner_itamae::write_completions(opts.shell, &mut io::stdout());
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("{:#}", e);
        process::exit(1);
    }

    Ok(())
}
