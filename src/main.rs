// SPDX-FileCopyrightText: 2024 Maciej Borzecki <maciek.borzecki@gmail.com>
//
// SPDX-License-Identifier: MIT

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log;
use simple_logger;

use remote_vm::config::{self, VmConfig};
use remote_vm::ssh::{CommandResult, OpenSshExecutor};
use remote_vm::vm::{self, ThreadSleeper};
use remote_vm::{VirtualMachine, VmOptions};

const VERSION: &str = match option_env!("REMOTE_VM_GIT_VERSION") {
    Some(vers) => vers,
    None => env!("CARGO_PKG_VERSION"),
};

#[derive(Parser)]
#[command(
    name = "remote-vm",
    version = VERSION,
    about = "Create disposable guests through a provisioning server"
)]
struct Cli {
    /// Configuration file, looked up from the current directory if not given
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Increase log verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Show the provisioning server's OS version and the distros it can serve
    HostInfo,
    /// Create a guest, run a command on it and destroy it
    Exec {
        #[command(flatten)]
        guest: GuestArgs,
        /// Command timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Create a guest, show its subscription status and destroy it
    Status {
        #[command(flatten)]
        guest: GuestArgs,
    },
}

#[derive(Args)]
struct GuestArgs {
    #[arg(long)]
    distro: Option<String>,
    #[arg(long)]
    tag: Option<String>,
    /// Base image, overrides the one configured for the distro
    #[arg(long)]
    image: Option<String>,
}

impl GuestArgs {
    fn options(&self) -> VmOptions {
        VmOptions {
            distro: self.distro.clone(),
            tag: self.tag.clone(),
            target_image: self.image.clone(),
            ..Default::default()
        }
    }
}

type Guest = VirtualMachine<OpenSshExecutor, ThreadSleeper>;

fn load_config(path: Option<&Path>) -> Result<VmConfig> {
    let cfg_path = match path {
        Some(p) => p.to_path_buf(),
        None => config::locate(config::config_file_name())
            .with_context(|| format!("cannot find config file {}", config::config_file_name()))?,
    };

    log::debug!("loading config from {}", cfg_path.display());

    VmConfig::from_path(&cfg_path)
        .with_context(|| format!("cannot load config from {}", cfg_path.display()))
}

fn print_result(res: &CommandResult) {
    for line in res.stdout.iter() {
        println!("{}", line);
    }
    if !res.stderr.is_empty() {
        eprintln!("{}", res.stderr);
    }
}

fn exit_code(return_code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(return_code).unwrap_or(1))
}

/// Creates a guest, hands it over and destroys it regardless of the outcome.
fn with_guest<F>(
    args: &GuestArgs,
    conf: &VmConfig,
    executor: OpenSshExecutor,
    f: F,
) -> Result<ExitCode>
where
    F: FnOnce(&mut Guest) -> Result<ExitCode>,
{
    let mut guest = VirtualMachine::new(&args.options(), conf, executor, ThreadSleeper)
        .context("cannot set up virtual machine")?;
    log::info!("creating {}", guest.hostname());

    let res = guest
        .create()
        .context("cannot create virtual machine")
        .and_then(|_| f(&mut guest));

    if !guest.created() {
        log::warn!(
            "{} was not fully created, remote resources may need manual cleanup",
            guest.hostname()
        );
    }
    if let Err(err) = guest.destroy() {
        log::error!("{}", err);
    }

    res
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => log::Level::Warn,
        1 => log::Level::Info,
        2 => log::Level::Debug,
        _ => log::Level::Trace,
    };
    simple_logger::init_with_level(level).context("cannot set up logging")?;

    let conf = load_config(cli.config.as_deref())?;
    let mut executor = OpenSshExecutor::new(&conf.ssh.user)
        .with_port(conf.ssh.port)
        .with_identity_file(conf.ssh.identity_file.clone());

    match cli.action {
        Action::HostInfo => {
            let server = conf
                .provisioning_server
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .context("no provisioning server configured")?;
            let version = vm::host_os_version(&mut executor, server, conf.connection_timeout())?;
            println!("host OS version: {}", version);
            let allowed = vm::allowed_distros(&version)?;
            println!(
                "allowed distros: {}",
                allowed
                    .iter()
                    .map(|d| d.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            Ok(ExitCode::SUCCESS)
        }
        Action::Exec {
            guest,
            timeout,
            command,
        } => with_guest(&guest, &conf, executor, |machine| {
            let res = machine
                .run(&command.join(" "), timeout.map(Duration::from_secs))
                .context("cannot run command")?;
            print_result(&res);
            Ok(exit_code(res.return_code))
        }),
        Action::Status { guest } => with_guest(&guest, &conf, executor, |machine| {
            print_result(&machine.subscription_manager_status()?);
            print_result(&machine.subscription_manager_list_repos()?);
            Ok(ExitCode::SUCCESS)
        }),
    }
}
