// SPDX-FileCopyrightText: 2025 Maciej Borzecki <maciek.borzecki@gmail.com>
//
// SPDX-License-Identifier: MIT

//! Lifecycle of a disposable guest hosted behind a provisioning server.
//!
//! All guest management commands are issued over SSH to the provisioning
//! server. Once the guest is up, commands are run on the guest itself using
//! the address it reported.

use core::net;
use core::time;
use std::thread;

use bytesize::ByteSize;
use log::{debug, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror;

use crate::config::VmConfig;
use crate::distro::{self, Distro};
use crate::parse::{self, GuestMetadata};
use crate::ssh::{CommandResult, SshCommandBuilder, SshError, SshExecutor};

/// Hypervisor limit on the length of a guest hostname.
pub const HOSTNAME_MAX_LEN: usize = 59;

const RANDOM_PREFIX_LEN: usize = 8;

const SM_STATUS_COMMAND: &str = "subscription-manager status";
const SM_LIST_REPOS_COMMAND: &str = "subscription-manager repos --list";

/// Wraps virtual machine lifecycle errors.
#[derive(thiserror::Error, Debug)]
pub enum VirtualMachineError {
    #[error("{distro} is not a supported distro{}", host_suffix(.host_os_version))]
    UnsupportedDistro {
        distro: String,
        host_os_version: Option<String>,
    },
    #[error("cannot determine allowed distros using host OS version: {0}")]
    IncompatibleHost(String),
    #[error("missing configuration: {0}")]
    MissingConfiguration(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("exception connecting via ssh to {operation} on {host}: {source}")]
    Unreachable {
        operation: String,
        host: String,
        #[source]
        source: SshError,
    },
    #[error("cannot create virtual machine {hostname}: {detail}")]
    Creation { hostname: String, detail: String },
    #[error("virtual machine {0} has not been created")]
    NotCreated(String),
    #[error("virtual machine {0} has already been destroyed")]
    Destroyed(String),
    #[error("cannot destroy virtual machine {hostname}: {detail}")]
    Teardown { hostname: String, detail: String },
}

fn host_suffix(host_os_version: &Option<String>) -> String {
    match host_os_version {
        Some(version) => format!(" using host OS version: {}", version),
        None => String::new(),
    }
}

impl PartialEq for VirtualMachineError {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

/// A way to wait between network readiness checks.
pub trait Sleeper {
    fn sleep(&mut self, duration: time::Duration);
}

/// Blocks the calling thread.
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: time::Duration) {
        thread::sleep(duration);
    }
}

impl<S> Sleeper for &mut S
where
    S: Sleeper + ?Sized,
{
    fn sleep(&mut self, duration: time::Duration) {
        (**self).sleep(duration)
    }
}

/// Lifecycle state of a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Uncreated,
    Ready,
    Destroyed,
}

/// Describes the guest to create. Unset fields fall back to configuration.
#[derive(Debug, Clone, Default)]
pub struct VmOptions {
    pub distro: Option<String>,
    pub tag: Option<String>,
    /// Base image to clone, instead of the one configured for the distro.
    pub target_image: Option<String>,
    pub cpu: Option<u32>,
    pub mem: Option<ByteSize>,
}

impl VmOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_distro(mut self, distro: &str) -> Self {
        self.distro = Some(distro.to_string());
        self
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tag = Some(tag.to_string());
        self
    }

    pub fn with_target_image(mut self, image: &str) -> Self {
        self.target_image = Some(image.to_string());
        self
    }

    pub fn with_cpu(mut self, cpu: u32) -> Self {
        self.cpu = Some(cpu);
        self
    }

    pub fn with_mem(mut self, mem: ByteSize) -> Self {
        self.mem = Some(mem);
        self
    }
}

fn hostify_name(name: &str) -> String {
    String::from_iter(name.chars().map(|c| match c {
        '.' | ':' | '_' | '/' => '-',
        _ => c.to_ascii_lowercase(),
    }))
}

fn random_prefix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RANDOM_PREFIX_LEN)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect()
}

/// Builds `<prefix>[-<tag>]-<image>.<domain>`.
fn derive_hostname(prefix: &str, tag: Option<&str>, image: &str, domain: &str) -> String {
    let mut parts = vec![prefix];
    if let Some(tag) = tag.filter(|t| !t.is_empty()) {
        parts.push(tag);
    }
    parts.push(image);
    format!("{}.{}", hostify_name(&parts.join("-")), domain.to_ascii_lowercase())
}

/// Hostname made of non-empty `[a-z0-9-]` labels joined by `.`, no label
/// starting or ending with `-`.
fn is_valid_hostname(hostname: &str) -> bool {
    hostname.split('.').all(|label| {
        !label.is_empty()
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    })
}

/// Values interpolated unquoted into provisioning server commands must not
/// carry anything the remote shell would interpret.
fn is_shell_safe(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_.:/+=,@".contains(c))
}

/// Queries the OS version of a host, e.g. `RHEL7.2.1`. Returns
/// [`distro::HOST_OS_NOT_AVAILABLE`] when the host does not report a known
/// release.
pub fn host_os_version<E>(
    executor: &mut E,
    host: &str,
    connection_timeout: time::Duration,
) -> Result<String, VirtualMachineError>
where
    E: SshExecutor + ?Sized,
{
    let cmd = SshCommandBuilder::new(distro::HOST_OS_QUERY)
        .on(host)
        .with_connection_timeout(Some(connection_timeout))
        .build();

    let res = executor
        .execute(&cmd)
        .map_err(|e| VirtualMachineError::Unreachable {
            operation: "get host os version".to_string(),
            host: host.to_string(),
            source: e,
        })?;

    if !res.success() {
        warn!(
            "cannot read release of {}, status {}: {}",
            host, res.return_code, res.stderr
        );
        return Ok(distro::HOST_OS_NOT_AVAILABLE.to_string());
    }

    Ok(distro::host_os_version_from_release(&res.stdout_text())
        .unwrap_or_else(|| distro::HOST_OS_NOT_AVAILABLE.to_string()))
}

/// Returns distros which can be provisioned on a host running a given OS
/// version.
pub fn allowed_distros(host_os_version: &str) -> Result<&'static [Distro], VirtualMachineError> {
    distro::allowed_distros(host_os_version)
        .ok_or_else(|| VirtualMachineError::IncompatibleHost(host_os_version.to_string()))
}

/// A disposable guest managed through a provisioning server.
pub struct VirtualMachine<E, S>
where
    E: SshExecutor,
    S: Sleeper,
{
    executor: E,
    sleeper: S,

    distro: Distro,
    host_os_version: String,
    source_image: String,
    hostname: String,
    provisioning_server: String,
    image_dir: String,
    network: String,
    cpu: u32,
    mem: ByteSize,
    connection_timeout: time::Duration,
    poll_attempts: u32,
    poll_interval: time::Duration,

    state: VmState,
    ip_addr: Option<net::Ipv4Addr>,
    metadata: Option<GuestMetadata>,
}

impl<E, S> VirtualMachine<E, S>
where
    E: SshExecutor,
    S: Sleeper,
{
    /// Validates the guest description against configuration and the
    /// provisioning server's OS. The only remote call made is the host OS
    /// version query, issued after all local checks pass.
    pub fn new(
        options: &VmOptions,
        config: &VmConfig,
        mut executor: E,
        sleeper: S,
    ) -> Result<Self, VirtualMachineError> {
        let distro = match options.distro.as_deref() {
            Some(name) => name
                .parse::<Distro>()
                .map_err(|e| VirtualMachineError::UnsupportedDistro {
                    distro: e.0,
                    host_os_version: None,
                })?,
            None => Distro::default(),
        };

        let provisioning_server = config
            .provisioning_server
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                VirtualMachineError::MissingConfiguration(
                    "a provisioning server must be provided".to_string(),
                )
            })?
            .to_string();

        let source_image = match options.target_image.as_deref() {
            Some(image) => image.to_string(),
            None => config.images.get(&distro).cloned().ok_or_else(|| {
                VirtualMachineError::MissingConfiguration(format!(
                    "no image configured for distro {}",
                    distro
                ))
            })?,
        };

        for (what, value) in [
            ("image", source_image.as_str()),
            ("image directory", config.image_dir.as_str()),
            ("network", config.network.as_str()),
        ] {
            if !is_shell_safe(value) {
                return Err(VirtualMachineError::InvalidConfiguration(format!(
                    "{} {:?} contains characters not allowed in remote commands",
                    what, value
                )));
            }
        }

        if config.network_poll.attempts == 0 {
            return Err(VirtualMachineError::InvalidConfiguration(
                "network poll needs at least one attempt".to_string(),
            ));
        }

        let domain = match provisioning_server.split_once('.') {
            Some((_, domain)) if !domain.is_empty() => domain,
            _ => {
                return Err(VirtualMachineError::InvalidConfiguration(format!(
                    "provisioning server {} has no domain",
                    provisioning_server
                )))
            }
        };

        let hostname = derive_hostname(
            &random_prefix(),
            options.tag.as_deref(),
            &source_image,
            domain,
        );
        if hostname.len() > HOSTNAME_MAX_LEN {
            return Err(VirtualMachineError::InvalidConfiguration(format!(
                "hostname {} is {} characters long, limit is {}",
                hostname,
                hostname.len(),
                HOSTNAME_MAX_LEN
            )));
        }
        if !is_valid_hostname(&hostname) {
            return Err(VirtualMachineError::InvalidConfiguration(format!(
                "{:?} is not a valid hostname",
                hostname
            )));
        }

        let host_os_version =
            host_os_version(&mut executor, &provisioning_server, config.connection_timeout())?;
        debug!("provisioning server runs {}", host_os_version);

        if !allowed_distros(&host_os_version)?.contains(&distro) {
            return Err(VirtualMachineError::UnsupportedDistro {
                distro: distro.to_string(),
                host_os_version: Some(host_os_version),
            });
        }

        Ok(Self {
            executor,
            sleeper,
            distro,
            host_os_version,
            source_image,
            hostname,
            provisioning_server,
            image_dir: config.image_dir.trim_end_matches('/').to_string(),
            network: config.network.clone(),
            cpu: options.cpu.unwrap_or(config.resources.cpu),
            mem: options.mem.unwrap_or(config.resources.mem),
            connection_timeout: config.connection_timeout(),
            poll_attempts: config.network_poll.attempts,
            poll_interval: config.network_poll.interval(),
            state: VmState::Uncreated,
            ip_addr: None,
            metadata: None,
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn distro(&self) -> Distro {
        self.distro
    }

    pub fn host_os_version(&self) -> &str {
        &self.host_os_version
    }

    pub fn source_image(&self) -> &str {
        &self.source_image
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    /// True once the guest is up and until it is destroyed.
    pub fn created(&self) -> bool {
        self.state == VmState::Ready
    }

    pub fn ip_addr(&self) -> Option<net::Ipv4Addr> {
        self.ip_addr
    }

    /// Guest properties reported during creation, if any.
    pub fn metadata(&self) -> Option<&GuestMetadata> {
        self.metadata.as_ref()
    }

    fn creation_error(&self, detail: impl Into<String>) -> VirtualMachineError {
        VirtualMachineError::Creation {
            hostname: self.hostname.clone(),
            detail: detail.into(),
        }
    }

    fn teardown_error(&self, detail: impl Into<String>) -> VirtualMachineError {
        VirtualMachineError::Teardown {
            hostname: self.hostname.clone(),
            detail: detail.into(),
        }
    }

    fn provisioning_command(&mut self, command: &str) -> Result<CommandResult, SshError> {
        let cmd = SshCommandBuilder::new(command)
            .on(&self.provisioning_server)
            .with_connection_timeout(Some(self.connection_timeout))
            .build();
        self.executor.execute(&cmd)
    }

    fn snap_guest_command(&self) -> String {
        format!(
            "snap-guest -b {} -t {} -m {} -c {} -n {} -f -p {}",
            self.source_image,
            self.hostname,
            self.mem.as_u64() / bytesize::MIB,
            self.cpu,
            self.network,
            self.image_dir,
        )
    }

    fn guest_agent_command(&self) -> String {
        format!(
            "virsh qemu-agent-command {} '{{\"execute\":\"guest-network-get-interfaces\"}}'",
            self.hostname
        )
    }

    fn legacy_address_command(&self) -> String {
        format!("ping -c1 {}", self.hostname)
    }

    fn ssh_port_wait_command(addr: net::Ipv4Addr) -> String {
        format!(
            "for i in {{1..60}}; do nc -vn {} 22 <<< \"\" && exit 0; sleep 1; done; exit 1",
            addr
        )
    }

    fn teardown_commands(&self) -> [String; 3] {
        [
            format!("virsh destroy {}", self.hostname),
            format!("virsh undefine {}", self.hostname),
            format!("rm {}/{}.img", self.image_dir, self.hostname),
        ]
    }

    fn query_guest_agent(&mut self) -> Result<Option<net::Ipv4Addr>, VirtualMachineError> {
        let cmd = self.guest_agent_command();
        let res = self
            .provisioning_command(&cmd)
            .map_err(|e| self.creation_error(format!("cannot query guest agent: {}", e)))?;

        if !res.success() {
            debug!("guest agent not ready, status {}", res.return_code);
            return Ok(None);
        }

        match parse::parse_guest_agent_address(&res.stdout_text()) {
            Ok(addr) => Ok(addr),
            Err(err) => {
                warn!("{}", err);
                Ok(None)
            }
        }
    }

    fn query_legacy_address(&mut self) -> Result<Option<net::Ipv4Addr>, VirtualMachineError> {
        let cmd = self.legacy_address_command();
        let res = self
            .provisioning_command(&cmd)
            .map_err(|e| self.creation_error(format!("cannot inspect guest address: {}", e)))?;

        if !res.success() {
            debug!("guest address not resolvable, status {}", res.return_code);
            return Ok(None);
        }

        match parse::parse_legacy_address(&res.stdout) {
            Ok(addr) => Ok(addr),
            Err(err) => {
                warn!("{}", err);
                Ok(None)
            }
        }
    }

    fn wait_for_address(&mut self) -> Result<net::Ipv4Addr, VirtualMachineError> {
        for attempt in 1..=self.poll_attempts {
            if attempt > 1 {
                self.sleeper.sleep(self.poll_interval);
            }
            debug!(
                "waiting for address, attempt {}/{}",
                attempt, self.poll_attempts
            );

            if let Some(addr) = self.query_guest_agent()? {
                return Ok(addr);
            }
            if let Some(addr) = self.query_legacy_address()? {
                return Ok(addr);
            }
        }

        Err(self.creation_error(format!(
            "cannot obtain IP address after {} attempts",
            self.poll_attempts
        )))
    }

    fn wait_for_ssh(&mut self, addr: net::Ipv4Addr) -> Result<(), VirtualMachineError> {
        let cmd = Self::ssh_port_wait_command(addr);
        let res = self
            .provisioning_command(&cmd)
            .map_err(|e| self.creation_error(format!("cannot wait for ssh: {}", e)))?;

        if !res.success() {
            return Err(self.creation_error(format!("ssh port of {} is not reachable", addr)));
        }
        Ok(())
    }

    /// Clones the base image, boots the guest and waits until it is reachable
    /// over SSH. Does nothing if the guest is already created. Remote state
    /// is not rolled back on failure.
    pub fn create(&mut self) -> Result<(), VirtualMachineError> {
        match self.state {
            VmState::Ready => {
                debug!("{} already created", self.hostname);
                return Ok(());
            }
            VmState::Destroyed => {
                return Err(VirtualMachineError::Destroyed(self.hostname.clone()));
            }
            VmState::Uncreated => {}
        }

        debug!("creating {} from {}", self.hostname, self.source_image);

        let cmd = self.snap_guest_command();
        let res = self
            .provisioning_command(&cmd)
            .map_err(|e| self.creation_error(e.to_string()))?;
        if !res.success() {
            return Err(self.creation_error(format!(
                "snap-guest exited with status {}: {}",
                res.return_code, res.stderr
            )));
        }

        self.metadata = match parse::parse_metadata(&res.stdout) {
            Ok(Some(meta)) => {
                debug!("guest metadata: {:?}", meta);
                Some(meta)
            }
            Ok(None) => {
                warn!("no guest metadata in snap-guest output");
                None
            }
            Err(err) => {
                return Err(self.creation_error(format!("cannot parse guest metadata: {}", err)))
            }
        };

        let addr = self.wait_for_address()?;
        self.wait_for_ssh(addr)?;

        debug!("{} is up at {}", self.hostname, addr);
        self.ip_addr = Some(addr);
        self.state = VmState::Ready;
        Ok(())
    }

    /// Runs a command on the guest. A non-zero exit status is not an error.
    pub fn run(
        &mut self,
        command: &str,
        timeout: Option<time::Duration>,
    ) -> Result<CommandResult, VirtualMachineError> {
        let addr = match (self.state, self.ip_addr) {
            (VmState::Ready, Some(addr)) => addr.to_string(),
            _ => return Err(VirtualMachineError::NotCreated(self.hostname.clone())),
        };

        let cmd = SshCommandBuilder::new(command)
            .on(&addr)
            .with_timeout(timeout)
            .build();

        self.executor
            .execute(&cmd)
            .map_err(|e| VirtualMachineError::Unreachable {
                operation: format!("run {:?}", command),
                host: addr,
                source: e,
            })
    }

    pub fn subscription_manager_status(&mut self) -> Result<CommandResult, VirtualMachineError> {
        self.run(SM_STATUS_COMMAND, None)
    }

    pub fn subscription_manager_list_repos(
        &mut self,
    ) -> Result<CommandResult, VirtualMachineError> {
        self.run(SM_LIST_REPOS_COMMAND, None)
    }

    /// Stops and undefines the guest, then removes its image. Does nothing
    /// unless the guest is created. A step exiting with non-zero status is
    /// tolerated, a transport failure aborts the teardown and leaves the
    /// guest in created state.
    pub fn destroy(&mut self) -> Result<(), VirtualMachineError> {
        if self.state != VmState::Ready {
            debug!("{} not created, nothing to destroy", self.hostname);
            return Ok(());
        }

        for command in self.teardown_commands() {
            let res = self
                .provisioning_command(&command)
                .map_err(|e| self.teardown_error(format!("{}: {}", command, e)))?;
            if !res.success() {
                warn!(
                    "'{}' exited with status {}: {}",
                    command, res.return_code, res.stderr
                );
            }
        }

        debug!("{} destroyed", self.hostname);
        self.state = VmState::Destroyed;
        Ok(())
    }
}
