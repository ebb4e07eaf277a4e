// SPDX-FileCopyrightText: 2024 Maciej Borzecki <maciek.borzecki@gmail.com>
//
// SPDX-License-Identifier: MIT

use core::time;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::io::{self, Error};
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use log;
use serde;
use serde_yml;
use thiserror;

use crate::distro::Distro;

const CONFIG_FILE_NAME: &str = "remote-vm.yaml";

/// Returns the name of the configuration file.
pub fn config_file_name() -> &'static str {
    CONFIG_FILE_NAME
}

/// Locates the configuration file, first by walking up from the current
/// directory, then in the user's configuration directory.
pub fn locate(name: &str) -> Result<PathBuf, Error> {
    let start_dir = &env::current_dir().and_then(fs::canonicalize)?;
    let mut dir = Some(Path::new(start_dir));

    while let Some(curdir) = dir {
        log::debug!("checking {}", curdir.display());
        let conf = curdir.join(name);
        if conf.exists() {
            log::debug!("found config {}", conf.display());
            return Ok(conf);
        }
        dir = curdir.parent();
    }

    if let Some(dirs) = ProjectDirs::from("", "", "remote-vm") {
        let conf = dirs.config_dir().join(name);
        log::debug!("checking {}", conf.display());
        if conf.exists() {
            return Ok(conf);
        }
    }

    Err(Error::other(format!("cannot find {name}")))
}

/// Wraps configuration loading errors.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("cannot load configuration: {0}")]
    Parse(serde_yml::Error),
    #[error("cannot read configuration: {0}")]
    Io(io::Error),
}

fn default_image_dir() -> String {
    "/var/lib/libvirt/images".to_string()
}

fn default_network() -> String {
    "bridge=br0".to_string()
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_mem() -> bytesize::ByteSize {
    bytesize::ByteSize::mib(512)
}

fn default_cpu() -> u32 {
    1
}

fn default_poll_attempts() -> u32 {
    60
}

fn default_poll_interval() -> u64 {
    5
}

fn default_user() -> String {
    "root".to_string()
}

fn default_port() -> u16 {
    22
}

/// Resources assigned to a guest.
#[derive(serde::Deserialize, Debug, Clone, PartialEq)]
pub struct Resources {
    /// RAM
    #[serde(default = "default_mem")]
    pub mem: bytesize::ByteSize,
    /// Number of CPUs.
    #[serde(default = "default_cpu")]
    pub cpu: u32,
}

impl Default for Resources {
    fn default() -> Self {
        Resources {
            mem: default_mem(),
            cpu: default_cpu(),
        }
    }
}

/// Budget for waiting until a guest reports its address.
#[derive(serde::Deserialize, Debug, Clone, PartialEq)]
pub struct NetworkPoll {
    #[serde(default = "default_poll_attempts")]
    pub attempts: u32,
    /// Seconds between attempts.
    #[serde(default = "default_poll_interval")]
    pub interval: u64,
}

impl NetworkPoll {
    pub fn interval(&self) -> time::Duration {
        time::Duration::from_secs(self.interval)
    }
}

impl Default for NetworkPoll {
    fn default() -> Self {
        NetworkPoll {
            attempts: default_poll_attempts(),
            interval: default_poll_interval(),
        }
    }
}

/// SSH client settings.
#[derive(serde::Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct SshSettings {
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
}

impl Default for SshSettings {
    fn default() -> Self {
        SshSettings {
            user: default_user(),
            port: default_port(),
            identity_file: None,
        }
    }
}

/// Configuration of guests created through a provisioning server.
#[derive(serde::Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct VmConfig {
    /// Host through which all guest lifecycle commands are issued.
    #[serde(default)]
    pub provisioning_server: Option<String>,
    /// Directory holding guest images on the provisioning server.
    #[serde(default = "default_image_dir")]
    pub image_dir: String,
    /// Base images, keyed by distro.
    #[serde(default)]
    pub images: HashMap<Distro, String>,
    #[serde(default)]
    pub resources: Resources,
    /// Network specification passed to the clone tool.
    #[serde(default = "default_network")]
    pub network: String,
    /// Seconds allowed for connecting to the provisioning server.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    #[serde(default)]
    pub network_poll: NetworkPoll,
    #[serde(default)]
    pub ssh: SshSettings,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            provisioning_server: None,
            image_dir: default_image_dir(),
            images: HashMap::new(),
            resources: Resources::default(),
            network: default_network(),
            connection_timeout: default_connection_timeout(),
            network_poll: NetworkPoll::default(),
            ssh: SshSettings::default(),
        }
    }
}

impl VmConfig {
    /// Loads configuration from the provided reader.
    pub fn from_reader<R>(cfg: R) -> Result<Self, ConfigError>
    where
        R: io::Read,
    {
        let conf: VmConfig = serde_yml::from_reader(cfg).map_err(ConfigError::Parse)?;
        log::debug!("config: {:?}", conf);
        Ok(conf)
    }

    /// Loads configuration from a file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let f = fs::File::open(path).map_err(ConfigError::Io)?;
        Self::from_reader(f)
    }

    pub fn with_provisioning_server(mut self, server: &str) -> Self {
        self.provisioning_server = Some(server.to_string());
        self
    }

    pub fn with_image(mut self, distro: Distro, image: &str) -> Self {
        self.images.insert(distro, image.to_string());
        self
    }

    pub fn connection_timeout(&self) -> time::Duration {
        time::Duration::from_secs(self.connection_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_CONFIG: &str = r##"
provisioning-server: provisioning.example.com
image-dir: /opt/robottelo/images
images:
  rhel6: rhel6-base
  rhel7: rhel7-base
resources:
  mem: 2 GiB
  cpu: 2
network: bridge=virbr1
connection-timeout: 10
network-poll:
  attempts: 3
  interval: 1
ssh:
  user: cloud-user
  port: 2222
  identity-file: /home/ci/.ssh/id_ed25519
"##;

    #[test]
    fn test_full_config() {
        let conf = VmConfig::from_reader(FULL_CONFIG.as_bytes()).expect("cannot load config");
        assert_eq!(
            conf,
            VmConfig {
                provisioning_server: Some("provisioning.example.com".to_string()),
                image_dir: "/opt/robottelo/images".to_string(),
                images: HashMap::from([
                    (Distro::Rhel6, "rhel6-base".to_string()),
                    (Distro::Rhel7, "rhel7-base".to_string()),
                ]),
                resources: Resources {
                    mem: bytesize::ByteSize::gib(2),
                    cpu: 2,
                },
                network: "bridge=virbr1".to_string(),
                connection_timeout: 10,
                network_poll: NetworkPoll {
                    attempts: 3,
                    interval: 1,
                },
                ssh: SshSettings {
                    user: "cloud-user".to_string(),
                    port: 2222,
                    identity_file: Some(PathBuf::from("/home/ci/.ssh/id_ed25519")),
                },
            }
        );
        assert_eq!(conf.connection_timeout(), time::Duration::from_secs(10));
        assert_eq!(conf.network_poll.interval(), time::Duration::from_secs(1));
    }

    #[test]
    fn test_defaults() {
        let conf = VmConfig::from_reader("provisioning-server: prov.example.com\n".as_bytes())
            .expect("cannot load config");
        assert_eq!(
            conf,
            VmConfig::default().with_provisioning_server("prov.example.com")
        );
        assert_eq!(conf.resources.mem, bytesize::ByteSize::mib(512));
        assert_eq!(conf.connection_timeout(), time::Duration::from_secs(30));
    }

    #[test]
    fn test_unknown_distro_key() {
        let res = VmConfig::from_reader("images:\n  debian12: foo\n".as_bytes());
        assert!(matches!(res, Err(ConfigError::Parse(_))));
    }
}
