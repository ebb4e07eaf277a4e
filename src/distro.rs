// SPDX-FileCopyrightText: 2025 Maciej Borzecki <maciek.borzecki@gmail.com>
//
// SPDX-License-Identifier: MIT

use std::fmt;
use std::str::FromStr;

use serde;
use thiserror;

/// Command printing the release of the provisioning server.
pub const HOST_OS_QUERY: &str = "cat /etc/redhat-release";

/// Host OS version reported when the release cannot be determined.
pub const HOST_OS_NOT_AVAILABLE: &str = "Not Available";

/// Guest OS families which can be provisioned.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Distro {
    Rhel6,
    #[default]
    Rhel7,
    Rhel8,
    Sles11,
    Sles12,
}

impl Distro {
    pub const ALL: [Distro; 5] = [
        Distro::Rhel6,
        Distro::Rhel7,
        Distro::Rhel8,
        Distro::Sles11,
        Distro::Sles12,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Distro::Rhel6 => "rhel6",
            Distro::Rhel7 => "rhel7",
            Distro::Rhel8 => "rhel8",
            Distro::Sles11 => "sles11",
            Distro::Sles12 => "sles12",
        }
    }
}

impl fmt::Display for Distro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
#[error("{0} is not a supported distro")]
pub struct UnknownDistro(pub String);

impl FromStr for Distro {
    type Err = UnknownDistro;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        Distro::ALL
            .iter()
            .find(|d| d.as_str() == lower)
            .copied()
            .ok_or_else(|| UnknownDistro(s.to_string()))
    }
}

/// Turns the content of `/etc/redhat-release` into a version string such as
/// `RHEL7.2.1`. Returns `None` for anything other than a RHEL release.
pub fn host_os_version_from_release(release: &str) -> Option<String> {
    if !release.contains("Red Hat Enterprise Linux") {
        return None;
    }

    let (_, after) = release.split_once(" release ")?;
    let version: String = after
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let version = version.trim_end_matches('.');

    if version.is_empty() {
        None
    } else {
        Some(format!("RHEL{}", version))
    }
}

const RHEL6_HOST_DISTROS: &[Distro] = &[Distro::Rhel6];
const RHEL7_HOST_DISTROS: &[Distro] = &[Distro::Rhel6, Distro::Rhel7, Distro::Sles11, Distro::Sles12];
const RHEL8_HOST_DISTROS: &[Distro] = &[Distro::Rhel7, Distro::Rhel8, Distro::Sles12];

/// Returns the guest distros a host running a given OS version can serve, or
/// `None` if the host version is not known.
pub fn allowed_distros(host_os_version: &str) -> Option<&'static [Distro]> {
    // Keyed on the major version, RHEL7.2.1 is served the same as RHEL7.9
    let major = host_os_version
        .strip_prefix("RHEL")?
        .split('.')
        .next()
        .unwrap_or_default();

    match major {
        "6" => Some(RHEL6_HOST_DISTROS),
        "7" => Some(RHEL7_HOST_DISTROS),
        "8" => Some(RHEL8_HOST_DISTROS),
        _ => None,
    }
}
