// SPDX-FileCopyrightText: 2025 Maciej Borzecki <maciek.borzecki@gmail.com>
//
// SPDX-License-Identifier: MIT

use std::io;

fn build_git_version() -> Result<String, io::Error> {
    use std::process::Command;

    let args = &["describe", "--always", "--dirty"];
    let output = Command::new("git").args(args).output()?;
    if !output.status.success() {
        return Err(io::Error::other("git describe failed"));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    if let Ok(vers) = build_git_version() {
        println!("cargo:rustc-env=REMOTE_VM_GIT_VERSION={}", vers);
    }
}
