// SPDX-FileCopyrightText: 2025 Maciej Borzecki <maciek.borzecki@gmail.com>
//
// SPDX-License-Identifier: MIT

//! Disposable virtual machines created through a provisioning server.

pub mod config;
pub mod distro;
pub mod parse;
pub mod ssh;
pub mod vm;

pub use vm::{VirtualMachine, VirtualMachineError, VmOptions, VmState};
