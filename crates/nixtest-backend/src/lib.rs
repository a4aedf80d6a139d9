//! Production backends for nixtest.
//!
//! - [`VirshHypervisor`] drives libvirt through the `virsh`, `qemu-img` and
//!   `virt-install` command-line tools.
//! - [`SshTransport`] runs installer commands and copies files with the
//!   system OpenSSH client.
//!
//! Both shell out rather than link against libvirt or an SSH library, so the
//! supervisor runs wherever an operator can already run those tools by hand.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod exec;
pub mod ssh;
pub mod virsh;

pub use ssh::SshTransport;
pub use virsh::VirshHypervisor;
