//! Process, port, and remote-command plumbing shared by the vdesk crates.
//!
//! This crate knows how to run commands (locally or over SSH), stream their
//! merged output line by line, probe local ports, and inspect the local
//! process table. It carries no scheduler or session policy; that lives in
//! `vdesk-core`.

pub mod fake;
pub mod process;
pub mod remote;

pub use remote::{Exec, LineStream, RemoteError, RunOutput, Runner, SshRunner};
