//! Process classification for the split tunnel.
//!
//! # Rules
//!
//! The user selects executables (by path) whose traffic must bypass the VPN
//! tunnel. Every callout invocation asks the [`ClassificationStore`] whether
//! the process owning the socket is one of them.
//!
//! - paths are compared in canonical form, see [`ImagePath`]
//! - the host reports the executable path of the process with every event;
//!   that path is authoritative
//! - process start/exit notifications feed a pid cache. A cached pid is used
//!   only if its recorded path equals the reported one, since pids get
//!   recycled
//!
//! # Concurrency
//!
//! Lookups happen on the host's event path, from many threads at once, and
//! must never wait on a control path update. The table is copy-on-write:
//! updates build a new table and swap it in.

mod config;
mod store;

pub use config::Config;
pub use split_core::{EmptyPath, ImagePath};
pub use store::{ClassificationStore, RunningApp};
