//! Split tunneling engine: the traffic of selected applications bypasses the
//! VPN tunnel, everything else stays tunneled.
//!
//! The engine registers into the host filtering engine as its own namespace
//! (a provider and a sublayer) and attaches callouts to the socket lifecycle
//! layers:
//!
//! - bind and connect redirection moves the sockets of split applications
//!   from the tunnel to the physical interface
//! - authorization permits their flows explicitly, so that a cooperating
//!   default-deny firewall lets them through
//!
//! The [daemon](crate::daemon) runs the engine as a service, driven by a
//! configuration file and by network change notifications. It's provided as
//! the `split-tunneld` binary:
//!
//! ```sh
//! split-tunneld --config /etc/split-tunnel/split-tunnel.ini
//!
//! # Object keys to use in the firewall configuration
//! split-tunneld --print-keys
//! ```
//!
//! ## Crates
//!
//! - [`split_core`]: object keys, events, decisions, interface binding
//! - [`classification`]: which processes are split
//! - [`host_engine`]: host filtering engine interface and its in-memory
//!   implementation
//! - [`callouts`]: the decision logic invoked by the host
//! - [`split_engine`]: registration and lifecycle

pub mod cli;
pub mod daemon;
pub mod utils;

pub use callouts;
pub use classification;
pub use host_engine;
pub use split_core;
pub use split_engine;

pub mod metadata {
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}

/// Init logger. We log from info level and above.
/// If RUST_LOG is set, we assume the user wants to debug something
/// and use env_logger default behaviour.
pub fn init_logger(override_log_level: Option<log::LevelFilter>) {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
    } else {
        let level_filter = override_log_level.unwrap_or(log::LevelFilter::Info);

        env_logger::builder().filter_level(level_filter).init();
    }
}
