use clap::Parser;

pub const NAME: &str = "split-tunneld";

pub const DEFAULT_CONFIG_FILE: &str = "/etc/split-tunnel/split-tunnel.ini";

#[derive(Parser, Debug, Clone)]
#[clap(name = NAME)]
#[clap(about = "Split tunnel daemon")]
pub struct DaemonOpts {
    /// Configuration file. Created empty if missing.
    #[clap(long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: String,

    /// Print the object keys as JSON and exit.
    #[clap(long)]
    pub print_keys: bool,
}
