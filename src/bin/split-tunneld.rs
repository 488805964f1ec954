use anyhow::Result;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use split_tunnel::cli::split_tunneld::DaemonOpts;

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    split_tunnel::init_logger(Some(opts.verbosity.log_level_filter()));

    match split_tunnel::daemon::split_tunnel_daemon_run(&opts.daemon_opts).await {
        Ok(_) => std::process::exit(0),
        Err(e) => {
            split_tunnel::utils::report_error(&e);
            std::process::exit(1);
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[clap(about = "Split tunnel daemon")]
#[clap(version = split_tunnel::metadata::VERSION)]
#[clap(disable_help_subcommand = true)]
struct Opts {
    #[command(flatten)]
    pub daemon_opts: DaemonOpts,

    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,
}
