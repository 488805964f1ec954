use std::env;

fn show_backtrace() -> bool {
    log::max_level() >= log::LevelFilter::Debug
        || env::var("RUST_BACKTRACE").is_ok_and(|value| value == "1")
}

/// Log an error with its causes. With debug logging, or `RUST_BACKTRACE=1`,
/// the backtrace is included as well.
pub fn report_error(e: &anyhow::Error) {
    if show_backtrace() {
        log::error!("{e:?}");
    } else {
        log::error!("{e:#}");
    }
}
