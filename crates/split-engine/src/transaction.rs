use host_engine::HostEngine;

use crate::error::EngineError;

/// Run `f` inside a host transaction: committed if `f` succeeds, aborted
/// otherwise.
pub(crate) fn in_transaction<R>(
    host: &dyn HostEngine,
    f: impl FnOnce() -> Result<R, EngineError>,
) -> Result<R, EngineError> {
    host.begin_transaction()?;
    match f() {
        Ok(result) => {
            host.commit_transaction()?;
            Ok(result)
        }
        Err(err) => {
            if let Err(abort_err) = host.abort_transaction() {
                split_core::log_error("aborting transaction", abort_err);
            }
            Err(err)
        }
    }
}
