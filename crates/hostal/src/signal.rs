//! SIGINT/SIGTERM hookup.

use crate::HalError;

/// Run `handler` on every SIGINT or SIGTERM. Only one handler per process.
pub fn install<F>(handler: F) -> Result<(), HalError>
where
    F: FnMut() + Send + 'static,
{
    ctrlc::set_handler(handler)?;
    Ok(())
}
