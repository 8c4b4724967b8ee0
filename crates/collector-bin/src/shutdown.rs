//! SIGINT/SIGTERM handling.

use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;

/// Register a halt flag raised by the first termination signal.
///
/// A second signal while the flag is already set exits the process
/// immediately with status 1.
pub fn install_halt_flag() -> io::Result<Arc<AtomicBool>> {
    let halt = Arc::new(AtomicBool::new(false));
    for sig in TERM_SIGNALS {
        flag::register_conditional_shutdown(*sig, 1, Arc::clone(&halt))?;
        flag::register(*sig, Arc::clone(&halt))?;
    }
    Ok(halt)
}
