pub mod logging;
pub mod paths;
pub mod shutdown;

pub use logging::{init_console_logging, init_logging};
pub use shutdown::wait_for_signal;
