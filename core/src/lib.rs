pub mod cancel;
pub mod config;
pub mod error;
pub mod liveness;
pub mod logging;
pub mod types;
pub mod utils;

pub const APP_NAME: &str = "HikiBridge";
// Worker emit this text once per second, supervisor wait for it to consider worker alive
pub const HEARTBEAT_MARKER: &str = "Monitoring iteration";
pub const DEFAULT_API_KEY_ENV_VAR: &str = "HIKIBRIDGE_API_KEY";
pub const MONITOR_BIN_NAME: &str = "hikibridge_monitor";
