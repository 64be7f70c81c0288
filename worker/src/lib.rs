pub mod client;
pub mod context;
pub mod database;
pub mod delivery;
pub mod error;
pub mod heartbeat;
pub mod queue;
pub mod run;
pub mod scan;
pub mod snapshot;
pub mod watch;

#[cfg(test)]
pub mod tests;
