pub mod autostart;
pub mod error;
pub mod supervisor;
