use std::io::Write;

use env_logger::{Env, Target};

/// Worker logs are read line by line by the control surface: one line per
/// record, on stdout, flushed for each record.
pub fn init_worker_logger() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .target(Target::Stdout)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {}",
                buf.timestamp(),
                record.level(),
                record.args()
            )
        })
        .init();
}

pub fn init_logger() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
}
