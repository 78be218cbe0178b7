use std::fmt::Arguments;
use std::io::Write;

use anyhow::Result;
use chrono::Local;
use env_logger::Env;
use log::Level;

/// Installs the stderr logger used by every subcommand. The filter is `info`
/// unless `RUST_LOG` says otherwise.
pub fn init() -> Result<()> {
    let env = Env::default().default_filter_or("info");
    env_logger::Builder::from_env(env)
        .format(|fmt, record| {
            writeln!(
                fmt,
                "[{} {}",
                Local::now().format("%H:%M:%S%.3f"),
                log_line(record.level(), record.target(), record.args())
            )
        })
        .try_init()?;
    Ok(())
}

/// Everything after the timestamp. Debug output names the emitting module.
fn log_line(level: Level, target: &str, args: &Arguments) -> String {
    if level >= Level::Debug {
        format!("{} {}] {}", level, target, args)
    } else {
        format!("{}] {}", level, args)
    }
}
