//! Log initialization shared by the tests of the scavenge workspace.
//!
//! Scavenging runs on a dedicated named thread, so every line carries the
//! thread name next to the source location.
#[cfg(feature = "env")]
use std::io::Write;

#[cfg(feature = "env")]
use log::LevelFilter;

/// Default filter used when `RUST_LOG` is not set.
#[cfg(feature = "env")]
const DEFAULT_FILTER: &str = "debug";

#[cfg(feature = "env")]
fn builder(filter: &str) -> env_logger::Builder {
    let mut builder = env_logger::Builder::new();
    builder
        .is_test(true)
        .filter_level(LevelFilter::Info)
        .parse_filters(&std::env::var("RUST_LOG").unwrap_or_else(|_| filter.to_owned()))
        .format(|buf, record| {
            writeln!(
                buf,
                "{}:{} {} [{}] [{}] - {}",
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                std::thread::current().name().unwrap_or("unnamed"),
                record.level(),
                record.args()
            )
        });
    builder
}

/// Install the logger for unit tests. Repeated calls are harmless.
#[cfg(feature = "env")]
pub fn try_init_log() {
    let _ = builder(DEFAULT_FILTER).try_init();
}
