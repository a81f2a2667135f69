//! Logging setup.
//!
//! `RUST_LOG` でフィルタを指定する（未指定なら `info`）。
//! `LOCKSTEP_LOG_FORMAT=json` で 1 行 1 JSON の出力にする。

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber.
///
/// Safe to call more than once; later calls are ignored.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOCKSTEP_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    // ignore error: a subscriber may already be installed
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
