//! Logging setup.
//!
//! All output goes to stderr: in `serve` mode stdout carries the MCP
//! protocol stream. `RUST_LOG` takes precedence over the configured level:
//!
//! ```bash
//! RUST_LOG=semche_core=debug semche serve
//! ```

use std::sync::Once;

use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

static INIT: Once = Once::new();

/// HH:MM:SS.mmm
struct CompactTime;

impl FormatTime for CompactTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%H:%M:%S%.3f"))
    }
}

/// Install the global subscriber. Only the first call has any effect.
pub fn init(level: &str) {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            EnvFilter::new(filter_directive(level))
        };

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_timer(CompactTime)
            .with_ansi(false)
            .with_filter(filter);

        tracing_subscriber::registry().with(fmt_layer).init();
    });
}

/// Our own crates log at `level`; dependencies stay at `warn` unless
/// `level` is quieter.
fn filter_directive(level: &str) -> String {
    match level {
        "error" | "warn" => level.to_string(),
        _ => format!("warn,semche={level},semche_core={level}"),
    }
}
