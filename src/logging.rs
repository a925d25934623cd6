//! # Structured logging
//!
//! Sets up the `tracing` subscriber the rest of the crate emits batch and
//! run spans into. A `ColorizedFormatter` colors the whole line by level,
//! with no timestamp or target noise, since the diagnostics binary is read
//! by a developer at a terminal, not machine-parsed.

use std::fmt;

use colored::Colorize;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Colors an entire formatted log line by its event's level, with no
/// timestamp or target prefix.
pub struct ColorizedFormatter;

impl<S, N> FormatEvent<S, N> for ColorizedFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        let mut buffer = String::new();
        let buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer, event)?;

        let colored_output = match *event.metadata().level() {
            Level::INFO => buffer.white(),
            Level::WARN => buffer.yellow(),
            Level::ERROR => buffer.red(),
            Level::DEBUG => buffer.blue(),
            Level::TRACE => buffer.purple(),
        };

        writeln!(writer, "{colored_output}")
    }
}

/// Installs the global subscriber. `verbosity` follows the diagnostics
/// binary's `-v` count: 0 = warn, 1 = info, 2 = debug, 3+ = trace; the
/// `RUST_LOG` environment variable overrides this when set.
pub fn init(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(ColorizedFormatter)
        .init();
}
