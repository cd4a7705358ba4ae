use env_logger::DEFAULT_FILTER_ENV;
use env_logger::fmt::style::{AnsiColor, Style};
use log::LevelFilter;
use std::io::Write;

#[derive(Default, Clone, Copy)]
pub struct LogOptions {
    /// Debug output of every module.
    pub debug: bool,
    /// Debug output of the cloud API requests only.
    pub trace_api: bool,
}

/// Initializes the global logger. `RUST_LOG` overrides the levels derived from `options`.
pub fn setup_logging(options: LogOptions) {
    let mut builder = env_logger::Builder::default();
    builder.filter_level(if options.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    // HTTP client internals are noisy even at debug level
    builder.filter_module("hyper_util", LevelFilter::Info);
    builder.filter_module("reqwest", LevelFilter::Info);
    if options.trace_api {
        builder.filter_module("gce::rest", LevelFilter::Debug);
    }

    let env_debug = std::env::var(DEFAULT_FILTER_ENV)
        .map(|v| v.contains("debug") || v.contains("trace"))
        .unwrap_or(false);

    if options.debug || env_debug {
        // <time> <level> <module> <message>
        builder.format(|buf, record| {
            let level_style = buf.default_level_style(record.level()).bold();
            writeln!(
                buf,
                "{} {level_style}{:<5}{level_style:#} {}: {}",
                buf.timestamp_millis(),
                record.level(),
                record.module_path().unwrap_or_else(|| record.target()),
                record.args()
            )
        });
    } else {
        // <time> <level> <message>
        builder.format(|buf, record| {
            let level_style = buf.default_level_style(record.level()).bold();
            let time_style = Style::new().fg_color(Some(AnsiColor::BrightBlack.into()));
            writeln!(
                buf,
                "{time_style}{}{time_style:#} {level_style}{}{level_style:#} {}",
                buf.timestamp_seconds(),
                record.level(),
                record.args()
            )
        });
    }

    builder.parse_default_env();
    builder.init();
}
