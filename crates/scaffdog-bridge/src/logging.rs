//! Tracing subscriber setup.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn base_level(debug: bool, env: Option<&str>) -> &'static str {
    if debug {
        return "debug";
    }
    match env {
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn filter_directive(level: &str) -> String {
    format!("scaffdog_bridge={level},scaffdog_bridge::bridge::codec=off")
}

/// Install the global subscriber, writing to stderr.
///
/// `RUST_LOG` wins when set. Otherwise `SCAFFDOG_LOG` picks the level, and
/// `debug` forces it to `debug`. `LOG_FORMAT=json` selects JSON output.
/// Safe to call more than once.
pub fn init_tracing(debug: bool) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let env = std::env::var("SCAFFDOG_LOG").ok();
        EnvFilter::new(filter_directive(base_level(debug, env.as_deref())))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
