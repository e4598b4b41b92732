use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Global crash log directory, set during init.
static CRASH_LOG_DIR: OnceLock<PathBuf> = OnceLock::new();

const DEFAULT_FILTER: &str = "info,chat_relay=debug,relay_lib=debug";

/// Initialize tracing with a stdout layer and the Sentry layer.
///
/// - Stdout: compact and human-readable, or one JSON object per line when
///   `json` is set (log shippers)
/// - Sentry: captures ERROR events as issues, WARN as breadcrumbs
/// - Default level: INFO (crate at DEBUG), override via RUST_LOG env
pub fn init(json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let (compact_layer, json_layer) = if json {
        (None, Some(fmt::layer().json().with_current_span(false)))
    } else {
        let layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .compact();
        (Some(layer), None)
    };

    // Routes existing tracing::error!/warn! calls to Sentry automatically.
    // No-op when Sentry DSN is not configured.
    let sentry_layer = sentry_tracing::layer().event_filter(|meta| match *meta.level() {
        tracing::Level::ERROR => sentry_tracing::EventFilter::Event,
        tracing::Level::WARN => sentry_tracing::EventFilter::Breadcrumb,
        _ => sentry_tracing::EventFilter::Ignore,
    });

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(compact_layer)
        .with(json_layer)
        .with(sentry_layer)
        .try_init();

    if installed.is_ok() {
        tracing::debug!(json, "Tracing initialized");
    }
}

/// Install a panic hook that writes crash details to `<data_dir>/crash_logs`
/// before handing over to the previous hook.
pub fn install_crash_hook(data_dir: &Path) {
    // Ensure backtraces are captured with full symbols
    if std::env::var("RUST_BACKTRACE").is_err() {
        std::env::set_var("RUST_BACKTRACE", "full");
    }

    let crash_dir = data_dir.join("crash_logs");
    if let Err(e) = std::fs::create_dir_all(&crash_dir) {
        tracing::warn!(dir = %crash_dir.display(), "Cannot create crash log directory: {}", e);
        return;
    }
    CRASH_LOG_DIR.set(crash_dir).ok();

    let prev_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if let Some(dir) = CRASH_LOG_DIR.get() {
            let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
            let path = dir.join(format!("crash_{}.log", timestamp));
            let _ = std::fs::write(&path, crash_report(info.payload(), info.location()));
            eprintln!("[CRASH] Report written to: {}", path.display());
        }

        // Call the previous hook (Sentry, default, etc.)
        prev_hook(info);
    }));

    tracing::info!("Crash hook installed");
}

fn crash_report(
    payload: &(dyn std::any::Any + Send),
    location: Option<&std::panic::Location<'_>>,
) -> String {
    let mut report = format!(
        "=== CHAT RELAY CRASH REPORT ===\n\
         Time: {}\n\
         Version: {}\n\n",
        chrono::Local::now().to_rfc3339(),
        env!("CARGO_PKG_VERSION"),
    );

    if let Some(msg) = payload.downcast_ref::<&str>() {
        report.push_str(&format!("Panic: {}\n", msg));
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        report.push_str(&format!("Panic: {}\n", msg));
    } else {
        report.push_str("Panic: <unknown payload>\n");
    }

    if let Some(loc) = location {
        report.push_str(&format!("Location: {}:{}:{}\n", loc.file(), loc.line(), loc.column()));
    }

    report.push_str(&format!(
        "\nBacktrace:\n{}\n",
        std::backtrace::Backtrace::force_capture()
    ));

    let thread = std::thread::current();
    report.push_str(&format!("\nThread: {:?} (id: {:?})\n", thread.name(), thread.id()));
    report
}
