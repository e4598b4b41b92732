fn main() {
    // Initialize Sentry before anything else so panics during startup are captured.
    // Returns a no-op guard when SENTRY_DSN is absent (local dev).
    let _sentry_guard = sentry::init(sentry_options());

    if let Err(e) = relay_lib::run() {
        eprintln!("chat-relay: {}", e);
        std::process::exit(1);
    }
}

fn sentry_options() -> sentry::ClientOptions {
    sentry::ClientOptions {
        dsn: std::env::var("SENTRY_DSN")
            .ok()
            .or_else(|| option_env!("SENTRY_DSN").map(String::from))
            .and_then(|s| s.parse().ok()),
        release: Some(env!("CARGO_PKG_VERSION").into()),
        traces_sample_rate: 0.0,
        send_default_pii: false,
        before_send: Some(std::sync::Arc::new(|mut event| {
            if let Some(ref mut user) = event.user {
                user.email = None;
                user.ip_address = None;
                user.username = None;
            }
            // Chat bodies carry user messages and encrypted credentials.
            if let Some(ref mut request) = event.request {
                request.data = None;
                request.cookies = None;
            }
            Some(event)
        })),
        ..Default::default()
    }
}
