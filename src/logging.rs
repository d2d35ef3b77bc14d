//! tracing setup shared by both binaries

use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins over `level`; `json` switches to one JSON object per line
pub fn init(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    // a subscriber may already be installed by an embedding application
    if let Err(e) = result {
        eprintln!("logging already initialised: {}", e);
    }
}
