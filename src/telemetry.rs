//! Tracing setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global subscriber once, writing to stderr so command
/// output on stdout stays pipeable.
///
/// `verbosity` comes from the CLI: 0 is the default `info` level for this
/// crate, each `-v` lowers the threshold and `-q` raises it to warnings.
/// `RUST_LOG` overrides everything when set.
pub fn init_tracing(verbosity: i8) {
    let default = match verbosity {
        i8::MIN..=-1 => "pvcast=warn",
        0 => "pvcast=info",
        1 => "pvcast=debug",
        _ => "debug",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{default},hyper=warn,reqwest=warn").into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact(),
        )
        .init();
}
