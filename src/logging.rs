// Logging - tracing subscriber setup shared by both binaries

use tracing_subscriber::EnvFilter;

/// Default filter directive for a -v count
pub fn level_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    }
}

/// Install a compact stderr subscriber; RUST_LOG takes precedence over -v.
/// Calling this twice is harmless.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_for(verbosity)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(level_for(0), "warn");
        assert_eq!(level_for(1), "debug");
        assert_eq!(level_for(5), "trace");
    }

    #[test]
    fn test_init_twice_does_not_panic() {
        init(0);
        init(2);
    }
}
