//! Logging initialization for tinyweb.
//!
//! The filter comes from `RUST_LOG` when set, otherwise from the
//! configured level:
//!
//! ```bash
//! RUST_LOG=tinyweb=debug tinyweb -p 9006
//! ```

use crate::config::Config;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter directive for `config`; `close_log` silences everything.
pub fn filter_directive(config: &Config) -> &str {
    if config.close_log {
        "off"
    } else {
        &config.log_level
    }
}

/// Install the global fmt subscriber.
///
/// Returns false if a subscriber was already installed, so calling it twice
/// is harmless.
pub fn init_logging(config: &Config) -> bool {
    let filter = if config.close_log {
        EnvFilter::new("off")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_directive(config)))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_log_turns_logging_off() {
        let mut config = Config::default();
        assert_eq!(filter_directive(&config), "info");
        config.close_log = true;
        assert_eq!(filter_directive(&config), "off");
    }
}
