//! Sets up tracing for sluice on stdout/stderr

use tracing::{Level, event};
use tracing_subscriber::{EnvFilter, prelude::*};

use crate::conf::Tracing;

/// Setup local tracing for a service
///
/// `RUST_LOG` overrides the configured level when it is set. Calling this
/// more then once leaves the first subscriber in place.
///
/// # Arguments
///
/// * `name` - The name of the service being traced
/// * `conf` - The tracing settings to use
pub fn setup(name: &str, conf: &Tracing) {
    // use the env filter if one was set otherwise use our level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(conf.level.to_filter().into()));
    // build our stdout layer
    let layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(filter);
    // try to register our subscriber
    if tracing_subscriber::registry().with(layer).try_init().is_ok() {
        event!(
            Level::INFO,
            msg = "Tracing setup",
            service = name,
            level = conf.level.to_string()
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::conf::LogLevel;

    #[test]
    #[serial_test::serial]
    fn setup_twice() {
        let conf = Tracing {
            level: LogLevel::Debug,
        };
        setup("sluice-test", &conf);
        // a second setup should not panic
        setup("sluice-test", &conf);
    }
}
