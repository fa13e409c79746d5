// 📝 Logging
// tracing subscriber for the binaries. RUST_LOG overrides the configured level.
// Warnings are how recoverable conditions (contradictory selections, skipped
// groups, missing group members) reach the user.

use crate::config::LogConfig;
use tracing_subscriber::EnvFilter;

/// Default filter directive for a level, quieting dependencies
pub fn default_directive(level: &str) -> String {
    format!("{level},acclimate_postproc={level},rusqlite=warn")
}

/// Install the global subscriber. Returns false if one was already set.
pub fn init_tracing(level: &str, json: bool) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    }
}

pub fn init_from_config(log: &LogConfig) -> bool {
    init_tracing(&log.level, log.json)
}

/// Counts WARN events emitted while a closure runs
#[cfg(test)]
pub(crate) mod capture {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    struct WarnCounter(Arc<AtomicUsize>);

    impl<S: Subscriber> Layer<S> for WarnCounter {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    pub(crate) fn count_warnings<T>(f: impl FnOnce() -> T) -> (T, usize) {
        let count = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(WarnCounter(count.clone()));
        let out = tracing::subscriber::with_default(subscriber, f);
        (out, count.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::capture::count_warnings;
    use super::*;

    #[test]
    fn test_directive() {
        assert_eq!(default_directive("debug"), "debug,acclimate_postproc=debug,rusqlite=warn");
    }

    #[test]
    fn test_second_init_is_harmless() {
        init_tracing("warn", false);
        assert!(!init_tracing("info", true));
    }

    #[test]
    fn test_count_warnings_counts_only_warn() {
        let ((), n) = count_warnings(|| {
            tracing::warn!("one");
            tracing::info!("ignored");
            tracing::warn!("two");
        });
        assert_eq!(n, 2);
    }
}
