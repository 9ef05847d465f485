//! Tracing setup for the daemon.
//!
//! Human-readable console output by default, one JSON object per line with
//! `json_logs`. Per-job transfer logs are separate files written by the copy
//! operation and never go through here.

use std::time::{Duration, Instant};

use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::AppConfig;

const CRATE_TARGET: &str = "sharesync";

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    pub json: bool,
    /// Debug level for this crate instead of info.
    pub verbose: bool,
}

impl From<&AppConfig> for LogConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            json: config.json_logs,
            verbose: config.verbose,
        }
    }
}

impl LogConfig {
    fn level(&self) -> Level {
        if self.verbose { Level::DEBUG } else { Level::INFO }
    }

    /// `RUST_LOG` wins over the configured level when it is set and valid.
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{}={}",
                CRATE_TARGET,
                self.level().as_str().to_lowercase()
            ))
        })
    }
}

/// Install the global subscriber. Call once, after the configuration is merged.
pub fn init(config: LogConfig) {
    let registry = tracing_subscriber::registry().with(config.filter());

    if config.json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(config.verbose).compact())
            .init();
    }
}

/// Lets through at most one progress log per interval. A copy tool can
/// print hundreds of progress lines a second.
#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn should_log(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    /// Let the next call through, e.g. when a new source starts.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_lets_first_call_through_then_blocks() {
        let mut throttle = LogThrottle::new(Duration::from_secs(60));
        assert!(throttle.should_log());
        assert!(!throttle.should_log());
        throttle.reset();
        assert!(throttle.should_log());
    }

    #[test]
    fn throttle_reopens_after_interval() {
        let mut throttle = LogThrottle::new(Duration::from_millis(20));
        assert!(throttle.should_log());
        std::thread::sleep(Duration::from_millis(30));
        assert!(throttle.should_log());
    }

    #[test]
    fn verbose_raises_level() {
        assert_eq!(LogConfig::default().level(), Level::INFO);
        let verbose = LogConfig {
            verbose: true,
            ..Default::default()
        };
        assert_eq!(verbose.level(), Level::DEBUG);
    }
}
