use std::time::Duration;

/// Timing and sizing knobs of the bridge.
///
/// `Production` is what deployments run with; `Testing` shrinks every
/// interval so scenario tests finish quickly under a paused clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// A session missing a heartbeat for this long is marked offline.
    pub heartbeat_timeout: Duration,
    /// How long to wait for an identify reply after a discovery broadcast.
    pub discovery_timeout: Duration,
    /// Total identify attempts per reload, including the first.
    pub reload_attempts: u32,
    /// Fixed pause between identify attempts.
    pub reload_delay: Duration,
    /// Width of the sliding rate-limit window.
    pub rate_window: Duration,
}

pub trait GetConfig {
    fn get_config() -> Config;
}

#[derive(Clone, Copy, Debug)]
pub struct Production;

#[derive(Clone, Copy, Debug)]
pub struct Testing;

impl GetConfig for Production {
    fn get_config() -> Config {
        Config {
            heartbeat_timeout: Duration::from_secs(30),
            discovery_timeout: Duration::from_millis(800),
            reload_attempts: 3,
            reload_delay: Duration::from_secs(2),
            rate_window: Duration::from_secs(60),
        }
    }
}

impl GetConfig for Testing {
    fn get_config() -> Config {
        Config {
            heartbeat_timeout: Duration::from_secs(3),
            discovery_timeout: Duration::from_millis(100),
            reload_attempts: 3,
            reload_delay: Duration::from_millis(200),
            rate_window: Duration::from_secs(60),
        }
    }
}
