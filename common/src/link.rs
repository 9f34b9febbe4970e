//! WiFi link supervision shared by both node types.

use crate::led::Indicator;

pub const BOOT_CONNECT_ATTEMPTS: u32 = 20;
pub const BOOT_RETRY_DELAY_MS: u64 = 500;
pub const RECONNECT_INTERVAL_MS: u64 = 10_000;
pub const RESTART_GRACE_MS: u64 = 300_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    Idle,
    Reconnect,
}

/// Rate-limits reconnect attempts while the station is down.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    interval_ms: u64,
    last_attempt_ms: Option<u64>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(RECONNECT_INTERVAL_MS)
    }
}

impl ReconnectPolicy {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_attempt_ms: None,
        }
    }

    pub fn poll(&mut self, connected: bool, now_ms: u64) -> LinkAction {
        if connected {
            return LinkAction::Idle;
        }

        let due = match self.last_attempt_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.interval_ms,
        };
        if due {
            self.last_attempt_ms = Some(now_ms);
            LinkAction::Reconnect
        } else {
            LinkAction::Idle
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkHealth {
    Up,
    Down { for_ms: u64 },
    RestartDue,
}

impl LinkHealth {
    /// LED state to show on this poll. A down link blinks while reconnects
    /// are attempted; an up link leaves the LED to the application.
    pub fn indicator(self) -> Option<Indicator> {
        match self {
            Self::Up => None,
            Self::Down { .. } => Some(Indicator::Connecting),
            Self::RestartDue => Some(Indicator::Disconnected),
        }
    }
}

/// Tracks how long the link has been down and flags when a device restart is
/// the remaining recovery option.
#[derive(Debug, Clone)]
pub struct DisconnectWatch {
    grace_ms: u64,
    down_since_ms: Option<u64>,
}

impl Default for DisconnectWatch {
    fn default() -> Self {
        Self::new(RESTART_GRACE_MS)
    }
}

impl DisconnectWatch {
    pub fn new(grace_ms: u64) -> Self {
        Self {
            grace_ms,
            down_since_ms: None,
        }
    }

    pub fn observe(&mut self, connected: bool, now_ms: u64) -> LinkHealth {
        if connected {
            self.down_since_ms = None;
            return LinkHealth::Up;
        }

        let since = *self.down_since_ms.get_or_insert(now_ms);
        let for_ms = now_ms.saturating_sub(since);
        if for_ms >= self.grace_ms {
            LinkHealth::RestartDue
        } else {
            LinkHealth::Down { for_ms }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::led::{RecordingPixel, Rgb, StatusLed};

    #[test]
    fn reconnects_at_most_once_per_interval() {
        let mut policy = ReconnectPolicy::default();
        assert_eq!(policy.poll(false, 1_000), LinkAction::Reconnect);
        assert_eq!(policy.poll(false, 5_000), LinkAction::Idle);
        assert_eq!(policy.poll(false, 10_999), LinkAction::Idle);
        assert_eq!(policy.poll(false, 11_000), LinkAction::Reconnect);
    }

    #[test]
    fn connected_link_is_left_alone() {
        let mut policy = ReconnectPolicy::new(100);
        assert_eq!(policy.poll(true, 0), LinkAction::Idle);
        assert_eq!(policy.poll(true, 1_000), LinkAction::Idle);
        assert_eq!(policy.poll(false, 1_000), LinkAction::Reconnect);
    }

    #[test]
    fn restart_due_after_grace() {
        let mut watch = DisconnectWatch::new(1_000);
        assert_eq!(watch.observe(false, 500), LinkHealth::Down { for_ms: 0 });
        assert_eq!(watch.observe(false, 1_200), LinkHealth::Down { for_ms: 700 });
        assert_eq!(watch.observe(false, 1_500), LinkHealth::RestartDue);
    }

    #[test]
    fn reconnect_resets_grace() {
        let mut watch = DisconnectWatch::new(1_000);
        watch.observe(false, 0);
        assert_eq!(watch.observe(true, 900), LinkHealth::Up);
        assert_eq!(watch.observe(false, 1_500), LinkHealth::Down { for_ms: 0 });
    }

    #[test]
    fn down_link_blinks_on_every_poll() {
        let mut watch = DisconnectWatch::new(10_000);
        let mut led = StatusLed::with_brightness(RecordingPixel::default(), 255);
        for now_ms in [0, 500, 1_000, 1_500] {
            if let Some(indicator) = watch.observe(false, now_ms).indicator() {
                led.indicate(indicator).unwrap();
            }
        }
        assert_eq!(
            led.driver().shown,
            vec![Rgb::BLUE, Rgb::OFF, Rgb::BLUE, Rgb::OFF]
        );
        assert_eq!(watch.observe(true, 2_000).indicator(), None);
        assert_eq!(
            watch.observe(false, 2_500).indicator(),
            Some(Indicator::Connecting)
        );
    }
}
