use serde::{Deserialize, Serialize};

use crate::{identity::ClientId, params::url_encode};

pub const ANALOG_MAX: i32 = 4095;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SignalKind {
    Touch {
        threshold: u32,
        /// S2/S3 touch counts rise under a finger; the original ESP32 falls.
        #[serde(rename = "risesOnTouch", default = "rises_on_touch_default")]
        rises_on_touch: bool,
    },
    Digital {
        #[serde(rename = "activeLow", default)]
        active_low: bool,
    },
    Analog,
}

fn rises_on_touch_default() -> bool {
    true
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Touch { .. } => "touch",
            Self::Digital { .. } => "digital",
            Self::Analog => "analog",
        }
    }

    /// Maps a raw driver sample onto the value reported to the collector.
    pub fn normalize(self, raw: u32) -> i32 {
        match self {
            Self::Touch {
                threshold,
                rises_on_touch: true,
            } => i32::from(raw > threshold),
            Self::Touch { threshold, .. } => i32::from(raw < threshold),
            Self::Digital { active_low } => i32::from((raw != 0) != active_low),
            Self::Analog => raw.min(ANALOG_MAX as u32) as i32,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReportScheduler {
    heartbeat_ms: u64,
    last: Option<(i32, u64)>,
}

impl ReportScheduler {
    pub fn new(heartbeat_ms: u64) -> Self {
        Self {
            heartbeat_ms,
            last: None,
        }
    }

    pub fn should_report(&self, value: i32, now_ms: u64) -> bool {
        match self.last {
            None => true,
            Some((last_value, _)) if last_value != value => true,
            Some((_, at_ms)) => now_ms.saturating_sub(at_ms) >= self.heartbeat_ms,
        }
    }

    pub fn mark_reported(&mut self, value: i32, now_ms: u64) {
        self.last = Some((value, now_ms));
    }

    pub fn last_value(&self) -> Option<i32> {
        self.last.map(|(value, _)| value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportForm {
    pub client_id: ClientId,
    pub value: i32,
}

impl ReportForm {
    pub fn encode(&self) -> String {
        format!(
            "clientId={}&value={}",
            url_encode(&self.client_id.to_string()),
            self.value
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_polarity_follows_pad_kind() {
        let rising = SignalKind::Touch {
            threshold: 40_000,
            rises_on_touch: true,
        };
        assert_eq!(rising.normalize(25_000), 0);
        assert_eq!(rising.normalize(40_000), 0);
        assert_eq!(rising.normalize(60_000), 1);

        let falling = SignalKind::Touch {
            threshold: 40_000,
            rises_on_touch: false,
        };
        assert_eq!(falling.normalize(12_000), 1);
        assert_eq!(falling.normalize(40_000), 0);
        assert_eq!(falling.normalize(60_000), 0);
    }

    #[test]
    fn touch_defaults_to_rising_counts() {
        let parsed: SignalKind =
            serde_json::from_str(r#"{"kind":"touch","threshold":40000}"#).unwrap();
        assert_eq!(
            parsed,
            SignalKind::Touch {
                threshold: 40_000,
                rises_on_touch: true
            }
        );
    }

    #[test]
    fn digital_honours_active_low() {
        let high = SignalKind::Digital { active_low: false };
        let low = SignalKind::Digital { active_low: true };
        assert_eq!(high.normalize(1), 1);
        assert_eq!(high.normalize(0), 0);
        assert_eq!(low.normalize(0), 1);
        assert_eq!(low.normalize(1), 0);
    }

    #[test]
    fn analog_is_clamped_to_adc_range() {
        assert_eq!(SignalKind::Analog.normalize(2048), 2048);
        assert_eq!(SignalKind::Analog.normalize(70_000), ANALOG_MAX);
    }

    #[test]
    fn reports_on_change_and_heartbeat() {
        let mut scheduler = ReportScheduler::new(5_000);
        assert!(scheduler.should_report(0, 0));
        scheduler.mark_reported(0, 0);

        assert!(!scheduler.should_report(0, 4_999));
        assert!(scheduler.should_report(1, 100));
        assert!(scheduler.should_report(0, 5_000));

        scheduler.mark_reported(1, 6_000);
        assert_eq!(scheduler.last_value(), Some(1));
        assert!(!scheduler.should_report(1, 7_000));
    }

    #[test]
    fn signal_kind_serializes_with_tag() {
        let json = serde_json::to_string(&SignalKind::Digital { active_low: true }).unwrap();
        assert_eq!(json, r#"{"kind":"digital","activeLow":true}"#);
        let parsed: SignalKind = serde_json::from_str(r#"{"kind":"analog"}"#).unwrap();
        assert_eq!(parsed, SignalKind::Analog);
    }

    #[test]
    fn report_form_encodes_body() {
        let form = ReportForm {
            client_id: ClientId::new(3),
            value: 1,
        };
        assert_eq!(form.encode(), "clientId=3&value=1");
    }
}
