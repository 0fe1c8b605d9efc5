//! Field-code table of the Sputnik S-series reply protocol.

use super::backoff::QueryBackoff;
use crate::capability::ValueKind;
use arrayvec::ArrayString;
use core::fmt::Write;
use serde::{Deserialize, Serialize};

pub const INVERTER_MODEL: &str = "inverter-model";
pub const FIRMWARE_VERSION: &str = "firmware-version";
pub const STATUS_CODE: &str = "status-code";
pub const STATUS_TEXT: &str = "status-text";
pub const INVERTER_STATUS: &str = "inverter-status";
pub const MANUFACTURER: &str = "manufacturer";
pub const QUERY_INTERVAL: &str = "query-interval";
pub const CONFIG_NAME: &str = "config-name";
pub const LAST_UPDATE: &str = "last-update";

pub const MANUFACTURER_NAME: &str = "Sputnik Engineering";

/// Asked once per connection, before polling starts.
pub const IDENTIFY_CODES: [&str; 3] = ["TYP", "SWV", "BDN"];

pub const DEFAULT_POLL_CODES: [&str; 15] = [
    "PAC", "KHR", "KYR", "KMT", "KDY", "KT0", "PIN", "TNF", "PRL", "UDC", "IDC", "UL1", "IL1",
    "TKK", "SYS",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoder {
    /// `raw * scale` into a float capability.
    Numeric,
    Model,
    FirmwareVersion,
    FirmwareBuild,
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldSpec {
    pub code: &'static str,
    pub capability: &'static str,
    pub kind: ValueKind,
    pub scale: f64,
    /// Number of values the token must carry.
    pub arity: usize,
    pub decoder: Decoder,
    /// How often the code is asked while polling.
    pub backoff: QueryBackoff,
}

const fn numeric(code: &'static str, capability: &'static str, scale: f64) -> FieldSpec {
    FieldSpec {
        code,
        capability,
        kind: ValueKind::Float,
        scale,
        arity: 1,
        decoder: Decoder::Numeric,
        backoff: QueryBackoff::Always,
    }
}

impl FieldSpec {
    const fn polled(self, backoff: QueryBackoff) -> FieldSpec {
        FieldSpec { backoff, ..self }
    }
}

/// Totals that move slowly enough to refresh every few minutes.
const SLOW_TOTALS: QueryBackoff = QueryBackoff::Timed { interval_ms: 300_000 };
/// Not every model answers these.
const OPTIONAL: QueryBackoff = QueryBackoff::IfSupported { retries: 3 };

pub const FIELDS: &[FieldSpec] = &[
    FieldSpec {
        code: "TYP",
        capability: INVERTER_MODEL,
        kind: ValueKind::Text,
        scale: 1.0,
        arity: 1,
        decoder: Decoder::Model,
        backoff: QueryBackoff::Always,
    },
    FieldSpec {
        code: "SWV",
        capability: FIRMWARE_VERSION,
        kind: ValueKind::Text,
        scale: 1.0,
        arity: 1,
        decoder: Decoder::FirmwareVersion,
        backoff: QueryBackoff::Always,
    },
    FieldSpec {
        code: "BDN",
        capability: FIRMWARE_VERSION,
        kind: ValueKind::Text,
        scale: 1.0,
        arity: 1,
        decoder: Decoder::FirmwareBuild,
        backoff: QueryBackoff::Always,
    },
    numeric("PAC", "ac-power-total", 0.5),
    numeric("KHR", "power-on-hours", 1.0),
    numeric("KYR", "energy-year", 1.0).polled(SLOW_TOTALS),
    numeric("KMT", "energy-month", 1.0).polled(SLOW_TOTALS),
    numeric("KDY", "energy-today", 0.1),
    numeric("KT0", "energy-total", 1.0),
    numeric("PIN", "installed-power", 0.5).polled(QueryBackoff::Once),
    numeric("TNF", "net-frequency", 0.01),
    numeric("PRL", "relative-power", 1.0).polled(OPTIONAL),
    numeric("UDC", "dc-voltage", 0.1),
    numeric("IDC", "dc-current", 0.01),
    numeric("UL1", "ac-voltage", 0.1),
    numeric("IL1", "ac-current", 0.01),
    numeric("TKK", "inverter-temperature", 1.0).polled(OPTIONAL),
    FieldSpec {
        code: "SYS",
        capability: STATUS_CODE,
        kind: ValueKind::Int,
        scale: 1.0,
        arity: 2,
        decoder: Decoder::Status,
        backoff: QueryBackoff::Always,
    },
];

pub fn lookup(code: &str) -> Option<&'static FieldSpec> {
    FIELDS.iter().find(|field| field.code == code)
}

/// Static code for a configured one, if the table knows it.
pub fn known_code(code: &str) -> Option<&'static str> {
    lookup(code).map(|field| field.code)
}

const MODELS: &[(u32, &str)] = &[
    (20, "SolarMax 20 C"),
    (25, "SolarMax 25 C"),
    (30, "SolarMax 30 C"),
    (35, "SolarMax 35 C"),
    (50, "SolarMax 50 C"),
    (80, "SolarMax 80 C"),
    (100, "SolarMax 100 C"),
    (300, "SolarMax 300 C"),
    (2001, "SolarMax 2000 E"),
    (2010, "SolarMax 2000 C"),
    (3001, "SolarMax 3000 E"),
    (3010, "SolarMax 3000 C"),
    (4000, "SolarMax 4000 E"),
    (4001, "SolarMax 4000 E"),
    (4010, "SolarMax 4000 C"),
    (4200, "SolarMax 4200 C"),
    (6000, "SolarMax 6000 E"),
    (6010, "SolarMax 6000 C"),
    (20010, "SolarMax 2000 S"),
    (20020, "SolarMax 3000 S"),
    (20030, "SolarMax 4200 S"),
    (20040, "SolarMax 6000 S"),
    (20202, "SolarMax 10MT"),
    (20210, "SolarMax 10MTV2"),
];

pub const UNKNOWN_MODEL: &str = "Unknown Sputnik model";

pub fn model_name(id: u32) -> Option<&'static str> {
    MODELS
        .iter()
        .find(|(model, _)| *model == id)
        .map(|(_, name)| *name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InverterStatus {
    Offline,
    StatusUnavailable,
    NotFeedingOk,
    NotFeedingExternalEvent,
    NotFeedingError,
    FeedingWarning,
    Feeding,
    FeedingMpp,
    FeedingMaxPower,
}

impl InverterStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InverterStatus::Offline => "offline",
            InverterStatus::StatusUnavailable => "status-unavailable",
            InverterStatus::NotFeedingOk => "not-feeding-ok",
            InverterStatus::NotFeedingExternalEvent => "not-feeding-external-event",
            InverterStatus::NotFeedingError => "not-feeding-error",
            InverterStatus::FeedingWarning => "feeding-warning",
            InverterStatus::Feeding => "feeding",
            InverterStatus::FeedingMpp => "feeding-mpp",
            InverterStatus::FeedingMaxPower => "feeding-max-power",
        }
    }
}

const STATUS_CODES: &[(u32, InverterStatus, &str)] = &[
    (20002, InverterStatus::NotFeedingOk, "Solar radiation too low"),
    (20003, InverterStatus::NotFeedingOk, "Inverter Starting up"),
    (20004, InverterStatus::FeedingMpp, "Feeding on MPP"),
    (20006, InverterStatus::FeedingMaxPower, "Feeding. Inverter at power limit"),
    (20008, InverterStatus::Feeding, "Feeding"),
    (20115, InverterStatus::NotFeedingExternalEvent, "Off-grid"),
    (20116, InverterStatus::NotFeedingExternalEvent, "Grid Frequency too high"),
    (20117, InverterStatus::NotFeedingExternalEvent, "Grid Frequency too low"),
];

pub const UNKNOWN_STATUS_TEXT: &str = "Unknown status code, check the inverter display";

/// Map a SYS code to its status class and description.
pub fn status_for(code: u32) -> Option<(InverterStatus, &'static str)> {
    STATUS_CODES
        .iter()
        .find(|(known, _, _)| *known == code)
        .map(|(_, status, text)| (*status, *text))
}

pub type FirmwareString = ArrayString<32>;

/// SWV and BDN arrive as separate tokens and are merged into one string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FirmwareInfo {
    pub version: Option<u32>,
    pub build: Option<u32>,
}

impl FirmwareInfo {
    /// `major.minor`, plus ` Build n` once the build number is known.
    /// Nothing until the version itself arrived.
    pub fn render(&self) -> Option<FirmwareString> {
        let version = self.version?;
        let mut out = FirmwareString::new();
        let _ = write!(out, "{}.{}", version / 10, version % 10);
        if let Some(build) = self.build {
            let _ = write!(out, " Build {build}");
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_poll_code_is_known() {
        for code in DEFAULT_POLL_CODES.iter().chain(IDENTIFY_CODES.iter()) {
            assert!(lookup(code).is_some(), "{code} missing from table");
        }
    }

    #[test]
    fn test_field_codes_unique() {
        for (i, field) in FIELDS.iter().enumerate() {
            assert!(FIELDS[i + 1..].iter().all(|other| other.code != field.code));
        }
    }

    #[test]
    fn test_identification_codes_always_asked() {
        for code in IDENTIFY_CODES {
            assert_eq!(lookup(code).map(|field| field.backoff), Some(QueryBackoff::Always));
        }
        assert_eq!(lookup("PIN").map(|field| field.backoff), Some(QueryBackoff::Once));
    }

    #[test]
    fn test_model_lookup() {
        assert_eq!(model_name(2001), Some("SolarMax 2000 E"));
        assert_eq!(model_name(20010), Some("SolarMax 2000 S"));
        assert_eq!(model_name(7), None);
    }

    #[test]
    fn test_status_lookup() {
        assert_eq!(
            status_for(20004),
            Some((InverterStatus::FeedingMpp, "Feeding on MPP"))
        );
        assert_eq!(status_for(20116).map(|s| s.0), Some(InverterStatus::NotFeedingExternalEvent));
        assert_eq!(status_for(12345), None);
    }

    #[test]
    fn test_firmware_rendering() {
        let mut info = FirmwareInfo::default();
        assert!(info.render().is_none());

        info.build = Some(1234);
        assert!(info.render().is_none());

        info.version = Some(15);
        assert_eq!(info.render().unwrap().as_str(), "1.5 Build 1234");

        info.build = None;
        assert_eq!(info.render().unwrap().as_str(), "1.5");
    }
}
