//! Read-only views of the runtime for operators: capability snapshots and
//! driver counters, as JSON or as a coloured table.

use crate::capability::{CapabilityBus, Value, CAPABILITY_SET_CHANGED, CAPABILITY_SET_CLEAR_ALL, DATA_VALID};
use crate::inverter::{DriverStats, InverterDriver, InverterState, Phase};
use crate::scheduler::ComponentId;
use chrono::{DateTime, Utc};
use colored::Colorize;
use core::fmt::Write;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Copy of one owner's capabilities, in insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub owner: ComponentId,
    pub name: String,
    pub captured_at: DateTime<Utc>,
    pub entries: IndexMap<String, Value>,
}

impl StoreSnapshot {
    pub fn capture(bus: &CapabilityBus, owner: ComponentId, name: impl Into<String>) -> Option<Self> {
        let store = bus.store(owner)?;
        Some(Self {
            owner,
            name: name.into(),
            captured_at: Utc::now(),
            entries: store
                .iter()
                .map(|capability| (capability.name.clone(), capability.value.clone()))
                .collect(),
        })
    }

    pub fn data_valid(&self) -> bool {
        self.entries
            .get(DATA_VALID)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Entries other than the bus's own bookkeeping flags.
    pub fn readings(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries
            .iter()
            .filter(|(name, _)| !matches!(name.as_str(), CAPABILITY_SET_CHANGED | CAPABILITY_SET_CLEAR_ALL))
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn render_table(&self) -> String {
        let width = self.entries.keys().map(String::len).max().unwrap_or(0).max(12);
        let mut out = String::new();

        let validity = if self.data_valid() {
            "VALID".bright_green()
        } else {
            "INVALID".bright_red()
        };
        let _ = writeln!(
            out,
            "{} {} {}",
            format!("== {} ({}) ==", self.name, self.owner).bright_blue().bold(),
            validity,
            self.captured_at.format("%H:%M:%S").to_string().dimmed()
        );
        for (name, value) in self.readings() {
            let rendered = match value {
                Value::Float(v) => format!("{v:.2}").bright_cyan(),
                Value::Bool(true) => "yes".green(),
                Value::Bool(false) => "no".yellow(),
                other => other.to_string().normal(),
            };
            let _ = writeln!(out, "  {name:<width$}  {rendered}");
        }
        out
    }
}

/// Driver counters plus where the state machine currently is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverReport {
    pub name: String,
    pub state: InverterState,
    pub phase: Phase,
    pub error_count: u32,
    pub generation: u64,
    pub stats: DriverStats,
    pub recent_states: Vec<InverterState>,
}

impl DriverReport {
    pub fn from_driver(driver: &InverterDriver) -> Self {
        Self {
            name: driver.config().name.clone(),
            state: driver.state(),
            phase: driver.phase(),
            error_count: driver.error_count(),
            generation: driver.generation(),
            stats: driver.stats().clone(),
            recent_states: driver.history(),
        }
    }

    pub fn render_table(&self) -> String {
        let s = &self.stats;
        let errors = s.checksum_errors + s.framing_errors + s.token_errors + s.timeouts + s.transport_errors;
        let errors = if errors == 0 {
            errors.to_string().green()
        } else {
            errors.to_string().yellow()
        };
        format!(
            "  {} {:?}/{:?}  sent {}  received {}  cycles {}  errors {}  reconnects {}\n",
            "driver".dimmed(),
            self.phase,
            self.state,
            s.frames_sent,
            s.frames_received,
            s.cycles_completed,
            errors,
            s.reconnects
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus_with_readings() -> (CapabilityBus, ComponentId) {
        let mut bus = CapabilityBus::new();
        let owner = ComponentId(0);
        bus.register_owner(owner).unwrap();
        bus.publish(owner, "ac-power-total", 1500.0).unwrap();
        bus.publish(owner, "inverter-model", "SolarMax 2000 E").unwrap();
        (bus, owner)
    }

    #[test]
    fn test_snapshot_keeps_insertion_order() {
        let (bus, owner) = bus_with_readings();
        let snapshot = StoreSnapshot::capture(&bus, owner, "roof").unwrap();

        let names: Vec<_> = snapshot.entries.keys().map(String::as_str).collect();
        assert_eq!(
            names,
            vec![DATA_VALID, CAPABILITY_SET_CHANGED, CAPABILITY_SET_CLEAR_ALL, "ac-power-total", "inverter-model"]
        );
        let readings: Vec<_> = snapshot.readings().map(|(name, _)| name.as_str()).collect();
        assert_eq!(readings, vec![DATA_VALID, "ac-power-total", "inverter-model"]);
        assert!(!snapshot.data_valid());
    }

    #[test]
    fn test_snapshot_json() {
        let (mut bus, owner) = bus_with_readings();
        bus.set_data_valid(owner, true).unwrap();
        let snapshot = StoreSnapshot::capture(&bus, owner, "roof").unwrap();

        let json: serde_json::Value = serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(json["name"], "roof");
        assert_eq!(json["entries"]["ac-power-total"], 1500.0);
        assert_eq!(json["entries"][DATA_VALID], true);
    }

    #[test]
    fn test_table_lists_readings() {
        colored::control::set_override(false);
        let (bus, owner) = bus_with_readings();
        let table = StoreSnapshot::capture(&bus, owner, "roof").unwrap().render_table();

        assert!(table.contains("== roof (#0) == INVALID"));
        assert!(table.contains("1500.00"));
        assert!(!table.contains(CAPABILITY_SET_CLEAR_ALL));
    }

    #[test]
    fn test_unknown_owner_has_no_snapshot() {
        let bus = CapabilityBus::new();
        assert!(StoreSnapshot::capture(&bus, ComponentId(3), "x").is_none());
    }
}
