//! In-process Sputnik device behind the [`Connection`] trait.
//!
//! Answers queries with plausible values that follow a slow day curve, and
//! can inject transport and protocol faults. The fault dice come from a
//! fixed-seed LCG, so a given configuration always fails the same way.

use crate::connection::{Connection, ConnectionState};
use crate::error::{ConfigError, TransportError};
use crate::inverter::fields;
use crate::protocol::{expected_length, format_token, Frame, QUERY_PORT, TOKEN_DELIMITER};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, trace};

// Per-reply fault rates
const CORRUPT_CHECKSUM_PERCENT: f32 = 1.0;
const MALFORMED_TOKEN_PERCENT: f32 = 1.0;
const DROP_REPLY_PERCENT: f32 = 2.0;
const DROP_LINK_PERCENT: f32 = 0.2;

const DEFAULT_SEED: u64 = 0x1234_5678_9ABC_DEF0;

const INSTALLED_POWER_W: f64 = 4200.0;
const FIRMWARE_VERSION: u32 = 15;
const FIRMWARE_BUILD: u32 = 1234;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultInjectionConfig {
    pub enabled: bool,
    pub corrupt_checksum_percent: f32,
    pub malformed_token_percent: f32,
    pub drop_reply_percent: f32,
    pub drop_link_percent: f32,
    pub seed: u64,
}

impl Default for FaultInjectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            corrupt_checksum_percent: CORRUPT_CHECKSUM_PERCENT,
            malformed_token_percent: MALFORMED_TOKEN_PERCENT,
            drop_reply_percent: DROP_REPLY_PERCENT,
            drop_link_percent: DROP_LINK_PERCENT,
            seed: DEFAULT_SEED,
        }
    }
}

impl FaultInjectionConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SimulatorStats {
    pub queries_answered: u32,
    pub replies_dropped: u32,
    pub checksums_corrupted: u32,
    pub tokens_malformed: u32,
    pub links_dropped: u32,
    pub garbage_discarded: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    DropLink,
    DropReply,
    MalformedToken,
}

#[derive(Debug)]
pub struct SimulatedInverter {
    model: u32,
    timeout_ms: u64,
    faults: FaultInjectionConfig,
    state: ConnectionState,
    rx: Vec<u8>,
    outbound: VecDeque<u8>,
    ticks: u64,
    energy_total_kwh: f64,
    energy_today_kwh: f64,
    stats: SimulatorStats,
    rng_state: u64,
}

impl SimulatedInverter {
    pub fn new(model: u32, faults: FaultInjectionConfig, timeout_ms: u64) -> Self {
        let rng_state = faults.seed;
        Self {
            model,
            timeout_ms,
            faults,
            state: ConnectionState::Disconnected,
            rx: Vec::new(),
            outbound: VecDeque::new(),
            ticks: 0,
            energy_total_kwh: 12_345.0,
            energy_today_kwh: 0.0,
            stats: SimulatorStats::default(),
            rng_state,
        }
    }

    pub fn stats(&self) -> &SimulatorStats {
        &self.stats
    }

    /// Relative output between 0 and 1 over a slow sine "day".
    fn irradiance(&self) -> f64 {
        let phase = self.ticks as f64 * 0.01;
        phase.sin().abs()
    }

    fn ac_power_w(&self) -> f64 {
        INSTALLED_POWER_W * 0.9 * self.irradiance()
    }

    /// Device-side raw value for `code`, or `None` for codes this model does
    /// not answer.
    fn raw_values(&self, code: &str) -> Option<Vec<u32>> {
        let power = self.ac_power_w();
        let ac_voltage = 230.0 + 2.0 * (self.ticks as f64 * 0.3).sin();
        let dc_voltage = 320.0 + 40.0 * self.irradiance();
        let scaled = |value: f64| -> Option<Vec<u32>> {
            let scale = fields::lookup(code)?.scale;
            Some(vec![(value / scale).round().max(0.0) as u32])
        };

        match code {
            "TYP" => Some(vec![self.model]),
            "SWV" => Some(vec![FIRMWARE_VERSION]),
            "BDN" => Some(vec![FIRMWARE_BUILD]),
            "PAC" => scaled(power),
            "KHR" => scaled(8_000.0 + self.ticks as f64 / 720.0),
            "KYR" => scaled(3_100.0),
            "KMT" => scaled(310.0),
            "KDY" => scaled(self.energy_today_kwh),
            "KT0" => scaled(self.energy_total_kwh),
            "PIN" => scaled(INSTALLED_POWER_W),
            "TNF" => scaled(50.0 + 0.02 * (self.ticks as f64 * 0.7).sin()),
            "PRL" => scaled(100.0 * power / INSTALLED_POWER_W),
            "UDC" => scaled(dc_voltage),
            "IDC" => scaled(if dc_voltage > 0.0 { power / 0.96 / dc_voltage } else { 0.0 }),
            "UL1" => scaled(ac_voltage),
            "IL1" => scaled(power / ac_voltage),
            "TKK" => scaled(25.0 + 20.0 * self.irradiance()),
            "SYS" => {
                let status = if power < 50.0 { 20002 } else { 20004 };
                Some(vec![status, 0])
            }
            _ => None,
        }
    }

    fn advance(&mut self) {
        self.ticks += 1;
        // One tick stands for one query, roughly 0.3 s of device time.
        let kwh = self.ac_power_w() * 0.3 / 3_600_000.0;
        self.energy_today_kwh += kwh;
        self.energy_total_kwh += kwh;
    }

    fn answer(&mut self, query: &Frame) {
        self.advance();

        let codes = query
            .payload
            .split(|b| *b == TOKEN_DELIMITER)
            .filter_map(|code| core::str::from_utf8(code).ok())
            .filter(|code| !code.is_empty());
        let mut tokens: Vec<String> = codes
            .filter_map(|code| self.raw_values(code).map(|values| format_token(code, &values)))
            .collect();

        match self.roll_fault() {
            Some(Fault::DropLink) => {
                debug!("simulator dropping link");
                self.stats.links_dropped += 1;
                self.state = ConnectionState::Error;
                return;
            }
            Some(Fault::DropReply) => {
                trace!("simulator dropping reply");
                self.stats.replies_dropped += 1;
                return;
            }
            Some(Fault::MalformedToken) => {
                if let Some(first) = tokens.first_mut() {
                    if let Some(eq) = first.find('=') {
                        first.truncate(eq + 1);
                        first.push_str("ZZ");
                    }
                }
                self.stats.tokens_malformed += 1;
            }
            None => {}
        }

        let mut reply = Frame::new(query.address, QUERY_PORT, tokens.join(";").into_bytes());
        if self.roll_corrupt_checksum() {
            reply.checksum = reply.checksum.wrapping_add(1);
            self.stats.checksums_corrupted += 1;
        }

        match reply.encode() {
            Ok(wire) => {
                self.outbound.extend(wire.iter().copied());
                self.stats.queries_answered += 1;
            }
            Err(err) => debug!(error = %err, "simulator reply does not fit a telegram"),
        }
    }

    fn roll_corrupt_checksum(&mut self) -> bool {
        self.faults.enabled && self.should_inject(self.faults.corrupt_checksum_percent)
    }

    fn roll_fault(&mut self) -> Option<Fault> {
        if !self.faults.enabled {
            return None;
        }
        if self.should_inject(self.faults.drop_link_percent) {
            return Some(Fault::DropLink);
        }
        if self.should_inject(self.faults.drop_reply_percent) {
            return Some(Fault::DropReply);
        }
        if self.should_inject(self.faults.malformed_token_percent) {
            return Some(Fault::MalformedToken);
        }
        None
    }

    fn should_inject(&mut self, rate_percent: f32) -> bool {
        self.random_float() < rate_percent / 100.0
    }

    fn next_random(&mut self) -> u64 {
        // Linear congruential generator, Numerical Recipes parameters
        self.rng_state = self
            .rng_state
            .wrapping_mul(1_664_525)
            .wrapping_add(1_013_904_223);
        self.rng_state
    }

    fn random_float(&mut self) -> f32 {
        // Upper bits of an LCG are the well-mixed ones.
        ((self.next_random() >> 40) as f32) / ((1u64 << 24) as f32)
    }

    fn consume_queries(&mut self) {
        loop {
            let total = match expected_length(&self.rx) {
                Ok(Some(total)) if self.rx.len() >= total => total,
                Ok(_) => return,
                Err(_) => {
                    // Resynchronise on the next start marker.
                    let skip = self.rx.iter().skip(1).position(|b| *b == b'{').map_or(self.rx.len(), |p| p + 1);
                    self.rx.drain(..skip);
                    self.stats.garbage_discarded += 1;
                    continue;
                }
            };
            let telegram: Vec<u8> = self.rx.drain(..total).collect();
            match Frame::decode(&telegram) {
                Ok(query) if query.command == QUERY_PORT => self.answer(&query),
                Ok(other) => trace!(command = other.command, "simulator ignoring command"),
                Err(err) => {
                    trace!(error = %err, "simulator ignoring bad query");
                    self.stats.garbage_discarded += 1;
                }
            }
        }
    }
}

impl Connection for SimulatedInverter {
    fn connect(&mut self) -> nb::Result<(), TransportError> {
        self.state = ConnectionState::Connected;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.state = ConnectionState::Disconnected;
        self.rx.clear();
        self.outbound.clear();
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> nb::Result<usize, TransportError> {
        if self.state != ConnectionState::Connected {
            return Err(nb::Error::Other(TransportError::NotConnected));
        }
        self.rx.extend_from_slice(bytes);
        self.consume_queries();
        Ok(bytes.len())
    }

    fn receive(&mut self, buf: &mut [u8]) -> nb::Result<usize, TransportError> {
        match self.state {
            ConnectionState::Connected => {}
            ConnectionState::Error => {
                self.state = ConnectionState::Disconnected;
                return Err(nb::Error::Other(TransportError::Closed));
            }
            _ => return Err(nb::Error::Other(TransportError::NotConnected)),
        }
        if self.outbound.is_empty() {
            return Err(nb::Error::WouldBlock);
        }
        let n = buf.len().min(self.outbound.len());
        for (slot, byte) in buf.iter_mut().zip(self.outbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn check_config(&self) -> Result<(), ConfigError> {
        let rates = [
            ("corrupt_checksum_percent", self.faults.corrupt_checksum_percent),
            ("malformed_token_percent", self.faults.malformed_token_percent),
            ("drop_reply_percent", self.faults.drop_reply_percent),
            ("drop_link_percent", self.faults.drop_link_percent),
        ];
        for (key, rate) in rates {
            if !(0.0..=100.0).contains(&rate) {
                return Err(ConfigError::invalid(
                    format!("connection.faults.{key}"),
                    "must be between 0 and 100",
                ));
            }
        }
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    fn describe(&self) -> String {
        format!("simulated model {}", self.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(sim: &mut SimulatedInverter, codes: &[&str]) -> Option<Frame> {
        let wire = Frame::query(1, codes).encode().unwrap();
        sim.send(&wire).unwrap();
        let mut buf = [0u8; 255];
        match sim.receive(&mut buf) {
            Ok(n) => Some(Frame::parse_unverified(&buf[..n]).unwrap()),
            Err(_) => None,
        }
    }

    #[test]
    fn test_answers_identification() {
        let mut sim = SimulatedInverter::new(2001, FaultInjectionConfig::disabled(), 1_000);
        sim.connect().unwrap();

        let reply = exchange(&mut sim, &["TYP"]).unwrap();
        assert!(reply.verify().is_ok());
        assert_eq!(reply.payload, format_token("TYP", &[2001]).into_bytes());
    }

    #[test]
    fn test_unknown_codes_left_out() {
        let mut sim = SimulatedInverter::new(2001, FaultInjectionConfig::disabled(), 1_000);
        sim.connect().unwrap();

        let reply = exchange(&mut sim, &["XYZ", "SWV"]).unwrap();
        assert_eq!(reply.payload, b"SWV=F".to_vec());
    }

    #[test]
    fn test_silent_until_connected() {
        let mut sim = SimulatedInverter::new(2001, FaultInjectionConfig::disabled(), 1_000);
        assert!(matches!(sim.send(b"{"), Err(nb::Error::Other(TransportError::NotConnected))));
    }

    #[test]
    fn test_fault_injection_is_deterministic() {
        let faults = FaultInjectionConfig {
            enabled: true,
            corrupt_checksum_percent: 20.0,
            malformed_token_percent: 20.0,
            drop_reply_percent: 20.0,
            drop_link_percent: 0.0,
            seed: 42,
        };
        let run = || {
            let mut sim = SimulatedInverter::new(2001, faults.clone(), 1_000);
            sim.connect().unwrap();
            for _ in 0..200 {
                let _ = exchange(&mut sim, &["PAC"]);
            }
            sim.stats().clone()
        };

        let first = run();
        assert_eq!(first, run());
        assert!(first.replies_dropped > 0);
        assert!(first.checksums_corrupted > 0);
        assert!(first.tokens_malformed > 0);
        assert_eq!(first.queries_answered + first.replies_dropped, 200);
    }

    #[test]
    fn test_dropped_link_reports_closed() {
        let faults = FaultInjectionConfig {
            enabled: true,
            corrupt_checksum_percent: 0.0,
            malformed_token_percent: 0.0,
            drop_reply_percent: 0.0,
            drop_link_percent: 100.0,
            seed: 1,
        };
        let mut sim = SimulatedInverter::new(2001, faults, 1_000);
        sim.connect().unwrap();

        let wire = Frame::query(1, &["PAC"]).encode().unwrap();
        sim.send(&wire).unwrap();
        let mut buf = [0u8; 32];
        assert!(matches!(
            sim.receive(&mut buf),
            Err(nb::Error::Other(TransportError::Closed))
        ));
        assert_eq!(sim.state(), ConnectionState::Disconnected);
    }
}
