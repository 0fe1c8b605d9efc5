//! Polling driver for Sputnik S-series inverters.
//!
//! The driver is a [`CommandTarget`]: every state of the protocol machine is
//! one command kind, and each handler ends by scheduling the next state. No
//! handler ever waits; "not yet" always becomes a rescheduled command.
//!
//! ```text
//! Init -> WaitForConnection -> Identify -> SendQueries -> WaitSent -> WaitReceive
//!             ^                   |            ^                          |
//!             |                 Poll ----------+                   EvaluateReceive
//!             |                                                           |
//!      DisconnectedWait <- Disconnected <--- transport error / threshold -+
//! ```

pub mod backoff;
pub mod fields;

use crate::capability::Value;
use backoff::{QueryBackoff, QueryTracker};
use crate::config::InverterConfig;
use crate::connection::{create_connection, Connection};
use crate::error::{ConfigError, InvariantViolation, TransportError};
use crate::protocol::{expected_length, Frame, ProtocolError, Token, HEADER_LEN, MAX_TELEGRAM_SIZE};
use crate::runtime::{CommandTarget, Context};
use crate::scheduler::Command;
use chrono::Utc;
use fields::{Decoder, FieldSpec, FirmwareInfo, InverterStatus};
use heapless::{Deque, HistoryBuffer};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

pub const MAX_QUEUED_QUERIES: usize = 32;
pub const HISTORY_DEPTH: usize = 32;

/// Poll period while a connect attempt is pending.
const CONNECT_POLL_MS: i64 = 100;
/// Base of the linear backoff between failed connect attempts.
const CONNECT_RETRY_MS: i64 = 1_000;
/// Wait before re-identifying after a failed identification.
const IDENTIFY_RETRY_MS: i64 = 2_000;
const SEND_RETRY_MS: i64 = 50;
const RECEIVE_POLL_MS: i64 = 50;

type RxBuffer = heapless::Vec<u8, MAX_TELEGRAM_SIZE>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InverterState {
    Init,
    WaitForConnection,
    Identify,
    Poll,
    SendQueries,
    WaitSent,
    WaitReceive,
    EvaluateReceive,
    Disconnected,
    DisconnectedWait,
}

/// Command kind of the driver: the state to run, stamped with the
/// connection generation it was scheduled under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InverterCommand {
    pub state: InverterState,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Identifying,
    Polling,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriverStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub checksum_errors: u64,
    pub framing_errors: u64,
    pub token_errors: u64,
    pub unknown_fields: u64,
    pub timeouts: u64,
    pub transport_errors: u64,
    pub reconnects: u64,
    pub cycles_completed: u64,
    pub stale_commands: u64,
    /// Replies that left the requested code out, and reply timeouts.
    pub unanswered_queries: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reception {
    /// The requested code came back and decoded.
    Clean,
    /// A well-formed reply without the requested code.
    Unanswered,
    Faulty,
}

enum TokenOutcome {
    Applied,
    Unknown,
    Malformed(ProtocolError),
}

enum Decoded {
    Number(f64),
    Model(&'static str),
    Firmware,
    Status {
        code: u32,
        status: InverterStatus,
        text: &'static str,
    },
}

pub struct InverterDriver {
    config: InverterConfig,
    trackers: Vec<QueryTracker>,
    connection: Box<dyn Connection>,
    state: InverterState,
    phase: Phase,
    generation: u64,

    queries: Deque<&'static str, MAX_QUEUED_QUERIES>,
    in_flight: Option<&'static str>,
    tx: heapless::Vec<u8, MAX_TELEGRAM_SIZE>,
    tx_offset: usize,
    rx: RxBuffer,
    send_deadline_ms: u64,
    receive_deadline_ms: u64,

    error_count: u32,
    connect_failures: u32,
    connect_started_ms: Option<u64>,
    clean_replies_in_cycle: u32,

    firmware: FirmwareInfo,
    last_status_code: Option<u32>,

    history: HistoryBuffer<InverterState, HISTORY_DEPTH>,
    stats: DriverStats,
}

impl InverterDriver {
    pub fn new(config: InverterConfig, connection: Box<dyn Connection>) -> Result<Self, ConfigError> {
        config.validate()?;
        connection.check_config()?;
        let trackers = config
            .resolved_poll_codes()?
            .into_iter()
            .map(|code| {
                let backoff = fields::lookup(code).map_or(QueryBackoff::Always, |field| field.backoff);
                QueryTracker::new(code, backoff)
            })
            .collect();

        Ok(Self {
            config,
            trackers,
            connection,
            state: InverterState::Init,
            phase: Phase::Identifying,
            generation: 0,
            queries: Deque::new(),
            in_flight: None,
            tx: heapless::Vec::new(),
            tx_offset: 0,
            rx: RxBuffer::new(),
            send_deadline_ms: 0,
            receive_deadline_ms: 0,
            error_count: 0,
            connect_failures: 0,
            connect_started_ms: None,
            clean_replies_in_cycle: 0,
            firmware: FirmwareInfo::default(),
            last_status_code: None,
            history: HistoryBuffer::new(),
            stats: DriverStats::default(),
        })
    }

    /// Build the transport named in the configuration as well.
    pub fn from_config(config: InverterConfig) -> Result<Self, ConfigError> {
        let connection = create_connection(&config.connection)?;
        Self::new(config, connection)
    }

    pub fn config(&self) -> &InverterConfig {
        &self.config
    }

    pub fn state(&self) -> InverterState {
        self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn stats(&self) -> &DriverStats {
        &self.stats
    }

    /// States entered, oldest first, bounded to the last [`HISTORY_DEPTH`].
    pub fn history(&self) -> Vec<InverterState> {
        self.history.oldest_ordered().copied().collect()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn pending_queries(&self) -> Vec<&'static str> {
        self.queries.iter().copied().collect()
    }

    /// Backoff state of every polled code.
    pub fn query_trackers(&self) -> &[QueryTracker] {
        &self.trackers
    }

    pub fn connection(&self) -> &dyn Connection {
        self.connection.as_ref()
    }

    fn command(&self, state: InverterState) -> InverterCommand {
        InverterCommand {
            state,
            generation: self.generation,
        }
    }

    /// Enter `next` and schedule its handler after `delay_ms`.
    fn transition(&mut self, ctx: &mut Context<'_>, next: InverterState, delay_ms: i64) -> Result<(), InvariantViolation> {
        if next != self.state {
            debug!(inverter = %self.config.name, from = ?self.state, to = ?next, "state transition");
            self.history.write(next);
            self.state = next;
        }
        ctx.schedule_self_at(self.command(next), delay_ms)
    }

    /// Run the current state's handler again later.
    fn reschedule(&mut self, ctx: &mut Context<'_>, delay_ms: i64) -> Result<(), InvariantViolation> {
        let state = self.state;
        self.transition(ctx, state, delay_ms)
    }

    fn on_init(&mut self, ctx: &mut Context<'_>) -> Result<(), InvariantViolation> {
        // No upstream capabilities to subscribe to; the device is the source.
        self.transition(ctx, InverterState::WaitForConnection, 0)
    }

    fn on_wait_for_connection(&mut self, ctx: &mut Context<'_>) -> Result<(), InvariantViolation> {
        let now = ctx.now_ms();
        let started = *self.connect_started_ms.get_or_insert(now);

        match self.connection.connect() {
            Ok(()) => {
                if self.connect_failures > 0 || self.stats.reconnects > 0 {
                    info!(inverter = %self.config.name, peer = %self.connection.describe(), "connected");
                }
                self.connect_started_ms = None;
                self.connect_failures = 0;
                self.transition(ctx, InverterState::Identify, 0)
            }
            Err(nb::Error::WouldBlock) => {
                if now.saturating_sub(started) >= self.connection.timeout_ms() {
                    warn!(inverter = %self.config.name, "connect timed out");
                    self.stats.timeouts += 1;
                    self.connect_failed(ctx)
                } else {
                    self.reschedule(ctx, CONNECT_POLL_MS)
                }
            }
            Err(nb::Error::Other(err)) => {
                warn!(inverter = %self.config.name, error = %err, "connect failed");
                self.stats.transport_errors += 1;
                self.connect_failed(ctx)
            }
        }
    }

    fn connect_failed(&mut self, ctx: &mut Context<'_>) -> Result<(), InvariantViolation> {
        self.connect_started_ms = None;
        self.connect_failures += 1;
        if let Err(err) = self.connection.disconnect() {
            debug!(inverter = %self.config.name, error = %err, "disconnect after failed connect");
        }

        if self.connect_failures >= self.config.connect_retries {
            warn!(
                inverter = %self.config.name,
                attempts = self.connect_failures,
                "giving up for now, backing off"
            );
            self.connect_failures = 0;
            self.enter_backoff(ctx)
        } else {
            let backoff = CONNECT_RETRY_MS * i64::from(self.connect_failures);
            self.reschedule(ctx, backoff)
        }
    }

    fn on_identify(&mut self, ctx: &mut Context<'_>) -> Result<(), InvariantViolation> {
        self.phase = Phase::Identifying;
        self.firmware = FirmwareInfo::default();
        self.queries.clear();
        for code in fields::IDENTIFY_CODES {
            let _ = self.queries.push_back(code);
        }
        self.transition(ctx, InverterState::SendQueries, 0)
    }

    fn on_poll(&mut self, ctx: &mut Context<'_>) -> Result<(), InvariantViolation> {
        self.phase = Phase::Polling;
        self.clean_replies_in_cycle = 0;
        self.queries.clear();
        let now = ctx.now_ms();
        for tracker in self.trackers.iter().filter(|tracker| tracker.consider(now)) {
            // Bounded by config validation.
            let _ = self.queries.push_back(tracker.code());
        }
        if self.queries.is_empty() {
            debug!(inverter = %self.config.name, "no code due this cycle");
        }
        self.transition(ctx, InverterState::SendQueries, 0)
    }

    fn on_send_queries(&mut self, ctx: &mut Context<'_>) -> Result<(), InvariantViolation> {
        let Some(code) = self.queries.front().copied() else {
            return self.finish_cycle(ctx);
        };

        self.discard_stale_input();
        let wire = match Frame::query(self.config.address, &[code]).encode() {
            Ok(wire) => wire,
            Err(err) => {
                warn!(inverter = %self.config.name, code, error = %err, "cannot encode query, dropping it");
                self.queries.pop_front();
                return self.reschedule(ctx, 0);
            }
        };
        trace!(inverter = %self.config.name, telegram = %String::from_utf8_lossy(&wire), "tx");

        self.tx = wire;
        self.tx_offset = 0;
        self.rx.clear();
        self.in_flight = Some(code);
        self.send_deadline_ms = ctx.now_ms().saturating_add(self.connection.timeout_ms());

        match self.push_tx() {
            Ok(()) => self.transition(ctx, InverterState::WaitSent, 0),
            Err(err) => self.transport_failed(ctx, err),
        }
    }

    /// Hand as much of the pending telegram to the transport as it takes.
    fn push_tx(&mut self) -> Result<(), TransportError> {
        while self.tx_offset < self.tx.len() {
            match self.connection.send(&self.tx[self.tx_offset..]) {
                Ok(0) | Err(nb::Error::WouldBlock) => break,
                Ok(n) => self.tx_offset += n,
                Err(nb::Error::Other(err)) => return Err(err),
            }
        }
        Ok(())
    }

    fn on_wait_sent(&mut self, ctx: &mut Context<'_>) -> Result<(), InvariantViolation> {
        if let Err(err) = self.push_tx() {
            return self.transport_failed(ctx, err);
        }

        if self.tx_offset >= self.tx.len() {
            self.stats.frames_sent += 1;
            self.receive_deadline_ms = ctx.now_ms().saturating_add(self.connection.timeout_ms());
            self.transition(ctx, InverterState::WaitReceive, 0)
        } else if ctx.now_ms() >= self.send_deadline_ms {
            warn!(inverter = %self.config.name, "send did not complete in time");
            self.stats.timeouts += 1;
            self.transition(ctx, InverterState::Disconnected, 0)
        } else {
            self.reschedule(ctx, SEND_RETRY_MS)
        }
    }

    fn on_wait_receive(&mut self, ctx: &mut Context<'_>) -> Result<(), InvariantViolation> {
        let mut chunk = [0u8; MAX_TELEGRAM_SIZE];

        loop {
            // Read no further than the end of the current telegram.
            let wanted = match expected_length(&self.rx) {
                Ok(Some(total)) if self.rx.len() >= total => {
                    return self.transition(ctx, InverterState::EvaluateReceive, 0);
                }
                Ok(Some(total)) => total - self.rx.len(),
                Ok(None) => HEADER_LEN - self.rx.len(),
                // Let evaluation account for the broken telegram.
                Err(_) => return self.transition(ctx, InverterState::EvaluateReceive, 0),
            };

            match self.connection.receive(&mut chunk[..wanted]) {
                Ok(0) | Err(nb::Error::WouldBlock) => break,
                Ok(n) => self.skip_to_start_marker(&chunk[..n]),
                Err(nb::Error::Other(err)) => return self.transport_failed(ctx, err),
            }
        }

        if ctx.now_ms() >= self.receive_deadline_ms {
            self.reply_timeout(ctx)
        } else {
            self.reschedule(ctx, RECEIVE_POLL_MS)
        }
    }

    /// Append received bytes, dropping anything in front of a start marker.
    fn skip_to_start_marker(&mut self, bytes: &[u8]) {
        let bytes = if self.rx.is_empty() {
            match bytes.iter().position(|b| *b == b'{') {
                Some(start) => {
                    if start > 0 {
                        trace!(inverter = %self.config.name, skipped = start, "noise before telegram");
                    }
                    &bytes[start..]
                }
                None => return,
            }
        } else {
            bytes
        };
        // `wanted` never exceeds the remaining capacity.
        let _ = self.rx.extend_from_slice(bytes);
    }

    /// Late replies to an abandoned query must not be taken for the answer
    /// to the next one.
    fn discard_stale_input(&mut self) {
        let mut sink = [0u8; 64];
        let mut dropped = 0usize;
        while let Ok(n) = self.connection.receive(&mut sink) {
            if n == 0 {
                break;
            }
            dropped += n;
        }
        if dropped > 0 {
            debug!(inverter = %self.config.name, bytes = dropped, "discarded stale input");
        }
    }

    fn reply_timeout(&mut self, ctx: &mut Context<'_>) -> Result<(), InvariantViolation> {
        self.stats.timeouts += 1;
        self.error_count += 1;
        warn!(
            inverter = %self.config.name,
            query = self.in_flight.unwrap_or("-"),
            errors = self.error_count,
            "no reply before timeout"
        );
        let code = self.in_flight.take();

        if self.error_count >= self.config.error_threshold {
            return self.force_resync(ctx);
        }
        match self.phase {
            Phase::Polling => {
                if let Some(code) = code {
                    let now = ctx.now_ms();
                    self.record_reply(code, false, now);
                    if self.tracker(code).is_some_and(|tracker| !tracker.consider(now)) {
                        self.queries.pop_front();
                    }
                }
                // Otherwise the query stays at the queue front and is sent again.
                self.transition(ctx, InverterState::SendQueries, 0)
            }
            Phase::Identifying => self.transition(ctx, InverterState::WaitForConnection, IDENTIFY_RETRY_MS),
        }
    }

    fn on_evaluate_receive(&mut self, ctx: &mut Context<'_>) -> Result<(), InvariantViolation> {
        let raw = core::mem::take(&mut self.rx);
        trace!(inverter = %self.config.name, telegram = %String::from_utf8_lossy(&raw), "rx");

        let frame = match Frame::decode(&raw) {
            Ok(frame) => frame,
            Err(err) => {
                if matches!(err, ProtocolError::ChecksumMismatch { .. }) {
                    self.stats.checksum_errors += 1;
                } else {
                    self.stats.framing_errors += 1;
                }
                warn!(
                    inverter = %self.config.name,
                    query = self.in_flight.unwrap_or("-"),
                    error = %err,
                    "discarding reply"
                );
                // The in-flight query counts as answered and failed.
                self.error_count += 1;
                self.queries.pop_front();
                self.in_flight = None;
                return self.after_reception(ctx, Reception::Faulty);
            }
        };
        self.stats.frames_received += 1;

        if frame.address != self.config.address {
            debug!(
                inverter = %self.config.name,
                address = frame.address,
                "reply for another address, still waiting"
            );
            return self.transition(ctx, InverterState::WaitReceive, 0);
        }

        let mut malformed = false;
        let mut answered = false;
        for token in frame.tokens() {
            let (requested, outcome) = match token {
                Ok(token) => (self.in_flight == Some(token.code), self.dispatch_token(ctx, &token)?),
                Err(err) => (false, TokenOutcome::Malformed(err)),
            };
            match outcome {
                TokenOutcome::Applied => answered |= requested,
                TokenOutcome::Unknown => {}
                TokenOutcome::Malformed(err) => {
                    warn!(inverter = %self.config.name, error = %err, "malformed token");
                    self.stats.token_errors += 1;
                    self.error_count += 1;
                    malformed = true;
                }
            }
        }

        self.queries.pop_front();
        let reception = match (malformed, answered) {
            (true, _) => Reception::Faulty,
            (false, true) => Reception::Clean,
            (false, false) => Reception::Unanswered,
        };
        if let Some(code) = self.in_flight.take() {
            if reception != Reception::Faulty {
                self.record_reply(code, answered, ctx.now_ms());
            }
        }
        self.after_reception(ctx, reception)
    }

    fn tracker(&self, code: &str) -> Option<&QueryTracker> {
        self.trackers.iter().find(|tracker| tracker.code() == code)
    }

    /// Feed the backoff of a polled code. Identification codes have none.
    fn record_reply(&mut self, code: &'static str, answered: bool, now_ms: u64) {
        if !answered {
            self.stats.unanswered_queries += 1;
            debug!(inverter = %self.config.name, code, "query not answered");
        }
        let Some(tracker) = self.trackers.iter_mut().find(|tracker| tracker.code() == code) else {
            return;
        };
        if answered {
            tracker.record_answer(now_ms);
        } else if tracker.record_miss() {
            info!(
                inverter = %self.config.name,
                code,
                "query looks unsupported, not asked again until reconnect"
            );
        }
    }

    fn after_reception(&mut self, ctx: &mut Context<'_>, reception: Reception) -> Result<(), InvariantViolation> {
        if reception == Reception::Clean {
            self.error_count = 0;
            self.clean_replies_in_cycle += 1;
        }
        if self.error_count >= self.config.error_threshold {
            return self.force_resync(ctx);
        }
        if reception != Reception::Clean && self.phase == Phase::Identifying {
            return self.transition(ctx, InverterState::WaitForConnection, IDENTIFY_RETRY_MS);
        }
        if self.queries.is_empty() {
            self.finish_cycle(ctx)
        } else {
            self.transition(ctx, InverterState::SendQueries, 0)
        }
    }

    fn force_resync(&mut self, ctx: &mut Context<'_>) -> Result<(), InvariantViolation> {
        warn!(
            inverter = %self.config.name,
            errors = self.error_count,
            threshold = self.config.error_threshold,
            "error threshold reached, forcing reconnect"
        );
        self.error_count = 0;
        self.transition(ctx, InverterState::Disconnected, 0)
    }

    fn transport_failed(&mut self, ctx: &mut Context<'_>, err: TransportError) -> Result<(), InvariantViolation> {
        warn!(inverter = %self.config.name, error = %err, "transport failure");
        self.stats.transport_errors += 1;
        self.transition(ctx, InverterState::Disconnected, 0)
    }

    fn finish_cycle(&mut self, ctx: &mut Context<'_>) -> Result<(), InvariantViolation> {
        match self.phase {
            Phase::Identifying => {
                let model = ctx
                    .store()
                    .and_then(|store| store.value(fields::INVERTER_MODEL))
                    .map(ToString::to_string)
                    .unwrap_or_default();
                let firmware = self.firmware.render().unwrap_or_default();
                info!(inverter = %self.config.name, %model, firmware = %firmware, "inverter identified");
                self.transition(ctx, InverterState::Poll, 0)
            }
            Phase::Polling => {
                self.stats.cycles_completed += 1;
                if self.clean_replies_in_cycle > 0 {
                    ctx.publish(fields::LAST_UPDATE, Value::Timestamp(Utc::now()))?;
                    ctx.set_data_valid(true)?;
                }
                let interval = i64::try_from(self.config.query_interval_ms()).unwrap_or(i64::MAX);
                self.transition(ctx, InverterState::Poll, interval)
            }
        }
    }

    fn on_disconnected(&mut self, ctx: &mut Context<'_>) -> Result<(), InvariantViolation> {
        // Anything still queued under the old generation is now stale.
        self.generation += 1;
        if let Err(err) = self.connection.disconnect() {
            debug!(inverter = %self.config.name, error = %err, "disconnect failed");
        }
        self.queries.clear();
        self.in_flight = None;
        self.tx.clear();
        self.tx_offset = 0;
        self.rx.clear();
        self.error_count = 0;
        self.connect_started_ms = None;
        self.firmware = FirmwareInfo::default();
        for tracker in &mut self.trackers {
            tracker.reset();
        }
        self.stats.reconnects += 1;

        ctx.set_data_valid(false)?;
        self.enter_backoff(ctx)
    }

    /// Sit in DisconnectedWait for the reconnect backoff.
    fn enter_backoff(&mut self, ctx: &mut Context<'_>) -> Result<(), InvariantViolation> {
        let backoff = i64::try_from(self.config.reconnect_backoff_ms).unwrap_or(i64::MAX);
        self.transition(ctx, InverterState::DisconnectedWait, backoff)
    }

    fn on_disconnected_wait(&mut self, ctx: &mut Context<'_>) -> Result<(), InvariantViolation> {
        self.transition(ctx, InverterState::WaitForConnection, 0)
    }

    fn scale_for(&self, field: &FieldSpec) -> f64 {
        self.config
            .scale_overrides
            .get(field.code)
            .copied()
            .unwrap_or(field.scale)
    }

    fn decode_token(&mut self, field: &FieldSpec, token: &Token<'_>) -> Result<Decoded, ProtocolError> {
        if token.arity() != field.arity {
            return Err(token.malformed());
        }
        let raw = token.hex_value(0)?;

        match field.decoder {
            Decoder::Numeric => Ok(Decoded::Number(f64::from(raw) * self.scale_for(field))),
            Decoder::Model => {
                let name = fields::model_name(raw).unwrap_or_else(|| {
                    info!(inverter = %self.config.name, model = raw, "unknown model id");
                    fields::UNKNOWN_MODEL
                });
                Ok(Decoded::Model(name))
            }
            Decoder::FirmwareVersion => {
                if raw == 0 {
                    return Err(token.malformed());
                }
                self.firmware.version = Some(raw);
                Ok(Decoded::Firmware)
            }
            Decoder::FirmwareBuild => {
                if raw == 0 {
                    return Err(token.malformed());
                }
                self.firmware.build = Some(raw);
                Ok(Decoded::Firmware)
            }
            Decoder::Status => {
                if raw == 0 {
                    return Err(token.malformed());
                }
                let secondary = token.hex_value(1)?;
                if secondary != 0 {
                    info!(inverter = %self.config.name, code = raw, secondary, "unexpected secondary status value");
                }
                let (status, text) = fields::status_for(raw).unwrap_or_else(|| {
                    if self.last_status_code != Some(raw) {
                        info!(inverter = %self.config.name, code = raw, "unknown status code");
                    }
                    (InverterStatus::StatusUnavailable, fields::UNKNOWN_STATUS_TEXT)
                });
                self.last_status_code = Some(raw);
                Ok(Decoded::Status {
                    code: raw,
                    status,
                    text,
                })
            }
        }
    }

    fn dispatch_token(&mut self, ctx: &mut Context<'_>, token: &Token<'_>) -> Result<TokenOutcome, InvariantViolation> {
        let Some(field) = fields::lookup(token.code) else {
            debug!(inverter = %self.config.name, code = token.code, "unknown field code, skipped");
            self.stats.unknown_fields += 1;
            return Ok(TokenOutcome::Unknown);
        };

        let decoded = match self.decode_token(field, token) {
            Ok(decoded) => decoded,
            Err(err) => return Ok(TokenOutcome::Malformed(err)),
        };

        match decoded {
            Decoded::Number(value) => {
                ctx.publish(field.capability, Value::Float(value))?;
            }
            Decoded::Model(name) => {
                ctx.publish(fields::INVERTER_MODEL, name)?;
            }
            Decoded::Firmware => {
                if let Some(rendered) = self.firmware.render() {
                    ctx.publish(fields::FIRMWARE_VERSION, rendered.as_str())?;
                }
            }
            Decoded::Status { code, status, text } => {
                ctx.publish(fields::STATUS_CODE, Value::Int(i64::from(code)))?;
                ctx.publish(fields::STATUS_TEXT, text)?;
                ctx.publish(fields::INVERTER_STATUS, status.as_str())?;
            }
        }
        Ok(TokenOutcome::Applied)
    }
}

impl CommandTarget for InverterDriver {
    type Kind = InverterCommand;

    fn name(&self) -> &str {
        &self.config.name
    }

    fn attach(&mut self, ctx: &mut Context<'_>) -> Result<(), InvariantViolation> {
        ctx.publish(fields::MANUFACTURER, fields::MANUFACTURER_NAME)?;
        ctx.publish(fields::QUERY_INTERVAL, self.config.query_interval_s)?;
        ctx.publish(fields::CONFIG_NAME, self.config.name.as_str())?;

        self.state = InverterState::Init;
        self.history.write(InverterState::Init);
        info!(
            inverter = %self.config.name,
            peer = %self.connection.describe(),
            address = self.config.address,
            "driver attached"
        );
        ctx.schedule_self_now(self.command(InverterState::Init))
    }

    fn execute(&mut self, command: Command<InverterCommand>, ctx: &mut Context<'_>) -> Result<(), InvariantViolation> {
        let InverterCommand { state, generation } = command.kind;
        if generation != self.generation || state != self.state {
            trace!(
                inverter = %self.config.name,
                ?state,
                generation,
                current = self.generation,
                "stale command ignored"
            );
            self.stats.stale_commands += 1;
            return Ok(());
        }

        match state {
            InverterState::Init => self.on_init(ctx),
            InverterState::WaitForConnection => self.on_wait_for_connection(ctx),
            InverterState::Identify => self.on_identify(ctx),
            InverterState::Poll => self.on_poll(ctx),
            InverterState::SendQueries => self.on_send_queries(ctx),
            InverterState::WaitSent => self.on_wait_sent(ctx),
            InverterState::WaitReceive => self.on_wait_receive(ctx),
            InverterState::EvaluateReceive => self.on_evaluate_receive(ctx),
            InverterState::Disconnected => self.on_disconnected(ctx),
            InverterState::DisconnectedWait => self.on_disconnected_wait(ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::DATA_VALID;
    use crate::clock::ManualClock;
    use crate::config::ConnectionConfig;
    use crate::connection::{MockConnection, MockHandle};
    use crate::protocol::{format_token, QUERY_PORT};
    use crate::runtime::Runtime;
    use crate::scheduler::ComponentId;
    use tracing_test::traced_test;

    fn reply_with(values: fn(&str) -> Option<Vec<u32>>) -> impl FnMut(&Frame) -> Option<std::vec::Vec<u8>> {
        move |query: &Frame| {
            let code = core::str::from_utf8(&query.payload).ok()?;
            let token = format_token(code, &values(code)?);
            let frame = Frame::new(query.address, QUERY_PORT, token.into_bytes());
            Some(frame.encode().ok()?.to_vec())
        }
    }

    fn healthy(code: &str) -> Option<Vec<u32>> {
        match code {
            "TYP" => Some(vec![2001]),
            "SWV" => Some(vec![15]),
            "BDN" => Some(vec![1234]),
            "PAC" => Some(vec![3000]),
            "SYS" => Some(vec![20004, 0]),
            "BAD" => None,
            _ => Some(vec![1]),
        }
    }

    fn setup(poll: &[&str]) -> (Runtime<ManualClock>, ComponentId, MockHandle) {
        let (connection, handle) = MockConnection::new(1_000);
        let mut config = InverterConfig::new("roof", 1, ConnectionConfig::simulator(2001));
        config.poll_codes = Some(poll.iter().map(|c| (*c).to_owned()).collect());
        let driver = InverterDriver::new(config, Box::new(connection)).unwrap();

        let mut rt = Runtime::new(ManualClock::new(0));
        let id = rt.add_component(driver).unwrap();
        (rt, id, handle)
    }

    fn driver(rt: &Runtime<ManualClock>, id: ComponentId) -> &InverterDriver {
        rt.component::<InverterDriver>(id).unwrap()
    }

    #[test]
    fn test_identify_then_poll() {
        let (mut rt, id, handle) = setup(&["PAC", "SYS"]);
        handle.set_responder(reply_with(healthy));

        rt.advance_to(100);

        let bus = rt.bus();
        assert_eq!(bus.value(id, fields::INVERTER_MODEL), Some(&Value::from("SolarMax 2000 E")));
        assert_eq!(bus.value(id, fields::FIRMWARE_VERSION), Some(&Value::from("1.5 Build 1234")));
        assert_eq!(bus.value(id, "ac-power-total"), Some(&Value::Float(1500.0)));
        assert_eq!(bus.value(id, fields::STATUS_CODE), Some(&Value::Int(20004)));
        assert_eq!(bus.value(id, fields::INVERTER_STATUS), Some(&Value::from("feeding-mpp")));
        assert_eq!(bus.value(id, DATA_VALID), Some(&Value::Bool(true)));
        assert!(bus.value(id, fields::LAST_UPDATE).is_some());

        let driver = driver(&rt, id);
        assert_eq!(driver.phase(), Phase::Polling);
        assert_eq!(driver.state(), InverterState::Poll);
        assert_eq!(driver.stats().cycles_completed, 1);
        assert_eq!(driver.stats().frames_sent, 5);

        let sent: Vec<_> = handle.sent_frames().iter().map(|f| f.payload.clone()).collect();
        assert_eq!(sent, vec![b"TYP".to_vec(), b"SWV".to_vec(), b"BDN".to_vec(), b"PAC".to_vec(), b"SYS".to_vec()]);
    }

    #[test]
    fn test_poll_repeats_after_interval() {
        let (mut rt, id, handle) = setup(&["PAC"]);
        handle.set_responder(reply_with(healthy));

        rt.advance_to(100);
        assert_eq!(driver(&rt, id).stats().cycles_completed, 1);

        rt.advance_to(5_200);
        assert_eq!(driver(&rt, id).stats().cycles_completed, 2);
    }

    #[test]
    fn test_stale_generation_ignored() {
        let (mut rt, id, handle) = setup(&["PAC"]);
        handle.set_responder(reply_with(healthy));
        rt.advance_to(100);

        let before = driver(&rt, id).state();
        rt.schedule_at(
            id,
            InverterCommand {
                state: InverterState::Disconnected,
                generation: 99,
            },
            0,
        )
        .unwrap();
        rt.run_pending();

        let driver = driver(&rt, id);
        assert_eq!(driver.state(), before);
        assert_eq!(driver.stats().stale_commands, 1);
        assert_eq!(driver.stats().reconnects, 0);
    }

    #[test]
    fn test_zero_status_code_is_malformed() {
        let (mut rt, id, handle) = setup(&["SYS"]);
        handle.set_responder(reply_with(|code| match code {
            "SYS" => Some(vec![0, 0]),
            other => healthy(other),
        }));

        rt.advance_to(100);

        let driver = driver(&rt, id);
        assert_eq!(driver.error_count(), 1);
        assert_eq!(driver.stats().token_errors, 1);
        assert!(rt.bus().value(id, fields::STATUS_CODE).is_none());
    }

    #[test]
    fn test_scale_override() {
        let (connection, handle) = MockConnection::new(1_000);
        let mut config = InverterConfig::new("roof", 1, ConnectionConfig::simulator(2001));
        config.poll_codes = Some(vec!["PAC".into()]);
        config.scale_overrides.insert("PAC".into(), 2.0);
        handle.set_responder(reply_with(healthy));

        let mut rt = Runtime::new(ManualClock::new(0));
        let id = rt
            .add_component(InverterDriver::new(config, Box::new(connection)).unwrap())
            .unwrap();
        rt.advance_to(100);

        assert_eq!(rt.bus().value(id, "ac-power-total"), Some(&Value::Float(6000.0)));
    }

    #[test]
    fn test_unknown_status_code_kept() {
        let (mut rt, id, handle) = setup(&["SYS"]);
        handle.set_responder(reply_with(|code| match code {
            "SYS" => Some(vec![12345, 0]),
            other => healthy(other),
        }));

        rt.advance_to(100);

        assert_eq!(rt.bus().value(id, fields::STATUS_CODE), Some(&Value::Int(12345)));
        assert_eq!(
            rt.bus().value(id, fields::STATUS_TEXT),
            Some(&Value::from(fields::UNKNOWN_STATUS_TEXT))
        );
        assert_eq!(driver(&rt, id).error_count(), 0);
    }

    #[test]
    #[traced_test]
    fn test_unknown_field_code_skipped_and_logged() {
        let (mut rt, id, handle) = setup(&["PAC"]);
        handle.set_responder(|query: &Frame| {
            let payload = match &query.payload[..] {
                b"PAC" => "PAC=BB8;XYZ=1".to_owned(),
                _ => {
                    let code = core::str::from_utf8(&query.payload).ok()?;
                    format_token(code, &healthy(code)?)
                }
            };
            Some(Frame::new(query.address, QUERY_PORT, payload.into_bytes()).encode().ok()?.to_vec())
        });

        rt.advance_to(100);

        let driver = driver(&rt, id);
        assert_eq!(driver.stats().unknown_fields, 1);
        assert_eq!(driver.error_count(), 0);
        assert_eq!(rt.bus().value(id, "ac-power-total"), Some(&Value::Float(1500.0)));
        assert!(logs_contain("unknown field code, skipped"));
    }
}
