//! # solbus
//!
//! Cooperative polling runtime for photovoltaic inverters.
//!
//! Device drivers are state machines driven by a single time-ordered command
//! queue. Everything a driver learns from its device is published as typed,
//! named capabilities that any number of observers can subscribe to.
//!
//! ## Quick Start
//!
//! ```rust
//! use solbus::{ConnectionConfig, InverterConfig, InverterDriver, ManualClock, Runtime};
//!
//! // One simulated inverter on bus address 1
//! let config = InverterConfig::new("roof", 1, ConnectionConfig::simulator(20010));
//! let driver = InverterDriver::from_config(config)?;
//!
//! // Drive it through ten seconds of virtual time
//! let mut runtime = Runtime::new(ManualClock::new(0));
//! let id = runtime.add_component(driver)?;
//! runtime.advance_to(10_000);
//!
//! assert!(runtime.bus().store(id).is_some());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! - [`scheduler`] - time-ordered command queue
//! - [`capability`] - per-owner capability stores and the observer bus
//! - [`runtime`] - component arena and the cooperative dispatch loop
//! - [`connection`] - non-blocking byte transports
//! - [`protocol`] - telegram framing, checksum and tokens
//! - [`inverter`] - the Sputnik polling driver
//! - [`simulator`] - in-process inverter with fault injection
//! - [`config`] - JSON configuration
//! - [`diagnostics`] - snapshots for operators

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod capability;
pub mod clock;
pub mod config;
pub mod connection;
pub mod diagnostics;
pub mod error;
pub mod inverter;
pub mod protocol;
pub mod runtime;
pub mod scheduler;
pub mod simulator;

pub use capability::{
    Capability, CapabilityBus, CapabilityStore, CapabilityUpdate, Observer, ObserverId, PublishOutcome, Value,
    ValueKind, CAPABILITY_SET_CHANGED, CAPABILITY_SET_CLEAR_ALL, DATA_VALID,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{ConnectionConfig, InverterConfig, SystemConfig};
pub use connection::{create_connection, Connection, ConnectionState};
pub use diagnostics::{DriverReport, StoreSnapshot};
pub use error::{CapabilityError, ConfigError, InvariantViolation, SchedulerError, TransportError};
pub use inverter::backoff::{QueryBackoff, QueryTracker};
pub use inverter::{DriverStats, InverterCommand, InverterDriver, InverterState, Phase};
pub use protocol::{Frame, ProtocolError};
pub use runtime::{CommandTarget, ComponentStatus, Context, Runtime, RuntimeStats};
pub use scheduler::{Command, ComponentId, Scheduler, SchedulerStats};
pub use simulator::{FaultInjectionConfig, SimulatedInverter};
