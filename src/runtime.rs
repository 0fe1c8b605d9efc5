//! Command-dispatch glue: components, the scheduler and the capability bus
//! under one cooperative loop.
//!
//! Components live in an arena. A [`ComponentId`] names both the scheduler
//! target and the capability owner; components never hold references to
//! each other, only ids and capability names.

use crate::capability::{CapabilityBus, CapabilityStore, PublishOutcome, Value};
use crate::clock::{Clock, ManualClock};
use crate::error::InvariantViolation;
use crate::scheduler::{Command, ComponentId, ScheduledEntry, Scheduler, SchedulerStats};
use core::fmt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, trace};

/// Type-erased command kind as stored in the queue.
pub type AnyKind = Box<dyn Any>;

/// Sleep used when nothing at all is scheduled.
const IDLE_SLEEP_MS: u64 = 1_000;

/// A scheduler client.
///
/// Handlers run to completion on the dispatch thread and must not block;
/// waiting is expressed by scheduling another command.
pub trait CommandTarget: 'static {
    type Kind: fmt::Debug + 'static;

    fn name(&self) -> &str;

    /// Called once right after registration, with the component's
    /// capability store already in place.
    fn attach(&mut self, ctx: &mut Context<'_>) -> Result<(), InvariantViolation> {
        let _ = ctx;
        Ok(())
    }

    fn execute(
        &mut self,
        command: Command<Self::Kind>,
        ctx: &mut Context<'_>,
    ) -> Result<(), InvariantViolation>;
}

trait ErasedTarget {
    fn name(&self) -> &str;
    fn attach(&mut self, ctx: &mut Context<'_>) -> Result<(), InvariantViolation>;
    fn execute_erased(&mut self, command: Command<AnyKind>, ctx: &mut Context<'_>) -> Result<(), InvariantViolation>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: CommandTarget> ErasedTarget for T {
    fn name(&self) -> &str {
        CommandTarget::name(self)
    }

    fn attach(&mut self, ctx: &mut Context<'_>) -> Result<(), InvariantViolation> {
        CommandTarget::attach(self, ctx)
    }

    fn execute_erased(&mut self, command: Command<AnyKind>, ctx: &mut Context<'_>) -> Result<(), InvariantViolation> {
        let Command {
            target,
            kind,
            payload,
        } = command;
        match kind.downcast::<T::Kind>() {
            Ok(kind) => self.execute(
                Command {
                    target,
                    kind: *kind,
                    payload,
                },
                ctx,
            ),
            Err(_) => Err(InvariantViolation::ForeignCommand(
                CommandTarget::name(self).to_owned(),
            )),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

enum Slot {
    Vacant,
    /// Taken out while its handler runs.
    Busy,
    Active(Box<dyn ErasedTarget>),
    Halted {
        component: Box<dyn ErasedTarget>,
        reason: InvariantViolation,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ComponentStatus {
    Active,
    Halted(InvariantViolation),
    Vacant,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub dispatched: u64,
    /// Entries whose target was vacant or halted.
    pub discarded: u64,
    pub halted_instances: u32,
    pub removed_instances: u32,
}

/// What a handler may touch while it runs.
pub struct Context<'a> {
    now_ms: u64,
    current: ComponentId,
    scheduler: &'a mut Scheduler<AnyKind>,
    bus: &'a mut CapabilityBus,
}

impl<'a> Context<'a> {
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Id of the component whose handler is running.
    pub fn current(&self) -> ComponentId {
        self.current
    }

    pub fn schedule_now<K: Any>(&mut self, target: ComponentId, kind: K) -> Result<(), InvariantViolation> {
        self.scheduler
            .schedule_now(self.now_ms, Command::new(target, Box::new(kind) as AnyKind))?;
        Ok(())
    }

    pub fn schedule_at<K: Any>(
        &mut self,
        target: ComponentId,
        kind: K,
        delay_ms: i64,
    ) -> Result<(), InvariantViolation> {
        self.schedule_command(Command::new(target, kind), delay_ms)
    }

    pub fn schedule_command<K: Any>(&mut self, command: Command<K>, delay_ms: i64) -> Result<(), InvariantViolation> {
        let command = command.map_kind(|kind| Box::new(kind) as AnyKind);
        self.scheduler.schedule_at(self.now_ms, command, delay_ms)?;
        Ok(())
    }

    pub fn schedule_self_now<K: Any>(&mut self, kind: K) -> Result<(), InvariantViolation> {
        self.schedule_now(self.current, kind)
    }

    pub fn schedule_self_at<K: Any>(&mut self, kind: K, delay_ms: i64) -> Result<(), InvariantViolation> {
        self.schedule_at(self.current, kind, delay_ms)
    }

    pub fn bus(&mut self) -> &mut CapabilityBus {
        self.bus
    }

    /// The running component's own capabilities.
    pub fn store(&self) -> Option<&CapabilityStore> {
        self.bus.store(self.current)
    }

    /// Create-or-update one of the running component's capabilities.
    pub fn publish(&mut self, name: &str, value: impl Into<Value>) -> Result<PublishOutcome, InvariantViolation> {
        self.bus.publish(self.current, name, value)
    }

    pub fn set_data_valid(&mut self, valid: bool) -> Result<(), InvariantViolation> {
        self.bus.set_data_valid(self.current, valid)
    }
}

pub struct Runtime<C: Clock> {
    clock: C,
    scheduler: Scheduler<AnyKind>,
    bus: CapabilityBus,
    components: Vec<Slot>,
    io_waker: Arc<Notify>,
    stats: RuntimeStats,
}

impl<C: Clock> Runtime<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            scheduler: Scheduler::new(),
            bus: CapabilityBus::new(),
            components: Vec::new(),
            io_waker: Arc::new(Notify::new()),
            stats: RuntimeStats::default(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Register a component: create its capability store, then run its
    /// `attach` hook. A component whose hook fails never runs.
    pub fn add_component<T: CommandTarget>(&mut self, component: T) -> Result<ComponentId, InvariantViolation> {
        let id = ComponentId(self.components.len());
        self.bus.register_owner(id)?;
        self.components.push(Slot::Busy);

        let mut component: Box<dyn ErasedTarget> = Box::new(component);
        let now_ms = self.clock.now_ms();
        let mut ctx = Context {
            now_ms,
            current: id,
            scheduler: &mut self.scheduler,
            bus: &mut self.bus,
        };
        if let Err(err) = component.attach(&mut ctx) {
            error!(component = component.name(), %id, error = %err, "attach failed");
            self.scheduler.purge_target(id);
            self.bus.deregister_owner(id);
            self.components[id.0] = Slot::Vacant;
            return Err(err);
        }

        info!(component = component.name(), %id, "component attached");
        self.components[id.0] = Slot::Active(component);
        Ok(id)
    }

    /// Drop a component. Observers see `capability-set-clear-all` first;
    /// anything still queued for it is discarded.
    pub fn remove_component(&mut self, id: ComponentId) -> bool {
        let Some(slot) = self.components.get_mut(id.0) else {
            return false;
        };
        if matches!(slot, Slot::Vacant) {
            return false;
        }
        *slot = Slot::Vacant;

        let purged = self.scheduler.purge_target(id);
        self.bus.deregister_owner(id);
        self.stats.removed_instances += 1;
        debug!(%id, purged, "component removed");
        true
    }

    /// Inject a command from outside any handler.
    pub fn schedule_at<K: Any>(&mut self, target: ComponentId, kind: K, delay_ms: i64) -> Result<(), InvariantViolation> {
        let now_ms = self.clock.now_ms();
        self.scheduler
            .schedule_at(now_ms, Command::new(target, Box::new(kind) as AnyKind), delay_ms)?;
        self.io_waker.notify_one();
        Ok(())
    }

    /// Dispatch the earliest due entry, if any. Returns whether one ran.
    pub fn step(&mut self) -> bool {
        let now_ms = self.clock.now_ms();
        match self.scheduler.pop_due(now_ms) {
            Some(entry) => {
                self.dispatch(entry, now_ms);
                true
            }
            None => false,
        }
    }

    /// Dispatch everything due now, including entries scheduled for "now"
    /// by the handlers that run. Does not return while a handler keeps
    /// rescheduling itself with zero delay.
    pub fn run_pending(&mut self) -> usize {
        let mut count = 0;
        while self.step() {
            count += 1;
        }
        count
    }

    /// Dispatch only what was already queued and due when the pass started.
    /// Work the handlers schedule for "now" waits for the next pass.
    pub fn run_pass(&mut self) -> usize {
        let now_ms = self.clock.now_ms();
        let mark = self.scheduler.sequence_mark();
        let mut count = 0;
        while let Some(entry) = self.scheduler.pop_due_before(now_ms, mark) {
            self.dispatch(entry, now_ms);
            count += 1;
        }
        count
    }

    pub fn next_due(&self) -> Option<u64> {
        self.scheduler.next_due()
    }

    fn dispatch(&mut self, entry: ScheduledEntry<AnyKind>, now_ms: u64) {
        let id = entry.command.target;
        let Some(slot) = self.components.get_mut(id.0) else {
            self.stats.discarded += 1;
            trace!(%id, "command for unknown component discarded");
            return;
        };
        let mut component = match core::mem::replace(slot, Slot::Busy) {
            Slot::Active(component) => component,
            other => {
                *slot = other;
                self.stats.discarded += 1;
                trace!(%id, "command for inactive component discarded");
                return;
            }
        };

        let result = {
            let mut ctx = Context {
                now_ms,
                current: id,
                scheduler: &mut self.scheduler,
                bus: &mut self.bus,
            };
            component.execute_erased(entry.command, &mut ctx)
        };
        self.stats.dispatched += 1;

        match result {
            Ok(()) => self.components[id.0] = Slot::Active(component),
            Err(reason) => self.halt(id, component, reason),
        }
    }

    fn halt(&mut self, id: ComponentId, component: Box<dyn ErasedTarget>, reason: InvariantViolation) {
        error!(
            component = component.name(),
            %id,
            error = %reason,
            "invariant violation, halting instance"
        );
        self.scheduler.purge_target(id);
        if let Err(err) = self.bus.set_data_valid(id, false) {
            error!(%id, error = %err, "cannot clear data-valid of halted instance");
        }
        self.components[id.0] = Slot::Halted { component, reason };
        self.stats.halted_instances += 1;
    }

    /// Cooperative loop: dispatch what is due, then sleep until the next due
    /// time, an I/O readiness signal or `shutdown`.
    pub async fn run<F: Future<Output = ()>>(&mut self, shutdown: F) {
        tokio::pin!(shutdown);
        let waker = self.io_waker.clone();
        info!(components = self.components.len(), "runtime started");

        loop {
            self.run_pass();

            let now_ms = self.clock.now_ms();
            let sleep_ms = self
                .next_due()
                .map_or(IDLE_SLEEP_MS, |due| due.saturating_sub(now_ms));

            tokio::select! {
                () = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                () = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
                () = waker.notified() => {
                    trace!("woken by i/o readiness");
                }
            }
        }
    }

    /// Handle transports use to cut a sleep short when data arrives.
    pub fn io_waker(&self) -> Arc<Notify> {
        self.io_waker.clone()
    }

    pub fn bus(&self) -> &CapabilityBus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut CapabilityBus {
        &mut self.bus
    }

    pub fn stats(&self) -> &RuntimeStats {
        &self.stats
    }

    pub fn scheduler_stats(&self) -> &SchedulerStats {
        self.scheduler.stats()
    }

    pub fn status(&self, id: ComponentId) -> ComponentStatus {
        match self.components.get(id.0) {
            Some(Slot::Active(_) | Slot::Busy) => ComponentStatus::Active,
            Some(Slot::Halted { reason, .. }) => ComponentStatus::Halted(reason.clone()),
            Some(Slot::Vacant) | None => ComponentStatus::Vacant,
        }
    }

    /// Typed access to a component, active or halted.
    pub fn component<T: CommandTarget>(&self, id: ComponentId) -> Option<&T> {
        match self.components.get(id.0)? {
            Slot::Active(component) | Slot::Halted { component, .. } => component.as_any().downcast_ref(),
            Slot::Busy | Slot::Vacant => None,
        }
    }

    pub fn component_mut<T: CommandTarget>(&mut self, id: ComponentId) -> Option<&mut T> {
        match self.components.get_mut(id.0)? {
            Slot::Active(component) | Slot::Halted { component, .. } => component.as_any_mut().downcast_mut(),
            Slot::Busy | Slot::Vacant => None,
        }
    }

    /// Ids and names of every registered component.
    pub fn components(&self) -> Vec<(ComponentId, String)> {
        self.components
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Active(component) | Slot::Halted { component, .. } => {
                    Some((ComponentId(index), component.name().to_owned()))
                }
                Slot::Busy | Slot::Vacant => None,
            })
            .collect()
    }
}

impl Runtime<ManualClock> {
    /// Move virtual time forward to `until_ms`, dispatching every entry due
    /// on the way at its own due time. Returns the number dispatched.
    pub fn advance_to(&mut self, until_ms: u64) -> usize {
        let mut count = self.run_pending();
        while let Some(due) = self.next_due() {
            if due > until_ms {
                break;
            }
            self.clock.set(due);
            count += self.run_pending();
        }
        self.clock.set(until_ms);
        count + self.run_pending()
    }

    pub fn advance_by(&mut self, delta_ms: u64) -> usize {
        let until = self.clock.now_ms().saturating_add(delta_ms);
        self.advance_to(until)
    }
}
