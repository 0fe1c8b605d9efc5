//! Typed, observable values published by drivers.
//!
//! Each component owns one [`CapabilityStore`]. The [`CapabilityBus`] holds
//! every store plus the observer table, and is only ever touched by the
//! thread that drains the scheduler, so nothing in here locks.

use crate::error::{CapabilityError, InvariantViolation};
use crate::scheduler::ComponentId;
use chrono::{DateTime, Utc};
use core::fmt;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace, warn};

pub const DATA_VALID: &str = "data-valid";
pub const CAPABILITY_SET_CHANGED: &str = "capability-set-changed";
pub const CAPABILITY_SET_CLEAR_ALL: &str = "capability-set-clear-all";

pub const MANDATORY_CAPABILITIES: [&str; 3] =
    [DATA_VALID, CAPABILITY_SET_CHANGED, CAPABILITY_SET_CLEAR_ALL];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Bool,
    Int,
    Float,
    Text,
    Timestamp,
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Text(_) => ValueKind::Text,
            Value::Timestamp(_) => ValueKind::Timestamp,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x:.2}"),
            Value::Text(s) => f.write_str(s),
            Value::Timestamp(t) => write!(f, "{}", t.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Value::Timestamp(t)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObserverId(pub usize);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Capability {
    pub name: String,
    pub value: Value,
    pub owner: ComponentId,
    subscribers: Vec<ObserverId>,
}

impl Capability {
    pub fn subscribers(&self) -> &[ObserverId] {
        &self.subscribers
    }
}

/// What a create-or-update did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Added,
    Changed,
    Unchanged,
}

/// One owner's capabilities, kept in insertion order.
#[derive(Debug, Clone)]
pub struct CapabilityStore {
    owner: ComponentId,
    entries: IndexMap<String, Capability>,
}

impl CapabilityStore {
    pub fn new(owner: ComponentId) -> Self {
        let mut entries = IndexMap::new();
        for name in MANDATORY_CAPABILITIES {
            entries.insert(
                name.to_owned(),
                Capability {
                    name: name.to_owned(),
                    value: Value::Bool(false),
                    owner,
                    subscribers: Vec::new(),
                },
            );
        }
        Self { owner, entries }
    }

    pub fn owner(&self) -> ComponentId {
        self.owner
    }

    pub fn add(&mut self, name: &str, value: Value) -> Result<(), InvariantViolation> {
        if self.entries.contains_key(name) {
            return Err(InvariantViolation::DuplicateCapability(name.to_owned()));
        }
        self.entries.insert(
            name.to_owned(),
            Capability {
                name: name.to_owned(),
                value,
                owner: self.owner,
                subscribers: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Capability> {
        self.entries.get(name)
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.entries.get(name).map(|cap| &cap.value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Subscribers of a removed capability simply stop hearing about it.
    pub fn remove(&mut self, name: &str) -> Result<Option<Capability>, InvariantViolation> {
        if MANDATORY_CAPABILITIES.contains(&name) {
            return Err(InvariantViolation::MandatoryRemoval(name.to_owned()));
        }
        Ok(self.entries.shift_remove(name))
    }

    /// Overwrite an existing value. The type tag is fixed at creation; a
    /// mismatching write is refused and the stored value stays untouched.
    /// Returns whether the value changed.
    pub fn set(&mut self, name: &str, value: Value) -> Result<bool, InvariantViolation> {
        let cap = self
            .entries
            .get_mut(name)
            .ok_or_else(|| InvariantViolation::MissingCapability(name.to_owned()))?;

        if cap.value.kind() != value.kind() {
            return Err(InvariantViolation::TypeMismatch {
                capability: name.to_owned(),
                expected: cap.value.kind(),
                actual: value.kind(),
            });
        }

        if cap.value == value {
            return Ok(false);
        }
        cap.value = value;
        Ok(true)
    }

    pub fn upsert(&mut self, name: &str, value: Value) -> Result<PublishOutcome, InvariantViolation> {
        if self.contains(name) {
            let changed = self.set(name, value)?;
            Ok(if changed {
                PublishOutcome::Changed
            } else {
                PublishOutcome::Unchanged
            })
        } else {
            self.add(name, value)?;
            Ok(PublishOutcome::Added)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn subscribe(&mut self, name: &str, observer: ObserverId) -> Result<(), CapabilityError> {
        let cap = self.lookup_mut(name)?;
        if !cap.subscribers.contains(&observer) {
            cap.subscribers.push(observer);
        }
        Ok(())
    }

    fn unsubscribe(&mut self, name: &str, observer: ObserverId) -> Result<bool, CapabilityError> {
        let cap = self.lookup_mut(name)?;
        let before = cap.subscribers.len();
        cap.subscribers.retain(|id| *id != observer);
        Ok(cap.subscribers.len() != before)
    }

    fn lookup_mut(&mut self, name: &str) -> Result<&mut Capability, CapabilityError> {
        let owner = self.owner;
        self.entries
            .get_mut(name)
            .ok_or_else(|| CapabilityError::UnknownCapability {
                owner,
                name: name.to_owned(),
            })
    }
}

/// Notification forwarded to async consumers by [`Observer::Channel`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityUpdate {
    pub owner: ComponentId,
    pub name: String,
    pub value: Value,
}

pub type ObserverFn = dyn FnMut(&Capability, &mut CapabilityBus);

pub enum Observer {
    /// Invoked synchronously. Gets the bus so it may read other values or
    /// change subscriptions, its own included.
    Callback(Box<ObserverFn>),
    Channel(UnboundedSender<CapabilityUpdate>),
}

impl Observer {
    pub fn callback(f: impl FnMut(&Capability, &mut CapabilityBus) + 'static) -> Self {
        Observer::Callback(Box::new(f))
    }

    fn update(&mut self, cap: &Capability, bus: &mut CapabilityBus) {
        match self {
            Observer::Callback(f) => f(cap, bus),
            Observer::Channel(tx) => {
                let update = CapabilityUpdate {
                    owner: cap.owner,
                    name: cap.name.clone(),
                    value: cap.value.clone(),
                };
                if tx.send(update).is_err() {
                    debug!(capability = %cap.name, "channel observer dropped its receiver");
                }
            }
        }
    }
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Observer::Callback(_) => f.write_str("Observer::Callback"),
            Observer::Channel(_) => f.write_str("Observer::Channel"),
        }
    }
}

#[derive(Debug)]
enum ObserverSlot {
    Vacant,
    /// Taken out while its callback runs.
    Busy,
    Present(Observer),
}

enum Delivery {
    Delivered,
    /// The observer is running further up the stack.
    Deferred,
    Gone,
}

/// Every capability store in the process plus the observer table.
///
/// Observer ids index an arena and are never reused, so a stale id can never
/// reach a newer observer. A removed observer leaves a vacant slot behind;
/// the table grows with the number of observers ever added, which is fixed
/// at start-up in practice.
#[derive(Debug, Default)]
pub struct CapabilityBus {
    stores: BTreeMap<ComponentId, CapabilityStore>,
    observers: Vec<ObserverSlot>,
    /// Notifications for observers that were busy when they fired, in order.
    deferred: VecDeque<(ObserverId, Capability)>,
}

impl CapabilityBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_owner(&mut self, owner: ComponentId) -> Result<(), InvariantViolation> {
        if self.stores.contains_key(&owner) {
            return Err(InvariantViolation::DuplicateCapability(format!(
                "store of {owner}"
            )));
        }
        self.stores.insert(owner, CapabilityStore::new(owner));
        Ok(())
    }

    /// Tell everyone the owner's capabilities are going away, then drop them.
    pub fn deregister_owner(&mut self, owner: ComponentId) -> Option<CapabilityStore> {
        let raised = self
            .stores
            .get_mut(&owner)?
            .set(CAPABILITY_SET_CLEAR_ALL, Value::Bool(true))
            .is_ok();
        if raised {
            if let Err(err) = self.notify(owner, CAPABILITY_SET_CLEAR_ALL) {
                warn!(%owner, error = %err, "cannot announce removal of capabilities");
            }
        }
        self.stores.remove(&owner)
    }

    pub fn owners(&self) -> impl Iterator<Item = ComponentId> + '_ {
        self.stores.keys().copied()
    }

    pub fn store(&self, owner: ComponentId) -> Option<&CapabilityStore> {
        self.stores.get(&owner)
    }

    pub fn store_mut(&mut self, owner: ComponentId) -> Option<&mut CapabilityStore> {
        self.stores.get_mut(&owner)
    }

    fn owned_store_mut(&mut self, owner: ComponentId) -> Result<&mut CapabilityStore, InvariantViolation> {
        self.stores
            .get_mut(&owner)
            .ok_or(InvariantViolation::UnknownOwner(owner))
    }

    pub fn get(&self, owner: ComponentId, name: &str) -> Option<&Capability> {
        self.stores.get(&owner)?.get(name)
    }

    pub fn value(&self, owner: ComponentId, name: &str) -> Option<&Value> {
        self.stores.get(&owner)?.value(name)
    }

    pub fn add(&mut self, owner: ComponentId, name: &str, value: Value) -> Result<(), InvariantViolation> {
        self.owned_store_mut(owner)?.add(name, value)
    }

    pub fn remove(&mut self, owner: ComponentId, name: &str) -> Result<Option<Capability>, InvariantViolation> {
        self.owned_store_mut(owner)?.remove(name)
    }

    /// Raw write without notification.
    pub fn set(&mut self, owner: ComponentId, name: &str, value: Value) -> Result<bool, InvariantViolation> {
        self.owned_store_mut(owner)?.set(name, value)
    }

    /// Create-or-update, then notify: a new capability raises
    /// `capability-set-changed`, a changed one notifies its subscribers.
    pub fn publish(
        &mut self,
        owner: ComponentId,
        name: &str,
        value: impl Into<Value>,
    ) -> Result<PublishOutcome, InvariantViolation> {
        let outcome = self.owned_store_mut(owner)?.upsert(name, value.into())?;
        match outcome {
            PublishOutcome::Added => {
                trace!(%owner, capability = name, "capability added");
                self.owned_store_mut(owner)?
                    .set(CAPABILITY_SET_CHANGED, Value::Bool(true))?;
                self.notify(owner, CAPABILITY_SET_CHANGED)?;
            }
            PublishOutcome::Changed => {
                self.notify(owner, name)?;
            }
            PublishOutcome::Unchanged => {}
        }
        Ok(outcome)
    }

    pub fn add_observer(&mut self, observer: Observer) -> ObserverId {
        let id = ObserverId(self.observers.len());
        self.observers.push(ObserverSlot::Present(observer));
        id
    }

    /// Forget an observer everywhere. Safe to call from inside its own
    /// callback.
    pub fn remove_observer(&mut self, id: ObserverId) -> Result<(), CapabilityError> {
        let slot = self
            .observers
            .get_mut(id.0)
            .ok_or(CapabilityError::UnknownObserver(id.0))?;
        if matches!(slot, ObserverSlot::Vacant) {
            return Err(CapabilityError::UnknownObserver(id.0));
        }
        *slot = ObserverSlot::Vacant;
        self.deferred.retain(|(waiting, _)| *waiting != id);
        for store in self.stores.values_mut() {
            for cap in store.entries.values_mut() {
                cap.subscribers.retain(|sub| *sub != id);
            }
        }
        Ok(())
    }

    pub fn subscribe(&mut self, owner: ComponentId, name: &str, observer: ObserverId) -> Result<(), CapabilityError> {
        if !self.observer_exists(observer) {
            return Err(CapabilityError::UnknownObserver(observer.0));
        }
        self.stores
            .get_mut(&owner)
            .ok_or(CapabilityError::UnknownOwner(owner))?
            .subscribe(name, observer)
    }

    pub fn unsubscribe(&mut self, owner: ComponentId, name: &str, observer: ObserverId) -> Result<bool, CapabilityError> {
        self.stores
            .get_mut(&owner)
            .ok_or(CapabilityError::UnknownOwner(owner))?
            .unsubscribe(name, observer)
    }

    fn observer_exists(&self, id: ObserverId) -> bool {
        matches!(
            self.observers.get(id.0),
            Some(ObserverSlot::Present(_) | ObserverSlot::Busy)
        )
    }

    /// Call every observer subscribed to `name` right now, exactly once.
    ///
    /// The subscriber list is copied up front, so callbacks may subscribe or
    /// unsubscribe freely without affecting this round. An observer whose
    /// callback is already running further up the stack is not re-entered:
    /// its copy is queued and delivered as soon as that callback returns.
    /// Returns the number of observers served, deferred ones included.
    pub fn notify(&mut self, owner: ComponentId, name: &str) -> Result<usize, CapabilityError> {
        let snapshot = self
            .stores
            .get(&owner)
            .ok_or(CapabilityError::UnknownOwner(owner))?
            .get(name)
            .cloned()
            .ok_or_else(|| CapabilityError::UnknownCapability {
                owner,
                name: name.to_owned(),
            })?;

        let mut served = 0;
        for id in &snapshot.subscribers {
            match self.invoke(*id, &snapshot) {
                Delivery::Delivered => {
                    served += 1;
                    self.deliver_deferred(*id);
                }
                Delivery::Deferred => {
                    debug!(observer = %id, capability = name, "observer busy, notification deferred");
                    served += 1;
                }
                Delivery::Gone => {}
            }
        }
        Ok(served)
    }

    fn invoke(&mut self, id: ObserverId, capability: &Capability) -> Delivery {
        let Some(slot) = self.observers.get_mut(id.0) else {
            return Delivery::Gone;
        };
        let mut observer = match core::mem::replace(slot, ObserverSlot::Busy) {
            ObserverSlot::Present(observer) => observer,
            ObserverSlot::Busy => {
                self.deferred.push_back((id, capability.clone()));
                return Delivery::Deferred;
            }
            ObserverSlot::Vacant => {
                *slot = ObserverSlot::Vacant;
                return Delivery::Gone;
            }
        };

        observer.update(capability, self);

        // Removed from inside its own callback: stays vacant.
        if let Some(slot) = self.observers.get_mut(id.0) {
            if matches!(slot, ObserverSlot::Busy) {
                *slot = ObserverSlot::Present(observer);
            }
        }
        Delivery::Delivered
    }

    /// Hand `id` whatever it missed while its callback was running.
    fn deliver_deferred(&mut self, id: ObserverId) {
        while let Some(index) = self.deferred.iter().position(|(waiting, _)| *waiting == id) {
            let Some((_, capability)) = self.deferred.remove(index) else {
                break;
            };
            trace!(observer = %id, capability = %capability.name, "delivering deferred notification");
            if matches!(self.invoke(id, &capability), Delivery::Gone) {
                self.deferred.retain(|(waiting, _)| *waiting != id);
                break;
            }
        }
    }

    /// Force `data-valid` and notify on change.
    pub fn set_data_valid(&mut self, owner: ComponentId, valid: bool) -> Result<(), InvariantViolation> {
        if self.set(owner, DATA_VALID, Value::Bool(valid))? {
            self.notify(owner, DATA_VALID)?;
        }
        Ok(())
    }
}
