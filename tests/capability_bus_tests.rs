use solbus::*;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

const OWNER: ComponentId = ComponentId(0);

fn bus() -> CapabilityBus {
    let mut bus = CapabilityBus::new();
    bus.register_owner(OWNER).unwrap();
    bus
}

fn counting_observer(bus: &mut CapabilityBus) -> (ObserverId, Rc<Cell<u32>>) {
    let calls = Rc::new(Cell::new(0));
    let counter = calls.clone();
    let id = bus.add_observer(Observer::callback(move |_, _| counter.set(counter.get() + 1)));
    (id, calls)
}

#[test]
fn test_string_into_float_capability_is_rejected() {
    let mut bus = bus();
    bus.publish(OWNER, "ac-power-total", 1500.0).unwrap();

    let result = bus.set(OWNER, "ac-power-total", Value::from("lots"));
    assert_eq!(
        result,
        Err(InvariantViolation::TypeMismatch {
            capability: "ac-power-total".into(),
            expected: ValueKind::Float,
            actual: ValueKind::Text,
        })
    );
    assert_eq!(bus.value(OWNER, "ac-power-total"), Some(&Value::Float(1500.0)));

    assert!(bus.publish(OWNER, "ac-power-total", "lots").is_err());
    assert_eq!(bus.value(OWNER, "ac-power-total"), Some(&Value::Float(1500.0)));
}

#[test]
fn test_observer_unsubscribing_itself_is_called_once() {
    let mut bus = bus();
    bus.publish(OWNER, "dc-voltage", 300.0).unwrap();

    let calls = Rc::new(Cell::new(0));
    let counter = calls.clone();
    let own_id = Rc::new(Cell::new(None));
    let me = own_id.clone();
    let id = bus.add_observer(Observer::callback(move |cap, bus| {
        counter.set(counter.get() + 1);
        if let Some(me) = me.get() {
            bus.unsubscribe(cap.owner, &cap.name, me).unwrap();
        }
    }));
    own_id.set(Some(id));
    let (other, other_calls) = counting_observer(&mut bus);

    bus.subscribe(OWNER, "dc-voltage", id).unwrap();
    bus.subscribe(OWNER, "dc-voltage", other).unwrap();

    assert_eq!(bus.notify(OWNER, "dc-voltage").unwrap(), 2);
    bus.publish(OWNER, "dc-voltage", 310.0).unwrap();

    assert_eq!(calls.get(), 1);
    assert_eq!(other_calls.get(), 2);
    assert_eq!(bus.get(OWNER, "dc-voltage").unwrap().subscribers(), &[other]);
}

#[test]
fn test_subscription_added_during_notify_waits_for_next_round() {
    let mut bus = bus();
    bus.publish(OWNER, "energy-today", 1.0).unwrap();
    let (late, late_calls) = counting_observer(&mut bus);

    let recruiter = bus.add_observer(Observer::callback(move |cap, bus| {
        bus.subscribe(cap.owner, &cap.name, late).unwrap();
    }));
    bus.subscribe(OWNER, "energy-today", recruiter).unwrap();

    assert_eq!(bus.notify(OWNER, "energy-today").unwrap(), 1);
    assert_eq!(late_calls.get(), 0);

    assert_eq!(bus.notify(OWNER, "energy-today").unwrap(), 2);
    assert_eq!(late_calls.get(), 1);
}

#[test]
fn test_observer_removing_itself_mid_notify() {
    let mut bus = bus();
    let own_id = Rc::new(Cell::new(None));
    let me = own_id.clone();
    let id = bus.add_observer(Observer::callback(move |_, bus| {
        if let Some(me) = me.get() {
            bus.remove_observer(me).unwrap();
        }
    }));
    own_id.set(Some(id));
    bus.subscribe(OWNER, DATA_VALID, id).unwrap();

    bus.set_data_valid(OWNER, true).unwrap();
    bus.set_data_valid(OWNER, false).unwrap();

    assert!(bus.get(OWNER, DATA_VALID).unwrap().subscribers().is_empty());
    assert_eq!(
        bus.remove_observer(id),
        Err(CapabilityError::UnknownObserver(id.0))
    );
}

#[test]
fn test_reentrant_publish_reaches_running_observer_after_it_returns() {
    let mut bus = bus();
    bus.publish(OWNER, "counter", 0i64).unwrap();

    let seen = Rc::new(RefCell::new(Vec::new()));
    let depth = Rc::new(Cell::new(0));
    let max_depth = Rc::new(Cell::new(0));
    let (sink, level, deepest) = (seen.clone(), depth.clone(), max_depth.clone());
    let id = bus.add_observer(Observer::callback(move |cap, bus| {
        level.set(level.get() + 1);
        deepest.set(deepest.get().max(level.get()));
        sink.borrow_mut().push(cap.value.clone());

        let current = cap.value.as_i64().unwrap_or(0);
        if current < 3 {
            bus.publish(cap.owner, &cap.name, current + 1).unwrap();
        }
        level.set(level.get() - 1);
    }));
    bus.subscribe(OWNER, "counter", id).unwrap();

    bus.publish(OWNER, "counter", 1i64).unwrap();

    assert_eq!(*seen.borrow(), vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    assert_eq!(max_depth.get(), 1);
    assert_eq!(bus.value(OWNER, "counter"), Some(&Value::Int(3)));
}

#[test]
fn test_nested_notify_defers_only_the_running_observer() {
    let mut bus = bus();
    bus.publish(OWNER, "dc-voltage", 300.0).unwrap();

    let seen = Rc::new(RefCell::new(Vec::new()));
    let first_sink = seen.clone();
    let nested = Rc::new(Cell::new(false));
    let first = bus.add_observer(Observer::callback(move |cap, bus| {
        first_sink.borrow_mut().push(("first", cap.value.clone()));
        if !nested.replace(true) {
            assert_eq!(bus.notify(cap.owner, &cap.name).unwrap(), 2);
        }
    }));
    let second_sink = seen.clone();
    let second = bus.add_observer(Observer::callback(move |cap, _| {
        second_sink.borrow_mut().push(("second", cap.value.clone()));
    }));
    bus.subscribe(OWNER, "dc-voltage", first).unwrap();
    bus.subscribe(OWNER, "dc-voltage", second).unwrap();

    assert_eq!(bus.notify(OWNER, "dc-voltage").unwrap(), 2);

    // Inner round: `second` immediately, `first` once its outer call returns.
    assert_eq!(
        *seen.borrow(),
        vec![
            ("first", Value::Float(300.0)),
            ("second", Value::Float(300.0)),
            ("first", Value::Float(300.0)),
            ("second", Value::Float(300.0)),
        ]
    );
}

#[test]
fn test_lookups_of_missing_names_are_errors_not_defects() {
    let mut bus = bus();
    let (id, _) = counting_observer(&mut bus);

    assert!(matches!(
        bus.subscribe(OWNER, "not-yet-published", id),
        Err(CapabilityError::UnknownCapability { .. })
    ));
    assert_eq!(
        bus.subscribe(ComponentId(9), DATA_VALID, id),
        Err(CapabilityError::UnknownOwner(ComponentId(9)))
    );
    assert!(bus.value(OWNER, "not-yet-published").is_none());
}

#[test]
fn test_removing_component_clears_its_capabilities() {
    struct Idle;

    impl CommandTarget for Idle {
        type Kind = ();

        fn name(&self) -> &str {
            "idle"
        }

        fn attach(&mut self, ctx: &mut Context<'_>) -> Result<(), InvariantViolation> {
            ctx.publish("energy-total", 42.0).map(|_| ())
        }

        fn execute(&mut self, _: Command<()>, _: &mut Context<'_>) -> Result<(), InvariantViolation> {
            Ok(())
        }
    }

    let mut runtime = Runtime::new(ManualClock::new(0));
    let id = runtime.add_component(Idle).unwrap();

    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    let observer = runtime.bus_mut().add_observer(Observer::callback(move |cap, _| {
        sink.borrow_mut().push((cap.name.clone(), cap.value.clone()));
    }));
    runtime.bus_mut().subscribe(id, CAPABILITY_SET_CLEAR_ALL, observer).unwrap();

    assert!(runtime.remove_component(id));

    assert_eq!(*seen.borrow(), vec![(CAPABILITY_SET_CLEAR_ALL.to_owned(), Value::Bool(true))]);
    assert!(runtime.bus().value(id, "energy-total").is_none());
    assert_eq!(runtime.status(id), ComponentStatus::Vacant);
    assert_eq!(runtime.stats().removed_instances, 1);
}
