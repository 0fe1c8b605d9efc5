use clap::{App, Arg};
use colored::*;
use solbus::capability::{Capability, CapabilityBus};
use solbus::inverter::fields::{CONFIG_NAME, LAST_UPDATE};
use solbus::{
    ComponentId, DriverReport, InverterDriver, MonotonicClock, Observer, ObserverId, Runtime, StoreSnapshot,
    SystemConfig, CAPABILITY_SET_CHANGED, DATA_VALID,
};
use std::cell::Cell;
use std::rc::Rc;
use tracing::{error, info, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Table,
    Json,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("solbus")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Solar Systems Engineering Team")
        .about("Polls photovoltaic inverters and publishes their readings as capabilities")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("simulate")
                .short("s")
                .long("simulate")
                .help("Replace every configured transport with a simulated inverter"),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Snapshot output format")
                .takes_value(true)
                .possible_values(&["table", "json"])
                .default_value("table"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .multiple(true)
                .help("More log output (-v debug, -vv trace)"),
        )
        .get_matches();

    let level = match matches.occurrences_of("verbose") {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).with_target(false).init();

    let format = match matches.value_of("format") {
        Some("json") => OutputFormat::Json,
        _ => OutputFormat::Table,
    };
    let path = matches.value_of("config").unwrap_or_default();

    let mut config = match SystemConfig::from_file(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} Cannot load {}: {}", "❌".red(), path.bright_white(), e.to_string().bright_red());
            return Err(e.into());
        }
    };
    if matches.is_present("simulate") {
        config = config.into_simulated();
    }
    if config.inverters.is_empty() {
        println!("{}", "No inverters configured, nothing to do.".yellow());
        return Ok(());
    }

    let mut runtime = Runtime::new(MonotonicClock::new());
    let printer = install_printer(runtime.bus_mut(), format);

    let mut drivers = Vec::new();
    for inverter in config.inverters {
        let name = inverter.name.clone();
        let driver = InverterDriver::from_config(inverter)?;
        let id = runtime.add_component(driver)?;
        runtime.bus_mut().subscribe(id, DATA_VALID, printer)?;
        runtime.bus_mut().subscribe(id, CAPABILITY_SET_CHANGED, printer)?;
        info!(inverter = %name, %id, "inverter registered");
        drivers.push(id);
    }

    println!("{}", "☀️  solbus running (Press Ctrl+C to stop)...".bright_blue().bold());
    runtime
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "cannot listen for Ctrl+C");
            }
        })
        .await;

    print_reports(&runtime, &drivers, format);
    Ok(())
}

/// Observer that prints a snapshot after every completed poll cycle.
///
/// It follows `capability-set-changed` to pick up `last-update` as soon as
/// a driver creates it.
fn install_printer(bus: &mut CapabilityBus, format: OutputFormat) -> ObserverId {
    let own_id = Rc::new(Cell::new(None::<ObserverId>));
    let id_for_callback = own_id.clone();

    let id = bus.add_observer(Observer::callback(move |cap: &Capability, bus: &mut CapabilityBus| {
        let owner = cap.owner;
        if cap.name == CAPABILITY_SET_CHANGED {
            if let Some(me) = id_for_callback.get() {
                if bus.get(owner, LAST_UPDATE).is_some() {
                    let _ = bus.subscribe(owner, LAST_UPDATE, me);
                }
            }
            return;
        }
        print_snapshot(bus, owner, format);
    }));

    own_id.set(Some(id));
    id
}

fn print_snapshot(bus: &CapabilityBus, owner: ComponentId, format: OutputFormat) {
    let name = bus
        .value(owner, CONFIG_NAME)
        .map_or_else(|| owner.to_string(), ToString::to_string);
    let Some(snapshot) = StoreSnapshot::capture(bus, owner, name) else {
        return;
    };
    if !snapshot.data_valid() {
        println!("{} {} lost its data", "⚠️".yellow(), snapshot.name.bright_white());
        return;
    }

    match format {
        OutputFormat::Json => match snapshot.to_json() {
            Ok(json) => println!("{json}"),
            Err(e) => error!(error = %e, "cannot serialize snapshot"),
        },
        OutputFormat::Table => print!("{}", snapshot.render_table()),
    }
}

fn print_reports(runtime: &Runtime<MonotonicClock>, drivers: &[ComponentId], format: OutputFormat) {
    for id in drivers {
        let Some(driver) = runtime.component::<InverterDriver>(*id) else {
            continue;
        };
        let report = DriverReport::from_driver(driver);
        match format {
            OutputFormat::Json => match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{json}"),
                Err(e) => error!(error = %e, "cannot serialize driver report"),
            },
            OutputFormat::Table => {
                println!("{}", report.name.bright_white().bold());
                print!("{}", report.render_table());
            }
        }
    }
}
