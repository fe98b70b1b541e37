use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use freebuds::{
    ChecksumMode,
    battery::Throttle,
    broadcast::{DEFAULT_MIN_RSSI, Observation, Scanner},
    identity::{DeviceIdentity, Targets},
    serial,
    session::{Config, Event, Handle, Session, State, Worker},
};
use log::debug;
use std::time::Instant;
use tokio::{
    sync::mpsc::UnboundedReceiver,
    task::LocalSet,
    time::{self, Duration},
};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// RFCOMM device path (e.g. /dev/rfcomm0)
    #[arg(short, long, default_value = "/dev/rfcomm0")]
    port: String,

    /// Device address (e.g. 90:F6:44:AA:EE:67)
    #[arg(short, long)]
    address: Option<String>,

    /// Reject packets with an incorrect checksum instead of only warning
    #[arg(long)]
    verify_checksum: bool,

    /// Number of connection attempts
    #[arg(long, default_value_t = 1)]
    attempts: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Query the battery levels once
    Battery,

    /// Enable or disable the low-latency mode
    LowLatency {
        #[arg(value_enum)]
        mode: Mode,
    },

    /// Query the battery levels periodically until interrupted
    Watch {
        /// Query interval in seconds
        #[arg(short, long, default_value_t = 10)]
        interval: u64,
    },

    /// Evaluate a manually supplied advertisement
    Match(MatchArgs),
}

#[derive(ValueEnum, PartialEq, Eq, Copy, Clone, Debug)]
enum Mode {
    On,
    Off,
}

#[derive(clap::Args, Debug)]
struct MatchArgs {
    /// Address of the advertising device
    #[arg(long)]
    observed_address: String,

    /// Name of the advertising device
    #[arg(long)]
    observed_name: Option<String>,

    /// Received signal strength in dBm
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    rssi: i16,

    /// Manufacturer data as company ID and payload (hex format, e.g. `027d:c8283763c8c8c8`)
    #[arg(long = "data", value_parser = parse_data)]
    data: Vec<ManufacturerData>,

    /// Target device address (any notation)
    #[arg(long = "target-address")]
    target_addresses: Vec<String>,

    /// Target device name fragment
    #[arg(long = "target-name")]
    target_names: Vec<String>,

    /// Signal strength below which devices are out of range
    #[arg(long, default_value_t = DEFAULT_MIN_RSSI, allow_negative_numbers = true)]
    min_rssi: i16,
}

#[derive(Clone, Debug)]
struct ManufacturerData {
    company_id: u16,
    payload: Vec<u8>,
}

fn parse_data(s: &str) -> Result<ManufacturerData> {
    let (id, payload) = s
        .split_once(':')
        .context("Expected company ID and payload separated by a colon")?;
    let id = id.strip_prefix("0x").unwrap_or(id);

    Ok(ManufacturerData {
        company_id: u16::from_str_radix(id, 16).context("Invalid company ID")?,
        payload: hex::decode(payload).context("Invalid payload")?,
    })
}

fn evaluate(args: MatchArgs) -> Result<()> {
    if args.target_addresses.is_empty() && args.target_names.is_empty() {
        bail!("At least one target address or name is required");
    }

    let scanner = Scanner::new(Targets::new(args.target_addresses, args.target_names))
        .with_min_rssi(args.min_rssi);
    let obs = Observation {
        identity: DeviceIdentity {
            address: args.observed_address,
            name: args.observed_name,
        },
        rssi: args.rssi,
        manufacturer_data: args
            .data
            .into_iter()
            .map(|data| (data.company_id, data.payload))
            .collect(),
    };
    let res = scanner.evaluate(&obs);

    match res.matched_by {
        Some(reason) => println!("Target device (matched by {reason})"),
        None => println!("Not a target device"),
    }

    println!("In range: {}", if res.in_range { "yes" } else { "no" });

    if let Some(battery) = res.battery {
        println!("Battery: {battery}");
    }

    Ok(())
}

/// Prints an event that is not handled by the current command.
fn print_event(event: &Event) {
    match event {
        Event::Status(text) => eprintln!("{text}"),
        Event::State(state) => debug!("Session state: {state}"),
        Event::Battery(reading) => println!("{reading}"),
        Event::LowLatency(enabled) => {
            println!("Low-latency mode {}", if *enabled { "on" } else { "off" });
        }
    }
}

async fn query_battery(handle: Handle, mut events: UnboundedReceiver<Event>) -> Result<()> {
    handle.connect()?;
    handle.query_battery()?;

    // Worker exits after executing the queued requests
    drop(handle);

    let mut received = false;

    while let Some(event) = events.recv().await {
        received |= matches!(event, Event::Battery(_));
        print_event(&event);
    }

    if !received {
        bail!("No battery levels received");
    }

    Ok(())
}

async fn set_low_latency(
    handle: Handle,
    mut events: UnboundedReceiver<Event>,
    mode: Mode,
) -> Result<()> {
    handle.connect()?;
    handle.set_low_latency(mode == Mode::On)?;
    drop(handle);

    let mut done = false;

    while let Some(event) = events.recv().await {
        done |= matches!(event, Event::LowLatency(_));
        print_event(&event);
    }

    if !done {
        bail!("Failed to set low-latency mode");
    }

    Ok(())
}

async fn watch(handle: Handle, mut events: UnboundedReceiver<Event>, interval: u64) -> Result<()> {
    let mut ticker = time::interval(Duration::from_secs(interval.max(1)));
    let mut throttle = Throttle::default();
    let mut state = State::Disconnected;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // Reconnect after the connection was lost
                if state == State::Disconnected {
                    handle.connect()?;
                    state = State::Connecting;
                }

                handle.query_battery()?;
            }
            Some(event) = events.recv() => match event {
                Event::State(new) => {
                    debug!("Session state: {new}");
                    state = new;
                }
                Event::Battery(reading) => {
                    if throttle.report(reading, Instant::now()) {
                        println!("{reading}");
                    }
                }
                event => print_event(&event),
            },
            res = tokio::signal::ctrl_c() => {
                res.context("Failed to wait for interrupt")?;

                break;
            }
        }
    }

    handle.stop();

    // Wait for the worker to disconnect
    while let Some(event) = events.recv().await {
        debug!("Discarding event after stop: {event:?}");
    }

    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::init();

    let Args {
        port,
        address,
        verify_checksum,
        attempts,
        command,
    } = Args::parse();

    if let Command::Match(args) = command {
        return evaluate(args);
    }

    let address = address.context("Device address required for this command (--address)")?;
    let checksum = if verify_checksum {
        ChecksumMode::Enforce
    } else {
        ChecksumMode::Lenient
    };
    let config = Config {
        connect_attempts: attempts,
        ..Config::new(checksum)
    };
    let session = Session::new(serial::Connector::new(port), address, config);

    LocalSet::new()
        .run_until(async move {
            let (handle, events) = Worker::start(session);

            match command {
                Command::Battery => query_battery(handle, events).await,
                Command::LowLatency { mode } => set_low_latency(handle, events, mode).await,
                Command::Watch { interval } => watch(handle, events, interval).await,
                Command::Match(_) => Ok(()),
            }
        })
        .await
}
