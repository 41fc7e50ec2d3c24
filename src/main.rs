use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use btleplug::api::Manager as _;
use btleplug::platform::{Adapter, Manager};
use clap::{Parser, Subcommand};
use log::{LevelFilter, info};

use trap_monitor::advertisement::{self, TRAP_COMPANY_IDS};
use trap_monitor::config::AppConfig;
use trap_monitor::manager;
use trap_monitor::mqtt::MqttClient;
use trap_monitor::{BtleplugTransport, DeviceStateTracker, TrapRegistry, battery};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Log debug output for this crate
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan for configured traps and publish their state
    Run,
    /// Decode a hex encoded advertisement offline
    Decode {
        hex: String,
        /// Input is a bare manufacturer payload instead of full advertising data
        #[arg(long)]
        payload: bool,
        /// Company id to assume for a bare payload
        #[arg(long, default_value = "0x0BBB", value_parser = parse_company_id)]
        company_id: u16,
    },
    /// Re-arm a trap
    Reset {
        /// Configured name or address
        device: String,
    },
    /// Read the trap's name, or write a new one
    Name { device: String, new_name: Option<String> },
}

fn parse_company_id(s: &str) -> Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|err| format!("invalid company id {s:?}: {err}"))
}

fn init_logging(debug: bool) {
    let mut builder = pretty_env_logger::formatted_builder();
    match std::env::var("RUST_LOG") {
        Ok(filters) => {
            builder.parse_filters(&filters);
        }
        Err(_) => {
            builder.filter_level(LevelFilter::Info);
        }
    }
    if debug {
        builder.filter_module("trap_monitor", LevelFilter::Debug);
    }
    builder.init();
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config = AppConfig::from_toml(&contents)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    Ok(config)
}

async fn first_adapter() -> anyhow::Result<Adapter> {
    let bt_manager = Manager::new().await?;
    bt_manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("No Bluetooth adapter found"))
}

fn decode(hex_input: &str, payload: bool, company_id: u16) -> anyhow::Result<()> {
    let bytes = hex::decode(hex_input.trim().trim_start_matches("0x"))?;
    let (company_id, data) = if payload {
        (company_id, bytes.as_slice())
    } else {
        advertisement::manufacturer_data_from_ad(&bytes)
            .ok_or_else(|| anyhow!("no manufacturer data in advertisement"))?
    };

    println!("company id: 0x{company_id:04X}");
    println!("payload:    {}", hex::encode_upper(data));
    let status = advertisement::decode(data, company_id)?;
    let reading = battery::compute(status.battery_raw);
    println!("triggered:  {}", status.triggered);
    println!("battery:    {:.2} V ({}%), raw {}", reading.voltage, reading.percentage, status.battery_raw);
    Ok(())
}

async fn one_shot_tracker(
    config: &AppConfig,
    device: &str,
) -> anyhow::Result<DeviceStateTracker<BtleplugTransport>> {
    let device = config
        .find_device(device)
        .ok_or_else(|| anyhow!("{device} is not a configured trap"))?;
    let tracker_config = config.tracker();

    let transport = BtleplugTransport::new(first_adapter().await?, tracker_config.gatt_timeout());
    info!("Looking for {} ({})", device.name, device.address);
    transport
        .discover(device.address, tracker_config.gatt_timeout())
        .await?;

    Ok(DeviceStateTracker::new(
        device.identity(),
        device.battery_model(),
        tracker_config.options(),
        Arc::new(transport),
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match cli.command {
        Command::Decode {
            hex,
            payload,
            company_id,
        } => decode(&hex, payload, company_id),
        Command::Run => {
            let config = load_config(&cli.config)?;
            info!(
                "Traps: {:?}",
                config.devices().iter().map(|d| &d.name).collect::<Vec<_>>()
            );
            info!("Accepting company ids {:04X?}", TRAP_COMPANY_IDS);

            let tracker_config = config.tracker();
            let adapter = first_adapter().await?;
            let transport = Arc::new(BtleplugTransport::new(
                adapter.clone(),
                tracker_config.gatt_timeout(),
            ));
            let registry = Arc::new(TrapRegistry::from_config(&config, transport));
            if registry.is_empty() {
                return Err(anyhow!("No devices configured in {}", cli.config.display()));
            }

            let mqtt = config.mqtt.as_ref().map(MqttClient::new);
            let core = manager::Manager::new(adapter, registry, mqtt, tracker_config);
            core.run_loop().await
        }
        Command::Reset { device } => {
            let config = load_config(&cli.config)?;
            let tracker = one_shot_tracker(&config, &device).await?;
            tracker.reset().await?;
            println!("Reset sent to {}", tracker.identity().name);
            Ok(())
        }
        Command::Name { device, new_name } => {
            let config = load_config(&cli.config)?;
            let tracker = one_shot_tracker(&config, &device).await?;
            match new_name {
                Some(new_name) => {
                    tracker.write_name(&new_name).await?;
                    println!("Renamed {} to {new_name}", tracker.identity().name);
                }
                None => println!("{}", tracker.read_name().await?),
            }
            Ok(())
        }
    }
}
