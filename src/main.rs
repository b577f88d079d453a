use embassy_executor::{Executor, Spawner};
use env_logger::Builder;
use log::{LevelFilter, info, warn};
use std::io::BufRead;
use std::path::PathBuf;
use std::thread;

use iot_mqtt_simulator::config::SimulationConfig;
use iot_mqtt_simulator::simulation::{ControlQueue, ControlQueueSender, SummarySignal, network_task, parse_command};

const DEFAULT_CONFIG_PATH: &str = "simulation.toml";

fn embassy_init(spawner: Spawner, config: SimulationConfig, control_queue: &'static ControlQueue, done: &'static SummarySignal) {
    let _ = spawner.spawn(network_task(spawner, config, control_queue.receiver(), done));
}

/// Forward control lines from stdin to the simulation until stdin closes.
fn read_commands(control_tx: ControlQueueSender) {
    for line in std::io::stdin().lock().lines() {
        let Ok(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line) {
            Ok(command) => {
                if control_tx.try_send(command).is_err() {
                    warn!("Control queue full, dropping command: {}", line.trim());
                }
            }
            Err(err) => warn!("{}", err),
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Logging setup
    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter(Some("iot_mqtt_simulator"), LevelFilter::Debug)
        .parse_default_env()
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = match &config_path {
        Some(path) => SimulationConfig::load(path)?,
        None if PathBuf::from(DEFAULT_CONFIG_PATH).exists() => SimulationConfig::load(&PathBuf::from(DEFAULT_CONFIG_PATH))?,
        None => {
            info!("No configuration file given, using defaults");
            SimulationConfig::default()
        }
    };
    info!("Starting up: {} s simulated at {}%", config.duration_secs, config.speed_percent);

    let control_queue: &'static ControlQueue = Box::leak(Box::new(ControlQueue::new()));
    let done: &'static SummarySignal = Box::leak(Box::new(SummarySignal::new()));

    // Spawn Embassy executor on a dedicated background thread
    let _embassy_handle = thread::Builder::new()
        .name("embassy-executor".to_string())
        .spawn(move || {
            // Leak the executor to satisfy the 'static lifetime required by run()
            let executor: &'static mut Executor = Box::leak(Box::new(Executor::new()));
            executor.run(|spawner| embassy_init(spawner, config, control_queue, done));
        })
        .expect("failed to spawn embassy thread");

    // Commands are optional; the reader thread simply ends with stdin
    let control_tx = control_queue.sender();
    thread::Builder::new().name("control-input".to_string()).spawn(move || read_commands(control_tx))?;

    let summary = futures::executor::block_on(done.wait());
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
