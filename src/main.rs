use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use paho_mqtt::Message;
use serde_json::Value;
use victron_ess_lib::config::{Config, ConfigHandle};
use victron_ess_lib::controller::{BusPublisher, Controller, InverterBridge};
use victron_ess_lib::link::{ByteLink, SerialLink};
use victron_ess_lib::meter::{self, FrameScanner};
use victron_ess_lib::vebus::VeBus;
use victron_ess_lib::vedirect::VeDirectParser;

mod commandline;
mod mqtt;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    std::panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::as_str);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

fn main() -> Result<()> {
    let args = commandline::Args::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());
    warn!("start victron-ess");

    let config = Config::load(&args.config)
        .with_context(|| format!("Cannot load config file {:?}", args.config))?;

    match &args.command {
        commandline::Commands::Controller => run_controller(&args.config, config),
        commandline::Commands::Smartmeter => run_smartmeter(config),
        commandline::Commands::Mppt => run_mppt(config),
        commandline::Commands::FetchData { publish } => run_fetch_data(config, *publish),
    }
}

fn subscribe_all(client: &paho_mqtt::Client, handle: &ConfigHandle) -> Result<()> {
    let topics = handle.read().topics.clone();
    for topic in [
        &topics.smartmeter,
        &topics.bms,
        &topics.mppt,
        &topics.cmd,
        &topics.soc_min,
        &topics.soc_max,
    ]
    .into_iter()
    .flatten()
    {
        info!("subscribe {topic}");
        client
            .subscribe(topic, 0)
            .with_context(|| format!("Cannot subscribe to {topic}"))?;
    }
    Ok(())
}

fn dispatch<B: InverterBridge, P: BusPublisher>(
    controller: &mut Controller<B, P>,
    handle: &ConfigHandle,
    msg: &Message,
) {
    let topic = msg.topic();
    let payload = msg.payload_str();
    debug!("message received topic: {topic} {payload}");
    let data: Value = match serde_json::from_str(&payload) {
        Ok(value) => value,
        Err(e) => {
            warn!("discarding unparsable payload on {topic}: {e}");
            return;
        }
    };
    let topics = handle.read().topics.clone();
    let matches = |candidate: &Option<String>| candidate.as_deref() == Some(topic);

    if matches(&topics.smartmeter) {
        match data.get("power").and_then(Value::as_f64) {
            // the regulator works on the negated grid power
            Some(power) => controller.handle_meter(-power),
            None => warn!("meter message without power field"),
        }
    } else if matches(&topics.bms) {
        match data.get("soc").and_then(Value::as_f64) {
            Some(soc) => {
                controller.handle_bms(soc, data.get("voltage").and_then(Value::as_f64));
            }
            None => warn!("bms message without soc field"),
        }
    } else if matches(&topics.mppt) {
        controller.handle_mppt(data.get("PPV").and_then(Value::as_f64).unwrap_or(0.0));
    } else if matches(&topics.cmd) {
        match data.get("cmd").and_then(Value::as_str) {
            Some(cmd) => controller.handle_cmd(cmd),
            None => warn!("cmd message without cmd field"),
        }
    } else if matches(&topics.soc_min) {
        match data.as_f64() {
            Some(value) => controller.set_min_soc(value),
            None => warn!("soc_min payload is not numeric: {payload}"),
        }
    } else if matches(&topics.soc_max) {
        match data.as_f64() {
            Some(value) => controller.set_max_soc(value),
            None => warn!("soc_max payload is not numeric: {payload}"),
        }
    } else {
        info!("unknown topic {topic}");
    }
}

fn run_controller(config_path: &str, config: Config) -> Result<()> {
    let victron = config.victron()?.clone();
    config
        .topics
        .smartmeter
        .as_ref()
        .context("[SMARTMETER] topic is required for the controller")?;
    config
        .topics
        .bms
        .as_ref()
        .context("[BMS1] topic is required for the controller")?;
    config
        .topics
        .victron
        .as_ref()
        .context("[VICTRON] topic is required for the controller")?;

    let client = Arc::new(mqtt::create_client(&config.mqtt, "update-setpoint")?);
    let handle = ConfigHandle::new(config);

    let receiver = client.start_consuming();
    subscribe_all(&client, &handle)?;

    let reload = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGHUP, reload.clone())
        .context("Cannot register SIGHUP handler")?;

    let link = SerialLink::new(&victron.serial_port, 2400, Duration::from_millis(10));
    let bridge = VeBus::new(link);
    let publisher = mqtt::MqttPublisher::new(client.clone());
    let mut controller = Controller::new(bridge, publisher, handle.clone())?;

    info!("start loop");
    for message in receiver.iter() {
        if reload.swap(false, Ordering::Relaxed) {
            match Config::load(config_path) {
                Ok(new_config) => {
                    handle.replace(new_config);
                    warn!("configuration reloaded");
                }
                Err(e) => error!("config reload failed, keeping previous: {e}"),
            }
        }
        match message {
            Some(msg) => dispatch(&mut controller, &handle, &msg),
            None => {
                warn!("lost connection to MQTT broker");
                while !client.is_connected() {
                    std::thread::sleep(Duration::from_secs(1));
                    if client.reconnect().is_ok() {
                        break;
                    }
                }
                if let Err(e) = subscribe_all(&client, &handle) {
                    error!("resubscribe failed: {e}");
                }
            }
        }
    }
    Ok(())
}

fn run_smartmeter(config: Config) -> Result<()> {
    let sm = config.smartmeter()?.clone();
    let client = mqtt::create_client(&config.mqtt, "smartmeter")?;

    let mut layout = sm.variant.layout();
    if let Some(body_len) = sm.frame_length {
        layout = layout.with_body_len(body_len);
    }
    let mut link = SerialLink::new(&sm.serial_port, sm.baudrate, Duration::from_secs(1));
    let mut scanner = FrameScanner::new(layout.body_len);
    let mut buf = [0u8; 512];

    info!("reading smart meter on {}", sm.serial_port);
    loop {
        let n = match link.read(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                error!("meter serial: {e}");
                scanner.reset();
                std::thread::sleep(Duration::from_secs(1));
                continue;
            }
        };
        for &byte in &buf[..n] {
            let Some(frame) = scanner.feed(byte) else {
                continue;
            };
            match meter::decode_frame(&frame, &sm.key, &layout) {
                Ok(reading) => {
                    info!(
                        "meter: {} W in, {} W out, {:.3} kWh / {:.3} kWh",
                        reading.power_in, reading.power_out, reading.total_in, reading.total_out
                    );
                    let payload = reading.to_payload().to_string();
                    if let Err(e) = client.publish(Message::new(sm.topic.clone(), payload, 0)) {
                        error!("publish failed: {e}");
                    }
                    let widget = serde_json::json!({
                        "title": "Smartmeter",
                        "color": 24555,
                        "main": {"unit": "W", "PwrSM": reading.power},
                        "stand": {
                            "unit": "KWh",
                            "In": format!("{:.1}", reading.total_in),
                            "Out": format!("{:.1}", reading.total_out),
                        },
                    });
                    if let Err(e) = client.publish(Message::new("display", widget.to_string(), 0)) {
                        error!("display publish failed: {e}");
                    }
                }
                Err(e) => warn!("dropping meter frame: {e}"),
            }
        }
    }
}

fn run_mppt(config: Config) -> Result<()> {
    let mppt = config.mppt()?.clone();
    let client = mqtt::create_client(&config.mqtt, "mppt")?;

    let mut link = SerialLink::new(&mppt.serial_port, mppt.baudrate, Duration::from_secs(1));
    let mut parser = VeDirectParser::new();
    let mut buf = [0u8; 512];

    info!("reading VE.Direct on {}", mppt.serial_port);
    loop {
        let n = match link.read(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                error!("mppt serial: {e}");
                std::thread::sleep(Duration::from_secs(1));
                continue;
            }
        };
        for &byte in &buf[..n] {
            let Some(record) = parser.feed(byte) else {
                continue;
            };
            match serde_json::to_string(&record) {
                Ok(payload) => {
                    debug!("mppt record: {payload}");
                    if let Err(e) = client.publish(Message::new(mppt.topic.clone(), payload, 0)) {
                        error!("publish failed: {e}");
                    }
                }
                Err(e) => warn!("cannot serialize record: {e}"),
            }
        }
    }
}

fn run_fetch_data(config: Config, publish: bool) -> Result<()> {
    let victron = config.victron()?.clone();
    let link = SerialLink::new(&victron.serial_port, 2400, Duration::from_millis(10));
    let mut bus = VeBus::new(link);

    let dump = bus.fetch_dump().context("Cannot fetch inverter dump")?;
    println!("{}", serde_json::to_string_pretty(&dump)?);

    if publish {
        let topic = config
            .topics
            .fetch_data
            .clone()
            .context("fetch_data_topic is not configured")?;
        let client = mqtt::create_client(&config.mqtt, "fetch-data")?;
        client
            .publish(Message::new(topic, dump.to_string(), 0))
            .context("Cannot publish dump")?;
    }
    Ok(())
}
