use anyhow::Result;
use clap::Parser;
use esp32_led_remote::domain::event_log::{render, ExportFormat};
use esp32_led_remote::domain::settings::SettingsService;
use esp32_led_remote::infrastructure::bluetooth::simulator::{self, SimulatorControl};
use esp32_led_remote::infrastructure::bluetooth::{self, event_channel, BleTransport};
use esp32_led_remote::infrastructure::logging::init_logger;
use esp32_led_remote::ConnectionManager;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

/// Drive the ESP32 LED board over Bluetooth LE
#[derive(Parser, Debug)]
#[command(name = "esp32-led-remote", version, about)]
struct Cli {
    /// Settings file (defaults to the per-user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Talk to an in-process simulated board instead of the radio
    #[arg(long)]
    simulate: bool,

    /// Overrides the configured log level
    #[arg(long)]
    log_level: Option<String>,

    /// Connect as soon as the client starts
    #[arg(long)]
    connect: bool,
}

const HELP: &str = "\
commands:
  connect | disconnect | state
  red | green | blue | off | send <text>
  log | export [json|text] | clear
  drop            (simulator) drop the link
  help | quit";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings_service = match &cli.config {
        Some(path) => SettingsService::from_path(path),
        None => SettingsService::new()?,
    };
    if let Some(level) = &cli.log_level {
        settings_service.get_mut().log_settings.level = level.clone();
    }
    let _logging = init_logger(&settings_service.get().log_settings)?;
    info!("Settings loaded from {}", settings_service.path().display());

    let (events_tx, events_rx) = event_channel();
    let (transport, control): (Box<dyn BleTransport>, Option<SimulatorControl>) = if cli.simulate {
        let (transport, control) = simulator::simulated(events_tx);
        (Box::new(transport), Some(control))
    } else {
        (bluetooth::platform_transport(events_tx).await, None)
    };

    let manager = ConnectionManager::spawn(transport, events_rx, settings_service.get());
    manager
        .subscribe_to_log(|entry| println!("{}", entry.to_text_line()))
        .await?;

    if cli.connect {
        report(manager.connect().await);
    }

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
        match verb {
            "" => {}
            "connect" => report(manager.connect().await),
            "disconnect" => report(manager.disconnect().await),
            "state" => println!("{}", manager.state()),
            "red" | "green" | "blue" | "off" => report(manager.send(verb).await),
            "send" => report(manager.send(rest).await),
            "log" => {
                for entry in manager.export_log().await? {
                    println!("{}", entry.to_text_line());
                }
            }
            "export" => {
                let format = if rest.is_empty() {
                    ExportFormat::Json
                } else {
                    match rest.trim().parse::<ExportFormat>() {
                        Ok(format) => format,
                        Err(e) => {
                            println!("{}", e);
                            continue;
                        }
                    }
                };
                print!("{}", render(&manager.export_log().await?, format)?);
            }
            "clear" => report(manager.clear_log().await),
            "drop" => match &control {
                Some(control) => control.drop_link("dropped from the console"),
                None => println!("drop is only available with --simulate"),
            },
            "help" => println!("{}", HELP),
            "quit" | "exit" => break,
            other => println!("unknown command: {} (try help)", other),
        }
    }

    manager.disconnect().await?;
    info!("Bye");
    Ok(())
}

fn report(result: esp32_led_remote::Result<()>) {
    if let Err(e) = result {
        println!("error: {}", e);
    }
}
