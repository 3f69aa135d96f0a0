use anyhow::{Context, Result};
use scoreboard_remote::domain::models::{
    AppEvent, ConnectionStatus, ControllerCommand, ControllerSnapshot, MessageSeverity, Side,
};
use scoreboard_remote::domain::settings::{SettingsService, SportPreset};
use scoreboard_remote::infrastructure::bluetooth::btle::BtleLink;
use scoreboard_remote::infrastructure::bluetooth::connection::ControllerConfig;
use scoreboard_remote::infrastructure::bluetooth::{BluetoothService, ControllerHandle};
use scoreboard_remote::infrastructure::logging;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};

const HELP: &str = "\
Commands:
  scan | stop-scan | devices
  connect [N]          connect to device N from `devices` (default: last used)
  disconnect
  blue+ [N] | red+ [N] add N points (default: configured increment)
  blue- | red-         take one point away
  set blue|red N       set a score directly
  timer MM:SS | stop   countdown / back to score display
  reset                zero scores and timer
  slow on|off          slow display update rate
  preset [N]           list or choose a sport increment preset
  telemetry on|off|show|clear
  log [clear]          recent actions
  status | help | quit";

#[derive(Debug, PartialEq)]
enum ConsoleCommand {
    Controller(ControllerCommand),
    ConnectIndex(Option<usize>),
    Devices,
    Preset(Option<usize>),
    ShowTelemetry,
    ShowLog,
    Status,
    Help,
    Quit,
}

fn parse_side(word: &str) -> Option<Side> {
    match word {
        "blue" | "b" => Some(Side::Blue),
        "red" | "r" => Some(Side::Red),
        _ => None,
    }
}

fn parse_number<T: std::str::FromStr>(word: Option<&str>, what: &str) -> Result<T, String> {
    word.ok_or_else(|| format!("missing {}", what))?
        .parse()
        .map_err(|_| format!("invalid {}", what))
}

fn parse_timer(word: Option<&str>) -> Result<(u8, u8), String> {
    let word = word.ok_or("missing MM:SS")?;
    let (minutes, seconds) = word.split_once(':').ok_or("timer must be MM:SS")?;
    Ok((
        parse_number(Some(minutes), "minutes")?,
        parse_number(Some(seconds), "seconds")?,
    ))
}

fn parse_toggle(word: Option<&str>) -> Result<bool, String> {
    match word {
        Some("on") => Ok(true),
        Some("off") => Ok(false),
        _ => Err("expected on|off".to_string()),
    }
}

fn parse_command(line: &str, increment: u8) -> Result<ConsoleCommand, String> {
    use ConsoleCommand::*;

    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Err(String::new());
    };
    let arg = words.next();

    if let Some(side) = head.strip_suffix('+').and_then(parse_side) {
        let amount = match arg {
            Some(_) => parse_number(arg, "amount")?,
            None => increment,
        };
        return Ok(Controller(ControllerCommand::IncrementScore(side, amount)));
    }
    if let Some(side) = head.strip_suffix('-').and_then(parse_side) {
        return Ok(Controller(ControllerCommand::DecrementScore(side)));
    }

    let command = match head {
        "scan" => Controller(ControllerCommand::StartScan),
        "stop-scan" => Controller(ControllerCommand::StopScan),
        "devices" => Devices,
        "connect" => ConnectIndex(match arg {
            Some(_) => Some(parse_number(arg, "device number")?),
            None => None,
        }),
        "disconnect" => Controller(ControllerCommand::Disconnect),
        "set" => {
            let side = arg.and_then(parse_side).ok_or("expected blue|red")?;
            let value = parse_number(words.next(), "score")?;
            Controller(ControllerCommand::SetScore(side, value))
        }
        "timer" => {
            let (minutes, seconds) = parse_timer(arg)?;
            Controller(ControllerCommand::StartTimer { minutes, seconds })
        }
        "stop" => Controller(ControllerCommand::StopTimer),
        "reset" => Controller(ControllerCommand::ResetScores),
        "slow" => Controller(ControllerCommand::SetSlowUpdateRate(parse_toggle(arg)?)),
        "preset" => Preset(match arg {
            Some(_) => Some(parse_number(arg, "preset number")?),
            None => None,
        }),
        "telemetry" => match arg {
            Some("show") => ShowTelemetry,
            Some("clear") => Controller(ControllerCommand::ClearTelemetryLog),
            other => Controller(ControllerCommand::SetTelemetryEnabled(parse_toggle(other)?)),
        },
        "log" => match arg {
            Some("clear") => Controller(ControllerCommand::ClearActionLog),
            _ => ShowLog,
        },
        "status" => Status,
        "help" | "?" => Help,
        "quit" | "exit" | "q" => Quit,
        other => return Err(format!("unknown command '{}', try `help`", other)),
    };
    Ok(command)
}

fn print_status(snapshot: &ControllerSnapshot) {
    let state = &snapshot.state;
    let device = snapshot
        .connected_device
        .as_ref()
        .map(|d| d.hardware_id.as_str())
        .unwrap_or("-");
    println!(
        "[{}] device {}  Blue {:02} - {:02} Red  timer {}{}",
        snapshot.status,
        device,
        state.blue_score,
        state.red_score,
        state.timer_formatted(),
        if state.is_timer_mode() { " (running)" } else { "" }
    );
    if let Some(error) = &snapshot.last_error {
        println!("  last error: {}", error);
    }
}

fn print_devices(snapshot: &ControllerSnapshot) {
    if snapshot.discovered_devices.is_empty() {
        println!("No scoreboards found yet, run `scan`");
        return;
    }
    for (index, device) in snapshot.discovered_devices.iter().enumerate() {
        println!(
            "  {}: {}  {} dBm ({})",
            index,
            device.hardware_id,
            device.rssi,
            device.signal_strength().label()
        );
    }
}

fn print_telemetry(snapshot: &ControllerSnapshot) {
    if snapshot.telemetry.is_empty() {
        println!("No telemetry received");
        return;
    }
    for entry in snapshot.telemetry.iter().take(10) {
        let mut flags = Vec::new();
        if entry.is_overheating() {
            flags.push("HOT");
        }
        if entry.is_critical_memory() {
            flags.push("MEM!");
        } else if entry.is_low_memory() {
            flags.push("mem");
        }
        println!(
            "  {} #{:3} up {:>7} {:>7} heap {} (min {}) {} dBm {} tasks {}",
            entry.formatted_time(),
            entry.sequence,
            entry.uptime_string(),
            entry.temperature_string(),
            entry.free_heap_kb(),
            entry.min_heap_kb(),
            entry.signal_dbm,
            entry.task_count,
            flags.join(" ")
        );
    }
}

fn print_log(snapshot: &ControllerSnapshot) {
    for entry in snapshot.actions.iter().take(20) {
        println!(
            "  {} [{}] {:<12} {}",
            entry.formatted_time(),
            entry.device_id,
            entry.kind.to_string(),
            entry.description
        );
    }
}

fn print_event(event: &AppEvent) {
    match event {
        AppEvent::LogMessage(message) => {
            let tag = match message.severity {
                MessageSeverity::Info => "info",
                MessageSeverity::Success => " ok ",
                MessageSeverity::Warning => "warn",
                MessageSeverity::Error => "FAIL",
            };
            println!("[{}] {}", tag, message.message);
        }
        AppEvent::DeviceFound(device) => {
            println!("  found {} ({} dBm)", device.hardware_id, device.rssi);
        }
        AppEvent::StateChanged(state) => {
            println!(
                "  Blue {:02} - {:02} Red  {}",
                state.blue_score,
                state.red_score,
                state.timer_formatted()
            );
        }
        AppEvent::PacketSent { write_id, success } => {
            if !success {
                println!("[FAIL] packet #{} was not delivered", write_id);
            }
        }
        AppEvent::ConnectionStatus(_) | AppEvent::Telemetry(_) => {}
    }
}

/// Run one console command. Returns false when the user asked to quit.
async fn execute(
    command: ConsoleCommand,
    handle: &ControllerHandle,
    settings: &mut SettingsService,
) -> Result<bool> {
    match command {
        ConsoleCommand::Controller(command) => {
            if let ControllerCommand::SetSlowUpdateRate(slow) = command {
                settings.get_mut().slow_update_rate = slow;
                settings.save()?;
            }
            handle.command(command)?;
        }
        ConsoleCommand::ConnectIndex(index) => {
            let snapshot = handle.snapshot().await?;
            let device = match index {
                Some(index) => snapshot.discovered_devices.get(index),
                None => settings.get().last_connected_id.as_deref().and_then(|last| {
                    snapshot
                        .discovered_devices
                        .iter()
                        .find(|d| d.hardware_id == last)
                }),
            };
            match device {
                Some(device) => handle.connect(device.id.clone())?,
                None => println!("No such device, run `scan` then `devices`"),
            }
        }
        ConsoleCommand::Devices => print_devices(&handle.snapshot().await?),
        ConsoleCommand::Preset(None) => {
            for (index, preset) in SportPreset::ALL.iter().enumerate() {
                println!("  {}: {:<16} {}", index, preset.name(), preset.short_label());
            }
        }
        ConsoleCommand::Preset(Some(index)) => match SportPreset::ALL.get(index) {
            Some(preset) => {
                settings.apply_preset(*preset)?;
                println!("Score increment is now {}", preset.short_label());
            }
            None => println!("No such preset"),
        },
        ConsoleCommand::ShowTelemetry => print_telemetry(&handle.snapshot().await?),
        ConsoleCommand::ShowLog => print_log(&handle.snapshot().await?),
        ConsoleCommand::Status => print_status(&handle.snapshot().await?),
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::Quit => return Ok(false),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut settings = SettingsService::new().context("Failed to load settings")?;

    let _logging_guard = logging::init_logger(&settings.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting Scoreboard Remote");
    info!("Settings file: {}", settings.path().display());

    let config = ControllerConfig::from_settings(settings.get())?;
    let (link_tx, link_rx) = mpsc::unbounded_channel();
    let link = BtleLink::new(settings.get(), link_tx)
        .await
        .context("Failed to open Bluetooth adapter")?;
    let (handle, mut events, task) = BluetoothService::spawn(link, link_rx, config);

    println!("Scoreboard Remote. Type `help` for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let command = match parse_command(&line, settings.get().score_increment) {
                    Ok(command) => command,
                    Err(message) => {
                        if !message.is_empty() {
                            println!("{}", message);
                        }
                        continue;
                    }
                };
                match execute(command, &handle, &mut settings).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        error!("Command failed: {}", e);
                        println!("[FAIL] {}", e);
                    }
                }
            }
            Some(event) = events.recv() => {
                print_event(&event);
                if let AppEvent::ConnectionStatus(ConnectionStatus::Connected) = event {
                    let snapshot = handle.snapshot().await?;
                    if let Some(device) = snapshot.connected_device {
                        if let Err(e) = settings.set_last_connected_id(&device.hardware_id) {
                            error!("Failed to save last connected device: {}", e);
                        }
                    }
                }
            }
        }
    }

    handle.shutdown()?;
    task.await?;
    info!("Goodbye");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_score_commands() {
        assert_eq!(
            parse_command("blue+", 2),
            Ok(ConsoleCommand::Controller(ControllerCommand::IncrementScore(Side::Blue, 2)))
        );
        assert_eq!(
            parse_command("red+ 6", 2),
            Ok(ConsoleCommand::Controller(ControllerCommand::IncrementScore(Side::Red, 6)))
        );
        assert_eq!(
            parse_command("r-", 1),
            Ok(ConsoleCommand::Controller(ControllerCommand::DecrementScore(Side::Red)))
        );
        assert_eq!(
            parse_command("set blue 42", 1),
            Ok(ConsoleCommand::Controller(ControllerCommand::SetScore(Side::Blue, 42)))
        );
    }

    #[test]
    fn test_parse_timer_and_toggles() {
        assert_eq!(
            parse_command("timer 12:30", 1),
            Ok(ConsoleCommand::Controller(ControllerCommand::StartTimer {
                minutes: 12,
                seconds: 30
            }))
        );
        assert!(parse_command("timer 1230", 1).is_err());
        assert_eq!(
            parse_command("telemetry off", 1),
            Ok(ConsoleCommand::Controller(ControllerCommand::SetTelemetryEnabled(false)))
        );
        assert_eq!(parse_command("telemetry show", 1), Ok(ConsoleCommand::ShowTelemetry));
        assert!(parse_command("slow maybe", 1).is_err());
    }

    #[test]
    fn test_parse_misc() {
        assert_eq!(parse_command("connect", 1), Ok(ConsoleCommand::ConnectIndex(None)));
        assert_eq!(parse_command("connect 2", 1), Ok(ConsoleCommand::ConnectIndex(Some(2))));
        assert_eq!(parse_command("quit", 1), Ok(ConsoleCommand::Quit));
        assert_eq!(parse_command("   ", 1), Err(String::new()));
        assert!(parse_command("dance", 1).is_err());
    }
}
