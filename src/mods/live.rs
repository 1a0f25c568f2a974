use ambient_volume::{
    boundary::{ BoundaryRegistry, JsonLinesBoundarySource },
    capture::MicrophoneSource,
    config::{ SettingsHandle, SETTING_KEYS },
    monitor::{ DecisionOutcome, MonitoringSession },
};
use anyhow::{ Context, Result };
use crossbeam_channel::{ select, tick, unbounded, Receiver };
use std::{
    io::{ self, BufRead },
    sync::{ atomic::{ AtomicBool, Ordering }, Arc },
    thread,
    time::Duration,
};
use tracing::{ debug, info, warn };

use crate::{ build_sink, Cli };

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Status,
    History,
    Set(String, String),
    Stop,
    Start,
    Quit,
    Help,
}

fn parse_command(line: &str) -> std::result::Result<Command, String> {
    let mut parts = line.split_whitespace();
    let Some(verb) = parts.next() else {
        return Err(String::new());
    };
    match verb.to_lowercase().as_str() {
        "status" => Ok(Command::Status),
        "history" => Ok(Command::History),
        "stop" => Ok(Command::Stop),
        "start" => Ok(Command::Start),
        "quit" | "exit" => Ok(Command::Quit),
        "help" | "?" => Ok(Command::Help),
        "set" =>
            match (parts.next(), parts.next()) {
                (Some(k), Some(v)) => Ok(Command::Set(k.to_string(), v.to_string())),
                _ => Err("usage: set <key> <value>".to_string()),
            }
        other => Err(format!("unknown command '{other}' (try 'help')")),
    }
}

fn spawn_console() -> Result<Receiver<std::result::Result<Command, String>>> {
    let (tx, rx) = unbounded();
    thread::Builder::new()
        .name("console".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                if tx.send(parse_command(&line)).is_err() {
                    break;
                }
            }
            debug!("console input closed");
        })?;
    Ok(rx)
}

fn print_outcome(o: &DecisionOutcome) {
    let r = &o.record;
    println!(
        "[{}] {}: ambient {:.1} dB, volume {} -> {} ({}){}",
        r.timestamp.format("%H:%M:%S"),
        o.trigger,
        r.ambient_db,
        r.old_volume,
        r.new_volume,
        r.direction(),
        match &o.sink_error {
            Some(e) => format!(" NOT APPLIED: {e}"),
            None => String::new(),
        }
    );
}

fn print_help() {
    println!("commands:");
    println!("  status               current snapshot as JSON");
    println!("  history              volume changes, newest first");
    println!("  set <key> <value>    change a setting ({})", SETTING_KEYS.join(", "));
    println!("  stop | start         stop or restart monitoring");
    println!("  quit                 exit");
}

/// Returns false when the loop should exit.
fn handle(cmd: Command, session: &MonitoringSession, settings: &SettingsHandle) -> bool {
    match cmd {
        Command::Status => {
            match serde_json::to_string_pretty(&session.snapshot()) {
                Ok(json) => println!("{json}"),
                Err(e) => warn!("snapshot serialization failed: {e}"),
            }
        }
        Command::History => {
            let history = session.history();
            if history.is_empty() {
                println!("no volume changes yet");
            }
            for r in history {
                println!(
                    "{}  ambient {:>5.1} dB  {:>2} -> {:>2}  {}",
                    r.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    r.ambient_db,
                    r.old_volume,
                    r.new_volume,
                    r.direction()
                );
            }
        }
        Command::Set(key, value) =>
            match settings.set(&key, &value) {
                Ok(()) => {
                    info!("setting {key} = {value}");
                    println!("ok");
                }
                Err(e) => println!("error: {e}"),
            }
        Command::Stop =>
            match session.stop() {
                Ok(()) => println!("stopped"),
                Err(e) => println!("error: {e}"),
            }
        Command::Start =>
            match session.start() {
                Ok(mode) => println!("started ({mode} mode)"),
                Err(e) => println!("error: {e}"),
            }
        Command::Help => print_help(),
        Command::Quit => {
            return false;
        }
    }
    true
}

/// Live mode: microphone capture, gap or song-boundary detection, console control.
pub fn run_live(cli: &Cli, settings: SettingsHandle) -> Result<()> {
    // ctrl+c to quit
    let quit = Arc::new(AtomicBool::new(false));
    {
        let q = quit.clone();
        let _ = ctrlc::set_handler(move || {
            q.store(true, Ordering::SeqCst);
        });
    }

    let sink = build_sink(cli.volume_sink, &settings, cli.initial_volume);
    let boundary = cli.boundary_events.as_ref().map(JsonLinesBoundarySource::new);
    let stdin_is_events = boundary.as_ref().map_or(false, |b| b.is_stdin());
    let registry = boundary.as_ref().map(|_| BoundaryRegistry::new());

    let mut session = MonitoringSession::new(
        settings.clone(),
        sink,
        Arc::new(MicrophoneSource::default()),
        registry.clone()
    );
    if let Some(path) = &cli.history_csv {
        session = session
            .with_history_csv(path)
            .with_context(|| format!("opening history CSV {}", path.display()))?;
    }
    let decisions = session.decisions();
    let mode = session.start().context("starting monitoring")?;
    println!("monitoring in {mode} mode, Ctrl+C to quit");

    // listener is registered now, events can flow
    if let (Some(source), Some(registry)) = (boundary, registry) {
        source.spawn(registry).context("starting boundary event source")?;
    }

    let mut commands = if stdin_is_events {
        crossbeam_channel::never()
    } else {
        print_help();
        spawn_console()?
    };

    let status_tick = tick(STATUS_LOG_INTERVAL);
    while !quit.load(Ordering::SeqCst) {
        let mut console_closed = false;
        select! {
            recv(commands) -> msg => match msg {
                Ok(Ok(cmd)) => {
                    if !handle(cmd, &session, &settings) {
                        break;
                    }
                }
                Ok(Err(e)) => println!("{e}"),
                // stdin closed; keep monitoring until Ctrl+C
                Err(_) => console_closed = true,
            },
            recv(decisions) -> msg => {
                if let Ok(outcome) = msg {
                    print_outcome(&outcome);
                }
            }
            recv(status_tick) -> _ => {
                let snap = session.snapshot();
                info!(
                    "status: {} | level {:.1} dB, rolling ambient {:.1} dB, {:?}",
                    snap.status_text,
                    snap.level_db.unwrap_or(0.0),
                    snap.rolling_ambient_db,
                    snap.gap_state
                );
            }
            default(Duration::from_millis(200)) => {}
        }
        if console_closed {
            commands = crossbeam_channel::never();
        }
    }

    if session.is_running() {
        session.stop()?;
    }
    info!("bye");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_console_commands() {
        assert_eq!(parse_command("status"), Ok(Command::Status));
        assert_eq!(parse_command("  QUIT "), Ok(Command::Quit));
        assert_eq!(
            parse_command("set drop-db 12"),
            Ok(Command::Set("drop-db".into(), "12".into()))
        );
        assert!(parse_command("set drop-db").is_err());
        assert!(parse_command("louder").is_err());
    }
}
