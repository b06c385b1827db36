//! Command-line interface and REPL
//!
//! Runs on a blocking thread; async registry calls go through the runtime
//! handle.

use anyhow::Result;
use colored::*;
use parking_lot::RwLock;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::sync::Arc;
use tokio::runtime::Handle;

use crate::actions::Action;
use crate::switcher::{ConnectionRegistry, ConnectionState};

/// Actions currently configured, replaced on config reload
pub type SharedActions = Arc<RwLock<Vec<Action>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    Caps(String),
    Press(String),
    Reconnect(String),
    Release(String),
    Help,
    Exit,
}

impl Command {
    pub fn parse(line: &str) -> Result<Command, String> {
        let mut words = line.split_whitespace();
        let verb = words.next().unwrap_or_default();
        let arg = words.next().map(str::to_string);

        let needs = |arg: Option<String>, what: &str| {
            arg.ok_or_else(|| format!("Usage: {} <{}>", verb, what))
        };

        match verb {
            "status" | "st" => Ok(Command::Status),
            "caps" => needs(arg, "address").map(Command::Caps),
            "press" | "p" => needs(arg, "action").map(Command::Press),
            "reconnect" => needs(arg, "address").map(Command::Reconnect),
            "release" => needs(arg, "address").map(Command::Release),
            "help" | "?" => Ok(Command::Help),
            "exit" | "quit" => Ok(Command::Exit),
            other => Err(format!("Unknown command '{}', type 'help'", other)),
        }
    }
}

pub struct Repl {
    registry: Arc<ConnectionRegistry>,
    actions: SharedActions,
    runtime: Handle,
}

impl Repl {
    pub fn new(registry: Arc<ConnectionRegistry>, actions: SharedActions, runtime: Handle) -> Self {
        Self {
            registry,
            actions,
            runtime,
        }
    }

    /// Read-eval loop. Returns on `exit`, Ctrl-C or Ctrl-D.
    pub fn run(&self) -> Result<()> {
        let mut rl = DefaultEditor::new()?;
        println!("{}", "=== ATEM GW ===".bold().cyan());
        println!("Type 'help' for commands\n");

        loop {
            match rl.readline("atem> ") {
                Ok(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let _ = rl.add_history_entry(line);
                    match Command::parse(line) {
                        Ok(Command::Exit) => break,
                        Ok(command) => self.execute(command),
                        Err(message) => println!("{}", message.yellow()),
                    }
                },
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn execute(&self, command: Command) {
        match command {
            Command::Status => self.print_status(),
            Command::Caps(address) => self.print_caps(&address),
            Command::Press(name) => {
                let action = self.actions.read().iter().find(|a| a.name() == name).cloned();
                match action {
                    Some(action) => {
                        if action.press() {
                            println!("{} {}", "✓".green(), name);
                        } else {
                            println!("{} {} (see log)", "✗".red(), name);
                        }
                    },
                    None => println!("{}", format!("No action named '{}'", name).yellow()),
                }
            },
            Command::Reconnect(address) => {
                let connection = self.registry.get_or_create(&address);
                connection.reset_retries();
                let ok = self.runtime.block_on(connection.reconnect());
                if ok {
                    println!("{} {} connected", "✓".green(), address);
                } else {
                    println!("{} {} still disconnected", "✗".red(), address);
                }
            },
            Command::Release(address) => {
                self.runtime.block_on(self.registry.release(&address));
                println!("Released {}", address);
            },
            Command::Help => print_help(),
            Command::Exit => {},
        }
    }

    fn print_status(&self) {
        println!("\n{}", "Switchers:".bold());
        let addresses = self.registry.addresses();
        if addresses.is_empty() {
            println!("  {}", "none".dimmed());
        }
        for address in addresses {
            let Some(connection) = self.registry.get(&address) else {
                continue;
            };
            let state = match connection.state() {
                ConnectionState::Connected => "connected".green(),
                ConnectionState::Connecting => "connecting".yellow(),
                ConnectionState::Disconnected => "disconnected".red(),
            };
            println!(
                "  {:<18} {:<14} retries {} idle {}s",
                address,
                state,
                connection.retry_count(),
                connection.idle_for().as_secs()
            );
            let switcher = self.registry.switcher_state(&address);
            for index in switcher.indices() {
                let me = switcher.mix_effect_state(index);
                println!(
                    "    ME {}: program {} preview {}{}",
                    index,
                    me.program_input.to_string().red(),
                    me.preview_input.to_string().green(),
                    if me.in_transition { " (in transition)" } else { "" }
                );
            }
        }

        println!("\n{}", "Actions:".bold());
        let actions = self.actions.read();
        if actions.is_empty() {
            println!("  {}", "none".dimmed());
        }
        for action in actions.iter() {
            let indicator = action
                .indicator()
                .map(|i| i.colored())
                .unwrap_or_else(|| "-".dimmed());
            println!("  {:<20} {:<16} {}", action.name(), action.address(), indicator);
        }
        println!();
    }

    fn print_caps(&self, address: &str) {
        match self.registry.capability_report(address) {
            Some(report) => match report.to_json() {
                Ok(json) => println!("{}", json),
                Err(e) => println!("{}", format!("Failed to render report: {}", e).red()),
            },
            None => println!("{}", format!("No capability data for {}", address).yellow()),
        }
    }
}

fn print_help() {
    println!("\n{}", "Commands:".bold());
    println!("  status               Connections, cached state and indicators");
    println!("  caps <address>       Capability report as JSON");
    println!("  press <action>       Press a configured action");
    println!("  reconnect <address>  Reset retries and reconnect now");
    println!("  release <address>    Drop the connection and its cached state");
    println!("  exit                 Quit\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("status"), Ok(Command::Status));
        assert_eq!(
            Command::parse("press  cam1-preview"),
            Ok(Command::Press("cam1-preview".to_string()))
        );
        assert_eq!(
            Command::parse("caps 10.0.0.1"),
            Ok(Command::Caps("10.0.0.1".to_string()))
        );
        assert_eq!(Command::parse("quit"), Ok(Command::Exit));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            Command::parse("release"),
            Err("Usage: release <address>".to_string())
        );
        assert!(Command::parse("fade 3").is_err());
    }
}
