use crate::exchange::{ExchangeConfig, ResponseFormat};
use crate::history::History;
use crate::http::HttpTransport;
use crate::markup::sanitize_text;
use crate::renderer::RenderMode;
use crate::settings::{IniFile, INI_ENDPOINT_URL, INI_MODEL_NAME};
use crate::terminal;

use anyhow::{bail, Context, Result};
use colored::*;
use rustyline::{error::ReadlineError, DefaultEditor};
use std::io::{self, Write};
use std::str::FromStr;
use tracing::warn;

/// A line ending in this character continues on the next one.
const CONTINUATION: char = '\\';

/// The settings file and profile that `!endpoint` and `!model` write to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsLocation {
    pub file: String,
    pub profile: String,
}

pub struct Repl {
    editor: DefaultEditor,
    transport: HttpTransport,
    config: ExchangeConfig,
    history: History,
    settings: SettingsLocation,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Prompt(String),
    Special(SpecialCommand),
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Show,
    Set(String),
    Remove,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SpecialCommand {
    Help,
    Exit,
    Clear,
    ShowHistory,
    ClearHistory,
    Retry,
    Endpoint(Change),
    Model(Change),
    Mode(Option<RenderMode>),
    Format(Option<ResponseFormat>),
    Preview(String),
    Settings,
    Debug,
}

enum Flow {
    Continue,
    Exit,
}

pub fn parse_command(input: &str) -> Result<Command> {
    let line = input.trim();
    if line.is_empty() {
        return Ok(Command::Empty);
    }

    if line.starts_with('!') {
        return Ok(Command::Special(parse_special_command(line)?));
    }

    Ok(Command::Prompt(line.to_string()))
}

fn parse_special_command(line: &str) -> Result<SpecialCommand> {
    let (name, arg) = match line.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (line, ""),
    };

    let cmd = match name {
        "!help" | "!h" => SpecialCommand::Help,
        "!exit" | "!quit" | "!q" => SpecialCommand::Exit,
        "!clear" | "!c" => SpecialCommand::Clear,
        "!history" => match arg {
            "" => SpecialCommand::ShowHistory,
            "clear" => SpecialCommand::ClearHistory,
            _ => bail!("Usage: !history [clear]"),
        },
        "!retry" | "!r" => SpecialCommand::Retry,
        "!endpoint" => SpecialCommand::Endpoint(parse_change(arg)),
        "!model" => SpecialCommand::Model(parse_change(arg)),
        "!mode" => SpecialCommand::Mode(parse_optional(arg)?),
        "!format" => SpecialCommand::Format(parse_optional(arg)?),
        "!preview" => {
            if arg.is_empty() {
                bail!("Usage: !preview <path>");
            }
            SpecialCommand::Preview(arg.to_string())
        }
        "!settings" => SpecialCommand::Settings,
        "!debug" | "!d" => SpecialCommand::Debug,
        _ => bail!("Unknown command: {name}"),
    };
    Ok(cmd)
}

fn parse_change(arg: &str) -> Change {
    match arg {
        "" => Change::Show,
        "-" => Change::Remove,
        value => Change::Set(value.to_string()),
    }
}

fn parse_optional<T: FromStr<Err = String>>(arg: &str) -> Result<Option<T>> {
    if arg.is_empty() {
        return Ok(None);
    }
    arg.parse::<T>().map(Some).map_err(anyhow::Error::msg)
}

/// Shows, stores or removes one persisted setting and keeps the session in step.
fn apply_change(
    slot: &mut Option<String>,
    location: &SettingsLocation,
    key: &str,
    change: Change,
) -> Result<()> {
    match change {
        Change::Show => {
            println!("{}: {}", key.cyan(), slot.as_deref().unwrap_or("(not set)"));
        }
        Change::Set(value) => {
            IniFile::set_value(&location.file, &location.profile, key, Some(&value))?;
            println!("{}: {} -> {}", "Saved".green(), key.cyan(), value);
            *slot = Some(value);
        }
        Change::Remove => {
            IniFile::set_value(&location.file, &location.profile, key, None)?;
            println!("{}: {}", "Removed".green(), key.cyan());
            *slot = None;
        }
    }
    Ok(())
}

impl Repl {
    pub fn new(
        transport: HttpTransport,
        config: ExchangeConfig,
        history: History,
        settings: SettingsLocation,
    ) -> Result<Self> {
        let mut editor = DefaultEditor::new().context("Failed to create line editor")?;
        for entry in history.entries() {
            let _ = editor.add_history_entry(entry.as_str());
        }

        Ok(Self {
            editor,
            transport,
            config,
            history,
            settings,
        })
    }

    pub async fn run(&mut self) -> Result<()> {
        self.print_welcome();

        while let Some(input) = self.read_input()? {
            let outcome = match parse_command(&input) {
                Ok(Command::Prompt(prompt)) => self.send(&prompt).await.map(|_| Flow::Continue),
                Ok(Command::Special(cmd)) => self.handle_special_command(cmd).await,
                Ok(Command::Empty) => Ok(Flow::Continue),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit) => break,
                Err(e) => eprintln!("{}: {:#}", "Error".red().bold(), e),
            }
        }

        println!("{}", "Goodbye!".green());
        Ok(())
    }

    fn print_welcome(&self) {
        println!("{}", "promptline interactive chat".green().bold());
        println!(
            "Type a prompt and press {}. End a line with {} to continue it.",
            "Enter".yellow(),
            "\\".yellow()
        );
        println!(
            "Type {} for commands, {} to exit. {} stops an answer.",
            "!help".cyan(),
            "!exit".cyan(),
            "Ctrl+C".cyan()
        );
        println!();
    }

    /// One prompt or command, joined across continuation lines. `None` at end of input.
    fn read_input(&mut self) -> Result<Option<String>> {
        let mut input = String::new();
        let mut prompt = format!("{} ", "you>".green().bold());

        loop {
            let Some(line) = self.read_line(&prompt)? else {
                return Ok((!input.is_empty()).then_some(input));
            };

            match line.trim_end().strip_suffix(CONTINUATION) {
                Some(head) => {
                    input.push_str(head);
                    input.push('\n');
                    prompt = format!("{} ", "...".dimmed());
                }
                None => {
                    input.push_str(&line);
                    return Ok(Some(input));
                }
            }
        }
    }

    fn read_line(&mut self, prompt: &str) -> Result<Option<String>> {
        match self.editor.readline(prompt) {
            Ok(line) => Ok(Some(line)),
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => Ok(None),
            Err(e) => bail!("Failed to read input: {e}"),
        }
    }

    async fn send(&mut self, prompt: &str) -> Result<()> {
        let state = terminal::ask(&self.transport, &self.config, prompt)
            .await
            .context("Failed to write the answer")?;
        if state.is_none() {
            return Ok(());
        }

        let _ = self.editor.add_history_entry(prompt);
        if let Err(e) = self.history.push(prompt) {
            warn!("{e:#}");
        }
        Ok(())
    }

    async fn handle_special_command(&mut self, cmd: SpecialCommand) -> Result<Flow> {
        match cmd {
            SpecialCommand::Help => {
                self.print_help();
            }
            SpecialCommand::Exit => {
                return Ok(Flow::Exit);
            }
            SpecialCommand::Clear => {
                print!("\x1B[2J\x1B[1;1H");
                io::stdout().flush()?;
            }
            SpecialCommand::ShowHistory => {
                if self.history.is_empty() {
                    println!("{}", "No prompts yet.".yellow());
                }
                for (i, entry) in self.history.entries().enumerate() {
                    println!("{:>3}  {}", (i + 1).to_string().dimmed(), entry);
                }
            }
            SpecialCommand::ClearHistory => {
                self.history.clear()?;
                self.editor.clear_history()?;
                println!("{}", "History cleared.".green());
            }
            SpecialCommand::Retry => {
                let Some(last) = self.history.last().cloned() else {
                    bail!("Nothing to retry yet");
                };
                println!("{} {}", "you>".green().bold(), last);
                self.send(&last).await?;
            }
            SpecialCommand::Endpoint(change) => {
                apply_change(
                    &mut self.config.endpoint_url,
                    &self.settings,
                    INI_ENDPOINT_URL,
                    change,
                )?;
            }
            SpecialCommand::Model(change) => {
                apply_change(
                    &mut self.config.model_name,
                    &self.settings,
                    INI_MODEL_NAME,
                    change,
                )?;
            }
            SpecialCommand::Mode(mode) => {
                if let Some(mode) = mode {
                    self.config.render.mode = mode;
                }
                println!("{}: {}", "mode".cyan(), self.config.render.mode);
            }
            SpecialCommand::Format(format) => {
                if let Some(format) = format {
                    self.config.format = format;
                }
                println!("{}: {}", "format".cyan(), self.config.format);
            }
            SpecialCommand::Preview(path) => {
                let Some(text) = terminal::interruptible(self.transport.preview(&path)).await else {
                    println!("{}", "[cancelled]".dimmed());
                    return Ok(Flow::Continue);
                };
                let text = text?;
                print!("{}", sanitize_text(&text));
                if !text.ends_with('\n') {
                    println!();
                }
            }
            SpecialCommand::Settings => {
                self.print_settings();
            }
            SpecialCommand::Debug => {
                self.config.render.debug = !self.config.render.debug;
                let status = if self.config.render.debug {
                    "enabled"
                } else {
                    "disabled"
                };
                println!("{}: Debug mode {}", "Info".cyan(), status.yellow());
            }
        }
        Ok(Flow::Continue)
    }

    fn print_settings(&self) {
        let unset = || "(not set)".to_string();
        let rows = [
            ("profile", self.settings.profile.clone()),
            ("settings file", self.settings.file.clone()),
            ("prompt url", self.transport.prompt_url().to_string()),
            ("endpoint", self.config.endpoint_url.clone().unwrap_or_else(unset)),
            ("model", self.config.model_name.clone().unwrap_or_else(unset)),
            ("mode", self.config.render.mode.to_string()),
            ("format", self.config.format.to_string()),
            ("debug", self.config.render.debug.to_string()),
            (
                "history",
                self.history
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(memory only)".to_string()),
            ),
        ];
        for (name, value) in rows {
            println!("  {:<14} {}", name.cyan(), value);
        }
    }

    fn print_help(&self) {
        println!("{}", "promptline Interactive Mode Help".green().bold());
        println!();
        println!("{}", "Prompts:".cyan().bold());
        println!("  Any line not starting with {} is sent as a prompt.", "!".yellow());
        println!("  End a line with {} to continue the prompt on the next line.", "\\".yellow());
        println!("  {} while an answer streams stops it.", "Ctrl+C".yellow());
        println!();
        println!("{}", "Special Commands:".cyan().bold());
        println!("  {}                   - Show this help", "!help".yellow());
        println!("  {}                   - Exit promptline", "!exit".yellow());
        println!("  {}                  - Clear screen", "!clear".yellow());
        println!("  {} [{}]       - List or clear past prompts", "!history".yellow(), "clear".blue());
        println!("  {}                  - Send the last prompt again", "!retry".yellow());
        println!("  {} [{}|-]     - Show, save or remove the LLM API URL", "!endpoint".yellow(), "url".blue());
        println!("  {} [{}|-]       - Show, save or remove the model name", "!model".yellow(), "name".blue());
        println!("  {} [{}]  - Show or switch the answer rendering", "!mode".yellow(), "text|markup".blue());
        println!("  {} [{}] - Show or switch the response format", "!format".yellow(), "auto|json|stream".blue());
        println!("  {} {}         - Show a file through the server", "!preview".yellow(), "path".blue());
        println!("  {}               - Show the current settings", "!settings".yellow());
        println!("  {}                  - Toggle debug mode", "!debug".yellow());
        println!();
    }
}
