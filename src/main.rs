mod args;
mod decoder;
mod error;
mod exchange;
mod history;
mod http;
mod markup;
mod renderer;
mod repl;
mod settings;
mod stdio;
mod terminal;

use args::CommandLineArgs;
use exchange::ExchangeConfig;
use history::{History, DEFAULT_HISTORY_FILE_PATH, DEFAULT_HISTORY_SIZE};
use http::{HttpConnectionProfile, HttpTransport, DEFAULT_PROMPT_PATH, DEFAULT_SERVER};
use renderer::{ExchangeState, RenderOptions, DEFAULT_PLACEHOLDER};
use repl::{Repl, SettingsLocation};
use settings::{IniFile, Profile, DEFAULT_INI_SECTION, INI_ENDPOINT_URL, INI_MODEL_NAME};
use stdio::{ask_binary, ask_path, ask_string, read_stdin};

use anyhow::{bail, Result};
use colored::*;
use std::io::{self, IsTerminal};
use std::process::ExitCode;
use tracing::{debug, warn};
use tracing_subscriber::{fmt::time::ChronoLocal, EnvFilter};

const EXIT_CANCELLED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let args = CommandLineArgs::get();
    init_logging(args.debug());

    match run(&args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}: {:#}", "Error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(debug: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if debug { "promptline=debug,warn" } else { "warn" })
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::rfc_3339())
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

async fn run(args: &CommandLineArgs) -> Result<ExitCode> {
    if args.init() {
        init_profile(args)?;
        return Ok(ExitCode::SUCCESS);
    }

    let profile = load_profile(args)?;
    if args.save() {
        save_overrides(args)?;
    }

    let transport = HttpTransport::new(&profile)?;
    debug!(url = %transport.prompt_url(), profile = args.profile(), "transport ready");

    if let Some(path) = args.preview() {
        let text = transport.preview(path).await?;
        print!("{}", markup::sanitize_text(&text));
        return Ok(ExitCode::SUCCESS);
    }

    let prompt = match args.prompt() {
        Some(prompt) => Some(prompt.clone()),
        None if !io::stdin().is_terminal() => {
            Some(read_stdin(&mut io::stdin())?.unwrap_or_default())
        }
        None => None,
    };

    let config = exchange_config(&profile, args, io::stdout().is_terminal());
    match prompt {
        Some(prompt) => one_shot(&transport, &config, &prompt).await,
        None => {
            let size = profile.history_size().unwrap_or(DEFAULT_HISTORY_SIZE);
            let history = History::open(DEFAULT_HISTORY_FILE_PATH, size);
            let location = SettingsLocation {
                file: args.config().to_string(),
                profile: args.profile().to_string(),
            };
            Repl::new(transport, config, history, location)?.run().await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn one_shot(transport: &HttpTransport, config: &ExchangeConfig, prompt: &str) -> Result<ExitCode> {
    let code = match terminal::ask(transport, config, prompt).await? {
        None => {
            eprintln!("{}: the prompt is empty, nothing was sent", "Warning".yellow());
            ExitCode::SUCCESS
        }
        Some(ExchangeState::Complete(_)) => ExitCode::SUCCESS,
        Some(ExchangeState::Cancelled) => ExitCode::from(EXIT_CANCELLED),
        Some(_) => ExitCode::FAILURE,
    };
    Ok(code)
}

/// Stored profile with the command line laid over it and built-in defaults under both.
fn load_profile(args: &CommandLineArgs) -> Result<Profile> {
    let stored = IniFile::load_profile(args.config(), args.profile())?;
    let mut profile = match stored {
        Some(p) => p,
        None if args.profile() == DEFAULT_INI_SECTION => {
            debug!(file = args.config(), "no default profile, using built-in settings");
            Profile::default()
        }
        None => bail!(
            "Profile '{}' not found in {}. Run with --init to create it.",
            args.profile(),
            args.config()
        ),
    };

    profile.merge(&args.overrides()?);
    if profile.server().is_none() {
        profile.set_server(Some(DEFAULT_SERVER.to_string()));
    }
    Ok(profile)
}

fn exchange_config(profile: &Profile, args: &CommandLineArgs, on_terminal: bool) -> ExchangeConfig {
    let placeholder = if args.no_placeholder() || !on_terminal {
        None
    } else {
        Some(
            profile
                .placeholder()
                .cloned()
                .unwrap_or_else(|| DEFAULT_PLACEHOLDER.to_string()),
        )
    };

    ExchangeConfig {
        endpoint_url: profile.endpoint_url().cloned(),
        model_name: profile.model_name().cloned(),
        render: RenderOptions {
            mode: profile.mode().unwrap_or_default(),
            placeholder,
            complete_marker: args.marker().to_string(),
            debug: args.debug(),
        },
        format: profile.format().unwrap_or_default(),
    }
}

fn save_overrides(args: &CommandLineArgs) -> Result<()> {
    let updates = [
        (INI_ENDPOINT_URL, args.endpoint_url()),
        (INI_MODEL_NAME, args.model_name()),
    ];
    if updates.iter().all(|(_, value)| value.is_none()) {
        warn!("--save given without --api-url or --model, nothing stored");
        return Ok(());
    }

    for (key, value) in updates {
        if let Some(value) = value {
            IniFile::set_value(args.config(), args.profile(), key, Some(value))?;
            eprintln!("{}: {} = {}", "Saved".green(), key, value);
        }
    }
    Ok(())
}

fn init_profile(args: &CommandLineArgs) -> Result<()> {
    let (file, name) = (args.config(), args.profile());
    let action = if IniFile::profile_exists(file, name)? {
        "Updating"
    } else {
        "Creating"
    };
    let mut profile = IniFile::load_profile(file, name)?.unwrap_or_default();
    profile.merge(&args.overrides()?);

    eprintln!("{action} profile '{name}' in {file}. Press Enter to keep the value in brackets.");
    let stdin = io::stdin();
    let mut input = stdin.lock();

    let server = profile.server().map(String::as_str).unwrap_or(DEFAULT_SERVER);
    let server = ask_string(&mut input, "server", Some(server))?;
    let path = profile.prompt_path().map(String::as_str).unwrap_or(DEFAULT_PROMPT_PATH);
    let path = ask_string(&mut input, "prompt path", Some(path))?;
    let endpoint_url = ask_string(
        &mut input,
        "LLM API URL",
        profile.endpoint_url().map(String::as_str),
    )?;
    let model_name = ask_string(&mut input, "model", profile.model_name().map(String::as_str))?;
    let user = ask_string(&mut input, "user", profile.user().map(String::as_str))?;
    let password = match &user {
        Some(_) => ask_string(&mut input, "password", profile.password().map(String::as_str))?,
        None => None,
    };
    let insecure = ask_binary(&mut input, "accept invalid certificates")?;
    let ca_cert = if insecure {
        None
    } else {
        ask_path(&mut input, "CA certificate (empty to keep current)")?
            .or_else(|| profile.ca_cert().cloned())
    };

    profile
        .set_server(server)
        .set_path(path)
        .set_endpoint_url(endpoint_url)
        .set_model_name(model_name)
        .set_user(user)
        .set_password(password)
        .set_insecure(insecure.then_some(true))
        .set_ca_cert(ca_cert);

    IniFile::save_profile(file, name, &profile)?;
    eprintln!("{}: profile '{}' written to {}", "Saved".green(), name, file);
    Ok(())
}
