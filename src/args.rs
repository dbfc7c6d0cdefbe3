use crate::exchange::ResponseFormat;
use crate::renderer::{RenderMode, DEFAULT_COMPLETE_MARKER};
use crate::settings::{Profile, DEFAULT_INI_FILE_PATH, DEFAULT_INI_SECTION};

use anyhow::{bail, Result};
pub use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct CommandLineArgs {
    #[clap(help = "prompt to send (omit to start an interactive chat)")]
    prompt: Option<String>,
    #[clap(short = 'p', long, default_value = DEFAULT_INI_SECTION, help = "profile name")]
    profile: String,
    #[clap(short = 'c', long, default_value = DEFAULT_INI_FILE_PATH, help = "settings file")]
    config: String,
    #[clap(short = 's', long, help = "chat server base URL")]
    server: Option<String>,
    #[clap(long, help = "path of the prompt endpoint on the server")]
    path: Option<String>,
    #[clap(short = 'e', long = "api-url", help = "LLM API URL forwarded to the server")]
    endpoint_url: Option<String>,
    #[clap(short = 'm', long = "model", help = "model name forwarded to the server")]
    model_name: Option<String>,
    #[clap(long, help = "render answers as 'text' or 'markup'")]
    mode: Option<RenderMode>,
    #[clap(long, help = "response format: auto, json or stream")]
    format: Option<ResponseFormat>,
    #[clap(long, help = "text shown until the first part of the answer arrives")]
    placeholder: Option<String>,
    #[clap(long, help = "do not show a placeholder")]
    no_placeholder: bool,
    #[clap(long, default_value = DEFAULT_COMPLETE_MARKER, help = "line printed after a complete answer")]
    marker: String,
    #[clap(short = 'u', long, help = "username for basic authentication")]
    user: Option<String>,
    #[clap(short = 'w', long, help = "password for basic authentication")]
    password: Option<String>,
    #[clap(short = 'r', long, help = "CA certificate PEM file path")]
    ca_cert: Option<String>,
    #[clap(
        short = 'k',
        long,
        help = "Allow insecure server connections when using SSL"
    )]
    insecure: bool,
    #[clap(short = 't', long, help = "request timeout in seconds")]
    timeout: Option<u64>,
    #[clap(
        short = 'H',
        long = "header",
        help = "HTTP header to send with every request (\"Name: value\")"
    )]
    headers: Vec<String>,
    #[clap(long, help = "store --api-url and --model in the profile")]
    save: bool,
    #[clap(long, help = "create or update the profile interactively")]
    init: bool,
    #[clap(long, value_name = "FILE", help = "show a file through the server's preview endpoint")]
    preview: Option<String>,
    #[clap(short = 'd', long, help = "print debug logs to stderr")]
    debug: bool,
}

impl CommandLineArgs {
    pub fn get() -> Self {
        CommandLineArgs::parse()
    }

    pub fn prompt(&self) -> Option<&String> {
        self.prompt.as_ref()
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn config(&self) -> &str {
        &self.config
    }

    pub fn endpoint_url(&self) -> Option<&String> {
        self.endpoint_url.as_ref()
    }

    pub fn model_name(&self) -> Option<&String> {
        self.model_name.as_ref()
    }

    pub fn no_placeholder(&self) -> bool {
        self.no_placeholder
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn save(&self) -> bool {
        self.save
    }

    pub fn init(&self) -> bool {
        self.init
    }

    pub fn preview(&self) -> Option<&String> {
        self.preview.as_ref()
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    /// The settings given on the command line, to be laid over the stored profile.
    pub fn overrides(&self) -> Result<Profile> {
        let mut profile = Profile::default();
        profile
            .set_server(self.server.clone())
            .set_path(self.path.clone())
            .set_endpoint_url(self.endpoint_url.clone())
            .set_model_name(self.model_name.clone())
            .set_mode(self.mode)
            .set_format(self.format)
            .set_placeholder(self.placeholder.clone())
            .set_user(self.user.clone())
            .set_password(self.password.clone())
            .set_ca_cert(self.ca_cert.clone())
            .set_insecure(self.insecure.then_some(true))
            .set_timeout_secs(self.timeout);

        for header in &self.headers {
            let Some((name, value)) = header.split_once(':') else {
                bail!("Invalid header '{header}', expected \"Name: value\"");
            };
            let name = name.trim();
            if name.is_empty() {
                bail!("Invalid header '{header}', the name is empty");
            }
            profile.set_header(name, value.trim());
        }

        Ok(profile)
    }
}
