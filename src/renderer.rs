use crate::decoder::StreamDecoder;
use crate::error::ExchangeError;
use crate::markup::{sanitize_text, MarkupFilter};

use std::fmt::{self, Display, Formatter};
use std::io;
use std::str::FromStr;
use tracing::{debug, warn};

pub const DEFAULT_PLACEHOLDER: &str = "thinking…";
pub const DEFAULT_COMPLETE_MARKER: &str = "[response complete]";

/// The sink one answer is rendered into, e.g. one message bubble.
pub trait DisplayTarget {
    fn show_placeholder(&mut self, text: &str) -> io::Result<()>;
    fn clear_placeholder(&mut self) -> io::Result<()>;
    fn append(&mut self, text: &str) -> io::Result<()>;
    fn mark_complete(&mut self, marker: &str) -> io::Result<()>;
    fn mark_failed(&mut self, message: &str) -> io::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeState {
    Pending,
    Streaming(String),
    Complete(String),
    Failed(String),
    Cancelled,
}

impl ExchangeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExchangeState::Complete(_) | ExchangeState::Failed(_) | ExchangeState::Cancelled
        )
    }

    fn name(&self) -> &'static str {
        match self {
            ExchangeState::Pending => "pending",
            ExchangeState::Streaming(_) => "streaming",
            ExchangeState::Complete(_) => "complete",
            ExchangeState::Failed(_) => "failed",
            ExchangeState::Cancelled => "cancelled",
        }
    }
}

/// How decoded text reaches the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderMode {
    /// Literal text. Only terminal control characters are neutralised.
    #[default]
    Text,
    /// HTML is parsed and rendered as terminal text. Use only with a trusted backend.
    Markup,
}

impl FromStr for RenderMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "text" => Ok(RenderMode::Text),
            "markup" | "html" => Ok(RenderMode::Markup),
            other => Err(format!("unknown render mode '{other}' (expected text or markup)")),
        }
    }
}

impl Display for RenderMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RenderMode::Text => write!(f, "text"),
            RenderMode::Markup => write!(f, "markup"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOptions {
    pub mode: RenderMode,
    pub placeholder: Option<String>,
    pub complete_marker: String,
    pub debug: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        RenderOptions {
            mode: RenderMode::Text,
            placeholder: Some(DEFAULT_PLACEHOLDER.to_string()),
            complete_marker: DEFAULT_COMPLETE_MARKER.to_string(),
            debug: false,
        }
    }
}

enum Presenter {
    Text,
    Markup(MarkupFilter),
}

impl Presenter {
    fn new(mode: RenderMode) -> Self {
        match mode {
            RenderMode::Text => Presenter::Text,
            RenderMode::Markup => Presenter::Markup(MarkupFilter::new()),
        }
    }

    fn present(&mut self, text: &str) -> String {
        match self {
            Presenter::Text => sanitize_text(text).into_owned(),
            Presenter::Markup(filter) => sanitize_text(&filter.push(text)).into_owned(),
        }
    }

    fn finish(&mut self) -> String {
        match self {
            Presenter::Text => String::new(),
            Presenter::Markup(filter) => sanitize_text(&filter.finish()).into_owned(),
        }
    }
}

/// Renders one response into one [`DisplayTarget`] as its bytes arrive.
///
/// The state only moves forward. Once `Complete`, `Failed` or `Cancelled` is reached every
/// further call returns `Ok(false)` and the target is not touched again.
pub struct StreamRenderer<T: DisplayTarget> {
    target: T,
    state: ExchangeState,
    decoder: StreamDecoder,
    presenter: Presenter,
    options: RenderOptions,
    placeholder_shown: bool,
}

impl<T: DisplayTarget> StreamRenderer<T> {
    /// Creates a pending renderer, showing the placeholder if one is configured.
    pub fn begin(target: T, options: RenderOptions) -> io::Result<Self> {
        Self::with_decoder(target, options, StreamDecoder::utf8())
    }

    pub fn with_decoder(
        mut target: T,
        options: RenderOptions,
        decoder: StreamDecoder,
    ) -> io::Result<Self> {
        let placeholder_shown = match &options.placeholder {
            Some(text) => {
                target.show_placeholder(text)?;
                true
            }
            None => false,
        };

        Ok(StreamRenderer {
            target,
            state: ExchangeState::Pending,
            decoder,
            presenter: Presenter::new(options.mode),
            options,
            placeholder_shown,
        })
    }

    /// Swaps the charset decoder. Only allowed before any bytes were decoded.
    pub fn set_decoder(&mut self, decoder: StreamDecoder) -> bool {
        if self.state != ExchangeState::Pending {
            return false;
        }
        self.decoder = decoder;
        true
    }

    pub fn state(&self) -> &ExchangeState {
        &self.state
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn into_target(self) -> T {
        self.target
    }

    pub fn on_chunk(&mut self, raw: &[u8]) -> io::Result<bool> {
        if self.state.is_terminal() {
            if self.options.debug {
                debug!(state = self.state.name(), "chunk after exchange ended, ignored");
            }
            return Ok(false);
        }

        let text = self.decoder.decode(raw);
        if text.is_empty() {
            return Ok(true);
        }

        self.clear_placeholder()?;
        let shown = self.presenter.present(&text);
        if !shown.is_empty() {
            self.target.append(&shown)?;
        }

        match &mut self.state {
            ExchangeState::Streaming(partial) => partial.push_str(&text),
            _ => {
                debug!("first chunk received, streaming");
                self.state = ExchangeState::Streaming(text);
            }
        }
        Ok(true)
    }

    pub fn on_complete(&mut self) -> io::Result<bool> {
        if self.state.is_terminal() {
            return Ok(false);
        }

        let tail = self.decoder.finish();
        if self.decoder.had_replacements() {
            warn!(
                encoding = self.decoder.encoding().name(),
                "response contained malformed bytes, substituted"
            );
        }

        let mut text = match std::mem::replace(&mut self.state, ExchangeState::Cancelled) {
            ExchangeState::Streaming(partial) => partial,
            _ => String::new(),
        };
        text.push_str(&tail);
        self.state = ExchangeState::Complete(text);

        let mut shown = self.presenter.present(&tail);
        shown.push_str(&self.presenter.finish());

        self.clear_placeholder()?;
        if !shown.is_empty() {
            self.target.append(&shown)?;
        }
        self.target.mark_complete(&self.options.complete_marker)?;
        debug!("exchange complete");
        Ok(true)
    }

    pub fn on_error(&mut self, err: &ExchangeError) -> io::Result<bool> {
        if self.state.is_terminal() {
            return Ok(false);
        }

        let message = err.to_string();
        debug!(error = %message, from = self.state.name(), "exchange failed");
        self.state = ExchangeState::Failed(message.clone());
        self.clear_placeholder()?;
        self.target.mark_failed(&message)?;
        Ok(true)
    }

    /// Stops the exchange without writing anything further. Safe to call at any time.
    pub fn cancel(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        debug!(from = self.state.name(), "exchange cancelled");
        self.state = ExchangeState::Cancelled;
        true
    }

    fn clear_placeholder(&mut self) -> io::Result<()> {
        if self.placeholder_shown {
            self.placeholder_shown = false;
            self.target.clear_placeholder()?;
        }
        Ok(())
    }
}
