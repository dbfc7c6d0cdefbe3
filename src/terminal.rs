use crate::exchange::{self, CancelHandle, ExchangeConfig, Transport};
use crate::renderer::{DisplayTarget, ExchangeState};

use colored::*;
use std::future::{self, Future};
use std::io::{self, Write};
use tracing::debug;

const ERASE_LINE: &str = "\r\x1b[2K";

/// Renders one answer into a terminal (or anything else that implements `Write`).
pub struct TerminalTarget<W: Write> {
    out: W,
    at_line_start: bool,
    placeholder_shown: bool,
}

impl TerminalTarget<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> TerminalTarget<W> {
    pub fn new(out: W) -> Self {
        TerminalTarget {
            out,
            at_line_start: true,
            placeholder_shown: false,
        }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }

    /// Written by the host after an exchange was abandoned.
    pub fn mark_cancelled(&mut self) -> io::Result<()> {
        if self.placeholder_shown {
            self.clear_placeholder()?;
        }
        self.finish_line()?;
        writeln!(self.out, "{}", "[cancelled]".dimmed())?;
        self.out.flush()
    }

    fn finish_line(&mut self) -> io::Result<()> {
        if !self.at_line_start {
            writeln!(self.out)?;
            self.at_line_start = true;
        }
        Ok(())
    }
}

impl<W: Write> DisplayTarget for TerminalTarget<W> {
    fn show_placeholder(&mut self, text: &str) -> io::Result<()> {
        write!(self.out, "{}", text.dimmed().italic())?;
        self.placeholder_shown = true;
        self.out.flush()
    }

    fn clear_placeholder(&mut self) -> io::Result<()> {
        write!(self.out, "{ERASE_LINE}")?;
        self.placeholder_shown = false;
        self.out.flush()
    }

    fn append(&mut self, text: &str) -> io::Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.out.write_all(text.as_bytes())?;
        self.at_line_start = text.ends_with('\n');
        self.out.flush()
    }

    fn mark_complete(&mut self, marker: &str) -> io::Result<()> {
        self.finish_line()?;
        if !marker.is_empty() {
            writeln!(self.out, "{}", marker.dimmed())?;
        }
        self.out.flush()
    }

    fn mark_failed(&mut self, message: &str) -> io::Result<()> {
        self.finish_line()?;
        writeln!(self.out, "{}: {}", "Error".red().bold(), message)?;
        self.out.flush()
    }
}

/// Runs one exchange on stdout. Ctrl+C abandons it.
/// Returns `None` when the prompt was blank and nothing was sent.
pub async fn ask<T: Transport>(
    transport: &T,
    config: &ExchangeConfig,
    prompt: &str,
) -> io::Result<Option<ExchangeState>> {
    let cancel = CancelHandle::new();
    let exchange = exchange::submit(transport, config, prompt, TerminalTarget::stdout(), &cancel);
    tokio::pin!(exchange);

    let renderer = tokio::select! {
        result = &mut exchange => result?,
        Ok(()) = tokio::signal::ctrl_c() => {
            debug!("interrupted");
            cancel.cancel();
            exchange.await?
        }
    };

    let Some(renderer) = renderer else {
        return Ok(None);
    };
    let state = renderer.state().clone();
    if state == ExchangeState::Cancelled {
        renderer.into_target().mark_cancelled()?;
    }
    Ok(Some(state))
}

/// Awaits `work` unless `stop` resolves first. `work` wins a tie.
pub async fn unless<F, S>(work: F, stop: S) -> Option<F::Output>
where
    F: Future,
    S: Future,
{
    tokio::select! {
        biased;
        output = work => Some(output),
        _ = stop => None,
    }
}

/// Awaits `work` unless Ctrl+C arrives first.
pub async fn interruptible<F: Future>(work: F) -> Option<F::Output> {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            debug!(error = %e, "Ctrl+C handler unavailable");
            future::pending::<()>().await;
        }
    };
    unless(work, ctrl_c).await
}
