use anyhow::{Context, Result};
use std::io::{BufRead, Read, Write};
use std::path::Path;

/// Reads everything piped in. `None` when nothing but whitespace arrived.
pub fn read_stdin(i: &mut impl Read) -> Result<Option<String>> {
    let mut buffer = String::new();
    i.read_to_string(&mut buffer)
        .context("Failed to read prompt from stdin")?;

    if buffer.trim().is_empty() {
        Ok(None)
    } else {
        Ok(Some(buffer))
    }
}

/// Asks on stderr and reads one line. An empty answer picks `default`.
pub fn ask_string(i: &mut impl BufRead, msg: &str, default: Option<&str>) -> Result<Option<String>> {
    match default {
        Some(d) if !d.is_empty() => eprint!("{msg} [{d}]: "),
        _ => eprint!("{msg}: "),
    }
    std::io::stderr().flush()?;

    let mut buffer = String::new();
    i.read_line(&mut buffer)?;
    let answer = buffer.trim();

    if answer.is_empty() {
        Ok(default.filter(|d| !d.is_empty()).map(str::to_string))
    } else {
        Ok(Some(answer.to_string()))
    }
}

pub fn ask_binary(i: &mut impl BufRead, msg: &str) -> Result<bool> {
    let answer = ask_string(i, &format!("{msg} (y/N)"), None)?.unwrap_or_default();
    Ok(matches!(answer.to_lowercase().as_str(), "y" | "yes"))
}

/// Like `ask_string` but insists on an existing file. An empty answer skips.
pub fn ask_path(i: &mut impl BufRead, msg: &str) -> Result<Option<String>> {
    loop {
        let Some(answer) = ask_string(i, msg, None)? else {
            return Ok(None);
        };
        let expanded = shellexpand::tilde(&answer).to_string();
        if Path::new(&expanded).exists() {
            return Ok(Some(expanded));
        }
        eprintln!("Path not found: {answer}");
    }
}
