use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExchangeError {
    #[error("connection failed: {0}")]
    Transport(String),

    #[error("{}", status_message(.status, .detail))]
    HttpStatus { status: u16, detail: Option<String> },

    #[error("could not decode response: {0}")]
    Decode(String),

    #[error("unexpected response: {0}")]
    Protocol(String),

    #[error("request cancelled")]
    Cancelled,
}

fn status_message(status: &u16, detail: &Option<String>) -> String {
    match detail {
        Some(d) if !d.is_empty() => format!("server returned status {status}: {d}"),
        _ => format!("server returned status {status}"),
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => ExchangeError::HttpStatus {
                status: status.as_u16(),
                detail: None,
            },
            None => ExchangeError::Transport(e.to_string()),
        }
    }
}

impl From<std::io::Error> for ExchangeError {
    fn from(e: std::io::Error) -> Self {
        ExchangeError::Decode(e.to_string())
    }
}
