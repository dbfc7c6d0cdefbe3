use crate::decoder::{charset_of, decode_body, ContentEncoding};
use crate::error::ExchangeError;
use crate::exchange::{ExchangeRequest, Reply, ResponseBody, Transport};

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE},
    Certificate, Client, Response, Url,
};
use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_SERVER: &str = "http://127.0.0.1:8000";
pub const DEFAULT_PROMPT_PATH: &str = "/handle-prompt/";
pub const PREVIEW_PATH: &str = "/preview/";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

pub trait HttpConnectionProfile {
    fn server(&self) -> Option<&String>;
    fn prompt_path(&self) -> Option<&String>;
    fn user(&self) -> Option<&String>;
    fn password(&self) -> Option<&String>;
    fn insecure(&self) -> Option<bool>;
    fn ca_cert(&self) -> Option<&String>;
    fn timeout(&self) -> Option<Duration>;
    fn headers(&self) -> &HashMap<String, String>;
}

pub struct HttpTransport {
    client: Client,
    server: Url,
    prompt_url: Url,
    user: Option<String>,
    password: Option<String>,
}

impl Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("client", &"Client")
            .field("prompt_url", &self.prompt_url.as_str())
            .finish()
    }
}

pub fn parse_server(server: &str) -> Result<Url> {
    let server = server.trim();
    let with_scheme = if server.contains("://") {
        server.to_string()
    } else {
        format!("http://{server}")
    };
    Url::parse(&with_scheme).with_context(|| format!("Invalid server address '{server}'"))
}

impl HttpTransport {
    pub fn new(profile: &impl HttpConnectionProfile) -> Result<Self> {
        let server = profile
            .server()
            .ok_or_else(|| anyhow!("No server configured. Pass --server or set it in the profile."))?;
        let server = parse_server(server)?;
        let path = profile
            .prompt_path()
            .map(String::as_str)
            .unwrap_or(DEFAULT_PROMPT_PATH);
        let prompt_url = server
            .join(path)
            .with_context(|| format!("Invalid prompt path '{path}'"))?;

        Ok(HttpTransport {
            client: Self::build_client(profile)?,
            server,
            prompt_url,
            user: profile.user().cloned(),
            password: profile.password().cloned(),
        })
    }

    pub fn prompt_url(&self) -> &Url {
        &self.prompt_url
    }

    /// Fetches a file's text through the backend's preview endpoint.
    pub async fn preview(&self, path: &str) -> std::result::Result<String, ExchangeError> {
        let mut url = self
            .server
            .join(PREVIEW_PATH)
            .map_err(|e| ExchangeError::Protocol(e.to_string()))?;
        url.query_pairs_mut().append_pair("path", path);
        debug!(url = %url, "fetching preview");

        let mut req = self.client.get(url);
        if let Some(user) = &self.user {
            req = req.basic_auth(user, self.password.clone());
        }
        let res = req.send().await?;

        let status = res.status();
        let encoding = ContentEncoding::from_header(header_str(&res, CONTENT_ENCODING).as_deref())?;
        let charset = charset_of(header_str(&res, CONTENT_TYPE).as_deref());
        let body = res.bytes().await?;
        let text = decode_body(&body, encoding, charset)?;

        if !status.is_success() {
            return Err(ExchangeError::HttpStatus {
                status: status.as_u16(),
                detail: text.lines().map(str::trim).find(|l| !l.is_empty()).map(str::to_string),
            });
        }
        Ok(text)
    }

    fn build_client(profile: &impl HttpConnectionProfile) -> Result<Client> {
        let insecure_access = profile.insecure().unwrap_or(false);
        let mut cli_builder = Client::builder()
            .danger_accept_invalid_certs(insecure_access)
            .danger_accept_invalid_hostnames(insecure_access);

        if let Some(ca_cert) = profile.ca_cert() {
            let ca_cert = shellexpand::tilde(&ca_cert).to_string();
            let pem = std::fs::read(&ca_cert)
                .with_context(|| format!("Failed to read CA certificate {ca_cert}"))?;
            let cert = Certificate::from_pem(&pem)
                .with_context(|| format!("Invalid CA certificate {ca_cert}"))?;
            cli_builder = cli_builder.use_rustls_tls().add_root_certificate(cert);
        }

        if let Some(timeout) = profile.timeout() {
            cli_builder = cli_builder.timeout(timeout);
        }

        if !profile.headers().is_empty() {
            let headers = profile
                .headers()
                .iter()
                .map(|(key, value)| -> Result<(HeaderName, HeaderValue)> {
                    Ok((
                        HeaderName::from_bytes(key.as_bytes())
                            .with_context(|| format!("Invalid header name '{key}'"))?,
                        HeaderValue::from_str(value.as_str())
                            .with_context(|| format!("Invalid value for header '{key}'"))?,
                    ))
                })
                .collect::<Result<HeaderMap>>()?;
            cli_builder = cli_builder.default_headers(headers);
        }

        cli_builder.build().context("Failed to build HTTP client")
    }
}

fn header_str(res: &Response, name: HeaderName) -> Option<String> {
    res.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

pub struct HttpBody(Response);

impl ResponseBody for HttpBody {
    async fn next_chunk(&mut self) -> std::result::Result<Option<Bytes>, ExchangeError> {
        Ok(self.0.chunk().await?)
    }
}

impl Transport for HttpTransport {
    type Body = HttpBody;

    async fn send(
        &self,
        request: &ExchangeRequest,
    ) -> std::result::Result<Reply<HttpBody>, ExchangeError> {
        let mut req = self
            .client
            .post(self.prompt_url.clone())
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .body(request.form_body()?);

        if let Some(user) = &self.user {
            req = req.basic_auth(user, self.password.clone());
        }

        debug!(url = %self.prompt_url, "POST");
        let res = req.send().await?;
        Ok(Reply {
            status: res.status().as_u16(),
            content_type: header_str(&res, CONTENT_TYPE),
            content_encoding: header_str(&res, CONTENT_ENCODING),
            body: HttpBody(res),
        })
    }
}
