use crate::exchange::ResponseFormat;
use crate::http::HttpConnectionProfile;
use crate::renderer::RenderMode;

use anyhow::{Context, Result};
use ini::{Ini, Properties};
use std::{collections::HashMap, path::Path, str::FromStr, time::Duration};

pub const DEFAULT_INI_FILE_PATH: &str = "~/.promptline";
pub const DEFAULT_INI_SECTION: &str = "default";

pub const INI_SERVER: &str = "server";
pub const INI_PATH: &str = "path";
pub const INI_ENDPOINT_URL: &str = "endpoint_url";
pub const INI_MODEL_NAME: &str = "model_name";
const INI_MODE: &str = "mode";
const INI_FORMAT: &str = "format";
const INI_PLACEHOLDER: &str = "placeholder";
const INI_USER: &str = "user";
const INI_PASSWORD: &str = "password";
const INI_INSECURE: &str = "insecure";
const INI_CA_CERT: &str = "ca_cert";
const INI_TIMEOUT: &str = "timeout_secs";
const INI_HISTORY_SIZE: &str = "history_size";
const HEADER_PREFIX: &str = "@";

/// One named set of connection and rendering settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    server: Option<String>,
    path: Option<String>,
    endpoint_url: Option<String>,
    model_name: Option<String>,
    mode: Option<RenderMode>,
    format: Option<ResponseFormat>,
    placeholder: Option<String>,
    user: Option<String>,
    password: Option<String>,
    insecure: Option<bool>,
    ca_cert: Option<String>,
    timeout_secs: Option<u64>,
    history_size: Option<usize>,
    headers: HashMap<String, String>,
}

impl Profile {
    pub fn endpoint_url(&self) -> Option<&String> {
        self.endpoint_url.as_ref()
    }

    pub fn model_name(&self) -> Option<&String> {
        self.model_name.as_ref()
    }

    pub fn mode(&self) -> Option<RenderMode> {
        self.mode
    }

    pub fn format(&self) -> Option<ResponseFormat> {
        self.format
    }

    pub fn placeholder(&self) -> Option<&String> {
        self.placeholder.as_ref()
    }

    pub fn history_size(&self) -> Option<usize> {
        self.history_size
    }

    pub fn set_server(&mut self, server: Option<String>) -> &mut Self {
        self.server = server;
        self
    }

    pub fn set_path(&mut self, path: Option<String>) -> &mut Self {
        self.path = path;
        self
    }

    pub fn set_endpoint_url(&mut self, endpoint_url: Option<String>) -> &mut Self {
        self.endpoint_url = endpoint_url;
        self
    }

    pub fn set_model_name(&mut self, model_name: Option<String>) -> &mut Self {
        self.model_name = model_name;
        self
    }

    pub fn set_mode(&mut self, mode: Option<RenderMode>) -> &mut Self {
        self.mode = mode;
        self
    }

    pub fn set_format(&mut self, format: Option<ResponseFormat>) -> &mut Self {
        self.format = format;
        self
    }

    pub fn set_placeholder(&mut self, placeholder: Option<String>) -> &mut Self {
        self.placeholder = placeholder;
        self
    }

    pub fn set_user(&mut self, user: Option<String>) -> &mut Self {
        self.user = user;
        self
    }

    pub fn set_password(&mut self, password: Option<String>) -> &mut Self {
        self.password = password;
        self
    }

    pub fn set_insecure(&mut self, insecure: Option<bool>) -> &mut Self {
        self.insecure = insecure;
        self
    }

    pub fn set_ca_cert(&mut self, ca_cert: Option<String>) -> &mut Self {
        self.ca_cert = ca_cert;
        self
    }

    pub fn set_timeout_secs(&mut self, timeout_secs: Option<u64>) -> &mut Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> &mut Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    /// Overlays every value that `other` sets on top of this profile.
    pub fn merge(&mut self, other: &Profile) -> &mut Self {
        fn take<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
            if src.is_some() {
                dst.clone_from(src);
            }
        }

        take(&mut self.server, &other.server);
        take(&mut self.path, &other.path);
        take(&mut self.endpoint_url, &other.endpoint_url);
        take(&mut self.model_name, &other.model_name);
        take(&mut self.mode, &other.mode);
        take(&mut self.format, &other.format);
        take(&mut self.placeholder, &other.placeholder);
        take(&mut self.user, &other.user);
        take(&mut self.password, &other.password);
        take(&mut self.insecure, &other.insecure);
        take(&mut self.ca_cert, &other.ca_cert);
        take(&mut self.timeout_secs, &other.timeout_secs);
        take(&mut self.history_size, &other.history_size);

        other.headers.iter().for_each(|(key, value)| {
            self.headers.insert(key.to_string(), value.to_string());
        });

        self
    }
}

impl HttpConnectionProfile for Profile {
    fn server(&self) -> Option<&String> {
        self.server.as_ref()
    }

    fn prompt_path(&self) -> Option<&String> {
        self.path.as_ref()
    }

    fn user(&self) -> Option<&String> {
        self.user.as_ref()
    }

    fn password(&self) -> Option<&String> {
        self.password.as_ref()
    }

    fn insecure(&self) -> Option<bool> {
        self.insecure
    }

    fn ca_cert(&self) -> Option<&String> {
        self.ca_cert.as_ref()
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }
}

pub struct IniFile;

impl IniFile {
    fn expand(file_path: &str) -> String {
        shellexpand::tilde(file_path).to_string()
    }

    fn open(file_path: &str) -> Result<Ini> {
        let extended_path = Self::expand(file_path);
        if !Path::new(&extended_path).exists() {
            return Ok(Ini::new());
        }
        Ini::load_from_file(&extended_path)
            .with_context(|| format!("Failed to read settings file {extended_path}"))
    }

    fn write(file_path: &str, ini: &Ini) -> Result<()> {
        let extended_path = Self::expand(file_path);
        ini.write_to_file(&extended_path)
            .with_context(|| format!("Failed to write settings file {extended_path}"))
    }

    pub fn profile_exists(file_path: &str, name: &str) -> Result<bool> {
        Ok(Self::open(file_path)?.section(Some(name)).is_some())
    }

    pub fn load_profile(file_path: &str, name: &str) -> Result<Option<Profile>> {
        let ini = Self::open(file_path)?;
        let section = match ini.section(Some(name)) {
            Some(s) => s,
            None => return Ok(None),
        };

        fn try_get<T>(section: &Properties, key: &str) -> Result<Option<T>>
        where
            T: FromStr,
            T::Err: std::fmt::Display,
        {
            section
                .get(key)
                .map(|s| {
                    s.trim()
                        .parse::<T>()
                        .map_err(|e| anyhow::anyhow!("Invalid value '{s}' for '{key}': {e}"))
                })
                .transpose()
        }

        let headers = section
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(HEADER_PREFIX)
                    .map(|name| (name.to_string(), value.to_string()))
            })
            .collect::<HashMap<String, String>>();

        let profile = Profile {
            server: try_get(section, INI_SERVER)?,
            path: try_get(section, INI_PATH)?,
            endpoint_url: try_get(section, INI_ENDPOINT_URL)?,
            model_name: try_get(section, INI_MODEL_NAME)?,
            mode: try_get(section, INI_MODE)?,
            format: try_get(section, INI_FORMAT)?,
            placeholder: try_get(section, INI_PLACEHOLDER)?,
            user: try_get(section, INI_USER)?,
            password: try_get(section, INI_PASSWORD)?,
            insecure: try_get(section, INI_INSECURE)?,
            ca_cert: try_get(section, INI_CA_CERT)?,
            timeout_secs: try_get(section, INI_TIMEOUT)?,
            history_size: try_get(section, INI_HISTORY_SIZE)?,
            headers,
        };

        Ok(Some(profile))
    }

    /// Sets or (with `None`) removes one key of one profile, leaving everything else as is.
    pub fn set_value(file_path: &str, name: &str, key: &str, value: Option<&str>) -> Result<()> {
        let mut ini = Self::open(file_path)?;
        match value {
            Some(v) => {
                ini.with_section(Some(name)).set(key, v);
            }
            None => {
                ini.delete_from(Some(name), key);
            }
        }
        Self::write(file_path, &ini)
    }

    pub fn save_profile(file_path: &str, name: &str, profile: &Profile) -> Result<()> {
        let mut conf = Self::open(file_path)?;
        conf.delete(Some(name));
        let mut sect = conf.with_section(Some(name.to_string()));

        if let Some(server) = &profile.server {
            sect.set(INI_SERVER, server);
        }
        if let Some(path) = &profile.path {
            sect.set(INI_PATH, path);
        }
        if let Some(endpoint_url) = &profile.endpoint_url {
            sect.set(INI_ENDPOINT_URL, endpoint_url);
        }
        if let Some(model_name) = &profile.model_name {
            sect.set(INI_MODEL_NAME, model_name);
        }
        if let Some(mode) = profile.mode {
            sect.set(INI_MODE, mode.to_string());
        }
        if let Some(format) = profile.format {
            sect.set(INI_FORMAT, format.to_string());
        }
        if let Some(placeholder) = &profile.placeholder {
            sect.set(INI_PLACEHOLDER, placeholder);
        }
        if let Some(user) = &profile.user {
            sect.set(INI_USER, user);
        }
        if let Some(password) = &profile.password {
            sect.set(INI_PASSWORD, password);
        }
        if let Some(insecure) = profile.insecure {
            sect.set(INI_INSECURE, insecure.to_string());
        }
        if let Some(ca_cert) = &profile.ca_cert {
            sect.set(INI_CA_CERT, ca_cert);
        }
        if let Some(timeout) = profile.timeout_secs {
            sect.set(INI_TIMEOUT, timeout.to_string());
        }
        if let Some(size) = profile.history_size {
            sect.set(INI_HISTORY_SIZE, size.to_string());
        }
        for (k, v) in profile.headers.iter() {
            sect.set(format!("{HEADER_PREFIX}{k}"), v);
        }

        Self::write(file_path, &conf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempPath};

    const TEST_SERVER: &str = "http://chat-server:8000";
    const TEST_ENDPOINT_URL: &str = "http://localhost:11434/v1";
    const TEST_MODEL: &str = "llama3";
    const TEST_USER: &str = "test_user";
    const TEST_PASSWORD: &str = "test_password";
    const TEST_CA_CERT: &str = "/etc/pki/ca/cert.crt";
    const TEST_USER_AGENT: &str = "promptline/0.1";

    fn create_ini_file() -> Result<TempPath> {
        let content = format!(
            "[{}]\n\
             server={}\n\
             path=/handle-prompt/\n\
             endpoint_url={}\n\
             model_name={}\n\
             mode=markup\n\
             format=stream\n\
             user={}\n\
             password={}\n\
             ca_cert={}\n\
             insecure=false\n\
             timeout_secs=30\n\
             history_size=20\n\
             @User-Agent={}\n\
             [other]\n\
             server=http://other\n\
             ",
            DEFAULT_INI_SECTION,
            TEST_SERVER,
            TEST_ENDPOINT_URL,
            TEST_MODEL,
            TEST_USER,
            TEST_PASSWORD,
            TEST_CA_CERT,
            TEST_USER_AGENT
        );

        let mut file = NamedTempFile::new()?;
        file.write_all(content.as_bytes())?;
        Ok(file.into_temp_path())
    }

    fn path_of(temp_path: &TempPath) -> String {
        temp_path.as_os_str().to_str().unwrap().to_string()
    }

    fn check_profile(profile: &Profile) {
        assert_eq!(profile.server(), Some(&TEST_SERVER.to_string()));
        assert_eq!(profile.prompt_path(), Some(&"/handle-prompt/".to_string()));
        assert_eq!(profile.endpoint_url(), Some(&TEST_ENDPOINT_URL.to_string()));
        assert_eq!(profile.model_name(), Some(&TEST_MODEL.to_string()));
        assert_eq!(profile.mode(), Some(RenderMode::Markup));
        assert_eq!(profile.format(), Some(ResponseFormat::Stream));
        assert_eq!(profile.user(), Some(&TEST_USER.to_string()));
        assert_eq!(profile.password(), Some(&TEST_PASSWORD.to_string()));
        assert_eq!(profile.ca_cert(), Some(&TEST_CA_CERT.to_string()));
        assert_eq!(profile.insecure(), Some(false));
        assert_eq!(profile.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(profile.history_size(), Some(20));
        assert_eq!(
            profile.headers().get("User-Agent"),
            Some(&TEST_USER_AGENT.to_string())
        );
    }

    #[test]
    fn test_load_profile() -> Result<()> {
        let temp_path = create_ini_file()?;
        let profile = IniFile::load_profile(&path_of(&temp_path), DEFAULT_INI_SECTION)?.unwrap();
        check_profile(&profile);
        temp_path.close()?;
        Ok(())
    }

    #[test]
    fn missing_file_or_section_is_none() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("absent").to_str().unwrap().to_string();
        assert!(IniFile::load_profile(&path, DEFAULT_INI_SECTION)?.is_none());

        let temp_path = create_ini_file()?;
        assert!(IniFile::load_profile(&path_of(&temp_path), "nope")?.is_none());
        assert!(IniFile::profile_exists(&path_of(&temp_path), "other")?);
        Ok(())
    }

    #[test]
    fn invalid_value_is_reported() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        file.write_all(b"[default]\nmode=rich\n")?;
        let path = file.into_temp_path();
        let err = IniFile::load_profile(&path_of(&path), DEFAULT_INI_SECTION).unwrap_err();
        assert!(err.to_string().contains("mode"));
        Ok(())
    }

    #[test]
    fn set_value_keeps_other_keys_and_sections() -> Result<()> {
        let temp_path = create_ini_file()?;
        let path = path_of(&temp_path);

        IniFile::set_value(&path, DEFAULT_INI_SECTION, INI_MODEL_NAME, Some("mistral"))?;
        let profile = IniFile::load_profile(&path, DEFAULT_INI_SECTION)?.unwrap();
        assert_eq!(profile.model_name(), Some(&"mistral".to_string()));
        assert_eq!(profile.server(), Some(&TEST_SERVER.to_string()));

        IniFile::set_value(&path, DEFAULT_INI_SECTION, INI_ENDPOINT_URL, None)?;
        let profile = IniFile::load_profile(&path, DEFAULT_INI_SECTION)?.unwrap();
        assert_eq!(profile.endpoint_url(), None);

        let other = IniFile::load_profile(&path, "other")?.unwrap();
        assert_eq!(other.server(), Some(&"http://other".to_string()));
        Ok(())
    }

    #[test]
    fn test_save_profile_round_trip() -> Result<()> {
        let temp_path = create_ini_file()?;
        let source = IniFile::load_profile(&path_of(&temp_path), DEFAULT_INI_SECTION)?.unwrap();

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("saved").to_str().unwrap().to_string();
        IniFile::save_profile(&path, "copy", &source)?;

        let saved = IniFile::load_profile(&path, "copy")?.unwrap();
        check_profile(&saved);
        assert_eq!(saved, source);
        Ok(())
    }

    #[test]
    fn merge_prefers_the_overlay() {
        let mut base = Profile::default();
        base.set_server(Some("http://base".to_string()))
            .set_model_name(Some("base-model".to_string()))
            .set_header("X-A", "1");

        let mut overlay = Profile::default();
        overlay
            .set_model_name(Some("cli-model".to_string()))
            .set_header("X-B", "2");

        base.merge(&overlay);
        assert_eq!(base.server(), Some(&"http://base".to_string()));
        assert_eq!(base.model_name(), Some(&"cli-model".to_string()));
        assert_eq!(base.headers().len(), 2);
    }
}
