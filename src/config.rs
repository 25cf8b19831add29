//! `KEY=VALUE` configuration file loader.
//!
//! One pair per line, `#` starts a comment, values may be wrapped in
//! matching single or double quotes. Unknown keys are kept as opaque
//! strings; known keys with unparseable values fall back to their defaults
//! with a warning rather than failing startup.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_AUTOSAVE_INTERVAL: Duration = Duration::from_secs(30);

pub const PORT_KEY: &str = "SERVER_PORT";
pub const EDITOR_MODE_KEY: &str = "EDITOR_MODE";
pub const AUTOSAVE_INTERVAL_KEY: &str = "AUTOSAVE_INTERVAL_SECONDS";

/// Editing profile a front-end may adapt to. Opaque to the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EditorMode {
    #[default]
    Text,
    Code,
    Markdown,
    RichText,
}

impl EditorMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "TEXT" => Some(Self::Text),
            "CODE" => Some(Self::Code),
            "MARKDOWN" => Some(Self::Markdown),
            "RICH_TEXT" => Some(Self::RichText),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Code => "CODE",
            Self::Markdown => "MARKDOWN",
            Self::RichText => "RICH_TEXT",
        }
    }
}

impl std::fmt::Display for EditorMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "failed to read config file: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Parsed configuration: recognized keys typed, the rest available as raw
/// strings.
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    values: HashMap<String, String>,
}

impl ConfigFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(Self::parse(&raw))
    }

    pub fn parse(raw: &str) -> Self {
        let mut config = Self::default();
        for line in raw.lines() {
            config.parse_line(line);
        }
        config
    }

    fn parse_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return;
        }
        let Some((key, value)) = line.split_once('=') else {
            log::warn!("ignoring malformed config line: {line}");
            return;
        };
        let key = key.trim();
        if !is_valid_key(key) {
            log::warn!("ignoring config line with invalid key: {line}");
            return;
        }
        self.values
            .insert(key.to_string(), unquote(value.trim()).to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// `SERVER_PORT`, falling back to 8080 on absence or bad input.
    pub fn server_port(&self) -> u16 {
        match self.get(PORT_KEY) {
            None => DEFAULT_PORT,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                log::warn!("invalid {PORT_KEY} '{raw}', using {DEFAULT_PORT}");
                DEFAULT_PORT
            }),
        }
    }

    /// `EDITOR_MODE`, falling back to TEXT.
    pub fn editor_mode(&self) -> EditorMode {
        match self.get(EDITOR_MODE_KEY) {
            None => EditorMode::default(),
            Some(raw) => EditorMode::parse(raw).unwrap_or_else(|| {
                log::warn!("invalid {EDITOR_MODE_KEY} '{raw}', using TEXT");
                EditorMode::default()
            }),
        }
    }

    /// `AUTOSAVE_INTERVAL_SECONDS`, falling back to 30 seconds.
    pub fn autosave_interval(&self) -> Duration {
        match self.get(AUTOSAVE_INTERVAL_KEY) {
            None => DEFAULT_AUTOSAVE_INTERVAL,
            Some(raw) => match raw.parse::<u64>() {
                Ok(secs) => Duration::from_secs(secs),
                Err(_) => {
                    log::warn!("invalid {AUTOSAVE_INTERVAL_KEY} '{raw}', using default");
                    DEFAULT_AUTOSAVE_INTERVAL
                }
            },
        }
    }
}

/// Keys look like identifiers: a letter, then letters, digits, underscores.
fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Strip one layer of matching single or double quotes.
fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}
