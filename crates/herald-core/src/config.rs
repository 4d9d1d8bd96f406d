use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use serde_json::Value;

use crate::{messaging::types::Fields, Error, Result};

pub const DEFAULT_CONFIG_FILE: &str = "herald.json";

/// One service registration read from the services file.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ServiceConfig {
    /// Registration name; defaults to the driver's own name.
    #[serde(default)]
    pub name: Option<String>,
    /// Catalog key of the driver, e.g. `"null"` or `"logger"`.
    pub kind: String,
    #[serde(default)]
    pub options: Fields,
}

#[derive(Debug, Default, Deserialize)]
struct ServicesFile {
    #[serde(default)]
    services: Vec<ServiceConfig>,
}

/// Runtime configuration.
#[derive(Clone, Debug, Default)]
pub struct Config {
    pub config_path: PathBuf,
    pub services: Vec<ServiceConfig>,
    /// Force every service into suppressed mode (dry run).
    pub suppress_all: bool,
}

impl Config {
    /// Read `.env`, then the services file named by `HERALD_CONFIG`.
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let config_path = env_path("HERALD_CONFIG").unwrap_or_else(|| DEFAULT_CONFIG_FILE.into());
        let services = load_services(&config_path)?;
        let suppress_all = env_bool("HERALD_SUPPRESS").unwrap_or(false);

        Ok(Self {
            config_path,
            services,
            suppress_all,
        })
    }
}

/// Load service registrations from a JSON file, interpolating `${ENV_VAR}`
/// placeholders in every string.
///
/// A missing file yields no services.
pub fn load_services(path: &Path) -> Result<Vec<ServiceConfig>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let raw = fs::read_to_string(path)?;
    parse_services(&raw)
        .map_err(|e| Error::config(format!("{}: {e}", path.display())))
}

fn parse_services(raw: &str) -> Result<Vec<ServiceConfig>> {
    let value: Value = serde_json::from_str(raw)?;
    let file: ServicesFile = serde_json::from_value(interpolate_env(value))?;
    for service in &file.services {
        if service.kind.trim().is_empty() {
            return Err(Error::config("service entry without a kind"));
        }
    }
    Ok(file.services)
}

fn interpolate_env(v: Value) -> Value {
    match v {
        Value::String(s) => Value::String(interpolate_env_str(&s)),
        Value::Array(xs) => Value::Array(xs.into_iter().map(interpolate_env).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, interpolate_env(v)))
                .collect(),
        ),
        other => other,
    }
}

fn interpolate_env_str(s: &str) -> String {
    // `${VAR}` only, no defaults. Unset vars become empty.
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                out.push_str(&env::var(&after[..end]).unwrap_or_default());
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() || env::var_os(key).is_some() {
            continue;
        }

        env::set_var(key, unquote(v.trim()));
    }
}

fn unquote(val: &str) -> &str {
    let quoted = val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')));
    if quoted {
        &val[1..val.len() - 1]
    } else {
        val
    }
}

fn env_bool(key: &str) -> Option<bool> {
    env::var(key).ok().map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}
