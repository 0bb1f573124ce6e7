//! npm configuration as a source of registry settings.
//!
//! Layers, later ones winning:
//! 1. the user config (`$npm_config_userconfig`, else `~/.npmrc`)
//! 2. the project `.npmrc`
//! 3. `npm_config_*` environment variables
//!
//! `${VAR}` references in any value are expanded from the environment once
//! all layers are merged.

use anyhow::{Context, Result};
use ini::{Ini, ParseOption};
use lockmirror_core::RegistrySettings;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "npm_config_";
const USERCONFIG_KEY: &str = "userconfig";
const NPMRC: &str = ".npmrc";

type Layer = BTreeMap<String, String>;

/// Load registry settings for a project rooted at `project_dir`.
pub async fn load(project_dir: &Path) -> Result<RegistrySettings> {
    let vars: Vec<(String, String)> = std::env::vars().collect();
    load_with(&vars, dirs::home_dir().as_deref(), project_dir).await
}

async fn load_with(
    vars: &[(String, String)],
    home: Option<&Path>,
    project_dir: &Path,
) -> Result<RegistrySettings> {
    let env = env_layer(vars);
    let user = match env.get(USERCONFIG_KEY) {
        Some(path) if !path.is_empty() => Some(PathBuf::from(path)),
        _ => home.map(|home| home.join(NPMRC)),
    };

    let mut merged = Layer::new();
    if let Some(user) = user {
        merged.extend(read_npmrc(&user).await?);
    }
    merged.extend(read_npmrc(&project_dir.join(NPMRC)).await?);
    merged.extend(env);

    let lookup: HashMap<&str, &str> = vars
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

    Ok(merged
        .into_iter()
        .map(|(key, value)| {
            let value = expand_vars(&value, |name| lookup.get(name).map(|v| v.to_string()));
            (key, value)
        })
        .collect())
}

async fn read_npmrc(path: &Path) -> Result<Layer> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => {
            tracing::debug!(path = %path.display(), "loaded npm config");
            parse(&text).with_context(|| format!("failed to parse {}", path.display()))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Layer::new()),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

/// `npm_config_*` variables, matched case-insensitively, with the prefix
/// removed and `_` turned into `-`.
fn env_layer(vars: &[(String, String)]) -> Layer {
    let mut sorted: Vec<_> = vars.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    sorted
        .into_iter()
        .filter_map(|(key, value)| {
            let key = key.to_lowercase();
            let name = key.strip_prefix(ENV_PREFIX)?;
            Some((name.replace('_', "-"), value.clone()))
        })
        .collect()
}

/// Parse the top-level `key = value` pairs of an npmrc file.
///
/// Keys after the first `[section]` header belong to that section and are
/// ignored.
fn parse(text: &str) -> Result<Layer> {
    let options = ParseOption {
        enabled_quote: true,
        enabled_escape: true,
        ..ParseOption::default()
    };
    let ini = Ini::load_from_str_opt(&escape_key_colons(text), options)?;

    Ok(ini
        .general_section()
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect())
}

/// Registry keys like `//host/:_authToken` contain `:`, which INI also
/// accepts as a key separator.
fn escape_key_colons(text: &str) -> String {
    text.lines()
        .map(|line| match line.split_once('=') {
            Some((key, value)) if !line.trim_start().starts_with([';', '#', '[']) => {
                format!("{}={value}", key.replace(':', "\\:"))
            }
            _ => line.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Replace `${NAME}` with the value of `NAME`.
///
/// Unknown names and references preceded by an odd number of backslashes are
/// left as written.
fn expand_vars(value: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        let (head, tail) = rest.split_at(start);
        let Some(end) = tail.find('}') else {
            break;
        };
        out.push_str(head);

        let name = &tail[2..end];
        let escaped = head.bytes().rev().take_while(|b| *b == b'\\').count() % 2 == 1;
        match (!escaped && !name.is_empty()).then(|| lookup(name)).flatten() {
            Some(replacement) => out.push_str(&replacement),
            None => out.push_str(&tail[..=end]),
        }
        rest = &tail[end + 1..];
    }

    out.push_str(rest);
    out
}
