use crate::dispatch::Registry;
use crate::hostos::HostOs;
use crate::items;
use std::{collections, fs, io, path, sync, time};

/// The agent configuration, a TOML document.
///
/// `item_files` point at item-definition documents applied in order on top
/// of the bundled items; `logging_conf` at a log4rs configuration.
#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
  pub listen_host: String,
  pub listen_port: u16,
  #[serde(default)]
  pub item_files: Vec<path::PathBuf>,
  #[serde(default)]
  pub logging_conf: Option<path::PathBuf>,
  /// Per-connection deadline, seconds.
  #[serde(default = "default_timeout")]
  pub timeout: f64,
}

fn default_timeout() -> f64 {
  3.0
}

/// An item-definition document: keys mapped to either a bundled item or a
/// shell command with `{0}`-style placeholders.
#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct ItemFile {
  #[serde(default)]
  items: collections::BTreeMap<String, ItemSpec>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(untagged)]
enum ItemSpec {
  Builtin {
    builtin: String,
  },
  Shell {
    shell: String,
    #[serde(default = "default_shell_timeout")]
    timeout: f64,
  },
}

fn default_shell_timeout() -> f64 {
  1.0
}

/// Fatal at startup; on reload the previous configuration stays in effect.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("couldn't read {path:?}")]
  Unreadable {
    path: path::PathBuf,
    source: io::Error,
  },
  #[error("couldn't parse {path:?}: {source}")]
  Unparsable {
    path: path::PathBuf,
    source: toml::de::Error,
  },
  #[error("{0}")]
  Invalid(String),
}

pub fn load(path: &path::Path) -> Result<Config, ConfigError> {
  let contents = fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
    path: path.to_path_buf(),
    source,
  })?;
  let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Unparsable {
    path: path.to_path_buf(),
    source,
  })?;
  if config.listen_port == 0 {
    return Err(ConfigError::Invalid("listen_port must be in [1,65535]".to_string()));
  }
  if !config.timeout.is_finite() || config.timeout <= 0.0 {
    return Err(ConfigError::Invalid(format!(
      "timeout must be a positive number of seconds, got {}",
      config.timeout
    )));
  }
  Ok(config)
}

/// Builds the registry the configuration describes: the bundled items, then
/// each item file in order, later keys shadowing earlier ones. Item files
/// are resolved relative to the configuration's directory.
pub fn registry<H>(
  config: &Config,
  config_path: &path::Path,
  host: &sync::Arc<H>,
) -> Result<Registry, ConfigError>
where
  H: HostOs + 'static,
{
  let mut registry = items::standard(host);
  let directory = config_path.parent().unwrap_or(path::Path::new("."));
  for item_file in &config.item_files {
    let path = directory.join(item_file);
    log::debug!("loading items from {path:?}");
    let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Unreadable {
      path: path.clone(),
      source,
    })?;
    let items: ItemFile = toml::from_str(&contents).map_err(|source| ConfigError::Unparsable {
      path: path.clone(),
      source,
    })?;
    for (key, spec) in &items.items {
      let handler = match spec {
        ItemSpec::Builtin { builtin } => items::builtin(builtin, host).ok_or_else(|| {
          ConfigError::Invalid(format!("{key} refers to unknown builtin {builtin:?}"))
        })?,
        ItemSpec::Shell { shell, timeout } => {
          if !timeout.is_finite() || *timeout <= 0.0 {
            return Err(ConfigError::Invalid(format!(
              "{key} has a non-positive timeout {timeout}"
            )));
          }
          items::shell(host, shell, time::Duration::from_secs_f64(*timeout))
        }
      };
      registry.insert(key, handler);
    }
  }
  Ok(registry)
}
