use anyhow::{Context, Result};
use carrot_core::HubConfig;
use carrot_gateway::GatewayConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CarrotConfig {
    #[serde(default)]
    pub server: GatewayConfig,
    #[serde(default)]
    pub hub: HubConfig,
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".carrot")
}

impl CarrotConfig {
    /// Load from `custom_path` or `~/.carrot/config.toml`. A missing
    /// default file yields the built-in defaults; a missing custom file is
    /// an error.
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = match custom_path {
            Some(path) => path.clone(),
            None => {
                let path = config_dir().join("config.toml");
                if !path.exists() {
                    info!("No config at {}, using defaults", path.display());
                    return Ok(Self::default());
                }
                path
            }
        };
        Self::load_from(&path)
    }

    fn load_from(path: &Path) -> Result<Self> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = std::fs::metadata(path) {
                let mode = metadata.permissions().mode();
                if mode & 0o077 != 0 {
                    warn!(
                        "Config file {} is readable by others ({:o}). It may hold the shared secret; consider chmod 600",
                        path.display(),
                        mode & 0o777
                    );
                }
            }
        }

        let content = std::fs::read_to_string(path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `carrot init` first.",
                path.display()
            )
        })?;

        let expanded = expand_env_vars(&content);

        let mut config: Self = toml::from_str(&expanded)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;
        config.hub = config.hub.normalized();

        if !config.server.secret.is_empty() && !content.contains("${") {
            warn!(
                "Shared secret is hardcoded in config file. For security, use environment variables: secret = \"${{CARROT_SECRET}}\""
            );
        }

        Ok(config)
    }
}

/// Environment variables that may be expanded in config files
const ALLOWED_ENV_VARS: &[&str] = &["CARROT_SECRET", "CARROT_BIND", "HOME", "USER"];

fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        let Some(start) = result[pos..].find("${") else {
            break;
        };
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();

        if !ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                var_name
            );
            pos = abs_start + end + 1;
            continue;
        }

        let value = std::env::var(&var_name).unwrap_or_default();
        result = format!(
            "{}{}{}",
            &result[..abs_start],
            value,
            &result[abs_start + end + 1..]
        );
        pos = abs_start + value.len();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_toml_parses() {
        let config: CarrotConfig =
            toml::from_str(&expand_env_vars(include_str!("../../../config/default.toml"))).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert!(!config.server.require_secret);
        assert_eq!(config.hub.send_buffer, 1024);
        assert_eq!(config.hub.session_ttl_secs, 3600);
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let file = write_config("");
        let config = CarrotConfig::load(&Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert_eq!(config.hub.broadcast_buffer, 512);
        assert_eq!(config.hub.pong_wait_secs, 600);
    }

    #[test]
    fn test_partial_sections() {
        let file = write_config("[server]\nbind = \"0.0.0.0:9000\"\n\n[hub]\nsend_buffer = 0\n");
        let config = CarrotConfig::load(&Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.hub.send_buffer, 1);
        assert_eq!(config.hub.token_buffer, 1);
    }

    #[test]
    fn test_missing_custom_path_errors() {
        let missing = Some(PathBuf::from("/nonexistent/carrot/config.toml"));
        assert!(CarrotConfig::load(&missing).is_err());
    }

    #[test]
    fn test_invalid_toml_errors() {
        let file = write_config("[server\nbind = ");
        assert!(CarrotConfig::load(&Some(file.path().to_path_buf())).is_err());
    }

    #[test]
    fn test_expand_env_vars_allowlist() {
        // SAFETY: single-threaded test touching a variable only it reads
        unsafe { std::env::set_var("CARROT_BIND", "10.0.0.1:1") };
        assert_eq!(expand_env_vars("bind = \"${CARROT_BIND}\""), "bind = \"10.0.0.1:1\"");
        assert_eq!(expand_env_vars("x = \"${NOT_ALLOWED}\""), "x = \"${NOT_ALLOWED}\"");
        assert_eq!(expand_env_vars("x = \"${UNTERMINATED\""), "x = \"${UNTERMINATED\"");
        assert_eq!(expand_env_vars("plain"), "plain");
    }

    #[test]
    fn test_debug_masks_secret() {
        let mut config = CarrotConfig::default();
        config.server.secret = "supersecretvalue".to_string();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("supersecretvalue"));
    }
}
