#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_OUTPUT_DIR: &str = "videos";
pub const DEFAULT_PORT: u16 = 3003;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_YTDLP: &str = "yt-dlp";
pub const DEFAULT_FFMPEG: &str = "ffmpeg";

const OUTPUT_DIR_KEY: &str = "TUBEMUX_OUTPUT_DIR";
const PORT_KEY: &str = "TUBEMUX_PORT";
const HOST_KEY: &str = "TUBEMUX_HOST";
const YTDLP_KEY: &str = "TUBEMUX_YTDLP";
const FFMPEG_KEY: &str = "TUBEMUX_FFMPEG";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub output_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub ytdlp: PathBuf,
    pub ffmpeg: PathBuf,
}

/// Values supplied on the command line; they win over everything else.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub output_dir: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ytdlp: Option<PathBuf>,
    pub ffmpeg: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

/// Resolves the runtime configuration: overrides, then the process
/// environment, then the `.env` file, then defaults.
pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    Ok(build_runtime_config(&file_vars, env_var_string, overrides))
}

fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimeConfig {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let output_dir = overrides
        .output_dir
        .or_else(|| lookup(OUTPUT_DIR_KEY).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR));
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup(HOST_KEY))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = overrides
        .port
        .or_else(|| lookup(PORT_KEY).and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_PORT);
    let ytdlp = overrides
        .ytdlp
        .or_else(|| lookup(YTDLP_KEY).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP));
    let ffmpeg = overrides
        .ffmpeg
        .or_else(|| lookup(FFMPEG_KEY).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_FFMPEG));

    RuntimeConfig {
        output_dir,
        host,
        port,
        ytdlp,
        ffmpeg,
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(non_blank)
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned().and_then(non_blank))
}

/// Parses a dotenv-style file. A missing file yields no variables.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn config_from(contents: &str) -> RuntimeConfig {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_config(&vars, |_| None, RuntimeOverrides::default())
    }

    #[test]
    fn defaults_apply_without_any_source() {
        let config = config_from("");
        assert_eq!(config.output_dir, PathBuf::from(DEFAULT_OUTPUT_DIR));
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.ytdlp, PathBuf::from(DEFAULT_YTDLP));
        assert_eq!(config.ffmpeg, PathBuf::from(DEFAULT_FFMPEG));
    }

    #[test]
    fn env_file_values_are_used() {
        let config = config_from(
            "TUBEMUX_OUTPUT_DIR=\"/srv/videos\"\nTUBEMUX_PORT=\"4242\"\nTUBEMUX_HOST=\"0.0.0.0\"\nTUBEMUX_YTDLP=/opt/yt-dlp\nTUBEMUX_FFMPEG='/opt/ffmpeg'\n",
        );
        assert_eq!(config.output_dir, PathBuf::from("/srv/videos"));
        assert_eq!(config.port, 4242);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.ytdlp, PathBuf::from("/opt/yt-dlp"));
        assert_eq!(config.ffmpeg, PathBuf::from("/opt/ffmpeg"));
    }

    #[test]
    fn invalid_port_defaults() {
        let config = config_from("TUBEMUX_PORT=\"nope\"\n");
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn blank_values_are_ignored() {
        let config = config_from("TUBEMUX_HOST=\"   \"\nTUBEMUX_OUTPUT_DIR=\"\"\n");
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.output_dir, PathBuf::from(DEFAULT_OUTPUT_DIR));
    }

    #[test]
    fn process_env_wins_over_file() {
        let vars = read_env_file(make_config("TUBEMUX_OUTPUT_DIR=\"/file\"\n").path()).unwrap();
        let config = build_runtime_config(
            &vars,
            |key| (key == OUTPUT_DIR_KEY).then(|| "/env".to_string()),
            RuntimeOverrides::default(),
        );
        assert_eq!(config.output_dir, PathBuf::from("/env"));
    }

    #[test]
    fn overrides_win_over_env_and_file() {
        let mut vars = HashMap::new();
        vars.insert(OUTPUT_DIR_KEY.to_string(), "/file".to_string());
        vars.insert(PORT_KEY.to_string(), "7000".to_string());
        vars.insert(HOST_KEY.to_string(), "file-host".to_string());

        let overrides = RuntimeOverrides {
            output_dir: Some(PathBuf::from("/override")),
            port: Some(9000),
            host: Some("  ".into()),
            ffmpeg: Some(PathBuf::from("/usr/local/bin/ffmpeg")),
            ..RuntimeOverrides::default()
        };
        let config = build_runtime_config(
            &vars,
            |key| (key == PORT_KEY).then(|| "8000".to_string()),
            overrides,
        );

        assert_eq!(config.output_dir, PathBuf::from("/override"));
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "file-host");
        assert_eq!(config.ffmpeg, PathBuf::from("/usr/local/bin/ffmpeg"));
        assert_eq!(config.ytdlp, PathBuf::from(DEFAULT_YTDLP));
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export TUBEMUX_OUTPUT_DIR="/media"
            TUBEMUX_HOST =  "0.0.0.0"
            TUBEMUX_PORT=9090
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("TUBEMUX_OUTPUT_DIR").unwrap(), "/media");
        assert_eq!(vars.get("TUBEMUX_HOST").unwrap(), "0.0.0.0");
        assert_eq!(vars.get("TUBEMUX_PORT").unwrap(), "9090");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn resolve_runtime_config_reads_given_env_file() {
        let cfg = make_config("TUBEMUX_FFMPEG=\"/custom/ffmpeg\"\n");
        let config = resolve_runtime_config(RuntimeOverrides {
            env_path: Some(cfg.path().to_path_buf()),
            ..RuntimeOverrides::default()
        })
        .unwrap();
        if env::var(FFMPEG_KEY).is_err() {
            assert_eq!(config.ffmpeg, PathBuf::from("/custom/ffmpeg"));
        }
    }
}
