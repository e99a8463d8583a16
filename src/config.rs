#![forbid(unsafe_code)]

//! Runtime configuration for the tubeup binaries: data directory layout,
//! `.env`-file/environment resolution, and archive.org credential parsing.

use anyhow::{Context, Result, anyhow, bail};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DATA_DIR: &str = "~/.tubeup";
pub const DEFAULT_OUTPUT_TEMPLATE: &str = "%(id)s.%(ext)s";

const DOWNLOADS_SUBDIR: &str = "downloads";
const DOWNLOAD_ARCHIVE_FILE: &str = ".ytdlarchive";

/// Resolved settings every binary starts from.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub data_dir: PathBuf,
    pub ia_config: Option<PathBuf>,
    pub output_template: String,
}

pub fn load_runtime_settings() -> Result<RuntimeSettings> {
    resolve_runtime_settings(RuntimeOverrides::default())
}

/// Values that take precedence over the environment and the `.env` file,
/// typically sourced from command-line flags.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub data_dir: Option<PathBuf>,
    pub ia_config: Option<PathBuf>,
    pub output_template: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_settings_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeSettings> {
    build_runtime_settings_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeSettings> {
    let data_dir = overrides
        .data_dir
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("TUBEUP_DIR", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string());
    let ia_config = overrides
        .ia_config
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("TUBEUP_IA_CONFIG", file_vars, &env_lookup));
    let output_template = overrides
        .output_template
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() { None } else { Some(trimmed) }
        })
        .or_else(|| lookup_value("TUBEUP_OUTPUT_TEMPLATE", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_OUTPUT_TEMPLATE.to_string());

    Ok(RuntimeSettings {
        data_dir: expand_tilde(&data_dir)?,
        ia_config: ia_config
            .map(|path| expand_tilde(&path))
            .transpose()?,
        output_template,
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

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

/// Expands a leading `~/` (or bare `~`) to the user's home directory.
pub fn expand_tilde(path: &str) -> Result<PathBuf> {
    if path == "~" || path.starts_with("~/") {
        let home = env::var("HOME").map_err(|_| anyhow!("HOME is not set"))?;
        let rest = path.strip_prefix('~').unwrap_or("");
        let rest = rest.strip_prefix('/').unwrap_or(rest);
        let mut expanded = PathBuf::from(home);
        if !rest.is_empty() {
            expanded.push(rest);
        }
        return Ok(expanded);
    }
    Ok(PathBuf::from(path))
}

/// Filesystem locations one archiving run works with. Construction creates
/// the directories so later steps can assume they exist.
#[derive(Debug, Clone)]
pub struct TubeupPaths {
    root: PathBuf,
    downloads: PathBuf,
}

impl TubeupPaths {
    pub fn create(data_dir: &Path) -> Result<Self> {
        let root = data_dir.to_path_buf();
        let downloads = root.join(DOWNLOADS_SUBDIR);
        fs::create_dir_all(&downloads)
            .with_context(|| format!("creating {}", downloads.display()))?;
        Ok(Self { root, downloads })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn downloads(&self) -> &Path {
        &self.downloads
    }

    /// File recording which resources were already downloaded in prior runs.
    pub fn download_archive(&self) -> PathBuf {
        self.root.join(DOWNLOAD_ARCHIVE_FILE)
    }
}

/// S3-compatible key pair for the archive.org upload endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Credentials {
    pub access: String,
    pub secret: String,
}

/// Reads the `[s3]` section of an `internetarchive` configuration file
/// (INI format, as written by `ia configure`).
pub fn parse_ia_config_file(path: &Path) -> Result<S3Credentials> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;

    let mut section = String::new();
    let mut access = None;
    let mut secret = None;

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
            continue;
        }
        if let Some(header) = trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            section = header.trim().to_lowercase();
            continue;
        }
        if section != "s3" {
            continue;
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "access" if !value.is_empty() => access = Some(value.to_string()),
            "secret" if !value.is_empty() => secret = Some(value.to_string()),
            _ => {}
        }
    }

    match (access, secret) {
        (Some(access), Some(secret)) => Ok(S3Credentials { access, secret }),
        _ => bail!(
            "`internetarchive` configuration file {} is not configured properly",
            path.display()
        ),
    }
}

/// Standard locations the `internetarchive` tooling writes its config to,
/// probed in order when no explicit path was given.
pub fn default_ia_config_path() -> Option<PathBuf> {
    let home = env::var("HOME").ok()?;
    let home = Path::new(&home);
    for candidate in [
        home.join(".config/internetarchive/ia.ini"),
        home.join(".config/ia.ini"),
        home.join(".ia"),
    ] {
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
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

    fn settings_from(contents: &str) -> RuntimeSettings {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_settings(&vars, |_| None).unwrap()
    }

    #[test]
    fn settings_use_defaults_when_nothing_is_set() {
        let settings = settings_from("");
        assert!(settings.data_dir.ends_with(".tubeup"));
        assert!(settings.ia_config.is_none());
        assert_eq!(settings.output_template, DEFAULT_OUTPUT_TEMPLATE);
    }

    #[test]
    fn settings_read_env_file_values() {
        let settings = settings_from(
            "TUBEUP_DIR=\"/srv/tubeup\"\nTUBEUP_IA_CONFIG=\"/etc/ia.ini\"\nTUBEUP_OUTPUT_TEMPLATE=\"%(title)s.%(ext)s\"\n",
        );
        assert_eq!(settings.data_dir, PathBuf::from("/srv/tubeup"));
        assert_eq!(settings.ia_config, Some(PathBuf::from("/etc/ia.ini")));
        assert_eq!(settings.output_template, "%(title)s.%(ext)s");
    }

    #[test]
    fn settings_prefer_env_over_file() {
        let vars = read_env_file(make_config("TUBEUP_DIR=\"/from-file\"\n").path()).unwrap();
        let settings = build_runtime_settings(&vars, |key| {
            if key == "TUBEUP_DIR" {
                Some("/from-env".to_string())
            } else {
                None
            }
        })
        .unwrap();
        assert_eq!(settings.data_dir, PathBuf::from("/from-env"));
    }

    #[test]
    fn settings_override_precedence() {
        let vars = read_env_file(make_config("TUBEUP_DIR=\"/from-file\"\n").path()).unwrap();
        let overrides = RuntimeOverrides {
            data_dir: Some(PathBuf::from("/override")),
            output_template: Some("   ".into()),
            ..RuntimeOverrides::default()
        };
        let settings = build_runtime_settings_with_overrides(
            &vars,
            |key| {
                if key == "TUBEUP_DIR" {
                    Some("/from-env".to_string())
                } else {
                    None
                }
            },
            overrides,
        )
        .unwrap();
        assert_eq!(settings.data_dir, PathBuf::from("/override"));
        // A blank override falls through to the default.
        assert_eq!(settings.output_template, DEFAULT_OUTPUT_TEMPLATE);
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export TUBEUP_DIR="/data"
            TUBEUP_IA_CONFIG='/ia.ini'
            TUBEUP_OUTPUT_TEMPLATE =  "%(id)s.%(ext)s"
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("TUBEUP_DIR").unwrap(), "/data");
        assert_eq!(vars.get("TUBEUP_IA_CONFIG").unwrap(), "/ia.ini");
        assert_eq!(vars.get("TUBEUP_OUTPUT_TEMPLATE").unwrap(), "%(id)s.%(ext)s");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn expand_tilde_only_touches_leading_tilde() {
        let home = env::var("HOME").unwrap();
        assert_eq!(
            expand_tilde("~/.tubeup").unwrap(),
            Path::new(&home).join(".tubeup")
        );
        assert_eq!(expand_tilde("~").unwrap(), PathBuf::from(&home));
        assert_eq!(expand_tilde("/a/~b").unwrap(), PathBuf::from("/a/~b"));
    }

    #[test]
    fn paths_create_downloads_directory() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("data");
        let paths = TubeupPaths::create(&base).unwrap();
        assert!(paths.downloads().is_dir());
        assert_eq!(paths.root(), base.as_path());
        assert_eq!(paths.download_archive(), base.join(".ytdlarchive"));
    }

    #[test]
    fn ia_config_parses_s3_section() {
        let cfg = make_config(
            r#"
            [general]
            screenname = someone

            [s3]
            access = AKIAFAKEFAKEFAKE
            secret = sEcReT/sEcReT
            "#,
        );
        let creds = parse_ia_config_file(cfg.path()).unwrap();
        assert_eq!(
            creds,
            S3Credentials {
                access: "AKIAFAKEFAKEFAKE".into(),
                secret: "sEcReT/sEcReT".into(),
            }
        );
    }

    #[test]
    fn ia_config_requires_both_keys() {
        let cfg = make_config("[s3]\naccess = only-access\n");
        let err = parse_ia_config_file(cfg.path()).unwrap_err();
        assert!(err.to_string().contains("not configured properly"));
    }

    #[test]
    fn ia_config_ignores_keys_outside_s3_section() {
        let cfg = make_config(
            "[cookies]\naccess = wrong\nsecret = wrong\n[s3]\naccess = a\nsecret = s\n",
        );
        let creds = parse_ia_config_file(cfg.path()).unwrap();
        assert_eq!(creds.access, "a");
        assert_eq!(creds.secret, "s");
    }

    #[test]
    fn ia_config_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(parse_ia_config_file(&dir.path().join("ia.ini")).is_err());
    }
}
