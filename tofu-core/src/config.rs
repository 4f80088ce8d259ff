use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

pub const STATE_DIR_NAME: &str = ".tofu_pdf";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ViewerConfig {
    pub state_dir: Option<PathBuf>,
    pub pdfium_library: Option<PathBuf>,
    pub keys: KeyBindings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeyBindings {
    pub next: char,
    pub previous: char,
    pub goto: char,
    pub quit: char,
}

impl Default for KeyBindings {
    fn default() -> Self {
        Self {
            next: 'j',
            previous: 'k',
            goto: 'g',
            quit: 'q',
        }
    }
}

impl ViewerConfig {
    /// Reads `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => Self::from_toml_str(&text)
                .with_context(|| format!("invalid configuration in {:?}", path)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read configuration {:?}", path))
            }
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.keys.validate()?;
        Ok(config)
    }

    /// The configured state directory, or `~/.tofu_pdf`.
    pub fn resolve_state_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.state_dir {
            return Ok(dir.clone());
        }
        let base = BaseDirs::new().context("unable to resolve the home directory")?;
        Ok(base.home_dir().join(STATE_DIR_NAME))
    }
}

impl KeyBindings {
    fn validate(&self) -> Result<()> {
        let keys = [
            ("next", self.next),
            ("previous", self.previous),
            ("goto", self.goto),
            ("quit", self.quit),
        ];
        for (i, (name, key)) in keys.iter().enumerate() {
            anyhow::ensure!(
                !key.is_ascii_digit(),
                "key `{}` for {} is a digit, digits are reserved for page numbers",
                key,
                name
            );
            if let Some((other, _)) = keys[..i].iter().find(|(_, k)| k == key) {
                anyhow::bail!("key `{}` is bound to both {} and {}", key, other, name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn partial_config_keeps_defaults() {
        let config = ViewerConfig::from_toml_str(
            r#"
            state_dir = "/tmp/tofu-state"

            [keys]
            next = "n"
            "#,
        )
        .unwrap();
        assert_eq!(config.state_dir, Some(PathBuf::from("/tmp/tofu-state")));
        assert_eq!(config.keys.next, 'n');
        assert_eq!(config.keys.previous, 'k');
        assert_eq!(config.keys.goto, 'g');
        assert_eq!(config.keys.quit, 'q');
        assert!(config.pdfium_library.is_none());
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempdir().unwrap();
        let config = ViewerConfig::load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, ViewerConfig::default());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[keys]\nnext = \"too long\"\n").unwrap();
        let err = ViewerConfig::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("invalid configuration"));
    }

    #[test]
    fn conflicting_or_digit_keys_are_rejected() {
        assert!(ViewerConfig::from_toml_str("[keys]\nnext = \"k\"\n").is_err());
        assert!(ViewerConfig::from_toml_str("[keys]\ngoto = \"5\"\n").is_err());
        assert!(ViewerConfig::from_toml_str("unknown = 1\n").is_err());
    }

    #[test]
    fn explicit_state_dir_wins() {
        let config = ViewerConfig {
            state_dir: Some(PathBuf::from("/var/tmp/tofu")),
            ..ViewerConfig::default()
        };
        assert_eq!(
            config.resolve_state_dir().unwrap(),
            PathBuf::from("/var/tmp/tofu")
        );
    }
}
