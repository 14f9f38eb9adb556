use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;
use walkdir::WalkDir;

use crate::database::StoreConfig;
use crate::error::EngineError;
use crate::ml::engine::Floors;
use crate::models::{ensure_unit, Ext};

const MODEL_ENV_FILE: &str = ".env";
const MODEL_ENV_KEY: &str = "TAGGER_MODEL_PATH";
const MODEL_SEARCH_DEPTH: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Tree scanned for images.
    pub root_path: PathBuf,
    pub db_path: PathBuf,
    /// `selected_tags.csv` shipped with the model.
    pub vocabulary_path: PathBuf,
    pub sql_insert_batch_size: usize,
    /// Comma separated, e.g. `png,jpeg,jpg,gif`.
    pub valid_extensions: String,
    /// When false the tagger runs the model but writes nothing.
    pub commit_tags: bool,
    pub commit_sha256: bool,
    pub process_n_files_together: usize,
    /// Stop after this many files; 0 means no limit.
    pub process_n_files: usize,
    pub min_general_tag_val: f32,
    pub min_character_tag_val: f32,
    /// Discovered and remembered when unset.
    pub model_path: Option<PathBuf>,
    pub model_file_name: String,
    pub upload_time_limit_secs: u64,
    /// Files may only be served from under these directories.
    pub web_media_roots: Vec<PathBuf>,
    pub busy_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("."),
            db_path: PathBuf::from("tagdex.db"),
            vocabulary_path: PathBuf::from("selected_tags.csv"),
            sql_insert_batch_size: 10_000,
            valid_extensions: "png,jpeg,jpg,gif".to_string(),
            commit_tags: true,
            commit_sha256: true,
            process_n_files_together: 1,
            process_n_files: 0,
            min_general_tag_val: 0.2,
            min_character_tag_val: 0.2,
            model_path: None,
            model_file_name: "model.onnx".to_string(),
            upload_time_limit_secs: 16,
            web_media_roots: Vec::new(),
            busy_timeout_ms: 5_000,
        }
    }
}

impl Config {
    /// Reads and validates a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Config =
            toml::from_str(&text).with_context(|| format!("Invalid config file: {:?}", path))?;
        config.validate()?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        ensure_unit("min_general_tag_val", self.min_general_tag_val)
            .and_then(|_| ensure_unit("min_character_tag_val", self.min_character_tag_val))
            .map_err(|e| EngineError::Config(e.to_string()))?;
        if self.sql_insert_batch_size == 0 {
            return Err(EngineError::Config("sql_insert_batch_size must be > 0".into()));
        }
        if self.process_n_files_together == 0 {
            return Err(EngineError::Config("process_n_files_together must be > 0".into()));
        }
        if self.extensions()?.is_empty() {
            return Err(EngineError::Config("valid_extensions is empty".into()));
        }
        Ok(())
    }

    pub fn extensions(&self) -> crate::error::Result<Vec<Ext>> {
        Ext::parse_list(&self.valid_extensions)
    }

    pub fn store(&self) -> StoreConfig {
        StoreConfig::new(&self.db_path, Duration::from_millis(self.busy_timeout_ms))
    }

    pub fn floors(&self) -> Floors {
        Floors {
            general: self.min_general_tag_val,
            character: self.min_character_tag_val,
        }
    }

    pub fn upload_time_limit(&self) -> Duration {
        Duration::from_secs(self.upload_time_limit_secs)
    }

    /// Configured model path, or the remembered one, or one found on disk.
    ///
    /// A discovered path is written to `.env` in `base` for next time.
    pub fn resolve_model_path(&self, base: &Path) -> Result<PathBuf> {
        if let Some(path) = &self.model_path {
            return Ok(path.clone());
        }

        let env_path = base.join(MODEL_ENV_FILE);
        if env_path.exists() {
            if let Ok(path) = load_from_env(&env_path) {
                if path.is_file() {
                    info!("Loaded model path from {:?}", env_path);
                    return Ok(path);
                }
            }
        }

        info!("Model not configured, searching for {}...", self.model_file_name);
        let found = find_file(base, &self.model_file_name, MODEL_SEARCH_DEPTH)?;
        info!("Found model: {:?}", found);
        save_to_env(&env_path, &found)?;
        Ok(found)
    }
}

/// Searches `root` (then its parent) for `filename`, at most `max_depth` deep.
fn find_file(root: &Path, filename: &str, max_depth: usize) -> Result<PathBuf> {
    let search = |dir: &Path| {
        WalkDir::new(dir)
            .max_depth(max_depth)
            .into_iter()
            .filter_map(|e| e.ok())
            .find(|e| e.file_type().is_file() && e.file_name() == filename)
            .map(|e| e.path().to_path_buf())
    };

    search(root)
        .or_else(|| root.parent().and_then(search))
        .ok_or_else(|| anyhow!("Could not find file '{}' near {:?}", filename, root))
}

fn load_from_env(path: &Path) -> Result<PathBuf> {
    let reader = BufReader::new(File::open(path)?);
    for line in reader.lines() {
        let line = line?;
        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == MODEL_ENV_KEY {
                return Ok(PathBuf::from(value.trim()));
            }
        }
    }
    Err(anyhow!("{} missing from {:?}", MODEL_ENV_KEY, path))
}

fn save_to_env(path: &Path, model: &Path) -> Result<()> {
    let mut file = File::create(path).context("Failed to create .env file")?;
    writeln!(file, "{}={}", MODEL_ENV_KEY, model.display())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() -> Result<()> {
        let config: Config = toml::from_str(
            r#"
            root_path = "/srv/pics"
            process_n_files_together = 8
            web_media_roots = ["/srv/pics"]
            "#,
        )?;
        assert_eq!(config.root_path, PathBuf::from("/srv/pics"));
        assert_eq!(config.process_n_files_together, 8);
        assert_eq!(config.sql_insert_batch_size, 10_000);
        assert_eq!(config.upload_time_limit(), Duration::from_secs(16));
        config.validate()?;
        Ok(())
    }

    #[test]
    fn invalid_values_are_rejected() {
        let bad_floor = Config {
            min_general_tag_val: 1.5,
            ..Config::default()
        };
        assert!(matches!(bad_floor.validate(), Err(EngineError::Config(_))));

        let bad_ext = Config {
            valid_extensions: "png,bmp".into(),
            ..Config::default()
        };
        assert!(bad_ext.validate().is_err());

        let zero_batch = Config {
            process_n_files_together: 0,
            ..Config::default()
        };
        assert!(zero_batch.validate().is_err());
    }

    #[test]
    fn load_reads_toml_from_disk() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tagdex.toml");
        fs::write(&path, "db_path = \"x.db\"\ncommit_sha256 = false\n")?;

        let config = Config::load(&path)?;
        assert_eq!(config.db_path, PathBuf::from("x.db"));
        assert!(!config.commit_sha256);
        Ok(())
    }

    #[test]
    fn model_is_discovered_and_remembered() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let models = dir.path().join("models/wd");
        fs::create_dir_all(&models)?;
        fs::write(models.join("model.onnx"), b"onnx")?;

        let config = Config::default();
        let found = config.resolve_model_path(dir.path())?;
        assert_eq!(found, models.join("model.onnx"));
        assert_eq!(load_from_env(&dir.path().join(".env"))?, found);

        let pinned = Config {
            model_path: Some(PathBuf::from("/opt/tagger.onnx")),
            ..Config::default()
        };
        assert_eq!(pinned.resolve_model_path(dir.path())?, PathBuf::from("/opt/tagger.onnx"));
        Ok(())
    }

    #[test]
    fn test_save_and_load_env() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(".env");
        save_to_env(&path, Path::new("/tmp/model.onnx"))?;

        let content = fs::read_to_string(&path)?;
        assert!(content.contains("TAGGER_MODEL_PATH=/tmp/model.onnx"));
        assert_eq!(load_from_env(&path)?, PathBuf::from("/tmp/model.onnx"));
        Ok(())
    }
}
