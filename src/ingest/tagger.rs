//! Scan-then-tag driver.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use crossbeam::channel::bounded;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::hasher;
use super::scanner::{self, DiscoveredFile};
use crate::database::catalog::DirectoryCache;
use crate::database::curation::recompute_usage_counts;
use crate::database::repo::{list_untagged_images, record_tags, ScanRecord, ScanWriter};
use crate::database::Store;
use crate::ml::engine::Classifier;
use crate::utils::config::Config;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub found: usize,
    pub inserted: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TagRunReport {
    pub scan: ScanReport,
    pub untagged: usize,
    /// Images classified (and stored, when committing).
    pub completed: usize,
    /// Batches the classifier failed on.
    pub errors: usize,
    /// Rows whose file no longer exists.
    pub skipped: usize,
    pub elapsed: Duration,
}

/// Registers every image under the root as a bare row.
pub fn scan_and_store(config: &Config, store: &mut Store) -> Result<ScanReport> {
    let root = config.root_path.clone();
    let extensions = config.extensions()?;
    info!("Scanning {:?} for {:?}", root, extensions);

    let (tx, rx) = bounded::<DiscoveredFile>(1024);
    let scanner_handle = thread::spawn(move || scanner::scan_directory(&root, &extensions, tx));

    let spinner = ProgressBar::new_spinner();
    let mut dirs = DirectoryCache::new();
    let mut writer = ScanWriter::new(store.connection_mut(), config.sql_insert_batch_size);
    let mut found = 0;
    for file in rx {
        let directory_id = dirs.ensure_directory_id(writer.connection(), &file.directory)?;
        writer.add(ScanRecord {
            directory_id,
            filename: file.filename,
            ext: file.ext,
        })?;
        found += 1;
        if found % 1000 == 0 {
            spinner.set_message(format!("images: {found}"));
            spinner.tick();
        }
    }
    let inserted = writer.finish()?;
    spinner.finish_and_clear();

    scanner_handle
        .join()
        .map_err(|_| anyhow!("scanner thread panicked"))??;

    info!(
        "Scan done: {} images in {} directories, {} new",
        found,
        dirs.len(),
        inserted
    );
    Ok(ScanReport { found, inserted })
}

pub struct Tagger {
    config: Config,
    classifier: Arc<dyn Classifier>,
}

impl Tagger {
    pub fn new(config: Config, classifier: Arc<dyn Classifier>) -> Self {
        Self { config, classifier }
    }

    /// Scans, then classifies and stores every untagged image.
    pub fn run(&self, store: &mut Store) -> Result<TagRunReport> {
        let start = Instant::now();
        let mut report = TagRunReport {
            scan: scan_and_store(&self.config, store)?,
            ..TagRunReport::default()
        };

        let untagged = list_untagged_images(store.connection())?;
        report.untagged = untagged.len();
        info!("Found {} untagged images", untagged.len());

        let progress = create_progress_bar(untagged.len() as u64);
        let mut seen = 0;
        for batch in untagged.chunks(self.config.process_n_files_together) {
            seen += batch.len();
            if self.config.process_n_files > 0 && seen > self.config.process_n_files {
                break;
            }
            progress.inc(batch.len() as u64);

            let (present, missing): (Vec<_>, Vec<_>) =
                batch.iter().partition(|image| image.path().is_file());
            for image in &missing {
                warn!("Expected file at: {:?}", image.path());
            }
            report.skipped += missing.len();
            if present.is_empty() {
                continue;
            }

            let paths: Vec<PathBuf> = present.iter().map(|image| image.path()).collect();
            let classified = match self.classifier.classify(&paths) {
                Ok(c) if c.len() == paths.len() => c,
                Ok(c) => {
                    error!("Classifier returned {} results for {} images", c.len(), paths.len());
                    report.errors += 1;
                    continue;
                }
                Err(e) => {
                    error!("Classifier failed on batch starting at {:?}: {}", paths[0], e);
                    report.errors += 1;
                    continue;
                }
            };
            report.completed += paths.len();

            if !self.config.commit_tags {
                for (path, c) in paths.iter().zip(&classified) {
                    debug!("{:?}: ratings={:?} tags={:?}", path, c.ratings, c.tag_probabilities());
                }
                continue;
            }

            let hashes: Vec<Option<String>> = if self.config.commit_sha256 {
                hasher::hash_batch(&paths)
                    .into_iter()
                    .map(|(path, hash)| {
                        hash.map_err(|e| warn!("Failed to hash {:?}: {}", path, e)).ok()
                    })
                    .collect()
            } else {
                vec![None; paths.len()]
            };

            for ((image, c), hash) in present.iter().zip(&classified).zip(&hashes) {
                record_tags(
                    store.connection_mut(),
                    image.image_id,
                    &c.ratings,
                    &c.tag_probabilities(),
                    hash.as_deref(),
                )?;
            }
            progress.set_message(image_message(&paths));
        }
        progress.finish_and_clear();

        if self.config.commit_tags && report.completed > 0 {
            let tags = recompute_usage_counts(store.connection())?;
            debug!("Recounted usage of {} tags", tags);
        }

        report.elapsed = start.elapsed();
        info!(
            "Completed: {}  Errors: {}  Skipped: {}  Time: {:.3}s",
            report.completed,
            report.errors,
            report.skipped,
            report.elapsed.as_secs_f64()
        );
        Ok(report)
    }
}

fn image_message(paths: &[PathBuf]) -> String {
    paths
        .last()
        .and_then(|p| p.file_name())
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn create_progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");
    pb.set_style(style);
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::catalog::load_vocabulary;
    use crate::error::EngineError;
    use crate::ml::engine::Classification;
    use crate::models::{RatingScores, TagType};
    use crate::vocabulary::Vocabulary;
    use std::collections::BTreeMap;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedClassifier {
        calls: AtomicUsize,
    }

    impl Classifier for FixedClassifier {
        fn classify(&self, paths: &[PathBuf]) -> crate::error::Result<Vec<Classification>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(paths
                .iter()
                .map(|_| Classification {
                    ratings: RatingScores::new(0.9, 0.1, 0.0, 0.0),
                    general: BTreeMap::from([(1, 0.8)]),
                    character: BTreeMap::new(),
                })
                .collect())
        }
    }

    struct BrokenClassifier;

    impl Classifier for BrokenClassifier {
        fn classify(&self, _: &[PathBuf]) -> crate::error::Result<Vec<Classification>> {
            Err(EngineError::Classifier("model exploded".into()))
        }
    }

    fn setup(files: &[&str]) -> Result<(tempfile::TempDir, Store, Config)> {
        let dir = tempfile::tempdir()?;
        for name in files {
            fs::write(dir.path().join(name), name.as_bytes())?;
        }
        let mut store = Store::in_memory()?;
        let vocab = Vocabulary::from_entries([
            ("catA", TagType::General),
            ("tagB", TagType::General),
            ("ratingC", TagType::Rating),
        ]);
        load_vocabulary(store.connection_mut(), &vocab)?;
        let config = Config {
            root_path: dir.path().to_path_buf(),
            sql_insert_batch_size: 2,
            process_n_files_together: 2,
            ..Config::default()
        };
        Ok((dir, store, config))
    }

    fn fixed() -> Arc<FixedClassifier> {
        Arc::new(FixedClassifier {
            calls: AtomicUsize::new(0),
        })
    }

    #[test]
    fn run_tags_everything_once() -> Result<()> {
        let (_dir, mut store, config) = setup(&["a.png", "b.jpg", "c.gif", "skip.txt"])?;
        let classifier = fixed();
        let tagger = Tagger::new(config, classifier.clone());

        let report = tagger.run(&mut store)?;
        assert_eq!(report.scan, ScanReport { found: 3, inserted: 3 });
        assert_eq!(report.completed, 3);
        assert_eq!(report.errors, 0);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 2);
        assert!(list_untagged_images(store.connection())?.is_empty());

        let usage: i64 = store.connection().query_row(
            "SELECT usage_count FROM tag WHERE tag_id = 1",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(usage, 3);

        let hashed: i64 = store.connection().query_row(
            "SELECT COUNT(*) FROM image WHERE content_hash IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(hashed, 3);

        let again = tagger.run(&mut store)?;
        assert_eq!(again.scan.inserted, 0);
        assert_eq!(again.untagged, 0);
        Ok(())
    }

    #[test]
    fn file_limit_stops_early() -> Result<()> {
        let (_dir, mut store, mut config) = setup(&["a.png", "b.png", "c.png", "d.png"])?;
        config.process_n_files = 2;
        let report = Tagger::new(config, fixed()).run(&mut store)?;

        assert_eq!(report.completed, 2);
        assert_eq!(list_untagged_images(store.connection())?.len(), 2);
        Ok(())
    }

    #[test]
    fn classifier_failures_are_counted_and_skipped() -> Result<()> {
        let (_dir, mut store, config) = setup(&["a.png", "b.png", "c.png"])?;
        let report = Tagger::new(config, Arc::new(BrokenClassifier)).run(&mut store)?;

        assert_eq!(report.errors, 2);
        assert_eq!(report.completed, 0);
        assert_eq!(list_untagged_images(store.connection())?.len(), 3);
        Ok(())
    }

    #[test]
    fn vanished_files_are_skipped() -> Result<()> {
        let (dir, mut store, config) = setup(&["a.png", "b.png"])?;
        scan_and_store(&config, &mut store)?;
        let tagger = Tagger::new(config, fixed());
        fs::remove_file(dir.path().join("b.png"))?;

        let report = tagger.run(&mut store)?;
        assert_eq!(report.completed, 1);
        assert_eq!(report.skipped, 1);
        Ok(())
    }

    #[test]
    fn dry_run_writes_nothing() -> Result<()> {
        let (_dir, mut store, mut config) = setup(&["a.png"])?;
        config.commit_tags = false;
        let report = Tagger::new(config, fixed()).run(&mut store)?;

        assert_eq!(report.completed, 1);
        assert_eq!(list_untagged_images(store.connection())?.len(), 1);
        Ok(())
    }
}
