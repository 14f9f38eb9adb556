//! Request-level entry points.
//!
//! Every call opens its own [`Store`] and drops it before returning, so the
//! connection is released on every exit path. Shared state is limited to the
//! daily caches and the recently-applied tag list.

use std::collections::VecDeque;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{bounded, RecvTimeoutError};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::database::cache::{day_bucket, DailyCache};
use crate::database::curation::{self, CleanupReport, DiffOutcome, DuplicateResolution, TagDiff};
use crate::database::{catalog, query, Store, StoreConfig};
use crate::error::{EngineError, Result};
use crate::media::mimetype::{detect_mimetype, sniff_extension};
use crate::ml::engine::Classifier;
use crate::models::{
    DuplicateGroup, Ext, ImageId, ImageRecord, Rating, SearchFilters, SearchPage, SearchRequest,
    TagFrequency, TagId, TagRef, TagSummary, TagType,
};
use crate::utils::config::Config;
use crate::vocabulary::Vocabulary;

const RECENT_TAGS: usize = 20;

/// An uploaded file that is deleted when dropped.
#[derive(Debug)]
pub struct TempUpload {
    path: PathBuf,
}

impl TempUpload {
    /// Takes ownership of a file already on disk.
    pub fn adopt(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Writes `bytes` to `dir/name` and takes ownership of the result.
    pub fn write(dir: &Path, name: &str, bytes: &[u8]) -> Result<Self> {
        let file_name = Path::new(name)
            .file_name()
            .ok_or_else(|| EngineError::invalid(format!("bad upload name {name:?}")))?;
        let path = dir.join(file_name);
        fs::write(&path, bytes)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempUpload {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed upload {:?}", self.path),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove upload {:?}: {}", self.path, e),
        }
    }
}

/// Result of classify-then-search.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UploadOutcome {
    Completed { tags: Vec<TagId>, page: SearchPage },
    TimedOut { limit_secs: f64 },
    Failed { message: String },
}

/// A file cleared for serving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServedFile {
    pub path: PathBuf,
    pub mime_type: String,
}

pub struct TagIndex {
    store: StoreConfig,
    tag_catalog: DailyCache<Vec<TagSummary>>,
    tagged_count: DailyCache<i64>,
    recent: Mutex<VecDeque<TagRef>>,
    media_roots: Vec<PathBuf>,
    extensions: Vec<Ext>,
    upload_time_limit: Duration,
    classifier: Option<Arc<dyn Classifier>>,
}

impl TagIndex {
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store: config.store(),
            tag_catalog: DailyCache::new(),
            tagged_count: DailyCache::new(),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_TAGS)),
            media_roots: config.web_media_roots.clone(),
            extensions: config.extensions()?,
            upload_time_limit: config.upload_time_limit(),
            classifier: None,
        })
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    fn open(&self) -> Result<Store> {
        self.store.open()
    }

    /// Creates the schema and loads the vocabulary.
    pub fn init(&self, vocabulary: &Vocabulary) -> Result<i64> {
        let mut store = self.open()?;
        catalog::load_vocabulary(store.connection_mut(), vocabulary)
    }

    /// Tags in use, served from the catalog cache.
    pub fn list_tags(&self) -> Result<Vec<TagSummary>> {
        self.tag_catalog
            .get_or_try_insert(&day_bucket(), || catalog::list_tags(self.open()?.connection()))
    }

    pub fn search_tags(&self, needle: &str, tag_type: Option<TagType>) -> Result<Vec<TagSummary>> {
        catalog::search_tags(self.open()?.connection(), needle, tag_type)
    }

    pub fn tagged_image_count(&self) -> Result<i64> {
        self.tagged_count.get_or_try_insert(&day_bucket(), || {
            query::tagged_image_count(self.open()?.connection())
        })
    }

    pub fn top_tags(&self, rating: Rating, tag_type: TagType) -> Result<Vec<TagFrequency>> {
        query::top_tags(self.open()?.connection(), rating, tag_type)
    }

    pub fn search_images(&self, request: &SearchRequest) -> Result<SearchPage> {
        request.validate()?;
        query::search_images(self.open()?.connection(), request)
    }

    pub fn image_by_hash(&self, content_hash: &str) -> Result<Option<ImageRecord>> {
        query::image_by_hash(self.open()?.connection(), content_hash)
    }

    pub fn images_by_tag_name(&self, tag_name: &str) -> Result<Vec<ImageRecord>> {
        query::images_by_tag_name(self.open()?.connection(), tag_name)
    }

    pub fn common_tags(
        &self,
        image_ids: &[ImageId],
        tag_type: TagType,
        min_probability: f32,
    ) -> Result<Vec<TagRef>> {
        if image_ids.is_empty() {
            return Err(EngineError::invalid("no images selected"));
        }
        curation::common_tags(self.open()?.connection(), image_ids, tag_type, min_probability)
    }

    /// Applies `diff` and remembers the tags it attached.
    pub fn apply_tag_diff(&self, diff: &TagDiff) -> Result<DiffOutcome> {
        if diff.image_ids.is_empty() {
            return Err(EngineError::invalid("no images selected"));
        }
        let mut store = self.open()?;
        let outcome = curation::apply_tag_diff(store.connection_mut(), diff)?;

        let names = catalog::tag_names(store.connection(), &outcome.added)?;
        let added: Vec<TagRef> = outcome
            .added
            .iter()
            .filter_map(|id| {
                names.get(id).map(|name| TagRef {
                    tag_id: *id,
                    tag_name: name.clone(),
                })
            })
            .collect();
        self.remember(added);
        Ok(outcome)
    }

    fn remember(&self, tags: Vec<TagRef>) {
        let mut recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
        for tag in tags {
            recent.retain(|t| t.tag_id != tag.tag_id);
            recent.push_front(tag);
        }
        recent.truncate(RECENT_TAGS);
    }

    /// Tags most recently attached through [`TagIndex::apply_tag_diff`], newest first.
    pub fn recent_tags(&self) -> Vec<TagRef> {
        let recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
        recent.iter().cloned().collect()
    }

    pub fn find_duplicates(&self) -> Result<Vec<DuplicateGroup>> {
        curation::find_duplicates(self.open()?.connection())
    }

    pub fn resolve_duplicates(&self) -> Result<DuplicateResolution> {
        curation::resolve_duplicates(self.open()?.connection_mut())
    }

    pub fn remove_image(&self, image_id: ImageId) -> Result<bool> {
        curation::remove_image(self.open()?.connection_mut(), image_id)
    }

    pub fn copy_tags(&self, from: ImageId, to: ImageId) -> Result<usize> {
        curation::copy_tags(self.open()?.connection_mut(), from, to)
    }

    pub fn cleanup_missing_files(&self) -> Result<CleanupReport> {
        curation::cleanup_missing_files(self.open()?.connection_mut())
    }

    pub fn recompute_usage_counts(&self) -> Result<usize> {
        curation::recompute_usage_counts(self.open()?.connection())
    }

    /// Resolves a requested file to a path that is safe to serve.
    ///
    /// The file must exist, sit under one of the media roots once symlinks
    /// and `..` are resolved, and carry an indexed extension.
    pub fn serve_path(&self, requested: &Path) -> Result<ServedFile> {
        Ext::of_path(requested)
            .filter(|ext| self.extensions.contains(ext))
            .ok_or_else(|| EngineError::invalid(format!("not a servable image: {:?}", requested)))?;

        let path = requested
            .canonicalize()
            .map_err(|_| EngineError::NotFound(requested.to_path_buf()))?;
        if !path.is_file() {
            return Err(EngineError::NotFound(requested.to_path_buf()));
        }

        let allowed = self
            .media_roots
            .iter()
            .filter_map(|root| root.canonicalize().ok())
            .any(|root| path.starts_with(root));
        if !allowed {
            return Err(EngineError::invalid(format!(
                "{:?} is outside the media roots",
                requested
            )));
        }
        let mime_type = detect_mimetype(&path)?;
        debug!("Serving {:?} as {}", path, mime_type);
        Ok(ServedFile { path, mime_type })
    }

    /// Classifies an uploaded image and searches with the tags it received.
    ///
    /// The work runs on a background thread bounded by the upload time limit.
    /// The upload is removed when this returns, whatever the outcome.
    pub fn search_by_upload(
        &self,
        upload: TempUpload,
        filters: SearchFilters,
        page: u32,
        per_page: u32,
    ) -> Result<UploadOutcome> {
        let classifier = self
            .classifier
            .clone()
            .ok_or_else(|| EngineError::Config("no classifier configured".into()))?;
        filters.validate()?;
        if per_page == 0 {
            return Err(EngineError::invalid("per_page must be > 0"));
        }
        match sniff_extension(upload.path())? {
            Some(ext) if self.extensions.contains(&ext) => {}
            _ => return Err(EngineError::invalid("upload is not an accepted image")),
        }

        let (tx, rx) = bounded(1);
        let cancelled = Arc::new(AtomicBool::new(false));
        let worker_cancelled = Arc::clone(&cancelled);
        let store = self.store.clone();
        let path = upload.path().to_path_buf();

        thread::spawn(move || {
            let result = classify_and_search(
                classifier.as_ref(),
                &store,
                &path,
                filters,
                page,
                per_page,
                &worker_cancelled,
            );
            // The receiver is gone after a timeout.
            let _ = tx.send(result);
        });

        let outcome = match rx.recv_timeout(self.upload_time_limit) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => UploadOutcome::Failed {
                message: e.to_string(),
            },
            Err(RecvTimeoutError::Timeout) => {
                cancelled.store(true, Ordering::SeqCst);
                warn!(
                    "Upload search exceeded {:?}, giving up",
                    self.upload_time_limit
                );
                UploadOutcome::TimedOut {
                    limit_secs: self.upload_time_limit.as_secs_f64(),
                }
            }
            Err(RecvTimeoutError::Disconnected) => UploadOutcome::Failed {
                message: "upload worker stopped without a result".into(),
            },
        };
        drop(upload);
        Ok(outcome)
    }
}

fn classify_and_search(
    classifier: &dyn Classifier,
    store: &StoreConfig,
    path: &Path,
    filters: SearchFilters,
    page: u32,
    per_page: u32,
    cancelled: &AtomicBool,
) -> Result<UploadOutcome> {
    let classified = classifier.classify(&[path.to_path_buf()])?;
    let Some(classification) = classified.into_iter().next() else {
        return Err(EngineError::Classifier("no result for upload".into()));
    };
    if cancelled.load(Ordering::SeqCst) {
        return Err(EngineError::Classifier("cancelled".into()));
    }

    let tags: Vec<TagId> = classification.tag_probabilities().into_keys().collect();
    info!("Upload classified with {} tags", tags.len());
    let page = if tags.is_empty() {
        SearchPage::default()
    } else {
        let request = SearchRequest::new(tags.clone(), page, per_page).with_filters(filters);
        query::search_images(store.open()?.connection(), &request)?
    };
    Ok(UploadOutcome::Completed { tags, page })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repo::{image_id, record_tags, upsert_image};
    use crate::ml::engine::Classification;
    use crate::models::RatingScores;
    use std::collections::BTreeMap;

    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

    struct SlowClassifier {
        delay: Duration,
    }

    impl Classifier for SlowClassifier {
        fn classify(&self, paths: &[PathBuf]) -> Result<Vec<Classification>> {
            thread::sleep(self.delay);
            Ok(paths
                .iter()
                .map(|_| Classification {
                    ratings: RatingScores::new(0.9, 0.1, 0.0, 0.0),
                    general: BTreeMap::from([(1, 0.9)]),
                    character: BTreeMap::new(),
                })
                .collect())
        }
    }

    struct FailingClassifier;

    impl Classifier for FailingClassifier {
        fn classify(&self, _: &[PathBuf]) -> Result<Vec<Classification>> {
            Err(EngineError::Classifier("bad model".into()))
        }
    }

    fn index(dir: &Path) -> TagIndex {
        let config = Config {
            db_path: dir.join("tagdex.db"),
            web_media_roots: vec![dir.join("media")],
            upload_time_limit_secs: 1,
            ..Config::default()
        };
        let index = TagIndex::new(&config).unwrap();
        index
            .init(&Vocabulary::from_entries([
                ("catA", TagType::General),
                ("tagB", TagType::General),
                ("ratingC", TagType::Rating),
            ]))
            .unwrap();
        index
    }

    fn tag_image(index: &TagIndex, dir: &str, name: &str, tags: &[(TagId, f32)]) -> ImageId {
        let mut store = index.open().unwrap();
        let dir_id = catalog::DirectoryCache::new()
            .ensure_directory_id(store.connection(), dir)
            .unwrap();
        upsert_image(store.connection(), dir_id, name, Ext::Png).unwrap();
        let id = image_id(store.connection(), dir_id, name).unwrap().unwrap();
        record_tags(
            store.connection_mut(),
            id,
            &RatingScores::new(0.9, 0.1, 0.0, 0.0),
            &tags.iter().copied().collect(),
            None,
        )
        .unwrap();
        id
    }

    fn upload(dir: &Path) -> TempUpload {
        TempUpload::write(dir, "query.png", PNG_MAGIC).unwrap()
    }

    #[test]
    fn counts_are_cached_for_the_day() {
        let dir = tempfile::tempdir().unwrap();
        let index = index(dir.path());
        tag_image(&index, "/p", "a.png", &[(1, 0.9)]);
        assert_eq!(index.tagged_image_count().unwrap(), 1);

        tag_image(&index, "/p", "b.png", &[(1, 0.9)]);
        assert_eq!(index.tagged_image_count().unwrap(), 1);

        index.recompute_usage_counts().unwrap();
        assert!(index.list_tags().is_ok());
    }

    #[test]
    fn empty_search_is_rejected_before_opening_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            db_path: dir.path().join("missing/dir/tagdex.db"),
            ..Config::default()
        };
        let index = TagIndex::new(&config).unwrap();
        let err = index.search_images(&SearchRequest::new(vec![], 1, 10)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn applied_tags_are_remembered_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let index = index(dir.path());
        let a = tag_image(&index, "/p", "a.png", &[(0, 0.9)]);

        let mut diff = TagDiff {
            image_ids: vec![a],
            desired_tag_ids: vec![0, 1],
            new_tag_texts: vec![],
            tag_type: TagType::General,
            min_probability: 0.5,
        };
        index.apply_tag_diff(&diff).unwrap();
        diff.desired_tag_ids = vec![0, 1];
        diff.new_tag_texts = vec!["fresh".into()];
        index.apply_tag_diff(&diff).unwrap();

        let recent: Vec<String> = index.recent_tags().into_iter().map(|t| t.tag_name).collect();
        assert_eq!(recent, vec!["fresh", "tagB"]);
    }

    #[test]
    fn serve_path_stays_inside_media_roots() {
        let dir = tempfile::tempdir().unwrap();
        let index = index(dir.path());
        let media = dir.path().join("media");
        fs::create_dir_all(&media).unwrap();
        fs::write(media.join("ok.png"), b"x").unwrap();
        fs::write(media.join("notes.txt"), b"x").unwrap();
        fs::write(dir.path().join("secret.png"), b"x").unwrap();

        assert!(index.serve_path(&media.join("ok.png")).is_ok());
        assert!(matches!(
            index.serve_path(&media.join("missing.png")),
            Err(EngineError::NotFound(_))
        ));
        assert!(index.serve_path(&media.join("notes.txt")).is_err());
        assert!(index.serve_path(&media.join("../secret.png")).is_err());
    }

    #[test]
    fn upload_search_finds_matching_images_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let index = index(dir.path()).with_classifier(Arc::new(SlowClassifier {
            delay: Duration::ZERO,
        }));
        tag_image(&index, "/p", "a.png", &[(1, 0.8)]);

        let upload = upload(dir.path());
        let path = upload.path().to_path_buf();
        let outcome = index
            .search_by_upload(upload, SearchFilters::default(), 1, 10)
            .unwrap();

        let UploadOutcome::Completed { tags, page } = outcome else {
            panic!("expected a completed search, got {outcome:?}");
        };
        assert_eq!(tags, vec![1]);
        assert_eq!(page.total, 1);
        assert!(!path.exists());
    }

    #[test]
    fn slow_classifier_times_out_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let index = index(dir.path()).with_classifier(Arc::new(SlowClassifier {
            delay: Duration::from_secs(3),
        }));

        let upload = upload(dir.path());
        let path = upload.path().to_path_buf();
        let outcome = index
            .search_by_upload(upload, SearchFilters::default(), 1, 10)
            .unwrap();

        assert_eq!(outcome, UploadOutcome::TimedOut { limit_secs: 1.0 });
        assert!(!path.exists());
    }

    #[test]
    fn classifier_errors_become_failed_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let index = index(dir.path()).with_classifier(Arc::new(FailingClassifier));
        let upload = upload(dir.path());
        let path = upload.path().to_path_buf();

        let outcome = index
            .search_by_upload(upload, SearchFilters::default(), 1, 10)
            .unwrap();
        assert!(matches!(outcome, UploadOutcome::Failed { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn non_image_uploads_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let index = index(dir.path()).with_classifier(Arc::new(FailingClassifier));
        let upload = TempUpload::write(dir.path(), "x.png", b"plain text").unwrap();
        let path = upload.path().to_path_buf();

        assert!(index
            .search_by_upload(upload, SearchFilters::default(), 1, 10)
            .unwrap_err()
            .is_user_error());
        assert!(!path.exists());
    }
}
