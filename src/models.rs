//! Row and result types shared by the store, the pipeline and the service.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

pub type DirectoryId = i64;
pub type ImageId = i64;
pub type TagId = i64;

/// Fixed tag-type taxonomy. The numeric ids are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagType {
    General,
    Character,
    Rating,
    /// Ad-hoc labels created by hand during curation.
    Future,
}

impl TagType {
    pub const ALL: [TagType; 4] = [
        TagType::General,
        TagType::Character,
        TagType::Rating,
        TagType::Future,
    ];

    pub fn id(self) -> i64 {
        match self {
            TagType::General => 0,
            TagType::Character => 4,
            TagType::Rating => 9,
            TagType::Future => 32,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TagType::General => "general",
            TagType::Character => "character",
            TagType::Rating => "rating",
            TagType::Future => "future",
        }
    }

    pub fn from_id(id: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.id() == id)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.name().eq_ignore_ascii_case(name.trim()))
    }
}

impl fmt::Display for TagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Image file extensions the scanner accepts, with their persisted codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ext {
    Jpg,
    Jpeg,
    Png,
    Gif,
    Webp,
    Avif,
    Apng,
    Tif,
    Tiff,
}

impl Ext {
    pub const ALL: [Ext; 9] = [
        Ext::Jpg,
        Ext::Jpeg,
        Ext::Png,
        Ext::Gif,
        Ext::Webp,
        Ext::Avif,
        Ext::Apng,
        Ext::Tif,
        Ext::Tiff,
    ];

    pub fn code(self) -> i64 {
        match self {
            Ext::Jpg => 1,
            Ext::Jpeg => 2,
            Ext::Png => 3,
            Ext::Gif => 4,
            Ext::Webp => 5,
            Ext::Avif => 6,
            Ext::Apng => 7,
            Ext::Tif => 8,
            Ext::Tiff => 9,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Ext::Jpg => "jpg",
            Ext::Jpeg => "jpeg",
            Ext::Png => "png",
            Ext::Gif => "gif",
            Ext::Webp => "webp",
            Ext::Avif => "avif",
            Ext::Apng => "apng",
            Ext::Tif => "tif",
            Ext::Tiff => "tiff",
        }
    }

    pub fn parse(ext: &str) -> Option<Self> {
        let ext = ext.trim().trim_start_matches('.');
        Self::ALL
            .into_iter()
            .find(|e| e.as_str().eq_ignore_ascii_case(ext))
    }

    /// Extension of `path`, if it is one we index.
    pub fn of_path(path: &Path) -> Option<Self> {
        path.extension().and_then(|e| e.to_str()).and_then(Self::parse)
    }

    /// Parses a comma separated list such as `png,jpeg,jpg,gif`.
    pub fn parse_list(list: &str) -> Result<Vec<Self>> {
        let mut exts = Vec::new();
        for part in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let ext = Self::parse(part)
                .ok_or_else(|| EngineError::Config(format!("unknown image extension '{part}'")))?;
            if !exts.contains(&ext) {
                exts.push(ext);
            }
        }
        if exts.is_empty() {
            return Err(EngineError::Config("no valid extensions configured".into()));
        }
        Ok(exts)
    }
}

/// The four content-rating scalars stored on a tagged image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatingScores {
    pub general: f32,
    pub sensitive: f32,
    pub questionable: f32,
    pub explicit: f32,
}

impl RatingScores {
    pub fn new(general: f32, sensitive: f32, questionable: f32, explicit: f32) -> Self {
        Self {
            general,
            sensitive,
            questionable,
            explicit,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("general", self.general),
            ("sensitive", self.sensitive),
            ("questionable", self.questionable),
            ("explicit", self.explicit),
        ] {
            ensure_unit(name, value)?;
        }
        Ok(())
    }
}

/// One of the four rating columns, used where a caller picks a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rating {
    General,
    Sensitive,
    Questionable,
    Explicit,
}

impl Rating {
    pub(crate) fn column(self) -> &'static str {
        match self {
            Rating::General => "general",
            Rating::Sensitive => "sensitive",
            Rating::Questionable => "questionable",
            Rating::Explicit => "explicit",
        }
    }
}

/// Minimum values an image must meet to be returned by a search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchFilters {
    pub f_tag: f32,
    pub f_general: f32,
    pub f_sensitive: f32,
    pub f_explicit: f32,
    pub f_questionable: f32,
}

impl SearchFilters {
    pub fn validate(&self) -> Result<()> {
        ensure_unit("f_tag", self.f_tag)?;
        ensure_unit("f_general", self.f_general)?;
        ensure_unit("f_sensitive", self.f_sensitive)?;
        ensure_unit("f_explicit", self.f_explicit)?;
        ensure_unit("f_questionable", self.f_questionable)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub tag_ids: Vec<TagId>,
    #[serde(default)]
    pub filters: SearchFilters,
    #[serde(default)]
    pub page: u32,
    pub per_page: u32,
}

impl SearchRequest {
    pub fn new(tag_ids: Vec<TagId>, page: u32, per_page: u32) -> Self {
        Self {
            tag_ids,
            filters: SearchFilters::default(),
            page,
            per_page,
        }
    }

    pub fn with_filters(mut self, filters: SearchFilters) -> Self {
        self.filters = filters;
        self
    }

    /// Distinct required tag ids, in first-seen order.
    pub fn distinct_tag_ids(&self) -> Vec<TagId> {
        let mut seen = BTreeSet::new();
        self.tag_ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.tag_ids.is_empty() {
            return Err(EngineError::invalid("at least one tag id is required"));
        }
        if self.per_page == 0 {
            return Err(EngineError::invalid("per_page must be greater than zero"));
        }
        self.filters.validate()
    }

    /// Row offset for the requested page. Pages 0 and 1 both start at row 0.
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.per_page)
    }
}

/// A fully hydrated search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub image_id: ImageId,
    pub image_path: PathBuf,
    /// `None` for images the classifier has not processed yet.
    pub rating: Option<RatingScores>,
    pub general: BTreeMap<String, f32>,
    pub character: BTreeMap<String, f32>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub rating_tags: BTreeMap<String, f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchPage {
    pub results: Vec<ImageRecord>,
    pub total: u64,
}

/// Catalog entry as served to tag pickers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSummary {
    pub tag_id: TagId,
    pub tag_name: String,
    pub tag_type_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TagRef {
    pub tag_id: TagId,
    pub tag_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagFrequency {
    pub tag_id: TagId,
    pub tag_name: String,
    pub image_count: i64,
}

/// An image row waiting for the classifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UntaggedImage {
    pub image_id: ImageId,
    pub directory_id: DirectoryId,
    pub directory: String,
    pub filename: String,
}

impl UntaggedImage {
    pub fn path(&self) -> PathBuf {
        Path::new(&self.directory).join(&self.filename)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateImage {
    pub image_id: ImageId,
    pub image_path: PathBuf,
    pub tags: BTreeSet<String>,
}

/// Images sharing one content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub content_hash: String,
    pub images: Vec<DuplicateImage>,
}

pub(crate) fn ensure_unit(name: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(EngineError::invalid(format!(
            "{name} must be within [0, 1], got {value}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_type_ids_round_trip() {
        for tag_type in TagType::ALL {
            assert_eq!(TagType::from_id(tag_type.id()), Some(tag_type));
        }
        assert_eq!(TagType::from_id(1), None);
        assert_eq!(TagType::from_name("Character"), Some(TagType::Character));
    }

    #[test]
    fn ext_parsing_is_case_insensitive() {
        assert_eq!(Ext::parse("PNG"), Some(Ext::Png));
        assert_eq!(Ext::parse(".jpeg"), Some(Ext::Jpeg));
        assert_eq!(Ext::of_path(Path::new("/a/b/pic.Gif")), Some(Ext::Gif));
        assert_eq!(Ext::of_path(Path::new("/a/b/notes.txt")), None);
    }

    #[test]
    fn ext_list_rejects_unknown_entries() {
        let exts = Ext::parse_list("png, jpeg,jpg,gif,png").unwrap();
        assert_eq!(exts, vec![Ext::Png, Ext::Jpeg, Ext::Jpg, Ext::Gif]);
        assert!(Ext::parse_list("png,bmp").is_err());
        assert!(Ext::parse_list(" , ").is_err());
    }

    #[test]
    fn first_two_pages_share_an_offset() {
        let page0 = SearchRequest::new(vec![1], 0, 25);
        let page1 = SearchRequest::new(vec![1], 1, 25);
        let page3 = SearchRequest::new(vec![1], 3, 25);
        assert_eq!(page0.offset(), 0);
        assert_eq!(page1.offset(), 0);
        assert_eq!(page3.offset(), 50);
    }

    #[test]
    fn search_request_validation() {
        assert!(SearchRequest::new(vec![], 1, 10).validate().is_err());
        assert!(SearchRequest::new(vec![1], 1, 0).validate().is_err());

        let bad = SearchFilters {
            f_sensitive: 1.5,
            ..SearchFilters::default()
        };
        let err = SearchRequest::new(vec![1], 1, 10)
            .with_filters(bad)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("f_sensitive"));
    }

    #[test]
    fn distinct_tag_ids_drop_repeats() {
        let req = SearchRequest::new(vec![5, 3, 5, 1, 3], 1, 10);
        assert_eq!(req.distinct_tag_ids(), vec![5, 3, 1]);
    }

    #[test]
    fn rating_scores_must_be_unit_interval() {
        assert!(RatingScores::new(0.9, 0.1, 0.0, 0.0).validate().is_ok());
        assert!(RatingScores::new(0.9, -0.1, 0.0, 0.0).validate().is_err());
        assert!(RatingScores::new(f32::NAN, 0.1, 0.0, 0.0).validate().is_err());
    }
}
