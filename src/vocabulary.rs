//! The fixed label vocabulary shipped with the tagging model.
//!
//! Each row's ordinal position is the label's tag id, both in the model's
//! output vector and in the `tag` table.

use std::path::Path;

use crate::error::{EngineError, Result};
use crate::models::{TagId, TagType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VocabEntry {
    pub name: String,
    pub tag_type: TagType,
}

#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    entries: Vec<VocabEntry>,
}

impl Vocabulary {
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, TagType)>,
        S: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(name, tag_type)| VocabEntry {
                    name: name.into(),
                    tag_type,
                })
                .collect(),
        }
    }

    /// Loads a `selected_tags.csv` style file.
    ///
    /// The header must name a label column (`name` or `tag_name`) and a type
    /// column (`category` or `tag_type_id`) holding the numeric type id.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("failed to read vocabulary {:?}: {}", path, e))
        })?;
        Self::parse_csv(&content)
    }

    pub fn parse_csv(content: &str) -> Result<Self> {
        let mut lines = content.lines().filter(|l| !l.trim().is_empty());
        let header = lines
            .next()
            .ok_or_else(|| EngineError::Config("vocabulary file is empty".into()))?;
        let columns = split_csv_line(header);
        let find = |names: &[&str]| {
            columns
                .iter()
                .position(|c| names.contains(&c.trim()))
                .ok_or_else(|| {
                    EngineError::Config(format!("vocabulary header lacks any of {:?}", names))
                })
        };
        let name_col = find(&["name", "tag_name"])?;
        let type_col = find(&["category", "tag_type_id"])?;

        let mut entries = Vec::new();
        for (row, line) in lines.enumerate() {
            let fields = split_csv_line(line);
            let (Some(name), Some(type_field)) = (fields.get(name_col), fields.get(type_col))
            else {
                return Err(EngineError::Config(format!(
                    "vocabulary row {} has too few columns",
                    row + 1
                )));
            };
            let tag_type = type_field
                .trim()
                .parse::<i64>()
                .ok()
                .and_then(TagType::from_id)
                .ok_or_else(|| {
                    EngineError::Config(format!(
                        "vocabulary row {} has unknown tag type '{}'",
                        row + 1,
                        type_field
                    ))
                })?;
            entries.push(VocabEntry {
                name: name.clone(),
                tag_type,
            });
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(tag_id, entry)` pairs in vocabulary order.
    pub fn iter(&self) -> impl Iterator<Item = (TagId, &VocabEntry)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| (idx as TagId, entry))
    }

    pub fn name(&self, tag_id: TagId) -> Option<&str> {
        usize::try_from(tag_id)
            .ok()
            .and_then(|idx| self.entries.get(idx))
            .map(|e| e.name.as_str())
    }

    /// Tag ids of one type, in vocabulary order.
    pub fn ids_of(&self, tag_type: TagType) -> Vec<TagId> {
        self.iter()
            .filter(|(_, e)| e.tag_type == tag_type)
            .map(|(id, _)| id)
            .collect()
    }
}

/// Splits one CSV record, honouring double-quoted fields and `""` escapes.
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_selected_tags_layout() {
        let csv = "tag_id,name,category,count\n\
                   9999999,general,9,807691\n\
                   9999998,sensitive,9,617\n\
                   470575,1girl,0,4225150\n\
                   1,\"hatsune_miku\",4,101\n";
        let vocab = Vocabulary::parse_csv(csv).unwrap();

        assert_eq!(vocab.len(), 4);
        assert_eq!(vocab.name(2), Some("1girl"));
        assert_eq!(vocab.ids_of(TagType::Rating), vec![0, 1]);
        assert_eq!(vocab.ids_of(TagType::Character), vec![3]);
    }

    #[test]
    fn accepts_tag_name_and_tag_type_id_headers() {
        let csv = "tag_name,tag_type_id\ncatA,0\ntagB,0\nratingC,9\n";
        let vocab = Vocabulary::parse_csv(csv).unwrap();
        assert_eq!(vocab.ids_of(TagType::General), vec![0, 1]);
        assert_eq!(vocab.name(5), None);
        assert_eq!(vocab.name(-1), None);
    }

    #[test]
    fn rejects_unknown_types_and_headers() {
        assert!(Vocabulary::parse_csv("tag_name,tag_type_id\nx,7\n").is_err());
        assert!(Vocabulary::parse_csv("label,kind\nx,0\n").is_err());
        assert!(Vocabulary::parse_csv("").is_err());
    }

    #[test]
    fn quoted_fields_keep_commas() {
        assert_eq!(
            split_csv_line("1,\"a,b\",\"say \"\"hi\"\"\""),
            vec!["1", "a,b", "say \"hi\""]
        );
    }
}
