//! Bulk tag editing, duplicate review and housekeeping.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::catalog::find_tag_by_name;
use super::{placeholders, MAX_IN_LIST};
use crate::error::{EngineError, Result};
use crate::models::{
    ensure_unit, DuplicateGroup, DuplicateImage, ImageId, TagId, TagRef, TagType,
};

/// Probability given to tags attached by hand.
pub const MANUAL_PROBABILITY: f64 = 1.0;

/// Tags of `tag_type` at or above `min_probability` present on every image.
pub fn common_tags(
    conn: &Connection,
    image_ids: &[ImageId],
    tag_type: TagType,
    min_probability: f32,
) -> Result<Vec<TagRef>> {
    if image_ids.is_empty() {
        return Err(EngineError::invalid("no images selected"));
    }
    ensure_unit("min_probability", min_probability)?;

    let mut stmt = conn.prepare(
        "SELECT tag.tag_id, tag.name
         FROM tag JOIN image_tag ON tag.tag_id = image_tag.tag_id
         WHERE image_tag.image_id = ?1
           AND image_tag.probability >= ?2
           AND tag.tag_type_id = ?3",
    )?;

    let mut common: Option<BTreeSet<TagRef>> = None;
    for image_id in image_ids {
        let tags = stmt
            .query_map(
                params![image_id, f64::from(min_probability), tag_type.id()],
                |row| {
                    Ok(TagRef {
                        tag_id: row.get(0)?,
                        tag_name: row.get(1)?,
                    })
                },
            )?
            .collect::<rusqlite::Result<BTreeSet<_>>>()?;

        let next = match common.take() {
            None => tags,
            Some(acc) => acc.intersection(&tags).cloned().collect(),
        };
        if next.is_empty() {
            return Ok(Vec::new());
        }
        common = Some(next);
    }

    let mut tags: Vec<TagRef> = common.unwrap_or_default().into_iter().collect();
    tags.sort_by(|a, b| a.tag_name.cmp(&b.tag_name).then(a.tag_id.cmp(&b.tag_id)));
    Ok(tags)
}

/// Desired tag state for a multi-image selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagDiff {
    pub image_ids: Vec<ImageId>,
    /// Existing tags the selection should share afterwards.
    pub desired_tag_ids: Vec<TagId>,
    /// Free-text labels; missing ones are created.
    #[serde(default)]
    pub new_tag_texts: Vec<String>,
    /// Type of the common-tag view being edited, also used for new tags.
    pub tag_type: TagType,
    /// Floor used when computing the current common tags.
    #[serde(default)]
    pub min_probability: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffOutcome {
    pub removed: Vec<TagId>,
    pub added: Vec<TagId>,
    pub created: Vec<TagRef>,
}

/// Reconciles the selection's common tags with `diff.desired_tag_ids` plus
/// the tags named by `diff.new_tag_texts`.
///
/// Only the difference is touched: tags common now but not desired lose
/// their edges on every selected image, desired tags not common now are
/// attached at probability 1.0. Other edges stay as they are.
pub fn apply_tag_diff(conn: &mut Connection, diff: &TagDiff) -> Result<DiffOutcome> {
    if diff.image_ids.is_empty() {
        return Err(EngineError::invalid("no images selected"));
    }

    let tx = conn.transaction()?;
    let current: BTreeSet<TagId> =
        common_tags(&tx, &diff.image_ids, diff.tag_type, diff.min_probability)?
            .into_iter()
            .map(|t| t.tag_id)
            .collect();
    let mut desired: BTreeSet<TagId> = diff.desired_tag_ids.iter().copied().collect();

    // Free-text tags count as desired, so they must resolve before the diff.
    let mut created = Vec::new();
    for text in &diff.new_tag_texts {
        let name = normalize_tag_text(text);
        if name.is_empty() {
            continue;
        }
        let tag_id = match find_tag_by_name(&tx, &name)? {
            Some(id) => id,
            None => {
                let id = create_tag(&tx, &name, diff.tag_type)?;
                created.push(TagRef {
                    tag_id: id,
                    tag_name: name,
                });
                id
            }
        };
        desired.insert(tag_id);
    }

    let to_delete: Vec<TagId> = current.difference(&desired).copied().collect();
    let to_add: Vec<TagId> = desired.difference(&current).copied().collect();

    delete_edges(&tx, &diff.image_ids, &to_delete)?;
    add_manual_edges(&tx, &diff.image_ids, &to_add)?;
    tx.commit()?;

    info!(
        "Tag diff on {} images: -{} +{} ({} new tags)",
        diff.image_ids.len(),
        to_delete.len(),
        to_add.len(),
        created.len()
    );
    Ok(DiffOutcome {
        removed: to_delete,
        added: to_add,
        created,
    })
}

/// Creates an ad-hoc tag under the next unused tag id.
pub fn create_tag(conn: &Connection, name: &str, tag_type: TagType) -> Result<TagId> {
    let next: TagId = conn.query_row("SELECT COALESCE(MAX(tag_id), -1) + 1 FROM tag", [], |row| {
        row.get(0)
    })?;
    conn.execute(
        "INSERT INTO tag (tag_id, name, tag_type_id) VALUES (?1, ?2, ?3)",
        params![next, name, tag_type.id()],
    )?;
    debug!("Created tag {} '{}' ({})", next, name, tag_type);
    Ok(next)
}

fn normalize_tag_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join("_")
}

fn delete_edges(conn: &Connection, image_ids: &[ImageId], tag_ids: &[TagId]) -> Result<usize> {
    if tag_ids.is_empty() {
        return Ok(0);
    }
    let mut removed = 0;
    for chunk in image_ids.chunks(MAX_IN_LIST) {
        let sql = format!(
            "DELETE FROM image_tag WHERE tag_id = ? AND image_id IN ({})",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        for tag_id in tag_ids {
            let values = std::iter::once(tag_id).chain(chunk.iter());
            removed += stmt.execute(params_from_iter(values))?;
        }
    }
    Ok(removed)
}

fn add_manual_edges(conn: &Connection, image_ids: &[ImageId], tag_ids: &[TagId]) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO image_tag (image_id, tag_id, probability) VALUES (?1, ?2, ?3)
         ON CONFLICT(image_id, tag_id) DO UPDATE SET probability = excluded.probability",
    )?;
    for image_id in image_ids {
        for tag_id in tag_ids {
            stmt.execute(params![image_id, tag_id, MANUAL_PROBABILITY])?;
        }
    }
    Ok(())
}

/// Replaces `to`'s edges with a copy of `from`'s.
pub fn copy_tags(conn: &mut Connection, from: ImageId, to: ImageId) -> Result<usize> {
    if from == to {
        return Ok(0);
    }
    let tx = conn.transaction()?;
    for id in [from, to] {
        let exists: Option<i64> = tx
            .query_row("SELECT 1 FROM image WHERE image_id = ?1", params![id], |row| row.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(EngineError::invalid(format!("image {id} does not exist")));
        }
    }
    tx.execute("DELETE FROM image_tag WHERE image_id = ?1", params![to])?;
    let copied = tx.execute(
        "INSERT INTO image_tag (image_id, tag_id, probability)
         SELECT ?1, tag_id, probability FROM image_tag WHERE image_id = ?2",
        params![to, from],
    )?;
    tx.commit()?;
    Ok(copied)
}

/// Images sharing a content hash, each with its full tag name set.
pub fn find_duplicates(conn: &Connection) -> Result<Vec<DuplicateGroup>> {
    let mut stmt = conn.prepare(
        "SELECT image.content_hash, image.image_id, directory.path, image.filename
         FROM image JOIN directory USING (directory_id)
         WHERE image.content_hash IN (
             SELECT content_hash FROM image
             WHERE content_hash IS NOT NULL
             GROUP BY content_hash
             HAVING COUNT(*) > 1
         )
         ORDER BY image.content_hash, image.image_id",
    )?;
    let rows = stmt
        .query_map([], |row| {
            let directory: String = row.get(2)?;
            let filename: String = row.get(3)?;
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, ImageId>(1)?,
                PathBuf::from(directory).join(filename),
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut tag_stmt = conn.prepare(
        "SELECT tag.name FROM image_tag JOIN tag ON tag.tag_id = image_tag.tag_id
         WHERE image_tag.image_id = ?1",
    )?;
    let mut groups: BTreeMap<String, Vec<DuplicateImage>> = BTreeMap::new();
    for (hash, image_id, image_path) in rows {
        let tags = tag_stmt
            .query_map(params![image_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<BTreeSet<_>>>()?;
        groups.entry(hash).or_default().push(DuplicateImage {
            image_id,
            image_path,
            tags,
        });
    }

    Ok(groups
        .into_iter()
        .map(|(content_hash, images)| DuplicateGroup {
            content_hash,
            images,
        })
        .collect())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateResolution {
    pub removed: Vec<ImageId>,
    /// Hashes left for a person to look at.
    pub manual: Vec<String>,
}

/// Collapses duplicate pairs that are safe to collapse.
///
/// A pair is collapsed when both images carry the same tags and at least
/// one file is still on disk; the first such image survives. Pairs with
/// differing tags, pairs with no file left, and any hash shared by more
/// than two images are reported for manual review.
pub fn resolve_duplicates(conn: &mut Connection) -> Result<DuplicateResolution> {
    resolve_duplicates_with(conn, |path| path.is_file())
}

pub fn resolve_duplicates_with<F>(conn: &mut Connection, file_exists: F) -> Result<DuplicateResolution>
where
    F: Fn(&Path) -> bool,
{
    let mut resolution = DuplicateResolution::default();
    for group in find_duplicates(conn)? {
        let [first, second] = group.images.as_slice() else {
            warn!(
                "{} images share hash {}, leaving them for manual review",
                group.images.len(),
                group.content_hash
            );
            resolution.manual.push(group.content_hash);
            continue;
        };

        if first.tags != second.tags {
            resolution.manual.push(group.content_hash);
            continue;
        }

        let (survivor, victim) = if file_exists(&first.image_path) {
            (first, second)
        } else if file_exists(&second.image_path) {
            (second, first)
        } else {
            resolution.manual.push(group.content_hash);
            continue;
        };

        debug!(
            "Keeping {:?}, removing duplicate {:?}",
            survivor.image_path, victim.image_path
        );
        remove_image(conn, victim.image_id)?;
        resolution.removed.push(victim.image_id);
    }
    Ok(resolution)
}

/// Sets every tag's usage count to its current number of edges.
pub fn recompute_usage_counts(conn: &Connection) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE tag SET usage_count =
             (SELECT COUNT(*) FROM image_tag WHERE image_tag.tag_id = tag.tag_id)",
        [],
    )?)
}

/// Deletes an image and its edges. Returns false if it did not exist.
pub fn remove_image(conn: &mut Connection, image_id: ImageId) -> Result<bool> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM image_tag WHERE image_id = ?1", params![image_id])?;
    let removed = tx.execute("DELETE FROM image WHERE image_id = ?1", params![image_id])?;
    tx.commit()?;
    Ok(removed > 0)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub scanned: usize,
    pub removed: Vec<PathBuf>,
}

/// Removes every image row whose file is gone from disk.
pub fn cleanup_missing_files(conn: &mut Connection) -> Result<CleanupReport> {
    let rows = {
        let mut stmt = conn.prepare(
            "SELECT image.image_id, directory.path, image.filename
             FROM image JOIN directory USING (directory_id)
             ORDER BY image.image_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let directory: String = row.get(1)?;
                let filename: String = row.get(2)?;
                Ok((row.get::<_, ImageId>(0)?, PathBuf::from(directory).join(filename)))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };

    let mut report = CleanupReport {
        scanned: rows.len(),
        removed: Vec::new(),
    };
    for (image_id, path) in rows {
        if path.exists() {
            continue;
        }
        warn!("Missing file for image {}: {:?}", image_id, path);
        remove_image(conn, image_id)?;
        report.removed.push(path);
    }
    info!(
        "Cleanup scanned {} images, removed {}",
        report.scanned,
        report.removed.len()
    );
    Ok(report)
}
