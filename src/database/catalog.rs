//! Tag vocabulary, tag types and directory ids.

use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::models::{DirectoryId, TagId, TagSummary, TagType};
use crate::vocabulary::Vocabulary;

/// Process-local memo of directory path to id.
///
/// Append-only: entries are never evicted, a restart starts it empty.
#[derive(Debug, Default)]
pub struct DirectoryCache {
    ids: HashMap<String, DirectoryId>,
}

impl DirectoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure_directory_id(&mut self, conn: &Connection, path: &str) -> Result<DirectoryId> {
        if path.is_empty() {
            return Err(EngineError::invalid("directory path cannot be empty"));
        }
        if let Some(id) = self.ids.get(path) {
            return Ok(*id);
        }

        conn.execute(
            "INSERT OR IGNORE INTO directory (path) VALUES (?1)",
            params![path],
        )?;
        let id: DirectoryId = conn
            .query_row(
                "SELECT directory_id FROM directory WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| {
                EngineError::consistency(format!("no directory_id after upsert of {path:?}"))
            })?;

        self.ids.insert(path.to_string(), id);
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

pub fn seed_tag_types(conn: &Connection) -> Result<()> {
    let mut stmt =
        conn.prepare("INSERT OR IGNORE INTO tag_type (tag_type_id, name) VALUES (?1, ?2)")?;
    for tag_type in TagType::ALL {
        stmt.execute(params![tag_type.id(), tag_type.name()])?;
    }
    Ok(())
}

pub fn tag_count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM tag", [], |row| row.get(0))?)
}

/// Seeds tag types and inserts every vocabulary label under its ordinal id.
///
/// Existing rows are left alone. Fails when the catalog ends up smaller
/// than the vocabulary; ad-hoc tags may push it above.
pub fn load_vocabulary(conn: &mut Connection, vocabulary: &Vocabulary) -> Result<i64> {
    let tx = conn.transaction()?;
    seed_tag_types(&tx)?;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO tag (tag_id, name, tag_type_id) VALUES (?1, ?2, ?3)",
        )?;
        for (tag_id, entry) in vocabulary.iter() {
            stmt.execute(params![tag_id, entry.name, entry.tag_type.id()])?;
        }
    }

    let count = tag_count(&tx)?;
    let expected = vocabulary.len() as i64;
    if count < expected {
        // Dropping the transaction rolls the partial load back.
        return Err(EngineError::consistency(format!(
            "tag catalog holds {count} tags, vocabulary declares {expected}"
        )));
    }
    tx.commit()?;

    info!("Tag catalog ready: {}/{} vocabulary tags", count, expected);
    Ok(count)
}

/// True once the catalog holds at least `expected` tags.
pub fn is_loaded(conn: &Connection, expected: usize) -> Result<bool> {
    let count = tag_count(conn)?;
    debug!("Found {}/{} tags in database", count, expected);
    Ok(count >= expected as i64)
}

/// Tags in use, lower-cased and ordered by name.
pub fn list_tags(conn: &Connection) -> Result<Vec<TagSummary>> {
    let mut stmt = conn.prepare(
        "SELECT tag.tag_id, lower(tag.name), tag_type.name
         FROM tag JOIN tag_type USING (tag_type_id)
         WHERE tag.usage_count > 0
         ORDER BY lower(tag.name), tag.tag_id",
    )?;
    let rows = stmt.query_map([], map_summary)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Case-insensitive substring search over tag names.
pub fn search_tags(
    conn: &Connection,
    needle: &str,
    tag_type: Option<TagType>,
) -> Result<Vec<TagSummary>> {
    let pattern = format!("%{}%", escape_like(needle.trim()));
    let mut stmt = conn.prepare(
        "SELECT tag.tag_id, tag.name, tag_type.name
         FROM tag JOIN tag_type USING (tag_type_id)
         WHERE tag.name LIKE ?1 ESCAPE '\\'
           AND (?2 IS NULL OR tag.tag_type_id = ?2)
         ORDER BY tag.name, tag.tag_id",
    )?;
    let rows = stmt.query_map(params![pattern, tag_type.map(TagType::id)], map_summary)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn find_tag_by_name(conn: &Connection, name: &str) -> Result<Option<TagId>> {
    Ok(conn
        .query_row(
            "SELECT tag_id FROM tag WHERE name = ?1 ORDER BY tag_id LIMIT 1",
            params![name],
            |row| row.get(0),
        )
        .optional()?)
}

/// Names for the given ids; unknown ids are absent from the map.
pub fn tag_names(conn: &Connection, tag_ids: &[TagId]) -> Result<HashMap<TagId, String>> {
    let mut stmt = conn.prepare("SELECT name FROM tag WHERE tag_id = ?1")?;
    let mut names = HashMap::with_capacity(tag_ids.len());
    for &tag_id in tag_ids {
        if let Some(name) = stmt
            .query_row(params![tag_id], |row| row.get::<_, String>(0))
            .optional()?
        {
            names.insert(tag_id, name);
        }
    }
    Ok(names)
}

fn map_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<TagSummary> {
    Ok(TagSummary {
        tag_id: row.get(0)?,
        tag_name: row.get(1)?,
        tag_type_name: row.get(2)?,
    })
}

fn escape_like(needle: &str) -> String {
    let mut out = String::with_capacity(needle.len());
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
