//! Image rows and classifier results: batched scan inserts and per-image tag writes.

use std::collections::BTreeMap;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::models::{
    ensure_unit, DirectoryId, Ext, ImageId, RatingScores, TagId, UntaggedImage,
};

/// A file found by the scanner, not yet classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRecord {
    pub directory_id: DirectoryId,
    pub filename: String,
    pub ext: Ext,
}

/// Buffers bare image rows and writes them in batches.
///
/// Each flush is one transaction, which bounds transaction size on large
/// trees. Rows that already exist are left untouched.
pub struct ScanWriter<'c> {
    conn: &'c mut Connection,
    buffer: Vec<ScanRecord>,
    buffer_limit: usize,
    inserted: usize,
}

impl<'c> ScanWriter<'c> {
    pub fn new(conn: &'c mut Connection, buffer_limit: usize) -> Self {
        Self {
            conn,
            buffer: Vec::new(),
            buffer_limit: buffer_limit.max(1),
            inserted: 0,
        }
    }

    pub fn add(&mut self, record: ScanRecord) -> Result<()> {
        self.buffer.push(record);
        if self.buffer.len() >= self.buffer_limit {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO image (directory_id, filename, extension_code)
                 VALUES (?1, ?2, ?3)",
            )?;
            for record in &self.buffer {
                self.inserted +=
                    stmt.execute(params![record.directory_id, record.filename, record.ext.code()])?;
            }
        }
        tx.commit()?;

        debug!("Flushed {} scanned images", self.buffer.len());
        self.buffer.clear();
        Ok(())
    }

    /// Read access for lookups made between adds.
    pub fn connection(&self) -> &Connection {
        self.conn
    }

    /// Rows actually created so far (existing paths are not counted).
    pub fn inserted(&self) -> usize {
        self.inserted
    }

    /// Flushes what is left and reports the number of new rows.
    pub fn finish(mut self) -> Result<usize> {
        self.flush()?;
        Ok(self.inserted)
    }
}

/// Inserts one bare image row unless the path is already known.
pub fn upsert_image(
    conn: &Connection,
    directory_id: DirectoryId,
    filename: &str,
    ext: Ext,
) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO image (directory_id, filename, extension_code) VALUES (?1, ?2, ?3)",
        params![directory_id, filename, ext.code()],
    )?;
    Ok(())
}

pub fn image_id(
    conn: &Connection,
    directory_id: DirectoryId,
    filename: &str,
) -> Result<Option<ImageId>> {
    Ok(conn
        .query_row(
            "SELECT image_id FROM image WHERE directory_id = ?1 AND filename = ?2",
            params![directory_id, filename],
            |row| row.get(0),
        )
        .optional()?)
}

/// Stores the classifier output for one image.
///
/// Sets all four rating scores (and the content hash when given) and adds
/// one edge per tag, in a single transaction. An edge that already exists
/// is skipped and logged. Returns the number of new edges.
pub fn record_tags(
    conn: &mut Connection,
    image_id: ImageId,
    ratings: &RatingScores,
    tag_probs: &BTreeMap<TagId, f32>,
    content_hash: Option<&str>,
) -> Result<usize> {
    ratings.validate()?;
    for (tag_id, prob) in tag_probs {
        ensure_unit(&format!("probability of tag {tag_id}"), *prob)?;
    }

    let tx = conn.transaction()?;
    let updated = tx.execute(
        "UPDATE image SET
            general = ?1,
            sensitive = ?2,
            questionable = ?3,
            explicit = ?4,
            content_hash = COALESCE(?5, content_hash)
         WHERE image_id = ?6",
        params![
            ratings.general,
            ratings.sensitive,
            ratings.questionable,
            ratings.explicit,
            content_hash,
            image_id
        ],
    )?;
    if updated == 0 {
        return Err(EngineError::consistency(format!(
            "image {image_id} does not exist; rating upsert returned no row"
        )));
    }

    let mut inserted = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO image_tag (image_id, tag_id, probability) VALUES (?1, ?2, ?3)",
        )?;
        for (tag_id, prob) in tag_probs {
            match stmt.execute(params![image_id, tag_id, prob])? {
                0 => warn!("Edge ({}, {}) already present, skipped", image_id, tag_id),
                n => inserted += n,
            }
        }
    }
    tx.commit()?;
    Ok(inserted)
}

/// Images whose rating scores are still unset.
pub fn list_untagged_images(conn: &Connection) -> Result<Vec<UntaggedImage>> {
    let mut stmt = conn.prepare(
        "SELECT image.image_id, image.directory_id, directory.path, image.filename
         FROM image JOIN directory USING (directory_id)
         WHERE image.general IS NULL
         ORDER BY image.image_id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(UntaggedImage {
            image_id: row.get(0)?,
            directory_id: row.get(1)?,
            directory: row.get(2)?,
            filename: row.get(3)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
