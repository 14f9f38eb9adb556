//! Tag-intersection search and result hydration.

use std::collections::HashMap;
use std::path::PathBuf;

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use tracing::debug;

use super::{placeholders, MAX_IN_LIST};
use crate::error::Result;
use crate::models::{
    ImageId, ImageRecord, Rating, RatingScores, SearchPage, SearchRequest, TagFrequency, TagType,
};

/// Edges at or above this probability count towards [`top_tags`].
const TOP_TAGS_MIN_PROBABILITY: f64 = 0.6;
const TOP_TAGS_MIN_RATING: f64 = 0.5;
const TOP_TAGS_LIMIT: i64 = 25;

/// Runs an AND-of-tags search.
///
/// An image matches when it carries every requested tag at or above
/// `f_tag` and each rating score meets its threshold. Matches are ranked
/// by their strongest matching edge, ties broken by image id.
pub fn search_images(conn: &Connection, request: &SearchRequest) -> Result<SearchPage> {
    request.validate()?;
    let tag_ids = request.distinct_tag_ids();
    let filters = &request.filters;

    let matching = format!(
        "SELECT image_tag.image_id AS image_id, MAX(image_tag.probability) AS score
         FROM image JOIN image_tag USING (image_id)
         WHERE image_tag.tag_id IN ({})
           AND image_tag.probability >= ?
           AND image.general >= ?
           AND image.sensitive >= ?
           AND image.questionable >= ?
           AND image.explicit >= ?
         GROUP BY image_tag.image_id
         HAVING COUNT(DISTINCT image_tag.tag_id) = ?",
        placeholders(tag_ids.len())
    );

    let mut values: Vec<Value> = tag_ids.iter().map(|id| Value::Integer(*id)).collect();
    values.extend([
        Value::Real(f64::from(filters.f_tag)),
        Value::Real(f64::from(filters.f_general)),
        Value::Real(f64::from(filters.f_sensitive)),
        Value::Real(f64::from(filters.f_questionable)),
        Value::Real(f64::from(filters.f_explicit)),
        Value::Integer(tag_ids.len() as i64),
    ]);

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM ({matching})"),
        params_from_iter(values.iter()),
        |row| row.get(0),
    )?;
    if total == 0 {
        return Ok(SearchPage::default());
    }

    let mut page_values = values;
    page_values.push(Value::Integer(i64::from(request.per_page)));
    page_values.push(Value::Integer(request.offset() as i64));

    let mut stmt = conn.prepare(&format!(
        "{matching} ORDER BY score DESC, image_id ASC LIMIT ? OFFSET ?"
    ))?;
    let image_ids = stmt
        .query_map(params_from_iter(page_values.iter()), |row| row.get::<_, ImageId>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    debug!(
        "Search over {} tags matched {} images, page holds {}",
        tag_ids.len(),
        total,
        image_ids.len()
    );

    Ok(SearchPage {
        results: hydrate(conn, &image_ids)?,
        total: total as u64,
    })
}

/// Loads path, rating scores and named tag probabilities for each image.
///
/// Output order follows `image_ids`; ids with no image row are dropped.
pub fn hydrate(conn: &Connection, image_ids: &[ImageId]) -> Result<Vec<ImageRecord>> {
    let mut records = HashMap::with_capacity(image_ids.len());
    for chunk in image_ids.chunks(MAX_IN_LIST) {
        hydrate_chunk(conn, chunk, &mut records)?;
    }
    Ok(image_ids
        .iter()
        .filter_map(|id| records.remove(id))
        .collect())
}

fn hydrate_chunk(
    conn: &Connection,
    image_ids: &[ImageId],
    records: &mut HashMap<ImageId, ImageRecord>,
) -> Result<()> {
    let phs = placeholders(image_ids.len());

    let mut stmt = conn.prepare(&format!(
        "SELECT image.image_id, directory.path, image.filename,
                image.general, image.sensitive, image.questionable, image.explicit
         FROM image JOIN directory USING (directory_id)
         WHERE image.image_id IN ({phs})"
    ))?;
    let rows = stmt
        .query_map(params_from_iter(image_ids.iter()), |row| {
            let directory: String = row.get(1)?;
            let filename: String = row.get(2)?;
            let scores: [Option<f32>; 4] = [row.get(3)?, row.get(4)?, row.get(5)?, row.get(6)?];
            let rating = match scores {
                [Some(g), Some(s), Some(q), Some(e)] => Some(RatingScores::new(g, s, q, e)),
                _ => None,
            };
            Ok(ImageRecord {
                image_id: row.get(0)?,
                image_path: PathBuf::from(directory).join(filename),
                rating,
                general: Default::default(),
                character: Default::default(),
                rating_tags: Default::default(),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    records.extend(rows.into_iter().map(|rec| (rec.image_id, rec)));

    let mut stmt = conn.prepare(&format!(
        "SELECT image_tag.image_id, tag.name, tag.tag_type_id, image_tag.probability
         FROM image_tag JOIN tag ON image_tag.tag_id = tag.tag_id
         WHERE image_tag.image_id IN ({phs})"
    ))?;
    let mut rows = stmt.query(params_from_iter(image_ids.iter()))?;
    while let Some(row) = rows.next()? {
        let image_id: ImageId = row.get(0)?;
        let name: String = row.get(1)?;
        let tag_type: i64 = row.get(2)?;
        let probability: f32 = row.get(3)?;

        if let Some(record) = records.get_mut(&image_id) {
            let bucket = match TagType::from_id(tag_type) {
                Some(TagType::Character) => &mut record.character,
                Some(TagType::Rating) => &mut record.rating_tags,
                _ => &mut record.general,
            };
            bucket.insert(name, probability);
        }
    }
    Ok(())
}

/// First image carrying `content_hash`, hydrated.
pub fn image_by_hash(conn: &Connection, content_hash: &str) -> Result<Option<ImageRecord>> {
    let mut stmt =
        conn.prepare("SELECT image_id FROM image WHERE content_hash = ?1 ORDER BY image_id LIMIT 1")?;
    let ids = stmt
        .query_map(params![content_hash], |row| row.get::<_, ImageId>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(hydrate(conn, &ids)?.into_iter().next())
}

/// Every image that carries a tag with exactly this name.
pub fn images_by_tag_name(conn: &Connection, tag_name: &str) -> Result<Vec<ImageRecord>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT image_tag.image_id
         FROM tag JOIN image_tag ON tag.tag_id = image_tag.tag_id
         WHERE tag.name = ?1
         ORDER BY image_tag.image_id",
    )?;
    let ids = stmt
        .query_map(params![tag_name], |row| row.get::<_, ImageId>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    hydrate(conn, &ids)
}

/// Number of images the classifier has processed.
pub fn tagged_image_count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(image_id) FROM image WHERE general IS NOT NULL",
        [],
        |row| row.get(0),
    )?)
}

/// Most frequent tags of one type among images leaning towards `rating`.
pub fn top_tags(conn: &Connection, rating: Rating, tag_type: TagType) -> Result<Vec<TagFrequency>> {
    // The column name comes from a closed enum, never from input.
    let sql = format!(
        "SELECT tag.tag_id, tag.name, COUNT(image_tag.image_id) AS image_count
         FROM tag
             JOIN image_tag ON tag.tag_id = image_tag.tag_id
             JOIN image ON image.image_id = image_tag.image_id
         WHERE tag.tag_type_id = ?1
           AND image_tag.probability >= ?2
           AND image.{} >= ?3
         GROUP BY tag.tag_id
         ORDER BY image_count DESC, tag.name ASC
         LIMIT ?4",
        rating.column()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![
            tag_type.id(),
            TOP_TAGS_MIN_PROBABILITY,
            TOP_TAGS_MIN_RATING,
            TOP_TAGS_LIMIT
        ],
        |row| {
            Ok(TagFrequency {
                tag_id: row.get(0)?,
                tag_name: row.get(1)?,
                image_count: row.get(2)?,
            })
        },
    )?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
