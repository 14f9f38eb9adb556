use std::path::Path;

use crate::error::Result;
use crate::models::Ext;

/// Sniffs the image format from the file's magic bytes.
///
/// Returns `None` for content that is not an image format we index,
/// whatever the file name says.
pub fn sniff_extension(path: &Path) -> Result<Option<Ext>> {
    let kind = infer::get_from_path(path)?;
    Ok(kind
        .filter(|k| k.matcher_type() == infer::MatcherType::Image)
        .and_then(|k| Ext::parse(k.extension())))
}

pub fn detect_mimetype(path: &Path) -> Result<String> {
    Ok(infer::get_from_path(path)?
        .map(|k| k.mime_type().to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string()))
}
