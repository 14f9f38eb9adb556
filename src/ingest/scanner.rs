use std::path::Path;

use anyhow::Result;
use crossbeam::channel::Sender;
use walkdir::{DirEntry, WalkDir};

use crate::models::Ext;

/// An image file found under the scan root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub directory: String,
    pub filename: String,
    pub ext: Ext,
}

/// Walks `root` and sends every visible file whose extension is in `allowed`.
///
/// Hidden files and directories are skipped. Returns the number of files
/// sent; stops early if the receiver hangs up.
pub fn scan_directory(root: &Path, allowed: &[Ext], tx: Sender<DiscoveredFile>) -> Result<usize> {
    let mut sent = 0;
    for entry in WalkDir::new(root).into_iter().filter_entry(|e| !is_hidden(e)) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(file) = discovered(entry.path(), allowed) else {
            continue;
        };
        if tx.send(file).is_err() {
            break;
        }
        sent += 1;
    }
    Ok(sent)
}

fn discovered(path: &Path, allowed: &[Ext]) -> Option<DiscoveredFile> {
    let ext = Ext::of_path(path).filter(|ext| allowed.contains(ext))?;
    let directory = path.parent()?.to_str()?.to_string();
    let filename = path.file_name()?.to_str()?.to_string();
    Some(DiscoveredFile {
        directory,
        filename,
        ext,
    })
}

fn is_hidden(entry: &DirEntry) -> bool {
    // The root itself is never hidden, even when named like `.cache`.
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|s| s.starts_with('.'))
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;
    use std::fs;

    #[test]
    fn finds_allowed_images_and_skips_hidden() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path();
        fs::create_dir_all(root.join("sub"))?;
        fs::create_dir_all(root.join(".thumbs"))?;
        fs::write(root.join("a.png"), b"x")?;
        fs::write(root.join("sub/b.JPG"), b"x")?;
        fs::write(root.join("sub/c.webp"), b"x")?;
        fs::write(root.join("notes.txt"), b"x")?;
        fs::write(root.join(".hidden.png"), b"x")?;
        fs::write(root.join(".thumbs/d.png"), b"x")?;

        let (tx, rx) = unbounded();
        let sent = scan_directory(root, &[Ext::Png, Ext::Jpg], tx)?;
        let mut found: Vec<DiscoveredFile> = rx.iter().collect();
        found.sort_by(|a, b| a.filename.cmp(&b.filename));

        assert_eq!(sent, 2);
        assert_eq!(found[0].filename, "a.png");
        assert_eq!(found[0].directory, root.to_str().unwrap());
        assert_eq!(found[1].filename, "b.JPG");
        assert_eq!(found[1].ext, Ext::Jpg);
        Ok(())
    }
}
