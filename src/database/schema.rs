pub const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS directory (
        directory_id INTEGER PRIMARY KEY AUTOINCREMENT,
        path TEXT NOT NULL UNIQUE
    );

    CREATE TABLE IF NOT EXISTS tag_type (
        pk INTEGER PRIMARY KEY AUTOINCREMENT,
        tag_type_id INTEGER NOT NULL UNIQUE,
        name TEXT NOT NULL UNIQUE
    );

    CREATE TABLE IF NOT EXISTS tag (
        pk INTEGER PRIMARY KEY AUTOINCREMENT,
        tag_id INTEGER NOT NULL UNIQUE,
        name TEXT NOT NULL,
        tag_type_id INTEGER NOT NULL,
        usage_count INTEGER NOT NULL DEFAULT 0,
        FOREIGN KEY(tag_type_id) REFERENCES tag_type(tag_type_id),
        UNIQUE(name, tag_type_id)
    );

    CREATE TABLE IF NOT EXISTS image (
        image_id INTEGER PRIMARY KEY AUTOINCREMENT,
        directory_id INTEGER NOT NULL,
        filename TEXT NOT NULL,
        extension_code INTEGER,
        content_hash TEXT,
        general REAL,
        sensitive REAL,
        questionable REAL,
        explicit REAL,
        FOREIGN KEY(directory_id) REFERENCES directory(directory_id),
        UNIQUE(directory_id, filename)
    );

    CREATE TABLE IF NOT EXISTS image_tag (
        pk INTEGER PRIMARY KEY AUTOINCREMENT,
        image_id INTEGER NOT NULL,
        tag_id INTEGER NOT NULL,
        probability REAL NOT NULL,
        FOREIGN KEY(image_id) REFERENCES image(image_id) ON DELETE CASCADE,
        FOREIGN KEY(tag_id) REFERENCES tag(tag_id) ON DELETE CASCADE,
        UNIQUE(image_id, tag_id)
    );

    CREATE INDEX IF NOT EXISTS idx_image_filename ON image(filename);
    CREATE INDEX IF NOT EXISTS idx_image_directory_id_filename ON image(directory_id, filename);
    CREATE INDEX IF NOT EXISTS idx_image_content_hash ON image(content_hash);
    CREATE INDEX IF NOT EXISTS idx_image_tag_image_id ON image_tag(image_id);
    CREATE INDEX IF NOT EXISTS idx_image_tag_tag_id ON image_tag(tag_id);
";
