//! DDL for the SQLite-backed store: a denormalized layout with one table per
//! index class (primary records, per-tag index entries, tag-popularity
//! counters, and per-owner aggregates).

pub static DDL_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS images (
       owner     TEXT NOT NULL,
       image_id  TEXT NOT NULL,
       document  TEXT NOT NULL,

       PRIMARY KEY (owner, image_id)
     )",
    "CREATE TABLE IF NOT EXISTS tag_index (
       owner        TEXT NOT NULL,
       tag          TEXT NOT NULL,
       image_id     TEXT NOT NULL,
       name         TEXT NOT NULL,
       datetime     TEXT NOT NULL,
       preview_key  TEXT NOT NULL,

       PRIMARY KEY (owner, tag, image_id)
     )",
    "CREATE INDEX IF NOT EXISTS tag_index_global ON tag_index (tag, image_id)",
    "CREATE TABLE IF NOT EXISTS tag_counts (
       owner  TEXT NOT NULL,
       tag    TEXT NOT NULL,
       count  INTEGER NOT NULL DEFAULT 0,
       label  TEXT,

       PRIMARY KEY (owner, tag)
     )",
    "CREATE TABLE IF NOT EXISTS profiles (
       owner        TEXT NOT NULL PRIMARY KEY,
       bytes_used   INTEGER NOT NULL DEFAULT 0,
       image_count  INTEGER NOT NULL DEFAULT 0
     )",
];
