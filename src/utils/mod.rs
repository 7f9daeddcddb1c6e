pub mod logging;

use chrono::{DateTime, Local, Timelike};
use std::path::Path;

use crate::config::KeyLayout;

/// Builds the object key for an archive: `<prefix>/[<HH>/]<archive_name>`.
pub fn object_key(layout: &KeyLayout, archive_name: &str, now: DateTime<Local>) -> String {
    let mut segments: Vec<String> = Vec::with_capacity(3);
    if let Some(prefix) = layout.prefix.as_deref().filter(|p| !p.is_empty()) {
        segments.push(prefix.to_string());
    }
    if layout.namespace_by_hour {
        segments.push(format!("{:02}", now.hour()));
    }
    segments.push(archive_name.to_string());
    segments.join("/")
}

/// `backup_<HH>.tar.gz`, the whole-directory archive name.
pub fn hourly_archive_name(now: DateTime<Local>) -> String {
    format!("backup_{:02}.tar.gz", now.hour())
}

/// `<stem>.tar.gz` for a single source file.
pub fn file_archive_name(source: &Path) -> Option<String> {
    let stem = source.file_stem()?.to_str()?;
    Some(format!("{}.tar.gz", stem))
}

/// `<file name>.tar.gz`, used when two sources share a stem.
pub fn full_file_archive_name(source: &Path) -> Option<String> {
    let name = source.file_name()?.to_str()?;
    Some(format!("{}.tar.gz", name))
}
