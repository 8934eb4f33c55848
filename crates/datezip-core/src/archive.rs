use std::collections::{HashMap, HashSet};
use std::io::{self, Seek, Write};

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::bucket::BucketTree;
use crate::date::CaptureDate;
use crate::error::{ArchiveError, PackageError};
use crate::transcode::MEDIA_TYPE;

pub const ZIP_MEDIA_TYPE: &str = "application/zip";

/// Archive layout choice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    /// Every file at the archive root
    #[default]
    Flat,
    /// `<root>/<year>/<month>/<day>/<name>` and `<root>/no_date/<name>`
    Organized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: Vec<String>,
    pub data: Vec<u8>,
    pub date: Option<CaptureDate>,
}

impl ArchiveEntry {
    pub fn zip_name(&self) -> String {
        self.path.join("/")
    }
}

/// Run-scoped root folder name, e.g. `photos_20240131_235959`.
pub fn default_root_folder(now: NaiveDateTime) -> String {
    format!("photos_{}", now.format("%Y%m%d_%H%M%S"))
}

/// Names used when packaging one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Naming {
    pub root_folder: String,
    pub archive_name: String,
}

impl Naming {
    /// Fill unset names from the local clock at build time.
    pub fn resolve(root_folder: Option<&str>, archive_name: Option<&str>) -> Self {
        let root_folder = root_folder
            .map(str::to_string)
            .unwrap_or_else(|| default_root_folder(Local::now().naive_local()));
        let archive_name = archive_name
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}.zip", root_folder));
        Self {
            root_folder,
            archive_name,
        }
    }
}

/// Lay the tree out as archive entries. An identical path appearing twice
/// keeps the later entry in the earlier entry's position.
pub fn build_entries(tree: &BucketTree, layout: Layout, root_folder: &str) -> Vec<ArchiveEntry> {
    let mut entries: Vec<ArchiveEntry> = Vec::with_capacity(tree.len());
    let mut by_path: HashMap<Vec<String>, usize> = HashMap::new();

    for (keys, result) in tree.walk() {
        let path: Vec<String> = match layout {
            Layout::Flat => vec![result.output_name.clone()],
            Layout::Organized => {
                // Dated keys are year/month/day; the sentinel is just `no_date`
                let mut p = Vec::with_capacity(keys.len() + 2);
                p.push(root_folder.to_string());
                p.extend(keys.iter().map(|k| k.to_string()));
                p.push(result.output_name.clone());
                p
            }
        };

        let entry = ArchiveEntry {
            path: path.clone(),
            data: result.data.clone(),
            date: result.date,
        };
        match by_path.get(&path) {
            Some(&idx) => {
                tracing::debug!(path = %entry.zip_name(), "Duplicate archive path; keeping the later file");
                entries[idx] = entry;
            }
            None => {
                by_path.insert(path, entries.len());
                entries.push(entry);
            }
        }
    }

    entries
}

/// Serialise entries into a zip container.
///
/// WebP is already compressed, so files are stored as-is. Parent folders are
/// written as explicit directory entries, once each.
pub fn write_zip<W: Write + Seek>(entries: &[ArchiveEntry], writer: W) -> Result<W, ArchiveError> {
    let mut zip = ZipWriter::new(writer);
    let stored = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .unix_permissions(0o644);

    let mut created_dirs: HashSet<String> = HashSet::new();
    for entry in entries {
        for depth in 1..entry.path.len() {
            let dir = entry.path[..depth].join("/");
            if created_dirs.insert(dir.clone()) {
                zip.add_directory(dir, stored.unix_permissions(0o755))?;
            }
        }

        let mut opts = stored;
        if let Some(ts) = entry.date.and_then(zip_timestamp) {
            opts = opts.last_modified_time(ts);
        }
        zip.start_file(entry.zip_name(), opts)?;
        io::copy(&mut io::Cursor::new(&entry.data), &mut zip)?;
    }

    Ok(zip.finish()?)
}

fn zip_timestamp(date: CaptureDate) -> Option<zip::DateTime> {
    let year = u16::try_from(date.year).ok()?;
    zip::DateTime::from_date_and_time(year, date.month as u8, date.day as u8, 0, 0, 0).ok()
}

/// What gets handed to the user for one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Package {
    /// Batch of exactly one: the converted file itself
    Single {
        name: String,
        data: Vec<u8>,
        date: Option<CaptureDate>,
    },
    /// Everything else: a zip archive
    Archive { name: String, data: Vec<u8>, entries: usize },
}

impl Package {
    pub fn file_name(&self) -> &str {
        match self {
            Package::Single { name, .. } | Package::Archive { name, .. } => name,
        }
    }

    pub fn media_type(&self) -> &'static str {
        match self {
            Package::Single { .. } => MEDIA_TYPE,
            Package::Archive { .. } => ZIP_MEDIA_TYPE,
        }
    }

    pub fn data(&self) -> &[u8] {
        match self {
            Package::Single { data, .. } | Package::Archive { data, .. } => data,
        }
    }
}

/// Package a finished batch. `input_count` is the number of files that were
/// selected, failures included.
pub fn package(
    tree: BucketTree,
    input_count: usize,
    layout: Layout,
    naming: &Naming,
) -> Result<Package, PackageError> {
    if tree.is_empty() {
        return Err(PackageError::Empty);
    }

    if input_count == 1 {
        let result = tree.first().cloned().ok_or(PackageError::Empty)?;
        return Ok(Package::Single {
            name: result.output_name,
            data: result.data,
            date: result.date,
        });
    }

    let entries = build_entries(&tree, layout, &naming.root_folder);
    drop(tree);
    let cursor = write_zip(&entries, io::Cursor::new(Vec::new()))?;
    Ok(Package::Archive {
        name: naming.archive_name.clone(),
        data: cursor.into_inner(),
        entries: entries.len(),
    })
}
