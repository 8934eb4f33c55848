use std::path::Path;
use std::sync::Arc;

/// Extension appended to every converted output name.
pub const OUTPUT_EXTENSION: &str = "webp";

/// One user-selected file, held in memory for the lifetime of its batch.
#[derive(Debug, Clone)]
pub struct InputFile {
    /// Monotonic id assigned at selection time
    pub id: u64,
    /// File name as selected (no directories)
    pub name: String,
    /// Raw file contents
    pub raw: Arc<[u8]>,
}

impl InputFile {
    pub fn new(id: u64, name: impl Into<String>, raw: impl Into<Arc<[u8]>>) -> Self {
        Self {
            id,
            name: name.into(),
            raw: raw.into(),
        }
    }

    /// Name of the converted output: text before the first `.` plus `.webp`.
    pub fn output_name(&self) -> String {
        output_name_for(&self.name)
    }

    /// Whether the name guesses to an `image/*` MIME type.
    pub fn looks_like_image(&self) -> bool {
        mime_guess::from_path(&self.name)
            .first()
            .map_or(false, |mime| mime.type_() == mime_guess::mime::IMAGE)
    }
}

pub fn output_name_for(file_name: &str) -> String {
    let base = file_name.split('.').next().unwrap_or("");
    format!("{}.{}", base, OUTPUT_EXTENSION)
}

/// Read a file from disk into an unnumbered selection entry.
pub fn read_selection(path: &Path) -> std::io::Result<(String, Vec<u8>)> {
    let raw = std::fs::read(path)?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| path.to_string_lossy().into_owned());
    Ok((name, raw))
}
