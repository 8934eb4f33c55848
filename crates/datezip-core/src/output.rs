use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::archive::Package;

/// Write the package into `output_dir` and release its bytes.
///
/// Data goes to a temporary sibling first and is renamed into place, so a
/// partially written package never carries the final name. A single file
/// gets its mtime set to the capture date.
pub fn save_package(package: Package, output_dir: &Path) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(output_dir)?;

    let dest = output_dir.join(package.file_name());
    let temp = output_dir.join(format!(".{}.tmp", package.file_name()));

    if let Err(e) = write_then_rename(package.data(), &temp, &dest) {
        fs::remove_file(&temp).ok();
        return Err(e.into());
    }

    if let Package::Single { date: Some(date), .. } = &package {
        if let Some(local) = date
            .naive_date()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .and_then(|dt| dt.and_local_timezone(chrono::Local).single())
        {
            let ft = filetime::FileTime::from_unix_time(local.timestamp(), 0);
            filetime::set_file_mtime(&dest, ft).ok();
        }
    }

    tracing::info!(
        path = %dest.display(),
        media_type = package.media_type(),
        bytes = package.data().len(),
        "Package saved"
    );
    drop(package);
    Ok(dest)
}

fn write_then_rename(data: &[u8], temp: &Path, dest: &Path) -> std::io::Result<()> {
    {
        let mut out = BufWriter::new(File::create(temp)?);
        out.write_all(data)?;
        out.flush()?;
    }
    fs::rename(temp, dest)
}
