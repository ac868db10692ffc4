//! Artifact packaging: zip archives and tar extraction.

use std::fs::File;
use std::io::{Seek, Write};
use std::path::Path;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use rapidflow_core::{Error, Result};

/// Zip a directory tree. Directory entries and any name beginning with `.`
/// are skipped; entry names are relative to `src`.
pub fn zip_dir(src: &Path, dst: &Path) -> Result<()> {
    let file = File::create(dst)?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    add_dir(&mut writer, src, Path::new(""), options)?;
    writer
        .finish()
        .map_err(|e| Error::Internal(format!("failed to finalize archive: {e}")))?;
    Ok(())
}

fn add_dir<W: Write + Seek>(
    writer: &mut ZipWriter<W>,
    dir: &Path,
    prefix: &Path,
    options: SimpleFileOptions,
) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        let relative = prefix.join(&name);
        if path.is_dir() {
            add_dir(writer, &path, &relative, options)?;
        } else if path.is_file() {
            writer
                .start_file(relative.to_string_lossy().into_owned(), options)
                .map_err(|e| Error::Internal(format!("failed to add archive entry: {e}")))?;
            let mut source = File::open(&path)?;
            std::io::copy(&mut source, writer)?;
        }
    }
    Ok(())
}

/// Unpack a tar stream (as produced by a container copy-out) into a host
/// directory.
pub fn unpack_tar(bytes: &[u8], dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    let mut archive = tar::Archive::new(bytes);
    archive
        .unpack(dst)
        .map_err(|e| Error::Internal(format!("failed to unpack tar stream: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn zip_skips_hidden_entries() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("keep.txt"), "kept").unwrap();
        fs::write(src.path().join(".hidden"), "secret").unwrap();
        fs::create_dir(src.path().join("sub")).unwrap();
        fs::write(src.path().join("sub/nested.txt"), "nested").unwrap();
        fs::create_dir(src.path().join(".git")).unwrap();
        fs::write(src.path().join(".git/config"), "x").unwrap();

        let out = TempDir::new().unwrap();
        let dst = out.path().join("out.zip");
        zip_dir(src.path(), &dst).unwrap();

        let mut archive = zip::ZipArchive::new(File::open(&dst).unwrap()).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();

        assert!(names.contains(&"keep.txt".to_string()));
        assert!(names.iter().any(|n| n.ends_with("nested.txt")));
        assert!(!names.iter().any(|n| n.contains("hidden")));
        assert!(!names.iter().any(|n| n.contains(".git")));
    }

    #[test]
    fn tar_round_trip() {
        let src = TempDir::new().unwrap();
        fs::create_dir(src.path().join("workspace")).unwrap();
        fs::write(src.path().join("workspace/app.txt"), "payload").unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        builder
            .append_dir_all("workspace", src.path().join("workspace"))
            .unwrap();
        let bytes = builder.into_inner().unwrap();

        let dst = TempDir::new().unwrap();
        unpack_tar(&bytes, dst.path()).unwrap();

        let restored = fs::read_to_string(dst.path().join("workspace/app.txt")).unwrap();
        assert_eq!(restored, "payload");
    }
}
