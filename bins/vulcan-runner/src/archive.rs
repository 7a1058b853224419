use std::io::Cursor;
use std::path::{Path, PathBuf};

use tracing::warn;
use uuid::Uuid;
use zip::ZipArchive;

use vulcan_common::error::AppError;

/// Scratch directory for one archive extraction. Removed on drop so every
/// exit path of the pipeline cleans up after itself.
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn create(root: &Path, name: &str) -> Result<Self, AppError> {
        let path = root.join(name);
        std::fs::create_dir_all(&path)
            .map_err(|e| AppError::internal(format!("cannot create scratch dir: {}", e)))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            warn!(path = %self.path.display(), error = %e, "scratch cleanup failed");
        }
    }
}

fn epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn creation_dir_name(project: &str) -> String {
    format!("{}_creation_{}", project, epoch_ms())
}

pub fn submission_dir_name(project: &str) -> String {
    format!("{}_submission_{}_{}", project, epoch_ms(), Uuid::new_v4().simple())
}

/// Extract a zip archive into `dest`. Entries escaping the destination
/// (zip-slip) are skipped rather than failing the whole archive.
pub fn extract_archive(data: &[u8], dest: &Path) -> Result<(), AppError> {
    if data.is_empty() {
        return Err(AppError::bad_input("empty archive"));
    }

    let mut archive = ZipArchive::new(Cursor::new(data))
        .map_err(|e| AppError::bad_input(format!("not a valid zip archive: {}", e)))?;

    if archive.is_empty() {
        return Err(AppError::bad_input("archive contains no entries"));
    }

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| AppError::bad_input(format!("corrupt archive entry: {}", e)))?;

        let file_path = match file.enclosed_name() {
            Some(path) => path.to_owned(),
            None => continue,
        };

        let outpath = dest.join(&file_path);

        if file.name().ends_with('/') {
            std::fs::create_dir_all(&outpath)
                .map_err(|e| AppError::internal(format!("extract failed: {}", e)))?;
        } else {
            if let Some(parent) = outpath.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| AppError::internal(format!("extract failed: {}", e)))?;
            }
            let mut outfile = std::fs::File::create(&outpath)
                .map_err(|e| AppError::internal(format!("extract failed: {}", e)))?;
            std::io::copy(&mut file, &mut outfile)
                .map_err(|e| AppError::internal(format!("extract failed: {}", e)))?;
        }
    }

    Ok(())
}

/// A template archive must hold a single top-level project directory with
/// the test sources and the build manifest inside it. Returns that
/// directory.
pub fn validate_template(extracted: &Path) -> Result<PathBuf, AppError> {
    let root = single_top_level_dir(extracted)?;

    if !root.join("test").is_dir() {
        return Err(AppError::bad_input("template is missing a test/ directory"));
    }
    if !root.join("foundry.toml").is_file() {
        return Err(AppError::bad_input("template is missing foundry.toml"));
    }

    Ok(root)
}

/// A submission archive must carry a src/ tree. Any test/ contents are left
/// where they are; the sandbox entrypoint re-copies the image's tests over
/// the mount, so a submission cannot replace them. Returns the directory to
/// bind-mount.
pub fn validate_submission(extracted: &Path) -> Result<PathBuf, AppError> {
    let root = if extracted.join("src").is_dir() {
        extracted.to_path_buf()
    } else {
        single_top_level_dir(extracted)?
    };

    if !root.join("src").is_dir() {
        return Err(AppError::bad_input("submission is missing a src/ directory"));
    }

    Ok(root)
}

fn single_top_level_dir(extracted: &Path) -> Result<PathBuf, AppError> {
    let mut dirs = Vec::new();
    let entries = std::fs::read_dir(extracted)
        .map_err(|e| AppError::internal(format!("cannot read scratch dir: {}", e)))?;
    for entry in entries {
        let entry = entry.map_err(|e| AppError::internal(e.to_string()))?;
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }

    match dirs.len() {
        1 => Ok(dirs.remove(0)),
        0 => Err(AppError::bad_input("archive has no top-level directory")),
        _ => Err(AppError::bad_input(
            "archive must contain exactly one top-level project directory",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use vulcan_common::error::ErrorKind;
    use zip::write::SimpleFileOptions;

    fn build_zip(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            let options = SimpleFileOptions::default();
            for (name, content) in entries {
                if name.ends_with('/') {
                    writer.add_directory(name.trim_end_matches('/'), options).unwrap();
                } else {
                    writer.start_file(*name, options).unwrap();
                    writer.write_all(content.as_bytes()).unwrap();
                }
            }
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn empty_archive_is_bad_input() {
        let err = extract_archive(&[], Path::new("/tmp/nowhere")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadInput);
    }

    #[test]
    fn garbage_bytes_are_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let err = extract_archive(b"definitely not a zip", dir.path()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadInput);
    }

    #[test]
    fn template_validation_accepts_well_formed_archive() {
        let dir = tempfile::tempdir().unwrap();
        let data = build_zip(&[
            ("token/foundry.toml", "[profile.default]\n"),
            ("token/test/Token.t.sol", "// test"),
            ("token/src/Token.sol", "// src"),
        ]);

        extract_archive(&data, dir.path()).unwrap();
        let root = validate_template(dir.path()).unwrap();
        assert!(root.ends_with("token"));
    }

    #[test]
    fn template_without_tests_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let data = build_zip(&[
            ("token/foundry.toml", "[profile.default]\n"),
            ("token/src/Token.sol", "// src"),
        ]);

        extract_archive(&data, dir.path()).unwrap();
        let err = validate_template(dir.path()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadInput);
        assert!(err.message.contains("test/"));
    }

    #[test]
    fn template_without_manifest_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let data = build_zip(&[("token/test/Token.t.sol", "// test")]);

        extract_archive(&data, dir.path()).unwrap();
        let err = validate_template(dir.path()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadInput);
    }

    #[test]
    fn submission_accepts_src_at_root_or_nested() {
        let flat = tempfile::tempdir().unwrap();
        extract_archive(&build_zip(&[("src/Token.sol", "// impl")]), flat.path()).unwrap();
        assert_eq!(validate_submission(flat.path()).unwrap(), flat.path());

        let nested = tempfile::tempdir().unwrap();
        extract_archive(
            &build_zip(&[("mine/src/Token.sol", "// impl")]),
            nested.path(),
        )
        .unwrap();
        let root = validate_submission(nested.path()).unwrap();
        assert!(root.ends_with("mine"));
    }

    #[test]
    fn submission_without_src_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        extract_archive(&build_zip(&[("notes.txt", "hi")]), dir.path()).unwrap();
        let err = validate_submission(dir.path()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadInput);
    }

    #[test]
    fn zip_slip_entries_are_skipped() {
        // Hand-build an archive with a traversal name; the writer API
        // refuses them, so splice the name in at the byte level instead.
        let dir = tempfile::tempdir().unwrap();
        let data = build_zip(&[("AAAAAAAAAA", "owned"), ("src/ok.sol", "fine")]);
        let patched: Vec<u8> = {
            let needle = b"AAAAAAAAAA";
            let evil = b"../escaped";
            let mut out = data.clone();
            let mut i = 0;
            while i + needle.len() <= out.len() {
                if &out[i..i + needle.len()] == needle {
                    out[i..i + needle.len()].copy_from_slice(evil);
                }
                i += 1;
            }
            out
        };

        extract_archive(&patched, dir.path()).unwrap();
        assert!(dir.path().join("src/ok.sol").is_file());
        assert!(!dir.path().parent().unwrap().join("escaped").exists());
    }

    #[test]
    fn scratch_dir_removes_itself() {
        let root = tempfile::tempdir().unwrap();
        let path;
        {
            let scratch = ScratchDir::create(root.path(), "p_creation_1").unwrap();
            path = scratch.path().to_path_buf();
            std::fs::write(path.join("file"), b"x").unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn dir_names_follow_convention() {
        let creation = creation_dir_name("token");
        assert!(creation.starts_with("token_creation_"));
        let submission = submission_dir_name("token");
        assert!(submission.starts_with("token_submission_"));
        // epoch ms plus a random suffix keeps concurrent runs apart
        assert!(submission.len() > creation.len());
    }
}
