use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use tempfile::TempDir;
use thiserror::Error;

const ARCHIVE_FILE: &str = "artifact.tar";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("archive i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("archive has no entries")]
    Empty,
    #[error("archive entry {0} escapes the extraction directory")]
    UnsafeEntry(String),
}

/// Wraps `contents` as the only entry of a tar archive.
pub fn pack_file(name: &str, contents: &[u8]) -> Result<Bytes, ArtifactError> {
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, name, contents)?;
    Ok(Bytes::from(builder.into_inner()?))
}

/// A file extracted from a sandbox archive. The archive copy and the extracted
/// file both live in a private temporary directory that is removed on drop.
#[derive(Debug)]
pub struct ExtractedArtifact {
    dir: TempDir,
    path: PathBuf,
}

impl ExtractedArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Removes the scratch directory, reporting what a silent drop would hide.
    pub fn close(self) -> io::Result<()> {
        self.dir.close()
    }
}

pub async fn extract(
    archive: Bytes,
    temp_root: &Path,
    prefix: &str,
) -> Result<ExtractedArtifact, ArtifactError> {
    let temp_root = temp_root.to_path_buf();
    let prefix = prefix.to_string();
    tokio::task::spawn_blocking(move || extract_blocking(&archive, &temp_root, &prefix))
        .await
        .map_err(io::Error::other)?
}

fn extract_blocking(
    archive: &[u8],
    temp_root: &Path,
    prefix: &str,
) -> Result<ExtractedArtifact, ArtifactError> {
    let dir = tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in(temp_root)?;
    let archive_path = dir.path().join(ARCHIVE_FILE);
    std::fs::write(&archive_path, archive)?;

    let mut tar = tar::Archive::new(File::open(&archive_path)?);
    let mut entry = tar.entries()?.next().ok_or(ArtifactError::Empty)??;
    let name = entry.path()?.into_owned();
    if !entry.unpack_in(dir.path())? {
        return Err(ArtifactError::UnsafeEntry(name.display().to_string()));
    }

    tracing::debug!(path = %name.display(), "artifact extracted");
    Ok(ExtractedArtifact {
        path: dir.path().join(name),
        dir,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn extracts_first_entry_under_its_own_name() {
        let temp = tempfile::tempdir().unwrap();
        let archive = pack_file("abc.out", b"1 2 3\n").unwrap();

        let extracted = extract(archive, temp.path(), "abc-").await.unwrap();

        assert_eq!(extracted.path().file_name().unwrap(), "abc.out");
        assert_eq!(std::fs::read_to_string(extracted.path()).unwrap(), "1 2 3\n");
        assert!(extracted.dir().join(ARCHIVE_FILE).exists());
    }

    #[tokio::test]
    async fn drop_removes_archive_and_extracted_file() {
        let temp = tempfile::tempdir().unwrap();
        let archive = pack_file("x.out", b"data").unwrap();

        let extracted = extract(archive, temp.path(), "x-").await.unwrap();
        let (dir, path) = (extracted.dir().to_path_buf(), extracted.path().to_path_buf());
        drop(extracted);

        assert!(!path.exists());
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn close_reports_removal() {
        let temp = tempfile::tempdir().unwrap();
        let archive = pack_file("y.out", b"data").unwrap();

        let extracted = extract(archive, temp.path(), "y-").await.unwrap();
        let dir = extracted.dir().to_path_buf();
        extracted.close().unwrap();

        assert!(!dir.exists());
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn empty_archive_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let empty = Bytes::from(tar::Builder::new(Vec::new()).into_inner().unwrap());

        let err = extract(empty, temp.path(), "e-").await.unwrap_err();

        assert!(matches!(err, ArtifactError::Empty));
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn packs_single_entry() {
        let archive = pack_file("main.cpp", b"int main() {}").unwrap();
        let mut tar = tar::Archive::new(&archive[..]);
        let names: Vec<_> = tar
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert_eq!(names, vec!["main.cpp".to_string()]);
    }
}
