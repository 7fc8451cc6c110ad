use crate::error::IndexError;
use std::path::Path;
use tracing::{error, warn};

/// What had to be thrown away to get a usable index open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    None,
    CollectionRecreated,
    DirectoryWiped,
}

impl Recovery {
    pub fn recovered(self) -> bool {
        self != Self::None
    }
}

pub(crate) trait RecoverableIndex: Sized {
    fn open_at(directory: &Path) -> Result<Self, IndexError>;

    /// Removes the stored collection, leaving the rest of the directory in place.
    fn drop_collection(directory: &Path) -> Result<(), IndexError>;
}

/// Opens a backend, escalating on corruption: drop and recreate the collection first, then
/// wipe the persistence directory. Errors that are not corruption are returned as is.
pub(crate) fn open_with_recovery<B: RecoverableIndex>(
    directory: &Path,
) -> Result<(B, Recovery), IndexError> {
    let details = match B::open_at(directory) {
        Ok(index) => return Ok((index, Recovery::None)),
        Err(IndexError::Corrupted { details, .. }) => details,
        Err(other) => return Err(other),
    };

    warn!(
        directory = %directory.display(),
        %details,
        "vector index corrupted, recreating collection"
    );
    let recreated = B::drop_collection(directory).and_then(|_| B::open_at(directory));
    match recreated {
        Ok(index) => return Ok((index, Recovery::CollectionRecreated)),
        Err(recreate_error) => error!(
            directory = %directory.display(),
            error = %recreate_error,
            "recreating collection failed, wiping vector directory"
        ),
    }

    wipe_directory(directory)?;
    let index = B::open_at(directory)?;
    Ok((index, Recovery::DirectoryWiped))
}

fn wipe_directory(directory: &Path) -> Result<(), IndexError> {
    if directory.exists() {
        std::fs::remove_dir_all(directory)?;
    }
    std::fs::create_dir_all(directory)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::flat::{FlatVectorIndex, COLLECTION_FILE, MANIFEST_FILE};
    use crate::stores::sqlite::{SqliteVectorIndex, DATABASE_FILE};
    use crate::traits::VectorIndex;

    #[test]
    fn healthy_directory_needs_no_recovery() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let (_, recovery) = open_with_recovery::<SqliteVectorIndex>(dir.path())?;
        assert_eq!(recovery, Recovery::None);
        Ok(())
    }

    #[tokio::test]
    async fn garbage_sqlite_file_is_wiped() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let vectors = dir.path().join("vectors");
        std::fs::create_dir_all(&vectors)?;
        std::fs::write(vectors.join(DATABASE_FILE), vec![0x13u8; 4096])?;
        std::fs::write(vectors.join("stray.bin"), b"leftover")?;

        let (index, recovery) = open_with_recovery::<SqliteVectorIndex>(&vectors)?;
        assert_eq!(recovery, Recovery::DirectoryWiped);
        assert!(!vectors.join("stray.bin").exists());
        assert_eq!(index.count().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_flat_collection_is_recreated() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join(COLLECTION_FILE), b"{ not json")?;
        std::fs::write(dir.path().join("notes.txt"), b"keep me")?;

        let (index, recovery) = open_with_recovery::<FlatVectorIndex>(dir.path())?;
        assert_eq!(recovery, Recovery::CollectionRecreated);
        assert!(dir.path().join("notes.txt").exists());
        assert_eq!(index.count().await?, 0);
        Ok(())
    }

    #[test]
    fn unreadable_flat_manifest_is_recreated() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join(MANIFEST_FILE), b"[]")?;

        let (_, recovery) = open_with_recovery::<FlatVectorIndex>(dir.path())?;
        assert!(recovery.recovered());
        Ok(())
    }
}
