//! Discovery of candidate PDFs in a watched directory.

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub fn is_pdf_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
}

/// Every `.pdf` file under `folder`, recursively, sorted. Unreadable entries are skipped.
pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        if is_pdf_path(entry.path()) {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

/// Name a watched file is listed under: its path relative to the watch directory, with `/`
/// separators.
pub fn display_name(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let parts = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>();

    if parts.is_empty() {
        path.display().to_string()
    } else {
        parts.join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::{discover_pdf_files, display_name, is_pdf_path};
    use std::fs::{self, File};
    use std::io::Write;
    use std::path::Path;
    use tempfile::tempdir;

    #[test]
    fn discover_pdf_files_is_recursive() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let base = dir.path();
        let nested = base.join("nested");
        fs::create_dir(&nested)?;

        File::create(base.join("a.pdf")).and_then(|mut file| file.write_all(b"%PDF-1.4\n%fake"))?;
        File::create(nested.join("b.PDF"))
            .and_then(|mut file| file.write_all(b"%PDF-1.4\n%fake"))?;
        fs::write(base.join("notes.txt"), b"not a pdf")?;

        let files = discover_pdf_files(base);
        assert_eq!(files, vec![base.join("a.pdf"), nested.join("b.PDF")]);
        Ok(())
    }

    #[test]
    fn missing_folder_yields_nothing() {
        assert!(discover_pdf_files(Path::new("/definitely/not/here")).is_empty());
    }

    #[test]
    fn display_names_are_relative_to_the_watch_root() {
        let root = Path::new("/watch");
        assert_eq!(display_name(root, Path::new("/watch/a.pdf")), "a.pdf");
        assert_eq!(display_name(root, Path::new("/watch/manuals/b.pdf")), "manuals/b.pdf");
        assert_eq!(display_name(root, Path::new("/elsewhere/c.pdf")), "/elsewhere/c.pdf");
        assert!(is_pdf_path(Path::new("x.Pdf")));
        assert!(!is_pdf_path(Path::new("x.pdf.txt")));
    }
}
