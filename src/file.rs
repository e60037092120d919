use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

static BINARY_EXTENSIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "exe", "dll", "so", "dylib", "a", "o", "obj", "png", "jpg", "jpeg", "gif", "bmp", "ico",
        "webp", "mp3", "mp4", "avi", "mkv", "mov", "wav", "flac", "pdf", "doc", "docx", "xls",
        "xlsx", "ppt", "pptx", "zip", "tar", "gz", "bz2", "xz", "7z", "rar", "wasm", "pyc",
        "class",
    ]
    .into_iter()
    .collect()
});

static TEXT_EXTENSIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "rs", "toml", "md", "txt", "json", "yaml", "yml", "js", "ts", "jsx", "tsx", "py", "go",
        "java", "c", "cpp", "h", "hpp", "cs", "rb", "php", "html", "css", "scss", "sass", "xml",
        "svg", "sh", "bash", "zsh", "fish", "vim", "lua", "csv", "log", "rst", "ini", "cfg",
    ]
    .into_iter()
    .collect()
});

/// Decides whether a file should be treated as binary (and skipped).
///
/// Known extensions are decided without touching the file; everything else
/// is sniffed with [`is_likely_binary`].
///
/// # Errors
///
/// Returns an error if the file has to be sniffed and cannot be read.
pub(crate) fn is_binary_file(path: &Path) -> Result<bool> {
    if has_binary_extension(path) {
        return Ok(true);
    }
    if has_text_extension(path) {
        return Ok(false);
    }
    is_likely_binary(path)
}

/// Determines if a file is likely binary by analyzing its content.
///
/// # Algorithm
///
/// 1. Reads the first 8KB of the file
/// 2. Checks for null bytes (binary indicator)
/// 3. Calculates the ratio of ASCII characters
/// 4. Files with null bytes or low ASCII ratio are considered binary
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub(crate) fn is_likely_binary(path: &Path) -> Result<bool> {
    const BUFFER_SIZE: usize = 8192;
    const ASCII_THRESHOLD: f64 = 0.85;

    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, file);
    let mut buffer = [0u8; BUFFER_SIZE];

    let bytes_read = reader.read(&mut buffer).map_err(|e| Error::io(path, e))?;

    if bytes_read == 0 {
        return Ok(false);
    }

    let sample = &buffer[..bytes_read];

    if memchr::memchr(0, sample).is_some() {
        return Ok(true);
    }

    // UTF-8 text in non-Latin scripts is mostly non-ASCII but still text.
    if std::str::from_utf8(sample).is_ok() {
        return Ok(false);
    }

    let ascii_count = sample.iter().filter(|&&b| b < 128).count();
    let ascii_ratio = ascii_count as f64 / bytes_read as f64;

    Ok(ascii_ratio < ASCII_THRESHOLD)
}

/// Checks if a file extension suggests a text file.
#[must_use]
pub(crate) fn has_text_extension(path: &Path) -> bool {
    extension(path).is_some_and(|ext| TEXT_EXTENSIONS.contains(ext.as_str()))
}

/// Checks if a file extension suggests a binary file.
#[must_use]
pub(crate) fn has_binary_extension(path: &Path) -> bool {
    extension(path).is_some_and(|ext| BINARY_EXTENSIONS.contains(ext.as_str()))
}

/// Whether the file can be opened for reading.
pub(crate) fn is_readable(path: &Path) -> bool {
    File::open(path).is_ok()
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;

    #[test]
    fn test_is_likely_binary_text_file() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("test.dat");
        file.write_str("Hello, world!").unwrap();

        assert!(!is_likely_binary(file.path()).unwrap());
    }

    #[test]
    fn test_is_likely_binary_binary_file() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("test.bin");
        file.write_binary(&[0u8; 100]).unwrap();

        assert!(is_likely_binary(file.path()).unwrap());
    }

    #[test]
    fn test_is_likely_binary_utf8_text() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("notes");
        file.write_str(&"Привет, мир! ".repeat(50)).unwrap();

        assert!(!is_likely_binary(file.path()).unwrap());
    }

    #[test]
    fn test_is_likely_binary_empty_file() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("empty.txt");
        file.touch().unwrap();

        assert!(!is_likely_binary(file.path()).unwrap());
    }

    #[test]
    fn test_is_binary_file_uses_extension_first() {
        let temp = assert_fs::TempDir::new().unwrap();
        let fake_png = temp.child("image.PNG");
        fake_png.write_str("not really a png").unwrap();
        let text = temp.child("code.rs");
        text.write_binary(&[0u8; 10]).unwrap();

        assert!(is_binary_file(fake_png.path()).unwrap());
        assert!(!is_binary_file(text.path()).unwrap());
    }

    #[test]
    fn test_has_text_extension() {
        assert!(has_text_extension(Path::new("test.rs")));
        assert!(has_text_extension(Path::new("config.toml")));
        assert!(has_text_extension(Path::new("README.md")));
        assert!(!has_text_extension(Path::new("binary.exe")));
        assert!(!has_text_extension(Path::new("no_extension")));
    }

    #[test]
    fn test_has_binary_extension() {
        assert!(has_binary_extension(Path::new("app.exe")));
        assert!(has_binary_extension(Path::new("image.png")));
        assert!(has_binary_extension(Path::new("archive.zip")));
        assert!(!has_binary_extension(Path::new("code.rs")));
    }

    #[test]
    fn test_is_readable() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("notes.txt");
        file.write_str("hello").unwrap();

        assert!(is_readable(file.path()));
        assert!(!is_readable(&temp.path().join("missing.txt")));
    }
}
