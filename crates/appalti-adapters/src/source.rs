use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value as JsonValue;
use thiserror::Error;

const DOCUMENT_EXTENSION: &str = "json";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("input path {} not found", .0.display())]
    NotFound(PathBuf),
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl SourceError {
    pub fn path(&self) -> &Path {
        match self {
            Self::NotFound(path) => path,
            Self::Io { path, .. } | Self::Json { path, .. } => path,
        }
    }
}

/// Where a document came from: a file, plus its position when the file holds an array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentOrigin {
    pub path: PathBuf,
    pub index: Option<usize>,
}

impl fmt::Display for DocumentOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{}[{index}]", self.path.display()),
            None => write!(f, "{}", self.path.display()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RawDocument {
    pub origin: DocumentOrigin,
    pub value: JsonValue,
}

impl RawDocument {
    fn new(path: PathBuf, index: Option<usize>, value: JsonValue) -> Self {
        Self {
            origin: DocumentOrigin { path, index },
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentSource {
    Directory(PathBuf),
    File(PathBuf),
}

impl DocumentSource {
    /// Fails with [`SourceError::NotFound`] before anything is read.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        if path.is_dir() {
            Ok(Self::Directory(path.to_path_buf()))
        } else if path.exists() {
            Ok(Self::File(path.to_path_buf()))
        } else {
            Err(SourceError::NotFound(path.to_path_buf()))
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Directory(path) | Self::File(path) => path,
        }
    }

    /// Lazy pass over the documents. Each call starts again from the beginning.
    pub fn documents(&self) -> Documents {
        Documents {
            source: self.clone(),
            cursor: Cursor::Start,
        }
    }
}

impl<'a> IntoIterator for &'a DocumentSource {
    type Item = Result<RawDocument, SourceError>;
    type IntoIter = Documents;

    fn into_iter(self) -> Self::IntoIter {
        self.documents()
    }
}

pub struct Documents {
    source: DocumentSource,
    cursor: Cursor,
}

enum Cursor {
    Start,
    Files(std::vec::IntoIter<PathBuf>),
    Elements {
        path: PathBuf,
        items: std::iter::Enumerate<std::vec::IntoIter<JsonValue>>,
    },
    Done,
}

impl Iterator for Documents {
    type Item = Result<RawDocument, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match std::mem::replace(&mut self.cursor, Cursor::Done) {
                Cursor::Start => match &self.source {
                    DocumentSource::Directory(dir) => match list_document_files(dir) {
                        Ok(files) => self.cursor = Cursor::Files(files.into_iter()),
                        Err(err) => return Some(Err(err)),
                    },
                    DocumentSource::File(path) => match read_json_file(path) {
                        Ok(JsonValue::Array(items)) => {
                            self.cursor = Cursor::Elements {
                                path: path.clone(),
                                items: items.into_iter().enumerate(),
                            };
                        }
                        Ok(value) => return Some(Ok(RawDocument::new(path.clone(), None, value))),
                        Err(err) => return Some(Err(err)),
                    },
                },
                Cursor::Files(mut files) => {
                    let path = files.next()?;
                    self.cursor = Cursor::Files(files);
                    return Some(read_json_file(&path).map(|value| RawDocument::new(path, None, value)));
                }
                Cursor::Elements { path, mut items } => {
                    let (index, value) = items.next()?;
                    let doc = RawDocument::new(path.clone(), Some(index), value);
                    self.cursor = Cursor::Elements { path, items };
                    return Some(Ok(doc));
                }
                Cursor::Done => return None,
            }
        }
    }
}

/// Non-hidden `*.json` files directly under `dir`, in file-name order.
fn list_document_files(dir: &Path) -> Result<Vec<PathBuf>, SourceError> {
    let io_err = |source| SourceError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        let visible = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| !name.starts_with('.'))
            .unwrap_or(false);
        let is_document = path
            .extension()
            .map(|ext| ext == DOCUMENT_EXTENSION)
            .unwrap_or(false);
        if visible && is_document && path.is_file() {
            files.push(path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

fn read_json_file(path: &Path) -> Result<JsonValue, SourceError> {
    let data = fs::read_to_string(path).map_err(|source| SourceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&data).map_err(|source| SourceError::Json {
        path: path.to_path_buf(),
        source,
    })
}
