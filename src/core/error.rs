use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    NotFound,
    SchemaParse,
    FieldCountMismatch,
    MissingKey,
    AmbiguousColumn,
    NoPath,
    AttachConflict,
    Detached,
    RowNotFound,
    InvalidValue,
    Io,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    path: Option<PathBuf>,
    row: Option<usize>,
    line: Option<usize>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            path: None,
            row: None,
            line: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn row(&self) -> Option<usize> {
        self.row
    }

    pub fn line(&self) -> Option<usize> {
        self.line
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_row(mut self, row: usize) -> Self {
        self.row = Some(row);
        self
    }

    /// One-based line number in a relations or table file.
    pub fn with_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(path) = &self.path {
            write!(f, " (path: {})", path.display())?;
        }
        if let Some(row) = self.row {
            write!(f, " (row: {row})")?;
        }
        if let Some(line) = self.line {
            write!(f, " (line: {line})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

/// Wrap an I/O failure on `path`, keeping the OS error as the source.
pub(crate) fn io_error(err: io::Error, path: &Path) -> Error {
    let kind = match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        _ => ErrorKind::Io,
    };
    Error::new(kind).with_path(path).with_source(err)
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::NotFound => 3,
        ErrorKind::SchemaParse => 4,
        ErrorKind::FieldCountMismatch => 5,
        ErrorKind::MissingKey => 6,
        ErrorKind::AmbiguousColumn => 7,
        ErrorKind::NoPath => 8,
        ErrorKind::AttachConflict => 9,
        ErrorKind::Detached => 10,
        ErrorKind::RowNotFound => 11,
        ErrorKind::InvalidValue => 12,
        ErrorKind::Io => 13,
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind, io_error, to_exit_code};
    use std::path::Path;

    #[test]
    fn exit_code_mapping_is_stable() {
        let cases = [
            (ErrorKind::Internal, 1),
            (ErrorKind::Usage, 2),
            (ErrorKind::NotFound, 3),
            (ErrorKind::SchemaParse, 4),
            (ErrorKind::FieldCountMismatch, 5),
            (ErrorKind::MissingKey, 6),
            (ErrorKind::AmbiguousColumn, 7),
            (ErrorKind::NoPath, 8),
            (ErrorKind::AttachConflict, 9),
            (ErrorKind::Detached, 10),
            (ErrorKind::RowNotFound, 11),
            (ErrorKind::InvalidValue, 12),
            (ErrorKind::Io, 13),
        ];

        for (kind, code) in cases {
            assert_eq!(to_exit_code(kind), code);
        }
    }

    #[test]
    fn display_includes_context() {
        let err = Error::new(ErrorKind::SchemaParse)
            .with_message("invalid line: foo")
            .with_path("/tmp/relations")
            .with_line(3);
        let text = err.to_string();
        assert!(text.starts_with("SchemaParse: invalid line: foo"));
        assert!(text.contains("(path: /tmp/relations)"));
        assert!(text.contains("(line: 3)"));
    }

    #[test]
    fn missing_files_map_to_not_found() {
        let err = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(io_error(err, Path::new("x")).kind(), ErrorKind::NotFound);

        let err = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert_eq!(io_error(err, Path::new("x")).kind(), ErrorKind::Io);
    }
}
