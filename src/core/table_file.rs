//! Purpose: Locate, read and atomically (re)write table data files.
//! Exports: `resolve_table_path`, `table_size`, plus crate-internal line reading and writing.
//! Role: File boundary for tables and suites; nothing else touches table files directly.
//! Invariants: A table file is `<dir>/<table>` or `<dir>/<table>.gz`; the newer one is in effect.
//! Invariants: Rewrites stage into a temp file in the same directory, then rename over the target.
//! Invariants: Appends stage the new rows first, then copy them onto the file in effect.
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::core::codec::make_row;
use crate::core::encoding::TextEncoding;
use crate::core::error::{Error, ErrorKind, io_error};
use crate::core::relations::Relation;
use crate::core::row::RowAccess;

const GZ_SUFFIX: &str = ".gz";

/// `path` without a trailing `.gz`.
pub(crate) fn base_path(path: &Path) -> PathBuf {
    match path.to_str().and_then(|text| text.strip_suffix(GZ_SUFFIX)) {
        Some(stripped) => PathBuf::from(stripped),
        None => path.to_path_buf(),
    }
}

pub(crate) fn gz_path(base: &Path) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(GZ_SUFFIX);
    PathBuf::from(name)
}

pub(crate) fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
}

/// The data file in effect for the table at `path` (with or without `.gz`).
///
/// When both variants exist the more recently modified one wins; ties
/// favor the plain file. Returns `None` when neither exists.
pub fn resolve_table_path(path: &Path) -> Option<PathBuf> {
    let plain = base_path(path);
    let gz = gz_path(&plain);
    let modified = |p: &Path| fs::metadata(p).and_then(|meta| meta.modified()).ok();

    if plain.is_file() {
        if gz.is_file() {
            if let (Some(gz_time), Some(plain_time)) = (modified(&gz), modified(&plain)) {
                if gz_time > plain_time {
                    return Some(gz);
                }
            }
        }
        return Some(plain);
    }
    if gz.is_file() {
        return Some(gz);
    }
    None
}

/// On-disk size of the table file in effect; 0 when there is none.
pub fn table_size(path: &Path) -> Result<u64, Error> {
    match resolve_table_path(path) {
        Some(resolved) => fs::metadata(&resolved)
            .map(|meta| meta.len())
            .map_err(|err| io_error(err, &resolved)),
        None => Ok(0),
    }
}

/// Create an empty plain table file at the base of `path`.
pub(crate) fn create_empty(path: &Path) -> Result<PathBuf, Error> {
    let plain = base_path(path);
    File::create(&plain).map_err(|err| {
        io_error(err, &plain).with_message("failed to create empty table file")
    })?;
    Ok(plain)
}

/// Sequential reader yielding decoded lines without their terminators.
pub(crate) struct LineReader {
    reader: Box<dyn BufRead>,
    path: PathBuf,
    encoding: TextEncoding,
    buf: Vec<u8>,
    line: usize,
}

impl LineReader {
    pub(crate) fn open(path: &Path, encoding: TextEncoding) -> Result<Self, Error> {
        let file = File::open(path)
            .map_err(|err| io_error(err, path).with_message("failed to open table file"))?;
        let reader: Box<dyn BufRead> = if is_gzip(path) {
            Box::new(BufReader::new(MultiGzDecoder::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };
        Ok(Self {
            reader,
            path: path.to_path_buf(),
            encoding,
            buf: Vec::new(),
            line: 0,
        })
    }

    /// Advance past one line without decoding it; `false` at end of file.
    pub(crate) fn skip_line(&mut self) -> Result<bool, Error> {
        self.read_raw().map(|read| read > 0)
    }

    fn read_raw(&mut self) -> Result<usize, Error> {
        self.buf.clear();
        let read = self
            .reader
            .read_until(b'\n', &mut self.buf)
            .map_err(|err| io_error(err, &self.path).with_line(self.line + 1))?;
        if read > 0 {
            self.line += 1;
        }
        Ok(read)
    }
}

impl Iterator for LineReader {
    type Item = Result<String, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_raw() {
            Ok(0) => None,
            Ok(_) => {
                let mut bytes = self.buf.as_slice();
                if let Some(rest) = bytes.strip_suffix(b"\n") {
                    bytes = rest;
                }
                if let Some(rest) = bytes.strip_suffix(b"\r") {
                    bytes = rest;
                }
                Some(
                    self.encoding
                        .decode(bytes)
                        .map_err(|err| err.with_path(&self.path).with_line(self.line)),
                )
            }
            Err(err) => Some(Err(err)),
        }
    }
}

pub(crate) fn count_lines(path: &Path, encoding: TextEncoding) -> Result<usize, Error> {
    let mut reader = LineReader::open(path, encoding)?;
    let mut count = 0;
    while reader.skip_line()? {
        count += 1;
    }
    Ok(count)
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct RowWrite {
    pub append: bool,
    pub gzip: bool,
    pub encoding: TextEncoding,
}

/// Write `rows` as table `name` under `dir`; returns the file written.
pub(crate) fn write_rows<I, R>(
    dir: &Path,
    name: &str,
    rows: I,
    relation: &Relation,
    options: RowWrite,
) -> Result<PathBuf, Error>
where
    I: IntoIterator<Item = Result<R, Error>>,
    R: RowAccess,
{
    if !dir.is_dir() {
        return Err(Error::new(ErrorKind::NotFound)
            .with_message("profile directory does not exist")
            .with_path(dir));
    }
    let mut rows = rows.into_iter().peekable();
    // empty tables are never compressed
    let gzip = options.gzip && rows.peek().is_some();
    if gzip && options.append {
        warn!(table = name, "appending to a gzip file may result in inefficient compression");
    }

    let plain = dir.join(name);
    let gz = gz_path(&plain);
    let mut staged = staging_file(dir, name)?;

    let target = if options.append {
        let written = {
            let mut out = BufWriter::new(staged.as_file_mut());
            let written = write_lines(&mut out, &mut rows, relation, options.encoding)?;
            out.flush().map_err(|err| io_error(err, &plain))?;
            written
        };
        drop(rows);
        let target = match resolve_table_path(&plain) {
            Some(existing) => existing,
            None if gzip => gz.clone(),
            None => plain.clone(),
        };
        if is_gzip(&target) != gzip {
            debug!(table = name, path = %target.display(), "appending in the existing file's compression");
        }
        append_staged(staged.as_file_mut(), &target)?;
        debug!(table = name, rows = written, path = %target.display(), "appended rows");
        target
    } else {
        let target = if gzip { gz.clone() } else { plain.clone() };
        let written = {
            let out = BufWriter::new(staged.as_file_mut());
            if gzip {
                let mut encoder = GzEncoder::new(out, Compression::default());
                let written = write_lines(&mut encoder, &mut rows, relation, options.encoding)?;
                let mut out = encoder.finish().map_err(|err| io_error(err, &target))?;
                out.flush().map_err(|err| io_error(err, &target))?;
                written
            } else {
                let mut out = out;
                let written = write_lines(&mut out, &mut rows, relation, options.encoding)?;
                out.flush().map_err(|err| io_error(err, &target))?;
                written
            }
        };
        drop(rows);
        if let Some(replaced) = resolve_table_path(&plain) {
            keep_permissions(&staged, &replaced)?;
        }
        staged
            .as_file()
            .sync_all()
            .map_err(|err| io_error(err, &target))?;
        staged
            .persist(&target)
            .map_err(|err| io_error(err.error, &target).with_message("failed to replace table file"))?;
        debug!(table = name, rows = written, path = %target.display(), "rewrote table file");
        target
    };

    let stale = if is_gzip(&target) { plain } else { gz };
    if stale.is_file() {
        fs::remove_file(&stale).map_err(|err| io_error(err, &stale))?;
    }
    Ok(target)
}

fn write_lines<W, I, R>(
    out: &mut W,
    rows: &mut I,
    relation: &Relation,
    encoding: TextEncoding,
) -> Result<usize, Error>
where
    W: Write,
    I: Iterator<Item = Result<R, Error>>,
    R: RowAccess,
{
    let mut written = 0;
    for row in rows {
        let mut line = make_row(&row?, relation)?;
        line.push('\n');
        let bytes = encoding.encode(&line).map_err(|err| err.with_row(written))?;
        out.write_all(&bytes).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to stage table rows")
                .with_source(err)
        })?;
        written += 1;
    }
    Ok(written)
}

fn append_staged(staged: &mut File, target: &Path) -> Result<(), Error> {
    staged
        .seek(SeekFrom::Start(0))
        .map_err(|err| io_error(err, target))?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(target)
        .map_err(|err| io_error(err, target).with_message("failed to open table for append"))?;
    if is_gzip(target) {
        let mut encoder = GzEncoder::new(file, Compression::default());
        io::copy(staged, &mut encoder).map_err(|err| io_error(err, target))?;
        let file = encoder.finish().map_err(|err| io_error(err, target))?;
        file.sync_all().map_err(|err| io_error(err, target))?;
    } else {
        let mut file = file;
        io::copy(staged, &mut file).map_err(|err| io_error(err, target))?;
        file.sync_all().map_err(|err| io_error(err, target))?;
    }
    Ok(())
}

/// A temp file in `dir` that will be renamed over a table or catalog file.
///
/// New files get the usual `0o666` less the umask, not the owner-only
/// mode temp files default to.
fn staging_file(dir: &Path, name: &str) -> Result<NamedTempFile, Error> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(name).suffix(".tmp");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(fs::Permissions::from_mode(0o666));
    }
    builder
        .tempfile_in(dir)
        .map_err(|err| io_error(err, dir).with_message("failed to create staging file"))
}

/// Give `staged` the permissions of the file it replaces.
fn keep_permissions(staged: &NamedTempFile, replaced: &Path) -> Result<(), Error> {
    let permissions = fs::metadata(replaced)
        .map_err(|err| io_error(err, replaced))?
        .permissions();
    fs::set_permissions(staged.path(), permissions).map_err(|err| io_error(err, staged.path()))
}

/// Replace `path` with `text` via a staged temp file.
pub(crate) fn write_text_atomic(path: &Path, text: &str) -> Result<(), Error> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("staged");
    let mut staged = staging_file(dir, name)?;
    staged
        .write_all(text.as_bytes())
        .map_err(|err| io_error(err, path))?;
    if path.is_file() {
        keep_permissions(&staged, path)?;
    }
    staged
        .persist(path)
        .map_err(|err| io_error(err.error, path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        LineReader, RowWrite, base_path, count_lines, gz_path, resolve_table_path, table_size,
        write_rows, write_text_atomic,
    };
    use crate::core::encoding::TextEncoding;
    use crate::core::error::{Error, ErrorKind};
    use crate::core::relations::{Field, Relation};
    use crate::core::value::Datatype;
    use std::path::Path;

    fn relation() -> Relation {
        Relation::new(
            "item",
            vec![
                Field::key("i-id", Datatype::Integer),
                Field::plain("i-input", Datatype::String),
            ],
        )
        .unwrap()
    }

    fn rows(values: &[(&str, &str)]) -> Vec<Result<Vec<String>, Error>> {
        values
            .iter()
            .map(|(id, input)| Ok(vec![id.to_string(), input.to_string()]))
            .collect()
    }

    fn read_all(path: &Path) -> Vec<String> {
        LineReader::open(path, TextEncoding::Utf8)
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[cfg(unix)]
    #[test]
    fn rewrites_keep_file_permissions() {
        use std::fs;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let rel = relation();
        let mode = |path: &Path| fs::metadata(path).unwrap().permissions().mode() & 0o777;
        let reference = dir.path().join("reference");
        fs::write(&reference, "").unwrap();

        let path = write_rows(dir.path(), "item", rows(&[("1", "a")]), &rel, RowWrite::default())
            .expect("write");
        assert_eq!(mode(&path), mode(&reference));

        fs::set_permissions(&path, fs::Permissions::from_mode(0o640)).unwrap();
        write_rows(dir.path(), "item", rows(&[("2", "b")]), &rel, RowWrite::default())
            .expect("rewrite");
        assert_eq!(mode(&path), 0o640);

        let gzip = RowWrite {
            gzip: true,
            ..RowWrite::default()
        };
        let gz = write_rows(dir.path(), "item", rows(&[("3", "c")]), &rel, gzip).expect("gzip");
        assert_eq!(mode(&gz), 0o640);

        let catalog = dir.path().join("relations");
        write_text_atomic(&catalog, "item:\n").unwrap();
        assert_eq!(mode(&catalog), mode(&reference));
        fs::set_permissions(&catalog, fs::Permissions::from_mode(0o604)).unwrap();
        write_text_atomic(&catalog, "item:\n  i-id :integer :key\n").unwrap();
        assert_eq!(mode(&catalog), 0o604);
    }

    #[test]
    fn gz_suffix_helpers() {
        assert_eq!(base_path(Path::new("a/item.gz")), Path::new("a/item"));
        assert_eq!(base_path(Path::new("a/item")), Path::new("a/item"));
        assert_eq!(gz_path(Path::new("a/item-set")), Path::new("a/item-set.gz"));
    }

    #[test]
    fn plain_write_then_append() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rel = relation();
        let path = write_rows(dir.path(), "item", rows(&[("1", "a@b")]), &rel, RowWrite::default())
            .expect("write");
        assert_eq!(path, dir.path().join("item"));
        assert_eq!(read_all(&path), ["1@a\\sb"]);

        let options = RowWrite {
            append: true,
            ..RowWrite::default()
        };
        write_rows(dir.path(), "item", rows(&[("2", "c")]), &rel, options).expect("append");
        assert_eq!(read_all(&path), ["1@a\\sb", "2@c"]);
        assert_eq!(count_lines(&path, TextEncoding::Utf8).unwrap(), 2);
    }

    #[test]
    fn gzip_write_replaces_plain_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rel = relation();
        write_rows(dir.path(), "item", rows(&[("1", "a")]), &rel, RowWrite::default())
            .expect("plain");
        let options = RowWrite {
            gzip: true,
            ..RowWrite::default()
        };
        let path = write_rows(dir.path(), "item", rows(&[("1", "a"), ("2", "b")]), &rel, options)
            .expect("gzip");
        assert_eq!(path, dir.path().join("item.gz"));
        assert!(!dir.path().join("item").exists());
        assert_eq!(resolve_table_path(&dir.path().join("item")), Some(path.clone()));
        assert_eq!(read_all(&path), ["1@a", "2@b"]);

        let append = RowWrite {
            append: true,
            gzip: true,
            ..RowWrite::default()
        };
        write_rows(dir.path(), "item", rows(&[("3", "c")]), &rel, append).expect("append");
        assert_eq!(read_all(&path), ["1@a", "2@b", "3@c"]);
        assert!(table_size(&dir.path().join("item")).unwrap() > 0);
    }

    #[test]
    fn empty_tables_are_not_compressed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let options = RowWrite {
            gzip: true,
            ..RowWrite::default()
        };
        let path = write_rows(dir.path(), "item", rows(&[]), &relation(), options).expect("write");
        assert_eq!(path, dir.path().join("item"));
        assert_eq!(table_size(&path).unwrap(), 0);
    }

    #[test]
    fn missing_directory_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope");
        let err = write_rows(&missing, "item", rows(&[]), &relation(), RowWrite::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(table_size(&missing.join("item")).unwrap(), 0);
        assert_eq!(resolve_table_path(&missing.join("item")), None);
    }
}
