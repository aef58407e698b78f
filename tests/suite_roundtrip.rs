// Profile-directory behavior of tables and suites through the public api.
use std::fs;
use std::path::Path;

use itsdb::api::{
    Error, ErrorKind, FieldMapper, JoinHow, ProcessOptions, ProcessSource, Processor, Relations,
    RowMap, SelectMode, Selected, SuiteOptions, SuiteWriteOptions, TablesToWrite, TestSuite,
    TextEncoding, Value, WriteOptions,
};

const RELATIONS: &str = "item:
  i-id :integer :key
  i-input :string
  i-wf :integer

parse:
  parse-id :integer :key
  i-id :integer :key
  readings :integer
";

fn write_profile(dir: &Path, item: &[u8]) {
    fs::create_dir_all(dir).expect("mkdir");
    fs::write(dir.join("relations"), RELATIONS).expect("relations");
    fs::write(dir.join("item"), item).expect("item");
}

fn read_text(path: &Path) -> String {
    fs::read_to_string(path).expect("read table")
}

#[test]
fn in_memory_suite_written_then_reopened_matches() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dest = temp.path().join("profile");

    let mut suite = TestSuite::in_memory(Relations::from_string(RELATIONS).unwrap());
    let item = suite.table("item").unwrap();
    item.append(vec!["10", "the dog barks", ""]).unwrap();
    item.append(vec!["20", "rain@falls", "0"]).unwrap();
    suite
        .write(
            TablesToWrite::All,
            &SuiteWriteOptions {
                path: Some(dest.clone()),
                ..SuiteWriteOptions::default()
            },
        )
        .unwrap();

    assert_eq!(read_text(&dest.join("item")), "10@the dog barks@\n20@rain\\sfalls@0\n");
    assert_eq!(read_text(&dest.join("parse")), "");

    let mut reopened = TestSuite::open(&dest).unwrap();
    let item = reopened.table("item").unwrap();
    assert!(item.is_attached());
    assert_eq!(item.len(), 2);
    let first = item.get(0).unwrap();
    assert_eq!(first.get("i-wf").unwrap(), Some(Value::Integer(1)));
    assert_eq!(
        item.get(-1).unwrap().get("i-input").unwrap(),
        Some(Value::from("rain@falls"))
    );
}

#[test]
fn appended_rows_commit_by_append() {
    let temp = tempfile::tempdir().expect("tempdir");
    let profile = temp.path().join("profile");
    write_profile(&profile, b"1@a@1\n");

    let mut suite = TestSuite::open(&profile).unwrap();
    let item = suite.table("item").unwrap();
    item.append(vec!["2", "b", "1"]).unwrap();
    assert_eq!(item.unsynced_count(), 1);
    item.commit().unwrap();
    assert_eq!(item.unsynced_count(), 0);
    assert_eq!(read_text(&profile.join("item")), "1@a@1\n2@b@1\n");

    let mut record = item.get(0).unwrap();
    record.set("i-input", "z").unwrap();
    assert_eq!(item.list_changes().unwrap().len(), 1);
    item.commit().unwrap();
    assert_eq!(read_text(&profile.join("item")), "1@z@1\n2@b@1\n");
}

#[test]
fn gzip_tables_stay_compressed_through_commits() {
    let temp = tempfile::tempdir().expect("tempdir");
    let profile = temp.path().join("profile");
    write_profile(&profile, b"1@a@1\n2@b@1\n");

    let mut suite = TestSuite::open(&profile).unwrap();
    suite
        .write(
            TablesToWrite::Named(vec!["item".to_string()]),
            &SuiteWriteOptions {
                gzip: Some(true),
                ..SuiteWriteOptions::default()
            },
        )
        .unwrap();
    assert!(profile.join("item.gz").is_file());
    assert!(!profile.join("item").exists());

    let mut reopened = TestSuite::open(&profile).unwrap();
    let item = reopened.table("item").unwrap();
    assert_eq!(item.path(), Some(profile.join("item.gz").as_path()));
    item.append(vec!["3", "c", "1"]).unwrap();
    item.commit().unwrap();
    assert!(!profile.join("item").exists());

    let rows = item.select(&["i-input"], SelectMode::Row).unwrap();
    let inputs: Vec<String> = rows.iter().map(ToString::to_string).collect();
    assert_eq!(inputs, vec!["a", "b", "c"]);
}

#[test]
fn detached_tables_write_elsewhere_without_rebinding() {
    let temp = tempfile::tempdir().expect("tempdir");
    let profile = temp.path().join("profile");
    write_profile(&profile, b"1@a@1\n");

    let mut suite = TestSuite::open(&profile).unwrap();
    let item = suite.table("item").unwrap();
    item.detach().unwrap();
    assert!(!item.is_attached());
    assert_eq!(item.detach().unwrap_err().kind(), ErrorKind::Detached);
    assert_eq!(
        item.write(&WriteOptions::default()).unwrap_err().kind(),
        ErrorKind::Detached
    );

    item.append(vec!["2", "b", "1"]).unwrap();
    let copy = temp.path().join("item-copy");
    item.write(&WriteOptions::to_path(&copy)).unwrap();
    assert!(!item.is_attached());
    assert_eq!(read_text(&copy), "1@a@1\n2@b@1\n");
    assert_eq!(read_text(&profile.join("item")), "1@a@1\n");

    let err = item.attach(&profile.join("item"), TextEncoding::Utf8).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AttachConflict);
}

#[test]
fn latin1_profiles_decode_and_reencode() {
    let temp = tempfile::tempdir().expect("tempdir");
    let profile = temp.path().join("profile");
    write_profile(&profile, b"1@caf\xe9@1\n");

    let mut suite = TestSuite::open_with(
        &profile,
        SuiteOptions {
            encoding: TextEncoding::Latin1,
            ..SuiteOptions::default()
        },
    )
    .unwrap();
    let rows = suite.select("item:i-input", None, SelectMode::List).unwrap();
    assert_eq!(rows, vec![Selected::List(vec![Some(Value::from("café"))])]);

    suite.table("item").unwrap().append(vec!["2", "naïve", "1"]).unwrap();
    suite.table("item").unwrap().commit().unwrap();
    let bytes = fs::read(profile.join("item")).expect("read");
    assert_eq!(bytes, b"1@caf\xe9@1\n2@na\xefve@1\n".to_vec());
}

#[test]
fn suite_join_matches_rows_on_shared_keys() {
    let temp = tempfile::tempdir().expect("tempdir");
    let profile = temp.path().join("profile");
    write_profile(&profile, b"10@the dog barks@1\n20@dog the barks@0\n");
    fs::write(profile.join("parse"), "1@10@2\n2@10@5\n").expect("parse");

    let mut suite = TestSuite::open(&profile).unwrap();
    let inner = suite.join("item", "parse", None, JoinHow::Inner).unwrap();
    assert_eq!(inner.len(), 2);
    let left = suite.join("item", "parse", None, JoinHow::from("left")).unwrap();
    assert_eq!(left.len(), 3);
    let readings = left.select(&["i-id", "readings"], SelectMode::List).unwrap();
    assert_eq!(
        readings.last(),
        Some(&Selected::List(vec![Some(Value::Integer(20)), Some(Value::Integer(-1))]))
    );
}

struct WordCounter;

impl Processor for WordCounter {
    type Response = (i64, i64);

    fn task(&self) -> &str {
        "parse"
    }

    fn process_item(&mut self, datum: &Value, keys: &RowMap) -> Result<Self::Response, Error> {
        let id = keys.get("i-id").and_then(Value::as_i64).unwrap_or_default();
        Ok((id, datum.to_string().split_whitespace().count() as i64))
    }
}

#[derive(Default)]
struct ParseRows {
    next: i64,
}

impl FieldMapper<(i64, i64)> for ParseRows {
    fn affected_tables(&self) -> Vec<String> {
        vec!["parse".to_string()]
    }

    fn map(&mut self, response: &(i64, i64)) -> Result<Vec<(String, RowMap)>, Error> {
        self.next += 1;
        let mut row = RowMap::new();
        row.insert("parse-id".to_string(), Value::Integer(self.next));
        row.insert("i-id".to_string(), Value::Integer(response.0));
        row.insert("readings".to_string(), Value::Integer(response.1));
        Ok(vec![("parse".to_string(), row)])
    }

    fn cleanup(&mut self) -> Result<Vec<(String, RowMap)>, Error> {
        Ok(Vec::new())
    }
}

#[test]
fn processing_a_profile_replaces_and_persists_output_tables() {
    let temp = tempfile::tempdir().expect("tempdir");
    let profile = temp.path().join("profile");
    write_profile(&profile, b"10@the dog barks@1\n20@hi@1\n");
    fs::write(profile.join("parse"), "9@9@9\n").expect("parse");

    let mut suite = TestSuite::open(&profile).unwrap();
    let outcome = suite
        .process(
            &mut WordCounter,
            &mut ParseRows::default(),
            ProcessSource::Target,
            &ProcessOptions {
                buffer_size: Some(0),
                ..ProcessOptions::default()
            },
        )
        .unwrap();
    assert_eq!(outcome.items, 2);
    assert_eq!(outcome.rows, 2);
    assert_eq!(read_text(&profile.join("parse")), "1@10@3\n2@20@1\n");

    let mut reopened = TestSuite::open(&profile).unwrap();
    assert_eq!(reopened.table("parse").unwrap().len(), 2);
}

#[cfg(unix)]
#[test]
fn suite_writes_keep_profile_permissions() {
    use std::os::unix::fs::PermissionsExt;

    let temp = tempfile::tempdir().expect("tempdir");
    let profile = temp.path().join("profile");
    write_profile(&profile, b"1@a@1\n");
    let mode = |path: &Path| fs::metadata(path).expect("metadata").permissions().mode() & 0o777;
    let reference = mode(&profile.join("relations"));
    fs::set_permissions(profile.join("item"), fs::Permissions::from_mode(0o664)).expect("chmod");

    let mut suite = TestSuite::open(&profile).unwrap();
    suite.table("item").unwrap().set(0, vec!["1", "b", "1"]).unwrap();
    suite.write(TablesToWrite::All, &SuiteWriteOptions::default()).unwrap();

    assert_eq!(read_text(&profile.join("item")), "1@b@1\n");
    assert_eq!(mode(&profile.join("item")), 0o664);
    assert_eq!(mode(&profile.join("relations")), reference);
    assert_eq!(mode(&profile.join("parse")), reference);
}
