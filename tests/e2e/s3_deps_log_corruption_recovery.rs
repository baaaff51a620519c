//! S3: a deps log with a torn trailing record must load with the intact
//! prefix preserved and a warning describing the recovery.

use ninjacore::depslog::{self, DepsLog, DepsLogWriter};
use std::fs::OpenOptions;
use std::io::Write;

#[test]
fn deps_log_corruption_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("deps.log");
    let path = path.to_str().unwrap();

    let mut log = DepsLog::default();
    {
        let mut writer = DepsLogWriter::create(path).unwrap();
        writer
            .record_deps(&mut log, "out.o", 42, &["a.h".to_owned(), "b.h".to_owned()])
            .unwrap();
    }

    // A torn write: a 4-byte record header claiming an 8-byte deps payload
    // that was never actually written.
    {
        let mut file = OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(&[0x08, 0x00, 0x00, 0x80]).unwrap();
    }

    let result = depslog::load(path).unwrap();
    assert!(result
        .warning
        .as_ref()
        .expect("corrupt tail should produce a warning")
        .contains("recovering"));
    assert_eq!(result.log.lookup(result.log.id_for("out.o").unwrap()).unwrap().mtime, 42);
    assert!(result.log.id_for("a.h").is_some());
    assert!(result.log.id_for("b.h").is_some());
}
