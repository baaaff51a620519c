//! S4: a build log written (or concatenated) with two version headers must
//! still yield both entries, each with the command hash from its own line.

use ninjacore::buildlog::BuildLog;

const TEXT: &str = "# ninja log v5\n123\t456\t456\tout\tabc\n# ninja log v5\n456\t789\t789\tout2\tdef\n";

#[test]
fn duplicate_version_header() {
    let log = BuildLog::load(TEXT);

    let out = log.lookup("out").unwrap();
    assert_eq!(out.command_hash, 0xabc);
    assert_eq!(out.start_ms, 123);
    assert_eq!(out.end_ms, 456);
    assert_eq!(out.mtime, 456);

    let out2 = log.lookup("out2").unwrap();
    assert_eq!(out2.command_hash, 0xdef);
    assert_eq!(out2.start_ms, 456);
    assert_eq!(out2.end_ms, 789);
    assert_eq!(out2.mtime, 789);
}
