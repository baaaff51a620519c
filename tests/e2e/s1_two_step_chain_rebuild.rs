//! S1: a three-edge diamond chain; changing one leaf input should only
//! rebuild the edges downstream of it.

use crate::{complete_whole_chain, edge_for, parse};
use ninjacore::builder::{BuildConfig, Builder};
use ninjacore::buildlog::BuildLogWriter;
use ninjacore::depslog::DepsLog;
use ninjacore::disk::fake::FakeDisk;
use ninjacore::subprocess::{FakeRunner, Termination};

const MANIFEST: &str = "rule cat\n  command = cat $in > $out\nbuild cat1: cat in1\nbuild cat12: cat cat1 cat2\nbuild cat2: cat in1 in2\n";

#[test]
fn two_step_chain_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("build.log");
    let log_path = log_path.to_str().unwrap();

    let disk = FakeDisk::new();
    disk.touch("in1");
    disk.touch("in2");

    // First run: everything is missing, all three edges must run.
    {
        let mut state = parse(&disk, MANIFEST);
        let target = crate::node(&state, "cat12");
        let (build_log, writer) = BuildLogWriter::open(log_path).unwrap();
        let mut builder = Builder::new(&disk, build_log, Some(writer), DepsLog::default(), None, BuildConfig::default());
        let mut runner = FakeRunner::new(4);

        builder.add_target(&mut state, target, &mut runner).unwrap();
        complete_whole_chain(&state, &disk, &mut runner, "cat12");
        let stats = builder.build(&mut state, &mut runner).unwrap();
        assert_eq!(stats.commands_run, 3);
        assert_eq!(stats.failures, 0);
    }

    // Touch in2 only; cat1 (depends solely on in1) must stay up to date,
    // while cat2 and cat12 (both downstream of in2) must rerun.
    disk.touch("in2");
    {
        let mut state = parse(&disk, MANIFEST);
        let target = crate::node(&state, "cat12");
        let (build_log, writer) = BuildLogWriter::open(log_path).unwrap();
        let mut builder = Builder::new(&disk, build_log, Some(writer), DepsLog::default(), None, BuildConfig::default());
        let mut runner = FakeRunner::new(4);

        builder.add_target(&mut state, target, &mut runner).unwrap();
        assert_eq!(builder.wanted_edges(), 2);
        runner.complete(edge_for(&state, "cat2"), Termination::Success);
        disk.touch("cat2");
        runner.complete(edge_for(&state, "cat12"), Termination::Success);
        disk.touch("cat12");
        let stats = builder.build(&mut state, &mut runner).unwrap();
        assert_eq!(stats.commands_run, 2);
    }
}
