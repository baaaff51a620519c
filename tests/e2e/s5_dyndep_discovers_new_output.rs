//! S5: a dyndep file generated earlier in the same build should, once
//! loaded, add a brand-new output to the edge that names it.
//!
//! `dd` is built first (its own top-level `add_target`/`build`), the same
//! way a real two-edge build would reach it before `out` is ever scanned —
//! this keeps the scenario within what `FakeRunner`/`FakeDisk` can actually
//! simulate, since neither one has real command side effects and the
//! dyndep-file's generator must already exist on disk before `out`'s own
//! dependency scan runs.

use crate::{edge_for, node, parse};
use ninjacore::builder::{BuildConfig, Builder};
use ninjacore::buildlog::BuildLog;
use ninjacore::depslog::DepsLog;
use ninjacore::disk::fake::FakeDisk;
use ninjacore::subprocess::{FakeRunner, Termination};

const MANIFEST: &str = "rule cp\n  command = cp $in $out\nrule touch\n  command = touch $out\nbuild dd: cp dd-in\nbuild out: touch in || dd\n  dyndep = dd\n";

const DYNDEP_FILE: &[u8] = b"ninja_dyndep_version = 1\nbuild out | out.imp: dyndep\n";

#[test]
fn dyndep_discovers_new_output() {
    let disk = FakeDisk::new();
    disk.touch("in");
    disk.touch("dd-in");

    let mut state = parse(&disk, MANIFEST);

    let mut builder = Builder::new(&disk, BuildLog::default(), None, DepsLog::default(), None, BuildConfig::default());
    let mut runner = FakeRunner::new(2);

    // Build `dd` first: the `cp` command "writes" the dyndep file.
    let dd = node(&state, "dd");
    builder.add_target(&mut state, dd, &mut runner).unwrap();
    runner.complete(edge_for(&state, "dd"), Termination::Success);
    disk.set_contents("dd", DYNDEP_FILE);
    let stats1 = builder.build(&mut state, &mut runner).unwrap();
    assert_eq!(stats1.commands_run, 1);
    assert_eq!(stats1.failures, 0);

    // `out.imp` doesn't exist as a node until the dyndep file is loaded.
    assert!(state.lookup_node("out.imp").is_none());

    let out = node(&state, "out");
    builder.add_target(&mut state, out, &mut runner).unwrap();

    // Loading dd's contents should have added `out.imp` as an implicit
    // output of the edge that builds `out`, wired to the same edge.
    let out_edge = state.nodes.get(out).in_edge.unwrap();
    let imp = state.lookup_node("out.imp").expect("dyndep should have interned out.imp");
    assert_eq!(state.nodes.get(imp).in_edge, Some(out_edge));

    runner.complete(edge_for(&state, "out"), Termination::Success);
    disk.touch("out");
    disk.touch("out.imp");
    let stats2 = builder.build(&mut state, &mut runner).unwrap();
    assert_eq!(stats2.commands_run, 1);
    assert_eq!(stats2.failures, 0);
}
