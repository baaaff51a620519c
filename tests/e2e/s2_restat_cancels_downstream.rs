//! S2: a `restat` rule whose output doesn't actually change mtime should
//! cancel a wanted downstream edge before it's ever dispatched.

use crate::{edge_for, edge_id_for, parse};
use ninjacore::builder::{BuildConfig, Builder};
use ninjacore::buildlog::{BuildLog, LogEntry};
use ninjacore::depslog::DepsLog;
use ninjacore::disk::fake::FakeDisk;
use ninjacore::hash::hash_command;
use ninjacore::subprocess::{FakeRunner, Termination};
use std::collections::HashMap;

const MANIFEST: &str = "rule r\n  command = true\n  restat = 1\nrule cc\n  command = true\nbuild h.h: r h.in\nbuild out: cc h.h\n";

#[test]
fn restat_cancels_downstream() {
    let disk = FakeDisk::new();
    disk.touch("h.in");
    disk.touch("h.h");
    disk.touch("out");

    let mut state = parse(&disk, MANIFEST);
    let out_edge = edge_id_for(&state, "out");
    let command_hash = hash_command(&state.command_for(out_edge));

    let mut entries = HashMap::new();
    entries.insert(
        "out".to_owned(),
        LogEntry {
            command_hash,
            start_ms: 0,
            end_ms: 1,
            mtime: disk.stat("out").unwrap().as_stamp(),
        },
    );
    let build_log = BuildLog::from_map(entries);

    // Now invalidate h.h relative to h.in and build `out`.
    disk.touch("h.in");
    let target = crate::node(&state, "out");

    let mut builder = Builder::new(&disk, build_log, None, DepsLog::default(), None, BuildConfig::default());
    let mut runner = FakeRunner::new(2);
    builder.add_target(&mut state, target, &mut runner).unwrap();
    assert_eq!(builder.wanted_edges(), 2);

    // `r` runs but h.h's mtime doesn't advance past h.in's (no disk.touch
    // here): restat should cancel `cc` before it's ever dispatched.
    runner.complete(edge_for(&state, "h.h"), Termination::Success);
    let stats = builder.build(&mut state, &mut runner).unwrap();

    assert_eq!(stats.commands_run, 1);
    assert_eq!(stats.failures, 0);
    assert!(state.edges.get(out_edge).outputs_ready);
}
