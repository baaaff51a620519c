//! S6: a pool of depth 1 must never have more than one of its edges
//! dispatched at once, even when the runner itself has spare capacity.

use crate::{edge_for, node, parse};
use ninjacore::builder::{BuildConfig, Builder};
use ninjacore::buildlog::BuildLog;
use ninjacore::depslog::DepsLog;
use ninjacore::disk::fake::FakeDisk;
use ninjacore::subprocess::{CommandResult, CommandRunner, Termination};
use std::collections::HashMap;

const MANIFEST: &str = "pool p\n  depth = 1\nrule r\n  command = cat\n  pool = p\nbuild a: r in\nbuild b: r in\n";

/// A runner that completes a command the instant it's dispatched, while
/// recording the highest number of commands it ever saw in flight at once
/// — the thing an ordinary `FakeRunner`, which only reports what's queued,
/// can't observe directly.
struct SerializingRunner<'a> {
    disk: &'a FakeDisk,
    outputs: HashMap<usize, &'static str>,
    max_parallel: usize,
    active: Vec<usize>,
    pending: Vec<CommandResult>,
    max_concurrent: usize,
}

impl<'a> CommandRunner for SerializingRunner<'a> {
    fn can_run_more(&self) -> bool {
        self.active.len() < self.max_parallel
    }

    fn start_command(&mut self, token: usize, _command: &str) -> anyhow::Result<()> {
        self.active.push(token);
        self.max_concurrent = self.max_concurrent.max(self.active.len());
        if let Some(path) = self.outputs.get(&token) {
            self.disk.touch(path);
        }
        self.pending.push(CommandResult {
            token,
            termination: Termination::Success,
            output: Vec::new(),
        });
        Ok(())
    }

    fn wait(&mut self) -> Option<CommandResult> {
        let result = self.pending.pop()?;
        self.active.retain(|&t| t != result.token);
        Some(result)
    }

    fn active_tokens(&self) -> Vec<usize> {
        self.active.clone()
    }

    fn abort(&mut self) {
        self.active.clear();
        self.pending.clear();
    }
}

#[test]
fn pool_depth_one_serializes() {
    let disk = FakeDisk::new();
    disk.touch("in");
    let mut state = parse(&disk, MANIFEST);

    let a = node(&state, "a");
    let b = node(&state, "b");
    let mut outputs = HashMap::new();
    outputs.insert(edge_for(&state, "a"), "a");
    outputs.insert(edge_for(&state, "b"), "b");

    let mut builder = Builder::new(&disk, BuildLog::default(), None, DepsLog::default(), None, BuildConfig::default());
    let mut runner = SerializingRunner {
        disk: &disk,
        outputs,
        max_parallel: 2,
        active: Vec::new(),
        pending: Vec::new(),
        max_concurrent: 0,
    };

    builder.add_target(&mut state, a, &mut runner).unwrap();
    builder.add_target(&mut state, b, &mut runner).unwrap();
    assert_eq!(builder.wanted_edges(), 2);

    let stats = builder.build(&mut state, &mut runner).unwrap();
    assert_eq!(stats.commands_run, 2);
    assert_eq!(stats.failures, 0);
    assert_eq!(
        runner.max_concurrent, 1,
        "pool of depth 1 should never dispatch both edges at once"
    );
}
