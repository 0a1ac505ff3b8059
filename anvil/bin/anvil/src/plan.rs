// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The execution plan: a DAG of commands with cycle detection and bounded
//! parallel execution.

use std::{
    collections::HashMap,
    io::Write,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context, Result};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::command::{Command, FileId, FileTable};
use crate::error::Error;

const PLAN_FILE_VERSION: u32 = 1;

/// Outcome of one command within a plan execution.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CommandStatus {
    Succeeded,
    /// Outputs were newer than every input; nothing ran.
    UpToDate,
    Failed(Option<i32>),
    /// Never dispatched: a producer failed, the error budget ran out, the
    /// time limit expired or the build was stopped.
    NotRun,
}

#[derive(Clone, Debug)]
pub struct CommandOutcome {
    pub name: String,
    pub status: CommandStatus,
    /// Time the command started, relative to the execution start.
    pub began: Duration,
    pub took: Duration,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        matches!(self.status, CommandStatus::Succeeded | CommandStatus::UpToDate)
    }
}

/// Aggregate result of one plan execution.
#[derive(Debug)]
pub struct ExecutionReport {
    /// Index-aligned with the plan's command order.
    pub outcomes: Vec<CommandOutcome>,
    pub failed: usize,
    pub time_limit_hit: bool,
    pub trace: chrome_trace::Trace,
}

/// Dumpable description of the cyclic portion of an invalid plan.
pub struct CycleReport {
    /// Non-trivial strongly connected components, as command names with
    /// their in-cycle successors.
    sccs: Vec<Vec<(String, Vec<String>)>>,
    /// Commands outside every cycle with their successors.
    processed: Vec<(String, Vec<String>)>,
    /// Commands inside some cycle with their successors.
    unprocessed: Vec<(String, Vec<String>)>,
}

impl CycleReport {
    pub fn scc_sizes(&self) -> Vec<usize> {
        self.sccs.iter().map(|s| s.len()).collect()
    }

    /// Writes each non-trivial SCC to `<dir>/cycle_<i>` plus the
    /// `processed`/`unprocessed` adjacency dumps.
    pub fn dump(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir).with_context(|| format!("mkdir {}", dir.display()))?;
        for (i, scc) in self.sccs.iter().enumerate() {
            write_adjacency(&dir.join(format!("cycle_{i}")), scc)?;
        }
        write_adjacency(&dir.join("processed"), &self.processed)?;
        write_adjacency(&dir.join("unprocessed"), &self.unprocessed)?;
        Ok(())
    }

    pub fn to_error(&self) -> anyhow::Error {
        anyhow!(Error::CyclicDependencies {
            scc_sizes: self.scc_sizes(),
        })
    }
}

fn write_adjacency(path: &Path, nodes: &[(String, Vec<String>)]) -> Result<()> {
    let mut f = std::fs::File::create(path)?;
    for (name, succs) in nodes {
        writeln!(f, "{name}")?;
        for s in succs {
            writeln!(f, "  -> {s}")?;
        }
    }
    Ok(())
}

/// Copy of the per-execution knobs handed to workers.
#[derive(Clone)]
struct ExecFlags {
    build_always: bool,
    write_output_to_file: bool,
    show_output: bool,
}

/// A validated-or-not execution plan over a set of commands.
pub struct ExecutionPlan {
    /// Commands in topological order (producers first). Empty when the
    /// plan is invalid.
    commands: Vec<Arc<Command>>,
    /// `FileId` -> path snapshot taken at creation.
    paths: Arc<Vec<PathBuf>>,
    /// Producer-to-consumer edges as indices into `commands`.
    edges: Vec<(usize, usize)>,
    cycle_report: Option<CycleReport>,

    pub build_always: bool,
    pub skip_errors: usize,
    pub throw_on_errors: bool,
    pub time_limit: Option<Duration>,
    pub write_output_to_file: bool,
    pub show_output: bool,
    stopped: Arc<AtomicBool>,
}

impl ExecutionPlan {
    /// Builds a plan from `cmds`.
    ///
    /// The graph has an edge A -> B whenever B consumes an output of A.
    /// Cycles leave the plan invalid with a [`CycleReport`] attached; two
    /// commands claiming one output are rejected outright.
    pub fn create(cmds: Vec<Arc<Command>>, files: &FileTable) -> Result<ExecutionPlan> {
        let paths = Arc::new(files.snapshot());

        let mut producer: HashMap<FileId, usize> = HashMap::new();
        for (i, c) in cmds.iter().enumerate() {
            for out in &c.outputs {
                if let Some(prev) = producer.insert(*out, i) {
                    bail!(Error::InvalidInput(format!(
                        "output {} produced by both {:?} and {:?}",
                        paths
                            .get(out.0 as usize)
                            .map(|p| p.display().to_string())
                            .unwrap_or_default(),
                        cmds[prev].name,
                        c.name,
                    )));
                }
            }
        }

        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let nodes: Vec<NodeIndex> = (0..cmds.len()).map(|i| graph.add_node(i)).collect();
        for (i, c) in cmds.iter().enumerate() {
            for input in &c.inputs {
                if let Some(&p) = producer.get(input) {
                    if p != i {
                        graph.update_edge(nodes[p], nodes[i], ());
                    }
                }
            }
        }

        match toposort(&graph, None) {
            Ok(order) => {
                // Re-number commands in topological order.
                let mut renumber = vec![0usize; cmds.len()];
                let mut ordered = Vec::with_capacity(cmds.len());
                for (new_idx, node) in order.iter().enumerate() {
                    renumber[graph[*node]] = new_idx;
                    ordered.push(cmds[graph[*node]].clone());
                }
                let edges = graph
                    .edge_indices()
                    .filter_map(|e| graph.edge_endpoints(e))
                    .map(|(a, b)| (renumber[graph[a]], renumber[graph[b]]))
                    .collect();
                Ok(ExecutionPlan {
                    commands: ordered,
                    paths,
                    edges,
                    cycle_report: None,
                    build_always: false,
                    skip_errors: 0,
                    throw_on_errors: true,
                    time_limit: None,
                    write_output_to_file: false,
                    show_output: false,
                    stopped: Arc::new(AtomicBool::new(false)),
                })
            }
            Err(_) => {
                let sccs = tarjan_scc(&graph);
                let name_of = |n: NodeIndex| cmds[graph[n]].name.clone();
                let successors = |n: NodeIndex, keep: &dyn Fn(NodeIndex) -> bool| {
                    graph
                        .neighbors(n)
                        .filter(|m| keep(*m))
                        .map(name_of)
                        .collect::<Vec<_>>()
                };

                let mut in_cycle = vec![false; cmds.len()];
                let mut cycle_dumps = Vec::new();
                for scc in sccs.iter().filter(|scc| scc.len() > 1) {
                    for n in scc {
                        in_cycle[graph[*n]] = true;
                    }
                    let members: Vec<NodeIndex> = scc.clone();
                    cycle_dumps.push(
                        members
                            .iter()
                            .map(|n| {
                                (
                                    name_of(*n),
                                    successors(*n, &|m| members.contains(&m)),
                                )
                            })
                            .collect::<Vec<_>>(),
                    );
                }

                let processed = graph
                    .node_indices()
                    .filter(|n| !in_cycle[graph[*n]])
                    .map(|n| (name_of(n), successors(n, &|_| true)))
                    .collect();
                let unprocessed = graph
                    .node_indices()
                    .filter(|n| in_cycle[graph[*n]])
                    .map(|n| (name_of(n), successors(n, &|_| true)))
                    .collect();

                Ok(ExecutionPlan {
                    commands: Vec::new(),
                    paths,
                    edges: Vec::new(),
                    cycle_report: Some(CycleReport {
                        sccs: cycle_dumps,
                        processed,
                        unprocessed,
                    }),
                    build_always: false,
                    skip_errors: 0,
                    throw_on_errors: true,
                    time_limit: None,
                    write_output_to_file: false,
                    show_output: false,
                    stopped: Arc::new(AtomicBool::new(false)),
                })
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        self.cycle_report.is_none()
    }

    pub fn cycle_report(&self) -> Option<&CycleReport> {
        self.cycle_report.as_ref()
    }

    /// Commands in execution order.
    pub fn commands(&self) -> &[Arc<Command>] {
        &self.commands
    }

    /// Shares the stop flag so an external `stop()` reaches a running
    /// execution.
    pub fn set_stop_flag(&mut self, flag: Arc<AtomicBool>) {
        self.stopped = flag;
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Executes the plan on `pool`.
    ///
    /// Ready commands (all producers finished) are dispatched in parallel.
    /// A failure consumes one unit of the `skip_errors` budget; once the
    /// budget is spent, in-flight commands finish but nothing new starts.
    /// The same applies when the time limit expires or the stop flag is
    /// set. Dependents of a failed command never run.
    pub fn execute(&self, pool: &rayon::ThreadPool) -> Result<ExecutionReport> {
        if let Some(report) = &self.cycle_report {
            return Err(report.to_error());
        }

        let n = self.commands.len();
        let mut indegree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (p, c) in &self.edges {
            indegree[*c] += 1;
            dependents[*p].push(*c);
        }

        let mut ready: Vec<usize> = (0..n).filter(|i| indegree[*i] == 0).collect();
        // Earlier topological positions first keeps dispatch deterministic.
        ready.sort_unstable();
        ready.reverse();

        let flags = ExecFlags {
            build_always: self.build_always,
            write_output_to_file: self.write_output_to_file,
            show_output: self.show_output,
        };
        let start = Instant::now();
        let deadline = self.time_limit.map(|d| start + d);

        let (tx, rx) = mpsc::channel::<(usize, CommandOutcome)>();
        let mut outcomes: Vec<Option<CommandOutcome>> = (0..n).map(|_| None).collect();
        let mut running = 0usize;
        let mut failed = 0usize;
        let mut time_limit_hit = false;

        loop {
            let budget_ok = failed <= self.skip_errors;
            let stopped = self.stopped.load(Ordering::SeqCst);
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline && !ready.is_empty() {
                    time_limit_hit = true;
                }
            }
            let scheduling = budget_ok && !stopped && !time_limit_hit;

            while scheduling {
                let i = match ready.pop() {
                    Some(i) => i,
                    None => break,
                };
                let cmd = self.commands[i].clone();
                let paths = self.paths.clone();
                let flags = flags.clone();
                let tx = tx.clone();
                pool.spawn(move || {
                    let outcome = run_one(&cmd, &paths, &flags, start);
                    // The receiver only disappears on scheduler panic.
                    let _ = tx.send((i, outcome));
                });
                running += 1;
            }

            if running == 0 {
                break;
            }

            let (i, outcome) = rx.recv().context("executor channel closed")?;
            running -= 1;
            if outcome.success() {
                for &j in &dependents[i] {
                    indegree[j] -= 1;
                    if indegree[j] == 0 {
                        ready.push(j);
                    }
                }
            } else {
                failed += 1;
                warn!("command failed: {}", outcome.name);
            }
            outcomes[i] = Some(outcome);
        }

        let mut trace = chrome_trace::Trace::new();
        let outcomes: Vec<CommandOutcome> = outcomes
            .into_iter()
            .enumerate()
            .map(|(i, o)| {
                o.unwrap_or_else(|| CommandOutcome {
                    name: self.commands[i].name.clone(),
                    status: CommandStatus::NotRun,
                    began: Duration::ZERO,
                    took: Duration::ZERO,
                })
            })
            .collect();
        for o in &outcomes {
            if matches!(o.status, CommandStatus::Succeeded | CommandStatus::Failed(_)) {
                trace.events.push(chrome_trace::Event::complete(
                    &o.name,
                    o.began.as_secs_f64() * 1e6,
                    o.took.as_secs_f64() * 1e6,
                    0,
                ));
            }
        }

        debug!(
            "plan executed: {} commands, {} failed, {:.3}s",
            n,
            failed,
            start.elapsed().as_secs_f64()
        );

        let report = ExecutionReport {
            outcomes,
            failed,
            time_limit_hit,
            trace,
        };

        if self.throw_on_errors {
            if report.time_limit_hit {
                bail!(Error::TimeLimitExceeded);
            }
            if report.failed > 0 {
                let first = report
                    .outcomes
                    .iter()
                    .find(|o| matches!(o.status, CommandStatus::Failed(_)))
                    .map(|o| o.name.clone())
                    .unwrap_or_default();
                bail!(Error::CommandsFailed {
                    failed: report.failed,
                    first,
                });
            }
            if self.stopped.load(Ordering::SeqCst) {
                bail!(Error::Interrupted);
            }
        }
        Ok(report)
    }

    /// Serializes the plan (paths + commands) so a driver can re-run it
    /// without preparing targets again.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = PlanFile {
            version: PLAN_FILE_VERSION,
            paths: (*self.paths).clone(),
            commands: self.commands.iter().map(|c| (**c).clone()).collect(),
        };
        let mut f = std::fs::File::create(path)
            .with_context(|| format!("create {}", path.display()))?;
        serde_json::to_writer(&mut f, &file)?;
        f.flush()?;
        Ok(())
    }

    /// Loads a previously saved plan.
    pub fn load(path: &Path) -> Result<(Vec<Arc<Command>>, FileTable)> {
        let f = std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
        let file: PlanFile = serde_json::from_reader(std::io::BufReader::new(f))
            .map_err(|e| anyhow!(Error::InvalidInput(format!("bad plan file: {e}"))))?;
        if file.version != PLAN_FILE_VERSION {
            bail!(Error::InvalidInput(format!(
                "bad plan file version {}, expected {PLAN_FILE_VERSION}",
                file.version
            )));
        }
        let table = FileTable::from_paths(file.paths);
        Ok((file.commands.into_iter().map(Arc::new).collect(), table))
    }
}

#[derive(Serialize, Deserialize)]
struct PlanFile {
    version: u32,
    paths: Vec<PathBuf>,
    commands: Vec<Command>,
}

/// Runs one command: up-to-date check, process spawn, output routing.
fn run_one(
    cmd: &Command,
    paths: &[PathBuf],
    flags: &ExecFlags,
    epoch: Instant,
) -> CommandOutcome {
    let began = epoch.elapsed();
    let clock = Instant::now();
    let finish = |status: CommandStatus| CommandOutcome {
        name: cmd.name.clone(),
        status,
        began,
        took: clock.elapsed(),
    };

    if !cmd.always && !flags.build_always && is_up_to_date(cmd, paths) {
        return finish(CommandStatus::UpToDate);
    }

    for out in &cmd.outputs {
        let path = &paths[out.0 as usize];
        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return finish(CommandStatus::Failed(None));
            }
        }
    }

    let mut process = std::process::Command::new(&cmd.program);
    process.args(&cmd.arguments);
    if let Some(dir) = &cmd.working_directory {
        process.current_dir(dir);
    }
    for (k, v) in &cmd.environment {
        process.env(k, v);
    }

    // A per-command wall-clock budget forces the redirected path so the
    // child can be killed without pipe plumbing.
    if let Some(limit) = cmd.time_limit {
        let (out_file, err_file) = output_files(cmd, paths);
        return match processes::run_redirected_with_timeout(
            &mut process,
            &out_file,
            &err_file,
            limit,
        ) {
            Ok(Some(status)) if status.success() => finish(CommandStatus::Succeeded),
            Ok(Some(status)) => finish(CommandStatus::Failed(status.code())),
            Ok(None) => {
                warn!("{} exceeded its time limit", cmd.name);
                finish(CommandStatus::Failed(None))
            }
            Err(e) => {
                warn!("failed to spawn {}: {e}", cmd.name);
                finish(CommandStatus::Failed(None))
            }
        };
    }

    let redirect = flags.write_output_to_file || cmd.stdout_file.is_some();
    let result = if redirect {
        let (out_file, err_file) = output_files(cmd, paths);
        processes::run_redirected(&mut process, &out_file, &err_file)
            .map(|status| (status, Vec::new(), Vec::new()))
    } else {
        processes::run_captured(&mut process)
            .map(|out| (out.status, out.stdout, out.stderr))
    };

    match result {
        Ok((status, stdout, stderr)) => {
            if flags.show_output && !redirect {
                if !stdout.is_empty() {
                    info!("{}: {}", cmd.name, String::from_utf8_lossy(&stdout));
                }
                if !stderr.is_empty() {
                    info!("{}: {}", cmd.name, String::from_utf8_lossy(&stderr));
                }
            }
            if status.success() {
                finish(CommandStatus::Succeeded)
            } else {
                finish(CommandStatus::Failed(status.code()))
            }
        }
        Err(e) => {
            warn!("failed to spawn {}: {e}", cmd.name);
            finish(CommandStatus::Failed(None))
        }
    }
}

/// Where a redirected command writes its stdout/stderr: the explicit
/// locations when set, `<first output>.out/.err` otherwise.
fn output_files(cmd: &Command, paths: &[PathBuf]) -> (PathBuf, PathBuf) {
    if let (Some(out), Some(err)) = (&cmd.stdout_file, &cmd.stderr_file) {
        return (out.clone(), err.clone());
    }
    let base = cmd
        .outputs
        .iter()
        .next()
        .map(|id| paths[id.0 as usize].clone())
        .unwrap_or_else(|| PathBuf::from(cmd.name.replace('/', "_")));
    (
        PathBuf::from(format!("{}.out", base.display())),
        PathBuf::from(format!("{}.err", base.display())),
    )
}

/// A command is up to date when every output exists and none is older than
/// any input.
fn is_up_to_date(cmd: &Command, paths: &[PathBuf]) -> bool {
    if cmd.outputs.is_empty() {
        return false;
    }
    let mut newest_input = None;
    for id in &cmd.inputs {
        match fileutil::mtime(&paths[id.0 as usize]) {
            Ok(t) => newest_input = Some(newest_input.map_or(t, |acc: std::time::SystemTime| acc.max(t))),
            Err(_) => return false,
        }
    }
    for id in &cmd.outputs {
        match fileutil::mtime(&paths[id.0 as usize]) {
            Ok(t) => {
                if let Some(newest) = newest_input {
                    if t < newest {
                        return false;
                    }
                }
            }
            Err(_) => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use testutil::SafeTempDir;

    fn pool() -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new()
            .num_threads(4)
            .build()
            .unwrap()
    }

    /// `sh -c` command writing its name into its single output file.
    fn touch_cmd(
        files: &FileTable,
        name: &str,
        inputs: &[&Path],
        output: &Path,
    ) -> Arc<Command> {
        let mut c = Command::new(
            name,
            Path::new("sh"),
        )
        .arg("-c")
        .arg(format!("cat {} > {} 2>/dev/null; echo {} >> {}",
            inputs
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(" "),
            output.display(),
            name,
            output.display(),
        ));
        for i in inputs {
            c = c.input(files.register(i));
        }
        Arc::new(c.output(files.register(output)))
    }

    #[test]
    fn executes_in_dependency_order() -> Result<()> {
        let dir = SafeTempDir::new()?;
        let files = FileTable::new();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let c = dir.path().join("c");

        // c depends on b depends on a; submitted out of order.
        let cmds = vec![
            touch_cmd(&files, "make-c", &[&b], &c),
            touch_cmd(&files, "make-a", &[], &a),
            touch_cmd(&files, "make-b", &[&a], &b),
        ];

        let plan = ExecutionPlan::create(cmds, &files)?;
        assert!(plan.is_valid());
        assert_eq!(plan.commands().len(), 3);

        let report = plan.execute(&pool())?;
        assert_eq!(report.failed, 0);
        assert!(c.exists());
        let contents = std::fs::read_to_string(&c)?;
        assert!(contents.contains("make-a"));
        assert!(contents.contains("make-b"));
        assert!(contents.contains("make-c"));
        Ok(())
    }

    #[test]
    fn cycles_are_reported_with_dumps() -> Result<()> {
        let dir = SafeTempDir::new()?;
        let files = FileTable::new();
        let a = dir.path().join("out_a");
        let b = dir.path().join("out_b");
        let c = dir.path().join("out_c");

        let cmds = vec![
            touch_cmd(&files, "A", &[&c], &a),
            touch_cmd(&files, "B", &[&a], &b),
            touch_cmd(&files, "C", &[&b], &c),
        ];

        let plan = ExecutionPlan::create(cmds, &files)?;
        assert!(!plan.is_valid());
        let report = plan.cycle_report().unwrap();
        assert_eq!(report.scc_sizes(), vec![3]);

        let cyclic_dir = dir.path().join("misc").join("cyclic");
        report.dump(&cyclic_dir)?;
        assert!(cyclic_dir.join("cycle_0").exists());
        assert!(cyclic_dir.join("processed").exists());
        assert!(cyclic_dir.join("unprocessed").exists());

        let err = plan.execute(&pool()).unwrap_err();
        assert!(matches!(
            crate::error::error_kind(&err),
            Some(Error::CyclicDependencies { scc_sizes }) if scc_sizes == &vec![3]
        ));
        Ok(())
    }

    #[test]
    fn duplicate_producers_are_rejected() -> Result<()> {
        let dir = SafeTempDir::new()?;
        let files = FileTable::new();
        let out = dir.path().join("out");
        let cmds = vec![
            touch_cmd(&files, "one", &[], &out),
            touch_cmd(&files, "two", &[], &out),
        ];
        assert!(ExecutionPlan::create(cmds, &files).is_err());
        Ok(())
    }

    #[test]
    fn failure_skips_dependents() -> Result<()> {
        let dir = SafeTempDir::new()?;
        let files = FileTable::new();
        let a = dir.path().join("a");
        let b = dir.path().join("b");

        let fail = Arc::new(
            Command::new("fail", Path::new("sh"))
                .arg("-c")
                .arg("exit 3")
                .output(files.register(&a)),
        );
        let dependent = touch_cmd(&files, "dependent", &[&a], &b);

        let mut plan = ExecutionPlan::create(vec![fail, dependent], &files)?;
        plan.throw_on_errors = false;
        let report = plan.execute(&pool())?;

        assert_eq!(report.failed, 1);
        let by_name: HashMap<_, _> = report
            .outcomes
            .iter()
            .map(|o| (o.name.clone(), o.status.clone()))
            .collect();
        assert_eq!(by_name["fail"], CommandStatus::Failed(Some(3)));
        assert_eq!(by_name["dependent"], CommandStatus::NotRun);
        Ok(())
    }

    #[test]
    fn skip_errors_budget_lets_independent_work_continue() -> Result<()> {
        let dir = SafeTempDir::new()?;
        let files = FileTable::new();
        let ok = dir.path().join("ok");

        let fail = Arc::new(
            Command::new("fail", Path::new("false"))
                .output(files.register(&dir.path().join("never"))),
        );
        let succeed = touch_cmd(&files, "succeed", &[], &ok);

        let mut plan = ExecutionPlan::create(vec![fail, succeed], &files)?;
        plan.throw_on_errors = false;
        plan.skip_errors = 1;
        let report = plan.execute(&pool())?;

        assert_eq!(report.failed, 1);
        assert!(ok.exists());
        Ok(())
    }

    #[test]
    fn up_to_date_commands_are_skipped() -> Result<()> {
        let dir = SafeTempDir::new()?;
        let files = FileTable::new();
        let src = dir.path().join("src");
        std::fs::write(&src, "x")?;
        let out = dir.path().join("out");

        let cmds = vec![touch_cmd(&files, "gen", &[&src], &out)];
        let plan = ExecutionPlan::create(cmds.clone(), &files)?;
        let r1 = plan.execute(&pool())?;
        assert_eq!(r1.outcomes[0].status, CommandStatus::Succeeded);

        let plan2 = ExecutionPlan::create(cmds.clone(), &files)?;
        let r2 = plan2.execute(&pool())?;
        assert_eq!(r2.outcomes[0].status, CommandStatus::UpToDate);

        // build_always forces a rerun.
        let mut plan3 = ExecutionPlan::create(cmds, &files)?;
        plan3.build_always = true;
        let r3 = plan3.execute(&pool())?;
        assert_eq!(r3.outcomes[0].status, CommandStatus::Succeeded);
        Ok(())
    }

    #[test]
    fn stop_flag_prevents_new_dispatch() -> Result<()> {
        let dir = SafeTempDir::new()?;
        let files = FileTable::new();
        let out = dir.path().join("out");
        let cmds = vec![touch_cmd(&files, "gen", &[], &out)];

        let plan = ExecutionPlan::create(cmds, &files)?;
        plan.stop();
        let err = plan.execute(&pool()).unwrap_err();
        assert!(matches!(
            crate::error::error_kind(&err),
            Some(Error::Interrupted)
        ));
        assert!(!out.exists());
        Ok(())
    }

    #[test]
    fn trace_has_one_event_per_ran_command() -> Result<()> {
        let dir = SafeTempDir::new()?;
        let files = FileTable::new();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let cmds = vec![
            touch_cmd(&files, "make-a", &[], &a),
            touch_cmd(&files, "make-b", &[&a], &b),
        ];
        let plan = ExecutionPlan::create(cmds, &files)?;
        let report = plan.execute(&pool())?;
        assert_eq!(report.trace.events.len(), 2);
        Ok(())
    }

    #[test]
    fn per_command_time_limit_kills_slow_commands() -> Result<()> {
        let dir = SafeTempDir::new()?;
        let files = FileTable::new();
        let out = dir.path().join("out");

        let mut slow = Command::new("slow", Path::new("sleep"))
            .arg("10")
            .output(files.register(&out));
        slow.time_limit = Some(Duration::from_millis(50));

        let mut plan = ExecutionPlan::create(vec![Arc::new(slow)], &files)?;
        plan.throw_on_errors = false;
        let report = plan.execute(&pool())?;
        assert_eq!(report.failed, 1);
        assert_eq!(report.outcomes[0].status, CommandStatus::Failed(None));
        Ok(())
    }

    #[test]
    fn save_load_round_trip() -> Result<()> {
        let dir = SafeTempDir::new()?;
        let files = FileTable::new();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let cmds = vec![
            touch_cmd(&files, "make-a", &[], &a),
            touch_cmd(&files, "make-b", &[&a], &b),
        ];
        let plan = ExecutionPlan::create(cmds, &files)?;

        let swb = dir.path().join("ep").join("default.swb");
        plan.save(&swb)?;

        let (loaded_cmds, loaded_files) = ExecutionPlan::load(&swb)?;
        let plan2 = ExecutionPlan::create(loaded_cmds, &loaded_files)?;
        assert!(plan2.is_valid());
        let report = plan2.execute(&pool())?;
        assert_eq!(report.failed, 0);
        assert!(b.exists());
        Ok(())
    }

    #[test]
    fn bad_plan_version_is_rejected() -> Result<()> {
        let dir = SafeTempDir::new()?;
        let swb = dir.path().join("plan.swb");
        std::fs::write(&swb, r#"{"version":99,"paths":[],"commands":[]}"#)?;
        assert!(ExecutionPlan::load(&swb).is_err());
        Ok(())
    }
}
