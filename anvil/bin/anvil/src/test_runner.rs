// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The test runner: executes test commands through the regular execution
//! plan and writes a JUnit-style report.

use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use tracing::info;

use crate::build::Build;
use crate::command::Command;
use crate::error::Error;
use crate::plan::{CommandStatus, ExecutionPlan};

struct TestData {
    dir: PathBuf,
    suite: String,
    config: String,
    case: String,
}

/// Runs every test command of the targets to build.
///
/// Tests reuse the execution plan with error throwing off and the error
/// budget set to the test count, so one failing test never blocks the
/// rest. Each test gets its own directory with redirected output and
/// recorded timing; the JUnit XML is written even on partial failure.
pub fn run_tests(b: &mut Build) -> Result<()> {
    let test_root = b.test_dir();
    let ttb: Vec<_> = b.targets_to_build().iter().cloned().collect();

    // Clear test dirs of the active configs only.
    let mut cleared = std::collections::HashSet::new();
    for name in &ttb {
        if let Some(container) = b.targets().get(name) {
            for t in container.iter() {
                let d = test_root.join(t.settings().hash_string());
                if cleared.insert(d.clone()) && d.exists() {
                    std::fs::remove_dir_all(&d)?;
                }
            }
        }
    }

    // Gather test commands, assigning per-test directories.
    let mut cmds: Vec<Arc<Command>> = Vec::new();
    let mut test_data: HashMap<String, TestData> = HashMap::new();
    collect_test_commands(b, &ttb, &test_root, &mut cmds, &mut test_data)?;

    if cmds.is_empty() {
        info!("no tests to run");
        return Ok(());
    }

    let mut plan = ExecutionPlan::create(cmds.clone(), b.files())?;
    if let Some(report) = plan.cycle_report() {
        return Err(report.to_error());
    }
    plan.throw_on_errors = false;
    plan.skip_errors = cmds.len();
    let report = {
        let pool = b.build_pool()?;
        plan.execute(pool)?
    };

    // Record per-test timing and exit codes.
    let mut total = 0;
    let mut failed = 0;
    let mut skipped = 0;
    for outcome in &report.outcomes {
        total += 1;
        let data = match test_data.get(&outcome.name) {
            Some(d) => d,
            None => continue,
        };
        match &outcome.status {
            CommandStatus::NotRun => skipped += 1,
            CommandStatus::Failed(code) => {
                failed += 1;
                if let Some(code) = code {
                    std::fs::write(data.dir.join("exit_code.txt"), code.to_string())?;
                }
            }
            _ => {}
        }
        if data.dir.exists() {
            std::fs::write(
                data.dir.join("time.txt"),
                format!("{:.10}", outcome.took.as_secs_f64()),
            )?;
        }
    }

    info!("");
    info!("Test results:");
    info!("TOTAL:   {total}");
    info!("PASSED:  {}", total - failed - skipped);
    info!("FAILED:  {failed}");
    info!("SKIPPED: {skipped}");
    if failed > 0 {
        info!("");
        info!("List of failed tests:");
        for o in &report.outcomes {
            if matches!(o.status, CommandStatus::Failed(_)) {
                info!("{}", o.name);
            }
        }
    }
    if skipped > 0 {
        info!("");
        info!("List of skipped tests:");
        for o in &report.outcomes {
            if matches!(o.status, CommandStatus::NotRun) {
                info!("{}", o.name);
            }
        }
    }

    write_junit_xml(&test_root.join("results.xml"), &report, &test_data)?;

    if failed > 0 {
        bail!(Error::CommandsFailed {
            failed,
            first: report
                .outcomes
                .iter()
                .find(|o| matches!(o.status, CommandStatus::Failed(_)))
                .map(|o| o.name.clone())
                .unwrap_or_default(),
        });
    }
    Ok(())
}

fn collect_test_commands(
    b: &mut Build,
    ttb: &[pkgid::PackageName],
    test_root: &std::path::Path,
    cmds: &mut Vec<Arc<Command>>,
    test_data: &mut HashMap<String, TestData>,
) -> Result<()> {
    let mut gathered: Vec<(String, String, Vec<Arc<Command>>)> = Vec::new();
    let (targets, files) = b.targets_and_files();
    for name in ttb {
        let suite = name.to_string();
        if let Some(container) = targets.get_mut(name) {
            for t in container.iter_mut() {
                let config = t.settings().hash_string();
                gathered.push((suite.clone(), config, t.tests(files)?));
            }
        }
    }
    for (suite, config, tests) in gathered {
        for c in tests {
            let mut cmd = (*c).clone();
            let case = cmd.name.clone();
            let test_dir_name = case.replace(['/', '\\'], ".");
            let test_dir = test_root.join(&config).join(&suite).join(test_dir_name);
            let wdir = test_dir.join("wdir");
            std::fs::create_dir_all(&wdir)
                .with_context(|| format!("mkdir {}", wdir.display()))?;

            cmd.name = format!("test: [{suite}]/[{config}]/[{case}]");
            cmd.always = true;
            cmd.working_directory = Some(wdir);
            cmd.stdout_file = Some(test_dir.join("stdout.txt"));
            cmd.stderr_file = Some(test_dir.join("stderr.txt"));

            test_data.insert(
                cmd.name.clone(),
                TestData {
                    dir: test_dir,
                    suite: suite.clone(),
                    config: config.clone(),
                    case,
                },
            );
            cmds.push(Arc::new(cmd));
        }
    }
    Ok(())
}

struct SuiteData {
    config: String,
    cases: Vec<usize>,
    time: f64,
    skipped: usize,
    failed: usize,
}

/// Writes `<testsuites>` aggregation in the JUnit format.
/// See https://llg.cubic.org/docs/junit/ for the format.
fn write_junit_xml(
    path: &std::path::Path,
    report: &crate::plan::ExecutionReport,
    test_data: &HashMap<String, TestData>,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)
        .with_context(|| format!("cannot save test results to {}", path.display()))?;
    let mut w = Writer::new_with_indent(std::io::BufWriter::new(file), b' ', 2);

    // Group cases by suite.
    let mut suites: BTreeMap<String, SuiteData> = BTreeMap::new();
    for (i, o) in report.outcomes.iter().enumerate() {
        let data = match test_data.get(&o.name) {
            Some(d) => d,
            None => continue,
        };
        let entry = suites.entry(data.suite.clone()).or_insert_with(|| SuiteData {
            config: data.config.clone(),
            cases: Vec::new(),
            time: 0.0,
            skipped: 0,
            failed: 0,
        });
        entry.cases.push(i);
        match o.status {
            CommandStatus::NotRun => entry.skipped += 1,
            CommandStatus::Failed(_) => {
                entry.failed += 1;
                entry.time += o.took.as_secs_f64();
            }
            _ => entry.time += o.took.as_secs_f64(),
        }
    }

    let total_time: f64 = suites.values().map(|s| s.time).sum();
    let total_tests: usize = suites.values().map(|s| s.cases.len()).sum();
    let total_skipped: usize = suites.values().map(|s| s.skipped).sum();
    let total_failed: usize = suites.values().map(|s| s.failed).sum();

    let mut root = BytesStart::new("testsuites");
    root.push_attribute(("time", format!("{total_time:.6}").as_str()));
    root.push_attribute(("tests", total_tests.to_string().as_str()));
    root.push_attribute(("skipped", total_skipped.to_string().as_str()));
    root.push_attribute(("errors", "0"));
    root.push_attribute(("failures", total_failed.to_string().as_str()));
    w.write_event(Event::Start(root))?;

    for (suite_name, suite) in &suites {
        let mut el = BytesStart::new("testsuite");
        el.push_attribute(("name", suite_name.as_str()));
        el.push_attribute(("package", suite_name.as_str()));
        el.push_attribute(("config", suite.config.as_str()));
        el.push_attribute(("time", format!("{:.6}", suite.time).as_str()));
        el.push_attribute(("tests", suite.cases.len().to_string().as_str()));
        el.push_attribute(("skipped", suite.skipped.to_string().as_str()));
        el.push_attribute(("errors", "0"));
        el.push_attribute(("failures", suite.failed.to_string().as_str()));
        w.write_event(Event::Start(el))?;

        for &i in &suite.cases {
            let o = &report.outcomes[i];
            let data = &test_data[&o.name];
            let mut case = BytesStart::new("testcase");
            case.push_attribute(("name", data.case.as_str()));
            case.push_attribute(("config", data.config.as_str()));

            match &o.status {
                CommandStatus::NotRun => {
                    w.write_event(Event::Start(case))?;
                    w.write_event(Event::Empty(BytesStart::new("skipped")))?;
                    w.write_event(Event::End(BytesEnd::new("testcase")))?;
                }
                CommandStatus::Succeeded | CommandStatus::UpToDate => {
                    case.push_attribute((
                        "time",
                        format!("{:.6}", o.took.as_secs_f64()).as_str(),
                    ));
                    w.write_event(Event::Empty(case))?;
                }
                CommandStatus::Failed(code) => {
                    case.push_attribute((
                        "time",
                        format!("{:.6}", o.took.as_secs_f64()).as_str(),
                    ));
                    w.write_event(Event::Start(case))?;

                    let stdout = std::fs::read_to_string(data.dir.join("stdout.txt"))
                        .unwrap_or_default();
                    let stderr = std::fs::read_to_string(data.dir.join("stderr.txt"))
                        .unwrap_or_default();
                    w.write_event(Event::Start(BytesStart::new("system-out")))?;
                    w.write_event(Event::Text(BytesText::new(&stdout)))?;
                    w.write_event(Event::End(BytesEnd::new("system-out")))?;
                    w.write_event(Event::Start(BytesStart::new("system-err")))?;
                    w.write_event(Event::Text(BytesText::new(&stderr)))?;
                    w.write_event(Event::End(BytesEnd::new("system-err")))?;

                    let mut failure = BytesStart::new("failure");
                    let message = match code {
                        Some(c) => format!("error code = {c}"),
                        None => "process did not exit normally".to_owned(),
                    };
                    failure.push_attribute(("message", message.as_str()));
                    w.write_event(Event::Empty(failure))?;
                    w.write_event(Event::End(BytesEnd::new("testcase")))?;
                }
            }
        }
        w.write_event(Event::End(BytesEnd::new("testsuite")))?;
    }
    w.write_event(Event::End(BytesEnd::new("testsuites")))?;
    Ok(())
}
