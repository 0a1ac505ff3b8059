// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The build state machine.
//!
//! A build progresses through a linear sequence of states; every step
//! method checks the expected "from" state and only commits the "to"
//! state when the step succeeds. External `stop()` requests interrupt the
//! machine at transition boundaries and at command dispatch inside the
//! execution plan.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use anyhow::{anyhow, bail, Context as _, Result};
use itertools::Itertools;
use pkgid::{PackageName, UnresolvedPackageName};
use rayon::prelude::*;
use settings::Settings;
use tracing::{debug, info, trace};

use crate::command::{Command, FileTable};
use crate::context::{BuildContext, EntryPoint};
use crate::duration::parse_time_limit;
use crate::error::Error;
use crate::package::{PackageId, UnresolvedPackageId};
use crate::plan::ExecutionPlan;
use crate::storage::Storage;
use crate::target::{PredefinedTarget, PrepareContext, PrepareOutcome, TargetMap};

/// States of a build, in order. Transitions are linear.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, strum_macros::Display)]
pub enum BuildState {
    NotStarted,
    InputsLoaded,
    TargetsToBuildSet,
    PackagesResolved,
    PackagesLoaded,
    Prepared,
    Executed,
}

/// One build input: an entry point plus the settings its targets are
/// instantiated with.
#[derive(Clone)]
pub struct InputWithSettings {
    pub entry_point: Arc<dyn EntryPoint>,
    pub settings: Settings,
}

/// Saved per-config interface settings, readable by later builds through
/// `use_saved_configs`.
const SETTINGS_FILE_VERSION: u32 = 1;

fn saved_config_path(storage_dir: &Path, name: &PackageName, settings: &Settings) -> PathBuf {
    storage_dir
        .join("cfg")
        .join(name.to_string())
        .join(settings.hash_string())
        .join(format!("settings.{SETTINGS_FILE_VERSION}.json"))
}

pub struct Build {
    ctx: Arc<BuildContext>,
    build_dir: PathBuf,
    settings: Settings,
    state: BuildState,
    stopped: Arc<AtomicBool>,
    inputs: Vec<InputWithSettings>,
    targets: TargetMap,
    targets_to_build: BTreeSet<PackageName>,
    resolved_packages: HashMap<UnresolvedPackageName, PackageId>,
    files: FileTable,
    fast_path_files: BTreeSet<PathBuf>,
    name: Option<String>,
    prepare_pool: Option<rayon::ThreadPool>,
    build_pool: Option<rayon::ThreadPool>,
}

impl Build {
    pub fn new(ctx: Arc<BuildContext>, build_dir: &Path) -> Self {
        Self {
            ctx,
            build_dir: build_dir.to_path_buf(),
            settings: Settings::new(),
            state: BuildState::NotStarted,
            stopped: Arc::new(AtomicBool::new(false)),
            inputs: Vec::new(),
            targets: TargetMap::new(),
            targets_to_build: BTreeSet::new(),
            resolved_packages: HashMap::new(),
            files: FileTable::new(),
            fast_path_files: BTreeSet::new(),
            name: None,
            prepare_pool: None,
            build_pool: None,
        }
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    pub fn context(&self) -> &Arc<BuildContext> {
        &self.ctx
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub(crate) fn files(&self) -> &FileTable {
        &self.files
    }

    /// Split borrow for callers that walk targets while interning files.
    pub(crate) fn targets_and_files(&mut self) -> (&mut TargetMap, &FileTable) {
        (&mut self.targets, &self.files)
    }

    pub(crate) fn targets_mut(&mut self) -> &mut TargetMap {
        &mut self.targets
    }

    pub fn targets(&self) -> &TargetMap {
        &self.targets
    }

    pub fn targets_to_build(&self) -> &BTreeSet<PackageName> {
        &self.targets_to_build
    }

    pub fn set_name(&mut self, name: &str) -> Result<()> {
        if self.name.is_some() {
            bail!(Error::InvalidInput("cannot set build name twice".into()));
        }
        self.name = Some(name.to_owned());
        Ok(())
    }

    pub fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| "default".to_owned())
    }

    /// Applies build settings. Worker pool sizes take effect immediately.
    pub fn set_settings(&mut self, s: Settings) -> Result<()> {
        if let Some(jobs) = s.get("build-jobs").as_str() {
            let n: usize = jobs
                .parse()
                .map_err(|_| anyhow!(Error::InvalidInput(format!("bad build-jobs: {jobs:?}"))))?;
            self.build_pool = Some(make_pool(n)?);
        }
        if let Some(jobs) = s.get("prepare-jobs").as_str() {
            let n: usize = jobs.parse().map_err(|_| {
                anyhow!(Error::InvalidInput(format!("bad prepare-jobs: {jobs:?}")))
            })?;
            self.prepare_pool = Some(make_pool(n)?);
        }
        self.settings = s;
        Ok(())
    }

    /// The user-provided external variables map (`D`).
    pub fn external_variables(&self) -> &Settings {
        self.settings.get("D").as_map()
    }

    pub fn add_input(&mut self, input: InputWithSettings) {
        self.inputs.push(input);
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Runs the next step of the state machine. Returns false once the
    /// build is executed.
    pub fn step(&mut self) -> Result<bool> {
        let t = Instant::now();
        let state = self.state;
        match state {
            BuildState::NotStarted => self.load_inputs()?,
            BuildState::InputsLoaded => self.set_targets_to_build()?,
            BuildState::TargetsToBuildSet => self.resolve_packages()?,
            BuildState::PackagesResolved => self.load_packages()?,
            BuildState::PackagesLoaded => self.prepare()?,
            BuildState::Prepared => self.execute()?,
            BuildState::Executed => return Ok(false),
        }
        if self.settings.get("measure") == "true" {
            debug!("build step {state} time: {:.3} s.", t.elapsed().as_secs_f64());
        }
        Ok(true)
    }

    /// Runs the machine to completion.
    pub fn build(&mut self) -> Result<()> {
        let t = Instant::now();
        while self.step()? {}
        if self.settings.get("measure") == "true" {
            debug!("build time: {:.3} s.", t.elapsed().as_secs_f64());
        }
        Ok(())
    }

    /// Forces the machine into `state`, bypassing transition checks. Used
    /// by the saved-plan path only.
    pub fn override_state(&mut self, state: BuildState) {
        trace!("overriding state {} -> {}", self.state, state);
        self.state = state;
    }

    fn advance<F>(&mut self, from: BuildState, to: BuildState, f: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        if self.stopped.load(Ordering::SeqCst) {
            bail!(Error::Interrupted);
        }
        if self.state != from {
            bail!(Error::InternalInvariant(format!(
                "unexpected build state {}, expected {}",
                self.state, from
            )));
        }
        trace!("build {} performing {} -> {}", self.name(), from, to);
        let reg = self.ctx.register_build(self.stopped.clone());
        let result = f(self);
        self.ctx.unregister_build(reg);
        result?;
        self.state = to;
        Ok(())
    }

    /// Loads the provided inputs and registers their targets.
    pub fn load_inputs(&mut self) -> Result<()> {
        self.advance(BuildState::NotStarted, BuildState::InputsLoaded, |b| {
            let inputs = b.inputs.clone();
            for input in inputs {
                let targets = input
                    .entry_point
                    .load_targets(&b.ctx, &input.settings, &b.build_dir)?;
                for t in targets {
                    b.targets.insert(t);
                }
            }
            Ok(())
        })
    }

    /// Marks existing targets as the ones to build.
    pub fn set_targets_to_build(&mut self) -> Result<()> {
        self.advance(
            BuildState::InputsLoaded,
            BuildState::TargetsToBuildSet,
            |b| {
                if b.targets_to_build.is_empty() {
                    b.targets_to_build = b.targets.names().cloned().collect();
                }
                Ok(())
            },
        )
    }

    /// Resolves and installs every external dependency, honoring the lock
    /// file.
    pub fn resolve_packages(&mut self) -> Result<()> {
        self.advance(
            BuildState::TargetsToBuildSet,
            BuildState::PackagesResolved,
            |b| {
                // Gather unresolved requests; targets of the same package
                // share dependencies, so the first instance suffices.
                let mut requests: Vec<UnresolvedPackageName> = Vec::new();
                let mut seen = HashSet::new();
                for (_, tgts) in b.targets.iter() {
                    if let Some(t) = tgts.iter().next() {
                        for d in t.dependencies() {
                            let u = d.unresolved().name().clone();
                            // Targets registered from the same inputs are
                            // not external dependencies.
                            if b.targets.resolve_name(&u).is_some() {
                                continue;
                            }
                            if u.path().is_relative() {
                                continue;
                            }
                            if seen.insert(u.clone()) {
                                requests.push(u);
                            }
                        }
                    }
                }

                let lock_path = b.settings.get("lock_file").as_str().map(PathBuf::from);
                let update_lock = b.settings.get("update_lock_file") == "true";
                let mut old_pins: BTreeMap<UnresolvedPackageName, PackageName> = BTreeMap::new();
                let mut must_update_lock = true;

                if let Some(path) = &lock_path {
                    if !update_lock && path.exists() {
                        must_update_lock = false;
                        let mut pins = crate::lockfile::load(path)?;
                        for (key, _) in b.settings.get("update_lock_file_packages").as_map().iter()
                        {
                            let u: UnresolvedPackageName = key.parse()?;
                            if pins.remove(&u).is_some() {
                                must_update_lock = true;
                            }
                        }
                        old_pins = pins.clone();

                        // Install exactly the pinned packages and seed the
                        // cache so the chain answers from the pins.
                        for (u, p) in &pins {
                            let exact = UnresolvedPackageId::new(
                                UnresolvedPackageName::from(p.clone()),
                                Settings::new(),
                            );
                            let installed = b.ctx.install_packages(&[exact])?;
                            let pkg = &installed[0];
                            let mut rr = crate::resolver::ResolveRequest::new(
                                u.clone(),
                                Settings::new(),
                            );
                            rr.set_package_force(pkg.clone_package());
                            b.ctx.cached_storage().store(&rr)?;
                        }
                    }
                }

                // Resolve and install the gathered requests (source
                // archives resolve with empty settings).
                let upkg_ids: Vec<UnresolvedPackageId> = requests
                    .iter()
                    .map(|u| UnresolvedPackageId::new(u.clone(), Settings::new()))
                    .collect();
                let installed = b.ctx.install(&upkg_ids)?;
                b.resolved_packages.extend(installed.clone());

                // Transitive dependencies: walk installed package data
                // until the set is closed.
                let mut frontier: Vec<UnresolvedPackageName> = installed.keys().cloned().collect();
                while let Some(u) = frontier.pop() {
                    let id = b.resolved_packages[&u].clone();
                    let data = b.ctx.local_storage().load_data(&id)?;
                    for dep in data.dependencies {
                        if b.resolved_packages.contains_key(&dep)
                            || b.targets.resolve_name(&dep).is_some()
                        {
                            continue;
                        }
                        let m = b.ctx.install(&[UnresolvedPackageId::new(
                            dep.clone(),
                            Settings::new(),
                        )])?;
                        b.resolved_packages.extend(m);
                        frontier.push(dep);
                    }
                }

                if let Some(path) = &lock_path {
                    if must_update_lock {
                        let mut new_pins = old_pins.clone();
                        for (u, id) in &b.resolved_packages {
                            new_pins.insert(u.clone(), id.name().clone());
                        }
                        crate::lockfile::log_diff(&old_pins, &new_pins);
                        crate::lockfile::save(path, &new_pins)?;
                    }
                }
                Ok(())
            },
        )
    }

    /// Loads dependency targets until a fixed point: every dependency edge
    /// resolves to a registered target.
    pub fn load_packages(&mut self) -> Result<()> {
        self.advance(
            BuildState::PackagesResolved,
            BuildState::PackagesLoaded,
            |b| b.load_dependency_targets(),
        )
    }

    /// The fixed-point dependency loading loop. Also run between prepare
    /// passes, because passes may discover new dependencies.
    fn load_dependency_targets(&mut self) -> Result<()> {
        let b = self;
        let use_saved = b.settings.get("use_saved_configs") == "true"
            && b.settings.get("master_build") == "true";
        let mut round = 0;
        while !b.stopped.load(Ordering::SeqCst) {
            round += 1;
            trace!("load_packages round {round}");

            // (package, settings hash) pairs to load this round.
            let mut load: Vec<(PackageName, Settings)> = Vec::new();
            let mut load_seen = HashSet::new();
            for (_, tgts) in b.targets.iter() {
                for t in tgts.iter() {
                    for d in t.dependencies() {
                        if d.is_resolved() {
                            continue;
                        }
                        let u = d.unresolved();
                        let name = match b.targets.resolve_name(u.name()) {
                            Some(name) => name,
                            None => match b.resolved_packages.get(u.name()) {
                                Some(id) => id.name().clone(),
                                None => bail!(Error::NotResolved(format!(
                                    "{}: no target resolved: {}",
                                    t.package(),
                                    u.name()
                                ))),
                            },
                        };

                        // Presence-only dependency: pin to the name.
                        if u.settings().is_empty() {
                            d.set_resolved(PackageId::new(name, Settings::new()));
                            continue;
                        }

                        if let Some(container) = b.targets.get(&name) {
                            if let Some(tt) = container.find_suitable(u.settings()) {
                                d.set_resolved(tt.id());
                                continue;
                            }
                        }
                        if load_seen.insert((name.clone(), u.settings().hash())) {
                            load.push((name, u.settings().clone()));
                        }
                    }
                }
            }
            if load.is_empty() {
                break;
            }

            let mut loaded = false;
            for (name, s) in load {
                if use_saved {
                    let path =
                        saved_config_path(b.ctx.storage_dir(), &name, &s);
                    if let Ok(text) = std::fs::read_to_string(&path) {
                        trace!("loading {name} from saved config");
                        let public_ts = Settings::from_json_string(&text)?;
                        b.targets.insert(Box::new(PredefinedTarget::new(
                            name.clone(),
                            s.clone(),
                            public_ts,
                        )));
                        loaded = true;
                        continue;
                    }
                }

                let ep = b.ctx.entry_point_for(name.path()).ok_or_else(|| {
                    anyhow!(Error::NotResolved(format!(
                        "no entry point for package {name}"
                    )))
                })?;
                let tgts = ep.load_targets(&b.ctx, &s, &b.build_dir)?;
                for t in tgts {
                    b.targets.insert(t);
                }
                loaded = true;

                let container = b.targets.get(&name).ok_or_else(|| {
                    anyhow!(Error::NotResolved(format!(
                        "cannot load package {name}: entry point produced no targets"
                    )))
                })?;
                if container.find_suitable(&s).is_none() {
                    bail!(Error::NotResolved(format!(
                        "cannot load package {name} with current settings ({})",
                        s.hash_string()
                    )));
                }
            }
            if !loaded {
                break;
            }
        }
        Ok(())
    }

    /// One parallel prepare pass over all targets. Returns true when any
    /// target wants another pass.
    fn prepare_step(&mut self) -> Result<bool> {
        let mut interfaces: HashMap<PackageId, Settings> = HashMap::new();
        for (_, tgts) in self.targets.iter() {
            for t in tgts.iter() {
                interfaces.insert(t.id(), t.interface_settings());
            }
        }
        // Dependencies resolved outside the target map (installed packages
        // without targets of their own) publish an empty interface.
        for (_, tgts) in self.targets.iter() {
            for t in tgts.iter() {
                for d in t.dependencies() {
                    if let Some(id) = d.resolved() {
                        interfaces.entry(id.clone()).or_default();
                    }
                }
            }
        }

        let ctx = PrepareContext {
            build_dir: &self.build_dir,
            build_settings: &self.settings,
            interfaces: &interfaces,
        };

        let entries = self.targets.entries_mut();
        let outcomes: Vec<Result<PrepareOutcome>> = match &self.prepare_pool {
            Some(pool) => pool.install(|| {
                entries
                    .into_par_iter()
                    .map(|t| t.prepare(&ctx))
                    .collect()
            }),
            None => entries
                .into_par_iter()
                .map(|t| t.prepare(&ctx))
                .collect(),
        };

        let mut more = false;
        for o in outcomes {
            if o? != PrepareOutcome::Done {
                more = true;
            }
        }
        Ok(more)
    }

    /// Runs prepare passes until no target reports remaining work, then
    /// saves interface settings of master builds for config reuse.
    pub fn prepare(&mut self) -> Result<()> {
        self.advance(BuildState::PackagesLoaded, BuildState::Prepared, |b| {
            while b.prepare_step()? {
                if b.stopped.load(Ordering::SeqCst) {
                    return Ok(());
                }
                // Passes may discover dependencies; resolve and load them
                // before the next pass runs.
                b.load_dependency_targets()?;
            }

            if b.settings.get("master_build") != "true" {
                return Ok(());
            }
            for (name, tgts) in b.targets.iter() {
                if !name.path().is_absolute() {
                    continue;
                }
                for t in tgts.iter() {
                    let ifc = t.interface_settings();
                    if ifc.is_empty() {
                        continue;
                    }
                    let path = saved_config_path(b.ctx.storage_dir(), name, t.settings());
                    let json: serde_json::Value = ifc.to_json();
                    fileutil::write_file_if_different(
                        &path,
                        &serde_json::to_string_pretty(&json)?,
                    )?;
                }
            }
            Ok(())
        })
    }

    /// Gathers commands from the targets to build and their dependency
    /// closure over published interfaces.
    pub fn get_commands(&mut self) -> Result<Vec<Arc<Command>>> {
        if self.targets_to_build.is_empty() {
            bail!(Error::InvalidInput(
                "no targets were selected for building".into()
            ));
        }

        let mut in_ttb: BTreeSet<String> = self
            .settings
            .get("target-to-build")
            .as_array()
            .iter()
            .filter_map(|s| s.as_str().map(str::to_owned))
            .collect();
        let mut in_ttb_exclude: BTreeSet<String> = BTreeSet::new();
        for t in self.settings.get("target-to-exclude").as_array() {
            let name = t.as_str().unwrap_or_default().to_owned();
            if in_ttb.contains(&name) {
                bail!(Error::InvalidInput(format!(
                    "target {name} specified both in include and exclude lists"
                )));
            }
            in_ttb_exclude.insert(name);
        }
        let filter_used = !in_ttb.is_empty();

        let mut ttb: BTreeSet<PackageName> = BTreeSet::new();
        for name in &self.targets_to_build {
            if filter_used {
                if !in_ttb.remove(&name.path().to_string()) {
                    continue;
                }
            }
            if in_ttb_exclude.contains(&name.path().to_string()) {
                continue;
            }
            ttb.insert(name.clone());
        }
        if !in_ttb.is_empty() {
            bail!(Error::InvalidInput(format!(
                "cannot make targets: {}: no such targets",
                in_ttb.iter().join(", ")
            )));
        }

        // Dependency closure: follow published link dependencies.
        let mut frontier: Vec<PackageName> = ttb.iter().cloned().collect();
        while let Some(name) = frontier.pop() {
            let container = match self.targets.get(&name) {
                Some(c) => c,
                None => continue,
            };
            let mut discovered = Vec::new();
            for t in container.iter() {
                let ifc = t.interface_settings();
                for (dep_name, v) in ifc.get("dependencies").get("link").as_map().iter() {
                    let u: UnresolvedPackageName = match dep_name.parse() {
                        Ok(u) => u,
                        Err(_) => continue,
                    };
                    let dep = match self.targets.resolve_name(&u) {
                        Some(dep) => dep,
                        None => continue,
                    };
                    if ttb.contains(&dep) {
                        continue;
                    }
                    let suitable = self
                        .targets
                        .get(&dep)
                        .and_then(|c| c.find_suitable(v.as_map()))
                        .is_some();
                    if !suitable {
                        trace!("dep+settings not found: {dep_name}");
                        continue;
                    }
                    discovered.push(dep);
                }
            }
            for dep in discovered {
                ttb.insert(dep.clone());
                frontier.push(dep);
            }
        }

        let mut cmds: Vec<Arc<Command>> = Vec::new();
        let ttb_vec: Vec<PackageName> = ttb.iter().cloned().collect();
        for name in &ttb_vec {
            if let Some(container) = self.targets.get_mut(name) {
                for t in container.iter_mut() {
                    cmds.extend(t.commands(&self.files)?);

                    let ifc = t.interface_settings();
                    if let Some(out) = ifc.get("output_file").as_str() {
                        self.fast_path_files.insert(PathBuf::from(out));
                    }
                    if let Some(il) = ifc.get("import_library").as_str() {
                        self.fast_path_files.insert(PathBuf::from(il));
                    }
                }
            }
        }
        self.targets_to_build = ttb;
        Ok(cmds)
    }

    /// Builds the execution plan, dumping cycle diagnostics on failure.
    pub fn get_execution_plan(&mut self) -> Result<ExecutionPlan> {
        let cmds = self.get_commands()?;
        self.make_plan(cmds)
    }

    fn make_plan(&self, cmds: Vec<Arc<Command>>) -> Result<ExecutionPlan> {
        let plan = ExecutionPlan::create(cmds, &self.files)?;
        if let Some(report) = plan.cycle_report() {
            let dir = self.build_dir.join("misc").join("cyclic");
            report.dump(&dir)?;
            return Err(report.to_error());
        }
        Ok(plan)
    }

    /// Applies the settings-driven execution knobs to a plan.
    fn configure_plan(&self, plan: &mut ExecutionPlan) -> Result<()> {
        plan.set_stop_flag(self.stopped.clone());
        plan.build_always |= self.settings.get("build_always") == "true";
        plan.write_output_to_file |= self.settings.get("write_output_to_file") == "true";
        plan.show_output |= self.settings.get("show_output") == "true";
        if let Some(n) = self.settings.get("skip_errors").as_str() {
            plan.skip_errors = n
                .parse()
                .map_err(|_| anyhow!(Error::InvalidInput(format!("bad skip_errors: {n:?}"))))?;
        }
        if let Some(tl) = self.settings.get("time_limit").as_str() {
            plan.time_limit = Some(parse_time_limit(tl)?);
        }
        Ok(())
    }

    pub(crate) fn build_pool(&mut self) -> Result<&rayon::ThreadPool> {
        if self.build_pool.is_none() {
            self.build_pool = Some(make_pool(self.ctx.default_build_jobs)?);
        }
        Ok(self.build_pool.as_ref().unwrap())
    }

    /// Creates the plan and executes it.
    pub fn execute(&mut self) -> Result<()> {
        self.advance(BuildState::Prepared, BuildState::Executed, |b| {
            let mut plan = b.get_execution_plan()?;
            b.configure_plan(&mut plan)?;
            b.execute_plan(&plan)
        })
    }

    fn execute_plan(&mut self, plan: &ExecutionPlan) -> Result<()> {
        let t = Instant::now();
        let report = {
            let pool = self.build_pool()?;
            plan.execute(pool)?
        };
        if self.settings.get("measure") == "true" {
            debug!("execute time: {:.3} s.", t.elapsed().as_secs_f64());
        }

        if self.settings.get("time_trace") == "true" {
            let path = self.build_dir.join("misc").join("time_trace.json");
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let f = std::fs::File::create(&path)
                .with_context(|| format!("create {}", path.display()))?;
            report.trace.save(f)?;
            info!("time trace written to {}", path.display());
        }

        self.write_fast_path_files()?;
        self.copy_outputs()?;
        Ok(())
    }

    /// Persists the built-output file list plus the XOR of their mtimes,
    /// the fingerprint IDE drivers use to skip full preparation.
    fn write_fast_path_files(&self) -> Result<()> {
        let fast_path = match self.settings.get("build_ide_fast_path").as_str() {
            Some(p) => PathBuf::from(p),
            None => return Ok(()),
        };
        let mut listing = String::new();
        let mut existing: Vec<&Path> = Vec::new();
        for f in &self.fast_path_files {
            listing.push_str(&f.to_string_lossy());
            listing.push('\n');
            if f.exists() {
                existing.push(f);
            }
        }
        fileutil::write_file_if_different(&fast_path, &listing)?;

        let mtime = fileutil::xor_mtimes(existing)?;
        let stamp = PathBuf::from(format!("{}.t", fast_path.display()));
        std::fs::write(&stamp, mtime.to_string())?;
        Ok(())
    }

    /// Mirrors built artifacts into `build_ide_copy_to_dir`.
    fn copy_outputs(&self) -> Result<()> {
        let dir = match self.settings.get("build_ide_copy_to_dir").as_str() {
            Some(d) => PathBuf::from(d),
            None => return Ok(()),
        };
        std::fs::create_dir_all(&dir)?;
        for f in &self.fast_path_files {
            if !f.exists() {
                continue;
            }
            let dst = dir.join(f.file_name().unwrap_or_default());
            if dst == *f {
                continue;
            }
            std::fs::copy(f, &dst)
                .with_context(|| format!("copy {} -> {}", f.display(), dst.display()))?;
        }
        Ok(())
    }

    pub fn execution_plan_path(&self) -> PathBuf {
        // .swb: "sw build".
        self.build_dir.join("ep").join(format!("{}.swb", self.name()))
    }

    /// Serializes the current plan for later re-execution.
    pub fn save_execution_plan(&mut self) -> Result<()> {
        if self.state != BuildState::Prepared {
            bail!(Error::InternalInvariant(format!(
                "unexpected build state {}, expected {}",
                self.state,
                BuildState::Prepared
            )));
        }
        let path = self.execution_plan_path();
        let plan = self.get_execution_plan()?;
        plan.save(&path)
    }

    /// Loads and runs a saved plan, bypassing preparation. The state is
    /// forced to Prepared for the run and falls back to InputsLoaded
    /// afterwards.
    pub fn run_saved_execution_plan(&mut self, path: &Path) -> Result<()> {
        let (cmds, files) = ExecutionPlan::load(path)?;
        self.files = files;
        let mut plan = self.make_plan(cmds)?;
        self.configure_plan(&mut plan)?;

        self.override_state(BuildState::Prepared);
        let result = self.execute_plan(&plan);
        self.override_state(BuildState::InputsLoaded);
        result
    }

    pub(crate) fn test_dir(&self) -> PathBuf {
        self.build_dir.join("test")
    }

    /// Builds everything, then runs the registered test commands.
    pub fn test(&mut self) -> Result<()> {
        self.build()?;
        crate::test_runner::run_tests(self)
    }
}

fn make_pool(n: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(n.max(1))
        .build()
        .context("failed to build worker pool")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{Dependency, ExecTarget, Inheritance, Step, Target};
    use testutil::SafeTempDir;

    fn sh_step(name: &str, script: String, inputs: &[PathBuf], outputs: &[PathBuf]) -> Step {
        Step {
            name: name.to_owned(),
            program: PathBuf::from("sh"),
            arguments: vec!["-c".to_owned(), script],
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
        }
    }

    /// An entry point registering a library target and an executable
    /// target depending on it.
    struct DemoProject {
        out_dir: PathBuf,
        external_dep: Option<UnresolvedPackageName>,
        cyclic: bool,
        extra_passes: u32,
    }

    impl DemoProject {
        fn new(out_dir: &Path) -> Self {
            Self {
                out_dir: out_dir.to_path_buf(),
                external_dep: None,
                cyclic: false,
                extra_passes: 0,
            }
        }
    }

    impl EntryPoint for DemoProject {
        fn load_targets(
            &self,
            _ctx: &BuildContext,
            settings: &Settings,
            build_dir: &Path,
        ) -> Result<Vec<Box<dyn Target>>> {
            let lib_out = self.out_dir.join("lib.txt");
            let exe_out = self.out_dir.join("exe.txt");

            let mut lib = ExecTarget::new(
                "org.demo.lib-1.0.0".parse()?,
                settings.clone(),
                build_dir,
            );
            let lib_inputs = if self.cyclic {
                vec![exe_out.clone()]
            } else {
                vec![]
            };
            lib.add_step(sh_step(
                "gen lib",
                format!("echo lib > {}", lib_out.display()),
                &lib_inputs,
                &[lib_out.clone()],
            ));
            lib.set_output_file(&lib_out);
            lib.require_extra_passes(self.extra_passes);

            let mut exe = ExecTarget::new(
                "org.demo.exe-1.0.0".parse()?,
                settings.clone(),
                build_dir,
            );
            exe.add_dependency(Dependency::new(
                UnresolvedPackageId::new("org.demo.lib".parse()?, settings.clone()),
                Inheritance::Public,
            ));
            if let Some(u) = &self.external_dep {
                exe.add_dependency(Dependency::new(
                    UnresolvedPackageId::new(u.clone(), Settings::new()),
                    Inheritance::Private,
                ));
            }
            exe.add_step(sh_step(
                "link exe",
                format!(
                    "cat {} > {} && echo exe >> {}",
                    lib_out.display(),
                    exe_out.display(),
                    exe_out.display()
                ),
                &[lib_out],
                &[exe_out.clone()],
            ));
            exe.set_output_file(&exe_out);
            exe.add_test_step(sh_step("exe smoke", "true".to_owned(), &[], &[]));

            Ok(vec![Box::new(lib), Box::new(exe)])
        }
    }

    struct Fixture {
        dir: SafeTempDir,
        ctx: Arc<BuildContext>,
    }

    fn fixture() -> Result<Fixture> {
        let dir = SafeTempDir::new()?;
        let ctx = Arc::new(BuildContext::new(&dir.path().join("storage"))?);
        Ok(Fixture { dir, ctx })
    }

    fn demo_build(f: &Fixture, project: DemoProject) -> Build {
        let mut b = Build::new(f.ctx.clone(), &f.dir.path().join("build"));
        let mut s = Settings::new();
        s.set("os", "linux");
        b.add_input(InputWithSettings {
            entry_point: Arc::new(project),
            settings: s,
        });
        b
    }

    #[test]
    fn full_pipeline_builds_in_dependency_order() -> Result<()> {
        let f = fixture()?;
        let out_dir = f.dir.path().join("out");
        std::fs::create_dir_all(&out_dir)?;
        let mut b = demo_build(&f, DemoProject::new(&out_dir));

        assert_eq!(b.state(), BuildState::NotStarted);
        b.build()?;
        assert_eq!(b.state(), BuildState::Executed);
        assert!(!b.step()?);

        let exe = std::fs::read_to_string(out_dir.join("exe.txt"))?;
        assert_eq!(exe, "lib\nexe\n");
        Ok(())
    }

    #[test]
    fn out_of_order_transitions_are_rejected() -> Result<()> {
        let f = fixture()?;
        let out_dir = f.dir.path().join("out");
        let mut b = demo_build(&f, DemoProject::new(&out_dir));

        let err = b.prepare().unwrap_err();
        assert!(matches!(
            crate::error::error_kind(&err),
            Some(Error::InternalInvariant(_))
        ));
        // The failed transition left the state unchanged.
        assert_eq!(b.state(), BuildState::NotStarted);
        Ok(())
    }

    #[test]
    fn stop_interrupts_the_next_transition() -> Result<()> {
        let f = fixture()?;
        let out_dir = f.dir.path().join("out");
        let mut b = demo_build(&f, DemoProject::new(&out_dir));
        b.stop();
        let err = b.step().unwrap_err();
        assert!(matches!(
            crate::error::error_kind(&err),
            Some(Error::Interrupted)
        ));
        Ok(())
    }

    #[test]
    fn prepare_reaches_a_fixed_point_with_extra_passes() -> Result<()> {
        let f = fixture()?;
        let out_dir = f.dir.path().join("out");
        std::fs::create_dir_all(&out_dir)?;
        let mut project = DemoProject::new(&out_dir);
        project.extra_passes = 3;
        let mut b = demo_build(&f, project);
        b.build()?;
        assert_eq!(b.state(), BuildState::Executed);
        Ok(())
    }

    #[test]
    fn cyclic_commands_fail_with_dumped_subgraphs() -> Result<()> {
        let f = fixture()?;
        let out_dir = f.dir.path().join("out");
        std::fs::create_dir_all(&out_dir)?;
        let mut project = DemoProject::new(&out_dir);
        project.cyclic = true;
        let mut b = demo_build(&f, project);

        let err = b.build().unwrap_err();
        assert!(matches!(
            crate::error::error_kind(&err),
            Some(Error::CyclicDependencies { .. })
        ));
        let cyclic = b.build_dir().join("misc").join("cyclic");
        assert!(cyclic.join("cycle_0").exists());
        assert!(cyclic.join("processed").exists());
        assert!(cyclic.join("unprocessed").exists());
        Ok(())
    }

    #[test]
    fn external_dependency_is_resolved_and_locked() -> Result<()> {
        let f = fixture()?;

        // The external package is served by the local storage as an
        // overridden source dir.
        let dep_src = f.dir.path().join("dep-src");
        std::fs::create_dir_all(&dep_src)?;
        f.ctx
            .local_storage()
            .install_overridden(&"org.external.dep-0.0.1".parse()?, &dep_src)?;

        let out_dir = f.dir.path().join("out");
        std::fs::create_dir_all(&out_dir)?;
        let lock_path = f.dir.path().join("anvil.lock");

        let mut project = DemoProject::new(&out_dir);
        project.external_dep = Some("org.external.dep".parse()?);
        let mut b = demo_build(&f, project);
        let mut s = Settings::new();
        s.set("lock_file", lock_path.to_string_lossy().as_ref());
        b.set_settings(s.clone())?;
        b.build()?;

        let pins = crate::lockfile::load(&lock_path)?;
        assert_eq!(
            pins.get(&"org.external.dep-*".parse()?).map(|p| p.to_string()),
            Some("org.external.dep-0.0.1".to_owned())
        );

        // A second build consumes the lock file and resolves from it.
        let mut project = DemoProject::new(&out_dir);
        project.external_dep = Some("org.external.dep".parse()?);
        let mut b2 = demo_build(&f, project);
        b2.set_settings(s)?;
        b2.build()?;
        assert_eq!(b2.state(), BuildState::Executed);
        Ok(())
    }

    #[test]
    fn saved_plan_round_trip_executes_without_preparation() -> Result<()> {
        let f = fixture()?;
        let out_dir = f.dir.path().join("out");
        std::fs::create_dir_all(&out_dir)?;
        let mut b = demo_build(&f, DemoProject::new(&out_dir));

        b.load_inputs()?;
        b.set_targets_to_build()?;
        b.resolve_packages()?;
        b.load_packages()?;
        b.prepare()?;
        b.save_execution_plan()?;
        let plan_path = b.execution_plan_path();
        assert!(plan_path.exists());

        // A fresh build executes the serialized plan directly.
        let mut b2 = Build::new(f.ctx.clone(), &f.dir.path().join("build2"));
        b2.run_saved_execution_plan(&plan_path)?;
        assert_eq!(b2.state(), BuildState::InputsLoaded);
        assert_eq!(
            std::fs::read_to_string(out_dir.join("exe.txt"))?,
            "lib\nexe\n"
        );
        Ok(())
    }

    #[test]
    fn target_filter_restricts_and_validates() -> Result<()> {
        let f = fixture()?;
        let out_dir = f.dir.path().join("out");
        std::fs::create_dir_all(&out_dir)?;
        let mut b = demo_build(&f, DemoProject::new(&out_dir));

        let mut s = Settings::new();
        s.get_mut("target-to-build").push("org.demo.nosuch")?;
        b.set_settings(s)?;
        let err = b.build().unwrap_err();
        assert!(err.to_string().contains("no such targets"));
        Ok(())
    }

    #[test]
    fn fast_path_file_records_outputs_and_mtime_xor() -> Result<()> {
        let f = fixture()?;
        let out_dir = f.dir.path().join("out");
        std::fs::create_dir_all(&out_dir)?;
        let mut b = demo_build(&f, DemoProject::new(&out_dir));

        let fast_path = f.dir.path().join("fast.txt");
        let mut s = Settings::new();
        s.set("build_ide_fast_path", fast_path.to_string_lossy().as_ref());
        s.set("time_trace", "true");
        b.set_settings(s)?;
        b.build()?;

        let listing = std::fs::read_to_string(&fast_path)?;
        assert!(listing.contains("lib.txt"));
        assert!(listing.contains("exe.txt"));

        let stamp = std::fs::read_to_string(format!("{}.t", fast_path.display()))?;
        let expected = fileutil::xor_mtimes([
            out_dir.join("lib.txt").as_path(),
            out_dir.join("exe.txt").as_path(),
        ])?;
        assert_eq!(stamp, expected.to_string());

        assert!(b.build_dir().join("misc").join("time_trace.json").exists());
        Ok(())
    }

    #[test]
    fn test_runner_writes_junit_results() -> Result<()> {
        let f = fixture()?;
        let out_dir = f.dir.path().join("out");
        std::fs::create_dir_all(&out_dir)?;
        let mut b = demo_build(&f, DemoProject::new(&out_dir));

        b.test()?;
        let results = b.build_dir().join("test").join("results.xml");
        let xml = std::fs::read_to_string(&results)?;
        assert!(xml.contains("<testsuites"));
        assert!(xml.contains("org.demo.exe-1.0.0"));
        assert!(xml.contains("exe smoke"));
        Ok(())
    }
}
