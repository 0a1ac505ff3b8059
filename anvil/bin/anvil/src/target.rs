// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Targets: the units a build prepares and collects commands from.
//!
//! Targets are owned by the build. Dependencies between them are carried
//! as [`DependencyPtr`] records that resolve lazily to a package id once
//! the dependency's target is known, so the target graph stays free of
//! object cycles.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use anyhow::Result;
use pkgid::{max_satisfying_version, PackageName, PackageVersion, UnresolvedPackageName};
use settings::Settings;

use crate::command::{Command, FileTable};
use crate::package::{PackageId, UnresolvedPackageId};

/// How a dependency's interface propagates through the depending target.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum_macros::Display, strum_macros::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Inheritance {
    /// Consumed by the target only; not republished.
    Private,
    /// Consumed by the target and its own package subtree; not republished
    /// to outside dependents.
    Protected,
    /// Consumed and republished to dependents.
    Public,
    /// Republished to dependents without being consumed.
    Interface,
}

impl Inheritance {
    /// Whether the dependency's interface reaches the target itself.
    pub fn consumed(self) -> bool {
        !matches!(self, Inheritance::Interface)
    }

    /// Whether the dependency is republished in the target's interface.
    pub fn republished(self) -> bool {
        matches!(self, Inheritance::Public | Inheritance::Interface)
    }
}

/// A lazily resolved dependency edge between targets.
#[derive(Debug)]
pub struct Dependency {
    upkg: UnresolvedPackageId,
    inheritance: Inheritance,
    resolved: OnceLock<PackageId>,
}

pub type DependencyPtr = Arc<Dependency>;

impl Dependency {
    pub fn new(upkg: UnresolvedPackageId, inheritance: Inheritance) -> DependencyPtr {
        Arc::new(Self {
            upkg,
            inheritance,
            resolved: OnceLock::new(),
        })
    }

    pub fn unresolved(&self) -> &UnresolvedPackageId {
        &self.upkg
    }

    pub fn inheritance(&self) -> Inheritance {
        self.inheritance
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.get().is_some()
    }

    pub fn resolved(&self) -> Option<&PackageId> {
        self.resolved.get()
    }

    /// Records the target this dependency resolved to. Later calls keep
    /// the first resolution.
    pub fn set_resolved(&self, id: PackageId) {
        let _ = self.resolved.set(id);
    }
}

/// Result of one prepare pass over a target.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PrepareOutcome {
    Done,
    NeedAnotherPass,
    /// Progress requires dependencies that are not loaded yet.
    WaitingOnDeps,
}

/// Context handed to every prepare pass.
///
/// `interfaces` is a snapshot of every target's published interface
/// settings taken before the pass, so passes can read dependency
/// interfaces while targets are prepared in parallel.
pub struct PrepareContext<'a> {
    pub build_dir: &'a Path,
    pub build_settings: &'a Settings,
    pub interfaces: &'a std::collections::HashMap<PackageId, Settings>,
}

/// Component options shared by concrete target kinds.
#[derive(Clone, Debug, Default)]
pub struct TargetOptions {
    pub sources: Vec<PathBuf>,
    pub include_dirs: Vec<PathBuf>,
    pub link_libraries: Vec<String>,
    pub dependencies: Vec<DependencyPtr>,
}

/// The target interface the build drives.
///
/// Lifecycle: construction by an entry point, multiple `prepare` passes
/// until a fixed point, then `commands` on demand.
pub trait Target: Send {
    fn package(&self) -> &PackageName;

    fn settings(&self) -> &Settings;

    /// Settings this target publishes to its dependents.
    fn interface_settings(&self) -> Settings {
        Settings::new()
    }

    fn dependencies(&self) -> Vec<DependencyPtr> {
        Vec::new()
    }

    fn prepare(&mut self, _ctx: &PrepareContext) -> Result<PrepareOutcome> {
        Ok(PrepareOutcome::Done)
    }

    fn commands(&mut self, _files: &FileTable) -> Result<Vec<Arc<Command>>> {
        Ok(Vec::new())
    }

    fn tests(&mut self, _files: &FileTable) -> Result<Vec<Arc<Command>>> {
        Ok(Vec::new())
    }

    /// A known-unwanted target: prepare and commands are no-ops.
    fn is_dry_run(&self) -> bool {
        false
    }

    fn id(&self) -> PackageId {
        PackageId::new(self.package().clone(), self.settings().clone())
    }
}

/// All target instances of one package name, keyed by settings.
#[derive(Default)]
pub struct TargetContainer {
    entries: Vec<Box<dyn Target>>,
}

impl TargetContainer {
    pub fn push(&mut self, t: Box<dyn Target>) {
        self.entries.push(t);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Box<dyn Target>> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Target>> {
        self.entries.iter_mut()
    }

    /// The instance whose settings equal `s`.
    pub fn find_equal(&self, s: &Settings) -> Option<&dyn Target> {
        self.entries
            .iter()
            .find(|t| t.settings() == s)
            .map(|t| t.as_ref())
    }

    /// The instance able to serve a request with settings `s`: the request
    /// must be a subset of the instance's full settings.
    pub fn find_suitable(&self, s: &Settings) -> Option<&dyn Target> {
        self.entries
            .iter()
            .find(|t| s.is_subset_of(t.settings()))
            .map(|t| t.as_ref())
    }

    pub fn find_suitable_mut(&mut self, s: &Settings) -> Option<&mut Box<dyn Target>> {
        self.entries.iter_mut().find(|t| s.is_subset_of(t.settings()))
    }
}

/// Targets of a whole build, grouped by package name.
#[derive(Default)]
pub struct TargetMap {
    map: BTreeMap<PackageName, TargetContainer>,
}

impl TargetMap {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn insert(&mut self, t: Box<dyn Target>) {
        self.map.entry(t.package().clone()).or_default().push(t);
    }

    pub fn get(&self, name: &PackageName) -> Option<&TargetContainer> {
        self.map.get(name)
    }

    pub fn get_mut(&mut self, name: &PackageName) -> Option<&mut TargetContainer> {
        self.map.get_mut(name)
    }

    pub fn contains(&self, name: &PackageName) -> bool {
        self.map.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PackageName, &TargetContainer)> {
        self.map.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&PackageName, &mut TargetContainer)> {
        self.map.iter_mut()
    }

    pub fn names(&self) -> impl Iterator<Item = &PackageName> {
        self.map.keys()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// All target entries as mutable references, for the parallel prepare
    /// loop.
    pub fn entries_mut(&mut self) -> Vec<&mut Box<dyn Target>> {
        self.map
            .values_mut()
            .flat_map(|c| c.entries.iter_mut())
            .collect()
    }

    /// The best registered name matching an unresolved request: highest
    /// satisfying version, releases preferred.
    pub fn resolve_name(&self, u: &UnresolvedPackageName) -> Option<PackageName> {
        let versions: Vec<PackageVersion> = self
            .map
            .keys()
            .filter(|name| name.path() == u.path())
            .map(|name| name.version().clone())
            .collect();
        max_satisfying_version(u.range(), versions.iter())
            .map(|v| PackageName::new(u.path().clone(), v))
    }
}

/// A target restored from a saved per-config interface settings file. It
/// carries published settings but produces no work.
pub struct PredefinedTarget {
    package: PackageName,
    settings: Settings,
    pub public_ts: Settings,
}

impl PredefinedTarget {
    pub fn new(package: PackageName, settings: Settings, public_ts: Settings) -> Self {
        Self {
            package,
            settings,
            public_ts,
        }
    }
}

impl Target for PredefinedTarget {
    fn package(&self) -> &PackageName {
        &self.package
    }

    fn settings(&self) -> &Settings {
        &self.settings
    }

    fn interface_settings(&self) -> Settings {
        self.public_ts.clone()
    }

    fn dependencies(&self) -> Vec<DependencyPtr> {
        // Dependencies republished by the saved interface settings.
        let mut out = Vec::new();
        for (name, v) in self.public_ts.get("dependencies").get("link").as_map().iter() {
            if let Ok(u) = name.parse::<UnresolvedPackageName>() {
                out.push(Dependency::new(
                    UnresolvedPackageId::new(u, v.as_map().clone()),
                    Inheritance::Private,
                ));
            }
        }
        out
    }
}

/// One command production step of an [`ExecTarget`].
#[derive(Clone, Debug)]
pub struct Step {
    pub name: String,
    pub program: PathBuf,
    pub arguments: Vec<String>,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
}

/// A programmatic target assembled by an entry point: a list of command
/// steps plus component options. This is the concrete target kind the
/// engine itself ships; language-specific targets live in driver crates.
pub struct ExecTarget {
    package: PackageName,
    settings: Settings,
    bin_dir: PathBuf,
    options: TargetOptions,
    steps: Vec<Step>,
    test_steps: Vec<Step>,
    /// Extra passes to request before reporting Done, exercising the
    /// fixed-point loop.
    extra_passes: u32,
    prepare_pass: u32,
    merged_deps: std::collections::HashSet<usize>,
    interface: Settings,
    commands: Option<Vec<Arc<Command>>>,
    dry_run: bool,
}

impl ExecTarget {
    pub fn new(package: PackageName, settings: Settings, bin_dir: &Path) -> Self {
        Self {
            package,
            settings,
            bin_dir: bin_dir.to_path_buf(),
            options: TargetOptions::default(),
            steps: Vec::new(),
            test_steps: Vec::new(),
            extra_passes: 0,
            prepare_pass: 0,
            merged_deps: std::collections::HashSet::new(),
            interface: Settings::new(),
            commands: None,
            dry_run: false,
        }
    }

    pub fn bin_dir(&self) -> &Path {
        &self.bin_dir
    }

    pub fn options_mut(&mut self) -> &mut TargetOptions {
        &mut self.options
    }

    pub fn add_dependency(&mut self, dep: DependencyPtr) {
        self.options.dependencies.push(dep);
    }

    pub fn add_step(&mut self, step: Step) {
        self.steps.push(step);
    }

    pub fn add_test_step(&mut self, step: Step) {
        self.test_steps.push(step);
    }

    pub fn require_extra_passes(&mut self, n: u32) {
        self.extra_passes = n;
    }

    pub fn set_dry_run(&mut self, b: bool) {
        self.dry_run = b;
    }

    pub fn prepare_pass(&self) -> u32 {
        self.prepare_pass
    }

    /// Publishes a value in the target's interface settings.
    pub fn publish(&mut self, key: &str, value: &str) {
        self.interface.set(key, value);
    }

    /// Declares the produced output file, recorded in interface settings
    /// for dependents and for the fast-path file.
    pub fn set_output_file(&mut self, p: &Path) {
        self.interface
            .set("output_file", p.to_string_lossy().as_ref());
    }

    /// Merges a resolved dependency's published interface into this
    /// target according to the edge's inheritance: private and protected
    /// edges are consumed only, public edges are consumed and republished,
    /// interface edges are republished without being consumed.
    fn merge_dependency_interface(&mut self, dep: &Dependency, dep_interface: &Settings) {
        if dep.inheritance().consumed() {
            let mut consumed = self.interface.get("consumed").as_map().clone();
            consumed.merge_and_assign(dep_interface);
            self.interface.set("consumed", consumed);
        }
        if dep.inheritance().republished() {
            let mut deps_map = self
                .interface
                .get("dependencies")
                .get("link")
                .as_map()
                .clone();
            deps_map.set(
                &dep.unresolved().name().to_string(),
                dep.unresolved().settings().clone(),
            );
            let mut link = Settings::new();
            link.set("link", deps_map);
            let mut existing = self.interface.get("dependencies").as_map().clone();
            existing.merge_and_assign(&link);
            self.interface.set("dependencies", existing);
        }
    }

    fn steps_to_commands(steps: &[Step], files: &FileTable, always: bool) -> Vec<Arc<Command>> {
        steps
            .iter()
            .map(|s| {
                let mut c = Command::new(&s.name, &s.program);
                for a in &s.arguments {
                    c = c.arg(a.clone());
                }
                for i in &s.inputs {
                    c = c.input(files.register(i));
                }
                for o in &s.outputs {
                    c = c.output(files.register(o));
                }
                if always {
                    c = c.always();
                }
                Arc::new(c)
            })
            .collect()
    }
}

impl Target for ExecTarget {
    fn package(&self) -> &PackageName {
        &self.package
    }

    fn settings(&self) -> &Settings {
        &self.settings
    }

    fn interface_settings(&self) -> Settings {
        self.interface.clone()
    }

    fn dependencies(&self) -> Vec<DependencyPtr> {
        self.options.dependencies.clone()
    }

    /// Passes run until every dependency is resolved, every consumed
    /// dependency interface has been merged, and the configured extra
    /// passes are exhausted.
    fn prepare(&mut self, ctx: &PrepareContext) -> Result<PrepareOutcome> {
        if self.dry_run {
            return Ok(PrepareOutcome::Done);
        }
        self.prepare_pass += 1;

        if self.options.dependencies.iter().any(|d| !d.is_resolved()) {
            return Ok(PrepareOutcome::WaitingOnDeps);
        }

        let deps = self.options.dependencies.clone();
        let mut merged_any = false;
        for (idx, dep) in deps.iter().enumerate() {
            if self.merged_deps.contains(&idx) {
                continue;
            }
            let id = dep.resolved().expect("checked above").clone();
            match ctx.interfaces.get(&id) {
                Some(ifc) => {
                    self.merge_dependency_interface(dep, ifc);
                    self.merged_deps.insert(idx);
                    merged_any = true;
                }
                // The dependency's interface was not snapshotted yet; it
                // will be there next pass.
                None => return Ok(PrepareOutcome::NeedAnotherPass),
            }
        }
        if merged_any {
            return Ok(PrepareOutcome::NeedAnotherPass);
        }

        if self.extra_passes > 0 {
            self.extra_passes -= 1;
            return Ok(PrepareOutcome::NeedAnotherPass);
        }
        Ok(PrepareOutcome::Done)
    }

    fn commands(&mut self, files: &FileTable) -> Result<Vec<Arc<Command>>> {
        if self.dry_run {
            return Ok(Vec::new());
        }
        if self.commands.is_none() {
            self.commands = Some(Self::steps_to_commands(&self.steps, files, false));
        }
        Ok(self.commands.clone().unwrap())
    }

    fn tests(&mut self, files: &FileTable) -> Result<Vec<Arc<Command>>> {
        Ok(Self::steps_to_commands(&self.test_steps, files, false))
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn name(s: &str) -> PackageName {
        s.parse().unwrap()
    }

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        let mut s = Settings::new();
        for (k, v) in pairs {
            s.set(k, *v);
        }
        s
    }

    fn exec_target(pkg: &str, s: Settings) -> ExecTarget {
        ExecTarget::new(name(pkg), s, Path::new("/tmp/bin"))
    }

    #[test]
    fn container_equal_and_subset_lookup() {
        let mut c = TargetContainer::default();
        c.push(Box::new(exec_target(
            "org.example.a-1.0.0",
            settings(&[("os", "linux"), ("arch", "x86_64")]),
        )));

        assert!(c
            .find_equal(&settings(&[("os", "linux"), ("arch", "x86_64")]))
            .is_some());
        assert!(c.find_equal(&settings(&[("os", "linux")])).is_none());

        // A request with fewer keys matches by subset.
        assert!(c.find_suitable(&settings(&[("os", "linux")])).is_some());
        assert!(c.find_suitable(&settings(&[("os", "windows")])).is_none());
        assert!(c.find_suitable(&Settings::new()).is_some());
    }

    #[test]
    fn map_resolves_ranges_over_registered_names() {
        let mut m = TargetMap::new();
        for v in ["1.2.3", "1.9.0", "2.0.0"] {
            m.insert(Box::new(exec_target(
                &format!("org.example.a-{v}"),
                Settings::new(),
            )));
        }

        let resolved = m
            .resolve_name(&"org.example.a-[1.0.0,2.0.0)".parse().unwrap())
            .unwrap();
        assert_eq!(resolved.to_string(), "org.example.a-1.9.0");
        assert!(m
            .resolve_name(&"org.example.b".parse().unwrap())
            .is_none());
    }

    #[test]
    fn dependency_resolution_is_sticky() {
        let dep = Dependency::new(
            UnresolvedPackageId::new("org.example.a".parse().unwrap(), Settings::new()),
            Inheritance::Public,
        );
        assert!(!dep.is_resolved());

        let first = PackageId::new(name("org.example.a-1.0.0"), Settings::new());
        let second = PackageId::new(name("org.example.a-2.0.0"), Settings::new());
        dep.set_resolved(first.clone());
        dep.set_resolved(second);
        assert_eq!(dep.resolved(), Some(&first));
    }

    #[test]
    fn prepare_waits_then_merges_then_finishes() -> Result<()> {
        let dep_id = PackageId::new(name("org.example.dep-1.0.0"), Settings::new());
        let dep = Dependency::new(
            UnresolvedPackageId::new("org.example.dep".parse().unwrap(), Settings::new()),
            Inheritance::Public,
        );

        let mut t = exec_target("org.example.top-1.0.0", Settings::new());
        t.add_dependency(dep.clone());

        let build_settings = Settings::new();
        let empty = HashMap::new();
        let ctx = PrepareContext {
            build_dir: Path::new("/tmp/build"),
            build_settings: &build_settings,
            interfaces: &empty,
        };
        assert_eq!(t.prepare(&ctx)?, PrepareOutcome::WaitingOnDeps);

        dep.set_resolved(dep_id.clone());
        let mut interfaces = HashMap::new();
        let mut dep_ifc = Settings::new();
        dep_ifc.set("output_file", "/store/libdep.a");
        interfaces.insert(dep_id, dep_ifc);
        let ctx = PrepareContext {
            build_dir: Path::new("/tmp/build"),
            build_settings: &build_settings,
            interfaces: &interfaces,
        };

        // One pass to merge, one more to reach the fixed point.
        assert_eq!(t.prepare(&ctx)?, PrepareOutcome::NeedAnotherPass);
        assert_eq!(t.prepare(&ctx)?, PrepareOutcome::Done);
        assert_eq!(t.prepare_pass(), 3);

        let ifc = t.interface_settings();
        // Public edges are consumed and republished.
        assert_eq!(ifc.get("consumed").get("output_file"), "/store/libdep.a");
        assert!(!ifc
            .get("dependencies")
            .get("link")
            .get("org.example.dep-*")
            .is_empty());
        Ok(())
    }

    #[test]
    fn interface_inheritance_is_not_consumed() -> Result<()> {
        let dep_id = PackageId::new(name("org.example.dep-1.0.0"), Settings::new());
        let dep = Dependency::new(
            UnresolvedPackageId::new("org.example.dep".parse().unwrap(), Settings::new()),
            Inheritance::Interface,
        );
        dep.set_resolved(dep_id.clone());

        let mut t = exec_target("org.example.top-1.0.0", Settings::new());
        t.add_dependency(dep);

        let build_settings = Settings::new();
        let mut interfaces = HashMap::new();
        interfaces.insert(dep_id, settings(&[("output_file", "/store/libdep.a")]));
        let ctx = PrepareContext {
            build_dir: Path::new("/tmp/build"),
            build_settings: &build_settings,
            interfaces: &interfaces,
        };
        while t.prepare(&ctx)? != PrepareOutcome::Done {}

        let ifc = t.interface_settings();
        assert!(ifc.get("consumed").is_empty());
        assert!(!ifc.get("dependencies").get("link").is_empty());
        Ok(())
    }

    #[test]
    fn private_inheritance_is_not_republished() -> Result<()> {
        let dep_id = PackageId::new(name("org.example.dep-1.0.0"), Settings::new());
        let dep = Dependency::new(
            UnresolvedPackageId::new("org.example.dep".parse().unwrap(), Settings::new()),
            Inheritance::Private,
        );
        dep.set_resolved(dep_id.clone());

        let mut t = exec_target("org.example.top-1.0.0", Settings::new());
        t.add_dependency(dep);

        let build_settings = Settings::new();
        let mut interfaces = HashMap::new();
        interfaces.insert(dep_id, settings(&[("output_file", "/store/libdep.a")]));
        let ctx = PrepareContext {
            build_dir: Path::new("/tmp/build"),
            build_settings: &build_settings,
            interfaces: &interfaces,
        };
        while t.prepare(&ctx)? != PrepareOutcome::Done {}

        let ifc = t.interface_settings();
        assert!(!ifc.get("consumed").is_empty());
        assert!(ifc.get("dependencies").is_empty());
        Ok(())
    }

    #[test]
    fn dry_run_targets_do_nothing() -> Result<()> {
        let mut t = exec_target("org.example.a-1.0.0", Settings::new());
        t.add_step(Step {
            name: "never".into(),
            program: PathBuf::from("true"),
            arguments: vec![],
            inputs: vec![],
            outputs: vec![],
        });
        t.set_dry_run(true);

        let build_settings = Settings::new();
        let empty = HashMap::new();
        let ctx = PrepareContext {
            build_dir: Path::new("/tmp/build"),
            build_settings: &build_settings,
            interfaces: &empty,
        };
        assert_eq!(t.prepare(&ctx)?, PrepareOutcome::Done);
        assert!(t.commands(&FileTable::new())?.is_empty());
        Ok(())
    }
}
