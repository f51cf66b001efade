//! The backtracking solver.
//!
//! The solver walks the requirement queue depth-first: it picks the first
//! unsatisfied requirement, tries every viable candidate for it in pool
//! order, and recurses with the candidate's dependencies appended. State is
//! snapshotted per tried candidate, so abandoning a branch is a cheap drop.
//! The work budget bounds pathological backtracking; realistic tasks stay
//! far below it.

use std::{
    collections::{HashMap, VecDeque},
    str::FromStr,
};

use krait_types::{GenericVirtualPackage, MatchSpec, RepoDataRecord};

use crate::{
    pool::{CandidateId, Pool},
    sort_topologically, SolveError, SolverTask,
};

const BACKTRACK_BUDGET: usize = 100_000;

#[derive(Debug, Clone)]
struct Requirement {
    spec: MatchSpec,
    required_by: Option<String>,
}

impl Requirement {
    fn describe(&self) -> String {
        match &self.required_by {
            Some(parent) => format!("{} (required by {})", self.spec, parent),
            None => self.spec.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct State {
    /// Chosen candidate per package name.
    assignment: HashMap<String, CandidateId>,

    /// Constraints accumulated per name from dependencies, `constrains`
    /// fields and pins.
    constraints: HashMap<String, Vec<MatchSpec>>,

    /// The requirements that still need to be satisfied.
    queue: VecDeque<Requirement>,
}

struct Solver<'t> {
    pool: Pool<'t>,
    allow_downgrade: bool,
    budget: usize,
    conflicts: Vec<String>,
}

/// Solves the given task, returning the records the prefix should contain in
/// topological installation order.
pub fn solve(task: &SolverTask) -> Result<Vec<RepoDataRecord>, SolveError> {
    let pool = Pool::from_task(task);

    let mut state = State::default();

    // Pins and pinned records are hard constraints that exist before any
    // requirement is processed.
    for pin in &task.pins {
        let Some(name) = pin.name.as_ref() else {
            return Err(SolveError::SpecWithoutName(pin.to_string()));
        };
        state
            .constraints
            .entry(name.as_normalized().to_owned())
            .or_default()
            .push(pin.clone());
    }
    for pinned in &task.pinned_packages {
        let record = &pinned.package_record;
        let spec = MatchSpec::from_str(&format!(
            "{}={}={}",
            record.name.as_normalized(),
            record.version,
            record.build
        ))
        .expect("a record identity is a valid spec");
        state
            .constraints
            .entry(record.name.as_normalized().to_owned())
            .or_default()
            .push(spec);
    }

    for spec in &task.specs {
        if spec.name.is_none() {
            return Err(SolveError::SpecWithoutName(spec.to_string()));
        }
        state.queue.push_back(Requirement {
            spec: spec.clone(),
            required_by: None,
        });
    }

    let mut solver = Solver {
        pool,
        allow_downgrade: task.allow_downgrade,
        budget: BACKTRACK_BUDGET,
        conflicts: Vec::new(),
    };

    if solver.resolve(&mut state)? {
        let records: Vec<RepoDataRecord> = state
            .assignment
            .values()
            .map(|&id| solver.pool.records[id].clone())
            .collect();
        Ok(sort_topologically(records))
    } else {
        solver.conflicts.dedup();
        Err(SolveError::Unsolvable(solver.conflicts))
    }
}

impl<'t> Solver<'t> {
    fn resolve(&mut self, state: &mut State) -> Result<bool, SolveError> {
        loop {
            if self.budget == 0 {
                return Err(SolveError::BudgetExceeded);
            }
            self.budget -= 1;

            let Some(requirement) = state.queue.pop_front() else {
                return Ok(true);
            };

            let name = requirement
                .spec
                .name
                .as_ref()
                .expect("requirements always carry a name")
                .as_normalized()
                .to_owned();

            // Virtual packages are matched against the host description and
            // never enter the assignment.
            if name.starts_with("__") {
                if self.check_virtual(&name, &requirement) {
                    continue;
                }
                return Ok(false);
            }

            // An already assigned name only needs re-checking.
            if let Some(&assigned) = state.assignment.get(&name) {
                let record = self.pool.records[assigned];
                if requirement.spec.matches(&record.package_record)
                    && requirement.spec.matches_channel(&record.channel)
                {
                    continue;
                }
                self.conflicts.push(format!(
                    "{} conflicts with the already selected {}",
                    requirement.describe(),
                    record.package_record
                ));
                return Ok(false);
            }

            return self.try_candidates(state, &name, requirement);
        }
    }

    fn try_candidates(
        &mut self,
        state: &mut State,
        name: &str,
        requirement: Requirement,
    ) -> Result<bool, SolveError> {
        let viable: Vec<CandidateId> = self
            .pool
            .candidates(name)
            .iter()
            .copied()
            .filter(|&id| self.is_viable(state, name, &requirement.spec, id))
            .collect();

        if viable.is_empty() {
            self.conflicts
                .push(format!("nothing provides {}", requirement.describe()));
            return Ok(false);
        }

        for candidate in viable {
            let mut branch = state.clone();
            if !self.assign(&mut branch, name, candidate) {
                continue;
            }
            if self.resolve(&mut branch)? {
                tracing::trace!(
                    "selected {}",
                    self.pool.records[candidate].package_record
                );
                *state = branch;
                return Ok(true);
            }
        }

        self.conflicts.push(format!(
            "no candidate of {} leads to a consistent set",
            requirement.describe()
        ));
        Ok(false)
    }

    fn is_viable(&self, state: &State, name: &str, spec: &MatchSpec, id: CandidateId) -> bool {
        let record = self.pool.records[id];
        if !spec.matches(&record.package_record) || !spec.matches_channel(&record.channel) {
            return false;
        }
        if let Some(constraints) = state.constraints.get(name) {
            if !constraints.iter().all(|c| {
                c.matches(&record.package_record) && c.matches_channel(&record.channel)
            }) {
                return false;
            }
        }
        // Without allow-downgrade an installed package bounds its own
        // candidates from below.
        if !self.allow_downgrade {
            if let Some(locked) = self.pool.locked(name) {
                let locked_version = &self.pool.records[locked].package_record.version;
                if record.package_record.version < *locked_version {
                    return false;
                }
            }
        }
        true
    }

    fn check_virtual(&mut self, name: &str, requirement: &Requirement) -> bool {
        match self.pool.virtual_by_name.get(name) {
            None => {
                self.conflicts.push(format!(
                    "{} is not provided by this system",
                    requirement.describe()
                ));
                false
            }
            Some(package) => {
                if virtual_matches(&requirement.spec, package) {
                    true
                } else {
                    self.conflicts.push(format!(
                        "{} is not satisfied by the system ({})",
                        requirement.describe(),
                        package
                    ));
                    false
                }
            }
        }
    }

    /// Records the assignment and enqueues the candidate's dependencies.
    /// Returns false when the candidate immediately contradicts the branch.
    fn assign(&mut self, state: &mut State, name: &str, candidate: CandidateId) -> bool {
        let record = self.pool.records[candidate];
        state.assignment.insert(name.to_owned(), candidate);

        for depends in &record.package_record.depends {
            let Ok(spec) = MatchSpec::from_str(depends) else {
                self.conflicts.push(format!(
                    "failed to parse dependency '{}' of {}",
                    depends, record.package_record
                ));
                return false;
            };
            state.queue.push_back(Requirement {
                spec,
                required_by: Some(record.package_record.to_string()),
            });
        }

        for constrains in &record.package_record.constrains {
            let Ok(spec) = MatchSpec::from_str(constrains) else {
                // Constraints that do not parse are ignored, matching the
                // lenient treatment of run_constrained elsewhere.
                continue;
            };
            let Some(constrained_name) = spec.name.as_ref() else {
                continue;
            };
            let constrained_name = constrained_name.as_normalized().to_owned();

            // A constraint restricts a package only if it is (or becomes)
            // part of the solution.
            if let Some(&assigned) = state.assignment.get(&constrained_name) {
                let assigned_record = self.pool.records[assigned];
                if !spec.matches(&assigned_record.package_record) {
                    self.conflicts.push(format!(
                        "{} constrains {} but {} is selected",
                        record.package_record, spec, assigned_record.package_record
                    ));
                    return false;
                }
            }
            if constrained_name.starts_with("__") {
                if let Some(virtual_package) =
                    self.pool.virtual_by_name.get(constrained_name.as_str())
                {
                    if !virtual_matches(&spec, virtual_package) {
                        self.conflicts.push(format!(
                            "{} constrains {} but the system provides {}",
                            record.package_record, spec, virtual_package
                        ));
                        return false;
                    }
                }
                continue;
            }
            state
                .constraints
                .entry(constrained_name)
                .or_default()
                .push(spec);
        }

        true
    }
}

/// Matches a spec against a virtual package: only the version and build
/// predicates apply.
fn virtual_matches(spec: &MatchSpec, package: &GenericVirtualPackage) -> bool {
    if let Some(version_spec) = &spec.version {
        if !version_spec.matches(&package.version) {
            return false;
        }
    }
    if let Some(build) = &spec.build {
        if !build.matches(&package.build_string) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use krait_types::{PackageName, PackageRecord, Version};
    use url::Url;

    use super::*;
    use crate::ChannelPriority;

    fn record(
        name: &str,
        version: &str,
        depends: &[&str],
        channel: &str,
    ) -> RepoDataRecord {
        let mut package_record = PackageRecord::for_test(name, version, "0", 0);
        package_record.depends = depends.iter().map(|s| (*s).to_owned()).collect();
        let file_name = format!("{name}-{version}-0.conda");
        RepoDataRecord {
            package_record,
            url: Url::parse(&format!(
                "https://example.com/{channel}/linux-64/{file_name}"
            ))
            .unwrap(),
            file_name,
            channel: channel.to_owned(),
        }
    }

    fn spec(s: &str) -> MatchSpec {
        MatchSpec::from_str(s).unwrap()
    }

    fn solved_names(records: &[RepoDataRecord]) -> Vec<String> {
        records
            .iter()
            .map(|r| {
                format!(
                    "{}-{}",
                    r.package_record.name.as_normalized(),
                    r.package_record.version
                )
            })
            .collect()
    }

    #[test]
    fn test_simple_solve_with_dependencies() {
        let task = SolverTask {
            available_packages: vec![
                record("app", "1.0", &["lib >=2"], "main"),
                record("lib", "2.5", &[], "main"),
                record("lib", "1.0", &[], "main"),
            ],
            specs: vec![spec("app")],
            ..SolverTask::default()
        };
        let result = solve(&task).unwrap();
        let names = solved_names(&result);
        assert_eq!(names, vec!["lib-2.5", "app-1.0"]);
    }

    #[test]
    fn test_highest_version_is_preferred() {
        let task = SolverTask {
            available_packages: vec![
                record("foo", "1.0", &[], "main"),
                record("foo", "3.0", &[], "main"),
                record("foo", "2.0", &[], "main"),
            ],
            specs: vec![spec("foo")],
            ..SolverTask::default()
        };
        let result = solve(&task).unwrap();
        assert_eq!(solved_names(&result), vec!["foo-3.0"]);
    }

    #[test]
    fn test_backtracks_to_older_version() {
        // The newest lib conflicts with what app needs via a shared
        // dependency; the solver must fall back to the older lib.
        let task = SolverTask {
            available_packages: vec![
                record("app", "1.0", &["lib", "base ==1"], "main"),
                record("lib", "2.0", &["base ==2"], "main"),
                record("lib", "1.0", &["base ==1"], "main"),
                record("base", "1", &[], "main"),
                record("base", "2", &[], "main"),
            ],
            specs: vec![spec("app")],
            ..SolverTask::default()
        };
        let result = solve(&task).unwrap();
        let names = solved_names(&result);
        assert!(names.contains(&"lib-1.0".to_owned()), "{names:?}");
        assert!(names.contains(&"base-1".to_owned()), "{names:?}");
    }

    #[test]
    fn test_strict_priority_makes_unsolvable() {
        // Channel `a` (higher priority) provides foo-1.0, channel `b`
        // provides foo-2.0. Under strict priority `foo>=2` cannot be
        // satisfied; under flexible it picks foo-2.0 from `b`.
        let records = vec![
            record("foo", "1.0", &[], "a"),
            record("foo", "2.0", &[], "b"),
        ];
        let strict = SolverTask {
            available_packages: records.clone(),
            channel_order: vec!["a".to_owned(), "b".to_owned()],
            channel_priority: ChannelPriority::Strict,
            specs: vec![spec("foo >=2")],
            ..SolverTask::default()
        };
        assert_matches!(solve(&strict), Err(SolveError::Unsolvable(_)));

        let flexible = SolverTask {
            available_packages: records,
            channel_order: vec!["a".to_owned(), "b".to_owned()],
            channel_priority: ChannelPriority::Flexible,
            specs: vec![spec("foo >=2")],
            ..SolverTask::default()
        };
        let result = solve(&flexible).unwrap();
        assert_eq!(result[0].channel, "b");
    }

    #[test]
    fn test_unsolvable_has_explanation() {
        let task = SolverTask {
            available_packages: vec![record("app", "1.0", &["missing >=1"], "main")],
            specs: vec![spec("app")],
            ..SolverTask::default()
        };
        let error = solve(&task).unwrap_err();
        let SolveError::Unsolvable(messages) = error else {
            panic!("expected Unsolvable, got {error}");
        };
        assert!(
            messages
                .iter()
                .any(|m| m.contains("missing") && m.contains("app")),
            "{messages:?}"
        );
    }

    #[test]
    fn test_pins_are_hard_constraints() {
        let task = SolverTask {
            available_packages: vec![
                record("foo", "1.0", &[], "main"),
                record("foo", "2.0", &[], "main"),
            ],
            pins: vec![spec("foo <2")],
            specs: vec![spec("foo")],
            ..SolverTask::default()
        };
        let result = solve(&task).unwrap();
        assert_eq!(solved_names(&result), vec!["foo-1.0"]);

        let impossible = SolverTask {
            available_packages: vec![record("foo", "2.0", &[], "main")],
            pins: vec![spec("foo <2")],
            specs: vec![spec("foo >=2")],
            ..SolverTask::default()
        };
        assert_matches!(solve(&impossible), Err(SolveError::Unsolvable(_)));
    }

    #[test]
    fn test_locked_version_is_kept() {
        let installed = record("foo", "1.5", &[], "main");
        let task = SolverTask {
            available_packages: vec![
                record("foo", "1.0", &[], "main"),
                record("foo", "1.5", &[], "main"),
                record("foo", "2.0", &[], "main"),
            ],
            locked_packages: vec![installed],
            specs: vec![spec("foo")],
            ..SolverTask::default()
        };
        // The installed 1.5 still satisfies `foo`, so no upgrade happens.
        let result = solve(&task).unwrap();
        assert_eq!(solved_names(&result), vec!["foo-1.5"]);

        // An explicit constraint forces the upgrade.
        let task = SolverTask {
            available_packages: vec![
                record("foo", "1.5", &[], "main"),
                record("foo", "2.0", &[], "main"),
            ],
            locked_packages: vec![record("foo", "1.5", &[], "main")],
            specs: vec![spec("foo >=2")],
            ..SolverTask::default()
        };
        let result = solve(&task).unwrap();
        assert_eq!(solved_names(&result), vec!["foo-2.0"]);
    }

    #[test]
    fn test_downgrade_requires_flag() {
        let available = vec![
            record("foo", "1.0", &[], "main"),
            record("foo", "2.0", &[], "main"),
        ];
        let task = SolverTask {
            available_packages: available.clone(),
            locked_packages: vec![record("foo", "2.0", &[], "main")],
            specs: vec![spec("foo <2")],
            allow_downgrade: false,
            ..SolverTask::default()
        };
        assert_matches!(solve(&task), Err(SolveError::Unsolvable(_)));

        let task = SolverTask {
            available_packages: available,
            locked_packages: vec![record("foo", "2.0", &[], "main")],
            specs: vec![spec("foo <2")],
            allow_downgrade: true,
            ..SolverTask::default()
        };
        let result = solve(&task).unwrap();
        assert_eq!(solved_names(&result), vec!["foo-1.0"]);
    }

    #[test]
    fn test_virtual_package_requirements() {
        let glibc = GenericVirtualPackage {
            name: PackageName::new_unchecked("__glibc"),
            version: Version::from_str("2.35").unwrap(),
            build_string: "0".to_owned(),
        };
        let task = SolverTask {
            available_packages: vec![record("native", "1.0", &["__glibc >=2.17"], "main")],
            virtual_packages: vec![glibc.clone()],
            specs: vec![spec("native")],
            ..SolverTask::default()
        };
        let result = solve(&task).unwrap();
        // The virtual package satisfies the dependency but is not part of
        // the solution.
        assert_eq!(solved_names(&result), vec!["native-1.0"]);

        let task = SolverTask {
            available_packages: vec![record("native", "1.0", &["__glibc >=2.99"], "main")],
            virtual_packages: vec![glibc],
            specs: vec![spec("native")],
            ..SolverTask::default()
        };
        assert_matches!(solve(&task), Err(SolveError::Unsolvable(_)));
    }

    #[test]
    fn test_constrains_restrict_selected_packages() {
        // `tool` constrains lib <2 without depending on it; installing both
        // must pick the older lib.
        let task = SolverTask {
            available_packages: vec![
                record("tool", "1.0", &[], "main"),
                record("lib", "1.0", &[], "main"),
                record("lib", "2.0", &[], "main"),
            ],
            specs: vec![spec("tool"), spec("lib")],
            ..SolverTask::default()
        };
        let mut with_constraint = task;
        with_constraint.available_packages[0]
            .package_record
            .constrains = vec!["lib <2".to_owned()];
        let result = solve(&with_constraint).unwrap();
        let names = solved_names(&result);
        assert!(names.contains(&"lib-1.0".to_owned()), "{names:?}");
    }

    #[test]
    fn test_empty_specs_solve_to_nothing() {
        let task = SolverTask {
            available_packages: vec![record("foo", "1.0", &[], "main")],
            ..SolverTask::default()
        };
        assert!(solve(&task).unwrap().is_empty());
    }
}
