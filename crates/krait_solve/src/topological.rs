//! Topological ordering of records by their dependencies.

use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;

use krait_types::{MatchSpec, RepoDataRecord};

/// Sorts records so that every record comes after its dependencies. Cycles
/// (python and pip genuinely depend on each other) are broken arbitrarily but
/// deterministically.
pub fn sort_topologically(records: Vec<RepoDataRecord>) -> Vec<RepoDataRecord> {
    let mut records = records;
    records.sort_by(|a, b| a.package_record.name.cmp(&b.package_record.name));

    let index_by_name: HashMap<String, usize> = records
        .iter()
        .enumerate()
        .map(|(idx, record)| {
            (
                record.package_record.name.as_normalized().to_owned(),
                idx,
            )
        })
        .collect();

    // Dependency edges within the set.
    let mut dependencies: Vec<Vec<usize>> = vec![Vec::new(); records.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); records.len()];
    for (idx, record) in records.iter().enumerate() {
        for depends in &record.package_record.depends {
            let Some(name) = MatchSpec::from_str(depends)
                .ok()
                .and_then(|spec| spec.name)
            else {
                continue;
            };
            if let Some(&dep_idx) = index_by_name.get(name.as_normalized()) {
                if dep_idx != idx {
                    dependencies[idx].push(dep_idx);
                    dependents[dep_idx].push(idx);
                }
            }
        }
    }

    // Kahn's algorithm; on a cycle the remaining node with the smallest
    // index (= alphabetically first name) is forced out next.
    let mut remaining_deps: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut ready: VecDeque<usize> = (0..records.len())
        .filter(|&idx| remaining_deps[idx] == 0)
        .collect();
    let mut emitted: Vec<usize> = Vec::with_capacity(records.len());
    let mut seen: HashSet<usize> = ready.iter().copied().collect();

    while emitted.len() < records.len() {
        match ready.pop_front() {
            Some(idx) => {
                emitted.push(idx);
                for &dependent in &dependents[idx] {
                    remaining_deps[dependent] = remaining_deps[dependent].saturating_sub(1);
                    if remaining_deps[dependent] == 0 && seen.insert(dependent) {
                        ready.push_back(dependent);
                    }
                }
            }
            None => {
                // Cycle: force the first unemitted node.
                let forced = (0..records.len())
                    .find(|idx| !seen.contains(idx))
                    .expect("there must be an unemitted node in a cycle");
                seen.insert(forced);
                ready.push_back(forced);
            }
        }
    }

    let mut order: Vec<usize> = vec![0; records.len()];
    for (position, &idx) in emitted.iter().enumerate() {
        order[idx] = position;
    }

    let mut indexed: Vec<(usize, RepoDataRecord)> = records.into_iter().enumerate().collect();
    indexed.sort_by_key(|(idx, _)| order[*idx]);
    indexed.into_iter().map(|(_, record)| record).collect()
}

#[cfg(test)]
mod test {
    use krait_types::PackageRecord;
    use url::Url;

    use super::*;

    fn record(name: &str, depends: &[&str]) -> RepoDataRecord {
        let mut package_record = PackageRecord::for_test(name, "1.0", "0", 0);
        package_record.depends = depends.iter().map(|s| (*s).to_owned()).collect();
        RepoDataRecord {
            package_record,
            file_name: format!("{name}-1.0-0.conda"),
            url: Url::parse(&format!("https://example.com/linux-64/{name}-1.0-0.conda"))
                .unwrap(),
            channel: "test".to_owned(),
        }
    }

    fn names(records: &[RepoDataRecord]) -> Vec<&str> {
        records
            .iter()
            .map(|r| r.package_record.name.as_normalized())
            .collect()
    }

    #[test]
    fn test_dependencies_come_first() {
        let sorted = sort_topologically(vec![
            record("app", &["lib", "runtime"]),
            record("lib", &["runtime"]),
            record("runtime", &[]),
        ]);
        let names = names(&sorted);
        assert_eq!(names, vec!["runtime", "lib", "app"]);
    }

    #[test]
    fn test_cycle_is_broken() {
        let sorted = sort_topologically(vec![
            record("python", &["pip"]),
            record("pip", &["python"]),
        ]);
        // Both records survive; the order is deterministic.
        assert_eq!(sorted.len(), 2);
        let again = sort_topologically(vec![
            record("python", &["pip"]),
            record("pip", &["python"]),
        ]);
        assert_eq!(names(&sorted), names(&again));
    }

    #[test]
    fn test_missing_dependencies_are_ignored() {
        let sorted = sort_topologically(vec![record("app", &["not-in-set"])]);
        assert_eq!(sorted.len(), 1);
    }
}
