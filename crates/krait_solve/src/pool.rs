//! The candidate pool: all records a solve can choose from, grouped by name
//! and sorted in the order the solver should try them.

use std::{cmp::Ordering, collections::HashMap};

use krait_types::{GenericVirtualPackage, RepoDataRecord};

use crate::{ChannelPriority, SolverTask};

/// Index of a record inside the pool's backing storage.
pub(crate) type CandidateId = usize;

/// One name's worth of candidates, best first.
#[derive(Debug, Default)]
pub(crate) struct Candidates {
    pub candidates: Vec<CandidateId>,

    /// The candidate that is currently installed, if any.
    pub locked: Option<CandidateId>,
}

/// The pool of all candidates, keyed by normalized package name.
pub(crate) struct Pool<'t> {
    /// All records: available packages first, then locked, then pinned.
    pub records: Vec<&'t RepoDataRecord>,

    /// Per-name candidates, sorted best-first.
    pub by_name: HashMap<String, Candidates>,

    /// Virtual packages by name.
    pub virtual_by_name: HashMap<String, &'t GenericVirtualPackage>,
}

impl<'t> Pool<'t> {
    pub fn from_task(task: &'t SolverTask) -> Self {
        let channel_rank: HashMap<&str, usize> = task
            .channel_order
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.as_str(), idx))
            .collect();
        let rank_of = |record: &RepoDataRecord| {
            channel_rank
                .get(record.channel.trim_end_matches('/'))
                .copied()
                .unwrap_or(usize::MAX)
        };

        let mut records: Vec<&'t RepoDataRecord> = Vec::new();
        let mut by_name: HashMap<String, Candidates> = HashMap::new();

        let mut push = |records: &mut Vec<&'t RepoDataRecord>,
                        by_name: &mut HashMap<String, Candidates>,
                        record: &'t RepoDataRecord,
                        locked: bool| {
            let id = records.len();
            records.push(record);
            let entry = by_name
                .entry(record.package_record.name.as_normalized().to_owned())
                .or_default();
            entry.candidates.push(id);
            if locked {
                entry.locked = Some(id);
            }
        };

        for record in &task.available_packages {
            push(&mut records, &mut by_name, record, false);
        }
        for record in &task.locked_packages {
            push(&mut records, &mut by_name, record, true);
        }
        for record in &task.pinned_packages {
            // Pinned records participate like normal candidates; the solver
            // adds an exact constraint for them separately.
            push(&mut records, &mut by_name, record, false);
        }

        // Under strict priority a name is owned by the best-ranked channel
        // that serves it; candidates from other channels are dropped.
        if task.channel_priority == ChannelPriority::Strict {
            for candidates in by_name.values_mut() {
                let best_rank = candidates
                    .candidates
                    .iter()
                    .map(|&id| rank_of(records[id]))
                    .min()
                    .unwrap_or(usize::MAX);
                candidates.candidates.retain(|&id| {
                    rank_of(records[id]) == best_rank || Some(id) == candidates.locked
                });
            }
        }

        // Sort every name's candidates best-first. The locked candidate is
        // always tried first to minimize changes to the prefix.
        for candidates in by_name.values_mut() {
            let locked = candidates.locked;
            candidates.candidates.sort_by(|&a, &b| {
                if Some(a) == locked || Some(b) == locked {
                    return if Some(a) == locked {
                        Ordering::Less
                    } else {
                        Ordering::Greater
                    };
                }
                compare_candidates(
                    records[a],
                    records[b],
                    &rank_of,
                    task.channel_priority,
                )
            });
            candidates.candidates.dedup_by(|&mut a, &mut b| {
                records[a].url == records[b].url
            });
        }

        let virtual_by_name = task
            .virtual_packages
            .iter()
            .map(|package| (package.name.as_normalized().to_owned(), package))
            .collect();

        Self {
            records,
            by_name,
            virtual_by_name,
        }
    }

    pub fn candidates(&self, name: &str) -> &[CandidateId] {
        self.by_name
            .get(name)
            .map(|c| c.candidates.as_slice())
            .unwrap_or(&[])
    }

    pub fn locked(&self, name: &str) -> Option<CandidateId> {
        self.by_name.get(name).and_then(|c| c.locked)
    }
}

/// The conda candidate order: no tracked features before tracked features,
/// higher versions first, then channel rank (unless disabled), then higher
/// build numbers, then newer timestamps.
pub(crate) fn compare_candidates(
    a: &RepoDataRecord,
    b: &RepoDataRecord,
    rank_of: &impl Fn(&RepoDataRecord) -> usize,
    channel_priority: ChannelPriority,
) -> Ordering {
    let a_record = &a.package_record;
    let b_record = &b.package_record;

    let a_tracked = !a_record.track_features.is_empty();
    let b_tracked = !b_record.track_features.is_empty();
    match a_tracked.cmp(&b_tracked) {
        Ordering::Equal => {}
        ord => return ord,
    }

    match b_record.version.cmp(&a_record.version) {
        Ordering::Equal => {}
        ord => return ord,
    }

    if channel_priority != ChannelPriority::Disabled {
        match rank_of(a).cmp(&rank_of(b)) {
            Ordering::Equal => {}
            ord => return ord,
        }
    }

    match b_record.build_number.cmp(&a_record.build_number) {
        Ordering::Equal => {}
        ord => return ord,
    }

    b_record.timestamp.cmp(&a_record.timestamp)
}
