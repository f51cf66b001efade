#![deny(missing_docs)]

//! Dependency resolution.
//!
//! The solver takes the records of every loaded channel subdirectory, the
//! installed records of the target prefix, the host's virtual packages and
//! the user's match specs, and produces the set of records the prefix should
//! contain afterwards. Candidate ordering follows conda: tracked features
//! sort a record down, higher versions and build numbers sort it up, and the
//! channel list breaks ties (or, under strict priority, decides outright
//! which channel may serve a name).

mod pool;
mod solver;
mod topological;

use krait_types::{GenericVirtualPackage, MatchSpec, RepoDataRecord};
use thiserror::Error;

pub use solver::solve;
pub use topological::sort_topologically;

/// How the position of a channel in the channel list influences solving.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum ChannelPriority {
    /// A name is only served by the highest-priority channel that carries
    /// it, even if that forces older versions or makes the task unsolvable.
    Strict,

    /// Channel position only breaks ties between otherwise equal candidates.
    #[default]
    Flexible,

    /// Channel position is ignored entirely.
    Disabled,
}

/// A dependency resolution task.
#[derive(Default)]
pub struct SolverTask {
    /// Every record available for installation.
    pub available_packages: Vec<RepoDataRecord>,

    /// The canonical names of the channels in priority order (highest
    /// first). Records from unlisted channels sort after listed ones.
    pub channel_order: Vec<String>,

    /// How channel priority is applied.
    pub channel_priority: ChannelPriority,

    /// Records that are currently installed. The solver prefers keeping
    /// these versions when they still satisfy all constraints.
    pub locked_packages: Vec<RepoDataRecord>,

    /// Records that must not change: deviating from one of these is an
    /// error, not a preference.
    pub pinned_packages: Vec<RepoDataRecord>,

    /// Additional hard constraints (from `conda-meta/pinned`, configuration
    /// and the implicit python pin).
    pub pins: Vec<MatchSpec>,

    /// The virtual packages of the host.
    pub virtual_packages: Vec<GenericVirtualPackage>,

    /// The specs that must be satisfied.
    pub specs: Vec<MatchSpec>,

    /// Whether an installed package may be replaced by an older version.
    pub allow_downgrade: bool,
}

/// An error that can occur while solving.
#[derive(Debug, Error)]
pub enum SolveError {
    /// No set of records satisfies the task. The strings are a
    /// human-readable explanation of the most relevant conflicts.
    #[error("cannot solve the request:\n{}", .0.join("\n"))]
    Unsolvable(Vec<String>),

    /// A spec in the task has no package name.
    #[error("the spec '{0}' has no package name")]
    SpecWithoutName(String),

    /// A dependency string of a record could not be parsed.
    #[error("failed to parse dependency '{0}' of {1}")]
    InvalidDependency(String, String),

    /// The solver exceeded its work budget; the task is too entangled.
    #[error("the solver exceeded its backtracking budget")]
    BudgetExceeded,
}
