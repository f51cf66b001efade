//! Reader and writer for the `conda-meta/history` journal.
//!
//! Every transaction applied to a prefix appends one entry. An entry starts
//! with a `==> <timestamp> <==` header followed by comment lines describing
//! the request (`# cmd: …`, `# install specs: […]`) and one line per linked
//! (`+dist`) or unlinked (`-dist`) package. Replaying the journal yields the
//! set of specs the user has explicitly asked for, which drives
//! `env export --from-history` and the implicit python pin.

use std::{
    io::Write,
    path::{Path, PathBuf},
    str::FromStr,
};

use indexmap::IndexMap;
use thiserror::Error;

use crate::MatchSpec;

/// A single entry in the history journal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryEntry {
    /// The timestamp of the entry, `YYYY-MM-DD HH:MM:SS`.
    pub timestamp: String,

    /// The command line that caused the entry.
    pub cmd: Option<String>,

    /// The action that was performed (`install`, `remove`, `create`, …).
    pub action: Option<String>,

    /// The specs requested for installation or update.
    pub update_specs: Vec<String>,

    /// The specs requested for removal.
    pub remove_specs: Vec<String>,

    /// The dist strings (`channel::name-version-build`) that were linked.
    pub link_dists: Vec<String>,

    /// The dist strings that were unlinked.
    pub unlink_dists: Vec<String>,
}

/// Errors that can occur when working with history files.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// An I/O error occurred.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// A spec recorded in the history could not be parsed.
    #[error("failed to parse spec '{0}' from history")]
    InvalidSpec(String),
}

/// The `conda-meta/history` file of one prefix.
#[derive(Debug, Clone)]
pub struct History {
    path: PathBuf,
}

impl History {
    /// Creates a handle for the history file of the given prefix.
    pub fn from_prefix(prefix: &Path) -> Self {
        Self {
            path: prefix.join("conda-meta").join("history"),
        }
    }

    /// The location of the journal on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parses all entries. A missing file yields an empty history.
    pub fn entries(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        let content = match fs_err::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(parse_history(&content))
    }

    /// Appends a single entry to the journal, creating the file (and its
    /// parent directory) if necessary.
    pub fn append_entry(&self, entry: &HistoryEntry) -> Result<(), HistoryError> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)?;
        }
        let mut file = fs_err::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(render_entry(entry).as_bytes())?;
        Ok(())
    }

    /// Replays the journal to derive the currently requested spec per package
    /// name: later requests shadow earlier ones and a removal request drops
    /// the package from the map.
    pub fn requested_specs_map(&self) -> Result<IndexMap<String, MatchSpec>, HistoryError> {
        let mut map = IndexMap::new();
        for entry in self.entries()? {
            for spec_str in &entry.update_specs {
                let spec = MatchSpec::from_str(spec_str)
                    .map_err(|_| HistoryError::InvalidSpec(spec_str.clone()))?;
                let Some(name) = spec.name.as_ref() else {
                    continue;
                };
                map.insert(name.as_normalized().to_owned(), spec);
            }
            for spec_str in &entry.remove_specs {
                let spec = MatchSpec::from_str(spec_str)
                    .map_err(|_| HistoryError::InvalidSpec(spec_str.clone()))?;
                if let Some(name) = spec.name.as_ref() {
                    map.shift_remove(name.as_normalized());
                }
            }
        }
        Ok(map)
    }
}

fn parse_history(content: &str) -> Vec<HistoryEntry> {
    let mut entries: Vec<HistoryEntry> = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if let Some(header) = line.strip_prefix("==>") {
            let timestamp = header.trim_end_matches("<==").trim().to_owned();
            entries.push(HistoryEntry {
                timestamp,
                ..HistoryEntry::default()
            });
            continue;
        }
        let Some(entry) = entries.last_mut() else {
            // Lines before the first header (old format comments) are skipped.
            continue;
        };
        if let Some(comment) = line.strip_prefix('#') {
            let comment = comment.trim();
            if let Some(cmd) = comment.strip_prefix("cmd:") {
                entry.cmd = Some(cmd.trim().to_owned());
            } else if let Some(specs) = comment.strip_prefix("install specs:") {
                entry.action = Some("install".to_owned());
                entry.update_specs = parse_spec_list(specs);
            } else if let Some(specs) = comment.strip_prefix("update specs:") {
                entry.action = Some("update".to_owned());
                entry.update_specs = parse_spec_list(specs);
            } else if let Some(specs) = comment.strip_prefix("remove specs:") {
                entry.action = Some("remove".to_owned());
                entry.remove_specs = parse_spec_list(specs);
            }
        } else if let Some(dist) = line.strip_prefix('+') {
            entry.link_dists.push(dist.to_owned());
        } else if let Some(dist) = line.strip_prefix('-') {
            entry.unlink_dists.push(dist.to_owned());
        }
    }
    entries
}

/// Parses a `["foo", 'bar >=1']` style list as conda writes it.
fn parse_spec_list(specs: &str) -> Vec<String> {
    specs
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(|s| s.trim().trim_matches(|c| c == '"' || c == '\'').to_owned())
        .filter(|s| !s.is_empty())
        .collect()
}

fn render_spec_list(specs: &[String]) -> String {
    let quoted: Vec<String> = specs.iter().map(|s| format!("\"{s}\"")).collect();
    format!("[{}]", quoted.join(", "))
}

fn render_entry(entry: &HistoryEntry) -> String {
    let mut out = String::new();
    out.push_str(&format!("==> {} <==\n", entry.timestamp));
    if let Some(cmd) = &entry.cmd {
        out.push_str(&format!("# cmd: {cmd}\n"));
    }
    if !entry.update_specs.is_empty() {
        let action = entry.action.as_deref().unwrap_or("install");
        out.push_str(&format!(
            "# {} specs: {}\n",
            action,
            render_spec_list(&entry.update_specs)
        ));
    }
    if !entry.remove_specs.is_empty() {
        out.push_str(&format!(
            "# remove specs: {}\n",
            render_spec_list(&entry.remove_specs)
        ));
    }
    for dist in &entry.unlink_dists {
        out.push_str(&format!("-{dist}\n"));
    }
    for dist in &entry.link_dists {
        out.push_str(&format!("+{dist}\n"));
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    const HISTORY: &str = r#"==> 2023-01-01 10:00:00 <==
# cmd: krait create -n test python
# install specs: ["python >=3.9"]
+conda-forge/linux-64::python-3.11.0-h123_0
+conda-forge/noarch::pip-23.0-pyhd8ed1ab_0
==> 2023-01-02 11:30:00 <==
# cmd: krait install numpy
# install specs: ["numpy"]
+conda-forge/linux-64::numpy-1.24.0-py311h123_0
==> 2023-01-03 09:00:00 <==
# cmd: krait remove numpy
# remove specs: ["numpy"]
-conda-forge/linux-64::numpy-1.24.0-py311h123_0
"#;

    fn history_with_content(content: &str) -> (tempfile::TempDir, History) {
        let dir = tempfile::tempdir().unwrap();
        let history = History::from_prefix(dir.path());
        fs_err::create_dir_all(history.path().parent().unwrap()).unwrap();
        fs_err::write(history.path(), content).unwrap();
        (dir, history)
    }

    #[test]
    fn test_parse() {
        let (_dir, history) = history_with_content(HISTORY);
        let entries = history.entries().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].timestamp, "2023-01-01 10:00:00");
        assert_eq!(entries[0].update_specs, vec!["python >=3.9"]);
        assert_eq!(entries[0].link_dists.len(), 2);
        assert_eq!(entries[2].remove_specs, vec!["numpy"]);
        assert_eq!(
            entries[2].unlink_dists,
            vec!["conda-forge/linux-64::numpy-1.24.0-py311h123_0"]
        );
    }

    #[test]
    fn test_requested_specs_replay() {
        let (_dir, history) = history_with_content(HISTORY);
        let specs = history.requested_specs_map().unwrap();
        // numpy was removed again, python survives.
        assert_eq!(specs.len(), 1);
        assert!(specs.contains_key("python"));
    }

    #[test]
    fn test_append_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let history = History::from_prefix(dir.path());

        let entry = HistoryEntry {
            timestamp: "2023-05-05 12:00:00".to_owned(),
            cmd: Some("krait install foo".to_owned()),
            action: Some("install".to_owned()),
            update_specs: vec!["foo >=1".to_owned()],
            remove_specs: Vec::new(),
            link_dists: vec!["test/linux-64::foo-1.0-0".to_owned()],
            unlink_dists: Vec::new(),
        };
        history.append_entry(&entry).unwrap();

        let entries = history.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0], entry);

        // Appending again keeps the first entry intact.
        history.append_entry(&entry).unwrap();
        assert_eq!(history.entries().unwrap().len(), 2);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let history = History::from_prefix(dir.path());
        assert!(history.entries().unwrap().is_empty());
        assert!(history.requested_specs_map().unwrap().is_empty());
    }
}
