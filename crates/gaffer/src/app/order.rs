//! Merge-order computation from file-overlap analysis.
//!
//! Branches that overlap least with everyone else merge first, so conflicts
//! stay localised to the last few merges and approval gates stay rare. The
//! scoring is deliberately naive: per changed file, count the other
//! sessions touching the same file, and sum.

use std::collections::{BTreeSet, HashMap};

/// Input for one successful session: its identity and changed paths.
#[derive(Clone, Debug)]
pub struct SessionFiles {
    pub session_id: String,
    pub started_at: i64,
    pub files: Vec<String>,
}

/// Computes the merge order over successful sessions.
///
/// Sessions are sorted by ascending overlap score; ties break by
/// `started_at` ascending, then by `session_id` lexicographically.
pub fn compute_merge_order(sessions: &[SessionFiles]) -> Vec<String> {
    let mut touch_counts: HashMap<&str, usize> = HashMap::new();
    let unique_files: Vec<BTreeSet<&str>> = sessions
        .iter()
        .map(|session| session.files.iter().map(String::as_str).collect())
        .collect();

    for files in &unique_files {
        for file in files {
            *touch_counts.entry(file).or_default() += 1;
        }
    }

    let mut scored: Vec<(usize, i64, &str)> = sessions
        .iter()
        .zip(&unique_files)
        .map(|(session, files)| {
            let score: usize = files
                .iter()
                .map(|file| touch_counts.get(file).copied().unwrap_or(0).saturating_sub(1))
                .sum();

            (score, session.started_at, session.session_id.as_str())
        })
        .collect();

    scored.sort();

    scored
        .into_iter()
        .map(|(_, _, session_id)| session_id.to_string())
        .collect()
}

/// Computes the overlap score of one session against the rest.
///
/// Exposed separately so observers can explain an ordering after the fact.
pub fn overlap_score(session: &SessionFiles, others: &[SessionFiles]) -> usize {
    let files: BTreeSet<&str> = session.files.iter().map(String::as_str).collect();

    files
        .iter()
        .map(|file| {
            others
                .iter()
                .filter(|other| other.session_id != session.session_id)
                .filter(|other| other.files.iter().any(|candidate| candidate == file))
                .count()
        })
        .sum()
}
