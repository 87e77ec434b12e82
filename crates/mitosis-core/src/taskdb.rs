//! Reader for the newline-delimited JSON task database. The coordinator
//! never touches the raw records; it consumes the [`AgentConfig`]s produced
//! here.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::coordinator::AgentConfig;
use crate::{CoreError, Result};

/// One issue record as stored in the task database.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: String,
    #[serde(default)]
    pub dependencies: Vec<DependencyRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DependencyRecord {
    pub issue_id: String,
    pub depends_on_id: String,
    #[serde(rename = "type")]
    pub kind: DependencyKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyKind {
    /// Scheduling edge: the dependent waits for the dependency.
    Blocks,
    /// Structural grouping only; ignored for scheduling.
    ParentChild,
}

/// Read every record from a `.jsonl` file. Blank lines are skipped; a
/// malformed line is an error naming its line number.
pub fn load_records(path: &Path) -> Result<Vec<TaskRecord>> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| CoreError::TaskDb(format!("failed to read {}: {e}", path.display())))?;

    let mut records = Vec::new();
    for (i, line) in data.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: TaskRecord = serde_json::from_str(line)
            .map_err(|e| CoreError::TaskDb(format!("line {}: {e}", i + 1)))?;
        records.push(record);
    }
    Ok(records)
}

/// Convert records into coordinator inputs.
///
/// Only `blocks` edges schedule; `parent-child` is grouping metadata. Edges
/// pointing outside the admitted set are dropped with a warning so a
/// truncated run does not reference tasks that will never execute.
pub fn to_agent_configs(records: &[TaskRecord], limit: usize) -> Vec<AgentConfig> {
    let admitted: Vec<&TaskRecord> = if limit > 0 {
        records.iter().take(limit).collect()
    } else {
        records.iter().collect()
    };
    let known: HashSet<&str> = admitted.iter().map(|r| r.id.as_str()).collect();

    admitted
        .iter()
        .map(|record| {
            let dependencies = record
                .dependencies
                .iter()
                .filter(|d| d.kind == DependencyKind::Blocks && d.issue_id == record.id)
                .filter_map(|d| {
                    if known.contains(d.depends_on_id.as_str()) {
                        Some(d.depends_on_id.clone())
                    } else {
                        warn!(
                            task_id = %record.id,
                            missing = %d.depends_on_id,
                            "dropping dependency outside the admitted task set"
                        );
                        None
                    }
                })
                .collect();

            AgentConfig {
                id: record.id.clone(),
                title: record.title.clone(),
                description: record.description.clone(),
                acceptance_criteria: record.acceptance_criteria.clone(),
                dependencies,
                max_retries: None,
                timeout_seconds: None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_db(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    #[test]
    fn loads_records_and_skips_blank_lines() {
        let db = write_db(&[
            r#"{"id": "t1", "title": "first", "description": "d1", "acceptance_criteria": "a1"}"#,
            "",
            r#"{"id": "t2", "title": "second", "dependencies": [{"issue_id": "t2", "depends_on_id": "t1", "type": "blocks"}]}"#,
        ]);

        let records = load_records(db.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "t1");
        assert_eq!(records[1].dependencies.len(), 1);
        assert_eq!(records[1].dependencies[0].kind, DependencyKind::Blocks);
    }

    #[test]
    fn malformed_line_reports_its_number() {
        let db = write_db(&[
            r#"{"id": "t1", "title": "ok"}"#,
            r#"{not json"#,
        ]);
        let err = load_records(db.path()).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn blocks_edges_schedule_parent_child_does_not() {
        let db = write_db(&[
            r#"{"id": "t1", "title": "one"}"#,
            r#"{"id": "t2", "title": "two", "dependencies": [{"issue_id": "t2", "depends_on_id": "t1", "type": "blocks"}, {"issue_id": "t2", "depends_on_id": "t1", "type": "parent-child"}]}"#,
        ]);

        let records = load_records(db.path()).unwrap();
        let configs = to_agent_configs(&records, 0);
        assert_eq!(configs[1].dependencies, vec!["t1"]);
    }

    #[test]
    fn limit_truncates_and_drops_dangling_edges() {
        let db = write_db(&[
            r#"{"id": "t1", "title": "one"}"#,
            r#"{"id": "t2", "title": "two"}"#,
            r#"{"id": "t3", "title": "three", "dependencies": [{"issue_id": "t3", "depends_on_id": "t9", "type": "blocks"}]}"#,
        ]);

        let records = load_records(db.path()).unwrap();
        let limited = to_agent_configs(&records, 2);
        assert_eq!(limited.len(), 2);

        // Unknown dependency target is dropped, not surfaced as an error.
        let all = to_agent_configs(&records, 0);
        assert!(all[2].dependencies.is_empty());
    }
}
