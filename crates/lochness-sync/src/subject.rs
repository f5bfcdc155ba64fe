//! Subject feed: reads the per-study metadata tables kept under
//! `PHOENIX/GENERAL/<study>/<study>_metadata.csv`.
//!
//! Besides `Subject ID`, `Active` and `Consent`, every column names a source
//! and holds values of the form `<source>.<module>:<id>`, for example
//! `hdd.StudyA:subject01` or `xnat.StudyA:subproject:subject01`.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Where a subject's data lives in one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceId {
    /// Source-side grouping (usually the study or project name).
    pub module: String,
    /// Source-side identifier of the subject.
    pub id: String,
}

/// One row of a study metadata table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subject {
    /// Subject id.
    pub id: String,
    /// Study the metadata table belongs to.
    pub study: String,
    /// Value of the `Active` column; true when absent.
    pub active: bool,
    /// Value of the `Consent` column.
    pub consent: Option<String>,
    /// Identifiers keyed by lowercase source name.
    pub source_ids: BTreeMap<String, SourceId>,
}

impl Subject {
    /// Identifier for `source`, if the subject has one.
    pub fn source_id(&self, source: &str) -> Option<&SourceId> {
        self.source_ids.get(source)
    }
}

/// Path of a study's metadata table.
pub fn metadata_path(phoenix_root: &Path, study: &str) -> PathBuf {
    phoenix_root
        .join("GENERAL")
        .join(study)
        .join(format!("{study}_metadata.csv"))
}

/// Studies present under `PHOENIX/GENERAL`, sorted.
pub fn discover_studies(phoenix_root: &Path) -> std::io::Result<Vec<String>> {
    let general = phoenix_root.join("GENERAL");
    let entries = match std::fs::read_dir(&general) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut studies = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            studies.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    studies.sort();
    Ok(studies)
}

/// All subjects of `studies` (every study under GENERAL when empty).
///
/// A study without a metadata table, or a row without a subject id, is
/// logged and skipped.
pub fn read_phoenix_metadata(
    phoenix_root: &Path,
    studies: &[String],
) -> std::io::Result<Vec<Subject>> {
    let studies = if studies.is_empty() {
        discover_studies(phoenix_root)?
    } else {
        studies.to_vec()
    };

    let mut subjects = Vec::new();
    for study in &studies {
        let path = metadata_path(phoenix_root, study);
        if !path.exists() {
            warn!(study = %study, path = %path.display(), "study has no metadata file; skipping");
            continue;
        }
        match read_study(&path, study) {
            Ok(mut rows) => {
                debug!(study = %study, subjects = rows.len(), "metadata loaded");
                subjects.append(&mut rows);
            }
            Err(e) => warn!(study = %study, error = %e, "unreadable metadata file; skipping"),
        }
    }
    Ok(subjects)
}

fn read_study(path: &Path, study: &str) -> Result<Vec<Subject>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();

    let mut subjects = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let mut id = None;
        let mut active = true;
        let mut consent = None;
        let mut source_ids = BTreeMap::new();

        for (header, value) in headers.iter().zip(record.iter()) {
            match header.to_ascii_lowercase().as_str() {
                "subject id" => id = Some(value.to_string()).filter(|v| !v.is_empty()),
                "active" => active = parse_active(value),
                "consent" => consent = Some(value.to_string()).filter(|v| !v.is_empty()),
                _ => {
                    if let Some((source, source_id)) = parse_source_value(value) {
                        source_ids.insert(source, source_id);
                    }
                }
            }
        }

        match id {
            Some(id) => subjects.push(Subject {
                id,
                study: study.to_string(),
                active,
                consent,
                source_ids,
            }),
            None => warn!(path = %path.display(), row = row + 2, "row without subject id; skipping"),
        }
    }
    Ok(subjects)
}

fn parse_active(value: &str) -> bool {
    match value.to_ascii_lowercase().as_str() {
        "0" | "0.0" | "false" | "no" | "n" => false,
        _ => !value.is_empty(),
    }
}

/// `hdd.StudyA:subject01` -> (`hdd`, {module: `StudyA`, id: `subject01`}).
fn parse_source_value(value: &str) -> Option<(String, SourceId)> {
    let (source, rest) = value.split_once('.')?;
    let (module, id) = rest.split_once(':')?;
    if source.is_empty() || id.is_empty() {
        return None;
    }
    Some((
        source.to_ascii_lowercase(),
        SourceId {
            module: module.to_string(),
            id: id.to_string(),
        },
    ))
}
