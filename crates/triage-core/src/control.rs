use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The only presubmit system results are accepted from.
pub const LUCI_CV_SYSTEM: &str = "luci-cv";

const PROJECT_MAX_LEN: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BuildResult {
    pub host: String,
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub project: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresubmitRunId {
    pub system: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PresubmitResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presubmit_run_id: Option<PresubmitRunId>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub critical: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,
}

/// Ingestion control record for one build. De-duplicates build ingestion
/// and joins it with the presubmit run result when one is required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub project: String,
    /// `{buildbucket host}/{build id}`.
    pub build_id: String,
    pub build_result: Option<BuildResult>,
    pub is_presubmit: bool,
    pub presubmit_result: Option<PresubmitResult>,
    /// Commit time of the last write. Output only.
    pub last_updated: Option<DateTime<Utc>>,
    /// Commit time of the first write. Output only.
    pub creation_time: Option<DateTime<Utc>>,
}

impl Entry {
    pub fn new(project: impl Into<String>, build_id: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            build_id: build_id.into(),
            build_result: None,
            is_presubmit: false,
            presubmit_result: None,
            last_updated: None,
            creation_time: None,
        }
    }

    /// Whether every result required to start ingestion is present.
    pub fn is_ready(&self) -> bool {
        self.build_result.is_some() && (!self.is_presubmit || self.presubmit_result.is_some())
    }

    pub fn awaiting_build_result(&self) -> bool {
        self.build_result.is_none()
    }

    pub fn awaiting_presubmit_result(&self) -> bool {
        self.is_presubmit && self.presubmit_result.is_none()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("project must be valid")]
    InvalidProject,
    #[error("build ID must be specified")]
    MissingBuildId,
    #[error("presubmit result must not be set unless IsPresubmit is set")]
    UnexpectedPresubmitResult,
    #[error("build result: {0}")]
    BuildResult(&'static str),
    #[error("presubmit result: {0}")]
    PresubmitResult(&'static str),
}

/// LUCI project names: 1 to 40 characters of `[a-z0-9-]`.
pub fn is_valid_project(project: &str) -> bool {
    !project.is_empty()
        && project.len() <= PROJECT_MAX_LEN
        && project
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

pub fn validate_entry(entry: &Entry) -> Result<(), ValidationError> {
    if !is_valid_project(&entry.project) {
        return Err(ValidationError::InvalidProject);
    }
    if entry.build_id.is_empty() {
        return Err(ValidationError::MissingBuildId);
    }
    if let Some(result) = &entry.build_result {
        validate_build_result(result).map_err(ValidationError::BuildResult)?;
    }
    if let Some(result) = &entry.presubmit_result {
        if !entry.is_presubmit {
            return Err(ValidationError::UnexpectedPresubmitResult);
        }
        validate_presubmit_result(result).map_err(ValidationError::PresubmitResult)?;
    }
    Ok(())
}

fn validate_build_result(result: &BuildResult) -> Result<(), &'static str> {
    if result.host.is_empty() {
        return Err("host must be specified");
    }
    if result.id == 0 {
        return Err("id must be specified");
    }
    if result.creation_time.is_none() {
        return Err("creation time must be specified");
    }
    Ok(())
}

fn validate_presubmit_result(result: &PresubmitResult) -> Result<(), &'static str> {
    let Some(run_id) = &result.presubmit_run_id else {
        return Err("presubmit run ID must be specified");
    };
    if run_id.system != LUCI_CV_SYSTEM {
        return Err("presubmit run system must be 'luci-cv'");
    }
    if run_id.id.is_empty() {
        return Err("presubmit run system-specific ID must be specified");
    }
    if result.creation_time.is_none() {
        return Err("creation time must be specified and valid");
    }
    Ok(())
}
