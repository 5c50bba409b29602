use log::info;
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared::models::{DiagnosisReport, IsolationDecision};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Persists run artifacts as pretty JSON files under one directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn report_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("diagnosis_report_{run_id}.json"))
    }

    pub fn decision_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("isolation_decision_{run_id}.json"))
    }

    pub fn save_report(&self, report: &DiagnosisReport) -> Result<PathBuf> {
        let path = self.report_path(&report.run_id);
        self.write_json(&path, report)?;
        info!("Report saved to {}", path.display());
        Ok(path)
    }

    pub fn save_decision(&self, decision: &IsolationDecision) -> Result<PathBuf> {
        let path = self.decision_path(&decision.run_id);
        self.write_json(&path, decision)?;
        info!("Isolation decision saved to {}", path.display());
        Ok(path)
    }

    pub fn load_report(path: &Path) -> Result<DiagnosisReport> {
        read_json(path)
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let mut content = serde_json::to_string_pretty(value)?;
        content.push('\n');
        fs::write(path, content)?;
        Ok(())
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}
