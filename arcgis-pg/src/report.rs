//! Rapport d'import
//!
//! Collecte le bilan d'une exécution (compteurs, statut, dernier message,
//! couche publiée) pour l'afficher ou le sauvegarder en JSON.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::export::transaction::{LoadOutcome, LoadStatus};
use crate::export::TableRef;
use crate::job::{ImportMode, ImportRun, RunStatus};
use crate::loader::LoadReport;
use crate::publish::PublishedLayer;

/// Nombre d'erreurs affichées par [`ImportReport::display`]
const DISPLAYED_ERRORS: usize = 20;

/// Rapport complet d'un import
#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub url: String,
    pub mode: ImportMode,
    /// Table destination
    pub table: Option<TableRef>,
    pub status: RunStatus,
    pub duration_secs: f64,

    pub processed: u64,
    pub created: u64,
    pub failed: u64,
    /// Lignes supprimées avant rechargement
    pub deleted: u64,
    /// Nombre annoncé par le service
    pub total: Option<u64>,
    /// Le flux s'est interrompu avant la fin
    pub truncated: bool,
    /// Les lignes écrites ont été annulées
    pub rolled_back: bool,

    /// Filtre utilisé en mode ajout
    pub filter: Option<String>,
    pub last_message: String,
    pub published: Option<PublishedLayer>,
    pub errors: Vec<String>,
}

impl ImportReport {
    pub fn new(url: &str, mode: ImportMode) -> Self {
        Self {
            url: url.to_string(),
            mode,
            table: None,
            status: RunStatus::Pending,
            duration_secs: 0.0,
            processed: 0,
            created: 0,
            failed: 0,
            deleted: 0,
            total: None,
            truncated: false,
            rolled_back: false,
            filter: None,
            last_message: String::new(),
            published: None,
            errors: Vec::new(),
        }
    }

    /// Enregistre le bilan du chargement
    pub fn record_load(&mut self, load: &LoadReport) {
        self.processed = load.processed;
        self.created = load.created;
        self.failed = load.failed;
        self.total = load.total;
        self.truncated = load.truncated();
        if let Some(e) = &load.fetch_failure {
            self.errors.push(e.to_string());
        }
    }

    /// Enregistre l'issue de la transaction
    pub fn record_outcome(&mut self, outcome: &LoadOutcome) {
        self.created = outcome.created;
        self.deleted = outcome.deleted;
        self.rolled_back = outcome.status == LoadStatus::RolledBack;
        for error in &outcome.errors {
            if !self.errors.contains(error) {
                self.errors.push(error.clone());
            }
        }
    }

    /// Reprend le statut final de l'exécution
    pub fn complete(&mut self, run: &ImportRun, duration: Duration) {
        self.status = run.status;
        self.last_message = run.last_message.clone();
        self.processed = self.processed.max(run.processed);
        if self.total.is_none() {
            self.total = run.total;
        }
        self.duration_secs = duration.as_secs_f64();
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Finished
    }

    /// Affiche le rapport sur la console
    pub fn display(&self) {
        println!("\n{}", "=".repeat(60));
        println!("IMPORT REPORT - {} ({})", self.url, self.mode);
        println!("{}", "=".repeat(60));

        println!("\nStatus: {}", self.status);
        println!("Duration: {:.2}s", self.duration_secs);
        if let Some(table) = &self.table {
            println!("Table: {}", table);
        }
        if let Some(filter) = &self.filter {
            println!("Filter: {}", filter);
        }

        println!("\n--- SUMMARY ---");
        let total = self
            .total
            .map_or_else(|| "unknown".to_string(), |t| t.to_string());
        println!(
            "Features: {} processed of {}, {} created, {} failed",
            self.processed, total, self.created, self.failed
        );
        if self.deleted > 0 {
            println!("Rows deleted before reload: {}", self.deleted);
        }
        if self.truncated {
            println!("Stream stopped before the last page");
        }
        if self.rolled_back {
            println!("Transaction rolled back");
        }

        if let Some(layer) = &self.published {
            println!("\n--- PUBLISHED ---");
            println!("  {} ({}) {}", layer.title, layer.name, layer.url);
        }

        if !self.errors.is_empty() {
            println!("\n--- ERRORS ({}) ---", self.errors.len());
            for e in self.errors.iter().take(DISPLAYED_ERRORS) {
                println!("  {}", e);
            }
            if self.errors.len() > DISPLAYED_ERRORS {
                println!("  ... and {} more", self.errors.len() - DISPLAYED_ERRORS);
            }
        }

        println!("\nLast message: {}", self.last_message);
        println!("{}", "=".repeat(60));
    }

    /// Sauvegarde le rapport en JSON
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .context(format!("Failed to write report: {}", path.display()))?;
        Ok(())
    }

    /// Affichage compact pour le résumé
    pub fn summary(&self) -> String {
        let target = self
            .table
            .as_ref()
            .map_or_else(|| self.url.clone(), |t| t.to_string());
        format!(
            "{}: {} {} created, {} failed",
            target,
            self.status,
            self.created,
            self.failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_report() {
        let report = ImportReport::new("https://x/MapServer/0", ImportMode::Full);
        assert_eq!(report.status, RunStatus::Pending);
        assert_eq!(report.created, 0);
        assert!(!report.is_success());
    }

    #[test]
    fn test_complete_from_run() {
        let mut report = ImportReport::new("https://x/MapServer/0", ImportMode::Reload);
        let mut run = ImportRun::new();
        run.transition(RunStatus::InProgress).unwrap();
        run.record_progress(5, 4, 1, Some(5));
        run.transition(RunStatus::Finished).unwrap();
        run.last_message = "Data imported into DB table".to_string();

        report.complete(&run, Duration::from_millis(1500));
        assert!(report.is_success());
        assert_eq!(report.processed, 5);
        assert_eq!(report.total, Some(5));
        assert!((report.duration_secs - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_summary() {
        let mut report = ImportReport::new("https://x/MapServer/0", ImportMode::Full);
        report.table = Some(TableRef::new(Some("public"), "pipes"));
        report.status = RunStatus::Finished;
        report.created = 100;
        report.failed = 2;
        assert_eq!(report.summary(), "public.pipes: FINISHED 100 created, 2 failed");
    }

    #[test]
    fn test_serialize() {
        let report = ImportReport::new("https://x/MapServer/0", ImportMode::Append);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["mode"], "append");
        assert_eq!(json["status"], "PENDING");
    }
}
