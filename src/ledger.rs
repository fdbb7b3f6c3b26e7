use chrono::NaiveDate;
use std::cell::RefCell;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::info;

use crate::models::{ApplicationRecord, Status};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("failed to read ledger {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("failed to write ledger {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("io error on ledger {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub trait LedgerStore {
    fn load(&self) -> Result<Vec<ApplicationRecord>, LedgerError>;
    fn save(&self, records: &[ApplicationRecord]) -> Result<(), LedgerError>;
}

// --- Merge rules ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    Inserted,
    Updated,
    Unchanged,
}

impl Reconciled {
    pub fn changed(self) -> bool {
        self != Reconciled::Unchanged
    }
}

#[derive(Debug, Default)]
pub struct Ledger {
    records: Vec<ApplicationRecord>,
}

impl Ledger {
    pub fn new(records: Vec<ApplicationRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[ApplicationRecord] {
        &self.records
    }

    pub fn contains(&self, company: &str, role: &str) -> bool {
        self.records.iter().any(|r| r.matches(company, role))
    }

    /// Merges one signal. Status never moves to a lower rank; non-empty notes always win.
    pub fn reconcile(
        &mut self,
        company: &str,
        role: &str,
        status: Status,
        notes: &str,
        applied_date_if_new: Option<NaiveDate>,
        today: NaiveDate,
    ) -> Reconciled {
        if let Some(record) = self.records.iter_mut().find(|r| r.matches(company, role)) {
            let before = record.clone();
            if status.rank() >= record.status.rank() {
                record.status = status;
            }
            if !notes.is_empty() {
                record.notes = Some(notes.to_string());
            }
            if *record == before {
                return Reconciled::Unchanged;
            }
            info!(
                "Updated {} ({}): {} -> {}",
                record.company, record.role, before.status, record.status
            );
            return Reconciled::Updated;
        }

        let record = ApplicationRecord {
            company: company.to_string(),
            applied_date: applied_date_if_new.unwrap_or(today),
            role: role.to_string(),
            status,
            notes: (!notes.is_empty()).then(|| notes.to_string()),
        };
        info!(
            "Discovered application for {} ({}) on {}",
            record.company, record.role, record.applied_date
        );
        self.records.push(record);
        Reconciled::Inserted
    }

    /// Newest application first; equal dates keep their current order.
    pub fn sort_for_save(&mut self) {
        self.records
            .sort_by(|a, b| b.applied_date.cmp(&a.applied_date));
    }

    pub fn persist(&mut self, store: &dyn LedgerStore) -> Result<(), LedgerError> {
        self.sort_for_save();
        store.save(&self.records)
    }
}

// --- CSV file store ---

pub struct CsvLedgerStore {
    path: PathBuf,
}

impl CsvLedgerStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> LedgerError {
        LedgerError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl LedgerStore for CsvLedgerStore {
    fn load(&self) -> Result<Vec<ApplicationRecord>, LedgerError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let read_error = |source| LedgerError::Read {
            path: self.path.clone(),
            source,
        };
        let mut reader = csv::Reader::from_path(&self.path).map_err(read_error)?;
        reader
            .deserialize()
            .collect::<Result<Vec<ApplicationRecord>, _>>()
            .map_err(read_error)
    }

    fn save(&self, records: &[ApplicationRecord]) -> Result<(), LedgerError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|e| self.io_error(e))?;

        let write_error = |source| LedgerError::Write {
            path: self.path.clone(),
            source,
        };

        // Write the whole table to a sibling temp file, then swap it in.
        let tmp = NamedTempFile::new_in(&dir).map_err(|e| self.io_error(e))?;
        let mut writer = csv::Writer::from_writer(tmp);
        for record in records {
            writer.serialize(record).map_err(write_error)?;
        }
        // An empty ledger still gets its header row.
        if records.is_empty() {
            writer
                .write_record(["Company Name", "Application Date", "Role", "Status", "Notes"])
                .map_err(write_error)?;
        }
        let mut tmp = writer
            .into_inner()
            .map_err(|e| self.io_error(e.into_error()))?;
        tmp.flush().map_err(|e| self.io_error(e))?;
        tmp.as_file().sync_all().map_err(|e| self.io_error(e))?;
        tmp.persist(&self.path).map_err(|e| self.io_error(e.error))?;
        Ok(())
    }
}

// --- In-memory store ---

#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    records: RefCell<Vec<ApplicationRecord>>,
    saves: RefCell<usize>,
}

impl MemoryLedgerStore {
    pub fn with_records(records: Vec<ApplicationRecord>) -> Self {
        Self {
            records: RefCell::new(records),
            saves: RefCell::new(0),
        }
    }

    pub fn snapshot(&self) -> Vec<ApplicationRecord> {
        self.records.borrow().clone()
    }

    pub fn save_count(&self) -> usize {
        *self.saves.borrow()
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn load(&self) -> Result<Vec<ApplicationRecord>, LedgerError> {
        Ok(self.records.borrow().clone())
    }

    fn save(&self, records: &[ApplicationRecord]) -> Result<(), LedgerError> {
        *self.records.borrow_mut() = records.to_vec();
        *self.saves.borrow_mut() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn today() -> NaiveDate {
        date(2024, 3, 1)
    }

    fn record(company: &str, role: &str, status: Status, applied: NaiveDate) -> ApplicationRecord {
        ApplicationRecord {
            company: company.to_string(),
            applied_date: applied,
            role: role.to_string(),
            status,
            notes: None,
        }
    }

    #[test]
    fn test_reconcile_inserts_with_today_when_no_date() {
        let mut ledger = Ledger::default();
        let outcome = ledger.reconcile("Acme", "SWE", Status::Applied, "", None, today());

        assert_eq!(outcome, Reconciled::Inserted);
        assert_eq!(ledger.records(), &[record("Acme", "SWE", Status::Applied, today())]);
    }

    #[test]
    fn test_reconcile_inserts_with_supplied_date() {
        let mut ledger = Ledger::default();
        ledger.reconcile("Beta", "PM", Status::Applied, "", Some(date(2024, 1, 10)), today());
        assert_eq!(ledger.records()[0].applied_date, date(2024, 1, 10));
    }

    #[test]
    fn test_reconcile_is_case_insensitive() {
        let mut ledger = Ledger::default();
        ledger.reconcile("Acme Inc", "SWE", Status::Applied, "", None, today());
        let outcome = ledger.reconcile("ACME INC", "swe", Status::Interviewing, "", None, today());

        assert_eq!(outcome, Reconciled::Updated);
        assert_eq!(ledger.records().len(), 1);
        assert_eq!(ledger.records()[0].company, "Acme Inc");
        assert_eq!(ledger.records()[0].status, Status::Interviewing);
    }

    #[test]
    fn test_reconcile_never_lowers_rank() {
        let mut ledger = Ledger::new(vec![record("Beta", "PM", Status::Rejected, today())]);

        for status in [Status::Applied, Status::Interviewing, Status::Offer] {
            let outcome = ledger.reconcile("Beta", "PM", status, "", None, today());
            assert_eq!(outcome, Reconciled::Unchanged);
            assert_eq!(ledger.records()[0].status, Status::Rejected);
        }
    }

    #[test]
    fn test_reconcile_rejected_overrides_offer() {
        let mut ledger = Ledger::new(vec![record("Acme", "SWE", Status::Offer, today())]);
        let outcome = ledger.reconcile("Acme", "SWE", Status::Rejected, "", None, today());
        assert_eq!(outcome, Reconciled::Updated);
        assert_eq!(ledger.records()[0].status, Status::Rejected);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let mut ledger = Ledger::default();
        ledger.reconcile("Acme", "SWE", Status::Applied, "", None, today());
        ledger.reconcile("Acme", "SWE", Status::Interviewing, "", None, today());
        let after_first = ledger.records().to_vec();

        let outcome = ledger.reconcile("Acme", "SWE", Status::Interviewing, "", None, today());
        assert_eq!(outcome, Reconciled::Unchanged);
        assert_eq!(ledger.records(), after_first.as_slice());
    }

    #[test]
    fn test_reconcile_notes_overwrite_even_without_status_change() {
        let mut ledger = Ledger::new(vec![record("Beta", "PM", Status::Rejected, today())]);
        let outcome = ledger.reconcile("Beta", "PM", Status::Offer, "recruiter call", None, today());

        assert_eq!(outcome, Reconciled::Updated);
        assert_eq!(ledger.records()[0].status, Status::Rejected);
        assert_eq!(ledger.records()[0].notes.as_deref(), Some("recruiter call"));

        // Empty notes leave existing notes alone.
        ledger.reconcile("Beta", "PM", Status::Rejected, "", None, today());
        assert_eq!(ledger.records()[0].notes.as_deref(), Some("recruiter call"));
    }

    #[test]
    fn test_reconcile_keeps_applied_date() {
        let mut ledger = Ledger::new(vec![record("Acme", "SWE", Status::Applied, date(2024, 1, 2))]);
        ledger.reconcile("Acme", "SWE", Status::Offer, "", Some(date(2024, 2, 2)), today());
        assert_eq!(ledger.records()[0].applied_date, date(2024, 1, 2));
    }

    #[test]
    fn test_sort_for_save_newest_first_stable() {
        let mut ledger = Ledger::new(vec![
            record("A", "x", Status::Applied, date(2024, 1, 1)),
            record("B", "x", Status::Applied, date(2024, 2, 1)),
            record("C", "x", Status::Applied, date(2024, 1, 1)),
            record("D", "x", Status::Applied, date(2024, 2, 1)),
        ]);
        ledger.sort_for_save();

        let order: Vec<&str> = ledger.records().iter().map(|r| r.company.as_str()).collect();
        assert_eq!(order, vec!["B", "D", "A", "C"]);
    }

    #[test]
    fn test_persist_sorts_before_saving() {
        let store = MemoryLedgerStore::default();
        let mut ledger = Ledger::new(vec![
            record("Old", "x", Status::Applied, date(2023, 12, 1)),
            record("New", "x", Status::Applied, date(2024, 2, 1)),
        ]);
        ledger.persist(&store).unwrap();

        let saved = store.snapshot();
        assert!(saved.windows(2).all(|w| w[0].applied_date >= w[1].applied_date));
        assert_eq!(store.save_count(), 1);
    }

    #[test]
    fn test_csv_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvLedgerStore::new(dir.path().join("ledger.csv"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_csv_store_writes_expected_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.csv");
        let store = CsvLedgerStore::new(path.clone());

        let mut with_notes = record("Beta, Inc", "PM", Status::Rejected, date(2024, 1, 10));
        with_notes.notes = Some("final".to_string());
        store
            .save(&[record("Acme", "SWE", Status::Applied, date(2024, 3, 1)), with_notes])
            .unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Company Name,Application Date,Role,Status,Notes");
        assert_eq!(lines[1], "Acme,2024-03-01,SWE,Applied,");
        assert_eq!(lines[2], "\"Beta, Inc\",2024-01-10,PM,Rejected,final");
    }

    #[test]
    fn test_csv_store_load_after_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvLedgerStore::new(dir.path().join("ledger.csv"));
        let records = vec![
            record("Acme", "SWE", Status::Interviewing, date(2024, 3, 1)),
            record("Beta", "PM", Status::Offer, date(2024, 1, 10)),
        ];
        store.save(&records).unwrap();
        assert_eq!(store.load().unwrap(), records);
    }

    #[test]
    fn test_csv_store_empty_ledger_has_header() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvLedgerStore::new(dir.path().join("ledger.csv"));
        store.save(&[]).unwrap();

        let text = fs::read_to_string(store.path()).unwrap();
        assert_eq!(text.trim_end(), "Company Name,Application Date,Role,Status,Notes");
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_csv_store_rejects_malformed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.csv");
        fs::write(
            &path,
            "Company Name,Application Date,Role,Status,Notes\nAcme,yesterday,SWE,Applied,\n",
        )
        .unwrap();

        let err = CsvLedgerStore::new(path).load().unwrap_err();
        assert!(matches!(err, LedgerError::Read { .. }));
    }
}
