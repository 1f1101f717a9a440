// ABOUTME: Report file for order numbers that recovery gave up on
// ABOUTME: Lines are `table,source,order_number`; the next start redoes them

use anyhow::{Context, Result};
use cachenotify_core::{OrderNumber, SourceId};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub struct UnprocessedOrderReport {
    path: PathBuf,
    // Serializes appends from concurrent source tasks.
    write_lock: Mutex<()>,
}

impl UnprocessedOrderReport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn work_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".work");
        PathBuf::from(name)
    }

    pub fn append(&self, source: SourceId, order_numbers: &[OrderNumber]) -> Result<()> {
        if order_numbers.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock();
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating report directory {:?}", parent))?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening report {:?}", self.path))?;
        let table = source.table_name();
        let label = source.label();
        for n in order_numbers {
            writeln!(file, "{table},{label},{n}")?;
        }
        Ok(())
    }

    /// Moves any existing report aside, reads it and deletes it.
    ///
    /// Returns the order numbers per table name. Malformed lines are skipped.
    pub fn load_and_consume(&self) -> Result<HashMap<String, BTreeSet<OrderNumber>>> {
        let _guard = self.write_lock.lock();
        let work = self.work_path();
        if self.path.exists() && work.exists() {
            // A crash left the previous work file behind; fold the new report into it.
            let pending = fs::read_to_string(&self.path)
                .with_context(|| format!("reading {:?}", self.path))?;
            let mut file = OpenOptions::new()
                .append(true)
                .open(&work)
                .with_context(|| format!("opening {:?}", work))?;
            writeln!(file)?;
            file.write_all(pending.as_bytes())?;
            file.sync_all()?;
            fs::remove_file(&self.path)
                .with_context(|| format!("removing {:?}", self.path))?;
            info!(path = ?self.path, work = ?work, "unprocessed order report merged into leftover work file");
        } else if self.path.exists() {
            fs::rename(&self.path, &work)
                .with_context(|| format!("renaming {:?} to {:?}", self.path, work))?;
            info!(path = ?self.path, work = ?work, "unprocessed order report found");
        } else if !work.exists() {
            return Ok(HashMap::new());
        }

        let text =
            fs::read_to_string(&work).with_context(|| format!("reading {:?}", work))?;
        let mut by_table: HashMap<String, BTreeSet<OrderNumber>> = HashMap::new();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            match fields.as_slice() {
                [table, _label, order] => match order.parse::<OrderNumber>() {
                    Ok(n) => {
                        by_table.entry(table.to_string()).or_default().insert(n);
                    }
                    Err(_) => warn!(line = line_no + 1, "bad order number in report"),
                },
                _ => warn!(line = line_no + 1, "malformed report line"),
            }
        }
        fs::remove_file(&work).with_context(|| format!("removing {:?}", work))?;
        Ok(by_table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachenotify_core::EntityType;
    use tempfile::TempDir;

    #[test]
    fn appended_numbers_are_redone_once() {
        let dir = TempDir::new().unwrap();
        let report = UnprocessedOrderReport::new(dir.path().join("unprocessed.log"));
        let fare = SourceId::current(EntityType::Fare);
        let rule_hist = SourceId::new(EntityType::Rule, true);

        report.append(fare, &[3, 9]).unwrap();
        report.append(rule_hist, &[11]).unwrap();
        let text = fs::read_to_string(report.path()).unwrap();
        assert!(text.contains("FareCacheNotify,Fare,3"));
        assert!(text.contains("RuleCacheNotifyHistorical,RuleHist,11"));

        let redo = report.load_and_consume().unwrap();
        assert_eq!(redo["FareCacheNotify"], BTreeSet::from([3, 9]));
        assert_eq!(redo["RuleCacheNotifyHistorical"], BTreeSet::from([11]));
        assert!(!report.path().exists());

        assert!(report.load_and_consume().unwrap().is_empty());
    }

    #[test]
    fn leftover_work_file_is_consumed() {
        let dir = TempDir::new().unwrap();
        let report = UnprocessedOrderReport::new(dir.path().join("unprocessed.log"));
        fs::write(
            dir.path().join("unprocessed.log.work"),
            "FareCacheNotify,Fare,5\ngarbage\nFareCacheNotify,Fare,x\n",
        )
        .unwrap();

        let redo = report.load_and_consume().unwrap();
        assert_eq!(redo.len(), 1);
        assert_eq!(redo["FareCacheNotify"], BTreeSet::from([5]));
        assert!(!dir.path().join("unprocessed.log.work").exists());
    }

    #[test]
    fn leftover_work_file_is_merged_with_new_report() {
        let dir = TempDir::new().unwrap();
        let report = UnprocessedOrderReport::new(dir.path().join("unprocessed.log"));
        let fare = SourceId::current(EntityType::Fare);
        fs::write(
            dir.path().join("unprocessed.log.work"),
            "FareCacheNotify,Fare,5\nRuleCacheNotify,Rule,8",
        )
        .unwrap();
        report.append(fare, &[6]).unwrap();

        let redo = report.load_and_consume().unwrap();
        assert_eq!(redo["FareCacheNotify"], BTreeSet::from([5, 6]));
        assert_eq!(redo["RuleCacheNotify"], BTreeSet::from([8]));
        assert!(!report.path().exists());
        assert!(!dir.path().join("unprocessed.log.work").exists());
    }
}
