//! Age-based space reclamation keyed on dates embedded in entry names
//!
//! Only top-level entries whose name starts with the configured prefix and
//! carries a `_YYMMDD` (or `_YYYYMMDD`) token are ever touched.

use crate::logger::Logger;
use crate::storage::{SpaceProbe, StoragePool, GB};
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Outright deletion of old entries on a storage volume
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub prefix: String,
    pub delete_after_days: i64,
}

/// Template areas: old entries go, middle-aged directories lose their
/// large files only.
#[derive(Debug, Clone)]
pub struct TemplatePolicy {
    pub prefix: String,
    pub strip_after_days: i64,
    pub delete_after_days: i64,
    pub strip_min_bytes: u64,
    pub min_free_gb: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvictionReport {
    pub deleted: Vec<PathBuf>,
    pub stripped: Vec<PathBuf>,
}

/// Date carried by the right-most `_`-separated token whose leading digit run
/// is 6 (`YYMMDD`) or 8 (`YYYYMMDD`) digits long.
pub fn embedded_date(name: &str) -> Option<NaiveDate> {
    let mut tokens = name.split('_');
    tokens.next()?;
    let tokens: Vec<&str> = tokens.collect();
    tokens.iter().rev().find_map(|tok| {
        let digits: String = tok.chars().take_while(|c| c.is_ascii_digit()).collect();
        match digits.len() {
            6 => NaiveDate::parse_from_str(&format!("20{digits}"), "%Y%m%d").ok(),
            8 => NaiveDate::parse_from_str(&digits, "%Y%m%d").ok(),
            _ => None,
        }
    })
}

/// Age in days of a top-level entry, `None` when it does not follow the
/// naming convention.
fn entry_age(name: &str, prefix: &str, today: NaiveDate) -> Option<i64> {
    if !name.starts_with(prefix) {
        return None;
    }
    embedded_date(name).map(|d| (today - d).num_days())
}

fn top_level(root: &Path) -> impl Iterator<Item = walkdir::DirEntry> {
    WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
}

fn remove_entry(path: &Path, is_dir: bool, logger: &dyn Logger) -> bool {
    let res = if is_dir {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match res {
        Ok(()) => {
            logger.deleted(path);
            true
        }
        Err(e) => {
            logger.fault("eviction", &format!("failed to remove <{}>: {e}", path.display()));
            false
        }
    }
}

/// Delete every conforming entry under `root` older than the retention window
pub fn evict_volume(
    root: &Path,
    policy: &RetentionPolicy,
    today: NaiveDate,
    logger: &dyn Logger,
) -> EvictionReport {
    let mut report = EvictionReport::default();
    for entry in top_level(root) {
        let name = entry.file_name().to_string_lossy();
        let Some(age) = entry_age(&name, &policy.prefix, today) else {
            continue;
        };
        if age > policy.delete_after_days
            && remove_entry(entry.path(), entry.file_type().is_dir(), logger)
        {
            report.deleted.push(entry.path().to_path_buf());
        }
    }
    report
}

/// Remove regular files larger than `min_bytes` directly inside `dir`
fn strip_large_files(dir: &Path, min_bytes: u64, logger: &dyn Logger) -> Vec<PathBuf> {
    let mut removed = Vec::new();
    for entry in top_level(dir) {
        if !entry.file_type().is_file() {
            continue;
        }
        let big = entry.metadata().map(|m| m.len() > min_bytes).unwrap_or(false);
        if big && remove_entry(entry.path(), false, logger) {
            removed.push(entry.path().to_path_buf());
        }
    }
    removed
}

/// Clean one template area
pub fn clean_template_area(
    root: &Path,
    policy: &TemplatePolicy,
    today: NaiveDate,
    logger: &dyn Logger,
) -> EvictionReport {
    let mut report = EvictionReport::default();
    for entry in top_level(root) {
        let name = entry.file_name().to_string_lossy();
        let Some(age) = entry_age(&name, &policy.prefix, today) else {
            continue;
        };
        let is_dir = entry.file_type().is_dir();
        if age > policy.delete_after_days || (!is_dir && age > policy.strip_after_days) {
            if remove_entry(entry.path(), is_dir, logger) {
                report.deleted.push(entry.path().to_path_buf());
            }
        } else if is_dir && age > policy.strip_after_days {
            report
                .stripped
                .extend(strip_large_files(entry.path(), policy.strip_min_bytes, logger));
        }
    }
    report
}

/// Rotate to an eligible volume; when none qualifies, evict the volume after
/// the current one, then rotate again. If rotation still fails the cleaned
/// volume becomes current anyway so ingestion never stalls.
pub fn free_storage(
    pool: &StoragePool,
    policy: &RetentionPolicy,
    today: NaiveDate,
    logger: &dyn Logger,
) -> EvictionReport {
    if pool.rotate().is_some() {
        return EvictionReport::default();
    }
    let target = (pool.current_index() + 1) % pool.len();
    let root = pool.volume(target).to_path_buf();
    logger.warn(&format!(
        "no volume has enough free capacity; cleaning <{}> for LocalStorage",
        root.display()
    ));
    let report = evict_volume(&root, policy, today, logger);
    match pool.available(target) {
        Ok(bytes) => logger.info(&format!(
            "free capacity of <{}> is {} GB",
            root.display(),
            bytes / GB
        )),
        Err(e) => logger.fault("eviction", &format!("cannot query <{}>: {e}", root.display())),
    }
    if pool.rotate().is_none() {
        pool.activate(target);
    }
    report
}

/// Clean all template areas when the first one runs low on space
pub fn free_template(
    paths: &[PathBuf],
    policy: &TemplatePolicy,
    probe: &dyn SpaceProbe,
    today: NaiveDate,
    logger: &dyn Logger,
) -> EvictionReport {
    let mut report = EvictionReport::default();
    let Some(first) = paths.first() else {
        return report;
    };
    let free = match probe.available(first) {
        Ok(b) => b,
        Err(e) => {
            logger.fault("eviction", &format!("cannot query <{}>: {e}", first.display()));
            return report;
        }
    };
    if free > policy.min_free_gb.saturating_mul(GB) {
        return report;
    }
    for root in paths {
        logger.info(&format!("Cleaning <{}> for Template", root.display()));
        let r = clean_template_area(root, policy, today, logger);
        report.deleted.extend(r.deleted);
        report.stripped.extend(r.stripped);
    }
    if let Some(last) = paths.last() {
        if let Ok(b) = probe.available(last) {
            logger.info(&format!("free capacity for template is {} GB", b / GB));
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::{MemoryLogger, NoopLogger};
    use crate::storage::tests::FakeProbe;
    use chrono::Duration;
    use std::fs;
    use std::sync::Arc;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2019, 4, 20).unwrap()
    }

    fn days_ago(n: i64) -> String {
        (today() - Duration::days(n)).format("%y%m%d").to_string()
    }

    fn policy() -> RetentionPolicy {
        RetentionPolicy {
            prefix: "G".into(),
            delete_after_days: 3,
        }
    }

    #[test]
    fn parses_embedded_dates() {
        assert_eq!(embedded_date("G021_ID_190412"), NaiveDate::from_ymd_opt(2019, 4, 12));
        assert_eq!(embedded_date("G021_obj_190412.fit"), NaiveDate::from_ymd_opt(2019, 4, 12));
        assert_eq!(embedded_date("G021_20190412_0001.fit"), NaiveDate::from_ymd_opt(2019, 4, 12));
        assert_eq!(embedded_date("G021_ID_191342"), None);
        assert_eq!(embedded_date("190412"), None);
        assert_eq!(embedded_date("G021_obj"), None);
    }

    #[test]
    fn evicts_only_conforming_old_entries() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let old_dir = root.join(format!("G011_{}", days_ago(5)));
        let old_file = root.join(format!("G011_x_{}.fit", days_ago(4)));
        let fresh = root.join(format!("G011_{}", days_ago(1)));
        let edge = root.join(format!("G011_{}", days_ago(3)));
        let foreign = root.join(format!("X011_{}", days_ago(30)));
        let undated = root.join("G011_calibration");
        for d in [&old_dir, &fresh, &edge, &foreign, &undated] {
            fs::create_dir_all(d).unwrap();
            fs::write(d.join("a.fit"), b"data").unwrap();
        }
        fs::write(&old_file, b"data").unwrap();

        let log = MemoryLogger::default();
        let report = evict_volume(root, &policy(), today(), &log);

        assert_eq!(report.deleted.len(), 2);
        assert!(!old_dir.exists());
        assert!(!old_file.exists());
        assert!(fresh.exists());
        assert!(edge.exists());
        assert!(foreign.exists());
        assert!(undated.exists());
        assert!(log.contains("DELETE"));
    }

    #[test]
    fn template_cleanup_strips_middle_aged_directories() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let ancient = root.join(format!("G011_{}", days_ago(12)));
        let middle = root.join(format!("G011_{}", days_ago(5)));
        let old_file = root.join(format!("G011_ref_{}.fit", days_ago(5)));
        let recent = root.join(format!("G011_{}", days_ago(1)));
        for d in [&ancient, &middle, &recent] {
            fs::create_dir_all(d).unwrap();
        }
        fs::write(middle.join("big.fit"), vec![0u8; 200 * 1024]).unwrap();
        fs::write(middle.join("small.txt"), b"keep").unwrap();
        fs::write(recent.join("big.fit"), vec![0u8; 200 * 1024]).unwrap();
        fs::write(&old_file, b"x").unwrap();

        let policy = TemplatePolicy {
            prefix: "G".into(),
            strip_after_days: 3,
            delete_after_days: 10,
            strip_min_bytes: 100 * 1024,
            min_free_gb: 1000,
        };
        let report = clean_template_area(root, &policy, today(), &NoopLogger);

        assert!(!ancient.exists());
        assert!(!old_file.exists());
        assert!(middle.exists());
        assert!(!middle.join("big.fit").exists());
        assert!(middle.join("small.txt").exists());
        assert!(recent.join("big.fit").exists());
        assert_eq!(report.deleted.len(), 2);
        assert_eq!(report.stripped, vec![middle.join("big.fit")]);
    }

    #[test]
    fn free_template_skips_when_space_is_plentiful() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join(format!("G011_{}", days_ago(20)));
        fs::create_dir_all(&old).unwrap();
        let probe = FakeProbe::default();
        probe.free.lock().insert(dir.path().to_path_buf(), 5000 * GB);
        let policy = TemplatePolicy {
            prefix: "G".into(),
            strip_after_days: 3,
            delete_after_days: 10,
            strip_min_bytes: 100 * 1024,
            min_free_gb: 1000,
        };
        let paths = vec![dir.path().to_path_buf()];

        let r = free_template(&paths, &policy, &probe, today(), &NoopLogger);
        assert!(r.deleted.is_empty());
        assert!(old.exists());

        probe.free.lock().insert(dir.path().to_path_buf(), 10 * GB);
        let r = free_template(&paths, &policy, &probe, today(), &NoopLogger);
        assert_eq!(r.deleted, vec![old.clone()]);
    }

    #[test]
    fn exhausted_pool_evicts_next_volume_and_switches_to_it() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let stale = b.path().join(format!("G011_{}", days_ago(9)));
        fs::create_dir_all(&stale).unwrap();

        let probe = Arc::new(FakeProbe::default());
        probe.free.lock().insert(a.path().to_path_buf(), 10 * GB);
        probe.free.lock().insert(b.path().to_path_buf(), 20 * GB);
        let log = Arc::new(MemoryLogger::default());
        let pool = StoragePool::new(
            vec![a.path().to_path_buf(), b.path().to_path_buf()],
            0,
            100,
            probe,
            log.clone(),
        )
        .unwrap();

        let report = free_storage(&pool, &policy(), today(), log.as_ref());
        assert_eq!(report.deleted, vec![stale.clone()]);
        assert!(!stale.exists());
        assert_eq!(pool.current_index(), 1);
        assert!(log.contains("free capacity of"));
        assert!(log.contains("STORAGE"));
    }

    #[test]
    fn eligible_pool_rotates_without_eviction() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let stale = b.path().join(format!("G011_{}", days_ago(9)));
        fs::create_dir_all(&stale).unwrap();
        let probe = Arc::new(FakeProbe::default());
        probe.free.lock().insert(a.path().to_path_buf(), 10 * GB);
        probe.free.lock().insert(b.path().to_path_buf(), 300 * GB);
        let pool = StoragePool::new(
            vec![a.path().to_path_buf(), b.path().to_path_buf()],
            0,
            100,
            probe,
            Arc::new(NoopLogger),
        )
        .unwrap();

        let report = free_storage(&pool, &policy(), today(), &NoopLogger);
        assert!(report.deleted.is_empty());
        assert!(stale.exists());
        assert_eq!(pool.current_index(), 1);
    }
}
