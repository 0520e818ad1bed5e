//! End-to-end scenarios driven through the Local adapter: a full
//! backup/restore round trip and checksum drift detection. Both shell out to
//! the same tools production runs use, so they skip when those are absent.

use std::path::Path;
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use instance_manager::app::{Application, SameLocation};
use instance_manager::models::instance::{self, AccessRecord, CreateInstance};
use instance_manager::{
    db, Access, BackupEngine, BackupOptions, ChecksumEngine, Config, Instance, RestoreEngine,
    TargetType,
};

struct WebsiteApp;

impl Application for WebsiteApp {
    fn name(&self) -> &str {
        "website"
    }

    fn file_locations(&self, instance: &Instance) -> Vec<(TargetType, String)> {
        vec![(TargetType::App, instance.webroot.clone())]
    }

    fn backup_database(
        &self,
        _instance: &Instance,
        _access: &Arc<Mutex<Access>>,
    ) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    fn is_installed(
        &self,
        _instance: &Instance,
        _access: &Arc<Mutex<Access>>,
    ) -> anyhow::Result<bool> {
        Ok(true)
    }
}

fn fixture(temp: &TempDir, webroot: &Path) -> (db::DbPool, Config, Instance) {
    let pool = db::connection::create_memory_pool().unwrap();
    let conn = pool.get().unwrap();
    db::migrate(&conn).unwrap();
    let created = instance::create(
        &conn,
        &CreateInstance {
            name: "mysite".into(),
            contact: "ops@example.org".into(),
            webroot: webroot.to_string_lossy().into_owned(),
            weburl: "https://example.org".into(),
            tempdir: temp.path().join("work").to_string_lossy().into_owned(),
            interpreter: String::new(),
            transport: "local".into(),
        },
    )
    .unwrap();
    instance::register_access(
        &conn,
        &AccessRecord {
            instance_id: created.id,
            kind: "local".into(),
            host: "localhost".into(),
            user: String::new(),
            port: 0,
            password: None,
        },
    )
    .unwrap();
    let config = Config::with_data_dir(temp.path().join("data"));
    (pool, config, created)
}

fn tools_available(tools: &[&str]) -> bool {
    let probe = tools
        .iter()
        .map(|t| format!("command -v {t}"))
        .collect::<Vec<_>>()
        .join(" && ");
    std::process::Command::new("sh")
        .args(["-c", &probe])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[test]
fn test_backup_then_restore_roundtrip() {
    // Restore collects a post-restore baseline, so the hash pipeline tools
    // are needed alongside the archive tools.
    if !tools_available(&["tar", "bzip2", "rsync", "find", "xargs", "md5sum", "sed"]) {
        eprintln!("required shell tools unavailable; skipping");
        return;
    }

    let temp = TempDir::new().unwrap();
    let webroot = temp.path().join("site");
    std::fs::create_dir_all(webroot.join("img")).unwrap();
    std::fs::write(webroot.join("index.html"), b"original").unwrap();
    std::fs::write(webroot.join("img/logo.png"), b"png").unwrap();
    std::fs::write(webroot.join(".htaccess"), b"Deny from all").unwrap();

    let (pool, config, mut inst) = fixture(&temp, &webroot);
    let mut conn = pool.get().unwrap();

    let mut backup = BackupEngine::new(config.clone());
    let outcome = backup
        .run(&conn, &inst, &WebsiteApp, &BackupOptions::default())
        .unwrap();
    let archive = outcome.archive.expect("archive produced");
    assert!(archive.is_file());
    assert!(archive
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with(&format!("{}-mysite_", inst.id)));

    // Damage the live tree: modify, add, and tweak endpoint-local config.
    std::fs::write(webroot.join("index.html"), b"tampered").unwrap();
    std::fs::write(webroot.join("stray.txt"), b"stray").unwrap();
    std::fs::write(webroot.join(".htaccess"), b"local tweak").unwrap();

    let restore = RestoreEngine::new(config.clone());
    let recorded = restore
        .run(&mut conn, &mut inst, &WebsiteApp, None, &SameLocation, &archive)
        .unwrap();

    assert_eq!(std::fs::read(webroot.join("index.html")).unwrap(), b"original");
    assert_eq!(std::fs::read(webroot.join("img/logo.png")).unwrap(), b"png");
    // Additions are deleted, endpoint-local config survives the restore.
    assert!(!webroot.join("stray.txt").exists());
    assert_eq!(std::fs::read(webroot.join(".htaccess")).unwrap(), b"local tweak");

    let latest = instance_manager::models::version::latest_for_instance(&conn, inst.id)
        .unwrap()
        .unwrap();
    assert_eq!(latest.id, recorded.id);

    // The application tag was reassigned and persisted.
    let reloaded = instance::find_by_id(&conn, inst.id).unwrap().unwrap();
    assert_eq!(reloaded.app.as_deref(), Some("website"));

    // The restored version carries a live checksum baseline.
    let baseline =
        instance_manager::models::version::file_map(&conn, recorded.id).unwrap();
    assert!(baseline.contains_key("index.html"));

    // Endpoint scratch and the uploaded archive are cleaned up.
    assert!(!temp.path().join("work/restore").exists());
    let work_leftovers = temp
        .path()
        .join("work")
        .read_dir()
        .map(|d| d.filter_map(|e| e.ok()).count())
        .unwrap_or(0);
    assert_eq!(work_leftovers, 0);
}

#[test]
fn test_checksum_drift_detection() {
    if !tools_available(&["find", "xargs", "md5sum", "sed"]) {
        eprintln!("hash pipeline tools unavailable; skipping");
        return;
    }

    let temp = TempDir::new().unwrap();
    let webroot = temp.path().join("site");
    std::fs::create_dir_all(webroot.join("inc")).unwrap();
    std::fs::write(webroot.join("index.html"), b"one").unwrap();
    std::fs::write(webroot.join("inc/lib.php"), b"two").unwrap();
    std::fs::write(webroot.join("doomed.txt"), b"three").unwrap();

    let (pool, config, inst) = fixture(&temp, &webroot);
    let mut conn = pool.get().unwrap();

    let engine = ChecksumEngine::new(config);
    let count = engine.collect(&mut conn, &inst).unwrap();
    assert_eq!(count, 3);

    // No changes yet: the check must come back clean.
    let report = engine.check(&conn, &inst).unwrap();
    assert!(report.is_clean(), "unexpected drift: {report:?}");

    std::fs::write(webroot.join("index.html"), b"changed").unwrap();
    std::fs::write(webroot.join("fresh.css"), b"new file").unwrap();
    std::fs::remove_file(webroot.join("doomed.txt")).unwrap();

    let report = engine.check(&conn, &inst).unwrap();
    assert_eq!(report.change_count(), 3);
    assert!(report.new.contains_key("fresh.css"));
    assert!(report.modified.contains_key("index.html"));
    assert_eq!(report.deleted, vec!["doomed.txt".to_string()]);

    // Re-collecting adopts the current tree as the new baseline.
    engine.collect(&mut conn, &inst).unwrap();
    assert!(engine.check(&conn, &inst).unwrap().is_clean());
}
