use std::collections::BTreeMap;

use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

/// A recorded install state of an Instance. Versions are append-only
/// history; the latest one defines "currently installed".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    pub id: i64,
    pub instance_id: i64,
    pub vcs_type: Option<String>,
    pub branch: Option<String>,
    pub revision: Option<String>,
    pub date: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewVersion {
    pub vcs_type: Option<String>,
    pub branch: Option<String>,
    pub revision: Option<String>,
    pub date: Option<String>,
}

impl NewVersion {
    /// Provenance carried over from an existing Version, used by restore
    /// bookkeeping.
    pub fn inheriting(prior: &Version) -> Self {
        Self {
            vcs_type: prior.vcs_type.clone(),
            branch: prior.branch.clone(),
            revision: prior.revision.clone(),
            date: prior.date.clone(),
        }
    }
}

fn row_to_version(row: &Row) -> rusqlite::Result<Version> {
    Ok(Version {
        id: row.get("version_id")?,
        instance_id: row.get("instance_id")?,
        vcs_type: row.get("type")?,
        branch: row.get("branch")?,
        revision: row.get("revision")?,
        date: row.get("date")?,
    })
}

pub fn find_by_id(conn: &Connection, id: i64) -> anyhow::Result<Option<Version>> {
    let mut stmt = conn.prepare("SELECT * FROM version WHERE version_id = ?")?;
    let mut rows = stmt.query_map(params![id], |row| row_to_version(row))?;
    Ok(rows.next().and_then(|r| r.ok()))
}

pub fn latest_for_instance(conn: &Connection, instance_id: i64) -> anyhow::Result<Option<Version>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM version WHERE instance_id = ? ORDER BY version_id DESC LIMIT 1",
    )?;
    let mut rows = stmt.query_map(params![instance_id], |row| row_to_version(row))?;
    Ok(rows.next().and_then(|r| r.ok()))
}

pub fn create(conn: &Connection, instance_id: i64, data: &NewVersion) -> anyhow::Result<Version> {
    let date = data
        .date
        .clone()
        .unwrap_or_else(|| chrono::Local::now().format("%Y-%m-%d").to_string());
    conn.execute(
        "INSERT INTO version (instance_id, type, branch, revision, date)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![instance_id, data.vcs_type, data.branch, data.revision, date],
    )?;
    let id = conn.last_insert_rowid();
    find_by_id(conn, id)?.ok_or_else(|| anyhow::anyhow!("failed to retrieve created version"))
}

/// The version's stored checksum baseline: relative path to content hash.
pub fn file_map(conn: &Connection, version_id: i64) -> anyhow::Result<BTreeMap<String, String>> {
    let mut stmt = conn.prepare("SELECT path, hash FROM file WHERE version_id = ?")?;
    let rows = stmt.query_map(params![version_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn has_checksums(conn: &Connection, version_id: i64) -> anyhow::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM file WHERE version_id = ?",
        params![version_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Replace the version's file map wholesale, in one transaction.
pub fn replace_file_map(
    conn: &mut Connection,
    version_id: i64,
    map: &BTreeMap<String, String>,
) -> anyhow::Result<()> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM file WHERE version_id = ?", params![version_id])?;
    {
        let mut stmt =
            tx.prepare("INSERT INTO file (version_id, path, hash) VALUES (?1, ?2, ?3)")?;
        for (path, hash) in map {
            stmt.execute(params![version_id, path, hash])?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Copy the full file map of a prior version onto a new one. Used when no
/// drift is expected, e.g. immediately after a restore.
pub fn replicate_file_map(conn: &Connection, new_id: i64, old_id: i64) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO file (version_id, path, hash)
         SELECT ?1, path, hash FROM file WHERE version_id = ?2",
        params![new_id, old_id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::instance::{self, CreateInstance};

    fn fixture() -> (db::DbPool, i64) {
        let pool = db::connection::create_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        db::migrate(&conn).unwrap();
        let inst = instance::create(
            &conn,
            &CreateInstance {
                name: "site".into(),
                contact: String::new(),
                webroot: "/var/www".into(),
                weburl: String::new(),
                tempdir: "/tmp".into(),
                interpreter: String::new(),
                transport: "local".into(),
            },
        )
        .unwrap();
        (pool, inst.id)
    }

    #[test]
    fn test_latest_version_is_append_only_history() {
        let (pool, instance_id) = fixture();
        let conn = pool.get().unwrap();

        let v1 = create(&conn, instance_id, &NewVersion::default()).unwrap();
        let v2 = create(
            &conn,
            instance_id,
            &NewVersion {
                branch: Some("21.x".into()),
                ..Default::default()
            },
        )
        .unwrap();

        let latest = latest_for_instance(&conn, instance_id).unwrap().unwrap();
        assert_eq!(latest.id, v2.id);
        assert_ne!(latest.id, v1.id);
        assert_eq!(latest.branch.as_deref(), Some("21.x"));
    }

    #[test]
    fn test_replace_file_map_discards_prior_entries() {
        let (pool, instance_id) = fixture();
        let mut conn = pool.get().unwrap();
        let version = create(&conn, instance_id, &NewVersion::default()).unwrap();

        let first: BTreeMap<_, _> = [("a.txt".to_string(), "h1".to_string())].into();
        replace_file_map(&mut conn, version.id, &first).unwrap();
        let second: BTreeMap<_, _> = [("b.txt".to_string(), "h2".to_string())].into();
        replace_file_map(&mut conn, version.id, &second).unwrap();

        assert_eq!(file_map(&conn, version.id).unwrap(), second);
    }

    #[test]
    fn test_replicate_copies_full_map() {
        let (pool, instance_id) = fixture();
        let mut conn = pool.get().unwrap();
        let old = create(&conn, instance_id, &NewVersion::default()).unwrap();
        let map: BTreeMap<_, _> = [
            ("a.txt".to_string(), "h1".to_string()),
            ("b.txt".to_string(), "h2".to_string()),
        ]
        .into();
        replace_file_map(&mut conn, old.id, &map).unwrap();

        let new = create(&conn, instance_id, &NewVersion::inheriting(&old)).unwrap();
        replicate_file_map(&conn, new.id, old.id).unwrap();

        assert!(has_checksums(&conn, new.id).unwrap());
        assert_eq!(file_map(&conn, new.id).unwrap(), map);
    }
}
