use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::access::{Access, Capability};

/// One managed remote (or local) installation.
#[derive(Debug, Serialize, Deserialize)]
pub struct Instance {
    pub id: i64,
    pub name: String,
    pub contact: String,
    pub webroot: String,
    pub weburl: String,
    pub tempdir: String,
    pub interpreter: String,
    pub app: Option<String>,
    pub transport: String,

    /// Lazily resolved Access handles, one per capability, alive for the
    /// process lifetime.
    #[serde(skip)]
    pub(crate) access_cache: Mutex<HashMap<Capability, Arc<Mutex<Access>>>>,
}

impl Instance {
    /// Path under the web root, with `/./` segments collapsed.
    pub fn web_path(&self, relative: &str) -> String {
        let path = format!("{}/{}", self.webroot.trim_end_matches('/'), relative);
        path.replace("/./", "/")
    }

    /// Path under the remote temp directory.
    pub fn work_path(&self, relative: &str) -> String {
        format!("{}/{}", self.tempdir.trim_end_matches('/'), relative)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateInstance {
    pub name: String,
    #[serde(default)]
    pub contact: String,
    pub webroot: String,
    #[serde(default)]
    pub weburl: String,
    pub tempdir: String,
    #[serde(default)]
    pub interpreter: String,
    pub transport: String,
}

/// Registered transport endpoint for one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRecord {
    pub instance_id: i64,
    pub kind: String,
    pub host: String,
    pub user: String,
    pub port: u16,
    pub password: Option<String>,
}

fn row_to_instance(row: &Row) -> rusqlite::Result<Instance> {
    Ok(Instance {
        id: row.get("instance_id")?,
        name: row.get("name")?,
        contact: row.get("contact")?,
        webroot: row.get("webroot")?,
        weburl: row.get("weburl")?,
        tempdir: row.get("tempdir")?,
        interpreter: row.get("interpreter")?,
        app: row.get("app")?,
        transport: row.get("transport")?,
        access_cache: Mutex::new(HashMap::new()),
    })
}

pub fn find_all(conn: &Connection) -> anyhow::Result<Vec<Instance>> {
    let mut stmt = conn.prepare("SELECT * FROM instance ORDER BY instance_id")?;
    let rows = stmt.query_map([], |row| row_to_instance(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn find_by_id(conn: &Connection, id: i64) -> anyhow::Result<Option<Instance>> {
    let mut stmt = conn.prepare("SELECT * FROM instance WHERE instance_id = ?")?;
    let mut rows = stmt.query_map(params![id], |row| row_to_instance(row))?;
    Ok(rows.next().and_then(|r| r.ok()))
}

pub fn create(conn: &Connection, data: &CreateInstance) -> anyhow::Result<Instance> {
    conn.execute(
        "INSERT INTO instance (name, contact, webroot, weburl, tempdir, interpreter, transport)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            data.name,
            data.contact,
            data.webroot,
            data.weburl,
            data.tempdir,
            data.interpreter,
            data.transport
        ],
    )?;
    let id = conn.last_insert_rowid();
    find_by_id(conn, id)?.ok_or_else(|| anyhow::anyhow!("failed to retrieve created instance"))
}

pub fn update(conn: &Connection, instance: &Instance) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE instance
         SET name = ?1, contact = ?2, webroot = ?3, weburl = ?4, tempdir = ?5,
             interpreter = ?6, app = ?7, transport = ?8
         WHERE instance_id = ?9",
        params![
            instance.name,
            instance.contact,
            instance.webroot,
            instance.weburl,
            instance.tempdir,
            instance.interpreter,
            instance.app,
            instance.transport,
            instance.id
        ],
    )?;
    Ok(())
}

/// Remove the instance and everything hanging off it: access records,
/// versions and their file maps, extra backup locations, properties.
pub fn delete(conn: &Connection, id: i64) -> anyhow::Result<bool> {
    conn.execute("DELETE FROM access WHERE instance_id = ?", params![id])?;
    conn.execute("DELETE FROM backup_location WHERE instance_id = ?", params![id])?;
    conn.execute(
        "DELETE FROM file WHERE version_id IN
           (SELECT version_id FROM version WHERE instance_id = ?)",
        params![id],
    )?;
    conn.execute("DELETE FROM version WHERE instance_id = ?", params![id])?;
    conn.execute("DELETE FROM property WHERE instance_id = ?", params![id])?;
    let changes = conn.execute("DELETE FROM instance WHERE instance_id = ?", params![id])?;
    Ok(changes > 0)
}

pub fn get_prop(conn: &Connection, id: i64, key: &str) -> anyhow::Result<Option<String>> {
    let mut stmt =
        conn.prepare("SELECT value FROM property WHERE instance_id = ? AND key = ?")?;
    let mut rows = stmt.query_map(params![id, key], |row| row.get::<_, String>(0))?;
    Ok(rows.next().and_then(|r| r.ok()))
}

pub fn set_prop(conn: &Connection, id: i64, key: &str, value: &str) -> anyhow::Result<()> {
    conn.execute(
        "REPLACE INTO property (instance_id, key, value) VALUES (?1, ?2, ?3)",
        params![id, key, value],
    )?;
    Ok(())
}

/// Instance-level extra backup paths, localized alongside the application's
/// own directories and tagged "data".
pub fn extra_backups(conn: &Connection, id: i64) -> anyhow::Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT location FROM backup_location WHERE instance_id = ?")?;
    let rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn set_extra_backups(conn: &Connection, id: i64, paths: &[String]) -> anyhow::Result<()> {
    conn.execute("DELETE FROM backup_location WHERE instance_id = ?", params![id])?;
    for path in paths.iter().filter(|p| !p.is_empty()) {
        conn.execute(
            "INSERT INTO backup_location (instance_id, location) VALUES (?1, ?2)",
            params![id, path],
        )?;
    }
    Ok(())
}

pub fn access_records(conn: &Connection, id: i64) -> anyhow::Result<Vec<AccessRecord>> {
    let mut stmt = conn.prepare(
        "SELECT instance_id, type, host, user, port, password FROM access WHERE instance_id = ?",
    )?;
    let rows = stmt.query_map(params![id], |row| {
        Ok(AccessRecord {
            instance_id: row.get(0)?,
            kind: row.get(1)?,
            host: row.get(2)?,
            user: row.get(3)?,
            port: row.get::<_, i64>(4)? as u16,
            password: row.get(5)?,
        })
    })?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn register_access(conn: &Connection, record: &AccessRecord) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO access (instance_id, type, host, user, port, password)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            record.instance_id,
            record.kind,
            record.host,
            record.user,
            record.port as i64,
            record.password
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn test_conn() -> db::DbPool {
        let pool = db::connection::create_memory_pool().unwrap();
        db::migrate(&pool.get().unwrap()).unwrap();
        pool
    }

    fn sample() -> CreateInstance {
        CreateInstance {
            name: "mysite".into(),
            contact: "ops@example.org".into(),
            webroot: "/var/www/mysite".into(),
            weburl: "https://example.org".into(),
            tempdir: "/tmp/im".into(),
            interpreter: "/usr/bin/php".into(),
            transport: "ssh".into(),
        }
    }

    #[test]
    fn test_create_assigns_sequential_ids() {
        let pool = test_conn();
        let conn = pool.get().unwrap();
        let first = create(&conn, &sample()).unwrap();
        let second = create(&conn, &sample()).unwrap();
        assert_eq!(second.id, first.id + 1);
    }

    #[test]
    fn test_delete_cascades_to_owned_rows() {
        let pool = test_conn();
        let conn = pool.get().unwrap();
        let instance = create(&conn, &sample()).unwrap();
        set_prop(&conn, instance.id, "backup_perm", "0750").unwrap();
        set_extra_backups(&conn, instance.id, &["/srv/uploads".into()]).unwrap();
        register_access(
            &conn,
            &AccessRecord {
                instance_id: instance.id,
                kind: "ssh".into(),
                host: "example.org".into(),
                user: "deploy".into(),
                port: 22,
                password: None,
            },
        )
        .unwrap();
        crate::models::version::create(
            &conn,
            instance.id,
            &crate::models::version::NewVersion::default(),
        )
        .unwrap();

        assert!(delete(&conn, instance.id).unwrap());
        assert!(find_by_id(&conn, instance.id).unwrap().is_none());
        assert!(get_prop(&conn, instance.id, "backup_perm").unwrap().is_none());
        assert!(extra_backups(&conn, instance.id).unwrap().is_empty());
        assert!(access_records(&conn, instance.id).unwrap().is_empty());
        assert!(crate::models::version::latest_for_instance(&conn, instance.id)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_web_path_collapses_dot_segments() {
        let pool = test_conn();
        let conn = pool.get().unwrap();
        let mut data = sample();
        data.webroot = "/var/www/./mysite".into();
        let instance = create(&conn, &data).unwrap();
        assert_eq!(instance.web_path("img/logo.png"), "/var/www/mysite/img/logo.png");
    }
}
