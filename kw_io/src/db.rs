use std::path::Path;

use rusqlite::{Connection, OptionalExtension, Transaction, params};

use kw_core::{Error, InstallLayout, RuntimeState};

pub struct Database {
    conn: Connection,
}

#[derive(Debug, Clone)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
    /// Digest of the artifact the keg was built from
    pub sha256: String,
    pub layout: InstallLayout,
    pub installed_at: i64,
}

fn db_err(context: &str) -> impl Fn(rusqlite::Error) -> Error + '_ {
    move |e| Error::StoreCorruption {
        message: format!("{context}: {e}"),
    }
}

fn json_err(context: &str) -> impl Fn(serde_json::Error) -> Error + '_ {
    move |e| Error::StoreCorruption {
        message: format!("{context}: {e}"),
    }
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let conn = Connection::open(path).map_err(db_err("failed to open database"))?;
        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn in_memory() -> Result<Self, Error> {
        let conn =
            Connection::open_in_memory().map_err(db_err("failed to open in-memory database"))?;
        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    fn init_schema(conn: &Connection) -> Result<(), Error> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS installed_packages (
                name TEXT PRIMARY KEY,
                version TEXT NOT NULL,
                sha256 TEXT NOT NULL,
                layout_json TEXT NOT NULL,
                installed_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS runtime_state (
                name TEXT PRIMARY KEY,
                version TEXT NOT NULL,
                state_json TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            ",
        )
        .map_err(db_err("failed to initialize schema"))
    }

    pub fn transaction(&mut self) -> Result<InstallTransaction<'_>, Error> {
        let tx = self
            .conn
            .transaction()
            .map_err(db_err("failed to start transaction"))?;
        Ok(InstallTransaction { tx })
    }

    pub fn get_installed(&self, name: &str) -> Result<Option<InstalledPackage>, Error> {
        let row = self
            .conn
            .query_row(
                "SELECT name, version, sha256, layout_json, installed_at
                 FROM installed_packages WHERE name = ?1",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err("failed to query installed package"))?;

        row.map(|(name, version, sha256, layout_json, installed_at)| {
            Ok(InstalledPackage {
                layout: serde_json::from_str(&layout_json)
                    .map_err(json_err("stored layout is unreadable"))?,
                name,
                version,
                sha256,
                installed_at,
            })
        })
        .transpose()
    }

    pub fn list_installed(&self) -> Result<Vec<InstalledPackage>, Error> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT name, version, sha256, layout_json, installed_at
                 FROM installed_packages ORDER BY name",
            )
            .map_err(db_err("failed to prepare statement"))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .map_err(db_err("failed to query installed packages"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err("failed to collect results"))?;

        rows.into_iter()
            .map(|(name, version, sha256, layout_json, installed_at)| {
                Ok(InstalledPackage {
                    layout: serde_json::from_str(&layout_json)
                        .map_err(json_err("stored layout is unreadable"))?,
                    name,
                    version,
                    sha256,
                    installed_at,
                })
            })
            .collect()
    }

    /// Artifact digests still referenced by an installed package.
    pub fn referenced_digests(&self) -> Result<Vec<String>, Error> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT sha256 FROM installed_packages")
            .map_err(db_err("failed to prepare statement"))?;
        stmt.query_map([], |row| row.get(0))
            .map_err(db_err("failed to query digests"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err("failed to collect results"))
    }

    /// Runtime state recorded for `name`, only if it belongs to `version`.
    pub fn get_runtime(&self, name: &str, version: &str) -> Result<Option<RuntimeState>, Error> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT state_json FROM runtime_state WHERE name = ?1 AND version = ?2",
                params![name, version],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("failed to query runtime state"))?;

        json.map(|j| serde_json::from_str(&j).map_err(json_err("stored runtime state is unreadable")))
            .transpose()
    }

    pub fn record_runtime(
        &self,
        name: &str,
        version: &str,
        state: &RuntimeState,
    ) -> Result<(), Error> {
        let json = serde_json::to_string(state).map_err(json_err("failed to encode runtime state"))?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO runtime_state (name, version, state_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![name, version, json, chrono::Utc::now().timestamp()],
            )
            .map_err(db_err("failed to record runtime state"))?;
        Ok(())
    }
}

pub struct InstallTransaction<'a> {
    tx: Transaction<'a>,
}

impl InstallTransaction<'_> {
    /// Record a successful install, replacing any previous record for the name.
    pub fn record_install(&self, layout: &InstallLayout, sha256: &str) -> Result<(), Error> {
        let json =
            serde_json::to_string(layout).map_err(json_err("failed to encode install layout"))?;
        self.tx
            .execute(
                "INSERT OR REPLACE INTO installed_packages
                 (name, version, sha256, layout_json, installed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    layout.name,
                    layout.version,
                    sha256,
                    json,
                    chrono::Utc::now().timestamp()
                ],
            )
            .map_err(db_err("failed to record install"))?;

        // Runtime state of another version no longer applies
        self.tx
            .execute(
                "DELETE FROM runtime_state WHERE name = ?1 AND version != ?2",
                params![layout.name, layout.version],
            )
            .map_err(db_err("failed to clear stale runtime state"))?;
        Ok(())
    }

    pub fn commit(self) -> Result<(), Error> {
        self.tx.commit().map_err(db_err("failed to commit transaction"))
    }
}
