//! [`SqliteControlStore`] – relational [`ControlStore`] over the
//! `control_status` table.
//!
//! `update` reads the row, applies the [`ControlPatch`], and writes it back
//! inside one SQLite transaction, so a patch is never half-applied.  Writes
//! run under [`Database::run_within`]: an `Err` from `update` means the row
//! was not changed.

use async_trait::async_trait;
use hydros_registry::{ControlPatch, ControlStore};
use hydros_types::{Capabilities, Control, HydroError, PhRole, Settings};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::db::{Database, decode_ts, encode_ts};
use crate::error::{StoreError, column_error};

const SELECT_COLUMNS: &str = "SELECT name, is_on, mode, locked, locked_reason, last_active,
                                     settings, is_pump, ph_role
                              FROM control_status";

#[derive(Clone)]
pub struct SqliteControlStore {
    db: Database,
}

impl SqliteControlStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn ph_role_to_str(role: PhRole) -> &'static str {
    match role {
        PhRole::None => "none",
        PhRole::Up => "up",
        PhRole::Down => "down",
    }
}

fn ph_role_from_str(idx: usize, raw: &str) -> rusqlite::Result<PhRole> {
    match raw {
        "none" => Ok(PhRole::None),
        "up" => Ok(PhRole::Up),
        "down" => Ok(PhRole::Down),
        other => Err(column_error(idx, format!("unknown ph_role '{other}'"))),
    }
}

fn read_control(row: &Row<'_>) -> rusqlite::Result<Control> {
    let mode: String = row.get(2)?;
    let last_active: Option<String> = row.get(5)?;
    let settings: String = row.get(6)?;
    let ph_role: String = row.get(8)?;
    Ok(Control {
        name: row.get(0)?,
        is_on: row.get(1)?,
        mode: mode.parse().map_err(|e| column_error(2, e))?,
        locked: row.get(3)?,
        locked_reason: row.get(4)?,
        last_active: last_active.as_deref().map(|ts| decode_ts(5, ts)).transpose()?,
        settings: serde_json::from_str::<Settings>(&settings).map_err(|e| column_error(6, e))?,
        capabilities: Capabilities {
            pump: row.get(7)?,
            ph_role: ph_role_from_str(8, &ph_role)?,
        },
    })
}

fn select_one(conn: &Connection, name: &str) -> Result<Option<Control>, StoreError> {
    let sql = format!("{SELECT_COLUMNS} WHERE name = ?1");
    Ok(conn.query_row(&sql, params![name], read_control).optional()?)
}

fn write_row(conn: &Connection, control: &Control, replace: bool) -> Result<usize, StoreError> {
    let verb = if replace { "INSERT OR REPLACE" } else { "INSERT OR IGNORE" };
    let sql = format!(
        "{verb} INTO control_status
             (name, is_on, mode, locked, locked_reason, last_active, settings, is_pump, ph_role)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
    );
    let written = conn.execute(
        &sql,
        params![
            control.name,
            control.is_on,
            control.mode.to_string(),
            control.locked,
            control.locked_reason,
            control.last_active.as_ref().map(encode_ts),
            serde_json::to_string(&control.settings)?,
            control.capabilities.pump,
            ph_role_to_str(control.capabilities.ph_role),
        ],
    )?;
    Ok(written)
}

enum UpdateResult {
    Updated(Control),
    Missing,
}

#[async_trait]
impl ControlStore for SqliteControlStore {
    async fn get(&self, name: &str) -> Result<Control, HydroError> {
        let key = name.to_string();
        self.db
            .run(move |conn| select_one(conn, &key))
            .await?
            .ok_or_else(|| HydroError::NotFound(name.to_string()))
    }

    async fn list(&self) -> Result<Vec<Control>, HydroError> {
        let controls = self
            .db
            .run(|conn| {
                let sql = format!("{SELECT_COLUMNS} ORDER BY name");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], read_control)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(controls)
    }

    async fn update(&self, name: &str, patch: ControlPatch) -> Result<Control, HydroError> {
        let key = name.to_string();
        let result = self
            .db
            .run_within("control_store.update", move |conn| {
                let tx = conn.transaction()?;
                let Some(mut control) = select_one(&tx, &key)? else {
                    return Ok(UpdateResult::Missing);
                };
                patch.apply_to(&mut control);
                write_row(&tx, &control, true)?;
                tx.commit()?;
                Ok(UpdateResult::Updated(control))
            })
            .await?;
        match result {
            UpdateResult::Updated(control) => Ok(control),
            UpdateResult::Missing => Err(HydroError::NotFound(name.to_string())),
        }
    }

    async fn insert_if_absent(&self, control: Control) -> Result<bool, HydroError> {
        let written = self
            .db
            .run_within("control_store.insert", move |conn| write_row(conn, &control, false))
            .await?;
        Ok(written == 1)
    }
}
