use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

use crate::models::{Override, OverridePreset, TempTarget};

pub struct Database {
    conn: Connection,
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS temp_targets (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    uuid TEXT NOT NULL,
                    name TEXT,
                    created_at TEXT NOT NULL,
                    target_top REAL,
                    target_bottom REAL,
                    duration_min INTEGER NOT NULL,
                    entered_by TEXT,
                    reason TEXT,
                    low_carb INTEGER,
                    medium_carb INTEGER,
                    high_carb INTEGER
                );

                CREATE TABLE IF NOT EXISTS temp_target_presets (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    uuid TEXT NOT NULL UNIQUE,
                    name TEXT,
                    created_at TEXT NOT NULL,
                    target_top REAL,
                    target_bottom REAL,
                    duration_min INTEGER NOT NULL,
                    entered_by TEXT,
                    reason TEXT,
                    low_carb INTEGER,
                    medium_carb INTEGER,
                    high_carb INTEGER
                );

                CREATE TABLE IF NOT EXISTS overrides (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    created_at TEXT NOT NULL,
                    percentage REAL NOT NULL,
                    indefinite INTEGER NOT NULL DEFAULT 0,
                    duration_min INTEGER NOT NULL DEFAULT 0,
                    target_mgdl REAL NOT NULL DEFAULT 0,
                    smb_off INTEGER NOT NULL DEFAULT 0,
                    advanced INTEGER NOT NULL DEFAULT 0,
                    isf_and_cr INTEGER NOT NULL DEFAULT 1,
                    isf INTEGER NOT NULL DEFAULT 1,
                    cr INTEGER NOT NULL DEFAULT 1,
                    smb_scheduled_off INTEGER NOT NULL DEFAULT 0,
                    start_hour INTEGER NOT NULL DEFAULT 0,
                    end_hour INTEGER NOT NULL DEFAULT 23,
                    smb_minutes INTEGER NOT NULL DEFAULT 0,
                    uam_minutes INTEGER NOT NULL DEFAULT 0,
                    preset_id TEXT,
                    is_preset INTEGER NOT NULL DEFAULT 0,
                    enabled INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS override_presets (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    emoji TEXT,
                    created_at TEXT NOT NULL,
                    percentage REAL NOT NULL,
                    indefinite INTEGER NOT NULL DEFAULT 0,
                    duration_min INTEGER NOT NULL DEFAULT 0,
                    target_mgdl REAL NOT NULL DEFAULT 0,
                    smb_off INTEGER NOT NULL DEFAULT 0,
                    advanced INTEGER NOT NULL DEFAULT 0,
                    isf_and_cr INTEGER NOT NULL DEFAULT 1,
                    isf INTEGER NOT NULL DEFAULT 1,
                    cr INTEGER NOT NULL DEFAULT 1,
                    smb_scheduled_off INTEGER NOT NULL DEFAULT 0,
                    start_hour INTEGER NOT NULL DEFAULT 0,
                    end_hour INTEGER NOT NULL DEFAULT 23,
                    smb_minutes INTEGER NOT NULL DEFAULT 0,
                    uam_minutes INTEGER NOT NULL DEFAULT 0
                );

                CREATE INDEX IF NOT EXISTS idx_temp_targets_created ON temp_targets(created_at);
                CREATE INDEX IF NOT EXISTS idx_overrides_created ON overrides(created_at);

                PRAGMA user_version = 1;",
            )?;
        }

        Ok(())
    }

    // --- Row mapping helpers ---

    fn temp_target_from_row(row: &rusqlite::Row) -> rusqlite::Result<TempTarget> {
        let created: String = row.get(1)?;
        Ok(TempTarget {
            id: row.get(0)?,
            created_at: parse_ts(1, &created)?,
            name: row.get(2)?,
            target_top: row.get(3)?,
            target_bottom: row.get(4)?,
            duration_min: row.get(5)?,
            entered_by: row.get(6)?,
            reason: row.get(7)?,
            low_carb: row.get(8)?,
            medium_carb: row.get(9)?,
            high_carb: row.get(10)?,
        })
    }

    fn override_from_row(row: &rusqlite::Row) -> rusqlite::Result<Override> {
        let created: String = row.get(1)?;
        Ok(Override {
            id: row.get(0)?,
            created_at: parse_ts(1, &created)?,
            percentage: row.get(2)?,
            indefinite: row.get(3)?,
            duration_min: row.get(4)?,
            target_mgdl: row.get(5)?,
            smb_off: row.get(6)?,
            advanced: row.get(7)?,
            isf_and_cr: row.get(8)?,
            isf: row.get(9)?,
            cr: row.get(10)?,
            smb_scheduled_off: row.get(11)?,
            start_hour: row.get(12)?,
            end_hour: row.get(13)?,
            smb_minutes: row.get(14)?,
            uam_minutes: row.get(15)?,
            preset_id: row.get(16)?,
            is_preset: row.get(17)?,
            enabled: row.get(18)?,
        })
    }

    fn override_preset_from_row(row: &rusqlite::Row) -> rusqlite::Result<OverridePreset> {
        let created: String = row.get(3)?;
        Ok(OverridePreset {
            id: row.get(0)?,
            name: row.get(1)?,
            emoji: row.get(2)?,
            created_at: parse_ts(3, &created)?,
            percentage: row.get(4)?,
            indefinite: row.get(5)?,
            duration_min: row.get(6)?,
            target_mgdl: row.get(7)?,
            smb_off: row.get(8)?,
            advanced: row.get(9)?,
            isf_and_cr: row.get(10)?,
            isf: row.get(11)?,
            cr: row.get(12)?,
            smb_scheduled_off: row.get(13)?,
            start_hour: row.get(14)?,
            end_hour: row.get(15)?,
            smb_minutes: row.get(16)?,
            uam_minutes: row.get(17)?,
        })
    }

    const TEMP_TARGET_COLS: &'static str = "uuid, created_at, name, target_top, target_bottom,
             duration_min, entered_by, reason, low_carb, medium_carb, high_carb";

    const OVERRIDE_COLS: &'static str = "id, created_at, percentage, indefinite, duration_min,
             target_mgdl, smb_off, advanced, isf_and_cr, isf, cr, smb_scheduled_off,
             start_hour, end_hour, smb_minutes, uam_minutes, preset_id, is_preset, enabled";

    const PRESET_COLS: &'static str = "id, name, emoji, created_at, percentage, indefinite,
             duration_min, target_mgdl, smb_off, advanced, isf_and_cr, isf, cr,
             smb_scheduled_off, start_hour, end_hour, smb_minutes, uam_minutes";

    // --- Temp targets (append-only log) ---

    pub fn append_temp_target(&self, tt: &TempTarget) -> Result<()> {
        self.conn.execute(
            "INSERT INTO temp_targets (uuid, name, created_at, target_top, target_bottom,
                duration_min, entered_by, reason, low_carb, medium_carb, high_carb)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                tt.id,
                tt.name,
                tt.created_at.to_rfc3339(),
                tt.target_top,
                tt.target_bottom,
                tt.duration_min,
                tt.entered_by,
                tt.reason,
                tt.low_carb,
                tt.medium_carb,
                tt.high_carb,
            ],
        )?;
        Ok(())
    }

    /// Most recent temp target entry. Insertion order (rowid) breaks ties
    /// between equal creation timestamps.
    pub fn latest_temp_target(&self) -> Result<Option<TempTarget>> {
        let sql = format!(
            "SELECT {} FROM temp_targets ORDER BY created_at DESC, id DESC LIMIT 1",
            Self::TEMP_TARGET_COLS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::temp_target_from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn recent_temp_targets(&self, limit: i64) -> Result<Vec<TempTarget>> {
        let sql = format!(
            "SELECT {} FROM temp_targets ORDER BY created_at DESC, id DESC LIMIT ?1",
            Self::TEMP_TARGET_COLS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let targets = stmt
            .query_map(params![limit], Self::temp_target_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(targets)
    }

    // --- Temp target presets ---

    pub fn insert_temp_target_preset(&self, preset: &TempTarget) -> Result<()> {
        self.conn.execute(
            "INSERT INTO temp_target_presets (uuid, name, created_at, target_top, target_bottom,
                duration_min, entered_by, reason, low_carb, medium_carb, high_carb)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                preset.id,
                preset.name,
                preset.created_at.to_rfc3339(),
                preset.target_top,
                preset.target_bottom,
                preset.duration_min,
                preset.entered_by,
                preset.reason,
                preset.low_carb,
                preset.medium_carb,
                preset.high_carb,
            ],
        )?;
        Ok(())
    }

    pub fn get_temp_target_preset(&self, id: &str) -> Result<Option<TempTarget>> {
        let sql = format!(
            "SELECT {} FROM temp_target_presets WHERE uuid = ?1",
            Self::TEMP_TARGET_COLS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::temp_target_from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn list_temp_target_presets(&self) -> Result<Vec<TempTarget>> {
        let sql = format!(
            "SELECT {} FROM temp_target_presets ORDER BY created_at",
            Self::TEMP_TARGET_COLS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let presets = stmt
            .query_map([], Self::temp_target_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(presets)
    }

    // --- Overrides ---

    /// Append a new override row. The id on `ov` is ignored; the stored
    /// row is returned with its assigned id.
    pub fn insert_override(&self, ov: &Override) -> Result<Override> {
        self.conn.execute(
            "INSERT INTO overrides (created_at, percentage, indefinite, duration_min,
                target_mgdl, smb_off, advanced, isf_and_cr, isf, cr, smb_scheduled_off,
                start_hour, end_hour, smb_minutes, uam_minutes, preset_id, is_preset, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                ov.created_at.to_rfc3339(),
                ov.percentage,
                ov.indefinite,
                ov.duration_min,
                ov.target_mgdl,
                ov.smb_off,
                ov.advanced,
                ov.isf_and_cr,
                ov.isf,
                ov.cr,
                ov.smb_scheduled_off,
                ov.start_hour,
                ov.end_hour,
                ov.smb_minutes,
                ov.uam_minutes,
                ov.preset_id,
                ov.is_preset,
                ov.enabled,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_override(id)
    }

    pub fn get_override(&self, id: i64) -> Result<Override> {
        let sql = format!(
            "SELECT {} FROM overrides WHERE id = ?1",
            Self::OVERRIDE_COLS
        );
        self.conn
            .query_row(&sql, params![id], Self::override_from_row)
            .context("Override not found")
    }

    pub fn latest_override(&self) -> Result<Option<Override>> {
        let sql = format!(
            "SELECT {} FROM overrides ORDER BY created_at DESC, id DESC LIMIT 1",
            Self::OVERRIDE_COLS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::override_from_row(row)?))
        } else {
            Ok(None)
        }
    }

    /// If the most recent override row is still flagged enabled, flip the
    /// flag off and return the row as it was while active. History is
    /// otherwise untouched; this is the only permitted mutation.
    pub fn close_latest_override(&self) -> Result<Option<Override>> {
        let Some(latest) = self.latest_override()? else {
            return Ok(None);
        };
        if !latest.enabled {
            return Ok(None);
        }
        self.conn.execute(
            "UPDATE overrides SET enabled = 0 WHERE id = ?1",
            params![latest.id],
        )?;
        Ok(Some(latest))
    }

    // --- Override presets ---

    pub fn insert_override_preset(&self, preset: &OverridePreset) -> Result<()> {
        self.conn.execute(
            "INSERT INTO override_presets (id, name, emoji, created_at, percentage, indefinite,
                duration_min, target_mgdl, smb_off, advanced, isf_and_cr, isf, cr,
                smb_scheduled_off, start_hour, end_hour, smb_minutes, uam_minutes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                preset.id,
                preset.name,
                preset.emoji,
                preset.created_at.to_rfc3339(),
                preset.percentage,
                preset.indefinite,
                preset.duration_min,
                preset.target_mgdl,
                preset.smb_off,
                preset.advanced,
                preset.isf_and_cr,
                preset.isf,
                preset.cr,
                preset.smb_scheduled_off,
                preset.start_hour,
                preset.end_hour,
                preset.smb_minutes,
                preset.uam_minutes,
            ],
        )?;
        Ok(())
    }

    pub fn get_override_preset(&self, id: &str) -> Result<Option<OverridePreset>> {
        let sql = format!(
            "SELECT {} FROM override_presets WHERE id = ?1",
            Self::PRESET_COLS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::override_preset_from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn get_override_preset_name(&self, id: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM override_presets WHERE id = ?1")?;
        let mut rows = stmt.query(params![id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row.get(0)?))
        } else {
            Ok(None)
        }
    }

    pub fn list_override_presets(&self) -> Result<Vec<OverridePreset>> {
        let sql = format!(
            "SELECT {} FROM override_presets ORDER BY created_at",
            Self::PRESET_COLS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let presets = stmt
            .query_map([], Self::override_preset_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(presets)
    }
}
