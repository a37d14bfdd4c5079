//! Database schema creation and pragmas.

use rusqlite::{Connection, Result};

/// Apply per-connection pragmas: real foreign keys, WAL for concurrent
/// readers with short writes, and a busy timeout instead of immediate
/// lock errors.
pub fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
}

/// Create all tables and indexes (idempotent).
pub fn create_tables(conn: &Connection) -> Result<()> {
    // Auctions: one row per cotización, keyed by the portal's opaque id_cot.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS auction (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            id_cot TEXT UNIQUE NOT NULL,
            url TEXT NOT NULL DEFAULT '',
            estado TEXT NOT NULL DEFAULT 'RUNNING',
            started_at TEXT,
            ended_at TEXT,
            last_ok_at TEXT,
            last_http_code INTEGER,
            err_streak INTEGER NOT NULL DEFAULT 0,
            mi_id_proveedor TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS line_item (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            auction_id INTEGER NOT NULL,
            id_renglon TEXT NOT NULL,
            descripcion TEXT NOT NULL DEFAULT '',
            items_por_renglon REAL NOT NULL DEFAULT 1,
            margen_minimo TEXT,
            UNIQUE (auction_id, id_renglon),
            FOREIGN KEY (auction_id) REFERENCES auction(id) ON DELETE CASCADE
        )",
        [],
    )?;

    // Latest observed state: at most one row per line item.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS line_item_state (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            line_item_id INTEGER UNIQUE NOT NULL,
            mejor_oferta_txt TEXT,
            oferta_min_txt TEXT,
            presupuesto_txt TEXT,
            mejor_oferta REAL,
            oferta_min REAL,
            presupuesto REAL,
            mensaje TEXT,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (line_item_id) REFERENCES line_item(id) ON DELETE CASCADE
        )",
        [],
    )?;

    // User-maintained cost data plus the engine's derived mirror. Survives
    // collector restarts; runtime cleanup never touches it.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS line_item_costs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            line_item_id INTEGER UNIQUE NOT NULL,
            unidad_medida TEXT,
            cantidad REAL,
            marca TEXT,
            obs_usuario TEXT,
            conv_usd REAL,
            costo_unit_usd REAL,
            costo_total_usd REAL,
            costo_unit_ars REAL,
            costo_total_ars REAL,
            renta_minima REAL,
            seguir INTEGER NOT NULL DEFAULT 0,
            oferta_mia INTEGER NOT NULL DEFAULT 0,
            ocultar_bajo_umbral INTEGER NOT NULL DEFAULT 0,
            precio_ref_unitario REAL,
            renta_referencia REAL,
            precio_unit_aceptable REAL,
            precio_total_aceptable REAL,
            precio_unit_mejora REAL,
            renta_para_mejorar REAL,
            updated_at TEXT,
            FOREIGN KEY (line_item_id) REFERENCES line_item(id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS event_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            nivel TEXT NOT NULL,
            tipo TEXT NOT NULL,
            auction_id INTEGER,
            line_item_id INTEGER,
            mensaje TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            FOREIGN KEY (auction_id) REFERENCES auction(id) ON DELETE CASCADE,
            FOREIGN KEY (line_item_id) REFERENCES line_item(id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS ui_config (
            clave TEXT PRIMARY KEY,
            valor TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_line_item_auction ON line_item(auction_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_event_log_time ON event_log(created_at DESC)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_event_log_tipo ON event_log(tipo)",
        [],
    )?;

    Ok(())
}
