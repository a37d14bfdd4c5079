//! Typed operations over the SQLite connection.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension, Result};

use super::schema::{apply_pragmas, create_tables};
use super::types::{AuctionRow, AuctionState, CostsRow, ExportRow, StateRow};
use crate::metrics::{normalize_renta, renta_to_export, DerivedMetrics};

/// Shared handle over the relational store. One writer at a time; every
/// method commits before returning.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(db_path)?;
        apply_pragmas(&conn)?;
        create_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests and replay dry-runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        create_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // -------------------------------------------------------------------------
    // Auctions
    // -------------------------------------------------------------------------

    /// Create the auction on first sight of its id_cot, update the URL
    /// otherwise. Returns the primary key.
    pub fn upsert_auction(&self, id_cot: &str, url: &str, started_at: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM auction WHERE id_cot = ?1",
                [id_cot],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            conn.execute("UPDATE auction SET url = ?1 WHERE id = ?2", params![url, id])?;
            return Ok(id);
        }

        conn.execute(
            "INSERT INTO auction (id_cot, url, estado, started_at) VALUES (?1, ?2, 'RUNNING', ?3)",
            params![id_cot, url, started_at],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_auction(&self, id_cot: &str) -> Result<Option<AuctionRow>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, id_cot, url, estado, started_at, ended_at, last_ok_at,
                    last_http_code, err_streak, mi_id_proveedor
             FROM auction WHERE id_cot = ?1",
            [id_cot],
            |row| {
                Ok(AuctionRow {
                    id: row.get(0)?,
                    id_cot: row.get(1)?,
                    url: row.get(2)?,
                    estado: AuctionState::parse(&row.get::<_, String>(3)?)
                        .unwrap_or(AuctionState::Error),
                    started_at: row.get(4)?,
                    ended_at: row.get(5)?,
                    last_ok_at: row.get(6)?,
                    last_http_code: row.get(7)?,
                    err_streak: row.get(8)?,
                    mi_id_proveedor: row.get(9)?,
                })
            },
        )
        .optional()
    }

    /// Update the operational fields of an auction. `None` leaves a field
    /// untouched.
    pub fn set_auction_state(
        &self,
        auction_id: i64,
        estado: AuctionState,
        last_ok_at: Option<&str>,
        last_http_code: Option<u16>,
        err_streak: Option<u32>,
        ended_at: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE auction SET
                estado = ?1,
                last_ok_at = COALESCE(?2, last_ok_at),
                last_http_code = COALESCE(?3, last_http_code),
                err_streak = COALESCE(?4, err_streak),
                ended_at = COALESCE(?5, ended_at)
             WHERE id = ?6",
            params![
                estado.as_str(),
                last_ok_at,
                last_http_code,
                err_streak,
                ended_at,
                auction_id
            ],
        )?;
        Ok(())
    }

    pub fn set_mi_id_proveedor(&self, auction_id: i64, mi_id: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE auction SET mi_id_proveedor = ?1 WHERE id = ?2",
            params![mi_id, auction_id],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Line items
    // -------------------------------------------------------------------------

    /// Insert a line item on first observation; refresh the description and
    /// margin text on later ones. Returns the primary key.
    pub fn upsert_line_item(
        &self,
        auction_id: i64,
        id_renglon: &str,
        descripcion: &str,
        margen_minimo: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM line_item WHERE auction_id = ?1 AND id_renglon = ?2",
                params![auction_id, id_renglon],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            conn.execute(
                "UPDATE line_item SET descripcion = ?1,
                        margen_minimo = COALESCE(?2, margen_minimo)
                 WHERE id = ?3",
                params![descripcion, margen_minimo, id],
            )?;
            return Ok(id);
        }

        conn.execute(
            "INSERT INTO line_item (auction_id, id_renglon, descripcion, margen_minimo)
             VALUES (?1, ?2, ?3, ?4)",
            params![auction_id, id_renglon, descripcion, margen_minimo],
        )?;
        Ok(conn.last_insert_rowid())
    }

    // -------------------------------------------------------------------------
    // Current state (one row per line item)
    // -------------------------------------------------------------------------

    pub fn upsert_line_item_state(
        &self,
        line_item_id: i64,
        state: &StateRow,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO line_item_state (line_item_id, mejor_oferta_txt, oferta_min_txt,
                    presupuesto_txt, mejor_oferta, oferta_min, presupuesto, mensaje, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(line_item_id) DO UPDATE SET
                mejor_oferta_txt = excluded.mejor_oferta_txt,
                oferta_min_txt   = excluded.oferta_min_txt,
                presupuesto_txt  = excluded.presupuesto_txt,
                mejor_oferta     = excluded.mejor_oferta,
                oferta_min       = excluded.oferta_min,
                presupuesto      = excluded.presupuesto,
                mensaje          = excluded.mensaje,
                updated_at       = excluded.updated_at",
            params![
                line_item_id,
                state.mejor_oferta_txt,
                state.oferta_min_txt,
                state.presupuesto_txt,
                state.mejor_oferta,
                state.oferta_min,
                state.presupuesto,
                state.mensaje,
                state.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_line_item_state(&self, line_item_id: i64) -> Result<Option<StateRow>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT mejor_oferta_txt, oferta_min_txt, presupuesto_txt,
                    mejor_oferta, oferta_min, presupuesto, mensaje, updated_at
             FROM line_item_state WHERE line_item_id = ?1",
            [line_item_id],
            |row| {
                Ok(StateRow {
                    mejor_oferta_txt: row.get(0)?,
                    oferta_min_txt: row.get(1)?,
                    presupuesto_txt: row.get(2)?,
                    mejor_oferta: row.get(3)?,
                    oferta_min: row.get(4)?,
                    presupuesto: row.get(5)?,
                    mensaje: row.get(6)?,
                    updated_at: row.get(7)?,
                })
            },
        )
        .optional()
    }

    // -------------------------------------------------------------------------
    // Costs (user data + derived mirror)
    // -------------------------------------------------------------------------

    pub fn get_costs(&self, line_item_id: i64) -> Result<Option<CostsRow>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT c.unidad_medida, c.cantidad, l.items_por_renglon, c.marca, c.obs_usuario,
                    c.conv_usd, c.costo_unit_usd, c.costo_total_usd,
                    c.costo_unit_ars, c.costo_total_ars, c.renta_minima,
                    c.seguir, c.oferta_mia, c.ocultar_bajo_umbral
             FROM line_item_costs c
             JOIN line_item l ON l.id = c.line_item_id
             WHERE c.line_item_id = ?1",
            [line_item_id],
            |row| {
                Ok(CostsRow {
                    unidad_medida: row.get(0)?,
                    cantidad: row.get(1)?,
                    items_por_renglon: row.get(2)?,
                    marca: row.get(3)?,
                    obs_usuario: row.get(4)?,
                    conv_usd: row.get(5)?,
                    costo_unit_usd: row.get(6)?,
                    costo_total_usd: row.get(7)?,
                    costo_unit_ars: row.get(8)?,
                    costo_total_ars: row.get(9)?,
                    renta_minima: row.get(10)?,
                    seguir: row.get::<_, i64>(11)? != 0,
                    oferta_mia: row.get::<_, i64>(12)? != 0,
                    ocultar_bajo_umbral: row.get::<_, i64>(13)? != 0,
                })
            },
        )
        .optional()
    }

    /// Write the user-editable part of the costs row. The incoming margin is
    /// normalized to a fraction before storage.
    pub fn upsert_user_costs(&self, line_item_id: i64, costs: &CostsRow, updated_at: &str) -> Result<()> {
        let renta = costs.renta_minima.map(normalize_renta);
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO line_item_costs (line_item_id, unidad_medida, cantidad, marca,
                    obs_usuario, conv_usd, costo_unit_usd, costo_total_usd,
                    costo_unit_ars, costo_total_ars, renta_minima,
                    seguir, oferta_mia, ocultar_bajo_umbral, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(line_item_id) DO UPDATE SET
                unidad_medida = excluded.unidad_medida,
                cantidad = excluded.cantidad,
                marca = excluded.marca,
                obs_usuario = excluded.obs_usuario,
                conv_usd = excluded.conv_usd,
                costo_unit_usd = excluded.costo_unit_usd,
                costo_total_usd = excluded.costo_total_usd,
                costo_unit_ars = excluded.costo_unit_ars,
                costo_total_ars = excluded.costo_total_ars,
                renta_minima = excluded.renta_minima,
                seguir = excluded.seguir,
                oferta_mia = excluded.oferta_mia,
                ocultar_bajo_umbral = excluded.ocultar_bajo_umbral,
                updated_at = excluded.updated_at",
            params![
                line_item_id,
                costs.unidad_medida,
                costs.cantidad,
                costs.marca,
                costs.obs_usuario,
                costs.conv_usd,
                costs.costo_unit_usd,
                costs.costo_total_usd,
                costs.costo_unit_ars,
                costs.costo_total_ars,
                renta,
                costs.seguir as i64,
                costs.oferta_mia as i64,
                costs.ocultar_bajo_umbral as i64,
                updated_at,
            ],
        )?;

        if let Some(items) = costs.items_por_renglon {
            conn.execute(
                "UPDATE line_item SET items_por_renglon = ?1 WHERE id = ?2",
                params![items, line_item_id],
            )?;
        }
        Ok(())
    }

    /// Merge capture-pass reference data into the costs row without
    /// clobbering anything the user already loaded.
    pub fn merge_captured_refs(
        &self,
        line_item_id: i64,
        cantidad: Option<f64>,
        precio_ref_unitario: Option<f64>,
        updated_at: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO line_item_costs (line_item_id, updated_at) VALUES (?1, ?2)
             ON CONFLICT(line_item_id) DO NOTHING",
            params![line_item_id, updated_at],
        )?;
        conn.execute(
            "UPDATE line_item_costs SET
                cantidad = COALESCE(cantidad, ?1),
                precio_ref_unitario = COALESCE(?2, precio_ref_unitario),
                updated_at = ?3
             WHERE line_item_id = ?4",
            params![cantidad, precio_ref_unitario, updated_at, line_item_id],
        )?;
        Ok(())
    }

    /// Write the derived columns computed by the engine, including the
    /// resolved cost pair. Creates the row when the user never loaded costs.
    pub fn update_derived_costs(
        &self,
        line_item_id: i64,
        metrics: &DerivedMetrics,
        updated_at: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO line_item_costs (line_item_id, updated_at) VALUES (?1, ?2)
             ON CONFLICT(line_item_id) DO NOTHING",
            params![line_item_id, updated_at],
        )?;
        conn.execute(
            "UPDATE line_item_costs SET
                costo_unit_ars = ?1,
                costo_total_ars = ?2,
                costo_unit_usd = ?3,
                costo_total_usd = ?4,
                precio_unit_aceptable = ?5,
                precio_total_aceptable = ?6,
                precio_ref_unitario = ?7,
                renta_referencia = ?8,
                precio_unit_mejora = ?9,
                renta_para_mejorar = ?10,
                updated_at = ?11
             WHERE line_item_id = ?12",
            params![
                metrics.costo_unit_ars,
                metrics.costo_total_ars,
                metrics.costo_unit_usd,
                metrics.costo_total_usd,
                metrics.precio_unit_aceptable,
                metrics.precio_total_aceptable,
                metrics.precio_ref_unitario,
                metrics.renta_referencia,
                metrics.precio_unit_mejora,
                metrics.renta_para_mejorar,
                updated_at,
                line_item_id,
            ],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Event log
    // -------------------------------------------------------------------------

    pub fn insert_event(
        &self,
        nivel: &str,
        tipo: &str,
        auction_id: Option<i64>,
        line_item_id: Option<i64>,
        mensaje: &str,
        created_at: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO event_log (nivel, tipo, auction_id, line_item_id, mensaje, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![nivel, tipo, auction_id, line_item_id, mensaje, created_at],
        )?;
        Ok(())
    }

    pub fn count_events(&self, tipo: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM event_log WHERE tipo = ?1",
            [tipo],
            |row| row.get(0),
        )
    }

    // -------------------------------------------------------------------------
    // UI config
    // -------------------------------------------------------------------------

    pub fn get_ui_config(&self, clave: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT valor FROM ui_config WHERE clave = ?1",
            [clave],
            |row| row.get(0),
        )
        .optional()
    }

    pub fn set_ui_config(&self, clave: &str, valor: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO ui_config (clave, valor) VALUES (?1, ?2)
             ON CONFLICT(clave) DO UPDATE SET valor = excluded.valor",
            params![clave, valor],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Export / cleanup
    // -------------------------------------------------------------------------

    /// Rows for the export surface. Stored margin fractions go out as
    /// percentages.
    pub fn fetch_export_rows(&self, auction_id: i64) -> Result<Vec<ExportRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT a.id_cot, r.id_renglon, r.descripcion, r.items_por_renglon,
                    c.unidad_medida, c.cantidad, c.marca, c.obs_usuario,
                    c.conv_usd, c.costo_unit_usd, c.costo_total_usd,
                    c.costo_unit_ars, c.costo_total_ars, c.renta_minima,
                    c.precio_unit_aceptable, c.precio_total_aceptable,
                    c.precio_ref_unitario, c.renta_referencia,
                    c.precio_unit_mejora, c.renta_para_mejorar,
                    st.mejor_oferta_txt
             FROM line_item r
             JOIN auction a ON a.id = r.auction_id
             LEFT JOIN line_item_costs c ON c.line_item_id = r.id
             LEFT JOIN line_item_state st ON st.line_item_id = r.id
             WHERE r.auction_id = ?1
             ORDER BY r.id_renglon",
        )?;

        let rows = stmt.query_map([auction_id], |row| {
            Ok(ExportRow {
                id_subasta: row.get(0)?,
                item: row.get(1)?,
                descripcion: row.get(2)?,
                items_por_renglon: row.get(3)?,
                unidad_medida: row.get(4)?,
                cantidad: row.get(5)?,
                marca: row.get(6)?,
                obs_usuario: row.get(7)?,
                conv_usd: row.get(8)?,
                costo_unit_usd: row.get(9)?,
                costo_total_usd: row.get(10)?,
                costo_unit_ars: row.get(11)?,
                costo_total_ars: row.get(12)?,
                renta_minima_pct: row.get::<_, Option<f64>>(13)?.map(renta_to_export),
                precio_unit_aceptable: row.get(14)?,
                precio_total_aceptable: row.get(15)?,
                precio_ref_unitario: row.get(16)?,
                renta_referencia_pct: row.get::<_, Option<f64>>(17)?.map(renta_to_export),
                precio_unit_mejora: row.get(18)?,
                renta_para_mejorar_pct: row.get::<_, Option<f64>>(19)?.map(renta_to_export),
                mejor_oferta_txt: row.get(20)?,
            })
        })?;

        rows.collect()
    }

    /// Runtime cleanup: erase observed state and the event log. Line items
    /// and the user's cost data always survive.
    pub fn clear_runtime_state(&self, auction_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM line_item_state WHERE line_item_id IN
                (SELECT id FROM line_item WHERE auction_id = ?1)",
            [auction_id],
        )?;
        conn.execute("DELETE FROM event_log WHERE auction_id = ?1", [auction_id])?;
        Ok(())
    }
}
