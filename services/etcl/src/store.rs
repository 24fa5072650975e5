//! Long-Table Store
//!
//! Responsibilities:
//! - Own `observaciones_tiempo_trabajo` (one row per strict identity key)
//! - Idempotent upsert: insert new keys, update changed values, skip identical rows
//! - `replace_snapshot`: retire rows of re-loaded fuentes that the new snapshot no
//!   longer carries
//! - Journal every change (`historial_cambios`) so `rollback_to` restores a
//!   version exactly
//! - Expose the `observaciones_canonicas` view (one row per logical identity)
//! - Keep the run log (`cargas_archivo`), the snapshot register (`snapshots`) and
//!   the catalogue mirrors (`sources_catalog`, `reference_values`)
//!
//! Single writer. Every write helper takes a `&mut SqliteConnection` so the
//! pipeline decides the transaction boundaries.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{Catalogue, Indicador, ReferenceValue};
use crate::error::{EtclError, Result};
use crate::model::{Ambito, CnaeNivel, Observation, Periodo, Rol, Slice, TipoJornada, UNIDAD};
use crate::resolver::{CanonicalRow, UNRANKED};

// =============================================================================
// SCHEMA
// =============================================================================

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS observaciones_tiempo_trabajo (
        clave                TEXT PRIMARY KEY,
        clave_logica         TEXT NOT NULL,
        periodo              TEXT NOT NULL,
        periodo_inicio       TEXT NOT NULL,
        periodo_fin          TEXT NOT NULL,
        ambito_territorial   TEXT NOT NULL,
        ccaa_codigo          TEXT,
        ccaa_nombre          TEXT,
        cnae_nivel           TEXT NOT NULL,
        cnae_codigo          TEXT,
        cnae_nombre          TEXT,
        jerarquia_sector_lbl TEXT NOT NULL,
        tipo_jornada         TEXT NOT NULL,
        es_total_jornada     INTEGER NOT NULL,
        es_total_ccaa        INTEGER NOT NULL,
        es_total_cnae        INTEGER NOT NULL,
        rol_grano            TEXT NOT NULL,
        fuente_tabla         TEXT NOT NULL,
        metrica              TEXT NOT NULL,
        causa                TEXT,
        rol                  TEXT,
        valor                REAL NOT NULL,
        unidad               TEXT NOT NULL,
        version_datos        INTEGER NOT NULL,
        fecha_carga          TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_obs_clave_logica ON observaciones_tiempo_trabajo (clave_logica)",
    "CREATE INDEX IF NOT EXISTS idx_obs_periodo ON observaciones_tiempo_trabajo (periodo)",
    "CREATE INDEX IF NOT EXISTS idx_obs_fuente ON observaciones_tiempo_trabajo (fuente_tabla)",
    r#"
    CREATE TABLE IF NOT EXISTS sources_catalog (
        codigo              TEXT PRIMARY KEY,
        nombre              TEXT NOT NULL,
        categoria           TEXT NOT NULL,
        granularidad_sector TEXT NOT NULL,
        cobertura           TEXT NOT NULL,
        columnas_esperadas  TEXT NOT NULL,
        rango_preferencia   INTEGER,
        activa              INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS reference_values (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        periodo      TEXT NOT NULL,
        ambito       TEXT NOT NULL,
        ccaa_codigo  TEXT,
        cnae_nivel   TEXT NOT NULL,
        cnae_codigo  TEXT,
        tipo_jornada TEXT NOT NULL,
        metrica      TEXT NOT NULL,
        causa        TEXT,
        valor_ine    REAL NOT NULL,
        fuente       TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS snapshots (
        version_datos      INTEGER PRIMARY KEY,
        run_id             TEXT NOT NULL,
        huella             TEXT NOT NULL,
        estado             TEXT NOT NULL,
        archivos_ok        INTEGER NOT NULL,
        archivos_fallidos  INTEGER NOT NULL,
        filas_insertadas   INTEGER NOT NULL,
        filas_actualizadas INTEGER NOT NULL,
        filas_eliminadas   INTEGER NOT NULL,
        creado_en          TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cargas_archivo (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id        TEXT NOT NULL,
        version_datos INTEGER,
        fuente_tabla  TEXT NOT NULL,
        archivo       TEXT,
        estado        TEXT NOT NULL,
        error         TEXT,
        filas_leidas  INTEGER NOT NULL,
        observaciones INTEGER NOT NULL,
        descartadas   INTEGER NOT NULL,
        detalle       TEXT NOT NULL,
        iniciado_en   TEXT NOT NULL,
        finalizado_en TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS historial_cambios (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        version_datos INTEGER NOT NULL,
        clave         TEXT NOT NULL,
        operacion     TEXT NOT NULL,
        anterior      TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_historial_version ON historial_cambios (version_datos)",
    r#"
    CREATE VIEW IF NOT EXISTS observaciones_canonicas AS
    SELECT * FROM (
        SELECT o.*,
               ROW_NUMBER() OVER (
                   PARTITION BY o.clave_logica
                   ORDER BY COALESCE(s.rango_preferencia, 1000000), o.fuente_tabla
               ) AS rn
        FROM observaciones_tiempo_trabajo o
        LEFT JOIN sources_catalog s ON s.codigo = o.fuente_tabla
    )
    WHERE rn = 1
    "#,
];

const COLUMNS: &str = "clave, clave_logica, periodo, periodo_inicio, periodo_fin, \
    ambito_territorial, ccaa_codigo, ccaa_nombre, cnae_nivel, cnae_codigo, cnae_nombre, \
    jerarquia_sector_lbl, tipo_jornada, es_total_jornada, es_total_ccaa, es_total_cnae, \
    rol_grano, fuente_tabla, metrica, causa, rol, valor, unidad, version_datos, fecha_carga";

// =============================================================================
// STORE HANDLE
// =============================================================================

/// Pooled handle on the store file.
pub struct Store {
    pool: SqlitePool,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (or create) the store file and apply the schema.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        migrate(&pool).await?;
        debug!(path = %path.display(), "Store opened");
        Ok(Self {
            pool,
            path: Some(path.to_path_buf()),
        })
    }

    /// Private in-memory store, one connection kept alive.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        migrate(&pool).await?;
        Ok(Self { pool, path: None })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn file_size(&self) -> Option<u64> {
        let path = self.path.as_ref()?;
        std::fs::metadata(path).ok().map(|m| m.len())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

async fn migrate(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

// =============================================================================
// STORED ROW
// =============================================================================

/// One persisted row of `observaciones_tiempo_trabajo`, derived columns included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoredRow {
    pub clave: String,
    pub clave_logica: String,
    pub periodo: String,
    pub periodo_inicio: String,
    pub periodo_fin: String,
    pub ambito_territorial: String,
    pub ccaa_codigo: Option<String>,
    pub ccaa_nombre: Option<String>,
    pub cnae_nivel: String,
    pub cnae_codigo: Option<String>,
    pub cnae_nombre: Option<String>,
    pub jerarquia_sector_lbl: String,
    pub tipo_jornada: String,
    pub es_total_jornada: bool,
    pub es_total_ccaa: bool,
    pub es_total_cnae: bool,
    pub rol_grano: String,
    pub fuente_tabla: String,
    pub metrica: String,
    pub causa: Option<String>,
    pub rol: Option<String>,
    pub valor: f64,
    pub unidad: String,
    pub version_datos: i64,
    pub fecha_carga: String,
}

fn code<T: FromStr>(columna: &str, valor: &str) -> Result<T> {
    valor.parse().map_err(|_| EtclError::StoredValue {
        columna: columna.to_string(),
        valor: valor.to_string(),
    })
}

impl StoredRow {
    pub fn from_observation(obs: &Observation, version_datos: i64, fecha_carga: &str) -> Self {
        Self {
            clave: obs.clave(),
            clave_logica: obs.clave_logica(),
            periodo: obs.periodo.code(),
            periodo_inicio: obs.periodo.inicio().to_string(),
            periodo_fin: obs.periodo.fin().to_string(),
            ambito_territorial: obs.ambito.to_string(),
            ccaa_codigo: obs.ccaa_codigo.clone(),
            ccaa_nombre: obs.ccaa_nombre.clone(),
            cnae_nivel: obs.cnae_nivel.to_string(),
            cnae_codigo: obs.cnae_codigo.clone(),
            cnae_nombre: obs.cnae_nombre.clone(),
            jerarquia_sector_lbl: obs.jerarquia_sector.clone(),
            tipo_jornada: obs.tipo_jornada.to_string(),
            es_total_jornada: obs.es_total_jornada(),
            es_total_ccaa: obs.es_total_ccaa(),
            es_total_cnae: obs.es_total_cnae(),
            rol_grano: obs.rol_grano(),
            fuente_tabla: obs.fuente_tabla.clone(),
            metrica: obs.metrica.to_string(),
            causa: obs.causa.map(|c| c.to_string()),
            rol: obs.rol().map(|r| r.to_string()),
            valor: obs.valor,
            unidad: UNIDAD.to_string(),
            version_datos,
            fecha_carga: fecha_carga.to_string(),
        }
    }

    pub fn to_observation(&self) -> Result<Observation> {
        Ok(Observation {
            periodo: Periodo::parse(&self.periodo).map_err(|_| EtclError::StoredValue {
                columna: "periodo".to_string(),
                valor: self.periodo.clone(),
            })?,
            ambito: code("ambito_territorial", &self.ambito_territorial)?,
            ccaa_codigo: self.ccaa_codigo.clone(),
            ccaa_nombre: self.ccaa_nombre.clone(),
            cnae_nivel: code("cnae_nivel", &self.cnae_nivel)?,
            cnae_codigo: self.cnae_codigo.clone(),
            cnae_nombre: self.cnae_nombre.clone(),
            jerarquia_sector: self.jerarquia_sector_lbl.clone(),
            tipo_jornada: code("tipo_jornada", &self.tipo_jornada)?,
            fuente_tabla: self.fuente_tabla.clone(),
            metrica: code("metrica", &self.metrica)?,
            causa: self.causa.as_deref().map(|c| code("causa", c)).transpose()?,
            valor: self.valor,
            version_datos: Some(self.version_datos),
            linea: 0,
        })
    }

    pub fn to_canonical(&self) -> Result<CanonicalRow> {
        Ok(CanonicalRow {
            observation: self.to_observation()?,
            rol: self
                .rol
                .as_deref()
                .map(|r| code::<Rol>("rol", r))
                .transpose()?,
            descartadas: Vec::new(),
        })
    }

    /// Equal apart from the snapshot bookkeeping columns.
    fn same_content(&self, other: &StoredRow) -> bool {
        let strip = |r: &StoredRow| StoredRow {
            version_datos: 0,
            fecha_carga: String::new(),
            ..r.clone()
        };
        strip(self) == strip(other)
    }
}

async fn write_row(conn: &mut SqliteConnection, row: &StoredRow) -> Result<()> {
    sqlx::query(&format!(
        "INSERT OR REPLACE INTO observaciones_tiempo_trabajo ({COLUMNS}) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(&row.clave)
    .bind(&row.clave_logica)
    .bind(&row.periodo)
    .bind(&row.periodo_inicio)
    .bind(&row.periodo_fin)
    .bind(&row.ambito_territorial)
    .bind(&row.ccaa_codigo)
    .bind(&row.ccaa_nombre)
    .bind(&row.cnae_nivel)
    .bind(&row.cnae_codigo)
    .bind(&row.cnae_nombre)
    .bind(&row.jerarquia_sector_lbl)
    .bind(&row.tipo_jornada)
    .bind(row.es_total_jornada)
    .bind(row.es_total_ccaa)
    .bind(row.es_total_cnae)
    .bind(&row.rol_grano)
    .bind(&row.fuente_tabla)
    .bind(&row.metrica)
    .bind(&row.causa)
    .bind(&row.rol)
    .bind(row.valor)
    .bind(&row.unidad)
    .bind(row.version_datos)
    .bind(&row.fecha_carga)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn fetch_row(conn: &mut SqliteConnection, clave: &str) -> Result<Option<StoredRow>> {
    let row = sqlx::query_as::<_, StoredRow>(&format!(
        "SELECT {COLUMNS} FROM observaciones_tiempo_trabajo WHERE clave = ?"
    ))
    .bind(clave)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

async fn journal(
    conn: &mut SqliteConnection,
    version_datos: i64,
    clave: &str,
    operacion: &str,
    anterior: Option<&StoredRow>,
) -> Result<()> {
    let anterior = anterior.map(serde_json::to_string).transpose()?;
    sqlx::query(
        "INSERT INTO historial_cambios (version_datos, clave, operacion, anterior) VALUES (?, ?, ?, ?)",
    )
    .bind(version_datos)
    .bind(clave)
    .bind(operacion)
    .bind(anterior)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// =============================================================================
// WRITE SIDE
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertStats {
    pub insertadas: usize,
    pub actualizadas: usize,
    pub sin_cambios: usize,
}

impl UpsertStats {
    pub fn add(&mut self, other: UpsertStats) {
        self.insertadas += other.insertadas;
        self.actualizadas += other.actualizadas;
        self.sin_cambios += other.sin_cambios;
    }
}

/// Insert new identity keys, update changed rows, skip identical ones.
/// Identical rows keep their original `version_datos`.
pub async fn upsert(
    conn: &mut SqliteConnection,
    batch: &[Observation],
    version_datos: i64,
    fecha_carga: &str,
) -> Result<UpsertStats> {
    let mut stats = UpsertStats::default();
    for obs in batch {
        let row = StoredRow::from_observation(obs, version_datos, fecha_carga);
        match fetch_row(conn, &row.clave).await? {
            None => {
                journal(conn, version_datos, &row.clave, "insert", None).await?;
                write_row(conn, &row).await?;
                stats.insertadas += 1;
            }
            Some(existing) if existing.same_content(&row) => {
                stats.sin_cambios += 1;
            }
            Some(existing) => {
                journal(conn, version_datos, &row.clave, "update", Some(&existing)).await?;
                write_row(conn, &row).await?;
                stats.actualizadas += 1;
            }
        }
    }
    Ok(stats)
}

/// Identity keys of `batch` whose stored value differs from the batch (or is
/// missing). Empty after a successful upsert.
pub async fn verify_batch(conn: &mut SqliteConnection, batch: &[Observation]) -> Result<Vec<String>> {
    let mut mismatched = Vec::new();
    for obs in batch {
        let clave = obs.clave();
        match fetch_row(conn, &clave).await? {
            Some(row) if row.valor == obs.valor => {}
            _ => mismatched.push(clave),
        }
    }
    Ok(mismatched)
}

/// Retire rows of the re-loaded `fuentes` whose keys the new snapshot did not
/// produce. Runs only after every upsert of the snapshot succeeded.
pub async fn replace_snapshot(
    conn: &mut SqliteConnection,
    version_datos: i64,
    fuentes: &[String],
    vistas: &HashSet<String>,
) -> Result<usize> {
    let mut eliminadas = 0;
    for fuente in fuentes {
        let stale: Vec<StoredRow> = sqlx::query_as::<_, StoredRow>(&format!(
            "SELECT {COLUMNS} FROM observaciones_tiempo_trabajo \
             WHERE fuente_tabla = ? AND version_datos < ? ORDER BY clave"
        ))
        .bind(fuente)
        .bind(version_datos)
        .fetch_all(&mut *conn)
        .await?;

        for row in stale.iter().filter(|r| !vistas.contains(&r.clave)) {
            journal(conn, version_datos, &row.clave, "delete", Some(row)).await?;
            sqlx::query("DELETE FROM observaciones_tiempo_trabajo WHERE clave = ?")
                .bind(&row.clave)
                .execute(&mut *conn)
                .await?;
            eliminadas += 1;
        }
    }
    if eliminadas > 0 {
        info!(version_datos, eliminadas, "Retired rows absent from the new snapshot");
    }
    Ok(eliminadas)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RollbackStats {
    pub revertidas: Vec<i64>,
    pub cambios_deshechos: usize,
}

/// Undo every active snapshot newer than `target`, newest first.
///
/// Errors: `UnknownVersion` when `target` is not an active snapshot.
pub async fn rollback_to(conn: &mut SqliteConnection, target: i64) -> Result<RollbackStats> {
    let estado: Option<String> =
        sqlx::query_scalar("SELECT estado FROM snapshots WHERE version_datos = ?")
            .bind(target)
            .fetch_optional(&mut *conn)
            .await?;
    if estado.as_deref() != Some(ESTADO_ACTIVA) {
        return Err(EtclError::UnknownVersion(target));
    }

    let newer: Vec<i64> = sqlx::query_scalar(
        "SELECT version_datos FROM snapshots WHERE version_datos > ? AND estado = ? \
         ORDER BY version_datos DESC",
    )
    .bind(target)
    .bind(ESTADO_ACTIVA)
    .fetch_all(&mut *conn)
    .await?;

    let mut stats = RollbackStats::default();
    for version in newer {
        stats.cambios_deshechos += undo_version(conn, version).await?;
        sqlx::query("UPDATE snapshots SET estado = ? WHERE version_datos = ?")
            .bind(ESTADO_REVERTIDA)
            .bind(version)
            .execute(&mut *conn)
            .await?;
        stats.revertidas.push(version);
    }
    Ok(stats)
}

async fn undo_version(conn: &mut SqliteConnection, version_datos: i64) -> Result<usize> {
    let entries: Vec<(i64, String, String, Option<String>)> = sqlx::query_as(
        "SELECT id, clave, operacion, anterior FROM historial_cambios \
         WHERE version_datos = ? ORDER BY id DESC",
    )
    .bind(version_datos)
    .fetch_all(&mut *conn)
    .await?;

    for (id, clave, operacion, anterior) in &entries {
        match (operacion.as_str(), anterior) {
            ("insert", _) => {
                sqlx::query("DELETE FROM observaciones_tiempo_trabajo WHERE clave = ?")
                    .bind(clave)
                    .execute(&mut *conn)
                    .await?;
            }
            ("update" | "delete", Some(json)) => {
                let row: StoredRow = serde_json::from_str(json)?;
                write_row(conn, &row).await?;
            }
            _ => {
                return Err(EtclError::StoredValue {
                    columna: format!("historial_cambios[{}].operacion", id),
                    valor: operacion.clone(),
                })
            }
        }
    }
    debug!(version_datos, cambios = entries.len(), "Snapshot undone");
    Ok(entries.len())
}

// =============================================================================
// CATALOGUE MIRRORS
// =============================================================================

/// Replace `sources_catalog` and `reference_values` with the catalogue contents.
pub async fn sync_catalogue(conn: &mut SqliteConnection, catalogue: &Catalogue) -> Result<()> {
    sqlx::query("DELETE FROM sources_catalog")
        .execute(&mut *conn)
        .await?;
    for tabla in &catalogue.tablas {
        sqlx::query(
            "INSERT INTO sources_catalog (codigo, nombre, categoria, granularidad_sector, \
             cobertura, columnas_esperadas, rango_preferencia, activa) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&tabla.codigo)
        .bind(&tabla.nombre)
        .bind(tabla.categoria.as_str())
        .bind(tabla.granularidad_sector.as_str())
        .bind(serde_json::to_string(&tabla.cobertura)?)
        .bind(serde_json::to_string(&tabla.columnas_esperadas)?)
        .bind(catalogue.preference_rank(&tabla.codigo).map(|r| r as i64))
        .bind(tabla.activa)
        .execute(&mut *conn)
        .await?;
    }

    sqlx::query("DELETE FROM reference_values")
        .execute(&mut *conn)
        .await?;
    for r in &catalogue.valores_referencia {
        sqlx::query(
            "INSERT INTO reference_values (periodo, ambito, ccaa_codigo, cnae_nivel, cnae_codigo, \
             tipo_jornada, metrica, causa, valor_ine, fuente) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(r.periodo.code())
        .bind(r.ambito.as_str())
        .bind(&r.ccaa_codigo)
        .bind(r.cnae_nivel.as_str())
        .bind(&r.cnae_codigo)
        .bind(r.tipo_jornada.as_str())
        .bind(r.metrica.to_string())
        .bind(r.causa.map(|c| c.as_str()))
        .bind(r.valor_ine)
        .bind(&r.fuente)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

#[derive(sqlx::FromRow)]
struct ReferenceRow {
    periodo: String,
    ambito: String,
    ccaa_codigo: Option<String>,
    cnae_nivel: String,
    cnae_codigo: Option<String>,
    tipo_jornada: String,
    metrica: String,
    causa: Option<String>,
    valor_ine: f64,
    fuente: Option<String>,
}

/// Frozen reference values, in catalogue order.
pub async fn fetch_references(conn: &mut SqliteConnection) -> Result<Vec<ReferenceValue>> {
    let rows = sqlx::query_as::<_, ReferenceRow>(
        "SELECT periodo, ambito, ccaa_codigo, cnae_nivel, cnae_codigo, tipo_jornada, metrica, \
         causa, valor_ine, fuente FROM reference_values ORDER BY id",
    )
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter()
        .map(|r| -> Result<ReferenceValue> {
            Ok(ReferenceValue {
                periodo: Periodo::parse(&r.periodo).map_err(|_| EtclError::StoredValue {
                    columna: "reference_values.periodo".to_string(),
                    valor: r.periodo.clone(),
                })?,
                ambito: code("reference_values.ambito", &r.ambito)?,
                ccaa_codigo: r.ccaa_codigo,
                cnae_nivel: code("reference_values.cnae_nivel", &r.cnae_nivel)?,
                cnae_codigo: r.cnae_codigo,
                tipo_jornada: code("reference_values.tipo_jornada", &r.tipo_jornada)?,
                metrica: Indicador::try_from(r.metrica.clone()).map_err(|_| {
                    EtclError::StoredValue {
                        columna: "reference_values.metrica".to_string(),
                        valor: r.metrica.clone(),
                    }
                })?,
                causa: r
                    .causa
                    .as_deref()
                    .map(|c| code("reference_values.causa", c))
                    .transpose()?,
                valor_ine: r.valor_ine,
                fuente: r.fuente,
            })
        })
        .collect()
}

// =============================================================================
// SNAPSHOTS AND RUN LOG
// =============================================================================

pub const ESTADO_ACTIVA: &str = "activa";
pub const ESTADO_REVERTIDA: &str = "revertida";

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct SnapshotInfo {
    pub version_datos: i64,
    pub run_id: String,
    pub huella: String,
    pub estado: String,
    pub archivos_ok: i64,
    pub archivos_fallidos: i64,
    pub filas_insertadas: i64,
    pub filas_actualizadas: i64,
    pub filas_eliminadas: i64,
    pub creado_en: String,
}

/// Versions are never reused, reverted ones included.
pub async fn next_version(conn: &mut SqliteConnection) -> Result<i64> {
    let max: Option<i64> = sqlx::query_scalar("SELECT MAX(version_datos) FROM snapshots")
        .fetch_one(&mut *conn)
        .await?;
    Ok(max.unwrap_or(0) + 1)
}

pub async fn create_snapshot(conn: &mut SqliteConnection, info: &SnapshotInfo) -> Result<()> {
    sqlx::query(
        "INSERT INTO snapshots (version_datos, run_id, huella, estado, archivos_ok, \
         archivos_fallidos, filas_insertadas, filas_actualizadas, filas_eliminadas, creado_en) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(info.version_datos)
    .bind(&info.run_id)
    .bind(&info.huella)
    .bind(&info.estado)
    .bind(info.archivos_ok)
    .bind(info.archivos_fallidos)
    .bind(info.filas_insertadas)
    .bind(info.filas_actualizadas)
    .bind(info.filas_eliminadas)
    .bind(&info.creado_en)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

const SNAPSHOT_COLUMNS: &str = "version_datos, run_id, huella, estado, archivos_ok, \
    archivos_fallidos, filas_insertadas, filas_actualizadas, filas_eliminadas, creado_en";

/// Most recent active snapshot.
pub async fn active_snapshot(conn: &mut SqliteConnection) -> Result<Option<SnapshotInfo>> {
    let info = sqlx::query_as::<_, SnapshotInfo>(&format!(
        "SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE estado = ? \
         ORDER BY version_datos DESC LIMIT 1"
    ))
    .bind(ESTADO_ACTIVA)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(info)
}

pub async fn snapshot(conn: &mut SqliteConnection, version_datos: i64) -> Result<Option<SnapshotInfo>> {
    let info = sqlx::query_as::<_, SnapshotInfo>(&format!(
        "SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE version_datos = ?"
    ))
    .bind(version_datos)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(info)
}

pub async fn list_snapshots(conn: &mut SqliteConnection) -> Result<Vec<SnapshotInfo>> {
    let all = sqlx::query_as::<_, SnapshotInfo>(&format!(
        "SELECT {SNAPSHOT_COLUMNS} FROM snapshots ORDER BY version_datos"
    ))
    .fetch_all(&mut *conn)
    .await?;
    Ok(all)
}

/// One `cargas_archivo` entry.
#[derive(Debug, Clone, Serialize)]
pub struct FileLog {
    pub run_id: Uuid,
    pub version_datos: Option<i64>,
    pub fuente_tabla: String,
    pub archivo: Option<String>,
    pub estado: String,
    pub error: Option<String>,
    pub filas_leidas: i64,
    pub observaciones: i64,
    pub descartadas: i64,
    pub detalle: serde_json::Value,
    pub iniciado_en: String,
    pub finalizado_en: String,
}

pub async fn log_file(conn: &mut SqliteConnection, entry: &FileLog) -> Result<()> {
    sqlx::query(
        "INSERT INTO cargas_archivo (run_id, version_datos, fuente_tabla, archivo, estado, error, \
         filas_leidas, observaciones, descartadas, detalle, iniciado_en, finalizado_en) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(entry.run_id.to_string())
    .bind(entry.version_datos)
    .bind(&entry.fuente_tabla)
    .bind(&entry.archivo)
    .bind(&entry.estado)
    .bind(&entry.error)
    .bind(entry.filas_leidas)
    .bind(entry.observaciones)
    .bind(entry.descartadas)
    .bind(entry.detalle.to_string())
    .bind(&entry.iniciado_en)
    .bind(&entry.finalizado_en)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn count_file_logs(conn: &mut SqliteConnection, run_id: Uuid) -> Result<i64> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cargas_archivo WHERE run_id = ?")
        .bind(run_id.to_string())
        .fetch_one(&mut *conn)
        .await?;
    Ok(n)
}

// =============================================================================
// READ SIDE
// =============================================================================

/// Row predicate. `Some(None)` on a code column selects NULL.
#[derive(Debug, Clone, Default)]
pub struct RowFilter {
    pub periodo: Option<Periodo>,
    pub ambito: Option<Ambito>,
    pub ccaa_codigo: Option<Option<String>>,
    pub cnae_nivel: Option<CnaeNivel>,
    pub cnae_codigo: Option<Option<String>>,
    pub tipo_jornada: Option<TipoJornada>,
}

impl RowFilter {
    /// Exactly one slice.
    pub fn slice(slice: &Slice) -> Self {
        Self {
            periodo: Some(slice.periodo),
            ..Self::series(slice)
        }
    }

    /// A slice in every periodo.
    pub fn series(slice: &Slice) -> Self {
        Self {
            periodo: None,
            ambito: Some(slice.ambito),
            ccaa_codigo: Some(slice.ccaa_codigo.clone()),
            cnae_nivel: Some(slice.cnae_nivel),
            cnae_codigo: Some(slice.cnae_codigo.clone()),
            tipo_jornada: Some(slice.tipo_jornada),
        }
    }

    fn push_where(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        qb.push(" WHERE 1 = 1");
        if let Some(p) = &self.periodo {
            qb.push(" AND periodo = ").push_bind(p.code());
        }
        if let Some(a) = &self.ambito {
            qb.push(" AND ambito_territorial = ").push_bind(a.as_str());
        }
        if let Some(c) = &self.ccaa_codigo {
            qb.push(" AND COALESCE(ccaa_codigo, '') = ")
                .push_bind(c.clone().unwrap_or_default());
        }
        if let Some(n) = &self.cnae_nivel {
            qb.push(" AND cnae_nivel = ").push_bind(n.as_str());
        }
        if let Some(c) = &self.cnae_codigo {
            qb.push(" AND COALESCE(cnae_codigo, '') = ")
                .push_bind(c.clone().unwrap_or_default());
        }
        if let Some(j) = &self.tipo_jornada {
            qb.push(" AND tipo_jornada = ").push_bind(j.as_str());
        }
    }
}

async fn select_rows(
    conn: &mut SqliteConnection,
    relation: &str,
    filter: &RowFilter,
) -> Result<Vec<StoredRow>> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!("SELECT {COLUMNS} FROM {relation}"));
    filter.push_where(&mut qb);
    qb.push(" ORDER BY clave");
    let rows = qb.build_query_as::<StoredRow>().fetch_all(&mut *conn).await?;
    Ok(rows)
}

/// Raw rows of the main table, every fuente, ordered by strict key.
pub async fn fetch_rows(conn: &mut SqliteConnection, filter: &RowFilter) -> Result<Vec<StoredRow>> {
    select_rows(conn, "observaciones_tiempo_trabajo", filter).await
}

pub async fn fetch_observations(
    conn: &mut SqliteConnection,
    filter: &RowFilter,
) -> Result<Vec<Observation>> {
    fetch_rows(conn, filter)
        .await?
        .iter()
        .map(StoredRow::to_observation)
        .collect()
}

/// Rows of `observaciones_canonicas`: one per logical identity.
pub async fn fetch_canonical(
    conn: &mut SqliteConnection,
    filter: &RowFilter,
) -> Result<Vec<CanonicalRow>> {
    select_rows(conn, "observaciones_canonicas", filter)
        .await?
        .iter()
        .map(StoredRow::to_canonical)
        .collect()
}

/// Distinct periodos in the store, oldest first.
pub async fn periodos(conn: &mut SqliteConnection) -> Result<Vec<Periodo>> {
    let raw: Vec<String> = sqlx::query_scalar(
        "SELECT DISTINCT periodo FROM observaciones_tiempo_trabajo ORDER BY periodo",
    )
    .fetch_all(&mut *conn)
    .await?;
    raw.iter()
        .map(|p| {
            Periodo::parse(p).map_err(|_| EtclError::StoredValue {
                columna: "periodo".to_string(),
                valor: p.clone(),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub filas: i64,
    pub filas_canonicas: i64,
    pub por_fuente: Vec<(String, i64)>,
    pub por_metrica: Vec<(String, i64)>,
    pub ultimos_periodos: Vec<String>,
    pub version_activa: Option<i64>,
    pub snapshots: i64,
    pub tamano_bytes: Option<u64>,
}

pub async fn stats(conn: &mut SqliteConnection) -> Result<StoreStats> {
    let filas: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM observaciones_tiempo_trabajo")
        .fetch_one(&mut *conn)
        .await?;
    let filas_canonicas: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM observaciones_canonicas")
        .fetch_one(&mut *conn)
        .await?;
    let por_fuente: Vec<(String, i64)> = sqlx::query_as(
        "SELECT fuente_tabla, COUNT(*) FROM observaciones_tiempo_trabajo \
         GROUP BY fuente_tabla ORDER BY fuente_tabla",
    )
    .fetch_all(&mut *conn)
    .await?;
    let por_metrica: Vec<(String, i64)> = sqlx::query_as(
        "SELECT metrica, COUNT(*) FROM observaciones_tiempo_trabajo \
         GROUP BY metrica ORDER BY metrica",
    )
    .fetch_all(&mut *conn)
    .await?;
    let ultimos_periodos: Vec<String> = sqlx::query_scalar(
        "SELECT DISTINCT periodo FROM observaciones_tiempo_trabajo ORDER BY periodo DESC LIMIT 5",
    )
    .fetch_all(&mut *conn)
    .await?;
    let snapshots: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM snapshots")
        .fetch_one(&mut *conn)
        .await?;
    let version_activa = active_snapshot(conn).await?.map(|s| s.version_datos);

    Ok(StoreStats {
        filas,
        filas_canonicas,
        por_fuente,
        por_metrica,
        ultimos_periodos,
        version_activa,
        snapshots,
        tamano_bytes: None,
    })
}

/// Rank stored for a fuente, `UNRANKED` when the catalogue does not rank it.
pub async fn preference_rank(conn: &mut SqliteConnection, codigo: &str) -> Result<usize> {
    let rank: Option<Option<i64>> =
        sqlx::query_scalar("SELECT rango_preferencia FROM sources_catalog WHERE codigo = ?")
            .bind(codigo)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(rank.flatten().map(|r| r as usize).unwrap_or(UNRANKED))
}
