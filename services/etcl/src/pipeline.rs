//! Ingestion pipeline
//!
//! Responsibilities:
//! - Discover one CSV per catalogue table in the snapshot directory
//! - Run read -> map -> build per file, one file at a time, in table-code order
//! - Upsert each file inside its own savepoint of the run transaction
//! - Retire stale rows, register the snapshot and commit as the last step
//! - Record one run-log entry per file
//!
//! DETERMINISTIC: same snapshot directory + same catalogue = same fingerprint.
//! A fingerprint equal to the active snapshot makes the run a no-op unless forced.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqliteConnection;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::builder::{self, BuildOptions, DropReason};
use crate::config::{Catalogue, SourceTable};
use crate::error::{EtclError, Result};
use crate::mapper;
use crate::model::{code_enum, Observation};
use crate::reader;
use crate::resolver::{canonicalize, Preference};
use crate::store::{self, FileLog, SnapshotInfo, Store, UpsertStats, ESTADO_ACTIVA};

code_enum!(
    /// Per-file state machine. Any stage may end in `FAILED`.
    FileState {
        Initial => "INITIAL",
        Reading => "READING",
        Mapped => "MAPPED",
        Built => "BUILT",
        Upserted => "UPSERTED",
        Validated => "VALIDATED",
        Failed => "FAILED",
    }
);

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub snapshot_dir: PathBuf,
    /// Read, map, build and resolve without touching the store
    pub dry_run: bool,
    /// Commit a new version even when the fingerprint is unchanged
    pub force: bool,
    /// ValueOutOfRange aborts the file
    pub strict: bool,
}

/// Outcome of one file.
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub fuente_tabla: String,
    pub archivo: String,
    pub estado: FileState,
    /// Last stage reached before a failure
    pub etapa: FileState,
    pub error: Option<String>,
    pub error_tipo: Option<&'static str>,
    pub dialecto: Option<String>,
    pub filas_leidas: usize,
    pub observaciones: usize,
    pub descartes: BTreeMap<DropReason, usize>,
    pub fuera_de_banda: usize,
    pub huecos_ccaa: Vec<String>,
    pub upsert: UpsertStats,
    pub iniciado_en: String,
    pub finalizado_en: String,
}

impl FileReport {
    fn new(tabla: &SourceTable, path: &Path) -> Self {
        Self {
            fuente_tabla: tabla.codigo.clone(),
            archivo: file_name(path),
            estado: FileState::Initial,
            etapa: FileState::Initial,
            error: None,
            error_tipo: None,
            dialecto: None,
            filas_leidas: 0,
            observaciones: 0,
            descartes: BTreeMap::new(),
            fuera_de_banda: 0,
            huecos_ccaa: Vec::new(),
            upsert: UpsertStats::default(),
            iniciado_en: Utc::now().to_rfc3339(),
            finalizado_en: String::new(),
        }
    }

    fn advance(&mut self, estado: FileState) {
        debug!(fuente = %self.fuente_tabla, from = %self.estado, to = %estado, "File state");
        self.estado = estado;
        self.etapa = estado;
    }

    fn fail(&mut self, err: &EtclError) {
        error!(fuente = %self.fuente_tabla, archivo = %self.archivo, etapa = %self.etapa, "{}", err);
        self.estado = FileState::Failed;
        self.error = Some(err.to_string());
        self.error_tipo = Some(err.kind());
        self.finish();
    }

    fn finish(&mut self) {
        self.finalizado_en = Utc::now().to_rfc3339();
    }

    pub fn ok(&self) -> bool {
        self.estado == FileState::Validated
    }

    pub fn dropped(&self) -> usize {
        self.descartes.values().sum()
    }

    fn to_log(&self, run_id: Uuid, version_datos: Option<i64>) -> FileLog {
        FileLog {
            run_id,
            version_datos,
            fuente_tabla: self.fuente_tabla.clone(),
            archivo: Some(self.archivo.clone()),
            estado: self.estado.to_string(),
            error: self.error.clone(),
            filas_leidas: self.filas_leidas as i64,
            observaciones: self.observaciones as i64,
            descartadas: self.dropped() as i64,
            detalle: serde_json::json!({
                "etapa": self.etapa,
                "dialecto": self.dialecto,
                "descartes": self.descartes,
                "fuera_de_banda": self.fuera_de_banda,
                "huecos_ccaa": self.huecos_ccaa,
                "upsert": self.upsert,
            }),
            iniciado_en: self.iniciado_en.clone(),
            finalizado_en: self.finalizado_en.clone(),
        }
    }
}

/// Structured summary printed by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub huella: String,
    /// Version committed by this run, or the active one on a no-op
    pub version_datos: Option<i64>,
    /// Fingerprint matched the active snapshot; nothing was written
    pub sin_cambios: bool,
    pub dry_run: bool,
    pub files: Vec<FileReport>,
    /// Catalogue tables with no file in the snapshot directory
    pub ausentes: Vec<String>,
    pub upsert: UpsertStats,
    pub filas_eliminadas: usize,
    /// Canonical rows of the resolved batch (dry run only)
    pub filas_canonicas: Option<usize>,
}

impl IngestSummary {
    pub fn files_ok(&self) -> usize {
        self.files.iter().filter(|f| f.ok()).count()
    }

    pub fn files_failed(&self) -> usize {
        self.files
            .iter()
            .filter(|f| f.estado == FileState::Failed)
            .count()
    }

    pub fn rows_dropped_by_reason(&self) -> BTreeMap<DropReason, usize> {
        let mut total = BTreeMap::new();
        for f in &self.files {
            for (reason, n) in &f.descartes {
                *total.entry(*reason).or_insert(0) += n;
            }
        }
        total
    }

    pub fn fuera_de_banda(&self) -> usize {
        self.files.iter().map(|f| f.fuera_de_banda).sum()
    }

    /// `fuente -> missing CCAA codes`, only for files with gaps.
    pub fn huecos_ccaa(&self) -> BTreeMap<String, Vec<String>> {
        self.files
            .iter()
            .filter(|f| !f.huecos_ccaa.is_empty())
            .map(|f| (f.fuente_tabla.clone(), f.huecos_ccaa.clone()))
            .collect()
    }
}

// =============================================================================
// DISCOVERY AND FINGERPRINT
// =============================================================================

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// `<codigo>.csv` or `<codigo>_*.csv`, case-insensitive extension.
fn matches_table(name: &str, codigo: &str) -> bool {
    let lower = name.to_lowercase();
    let Some(stem) = lower.strip_suffix(".csv") else {
        return false;
    };
    stem == codigo
        || stem
            .strip_prefix(codigo)
            .is_some_and(|rest| rest.starts_with('_'))
}

/// One file per active catalogue table, keyed and ordered by table code.
/// When several files match, the lexicographically greatest name wins.
pub fn discover(dir: &Path, catalogue: &Catalogue) -> Result<BTreeMap<String, PathBuf>> {
    if !dir.is_dir() {
        return Err(EtclError::Config(format!(
            "snapshot_dir {} is not a directory",
            dir.display()
        )));
    }

    let mut names: Vec<String> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();

    let mut found = BTreeMap::new();
    for tabla in catalogue.tablas.iter().filter(|t| t.activa) {
        if let Some(name) = names.iter().rev().find(|n| matches_table(n, &tabla.codigo)) {
            found.insert(tabla.codigo.clone(), dir.join(name));
        }
    }
    Ok(found)
}

/// sha256 over the catalogue and every (file name, bytes) pair in code order.
pub fn fingerprint(catalogue: &Catalogue, files: &[(String, Vec<u8>)]) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(catalogue)?);
    for (name, bytes) in files {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    Ok(format!("sha256:{:x}", hasher.finalize()))
}

// =============================================================================
// PER-FILE STAGES
// =============================================================================

/// Pure stages (READING -> MAPPED -> BUILT). Returns the file's batch, or None
/// after marking the report FAILED.
fn build_file(
    tabla: &SourceTable,
    bytes: &[u8],
    opts: &BuildOptions,
    report: &mut FileReport,
) -> Option<Vec<Observation>> {
    report.advance(FileState::Reading);
    let raw = match reader::read_bytes(bytes, &report.archivo) {
        Ok(raw) => raw,
        Err(e) => {
            report.fail(&e);
            return None;
        }
    };
    report.dialecto = Some(raw.dialect.describe());
    report.filas_leidas = raw.rows.len();

    let map = match mapper::map_columns(tabla, &raw.header) {
        Ok(map) => map,
        Err(e) => {
            report.fail(&e);
            return None;
        }
    };
    report.advance(FileState::Mapped);

    let outcome = match builder::build(tabla, &map, &raw, opts) {
        Ok(outcome) => outcome,
        Err(e) => {
            report.fail(&e);
            return None;
        }
    };
    report.advance(FileState::Built);
    report.observaciones = outcome.observations.len();
    report.descartes = outcome.descartes;
    report.fuera_de_banda = outcome.fuera_de_banda;
    report.huecos_ccaa = outcome.huecos_ccaa;

    info!(
        fuente = %tabla.codigo,
        archivo = %report.archivo,
        dialecto = report.dialecto.as_deref().unwrap_or_default(),
        filas = report.filas_leidas,
        observaciones = report.observaciones,
        descartadas = report.dropped(),
        "File built"
    );
    Some(outcome.observations)
}

/// UPSERTED -> VALIDATED inside a savepoint; a failure rolls the file back.
async fn store_file(
    conn: &mut SqliteConnection,
    batch: &[Observation],
    version_datos: i64,
    fecha_carga: &str,
    report: &mut FileReport,
) -> Result<()> {
    let mut savepoint = sqlx::Connection::begin(&mut *conn).await?;

    let staged = async {
        let stats = store::upsert(&mut savepoint, batch, version_datos, fecha_carga).await?;
        report.advance(FileState::Upserted);
        let mismatched = store::verify_batch(&mut savepoint, batch).await?;
        if let Some(clave) = mismatched.first() {
            return Err(EtclError::StoredValue {
                columna: "valor".to_string(),
                valor: clave.clone(),
            });
        }
        Ok::<UpsertStats, EtclError>(stats)
    }
    .await;

    match staged {
        Ok(stats) => {
            savepoint.commit().await?;
            report.upsert = stats;
            report.advance(FileState::Validated);
            report.finish();
        }
        Err(e) => {
            savepoint.rollback().await?;
            report.fail(&e);
        }
    }
    Ok(())
}

// =============================================================================
// RUN
// =============================================================================

/// Load every catalogue table found in the snapshot directory.
///
/// File-level failures are reported, not raised; the run commits whatever
/// files succeeded. Errors: configuration problems, store failures, and
/// `Cancelled` when `cancel` is set between files (the run is rolled back).
pub async fn ingest(
    store: &Store,
    catalogue: &Catalogue,
    opts: &IngestOptions,
    cancel: &AtomicBool,
) -> Result<IngestSummary> {
    let run_id = Uuid::new_v4();
    let found = discover(&opts.snapshot_dir, catalogue)?;
    let ausentes: Vec<String> = catalogue
        .tablas
        .iter()
        .filter(|t| t.activa && !found.contains_key(&t.codigo))
        .map(|t| t.codigo.clone())
        .collect();
    for codigo in &ausentes {
        info!(fuente = %codigo, "No file in snapshot directory (ausente)");
    }

    let mut files: Vec<(String, Vec<u8>)> = Vec::with_capacity(found.len());
    for path in found.values() {
        files.push((file_name(path), std::fs::read(path)?));
    }
    let huella = fingerprint(catalogue, &files)?;
    info!(%run_id, archivos = files.len(), %huella, "Snapshot discovered");

    let build_opts = BuildOptions {
        fail_on_unmapped_label: catalogue.fail_on_unmapped_label,
        strict: opts.strict,
        plausibility_band_hours: catalogue.plausibility_band_hours,
    };

    let mut summary = IngestSummary {
        run_id,
        huella: huella.clone(),
        version_datos: None,
        sin_cambios: false,
        dry_run: opts.dry_run,
        files: Vec::new(),
        ausentes,
        upsert: UpsertStats::default(),
        filas_eliminadas: 0,
        filas_canonicas: None,
    };

    let tablas: Vec<&SourceTable> = found
        .keys()
        .filter_map(|codigo| catalogue.tabla(codigo))
        .collect();

    if opts.dry_run {
        let mut all = Vec::new();
        for (tabla, (name, bytes)) in tablas.iter().zip(&files) {
            let mut report = FileReport::new(tabla, Path::new(name));
            if let Some(batch) = build_file(tabla, bytes, &build_opts, &mut report) {
                report.advance(FileState::Validated);
                report.finish();
                all.extend(batch);
            }
            summary.files.push(report);
        }
        let canonical = canonicalize(&all, &Preference::new(&catalogue.preferred_sources));
        summary.filas_canonicas = Some(canonical.len());
        info!(observaciones = all.len(), canonicas = canonical.len(), "Dry run, store untouched");
        return Ok(summary);
    }

    let mut tx = store.pool().begin().await?;

    if let Some(active) = store::active_snapshot(&mut tx).await? {
        if active.huella == huella && active.archivos_fallidos == 0 && !opts.force {
            tx.rollback().await?;
            info!(
                version_datos = active.version_datos,
                "Snapshot unchanged since the active version, nothing to do (use --force to reload)"
            );
            summary.version_datos = Some(active.version_datos);
            summary.sin_cambios = true;
            return Ok(summary);
        }
    }

    let version_datos = store::next_version(&mut tx).await?;
    let fecha_carga = Utc::now().to_rfc3339();
    store::sync_catalogue(&mut tx, catalogue).await?;

    let mut vistas: HashSet<String> = HashSet::new();
    let mut fuentes_ok: Vec<String> = Vec::new();

    for (tabla, (name, bytes)) in tablas.iter().zip(&files) {
        if cancel.load(Ordering::SeqCst) {
            tx.rollback().await?;
            warn!(%run_id, procesados = summary.files.len(), "Ingestion cancelled, run rolled back");
            let mut conn = store.pool().acquire().await?;
            for report in &mut summary.files {
                report.fail(&EtclError::Cancelled);
                store::log_file(&mut conn, &report.to_log(run_id, None)).await?;
            }
            return Err(EtclError::Cancelled);
        }

        let mut report = FileReport::new(tabla, Path::new(name));
        if let Some(batch) = build_file(tabla, bytes, &build_opts, &mut report) {
            store_file(&mut tx, &batch, version_datos, &fecha_carga, &mut report).await?;
            if report.ok() {
                vistas.extend(batch.iter().map(Observation::clave));
                fuentes_ok.push(tabla.codigo.clone());
                summary.upsert.add(report.upsert);
            }
        }
        summary.files.push(report);
    }

    if fuentes_ok.is_empty() {
        tx.rollback().await?;
        warn!(%run_id, "No file loaded, no version committed");
    } else {
        summary.filas_eliminadas =
            store::replace_snapshot(&mut tx, version_datos, &fuentes_ok, &vistas).await?;
        store::create_snapshot(
            &mut tx,
            &SnapshotInfo {
                version_datos,
                run_id: run_id.to_string(),
                huella,
                estado: ESTADO_ACTIVA.to_string(),
                archivos_ok: summary.files_ok() as i64,
                archivos_fallidos: summary.files_failed() as i64,
                filas_insertadas: summary.upsert.insertadas as i64,
                filas_actualizadas: summary.upsert.actualizadas as i64,
                filas_eliminadas: summary.filas_eliminadas as i64,
                creado_en: fecha_carga.clone(),
            },
        )
        .await?;
        tx.commit().await?;
        summary.version_datos = Some(version_datos);
        info!(
            %run_id,
            version_datos,
            insertadas = summary.upsert.insertadas,
            actualizadas = summary.upsert.actualizadas,
            eliminadas = summary.filas_eliminadas,
            "Snapshot committed"
        );
    }

    let mut conn = store.pool().acquire().await?;
    for report in &summary.files {
        let version = report.ok().then_some(summary.version_datos).flatten();
        store::log_file(&mut conn, &report.to_log(run_id, version)).await?;
    }

    Ok(summary)
}
