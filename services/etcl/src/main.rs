//! ETCL command line
//!
//! Usage:
//!   etcl ingest --snapshot data/raw [--config config/catalogo.json] [--dry-run] [--force]
//!   etcl validate [--version 3]
//!   etcl query --periodo 2025T1 [--ambito CCAA --ccaa 13] [--jornada COMPLETA]
//!   etcl series [--ccaa 13]
//!   etcl ranking --periodo 2025T1
//!   etcl stats
//!   etcl rollback --to 2
//!
//! Exit codes: 0 success, 2 validation failure, 3 ingestion failure,
//! 4 unrecognized configuration.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use etcl::config::Catalogue;
use etcl::labels;
use etcl::metrics::{self, SliceMetrics};
use etcl::model::{Ambito, CnaeNivel, Periodo, Slice, TipoJornada};
use etcl::pipeline::{self, IngestOptions, IngestSummary};
use etcl::store::{self, Store};
use etcl::validation::{self, Estado, Thresholds, ValidationReport};
use etcl::EtclError;

const EXIT_VALIDATION: u8 = 2;
const EXIT_INGESTION: u8 = 3;
const EXIT_CONFIG: u8 = 4;

#[derive(Parser, Debug)]
#[command(name = "etcl", about = "Canonicalizes INE ETCL tables and computes absenteeism rates")]
struct Cli {
    /// Catalogue file (default: the bundled config/catalogo.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Store file (overrides ETCL_DB_PATH and db_path)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Machine-readable output
    #[arg(long, global = true, default_value = "false")]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load every catalogue table found in the snapshot directory
    Ingest {
        /// Directory holding the <codigo>.csv files
        #[arg(long)]
        snapshot: Option<PathBuf>,

        /// Dry run - read, map and resolve without touching the store
        #[arg(long, default_value = "false")]
        dry_run: bool,

        /// Commit a new version even if the snapshot is unchanged
        #[arg(long, default_value = "false")]
        force: bool,

        /// Make out-of-range values fatal for their file
        #[arg(long, default_value = "false")]
        strict: bool,
    },

    /// Run the validation harness against a store version.
    /// Reference values are the set stored by the last ingest; --config
    /// only supplies the thresholds.
    Validate {
        /// version_datos to validate (default: the active one)
        #[arg(long)]
        version: Option<i64>,
    },

    /// Print the MetricResult of one slice
    Query {
        #[arg(long)]
        periodo: Periodo,

        #[command(flatten)]
        slice: SliceArgs,
    },

    /// MetricResult of one slice in every stored periodo
    Series {
        #[command(flatten)]
        slice: SliceArgs,
    },

    /// tasa de absentismo per CCAA, highest first
    Ranking {
        #[arg(long)]
        periodo: Periodo,

        #[arg(long, default_value = "TOTAL")]
        jornada: TipoJornada,
    },

    /// Store statistics and snapshot register
    Stats,

    /// Restore the store to an earlier version
    Rollback {
        #[arg(long)]
        to: i64,
    },
}

#[derive(Args, Debug, Clone)]
struct SliceArgs {
    /// NAC or CCAA (default: CCAA when --ccaa is given)
    #[arg(long)]
    ambito: Option<Ambito>,

    /// CCAA code 01-19
    #[arg(long)]
    ccaa: Option<String>,

    #[arg(long, default_value = "TOTAL")]
    cnae_nivel: CnaeNivel,

    /// CNAE code (sector letter, section letter or division number)
    #[arg(long)]
    cnae: Option<String>,

    #[arg(long, default_value = "TOTAL")]
    jornada: TipoJornada,
}

impl SliceArgs {
    fn slice(&self, periodo: Periodo) -> Result<Slice, EtclError> {
        let ccaa_codigo = match &self.ccaa {
            None => None,
            Some(raw) => {
                let code = format!("{:0>2}", raw.trim());
                if labels::ccaa_nombre(&code).is_none() {
                    return Err(EtclError::Config(format!("unknown CCAA code '{}'", raw)));
                }
                Some(code)
            }
        };
        let ambito = self.ambito.unwrap_or(if ccaa_codigo.is_some() {
            Ambito::Ccaa
        } else {
            Ambito::Nac
        });
        if (ambito == Ambito::Ccaa) != ccaa_codigo.is_some() {
            return Err(EtclError::Config(
                "--ambito CCAA requires --ccaa, and --ccaa requires --ambito CCAA".to_string(),
            ));
        }
        if (self.cnae_nivel == CnaeNivel::Total) != self.cnae.is_none() {
            return Err(EtclError::Config(
                "--cnae is required for every --cnae-nivel except TOTAL".to_string(),
            ));
        }
        Ok(Slice {
            periodo,
            ambito,
            ccaa_codigo,
            cnae_nivel: self.cnae_nivel,
            cnae_codigo: self.cnae.as_ref().map(|c| c.trim().to_uppercase()),
            tipo_jornada: self.jornada,
        })
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("etcl=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_file(cfg!(debug_assertions))
        .with_line_number(cfg!(debug_assertions))
        .with_writer(std::io::stderr)
        .init();
}

/// Exit code of the first `EtclError` in the chain; 3 otherwise.
fn exit_code_of(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|e| e.downcast_ref::<EtclError>())
        .map(EtclError::exit_code)
        .unwrap_or(EXIT_INGESTION)
}

fn load_catalogue(path: Option<&PathBuf>) -> Result<Catalogue> {
    let catalogue = match path {
        Some(p) => Catalogue::load(p)?,
        None => Catalogue::bundled()?,
    };
    info!(
        version = %catalogue.version,
        tablas = catalogue.tablas.len(),
        referencias = catalogue.valores_referencia.len(),
        "Catalogue loaded"
    );
    Ok(catalogue)
}

async fn open_store(catalogue: &Catalogue, cli_db: Option<&PathBuf>) -> Result<Store> {
    let path = catalogue.resolve_db_path(cli_db.map(PathBuf::as_path));
    Store::open(&path)
        .await
        .with_context(|| format!("Failed to open store {}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// =============================================================================
// Output
// =============================================================================

fn print_ingest_summary(summary: &IngestSummary) {
    println!("\n=== Ingestion Summary ===");
    println!("Run: {}", summary.run_id);
    println!("Fingerprint: {}", summary.huella);
    for f in &summary.files {
        let mark = if f.ok() { "✓" } else { "✗" };
        println!(
            "  {} {} ({}) [{}] rows={} observations={} dropped={}",
            mark,
            f.fuente_tabla,
            f.archivo,
            f.estado,
            f.filas_leidas,
            f.observaciones,
            f.dropped()
        );
        if let Some(err) = &f.error {
            println!("      {}", err);
        }
    }
    for codigo in &summary.ausentes {
        println!("  - {} ausente", codigo);
    }
    println!("files_ok: {}", summary.files_ok());
    println!("files_failed: {}", summary.files_failed());
    let dropped = summary.rows_dropped_by_reason();
    if dropped.is_empty() {
        println!("rows_dropped_by_reason: none");
    } else {
        println!("rows_dropped_by_reason:");
        for (reason, n) in &dropped {
            println!("  {}: {}", reason, n);
        }
    }
    if summary.fuera_de_banda() > 0 {
        println!("fuera_de_banda: {}", summary.fuera_de_banda());
    }
    for (fuente, huecos) in summary.huecos_ccaa() {
        println!("coverage gap {}: CCAA {}", fuente, huecos.join(", "));
    }

    if summary.dry_run {
        println!(
            "Dry run - would resolve {} canonical rows",
            summary.filas_canonicas.unwrap_or(0)
        );
    } else if summary.sin_cambios {
        println!(
            "Snapshot unchanged - version_datos stays {}",
            summary.version_datos.unwrap_or_default()
        );
    } else if let Some(v) = summary.version_datos {
        println!(
            "version_datos: {} (inserted {}, updated {}, unchanged {}, retired {})",
            v,
            summary.upsert.insertadas,
            summary.upsert.actualizadas,
            summary.upsert.sin_cambios,
            summary.filas_eliminadas
        );
    } else {
        println!("No version committed");
    }
}

fn print_validation(report: &ValidationReport) {
    println!("\n=== Validation Report ===");
    match report.version_datos {
        Some(v) => println!("version_datos: {}", v),
        None => println!("version_datos: none (empty store)"),
    }
    for c in &report.checks {
        let mark = match c.estado {
            Estado::Ok => "✓",
            Estado::Aviso => "⚠",
            Estado::Fallo => "✗",
        };
        println!("  {} {} [{}] {}", mark, c.nombre, c.estado, c.detalle);
        for i in &c.incidencias {
            println!("      {}", i);
        }
        if c.omitidas > 0 {
            println!("      ... {} more", c.omitidas);
        }
    }
    if !report.referencias.is_empty() {
        println!("References:");
        for r in &report.referencias {
            let store = r
                .valor_store
                .map(|v| format!("{:.2}", v))
                .unwrap_or_else(|| "NA".to_string());
            println!(
                "  [{}] {} INE={:.2} store={}",
                r.estado, r.referencia, r.valor_ine, store
            );
        }
    }
    println!("Result: {}", if report.passed() { "PASS" } else { "FAIL" });
}

fn print_metrics(result: &SliceMetrics) {
    match result {
        SliceMetrics::Computed(r) => {
            for (key, value) in r.key_values() {
                println!("{}={}", key, value);
            }
            for aviso in &r.avisos {
                println!("# aviso: {}", aviso);
            }
        }
        SliceMetrics::InsufficientData { slice, motivo } => {
            println!("slice={}", slice);
            println!("estado=insufficient_data");
            println!("motivo={}", motivo);
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

async fn run(cli: Cli) -> Result<u8> {
    let catalogue = load_catalogue(cli.config.as_ref())?;

    match cli.command {
        Command::Ingest {
            snapshot,
            dry_run,
            force,
            strict,
        } => {
            let opts = IngestOptions {
                snapshot_dir: catalogue.resolve_snapshot_dir(snapshot.as_deref())?,
                dry_run,
                force,
                strict,
            };
            if !cli.json {
                println!("=== ETCL Ingest ===");
                println!("Snapshot: {}", opts.snapshot_dir.display());
                println!("Mode: {}", if dry_run { "dry-run" } else { "live" });
            }

            let store = if dry_run {
                Store::in_memory().await?
            } else {
                open_store(&catalogue, cli.db.as_ref()).await?
            };
            let cancel = Arc::new(AtomicBool::new(false));
            let flag = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Cancellation requested, stopping after the current file");
                    flag.store(true, Ordering::SeqCst);
                }
            });

            let summary = pipeline::ingest(&store, &catalogue, &opts, &cancel)
                .await
                .context("Ingestion failed")?;
            store.close().await;

            if cli.json {
                print_json(&summary)?;
            } else {
                print_ingest_summary(&summary);
            }
            Ok(if summary.files_failed() > 0 { EXIT_INGESTION } else { 0 })
        }

        Command::Validate { version } => {
            let store = open_store(&catalogue, cli.db.as_ref()).await?;
            let mut conn = store.pool().acquire().await?;
            let stored = store::fetch_references(&mut conn).await?;
            drop(conn);
            if !stored.is_empty() && !validation::references_match(&catalogue, &stored) {
                warn!(
                    catalogo = catalogue.valores_referencia.len(),
                    almacen = stored.len(),
                    "Catalogue reference values differ from the store's; validating against the stored set (re-ingest to replace it)"
                );
            }
            let report =
                validation::run_at_version(store.pool(), &Thresholds::from(&catalogue), version)
                    .await
                    .context("Validation could not run")?;
            store.close().await;

            if cli.json {
                print_json(&report)?;
            } else {
                print_validation(&report);
            }
            Ok(if report.passed() { 0 } else { EXIT_VALIDATION })
        }

        Command::Query { periodo, slice } => {
            let slice = slice.slice(periodo)?;
            let store = open_store(&catalogue, cli.db.as_ref()).await?;
            let mut conn = store.pool().acquire().await?;
            let result = metrics::compute_slice(&mut conn, &slice).await?;
            drop(conn);
            store.close().await;

            if cli.json {
                print_json(&result)?;
            } else {
                print_metrics(&result);
            }
            Ok(0)
        }

        Command::Series { slice } => {
            let store = open_store(&catalogue, cli.db.as_ref()).await?;
            let mut conn = store.pool().acquire().await?;
            let periodos = store::periodos(&mut conn).await?;
            let results = match periodos.first() {
                Some(first) => metrics::series(&mut conn, &slice.slice(*first)?).await?,
                None => Vec::new(),
            };
            drop(conn);
            store.close().await;

            if cli.json {
                print_json(&results)?;
            } else {
                println!("=== Series ===");
                for r in &results {
                    println!("\n[{}]", r.slice().periodo);
                    print_metrics(r);
                }
                if results.is_empty() {
                    println!("No data for this slice");
                }
            }
            Ok(0)
        }

        Command::Ranking { periodo, jornada } => {
            let store = open_store(&catalogue, cli.db.as_ref()).await?;
            let mut conn = store.pool().acquire().await?;
            let entries = metrics::ranking(&mut conn, periodo, jornada).await?;
            drop(conn);
            store.close().await;

            if cli.json {
                print_json(&entries)?;
            } else {
                println!("=== Ranking {} ({}) ===", periodo, jornada);
                let num = |v: Option<f64>| {
                    v.map(|x| format!("{:.2}", x))
                        .unwrap_or_else(|| "NA".to_string())
                };
                for (i, e) in entries.iter().enumerate() {
                    println!(
                        "{:>2}. {} {:<40} tasa={} tasa_it={}",
                        i + 1,
                        e.ccaa_codigo,
                        e.ccaa_nombre.as_deref().unwrap_or("-"),
                        num(e.tasa_absentismo),
                        num(e.tasa_it)
                    );
                }
            }
            Ok(0)
        }

        Command::Stats => {
            let store = open_store(&catalogue, cli.db.as_ref()).await?;
            let mut conn = store.pool().acquire().await?;
            let mut stats = store::stats(&mut conn).await?;
            let snapshots = store::list_snapshots(&mut conn).await?;
            drop(conn);
            stats.tamano_bytes = store.file_size();
            store.close().await;

            if cli.json {
                print_json(&serde_json::json!({ "stats": stats, "snapshots": snapshots }))?;
            } else {
                println!("=== Store Statistics ===");
                println!("Rows: {} ({} canonical)", stats.filas, stats.filas_canonicas);
                println!("By fuente:");
                for (fuente, n) in &stats.por_fuente {
                    println!("  {}: {}", fuente, n);
                }
                println!("By métrica:");
                for (metrica, n) in &stats.por_metrica {
                    println!("  {}: {}", metrica, n);
                }
                println!("Latest periodos: {}", stats.ultimos_periodos.join(", "));
                match stats.version_activa {
                    Some(v) => println!("Active version: {}", v),
                    None => println!("Active version: none"),
                }
                if let Some(bytes) = stats.tamano_bytes {
                    println!("Store size: {:.1} KiB", bytes as f64 / 1024.0);
                }
                println!("{:-<60}", "");
                for s in &snapshots {
                    println!(
                        "  v{} [{}] {} ok={} failed={} +{} ~{} -{}",
                        s.version_datos,
                        s.estado,
                        s.creado_en,
                        s.archivos_ok,
                        s.archivos_fallidos,
                        s.filas_insertadas,
                        s.filas_actualizadas,
                        s.filas_eliminadas
                    );
                }
            }
            Ok(0)
        }

        Command::Rollback { to } => {
            let store = open_store(&catalogue, cli.db.as_ref()).await?;
            let mut tx = store.pool().begin().await?;
            let undone = store::rollback_to(&mut tx, to).await?;
            tx.commit().await?;
            store.close().await;

            if cli.json {
                print_json(&undone)?;
            } else {
                println!("=== Rollback ===");
                println!("Active version: {}", to);
                println!(
                    "Reverted versions: {:?} ({} changes undone)",
                    undone.revertidas, undone.cambios_deshechos
                );
            }
            Ok(0)
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() { EXIT_CONFIG } else { 0 };
            let _ = err.print();
            return ExitCode::from(code);
        }
    };

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::from(exit_code_of(&err))
        }
    }
}
