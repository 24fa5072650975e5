//! Validation Harness
//!
//! Checks run against one store version:
//! - unicidad: strict identity keys unique and consistent with their columns,
//!   at most one canonical row per logical identity
//! - cobertura_nacional: every periodo has its NAC/TOTAL/TOTAL horas_pactadas row
//! - plausibilidad: HP/HE and HPE inside the band, rates inside [0, 30]
//! - referencias: frozen INE values within 0.1 for 90% of entries, 0.5 for all
//! - identidad_aritmetica (warning): HE ~ HP + HEXT - HNT_total
//! - agregados (warning): every aggregate causa ~ sum of its components
//!
//! Validation never mutates the store: historical versions are validated inside
//! a transaction that is rolled back.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{info, warn};

use crate::config::{Catalogue, Derivada, Indicador, ReferenceValue};
use crate::error::{EtclError, Result};
use crate::metrics::{compute, MetricResult, SliceMetrics};
use crate::model::{code_enum, Ambito, Causa, CnaeNivel, Metrica, Periodo, Slice, TipoJornada};
use crate::resolver::{by_slice, CanonicalRow};
use crate::store::{self, RowFilter, StoredRow, ESTADO_ACTIVA};

pub const REFERENCE_TOLERANCE: f64 = 0.1;
pub const REFERENCE_MAX_DEVIATION: f64 = 0.5;
pub const REFERENCE_QUOTA: f64 = 0.9;
pub const AGGREGATE_TOLERANCE: f64 = 0.1;
pub const RATE_BAND: (f64, f64) = (0.0, 30.0);

/// Incidents listed per check before truncation.
const MAX_INCIDENCIAS: usize = 20;

code_enum!(Estado {
    Ok => "ok",
    Aviso => "aviso",
    Fallo => "fallo",
});

code_enum!(
    /// Outcome of one reference entry.
    EstadoReferencia {
        Ok => "ok",
        Tolerado => "tolerado",
        Fallo => "fallo",
        SinPeriodo => "sin_periodo",
    }
);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckOutcome {
    pub nombre: &'static str,
    pub estado: Estado,
    pub detalle: String,
    pub incidencias: Vec<String>,
    /// Incidents beyond the listed ones
    pub omitidas: usize,
}

impl CheckOutcome {
    fn from_incidencias(
        nombre: &'static str,
        si_hay: Estado,
        detalle_ok: String,
        incidencias: Vec<String>,
    ) -> Self {
        if incidencias.is_empty() {
            return Self {
                nombre,
                estado: Estado::Ok,
                detalle: detalle_ok,
                incidencias,
                omitidas: 0,
            };
        }
        let total = incidencias.len();
        let omitidas = total.saturating_sub(MAX_INCIDENCIAS);
        Self {
            nombre,
            estado: si_hay,
            detalle: format!("{} incidencia(s)", total),
            incidencias: incidencias.into_iter().take(MAX_INCIDENCIAS).collect(),
            omitidas,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceCheck {
    pub referencia: String,
    pub valor_ine: f64,
    pub valor_store: Option<f64>,
    pub diferencia: Option<f64>,
    pub estado: EstadoReferencia,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub version_datos: Option<i64>,
    pub checks: Vec<CheckOutcome>,
    pub referencias: Vec<ReferenceCheck>,
}

impl ValidationReport {
    /// No check failed (warnings allowed).
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.estado != Estado::Fallo)
    }

    pub fn check(&self, nombre: &str) -> Option<&CheckOutcome> {
        self.checks.iter().find(|c| c.nombre == nombre)
    }
}

/// Thresholds taken from the catalogue.
#[derive(Debug, Clone)]
pub struct Thresholds {
    pub plausibility_band_hours: (f64, f64),
    pub identity_tolerance: f64,
}

impl From<&Catalogue> for Thresholds {
    fn from(c: &Catalogue) -> Self {
        Self {
            plausibility_band_hours: c.plausibility_band_hours,
            identity_tolerance: c.identity_tolerance,
        }
    }
}

/// Whether `catalogue` carries the same reference set as the store.
/// Validation always reads the stored set, written by the last ingest.
pub fn references_match(catalogue: &Catalogue, stored: &[ReferenceValue]) -> bool {
    catalogue.valores_referencia.as_slice() == stored
}

// =============================================================================
// CHECKS
// =============================================================================

fn check_unicidad(raw: &[StoredRow], canonical: &[CanonicalRow]) -> CheckOutcome {
    let mut incidencias = Vec::new();
    let mut claves = HashSet::new();
    for row in raw {
        if !claves.insert(row.clave.as_str()) {
            incidencias.push(format!("clave repetida: {}", row.clave));
        }
        match row.to_observation() {
            Ok(obs) if obs.clave() != row.clave => incidencias.push(format!(
                "clave {} no coincide con sus columnas ({})",
                row.clave,
                obs.clave()
            )),
            Ok(_) => {}
            Err(e) => incidencias.push(format!("fila {} ilegible: {}", row.clave, e)),
        }
    }

    let mut logicas = HashSet::new();
    for row in canonical {
        let clave = row.observation.clave_logica();
        if !logicas.insert(clave.clone()) {
            incidencias.push(format!("vista canónica repite {}", clave));
        }
    }

    CheckOutcome::from_incidencias(
        "unicidad",
        Estado::Fallo,
        format!("{} filas, {} canónicas", raw.len(), canonical.len()),
        incidencias,
    )
}

fn check_cobertura_nacional(periodos: &[Periodo], canonical: &[CanonicalRow]) -> CheckOutcome {
    let con_hp: BTreeMap<Periodo, usize> = canonical
        .iter()
        .filter(|r| {
            let o = &r.observation;
            o.ambito == Ambito::Nac
                && o.cnae_nivel == CnaeNivel::Total
                && o.tipo_jornada == TipoJornada::Total
                && o.metrica == Metrica::HorasPactadas
                && o.causa.is_none()
        })
        .fold(BTreeMap::new(), |mut acc, r| {
            *acc.entry(r.observation.periodo).or_insert(0) += 1;
            acc
        });

    let incidencias = periodos
        .iter()
        .filter_map(|p| match con_hp.get(p) {
            Some(1) => None,
            Some(n) => Some(format!("{}: {} filas NAC/TOTAL/TOTAL horas_pactadas", p, n)),
            None => Some(format!("{}: sin fila NAC/TOTAL/TOTAL horas_pactadas", p)),
        })
        .collect();

    CheckOutcome::from_incidencias(
        "cobertura_nacional",
        Estado::Fallo,
        format!("{} periodos", periodos.len()),
        incidencias,
    )
}

fn check_plausibilidad(
    raw: &[StoredRow],
    results: &[MetricResult],
    thresholds: &Thresholds,
) -> CheckOutcome {
    let (min, max) = thresholds.plausibility_band_hours;
    let in_band = |v: f64| (min..=max).contains(&v);
    let in_rates = |v: f64| (RATE_BAND.0..=RATE_BAND.1).contains(&v);
    let mut incidencias = Vec::new();

    for row in raw {
        let banded = row.metrica == Metrica::HorasPactadas.as_str()
            || row.metrica == Metrica::HorasEfectivas.as_str();
        if !row.valor.is_finite() || (banded && !in_band(row.valor)) {
            incidencias.push(format!("{} = {} fuera de [{}, {}]", row.clave, row.valor, min, max));
        }
    }

    for r in results {
        if !in_band(r.hpe) {
            incidencias.push(format!("{} HPE = {:.2} fuera de [{}, {}]", r.slice, r.hpe, min, max));
        }
        for (nombre, tasa) in [("tasa_absentismo", r.tasa_absentismo), ("tasa_it", r.tasa_it)] {
            if let Some(t) = tasa {
                if !in_rates(t) {
                    incidencias.push(format!(
                        "{} {} = {:.2} fuera de [{}, {}]",
                        r.slice, nombre, t, RATE_BAND.0, RATE_BAND.1
                    ));
                }
            }
        }
    }

    CheckOutcome::from_incidencias(
        "plausibilidad",
        Estado::Fallo,
        format!("banda [{}, {}], tasas [{}, {}]", min, max, RATE_BAND.0, RATE_BAND.1),
        incidencias,
    )
}

fn check_identidad(results: &[MetricResult], thresholds: &Thresholds) -> CheckOutcome {
    let tol = thresholds.identity_tolerance;
    let mut evaluadas = 0;
    let incidencias = results
        .iter()
        .filter_map(|r| {
            let he = r.he?;
            evaluadas += 1;
            let esperado = r.hp + r.hext - r.hnt_total;
            let desvio = (he - esperado).abs();
            (desvio > tol + 1e-9).then(|| {
                format!(
                    "ArithmeticIdentityViolation {}: HE {:.2} vs HP+HEXT-HNT {:.2} (desvío {:.2})",
                    r.slice, he, esperado, desvio
                )
            })
        })
        .collect();

    CheckOutcome::from_incidencias(
        "identidad_aritmetica",
        Estado::Aviso,
        format!("{} slices con HE, tolerancia {}", evaluadas, tol),
        incidencias,
    )
}

fn hnt_causa(rows: &[CanonicalRow], causa: Causa) -> Option<f64> {
    rows.iter()
        .find(|r| {
            r.observation.metrica == Metrica::HorasNoTrabajadas && r.observation.causa == Some(causa)
        })
        .map(|r| r.observation.valor)
}

/// Value of a causa, rebuilt from its components when the aggregate row is absent.
fn causa_resuelta(rows: &[CanonicalRow], causa: Causa) -> Option<f64> {
    hnt_causa(rows, causa).or_else(|| suma_componentes(rows, causa))
}

/// Sum of the direct components of an aggregate; None unless all are present.
/// A component nested under another listed aggregate is counted through it.
fn suma_componentes(rows: &[CanonicalRow], agregado: Causa) -> Option<f64> {
    let partes = agregado.componentes();
    if partes.is_empty() {
        return None;
    }
    partes
        .iter()
        .filter(|c| !partes.iter().any(|p| p.componentes().contains(c)))
        .map(|c| causa_resuelta(rows, *c))
        .sum()
}

fn check_agregados(grouped: &BTreeMap<Slice, Vec<CanonicalRow>>) -> CheckOutcome {
    let mut incidencias = Vec::new();
    for (slice, rows) in grouped {
        for agregado in [Causa::VacacionesYFiestas, Causa::PagadasAgregado, Causa::NoPagadasAgregado] {
            let (Some(total), Some(suma)) = (hnt_causa(rows, agregado), suma_componentes(rows, agregado))
            else {
                continue;
            };
            if (total - suma).abs() > AGGREGATE_TOLERANCE + 1e-9 {
                incidencias.push(format!(
                    "{} {} {:.2} vs suma de componentes {:.2}",
                    slice, agregado, total, suma
                ));
            }
        }
    }
    CheckOutcome::from_incidencias(
        "agregados",
        Estado::Aviso,
        format!("tolerancia {}", AGGREGATE_TOLERANCE),
        incidencias,
    )
}

fn reference_value(
    reference: &ReferenceValue,
    grouped: &BTreeMap<Slice, Vec<CanonicalRow>>,
) -> Option<f64> {
    let slice = reference.slice();
    let rows = grouped.get(&slice)?;
    match reference.metrica {
        Indicador::Observada(metrica) => rows
            .iter()
            .find(|r| r.observation.metrica == metrica && r.observation.causa == reference.causa)
            .map(|r| r.observation.valor),
        Indicador::Derivada(derivada) => {
            let result = match compute(&slice, rows) {
                SliceMetrics::Computed(r) => r,
                SliceMetrics::InsufficientData { .. } => return None,
            };
            match derivada {
                Derivada::Hpe => Some(result.hpe),
                Derivada::Hntmo => Some(result.hnt_mo),
                Derivada::TasaAbsentismo => result.tasa_absentismo,
                Derivada::TasaIt => result.tasa_it,
            }
        }
    }
}

fn check_referencias(
    references: &[ReferenceValue],
    periodos: &BTreeSet<Periodo>,
    grouped: &BTreeMap<Slice, Vec<CanonicalRow>>,
) -> (CheckOutcome, Vec<ReferenceCheck>) {
    let checks: Vec<ReferenceCheck> = references
        .iter()
        .map(|reference| {
            if !periodos.contains(&reference.periodo) {
                return ReferenceCheck {
                    referencia: reference.describe(),
                    valor_ine: reference.valor_ine,
                    valor_store: None,
                    diferencia: None,
                    estado: EstadoReferencia::SinPeriodo,
                };
            }
            let valor_store = reference_value(reference, grouped);
            let diferencia = valor_store.map(|v| (v - reference.valor_ine).abs());
            let estado = match diferencia {
                Some(d) if d <= REFERENCE_TOLERANCE + 1e-9 => EstadoReferencia::Ok,
                Some(d) if d <= REFERENCE_MAX_DEVIATION + 1e-9 => EstadoReferencia::Tolerado,
                _ => EstadoReferencia::Fallo,
            };
            ReferenceCheck {
                referencia: reference.describe(),
                valor_ine: reference.valor_ine,
                valor_store,
                diferencia,
                estado,
            }
        })
        .collect();

    let evaluadas = checks
        .iter()
        .filter(|c| c.estado != EstadoReferencia::SinPeriodo)
        .count();
    let ok = checks
        .iter()
        .filter(|c| c.estado == EstadoReferencia::Ok)
        .count();
    let fallos: Vec<String> = checks
        .iter()
        .filter(|c| c.estado == EstadoReferencia::Fallo)
        .map(|c| match (c.valor_store, c.diferencia) {
            (Some(v), Some(d)) => format!(
                "{}: store {:.2} vs INE {:.2} (desvío {:.2})",
                c.referencia, v, c.valor_ine, d
            ),
            _ => format!("{}: sin valor en el store (INE {:.2})", c.referencia, c.valor_ine),
        })
        .collect();
    let sin_periodo = checks.len() - evaluadas;

    let outcome = if evaluadas == 0 {
        CheckOutcome {
            nombre: "referencias",
            estado: Estado::Aviso,
            detalle: format!(
                "ninguna referencia aplicable ({} sin periodo en el store)",
                sin_periodo
            ),
            incidencias: Vec::new(),
            omitidas: 0,
        }
    } else {
        let cuota = ok as f64 / evaluadas as f64;
        let detalle = format!(
            "{}/{} dentro de {} ({:.0}%), {} sin periodo",
            ok,
            evaluadas,
            REFERENCE_TOLERANCE,
            cuota * 100.0,
            sin_periodo
        );
        let mut incidencias = fallos;
        if cuota + 1e-9 < REFERENCE_QUOTA {
            incidencias.insert(
                0,
                format!(
                    "solo {:.0}% de las referencias dentro de {} (mínimo {:.0}%)",
                    cuota * 100.0,
                    REFERENCE_TOLERANCE,
                    REFERENCE_QUOTA * 100.0
                ),
            );
        }
        CheckOutcome {
            detalle,
            ..CheckOutcome::from_incidencias("referencias", Estado::Fallo, String::new(), incidencias)
        }
    };
    (outcome, checks)
}

// =============================================================================
// HARNESS
// =============================================================================

/// Run every check on the rows currently visible through `conn`.
pub async fn run(
    conn: &mut SqliteConnection,
    thresholds: &Thresholds,
    version_datos: Option<i64>,
) -> Result<ValidationReport> {
    let raw = store::fetch_rows(conn, &RowFilter::default()).await?;
    let canonical = store::fetch_canonical(conn, &RowFilter::default()).await?;
    let periodos = store::periodos(conn).await?;
    let references = store::fetch_references(conn).await?;
    info!(referencias = references.len(), "Reference values read from the store (last ingest)");

    let grouped = by_slice(canonical.clone());
    let results: Vec<MetricResult> = grouped
        .iter()
        .filter_map(|(slice, rows)| match compute(slice, rows) {
            SliceMetrics::Computed(r) => Some(r),
            SliceMetrics::InsufficientData { .. } => None,
        })
        .collect();
    let periodo_set: BTreeSet<Periodo> = periodos.iter().copied().collect();

    let (referencias_check, referencias) = check_referencias(&references, &periodo_set, &grouped);
    let checks = vec![
        check_unicidad(&raw, &canonical),
        check_cobertura_nacional(&periodos, &canonical),
        check_plausibilidad(&raw, &results, thresholds),
        referencias_check,
        check_identidad(&results, thresholds),
        check_agregados(&grouped),
    ];

    for c in &checks {
        match c.estado {
            Estado::Ok => info!(check = c.nombre, "{}", c.detalle),
            Estado::Aviso | Estado::Fallo => {
                warn!(check = c.nombre, estado = %c.estado, "{}", c.detalle)
            }
        }
    }

    Ok(ValidationReport {
        version_datos,
        checks,
        referencias,
    })
}

/// Validate `version` (default: the active snapshot). A historical version is
/// reconstructed inside a transaction that is always rolled back.
///
/// Errors: `UnknownVersion` when `version` is not an active snapshot.
pub async fn run_at_version(
    pool: &SqlitePool,
    thresholds: &Thresholds,
    version: Option<i64>,
) -> Result<ValidationReport> {
    let mut tx = pool.begin().await?;
    let active = store::active_snapshot(&mut tx).await?.map(|s| s.version_datos);

    let target = match version {
        None => active,
        Some(v) => {
            let known = store::snapshot(&mut tx, v).await?;
            if known.map(|s| s.estado) != Some(ESTADO_ACTIVA.to_string()) {
                return Err(EtclError::UnknownVersion(v));
            }
            if Some(v) != active {
                let undone = store::rollback_to(&mut tx, v).await?;
                info!(
                    version = v,
                    revertidas = ?undone.revertidas,
                    "Validating historical version (changes are not kept)"
                );
            }
            Some(v)
        }
    };

    let report = run(&mut tx, thresholds, target).await?;
    tx.rollback().await?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Observation, Rol};

    fn periodo() -> Periodo {
        Periodo::parse("2025T1").unwrap()
    }

    fn canon(
        tipo_jornada: TipoJornada,
        metrica: Metrica,
        causa: Option<Causa>,
        valor: f64,
    ) -> CanonicalRow {
        let observation = Observation {
            periodo: periodo(),
            ambito: Ambito::Nac,
            ccaa_codigo: None,
            ccaa_nombre: None,
            cnae_nivel: CnaeNivel::Total,
            cnae_codigo: None,
            cnae_nombre: None,
            jerarquia_sector: "Total".into(),
            tipo_jornada,
            fuente_tabla: "6042".into(),
            metrica,
            causa,
            valor,
            version_datos: Some(1),
            linea: 0,
        };
        CanonicalRow {
            rol: Rol::of(metrica, causa),
            observation,
            descartadas: vec![],
        }
    }

    fn thresholds() -> Thresholds {
        Thresholds {
            plausibility_band_hours: (40.0, 220.0),
            identity_tolerance: 0.3,
        }
    }

    fn nacional() -> Vec<CanonicalRow> {
        let t = TipoJornada::Total;
        vec![
            canon(t, Metrica::HorasPactadas, None, 151.0),
            canon(t, Metrica::HorasExtraordinarias, None, 1.0),
            canon(t, Metrica::HorasEfectivas, None, 113.0),
            canon(t, Metrica::HorasNoTrabajadas, None, 39.0),
            canon(t, Metrica::HorasNoTrabajadas, Some(Causa::VacacionesYFiestas), 29.6),
            canon(t, Metrica::HorasNoTrabajadas, Some(Causa::RazonesTecnicasEconomicas), 0.4),
            canon(t, Metrica::HorasNoTrabajadas, Some(Causa::ItTotal), 7.1),
        ]
    }

    fn results(rows: &[CanonicalRow]) -> Vec<MetricResult> {
        by_slice(rows.to_vec())
            .iter()
            .filter_map(|(s, r)| compute(s, r).result().cloned())
            .collect()
    }

    fn reference(metrica: Indicador, valor_ine: f64) -> ReferenceValue {
        ReferenceValue {
            periodo: periodo(),
            ambito: Ambito::Nac,
            ccaa_codigo: None,
            cnae_nivel: CnaeNivel::Total,
            cnae_codigo: None,
            tipo_jornada: TipoJornada::Total,
            metrica,
            causa: None,
            valor_ine,
            fuente: None,
        }
    }

    // -------------------------------------------------------------------------
    // IDENTITY AND COVERAGE
    // -------------------------------------------------------------------------

    #[test]
    fn test_arithmetic_identity_holds() {
        let out = check_identidad(&results(&nacional()), &thresholds());
        assert_eq!(out.estado, Estado::Ok);
    }

    #[test]
    fn test_arithmetic_identity_violation_is_warning() {
        let mut rows = nacional();
        rows[2].observation.valor = 120.0;
        let out = check_identidad(&results(&rows), &thresholds());
        assert_eq!(out.estado, Estado::Aviso);
        assert!(out.incidencias[0].contains("ArithmeticIdentityViolation"));
    }

    #[test]
    fn test_national_coverage() {
        let out = check_cobertura_nacional(&[periodo()], &nacional());
        assert_eq!(out.estado, Estado::Ok);

        let later = Periodo::parse("2025T2").unwrap();
        let out = check_cobertura_nacional(&[periodo(), later], &nacional());
        assert_eq!(out.estado, Estado::Fallo);
        assert!(out.incidencias[0].starts_with("2025T2"));
    }

    #[test]
    fn test_canonical_duplicates_detected() {
        let mut rows = nacional();
        rows.push(rows[0].clone());
        let out = check_unicidad(&[], &rows);
        assert_eq!(out.estado, Estado::Fallo);
    }

    // -------------------------------------------------------------------------
    // PLAUSIBILITY
    // -------------------------------------------------------------------------

    #[test]
    fn test_rates_out_of_band_fail() {
        let mut rows = nacional();
        // HNT_total 80 gives tasa ~41%
        rows[3].observation.valor = 80.0;
        let out = check_plausibilidad(&[], &results(&rows), &thresholds());
        assert_eq!(out.estado, Estado::Fallo);
        assert!(out.incidencias.iter().any(|i| i.contains("tasa_absentismo")));
    }

    #[test]
    fn test_plausible_slice_passes() {
        let out = check_plausibilidad(&[], &results(&nacional()), &thresholds());
        assert_eq!(out.estado, Estado::Ok, "{:?}", out.incidencias);
    }

    #[test]
    fn test_negative_hpe_fails_plausibility() {
        let t = TipoJornada::Total;
        let rows = vec![
            canon(t, Metrica::HorasPactadas, None, 50.0),
            canon(t, Metrica::HorasExtraordinarias, None, 0.0),
            canon(t, Metrica::HorasNoTrabajadas, None, 60.0),
            canon(t, Metrica::HorasNoTrabajadas, Some(Causa::VacacionesYFiestas), 60.0),
        ];
        let metricas = results(&rows);
        assert!(metricas[0].hpe < 0.0);
        assert_eq!(metricas[0].tasa_absentismo, None);

        let out = check_plausibilidad(&[], &metricas, &thresholds());
        assert_eq!(out.estado, Estado::Fallo);
        assert!(out.incidencias.iter().any(|i| i.contains("HPE")));
    }

    // -------------------------------------------------------------------------
    // AGGREGATES
    // -------------------------------------------------------------------------

    #[test]
    fn test_aggregate_mismatch_is_warning() {
        let t = TipoJornada::Total;
        let mut rows = nacional();
        rows.push(canon(t, Metrica::HorasNoTrabajadas, Some(Causa::Vacaciones), 20.0));
        rows.push(canon(t, Metrica::HorasNoTrabajadas, Some(Causa::Festivos), 9.55));
        assert_eq!(check_agregados(&by_slice(rows.clone())).estado, Estado::Ok);

        rows.last_mut().unwrap().observation.valor = 9.0;
        assert_eq!(check_agregados(&by_slice(rows)).estado, Estado::Aviso);
    }

    #[test]
    fn test_nested_aggregate_counted_once() {
        let t = TipoJornada::Total;
        let hnt = |causa, valor| canon(t, Metrica::HorasNoTrabajadas, Some(causa), valor);
        let mut rows = nacional();
        rows.extend([
            hnt(Causa::Vacaciones, 20.0),
            hnt(Causa::Festivos, 9.6),
            hnt(Causa::MaternidadPaternidad, 0.3),
            hnt(Causa::PermisosRetribuidos, 0.5),
            hnt(Causa::CompensacionExtras, 0.1),
            hnt(Causa::RepresentacionSindical, 0.1),
            hnt(Causa::OtrasRemuneradas, 0.4),
            hnt(Causa::PagadasAgregado, 38.1),
        ]);
        let out = check_agregados(&by_slice(rows.clone()));
        assert_eq!(out.estado, Estado::Ok, "{:?}", out.incidencias);

        rows.last_mut().unwrap().observation.valor = 39.0;
        let out = check_agregados(&by_slice(rows));
        assert_eq!(out.estado, Estado::Aviso);
        assert!(out.incidencias[0].contains("pagadas_agregado"));
    }

    #[test]
    fn test_incomplete_decomposition_is_skipped() {
        let t = TipoJornada::Total;
        let mut rows = nacional();
        rows.push(canon(t, Metrica::HorasNoTrabajadas, Some(Causa::PagadasAgregado), 50.0));
        assert_eq!(check_agregados(&by_slice(rows)).estado, Estado::Ok);
    }

    // -------------------------------------------------------------------------
    // REFERENCES
    // -------------------------------------------------------------------------

    #[test]
    fn test_references_within_tolerance() {
        let refs = vec![
            reference(Indicador::Observada(Metrica::HorasPactadas), 151.0),
            reference(Indicador::Derivada(Derivada::TasaAbsentismo), 7.4),
            reference(Indicador::Derivada(Derivada::TasaIt), 5.8),
            reference(Indicador::Derivada(Derivada::Hpe), 122.0),
        ];
        let periodos: BTreeSet<Periodo> = [periodo()].into_iter().collect();
        let (out, checks) = check_referencias(&refs, &periodos, &by_slice(nacional()));
        assert_eq!(out.estado, Estado::Ok, "{:?}", out.incidencias);
        assert!(checks.iter().all(|c| c.estado == EstadoReferencia::Ok));
    }

    #[test]
    fn test_reference_quota_and_max_deviation() {
        let periodos: BTreeSet<Periodo> = [periodo()].into_iter().collect();

        // 0.3 off: tolerated, but 1 of 1 outside 0.1 breaks the 90% quota
        let refs = vec![reference(Indicador::Observada(Metrica::HorasPactadas), 151.3)];
        let (out, checks) = check_referencias(&refs, &periodos, &by_slice(nacional()));
        assert_eq!(checks[0].estado, EstadoReferencia::Tolerado);
        assert_eq!(out.estado, Estado::Fallo);

        // over 0.5 is always a failure
        let refs = vec![reference(Indicador::Observada(Metrica::HorasPactadas), 152.0)];
        let (_, checks) = check_referencias(&refs, &periodos, &by_slice(nacional()));
        assert_eq!(checks[0].estado, EstadoReferencia::Fallo);
    }

    #[test]
    fn test_reference_without_periodo_excluded() {
        let mut r = reference(Indicador::Observada(Metrica::HorasPactadas), 150.0);
        r.periodo = Periodo::parse("2019T1").unwrap();
        let periodos: BTreeSet<Periodo> = [periodo()].into_iter().collect();
        let (out, checks) = check_referencias(&[r], &periodos, &by_slice(nacional()));
        assert_eq!(checks[0].estado, EstadoReferencia::SinPeriodo);
        assert_eq!(out.estado, Estado::Aviso);
    }

    #[test]
    fn test_reference_missing_value_fails() {
        let mut r = reference(Indicador::Observada(Metrica::HorasPactadas), 168.4);
        r.tipo_jornada = TipoJornada::Completa;
        let periodos: BTreeSet<Periodo> = [periodo()].into_iter().collect();
        let (out, checks) = check_referencias(&[r], &periodos, &by_slice(nacional()));
        assert_eq!(checks[0].estado, EstadoReferencia::Fallo);
        assert_eq!(out.estado, Estado::Fallo);
    }

    // -------------------------------------------------------------------------
    // STORE-BACKED RUN
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_run_on_empty_store() {
        let store = crate::store::Store::in_memory().await.unwrap();
        let report = run_at_version(store.pool(), &thresholds(), None).await.unwrap();
        assert!(report.passed());
        assert_eq!(report.version_datos, None);
        // nothing loaded, so no reference applies
        assert_eq!(report.check("referencias").unwrap().estado, Estado::Aviso);
    }

    #[tokio::test]
    async fn test_unknown_version_rejected() {
        let store = crate::store::Store::in_memory().await.unwrap();
        let err = run_at_version(store.pool(), &thresholds(), Some(3)).await.unwrap_err();
        assert!(matches!(err, EtclError::UnknownVersion(3)));
    }

    #[tokio::test]
    async fn test_references_read_from_store() {
        let store = crate::store::Store::in_memory().await.unwrap();
        let bundled = Catalogue::bundled().unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        store::sync_catalogue(&mut conn, &bundled).await.unwrap();
        let stored = store::fetch_references(&mut conn).await.unwrap();
        drop(conn);

        assert!(references_match(&bundled, &stored));

        let mut other = bundled.clone();
        other.valores_referencia[0].valor_ine += 1.0;
        assert!(!references_match(&other, &stored));

        // the stored set wins over the catalogue passed in
        let report = run_at_version(store.pool(), &Thresholds::from(&other), None).await.unwrap();
        assert_eq!(report.referencias.len(), stored.len());
        assert!(report.referencias.iter().all(|r| r.estado == EstadoReferencia::SinPeriodo));
    }
}
