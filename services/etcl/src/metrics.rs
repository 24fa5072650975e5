//! Metric Engine (Adecco methodology)
//!
//! HPE   = HP + HEXT - vacaciones_festivos - razones_tecnicas
//! HNTmo = HNT_total - vacaciones_festivos - razones_tecnicas
//! tasa_absentismo = 100 * HNTmo / HPE
//! tasa_it         = 100 * HNT_IT / HPE
//!
//! Reads canonical rows only; aggregate and component causas are never summed
//! together.

use std::collections::BTreeSet;

use serde::Serialize;
use sqlx::SqliteConnection;

use crate::error::Result;
use crate::model::{Ambito, Causa, CnaeNivel, Metrica, Periodo, Rol, Slice, TipoJornada};
use crate::resolver::{by_slice, CanonicalRow};
use crate::store::{self, RowFilter};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricResult {
    pub slice: Slice,
    pub hp: f64,
    pub hext: f64,
    /// Horas efectivas, when the slice carries them
    pub he: Option<f64>,
    pub hnt_total: f64,
    pub vacaciones_festivos: f64,
    pub razones_tecnicas: f64,
    pub hnt_it: f64,
    pub hnt_mo: f64,
    pub hpe: f64,
    /// None when HPE <= 0
    pub tasa_absentismo: Option<f64>,
    pub tasa_it: Option<f64>,
    /// HNT_total rebuilt from causas because the source total was absent
    pub reconstructed: bool,
    pub avisos: Vec<String>,
    pub fuentes: Vec<String>,
}

impl MetricResult {
    /// `key=value` lines for the CLI, `NA` for undefined values.
    pub fn key_values(&self) -> Vec<(&'static str, String)> {
        let num = |v: f64| format!("{:.2}", v);
        let opt = |v: Option<f64>| v.map(num).unwrap_or_else(|| "NA".to_string());
        vec![
            ("periodo", self.slice.periodo.code()),
            ("ambito", self.slice.ambito.to_string()),
            ("ccaa", self.slice.ccaa_codigo.clone().unwrap_or_default()),
            ("cnae_nivel", self.slice.cnae_nivel.to_string()),
            ("cnae", self.slice.cnae_codigo.clone().unwrap_or_default()),
            ("jornada", self.slice.tipo_jornada.to_string()),
            ("hp", num(self.hp)),
            ("hext", num(self.hext)),
            ("he", opt(self.he)),
            ("hnt_total", num(self.hnt_total)),
            ("vacaciones_festivos", num(self.vacaciones_festivos)),
            ("razones_tecnicas", num(self.razones_tecnicas)),
            ("hnt_it", num(self.hnt_it)),
            ("hnt_mo", num(self.hnt_mo)),
            ("hpe", num(self.hpe)),
            ("tasa_absentismo", opt(self.tasa_absentismo)),
            ("tasa_it", opt(self.tasa_it)),
            ("reconstructed", self.reconstructed.to_string()),
            ("fuentes", self.fuentes.join(",")),
        ]
    }
}

/// Outcome of one slice computation. `InsufficientData` is returned, not raised.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "estado", rename_all = "snake_case")]
pub enum SliceMetrics {
    Computed(MetricResult),
    InsufficientData { slice: Slice, motivo: String },
}

impl SliceMetrics {
    pub fn result(&self) -> Option<&MetricResult> {
        match self {
            SliceMetrics::Computed(r) => Some(r),
            SliceMetrics::InsufficientData { .. } => None,
        }
    }

    pub fn slice(&self) -> &Slice {
        match self {
            SliceMetrics::Computed(r) => &r.slice,
            SliceMetrics::InsufficientData { slice, .. } => slice,
        }
    }
}

// =============================================================================
// COMPUTATION
// =============================================================================

struct SliceRows<'a> {
    rows: Vec<&'a CanonicalRow>,
}

impl<'a> SliceRows<'a> {
    fn metrica(&self, metrica: Metrica) -> Option<f64> {
        let values: Vec<f64> = self
            .rows
            .iter()
            .filter(|r| r.observation.metrica == metrica && r.observation.causa.is_none())
            .map(|r| r.observation.valor)
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum())
        }
    }

    fn causa(&self, causa: Causa) -> Option<f64> {
        self.rows
            .iter()
            .find(|r| {
                r.observation.metrica == Metrica::HorasNoTrabajadas
                    && r.observation.causa == Some(causa)
            })
            .map(|r| r.observation.valor)
    }

    /// Σ of the non-aggregate causas; None when there are none.
    fn reconstruct_hnt(&self) -> Option<f64> {
        let componentes: Vec<f64> = self
            .rows
            .iter()
            .filter(|r| {
                r.observation.metrica == Metrica::HorasNoTrabajadas
                    && r.rol == Some(Rol::Componente)
            })
            .map(|r| r.observation.valor)
            .collect();
        if componentes.is_empty() {
            None
        } else {
            Some(componentes.iter().sum())
        }
    }
}

/// Compute the MetricResult of `slice` from its canonical rows.
pub fn compute(slice: &Slice, rows: &[CanonicalRow]) -> SliceMetrics {
    let view = SliceRows {
        rows: rows
            .iter()
            .filter(|r| r.observation.slice() == *slice)
            .collect(),
    };

    let Some(hp) = view.metrica(Metrica::HorasPactadas) else {
        return SliceMetrics::InsufficientData {
            slice: slice.clone(),
            motivo: "horas_pactadas ausentes".to_string(),
        };
    };

    let mut avisos = Vec::new();

    let hext = view.metrica(Metrica::HorasExtraordinarias).unwrap_or_else(|| {
        avisos.push("horas_extraordinarias ausentes, se usa 0".to_string());
        0.0
    });
    let he = view.metrica(Metrica::HorasEfectivas);

    let (hnt_total, reconstructed) = match view.metrica(Metrica::HorasNoTrabajadas) {
        Some(total) => (total, false),
        None => match view.reconstruct_hnt() {
            Some(total) => {
                avisos.push("horas_no_trabajadas total reconstruido desde causas".to_string());
                (total, true)
            }
            None => {
                avisos.push("horas_no_trabajadas ausentes, se usa 0".to_string());
                (0.0, false)
            }
        },
    };

    let vacaciones_festivos = match view.causa(Causa::VacacionesYFiestas) {
        Some(v) => v,
        None => {
            let vac = view.causa(Causa::Vacaciones);
            let fest = view.causa(Causa::Festivos);
            if vac.is_none() && fest.is_none() {
                avisos.push("vacaciones_y_fiestas ausentes, se usa 0".to_string());
            }
            vac.unwrap_or(0.0) + fest.unwrap_or(0.0)
        }
    };

    let razones_tecnicas = view
        .causa(Causa::RazonesTecnicasEconomicas)
        .unwrap_or_else(|| {
            avisos.push("razones_tecnicas_economicas ausentes, se usa 0".to_string());
            0.0
        });

    let hnt_it = view.causa(Causa::ItTotal).unwrap_or_else(|| {
        avisos.push("it_total ausente, se usa 0".to_string());
        0.0
    });

    let hpe = hp + hext - vacaciones_festivos - razones_tecnicas;
    let hnt_mo = hnt_total - vacaciones_festivos - razones_tecnicas;
    let (tasa_absentismo, tasa_it) = if hpe > 0.0 {
        (Some(100.0 * hnt_mo / hpe), Some(100.0 * hnt_it / hpe))
    } else {
        avisos.push("HPE <= 0, tasas no definidas".to_string());
        (None, None)
    };

    let fuentes: BTreeSet<String> = view
        .rows
        .iter()
        .map(|r| r.observation.fuente_tabla.clone())
        .collect();

    SliceMetrics::Computed(MetricResult {
        slice: slice.clone(),
        hp,
        hext,
        he,
        hnt_total,
        vacaciones_festivos,
        razones_tecnicas,
        hnt_it,
        hnt_mo,
        hpe,
        tasa_absentismo,
        tasa_it,
        reconstructed,
        avisos,
        fuentes: fuentes.into_iter().collect(),
    })
}

// =============================================================================
// STORE-BACKED QUERIES
// =============================================================================

pub async fn compute_slice(conn: &mut SqliteConnection, slice: &Slice) -> Result<SliceMetrics> {
    let rows = store::fetch_canonical(conn, &RowFilter::slice(slice)).await?;
    Ok(compute(slice, &rows))
}

/// One result per periodo for the slice, oldest first.
pub async fn series(conn: &mut SqliteConnection, template: &Slice) -> Result<Vec<SliceMetrics>> {
    let rows = store::fetch_canonical(conn, &RowFilter::series(template)).await?;
    let grouped = by_slice(rows);
    let mut results: Vec<SliceMetrics> = grouped
        .iter()
        .map(|(slice, rows)| compute(slice, rows))
        .collect();
    results.sort_by_key(|r| r.slice().periodo);
    Ok(results)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankingEntry {
    pub ccaa_codigo: String,
    pub ccaa_nombre: Option<String>,
    pub tasa_absentismo: Option<f64>,
    pub tasa_it: Option<f64>,
    pub hpe: Option<f64>,
}

/// tasa_absentismo per CCAA (cnae TOTAL), highest first, undefined rates last.
pub async fn ranking(
    conn: &mut SqliteConnection,
    periodo: Periodo,
    jornada: TipoJornada,
) -> Result<Vec<RankingEntry>> {
    let filter = RowFilter {
        periodo: Some(periodo),
        ambito: Some(Ambito::Ccaa),
        cnae_nivel: Some(CnaeNivel::Total),
        tipo_jornada: Some(jornada),
        ..Default::default()
    };
    let rows = store::fetch_canonical(conn, &filter).await?;
    let grouped = by_slice(rows);

    let mut entries: Vec<RankingEntry> = grouped
        .iter()
        .map(|(slice, rows)| {
            let nombre = rows.iter().find_map(|r| r.observation.ccaa_nombre.clone());
            let metrics = compute(slice, rows);
            let result = metrics.result();
            RankingEntry {
                ccaa_codigo: slice.ccaa_codigo.clone().unwrap_or_default(),
                ccaa_nombre: nombre,
                tasa_absentismo: result.and_then(|r| r.tasa_absentismo),
                tasa_it: result.and_then(|r| r.tasa_it),
                hpe: result.map(|r| r.hpe),
            }
        })
        .collect();

    entries.sort_by(|a, b| match (a.tasa_absentismo, b.tasa_absentismo) {
        (Some(x), Some(y)) => y.total_cmp(&x).then_with(|| a.ccaa_codigo.cmp(&b.ccaa_codigo)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.ccaa_codigo.cmp(&b.ccaa_codigo),
    });
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Observation;

    fn periodo() -> Periodo {
        Periodo::parse("2025T1").unwrap()
    }

    fn row(metrica: Metrica, causa: Option<Causa>, valor: f64) -> CanonicalRow {
        let observation = Observation {
            periodo: periodo(),
            ambito: Ambito::Nac,
            ccaa_codigo: None,
            ccaa_nombre: None,
            cnae_nivel: CnaeNivel::Total,
            cnae_codigo: None,
            cnae_nombre: None,
            jerarquia_sector: "Total".into(),
            tipo_jornada: TipoJornada::Total,
            fuente_tabla: "6042".into(),
            metrica,
            causa,
            valor,
            version_datos: Some(1),
            linea: 0,
        };
        CanonicalRow {
            rol: observation.rol(),
            observation,
            descartadas: vec![],
        }
    }

    fn national_2025t1() -> Vec<CanonicalRow> {
        vec![
            row(Metrica::HorasPactadas, None, 151.0),
            row(Metrica::HorasExtraordinarias, None, 1.0),
            row(Metrica::HorasEfectivas, None, 113.0),
            row(Metrica::HorasNoTrabajadas, None, 39.0),
            row(Metrica::HorasNoTrabajadas, Some(Causa::VacacionesYFiestas), 29.6),
            row(Metrica::HorasNoTrabajadas, Some(Causa::RazonesTecnicasEconomicas), 0.4),
            row(Metrica::HorasNoTrabajadas, Some(Causa::ItTotal), 7.1),
        ]
    }

    fn computed(rows: &[CanonicalRow]) -> MetricResult {
        match compute(&Slice::nacional(periodo()), rows) {
            SliceMetrics::Computed(r) => r,
            other => panic!("unexpected {other:?}"),
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    // -------------------------------------------------------------------------
    // FORMULA TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_national_rates() {
        let r = computed(&national_2025t1());
        assert!(close(r.hpe, 122.0));
        assert!(close(r.hnt_mo, 9.0));
        let tasa = r.tasa_absentismo.unwrap();
        assert!((tasa - 7.377).abs() < 0.01, "tasa {tasa}");
        let tasa_it = r.tasa_it.unwrap();
        assert!((tasa_it - 5.82).abs() < 0.01, "tasa_it {tasa_it}");
        assert!(!r.reconstructed);
        assert_eq!(r.he, Some(113.0));
        assert_eq!(r.fuentes, vec!["6042"]);
    }

    #[test]
    fn test_vacaciones_festivos_from_components() {
        let mut rows = national_2025t1();
        rows.retain(|r| r.observation.causa != Some(Causa::VacacionesYFiestas));
        rows.push(row(Metrica::HorasNoTrabajadas, Some(Causa::Vacaciones), 20.0));
        rows.push(row(Metrica::HorasNoTrabajadas, Some(Causa::Festivos), 9.6));
        let r = computed(&rows);
        assert!(close(r.vacaciones_festivos, 29.6));
        assert!(close(r.hpe, 122.0));
    }

    #[test]
    fn test_aggregate_preferred_over_components() {
        let mut rows = national_2025t1();
        rows.push(row(Metrica::HorasNoTrabajadas, Some(Causa::Vacaciones), 20.0));
        rows.push(row(Metrica::HorasNoTrabajadas, Some(Causa::Festivos), 9.5));
        let r = computed(&rows);
        assert!(close(r.vacaciones_festivos, 29.6));
    }

    #[test]
    fn test_missing_optional_causas_warn() {
        let rows = vec![
            row(Metrica::HorasPactadas, None, 151.0),
            row(Metrica::HorasExtraordinarias, None, 1.0),
            row(Metrica::HorasNoTrabajadas, None, 30.0),
        ];
        let r = computed(&rows);
        assert!(close(r.hpe, 152.0));
        assert!(close(r.hnt_mo, 30.0));
        assert!(close(r.hnt_it, 0.0));
        assert!(r.avisos.iter().any(|a| a.contains("it_total")));
        assert!(r.avisos.iter().any(|a| a.contains("razones_tecnicas")));
    }

    // -------------------------------------------------------------------------
    // EDGE CASES
    // -------------------------------------------------------------------------

    #[test]
    fn test_missing_hp_is_insufficient_data() {
        let rows = vec![row(Metrica::HorasEfectivas, None, 113.0)];
        let out = compute(&Slice::nacional(periodo()), &rows);
        assert!(matches!(out, SliceMetrics::InsufficientData { .. }));
        assert!(out.result().is_none());
    }

    #[test]
    fn test_zero_hp_gives_undefined_rates() {
        let rows = vec![row(Metrica::HorasPactadas, None, 0.0)];
        let r = computed(&rows);
        assert!(close(r.hpe, 0.0));
        assert_eq!(r.tasa_absentismo, None);
        assert_eq!(r.tasa_it, None);
        let kv = r.key_values();
        let tasa = kv.iter().find(|(k, _)| *k == "tasa_absentismo").unwrap();
        assert_eq!(tasa.1, "NA");
    }

    #[test]
    fn test_reconstruct_hnt_total_from_components() {
        let rows = vec![
            row(Metrica::HorasPactadas, None, 151.0),
            row(Metrica::HorasExtraordinarias, None, 1.0),
            row(Metrica::HorasNoTrabajadas, Some(Causa::Vacaciones), 20.0),
            row(Metrica::HorasNoTrabajadas, Some(Causa::Festivos), 9.6),
            row(Metrica::HorasNoTrabajadas, Some(Causa::ItTotal), 7.1),
            row(Metrica::HorasNoTrabajadas, Some(Causa::RazonesTecnicasEconomicas), 0.4),
            row(Metrica::HorasNoTrabajadas, Some(Causa::PermisosRetribuidos), 1.9),
        ];
        let r = computed(&rows);
        assert!(r.reconstructed);
        assert!(close(r.hnt_total, 39.0));
    }

    #[test]
    fn test_reconstruction_ignores_aggregates() {
        let rows = vec![
            row(Metrica::HorasPactadas, None, 151.0),
            row(Metrica::HorasNoTrabajadas, Some(Causa::VacacionesYFiestas), 29.6),
            row(Metrica::HorasNoTrabajadas, Some(Causa::ItTotal), 7.1),
        ];
        let r = computed(&rows);
        assert!(r.reconstructed);
        assert!(close(r.hnt_total, 7.1));

        let rows = vec![
            row(Metrica::HorasPactadas, None, 151.0),
            row(Metrica::HorasNoTrabajadas, Some(Causa::PagadasAgregado), 37.0),
            row(Metrica::HorasNoTrabajadas, Some(Causa::ItTotal), 7.1),
            row(Metrica::HorasNoTrabajadas, Some(Causa::Vacaciones), 20.0),
        ];
        assert!(close(computed(&rows).hnt_total, 27.1));
    }

    #[test]
    fn test_rows_of_other_slices_ignored() {
        let mut rows = national_2025t1();
        let mut other = row(Metrica::HorasPactadas, None, 168.4);
        other.observation.tipo_jornada = TipoJornada::Completa;
        rows.push(other);
        let r = computed(&rows);
        assert_eq!(r.hp, 151.0);
    }
}
