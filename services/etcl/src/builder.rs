//! Observation Builder
//!
//! Responsibilities:
//! - Turn each RawRow into zero or one Observation under the table's ColumnMap
//! - Count dropped rows by reason (the ingestion summary reports them)
//! - Abort the file on BadPeriodo and on in-file IdentityCollision
//! - Report CCAA coverage gaps (never synthesized)
//!
//! DETERMINISTIC: same RawTable = same observations, in file order.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::SourceTable;
use crate::error::EtclError;
use crate::labels::{self, CcaaLabel, CnaeNode};
use crate::mapper::ColumnMap;
use crate::model::{code_enum, Ambito, Metrica, Observation, Periodo, TipoJornada};
use crate::reader::{RawRow, RawTable};
use crate::value::{parse_value, ParsedValue};

code_enum!(
    /// Why a row produced no observation.
    DropReason {
        ValorAusente => "valor_ausente",
        EtiquetaNoMapeada => "etiqueta_no_mapeada",
        FueraDeRango => "fuera_de_rango",
        MetricaNoReconocida => "metrica_no_reconocida",
        FueraDeAlcance => "fuera_de_alcance",
        RegistroMalformado => "registro_malformado",
        Duplicado => "duplicado",
    }
);

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub fail_on_unmapped_label: bool,
    /// ValueOutOfRange aborts the file instead of dropping the row.
    pub strict: bool,
    pub plausibility_band_hours: (f64, f64),
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            fail_on_unmapped_label: false,
            strict: false,
            plausibility_band_hours: (40.0, 220.0),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildOutcome {
    pub observations: Vec<Observation>,
    pub descartes: BTreeMap<DropReason, usize>,
    /// HP/HE rows kept although outside the plausibility band
    pub fuera_de_banda: usize,
    /// CCAA codes never seen in a CCAA-aware file
    pub huecos_ccaa: Vec<String>,
    pub filas: usize,
}

impl BuildOutcome {
    pub fn dropped(&self) -> usize {
        self.descartes.values().sum()
    }

    fn drop_row(&mut self, reason: DropReason) {
        *self.descartes.entry(reason).or_insert(0) += 1;
    }
}

/// Result of resolving the label cells of one row.
enum RowLabels {
    Resolved {
        ambito: Ambito,
        ccaa: Option<(&'static str, &'static str)>,
        cnae: CnaeNode,
        jornada: TipoJornada,
    },
    Unmapped {
        columna: String,
        etiqueta: String,
    },
}

struct RowBuilder<'a> {
    tabla: &'a SourceTable,
    map: &'a ColumnMap,
}

impl<'a> RowBuilder<'a> {
    fn cell<'r>(&self, row: &'r RawRow, idx: usize) -> Option<&'r str> {
        row.cells.get(idx).map(|c| c.trim())
    }

    fn unmapped(&self, idx: usize, etiqueta: &str) -> RowLabels {
        RowLabels::Unmapped {
            columna: self.map.name(idx).to_string(),
            etiqueta: etiqueta.to_string(),
        }
    }

    fn labels(&self, row: &RawRow) -> Option<RowLabels> {
        // ámbito: the CCAA column when present, else an explicit ámbito column
        let territorial = self.map.ccaa.or(self.map.ambito);
        let (ambito, ccaa) = match territorial {
            None => (Ambito::Nac, None),
            Some(idx) => {
                let raw = self.cell(row, idx)?;
                match labels::parse_ccaa(raw) {
                    Some(CcaaLabel::Nacional) => (Ambito::Nac, None),
                    Some(CcaaLabel::Comunidad { codigo, nombre }) => {
                        (Ambito::Ccaa, Some((codigo, nombre)))
                    }
                    None => return Some(self.unmapped(idx, raw)),
                }
            }
        };

        let cnae = match self.map.cnae {
            None => labels::parse_cnae("Total", self.tabla.granularidad_sector)?,
            Some(idx) => {
                let raw = self.cell(row, idx)?;
                match labels::parse_cnae(raw, self.tabla.granularidad_sector) {
                    Some(node) => node,
                    None => return Some(self.unmapped(idx, raw)),
                }
            }
        };

        let jornada = match self.map.jornada {
            None => TipoJornada::Total,
            Some(idx) => {
                let raw = self.cell(row, idx)?;
                match labels::parse_jornada(raw) {
                    Some(j) => j,
                    None => return Some(self.unmapped(idx, raw)),
                }
            }
        };

        Some(RowLabels::Resolved {
            ambito,
            ccaa,
            cnae,
            jornada,
        })
    }
}

/// Build the observations of one file.
///
/// Errors (abort the file): BadPeriodo, IdentityCollision, UnmappedLabel when
/// `fail_on_unmapped_label`, ValueOutOfRange when `strict`, SourceSchema when
/// the table exposes neither a tiempo-de-trabajo nor a cost column.
pub fn build(
    tabla: &SourceTable,
    map: &ColumnMap,
    raw: &RawTable,
    opts: &BuildOptions,
) -> Result<BuildOutcome, EtclError> {
    if map.tiempo.is_none() && map.coste.is_none() {
        return Err(EtclError::SourceSchema {
            tabla: tabla.codigo.clone(),
            detalle: format!(
                "no TIEMPO_TRABAJO_LABEL or COMPONENTE_COSTE_LABEL column. Header: {:?}",
                map.header
            ),
        });
    }

    let builder = RowBuilder { tabla, map };
    let mut outcome = BuildOutcome {
        filas: raw.rows.len(),
        ..Default::default()
    };
    let mut seen: HashMap<String, (f64, usize)> = HashMap::new();
    let mut unmapped_seen: BTreeSet<(String, String)> = BTreeSet::new();
    let mut unknown_metricas: BTreeSet<String> = BTreeSet::new();
    let mut ccaa_seen: BTreeSet<&'static str> = BTreeSet::new();
    let (band_min, band_max) = opts.plausibility_band_hours;

    for row in &raw.rows {
        // 1. periodo: a malformed value aborts the file
        let Some(periodo_raw) = builder.cell(row, map.periodo) else {
            outcome.drop_row(DropReason::RegistroMalformado);
            continue;
        };
        let periodo = Periodo::parse(periodo_raw).map_err(|_| EtclError::BadPeriodo {
            valor: periodo_raw.to_string(),
            linea: Some(row.linea),
        })?;

        // 2-4. ámbito, CNAE, jornada
        let (ambito, ccaa, cnae, jornada) = match builder.labels(row) {
            None => {
                outcome.drop_row(DropReason::RegistroMalformado);
                continue;
            }
            Some(RowLabels::Unmapped { columna, etiqueta }) => {
                if opts.fail_on_unmapped_label {
                    return Err(EtclError::UnmappedLabel { columna, etiqueta });
                }
                if unmapped_seen.insert((columna.clone(), etiqueta.clone())) {
                    warn!(
                        tabla = %tabla.codigo,
                        linea = row.linea,
                        "UnmappedLabel: column '{}' has unknown label '{}'",
                        columna,
                        etiqueta
                    );
                }
                outcome.drop_row(DropReason::EtiquetaNoMapeada);
                continue;
            }
            Some(RowLabels::Resolved {
                ambito,
                ccaa,
                cnae,
                jornada,
            }) => (ambito, ccaa, cnae, jornada),
        };

        // 5. métrica / causa
        let Some(tiempo_idx) = map.tiempo else {
            // cost component rows are not part of this table
            outcome.drop_row(DropReason::FueraDeAlcance);
            continue;
        };
        let Some(tiempo_raw) = builder.cell(row, tiempo_idx) else {
            outcome.drop_row(DropReason::RegistroMalformado);
            continue;
        };
        let Some((metrica, causa)) = labels::parse_tiempo_trabajo(tiempo_raw) else {
            if unknown_metricas.insert(tiempo_raw.to_string()) {
                warn!(
                    tabla = %tabla.codigo,
                    linea = row.linea,
                    "Unrecognized tiempo de trabajo label '{}'",
                    tiempo_raw
                );
            }
            outcome.drop_row(DropReason::MetricaNoReconocida);
            continue;
        };

        // 6. valor
        let Some(valor_raw) = builder.cell(row, map.valor) else {
            outcome.drop_row(DropReason::RegistroMalformado);
            continue;
        };
        let valor = match parse_value(valor_raw) {
            Ok(ParsedValue::Value(v)) => v,
            Ok(ParsedValue::Missing) => {
                outcome.drop_row(DropReason::ValorAusente);
                continue;
            }
            Err(EtclError::ValueOutOfRange { valor }) => {
                if opts.strict {
                    return Err(EtclError::ValueOutOfRange { valor });
                }
                warn!(tabla = %tabla.codigo, linea = row.linea, valor, "ValueOutOfRange, row dropped");
                outcome.drop_row(DropReason::FueraDeRango);
                continue;
            }
            Err(e) => {
                debug!(tabla = %tabla.codigo, linea = row.linea, error = %e, "Malformed value");
                outcome.drop_row(DropReason::RegistroMalformado);
                continue;
            }
        };

        if matches!(metrica, Metrica::HorasPactadas | Metrica::HorasEfectivas)
            && !(band_min..=band_max).contains(&valor)
        {
            warn!(
                tabla = %tabla.codigo,
                linea = row.linea,
                valor,
                "{} outside plausibility band [{}, {}]",
                metrica,
                band_min,
                band_max
            );
            outcome.fuera_de_banda += 1;
        }

        // 7. tag the source
        if let Some((codigo, _)) = ccaa {
            ccaa_seen.insert(codigo);
        }
        let jerarquia_sector = cnae.jerarquia();
        let obs = Observation {
            periodo,
            ambito,
            ccaa_codigo: ccaa.map(|(codigo, _)| codigo.to_string()),
            ccaa_nombre: ccaa.map(|(_, nombre)| nombre.to_string()),
            cnae_nivel: cnae.nivel,
            cnae_codigo: cnae.codigo,
            cnae_nombre: cnae.nombre,
            jerarquia_sector,
            tipo_jornada: jornada,
            fuente_tabla: tabla.codigo.clone(),
            metrica,
            causa,
            valor,
            version_datos: None,
            linea: row.linea,
        };

        let clave = obs.clave();
        match seen.get(&clave) {
            Some(&(primero, linea_a)) if primero == valor => {
                debug!(tabla = %tabla.codigo, linea = row.linea, "Duplicate of line {}", linea_a);
                outcome.drop_row(DropReason::Duplicado);
            }
            Some(&(primero, linea_a)) => {
                return Err(EtclError::IdentityCollision {
                    clave,
                    primero,
                    segundo: valor,
                    linea_a,
                    linea_b: row.linea,
                });
            }
            None => {
                seen.insert(clave, (valor, row.linea));
                outcome.observations.push(obs);
            }
        }
    }

    if map.ccaa.is_some() && !ccaa_seen.is_empty() {
        outcome.huecos_ccaa = labels::all_ccaa_codes()
            .filter(|c| !ccaa_seen.contains(c))
            .map(str::to_string)
            .collect();
        if !outcome.huecos_ccaa.is_empty() {
            warn!(
                tabla = %tabla.codigo,
                "CCAA coverage gaps: {}",
                outcome.huecos_ccaa.join(", ")
            );
        }
    }

    debug!(
        tabla = %tabla.codigo,
        filas = outcome.filas,
        observaciones = outcome.observations.len(),
        descartadas = outcome.dropped(),
        "Build complete"
    );

    Ok(outcome)
}
