//! Dimension Mapper
//!
//! Assigns a ColumnRole to every raw column of a SourceTable.
//! Table-scoped `roles` from the catalogue win over the global column catalogue,
//! so the same column string may play different roles in different tables.

use tracing::warn;

use crate::config::SourceTable;
use crate::error::EtclError;
use crate::labels::normalize;
use crate::model::ColumnRole;

/// Global column catalogue (raw names, matched after normalization).
const COLUMN_CATALOGUE: &[(&str, ColumnRole)] = &[
    ("Periodo", ColumnRole::Periodo),
    ("Comunidades y Ciudades Autónomas", ColumnRole::CcaaLabel),
    ("Comunidad autónoma", ColumnRole::CcaaLabel),
    ("Sectores de actividad CNAE 2009", ColumnRole::CnaeLabel),
    ("Secciones de la CNAE-09", ColumnRole::CnaeLabel),
    ("Divisiones de la CNAE-09", ColumnRole::CnaeLabel),
    ("Sectores de actividad", ColumnRole::CnaeLabel),
    ("Actividad económica CNAE-09", ColumnRole::CnaeLabel),
    ("Tipo de jornada", ColumnRole::JornadaLabel),
    ("Tiempo de trabajo", ColumnRole::TiempoTrabajoLabel),
    ("Componentes del coste", ColumnRole::ComponenteCosteLabel),
    ("Total", ColumnRole::Valor),
    ("Total Nacional", ColumnRole::Valor),
    ("Ámbito territorial", ColumnRole::AmbitoLabel),
    ("Total Nacional y Comunidades Autónomas", ColumnRole::AmbitoLabel),
];

/// Role vector of one table plus the index of each role-bearing column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMap {
    pub header: Vec<String>,
    pub roles: Vec<ColumnRole>,
    pub periodo: usize,
    pub valor: usize,
    pub ambito: Option<usize>,
    pub ccaa: Option<usize>,
    pub cnae: Option<usize>,
    pub jornada: Option<usize>,
    pub tiempo: Option<usize>,
    pub coste: Option<usize>,
}

impl ColumnMap {
    /// Column name for diagnostics.
    pub fn name(&self, idx: usize) -> &str {
        self.header.get(idx).map(String::as_str).unwrap_or("?")
    }
}

/// Role of one column name: table override first, then the global catalogue.
pub fn role_of(tabla: &SourceTable, column: &str) -> ColumnRole {
    let norm = normalize(column);
    if let Some(role) = tabla
        .roles
        .iter()
        .find(|(name, _)| normalize(name) == norm)
        .map(|(_, role)| *role)
    {
        return role;
    }
    COLUMN_CATALOGUE
        .iter()
        .find(|(name, _)| normalize(name) == norm)
        .map(|(_, role)| *role)
        .unwrap_or(ColumnRole::OtherIgnored)
}

/// Build the role vector for `header`.
///
/// Errors: missing PERIODO or VALOR, or a declared `columnas_esperadas` entry
/// absent from the header -> SourceSchemaError.
pub fn map_columns(tabla: &SourceTable, header: &[String]) -> Result<ColumnMap, EtclError> {
    let schema = |detalle: String| EtclError::SourceSchema {
        tabla: tabla.codigo.clone(),
        detalle,
    };

    let normalized: Vec<String> = header.iter().map(|h| normalize(h)).collect();
    let missing: Vec<&str> = tabla
        .columnas_esperadas
        .iter()
        .filter(|c| !normalized.contains(&normalize(c)))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(schema(format!(
            "expected columns {:?} not found in header {:?}",
            missing, header
        )));
    }

    let roles: Vec<ColumnRole> = header.iter().map(|h| role_of(tabla, h)).collect();

    // first column wins for a repeated role
    let first = |role: ColumnRole| -> Option<usize> {
        let mut positions = roles.iter().enumerate().filter(|(_, r)| **r == role);
        let (idx, _) = positions.next()?;
        for (dup, _) in positions {
            warn!(
                tabla = %tabla.codigo,
                column = %header[dup],
                role = %role,
                "Column repeats a role; keeping '{}'",
                header[idx]
            );
        }
        Some(idx)
    };

    let periodo = first(ColumnRole::Periodo).ok_or_else(|| {
        schema(format!("no PERIODO column. Header: {:?}", header))
    })?;
    let valor = first(ColumnRole::Valor)
        .ok_or_else(|| schema(format!("no VALOR column. Header: {:?}", header)))?;

    let ambito = first(ColumnRole::AmbitoLabel);
    let ccaa = first(ColumnRole::CcaaLabel);
    let cnae = first(ColumnRole::CnaeLabel);
    let jornada = first(ColumnRole::JornadaLabel);
    let tiempo = first(ColumnRole::TiempoTrabajoLabel);
    let coste = first(ColumnRole::ComponenteCosteLabel);

    Ok(ColumnMap {
        header: header.to_vec(),
        roles,
        periodo,
        valor,
        ambito,
        ccaa,
        cnae,
        jornada,
        tiempo,
        coste,
    })
}
