//! Configuration catalogue
//!
//! One JSON document (`config/catalogo.json`) holds:
//! - the enumerated engine options (snapshot_dir, db_path, preferred_sources,
//!   plausibility_band_hours, identity_tolerance, fail_on_unmapped_label)
//! - the SourceTable catalogue
//! - the frozen ReferenceValue list used by the validation harness
//!
//! Unknown keys are rejected: an unrecognized option is a configuration error.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::EtclError;
use crate::model::{
    Ambito, Categoria, Causa, CnaeNivel, ColumnRole, Dimension, GranularidadSector, Metrica,
    Periodo, Slice, TipoJornada,
};
use crate::model::code_enum;

const BUNDLED: &str = include_str!("../../../config/catalogo.json");

pub const ENV_DB_PATH: &str = "ETCL_DB_PATH";

fn default_version() -> String {
    "1".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/analysis.db")
}

fn default_preferred_sources() -> Vec<String> {
    ["6063", "6042", "6044", "6043", "6045", "6046"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_band() -> (f64, f64) {
    (40.0, 220.0)
}

fn default_tolerance() -> f64 {
    0.3
}

fn default_true() -> bool {
    true
}

/// Table codes may be written as numbers (`6042`) or strings (`"6042"`).
#[derive(Deserialize)]
#[serde(untagged)]
enum Codigo {
    Numero(u64),
    Texto(String),
}

fn deserialize_codigos<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<Codigo> = Vec::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|c| match c {
            Codigo::Numero(n) => n.to_string(),
            Codigo::Texto(s) => s.trim().to_string(),
        })
        .collect())
}

fn deserialize_codigo<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Codigo::deserialize(deserializer)? {
        Codigo::Numero(n) => n.to_string(),
        Codigo::Texto(s) => s.trim().to_string(),
    })
}

/// One INE table. Static configuration, never mutated at runtime.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SourceTable {
    #[serde(deserialize_with = "deserialize_codigo")]
    pub codigo: String,
    pub nombre: String,
    pub categoria: Categoria,
    #[serde(default)]
    pub columnas_esperadas: Vec<String>,
    #[serde(default)]
    pub cobertura: Vec<Dimension>,
    pub granularidad_sector: GranularidadSector,
    /// Table-scoped column roles; they win over the global column catalogue.
    #[serde(default)]
    pub roles: BTreeMap<String, ColumnRole>,
    #[serde(default = "default_true")]
    pub activa: bool,
}

impl SourceTable {
    pub fn covers(&self, dimension: Dimension) -> bool {
        self.cobertura.contains(&dimension)
    }
}

code_enum!(
    /// Metric engine outputs that can be cross-checked.
    Derivada {
        Hpe => "hpe",
        Hntmo => "hntmo",
        TasaAbsentismo => "tasa_absentismo",
        TasaIt => "tasa_it",
    }
);

/// Either a stored métrica or a derived one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Indicador {
    Observada(Metrica),
    Derivada(Derivada),
}

impl TryFrom<String> for Indicador {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if let Ok(m) = value.parse::<Metrica>() {
            return Ok(Indicador::Observada(m));
        }
        value
            .parse::<Derivada>()
            .map(Indicador::Derivada)
            .map_err(|_| format!("unknown metrica '{}'", value))
    }
}

impl From<Indicador> for String {
    fn from(i: Indicador) -> Self {
        i.to_string()
    }
}

impl std::fmt::Display for Indicador {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Indicador::Observada(m) => f.write_str(m.as_str()),
            Indicador::Derivada(d) => f.write_str(d.as_str()),
        }
    }
}

fn default_ambito() -> Ambito {
    Ambito::Nac
}

fn default_cnae_nivel() -> CnaeNivel {
    CnaeNivel::Total
}

fn default_jornada() -> TipoJornada {
    TipoJornada::Total
}

/// Frozen value captured from the official INE site.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ReferenceValue {
    pub periodo: Periodo,
    #[serde(default = "default_ambito")]
    pub ambito: Ambito,
    #[serde(default)]
    pub ccaa_codigo: Option<String>,
    #[serde(default = "default_cnae_nivel")]
    pub cnae_nivel: CnaeNivel,
    #[serde(default)]
    pub cnae_codigo: Option<String>,
    #[serde(default = "default_jornada")]
    pub tipo_jornada: TipoJornada,
    pub metrica: Indicador,
    #[serde(default)]
    pub causa: Option<Causa>,
    pub valor_ine: f64,
    /// Where the value was read (table, publication)
    #[serde(default)]
    pub fuente: Option<String>,
}

impl ReferenceValue {
    pub fn slice(&self) -> Slice {
        Slice {
            periodo: self.periodo,
            ambito: self.ambito,
            ccaa_codigo: self.ccaa_codigo.clone(),
            cnae_nivel: self.cnae_nivel,
            cnae_codigo: self.cnae_codigo.clone(),
            tipo_jornada: self.tipo_jornada,
        }
    }

    pub fn describe(&self) -> String {
        match self.causa {
            Some(c) => format!("{} {}:{}", self.slice(), self.metrica, c),
            None => format!("{} {}", self.slice(), self.metrica),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Catalogue {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub snapshot_dir: Option<PathBuf>,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_preferred_sources", deserialize_with = "deserialize_codigos")]
    pub preferred_sources: Vec<String>,
    #[serde(default = "default_band")]
    pub plausibility_band_hours: (f64, f64),
    #[serde(default = "default_tolerance")]
    pub identity_tolerance: f64,
    #[serde(default)]
    pub fail_on_unmapped_label: bool,
    #[serde(default)]
    pub tablas: Vec<SourceTable>,
    #[serde(default)]
    pub valores_referencia: Vec<ReferenceValue>,
}

impl Catalogue {
    /// Catalogue shipped with the repository.
    pub fn bundled() -> Result<Self, EtclError> {
        Self::from_json(BUNDLED, "config/catalogo.json")
    }

    pub fn load(path: &Path) -> Result<Self, EtclError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EtclError::Config(format!("cannot read catalogue {}: {}", path.display(), e))
        })?;
        Self::from_json(&content, &path.display().to_string())
    }

    pub fn from_json(content: &str, origin: &str) -> Result<Self, EtclError> {
        let catalogue: Catalogue = serde_json::from_str(content)
            .map_err(|e| EtclError::Config(format!("{}: {}", origin, e)))?;
        catalogue.validate()?;
        Ok(catalogue)
    }

    fn validate(&self) -> Result<(), EtclError> {
        let (min, max) = self.plausibility_band_hours;
        if !(min.is_finite() && max.is_finite() && min < max) {
            return Err(EtclError::Config(format!(
                "plausibility_band_hours must be an increasing pair, got ({}, {})",
                min, max
            )));
        }
        if !(self.identity_tolerance.is_finite() && self.identity_tolerance >= 0.0) {
            return Err(EtclError::Config(format!(
                "identity_tolerance must be a non-negative number, got {}",
                self.identity_tolerance
            )));
        }

        let mut seen = BTreeSet::new();
        for codigo in &self.preferred_sources {
            if !seen.insert(codigo.as_str()) {
                return Err(EtclError::Config(format!(
                    "preferred_sources lists {} twice",
                    codigo
                )));
            }
        }

        if self.tablas.is_empty() {
            return Err(EtclError::Config("catalogue declares no tablas".to_string()));
        }
        let mut seen = BTreeSet::new();
        for tabla in &self.tablas {
            if tabla.codigo.is_empty() || !tabla.codigo.chars().all(|c| c.is_ascii_digit()) {
                return Err(EtclError::Config(format!(
                    "tabla codigo '{}' is not numeric",
                    tabla.codigo
                )));
            }
            if !seen.insert(tabla.codigo.as_str()) {
                return Err(EtclError::Config(format!(
                    "tabla {} declared twice",
                    tabla.codigo
                )));
            }
        }

        for r in &self.valores_referencia {
            if r.causa.is_some() && r.metrica != Indicador::Observada(Metrica::HorasNoTrabajadas) {
                return Err(EtclError::Config(format!(
                    "reference {} has a causa but is not horas_no_trabajadas",
                    r.describe()
                )));
            }
        }
        Ok(())
    }

    /// `--db` flag, then `ETCL_DB_PATH`, then `db_path`.
    pub fn resolve_db_path(&self, cli: Option<&Path>) -> PathBuf {
        if let Some(path) = cli {
            return path.to_path_buf();
        }
        match std::env::var(ENV_DB_PATH) {
            Ok(v) if !v.trim().is_empty() => PathBuf::from(v),
            _ => self.db_path.clone(),
        }
    }

    /// `--snapshot` flag, then `snapshot_dir`. No default.
    pub fn resolve_snapshot_dir(&self, cli: Option<&Path>) -> Result<PathBuf, EtclError> {
        cli.map(Path::to_path_buf)
            .or_else(|| self.snapshot_dir.clone())
            .ok_or_else(|| {
                EtclError::Config(
                    "snapshot_dir is not set (use --snapshot or the catalogue option)".to_string(),
                )
            })
    }

    pub fn tabla(&self, codigo: &str) -> Option<&SourceTable> {
        self.tablas.iter().find(|t| t.codigo == codigo)
    }

    /// 0-based position in `preferred_sources`.
    pub fn preference_rank(&self, codigo: &str) -> Option<usize> {
        self.preferred_sources.iter().position(|c| c == codigo)
    }

    pub fn in_band(&self, valor: f64) -> bool {
        let (min, max) = self.plausibility_band_hours;
        (min..=max).contains(&valor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "tablas": [
            {"codigo": 6042, "nombre": "Tiempo de trabajo", "categoria": "tiempo_trabajo",
             "granularidad_sector": "SECTOR_BS", "cobertura": ["periodo", "sector", "jornada"]}
        ]
    }"#;

    // -------------------------------------------------------------------------
    // DEFAULTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_defaults() {
        let cat = Catalogue::from_json(MINIMAL, "test").unwrap();
        assert_eq!(cat.db_path, PathBuf::from("data/analysis.db"));
        assert_eq!(cat.preferred_sources, vec!["6063", "6042", "6044", "6043", "6045", "6046"]);
        assert_eq!(cat.plausibility_band_hours, (40.0, 220.0));
        assert_eq!(cat.identity_tolerance, 0.3);
        assert!(!cat.fail_on_unmapped_label);
        assert!(cat.snapshot_dir.is_none());
        assert_eq!(cat.tablas[0].codigo, "6042");
        assert!(cat.tablas[0].activa);
        assert!(cat.tablas[0].covers(Dimension::Jornada));
    }

    #[test]
    fn test_bundled_catalogue_loads() {
        let cat = Catalogue::bundled().unwrap();
        for codigo in ["6042", "6043", "6044", "6045", "6046", "6063"] {
            let tabla = cat.tabla(codigo).unwrap();
            assert_eq!(tabla.categoria, Categoria::TiempoTrabajo);
        }
        assert_eq!(cat.preference_rank("6063"), Some(0));
        assert_eq!(cat.preference_rank("6046"), Some(5));
        assert!(!cat.valores_referencia.is_empty());
    }

    #[test]
    fn test_preferred_sources_accepts_strings_and_numbers() {
        let json = MINIMAL.replacen("{", r#"{"preferred_sources": ["6042", 6063],"#, 1);
        let cat = Catalogue::from_json(&json, "test").unwrap();
        assert_eq!(cat.preferred_sources, vec!["6042", "6063"]);
    }

    // -------------------------------------------------------------------------
    // REJECTIONS
    // -------------------------------------------------------------------------

    #[test]
    fn test_unknown_option_rejected() {
        let json = MINIMAL.replacen("{", r#"{"parallel_files": 4,"#, 1);
        let err = Catalogue::from_json(&json, "test").unwrap_err();
        assert!(matches!(err, EtclError::Config(_)));
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_bad_band_rejected() {
        let json = MINIMAL.replacen("{", r#"{"plausibility_band_hours": [220, 40],"#, 1);
        assert!(matches!(Catalogue::from_json(&json, "test"), Err(EtclError::Config(_))));
    }

    #[test]
    fn test_duplicate_table_rejected() {
        let json = r#"{"tablas": [
            {"codigo": "6042", "nombre": "a", "categoria": "tiempo_trabajo", "granularidad_sector": "SECTOR_BS"},
            {"codigo": 6042, "nombre": "b", "categoria": "tiempo_trabajo", "granularidad_sector": "SECTOR_BS"}
        ]}"#;
        assert!(matches!(Catalogue::from_json(json, "test"), Err(EtclError::Config(_))));
    }

    #[test]
    fn test_unknown_role_rejected() {
        let json = r#"{"tablas": [
            {"codigo": "6042", "nombre": "a", "categoria": "tiempo_trabajo",
             "granularidad_sector": "SECTOR_BS", "roles": {"Total": "IMPORTE"}}
        ]}"#;
        assert!(matches!(Catalogue::from_json(json, "test"), Err(EtclError::Config(_))));
    }

    // -------------------------------------------------------------------------
    // REFERENCE VALUES
    // -------------------------------------------------------------------------

    #[test]
    fn test_reference_indicador_parsing() {
        let json = MINIMAL.replacen(
            "{",
            r#"{"valores_referencia": [
                {"periodo": "2025T1", "metrica": "horas_pactadas", "valor_ine": 151.0},
                {"periodo": "2025T1", "metrica": "tasa_absentismo", "valor_ine": 7.4},
                {"periodo": "2025T1", "metrica": "horas_no_trabajadas", "causa": "it_total", "valor_ine": 8.3}
            ],"#,
            1,
        );
        let cat = Catalogue::from_json(&json, "test").unwrap();
        let refs = &cat.valores_referencia;
        assert_eq!(refs[0].metrica, Indicador::Observada(Metrica::HorasPactadas));
        assert_eq!(refs[1].metrica, Indicador::Derivada(Derivada::TasaAbsentismo));
        assert_eq!(refs[2].causa, Some(Causa::ItTotal));
        assert_eq!(refs[0].slice(), Slice::nacional(Periodo::parse("2025T1").unwrap()));
    }

    #[test]
    fn test_reference_causa_requires_hnt() {
        let json = MINIMAL.replacen(
            "{",
            r#"{"valores_referencia": [
                {"periodo": "2025T1", "metrica": "horas_pactadas", "causa": "it_total", "valor_ine": 1.0}
            ],"#,
            1,
        );
        assert!(matches!(Catalogue::from_json(&json, "test"), Err(EtclError::Config(_))));
    }

    // -------------------------------------------------------------------------
    // PRECEDENCE
    // -------------------------------------------------------------------------

    #[test]
    fn test_snapshot_dir_precedence() {
        let mut cat = Catalogue::from_json(MINIMAL, "test").unwrap();
        assert!(matches!(cat.resolve_snapshot_dir(None), Err(EtclError::Config(_))));
        cat.snapshot_dir = Some(PathBuf::from("data/raw"));
        assert_eq!(cat.resolve_snapshot_dir(None).unwrap(), PathBuf::from("data/raw"));
        assert_eq!(
            cat.resolve_snapshot_dir(Some(Path::new("/tmp/x"))).unwrap(),
            PathBuf::from("/tmp/x")
        );
    }

    #[test]
    fn test_db_path_flag_wins() {
        let cat = Catalogue::from_json(MINIMAL, "test").unwrap();
        assert_eq!(
            cat.resolve_db_path(Some(Path::new("/tmp/a.db"))),
            PathBuf::from("/tmp/a.db")
        );
    }

    #[test]
    fn test_band_check() {
        let cat = Catalogue::from_json(MINIMAL, "test").unwrap();
        assert!(cat.in_band(151.0));
        assert!(cat.in_band(40.0));
        assert!(!cat.in_band(39.9));
        assert!(!cat.in_band(220.1));
    }
}
