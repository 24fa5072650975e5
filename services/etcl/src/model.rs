//! Canonical vocabulary of the observation table
//!
//! Every closed dimension (ámbito, CNAE nivel, jornada, métrica, causa...) is a
//! tagged enum whose string code is the one persisted in the store.

use std::fmt;
use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::EtclError;

/// Declares a closed vocabulary with its persisted string codes.
macro_rules! code_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $code:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, ::serde::Serialize, ::serde::Deserialize)]
        pub enum $name {
            $(#[serde(rename = $code)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $code),+
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                match s {
                    $($code => ::std::result::Result::Ok($name::$variant),)+
                    other => ::std::result::Result::Err(format!("unknown {} code '{}'", stringify!($name), other)),
                }
            }
        }
    };
}

pub(crate) use code_enum;

code_enum!(Ambito {
    Nac => "NAC",
    Ccaa => "CCAA",
});

code_enum!(CnaeNivel {
    Total => "TOTAL",
    SectorBs => "SECTOR_BS",
    Seccion => "SECCION",
    Division => "DIVISION",
});

code_enum!(TipoJornada {
    Total => "TOTAL",
    Completa => "COMPLETA",
    Parcial => "PARCIAL",
});

code_enum!(Metrica {
    HorasPactadas => "horas_pactadas",
    HorasEfectivas => "horas_efectivas",
    HorasExtraordinarias => "horas_extraordinarias",
    HorasPagadas => "horas_pagadas",
    HorasNoTrabajadas => "horas_no_trabajadas",
});

code_enum!(Causa {
    Vacaciones => "vacaciones",
    Festivos => "festivos",
    VacacionesYFiestas => "vacaciones_y_fiestas",
    ItTotal => "it_total",
    MaternidadPaternidad => "maternidad_paternidad",
    PermisosRetribuidos => "permisos_retribuidos",
    CompensacionExtras => "compensacion_extras",
    OtrasRemuneradas => "otras_remuneradas",
    PerdidasLugarTrabajo => "perdidas_lugar_trabajo",
    Conflictividad => "conflictividad",
    OtrasNoRemuneradas => "otras_no_remuneradas",
    RepresentacionSindical => "representacion_sindical",
    RazonesTecnicasEconomicas => "razones_tecnicas_economicas",
    PagadasAgregado => "pagadas_agregado",
    NoPagadasAgregado => "no_pagadas_agregado",
    Otros => "otros",
});

code_enum!(
    /// Additive role of an hours-not-worked observation.
    Rol {
        Componente => "componente",
        Agregado => "agregado",
    }
);

code_enum!(Categoria {
    TiempoTrabajo => "tiempo_trabajo",
    CostesBasicos => "costes_basicos",
    SeriesTemporales => "series_temporales",
    CostesDetallados => "costes_detallados",
    CostesSalariales => "costes_salariales",
    Vacantes => "vacantes",
    OtrosCostes => "otros_costes",
});

code_enum!(GranularidadSector {
    SectorBs => "SECTOR_BS",
    SeccionCnae => "SECCION_CNAE",
    DivisionCnae => "DIVISION_CNAE",
    CcaaSector => "CCAA_SECTOR",
    Ninguna => "NINGUNA",
});

code_enum!(Dimension {
    Periodo => "periodo",
    Sector => "sector",
    Ccaa => "ccaa",
    Jornada => "jornada",
    Tamano => "tamaño",
});

code_enum!(
    /// Role a raw CSV column plays for the observation builder.
    ColumnRole {
        Periodo => "PERIODO",
        AmbitoLabel => "AMBITO_LABEL",
        CcaaLabel => "CCAA_LABEL",
        CnaeLabel => "CNAE_LABEL",
        JornadaLabel => "JORNADA_LABEL",
        TiempoTrabajoLabel => "TIEMPO_TRABAJO_LABEL",
        ComponenteCosteLabel => "COMPONENTE_COSTE_LABEL",
        Valor => "VALOR",
        OtherIgnored => "OTHER_IGNORED",
    }
);

const PAGADAS: &[Causa] = &[
    Causa::Vacaciones,
    Causa::Festivos,
    Causa::VacacionesYFiestas,
    Causa::ItTotal,
    Causa::MaternidadPaternidad,
    Causa::PermisosRetribuidos,
    Causa::CompensacionExtras,
    Causa::RepresentacionSindical,
    Causa::OtrasRemuneradas,
];

const NO_PAGADAS: &[Causa] = &[
    Causa::PerdidasLugarTrabajo,
    Causa::Conflictividad,
    Causa::RazonesTecnicasEconomicas,
    Causa::OtrasNoRemuneradas,
];

impl Causa {
    pub fn is_aggregate(&self) -> bool {
        matches!(
            self,
            Causa::PagadasAgregado | Causa::NoPagadasAgregado | Causa::VacacionesYFiestas
        )
    }

    /// Causas an aggregate label is composed of. Empty for components.
    pub fn componentes(&self) -> &'static [Causa] {
        match self {
            Causa::VacacionesYFiestas => &[Causa::Vacaciones, Causa::Festivos],
            Causa::PagadasAgregado => PAGADAS,
            Causa::NoPagadasAgregado => NO_PAGADAS,
            _ => &[],
        }
    }
}

impl Rol {
    /// `agregado` for totals and aggregate causas, `componente` for the rest.
    /// Only hours-not-worked carry a role.
    pub fn of(metrica: Metrica, causa: Option<Causa>) -> Option<Rol> {
        if metrica != Metrica::HorasNoTrabajadas {
            return None;
        }
        match causa {
            None => Some(Rol::Agregado),
            Some(c) if c.is_aggregate() => Some(Rol::Agregado),
            Some(_) => Some(Rol::Componente),
        }
    }
}

// =============================================================================
// PERIODO
// =============================================================================

fn periodo_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{4})T([1-4])$").expect("static periodo pattern"))
}

/// Quarter code `YYYYTQ` with its calendar bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Periodo {
    year: i32,
    quarter: u32,
    inicio: NaiveDate,
    fin: NaiveDate,
}

impl Periodo {
    pub fn new(year: i32, quarter: u32) -> Result<Self, EtclError> {
        let bad = || EtclError::BadPeriodo {
            valor: format!("{}T{}", year, quarter),
            linea: None,
        };
        if !(1..=4).contains(&quarter) {
            return Err(bad());
        }
        let inicio = NaiveDate::from_ymd_opt(year, (quarter - 1) * 3 + 1, 1).ok_or_else(bad)?;
        let fin = if quarter == 4 {
            NaiveDate::from_ymd_opt(year, 12, 31)
        } else {
            NaiveDate::from_ymd_opt(year, quarter * 3 + 1, 1).and_then(|d| d.pred_opt())
        }
        .ok_or_else(bad)?;
        Ok(Self {
            year,
            quarter,
            inicio,
            fin,
        })
    }

    pub fn parse(raw: &str) -> Result<Self, EtclError> {
        let trimmed = raw.trim();
        let caps = periodo_regex()
            .captures(trimmed)
            .ok_or_else(|| EtclError::BadPeriodo {
                valor: raw.to_string(),
                linea: None,
            })?;
        let year: i32 = caps[1].parse().map_err(|_| EtclError::BadPeriodo {
            valor: raw.to_string(),
            linea: None,
        })?;
        let quarter: u32 = caps[2].parse().map_err(|_| EtclError::BadPeriodo {
            valor: raw.to_string(),
            linea: None,
        })?;
        Self::new(year, quarter)
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn quarter(&self) -> u32 {
        self.quarter
    }

    pub fn inicio(&self) -> NaiveDate {
        self.inicio
    }

    pub fn fin(&self) -> NaiveDate {
        self.fin
    }

    pub fn code(&self) -> String {
        format!("{}T{}", self.year, self.quarter)
    }
}

impl fmt::Display for Periodo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}T{}", self.year, self.quarter)
    }
}

impl std::str::FromStr for Periodo {
    type Err = EtclError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Periodo::parse(s)
    }
}

impl TryFrom<String> for Periodo {
    type Error = EtclError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Periodo::parse(&value)
    }
}

impl From<Periodo> for String {
    fn from(p: Periodo) -> Self {
        p.code()
    }
}

// =============================================================================
// SLICE
// =============================================================================

/// Selector of one MetricResult: everything in the identity except
/// métrica, causa and fuente.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Slice {
    pub periodo: Periodo,
    pub ambito: Ambito,
    pub ccaa_codigo: Option<String>,
    pub cnae_nivel: CnaeNivel,
    pub cnae_codigo: Option<String>,
    pub tipo_jornada: TipoJornada,
}

impl Slice {
    /// National, all activities, both jornadas.
    pub fn nacional(periodo: Periodo) -> Self {
        Self {
            periodo,
            ambito: Ambito::Nac,
            ccaa_codigo: None,
            cnae_nivel: CnaeNivel::Total,
            cnae_codigo: None,
            tipo_jornada: TipoJornada::Total,
        }
    }

    pub fn clave(&self) -> String {
        [
            self.periodo.code(),
            self.ambito.to_string(),
            self.ccaa_codigo.clone().unwrap_or_default(),
            self.cnae_nivel.to_string(),
            self.cnae_codigo.clone().unwrap_or_default(),
            self.tipo_jornada.to_string(),
        ]
        .join("|")
    }

    /// Same slice in another periodo.
    pub fn at(&self, periodo: Periodo) -> Self {
        Self {
            periodo,
            ..self.clone()
        }
    }
}

impl fmt::Display for Slice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}{} {}{} {}",
            self.periodo,
            self.ambito,
            self.ccaa_codigo
                .as_deref()
                .map(|c| format!(":{}", c))
                .unwrap_or_default(),
            self.cnae_nivel,
            self.cnae_codigo
                .as_deref()
                .map(|c| format!(":{}", c))
                .unwrap_or_default(),
            self.tipo_jornada
        )
    }
}

// =============================================================================
// OBSERVATION
// =============================================================================

pub const UNIDAD: &str = "horas/mes por trabajador";

/// One row of `observaciones_tiempo_trabajo`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub periodo: Periodo,
    pub ambito: Ambito,
    pub ccaa_codigo: Option<String>,
    pub ccaa_nombre: Option<String>,
    pub cnae_nivel: CnaeNivel,
    pub cnae_codigo: Option<String>,
    pub cnae_nombre: Option<String>,
    pub jerarquia_sector: String,
    pub tipo_jornada: TipoJornada,
    pub fuente_tabla: String,
    pub metrica: Metrica,
    pub causa: Option<Causa>,
    pub valor: f64,
    /// None until the store assigns a snapshot.
    pub version_datos: Option<i64>,
    /// Source line, for diagnostics only.
    #[serde(skip)]
    pub linea: usize,
}

impl Observation {
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

    /// Logical identity: the strict identity without `fuente_tabla`.
    pub fn clave_logica(&self) -> String {
        format!(
            "{}|{}|{}",
            self.slice().clave(),
            self.metrica,
            self.causa.map(|c| c.as_str()).unwrap_or_default()
        )
    }

    /// Strict identity key, `|`-joined with empty strings for NULLs.
    pub fn clave(&self) -> String {
        format!("{}|{}", self.clave_logica(), self.fuente_tabla)
    }

    pub fn rol(&self) -> Option<Rol> {
        Rol::of(self.metrica, self.causa)
    }

    pub fn es_total_jornada(&self) -> bool {
        self.tipo_jornada == TipoJornada::Total
    }

    pub fn es_total_ccaa(&self) -> bool {
        self.ambito == Ambito::Nac
    }

    pub fn es_total_cnae(&self) -> bool {
        self.cnae_nivel == CnaeNivel::Total
    }

    /// Grain tag such as `NAC_TOTAL` or `CCAA_SECTOR_BS_JORNADA`.
    pub fn rol_grano(&self) -> String {
        let mut grano = format!("{}_{}", self.ambito, self.cnae_nivel);
        if !self.es_total_jornada() {
            grano.push_str("_JORNADA");
        }
        grano
    }
}
