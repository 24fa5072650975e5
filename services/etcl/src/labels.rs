//! Label catalogue: raw INE label text -> canonical codes
//!
//! Responsibilities:
//! - Normalize labels (case, accents, punctuation, INE status suffixes)
//! - CCAA names and "NN Name" prefixed labels -> two-character code
//! - CNAE sector / section / division labels -> (nivel, código, nombre)
//! - Jornada labels -> TipoJornada
//! - "Tiempo de trabajo" labels -> (métrica, causa)
//!
//! Every lookup is explicit: an unknown label returns None and the caller
//! records an UnmappedLabel event. Nothing is guessed.

use std::sync::OnceLock;

use regex::Regex;

use crate::model::{Causa, CnaeNivel, GranularidadSector, Metrica, TipoJornada};

/// INE status suffixes removed before any lookup.
const STATUS_SUFFIXES: &[&str] = &["(provisional)", "(avance)"];

/// Strip INE status suffixes such as " (provisional)".
pub fn strip_status_suffix(raw: &str) -> &str {
    let mut label = raw.trim();
    loop {
        let lower = label.to_lowercase();
        match STATUS_SUFFIXES.iter().find(|s| lower.ends_with(*s)) {
            Some(suffix) => {
                // suffixes are ASCII, so byte lengths agree after lowercasing
                label = label[..label.len() - suffix.len()].trim_end();
            }
            None => return label,
        }
    }
}

/// Lowercase, fold Spanish accents, punctuation to spaces, collapse spaces.
/// Deterministic: the same label always normalizes to the same key.
pub fn normalize(raw: &str) -> String {
    let label = strip_status_suffix(raw);
    let folded: String = label
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ñ' => 'n',
            'ç' => 'c',
            c if c.is_alphanumeric() => c,
            _ => ' ',
        })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

// =============================================================================
// CCAA
// =============================================================================

/// INE codes, canonical names and accepted aliases.
const CCAA: &[(&str, &str, &[&str])] = &[
    ("01", "Andalucía", &["andalucia"]),
    ("02", "Aragón", &["aragon"]),
    ("03", "Asturias, Principado de", &["asturias", "principado de asturias"]),
    ("04", "Balears, Illes", &["illes balears", "islas baleares", "baleares", "balears"]),
    ("05", "Canarias", &["canarias"]),
    ("06", "Cantabria", &["cantabria"]),
    ("07", "Castilla y León", &["castilla y leon", "castilla leon"]),
    ("08", "Castilla - La Mancha", &["castilla la mancha"]),
    ("09", "Cataluña", &["cataluna", "catalunya"]),
    ("10", "Comunitat Valenciana", &["comunidad valenciana", "valenciana"]),
    ("11", "Extremadura", &["extremadura"]),
    ("12", "Galicia", &["galicia"]),
    ("13", "Madrid, Comunidad de", &["madrid", "comunidad de madrid"]),
    ("14", "Murcia, Región de", &["murcia", "region de murcia"]),
    ("15", "Navarra, Comunidad Foral de", &["navarra", "comunidad foral de navarra"]),
    ("16", "País Vasco", &["pais vasco", "euskadi"]),
    ("17", "Rioja, La", &["la rioja", "rioja"]),
    ("18", "Ceuta", &["ceuta"]),
    ("19", "Melilla", &["melilla"]),
];

const NACIONAL: &[&str] = &["total nacional", "nacional", "espana", "total espana"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CcaaLabel {
    Nacional,
    Comunidad {
        codigo: &'static str,
        nombre: &'static str,
    },
}

pub fn all_ccaa_codes() -> impl Iterator<Item = &'static str> {
    CCAA.iter().map(|(code, _, _)| *code)
}

pub fn ccaa_nombre(codigo: &str) -> Option<&'static str> {
    CCAA.iter()
        .find(|(code, _, _)| *code == codigo)
        .map(|(_, nombre, _)| *nombre)
}

fn by_name(norm: &str) -> Option<CcaaLabel> {
    CCAA.iter()
        .find(|(_, nombre, aliases)| normalize(nombre) == norm || aliases.contains(&norm))
        .map(|&(codigo, nombre, _)| CcaaLabel::Comunidad { codigo, nombre })
}

/// "13 Madrid, Comunidad de", "Madrid", "Total Nacional".
pub fn parse_ccaa(raw: &str) -> Option<CcaaLabel> {
    let norm = normalize(raw);
    if NACIONAL.contains(&norm.as_str()) {
        return Some(CcaaLabel::Nacional);
    }

    // "NN Name": the code wins, but the name must not contradict it
    if let Some((prefix, rest)) = norm.split_once(' ') {
        if prefix.len() == 2 && prefix.chars().all(|c| c.is_ascii_digit()) {
            let &(codigo, nombre, _) = CCAA.iter().find(|(code, _, _)| *code == prefix)?;
            return match by_name(rest) {
                Some(CcaaLabel::Comunidad { codigo: other, .. }) if other != codigo => None,
                _ => Some(CcaaLabel::Comunidad { codigo, nombre }),
            };
        }
    }
    if norm.len() == 2 && norm.chars().all(|c| c.is_ascii_digit()) {
        return CCAA
            .iter()
            .find(|(code, _, _)| *code == norm)
            .map(|&(codigo, nombre, _)| CcaaLabel::Comunidad { codigo, nombre });
    }

    by_name(&norm)
}

// =============================================================================
// CNAE
// =============================================================================

/// Division ranges (inclusive) -> CNAE-2009 section.
const DIVISION_SECCION: &[(u32, u32, &str)] = &[
    (1, 3, "A"),
    (5, 9, "B"),
    (10, 33, "C"),
    (35, 35, "D"),
    (36, 39, "E"),
    (41, 43, "F"),
    (45, 47, "G"),
    (49, 53, "H"),
    (55, 56, "I"),
    (58, 63, "J"),
    (64, 66, "K"),
    (68, 68, "L"),
    (69, 75, "M"),
    (77, 82, "N"),
    (84, 84, "O"),
    (85, 85, "P"),
    (86, 88, "Q"),
    (90, 93, "R"),
    (94, 96, "S"),
];

const SECTORES: &[(&str, &str, &[&str])] = &[
    ("B-E", "Industria", &["industria", "b e industria"]),
    ("F", "Construcción", &["construccion", "f construccion"]),
    ("G-S", "Servicios", &["servicios", "g s servicios"]),
];

pub const NOMBRE_TOTAL_CNAE: &str = "Industria, construcción y servicios";

/// Resolved CNAE node of one label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CnaeNode {
    pub nivel: CnaeNivel,
    pub codigo: Option<String>,
    pub nombre: Option<String>,
}

impl CnaeNode {
    fn total() -> Self {
        Self {
            nivel: CnaeNivel::Total,
            codigo: None,
            nombre: Some(NOMBRE_TOTAL_CNAE.to_string()),
        }
    }

    /// Path label: `Total`, `Total>Sector B-E`, `Total>Sección C>División 10`.
    pub fn jerarquia(&self) -> String {
        match (self.nivel, self.codigo.as_deref()) {
            (CnaeNivel::SectorBs, Some(c)) => format!("Total>Sector {}", c),
            (CnaeNivel::Seccion, Some(c)) => format!("Total>Sección {}", c),
            (CnaeNivel::Division, Some(c)) => match seccion_de_division(c) {
                Some(s) => format!("Total>Sección {}>División {}", s, c),
                None => format!("Total>División {}", c),
            },
            _ => "Total".to_string(),
        }
    }
}

pub fn seccion_de_division(division: &str) -> Option<&'static str> {
    let n: u32 = division.parse().ok()?;
    DIVISION_SECCION
        .iter()
        .find(|(lo, hi, _)| (*lo..=*hi).contains(&n))
        .map(|(_, _, s)| *s)
}

fn seccion_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-U])(?:\.\s*|\s+)(\S.*)$").expect("static section pattern"))
}

fn division_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{2})\.?\s+(\S.*)$").expect("static division pattern"))
}

fn is_union_aggregate(label: &str) -> bool {
    let norm = normalize(label);
    norm.starts_with("b s ")
        || norm == "b s"
        || norm == "total"
        || norm == "total cnae"
        || norm == "todas las actividades"
        || norm.starts_with("industria construccion y servicios")
}

/// Resolve a CNAE label under the table's declared granularity.
///
/// The `B-S` union always resolves to `TOTAL`. Any other label must match the
/// declared level, otherwise it is unmapped.
pub fn parse_cnae(raw: &str, granularidad: GranularidadSector) -> Option<CnaeNode> {
    let label = strip_status_suffix(raw);
    if is_union_aggregate(label) {
        return Some(CnaeNode::total());
    }

    match granularidad {
        GranularidadSector::SectorBs | GranularidadSector::CcaaSector => {
            let norm = normalize(label);
            SECTORES
                .iter()
                .find(|(code, nombre, aliases)| {
                    aliases.contains(&norm.as_str())
                        || normalize(nombre) == norm
                        || normalize(code) == norm
                })
                .map(|(code, nombre, _)| CnaeNode {
                    nivel: CnaeNivel::SectorBs,
                    codigo: Some(code.to_string()),
                    nombre: Some(nombre.to_string()),
                })
        }
        GranularidadSector::SeccionCnae => {
            let caps = seccion_regex().captures(label)?;
            Some(CnaeNode {
                nivel: CnaeNivel::Seccion,
                codigo: Some(caps[1].to_string()),
                nombre: Some(caps[2].trim().to_string()),
            })
        }
        GranularidadSector::DivisionCnae => {
            let caps = division_regex().captures(label)?;
            let codigo = caps[1].to_string();
            seccion_de_division(&codigo)?;
            Some(CnaeNode {
                nivel: CnaeNivel::Division,
                codigo: Some(codigo),
                nombre: Some(caps[2].trim().to_string()),
            })
        }
        GranularidadSector::Ninguna => None,
    }
}

// =============================================================================
// JORNADA
// =============================================================================

pub fn parse_jornada(raw: &str) -> Option<TipoJornada> {
    match normalize(raw).as_str() {
        "ambas jornadas" | "total" | "jornada total" | "todas las jornadas" => {
            Some(TipoJornada::Total)
        }
        "jornada a tiempo completo" | "tiempo completo" | "jornada completa" | "completa" => {
            Some(TipoJornada::Completa)
        }
        "jornada a tiempo parcial" | "tiempo parcial" | "jornada parcial" | "parcial" => {
            Some(TipoJornada::Parcial)
        }
        _ => None,
    }
}

// =============================================================================
// TIEMPO DE TRABAJO
// =============================================================================

const HNT_PREFIXES: &[&str] = &["horas no trabajadas", "horas perdidas"];

/// "Tiempo de trabajo" label -> (métrica, causa).
///
/// Hours-not-worked without a qualifier (or "(Total)") is the source total
/// and carries no causa.
pub fn parse_tiempo_trabajo(raw: &str) -> Option<(Metrica, Option<Causa>)> {
    let norm = normalize(raw);

    let simple = match norm.as_str() {
        "horas pactadas" => Some(Metrica::HorasPactadas),
        "horas pagadas" => Some(Metrica::HorasPagadas),
        "horas efectivas" | "horas efectivas de trabajo" => Some(Metrica::HorasEfectivas),
        "horas extraordinarias" | "horas extras" | "horas extras por trabajador" => {
            Some(Metrica::HorasExtraordinarias)
        }
        _ => None,
    };
    if let Some(metrica) = simple {
        return Some((metrica, None));
    }

    if norm.starts_with("horas perdidas en el lugar de trabajo") {
        return Some((
            Metrica::HorasNoTrabajadas,
            Some(Causa::PerdidasLugarTrabajo),
        ));
    }

    let prefix = HNT_PREFIXES.iter().find(|p| norm.starts_with(*p))?;
    let rest = norm[prefix.len()..].trim();
    if rest.is_empty() || rest == "total" || rest == "por trabajador" {
        return Some((Metrica::HorasNoTrabajadas, None));
    }
    classify_causa(rest).map(|c| (Metrica::HorasNoTrabajadas, Some(c)))
}

/// Ordered keyword classifier over the normalized qualifier
/// ("por vacaciones y fiestas", "por i t", ...). First match wins.
pub fn classify_causa(qualifier: &str) -> Option<Causa> {
    let tokens: Vec<&str> = qualifier.split_whitespace().collect();
    let has = |needle: &str| qualifier.contains(needle);
    let has_token = |t: &str| tokens.contains(&t);
    let is_it = has_token("it")
        || tokens.windows(2).any(|w| w == ["i", "t"])
        || has("incapacidad");
    let unpaid = has("no remunerad") || has("no pagad") || has("no retribuid");
    let paid = has("remunerad") || has("pagad") || has("retribuid");

    let causa = if has("vacaciones") && (has("fiestas") || has("festivos")) {
        Causa::VacacionesYFiestas
    } else if has("vacaciones") {
        Causa::Vacaciones
    } else if has("fiestas") || has("festivos") {
        Causa::Festivos
    } else if is_it {
        Causa::ItTotal
    } else if has("maternidad") || has("paternidad") || has("nacimiento") {
        Causa::MaternidadPaternidad
    } else if has("representacion sindical") {
        Causa::RepresentacionSindical
    } else if has("permiso") {
        Causa::PermisosRetribuidos
    } else if has("compensacion") {
        Causa::CompensacionExtras
    } else if has("perdidas") || has("lugar de trabajo") {
        Causa::PerdidasLugarTrabajo
    } else if has("conflict") || has("huelga") {
        Causa::Conflictividad
    } else if has("razones tecnicas")
        || has("economicas")
        || has("fuerza mayor")
        || has_token("erte")
        || has("expediente")
    {
        Causa::RazonesTecnicasEconomicas
    } else if has("otras") && unpaid {
        Causa::OtrasNoRemuneradas
    } else if has("otras") && paid {
        Causa::OtrasRemuneradas
    } else if unpaid {
        Causa::NoPagadasAgregado
    } else if paid {
        Causa::PagadasAgregado
    } else if has("otras causas") || has_token("otros") || has_token("otras") {
        Causa::Otros
    } else {
        return None;
    };
    Some(causa)
}

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------------
    // NORMALIZATION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_normalize_accents_and_punctuation() {
        assert_eq!(normalize("  Castilla - La Mancha "), "castilla la mancha");
        assert_eq!(normalize("Horas no trabajadas por I.T."), "horas no trabajadas por i t");
        assert_eq!(normalize("Construcción"), "construccion");
        assert_eq!(normalize("Cataluña"), "cataluna");
    }

    #[test]
    fn test_status_suffix_stripped() {
        assert_eq!(strip_status_suffix("C Industria manufacturera (provisional)"), "C Industria manufacturera");
        assert_eq!(strip_status_suffix("Servicios (Avance)"), "Servicios");
        assert_eq!(normalize("Industria (provisional)"), "industria");
    }

    #[test]
    fn test_normalize_determinism() {
        let label = "Horas no trabajadas por vacaciones y fiestas";
        let first = normalize(label);
        for _ in 0..10 {
            assert_eq!(normalize(label), first);
        }
    }

    // -------------------------------------------------------------------------
    // CCAA TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_ccaa_prefixed_labels() {
        assert_eq!(
            parse_ccaa("13 Madrid, Comunidad de"),
            Some(CcaaLabel::Comunidad {
                codigo: "13",
                nombre: "Madrid, Comunidad de"
            })
        );
        assert_eq!(
            parse_ccaa("17 Rioja, La"),
            Some(CcaaLabel::Comunidad {
                codigo: "17",
                nombre: "Rioja, La"
            })
        );
        assert_eq!(
            parse_ccaa("01 Andalucía"),
            Some(CcaaLabel::Comunidad {
                codigo: "01",
                nombre: "Andalucía"
            })
        );
    }

    #[test]
    fn test_ccaa_plain_names_and_aliases() {
        assert!(matches!(parse_ccaa("Madrid"), Some(CcaaLabel::Comunidad { codigo: "13", .. })));
        assert!(matches!(parse_ccaa("Illes Balears"), Some(CcaaLabel::Comunidad { codigo: "04", .. })));
        assert!(matches!(
            parse_ccaa("Castilla-La Mancha"),
            Some(CcaaLabel::Comunidad { codigo: "08", .. })
        ));
        assert!(matches!(parse_ccaa("Ceuta"), Some(CcaaLabel::Comunidad { codigo: "18", .. })));
    }

    #[test]
    fn test_ccaa_national() {
        assert_eq!(parse_ccaa("Total Nacional"), Some(CcaaLabel::Nacional));
        assert_eq!(parse_ccaa(" total nacional "), Some(CcaaLabel::Nacional));
    }

    #[test]
    fn test_ccaa_unknown_or_contradictory() {
        assert_eq!(parse_ccaa("Atlántida"), None);
        assert_eq!(parse_ccaa("20 Gibraltar"), None);
        // code and name disagree
        assert_eq!(parse_ccaa("13 Cataluña"), None);
    }

    #[test]
    fn test_ccaa_catalogue_complete() {
        assert_eq!(all_ccaa_codes().count(), 19);
        assert_eq!(ccaa_nombre("18"), Some("Ceuta"));
        assert_eq!(ccaa_nombre("20"), None);
    }

    // -------------------------------------------------------------------------
    // CNAE TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_cnae_union_is_total() {
        let long = "B_S Industria, construcción y servicios (excepto actividades de los hogares como empleadores y de organizaciones y organismos extraterritoriales)";
        for granularidad in GranularidadSector::ALL {
            let node = parse_cnae(long, *granularidad).unwrap();
            assert_eq!(node.nivel, CnaeNivel::Total);
            assert_eq!(node.codigo, None);
            assert_eq!(node.jerarquia(), "Total");
        }
        assert_eq!(
            parse_cnae("Industria, construcción y servicios", GranularidadSector::SectorBs)
                .unwrap()
                .nivel,
            CnaeNivel::Total
        );
    }

    #[test]
    fn test_cnae_sectors() {
        let node = parse_cnae("Industria", GranularidadSector::SectorBs).unwrap();
        assert_eq!(node.nivel, CnaeNivel::SectorBs);
        assert_eq!(node.codigo.as_deref(), Some("B-E"));
        assert_eq!(node.jerarquia(), "Total>Sector B-E");

        let node = parse_cnae("Construcción", GranularidadSector::CcaaSector).unwrap();
        assert_eq!(node.codigo.as_deref(), Some("F"));

        let node = parse_cnae("Servicios (provisional)", GranularidadSector::SectorBs).unwrap();
        assert_eq!(node.codigo.as_deref(), Some("G-S"));
    }

    #[test]
    fn test_cnae_sections() {
        for label in ["C Industria manufacturera", "C. Industria manufacturera"] {
            let node = parse_cnae(label, GranularidadSector::SeccionCnae).unwrap();
            assert_eq!(node.nivel, CnaeNivel::Seccion);
            assert_eq!(node.codigo.as_deref(), Some("C"));
            assert_eq!(node.nombre.as_deref(), Some("Industria manufacturera"));
            assert_eq!(node.jerarquia(), "Total>Sección C");
        }
    }

    #[test]
    fn test_cnae_divisions() {
        let node = parse_cnae("10 Industria de la alimentación", GranularidadSector::DivisionCnae).unwrap();
        assert_eq!(node.nivel, CnaeNivel::Division);
        assert_eq!(node.codigo.as_deref(), Some("10"));
        assert_eq!(node.jerarquia(), "Total>Sección C>División 10");

        let node = parse_cnae("86 Actividades sanitarias", GranularidadSector::DivisionCnae).unwrap();
        assert_eq!(node.jerarquia(), "Total>Sección Q>División 86");

        // 04 is not a CNAE-2009 division
        assert_eq!(parse_cnae("04 Nada", GranularidadSector::DivisionCnae), None);
    }

    #[test]
    fn test_cnae_level_mismatch_is_unmapped() {
        assert_eq!(parse_cnae("Industria", GranularidadSector::DivisionCnae), None);
        assert_eq!(parse_cnae("10 Industria de la alimentación", GranularidadSector::SectorBs), None);
        assert_eq!(parse_cnae("Industria", GranularidadSector::Ninguna), None);
    }

    #[test]
    fn test_division_section_map() {
        assert_eq!(seccion_de_division("05"), Some("B"));
        assert_eq!(seccion_de_division("33"), Some("C"));
        assert_eq!(seccion_de_division("35"), Some("D"));
        assert_eq!(seccion_de_division("43"), Some("F"));
        assert_eq!(seccion_de_division("68"), Some("L"));
        assert_eq!(seccion_de_division("96"), Some("S"));
        assert_eq!(seccion_de_division("97"), None);
        assert_eq!(seccion_de_division("x"), None);
    }

    // -------------------------------------------------------------------------
    // JORNADA TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_jornada_labels() {
        assert_eq!(parse_jornada("Ambas jornadas"), Some(TipoJornada::Total));
        assert_eq!(parse_jornada("Total"), Some(TipoJornada::Total));
        assert_eq!(parse_jornada("Jornada a tiempo completo"), Some(TipoJornada::Completa));
        assert_eq!(parse_jornada("Jornada a tiempo parcial"), Some(TipoJornada::Parcial));
        assert_eq!(parse_jornada("Media jornada"), None);
    }

    // -------------------------------------------------------------------------
    // TIEMPO DE TRABAJO TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_simple_metrics() {
        assert_eq!(parse_tiempo_trabajo("Horas pactadas"), Some((Metrica::HorasPactadas, None)));
        assert_eq!(parse_tiempo_trabajo("Horas pagadas"), Some((Metrica::HorasPagadas, None)));
        assert_eq!(
            parse_tiempo_trabajo("Horas efectivas de trabajo"),
            Some((Metrica::HorasEfectivas, None))
        );
        assert_eq!(
            parse_tiempo_trabajo("Horas extras por trabajador"),
            Some((Metrica::HorasExtraordinarias, None))
        );
        assert_eq!(
            parse_tiempo_trabajo("Horas extraordinarias"),
            Some((Metrica::HorasExtraordinarias, None))
        );
    }

    #[test]
    fn test_hnt_total_has_no_causa() {
        assert_eq!(
            parse_tiempo_trabajo("Horas no trabajadas"),
            Some((Metrica::HorasNoTrabajadas, None))
        );
        assert_eq!(
            parse_tiempo_trabajo("Horas no trabajadas (Total)"),
            Some((Metrica::HorasNoTrabajadas, None))
        );
    }

    #[test]
    fn test_hnt_causas() {
        let cases = [
            ("Horas no trabajadas por vacaciones y fiestas", Causa::VacacionesYFiestas),
            ("Horas no trabajadas por vacaciones", Causa::Vacaciones),
            ("Horas no trabajadas por fiestas", Causa::Festivos),
            ("Horas no trabajadas por I.T.", Causa::ItTotal),
            ("Horas no trabajadas por IT", Causa::ItTotal),
            ("Horas no trabajadas por incapacidad temporal", Causa::ItTotal),
            ("Horas no trabajadas: maternidad", Causa::MaternidadPaternidad),
            ("Horas no trabajadas por maternidad y paternidad", Causa::MaternidadPaternidad),
            ("Horas no trabajadas por permisos remunerados", Causa::PermisosRetribuidos),
            ("Horas no trabajadas por compensación de horas extraordinarias", Causa::CompensacionExtras),
            ("Horas perdidas en el lugar de trabajo", Causa::PerdidasLugarTrabajo),
            ("Horas no trabajadas por conflictividad laboral", Causa::Conflictividad),
            ("Horas no trabajadas por representación sindical", Causa::RepresentacionSindical),
            ("Horas no trabajadas por razones técnicas o económicas", Causa::RazonesTecnicasEconomicas),
            ("Horas no trabajadas por otras causas remuneradas", Causa::OtrasRemuneradas),
            ("Horas no trabajadas por otras causas no remuneradas", Causa::OtrasNoRemuneradas),
            ("Horas no trabajadas remuneradas", Causa::PagadasAgregado),
            ("Horas no trabajadas no remuneradas", Causa::NoPagadasAgregado),
            ("Horas no trabajadas por otras causas", Causa::Otros),
        ];
        for (label, expected) in cases {
            assert_eq!(
                parse_tiempo_trabajo(label),
                Some((Metrica::HorasNoTrabajadas, Some(expected))),
                "{label}"
            );
        }
    }

    #[test]
    fn test_it_token_not_matched_inside_words() {
        // "visita" must not become IT
        assert_eq!(classify_causa("por visita medica"), None);
    }

    #[test]
    fn test_unrecognized_labels() {
        assert_eq!(parse_tiempo_trabajo("Coste laboral total"), None);
        assert_eq!(parse_tiempo_trabajo("Horas no trabajadas por motivos ocasionales"), None);
        assert_eq!(parse_tiempo_trabajo(""), None);
    }
}
