//! CSV Reader & Dialect Detector
//!
//! Responsibilities:
//! - Probe encodings in a fixed order on the first 2048 bytes
//! - Detect the separator from the header line (stable over the next 20 lines)
//! - Strip the BOM and yield a rectangular record stream with line provenance
//!
//! DETERMINISTIC: same bytes = same dialect = same records.

use std::path::Path;

use encoding_rs::WINDOWS_1252;
use tracing::debug;

use crate::error::EtclError;

/// Probe order. latin-1 always decodes, so it ends the search for any
/// non-UTF-8 input; the remaining entries document the accepted set.
pub const ENCODINGS: &[&str] = &["utf-8-sig", "utf-8", "latin-1", "cp1252", "iso-8859-1"];
pub const SEPARATORS: &[u8] = &[b';', b',', b'\t'];
pub const DEFAULT_SEPARATOR: u8 = b';';

const PROBE_BYTES: usize = 2048;
const STABILITY_LINES: usize = 20;
const BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Detected file dialect. Decimal convention is always Spanish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dialect {
    pub encoding: &'static str,
    pub separator: u8,
}

impl Dialect {
    pub fn describe(&self) -> String {
        let sep = match self.separator {
            b'\t' => "\\t".to_string(),
            other => (other as char).to_string(),
        };
        format!("{} sep='{}' decimal=','", self.encoding, sep)
    }
}

/// One data line; cells are aligned with the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    /// 1-based line in the file (header is line 1)
    pub linea: usize,
    pub cells: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RawTable {
    pub archivo: String,
    pub dialect: Dialect,
    pub header: Vec<String>,
    pub rows: Vec<RawRow>,
}

// =============================================================================
// ENCODING
// =============================================================================

fn utf8_probe_ok(bytes: &[u8]) -> bool {
    let probe = &bytes[..bytes.len().min(PROBE_BYTES)];
    match std::str::from_utf8(probe) {
        Ok(_) => true,
        // a multi-byte char cut by the probe window is not an error
        Err(e) => e.error_len().is_none() && probe.len() == PROBE_BYTES,
    }
}

fn decode_with(bytes: &[u8], encoding: &str) -> Option<String> {
    match encoding {
        "utf-8-sig" => {
            let body = bytes.strip_prefix(BOM)?;
            if !utf8_probe_ok(body) {
                return None;
            }
            String::from_utf8(body.to_vec()).ok()
        }
        "utf-8" => {
            if !utf8_probe_ok(bytes) {
                return None;
            }
            String::from_utf8(bytes.to_vec()).ok()
        }
        "latin-1" | "cp1252" | "iso-8859-1" => WINDOWS_1252
            .decode_without_bom_handling_and_without_replacement(bytes)
            .map(|text| text.into_owned()),
        _ => None,
    }
}

/// First encoding of `ENCODINGS` that decodes without replacement.
pub fn decode(bytes: &[u8], archivo: &str) -> Result<(&'static str, String), EtclError> {
    for &encoding in ENCODINGS {
        if let Some(text) = decode_with(bytes, encoding) {
            return Ok((encoding, text));
        }
    }
    Err(EtclError::SourceDecode {
        archivo: archivo.to_string(),
        intentadas: ENCODINGS.join(", "),
    })
}

// =============================================================================
// SEPARATOR
// =============================================================================

/// Count separators outside double-quoted sections.
fn count_unquoted(line: &str, sep: u8) -> usize {
    let mut in_quotes = false;
    let mut count = 0;
    for b in line.bytes() {
        if b == b'"' {
            in_quotes = !in_quotes;
        } else if b == sep && !in_quotes {
            count += 1;
        }
    }
    count
}

/// Pick the first separator whose header count is >= 2 and identical on the
/// next lines (up to 20). Defaults to `;`.
pub fn detect_separator(text: &str) -> u8 {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let Some(header) = lines.next() else {
        return DEFAULT_SEPARATOR;
    };
    let following: Vec<&str> = lines.take(STABILITY_LINES).collect();

    for &sep in SEPARATORS {
        let expected = count_unquoted(header, sep);
        if expected < 2 {
            continue;
        }
        if following.iter().all(|l| count_unquoted(l, sep) == expected) {
            return sep;
        }
    }
    DEFAULT_SEPARATOR
}

// =============================================================================
// READER
// =============================================================================

/// Parse decoded text into a RawTable.
///
/// Errors: empty header or duplicated column names -> SourceStructureError.
/// A header-only file is valid and yields no rows.
pub fn read_text(text: &str, archivo: &str, encoding: &'static str) -> Result<RawTable, EtclError> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let separator = detect_separator(text);

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(separator)
        .flexible(true)
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let structure = |detalle: String| EtclError::SourceStructure {
        archivo: archivo.to_string(),
        detalle,
    };

    let header: Vec<String> = reader
        .headers()
        .map_err(|e| structure(format!("unreadable header: {}", e)))?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
        .collect();

    if header.is_empty() || header.iter().all(|h| h.is_empty()) {
        return Err(structure("missing header".to_string()));
    }
    if let Some(pos) = header.iter().position(|h| h.is_empty()) {
        return Err(structure(format!("empty column name at position {}", pos)));
    }
    for (i, name) in header.iter().enumerate() {
        if header[..i].contains(name) {
            return Err(structure(format!("duplicated column '{}'", name)));
        }
    }

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result.map_err(|e| structure(format!("unreadable record: {}", e)))?;
        // position line is 1-based and counts the header
        let linea = record
            .position()
            .map(|p| p.line() as usize)
            .unwrap_or(rows.len() + 2);
        if record.iter().all(|c| c.is_empty()) {
            continue;
        }
        rows.push(RawRow {
            linea,
            cells: record.iter().map(|c| c.to_string()).collect(),
        });
    }

    debug!(archivo, columns = header.len(), rows = rows.len(), "CSV read");

    Ok(RawTable {
        archivo: archivo.to_string(),
        dialect: Dialect {
            encoding,
            separator,
        },
        header,
        rows,
    })
}

pub fn read_bytes(bytes: &[u8], archivo: &str) -> Result<RawTable, EtclError> {
    let (encoding, text) = decode(bytes, archivo)?;
    read_text(&text, archivo, encoding)
}

pub fn read_file(path: &Path) -> Result<RawTable, EtclError> {
    let archivo = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    let bytes = std::fs::read(path).map_err(|e| EtclError::SourceDecode {
        archivo: archivo.clone(),
        intentadas: format!("none, open failed: {}", e),
    })?;
    read_bytes(&bytes, &archivo)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Tipo de jornada;Sectores de actividad CNAE 2009;Tiempo de trabajo;Periodo;Total\n\
                          Ambas jornadas;Industria;Horas pactadas;2025T1;152,4\n\
                          Ambas jornadas;Industria;Horas efectivas;2025T1;153,5\n";

    // -------------------------------------------------------------------------
    // ENCODING TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_utf8_with_bom() {
        let mut bytes = BOM.to_vec();
        bytes.extend_from_slice("Periodo;Total;Tiempo de trabajo\n2025T1;1;Horas\n".as_bytes());
        let table = read_bytes(&bytes, "6042.csv").unwrap();
        assert_eq!(table.dialect.encoding, "utf-8-sig");
        assert_eq!(table.header[0], "Periodo");
    }

    #[test]
    fn test_plain_utf8() {
        let table = read_bytes(SAMPLE.as_bytes(), "6042.csv").unwrap();
        assert_eq!(table.dialect.encoding, "utf-8");
        assert_eq!(table.header.len(), 5);
        assert_eq!(table.rows.len(), 2);
    }

    #[test]
    fn test_latin1_fallback() {
        let (bytes, _, _) = WINDOWS_1252.encode("Comunidades y Ciudades Autónomas;Periodo;Total\n09 Cataluña;2025T1;1,0\n");
        let table = read_bytes(&bytes, "6063.csv").unwrap();
        assert_eq!(table.dialect.encoding, "latin-1");
        assert_eq!(table.header[0], "Comunidades y Ciudades Autónomas");
        assert_eq!(table.rows[0].cells[0], "09 Cataluña");
    }

    #[test]
    fn test_utf8_probe_tolerates_cut_char() {
        let mut text = "a".repeat(PROBE_BYTES - 1);
        text.push('ñ');
        assert!(utf8_probe_ok(text.as_bytes()));
    }

    // -------------------------------------------------------------------------
    // SEPARATOR TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_detect_semicolon() {
        assert_eq!(detect_separator(SAMPLE), b';');
    }

    #[test]
    fn test_detect_tab() {
        assert_eq!(detect_separator("Periodo\tTotal\tTiempo\n2025T1\t1\tx\n"), b'\t');
    }

    #[test]
    fn test_detect_comma_ignores_quoted() {
        let text = "Periodo,Total,Tiempo de trabajo\n2025T1,\"151,0\",Horas pactadas\n";
        assert_eq!(detect_separator(text), b',');
    }

    #[test]
    fn test_unstable_count_falls_back_to_default() {
        // commas inside unquoted labels make the count unstable
        let text = "a,b,c\n1,2,3,4\n";
        assert_eq!(detect_separator(text), b';');
    }

    // -------------------------------------------------------------------------
    // STRUCTURE TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_header_only_is_accepted() {
        let table = read_bytes("Periodo;Total;Tiempo de trabajo\n".as_bytes(), "6042.csv").unwrap();
        assert!(table.rows.is_empty());
    }

    #[test]
    fn test_empty_file_is_structure_error() {
        let err = read_bytes(b"", "6042.csv").unwrap_err();
        assert!(matches!(err, EtclError::SourceStructure { .. }));
    }

    #[test]
    fn test_duplicate_column_is_structure_error() {
        let err = read_bytes("Periodo;Total;Total\n2025T1;1;2\n".as_bytes(), "6042.csv").unwrap_err();
        match err {
            EtclError::SourceStructure { detalle, .. } => assert!(detalle.contains("Total")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_line_numbers_count_header() {
        let table = read_bytes(SAMPLE.as_bytes(), "6042.csv").unwrap();
        assert_eq!(table.rows[0].linea, 2);
        assert_eq!(table.rows[1].linea, 3);
    }

    #[test]
    fn test_read_determinism() {
        let a = read_bytes(SAMPLE.as_bytes(), "6042.csv").unwrap();
        let b = read_bytes(SAMPLE.as_bytes(), "6042.csv").unwrap();
        assert_eq!(a.header, b.header);
        assert_eq!(a.rows, b.rows);
        assert_eq!(a.dialect, b.dialect);
    }
}
