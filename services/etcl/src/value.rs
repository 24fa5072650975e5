//! Spanish-locale numeric cells (`1.234,56`)

use std::sync::OnceLock;

use regex::Regex;

use crate::error::EtclError;

pub const VALUE_LIMIT: f64 = 1e6;

/// INE suppression markers and empty cells.
const MISSING_MARKERS: &[&str] = &["", "..", ".", "-"];

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParsedValue {
    Value(f64),
    Missing,
}

fn thousands_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^-?\d{1,3}(\.\d{3})+(,\d+)?$").expect("static thousands pattern"))
}

/// Parse one cell under the VALOR column.
///
/// `.` is a thousands separator only when the whole cell matches the grouped
/// pattern; otherwise it is a decimal point. The last `,` is the decimal mark.
pub fn parse_value(raw: &str) -> Result<ParsedValue, EtclError> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();

    if MISSING_MARKERS.contains(&compact.as_str()) {
        return Ok(ParsedValue::Missing);
    }

    let normalized = if thousands_regex().is_match(&compact) {
        compact.replace('.', "").replace(',', ".")
    } else if compact.contains(',') {
        if compact.contains('.') || compact.matches(',').count() > 1 {
            return Err(EtclError::BadValue {
                raw: raw.to_string(),
            });
        }
        compact.replace(',', ".")
    } else {
        compact
    };

    // f64::from_str accepts "inf" and "NaN"; only plain decimals are valid here
    let plain = normalized
        .chars()
        .enumerate()
        .all(|(i, c)| c.is_ascii_digit() || c == '.' || (i == 0 && (c == '-' || c == '+')));
    if !plain {
        return Err(EtclError::BadValue {
            raw: raw.to_string(),
        });
    }

    let valor: f64 = normalized.parse().map_err(|_| EtclError::BadValue {
        raw: raw.to_string(),
    })?;

    if !valor.is_finite() {
        return Err(EtclError::BadValue {
            raw: raw.to_string(),
        });
    }
    if !(-VALUE_LIMIT..=VALUE_LIMIT).contains(&valor) {
        return Err(EtclError::ValueOutOfRange { valor });
    }

    Ok(ParsedValue::Value(valor))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(raw: &str) -> f64 {
        match parse_value(raw).unwrap() {
            ParsedValue::Value(v) => v,
            ParsedValue::Missing => panic!("{raw} parsed as missing"),
        }
    }

    // -------------------------------------------------------------------------
    // LOCALE TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_decimal_comma() {
        assert_eq!(value("151,0"), 151.0);
        assert_eq!(value("8,3"), 8.3);
        assert_eq!(value("-0,25"), -0.25);
    }

    #[test]
    fn test_thousands_separator() {
        assert_eq!(value("1.234,56"), 1234.56);
        assert_eq!(value("12.345"), 12345.0);
        assert_eq!(value("123.456,7"), 123456.7);
    }

    #[test]
    fn test_dot_as_decimal_when_not_grouped() {
        assert_eq!(value("151.4"), 151.4);
        assert_eq!(value("1.5"), 1.5);
        assert_eq!(value("1234.5"), 1234.5);
    }

    #[test]
    fn test_plain_integer() {
        assert_eq!(value("168"), 168.0);
    }

    #[test]
    fn test_whitespace_and_nbsp_stripped() {
        assert_eq!(value(" 151,0 "), 151.0);
        assert_eq!(value("1\u{a0}234,5"), 1234.5);
    }

    // -------------------------------------------------------------------------
    // MISSING / SUPPRESSED
    // -------------------------------------------------------------------------

    #[test]
    fn test_missing_markers() {
        for raw in ["", "  ", "..", ".", "-", "\u{a0}"] {
            assert_eq!(parse_value(raw).unwrap(), ParsedValue::Missing, "{raw:?}");
        }
    }

    // -------------------------------------------------------------------------
    // ERRORS
    // -------------------------------------------------------------------------

    #[test]
    fn test_out_of_range() {
        assert!(matches!(
            parse_value("1.000.001"),
            Err(EtclError::ValueOutOfRange { .. })
        ));
        assert!(matches!(
            parse_value("-2000000"),
            Err(EtclError::ValueOutOfRange { .. })
        ));
        assert_eq!(value("1.000.000"), 1e6);
    }

    #[test]
    fn test_garbage_rejected() {
        for raw in ["abc", "inf", "NaN", "1,2,3", "1.2,3", "12a"] {
            assert!(
                matches!(parse_value(raw), Err(EtclError::BadValue { .. })),
                "{raw} should be rejected"
            );
        }
    }
}
