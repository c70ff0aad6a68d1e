//! SCPI codec: parsing and formatting for the text/binary grammar instruments
//! speak over [`crate::transport`].
//!
//! Every function here is pure and synchronous — no I/O, no async, no
//! knowledge of any particular transport or driver. That's deliberate: the
//! codec is exercised with plain unit tests, and higher layers only ever see
//! `&str`/`&[u8]` in, typed values out.

use std::collections::HashMap;
use thiserror::Error;

/// Errors produced while parsing a SCPI response.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScpiError {
    /// The payload did not parse as a number and has no sentinel meaning either.
    #[error("malformed number: {0:?}")]
    MalformedNumber(String),

    /// A definite-length binary block violated the IEEE 488.2 grammar.
    #[error("malformed definite-length block")]
    MalformedBlock,

    /// A value did not match any entry of the expected enum map.
    #[error("unexpected enum value: {0:?}")]
    UnexpectedEnum(String),

    /// A required field was absent from a CSV/tuple response.
    #[error("missing field at index {0}")]
    MissingField(usize),
}

/// Result of parsing a measurement: either a finite reading or a sentinel
/// meaning "the instrument has nothing valid to report".
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Measurement {
    /// A valid finite reading.
    Value(f64),
    /// The device reported an invalid-measurement sentinel (`****`, `9.9E37`, or empty).
    NotAMeasurement,
}

impl Measurement {
    /// The finite value, or `None` for [`Measurement::NotAMeasurement`].
    pub fn value(self) -> Option<f64> {
        match self {
            Measurement::Value(v) => Some(v),
            Measurement::NotAMeasurement => None,
        }
    }
}

/// Magnitude at or above which a reading is treated as the sentinel `9.9E37`
/// family rather than a real measurement.
const SENTINEL_MAGNITUDE: f64 = 9.9e36;

/// Parses a SCPI numeric response, mapping invalid-measurement sentinels to
/// [`Measurement::NotAMeasurement`] rather than failing or defaulting to zero.
pub fn parse_measurement(s: &str) -> Measurement {
    let trimmed = s.trim();
    if trimmed.is_empty() || trimmed == "****" {
        return Measurement::NotAMeasurement;
    }
    match trimmed.parse::<f64>() {
        Ok(v) if v.abs() >= SENTINEL_MAGNITUDE => Measurement::NotAMeasurement,
        Ok(v) => Measurement::Value(v),
        Err(_) => Measurement::NotAMeasurement,
    }
}

/// Parses a plain SCPI number, failing with [`ScpiError::MalformedNumber`] on
/// anything that isn't a finite float (sentinels are a measurement concept,
/// not a plain-number one — see [`parse_measurement`]).
pub fn parse_number(s: &str) -> Result<f64, ScpiError> {
    let trimmed = s.trim();
    trimmed
        .parse::<f64>()
        .map_err(|_| ScpiError::MalformedNumber(s.to_string()))
}

/// Parses a plain SCPI number, falling back to `default` on any parse failure.
pub fn parse_number_or(s: &str, default: f64) -> f64 {
    parse_number(s).unwrap_or(default)
}

/// Parses a SCPI boolean: `"0"`/`"1"`/`"ON"`/`"OFF"`, case-insensitive.
pub fn parse_bool(s: &str) -> Result<bool, ScpiError> {
    match s.trim().to_ascii_uppercase().as_str() {
        "1" | "ON" => Ok(true),
        "0" | "OFF" => Ok(false),
        other => Err(ScpiError::UnexpectedEnum(other.to_string())),
    }
}

/// Formats a bool back into the SCPI `ON`/`OFF` convention used by `write`/`query` commands.
pub fn format_bool(b: bool) -> &'static str {
    if b {
        "ON"
    } else {
        "OFF"
    }
}

/// Looks `s` (trimmed, uppercased) up in `map`, the values of which are the
/// allowed long/short SCPI spellings for a single enum member.
///
/// `map` keys are the canonical name returned on success; values are the
/// accepted wire spellings (case-insensitive) for that key.
pub fn parse_enum<'a>(s: &str, map: &'a [(&'a str, &'a [&'a str])]) -> Result<&'a str, ScpiError> {
    let upper = s.trim().to_ascii_uppercase();
    for (canonical, spellings) in map {
        if spellings.iter().any(|sp| sp.eq_ignore_ascii_case(&upper)) {
            return Ok(canonical);
        }
    }
    Err(ScpiError::UnexpectedEnum(s.to_string()))
}

/// Splits a SCPI comma-separated response into trimmed fields.
pub fn parse_csv(s: &str) -> Vec<String> {
    s.trim().split(',').map(|f| f.trim().to_string()).collect()
}

/// Fetches the `index`-th field of a CSV response, parsed with `parse_number`.
pub fn parse_csv_number(s: &str, index: usize) -> Result<f64, ScpiError> {
    let fields = parse_csv(s);
    let field = fields.get(index).ok_or(ScpiError::MissingField(index))?;
    parse_number(field)
}

/// Decodes an IEEE 488.2 definite-length binary block (`#NLLL…data`).
///
/// `N` is a single ASCII digit giving the width of the following length
/// field; that field is `N` ASCII digits giving the payload length in bytes.
/// A single trailing newline after the payload is tolerated and stripped,
/// but is not counted as part of the declared length.
pub fn parse_definite_block(bytes: &[u8]) -> Result<&[u8], ScpiError> {
    if bytes.first() != Some(&b'#') {
        return Err(ScpiError::MalformedBlock);
    }
    let n = *bytes.get(1).ok_or(ScpiError::MalformedBlock)?;
    if !n.is_ascii_digit() || n == b'0' {
        return Err(ScpiError::MalformedBlock);
    }
    let width = (n - b'0') as usize;
    let len_start = 2;
    let len_end = len_start + width;
    let len_field = bytes.get(len_start..len_end).ok_or(ScpiError::MalformedBlock)?;
    if !len_field.iter().all(u8::is_ascii_digit) {
        return Err(ScpiError::MalformedBlock);
    }
    let len_str = std::str::from_utf8(len_field).map_err(|_| ScpiError::MalformedBlock)?;
    let declared_len: usize = len_str.parse().map_err(|_| ScpiError::MalformedBlock)?;

    let data_start = len_end;
    let data_end = data_start
        .checked_add(declared_len)
        .ok_or(ScpiError::MalformedBlock)?;
    let data = bytes.get(data_start..data_end).ok_or(ScpiError::MalformedBlock)?;

    let rest = &bytes[data_end..];
    if !(rest.is_empty() || rest == b"\n") {
        return Err(ScpiError::MalformedBlock);
    }
    Ok(data)
}

/// Encodes `data` as an IEEE 488.2 definite-length binary block, choosing the
/// narrowest length-field width (minimum 1 digit) that fits the payload length.
pub fn encode_definite_block(data: &[u8]) -> Vec<u8> {
    let len_str = data.len().to_string();
    let width = len_str.len().max(1);
    let mut out = Vec::with_capacity(2 + width + data.len());
    out.push(b'#');
    out.push(b'0' + width as u8);
    out.extend_from_slice(len_str.as_bytes());
    out.extend_from_slice(data);
    out
}

/// A parsed `*IDN?` response: `manufacturer,model,serial,firmware`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Idn {
    /// Instrument manufacturer, as reported.
    pub manufacturer: String,
    /// Instrument model, as reported.
    pub model: String,
    /// Instrument serial number, as reported (empty string if absent).
    pub serial: String,
    /// Firmware/revision field, as reported (empty string if absent).
    pub firmware: String,
}

impl Idn {
    /// Parses a raw `*IDN?` response into its four comma-separated fields.
    pub fn parse(s: &str) -> Result<Idn, ScpiError> {
        let fields = parse_csv(s);
        let get = |i: usize| fields.get(i).cloned().unwrap_or_default();
        if fields.is_empty() {
            return Err(ScpiError::MissingField(0));
        }
        Ok(Idn {
            manufacturer: get(0),
            model: get(1),
            serial: get(2),
            firmware: get(3),
        })
    }

    /// The canonical device id: `manufacturer-model-serial`, lowercased
    ///.
    pub fn canonical_id(&self) -> String {
        format!(
            "{}-{}-{}",
            self.manufacturer.to_lowercase(),
            self.model.to_lowercase(),
            self.serial.to_lowercase()
        )
    }
}

/// Builds a `(canonical_name, [spellings...])` enum table and exposes a
/// "prefer last reported form" tie-break, for cases like mode parsing
/// (`CC`/`CURR` both mean the same thing; keep whichever form the device
/// previously used when formatting a value back out).
pub struct TieBreakEnum<'a> {
    map: &'a [(&'a str, &'a [&'a str])],
}

impl<'a> TieBreakEnum<'a> {
    /// Wraps an enum table for parsing with tie-break awareness.
    pub fn new(map: &'a [(&'a str, &'a [&'a str])]) -> Self {
        Self { map }
    }

    /// Parses `s` against the table.
    pub fn parse(&self, s: &str) -> Result<&'a str, ScpiError> {
        parse_enum(s, self.map)
    }

    /// Looks up every spelling this canonical name accepts, in the order
    /// they appear in the table — the first entry is the "short form" by
    /// convention of how tables in this crate are written.
    pub fn spellings_for(&self, canonical: &str) -> Option<&'a [&'a str]> {
        self.map.iter().find(|(c, _)| *c == canonical).map(|(_, s)| *s)
    }
}

/// The mode-name enum map for PSU/load devices: short forms
/// (`CC`, `CV`, `CR`, `CP`) and SCPI long forms (`CURR`, `VOLT`, `RES`, `POW`)
/// both resolve to the same canonical short-form name.
pub const MODE_ENUM: &[(&str, &[&str])] = &[
    ("CC", &["CC", "CURR"]),
    ("CV", &["CV", "VOLT"]),
    ("CR", &["CR", "RES"]),
    ("CP", &["CP", "POW"]),
];

/// Builds a `name -> Measurement` table from a CSV response, in declared order.
pub fn parse_measurement_csv(s: &str, names: &[&str]) -> HashMap<String, Measurement> {
    let fields = parse_csv(s);
    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let m = fields
                .get(i)
                .map(|f| parse_measurement(f))
                .unwrap_or(Measurement::NotAMeasurement);
            (name.to_string(), m)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_number_roundtrips_finite_values() {
        for x in [0.0, 1.5, -273.15, 1e10, -1e-10] {
            let formatted = format!("{x}");
            assert_eq!(parse_number(&formatted).unwrap(), x);
        }
    }

    #[test]
    fn measurement_sentinels_map_to_not_a_measurement() {
        assert_eq!(parse_measurement("****"), Measurement::NotAMeasurement);
        assert_eq!(parse_measurement(""), Measurement::NotAMeasurement);
        assert_eq!(parse_measurement("9.9E37"), Measurement::NotAMeasurement);
        assert_eq!(parse_measurement("-9.91E37"), Measurement::NotAMeasurement);
        assert_eq!(parse_measurement("12.000"), Measurement::Value(12.0));
    }

    #[test]
    fn bool_accepts_all_four_spellings_case_insensitive() {
        assert_eq!(parse_bool("1").unwrap(), true);
        assert_eq!(parse_bool("on").unwrap(), true);
        assert_eq!(parse_bool("ON").unwrap(), true);
        assert_eq!(parse_bool("0").unwrap(), false);
        assert_eq!(parse_bool("off").unwrap(), false);
        assert!(parse_bool("maybe").is_err());
    }

    #[test]
    fn mode_enum_resolves_both_short_and_long_forms() {
        assert_eq!(parse_enum("CC", MODE_ENUM).unwrap(), "CC");
        assert_eq!(parse_enum("curr", MODE_ENUM).unwrap(), "CC");
        assert_eq!(parse_enum("VOLT", MODE_ENUM).unwrap(), "CV");
        assert!(parse_enum("BOGUS", MODE_ENUM).is_err());
    }

    #[test]
    fn csv_splits_and_trims() {
        assert_eq!(parse_csv(" 1.0 , 2.0,3.0 "), vec!["1.0", "2.0", "3.0"]);
    }

    #[test]
    fn idn_parses_and_derives_canonical_id() {
        let idn = Idn::parse("RIGOL TECHNOLOGIES,DL3021,DL3A123456789,00.01.02").unwrap();
        assert_eq!(idn.manufacturer, "RIGOL TECHNOLOGIES");
        assert_eq!(idn.model, "DL3021");
        assert_eq!(idn.serial, "DL3A123456789");
        assert_eq!(
            idn.canonical_id(),
            "rigol technologies-dl3021-dl3a123456789"
        );
    }

    #[test]
    fn definite_block_round_trip_is_identity() {
        let payload = b"\x00\xff\x10\x20";
        let encoded = encode_definite_block(payload);
        assert_eq!(encoded, b"#14\x00\xff\x10\x20");
        let decoded = parse_definite_block(&encoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn definite_block_round_trip_arbitrary_payloads() {
        for len in [0usize, 1, 9, 10, 255, 1000] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
            let encoded = encode_definite_block(&payload);
            let decoded = parse_definite_block(&encoded).unwrap();
            assert_eq!(decoded, payload.as_slice());
        }
    }

    #[test]
    fn definite_block_rejects_truncated_payload() {
        // Declares 4 bytes but only 3 are present.
        let bytes = b"#14\x00\xff\x10";
        assert_eq!(parse_definite_block(bytes), Err(ScpiError::MalformedBlock));
    }

    #[test]
    fn definite_block_tolerates_trailing_newline() {
        let mut encoded = encode_definite_block(b"abc");
        encoded.push(b'\n');
        assert_eq!(parse_definite_block(&encoded).unwrap(), b"abc");
    }

    #[test]
    fn definite_block_rejects_missing_hash() {
        assert_eq!(parse_definite_block(b"14abc"), Err(ScpiError::MalformedBlock));
    }

    #[test]
    fn definite_block_rejects_non_digit_length_field() {
        assert_eq!(parse_definite_block(b"#1Xabc"), Err(ScpiError::MalformedBlock));
    }

    #[test]
    fn measurement_csv_builds_named_table() {
        let table = parse_measurement_csv("12.000,1.500,****", &["voltage", "current", "power"]);
        assert_eq!(table["voltage"], Measurement::Value(12.0));
        assert_eq!(table["current"], Measurement::Value(1.5));
        assert_eq!(table["power"], Measurement::NotAMeasurement);
    }
}
