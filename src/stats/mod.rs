// In-memory aggregators drained into report payloads.

pub mod events;
pub mod traffic;

use std::fmt::Write;

use crate::config::{FIELD_DELIM, FRAME_DELIM, SECTION_DELIM, TUPLE_DELIM};

/// Format a real number the way the collection server parses it: integral values keep a
/// trailing `.0`, very large or very small magnitudes use `E` notation.
pub fn fmt_real(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    let magnitude = value.abs();
    if magnitude == 0.0 || (1e-3..1e7).contains(&magnitude) {
        let s = format!("{}", value);
        if s.contains('.') {
            s
        } else {
            s + ".0"
        }
    } else {
        let s = format!("{:E}", value);
        match s.split_once('E') {
            Some((mantissa, exp)) if !mantissa.contains('.') => format!("{}.0E{}", mantissa, exp),
            _ => s,
        }
    }
}

/// Replace the characters consumers split on, so a free-text value stays one field.
pub fn sanitize_field(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            FIELD_DELIM | TUPLE_DELIM | SECTION_DELIM | FRAME_DELIM | '\r' => '_',
            other => other,
        })
        .collect()
}

/// Append one `a#b#c@` tuple.
pub(crate) fn push_tuple(out: &mut String, fields: &[&dyn std::fmt::Display]) {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(FIELD_DELIM);
        }
        let _ = write!(out, "{}", field);
    }
    out.push(TUPLE_DELIM);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fmt_real() {
        assert_eq!(fmt_real(3.0), "3.0");
        assert_eq!(fmt_real(2.5), "2.5");
        assert_eq!(fmt_real(-0.25), "-0.25");
        assert_eq!(fmt_real(0.0), "0.0");
        assert_eq!(fmt_real(12_345_678.0), "1.2345678E7");
        assert_eq!(fmt_real(10_000_000.0), "1.0E7");
        assert_eq!(fmt_real(0.0001), "1.0E-4");
    }

    #[test]
    fn test_sanitize_field() {
        assert_eq!(sanitize_field("a#b@c$d\ne"), "a_b_c_d_e");
        assert_eq!(sanitize_field("plain text"), "plain text");
    }

    #[test]
    fn test_push_tuple() {
        let mut out = String::new();
        push_tuple(&mut out, &[&7, &12u64, &"x"]);
        push_tuple(&mut out, &[&8, &1u64]);
        assert_eq!(out, "7#12#x@8#1@");
    }
}
