//! Register word codec and protocol constants.
//!
//! Raw values travel as big-endian 16-bit words. A 32-bit register occupies
//! two consecutive words with the high half first.

use crate::catalog::Primitive;
use std::time::Duration;

/// Largest number of registers a single read request may cover.
pub const MAX_READ_SPAN: u16 = 125;

/// Refresh interval of registers that do not define their own.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Pause after every frame on the line.
pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_millis(30);

/// Pause after a failed reconnect attempt.
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound for a single connect, read or write.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// The word slice does not match the register length.
    #[error("Register '{key}' expects {expected} words, got {actual}")]
    LengthMismatch {
        key: String,
        expected: usize,
        actual: usize,
    },

    /// A block response carried fewer words than requested.
    #[error("Block at {start} expects {expected} words, got {actual}")]
    ShortResponse {
        start: u16,
        expected: usize,
        actual: usize,
    },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EncodeError {
    #[error("Value {0} is not a finite number")]
    NotFinite(f64),

    /// The scaled value does not fit into a single register.
    #[error("Value {value} is out of range for register '{key}'")]
    OutOfRange { key: String, value: f64 },

    #[error("Value {value} is below the minimum {min} of register '{key}'")]
    BelowMinimum { key: String, value: f64, min: f64 },

    #[error("Value {value} is above the maximum {max} of register '{key}'")]
    AboveMaximum { key: String, value: f64, max: f64 },
}

/// Unscaled integer value of a register, honoring its length and signedness.
pub fn decode_raw(words: &[u16], def: &Primitive) -> Result<i64, DecodeError> {
    if words.len() != usize::from(def.length) {
        return Err(DecodeError::LengthMismatch {
            key: def.key.clone(),
            expected: usize::from(def.length),
            actual: words.len(),
        });
    }
    let bits = 16 * u32::from(def.length);
    let raw = words
        .iter()
        .fold(0u64, |acc, word| (acc << 16) | u64::from(*word)) as i64;
    if def.signed && raw & (1 << (bits - 1)) != 0 {
        Ok(raw - (1 << bits))
    } else {
        Ok(raw)
    }
}

/// Physical value of a register: the raw integer multiplied by its scale.
///
/// No rounding happens here; precision is a presentation concern.
pub fn decode(words: &[u16], def: &Primitive) -> Result<f64, DecodeError> {
    Ok(decode_raw(words, def)? as f64 * def.scale)
}

/// Register word for a physical value: `round(value / scale)`.
///
/// The value is checked against the register's `min`/`max` before scaling.
/// Signed registers are written in two's complement.
pub fn encode(value: f64, def: &Primitive) -> Result<u16, EncodeError> {
    if !value.is_finite() {
        return Err(EncodeError::NotFinite(value));
    }
    if let Some(min) = def.min.filter(|min| value < *min) {
        return Err(EncodeError::BelowMinimum {
            key: def.key.clone(),
            value,
            min,
        });
    }
    if let Some(max) = def.max.filter(|max| value > *max) {
        return Err(EncodeError::AboveMaximum {
            key: def.key.clone(),
            value,
            max,
        });
    }
    let raw = (value / def.scale).round();
    let out_of_range = || EncodeError::OutOfRange {
        key: def.key.clone(),
        value,
    };
    if def.signed {
        if !(f64::from(i16::MIN)..=f64::from(i16::MAX)).contains(&raw) {
            return Err(out_of_range());
        }
        Ok(raw as i16 as u16)
    } else {
        if !(0.0..=f64::from(u16::MAX)).contains(&raw) {
            return Err(out_of_range());
        }
        Ok(raw as u16)
    }
}

/// Rounds `value` to `digits` decimal places.
pub fn round_to(value: f64, digits: u8) -> f64 {
    let factor = 10f64.powi(i32::from(digits));
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn def(length: u8, signed: bool, scale: f64) -> Primitive {
        let mut def = Primitive::new("test", 0);
        def.length = length;
        def.signed = signed;
        def.scale = scale;
        def
    }

    #[test]
    fn unsigned_16_bit() {
        let def = def(1, false, 1.0);
        for value in [0u16, 1, 219, 0x7FFF, 0x8000, 0xFFFF] {
            assert_eq!(decode(&[value], &def), Ok(f64::from(value)));
        }
    }

    #[test]
    fn signed_16_bit() {
        let def = def(1, true, 1.0);
        assert_eq!(decode(&[0xFFFF], &def), Ok(-1.0));
        assert_eq!(decode(&[0x8000], &def), Ok(-32768.0));
        assert_eq!(decode(&[0x7FFF], &def), Ok(32767.0));
        assert_eq!(decode(&[65424], &def), Ok(-112.0));
    }

    #[test]
    fn scaled() {
        assert_eq!(decode(&[531], &def(1, true, 0.1)), Ok(531.0 * 0.1));
        assert_eq!(decode(&[3], &def(1, false, 1000.0)), Ok(3000.0));
    }

    #[test]
    fn wide_registers() {
        assert_eq!(decode(&[0x0001, 0x0000], &def(2, false, 1.0)), Ok(65536.0));
        assert_eq!(decode(&[0xFFFF, 0xFFFF], &def(2, false, 1.0)), Ok(4294967295.0));
        assert_eq!(decode(&[0xFFFF, 0xFFFE], &def(2, true, 1.0)), Ok(-2.0));
        assert_eq!(decode(&[0x8000, 0x0000], &def(2, true, 1.0)), Ok(-2147483648.0));
    }

    #[test]
    fn length_mismatch() {
        assert_matches!(
            decode(&[1], &def(2, true, 1.0)),
            Err(DecodeError::LengthMismatch { expected: 2, actual: 1, .. })
        );
        assert_matches!(
            decode(&[1, 2], &def(1, true, 1.0)),
            Err(DecodeError::LengthMismatch { expected: 1, actual: 2, .. })
        );
    }

    #[test]
    fn encode_values() {
        assert_eq!(encode(53.1, &def(1, true, 0.1)), Ok(531));
        assert_eq!(encode(-3.0, &def(1, true, 1.0)), Ok(65533));
        assert_eq!(encode(65535.0, &def(1, false, 1.0)), Ok(65535));
        assert_eq!(encode(2.0, &def(1, false, 1.0)), Ok(2));

        assert_matches!(encode(-1.0, &def(1, false, 1.0)), Err(EncodeError::OutOfRange { .. }));
        assert_matches!(encode(32768.0, &def(1, true, 1.0)), Err(EncodeError::OutOfRange { .. }));
        assert_matches!(encode(f64::NAN, &def(1, true, 1.0)), Err(EncodeError::NotFinite(_)));
    }

    #[test]
    fn encode_bounds() {
        let mut def = def(1, true, 0.1);
        def.min = Some(200.0);
        def.max = Some(240.0);
        assert_eq!(encode(230.0, &def), Ok(2300));
        assert_matches!(encode(199.9, &def), Err(EncodeError::BelowMinimum { .. }));
        assert_matches!(encode(240.1, &def), Err(EncodeError::AboveMaximum { .. }));
    }

    #[test]
    fn rounding() {
        assert_eq!(round_to(1000.1000000001, 3), 1000.1);
        assert_eq!(round_to(2.345, 0), 2.0);
        assert_eq!(round_to(-1.26, 1), -1.3);
    }
}
