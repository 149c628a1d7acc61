//! Bias-corrected cardinality estimation over a register vector.

use crate::constants::{BIAS_DATA, RAW_ESTIMATE_DATA, THRESHOLD_DATA};
use crate::{Error, Result, MAX_PRECISION, MIN_PRECISION};

/// Estimates the number of distinct elements from effective register values.
///
/// Raw estimate with the standard alpha constant, bias-corrected below `5m`
/// by interpolating the empirical tables, falling back to linear counting
/// while enough registers are still zero.
pub fn cardinality(precision: u8, registers: impl Iterator<Item = u64>) -> f64 {
    let m = (1u64 << precision) as f64;
    let mut inv_sum = 0.0;
    let mut zeros = 0u64;
    for r in registers {
        inv_sum += (-(r as f64)).exp2();
        if r == 0 {
            zeros += 1;
        }
    }

    let mut raw = alpha(precision) * m * m / inv_sum;
    if raw <= 5.0 * m {
        raw -= bias(precision, raw);
    }

    let alt = if zeros > 0 {
        m * (m / zeros as f64).ln()
    } else {
        raw
    };

    if alt <= THRESHOLD_DATA[(precision - MIN_PRECISION) as usize] {
        alt
    } else {
        raw
    }
}

pub fn alpha(precision: u8) -> f64 {
    match precision {
        4 => 0.673,
        5 => 0.697,
        6 => 0.709,
        _ => {
            let m = (1u64 << precision) as f64;
            0.7213 / (1.0 + 1.079 / m)
        }
    }
}

/// Interpolated empirical bias of the raw estimate, clamped at the table
/// ends.
fn bias(precision: u8, raw: f64) -> f64 {
    let row = (precision - MIN_PRECISION) as usize;
    let knots = RAW_ESTIMATE_DATA[row];
    let biases = BIAS_DATA[row];
    match knots.binary_search_by(|k| k.total_cmp(&raw)) {
        Ok(i) => biases[i],
        Err(0) => biases[0],
        Err(i) if i == knots.len() => biases[knots.len() - 1],
        Err(i) => {
            let t = (raw - knots[i - 1]) / (knots[i] - knots[i - 1]);
            biases[i - 1] + t * (biases[i] - biases[i - 1])
        }
    }
}

/// Expected relative error for a precision.
pub fn error_for_precision(precision: u8) -> Result<f64> {
    if !(MIN_PRECISION..=MAX_PRECISION).contains(&precision) {
        return Err(Error::PrecisionOutOfRange);
    }
    Ok(1.04 / ((1u64 << precision) as f64).sqrt())
}

/// Smallest in-range precision whose expected error is at or below the
/// target.
pub fn precision_for_error(eps: f64) -> Result<u8> {
    if !(eps > 0.0 && eps < 1.0) {
        return Err(Error::ErrorRateOutOfRange);
    }
    for precision in MIN_PRECISION..=MAX_PRECISION {
        if error_for_precision(precision)? <= eps {
            return Ok(precision);
        }
    }
    Err(Error::ErrorRateOutOfRange)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registers_estimate_zero() {
        let est = cardinality(12, std::iter::repeat(0).take(1 << 12));
        assert_eq!(est, 0.0);
    }

    #[test]
    fn linear_counting_at_low_cardinality() {
        // three registers set to 1: m * ln(m / (m - 3))
        let m = 1u64 << 12;
        let regs = std::iter::repeat(1).take(3).chain(std::iter::repeat(0).take(m as usize - 3));
        let est = cardinality(12, regs);
        assert!((est - 3.0).abs() < 0.01, "estimate {est}");
    }

    #[test]
    fn saturated_registers_use_raw_estimate() {
        // all registers at 10: no zeros, far above threshold
        let m = (1u64 << 12) as f64;
        let est = cardinality(12, std::iter::repeat(10).take(1 << 12));
        let expected = alpha(12) * m * m / (m * (0.5f64).powi(10));
        assert!((est - expected).abs() / expected < 1e-9);
    }

    #[test]
    fn alpha_matches_published_constants() {
        assert_eq!(alpha(4), 0.673);
        assert_eq!(alpha(5), 0.697);
        assert_eq!(alpha(6), 0.709);
        assert!((alpha(14) - 0.72125).abs() < 1e-4);
    }

    #[test]
    fn precision_error_reconciliation() {
        assert!(error_for_precision(3).is_err());
        assert!(error_for_precision(19).is_err());
        for p in MIN_PRECISION..=MAX_PRECISION {
            let eps = error_for_precision(p).unwrap();
            assert_eq!(precision_for_error(eps).unwrap(), p);
        }
        assert!(precision_for_error(0.0).is_err());
        assert!(precision_for_error(1.0).is_err());
        // tighter than p=18 can deliver
        assert!(precision_for_error(0.0001).is_err());
    }
}
