//! Canonical rounding of raw cycle estimates.
//!
//! Raw minima land near, but rarely exactly on, the fractions real
//! pipelines produce (quarters, thirds, halves). The rounding ladder
//! snaps the fractional part to the nearest canonical value; above 50
//! cycles fractions carry no information and the value snaps to a whole
//! number.

/// Rounds a non-negative cycle estimate to a canonical value.
pub fn round_cycles(x: f64) -> f64 {
    let n = x.floor();
    let f = x - n;

    let f = if n >= 50.0 {
        if f > 0.12 {
            1.0
        } else {
            0.0
        }
    } else if f <= 0.12 {
        0.0
    } else if f <= 0.22 {
        // A fifth of a cycle only shows up below ~2 cycles; elsewhere
        // it is measurement fuzz.
        if n > 1.0 {
            0.0
        } else {
            0.20
        }
    } else if f <= 0.28 {
        0.25
    } else if f <= 0.38 {
        0.33
    } else if f <= 0.57 {
        0.50
    } else if f <= 0.70 {
        0.66
    } else {
        1.0
    };

    n + f
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_rounds(input: f64, expected: f64) {
        let got = round_cycles(input);
        assert!(
            (got - expected).abs() < 1e-9,
            "round({input}) = {got}, expected {expected}"
        );
    }

    #[test]
    fn canonical_fractions() {
        assert_rounds(0.10, 0.00);
        assert_rounds(0.20, 0.20);
        assert_rounds(1.20, 1.20);
        assert_rounds(0.25, 0.25);
        assert_rounds(0.33, 0.33);
        assert_rounds(0.50, 0.50);
        assert_rounds(0.66, 0.66);
        assert_rounds(0.80, 1.00);
    }

    #[test]
    fn fifth_of_a_cycle_only_below_two_cycles() {
        assert_rounds(2.20, 2.00);
        assert_rounds(3.18, 3.00);
        assert_rounds(1.18, 1.20);
    }

    #[test]
    fn large_values_round_to_whole_cycles() {
        assert_rounds(49.60, 49.66);
        assert_rounds(50.10, 50.00);
        assert_rounds(50.20, 51.00);
        assert_rounds(120.45, 121.00);
    }

    #[test]
    fn monotone_below_fifty() {
        let mut prev = round_cycles(0.0);
        let mut x = 0.0f64;
        while x <= 50.0 {
            let r = round_cycles(x);
            assert!(
                r + 1e-9 >= prev,
                "rounding not monotone at {x}: {r} < {prev}"
            );
            prev = r;
            x += 0.005;
        }
    }

    #[test]
    fn idempotent() {
        let mut x = 0.0f64;
        while x <= 60.0 {
            let once = round_cycles(x);
            let twice = round_cycles(once);
            assert!(
                (once - twice).abs() < 1e-9,
                "rounding not idempotent at {x}: {once} vs {twice}"
            );
            x += 0.01;
        }
    }

    #[test]
    fn zero_stays_zero() {
        assert_rounds(0.0, 0.0);
    }
}
