//! Mann-Whitney U rank-sum test
//!
//! Uses the normal approximation with tie and continuity corrections. That
//! is accurate enough for the sample sizes a query window returns and needs
//! no tables.

use pipecd_common::{Error, Result};

/// Significance level below which two samples are considered different
pub const ALPHA: f64 = 0.05;

/// Alternative hypothesis about the location of `x` relative to `y`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Location {
    Differs,
    Greater,
    Less,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TestResult {
    /// U statistic of `x`
    pub u: f64,
    pub p: f64,
}

/// Test whether `x` is located `alt` relative to `y`
///
/// Returns `Ok(None)` when every value of both samples is the same, where
/// the test is undefined and the samples are trivially alike.
pub fn test(x: &[f64], y: &[f64], alt: Location) -> Result<Option<TestResult>> {
    if x.is_empty() || y.is_empty() {
        return Err(Error::invalid_argument("both samples need at least one value"));
    }
    if x.iter().chain(y).any(|v| v.is_nan()) {
        return Err(Error::invalid_argument("samples contain NaN"));
    }

    let n1 = x.len() as f64;
    let n2 = y.len() as f64;
    let n = n1 + n2;

    let mut all: Vec<(f64, bool)> = x.iter().map(|&v| (v, true)).chain(y.iter().map(|&v| (v, false))).collect();
    all.sort_by(|a, b| a.0.total_cmp(&b.0));

    // Average ranks over ties; accumulate the tie correction term.
    let mut rank_sum_x = 0.0;
    let mut ties = 0.0;
    let mut i = 0;
    while i < all.len() {
        let mut j = i;
        while j + 1 < all.len() && all[j + 1].0 == all[i].0 {
            j += 1;
        }
        let count = (j - i + 1) as f64;
        let rank = (i + j) as f64 / 2.0 + 1.0;
        rank_sum_x += all[i..=j].iter().filter(|(_, from_x)| *from_x).count() as f64 * rank;
        ties += count * count * count - count;
        i = j + 1;
    }

    let u = rank_sum_x - n1 * (n1 + 1.0) / 2.0;
    let mean = n1 * n2 / 2.0;
    let variance = n1 * n2 / 12.0 * ((n + 1.0) - ties / (n * (n - 1.0)));
    if variance <= 0.0 {
        return Ok(None);
    }
    let sigma = variance.sqrt();

    let p = match alt {
        Location::Greater => upper_tail((u - mean - 0.5) / sigma),
        Location::Less => upper_tail((mean - u - 0.5) / sigma),
        Location::Differs => (2.0 * upper_tail(((u - mean).abs() - 0.5) / sigma)).min(1.0),
    };
    Ok(Some(TestResult { u, p }))
}

/// Whether `experiment` is statistically indistinguishable from `control`
/// in the direction given by `alt`
pub fn accept(experiment: &[f64], control: &[f64], alt: Location) -> Result<bool> {
    Ok(test(experiment, control, alt)?.is_none_or(|r| r.p > ALPHA))
}

/// P(Z >= z) for a standard normal Z
fn upper_tail(z: f64) -> f64 {
    0.5 * erfc(z / std::f64::consts::SQRT_2)
}

/// Complementary error function, fractional error below 1.2e-7
fn erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let poly = -z * z - 1.265_512_23
        + t * (1.000_023_68
            + t * (0.374_091_96
                + t * (0.096_784_18
                    + t * (-0.186_288_06
                        + t * (0.278_868_07
                            + t * (-1.135_203_98 + t * (1.488_515_87 + t * (-0.822_152_23 + t * 0.170_872_77))))))));
    let r = t * poly.exp();
    if x >= 0.0 { r } else { 2.0 - r }
}
