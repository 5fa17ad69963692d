//! Distance metrics for the brute-force scan.
//!
//! The metric set is closed and small, so it is expressed as a plain enum
//! dispatching to pure functions over `&[f32]` slices. The iterator-based
//! kernels auto-vectorize when compiled with `-C target-cpu=native`.

use thiserror::Error;

/// Added to the denominator inside the KL term to avoid division by zero.
const JS_EPSILON: f32 = 1e-8;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceError {
    #[error("dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
}

/// Distance metric tag, selectable per query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    Euclidean,
    Manhattan,
    Cosine,
    JensenShannon,
}

impl Metric {
    /// Parse a metric tag, case-insensitively.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let lower = tag.to_ascii_lowercase();
        match lower.as_str() {
            "euclidean" => Some(Self::Euclidean),
            "manhattan" => Some(Self::Manhattan),
            "cosine" => Some(Self::Cosine),
            "jensenshannon" => Some(Self::JensenShannon),
            _ => None,
        }
    }

    /// Canonical lowercase tag for this metric.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Euclidean => "euclidean",
            Self::Manhattan => "manhattan",
            Self::Cosine => "cosine",
            Self::JensenShannon => "jensenshannon",
        }
    }

    /// Compute the distance between two equal-length vectors.
    ///
    /// Cosine with a zero-magnitude operand produces NaN; callers that may
    /// hold zero vectors must guard for it.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> Result<f32, DistanceError> {
        if a.len() != b.len() {
            return Err(DistanceError::DimensionMismatch {
                left: a.len(),
                right: b.len(),
            });
        }
        Ok(match self {
            Self::Euclidean => euclidean(a, b),
            Self::Manhattan => manhattan(a, b),
            Self::Cosine => cosine(a, b),
            Self::JensenShannon => jensen_shannon(a, b),
        })
    }

    /// Compute the distance unless it exceeds `cutoff`.
    ///
    /// Only Euclidean can abandon the scan early (its running squared sum is
    /// monotone); every other metric computes the full distance and returns
    /// it regardless of the cutoff. An optimization hook, not used by the
    /// default query path.
    pub fn distance_within(
        &self,
        a: &[f32],
        b: &[f32],
        cutoff: f32,
    ) -> Result<Option<f32>, DistanceError> {
        if a.len() != b.len() {
            return Err(DistanceError::DimensionMismatch {
                left: a.len(),
                right: b.len(),
            });
        }
        Ok(match self {
            Self::Euclidean => euclidean_within(a, b, cutoff),
            Self::Manhattan => Some(manhattan(a, b)),
            Self::Cosine => Some(cosine(a, b)),
            Self::JensenShannon => Some(jensen_shannon(a, b)),
        })
    }
}

/// `sqrt(Σ(a-b)²)`
#[inline(always)]
fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Euclidean distance with early exit once the running squared sum passes
/// `cutoff²`.
#[inline]
fn euclidean_within(a: &[f32], b: &[f32], cutoff: f32) -> Option<f32> {
    let limit = cutoff * cutoff;
    let mut acc = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        let d = x - y;
        acc += d * d;
        if acc > limit {
            return None;
        }
    }
    Some(acc.sqrt())
}

/// `Σ|a-b|`
#[inline(always)]
fn manhattan(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum()
}

/// `(1 - cos θ) * 0.5`, mapping similarity [-1, 1] onto distance [0, 1]:
/// identical direction → 0, opposite direction → 1.
#[inline]
fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let similarity = dot / (norm_a.sqrt() * norm_b.sqrt());
    (1.0 - similarity) * 0.5
}

/// Jensen-Shannon divergence over probability-like vectors.
///
/// `0.5·KL(p, m) + 0.5·KL(q, m)` with `m = (p+q)/2`. Inputs are not
/// normalized here; callers wanting true JS divergence semantics must pass
/// already-normalized distributions. Zero-valued terms contribute nothing
/// (the limit of `x·ln x` at zero).
#[inline]
fn jensen_shannon(a: &[f32], b: &[f32]) -> f32 {
    let mut kl_a = 0.0f32;
    let mut kl_b = 0.0f32;
    for (&p, &q) in a.iter().zip(b) {
        let m = 0.5 * (p + q);
        if p > 0.0 {
            kl_a += p * (p / (m + JS_EPSILON)).ln();
        }
        if q > 0.0 {
            kl_b += q * (q / (m + JS_EPSILON)).ln();
        }
    }
    0.5 * kl_a + 0.5 * kl_b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_three_four_five() {
        let d = Metric::Euclidean.distance(&[0.0, 0.0], &[3.0, 4.0]).unwrap();
        assert!((d - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_manhattan_three_four() {
        let d = Metric::Manhattan.distance(&[0.0, 0.0], &[3.0, 4.0]).unwrap();
        assert!((d - 7.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_self_is_zero() {
        let v = [0.3, -1.2, 4.5, 0.01];
        let d = Metric::Cosine.distance(&v, &v).unwrap();
        assert!(d.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite_is_one() {
        let a = [1.0, 2.0, 3.0];
        let b = [-1.0, -2.0, -3.0];
        let d = Metric::Cosine.distance(&a, &b).unwrap();
        assert!((d - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_zero_vector_is_nan() {
        let d = Metric::Cosine.distance(&[0.0, 0.0], &[1.0, 2.0]).unwrap();
        assert!(d.is_nan());
    }

    #[test]
    fn test_jensen_shannon_self_is_zero() {
        let p = [0.25, 0.25, 0.5];
        let d = Metric::JensenShannon.distance(&p, &p).unwrap();
        assert!(d.abs() < 1e-5);
    }

    #[test]
    fn test_jensen_shannon_asymmetric_mass() {
        // Disjoint support has maximal divergence, well above zero.
        let p = [1.0, 0.0];
        let q = [0.0, 1.0];
        let d = Metric::JensenShannon.distance(&p, &q).unwrap();
        assert!(d > 0.5);
        assert!(d.is_finite());
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        for metric in [
            Metric::Euclidean,
            Metric::Manhattan,
            Metric::Cosine,
            Metric::JensenShannon,
        ] {
            let err = metric.distance(&[1.0, 2.0], &[1.0]).unwrap_err();
            assert_eq!(err, DistanceError::DimensionMismatch { left: 2, right: 1 });
        }
    }

    #[test]
    fn test_euclidean_cutoff_exceeded() {
        let a = [0.0, 0.0];
        let b = [3.0, 4.0];
        assert_eq!(Metric::Euclidean.distance_within(&a, &b, 2.0).unwrap(), None);

        let within = Metric::Euclidean.distance_within(&a, &b, 6.0).unwrap();
        assert!((within.unwrap() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_manhattan_cutoff_ignores_bound() {
        // Manhattan has no early-exit variant; the full distance comes back
        // even when it exceeds the cutoff.
        let d = Metric::Manhattan
            .distance_within(&[0.0, 0.0], &[3.0, 4.0], 1.0)
            .unwrap();
        assert!((d.unwrap() - 7.0).abs() < 1e-6);
    }

    #[test]
    fn test_tag_parsing_case_insensitive() {
        assert_eq!(Metric::from_tag("euclidean"), Some(Metric::Euclidean));
        assert_eq!(Metric::from_tag("EUCLIDEAN"), Some(Metric::Euclidean));
        assert_eq!(Metric::from_tag("Cosine"), Some(Metric::Cosine));
        assert_eq!(Metric::from_tag("manhattan"), Some(Metric::Manhattan));
        assert_eq!(Metric::from_tag("JensenShannon"), Some(Metric::JensenShannon));
        assert_eq!(Metric::from_tag("hamming"), None);
    }

    #[test]
    fn test_tag_round_trip() {
        for metric in [
            Metric::Euclidean,
            Metric::Manhattan,
            Metric::Cosine,
            Metric::JensenShannon,
        ] {
            assert_eq!(Metric::from_tag(metric.tag()), Some(metric));
        }
    }
}
