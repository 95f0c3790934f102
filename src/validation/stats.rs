// =============================================================================
// Two-sample comparison (Welch) and the promote / rollback / hold rule
// =============================================================================

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SampleStats {
    pub n: usize,
    pub mean: f64,
    /// Unbiased sample variance; 0 below two samples.
    pub variance: f64,
}

impl SampleStats {
    pub fn from_values(values: &[f64]) -> Self {
        let n = values.len();
        if n == 0 {
            return Self::default();
        }
        let mean = values.iter().sum::<f64>() / n as f64;
        let variance = if n > 1 {
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64
        } else {
            0.0
        };
        Self { n, mean, variance }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Comparison {
    pub baseline: SampleStats,
    pub candidate: SampleStats,
    /// `candidate.mean − baseline.mean`.
    pub diff: f64,
    /// Welch standard error of `diff`.
    pub stderr: f64,
}

pub fn welch(baseline: &[f64], candidate: &[f64]) -> Comparison {
    let b = SampleStats::from_values(baseline);
    let c = SampleStats::from_values(candidate);
    let mut se2 = 0.0;
    if b.n > 0 {
        se2 += b.variance / b.n as f64;
    }
    if c.n > 0 {
        se2 += c.variance / c.n as f64;
    }
    Comparison {
        baseline: b,
        candidate: c,
        diff: c.mean - b.mean,
        stderr: se2.sqrt(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Promote,
    Rollback,
    Hold,
}

/// Non-inferiority test with margin.
///
/// Upper bound below `-margin` means the candidate is worse by more than the
/// margin.  Lower bound at or above `-margin` means it is no worse.
pub fn decide(cmp: &Comparison, z: f64, margin: f64) -> Verdict {
    let spread = z * cmp.stderr;
    if cmp.diff + spread < -margin {
        Verdict::Rollback
    } else if cmp.diff - spread >= -margin {
        Verdict::Promote
    } else {
        Verdict::Hold
    }
}
