//! Huber robust kernel on the whitened squared error (chi²).

/// IRLS weight: 1 inside the inlier band, `delta / sqrt(chi2)` outside.
#[inline]
pub fn huber_weight(chi2: f64, delta: f64) -> f64 {
    let e = chi2.sqrt();
    if e <= delta {
        1.0
    } else {
        delta / e
    }
}

/// Robust cost matching [`huber_weight`].
#[inline]
pub fn huber_cost(chi2: f64, delta: f64) -> f64 {
    let e = chi2.sqrt();
    if e <= delta {
        chi2
    } else {
        2.0 * delta * e - delta * delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_huber_continuous_at_delta() {
        let delta = 5.991_f64.sqrt();
        let chi2 = delta * delta;
        assert_relative_eq!(huber_cost(chi2 - 1e-9, delta), huber_cost(chi2 + 1e-9, delta), epsilon = 1e-6);
        assert_relative_eq!(huber_weight(chi2, delta), 1.0);
    }

    #[test]
    fn test_huber_downweights_outliers() {
        assert_relative_eq!(huber_weight(100.0, 2.0), 0.2);
        assert!(huber_cost(100.0, 2.0) < 100.0);
        assert_relative_eq!(huber_cost(1.0, 2.0), 1.0);
    }
}
