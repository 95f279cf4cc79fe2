//! Small numeric helpers shared by feature extraction and training

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample variance (n - 1 denominator); zero for fewer than two values
pub fn variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let sum_sq: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    sum_sq / (values.len() - 1) as f64
}

/// Population standard deviation
pub fn population_std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Ordinary least squares fit of `y = intercept + slope * x`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub intercept: f64,
    pub slope: f64,
    /// Standard error of the residuals (n - 2 denominator)
    pub residual_std: f64,
    pub points: usize,
    pub x_mean: f64,
    /// Sum of squared deviations of x from its mean
    pub sxx: f64,
}

impl LinearFit {
    pub fn at(&self, x: f64) -> f64 {
        self.intercept + self.slope * x
    }
}

/// Fit a line through `(x, y)` pairs; `None` when fewer than two points
pub fn fit_line(points: &[(f64, f64)]) -> Option<LinearFit> {
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let x_mean = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let y_mean = points.iter().map(|(_, y)| y).sum::<f64>() / n;
    let sxx: f64 = points.iter().map(|(x, _)| (x - x_mean).powi(2)).sum();
    let sxy: f64 = points
        .iter()
        .map(|(x, y)| (x - x_mean) * (y - y_mean))
        .sum();

    let slope = if sxx.abs() < f64::EPSILON { 0.0 } else { sxy / sxx };
    let intercept = y_mean - slope * x_mean;

    let residual_std = if points.len() > 2 {
        let sse: f64 = points
            .iter()
            .map(|(x, y)| (y - (intercept + slope * x)).powi(2))
            .sum();
        (sse / (n - 2.0)).sqrt()
    } else {
        0.0
    };

    Some(LinearFit {
        intercept,
        slope,
        residual_std,
        points: points.len(),
        x_mean,
        sxx,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variance_calculation() {
        let values = vec![2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((variance(&values) - 4.571).abs() < 0.01);
        assert!((population_std_dev(&values) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_fit_line_exact() {
        let points: Vec<(f64, f64)> = (0..10).map(|i| (i as f64, 3.0 + 0.5 * i as f64)).collect();
        let fit = fit_line(&points).unwrap();
        assert!((fit.slope - 0.5).abs() < 1e-9);
        assert!((fit.intercept - 3.0).abs() < 1e-9);
        assert!(fit.residual_std < 1e-9);
        assert!((fit.at(20.0) - 13.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_values() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(variance(&[]), 0.0);
        assert!(fit_line(&[(1.0, 1.0)]).is_none());
    }
}
