use rand::Rng;

use crate::error::ConfigError;

/// Weighted selection of the operator for the next step.
///
/// Operators are drawn with probability proportional to their weight by
/// locating a uniform variate in the cumulative weight sums.
#[derive(Debug, Clone)]
pub struct OperatorSchedule {
    names: Vec<String>,
    weights: Vec<f64>,
    cumulative: Vec<f64>,
}

impl OperatorSchedule {
    pub fn new(names: &[&str], weights: Vec<f64>) -> Result<Self, ConfigError> {
        if weights.is_empty() {
            return Err(ConfigError::NoOperators);
        }
        let names = (0..weights.len())
            .map(|i| names.get(i).copied().unwrap_or("unnamed").to_string())
            .collect::<Vec<_>>();
        for (name, &weight) in names.iter().zip(weights.iter()) {
            if !(weight >= 0.) || !weight.is_finite() {
                return Err(ConfigError::InvalidWeight {
                    operator: name.clone(),
                    weight,
                });
            }
        }
        let cumulative = cumulative_sums(&weights);
        let total = cumulative.last().copied().unwrap_or(0.);
        if !(total > 0.) {
            return Err(ConfigError::ZeroTotalWeight { total });
        }
        Ok(Self {
            names,
            weights,
            cumulative,
        })
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn total_weight(&self) -> f64 {
        self.cumulative.last().copied().unwrap_or(0.)
    }

    /// Change the weight of one operator. The total weight must stay positive.
    pub fn set_weight(&mut self, operator: usize, weight: f64) -> Result<(), ConfigError> {
        let len = self.weights.len();
        let mut weights = self.weights.clone();
        *weights.get_mut(operator).ok_or(ConfigError::UnknownOperator {
            index: operator,
            len,
        })? = weight;
        let names = self.names.iter().map(String::as_str).collect::<Vec<_>>();
        *self = Self::new(&names, weights)?;
        Ok(())
    }

    /// Draw the index of the next operator.
    pub fn select<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        let u = rng.random::<f64>() * self.total_weight();
        // Operators with zero weight have the same cumulative sum as their
        // predecessor and can never be the first entry above `u`.
        let idx = self.cumulative.partition_point(|&c| c <= u);
        idx.min(self.weights.len() - 1)
    }
}

fn cumulative_sums(weights: &[f64]) -> Vec<f64> {
    weights
        .iter()
        .scan(0f64, |acc, &w| {
            *acc += w;
            Some(*acc)
        })
        .collect()
}
