use crate::domain::errors::StoreError;
use crate::domain::ports::{ParamValue, ParameterStore};
use std::collections::HashMap;

/// Resolved parameter snapshot for one (strategy, user) pair.
///
/// Strategies read every threshold, period and multiplier through this view;
/// the hard-coded default passed at each call site is the bottom of the
/// resolution order (user override, then global, then default).
#[derive(Debug, Clone, Default)]
pub struct StrategyParams {
    values: HashMap<String, ParamValue>,
}

impl StrategyParams {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_values(values: HashMap<String, ParamValue>) -> Self {
        Self { values }
    }

    pub async fn resolve(
        store: &dyn ParameterStore,
        strategy: &str,
        user_id: Option<i64>,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            values: store.resolve(strategy, user_id).await?,
        })
    }

    pub fn int(&self, key: &str, default: i64) -> i64 {
        match self.values.get(key) {
            Some(ParamValue::Int(v)) => *v,
            Some(ParamValue::Float(v)) => *v as i64,
            _ => default,
        }
    }

    pub fn period(&self, key: &str, default: usize) -> usize {
        let v = self.int(key, default as i64);
        if v > 0 { v as usize } else { default }
    }

    pub fn float(&self, key: &str, default: f64) -> f64 {
        match self.values.get(key) {
            Some(ParamValue::Float(v)) => *v,
            Some(ParamValue::Int(v)) => *v as f64,
            _ => default,
        }
    }

    pub fn flag(&self, key: &str, default: bool) -> bool {
        match self.values.get(key) {
            Some(ParamValue::Flag(v)) => *v,
            _ => default,
        }
    }

    pub fn text<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        match self.values.get(key) {
            Some(ParamValue::Text(v)) => v.as_str(),
            _ => default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply_when_absent() {
        let params = StrategyParams::empty();
        assert_eq!(params.int("period", 14), 14);
        assert_eq!(params.float("oversold", 30.0), 30.0);
        assert!(params.flag("enabled", true));
        assert_eq!(params.text("mode", "fast"), "fast");
    }

    #[test]
    fn test_values_override_defaults() {
        let mut values = HashMap::new();
        values.insert("period".to_string(), ParamValue::Int(21));
        values.insert("oversold".to_string(), ParamValue::Float(25.5));
        let params = StrategyParams::from_values(values);
        assert_eq!(params.period("period", 14), 21);
        assert_eq!(params.float("oversold", 30.0), 25.5);
    }

    #[test]
    fn test_numeric_coercion() {
        let mut values = HashMap::new();
        values.insert("period".to_string(), ParamValue::Float(20.0));
        values.insert("threshold".to_string(), ParamValue::Int(3));
        let params = StrategyParams::from_values(values);
        assert_eq!(params.int("period", 14), 20);
        assert_eq!(params.float("threshold", 1.0), 3.0);
    }

    #[test]
    fn test_non_positive_period_falls_back() {
        let mut values = HashMap::new();
        values.insert("period".to_string(), ParamValue::Int(0));
        let params = StrategyParams::from_values(values);
        assert_eq!(params.period("period", 14), 14);
    }
}
