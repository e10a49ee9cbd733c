//! Build matrices and the axes they expand into.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::plan::PlanError;

/// One concrete assignment of matrix variables. The empty axis stands for
/// "no matrix" and is the single axis of every matrix-less plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Axis(BTreeMap<String, String>);

impl Axis {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn get(&self, var: &str) -> Option<&str> {
        self.0.get(var).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn with(&self, var: &str, value: &str) -> Self {
        let mut next = self.clone();
        next.0.insert(var.to_string(), value.to_string());
        next
    }

    /// True when every assignment in `filter` is also made by this axis.
    pub fn satisfies(&self, filter: &Axis) -> bool {
        filter.iter().all(|(k, v)| self.get(k) == Some(v))
    }

    /// Display label: `K=V` pairs joined by spaces, or `Build` when empty.
    pub fn label(&self) -> String {
        if self.is_empty() {
            return "Build".to_string();
        }
        self.to_string()
    }

    /// The assignments as `K=V` environment entries.
    pub fn env(&self) -> Vec<String> {
        self.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in self.iter() {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{k}={v}")?;
            first = false;
        }
        Ok(())
    }
}

/// Matrix variables mapped to their ordered candidate values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Matrix(BTreeMap<String, Vec<String>>);

impl Matrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds values for `var`, keeping first-seen order and skipping duplicates.
    /// A variable without values is ignored.
    pub fn insert<I, S>(&mut self, var: impl Into<String>, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        if values.is_empty() {
            return;
        }
        let entry = self.0.entry(var.into()).or_default();
        for value in values {
            if !entry.contains(&value) {
                entry.push(value);
            }
        }
    }

    pub fn merge(&mut self, other: &Matrix) {
        for (var, values) in &other.0 {
            self.insert(var.clone(), values.iter().cloned());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values(&self, var: &str) -> Option<&[String]> {
        self.0.get(var).map(Vec::as_slice)
    }

    /// Cartesian product over all variables. An empty matrix yields exactly
    /// one axis, the empty one.
    pub fn expand(&self) -> Vec<Axis> {
        let mut axes = vec![Axis::empty()];
        for (var, values) in &self.0 {
            axes = axes
                .iter()
                .flat_map(|axis| values.iter().map(move |value| axis.with(var, value)))
                .collect();
        }
        axes
    }

    /// Builds a matrix from a descriptor's `matrix` block. Every variable
    /// needs at least one value.
    pub(crate) fn from_descriptor(raw: BTreeMap<String, Vec<String>>) -> Result<Self, PlanError> {
        let mut matrix = Self::new();
        for (var, values) in raw {
            if values.is_empty() {
                return Err(PlanError::Invalid(format!(
                    "matrix variable {var} has no values"
                )));
            }
            matrix.insert(var, values);
        }
        Ok(matrix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_matrix_expands_to_single_empty_axis() {
        let axes = Matrix::new().expand();
        assert_eq!(axes, vec![Axis::empty()]);
        assert_eq!(axes[0].label(), "Build");
    }

    #[test]
    fn expansion_is_cartesian_product() {
        let mut matrix = Matrix::new();
        matrix.insert("GO_VERSION", ["1.20", "1.21", "1.22"]);
        matrix.insert("DB", ["pg", "mysql"]);
        matrix.insert("OS", ["linux"]);

        let axes = matrix.expand();
        assert_eq!(axes.len(), 3 * 2 * 1);
        for axis in &axes {
            assert_eq!(axis.len(), 3);
        }
        let unique: std::collections::HashSet<_> = axes.iter().collect();
        assert_eq!(unique.len(), axes.len());
    }

    #[test]
    fn merge_keeps_order_and_drops_duplicates() {
        let mut a = Matrix::new();
        a.insert("V", ["1", "2"]);
        let mut b = Matrix::new();
        b.insert("V", ["2", "3"]);
        b.insert("W", ["x"]);

        a.merge(&b);
        assert_eq!(a.values("V").unwrap(), ["1", "2", "3"]);
        assert_eq!(a.values("W").unwrap(), ["x"]);
    }

    #[test]
    fn variables_without_values_are_ignored() {
        let mut matrix = Matrix::new();
        matrix.insert("EMPTY", Vec::<String>::new());
        assert!(matrix.is_empty());
    }

    #[test]
    fn axis_label_and_env() {
        let axis = Axis::from_pairs([("GO_VERSION", "1.21"), ("DB", "pg")]);
        assert_eq!(axis.label(), "DB=pg GO_VERSION=1.21");
        assert_eq!(axis.env(), vec!["DB=pg", "GO_VERSION=1.21"]);
    }

    #[test]
    fn axis_satisfies_subset_filter() {
        let axis = Axis::from_pairs([("A", "1"), ("B", "2")]);
        assert!(axis.satisfies(&Axis::from_pairs([("A", "1")])));
        assert!(axis.satisfies(&Axis::empty()));
        assert!(!axis.satisfies(&Axis::from_pairs([("A", "2")])));
        assert!(!axis.satisfies(&Axis::from_pairs([("C", "1")])));
    }

    #[test]
    fn descriptor_values_keep_their_order() {
        let raw = BTreeMap::from([(
            "PY".to_string(),
            vec!["3.10".to_string(), "3.9".to_string(), "3.10".to_string()],
        )]);
        let matrix = Matrix::from_descriptor(raw).unwrap();
        assert_eq!(matrix.values("PY").unwrap(), ["3.10", "3.9"]);
    }

    #[test]
    fn descriptor_variable_without_values_is_rejected() {
        let raw = BTreeMap::from([("GO".to_string(), Vec::new())]);
        assert!(matches!(
            Matrix::from_descriptor(raw),
            Err(PlanError::Invalid(_))
        ));
    }
}
