use error::*;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A Kubernetes resource quantity that could not be understood. These come out
/// of node or pod objects written by OTHER controllers, so while the executor
/// should never produce one, it must tolerate receiving one.
#[derive(Error, ExecError, Kind, Retryable, Debug)]
#[retry(Retry::Fatal)]
#[error("Could not parse '{text}' as a Kubernetes resource quantity")]
pub struct QuantityParseError {
    text: String,
}

/// Parses the serialized form of a Kubernetes resource quantity into a plain
/// f64 of base units (cores for cpu, bytes for memory).
///
/// Kubernetes quantities are `<number><suffix>` where suffix is one of the
/// binary SI suffixes (Ki, Mi, ... Ei), the decimal SI suffixes (n, u, m, k,
/// M, ... E), or a decimal exponent (`e2` / `E2`). The gotcha is that a bare
/// `E` is exa while `E2` is an exponent; the grammar is unambiguous because
/// exa is only exa when nothing follows it.
pub fn parse(quantity: &Quantity) -> Result<f64, QuantityParseError> {
    let text = quantity.0.trim();
    let err = || QuantityParseError {
        text: text.to_string(),
    };
    if text.is_empty() {
        return Err(err());
    }
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
        .unwrap_or_else(|| text.len());
    let (number, suffix) = text.split_at(split);
    let number: f64 = number.parse().map_err(|_| err())?;
    let multiplier: f64 = match suffix {
        "" => 1.0,
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        exponent if exponent.starts_with('e') || exponent.starts_with('E') => {
            let exp: i32 = exponent[1..].parse().map_err(|_| err())?;
            10f64.powi(exp)
        }
        _ => return Err(err()),
    };
    Ok(number * multiplier)
}

/// A bag of named resources in base units, the currency of every capacity
/// computation in the executor: node allocatable, pod requests, spare capacity
/// offered on lease requests, and per-queue usage reports all flow through
/// this type.
///
/// Arithmetic is per-dimension. Subtraction may legitimately go negative (an
/// overcommitted cluster has negative spare capacity) and callers test for
/// that with [any_non_positive](ComputeResources::any_non_positive).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputeResources(BTreeMap<String, f64>);

impl ComputeResources {
    pub fn new() -> ComputeResources {
        ComputeResources(BTreeMap::new())
    }

    /// Folds a Kubernetes quantity map (the shape of `allocatable` on a node
    /// status or `requests` on a container) into this bag. Unparseable
    /// quantities are skipped; a foreign controller's garbage should not zero
    /// out an entire capacity report.
    pub fn add_quantities(&mut self, quantities: &BTreeMap<String, Quantity>) {
        for (resource, quantity) in quantities {
            match parse(quantity) {
                Ok(value) => *self.0.entry(resource.clone()).or_insert(0.0) += value,
                Err(err) => log::debug!("Skipping a malformed quantity: {}", err),
            }
        }
    }

    pub fn insert<R: AsRef<str>>(&mut self, resource: R, value: f64) {
        self.0.insert(resource.as_ref().to_string(), value);
    }

    pub fn get(&self, resource: &str) -> f64 {
        self.0.get(resource).copied().unwrap_or(0.0)
    }

    pub fn add(&mut self, other: &ComputeResources) {
        for (resource, value) in &other.0 {
            *self.0.entry(resource.clone()).or_insert(0.0) += value;
        }
    }

    /// Subtracts per dimension. Dimensions that exist only in `other` are
    /// created here as negatives so that overcommitment is visible rather than
    /// silently clamped.
    pub fn sub(&mut self, other: &ComputeResources) {
        for (resource, value) in &other.0 {
            *self.0.entry(resource.clone()).or_insert(0.0) -= value;
        }
    }

    /// Keeps the per-dimension maximum. Used when tracking peak usage samples.
    pub fn max(&mut self, other: &ComputeResources) {
        for (resource, value) in &other.0 {
            let entry = self.0.entry(resource.clone()).or_insert(0.0);
            if *value > *entry {
                *entry = *value;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when ANY dimension is zero or below. An executor with no spare cpu
    /// cannot accept new work no matter how much spare memory it has.
    pub fn any_non_positive(&self) -> bool {
        self.0.values().any(|value| *value <= 0.0)
    }

    /// True when this bag satisfies `minimum` in every dimension the minimum
    /// names.
    pub fn covers(&self, minimum: &ComputeResources) -> bool {
        minimum
            .0
            .iter()
            .all(|(resource, value)| self.get(resource) >= *value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }
}

impl fmt::Display for ComputeResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(resource, value)| format!("{}={}", resource, value))
            .collect();
        f.write_str(&parts.join(", "))
    }
}

/// Parses an operator supplied resource list of the form `cpu=2,memory=4Gi`.
/// This is the shape of the minimum job size configuration option.
pub fn parse_resource_list(text: &str) -> Result<ComputeResources, QuantityParseError> {
    let mut resources = ComputeResources::new();
    for entry in text.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (resource, quantity) = match entry.split_once('=') {
            Some(pair) => pair,
            None => {
                return Err(QuantityParseError {
                    text: entry.to_string(),
                })
            }
        };
        let value = parse(&Quantity(quantity.trim().to_string()))?;
        resources.insert(resource.trim(), value);
    }
    Ok(resources)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(text: &str) -> Quantity {
        Quantity(text.to_string())
    }

    #[test]
    fn plain_and_milli_cpu() {
        assert_eq!(2.0, parse(&q("2")).unwrap());
        assert_eq!(0.5, parse(&q("500m")).unwrap());
        assert_eq!(1.5, parse(&q("1.5")).unwrap());
    }

    #[test]
    fn binary_and_decimal_memory() {
        assert_eq!(1024.0, parse(&q("1Ki")).unwrap());
        assert_eq!(1024.0 * 1024.0 * 1024.0, parse(&q("1Gi")).unwrap());
        assert_eq!(1e9, parse(&q("1G")).unwrap());
        assert_eq!(128974848.0, parse(&q("123Mi")).unwrap());
    }

    #[test]
    fn exponents_and_exa() {
        assert_eq!(500.0, parse(&q("5e2")).unwrap());
        assert_eq!(500.0, parse(&q("5E2")).unwrap());
        assert_eq!(5e18, parse(&q("5E")).unwrap());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse(&q("")).is_err());
        assert!(parse(&q("five")).is_err());
        assert!(parse(&q("1Zi")).is_err());
    }

    #[test]
    fn spare_capacity_arithmetic() {
        let mut allocatable = ComputeResources::new();
        allocatable.insert("cpu", 8.0);
        allocatable.insert("memory", 32e9);

        let mut used = ComputeResources::new();
        used.insert("cpu", 8.5);
        used.insert("memory", 1e9);

        let mut spare = allocatable.clone();
        spare.sub(&used);
        assert!(spare.any_non_positive());
        assert_eq!(-0.5, spare.get("cpu"));

        let mut spare = allocatable;
        let mut modest = ComputeResources::new();
        modest.insert("cpu", 1.0);
        spare.sub(&modest);
        assert!(!spare.any_non_positive());
    }

    #[test]
    fn minimum_job_size_coverage() {
        let minimum = parse_resource_list("cpu=500m, memory=1Gi").unwrap();
        let mut spare = ComputeResources::new();
        spare.insert("cpu", 1.0);
        spare.insert("memory", 2.0 * 1024.0 * 1024.0 * 1024.0);
        assert!(spare.covers(&minimum));

        spare.insert("cpu", 0.25);
        assert!(!spare.covers(&minimum));
    }

    #[test]
    fn resource_list_rejects_missing_equals() {
        assert!(parse_resource_list("cpu").is_err());
        assert!(parse_resource_list("").unwrap().is_empty());
    }
}
