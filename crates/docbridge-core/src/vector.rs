//! Vector field definitions and distance functions.

use crate::document::RawRecord;
use crate::error::{Error, Result};
use crate::filter::Filter;
use serde::{Deserialize, Serialize};

/// Distance metric of a vector field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    L2,
    InnerProduct,
}

impl DistanceMetric {
    /// Operator class recorded with the index definition.
    pub fn operator_class(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "vector_cosine_ops",
            DistanceMetric::L2 => "vector_l2_ops",
            DistanceMetric::InnerProduct => "vector_ip_ops",
        }
    }

    /// Registered SQL function computing this distance.
    pub fn sql_function(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "vec_distance_cosine",
            DistanceMetric::L2 => "vec_distance_l2",
            DistanceMetric::InnerProduct => "vec_distance_ip",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::L2 => "l2",
            DistanceMetric::InnerProduct => "inner_product",
        }
    }

    /// Distance between two vectors of equal length; smaller is closer.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f64 {
        match self {
            DistanceMetric::Cosine => cosine_distance(a, b),
            DistanceMetric::L2 => a
                .iter()
                .zip(b)
                .map(|(x, y)| {
                    let d = (*x as f64) - (*y as f64);
                    d * d
                })
                .sum::<f64>()
                .sqrt(),
            DistanceMetric::InnerProduct => -dot(a, b),
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum()
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    let norm_a = dot(a, a).sqrt();
    let norm_b = dot(b, b).sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot(a, b) / (norm_a * norm_b)
}

/// ANN index type and tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VectorIndexType {
    IvfFlat { lists: u32 },
    Hnsw { m: u32, ef_construction: u32 },
}

impl Default for VectorIndexType {
    fn default() -> Self {
        Self::ivfflat()
    }
}

impl VectorIndexType {
    pub fn ivfflat() -> Self {
        VectorIndexType::IvfFlat { lists: 100 }
    }

    pub fn hnsw() -> Self {
        VectorIndexType::Hnsw {
            m: 16,
            ef_construction: 64,
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            VectorIndexType::IvfFlat { .. } => "ivfflat",
            VectorIndexType::Hnsw { .. } => "hnsw",
        }
    }

    /// `WITH (...)` parameters of the index definition.
    pub fn parameters(&self) -> String {
        match self {
            VectorIndexType::IvfFlat { lists } => format!("lists = {}", lists),
            VectorIndexType::Hnsw { m, ef_construction } => {
                format!("m = {}, ef_construction = {}", m, ef_construction)
            }
        }
    }
}

/// A vector-valued field of a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorField {
    pub name: String,
    pub dimensions: usize,
    #[serde(default)]
    pub index: VectorIndexType,
    #[serde(default)]
    pub metric: DistanceMetric,
}

impl VectorField {
    pub fn new(name: impl Into<String>, dimensions: usize) -> Self {
        Self {
            name: name.into(),
            dimensions,
            index: VectorIndexType::default(),
            metric: DistanceMetric::default(),
        }
    }

    pub fn metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn index(mut self, index: VectorIndexType) -> Self {
        self.index = index;
        self
    }

    /// Check a vector against the field's dimensionality.
    pub fn check(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(Error::Vector(format!(
                "field {} expects {} dimensions, got {}",
                self.name,
                self.dimensions,
                vector.len()
            )));
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(Error::Vector(format!(
                "field {} received a non-finite component",
                self.name
            )));
        }
        Ok(())
    }
}

/// A recorded ANN index definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorIndexInfo {
    pub field: String,
    pub name: String,
    pub index: VectorIndexType,
    pub metric: DistanceMetric,
    pub operator_class: String,
    /// Rendered definition
    pub definition: String,
}

/// One vector search result.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub record: RawRecord,
    pub distance: f64,
}

/// Combined text and vector search request.
#[derive(Debug, Clone, PartialEq)]
pub struct HybridQuery {
    /// Payload field holding the searchable text
    pub text_field: String,
    pub text: String,
    pub vector_field: String,
    pub vector: Vec<f32>,
    /// Weight of the vector score: 0 is pure text, 1 pure vector
    pub alpha: f64,
    pub limit: usize,
    pub filter: Filter,
}

impl HybridQuery {
    pub fn new(
        text_field: impl Into<String>,
        text: impl Into<String>,
        vector_field: impl Into<String>,
        vector: Vec<f32>,
    ) -> Self {
        Self {
            text_field: text_field.into(),
            text: text.into(),
            vector_field: vector_field.into(),
            vector,
            alpha: 0.5,
            limit: 10,
            filter: Filter::all(),
        }
    }

    pub fn alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(Error::Vector(format!(
                "alpha must be within [0, 1], got {}",
                self.alpha
            )));
        }
        Ok(())
    }
}

/// One hybrid search result.
#[derive(Debug, Clone, PartialEq)]
pub struct HybridHit {
    pub record: RawRecord,
    pub text_score: f64,
    pub vector_score: f64,
    pub score: f64,
}

/// Encode a vector as little-endian `f32` bytes.
pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Decode little-endian `f32` bytes.
pub fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(Error::Vector(format!(
            "vector blob length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

/// Term-frequency rank of `document` for `query`; zero when no term matches.
pub fn text_rank(document: &str, query: &str) -> f64 {
    let terms: Vec<String> = tokenize(query).collect();
    if terms.is_empty() {
        return 0.0;
    }
    let mut total = 0usize;
    let mut hits = 0usize;
    for token in tokenize(document) {
        total += 1;
        if terms.contains(&token) {
            hits += 1;
        }
    }
    if hits == 0 {
        return 0.0;
    }
    hits as f64 / (1.0 + (total as f64).ln())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distances() {
        let a = [1.0, 0.0];
        let b = [0.0, 1.0];
        assert!((DistanceMetric::Cosine.distance(&a, &a)).abs() < 1e-9);
        assert!((DistanceMetric::Cosine.distance(&a, &b) - 1.0).abs() < 1e-9);
        assert!((DistanceMetric::L2.distance(&a, &b) - 2f64.sqrt()).abs() < 1e-9);
        assert!((DistanceMetric::InnerProduct.distance(&a, &a) + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_encode_decode() {
        let v = vec![0.5, -1.25, 3.0];
        let bytes = encode_vector(&v);
        assert_eq!(bytes.len(), 12);
        assert_eq!(decode_vector(&bytes).unwrap(), v);
        assert!(decode_vector(&bytes[..5]).is_err());
    }

    #[test]
    fn test_index_defaults() {
        assert_eq!(VectorIndexType::ivfflat().parameters(), "lists = 100");
        assert_eq!(
            VectorIndexType::hnsw().parameters(),
            "m = 16, ef_construction = 64"
        );
        assert_eq!(DistanceMetric::L2.operator_class(), "vector_l2_ops");
    }

    #[test]
    fn test_check_dimensions() {
        let field = VectorField::new("embedding", 3);
        assert!(field.check(&[1.0, 2.0, 3.0]).is_ok());
        assert!(field.check(&[1.0]).is_err());
        assert!(field.check(&[1.0, f32::NAN, 0.0]).is_err());
    }

    #[test]
    fn test_text_rank() {
        assert_eq!(text_rank("nothing here", "rust"), 0.0);
        let one = text_rank("Rust storage engine", "rust");
        let two = text_rank("Rust storage engine in rust", "rust");
        assert!(one > 0.0);
        assert!(two > one);
    }

    #[test]
    fn test_hybrid_alpha_bounds() {
        let q = HybridQuery::new("body", "x", "embedding", vec![1.0]);
        assert!(q.clone().alpha(1.0).validate().is_ok());
        assert!(q.clone().alpha(1.5).validate().is_err());
        assert!(q.alpha(-0.1).validate().is_err());
    }
}
