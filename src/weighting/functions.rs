//! Weighting functions: registry of per-document scoring primitives
//!
//! A weighting function is created from a name through a registry of plain
//! factory function pointers, configured with numeric and string
//! parameters, fed posting sources as features, and called per candidate
//! document. The standard functions cover the common first-pass scores:
//! `bm25`, `frequency`, `constant` and `metadata`.

use crate::error::{Result, StorageError};
use crate::iterator::{FfPostingIterator, PostingIterator};
use crate::metadata::MetaDataReader;
use crate::types::{GlobalCounter, Index};
use ahash::AHashMap;

/// Upper bound on the features of one weighting function call.
pub const MAX_NOF_WEIGHTING_ELEMENTS: usize = 64;

/// Minimal posting interface the weighting functions consume.
pub trait PostingSource {
    fn skip_doc(&mut self, docno: Index) -> Result<Index>;
    fn frequency(&mut self) -> Result<u32>;
    fn document_frequency(&mut self) -> Result<GlobalCounter>;
}

impl PostingSource for PostingIterator {
    fn skip_doc(&mut self, docno: Index) -> Result<Index> {
        PostingIterator::skip_doc(self, docno)
    }

    fn frequency(&mut self) -> Result<u32> {
        PostingIterator::frequency(self)
    }

    fn document_frequency(&mut self) -> Result<GlobalCounter> {
        PostingIterator::document_frequency(self)
    }
}

impl PostingSource for FfPostingIterator {
    fn skip_doc(&mut self, docno: Index) -> Result<Index> {
        FfPostingIterator::skip_doc(self, docno)
    }

    fn frequency(&mut self) -> Result<u32> {
        Ok(FfPostingIterator::frequency(self))
    }

    fn document_frequency(&mut self) -> Result<GlobalCounter> {
        FfPostingIterator::document_frequency(self)
    }
}

/// Numeric and string parameters of a weighting function instance.
#[derive(Debug, Clone, Default)]
pub struct WeightingParams {
    nums: AHashMap<String, f64>,
    strs: AHashMap<String, String>,
}

impl WeightingParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_num(&mut self, name: &str, value: f64) -> &mut Self {
        self.nums.insert(name.to_ascii_lowercase(), value);
        self
    }

    pub fn set_str(&mut self, name: &str, value: &str) -> &mut Self {
        self.strs
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn num(&self, name: &str, default: f64) -> f64 {
        self.nums.get(name).copied().unwrap_or(default)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.strs.get(name).map(|s| s.as_str())
    }
}

/// Construction arguments of a weighting function context.
pub struct WeightingInit {
    pub params: WeightingParams,
    /// collection size for idf-style weights
    pub nof_documents: f64,
    /// metadata access for doclen-style normalization
    pub metadata: Option<MetaDataReader>,
}

/// One scoring context: features added once, then called per document.
pub trait WeightingContext {
    fn add_feature(&mut self, source: Box<dyn PostingSource>, weight: f64) -> Result<()>;
    fn weigh(&mut self, docno: Index) -> Result<f64>;
}

pub type WeightingFactory = fn(WeightingInit) -> Result<Box<dyn WeightingContext>>;

/// Name → factory registry. Factories are plain function pointers.
pub struct WeightingRegistry {
    map: AHashMap<&'static str, WeightingFactory>,
}

impl WeightingRegistry {
    /// Registry with the standard functions.
    pub fn standard() -> Self {
        let mut reg = Self {
            map: AHashMap::new(),
        };
        reg.define("bm25", create_bm25);
        reg.define("frequency", create_frequency);
        reg.define("constant", create_constant);
        reg.define("metadata", create_metadata);
        reg
    }

    pub fn define(&mut self, name: &'static str, factory: WeightingFactory) {
        self.map.insert(name, factory);
    }

    pub fn create(&self, name: &str, init: WeightingInit) -> Result<Box<dyn WeightingContext>> {
        match self.map.get(name) {
            Some(factory) => factory(init),
            None => Err(StorageError::NotFound(format!(
                "weighting function '{}' not defined",
                name
            ))),
        }
    }
}

struct Feature {
    source: Box<dyn PostingSource>,
    weight: f64,
}

fn push_feature(features: &mut Vec<Feature>, feature: Feature) -> Result<()> {
    if features.len() >= MAX_NOF_WEIGHTING_ELEMENTS {
        return Err(StorageError::ResourceExhausted(format!(
            "too many weighting features (max {})",
            MAX_NOF_WEIGHTING_ELEMENTS
        )));
    }
    features.push(feature);
    Ok(())
}

/// Okapi BM25 with doclen normalization from a metadata element.
struct Bm25Context {
    features: Vec<Feature>,
    k1: f64,
    b: f64,
    avgdoclen: f64,
    nof_documents: f64,
    metadata: Option<(MetaDataReader, Index)>,
}

fn create_bm25(init: WeightingInit) -> Result<Box<dyn WeightingContext>> {
    let doclen_name = init.params.str("metadata_doclen").unwrap_or("doclen");
    let metadata = match init.metadata {
        Some(reader) => match reader.element_handle(doclen_name) {
            Ok(handle) => Some((reader, handle)),
            Err(_) => None,
        },
        None => None,
    };
    Ok(Box::new(Bm25Context {
        features: Vec::new(),
        k1: init.params.num("k1", 1.5),
        b: init.params.num("b", 0.75),
        avgdoclen: init.params.num("avgdoclen", 1000.0),
        nof_documents: init.nof_documents,
        metadata,
    }))
}

impl WeightingContext for Bm25Context {
    fn add_feature(&mut self, source: Box<dyn PostingSource>, weight: f64) -> Result<()> {
        push_feature(&mut self.features, Feature { source, weight })
    }

    fn weigh(&mut self, docno: Index) -> Result<f64> {
        let doclen = match &mut self.metadata {
            Some((reader, handle)) => {
                reader.skip_doc(docno)?;
                reader.get_value(*handle)?.to_float()
            }
            None => self.avgdoclen,
        };
        let rel_doclen = if self.avgdoclen > 0.0 {
            doclen / self.avgdoclen
        } else {
            1.0
        };
        let mut score = 0.0;
        for feature in &mut self.features {
            if feature.source.skip_doc(docno)? != docno {
                continue;
            }
            let df = feature.source.document_frequency()? as f64;
            let ff = feature.source.frequency()? as f64;
            let idf = ((self.nof_documents - df + 0.5) / (df + 0.5)).log10();
            let norm = self.k1 * (1.0 - self.b + self.b * rel_doclen);
            score += feature.weight * idf * (ff * (self.k1 + 1.0)) / (ff + norm);
        }
        Ok(score)
    }
}

/// Weighted term frequency sum.
struct FrequencyContext {
    features: Vec<Feature>,
}

fn create_frequency(_init: WeightingInit) -> Result<Box<dyn WeightingContext>> {
    Ok(Box::new(FrequencyContext {
        features: Vec::new(),
    }))
}

impl WeightingContext for FrequencyContext {
    fn add_feature(&mut self, source: Box<dyn PostingSource>, weight: f64) -> Result<()> {
        push_feature(&mut self.features, Feature { source, weight })
    }

    fn weigh(&mut self, docno: Index) -> Result<f64> {
        let mut score = 0.0;
        for feature in &mut self.features {
            if feature.source.skip_doc(docno)? == docno {
                score += feature.weight * feature.source.frequency()? as f64;
            }
        }
        Ok(score)
    }
}

/// Constant weight per matching feature.
struct ConstantContext {
    features: Vec<Feature>,
    value: f64,
}

fn create_constant(init: WeightingInit) -> Result<Box<dyn WeightingContext>> {
    Ok(Box::new(ConstantContext {
        features: Vec::new(),
        value: init.params.num("value", 1.0),
    }))
}

impl WeightingContext for ConstantContext {
    fn add_feature(&mut self, source: Box<dyn PostingSource>, weight: f64) -> Result<()> {
        push_feature(&mut self.features, Feature { source, weight })
    }

    fn weigh(&mut self, docno: Index) -> Result<f64> {
        let mut score = 0.0;
        for feature in &mut self.features {
            if feature.source.skip_doc(docno)? == docno {
                score += self.value * feature.weight;
            }
        }
        Ok(score)
    }
}

/// The value of one metadata element as the document score.
struct MetadataContext {
    reader: MetaDataReader,
    handle: Index,
    weight: f64,
}

fn create_metadata(init: WeightingInit) -> Result<Box<dyn WeightingContext>> {
    let name = init
        .params
        .str("name")
        .ok_or_else(|| {
            StorageError::InvalidArgument(
                "missing parameter 'name' for weighting function 'metadata'".into(),
            )
        })?
        .to_string();
    let reader = init.metadata.ok_or_else(|| {
        StorageError::InvalidArgument(
            "weighting function 'metadata' needs metadata access".into(),
        )
    })?;
    let handle = reader.element_handle(&name)?;
    Ok(Box::new(MetadataContext {
        reader,
        handle,
        weight: init.params.num("weight", 1.0),
    }))
}

impl WeightingContext for MetadataContext {
    fn add_feature(&mut self, _source: Box<dyn PostingSource>, _weight: f64) -> Result<()> {
        Err(StorageError::InvalidArgument(
            "weighting function 'metadata' takes no features".into(),
        ))
    }

    fn weigh(&mut self, docno: Index) -> Result<f64> {
        self.reader.skip_doc(docno)?;
        Ok(self.weight * self.reader.get_value(self.handle)?.to_float())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Posting source over fixed `(docno, ff)` pairs.
    struct FixedPostings {
        docs: Vec<(Index, u32)>,
        at: usize,
    }

    impl FixedPostings {
        fn new(docs: Vec<(Index, u32)>) -> Self {
            Self { docs, at: 0 }
        }
    }

    impl PostingSource for FixedPostings {
        fn skip_doc(&mut self, docno: Index) -> Result<Index> {
            self.at = self.docs.partition_point(|(d, _)| *d < docno);
            Ok(self.docs.get(self.at).map(|(d, _)| *d).unwrap_or(0))
        }

        fn frequency(&mut self) -> Result<u32> {
            Ok(self.docs.get(self.at).map(|(_, f)| *f).unwrap_or(0))
        }

        fn document_frequency(&mut self) -> Result<GlobalCounter> {
            Ok(self.docs.len() as GlobalCounter)
        }
    }

    #[test]
    fn frequency_weights_matching_docs() {
        let reg = WeightingRegistry::standard();
        let mut ctx = reg
            .create(
                "frequency",
                WeightingInit {
                    params: WeightingParams::new(),
                    nof_documents: 4.0,
                    metadata: None,
                },
            )
            .unwrap();
        ctx.add_feature(
            Box::new(FixedPostings::new(vec![(1, 2), (2, 1), (4, 3)])),
            1.0,
        )
        .unwrap();
        assert_eq!(ctx.weigh(1).unwrap(), 2.0);
        assert_eq!(ctx.weigh(3).unwrap(), 0.0);
        assert_eq!(ctx.weigh(4).unwrap(), 3.0);
    }

    #[test]
    fn bm25_idf_direction() {
        let reg = WeightingRegistry::standard();
        let mut params = WeightingParams::new();
        params.set_num("avgdoclen", 3.0);
        let mut ctx = reg
            .create(
                "bm25",
                WeightingInit {
                    params,
                    nof_documents: 100.0,
                    metadata: None,
                },
            )
            .unwrap();
        // rare term (df 1) vs frequent term (df 50), same ff
        ctx.add_feature(Box::new(FixedPostings::new(vec![(7, 2)])), 1.0)
            .unwrap();
        let rare = ctx.weigh(7).unwrap();
        let mut ctx2 = reg
            .create(
                "bm25",
                WeightingInit {
                    params: WeightingParams::new(),
                    nof_documents: 100.0,
                    metadata: None,
                },
            )
            .unwrap();
        let frequent_docs: Vec<(Index, u32)> = (1..=50).map(|d| (d, 2)).collect();
        ctx2.add_feature(Box::new(FixedPostings::new(frequent_docs)), 1.0)
            .unwrap();
        let frequent = ctx2.weigh(7).unwrap();
        assert!(rare > frequent, "{} vs {}", rare, frequent);
    }

    #[test]
    fn feature_cap_enforced() {
        let reg = WeightingRegistry::standard();
        let mut ctx = reg
            .create(
                "constant",
                WeightingInit {
                    params: WeightingParams::new(),
                    nof_documents: 1.0,
                    metadata: None,
                },
            )
            .unwrap();
        for _ in 0..MAX_NOF_WEIGHTING_ELEMENTS {
            ctx.add_feature(Box::new(FixedPostings::new(vec![(1, 1)])), 1.0)
                .unwrap();
        }
        assert!(matches!(
            ctx.add_feature(Box::new(FixedPostings::new(vec![(1, 1)])), 1.0),
            Err(StorageError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn unknown_function_rejected() {
        let reg = WeightingRegistry::standard();
        assert!(matches!(
            reg.create(
                "nope",
                WeightingInit {
                    params: WeightingParams::new(),
                    nof_documents: 0.0,
                    metadata: None,
                }
            ),
            Err(StorageError::NotFound(_))
        ));
    }
}
