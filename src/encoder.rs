//! Sentence encoding.
//!
//! The model only needs an [`InputEncoder`]: something that turns a batch of
//! word-id sequences into a fixed-width representation plus a per-node-id
//! reference matrix. [`DirectInputEncoder`] is the default.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor};
use candle_nn::{embedding, linear, Embedding, Linear, Module, VarBuilder};

use crate::error::{Error, Result};

/// Encodes word sequences for the graph model.
pub trait InputEncoder {
    /// `words`: U32 `(b, len)`, word 0 is padding.
    ///
    /// Returns the sentence representation `(b, repr_size)` and the reference
    /// matrix `(b, num_node_ids, repr_size)`, zero when no word names a node.
    fn process(&self, words: &Tensor) -> Result<(Tensor, Tensor)>;

    /// Width of the sentence representation.
    fn repr_size(&self) -> usize;
}

/// Position-weighted bag of word embeddings, with direct word → node references.
///
/// Token `l` of a length-`L` sentence is weighted by `(l + 1) / L`, so word
/// order changes the representation; padding tokens weigh 0.
pub struct DirectInputEncoder {
    num_input_words: usize,
    num_node_ids: usize,
    repr_size: usize,
    words: Embedding,
    project: Linear,
    references: Option<(Embedding, Tensor)>,
}

impl DirectInputEncoder {
    /// Embeddings of `num_input_words` words projected to `repr_size`.
    ///
    /// `mapping` sends word ids to node ids; pass an empty map to disable
    /// direct references.
    pub fn new(
        num_input_words: usize,
        num_node_ids: usize,
        word_node_mapping: &BTreeMap<u32, u32>,
        repr_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let words = embedding(num_input_words, repr_size, vb.pp("words"))?;
        let project = linear(repr_size, repr_size, vb.pp("project"))?;
        let references = if word_node_mapping.is_empty() {
            None
        } else {
            let mut table = vec![0f32; num_input_words * num_node_ids];
            for (&word, &node) in word_node_mapping {
                table[word as usize * num_node_ids + node as usize] = 1.0;
            }
            let table = Tensor::from_vec(table, (num_input_words, num_node_ids), vb.device())?;
            Some((embedding(num_input_words, repr_size, vb.pp("references"))?, table))
        };
        Ok(Self { num_input_words, num_node_ids, repr_size, words, project, references })
    }

    /// Per-token weights `(b, len)` and a host-side range check of every id.
    fn token_weights(&self, words: &Tensor, device: &Device) -> Result<Tensor> {
        let (b, len) = words.dims2()?;
        let ids = words.to_vec2::<u32>()?;
        let mut weights = Vec::with_capacity(b * len);
        for row in &ids {
            for (l, &w) in row.iter().enumerate() {
                if w as usize >= self.num_input_words {
                    return Err(Error::WordOutOfRange { word: w, vocab: self.num_input_words });
                }
                weights.push(if w == 0 { 0.0 } else { (l + 1) as f32 / len as f32 });
            }
        }
        Ok(Tensor::from_vec(weights, (b, len), device)?)
    }
}

impl InputEncoder for DirectInputEncoder {
    fn process(&self, words: &Tensor) -> Result<(Tensor, Tensor)> {
        let device = words.device();
        let (b, len) = words.dims2()?;
        if len == 0 {
            let repr = self.project.forward(&Tensor::zeros((b, self.repr_size), DType::F32, device)?)?.tanh()?;
            let refs = Tensor::zeros((b, self.num_node_ids, self.repr_size), DType::F32, device)?;
            return Ok((repr, refs));
        }
        let weights = self.token_weights(words, device)?;
        let embedded = self.words.forward(words)?;
        let bag = embedded.broadcast_mul(&weights.unsqueeze(2)?)?.sum(1)?;
        let repr = self.project.forward(&bag)?.tanh()?;

        let refs = match &self.references {
            None => Tensor::zeros((b, self.num_node_ids, self.repr_size), DType::F32, device)?,
            Some((table, word_to_node)) => {
                let present = weights.ne(0.0)?.to_dtype(DType::F32)?;
                let routed = word_to_node
                    .index_select(&words.flatten_all()?, 0)?
                    .reshape((b, len, self.num_node_ids))?
                    .broadcast_mul(&present.unsqueeze(2)?)?;
                let contributions = table.forward(words)?;
                routed.transpose(1, 2)?.contiguous()?.matmul(&contributions.contiguous()?)?
            }
        };
        Ok((repr, refs))
    }

    fn repr_size(&self) -> usize {
        self.repr_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn encoder(mapping: BTreeMap<u32, u32>) -> (DirectInputEncoder, VarMap) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        (DirectInputEncoder::new(10, 3, &mapping, 4, vb).unwrap(), varmap)
    }

    #[test]
    fn word_order_matters() {
        let (enc, _vm) = encoder(BTreeMap::new());
        let words = Tensor::new(&[[1u32, 2, 3], [3, 2, 1]], &Device::Cpu).unwrap();
        let (repr, refs) = enc.process(&words).unwrap();
        assert_eq!(repr.dims(), &[2, 4]);
        assert_eq!(refs.dims(), &[2, 3, 4]);
        let r = repr.to_vec2::<f32>().unwrap();
        assert!(r[0].iter().zip(&r[1]).any(|(a, b)| (a - b).abs() > 1e-6));
    }

    #[test]
    fn padding_tokens_contribute_nothing() {
        let (enc, _vm) = encoder(BTreeMap::new());
        let padded = Tensor::new(&[[0u32, 0, 0]], &Device::Cpu).unwrap();
        let empty = Tensor::zeros((1, 0), DType::U32, &Device::Cpu).unwrap();
        let (rp, _) = enc.process(&padded).unwrap();
        let (re, _) = enc.process(&empty).unwrap();
        let rp = rp.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let re = re.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (a, b) in rp.iter().zip(&re) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn references_land_on_mapped_node_rows() {
        let (enc, _vm) = encoder(BTreeMap::from([(4, 2)]));
        let words = Tensor::new(&[[1u32, 4, 0]], &Device::Cpu).unwrap();
        let (_, refs) = enc.process(&words).unwrap();
        let refs = refs.to_vec3::<f32>().unwrap();
        assert!(refs[0][0].iter().all(|&v| v == 0.0));
        assert!(refs[0][1].iter().all(|&v| v == 0.0));
        assert!(refs[0][2].iter().any(|&v| v != 0.0));
    }

    #[test]
    fn out_of_range_word_is_rejected() {
        let (enc, _vm) = encoder(BTreeMap::new());
        let words = Tensor::new(&[[1u32, 10]], &Device::Cpu).unwrap();
        assert!(matches!(enc.process(&words), Err(Error::WordOutOfRange { word: 10, vocab: 10 })));
    }
}
