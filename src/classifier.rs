use std::collections::HashMap;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::{linear, Linear, VarBuilder};
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use log::info;
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

/// One classification label and its confidence, shaped the way a Hugging Face
/// `text-classification` pipeline reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub score: f32,
}

/// The model pipeline: raw text in, classification result out.
///
/// Implementations are blocking and must be safe to call from several threads.
pub trait TextClassifier: Send + Sync {
    fn classify(&self, text: &str) -> Result<Vec<Prediction>>;
}

/// RoBERTa numbers real tokens from `padding_idx + 1`, so rows 0 and 1 of its
/// position table are never looked up.
const ROBERTA_POSITION_OFFSET: usize = 2;

/// The subset of `config.json` the classification head needs. The encoder
/// itself is configured from the same file through Candle's `BertConfig`.
#[derive(Debug, Clone, Deserialize)]
struct HeadConfig {
    hidden_size: usize,
    max_position_embeddings: usize,
    #[serde(default)]
    model_type: Option<String>,
    #[serde(default)]
    id2label: HashMap<String, String>,
    #[serde(default)]
    num_labels: Option<usize>,
}

impl HeadConfig {
    fn num_labels(&self) -> usize {
        self.num_labels.unwrap_or_else(|| self.id2label.len().max(2))
    }

    fn is_roberta(&self) -> bool {
        matches!(
            self.model_type.as_deref(),
            Some("roberta") | Some("xlm-roberta") | Some("camembert")
        )
    }

    fn label(&self, index: usize) -> String {
        self.id2label
            .get(&index.to_string())
            .cloned()
            .unwrap_or_else(|| format!("LABEL_{index}"))
    }

    /// Longest token sequence the position embeddings can address.
    /// RoBERTa-style checkpoints reserve the first two positions for padding.
    fn max_tokens(&self) -> usize {
        if self.is_roberta() {
            self.max_position_embeddings.saturating_sub(ROBERTA_POSITION_OFFSET)
        } else {
            self.max_position_embeddings
        }
    }
}

enum Head {
    /// `classifier.dense` -> tanh -> `classifier.out_proj` over the `<s>` token.
    Roberta { dense: Linear, out_proj: Linear },
    /// Pooler -> tanh -> `classifier` over the `[CLS]` token.
    Bert { pooler: Linear, classifier: Linear },
}

impl Head {
    fn load(vb: VarBuilder, config: &HeadConfig) -> Result<Self> {
        let hidden = config.hidden_size;
        let labels = config.num_labels();
        let head = if config.is_roberta() {
            Head::Roberta {
                dense: linear(hidden, hidden, vb.pp("classifier.dense"))?,
                out_proj: linear(hidden, labels, vb.pp("classifier.out_proj"))?,
            }
        } else {
            let prefix = config.model_type.as_deref().unwrap_or("bert");
            Head::Bert {
                pooler: linear(hidden, hidden, vb.pp(format!("{prefix}.pooler.dense")))?,
                classifier: linear(hidden, labels, vb.pp("classifier"))?,
            }
        };
        Ok(head)
    }

    fn forward(&self, first_token: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Head::Roberta { dense, out_proj } => out_proj.forward(&dense.forward(first_token)?.tanh()?),
            Head::Bert { pooler, classifier } => classifier.forward(&pooler.forward(first_token)?.tanh()?),
        }
    }
}

/// Encoder plus classification head, built from an in-memory weight map.
struct SequenceClassifier {
    encoder: BertModel,
    head: Head,
}

impl SequenceClassifier {
    /// `raw_config` is the checkpoint's `config.json`. For RoBERTa-style
    /// checkpoints the position table is shifted so that Candle's `0..len`
    /// position ids land on the rows the checkpoint was trained with.
    fn from_tensors(
        mut tensors: HashMap<String, Tensor>,
        raw_config: &str,
        device: &Device,
    ) -> Result<(Self, HeadConfig)> {
        let config: HeadConfig = serde_json::from_str(raw_config)?;
        let mut encoder_config: serde_json::Value = serde_json::from_str(raw_config)?;

        if config.is_roberta() {
            let rows = shift_position_table(&mut tensors)?;
            encoder_config["max_position_embeddings"] = serde_json::json!(rows);
        }
        let encoder_config: BertConfig = serde_json::from_value(encoder_config)?;

        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        let encoder = BertModel::load(vb.clone(), &encoder_config)?;
        let head = Head::load(vb, &config)?;

        Ok((Self { encoder, head }, config))
    }

    /// Raw logits, shape `[1, num_labels]`.
    fn logits(&self, ids: &[u32], device: &Device) -> Result<Tensor> {
        let input_ids = Tensor::new(ids, device)?.unsqueeze(0)?;
        let token_type_ids = input_ids.zeros_like()?;
        let hidden = self.encoder.forward(&input_ids, &token_type_ids)?;
        Ok(self.head.forward(&hidden.i((.., 0))?)?)
    }
}

/// Drops the padding rows from the position table in place and returns the
/// remaining row count.
fn shift_position_table(tensors: &mut HashMap<String, Tensor>) -> Result<usize> {
    let key = tensors
        .keys()
        .find(|k| k.ends_with("embeddings.position_embeddings.weight"))
        .cloned()
        .ok_or_else(|| anyhow!("checkpoint has no position embeddings"))?;
    let table = tensors
        .remove(&key)
        .ok_or_else(|| anyhow!("checkpoint has no position embeddings"))?;

    let rows = table.dim(0)?;
    if rows <= ROBERTA_POSITION_OFFSET {
        bail!("position table has only {rows} rows");
    }
    let kept = rows - ROBERTA_POSITION_OFFSET;
    tensors.insert(key, table.narrow(0, ROBERTA_POSITION_OFFSET, kept)?);
    Ok(kept)
}

/// Reads every weight of the checkpoint, preferring safetensors.
fn read_weights(repo: &ApiRepo, device: &Device) -> Result<HashMap<String, Tensor>> {
    match repo.get("model.safetensors") {
        Ok(path) => Ok(candle_core::safetensors::load(path, device)?),
        Err(_) => {
            let path = repo.get("pytorch_model.bin")?;
            Ok(candle_core::pickle::read_all(path)?.into_iter().collect())
        }
    }
}

/// Cuts `ids` down to `limit`, keeping the closing special token.
fn truncate_ids(mut ids: Vec<u32>, limit: usize) -> Vec<u32> {
    if ids.len() <= limit {
        return ids;
    }
    let last = ids[ids.len() - 1];
    ids.truncate(limit.saturating_sub(1));
    ids.push(last);
    ids
}

/// Sequence classification on a BERT-family encoder, run with Candle on CPU.
pub struct BertClassifier {
    model_id: String,
    device: Device,
    network: SequenceClassifier,
    config: HeadConfig,
    tokenizer: Tokenizer,
}

impl BertClassifier {
    /// Downloads (or reuses the local hub cache for) the checkpoint and builds
    /// the encoder plus its classification head.
    pub fn load(model_id: &str, revision: &str) -> Result<Self> {
        let device = Device::Cpu;
        let start = Instant::now();

        let api = Api::new()?;
        let repo = api.repo(Repo::with_revision(
            model_id.to_string(),
            RepoType::Model,
            revision.to_string(),
        ));

        let config_path = repo.get("config.json")?;
        let raw = std::fs::read_to_string(&config_path)
            .with_context(|| format!("reading {}", config_path.display()))?;

        let tokenizer_path = repo
            .get("tokenizer.json")
            .context("checkpoint has no tokenizer.json")?;
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow!("Error loading tokenizer: {e}"))?;

        let tensors = read_weights(&repo, &device)?;
        let (network, config) = SequenceClassifier::from_tensors(tensors, &raw, &device)?;

        info!(
            "built {} ({} labels) in {:.2}s",
            model_id,
            config.num_labels(),
            start.elapsed().as_secs_f32(),
        );

        Ok(Self {
            model_id: model_id.to_string(),
            device,
            network,
            config,
            tokenizer,
        })
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!("Error encoding input: {e}"))?;
        let ids = truncate_ids(encoding.get_ids().to_vec(), self.config.max_tokens());
        if ids.is_empty() {
            bail!("tokenizer produced no tokens for input");
        }
        Ok(ids)
    }
}

impl TextClassifier for BertClassifier {
    fn classify(&self, text: &str) -> Result<Vec<Prediction>> {
        let ids = self.encode(text)?;

        let logits = self.network.logits(&ids, &self.device)?;
        let probs = candle_nn::ops::softmax(&logits, D::Minus1)?
            .squeeze(0)?
            .to_vec1::<f32>()?;

        let (index, score) = probs
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .ok_or_else(|| anyhow!("{} returned no logits", self.model_id))?;

        Ok(vec![Prediction {
            label: self.config.label(index),
            score,
        }])
    }
}
