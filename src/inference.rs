// This module builds the prediction input. Inputs come either from a text file
// (one raw string per line) or from an explicit list of tagged inputs. Every
// input is encoded eagerly, the records are checked against the key set of the
// first one, and a burn DataLoader pads and batches them with the multitask batcher.

use crate::{
    config::{InputConfig, Mode},
    data_processing::{
        ensure_consistent, tokenizer_or_load, ExampleInput, FeatureEncoder, Features,
        MultitaskBatch, MultitaskBatcher, Tokenizer,
    },
    error::{Error, Result},
};
use burn::{
    data::{
        dataloader::{DataLoader, DataLoaderBuilder},
        dataset::InMemDataset,
    },
    tensor::backend::Backend,
};
use std::{fs, path::PathBuf, sync::Arc};

/// Where prediction inputs come from
#[derive(Clone, Debug, PartialEq)]
pub enum PredictSource {
    /// Newline-delimited raw strings, blank lines are skipped
    File(PathBuf),
    Inputs(Vec<ExampleInput>),
}

impl PredictSource {
    pub fn into_inputs(self) -> Result<Vec<ExampleInput>> {
        match self {
            PredictSource::File(path) => {
                let content = fs::read_to_string(&path)?;
                Ok(non_empty_lines(&content).map(ExampleInput::from).collect())
            }
            PredictSource::Inputs(inputs) => Ok(inputs),
        }
    }
}

impl From<Vec<String>> for PredictSource {
    fn from(lines: Vec<String>) -> Self {
        PredictSource::Inputs(lines.into_iter().map(ExampleInput::Text).collect())
    }
}

pub(crate) fn non_empty_lines(content: &str) -> impl Iterator<Item = &str> {
    content
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
}

// Encode every input up front
pub fn predict_features(
    source: PredictSource,                // File path or in-memory inputs
    config: &InputConfig,                 // Pipeline configuration
    tokenizer: Option<Arc<dyn Tokenizer>>, // Loaded from vocab_file when absent
) -> Result<Vec<Features>> {
    let inputs = source.into_inputs()?;
    if inputs.is_empty() {
        return Err(Error::EmptyInput);
    }
    let multimodal = inputs.iter().filter(|input| input.is_multimodal()).count();
    if multimodal != 0 && multimodal != inputs.len() {
        return Err(Error::MixedInputKinds);
    }

    let tokenizer = tokenizer_or_load(tokenizer, &config.vocab_file)?;
    let encoder = FeatureEncoder::new(tokenizer, config.max_seq_len, !config.dynamic_padding);
    let features = inputs
        .iter()
        .map(|input| encoder.encode(input))
        .collect::<Result<Vec<_>>>()?;
    ensure_consistent(&features)?;

    tracing::info!(
        mode = %Mode::Predict,
        examples = features.len(),
        multimodal = multimodal != 0,
        "encoded prediction inputs"
    );
    Ok(features)
}

// Define predict input function
pub fn predict_input_fn<B: Backend>(
    source: PredictSource,                // File path or in-memory inputs
    config: &InputConfig,                 // Pipeline configuration
    tokenizer: Option<Arc<dyn Tokenizer>>, // Loaded from vocab_file when absent
    device: B::Device,                    // Device on which batches are created
) -> Result<Arc<dyn DataLoader<MultitaskBatch<B>>>> {
    config.validate()?;
    let tokenizer = tokenizer_or_load(tokenizer, &config.vocab_file)?;
    let pad_id = tokenizer.pad_token();
    let features = predict_features(source, config, Some(tokenizer))?;

    // Batch the encoded records, padding each batch to its longest record
    let batcher = MultitaskBatcher::<B>::new(device, pad_id);
    Ok(DataLoaderBuilder::new(batcher)
        .batch_size(config.batch_size)
        .build(InMemDataset::new(features)))
}
