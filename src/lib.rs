
mod error;

pub mod config;
pub mod data_processing;
pub mod inference;
pub mod serving;
pub mod training;

pub use config::{InputConfig, Mode};
pub use data_processing::{
    element_length, ExampleInput, FeatureBatch, Features, MultimodalInput, MultitaskBatch, Task,
    Tokenizer,
};
pub use error::{Error, Result};
pub use inference::{predict_features, predict_input_fn, PredictSource};
pub use serving::{serving_input_fn, to_serving_input, ServingInputReceiver, ServingSource};
pub use training::{train_eval_input_fn, InputPipeline};
