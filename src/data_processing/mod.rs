mod batcher;
mod dataset;
mod features;
mod records;
mod stream;
mod tokenizer;

pub use batcher::*;
pub use dataset::*;
pub use features::*;
pub use records::*;
pub use stream::*;
pub use tokenizer::*;

#[cfg(test)]
pub(crate) use tokenizer::test_utils;
