// Конфигурация входного конвейера. InputConfig сохраняется и загружается как JSON
// через burn::config::Config, так же как конфигурация эксперимента при обучении.
// Mode заменяет строковые константы режимов явным перечислением.

use crate::error::{self, Error};
use burn::config::Config;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter};

/// Режим работы конвейера
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr, EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum Mode {
    Train,
    Eval,
    Predict,
}

#[derive(Config, Debug)]
pub struct InputConfig {
    /// Файл словаря WordPiece
    pub vocab_file: String,
    /// Каталог с файлами записей для каждой задачи
    pub data_dir: String,
    #[config(default = 32)]
    pub batch_size: usize,
    #[config(default = 2000)]
    pub shuffle_buffer: usize,
    #[config(default = false)]
    pub dynamic_padding: bool,
    #[config(default = "vec![32, 64, 128]")]
    pub bucket_boundaries: Vec<usize>,
    #[config(default = "vec![128, 64, 32, 16]")]
    pub bucket_batch_sizes: Vec<usize>,
    #[config(default = 128)]
    pub max_seq_len: usize,
    /// Число шагов обучения, используется циклом обучения
    #[config(default = 10000)]
    pub train_steps: usize,
    #[config(default = 42)]
    pub seed: u64,
    /// Сколько записей держать готовыми в фоновом потоке
    #[config(default = 256)]
    pub prefetch_size: usize,
}

impl InputConfig {
    /// Проверяет согласованность параметров батчинга
    pub fn validate(&self) -> error::Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be positive".into()));
        }
        if self.max_seq_len < 3 {
            return Err(Error::InvalidConfig(format!(
                "max_seq_len {} leaves no room for [CLS] and [SEP]",
                self.max_seq_len
            )));
        }
        if self.dynamic_padding {
            if self.bucket_batch_sizes.len() != self.bucket_boundaries.len() + 1 {
                return Err(Error::InvalidConfig(format!(
                    "expected {} bucket batch sizes for {} boundaries, got {}",
                    self.bucket_boundaries.len() + 1,
                    self.bucket_boundaries.len(),
                    self.bucket_batch_sizes.len()
                )));
            }
            if self.bucket_boundaries.windows(2).any(|w| w[0] >= w[1]) {
                return Err(Error::InvalidConfig(
                    "bucket boundaries must be strictly increasing".into(),
                ));
            }
            if self.bucket_batch_sizes.contains(&0) {
                return Err(Error::InvalidConfig(
                    "bucket batch sizes must be positive".into(),
                ));
            }
        }
        Ok(())
    }

    /// Размер батча для режима. При оценке градиенты не хранятся,
    /// поэтому батч вдвое больше.
    pub fn batch_size_for(&self, mode: Mode) -> usize {
        match mode {
            Mode::Eval => self.batch_size * 2,
            Mode::Train | Mode::Predict => self.batch_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> InputConfig {
        InputConfig::new("vocab.txt".to_string(), "records".to_string())
    }

    #[test]
    fn eval_batch_is_twice_train_batch() {
        for batch_size in [1, 7, 32] {
            let config = config().with_batch_size(batch_size);
            assert_eq!(config.batch_size_for(Mode::Eval), 2 * batch_size);
            assert_eq!(config.batch_size_for(Mode::Train), batch_size);
        }
    }

    #[test]
    fn mode_names_are_lowercase() {
        let name: &str = Mode::Train.as_ref();
        assert_eq!(name, "train");
        assert_eq!(Mode::Eval.to_string(), "eval");
    }

    #[test]
    fn default_config_is_valid() {
        assert!(config().validate().is_ok());
        assert!(config().with_dynamic_padding(true).validate().is_ok());
    }

    #[test]
    fn rejects_mismatched_buckets() {
        let config = config()
            .with_dynamic_padding(true)
            .with_bucket_boundaries(vec![8, 16])
            .with_bucket_batch_sizes(vec![4, 4]);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn rejects_unsorted_boundaries() {
        let config = config()
            .with_dynamic_padding(true)
            .with_bucket_boundaries(vec![16, 8])
            .with_bucket_batch_sizes(vec![4, 4, 4]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_tiny_sequences() {
        assert!(config().with_max_seq_len(2).validate().is_err());
        assert!(config().with_batch_size(0).validate().is_err());
    }
}
