// Адаптеры сервинга. to_serving_input лениво кодирует строки для сервинга в процессе:
// кластеризация латиницы и цифр, токенизация, усечение, служебные токены, маска и
// заполнение до max_seq_len; батчи не собираются. serving_input_fn описывает вход
// экспортируемой модели: три целочисленные матрицы [batch, seq] с любыми размерами.

use crate::{
    config::InputConfig,
    data_processing::{
        cluster_alphanumeric, tokenizer_or_load, FeatureBatch, FeatureEncoder, Features,
        Tokenizer, INPUT_IDS, INPUT_MASK, SEGMENT_IDS,
    },
    error::{Error, Result},
    inference::non_empty_lines,
};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf, sync::Arc};

/// Источник строк для сервинга
#[derive(Clone, Debug, PartialEq)]
pub enum ServingSource {
    File(PathBuf),
    Lines(Vec<String>),
}

/// Перезапускаемая ленивая последовательность входов сервинга
pub struct ServingInputs {
    lines: Vec<String>,
    encoder: FeatureEncoder,
}

impl ServingInputs {
    /// Каждый вызов начинает последовательность заново
    pub fn iter(&self) -> impl Iterator<Item = Result<Features>> + '_ {
        self.lines.iter().map(|line| {
            let pieces = cluster_alphanumeric(line);
            self.encoder.encode_pieces(&pieces, None, None, "")
        })
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

pub fn to_serving_input(
    source: ServingSource,
    config: &InputConfig,
    tokenizer: Option<Arc<dyn Tokenizer>>,
) -> Result<ServingInputs> {
    let lines: Vec<String> = match source {
        ServingSource::File(path) => {
            let content = fs::read_to_string(path)?;
            non_empty_lines(&content).map(str::to_string).collect()
        }
        ServingSource::Lines(lines) => lines
            .into_iter()
            .filter(|line| !line.trim().is_empty())
            .collect(),
    };
    let tokenizer = tokenizer_or_load(tokenizer, &config.vocab_file)?;
    Ok(ServingInputs {
        lines,
        encoder: FeatureEncoder::new(tokenizer, config.max_seq_len, true),
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Int32,
}

/// Описание одного входного тензора; None - размер не задан
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<Option<usize>>,
}

/// Входная сигнатура экспортируемой модели
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServingInputReceiver {
    pub features: Vec<TensorSpec>,
}

pub fn serving_input_fn() -> ServingInputReceiver {
    let features = [INPUT_IDS, INPUT_MASK, SEGMENT_IDS]
        .iter()
        .map(|name| TensorSpec {
            name: name.to_string(),
            dtype: DType::Int32,
            shape: vec![None, None],
        })
        .collect();
    ServingInputReceiver { features }
}

impl ServingInputReceiver {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Сохраняет сигнатуру рядом с экспортированной моделью
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Проверяет, что батч запроса содержит все входы сигнатуры одинаковой формы.
    pub fn validate(&self, batch: &FeatureBatch) -> Result<()> {
        let shape = [batch.len(), batch.seq_len()];
        for spec in &self.features {
            let rows = match spec.name.as_str() {
                INPUT_IDS => &batch.input_ids,
                INPUT_MASK => &batch.input_mask,
                SEGMENT_IDS => &batch.segment_ids,
                other => {
                    return Err(Error::InvalidRequest(format!("unknown input `{other}`")));
                }
            };
            if rows.len() != shape[0] || rows.iter().any(|row| row.len() != shape[1]) {
                return Err(Error::InvalidRequest(format!(
                    "`{}` does not have shape {shape:?}",
                    spec.name
                )));
            }
            for (dim, expected) in spec.shape.iter().zip(shape) {
                if dim.is_some_and(|dim| dim != expected) {
                    return Err(Error::InvalidRequest(format!(
                        "`{}` expects shape {:?}, got {shape:?}",
                        spec.name, spec.shape
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_processing::test_utils::WhitespaceTokenizer;

    fn config() -> InputConfig {
        InputConfig::new("unused".to_string(), "unused".to_string()).with_max_seq_len(6)
    }

    fn inputs(lines: &[&str]) -> ServingInputs {
        let lines = lines.iter().map(|line| line.to_string()).collect();
        to_serving_input(
            ServingSource::Lines(lines),
            &config(),
            Some(Arc::new(WhitespaceTokenizer::new())),
        )
        .unwrap()
    }

    #[test]
    fn one_record_per_non_empty_line() {
        let inputs = inputs(&["hello world", "", "   ", "rust is fast"]);
        let records: Vec<Features> = inputs.iter().collect::<Result<_>>().unwrap();

        assert_eq!(records.len(), 2);
        for record in &records {
            assert_eq!(record.keys(), vec![INPUT_IDS, INPUT_MASK, SEGMENT_IDS]);
            assert_eq!(record.input_ids.len(), 6);
        }
        assert_eq!(records[0].input_ids, vec![2, 4, 5, 3, 0, 0]);
    }

    #[test]
    fn iteration_restarts() {
        let inputs = inputs(&["hello", "world"]);
        assert_eq!(inputs.iter().count(), 2);
        assert_eq!(inputs.iter().count(), 2);
    }

    #[test]
    fn long_lines_are_truncated() {
        let inputs = inputs(&["a b c 1 2 3 hello"]);
        let record = inputs.iter().next().unwrap().unwrap();
        assert_eq!(record.input_ids, vec![2, 9, 10, 11, 12, 3]);
        assert_eq!(record.input_mask, vec![1; 6]);
    }

    #[test]
    fn signature_declares_three_int_matrices() {
        let receiver = serving_input_fn();
        let names: Vec<&str> = receiver.features.iter().map(|spec| spec.name.as_str()).collect();
        assert_eq!(names, vec![INPUT_IDS, INPUT_MASK, SEGMENT_IDS]);
        assert!(receiver
            .features
            .iter()
            .all(|spec| spec.dtype == DType::Int32 && spec.shape == vec![None, None]));

        let json = receiver.to_json().unwrap();
        let restored: ServingInputReceiver = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, receiver);
    }

    #[test]
    fn validates_request_shapes() {
        let receiver = serving_input_fn();
        let records: Vec<Features> = inputs(&["hello", "rust is fast"])
            .iter()
            .collect::<Result<_>>()
            .unwrap();
        let mut batch = FeatureBatch::pad(records, 0);
        assert!(receiver.validate(&batch).is_ok());

        batch.segment_ids[1].pop();
        assert!(matches!(
            receiver.validate(&batch),
            Err(Error::InvalidRequest(_))
        ));
    }
}
