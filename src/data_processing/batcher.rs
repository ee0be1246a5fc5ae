// Модуль определяет FeatureBatch - батч признаков в памяти хоста, дополненный до самой
// длинной записи батча, и MultitaskBatch - те же признаки в виде тензоров burn.
// MultitaskBatcher реализует трейт Batcher, чтобы DataLoader burn мог собирать батчи
// из закодированных записей. Набор ключей батча берется из первой записи.

use super::features::Features;
use burn::{
    data::dataloader::batcher::Batcher,
    tensor::{backend::Backend, Data, ElementConversion, Int, Shape, Tensor},
};
use derive_new::new;
use std::collections::BTreeMap;

/// Батч признаков, каждая последовательность дополнена до общей длины
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FeatureBatch {
    pub input_ids: Vec<Vec<i64>>,
    pub input_mask: Vec<Vec<i64>>,
    pub segment_ids: Vec<Vec<i64>>,
    pub int_features: BTreeMap<String, Vec<Vec<i64>>>,
    pub float_features: BTreeMap<String, Vec<Vec<Vec<f32>>>>,
}

fn pad_rows(rows: Vec<Vec<i64>>, value: i64) -> Vec<Vec<i64>> {
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    rows.into_iter()
        .map(|mut row| {
            row.resize(width, value);
            row
        })
        .collect()
}

fn pad_matrices(matrices: Vec<Vec<Vec<f32>>>) -> Vec<Vec<Vec<f32>>> {
    let rows = matrices.iter().map(Vec::len).max().unwrap_or(0);
    let dim = matrices
        .iter()
        .flatten()
        .map(Vec::len)
        .find(|dim| *dim > 0)
        .unwrap_or(0);
    matrices
        .into_iter()
        .map(|mut matrix| {
            matrix.resize(rows, vec![0.0; dim]);
            matrix
        })
        .collect()
}

impl FeatureBatch {
    /// Собирает записи в батч и дополняет последовательности до самой длинной.
    pub fn pad(items: Vec<Features>, pad_id: i64) -> Self {
        let Some(first) = items.first() else {
            return Self::default();
        };

        let int_features = first
            .int_features
            .keys()
            .map(|key| {
                let rows = items
                    .iter()
                    .map(|item| item.int_features.get(key).cloned().unwrap_or_default())
                    .collect();
                (key.clone(), pad_rows(rows, 0))
            })
            .collect();
        let float_features = first
            .float_features
            .keys()
            .map(|key| {
                let matrices = items
                    .iter()
                    .map(|item| item.float_features.get(key).cloned().unwrap_or_default())
                    .collect();
                (key.clone(), pad_matrices(matrices))
            })
            .collect();

        let mut input_ids = Vec::with_capacity(items.len());
        let mut input_mask = Vec::with_capacity(items.len());
        let mut segment_ids = Vec::with_capacity(items.len());
        for item in items {
            input_ids.push(item.input_ids);
            input_mask.push(item.input_mask);
            segment_ids.push(item.segment_ids);
        }

        Self {
            input_ids: pad_rows(input_ids, pad_id),
            input_mask: pad_rows(input_mask, 0),
            segment_ids: pad_rows(segment_ids, 0),
            int_features,
            float_features,
        }
    }

    /// Число записей в батче
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Длина последовательностей после дополнения
    pub fn seq_len(&self) -> usize {
        self.input_ids.first().map_or(0, Vec::len)
    }

    /// Переносит батч на устройство в виде тензоров
    pub fn to_tensors<B: Backend>(&self, device: &B::Device) -> MultitaskBatch<B> {
        MultitaskBatch {
            input_ids: int_tensor(&self.input_ids, device),
            input_mask: int_tensor(&self.input_mask, device),
            segment_ids: int_tensor(&self.segment_ids, device),
            int_features: self
                .int_features
                .iter()
                .map(|(key, rows)| (key.clone(), int_tensor(rows, device)))
                .collect(),
            float_features: self
                .float_features
                .iter()
                .map(|(key, matrices)| (key.clone(), float_tensor(matrices, device)))
                .collect(),
        }
    }
}

fn int_tensor<B: Backend>(rows: &[Vec<i64>], device: &B::Device) -> Tensor<B, 2, Int> {
    let width = rows.first().map_or(0, Vec::len);
    let values: Vec<B::IntElem> = rows.iter().flatten().map(|value| (*value).elem()).collect();
    Tensor::from_data(Data::new(values, Shape::new([rows.len(), width])), device)
}

fn float_tensor<B: Backend>(matrices: &[Vec<Vec<f32>>], device: &B::Device) -> Tensor<B, 3> {
    let rows = matrices.first().map_or(0, Vec::len);
    let dim = matrices.iter().flatten().next().map_or(0, Vec::len);
    let values: Vec<B::FloatElem> = matrices
        .iter()
        .flatten()
        .flatten()
        .map(|value| (*value).elem())
        .collect();
    Tensor::from_data(
        Data::new(values, Shape::new([matrices.len(), rows, dim])),
        device,
    )
}

/// Батч признаков многозадачной модели
#[derive(Debug, Clone, new)]
pub struct MultitaskBatch<B: Backend> {
    pub input_ids: Tensor<B, 2, Int>,   // Идентификаторы токенов
    pub input_mask: Tensor<B, 2, Int>,  // 1 - токен, 0 - заполнение
    pub segment_ids: Tensor<B, 2, Int>, // Номер предложения для каждого токена
    pub int_features: BTreeMap<String, Tensor<B, 2, Int>>, // Метки задач и маски модальностей
    pub float_features: BTreeMap<String, Tensor<B, 3>>,    // Входы модальностей
}

/// Структура для упаковки закодированных записей в тензоры
#[derive(new, Clone, Debug)]
pub struct MultitaskBatcher<B: Backend> {
    device: B::Device, // Вычислительное устройство для создания тензоров
    pad_id: i64,       // Идентификатор токена заполнения
}

impl<B: Backend> Batcher<Features, MultitaskBatch<B>> for MultitaskBatcher<B> {
    /// Дополняет записи до самой длинной в батче и создает тензоры
    fn batch(&self, items: Vec<Features>) -> MultitaskBatch<B> {
        FeatureBatch::pad(items, self.pad_id).to_tensors(&self.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn record(ids: &[i64], label: i64) -> Features {
        let mut features = Features {
            input_ids: ids.to_vec(),
            input_mask: vec![1; ids.len()],
            segment_ids: vec![0; ids.len()],
            ..Default::default()
        };
        features
            .int_features
            .insert("topic_label_ids".to_string(), vec![label]);
        features
    }

    #[test]
    fn pads_to_longest_record() {
        let batch = FeatureBatch::pad(vec![record(&[2, 4, 3], 1), record(&[2, 3], 0)], 0);

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.seq_len(), 3);
        assert_eq!(batch.input_ids, vec![vec![2, 4, 3], vec![2, 3, 0]]);
        assert_eq!(batch.input_mask, vec![vec![1, 1, 1], vec![1, 1, 0]]);
        for rows in [&batch.input_ids, &batch.input_mask, &batch.segment_ids] {
            assert!(rows.iter().all(|row| row.len() == batch.seq_len()));
        }
        assert_eq!(batch.int_features["topic_label_ids"], vec![vec![1], vec![0]]);
    }

    #[test]
    fn pads_modal_matrices() {
        let mut short = record(&[2, 3], 0);
        short
            .float_features
            .insert("image_input".to_string(), vec![vec![1.0, 2.0]]);
        let mut long = record(&[2, 3], 0);
        long.float_features.insert(
            "image_input".to_string(),
            vec![vec![1.0, 1.0], vec![3.0, 3.0]],
        );

        let batch = FeatureBatch::pad(vec![short, long], 0);
        assert_eq!(
            batch.float_features["image_input"][0],
            vec![vec![1.0, 2.0], vec![0.0, 0.0]]
        );
    }

    #[test]
    fn batcher_creates_tensors() {
        let device = Default::default();
        let batcher = MultitaskBatcher::<TestBackend>::new(device, 0);
        let batch = batcher.batch(vec![
            record(&[2, 4, 5, 3], 1),
            record(&[2, 3], 0),
            record(&[2, 6, 3], 2),
        ]);

        assert_eq!(batch.input_ids.dims(), [3, 4]);
        assert_eq!(batch.input_mask.dims(), [3, 4]);
        assert_eq!(batch.segment_ids.dims(), [3, 4]);
        assert_eq!(batch.int_features["topic_label_ids"].dims(), [3, 1]);

        let ids = batch.input_ids.into_data().convert::<i64>().value;
        assert_eq!(ids, vec![2, 4, 5, 3, 2, 3, 0, 0, 2, 6, 3, 0]);
    }
}
