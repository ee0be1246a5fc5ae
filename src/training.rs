// Данный модуль строит входной конвейер для обучения и оценки. Сначала записи всех задач
// кодируются и сохраняются (повторный вызов ничего не перезаписывает), затем читаются
// наборы данных задач, объединяются равномерной случайной выборкой по задачам,
// перемешиваются (только при обучении), предвыбираются в фоновом потоке и собираются
// в батчи: корзинами по длине при динамическом заполнении или батчами фиксированного
// размера, где батч оценки вдвое больше батча обучения. Каждый вызов в режиме обучения
// - новая эпоха со своим порядком выборки; порядок оценки зависит только от seed.

use crate::{
    config::{InputConfig, Mode},
    data_processing::{
        read_records, tokenizer_or_load, write_records, BucketBySequenceLength, FeatureBatch,
        Features, FixedBatches, MultitaskBatch, Prefetch, ShuffleBuffer, Task, TaskSampler,
        Tokenizer,
    },
    error::{Error, Result},
};
use burn::tensor::backend::Backend;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// Число уже построенных эпох обучения в процессе
static TRAIN_EPOCHS: AtomicU64 = AtomicU64::new(0);

/// Seed для выборки и перемешивания: при обучении смещается номером эпохи
fn epoch_seed(config: &InputConfig, mode: Mode) -> u64 {
    match mode {
        Mode::Train => {
            let epoch = TRAIN_EPOCHS.fetch_add(1, Ordering::Relaxed);
            config
                .seed
                .wrapping_add(epoch.wrapping_mul(0x9E37_79B9_7F4A_7C15))
        }
        Mode::Eval | Mode::Predict => config.seed,
    }
}

/// Ленивый поток батчей признаков для цикла обучения. Ошибка чтения записи
/// отдается как Err, после нее поток следует остановить.
pub struct InputPipeline {
    batches: Box<dyn Iterator<Item = Result<FeatureBatch>> + Send>,
    mode: Mode,
}

impl InputPipeline {
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Переводит поток в батчи тензоров на устройстве
    pub fn into_tensors<B: Backend>(
        self,
        device: B::Device,
    ) -> impl Iterator<Item = Result<MultitaskBatch<B>>> {
        self.map(move |batch| batch.map(|batch| batch.to_tensors(&device)))
    }
}

impl Iterator for InputPipeline {
    type Item = Result<FeatureBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.batches.next()
    }
}

// Define train/eval input function
pub fn train_eval_input_fn(
    config: &InputConfig,                 // Конфигурация конвейера
    tasks: &[Arc<dyn Task>],              // Задачи многозадачного обучения
    tokenizer: Option<Arc<dyn Tokenizer>>, // Токенизатор, по умолчанию из vocab_file
    mode: Mode,                           // Train или Eval
) -> Result<InputPipeline> {
    if mode == Mode::Predict {
        return Err(Error::UnsupportedMode(mode.to_string()));
    }
    config.validate()?;
    let tokenizer = tokenizer_or_load(tokenizer, &config.vocab_file)?;
    let pad_id = tokenizer.pad_token();

    // Записываем и читаем записи задач
    write_records(config, tasks, tokenizer)?;
    let records = read_records(config, tasks, mode)?;
    let total: usize = records.iter().map(|task| task.dataset.len()).sum();
    tracing::info!(%mode, tasks = records.len(), records = total, "building input pipeline");

    // Выборка по задачам, перемешивание только при обучении
    let seed = epoch_seed(config, mode);
    tracing::debug!(%mode, seed, "sampling seed");
    let sampled = TaskSampler::new(records, seed);
    let stream: Box<dyn Iterator<Item = Result<Features>> + Send> = match mode {
        Mode::Train => Box::new(ShuffleBuffer::new(
            sampled,
            config.shuffle_buffer,
            seed.wrapping_add(1),
        )),
        _ => Box::new(sampled),
    };
    let prefetched = Prefetch::new(stream, config.prefetch_size)?;

    // Группируем в батчи
    let batches: Box<dyn Iterator<Item = Result<FeatureBatch>> + Send> =
        if config.dynamic_padding {
            Box::new(
                BucketBySequenceLength::new(
                    prefetched,
                    config.bucket_boundaries.clone(),
                    config.bucket_batch_sizes.clone(),
                )
                .map(move |items| items.map(|items| FeatureBatch::pad(items, pad_id))),
            )
        } else {
            Box::new(
                FixedBatches::new(prefetched, config.batch_size_for(mode)).map(move |items| {
                    items
                        .into_iter()
                        .collect::<Result<Vec<_>>>()
                        .map(|items| FeatureBatch::pad(items, pad_id))
                }),
            )
        };

    Ok(InputPipeline { batches, mode })
}
