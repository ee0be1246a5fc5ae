// Ленивые адаптеры потока записей для конвейера обучения и оценки: выборка из задач,
// буфер перемешивания, фоновая предвыборка и два способа группировки в батчи -
// фиксированный размер и корзины по длине последовательности. Ошибки чтения записей
// идут по потоку как Err, паника фонового потока переносится в поток потребителя.

use super::features::{element_length, Features};
use super::records::TaskRecords;
use crate::error::{Error, Result};
use burn::data::dataset::Dataset;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::panic;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

struct TaskCursor {
    name: String,
    dataset: Arc<dyn Dataset<Features>>,
    position: usize,
}

impl TaskCursor {
    fn exhausted(&self) -> bool {
        self.position >= self.dataset.len()
    }
}

/// Равномерно выбирает задачу среди неисчерпанных и отдает ее следующую запись.
/// Поток заканчивается, когда исчерпаны все задачи. Запись, которую не удалось
/// прочитать, отдается как ошибка.
pub struct TaskSampler {
    cursors: Vec<TaskCursor>,
    rng: StdRng,
}

impl TaskSampler {
    pub fn new(records: Vec<TaskRecords>, seed: u64) -> Self {
        let cursors = records
            .into_iter()
            .map(|task| TaskCursor {
                name: task.name,
                dataset: task.dataset,
                position: 0,
            })
            .collect();
        Self {
            cursors,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Iterator for TaskSampler {
    type Item = Result<Features>;

    fn next(&mut self) -> Option<Self::Item> {
        let active: Vec<usize> = (0..self.cursors.len())
            .filter(|index| !self.cursors[*index].exhausted())
            .collect();
        if active.is_empty() {
            return None;
        }

        let cursor = &mut self.cursors[active[self.rng.gen_range(0..active.len())]];
        let index = cursor.position;
        cursor.position += 1;
        Some(cursor.dataset.get(index).ok_or_else(|| {
            tracing::error!(task = %cursor.name, index, "record could not be read");
            Error::MissingRecord {
                task: cursor.name.clone(),
                index,
            }
        }))
    }
}

/// Перемешивание через буфер фиксированного размера: буфер заполняется из
/// источника, наружу уходит случайный элемент, его место занимает следующий.
pub struct ShuffleBuffer<I: Iterator> {
    source: I,
    buffer: Vec<I::Item>,
    capacity: usize,
    rng: StdRng,
}

impl<I: Iterator> ShuffleBuffer<I> {
    pub fn new(source: I, capacity: usize, seed: u64) -> Self {
        Self {
            source,
            buffer: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl<I: Iterator> Iterator for ShuffleBuffer<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        while self.buffer.len() < self.capacity {
            match self.source.next() {
                Some(item) => self.buffer.push(item),
                None => break,
            }
        }
        if self.buffer.is_empty() {
            return None;
        }
        let index = self.rng.gen_range(0..self.buffer.len());
        Some(self.buffer.swap_remove(index))
    }
}

/// Читает источник в фоновом потоке, держа готовыми до `size` элементов.
/// Поток завершается, когда источник исчерпан или приемник удален. Если источник
/// паникует, паника повторяется в `next`.
pub struct Prefetch<T> {
    receiver: Receiver<T>,
    worker: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Prefetch<T> {
    pub fn new<I>(source: I, size: usize) -> std::io::Result<Self>
    where
        I: Iterator<Item = T> + Send + 'static,
    {
        let (sender, receiver) = mpsc::sync_channel(size.max(1));
        let worker = thread::Builder::new()
            .name("input-prefetch".to_string())
            .spawn(move || {
                for item in source {
                    if sender.send(item).is_err() {
                        break;
                    }
                }
            })?;
        Ok(Self {
            receiver,
            worker: Some(worker),
        })
    }
}

impl<T> Iterator for Prefetch<T> {
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        match self.receiver.recv() {
            Ok(item) => Some(item),
            Err(_) => {
                // Канал закрыт: источник исчерпан или фоновый поток упал
                if let Some(Err(payload)) = self.worker.take().map(JoinHandle::join) {
                    panic::resume_unwind(payload);
                }
                None
            }
        }
    }
}

/// Батчи фиксированного размера, последний неполный батч сохраняется.
pub struct FixedBatches<I> {
    source: I,
    batch_size: usize,
}

impl<I> FixedBatches<I> {
    pub fn new(source: I, batch_size: usize) -> Self {
        Self {
            source,
            batch_size: batch_size.max(1),
        }
    }
}

impl<I: Iterator> Iterator for FixedBatches<I> {
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let batch: Vec<I::Item> = self.source.by_ref().take(self.batch_size).collect();
        (!batch.is_empty()).then_some(batch)
    }
}

/// Группирует записи в корзины по длине input_ids. Корзина `i` содержит длины из
/// `[boundaries[i - 1], boundaries[i])`; батч отдается, когда корзина набирает свой
/// размер, остатки корзин отдаются по порядку после исчерпания источника.
/// Ошибка источника отдается сразу, корзины при этом не сбрасываются.
pub struct BucketBySequenceLength<I> {
    source: I,
    boundaries: Vec<usize>,
    batch_sizes: Vec<usize>,
    buckets: Vec<Vec<Features>>,
    flushed: usize,
}

impl<I> BucketBySequenceLength<I> {
    /// `batch_sizes` должен содержать на один элемент больше, чем `boundaries`.
    pub fn new(source: I, boundaries: Vec<usize>, batch_sizes: Vec<usize>) -> Self {
        let buckets = (0..batch_sizes.len()).map(|_| Vec::new()).collect();
        Self {
            source,
            boundaries,
            batch_sizes,
            buckets,
            flushed: 0,
        }
    }

    fn bucket_for(&self, length: usize) -> usize {
        self.boundaries
            .partition_point(|boundary| *boundary <= length)
            .min(self.buckets.len() - 1)
    }
}

impl<I: Iterator<Item = Result<Features>>> Iterator for BucketBySequenceLength<I> {
    type Item = Result<Vec<Features>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buckets.is_empty() {
            return None;
        }
        while let Some(item) = self.source.next() {
            let item = match item {
                Ok(item) => item,
                Err(err) => return Some(Err(err)),
            };
            let bucket = self.bucket_for(element_length(&item));
            self.buckets[bucket].push(item);
            if self.buckets[bucket].len() >= self.batch_sizes[bucket] {
                return Some(Ok(std::mem::take(&mut self.buckets[bucket])));
            }
        }
        while self.flushed < self.buckets.len() {
            let bucket = std::mem::take(&mut self.buckets[self.flushed]);
            self.flushed += 1;
            if !bucket.is_empty() {
                return Some(Ok(bucket));
            }
        }
        None
    }
}
