// Хранилище закодированных записей. Для каждой задачи примеры кодируются один раз и
// сохраняются в файл SQLite burn (разделы train и eval) рядом с JSON-файлом метаданных.
// Запись идемпотентна: действительные файлы не перезаписываются. При чтении каждый
// набор оборачивается в MapperDataset, который дополняет метки всех задач, чтобы
// записи разных задач имели одинаковый набор ключей.

use super::dataset::Task;
use super::features::{
    check_modal_widths, label_key, loss_multiplier_key, FeatureEncoder, Features, ProblemType,
};
use super::tokenizer::Tokenizer;
use crate::config::{InputConfig, Mode};
use crate::error::{Error, Result};
use burn::data::dataset::transform::{Mapper, MapperDataset};
use burn::data::dataset::{Dataset, InMemDataset, SqliteDataset, SqliteDatasetWriter};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strum::IntoEnumIterator;

/// Метаданные файла записей задачи
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordMeta {
    pub task: String,
    pub problem_type: ProblemType,
    pub max_seq_len: usize,
    pub padded: bool,
    /// Число записей в каждом разделе
    pub counts: BTreeMap<String, usize>,
}

/// Записи одной задачи для одного режима
pub struct TaskRecords {
    pub name: String,
    pub dataset: Arc<dyn Dataset<Features>>,
}

pub fn record_path(config: &InputConfig, task: &str) -> PathBuf {
    Path::new(&config.data_dir).join(format!("{task}.db"))
}

pub fn meta_path(config: &InputConfig, task: &str) -> PathBuf {
    Path::new(&config.data_dir).join(format!("{task}.meta.json"))
}

fn record_splits() -> impl Iterator<Item = Mode> {
    Mode::iter().filter(|mode| *mode != Mode::Predict)
}

fn load_meta(config: &InputConfig, task: &str) -> Result<RecordMeta> {
    let raw = fs::read_to_string(meta_path(config, task))?;
    Ok(serde_json::from_str(&raw)?)
}

/// Действительны ли записи задачи для текущей конфигурации
fn records_valid(config: &InputConfig, task: &dyn Task) -> bool {
    let Ok(meta) = load_meta(config, task.name()) else {
        return false;
    };
    if meta.problem_type != task.problem_type()
        || meta.max_seq_len != config.max_seq_len
        || meta.padded == config.dynamic_padding
    {
        return false;
    }
    let db = record_path(config, task.name());
    meta.counts.iter().all(|(split, count)| {
        *count == 0 || SqliteDataset::<Features>::from_db_file(&db, split).is_ok()
    })
}

/// Кодирует и сохраняет примеры всех задач. Задачи с действительными записями пропускаются.
pub fn write_records(
    config: &InputConfig,
    tasks: &[Arc<dyn Task>],
    tokenizer: Arc<dyn Tokenizer>,
) -> Result<()> {
    fs::create_dir_all(&config.data_dir)?;
    let encoder = FeatureEncoder::new(tokenizer, config.max_seq_len, !config.dynamic_padding);

    for task in tasks {
        if records_valid(config, task.as_ref()) {
            tracing::info!(task = task.name(), "records already exist, skipping");
            continue;
        }
        write_task(config, task.as_ref(), &encoder)?;
    }
    Ok(())
}

fn write_task(config: &InputConfig, task: &dyn Task, encoder: &FeatureEncoder) -> Result<()> {
    let db = record_path(config, task.name());
    let mut writer = SqliteDatasetWriter::<Features>::new(&db, true)
        .map_err(|err| Error::Records(format!("{}: {err}", db.display())))?;

    let mut counts = BTreeMap::new();
    let mut widths = BTreeMap::new();
    for mode in record_splits() {
        let examples = task.examples(mode)?;
        for example in &examples {
            task.problem_type()
                .check_target(&example.target, task.name())?;
            let features =
                encoder.encode_labeled(&example.input, Some(&example.target), task.name())?;
            check_modal_widths(&mut widths, &features)?;
            writer
                .write(mode.as_ref(), &features)
                .map_err(|err| Error::Records(err.to_string()))?;
        }
        tracing::debug!(task = task.name(), split = %mode, count = examples.len(), "encoded split");
        counts.insert(mode.to_string(), examples.len());
    }
    writer
        .set_completed()
        .map_err(|err| Error::Records(err.to_string()))?;

    let meta = RecordMeta {
        task: task.name().to_string(),
        problem_type: task.problem_type(),
        max_seq_len: config.max_seq_len,
        padded: !config.dynamic_padding,
        counts,
    };
    fs::write(meta_path(config, task.name()), serde_json::to_string_pretty(&meta)?)?;
    tracing::info!(task = task.name(), path = %db.display(), "wrote records");
    Ok(())
}

/// Дополняет запись метками и множителями потерь всех задач
#[derive(Clone, Debug)]
struct TargetFiller {
    task: String,
    tasks: Vec<(String, ProblemType)>,
}

impl Mapper<Features, Features> for TargetFiller {
    fn map(&self, item: &Features) -> Features {
        let mut item = item.clone();
        for (name, problem_type) in &self.tasks {
            let own = *name == self.task;
            if !own {
                let zeros = match problem_type {
                    ProblemType::Cls => vec![0],
                    ProblemType::SeqTag => vec![0; item.input_ids.len()],
                };
                item.int_features.insert(label_key(name), zeros);
            }
            item.int_features
                .insert(loss_multiplier_key(name), vec![i64::from(own)]);
        }
        item
    }
}

/// Открывает записи всех задач для режима. Наборы данных ленивые: записи
/// читаются из SQLite по индексу.
pub fn read_records(
    config: &InputConfig,
    tasks: &[Arc<dyn Task>],
    mode: Mode,
) -> Result<Vec<TaskRecords>> {
    if mode == Mode::Predict {
        return Err(Error::UnsupportedMode(mode.to_string()));
    }
    let all_tasks: Vec<(String, ProblemType)> = tasks
        .iter()
        .map(|task| (task.name().to_string(), task.problem_type()))
        .collect();

    tasks
        .iter()
        .map(|task| {
            let meta = load_meta(config, task.name())?;
            let split: &str = mode.as_ref();
            let count = meta.counts.get(split).copied().unwrap_or(0);
            let filler = TargetFiller {
                task: task.name().to_string(),
                tasks: all_tasks.clone(),
            };

            let dataset: Arc<dyn Dataset<Features>> = if count == 0 {
                Arc::new(MapperDataset::<_, _, Features>::new(
                    InMemDataset::<Features>::new(Vec::new()),
                    filler,
                ))
            } else {
                let db = record_path(config, task.name());
                let records = SqliteDataset::<Features>::from_db_file(&db, split)
                    .map_err(|err| Error::Records(format!("{}: {err}", db.display())))?;
                Arc::new(MapperDataset::<_, _, Features>::new(records, filler))
            };
            tracing::debug!(task = task.name(), %mode, records = dataset.len(), "opened records");

            Ok(TaskRecords {
                name: task.name().to_string(),
                dataset,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_processing::dataset::{InMemoryTask, LabeledExample};
    use crate::data_processing::features::{ExampleInput, Target};
    use crate::data_processing::tokenizer::test_utils::WhitespaceTokenizer;

    fn tasks() -> Vec<Arc<dyn Task>> {
        let cls = InMemoryTask::new(
            "topic".to_string(),
            ProblemType::Cls,
            vec![
                LabeledExample::new(ExampleInput::from("hello world"), Target::Class(1)),
                LabeledExample::new(ExampleInput::from("rust is fast"), Target::Class(0)),
            ],
            vec![],
        );
        let ner = InMemoryTask::new(
            "ner".to_string(),
            ProblemType::SeqTag,
            vec![LabeledExample::new(
                ExampleInput::Words(vec!["hello".into(), "rust".into()]),
                Target::Sequence(vec![1, 2]),
            )],
            vec![LabeledExample::new(
                ExampleInput::Words(vec!["a".into()]),
                Target::Sequence(vec![3]),
            )],
        );
        let cls: Arc<dyn Task> = Arc::new(cls);
        let ner: Arc<dyn Task> = Arc::new(ner);
        vec![cls, ner]
    }

    fn config(dir: &Path) -> InputConfig {
        InputConfig::new("unused".to_string(), dir.to_string_lossy().into_owned())
            .with_max_seq_len(8)
    }

    #[test]
    fn writes_and_reads_unified_records() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let tasks = tasks();
        write_records(&config, &tasks, Arc::new(WhitespaceTokenizer::new())).unwrap();

        assert!(record_path(&config, "topic").exists());
        let meta = load_meta(&config, "ner").unwrap();
        assert_eq!(meta.counts["train"], 1);
        assert_eq!(meta.counts["eval"], 1);

        let records = read_records(&config, &tasks, Mode::Train).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].dataset.len(), 2);

        let topic = records[0].dataset.get(0).unwrap();
        assert_eq!(topic.int_features["topic_label_ids"], vec![1]);
        assert_eq!(topic.int_features["ner_label_ids"], vec![0; 8]);
        assert_eq!(topic.int_features["topic_loss_multiplier"], vec![1]);
        assert_eq!(topic.int_features["ner_loss_multiplier"], vec![0]);

        let ner = records[1].dataset.get(0).unwrap();
        assert_eq!(ner.keys(), topic.keys());
        assert_eq!(ner.int_features["topic_label_ids"], vec![0]);
    }

    #[test]
    fn empty_split_reads_as_empty_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let tasks = tasks();
        write_records(&config, &tasks, Arc::new(WhitespaceTokenizer::new())).unwrap();

        let records = read_records(&config, &tasks, Mode::Eval).unwrap();
        assert!(records[0].dataset.is_empty());
        assert_eq!(records[1].dataset.len(), 1);
    }

    #[test]
    fn second_write_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let tasks = tasks();
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(WhitespaceTokenizer::new());

        write_records(&config, &tasks, tokenizer.clone()).unwrap();
        let written = fs::metadata(meta_path(&config, "topic"))
            .unwrap()
            .modified()
            .unwrap();
        write_records(&config, &tasks, tokenizer).unwrap();
        let after = fs::metadata(meta_path(&config, "topic"))
            .unwrap()
            .modified()
            .unwrap();
        assert_eq!(written, after);
    }

    fn single_task(problem_type: ProblemType, example: LabeledExample) -> Vec<Arc<dyn Task>> {
        let task: Arc<dyn Task> = Arc::new(InMemoryTask::new(
            "ner".to_string(),
            problem_type,
            vec![example],
            vec![],
        ));
        vec![task]
    }

    #[test]
    fn rejects_class_target_for_tagging_task() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = single_task(
            ProblemType::SeqTag,
            LabeledExample::new(
                ExampleInput::Words(vec!["hello".into()]),
                Target::Class(2),
            ),
        );
        let result = write_records(
            &config(dir.path()),
            &tasks,
            Arc::new(WhitespaceTokenizer::new()),
        );
        assert!(matches!(
            result,
            Err(Error::TargetMismatch { expected: "sequence", .. })
        ));
        assert!(!meta_path(&config(dir.path()), "ner").exists());
    }

    #[test]
    fn rejects_sequence_target_for_classification_task() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = single_task(
            ProblemType::Cls,
            LabeledExample::new(ExampleInput::from("hello"), Target::Sequence(vec![1])),
        );
        let result = write_records(
            &config(dir.path()),
            &tasks,
            Arc::new(WhitespaceTokenizer::new()),
        );
        assert!(matches!(
            result,
            Err(Error::TargetMismatch { expected: "class", .. })
        ));
    }

    #[test]
    fn tagging_text_is_labeled_per_word() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let tasks = single_task(
            ProblemType::SeqTag,
            LabeledExample::new(
                ExampleInput::from("rust is fast"),
                Target::Sequence(vec![1, 0, 2]),
            ),
        );
        write_records(&config, &tasks, Arc::new(WhitespaceTokenizer::new())).unwrap();

        let records = read_records(&config, &tasks, Mode::Train).unwrap();
        let record = records[0].dataset.get(0).unwrap();
        assert_eq!(
            record.int_features["ner_label_ids"],
            vec![0, 1, 0, 2, 0, 0, 0, 0]
        );
    }

    #[test]
    fn changed_padding_invalidates_records() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let tasks = tasks();
        write_records(&config, &tasks, Arc::new(WhitespaceTokenizer::new())).unwrap();

        let dynamic = config.clone().with_dynamic_padding(true);
        assert!(!records_valid(&dynamic, tasks[0].as_ref()));
        write_records(&dynamic, &tasks, Arc::new(WhitespaceTokenizer::new())).unwrap();

        let records = read_records(&dynamic, &tasks, Mode::Train).unwrap();
        let first = records[0].dataset.get(0).unwrap();
        assert_eq!(first.input_ids.len(), 4);
    }
}
