// Модуль кодирования признаков BERT. Сырой вход (текст, пара текстов, список слов или
// мультимодальный пример) проходит цепочку: токенизация с выравниванием меток,
// усечение пары до максимальной длины, вставка [CLS]/[SEP], построение маски и заполнение.
// Результат - словарь признаков Features, который пишется в файлы записей или сразу
// собирается в батч.

use super::tokenizer::{Tokenizer, CLS_TOKEN, SEP_TOKEN};
use crate::error::{Error, Result};
use derive_new::new;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const INPUT_IDS: &str = "input_ids";
pub const INPUT_MASK: &str = "input_mask";
pub const SEGMENT_IDS: &str = "segment_ids";

/// Закодированный пример: имя признака -> последовательность чисел
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Features {
    pub input_ids: Vec<i64>,
    pub input_mask: Vec<i64>,
    pub segment_ids: Vec<i64>,
    /// Метки задач, множители потерь, маски модальностей
    pub int_features: BTreeMap<String, Vec<i64>>,
    /// Входы модальностей, [строки, размерность]
    pub float_features: BTreeMap<String, Vec<Vec<f32>>>,
}

impl Features {
    /// Полный набор ключей примера в стабильном порядке.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = [INPUT_IDS, INPUT_MASK, SEGMENT_IDS]
            .iter()
            .map(|key| key.to_string())
            .chain(self.int_features.keys().cloned())
            .chain(self.float_features.keys().cloned())
            .collect();
        keys.sort();
        keys
    }
}

/// Ключ длины для динамического заполнения: длина input_ids.
pub fn element_length(features: &Features) -> usize {
    features.input_ids.len()
}

/// Проверяет, что у всех примеров тот же набор ключей, что и у первого,
/// и что строки каждого входа модальности одной ширины.
pub fn ensure_consistent(features: &[Features]) -> Result<()> {
    let Some(first) = features.first() else {
        return Ok(());
    };
    let expected = first.keys();
    let mut widths = BTreeMap::new();
    for (index, item) in features.iter().enumerate() {
        let found = item.keys();
        if found != expected {
            return Err(Error::InconsistentFeatures {
                index,
                expected,
                found,
            });
        }
        check_modal_widths(&mut widths, item)?;
    }
    Ok(())
}

/// Сверяет ширину строк входов модальностей с уже встреченной для того же ключа.
pub fn check_modal_widths(widths: &mut BTreeMap<String, usize>, item: &Features) -> Result<()> {
    for (key, rows) in &item.float_features {
        for row in rows {
            let expected = *widths.entry(key.clone()).or_insert(row.len());
            if row.len() != expected {
                return Err(Error::ModalityWidth {
                    key: key.clone(),
                    expected,
                    found: row.len(),
                });
            }
        }
    }
    Ok(())
}

/// Мультимодальный пример: текст и матрицы признаков других модальностей
#[derive(new, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MultimodalInput {
    pub text: String,
    pub modalities: BTreeMap<String, Vec<Vec<f32>>>,
}

/// Сырой вход для кодирования
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ExampleInput {
    Text(String),
    TextPair { a: String, b: String },
    /// Заранее разбитые слова, для задач разметки последовательностей
    Words(Vec<String>),
    Multimodal(MultimodalInput),
}

impl ExampleInput {
    pub fn is_multimodal(&self) -> bool {
        matches!(self, ExampleInput::Multimodal(_))
    }
}

impl From<&str> for ExampleInput {
    fn from(text: &str) -> Self {
        ExampleInput::Text(text.to_string())
    }
}

impl From<String> for ExampleInput {
    fn from(text: String) -> Self {
        ExampleInput::Text(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProblemType {
    /// Классификация всего примера
    Cls,
    /// Метка на каждый токен
    SeqTag,
}

impl ProblemType {
    /// Проверяет, что вид метки соответствует типу задачи.
    pub fn check_target(self, target: &Target, task: &str) -> Result<()> {
        match (self, target) {
            (ProblemType::Cls, Target::Class(_)) | (ProblemType::SeqTag, Target::Sequence(_)) => {
                Ok(())
            }
            (ProblemType::Cls, Target::Sequence(_)) => Err(Error::TargetMismatch {
                task: task.to_string(),
                expected: "class",
            }),
            (ProblemType::SeqTag, Target::Class(_)) => Err(Error::TargetMismatch {
                task: task.to_string(),
                expected: "sequence",
            }),
        }
    }
}

/// Закодированная метка примера
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Target {
    Class(i64),
    /// Метка на каждое слово входа
    Sequence(Vec<i64>),
}

/// Имя признака меток задачи.
pub fn label_key(task: &str) -> String {
    format!("{task}_label_ids")
}

/// Имя признака множителя потерь задачи.
pub fn loss_multiplier_key(task: &str) -> String {
    format!("{task}_loss_multiplier")
}

/// Склеивает подряд идущие латинские буквы и цифры в один фрагмент,
/// остальные символы становятся отдельными фрагментами. `]` приклеивается
/// к фрагменту, который идет прямо перед ней, пробелы отбрасываются.
pub fn cluster_alphanumeric(text: &str) -> Vec<String> {
    let mut pieces: Vec<String> = Vec::new();
    let mut last_is_alphanumeric = false;

    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() || ch == '[' {
            match pieces.last_mut() {
                Some(last) if last_is_alphanumeric => last.push(ch),
                _ => pieces.push(ch.to_string()),
            }
            last_is_alphanumeric = true;
        } else if ch == ']' {
            match pieces.last_mut() {
                Some(last) if last_is_alphanumeric => last.push(ch),
                _ => pieces.push(ch.to_string()),
            }
            last_is_alphanumeric = false;
        } else if ch.is_whitespace() {
            last_is_alphanumeric = false;
        } else {
            pieces.push(ch.to_string());
            last_is_alphanumeric = false;
        }
    }
    pieces
}

/// Токенизирует каждый фрагмент. Метка фрагмента повторяется для каждого его подтокена.
pub fn tokenize_with_target(
    tokenizer: &dyn Tokenizer,
    pieces: &[String],
    target: Option<&[i64]>,
) -> Result<(Vec<String>, Option<Vec<i64>>)> {
    let mut tokens = Vec::new();
    let mut aligned = target.map(|_| Vec::new());

    for (index, piece) in pieces.iter().enumerate() {
        let sub_tokens = tokenizer.tokenize(piece)?;
        if let (Some(aligned), Some(target)) = (aligned.as_mut(), target) {
            let label = target.get(index).copied().unwrap_or(0);
            aligned.extend(std::iter::repeat(label).take(sub_tokens.len()));
        }
        tokens.extend(sub_tokens);
    }
    Ok((tokens, aligned))
}

/// Усекает пару так, чтобы вместе со служебными токенами она помещалась в max_len.
/// Токены снимаются с конца более длинной части; метки следуют за частью `a`.
pub fn truncate_seq_pair(
    tokens_a: &mut Vec<String>,
    mut tokens_b: Option<&mut Vec<String>>,
    target: Option<&mut Vec<i64>>,
    max_len: usize,
) {
    let reserved = if tokens_b.is_some() { 3 } else { 2 };
    let budget = max_len.saturating_sub(reserved);

    loop {
        let len_b = tokens_b.as_ref().map_or(0, |b| b.len());
        if tokens_a.len() + len_b <= budget {
            break;
        }
        match tokens_b.as_mut() {
            Some(b) if b.len() >= tokens_a.len() => {
                b.pop();
            }
            _ => {
                tokens_a.pop();
            }
        }
    }

    if let Some(target) = target {
        target.truncate(tokens_a.len());
    }
}

/// Вставляет [CLS] и [SEP]. Возвращает токены, идентификаторы сегментов и
/// метки, дополненные нулем на позициях служебных токенов.
pub fn add_special_tokens(
    tokens_a: Vec<String>,
    tokens_b: Option<Vec<String>>,
    target: Option<Vec<i64>>,
) -> (Vec<String>, Vec<i64>, Option<Vec<i64>>) {
    let mut tokens = Vec::with_capacity(tokens_a.len() + 3);
    tokens.push(CLS_TOKEN.to_string());
    tokens.extend(tokens_a);
    tokens.push(SEP_TOKEN.to_string());
    let mut segment_ids = vec![0; tokens.len()];

    if let Some(tokens_b) = tokens_b {
        let len_b = tokens_b.len() + 1;
        tokens.extend(tokens_b);
        tokens.push(SEP_TOKEN.to_string());
        segment_ids.extend(std::iter::repeat(1).take(len_b));
    }

    let target = target.map(|labels| {
        let mut padded = Vec::with_capacity(tokens.len());
        padded.push(0);
        padded.extend(labels);
        padded.resize(tokens.len(), 0);
        padded
    });

    (tokens, segment_ids, target)
}

/// Строит маску и, если нужно, дополняет все последовательности до max_len.
pub fn create_mask_and_padding(
    input_ids: &mut Vec<i64>,
    segment_ids: &mut Vec<i64>,
    target: Option<&mut Vec<i64>>,
    pad_id: i64,
    max_len: Option<usize>,
) -> Vec<i64> {
    let mut input_mask = vec![1; input_ids.len()];
    if let Some(max_len) = max_len {
        input_ids.resize(max_len.max(input_ids.len()), pad_id);
        input_mask.resize(input_ids.len(), 0);
        segment_ids.resize(input_ids.len(), 0);
        if let Some(target) = target {
            target.resize(input_ids.len(), 0);
        }
    }
    input_mask
}

/// Кодировщик признаков BERT
#[derive(new, Clone)]
pub struct FeatureEncoder {
    tokenizer: Arc<dyn Tokenizer>, // Токенизатор для разбиения текста
    max_seq_len: usize,            // Максимальная длина с учетом служебных токенов
    pad: bool,                     // Дополнять ли до max_seq_len
}

impl FeatureEncoder {
    /// Кодирует вход без меток.
    pub fn encode(&self, input: &ExampleInput) -> Result<Features> {
        self.encode_labeled(input, None, "")
    }

    /// Кодирует вход и метку задачи `task`.
    pub fn encode_labeled(
        &self,
        input: &ExampleInput,
        target: Option<&Target>,
        task: &str,
    ) -> Result<Features> {
        match input {
            // Метки последовательности выравниваются по словам текста
            ExampleInput::Text(text) if matches!(target, Some(Target::Sequence(_))) => {
                let words: Vec<String> = text.split_whitespace().map(str::to_string).collect();
                self.encode_pieces(&words, None, target, task)
            }
            ExampleInput::Text(text) => {
                self.encode_pieces(std::slice::from_ref(text), None, target, task)
            }
            ExampleInput::TextPair { a, b } => {
                if matches!(target, Some(Target::Sequence(_))) {
                    return Err(Error::TargetMismatch {
                        task: task.to_string(),
                        expected: "class",
                    });
                }
                self.encode_pieces(std::slice::from_ref(a), Some(b), target, task)
            }
            ExampleInput::Words(words) => self.encode_pieces(words, None, target, task),
            ExampleInput::Multimodal(input) => self.encode_multimodal(input, target, task),
        }
    }

    /// Кодирует заранее разбитые фрагменты одного предложения (путь сервинга).
    pub fn encode_pieces(
        &self,
        pieces: &[String],
        text_b: Option<&String>,
        target: Option<&Target>,
        task: &str,
    ) -> Result<Features> {
        let sequence_target = match target {
            Some(Target::Sequence(labels)) => Some(labels.as_slice()),
            _ => None,
        };
        let (mut tokens_a, mut seq_target) =
            tokenize_with_target(self.tokenizer.as_ref(), pieces, sequence_target)?;
        let mut tokens_b = match text_b {
            Some(text) => Some(self.tokenizer.tokenize(text)?),
            None => None,
        };

        truncate_seq_pair(
            &mut tokens_a,
            tokens_b.as_mut(),
            seq_target.as_mut(),
            self.max_seq_len,
        );
        let (tokens, mut segment_ids, mut seq_target) =
            add_special_tokens(tokens_a, tokens_b, seq_target);

        let mut input_ids = self.tokenizer.convert_tokens_to_ids(&tokens);
        let input_mask = create_mask_and_padding(
            &mut input_ids,
            &mut segment_ids,
            seq_target.as_mut(),
            self.tokenizer.pad_token(),
            self.pad.then_some(self.max_seq_len),
        );

        let mut features = Features {
            input_ids,
            input_mask,
            segment_ids,
            ..Default::default()
        };
        match (target, seq_target) {
            (Some(Target::Class(label)), _) => {
                features.int_features.insert(label_key(task), vec![*label]);
            }
            (Some(Target::Sequence(_)), Some(labels)) => {
                features.int_features.insert(label_key(task), labels);
            }
            _ => {}
        }
        Ok(features)
    }

    fn encode_multimodal(
        &self,
        input: &MultimodalInput,
        target: Option<&Target>,
        task: &str,
    ) -> Result<Features> {
        if matches!(target, Some(Target::Sequence(_))) {
            return Err(Error::TargetMismatch {
                task: task.to_string(),
                expected: "class",
            });
        }
        let mut widths = BTreeMap::new();
        for (name, rows) in &input.modalities {
            for row in rows {
                let expected = *widths.entry(name.as_str()).or_insert(row.len());
                if row.len() != expected {
                    return Err(Error::ModalityWidth {
                        key: name.clone(),
                        expected,
                        found: row.len(),
                    });
                }
            }
        }
        let mut features =
            self.encode_pieces(std::slice::from_ref(&input.text), None, target, task)?;

        for (index, (name, rows)) in input.modalities.iter().enumerate() {
            let segment_id = index as i64 + 1;
            features
                .int_features
                .insert(format!("{name}_mask"), vec![1; rows.len()]);
            features
                .int_features
                .insert(format!("{name}_segment_ids"), vec![segment_id; rows.len()]);
            features
                .float_features
                .insert(format!("{name}_input"), rows.clone());
        }
        Ok(features)
    }
}
