// Данный модуль определяет трейт Tokenizer, общий интерфейс токенизаторов входного конвейера.
// Конкретная реализация BertTokenizer строит токенизатор WordPiece из файла словаря BERT
// с помощью библиотеки tokenizers (нормализация BERT с приведением к нижнему регистру,
// предварительная токенизация BERT, токен [UNK] для неизвестных слов).

use crate::error::{Error, Result};
use std::path::Path;
use std::sync::Arc;
use tokenizers::models::wordpiece::WordPiece;
use tokenizers::normalizers::{BertNormalizer, NormalizerWrapper};
use tokenizers::pre_tokenizers::{bert::BertPreTokenizer, PreTokenizerWrapper};

pub const CLS_TOKEN: &str = "[CLS]";
pub const SEP_TOKEN: &str = "[SEP]";
pub const PAD_TOKEN: &str = "[PAD]";
pub const UNK_TOKEN: &str = "[UNK]";

pub trait Tokenizer: Send + Sync {
    /// Разбивает текст на токены словаря.
    fn tokenize(&self, text: &str) -> Result<Vec<String>>;

    /// Конвертирует токены в идентификаторы, неизвестные токены получают id [UNK].
    fn convert_tokens_to_ids(&self, tokens: &[String]) -> Vec<i64>;

    /// Получает размер словаря токенизатора.
    fn vocab_size(&self) -> usize;

    /// Получает идентификатор токена заполнения.
    fn pad_token(&self) -> i64;
}

/// Токенизатор BERT поверх словаря WordPiece.
pub struct BertTokenizer {
    tokenizer: tokenizers::Tokenizer,
    unk_id: i64,
}

impl BertTokenizer {
    /// Загружает словарь (по одному токену на строку) и собирает токенизатор.
    pub fn from_vocab_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let vocab = path
            .to_str()
            .ok_or_else(|| Error::Tokenizer(format!("non UTF-8 vocab path {}", path.display())))?;

        let model = WordPiece::from_file(vocab)
            .unk_token(UNK_TOKEN.to_string())
            .build()
            .map_err(|err| Error::Tokenizer(format!("cannot load {vocab}: {err}")))?;

        let mut tokenizer = tokenizers::Tokenizer::new(model);
        tokenizer
            .with_normalizer(NormalizerWrapper::from(BertNormalizer::default()))
            .with_pre_tokenizer(PreTokenizerWrapper::from(BertPreTokenizer));

        let unk_id = tokenizer
            .token_to_id(UNK_TOKEN)
            .ok_or_else(|| Error::Tokenizer(format!("{vocab} has no {UNK_TOKEN} token")))?;

        tracing::debug!(vocab, size = tokenizer.get_vocab_size(true), "loaded vocabulary");

        Ok(Self {
            tokenizer,
            unk_id: unk_id as i64,
        })
    }
}

impl Tokenizer for BertTokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<String>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|err| Error::Tokenizer(err.to_string()))?;
        Ok(encoding.get_tokens().to_vec())
    }

    fn convert_tokens_to_ids(&self, tokens: &[String]) -> Vec<i64> {
        tokens
            .iter()
            .map(|token| {
                self.tokenizer
                    .token_to_id(token)
                    .map_or(self.unk_id, |id| id as i64)
            })
            .collect()
    }

    fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    fn pad_token(&self) -> i64 {
        self.tokenizer
            .token_to_id(PAD_TOKEN)
            .map_or(0, |id| id as i64)
    }
}

/// Возвращает переданный токенизатор или загружает BertTokenizer из словаря конфигурации.
pub fn tokenizer_or_load(
    tokenizer: Option<Arc<dyn Tokenizer>>,
    vocab_file: &str,
) -> Result<Arc<dyn Tokenizer>> {
    match tokenizer {
        Some(tokenizer) => Ok(tokenizer),
        None => Ok(Arc::new(BertTokenizer::from_vocab_file(vocab_file)?)),
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use std::collections::HashMap;

    /// Токенизатор по пробелам с фиксированным словарем, для тестов без файлов словаря.
    pub struct WhitespaceTokenizer {
        vocab: HashMap<String, i64>,
    }

    impl WhitespaceTokenizer {
        pub fn new() -> Self {
            let words = [
                PAD_TOKEN, UNK_TOKEN, CLS_TOKEN, SEP_TOKEN, "hello", "world", "rust", "is",
                "fast", "a", "b", "c", "1", "2", "3",
            ];
            let vocab = words
                .iter()
                .enumerate()
                .map(|(id, word)| (word.to_string(), id as i64))
                .collect();
            Self { vocab }
        }
    }

    impl Tokenizer for WhitespaceTokenizer {
        fn tokenize(&self, text: &str) -> Result<Vec<String>> {
            Ok(text.split_whitespace().map(str::to_lowercase).collect())
        }

        fn convert_tokens_to_ids(&self, tokens: &[String]) -> Vec<i64> {
            tokens
                .iter()
                .map(|token| self.vocab.get(token).copied().unwrap_or(1))
                .collect()
        }

        fn vocab_size(&self) -> usize {
            self.vocab.len()
        }

        fn pad_token(&self) -> i64 {
            0
        }
    }
}
