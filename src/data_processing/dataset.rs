// Задачи многозадачного обучения. Каждая задача имеет имя, тип проблемы и источник
// размеченных примеров для разделов train и eval. InMemoryTask - простая реализация
// поверх векторов примеров; реальные задачи могут читать данные откуда угодно,
// реализуя трейт Task.

use super::features::{ExampleInput, ProblemType, Target};
use crate::config::Mode;
use crate::error::{Error, Result};
use derive_new::new;
use serde::{Deserialize, Serialize};

// Структура для размеченного примера
#[derive(new, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LabeledExample {
    pub input: ExampleInput, // Сырой вход
    pub target: Target,      // Закодированная метка
}

// Трейт для задач многозадачного обучения
pub trait Task: Send + Sync {
    fn name(&self) -> &str; // Имя задачи, из него строятся имена файлов и признаков
    fn problem_type(&self) -> ProblemType; // Классификация или разметка последовательности
    fn examples(&self, mode: Mode) -> Result<Vec<LabeledExample>>; // Примеры раздела
}

/// Задача с примерами в памяти
#[derive(new, Clone, Debug)]
pub struct InMemoryTask {
    name: String,
    problem_type: ProblemType,
    train: Vec<LabeledExample>,
    eval: Vec<LabeledExample>,
}

impl Task for InMemoryTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn problem_type(&self) -> ProblemType {
        self.problem_type
    }

    /// Возвращает примеры раздела; у режима predict раздела нет
    fn examples(&self, mode: Mode) -> Result<Vec<LabeledExample>> {
        match mode {
            Mode::Train => Ok(self.train.clone()),
            Mode::Eval => Ok(self.eval.clone()),
            Mode::Predict => Err(Error::UnsupportedMode(mode.to_string())),
        }
    }
}
