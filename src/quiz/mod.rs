pub mod evaluator;
pub mod generator;

use serde::{Deserialize, Serialize};

pub use evaluator::{QuizAttempt, Scorecard, SubmitOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    #[default]
    Easy,
    Hard,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Hard => "hard",
        }
    }
}

/// Memoization key for a generated quiz. `topic` is the file name or the
/// encyclopedia search term.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuizKey {
    pub topic: String,
    pub count: u8,
    pub difficulty: Difficulty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub answer: String,
    pub correct: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizQuestion {
    pub question: String,
    pub answers: Vec<Answer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quiz {
    pub questions: Vec<QuizQuestion>,
}

/// A question as shown to the player, without correctness flags.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublicQuestion {
    pub number: usize,
    pub question: String,
    pub answers: Vec<String>,
}

impl Quiz {
    pub fn total(&self) -> usize { self.questions.len() }

    pub fn public_view(&self) -> Vec<PublicQuestion> {
        self.questions
            .iter()
            .enumerate()
            .map(|(i, q)| PublicQuestion {
                number: i + 1,
                question: q.question.clone(),
                answers: q.answers.iter().map(|a| a.answer.clone()).collect(),
            })
            .collect()
    }
}
