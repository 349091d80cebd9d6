use serde::Serialize;
use tracing::info;

use super::{Quiz, QuizQuestion};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Correct,
    Wrong,
    Unanswered,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scorecard {
    pub outcomes: Vec<Outcome>,
    pub score: usize,
    pub total: usize,
}

impl Scorecard {
    pub fn is_perfect(&self) -> bool { self.total > 0 && self.score == self.total }
}

fn judge(question: &QuizQuestion, selection: Option<&str>) -> Outcome {
    match selection {
        None => Outcome::Unanswered,
        Some(s) if question.answers.iter().any(|a| a.correct && a.answer == s) => Outcome::Correct,
        Some(_) => Outcome::Wrong,
    }
}

/// Scores `selections` positionally against `questions`. Missing trailing
/// selections count as unanswered; extra ones are ignored.
pub fn grade(questions: &[QuizQuestion], selections: &[Option<String>]) -> Scorecard {
    let outcomes: Vec<Outcome> = questions
        .iter()
        .enumerate()
        .map(|(i, q)| judge(q, selections.get(i).and_then(|s| s.as_deref())))
        .collect();
    let score = outcomes.iter().filter(|o| **o == Outcome::Correct).count();
    Scorecard { outcomes, score, total: questions.len() }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// First perfect submission.
    Perfect { score: usize, total: usize },
    Retry { score: usize, total: usize },
}

/// One player's attempt at a generated quiz.
#[derive(Debug, Clone)]
pub struct QuizAttempt {
    quiz: Quiz,
    acknowledged: bool,
}

impl QuizAttempt {
    pub fn new(quiz: Quiz) -> Self {
        Self { quiz, acknowledged: false }
    }

    pub fn submit_enabled(&self) -> bool { !self.acknowledged }

    pub fn grade(&self, selections: &[Option<String>]) -> Scorecard {
        grade(&self.quiz.questions, selections)
    }

    pub fn submit(&mut self, selections: &[Option<String>]) -> anyhow::Result<SubmitOutcome> {
        if self.acknowledged {
            anyhow::bail!("quiz already completed");
        }
        let card = self.grade(selections);
        if card.is_perfect() {
            self.acknowledged = true;
            info!(score = card.score, total = card.total, "perfect quiz score");
            Ok(SubmitOutcome::Perfect { score: card.score, total: card.total })
        } else {
            Ok(SubmitOutcome::Retry { score: card.score, total: card.total })
        }
    }
}

impl SubmitOutcome {
    pub fn message(&self) -> String {
        match self {
            SubmitOutcome::Perfect { .. } => "Perfect score. Congratulations!".to_string(),
            SubmitOutcome::Retry { score, total } => format!("Correct answers: {} / {}. Try again!", score, total),
        }
    }
}
