use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Instructor,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    Mcq,
    TrueFalse,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

/// Verified caller identity produced by the (out-of-scope) session
/// collaborator and resolved from a bearer token.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: i64,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: i64,
    pub module_id: i64,
    pub text: String,
    pub answer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(rename = "type")]
    pub kind: QuestionType,
    pub difficulty: Difficulty,
    pub created_by: i64,
}

/// Quiz definition. `question_ids` is the immutable creation-time sample in
/// bank order; per-student question sets live only in the selection table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quiz {
    pub id: i64,
    pub module_id: i64,
    pub question_count: usize,
    pub question_type: QuestionType,
    pub question_ids: Vec<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizSelection {
    pub student_id: i64,
    pub quiz_id: i64,
    pub question_ids: Vec<i64>,
    pub selected_at: DateTime<Utc>,
}

/// Most recent score for a (quiz, student) pair. Consumed exactly once by the
/// next difficulty resolution; never an attempt history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizPerformance {
    pub quiz_id: i64,
    pub student_id: i64,
    pub score: f64,
    pub answers: Vec<String>,
    pub attempted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmittedAnswer {
    #[serde(rename = "questionId")]
    pub question_id: i64,
    pub answer: String,
}

/// Durable audit record of a submission, independent of the transient
/// performance row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub id: i64,
    pub user_id: i64,
    pub quiz_id: i64,
    pub answers: Vec<SubmittedAnswer>,
    pub score: f64,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInteraction {
    pub id: i64,
    pub user_id: i64,
    pub course_id: i64,
    pub response_id: i64,
    pub time_spent_minutes: u32,
    pub last_accessed: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Course {
    pub id: i64,
    pub title: String,
    pub owner_id: i64,
    pub enrolled_students: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourseModule {
    pub id: i64,
    pub course_id: i64,
    pub title: String,
}

/// Question as shown to a student: the answer key is never included.
#[derive(Debug, Clone, Serialize)]
pub struct QuestionView {
    #[serde(rename = "questionId")]
    pub question_id: i64,
    #[serde(rename = "questionText")]
    pub text: String,
    #[serde(rename = "type")]
    pub kind: QuestionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

impl QuestionView {
    pub fn from_question(q: &Question) -> Self {
        Self {
            question_id: q.id,
            text: q.text.clone(),
            kind: q.kind,
            options: q.options.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnswerFeedback {
    #[serde(rename = "questionId")]
    pub question_id: i64,
    #[serde(rename = "submittedAnswer")]
    pub submitted_answer: String,
    #[serde(rename = "correctAnswer")]
    pub correct_answer: Option<String>,
    #[serde(rename = "isCorrect")]
    pub is_correct: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionOutcome {
    pub message: &'static str,
    #[serde(rename = "scorePercentage")]
    pub score_percentage: f64,
    pub feedback: Vec<AnswerFeedback>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub field: String,
    pub issue: String,
}

/// Breakpoints for biasing the next selection from the last score.
pub fn difficulty_for_score(score: f64) -> Difficulty {
    if score < 50.0 {
        Difficulty::Easy
    } else if score < 74.0 {
        Difficulty::Medium
    } else {
        Difficulty::Hard
    }
}

/// Display tier for a submission score. The exact-50 case is deliberately a
/// distinct message from the surrounding bands.
pub fn result_message(score: f64) -> &'static str {
    if score < 50.0 {
        "You failed, retake the quiz."
    } else if score == 50.0 {
        "Passed. Barely made it!"
    } else if score <= 75.0 {
        "Good job! Keep improving."
    } else if score <= 90.0 {
        "Great work! You're close to perfection."
    } else {
        "Excellent! You nailed it!"
    }
}

/// Grades a submitted answer set against the answer keys of the student's
/// selection. `total_questions` is the selection size, not the number of
/// submitted answers: omitted questions simply never count as correct.
pub fn grade_submission(
    total_questions: usize,
    answer_keys: &HashMap<i64, String>,
    answers: &[SubmittedAnswer],
) -> (f64, Vec<AnswerFeedback>) {
    let mut correct_count = 0usize;
    let feedback: Vec<AnswerFeedback> = answers
        .iter()
        .map(|submitted| {
            let correct_answer = answer_keys.get(&submitted.question_id).cloned();
            let is_correct = correct_answer.as_deref() == Some(submitted.answer.as_str());
            if is_correct {
                correct_count += 1;
            }
            AnswerFeedback {
                question_id: submitted.question_id,
                submitted_answer: submitted.answer.clone(),
                correct_answer,
                is_correct,
            }
        })
        .collect();

    let score = if total_questions == 0 {
        0.0
    } else {
        correct_count as f64 / total_questions as f64 * 100.0
    };
    (score, feedback)
}

/// True/False answer keys are stored capitalized ("True"/"False") regardless
/// of how the instructor typed them.
pub fn normalize_true_false(raw: &str) -> Option<&'static str> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" => Some("True"),
        "false" => Some("False"),
        _ => None,
    }
}

/// Checks a question's answer/options against its type and returns the
/// normalized answer key to store.
pub fn validate_question(
    kind: QuestionType,
    answer: &str,
    options: Option<&[String]>,
) -> Result<String, Vec<ValidationIssue>> {
    let mut issues = Vec::new();
    match kind {
        QuestionType::TrueFalse => {
            if let Some(normalized) = normalize_true_false(answer) {
                return Ok(normalized.to_string());
            }
            issues.push(ValidationIssue {
                field: "answer".into(),
                issue: "true/false questions require \"True\" or \"False\"".into(),
            });
        }
        QuestionType::Mcq => {
            let opts = options.unwrap_or(&[]);
            if opts.len() < 2 {
                issues.push(ValidationIssue {
                    field: "options".into(),
                    issue: "mcq questions require at least 2 options".into(),
                });
            }
            if !opts.iter().any(|o| o == answer) {
                issues.push(ValidationIssue {
                    field: "answer".into(),
                    issue: "must be one of the options".into(),
                });
            }
            if issues.is_empty() {
                return Ok(answer.to_string());
            }
        }
    }
    Err(issues)
}
