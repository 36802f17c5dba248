use crate::error::EngineError;
use crate::models::{
    grade_submission, validate_question, Course, CourseModule, Difficulty, Identity, Question,
    QuestionType, QuestionView, Quiz, QuizPerformance, QuizSelection, ResponseRecord, Role,
    SubmissionOutcome, SubmittedAnswer, UserInteraction,
};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::fs;
use tokio::sync::RwLock;
use tracing::warn;

/// In-memory tables. Selections and performances are keyed by
/// `(quiz_id, student_id)`: the map key is the uniqueness constraint the
/// selection cache and the consume-once performance row rely on.
pub struct InMemoryDb {
    pub identities: RwLock<HashMap<String, Identity>>,
    pub courses: RwLock<HashMap<i64, Course>>,
    pub modules: RwLock<HashMap<i64, CourseModule>>,
    pub questions: RwLock<HashMap<i64, Question>>,
    pub quizzes: RwLock<HashMap<i64, Quiz>>,
    pub selections: RwLock<HashMap<(i64, i64), QuizSelection>>,
    pub performances: RwLock<HashMap<(i64, i64), QuizPerformance>>,
    pub responses: RwLock<HashMap<i64, ResponseRecord>>,
    pub interactions: RwLock<HashMap<i64, UserInteraction>>,
    // Per-key request counters, kept in the store rather than process
    // statics so they share the lifecycle of the rest of the state.
    pub rate_counters: DashMap<String, (u32, Instant)>,
    next_user_id: AtomicI64,
    next_course_id: AtomicI64,
    next_module_id: AtomicI64,
    next_question_id: AtomicI64,
    next_quiz_id: AtomicI64,
    next_response_id: AtomicI64,
    next_interaction_id: AtomicI64,
}

/// Instructor-authored data survives restarts via a JSON snapshot. Transient
/// per-student tables (selections, performances) are deliberately excluded.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistentSnapshot {
    identities: HashMap<String, Identity>,
    courses: HashMap<i64, Course>,
    modules: HashMap<i64, CourseModule>,
    questions: HashMap<i64, Question>,
    quizzes: HashMap<i64, Quiz>,
    next_user_id: i64,
    next_course_id: i64,
    next_module_id: i64,
    next_question_id: i64,
    next_quiz_id: i64,
}

impl InMemoryDb {
    pub fn new(snapshot_path: Option<&str>) -> Self {
        let snapshot = snapshot_path.and_then(|path| {
            let raw = fs::read_to_string(path).ok()?;
            match serde_json::from_str::<PersistentSnapshot>(&raw) {
                Ok(s) => Some(s),
                Err(err) => {
                    warn!("failed to read local snapshot {}: {}", path, err);
                    None
                }
            }
        });

        let identities = snapshot.as_ref().map(|s| s.identities.clone()).unwrap_or_default();
        let courses = snapshot.as_ref().map(|s| s.courses.clone()).unwrap_or_default();
        let modules = snapshot.as_ref().map(|s| s.modules.clone()).unwrap_or_default();
        let questions = snapshot.as_ref().map(|s| s.questions.clone()).unwrap_or_default();
        let quizzes = snapshot.as_ref().map(|s| s.quizzes.clone()).unwrap_or_default();

        let next_user_id = snapshot
            .as_ref()
            .map(|s| s.next_user_id)
            .unwrap_or(1)
            .max(identities.values().map(|i| i.user_id).max().unwrap_or(0) + 1);
        let next_course_id = snapshot
            .as_ref()
            .map(|s| s.next_course_id)
            .unwrap_or(1)
            .max(courses.keys().max().copied().unwrap_or(0) + 1);
        let next_module_id = snapshot
            .as_ref()
            .map(|s| s.next_module_id)
            .unwrap_or(1)
            .max(modules.keys().max().copied().unwrap_or(0) + 1);
        let next_question_id = snapshot
            .as_ref()
            .map(|s| s.next_question_id)
            .unwrap_or(1)
            .max(questions.keys().max().copied().unwrap_or(0) + 1);
        let next_quiz_id = snapshot
            .as_ref()
            .map(|s| s.next_quiz_id)
            .unwrap_or(1)
            .max(quizzes.keys().max().copied().unwrap_or(0) + 1);

        Self {
            identities: RwLock::new(identities),
            courses: RwLock::new(courses),
            modules: RwLock::new(modules),
            questions: RwLock::new(questions),
            quizzes: RwLock::new(quizzes),
            selections: RwLock::new(HashMap::new()),
            performances: RwLock::new(HashMap::new()),
            responses: RwLock::new(HashMap::new()),
            interactions: RwLock::new(HashMap::new()),
            rate_counters: DashMap::new(),
            next_user_id: AtomicI64::new(next_user_id),
            next_course_id: AtomicI64::new(next_course_id),
            next_module_id: AtomicI64::new(next_module_id),
            next_question_id: AtomicI64::new(next_question_id),
            next_quiz_id: AtomicI64::new(next_quiz_id),
            next_response_id: AtomicI64::new(1),
            next_interaction_id: AtomicI64::new(1),
        }
    }

    pub fn next_user_id(&self) -> i64 {
        self.next_user_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_course_id(&self) -> i64 {
        self.next_course_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_module_id(&self) -> i64 {
        self.next_module_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_question_id(&self) -> i64 {
        self.next_question_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_quiz_id(&self) -> i64 {
        self.next_quiz_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_response_id(&self) -> i64 {
        self.next_response_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_interaction_id(&self) -> i64 {
        self.next_interaction_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Fixed-window counter per `{scope}:{key}`. Returns false once the
    /// per-minute limit is reached.
    pub fn check_rate_limit(&self, scope: &str, key: &str, limit_per_minute: u32) -> bool {
        let now = Instant::now();
        let full_key = format!("{scope}:{key}");
        if let Some(mut entry) = self.rate_counters.get_mut(&full_key) {
            if now.duration_since(entry.1) > Duration::from_secs(60) {
                *entry = (1, now);
                true
            } else if entry.0 >= limit_per_minute {
                false
            } else {
                entry.0 += 1;
                true
            }
        } else {
            self.rate_counters.insert(full_key, (1, now));
            true
        }
    }

    async fn snapshot(&self) -> PersistentSnapshot {
        PersistentSnapshot {
            identities: self.identities.read().await.clone(),
            courses: self.courses.read().await.clone(),
            modules: self.modules.read().await.clone(),
            questions: self.questions.read().await.clone(),
            quizzes: self.quizzes.read().await.clone(),
            next_user_id: self.next_user_id.load(Ordering::SeqCst),
            next_course_id: self.next_course_id.load(Ordering::SeqCst),
            next_module_id: self.next_module_id.load(Ordering::SeqCst),
            next_question_id: self.next_question_id.load(Ordering::SeqCst),
            next_quiz_id: self.next_quiz_id.load(Ordering::SeqCst),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<InMemoryDb>,
    pub local_state_path: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct QuestionPatch {
    pub text: Option<String>,
    pub answer: Option<String>,
    pub options: Option<Vec<String>>,
    pub difficulty: Option<Difficulty>,
}

impl AppState {
    pub fn new(local_state_path: Option<String>) -> Self {
        Self {
            db: Arc::new(InMemoryDb::new(local_state_path.as_deref())),
            local_state_path,
        }
    }

    pub async fn persist_core_data(&self) -> anyhow::Result<()> {
        let Some(path) = self.local_state_path.as_ref() else {
            return Ok(());
        };
        let snapshot = self.db.snapshot().await;
        let serialized = serde_json::to_vec_pretty(&snapshot)?;
        if let Some(parent) = Path::new(path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serialized).await?;
        Ok(())
    }

    async fn persist_or_warn(&self, after: &str) {
        if let Err(err) = self.persist_core_data().await {
            warn!("failed to persist local state after {}: {}", after, err);
        }
    }

    // ---- collaborator seams -------------------------------------------------
    //
    // Identity issuance and course/module ownership records belong to external
    // collaborators; these write seams exist for bootstrap and tests only and
    // are never exposed over HTTP.

    pub async fn register_identity(&self, role: Role) -> (i64, String) {
        let user_id = self.db.next_user_id();
        let token = uuid::Uuid::new_v4().to_string();
        self.db
            .identities
            .write()
            .await
            .insert(token.clone(), Identity { user_id, role });
        self.persist_or_warn("register_identity").await;
        (user_id, token)
    }

    pub async fn resolve_identity(&self, token: &str) -> Option<Identity> {
        self.db.identities.read().await.get(token).copied()
    }

    pub async fn create_course(&self, owner_id: i64, title: &str) -> i64 {
        let id = self.db.next_course_id();
        self.db.courses.write().await.insert(
            id,
            Course {
                id,
                title: title.to_string(),
                owner_id,
                enrolled_students: Vec::new(),
            },
        );
        self.persist_or_warn("create_course").await;
        id
    }

    pub async fn enroll_student(&self, course_id: i64, student_id: i64) {
        if let Some(course) = self.db.courses.write().await.get_mut(&course_id) {
            if !course.enrolled_students.contains(&student_id) {
                course.enrolled_students.push(student_id);
            }
        }
        self.persist_or_warn("enroll_student").await;
    }

    pub async fn create_module(&self, course_id: i64, title: &str) -> i64 {
        let id = self.db.next_module_id();
        self.db.modules.write().await.insert(
            id,
            CourseModule { id, course_id, title: title.to_string() },
        );
        self.persist_or_warn("create_module").await;
        id
    }

    /// Resolves module -> course, failing with NotFound for whichever link is
    /// missing. Every quiz operation goes through this chain.
    async fn course_for_module(&self, module_id: i64) -> Result<Course, EngineError> {
        let course_id = self
            .db
            .modules
            .read()
            .await
            .get(&module_id)
            .map(|m| m.course_id)
            .ok_or_else(|| EngineError::not_found("module"))?;
        self.db
            .courses
            .read()
            .await
            .get(&course_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("course for this module"))
    }

    fn ensure_owner(course: &Course, instructor_id: i64, action: &str) -> Result<(), EngineError> {
        if course.owner_id != instructor_id {
            return Err(EngineError::Authorization(format!(
                "you are not authorized to {action}"
            )));
        }
        Ok(())
    }

    fn ensure_enrolled(course: &Course, student_id: i64) -> Result<(), EngineError> {
        if !course.enrolled_students.contains(&student_id) {
            return Err(EngineError::Authorization(
                "you are not enrolled in this course".into(),
            ));
        }
        Ok(())
    }

    // ---- question bank ------------------------------------------------------

    /// Bank retrieval: matching questions in ascending id order (deterministic
    /// for a fixed bank state), up to `limit`.
    async fn bank_matching(
        &self,
        kind: QuestionType,
        difficulty: Option<Difficulty>,
        limit: usize,
    ) -> (Vec<Question>, usize) {
        let questions = self.db.questions.read().await;
        let mut matching: Vec<Question> = questions
            .values()
            .filter(|q| q.kind == kind)
            .filter(|q| difficulty.map_or(true, |d| q.difficulty == d))
            .cloned()
            .collect();
        matching.sort_by_key(|q| q.id);
        let available = matching.len();
        matching.truncate(limit);
        (matching, available)
    }

    pub async fn create_question(
        &self,
        instructor_id: i64,
        module_id: i64,
        text: String,
        answer: String,
        options: Option<Vec<String>>,
        kind: QuestionType,
        difficulty: Difficulty,
    ) -> Result<Question, EngineError> {
        if !self.db.modules.read().await.contains_key(&module_id) {
            return Err(EngineError::not_found("module"));
        }
        let answer = validate_question(kind, &answer, options.as_deref()).map_err(|issues| {
            EngineError::Validation(
                issues
                    .into_iter()
                    .map(|i| format!("{}: {}", i.field, i.issue))
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })?;

        let id = self.db.next_question_id();
        let question = Question {
            id,
            module_id,
            text,
            answer,
            options,
            kind,
            difficulty,
            created_by: instructor_id,
        };
        self.db.questions.write().await.insert(id, question.clone());
        self.persist_or_warn("create_question").await;
        Ok(question)
    }

    pub async fn update_question(
        &self,
        question_id: i64,
        instructor_id: i64,
        patch: QuestionPatch,
    ) -> Result<Question, EngineError> {
        let mut questions = self.db.questions.write().await;
        let question = questions
            .get_mut(&question_id)
            .ok_or_else(|| EngineError::not_found("question"))?;
        if question.created_by != instructor_id {
            return Err(EngineError::Authorization(
                "you are not authorized to update this question".into(),
            ));
        }

        if let Some(text) = patch.text {
            question.text = text;
        }
        if let Some(difficulty) = patch.difficulty {
            question.difficulty = difficulty;
        }
        if let Some(options) = patch.options {
            question.options = Some(options);
        }
        if let Some(new_answer) = patch.answer {
            let old_answer = question.answer.clone();
            // Keep MCQ options consistent: the entry that held the old key is
            // replaced by the new one.
            if question.kind == QuestionType::Mcq {
                if let Some(options) = question.options.as_mut() {
                    if let Some(slot) = options.iter_mut().find(|o| **o == old_answer) {
                        *slot = new_answer.clone();
                    }
                }
            }
            question.answer = new_answer;
        }

        let normalized =
            validate_question(question.kind, &question.answer, question.options.as_deref())
                .map_err(|issues| {
                    EngineError::Validation(
                        issues
                            .into_iter()
                            .map(|i| format!("{}: {}", i.field, i.issue))
                            .collect::<Vec<_>>()
                            .join("; "),
                    )
                })?;
        question.answer = normalized;
        let updated = question.clone();
        drop(questions);
        self.persist_or_warn("update_question").await;
        Ok(updated)
    }

    pub async fn delete_question(
        &self,
        question_id: i64,
        instructor_id: i64,
    ) -> Result<(), EngineError> {
        let mut questions = self.db.questions.write().await;
        let question = questions
            .get(&question_id)
            .ok_or_else(|| EngineError::not_found("question"))?;
        if question.created_by != instructor_id {
            return Err(EngineError::Authorization(
                "you are not authorized to delete this question".into(),
            ));
        }
        questions.remove(&question_id);
        drop(questions);
        self.persist_or_warn("delete_question").await;
        Ok(())
    }

    pub async fn questions_for_instructor(&self, instructor_id: i64) -> Vec<Question> {
        let questions = self.db.questions.read().await;
        let mut own: Vec<Question> = questions
            .values()
            .filter(|q| q.created_by == instructor_id)
            .cloned()
            .collect();
        own.sort_by_key(|q| q.id);
        own
    }

    pub async fn questions_by_module(
        &self,
        module_id: i64,
        identity: Identity,
    ) -> Result<Vec<Question>, EngineError> {
        let course = self.course_for_module(module_id).await?;
        match identity.role {
            Role::Instructor => Self::ensure_owner(&course, identity.user_id, "view this module's questions")?,
            Role::Student => Self::ensure_enrolled(&course, identity.user_id)?,
        }
        let questions = self.db.questions.read().await;
        let mut in_module: Vec<Question> = questions
            .values()
            .filter(|q| q.module_id == module_id)
            .cloned()
            .collect();
        in_module.sort_by_key(|q| q.id);
        Ok(in_module)
    }

    // ---- quiz definition registry -------------------------------------------

    pub async fn create_quiz(
        &self,
        instructor_id: i64,
        module_id: i64,
        question_count: usize,
        question_type: QuestionType,
    ) -> Result<Quiz, EngineError> {
        if question_count == 0 {
            return Err(EngineError::Validation("question count must be positive".into()));
        }
        let course = self.course_for_module(module_id).await?;
        Self::ensure_owner(&course, instructor_id, "create a quiz for this module")?;

        let (sample, available) = self.bank_matching(question_type, None, question_count).await;
        if sample.len() < question_count {
            return Err(EngineError::InsufficientBank { requested: question_count, available });
        }

        let id = self.db.next_quiz_id();
        let quiz = Quiz {
            id,
            module_id,
            question_count,
            question_type,
            question_ids: sample.iter().map(|q| q.id).collect(),
            created_at: Utc::now(),
        };
        self.db.quizzes.write().await.insert(id, quiz.clone());
        self.persist_or_warn("create_quiz").await;
        Ok(quiz)
    }

    pub async fn update_quiz(
        &self,
        quiz_id: i64,
        instructor_id: i64,
        question_count: usize,
        question_type: QuestionType,
    ) -> Result<Quiz, EngineError> {
        if question_count == 0 {
            return Err(EngineError::Validation("question count must be positive".into()));
        }
        let module_id = self
            .db
            .quizzes
            .read()
            .await
            .get(&quiz_id)
            .map(|q| q.module_id)
            .ok_or_else(|| EngineError::not_found("quiz"))?;
        let course = self.course_for_module(module_id).await?;
        Self::ensure_owner(&course, instructor_id, "update this quiz")?;

        if self.is_locked(quiz_id).await {
            return Err(EngineError::Conflict(
                "quiz cannot be edited as students have already initiated taking it".into(),
            ));
        }

        let (sample, available) = self.bank_matching(question_type, None, question_count).await;
        if sample.len() < question_count {
            return Err(EngineError::InsufficientBank { requested: question_count, available });
        }

        let mut quizzes = self.db.quizzes.write().await;
        let quiz = quizzes
            .get_mut(&quiz_id)
            .ok_or_else(|| EngineError::not_found("quiz"))?;
        quiz.question_count = question_count;
        quiz.question_type = question_type;
        quiz.question_ids = sample.iter().map(|q| q.id).collect();
        let updated = quiz.clone();
        drop(quizzes);
        self.persist_or_warn("update_quiz").await;
        Ok(updated)
    }

    pub async fn delete_quiz(&self, quiz_id: i64, instructor_id: i64) -> Result<(), EngineError> {
        let module_id = self
            .db
            .quizzes
            .read()
            .await
            .get(&quiz_id)
            .map(|q| q.module_id)
            .ok_or_else(|| EngineError::not_found("quiz"))?;
        let course = self.course_for_module(module_id).await?;
        Self::ensure_owner(&course, instructor_id, "delete this quiz")?;

        if self.is_locked(quiz_id).await {
            return Err(EngineError::Conflict(
                "quiz cannot be deleted as students have already initiated taking it".into(),
            ));
        }

        self.db.quizzes.write().await.remove(&quiz_id);
        self.persist_or_warn("delete_quiz").await;
        Ok(())
    }

    pub async fn quiz_by_id(&self, quiz_id: i64, instructor_id: i64) -> Result<Quiz, EngineError> {
        let quiz = self
            .db
            .quizzes
            .read()
            .await
            .get(&quiz_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("quiz"))?;
        let course = self.course_for_module(quiz.module_id).await?;
        Self::ensure_owner(&course, instructor_id, "view this quiz")?;
        Ok(quiz)
    }

    pub async fn quizzes_by_module(&self, module_id: i64) -> Result<Vec<Quiz>, EngineError> {
        if !self.db.modules.read().await.contains_key(&module_id) {
            return Err(EngineError::not_found("module"));
        }
        let quizzes = self.db.quizzes.read().await;
        let mut in_module: Vec<Quiz> = quizzes
            .values()
            .filter(|q| q.module_id == module_id)
            .cloned()
            .collect();
        in_module.sort_by_key(|q| q.id);
        Ok(in_module)
    }

    /// "My quizzes": every quiz reachable through the caller's course scope —
    /// enrolled courses for students, owned courses for instructors.
    pub async fn quizzes_for(&self, identity: Identity) -> Vec<Quiz> {
        let courses = self.db.courses.read().await;
        let course_ids: Vec<i64> = courses
            .values()
            .filter(|c| match identity.role {
                Role::Student => c.enrolled_students.contains(&identity.user_id),
                Role::Instructor => c.owner_id == identity.user_id,
            })
            .map(|c| c.id)
            .collect();
        drop(courses);

        let modules = self.db.modules.read().await;
        let module_ids: Vec<i64> = modules
            .values()
            .filter(|m| course_ids.contains(&m.course_id))
            .map(|m| m.id)
            .collect();
        drop(modules);

        let quizzes = self.db.quizzes.read().await;
        let mut scoped: Vec<Quiz> = quizzes
            .values()
            .filter(|q| module_ids.contains(&q.module_id))
            .cloned()
            .collect();
        scoped.sort_by_key(|q| q.id);
        scoped
    }

    // ---- lifecycle guard ----------------------------------------------------

    /// A quiz is permanently locked once any student selection or response
    /// references it; there is no unlock operation.
    pub async fn is_locked(&self, quiz_id: i64) -> bool {
        let selected = self
            .db
            .selections
            .read()
            .await
            .keys()
            .any(|(quiz, _)| *quiz == quiz_id);
        if selected {
            return true;
        }
        self.db
            .responses
            .read()
            .await
            .values()
            .any(|r| r.quiz_id == quiz_id)
    }

    // ---- adaptive difficulty resolver ---------------------------------------

    /// Pops the most recent performance row for the pair. Single-use context:
    /// the row is gone after this call (atomic remove under the write lock).
    pub async fn resolve_difficulty(&self, quiz_id: i64, student_id: i64) -> Option<Difficulty> {
        self.db
            .performances
            .write()
            .await
            .remove(&(quiz_id, student_id))
            .map(|performance| crate::models::difficulty_for_score(performance.score))
    }

    // ---- per-student selection cache ----------------------------------------

    /// Returns the student's question set for the quiz, creating it on first
    /// request. The whole check-compute-insert sequence runs while holding the
    /// selection table's write lock, so concurrent first requests for the same
    /// pair serialize instead of racing into divergent selections.
    pub async fn questions_for_student(
        &self,
        quiz_id: i64,
        student_id: i64,
    ) -> Result<Vec<QuestionView>, EngineError> {
        let quiz = self
            .db
            .quizzes
            .read()
            .await
            .get(&quiz_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("quiz"))?;
        let course = self.course_for_module(quiz.module_id).await?;
        Self::ensure_enrolled(&course, student_id)?;

        let mut selections = self.db.selections.write().await;
        if let Some(existing) = selections.get(&(quiz_id, student_id)) {
            let questions = self.db.questions.read().await;
            // Cached set is returned verbatim, same order as stored.
            return Ok(existing
                .question_ids
                .iter()
                .filter_map(|id| questions.get(id))
                .map(QuestionView::from_question)
                .collect());
        }

        let difficulty = self.resolve_difficulty(quiz_id, student_id).await;
        let (sample, available) = self
            .bank_matching(quiz.question_type, difficulty, quiz.question_count)
            .await;
        if sample.is_empty() {
            return Err(EngineError::NotFound(
                "no questions available for this quiz".into(),
            ));
        }
        if sample.len() < quiz.question_count {
            return Err(EngineError::InsufficientBank {
                requested: quiz.question_count,
                available,
            });
        }

        let views: Vec<QuestionView> = sample.iter().map(QuestionView::from_question).collect();
        selections.insert(
            (quiz_id, student_id),
            QuizSelection {
                student_id,
                quiz_id,
                question_ids: sample.iter().map(|q| q.id).collect(),
                selected_at: Utc::now(),
            },
        );
        Ok(views)
    }

    // ---- submission & grading engine ----------------------------------------

    pub async fn submit_quiz(
        &self,
        student_id: i64,
        quiz_id: i64,
        answers: Vec<SubmittedAnswer>,
    ) -> Result<SubmissionOutcome, EngineError> {
        let quiz = self
            .db
            .quizzes
            .read()
            .await
            .get(&quiz_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("quiz"))?;
        let course = self.course_for_module(quiz.module_id).await?;
        Self::ensure_enrolled(&course, student_id)?;

        // The student's own selection is the authoritative question set.
        let selection = self
            .db
            .selections
            .read()
            .await
            .get(&(quiz_id, student_id))
            .cloned()
            .ok_or_else(|| {
                EngineError::Conflict("no active question selection for this quiz".into())
            })?;

        let answer_keys: HashMap<i64, String> = {
            let questions = self.db.questions.read().await;
            selection
                .question_ids
                .iter()
                .filter_map(|id| questions.get(id).map(|q| (q.id, q.answer.clone())))
                .collect()
        };

        let (score, feedback) =
            grade_submission(selection.question_ids.len(), &answer_keys, &answers);
        let message = crate::models::result_message(score);
        let now = Utc::now();

        // Side effects in submission order: performance, response,
        // interaction, then the selection reset.
        self.db.performances.write().await.insert(
            (quiz_id, student_id),
            QuizPerformance {
                quiz_id,
                student_id,
                score,
                answers: answers.iter().map(|a| a.answer.clone()).collect(),
                attempted_at: now,
            },
        );

        let response_id = self.db.next_response_id();
        self.db.responses.write().await.insert(
            response_id,
            ResponseRecord {
                id: response_id,
                user_id: student_id,
                quiz_id,
                answers,
                score,
                submitted_at: now,
            },
        );

        let interaction_id = self.db.next_interaction_id();
        self.db.interactions.write().await.insert(
            interaction_id,
            UserInteraction {
                id: interaction_id,
                user_id: student_id,
                course_id: course.id,
                response_id,
                time_spent_minutes: 0,
                last_accessed: now,
            },
        );

        self.db.selections.write().await.remove(&(quiz_id, student_id));

        Ok(SubmissionOutcome { message, score_percentage: score, feedback })
    }
}
