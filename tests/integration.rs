use assessment_backend::models::{Difficulty, QuestionType, Role};
use assessment_backend::routes::build_router;
use assessment_backend::state::AppState;
use serde_json::json;

struct TestEnv {
    base: String,
    client: reqwest::Client,
    state: AppState,
    instructor: i64,
    instructor_token: String,
    student_token: String,
    course_id: i64,
    module_id: i64,
}

/// Spawns the app on a random port with one instructor, one enrolled student
/// and an empty question bank. The state handle stays shared with the server,
/// so tests can seed collaborator data directly (identities, courses, bank).
async fn spawn_env() -> TestEnv {
    let state = AppState::new(None);
    let (instructor, instructor_token) = state.register_identity(Role::Instructor).await;
    let (student, student_token) = state.register_identity(Role::Student).await;
    let course_id = state.create_course(instructor, "Systems Programming").await;
    state.enroll_student(course_id, student).await;
    let module_id = state.create_module(course_id, "Memory Safety").await;

    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestEnv {
        base: format!("http://{}", addr),
        client: reqwest::Client::new(),
        state,
        instructor,
        instructor_token,
        student_token,
        course_id,
        module_id,
    }
}

async fn seed_true_false(env: &TestEnv, difficulty: Difficulty, count: usize) {
    for i in 0..count {
        env.state
            .create_question(
                env.instructor,
                env.module_id,
                format!("{difficulty:?} claim {i}"),
                "True".into(),
                None,
                QuestionType::TrueFalse,
                difficulty,
            )
            .await
            .unwrap();
    }
}

fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}

#[tokio::test]
async fn unknown_route_is_404_and_health_is_open() {
    let env = spawn_env().await;
    let missing = env
        .client
        .get(format!("{}/nope", env.base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status().as_u16(), 404);

    let health = env
        .client
        .get(format!("{}/health", env.base))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status().as_u16(), 200);
}

#[tokio::test]
async fn requests_without_identity_are_unauthorized() {
    let env = spawn_env().await;
    let resp = env
        .client
        .get(format!("{}/api/v1/quizzes", env.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);

    let resp = env
        .client
        .get(format!("{}/api/v1/quizzes", env.base))
        .header("Authorization", "Bearer not-a-token")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);
    let body = resp.json::<serde_json::Value>().await.unwrap();
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn insufficient_bank_rejects_quiz_creation() {
    let env = spawn_env().await;
    // 3 MCQs in the bank, quiz wants 5.
    for i in 0..3 {
        env.state
            .create_question(
                env.instructor,
                env.module_id,
                format!("pick one {i}"),
                "A".into(),
                Some(vec!["A".into(), "B".into()]),
                QuestionType::Mcq,
                Difficulty::Easy,
            )
            .await
            .unwrap();
    }

    let resp = env
        .client
        .post(format!("{}/api/v1/quizzes", env.base))
        .header("Authorization", bearer(&env.instructor_token))
        .json(&json!({"moduleId": env.module_id, "questionCount": 5, "questionType": "mcq"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 422);
    let body = resp.json::<serde_json::Value>().await.unwrap();
    assert_eq!(body["error"]["code"], "INSUFFICIENT_BANK");
}

#[tokio::test]
async fn non_positive_question_count_is_rejected() {
    let env = spawn_env().await;
    let resp = env
        .client
        .post(format!("{}/api/v1/quizzes", env.base))
        .header("Authorization", bearer(&env.instructor_token))
        .json(&json!({"moduleId": env.module_id, "questionCount": 0, "questionType": "mcq"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let body = resp.json::<serde_json::Value>().await.unwrap();
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn student_cannot_manage_quizzes() {
    let env = spawn_env().await;
    seed_true_false(&env, Difficulty::Easy, 2).await;
    let resp = env
        .client
        .post(format!("{}/api/v1/quizzes", env.base))
        .header("Authorization", bearer(&env.student_token))
        .json(&json!({"moduleId": env.module_id, "questionCount": 2, "questionType": "true_false"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 403);
}

#[tokio::test]
async fn foreign_instructor_cannot_touch_quiz() {
    let env = spawn_env().await;
    seed_true_false(&env, Difficulty::Easy, 2).await;
    let quiz = env
        .state
        .create_quiz(env.instructor, env.module_id, 2, QuestionType::TrueFalse)
        .await
        .unwrap();

    let (_, other_token) = env.state.register_identity(Role::Instructor).await;
    let resp = env
        .client
        .put(format!("{}/api/v1/quizzes/{}", env.base, quiz.id))
        .header("Authorization", bearer(&other_token))
        .json(&json!({"questionCount": 2, "questionType": "true_false"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 403);
}

#[tokio::test]
async fn true_false_flow_barely_passed() {
    let env = spawn_env().await;
    seed_true_false(&env, Difficulty::Easy, 2).await;
    // Medium tier must be able to serve the follow-up selection after a 50.
    seed_true_false(&env, Difficulty::Medium, 2).await;

    let create = env
        .client
        .post(format!("{}/api/v1/quizzes", env.base))
        .header("Authorization", bearer(&env.instructor_token))
        .json(&json!({"moduleId": env.module_id, "questionCount": 2, "questionType": "true_false"}))
        .send()
        .await
        .unwrap();
    assert_eq!(create.status().as_u16(), 201);
    let quiz = create.json::<serde_json::Value>().await.unwrap();
    let quiz_id = quiz["id"].as_i64().unwrap();

    // Idempotent selection: two fetches before submission, identical sets,
    // and never an answer key in the projection.
    let fetch = |client: reqwest::Client, base: String, token: String| async move {
        client
            .get(format!("{}/api/v1/quizzes/{}/questions", base, quiz_id))
            .header("Authorization", bearer(&token))
            .send()
            .await
            .unwrap()
            .json::<serde_json::Value>()
            .await
            .unwrap()
    };
    let first = fetch(env.client.clone(), env.base.clone(), env.student_token.clone()).await;
    let second = fetch(env.client.clone(), env.base.clone(), env.student_token.clone()).await;
    assert_eq!(first, second);
    let questions = first.as_array().unwrap();
    assert_eq!(questions.len(), 2);
    for q in questions {
        assert!(q.get("answer").is_none());
    }
    let q1 = questions[0]["questionId"].as_i64().unwrap();
    let q2 = questions[1]["questionId"].as_i64().unwrap();

    // Both keys are "True"; one right, one wrong.
    let submit = env
        .client
        .post(format!("{}/api/v1/quizzes/{}/submit", env.base, quiz_id))
        .header("Authorization", bearer(&env.student_token))
        .json(&json!({"answers": [
            {"questionId": q1, "answer": "True"},
            {"questionId": q2, "answer": "False"}
        ]}))
        .send()
        .await
        .unwrap();
    assert_eq!(submit.status().as_u16(), 200);
    let outcome = submit.json::<serde_json::Value>().await.unwrap();
    assert_eq!(outcome["scorePercentage"].as_f64().unwrap(), 50.0);
    assert_eq!(outcome["message"], "Passed. Barely made it!");
    let feedback = outcome["feedback"].as_array().unwrap();
    assert_eq!(feedback.len(), 2);
    assert_eq!(feedback[0]["isCorrect"], true);
    assert_eq!(feedback[1]["isCorrect"], false);
    assert_eq!(feedback[1]["correctAnswer"], "True");

    // Selection was reset; the next fetch consumes the 50-score performance
    // and serves the medium tier.
    let third = fetch(env.client.clone(), env.base.clone(), env.student_token.clone()).await;
    let third_ids: Vec<i64> = third
        .as_array()
        .unwrap()
        .iter()
        .map(|q| q["questionId"].as_i64().unwrap())
        .collect();
    assert_ne!(third_ids, vec![q1, q2]);
    let bank = env.state.db.questions.read().await;
    for id in &third_ids {
        assert_eq!(bank[id].difficulty, Difficulty::Medium);
    }
    drop(bank);
    assert!(env.state.db.performances.read().await.is_empty());

    // A response exists, so the quiz stays locked forever.
    let update = env
        .client
        .put(format!("{}/api/v1/quizzes/{}", env.base, quiz_id))
        .header("Authorization", bearer(&env.instructor_token))
        .json(&json!({"questionCount": 2, "questionType": "true_false"}))
        .send()
        .await
        .unwrap();
    assert_eq!(update.status().as_u16(), 409);
}

#[tokio::test]
async fn selection_alone_locks_update_and_delete() {
    let env = spawn_env().await;
    seed_true_false(&env, Difficulty::Easy, 2).await;
    let quiz = env
        .state
        .create_quiz(env.instructor, env.module_id, 2, QuestionType::TrueFalse)
        .await
        .unwrap();

    let fetch = env
        .client
        .get(format!("{}/api/v1/quizzes/{}/questions", env.base, quiz.id))
        .header("Authorization", bearer(&env.student_token))
        .send()
        .await
        .unwrap();
    assert_eq!(fetch.status().as_u16(), 200);

    let update = env
        .client
        .put(format!("{}/api/v1/quizzes/{}", env.base, quiz.id))
        .header("Authorization", bearer(&env.instructor_token))
        .json(&json!({"questionCount": 2, "questionType": "true_false"}))
        .send()
        .await
        .unwrap();
    assert_eq!(update.status().as_u16(), 409);
    let body = update.json::<serde_json::Value>().await.unwrap();
    assert_eq!(body["error"]["code"], "CONFLICT");

    let delete = env
        .client
        .delete(format!("{}/api/v1/quizzes/{}", env.base, quiz.id))
        .header("Authorization", bearer(&env.instructor_token))
        .send()
        .await
        .unwrap();
    assert_eq!(delete.status().as_u16(), 409);
}

#[tokio::test]
async fn untouched_quiz_can_be_updated_and_deleted() {
    let env = spawn_env().await;
    seed_true_false(&env, Difficulty::Easy, 3).await;
    let quiz = env
        .state
        .create_quiz(env.instructor, env.module_id, 2, QuestionType::TrueFalse)
        .await
        .unwrap();

    let update = env
        .client
        .put(format!("{}/api/v1/quizzes/{}", env.base, quiz.id))
        .header("Authorization", bearer(&env.instructor_token))
        .json(&json!({"questionCount": 3, "questionType": "true_false"}))
        .send()
        .await
        .unwrap();
    assert_eq!(update.status().as_u16(), 200);
    let updated = update.json::<serde_json::Value>().await.unwrap();
    assert_eq!(updated["question_count"].as_u64().unwrap(), 3);
    assert_eq!(updated["question_ids"].as_array().unwrap().len(), 3);

    let delete = env
        .client
        .delete(format!("{}/api/v1/quizzes/{}", env.base, quiz.id))
        .header("Authorization", bearer(&env.instructor_token))
        .send()
        .await
        .unwrap();
    assert_eq!(delete.status().as_u16(), 204);
    assert!(env.state.db.quizzes.read().await.is_empty());
}

#[tokio::test]
async fn quiz_listing_respects_role_scope() {
    let env = spawn_env().await;
    seed_true_false(&env, Difficulty::Easy, 2).await;
    env.state
        .create_quiz(env.instructor, env.module_id, 2, QuestionType::TrueFalse)
        .await
        .unwrap();

    // Owner and enrolled student both see the quiz under their scope.
    for token in [&env.instructor_token, &env.student_token] {
        let list = env
            .client
            .get(format!("{}/api/v1/quizzes", env.base))
            .header("Authorization", bearer(token))
            .send()
            .await
            .unwrap()
            .json::<serde_json::Value>()
            .await
            .unwrap();
        assert_eq!(list.as_array().unwrap().len(), 1);
    }

    // Unenrolled student sees nothing.
    let (_, outsider_token) = env.state.register_identity(Role::Student).await;
    let list = env
        .client
        .get(format!("{}/api/v1/quizzes", env.base))
        .header("Authorization", bearer(&outsider_token))
        .send()
        .await
        .unwrap()
        .json::<serde_json::Value>()
        .await
        .unwrap();
    assert!(list.as_array().unwrap().is_empty());

    // Module-level listing works for any authenticated caller.
    let by_module = env
        .client
        .get(format!("{}/api/v1/modules/{}/quizzes", env.base, env.module_id))
        .header("Authorization", bearer(&env.student_token))
        .send()
        .await
        .unwrap();
    assert_eq!(by_module.status().as_u16(), 200);
}

#[tokio::test]
async fn question_bank_crud_for_instructor() {
    let env = spawn_env().await;
    let create = env
        .client
        .post(format!("{}/api/v1/questions", env.base))
        .header("Authorization", bearer(&env.instructor_token))
        .json(&json!({
            "moduleId": env.module_id,
            "text": "Borrow checker rejects aliased mutation",
            "answer": "true",
            "type": "true_false",
            "difficulty": "medium"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(create.status().as_u16(), 201);
    let created = create.json::<serde_json::Value>().await.unwrap();
    // Stored key is normalized even when the instructor typed lowercase.
    assert_eq!(created["answer"], "True");
    let question_id = created["id"].as_i64().unwrap();

    let update = env
        .client
        .put(format!("{}/api/v1/questions/{}", env.base, question_id))
        .header("Authorization", bearer(&env.instructor_token))
        .json(&json!({"answer": "FALSE"}))
        .send()
        .await
        .unwrap();
    assert_eq!(update.status().as_u16(), 200);
    let updated = update.json::<serde_json::Value>().await.unwrap();
    assert_eq!(updated["answer"], "False");

    let list = env
        .client
        .get(format!("{}/api/v1/questions", env.base))
        .header("Authorization", bearer(&env.instructor_token))
        .send()
        .await
        .unwrap()
        .json::<serde_json::Value>()
        .await
        .unwrap();
    assert_eq!(list.as_array().unwrap().len(), 1);

    // Students are not bank managers.
    let forbidden = env
        .client
        .get(format!("{}/api/v1/questions", env.base))
        .header("Authorization", bearer(&env.student_token))
        .send()
        .await
        .unwrap();
    assert_eq!(forbidden.status().as_u16(), 403);

    let delete = env
        .client
        .delete(format!("{}/api/v1/questions/{}", env.base, question_id))
        .header("Authorization", bearer(&env.instructor_token))
        .send()
        .await
        .unwrap();
    assert_eq!(delete.status().as_u16(), 204);
}

#[tokio::test]
async fn mcq_question_answer_must_match_options() {
    let env = spawn_env().await;
    let resp = env
        .client
        .post(format!("{}/api/v1/questions", env.base))
        .header("Authorization", bearer(&env.instructor_token))
        .json(&json!({
            "moduleId": env.module_id,
            "text": "Which keyword moves ownership?",
            "answer": "borrow",
            "options": ["move", "copy"],
            "type": "mcq",
            "difficulty": "easy"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let body = resp.json::<serde_json::Value>().await.unwrap();
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn module_questions_scoped_by_enrollment() {
    let env = spawn_env().await;
    seed_true_false(&env, Difficulty::Easy, 1).await;

    let ok = env
        .client
        .get(format!("{}/api/v1/modules/{}/questions", env.base, env.module_id))
        .header("Authorization", bearer(&env.student_token))
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status().as_u16(), 200);

    let (_, outsider_token) = env.state.register_identity(Role::Student).await;
    let forbidden = env
        .client
        .get(format!("{}/api/v1/modules/{}/questions", env.base, env.module_id))
        .header("Authorization", bearer(&outsider_token))
        .send()
        .await
        .unwrap();
    assert_eq!(forbidden.status().as_u16(), 403);
}

#[tokio::test]
async fn interaction_links_submission_to_course() {
    let env = spawn_env().await;
    seed_true_false(&env, Difficulty::Easy, 2).await;
    let quiz = env
        .state
        .create_quiz(env.instructor, env.module_id, 2, QuestionType::TrueFalse)
        .await
        .unwrap();

    let questions = env
        .client
        .get(format!("{}/api/v1/quizzes/{}/questions", env.base, quiz.id))
        .header("Authorization", bearer(&env.student_token))
        .send()
        .await
        .unwrap()
        .json::<serde_json::Value>()
        .await
        .unwrap();
    let answers: Vec<serde_json::Value> = questions
        .as_array()
        .unwrap()
        .iter()
        .map(|q| json!({"questionId": q["questionId"], "answer": "True"}))
        .collect();

    let submit = env
        .client
        .post(format!("{}/api/v1/quizzes/{}/submit", env.base, quiz.id))
        .header("Authorization", bearer(&env.student_token))
        .json(&json!({ "answers": answers }))
        .send()
        .await
        .unwrap();
    assert_eq!(submit.status().as_u16(), 200);
    let outcome = submit.json::<serde_json::Value>().await.unwrap();
    assert_eq!(outcome["scorePercentage"].as_f64().unwrap(), 100.0);
    assert_eq!(outcome["message"], "Excellent! You nailed it!");

    let interactions = env.state.db.interactions.read().await;
    assert_eq!(interactions.len(), 1);
    let interaction = interactions.values().next().unwrap();
    assert_eq!(interaction.course_id, env.course_id);
    let responses = env.state.db.responses.read().await;
    assert!(responses.values().any(|r| r.id == interaction.response_id));
}
