use crate::handlers;
use crate::state::AppState;
use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
            axum::http::header::AUTHORIZATION,
            axum::http::HeaderName::from_static("x-request-id"),
            axum::http::HeaderName::from_static("x-forwarded-for"),
        ]);

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(
            "/api/v1/questions",
            post(handlers::create_question).get(handlers::list_questions),
        )
        .route(
            "/api/v1/questions/:id",
            axum::routing::put(handlers::update_question).delete(handlers::delete_question),
        )
        .route("/api/v1/modules/:module_id/questions", get(handlers::questions_by_module))
        .route(
            "/api/v1/quizzes",
            post(handlers::create_quiz).get(handlers::list_my_quizzes),
        )
        .route(
            "/api/v1/quizzes/:id",
            get(handlers::get_quiz)
                .put(handlers::update_quiz)
                .delete(handlers::delete_quiz),
        )
        .route("/api/v1/modules/:module_id/quizzes", get(handlers::quizzes_by_module))
        .route("/api/v1/quizzes/:id/questions", get(handlers::student_questions))
        .route("/api/v1/quizzes/:id/submit", post(handlers::submit_quiz))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
