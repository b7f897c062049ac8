use std::env;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value as JsonValue};
use sqlx::PgPool;
use tower::ServiceExt;
use uuid::Uuid;
use vx_academy::AppState;

async fn send(app: &Router, method: &str, uri: &str, token: Option<&str>, body: Option<JsonValue>) -> (StatusCode, JsonValue) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("Authorization", format!("Bearer {}", token));
    }
    let req = match body {
        Some(b) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(b.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), 10 * 1024 * 1024).await.unwrap();
    let json = if bytes.is_empty() {
        JsonValue::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(JsonValue::Null)
    };
    (status, json)
}

async fn register(app: &Router, name: &str) -> (String, Uuid, String) {
    let email = format!("{}_{}@example.com", name, Uuid::new_v4().simple());
    let (status, body) = send(
        app,
        "POST",
        "/api/auth/register",
        None,
        Some(json!({ "name": name, "email": email, "password": "correct horse battery" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "register: {}", body);
    let id = Uuid::parse_str(body["user"]["id"].as_str().unwrap()).unwrap();
    (body["token"].as_str().unwrap().to_string(), id, email)
}

async fn setup() -> (Router, PgPool, AppState) {
    dotenvy::dotenv().ok();
    env::set_var("SERVER_ADDRESS", "127.0.0.1:0");
    env::set_var("JWT_SECRET", "test_secret_key");
    env::set_var("WEBHOOK_SECRET", "whsec_test");
    env::set_var("API_RPS", "1000");
    env::set_var("PUBLIC_RPS", "1000");
    env::set_var("UPLOADS_DIR", env::temp_dir().join("vx-academy-test").display().to_string());
    let _ = vx_academy::config::init_config();

    let pool = vx_academy::database::pool::create_pool().await.expect("pool");
    vx_academy::database::pool::run_migrations(&pool)
        .await
        .expect("migrations");

    let state = AppState::new(pool.clone());
    let app = vx_academy::routes::router(state.clone(), vx_academy::config::get_config());
    (app, pool, state)
}

/// Registers a user, promotes it directly, then logs in again for a token
/// carrying the role.
async fn login_admin(app: &Router, pool: &PgPool) -> (String, Uuid) {
    let (_, admin_id, admin_email) = register(app, "admin").await;
    sqlx::query("UPDATE users SET role = 'admin' WHERE id = $1")
        .bind(admin_id)
        .execute(pool)
        .await
        .expect("promote admin");
    let (status, body) = send(
        app,
        "POST",
        "/api/auth/login",
        None,
        Some(json!({ "email": admin_email, "password": "correct horse battery" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    (body["token"].as_str().unwrap().to_string(), admin_id)
}

/// Published course holding a final assessment, returned as (course, assessment).
async fn course_with_final(app: &Router, admin: &str, questions: JsonValue) -> (String, String) {
    let (status, course) = send(
        app,
        "POST",
        "/api/admin/courses",
        Some(admin),
        Some(json!({ "name": "Ladder Safety", "level": "Beginner", "is_published": true })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", course);
    let course_id = course["id"].as_str().unwrap().to_string();

    let (status, assessment) = send(
        app,
        "POST",
        "/api/admin/assessments",
        Some(admin),
        Some(json!({
            "course_id": course_id,
            "title": "Ladder Exam",
            "placement": "end",
            "passing_score": 50,
            "time_limit_minutes": 10,
            "max_retakes": 1,
            "has_certificate": true,
            "questions": questions
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", assessment);
    (course_id, assessment["id"].as_str().unwrap().to_string())
}

/// Needs a running Postgres at `DATABASE_URL`.
#[tokio::test]
#[ignore]
async fn learner_completes_course_and_earns_certificate() {
    let (app, pool, _) = setup().await;
    let (admin, _) = login_admin(&app, &pool).await;

    let (learner, _, _) = register(&app, "learner").await;

    // content
    let (status, course) = send(
        &app,
        "POST",
        "/api/admin/courses",
        Some(&admin),
        Some(json!({ "name": "Forklift Safety", "level": "Beginner", "duration": "2 hours", "is_published": true })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", course);
    let course_id = course["id"].as_str().unwrap().to_string();

    let (status, unit) = send(&app, "POST", "/api/admin/units", Some(&admin), Some(json!({ "title": "Basics" }))).await;
    assert_eq!(status, StatusCode::CREATED);
    let unit_id = unit["id"].as_str().unwrap().to_string();

    let (status, _) = send(
        &app,
        "POST",
        &format!("/api/admin/courses/{}/units", course_id),
        Some(&admin),
        Some(json!({ "unit_id": unit_id, "position": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, block) = send(
        &app,
        "POST",
        "/api/admin/blocks",
        Some(&admin),
        Some(json!({ "unit_id": unit_id, "title": "Intro", "content_type": "text", "content": "Look both ways", "xp_reward": 10 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", block);
    let block_id = block["id"].as_str().unwrap().to_string();

    let (status, _) = send(
        &app,
        "POST",
        "/api/admin/assessments",
        Some(&admin),
        Some(json!({
            "course_id": course_id,
            "title": "Final",
            "placement": "somewhere",
            "passing_score": 70,
            "time_limit_minutes": 30,
            "questions": []
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, assessment) = send(
        &app,
        "POST",
        "/api/admin/assessments",
        Some(&admin),
        Some(json!({
            "course_id": course_id,
            "title": "Final Exam",
            "placement": "end",
            "passing_score": 50,
            "time_limit_minutes": 10,
            "max_retakes": 2,
            "has_certificate": true,
            "questions": [
                { "id": 1, "type": "multiple_choice", "question": "Max speed?", "options": ["5", "50"], "correct_answer": 0 },
                { "id": 2, "type": "true_false", "question": "Seatbelt required?", "correct_answer": true }
            ]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", assessment);
    let assessment_id = assessment["id"].as_str().unwrap().to_string();

    // learner must enroll before starting
    let (status, _) = send(&app, "POST", &format!("/api/assessments/{}/start", assessment_id), Some(&learner), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, enrolled) = send(&app, "POST", &format!("/api/courses/{}/enroll", course_id), Some(&learner), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(enrolled["enrolled"], true);

    let (status, done) = send(&app, "POST", &format!("/api/blocks/{}/complete", block_id), Some(&learner), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(done["newly_completed"], true);
    assert_eq!(done["xp_awarded"], 10);

    let (_, again) = send(&app, "POST", &format!("/api/blocks/{}/complete", block_id), Some(&learner), None).await;
    assert_eq!(again["newly_completed"], false);

    // course-final assessment is outside the percentage, but gates completion
    let (_, progress) = send(&app, "GET", &format!("/api/courses/{}/progress", course_id), Some(&learner), None).await;
    assert_eq!(progress["percent_complete"], 100);
    assert_eq!(progress["completed"], false);

    let (status, started) = send(&app, "POST", &format!("/api/assessments/{}/start", assessment_id), Some(&learner), None).await;
    assert_eq!(status, StatusCode::CREATED, "{}", started);
    assert!(started["questions"][0].get("correct_answer").is_none());
    let attempt_id = started["attempt_id"].as_str().unwrap().to_string();

    let (status, resumed) = send(&app, "POST", &format!("/api/assessments/{}/start", assessment_id), Some(&learner), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resumed["attempt_id"].as_str().unwrap(), attempt_id);

    let (status, _) = send(
        &app,
        "POST",
        &format!("/api/attempts/{}/navigate", attempt_id),
        Some(&learner),
        Some(json!({ "direction": "sideways" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = send(
        &app,
        "PATCH",
        &format!("/api/attempts/{}/answer", attempt_id),
        Some(&learner),
        Some(json!({ "question_id": 1, "answer": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // one question still open
    let (status, _) = send(&app, "POST", &format!("/api/attempts/{}/submit", attempt_id), Some(&learner), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, saved) = send(
        &app,
        "PATCH",
        &format!("/api/attempts/{}/answer", attempt_id),
        Some(&learner),
        Some(json!({ "question_id": 2, "answer": true })),
    )
    .await;
    assert_eq!(saved["answered"], 2);

    let (status, result) = send(&app, "POST", &format!("/api/attempts/{}/submit", attempt_id), Some(&learner), None).await;
    assert_eq!(status, StatusCode::OK, "{}", result);
    assert_eq!(result["passed"], true);
    assert_eq!(result["percentage"], 100.0);
    assert_eq!(result["certificate_issued"], true);
    assert_eq!(result["attempts_remaining"], 1);

    let (_, progress) = send(&app, "GET", &format!("/api/courses/{}/progress", course_id), Some(&learner), None).await;
    assert_eq!(progress["completed"], true);

    let (_, certificates) = send(&app, "GET", "/api/certificates", Some(&learner), None).await;
    let code = certificates[0]["verification_code"].as_str().unwrap().to_string();
    let (status, verified) = send(&app, "GET", &format!("/api/certificates/verify/{}", code), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(verified["valid"], true);

    let (_, unread) = send(&app, "GET", "/api/notifications/unread-count", Some(&learner), None).await;
    assert!(unread["unread"].as_i64().unwrap() >= 1);

    let (status, audit) = send(&app, "GET", "/api/admin/audit?limit=5", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!audit.as_array().unwrap().is_empty());
}

#[tokio::test]
#[ignore]
async fn deactivation_and_demotion_apply_to_issued_tokens() {
    let (app, pool, _) = setup().await;
    let (admin, _) = login_admin(&app, &pool).await;
    let (other_admin, other_admin_id) = login_admin(&app, &pool).await;
    let (learner, learner_id, _) = register(&app, "learner").await;

    let (status, _) = send(&app, "GET", "/api/progress", Some(&learner), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &app,
        "PATCH",
        &format!("/api/admin/users/{}", learner_id),
        Some(&admin),
        Some(json!({ "is_active": false })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app, "GET", "/api/progress", Some(&learner), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "account_disabled");

    let (status, _) = send(&app, "GET", "/api/admin/dashboard", Some(&other_admin), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(
        &app,
        "PATCH",
        &format!("/api/admin/users/{}", other_admin_id),
        Some(&admin),
        Some(json!({ "role": "learner" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app, "GET", "/api/admin/dashboard", Some(&other_admin), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden");
    // still a valid learner
    let (status, _) = send(&app, "GET", "/api/progress", Some(&other_admin), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
#[ignore]
async fn failed_grading_rolls_back_and_the_sweeper_completes_it() {
    let (app, pool, state) = setup().await;
    let (admin, _) = login_admin(&app, &pool).await;
    let (learner, learner_id, _) = register(&app, "learner").await;
    let (course_id, assessment_id) = course_with_final(
        &app,
        &admin,
        json!([{ "id": 1, "type": "true_false", "question": "Three points of contact?", "correct_answer": true }]),
    )
    .await;
    let assessment_uuid = Uuid::parse_str(&assessment_id).unwrap();

    send(&app, "POST", &format!("/api/courses/{}/enroll", course_id), Some(&learner), None).await;
    let (status, started) = send(&app, "POST", &format!("/api/assessments/{}/start", assessment_id), Some(&learner), None).await;
    assert_eq!(status, StatusCode::CREATED, "{}", started);
    let attempt_id = Uuid::parse_str(started["attempt_id"].as_str().unwrap()).unwrap();
    send(
        &app,
        "PATCH",
        &format!("/api/attempts/{}/answer", attempt_id),
        Some(&learner),
        Some(json!({ "question_id": 1, "answer": true })),
    )
    .await;

    // certificate storage fails for this assessment only
    let trigger = format!("refuse_certificate_{}", assessment_uuid.simple());
    sqlx::query(
        r#"CREATE OR REPLACE FUNCTION refuse_certificate() RETURNS trigger AS $$
           BEGIN RAISE EXCEPTION 'certificate storage unavailable'; END;
           $$ LANGUAGE plpgsql"#,
    )
    .execute(&pool)
    .await
    .expect("create function");
    sqlx::query(&format!(
        "CREATE TRIGGER {} BEFORE INSERT ON certificates FOR EACH ROW \
         WHEN (NEW.assessment_id = '{}') EXECUTE FUNCTION refuse_certificate()",
        trigger, assessment_uuid
    ))
    .execute(&pool)
    .await
    .expect("create trigger");

    let (status, _) = send(&app, "POST", &format!("/api/attempts/{}/submit", attempt_id), Some(&learner), None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let (attempt_status,): (String,) = sqlx::query_as("SELECT status FROM assessment_attempts WHERE id = $1")
        .bind(attempt_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(attempt_status, "submitting");
    let progress_rows: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM user_assessment_progress WHERE user_id = $1 AND assessment_id = $2",
    )
    .bind(learner_id)
    .bind(assessment_uuid)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(progress_rows, 0);

    sqlx::query(&format!("DROP TRIGGER {} ON certificates", trigger))
        .execute(&pool)
        .await
        .expect("drop trigger");
    sqlx::query("UPDATE assessment_attempts SET updated_at = NOW() - INTERVAL '10 minutes' WHERE id = $1")
        .bind(attempt_id)
        .execute(&pool)
        .await
        .unwrap();

    let finalized = state.attempt_service.sweep_expired().await.expect("sweep");
    assert!(finalized >= 1);

    let (status, result) = send(&app, "GET", &format!("/api/attempts/{}/result", attempt_id), Some(&learner), None).await;
    assert_eq!(status, StatusCode::OK, "{}", result);
    assert_eq!(result["passed"], true);
    assert_eq!(result["certificate_issued"], true);

    let (_, progress) = send(&app, "GET", &format!("/api/courses/{}/progress", course_id), Some(&learner), None).await;
    assert_eq!(progress["completed"], true);
}

#[tokio::test]
#[ignore]
async fn abandoned_webhook_deliveries_are_requeued() {
    let (_, pool, state) = setup().await;
    let insert = r#"INSERT INTO webhook_logs (event_type, payload, target_url, status, updated_at)
                    VALUES ('badge_earned', '{}', 'http://127.0.0.1:9/hook', 'delivering', NOW() - make_interval(mins => $1))
                    RETURNING id"#;
    let abandoned: Uuid = sqlx::query_scalar(insert).bind(10).fetch_one(&pool).await.unwrap();
    let in_flight: Uuid = sqlx::query_scalar(insert).bind(0).fetch_one(&pool).await.unwrap();

    let reclaimed = state.notification_service.reclaim_stale().await.expect("reclaim");
    assert!(reclaimed >= 1);

    let status_of = |id: Uuid| {
        let pool = pool.clone();
        async move {
            let status: String = sqlx::query_scalar("SELECT status FROM webhook_logs WHERE id = $1")
                .bind(id)
                .fetch_one(&pool)
                .await
                .unwrap();
            status
        }
    };
    assert_eq!(status_of(abandoned).await, "pending");
    assert_eq!(status_of(in_flight).await, "delivering");

    sqlx::query("DELETE FROM webhook_logs WHERE id = ANY($1)")
        .bind(vec![abandoned, in_flight])
        .execute(&pool)
        .await
        .unwrap();
}
