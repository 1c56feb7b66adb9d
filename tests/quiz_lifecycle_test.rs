//! End-to-end exercise of the quiz engine through its public API only: a
//! two-question session, three participants (two guests, one rostered
//! student), a wrong answer, a tied leaderboard tiebreaker, and an
//! auto-ended session via `auto_end`. Uses the real clock/RNG rather than
//! the crate's test-only fakes, since none of these assertions depend on
//! exact timestamps or room-code bytes.

use std::sync::Arc;
use std::time::Duration;

use classquiz_core::clock::SystemClock;
use classquiz_core::config::Config;
use classquiz_core::domain::quiz::{Choice, CorrectAnswer, Question, QuestionOptions, QuestionType, QuizStatus};
use classquiz_core::error::CoreError;
use classquiz_core::identity::IdentityContext;
use classquiz_core::quiz::engine::{EndReason, Joiner};
use classquiz_core::random::OsRandom;
use classquiz_core::room_registry::RoomRegistry;
use classquiz_core::store::memory::MemoryStore;
use classquiz_core::store::Store;
use classquiz_core::QuizEngine;

fn new_engine(store: Arc<MemoryStore>) -> QuizEngine {
    let clock = Arc::new(SystemClock);
    let registry = RoomRegistry::new(clock.clone(), Duration::from_secs(25), Duration::from_secs(60));
    QuizEngine::new(store, registry, clock, Arc::new(OsRandom), Config::default())
}

async fn seed_two_question_quiz(store: &MemoryStore, tenant: &IdentityContext) -> String {
    let quiz = store.create_quiz(tenant, None, "Geography", None).await.unwrap();
    store
        .add_question(
            tenant,
            &quiz.id,
            Question {
                id: "q1".into(),
                quiz_id: quiz.id.clone(),
                question_type: QuestionType::MultipleChoice,
                text: "Capital of France?".into(),
                order_index: 0,
                points: 10,
                time_limit_seconds: Some(20),
                options: QuestionOptions::MultipleChoice {
                    choices: vec![Choice { id: "a".into(), text: "Lyon".into() }, Choice { id: "b".into(), text: "Paris".into() }],
                    shuffle_options: None,
                },
                correct_answer: CorrectAnswer::MultipleChoice { answer: "b".into() },
                explanation: None,
                media_url: None,
            },
        )
        .await
        .unwrap();
    store
        .add_question(
            tenant,
            &quiz.id,
            Question {
                id: "q2".into(),
                quiz_id: quiz.id.clone(),
                question_type: QuestionType::TrueFalse,
                text: "The Amazon is in South America.".into(),
                order_index: 1,
                points: 10,
                time_limit_seconds: Some(15),
                options: QuestionOptions::TrueFalse {},
                correct_answer: CorrectAnswer::TrueFalse { answer: true },
                explanation: None,
                media_url: None,
            },
        )
        .await
        .unwrap();
    store.set_quiz_status(tenant, &quiz.id, QuizStatus::Published).await.unwrap();
    quiz.id
}

#[tokio::test]
async fn full_session_lifecycle_with_leaderboard_and_autoend() {
    let store = Arc::new(MemoryStore::new());
    let tenant = IdentityContext::new("school-a");
    store.seed_student(tenant.tenant_id(), "Dana Lee", "ext-42");

    let quiz_id = seed_two_question_quiz(&store, &tenant).await;
    let engine = new_engine(store.clone());

    let session = engine.create_session(&tenant, &quiz_id).await.unwrap();
    assert_eq!(session.snapshot.questions.len(), 2);

    engine.start(&tenant, &session.id).await.unwrap();

    let alice = engine.join(&session.room_code, Joiner::Guest { name: "Alice".into() }).await.unwrap();
    let bob = engine.join(&session.room_code, Joiner::Guest { name: "Bob".into() }).await.unwrap();
    let dana = engine
        .join(&session.room_code, Joiner::IdentifiedGuest { name: "Dana".into(), external_id: "ext-42".into() })
        .await
        .unwrap();
    assert!(dana.guest_token.is_some());

    let alice_token = alice.guest_token.clone().unwrap();
    let bob_token = bob.guest_token.clone().unwrap();
    let dana_token = dana.guest_token.clone().unwrap();

    // Alice answers both correctly and fastest.
    let out = engine
        .submit_answer(&session.id, &alice.participant.id, &alice_token, "q1", serde_json::json!({"selected": "b"}), 1000)
        .await
        .unwrap();
    assert_eq!(out.response.points_earned, 10);
    engine
        .submit_answer(&session.id, &alice.participant.id, &alice_token, "q2", serde_json::json!({"selected": true}), 1000)
        .await
        .unwrap();

    // Bob gets the first one wrong, the second one right.
    let out = engine
        .submit_answer(&session.id, &bob.participant.id, &bob_token, "q1", serde_json::json!({"selected": "a"}), 2000)
        .await
        .unwrap();
    assert_eq!(out.response.is_correct, Some(false));
    assert_eq!(out.response.points_earned, 0);
    assert!(matches!(out.reply, classquiz_core::quiz::messages::ServerMessage::AnswerSubmitted { correct_answer: Some(_), .. }));
    engine
        .submit_answer(&session.id, &bob.participant.id, &bob_token, "q2", serde_json::json!({"selected": true}), 1800)
        .await
        .unwrap();

    // Dana matches Alice's score but answers more slowly, so she ranks below.
    engine
        .submit_answer(&session.id, &dana.participant.id, &dana_token, "q1", serde_json::json!({"selected": "b"}), 3000)
        .await
        .unwrap();
    engine
        .submit_answer(&session.id, &dana.participant.id, &dana_token, "q2", serde_json::json!({"selected": true}), 3000)
        .await
        .unwrap();

    let leaderboard = engine.get_leaderboard(&tenant, &session.id, 10).await.unwrap();
    assert_eq!(leaderboard.len(), 3);
    assert_eq!(leaderboard[0].display_name, "Alice");
    assert_eq!(leaderboard[0].score, 20);
    assert_eq!(leaderboard[1].display_name, "Dana");
    assert_eq!(leaderboard[2].display_name, "Bob");
    assert_eq!(leaderboard[2].score, 10);

    // A second answer to an already-answered question is rejected.
    let err = engine
        .submit_answer(&session.id, &bob.participant.id, &bob_token, "q1", serde_json::json!({"selected": "b"}), 500)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    // auto_end resolves the session cross-tenant, as the scheduler does.
    let ended = engine.auto_end(&session.id).await.unwrap();
    assert_eq!(ended.status, classquiz_core::domain::session::SessionStatus::Completed);
    assert!(ended.auto_ended_at.is_some());

    let err = engine.end(&tenant, &session.id, EndReason::Cancelled).await.unwrap_err();
    assert!(matches!(err, CoreError::Precondition(_)));
}

#[tokio::test]
async fn join_rejects_unknown_room_code() {
    let store = Arc::new(MemoryStore::new());
    let engine = new_engine(store);
    let err = engine.join("ZZZZZZ", Joiner::Guest { name: "Nobody".into() }).await.unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));
}

#[tokio::test]
async fn join_rejects_unknown_student_external_id() {
    let store = Arc::new(MemoryStore::new());
    let tenant = IdentityContext::new("school-b");
    let quiz_id = seed_two_question_quiz(&store, &tenant).await;
    let engine = new_engine(store.clone());
    let session = engine.create_session(&tenant, &quiz_id).await.unwrap();

    let err = engine
        .join(&session.room_code, Joiner::Student { external_id: "does-not-exist".into() })
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
}
