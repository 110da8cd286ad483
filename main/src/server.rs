use std::{sync::Arc, time::Duration};

use api_router::{api_routes_v1, api_state::ApiState};
use axum::Router;
use chat_pipeline::{OpenAiCompletion, SlidingWindowQuota, TurnDeps};
use common::{
    storage::db::SurrealDbClient,
    utils::{config::get_config, embedding::EmbeddingProvider},
};
use retrieval_pipeline::VectorContextSource;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    // Get config
    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );

    // Ensure db schema and indexes are in place
    db.ensure_initialized(config.embedding_dimensions).await?;

    let openai_client = Arc::new(async_openai::Client::with_config(
        async_openai::config::OpenAIConfig::new()
            .with_api_key(&config.openai_api_key)
            .with_api_base(&config.openai_base_url),
    ));

    let embedding_provider = EmbeddingProvider::from_config(&config, Arc::clone(&openai_client));
    info!(
        embedding_backend = embedding_provider.backend_label(),
        embedding_dimensions = embedding_provider.dimensions(),
        "Embedding provider initialized"
    );

    let timeout = Duration::from_secs(config.request_timeout_secs);
    let turn = TurnDeps {
        db: Arc::clone(&db),
        context: Arc::new(VectorContextSource::new(
            Arc::clone(&db),
            embedding_provider,
            timeout,
        )),
        completion: Arc::new(OpenAiCompletion::new(
            Arc::clone(&openai_client),
            config.chat_model.clone(),
            timeout,
        )),
        quota: Arc::new(SlidingWindowQuota::new(
            Arc::clone(&db),
            config.rate_limit_max_messages,
            config.rate_limit_window_secs,
        )),
        retrieval_top_k: config.retrieval_top_k,
    };

    let api_state = ApiState::new(db, config.clone(), turn);

    // Create Axum router
    let app = Router::new()
        .nest("/api/v1", api_routes_v1(&api_state))
        .with_state(api_state);

    info!("Starting server listening on 0.0.0.0:{}", config.http_port);
    let serve_address = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(serve_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use chat_pipeline::{prompt::GENERAL_HEADER, ScriptedCompletion};
    use common::storage::types::{
        chatbot::Chatbot,
        conversation::Conversation,
        message::{Message, MessageRole},
        source_chunk::SourceChunk,
        user::User,
    };
    use common::utils::config::{AppConfig, EmbeddingBackend};
    use tower::ServiceExt;
    use uuid::Uuid;

    const TEST_DIMENSION: u32 = 3;

    async fn test_app(completion: ScriptedCompletion) -> (Router, Arc<SurrealDbClient>) {
        let namespace = "test_ns";
        let database = Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory(namespace, &database)
                .await
                .expect("failed to start in-memory surrealdb"),
        );
        db.ensure_initialized(TEST_DIMENSION)
            .await
            .expect("failed to initialize schema");

        let config = AppConfig {
            openai_api_key: "test-key".into(),
            surrealdb_address: "mem://".into(),
            surrealdb_namespace: namespace.into(),
            surrealdb_database: database,
            embedding_dimensions: TEST_DIMENSION,
            embedding_backend: EmbeddingBackend::Hashed,
            aggregation_secret: Some("job-secret".into()),
            ..AppConfig::default()
        };

        let turn = TurnDeps {
            db: Arc::clone(&db),
            context: Arc::new(VectorContextSource::new(
                Arc::clone(&db),
                EmbeddingProvider::new_hashed(TEST_DIMENSION),
                Duration::from_secs(5),
            )),
            completion: Arc::new(completion),
            quota: Arc::new(SlidingWindowQuota::new(
                Arc::clone(&db),
                config.rate_limit_max_messages,
                config.rate_limit_window_secs,
            )),
            retrieval_top_k: config.retrieval_top_k,
        };

        let api_state = ApiState::new(Arc::clone(&db), config, turn);
        let app = Router::new()
            .nest("/api/v1", api_routes_v1(&api_state))
            .with_state(api_state);
        (app, db)
    }

    async fn seed_chatbot(db: &SurrealDbClient) -> String {
        let chatbot = Chatbot::new(
            "Staff bot".to_string(),
            "You are the staff assistant.".to_string(),
            "staff".to_string(),
        );
        let chatbot_id = chatbot.id.clone();
        db.store_item(chatbot)
            .await
            .expect("failed to store chatbot");
        chatbot_id
    }

    async fn seed_chunk(db: &SurrealDbClient, text: &str) {
        let embedding = EmbeddingProvider::new_hashed(TEST_DIMENSION)
            .embed(text)
            .await
            .expect("failed to embed chunk");
        let chunk = SourceChunk::new(
            "staff".to_string(),
            "source-1".to_string(),
            "Handbook".to_string(),
            text.to_string(),
            Some(4),
            Some("Scheduling".to_string()),
            embedding,
        );
        db.store_item(chunk).await.expect("failed to store chunk");
    }

    fn turn_json(chatbot_id: &str) -> serde_json::Value {
        serde_json::json!({
            "messages": [{"role": "user", "content": "how are shifts planned?"}],
            "chatbotId": chatbot_id,
        })
    }

    async fn post_json(
        app: Router,
        uri: &str,
        body: serde_json::Value,
        bearer: Option<&str>,
    ) -> axum::response::Response {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = bearer {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::from(body.to_string())).expect("request");
        app.oneshot(request).await.expect("router response")
    }

    fn header(response: &axum::response::Response, name: &str) -> String {
        response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("failed to read body");
        String::from_utf8(bytes.to_vec()).expect("body was not utf8")
    }

    // The outbox persists after the stream closes. The conversation counter
    // is written after the assistant message, so polling it covers both.
    async fn wait_for_conversation_count(db: &SurrealDbClient, conversation_id: &str, expected: u32) {
        for _ in 0..200 {
            let conversation: Option<Conversation> = db
                .get_item(conversation_id)
                .await
                .expect("conversation query failed");
            if conversation.map_or(0, |c| c.message_count) == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("conversation never reached a message count of {expected}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn smoke_startup_with_in_memory_surrealdb() {
        let (app, _db) = test_app(ScriptedCompletion::default()).await;

        let live = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/live")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("router response");
        assert_eq!(live.status(), StatusCode::OK);

        let ready = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/ready")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("ready response");
        assert_eq!(ready.status(), StatusCode::OK);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn turn_streams_answer_and_persists_conversation() {
        let completion = ScriptedCompletion::replying(&["Plans ", "are ", "weekly."]);
        let (app, db) = test_app(completion).await;
        let chatbot_id = seed_chatbot(&db).await;
        seed_chunk(&db, "Shifts are planned weekly.").await;

        let response = post_json(app, "/api/v1/chat/turn", turn_json(&chatbot_id), None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let conversation_id = header(&response, "x-conversation-id");
        assert!(!conversation_id.is_empty());

        let body = body_text(response).await;
        assert!(body.contains("data: Plans"), "body was: {body}");
        assert!(body.contains("event: done"), "body was: {body}");

        wait_for_conversation_count(&db, &conversation_id, 2).await;
        let messages = Message::for_conversation(&db, &conversation_id)
            .await
            .expect("failed to load messages");
        assert_eq!(messages.len(), 2);
        assert_eq!(
            messages.first().expect("user message").role,
            MessageRole::User
        );
        let assistant = messages.last().expect("assistant message");
        assert_eq!(assistant.role, MessageRole::Assistant);
        assert_eq!(assistant.content, "Plans are weekly.");
        assert!(assistant.context.is_some());

        let conversation: Conversation = db
            .get_item(&conversation_id)
            .await
            .expect("failed to load conversation")
            .expect("conversation missing");
        assert_eq!(conversation.message_count, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_chatbot_is_not_found_end_to_end() {
        let (app, db) = test_app(ScriptedCompletion::default()).await;

        let response = post_json(app, "/api/v1/chat/turn", turn_json("missing-bot"), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = body_text(response).await;
        assert!(body.contains("chatbot not found"), "body was: {body}");

        let messages: Vec<Message> = db
            .get_all_stored_items()
            .await
            .expect("failed to list messages");
        assert!(messages.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn eleventh_turn_in_window_is_rate_limited() {
        let (app, db) = test_app(ScriptedCompletion::replying(&["never sent"])).await;
        let chatbot_id = seed_chatbot(&db).await;

        let user = User::find_or_create_by_subject(&db, "caller-1")
            .await
            .expect("failed to create user");
        for _ in 0..10 {
            let message = Message::user(
                "conv-prior".to_string(),
                Some(user.id.clone()),
                "hello".to_string(),
            );
            db.store_item(message)
                .await
                .expect("failed to seed message");
        }

        let response = post_json(
            app,
            "/api/v1/chat/turn",
            turn_json(&chatbot_id),
            Some("caller-1"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&response, "x-ratelimit-limit"), "10");
        assert_eq!(header(&response, "x-ratelimit-remaining"), "0");

        let messages: Vec<Message> = db
            .get_all_stored_items()
            .await
            .expect("failed to list messages");
        assert_eq!(messages.len(), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn turn_without_matching_chunks_uses_general_prompt() {
        let completion = ScriptedCompletion::replying(&["I can still help."]);
        let (app, db) = test_app(completion.clone()).await;
        let chatbot_id = seed_chatbot(&db).await;

        let response = post_json(app, "/api/v1/chat/turn", turn_json(&chatbot_id), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let conversation_id = header(&response, "x-conversation-id");

        let body = body_text(response).await;
        assert!(body.contains("event: done"), "body was: {body}");

        wait_for_conversation_count(&db, &conversation_id, 2).await;
        let messages = Message::for_conversation(&db, &conversation_id)
            .await
            .expect("failed to load messages");
        let assistant = messages.last().expect("assistant message");
        assert!(assistant.context.is_none());
        assert!(assistant.source_ids.is_none());

        let prompts = completion.recorded_prompts();
        assert!(prompts
            .first()
            .expect("no prompt recorded")
            .contains(GENERAL_HEADER));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn aggregation_trigger_requires_job_secret() {
        let (app, _db) = test_app(ScriptedCompletion::default()).await;

        let forbidden = post_json(
            app.clone(),
            "/api/v1/jobs/aggregate-performance",
            serde_json::json!({}),
            Some("wrong-secret"),
        )
        .await;
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

        let allowed = post_json(
            app,
            "/api/v1/jobs/aggregate-performance",
            serde_json::json!({}),
            Some("job-secret"),
        )
        .await;
        assert_eq!(allowed.status(), StatusCode::OK);

        let report: serde_json::Value =
            serde_json::from_str(&body_text(allowed).await).expect("body was not json");
        assert_eq!(report["success"], serde_json::json!(true));
        assert_eq!(report["processed"]["events"], serde_json::json!(0));
    }
}
