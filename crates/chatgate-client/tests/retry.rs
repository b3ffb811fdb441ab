use std::sync::Arc;
use std::time::Duration;

use chatgate_client::{ChatClient, ClientError};
use chatgate_config::{Admission, Auth, Cache, Config, Llm, Server, Store};
use chatgate_contracts::CONFLICT_MESSAGE;
use chatgate_kernel::RetryPolicy;
use chatgate_server::{build_service, SessionRegistry};
use jsonwebtoken::{encode, get_current_timestamp, EncodingKey, Header};
use serde_json::json;

const SECRET: &str = "client-test-secret";

fn test_config() -> Config {
    Config {
        server: Server {
            listen_addr: "127.0.0.1:0".to_string(),
            max_concurrent_per_client: 100,
            compression: true,
        },
        auth: Auth {
            jwt_secret: Some(SECRET.to_string()),
            jwt_secret_env: "CHATGATE_CLIENT_TEST_UNUSED".to_string(),
        },
        admission: Admission::default(),
        store: Store {
            kind: "memory".to_string(),
            sqlite_path: None,
        },
        llm: Llm {
            mode: "echo".to_string(),
            endpoint: "http://127.0.0.1:9".to_string(),
            api_key_env: "CHATGATE_CLIENT_TEST_NO_KEY".to_string(),
            model: "test".to_string(),
            timeout_ms: 1_000,
            retry_max_attempts: 1,
            retry_backoff_ms: 0,
            context_window: 10,
            system_prompt: None,
        },
        cache: Cache::default(),
    }
}

fn token(user_id: &str) -> String {
    encode(
        &Header::default(),
        &json!({"id": user_id, "exp": get_current_timestamp() + 600}),
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

fn fast_policy(max_retries: usize) -> RetryPolicy {
    RetryPolicy {
        initial_delay: Duration::from_millis(20),
        factor: 1.5,
        max_delay: Duration::from_millis(100),
        max_retries,
    }
}

async fn start_server() -> (String, Arc<SessionRegistry>) {
    let service = build_service(test_config()).await.unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, service.router).await.unwrap();
    });
    (format!("http://{addr}"), service.sessions)
}

#[tokio::test]
async fn retries_until_the_other_tab_finishes() {
    let (base, sessions) = start_server().await;
    let client = ChatClient::new(&base, &token("u1"), "tab-b").with_retry_policy(fast_policy(5));
    let chat = client.create_chat(Some("busy")).await.unwrap();

    let held = sessions.admit(&chat.id, "tab-a", "u1").unwrap();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(40)).await;
        drop(held);
    });

    let sent = client.send_message(&chat.id, "hello").await.unwrap();
    assert_eq!(sent.assistant_message.content, "echo: hello");
    assert_eq!(sessions.get(&chat.id).unwrap().client_instance_id, "tab-b");
}

#[tokio::test]
async fn gives_up_with_server_message_after_last_retry() {
    let (base, sessions) = start_server().await;
    let client = ChatClient::new(&base, &token("u1"), "tab-b").with_retry_policy(fast_policy(2));
    let chat = client.create_chat(None).await.unwrap();

    let _held = sessions.admit(&chat.id, "tab-a", "u1").unwrap();
    match client.send_message(&chat.id, "hello").await {
        Err(ClientError::Conflict(message)) => assert_eq!(message, CONFLICT_MESSAGE),
        other => panic!("expected conflict, got {other:?}"),
    }
    let detail = client.get_chat(&chat.id).await.unwrap();
    assert!(detail.messages.is_empty());
}

#[tokio::test]
async fn other_errors_are_not_retried() {
    let (base, _sessions) = start_server().await;
    let client = ChatClient::new(&base, &token("u1"), "tab-b").with_retry_policy(fast_policy(3));
    match client.send_message("missing-chat", "hello").await {
        Err(ClientError::Http { status, message }) => {
            assert_eq!(status, 404);
            assert_eq!(message, "Chat not found");
        }
        other => panic!("expected 404, got {other:?}"),
    }
    assert_eq!(client.list_chats().await.unwrap().len(), 0);
}
