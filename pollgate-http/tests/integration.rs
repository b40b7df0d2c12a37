use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use pollgate::poller::{DestinationResolver, ItemSource};
use pollgate::{BindingDirectory, InstantSleeper, SourceError};
use pollgate_http::{ApiClient, ApiConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// One-shot HTTP server that answers each connection with the next scripted response.
struct ScriptedServer {
    base_url: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl ScriptedServer {
    async fn start(script: Vec<(u16, &'static str)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        let mut script: VecDeque<_> = script.into();

        tokio::spawn(async move {
            while let Some((status, body)) = script.pop_front() {
                let Ok((mut socket, _)) = listener.accept().await else { return };
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                seen.lock().unwrap().push(String::from_utf8_lossy(&head).into_owned());
                let response = format!(
                    "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\n\
                     content-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        Self { base_url, requests }
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

fn client(server: &ScriptedServer) -> ApiClient {
    ApiClient::new(ApiConfig::new(&server.base_url).with_token("secret"))
        .unwrap()
        .with_sleeper(InstantSleeper)
}

#[tokio::test]
async fn fetch_retries_transient_status_and_sends_bearer_token() {
    let server = ScriptedServer::start(vec![
        (503, "{}"),
        (200, r#"{"data": [{"id": 1, "status": "Новая", "teacher_id": 4}, {"status": "x"}]}"#),
    ])
    .await;

    let items = client(&server).fetch_all().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, "1");
    assert_eq!(items[0].owner_ref.as_deref(), Some("4"));

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    for request in &requests {
        assert!(request.starts_with("GET /courseworks "));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer secret"));
    }
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    let server = ScriptedServer::start(vec![(502, "{}"), (502, "{}"), (502, "{}")]).await;

    let err = client(&server).fetch_all().await.unwrap_err();
    assert!(matches!(err, SourceError::Status { status: 502, .. }));
    assert_eq!(server.requests().len(), 3);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = ScriptedServer::start(vec![(401, "{}")]).await;

    let err = client(&server).fetch_all().await.unwrap_err();
    assert!(matches!(err, SourceError::Status { status: 401, .. }));
    assert_eq!(server.requests().len(), 1);
}

#[tokio::test]
async fn resolver_reads_chat_id_from_owner_record() {
    let server = ScriptedServer::start(vec![
        (200, r#"{"id": 4, "telegram_chat_id": "-1001"}"#),
        (404, "{}"),
        (200, r#"{"id": 9, "name": "Ann"}"#),
    ])
    .await;
    let api = client(&server);

    let destination = api.resolve("4").await.unwrap().unwrap();
    assert_eq!(destination.chat_id, -1001);
    assert!(api.resolve("5").await.unwrap().is_none());
    let student = api.related("9").await.unwrap().unwrap();
    assert_eq!(student["name"], "Ann");

    let paths: Vec<_> = server
        .requests()
        .iter()
        .map(|r| r.split_whitespace().nth(1).unwrap_or_default().to_string())
        .collect();
    assert_eq!(paths, ["/teacher/4", "/teacher/5", "/student/9"]);
}

#[tokio::test]
async fn directory_lists_owner_records() {
    let server =
        ScriptedServer::start(vec![(200, r#"[{"id": 1, "chat_id": 7}, {"id": 2}]"#)]).await;

    let records = client(&server).list_records().await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(server.requests()[0].starts_with("GET /teachers "));
}

#[tokio::test]
async fn garbage_body_is_malformed() {
    let server = ScriptedServer::start(vec![(200, "not json")]).await;

    let err = client(&server).fetch_all().await.unwrap_err();
    assert!(matches!(err, SourceError::Malformed { .. }));
}

#[tokio::test]
#[ignore = "needs a live API at POLLGATE_TEST_API_URL"]
async fn live_api_lists_items() {
    let Ok(url) = std::env::var("POLLGATE_TEST_API_URL") else { return };
    let token = std::env::var("POLLGATE_TEST_API_TOKEN").unwrap_or_default();
    let api = ApiClient::new(ApiConfig::new(url).with_token(token)).unwrap();
    api.fetch_all().await.unwrap();
}
