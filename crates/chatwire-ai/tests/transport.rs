use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use chatwire_ai::{
    CompletionEvent, GenerationOptions, InferenceClient, InferenceConfig, InferenceErrorCode,
    Message,
};
use serde_json::{json, Value};

struct MockResponse {
    status: &'static str,
    content_type: &'static str,
    pieces: Vec<String>,
}

impl MockResponse {
    fn json(status: &'static str, body: Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            pieces: vec![body.to_string()],
        }
    }

    fn text(status: &'static str, body: &str) -> Self {
        Self {
            status,
            content_type: "text/plain",
            pieces: vec![body.to_string()],
        }
    }

    fn sse(pieces: Vec<String>) -> Self {
        Self {
            status: "200 OK",
            content_type: "text/event-stream",
            pieces,
        }
    }
}

struct CapturedRequest {
    head: String,
    body: Value,
}

impl CapturedRequest {
    fn has_header(&self, name: &str, value: &str) -> bool {
        let expected = format!("{}: {}", name.to_ascii_lowercase(), value);
        self.head
            .lines()
            .any(|line| line.to_ascii_lowercase() == expected.to_ascii_lowercase())
    }
}

fn read_request(socket: &mut std::net::TcpStream) -> CapturedRequest {
    let mut raw = Vec::new();
    let mut buffer = [0_u8; 4096];
    let header_end = loop {
        let read = socket.read(&mut buffer).expect("read request");
        assert!(read > 0, "client closed before sending headers");
        raw.extend_from_slice(&buffer[..read]);
        if let Some(position) = raw.windows(4).position(|window| window == b"\r\n\r\n") {
            break position + 4;
        }
    };

    let head = String::from_utf8_lossy(&raw[..header_end]).to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    while raw.len() < header_end + content_length {
        let read = socket.read(&mut buffer).expect("read request body");
        if read == 0 {
            break;
        }
        raw.extend_from_slice(&buffer[..read]);
    }

    let body = serde_json::from_slice(&raw[header_end..]).unwrap_or(Value::Null);
    CapturedRequest { head, body }
}

fn spawn_server(response: MockResponse) -> (String, mpsc::Receiver<CapturedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind local test server");
    let address = listener.local_addr().expect("server local addr");
    let (sender, receiver) = mpsc::channel();

    thread::spawn(move || {
        if let Ok((mut socket, _)) = listener.accept() {
            socket
                .set_read_timeout(Some(Duration::from_secs(2)))
                .expect("set read timeout");
            let request = read_request(&mut socket);
            let _ = sender.send(request);

            let length: usize = response.pieces.iter().map(String::len).sum();
            let head = format!(
                "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {length}\r\nConnection: close\r\n\r\n",
                response.status, response.content_type
            );
            socket.write_all(head.as_bytes()).expect("write head");
            for piece in &response.pieces {
                socket.write_all(piece.as_bytes()).expect("write body piece");
                let _ = socket.flush();
                thread::sleep(Duration::from_millis(5));
            }
        }
    });

    (format!("http://{address}/v1/chat/completions"), receiver)
}

fn client(endpoint: String) -> InferenceClient {
    InferenceClient::new(InferenceConfig::new(endpoint, "gpt-4o-mini").with_api_key("sk-test"))
}

fn conversation() -> Vec<Message> {
    vec![
        Message::system("You are terse."),
        Message::user("Say hi"),
    ]
}

fn delta_event(content: &str) -> String {
    format!(
        "data: {}\n\n",
        json!({ "choices": [{ "index": 0, "delta": { "content": content } }] })
    )
}

#[tokio::test]
async fn send_completion_returns_first_choice_content() {
    let (endpoint, requests) = spawn_server(MockResponse::json(
        "200 OK",
        json!({
            "id": "chatcmpl-1",
            "choices": [{ "index": 0, "message": { "role": "assistant", "content": "Hi there" } }]
        }),
    ));

    let options = GenerationOptions {
        temperature: Some(5.0),
        ..GenerationOptions::default()
    };
    let text = client(endpoint)
        .send_completion("gpt-4o-mini", &conversation(), &options)
        .await
        .expect("completion succeeds");
    assert_eq!(text, "Hi there");

    let request = requests.recv().expect("captured request");
    assert!(request.head.starts_with("POST /v1/chat/completions "));
    assert!(request.has_header("authorization", "Bearer sk-test"));
    assert_eq!(request.body["model"], "gpt-4o-mini");
    assert_eq!(request.body["stream"], false);
    assert_eq!(request.body["temperature"], 2.0);
    assert_eq!(request.body["messages"][0]["role"], "system");
    assert_eq!(request.body["messages"][1]["content"], "Say hi");
}

#[tokio::test]
async fn empty_model_id_uses_configured_default_and_key_is_optional() {
    let (endpoint, requests) = spawn_server(MockResponse::json("200 OK", json!({ "choices": [] })));

    let client = InferenceClient::new(InferenceConfig::new(endpoint, "deepseek-chat"));
    let text = client
        .send_completion("", &conversation(), &GenerationOptions::default())
        .await
        .expect("completion succeeds");
    assert_eq!(text, "");

    let request = requests.recv().expect("captured request");
    assert_eq!(request.body["model"], "deepseek-chat");
    assert!(!request.head.to_ascii_lowercase().contains("authorization:"));
}

#[tokio::test]
async fn http_error_with_code_and_message() {
    let (endpoint, _requests) = spawn_server(MockResponse::json(
        "429 Too Many Requests",
        json!({ "error": { "code": "rate_limit_exceeded", "message": "slow down" } }),
    ));

    let error = client(endpoint)
        .send_completion("gpt-4o", &conversation(), &GenerationOptions::default())
        .await
        .expect_err("429 is an error");

    assert_eq!(error.code, InferenceErrorCode::ProviderHttp);
    assert_eq!(error.status, Some(429));
    assert_eq!(error.message, "slow down (code: rate_limit_exceeded)");
    assert!(error.details.is_some());
}

#[tokio::test]
async fn http_error_with_plain_text_body() {
    let (endpoint, _requests) =
        spawn_server(MockResponse::text("502 Bad Gateway", "upstream exploded"));

    let error = client(endpoint)
        .send_completion("gpt-4o", &conversation(), &GenerationOptions::default())
        .await
        .expect_err("502 is an error");

    assert_eq!(error.status, Some(502));
    assert_eq!(error.message, "upstream exploded");
    assert_eq!(error.details, None);
}

#[tokio::test]
async fn undecodable_success_body_is_a_protocol_error() {
    let (endpoint, _requests) = spawn_server(MockResponse::text("200 OK", "<html>oops</html>"));

    let error = client(endpoint)
        .send_completion("gpt-4o", &conversation(), &GenerationOptions::default())
        .await
        .expect_err("html is not a completion");
    assert_eq!(error.code, InferenceErrorCode::ProviderProtocol);
}

#[tokio::test]
async fn unreachable_endpoint_is_a_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let address = listener.local_addr().expect("local addr");
    drop(listener);

    let error = client(format!("http://{address}/v1/chat/completions"))
        .send_completion("gpt-4o", &conversation(), &GenerationOptions::default())
        .await
        .expect_err("nothing listens there");
    assert_eq!(error.code, InferenceErrorCode::ProviderTransport);
    assert_eq!(error.status, None);
}

#[tokio::test]
async fn streaming_completion_delivers_deltas_split_across_writes() {
    let body = format!(
        "{}{}{}data: [DONE]\n\n",
        delta_event("Hel"),
        delta_event("lo 👋"),
        delta_event("!")
    );
    let bytes = body.as_bytes();
    let cut_points = [7, 40, 95, bytes.len() - 3];
    let mut pieces = Vec::new();
    let mut start = 0;
    for cut in cut_points {
        pieces.push(String::from_utf8_lossy(&bytes[start..cut]).to_string());
        start = cut;
    }
    pieces.push(String::from_utf8_lossy(&bytes[start..]).to_string());
    assert_eq!(pieces.concat(), body, "cut points stay on char boundaries");

    let (endpoint, requests) = spawn_server(MockResponse::sse(pieces));

    let mut deltas = Vec::new();
    let summary = client(endpoint)
        .send_streaming_completion(
            "gpt-4o-mini",
            &conversation(),
            &GenerationOptions::default(),
            |content| {
                deltas.push(content);
                async {}
            },
        )
        .await
        .expect("stream succeeds");

    assert_eq!(deltas, vec!["Hel", "lo 👋", "!"]);
    assert!(summary.terminated_by_sentinel);

    let request = requests.recv().expect("captured request");
    assert!(request.has_header("accept", "text/event-stream"));
    assert_eq!(request.body["stream"], true);
}

#[tokio::test]
async fn streaming_http_error_reads_json_error_body() {
    let (endpoint, _requests) = spawn_server(MockResponse::json(
        "401 Unauthorized",
        json!({ "error": { "message": "invalid api key" } }),
    ));

    let error = client(endpoint)
        .send_streaming_completion(
            "gpt-4o",
            &conversation(),
            &GenerationOptions::default(),
            |_content| async {},
        )
        .await
        .expect_err("401 is an error");

    assert_eq!(error.code, InferenceErrorCode::ProviderHttp);
    assert_eq!(error.status, Some(401));
    assert_eq!(error.message, "invalid api key");
}

#[tokio::test]
async fn streaming_http_error_without_json_uses_status_text() {
    let (endpoint, _requests) =
        spawn_server(MockResponse::text("503 Service Unavailable", "try later"));

    let error = client(endpoint)
        .send_streaming_completion(
            "gpt-4o",
            &conversation(),
            &GenerationOptions::default(),
            |_content| async {},
        )
        .await
        .expect_err("503 is an error");

    assert_eq!(error.status, Some(503));
    assert_eq!(error.message, "HTTP 503 Service Unavailable");
}

#[tokio::test]
async fn stream_completion_publishes_deltas_then_done() {
    let body = format!("{}{}data: [DONE]\n\n", delta_event("a"), delta_event("b"));
    let (endpoint, _requests) = spawn_server(MockResponse::sse(vec![body]));

    let stream = client(endpoint).stream_completion(
        "gpt-4o-mini",
        conversation(),
        GenerationOptions::default(),
    );

    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }

    assert_eq!(
        events,
        vec![
            CompletionEvent::Delta {
                content: "a".to_string()
            },
            CompletionEvent::Delta {
                content: "b".to_string()
            },
            CompletionEvent::Done {
                text: "ab".to_string()
            },
        ]
    );
    assert_eq!(stream.result().await, Ok("ab".to_string()));
}

#[tokio::test]
async fn stream_completion_reports_errors_as_terminal_event() {
    let (endpoint, _requests) = spawn_server(MockResponse::json(
        "400 Bad Request",
        json!({ "error": "context length exceeded" }),
    ));

    let stream = client(endpoint).stream_completion(
        "gpt-4o-mini",
        conversation(),
        GenerationOptions::default(),
    );

    let error = stream.result().await.expect_err("400 is an error");
    assert_eq!(error.status, Some(400));
    assert_eq!(error.message, "context length exceeded");
}
