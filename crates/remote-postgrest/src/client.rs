//! HTTP client for a PostgREST-style backend.
//!
//! Each collection maps to one table under the base URL. Reads are plain
//! `GET {base}/{table}` with PostgREST filter operators in the query string;
//! writes are batched `POST` upserts with
//! `Prefer: resolution=merge-duplicates,return=representation` so the server
//! echoes stored rows (including assigned ids) back in input order.

use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use std::time::Duration;

use rollcall_core::remote::{Filter, RemoteError, RemoteStore};
use rollcall_core::store::Collection;

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_LOG_BODY_CHARS: usize = 512;

/// Environment variable naming the backend root URL.
pub const API_URL_ENV: &str = "ROLLCALL_API_URL";
/// Environment variable holding the project API key, if the backend uses one.
pub const API_KEY_ENV: &str = "ROLLCALL_API_KEY";

#[derive(serde::Deserialize)]
struct ApiErrorBody {
    message: String,
    #[serde(default)]
    code: Option<String>,
}

/// Client for the shared PostgREST backend.
#[derive(Debug, Clone)]
pub struct PostgrestClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl PostgrestClient {
    /// Create a client for the given backend root URL.
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: None,
        }
    }

    /// Attach a project API key, sent as the `apikey` header on every call.
    pub fn with_api_key(mut self, api_key: &str) -> Self {
        self.api_key = Some(api_key.to_string());
        self
    }

    /// Build a client from `ROLLCALL_API_URL` and optional `ROLLCALL_API_KEY`.
    pub fn from_env() -> Result<Self, RemoteError> {
        let base_url = std::env::var(API_URL_ENV)
            .map_err(|_| RemoteError::Auth(format!("{API_URL_ENV} is not set")))?;
        let mut client = Self::new(&base_url);
        if let Ok(api_key) = std::env::var(API_KEY_ENV) {
            client = client.with_api_key(&api_key);
        }
        Ok(client)
    }

    fn log_response(status: reqwest::StatusCode, body: &str) {
        if status.is_success() {
            debug!("API response status: {}", status);
            return;
        }

        let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
        if body.chars().count() > MAX_LOG_BODY_CHARS {
            preview.push_str("...");
        }
        debug!("API response error ({}): {}", status, preview);
    }

    /// Create headers for an API request.
    fn headers(&self, token: &str) -> Result<HeaderMap, RemoteError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| RemoteError::Auth("Invalid access token format".to_string()))?;
        headers.insert(AUTHORIZATION, auth_value);

        if let Some(api_key) = self.api_key.as_deref() {
            let key_value = HeaderValue::from_str(api_key)
                .map_err(|_| RemoteError::Auth("Invalid API key format".to_string()))?;
            headers.insert("apikey", key_value);
        }

        Ok(headers)
    }

    /// Render a filter as a PostgREST query-string clause, or `None` for an
    /// unfiltered request.
    fn filter_clause(filter: &Filter) -> Option<String> {
        match filter {
            Filter::All => None,
            Filter::Eq(column, value) => {
                Some(format!("{}=eq.{}", column, urlencoding::encode(value)))
            }
            Filter::AnyOf(column, values) => {
                let encoded: Vec<String> = values
                    .iter()
                    .map(|value| urlencoding::encode(value).into_owned())
                    .collect();
                Some(format!("{}=in.({})", column, encoded.join(",")))
            }
        }
    }

    fn table_url(&self, collection: Collection, clauses: &[String]) -> String {
        let mut url = format!("{}/{}", self.base_url, collection.remote_table());
        if !clauses.is_empty() {
            url.push('?');
            url.push_str(&clauses.join("&"));
        }
        url
    }

    /// Check the status and parse a JSON response body.
    async fn parse_response(response: reqwest::Response) -> Result<Vec<Value>, RemoteError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| RemoteError::Transport(err.to_string()))?;
        Self::log_response(status, &body);

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<ApiErrorBody>(&body) {
                let code = error.code.as_deref().unwrap_or("error");
                return Err(RemoteError::api(
                    status.as_u16(),
                    format!("{}: {}", code, error.message),
                ));
            }
            return Err(RemoteError::api(
                status.as_u16(),
                format!("Request failed: {}", body),
            ));
        }

        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&body).map_err(|err| {
            log::error!("Failed to deserialize response. Body: {}, Error: {}", body, err);
            RemoteError::Payload(format!("expected a JSON array of rows: {err}"))
        })
    }

    async fn check_status(response: reqwest::Response) -> Result<(), RemoteError> {
        let status = response.status();
        if status.is_success() {
            debug!("API response status: {}", status);
            return Ok(());
        }
        let body = response
            .text()
            .await
            .map_err(|err| RemoteError::Transport(err.to_string()))?;
        Self::log_response(status, &body);
        if let Ok(error) = serde_json::from_str::<ApiErrorBody>(&body) {
            let code = error.code.as_deref().unwrap_or("error");
            return Err(RemoteError::api(
                status.as_u16(),
                format!("{}: {}", code, error.message),
            ));
        }
        Err(RemoteError::api(
            status.as_u16(),
            format!("Request failed: {}", body),
        ))
    }
}

#[async_trait::async_trait]
impl RemoteStore for PostgrestClient {
    /// Fetch rows from one table.
    ///
    /// GET {base}/{table}?select=*&{filter}
    async fn select(
        &self,
        token: &str,
        collection: Collection,
        filter: Filter,
    ) -> Result<Vec<Value>, RemoteError> {
        let mut clauses = vec!["select=*".to_string()];
        if let Some(clause) = Self::filter_clause(&filter) {
            clauses.push(clause);
        }
        let url = self.table_url(collection, &clauses);
        debug!("select {}: {}", collection, url);

        let response = self
            .client
            .get(&url)
            .headers(self.headers(token)?)
            .send()
            .await
            .map_err(|err| RemoteError::Transport(err.to_string()))?;

        Self::parse_response(response).await
    }

    /// Upsert a batch of rows into one table.
    ///
    /// POST {base}/{table} with merge-duplicates resolution; the response
    /// carries the stored rows in input order.
    async fn upsert(
        &self,
        token: &str,
        collection: Collection,
        rows: Vec<Value>,
    ) -> Result<Vec<Value>, RemoteError> {
        let url = self.table_url(collection, &[]);
        debug!("upsert {}: {} rows", collection, rows.len());

        let mut headers = self.headers(token)?;
        headers.insert(
            "Prefer",
            HeaderValue::from_static("resolution=merge-duplicates,return=representation"),
        );

        let response = self
            .client
            .post(&url)
            .headers(headers)
            .json(&rows)
            .send()
            .await
            .map_err(|err| RemoteError::Transport(err.to_string()))?;

        Self::parse_response(response).await
    }

    /// Delete rows matching the filter from one table.
    ///
    /// DELETE {base}/{table}?{filter}
    async fn delete(
        &self,
        token: &str,
        collection: Collection,
        filter: Filter,
    ) -> Result<(), RemoteError> {
        let mut clauses = Vec::new();
        if let Some(clause) = Self::filter_clause(&filter) {
            clauses.push(clause);
        }
        let url = self.table_url(collection, &clauses);
        debug!("delete {}: {}", collection, url);

        let mut headers = self.headers(token)?;
        headers.insert("Prefer", HeaderValue::from_static("return=minimal"));

        let response = self
            .client
            .delete(&url)
            .headers(headers)
            .send()
            .await
            .map_err(|err| RemoteError::Transport(err.to_string()))?;

        Self::check_status(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::remote::RemoteRetryClass;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::Mutex as TokioMutex;

    #[derive(Debug, Clone)]
    struct CapturedRequest {
        method: String,
        path_and_query: String,
        headers: HashMap<String, String>,
        body: String,
    }

    fn header_end_offset(buffer: &[u8]) -> Option<usize> {
        buffer.windows(4).position(|window| window == b"\r\n\r\n")
    }

    async fn read_http_request(stream: &mut tokio::net::TcpStream) -> Option<CapturedRequest> {
        let mut buffer = Vec::new();
        loop {
            let mut chunk = [0_u8; 2048];
            let read = stream.read(&mut chunk).await.ok()?;
            if read == 0 {
                return None;
            }
            buffer.extend_from_slice(&chunk[..read]);
            if header_end_offset(&buffer).is_some() {
                break;
            }
        }

        let header_end = header_end_offset(&buffer)?;
        let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
        let mut lines = head.lines();
        let request_line = lines.next()?.to_string();
        let mut parts = request_line.split_whitespace();
        let method = parts.next()?.to_string();
        let path_and_query = parts.next()?.to_string();

        let mut headers = HashMap::new();
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        let content_length = headers
            .get("content-length")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);

        let mut body = buffer[header_end + 4..].to_vec();
        while body.len() < content_length {
            let mut chunk = [0_u8; 2048];
            let read = stream.read(&mut chunk).await.ok()?;
            if read == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..read]);
        }

        Some(CapturedRequest {
            method,
            path_and_query,
            headers,
            body: String::from_utf8_lossy(&body).to_string(),
        })
    }

    fn status_text(status: u16) -> &'static str {
        match status {
            200 => "OK",
            201 => "Created",
            204 => "No Content",
            401 => "Unauthorized",
            409 => "Conflict",
            500 => "Internal Server Error",
            _ => "Error",
        }
    }

    async fn write_http_response(
        stream: &mut tokio::net::TcpStream,
        status: u16,
        body: &str,
    ) -> std::io::Result<()> {
        let response = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            status_text(status),
            body.len(),
            body
        );
        stream.write_all(response.as_bytes()).await?;
        stream.flush().await
    }

    async fn start_mock_server(
        responses: Vec<(u16, String)>,
    ) -> (
        String,
        Arc<TokioMutex<Vec<CapturedRequest>>>,
        tokio::task::JoinHandle<()>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("listener addr");
        let captured = Arc::new(TokioMutex::new(Vec::<CapturedRequest>::new()));
        let scripted = Arc::new(TokioMutex::new(
            responses.into_iter().collect::<std::collections::VecDeque<_>>(),
        ));
        let captured_clone = Arc::clone(&captured);
        let scripted_clone = Arc::clone(&scripted);

        let handle = tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(value) => value,
                    Err(_) => break,
                };
                let Some(request) = read_http_request(&mut stream).await else {
                    continue;
                };
                captured_clone.lock().await.push(request);
                let (status, body) = scripted_clone
                    .lock()
                    .await
                    .pop_front()
                    .unwrap_or((500, r#"{"message":"unexpected request"}"#.to_string()));
                let _ = write_http_response(&mut stream, status, &body).await;
            }
        });

        (format!("http://{}", addr), captured, handle)
    }

    #[tokio::test]
    async fn select_renders_eq_filter_and_bearer_token() {
        let (base_url, captured, server) =
            start_mock_server(vec![(200, r#"[{"id":"s-1","club_id":"c-1"}]"#.to_string())]).await;

        let client = PostgrestClient::new(&base_url).with_api_key("anon-key");
        let rows = client
            .select(
                "token-abc",
                Collection::Sessions,
                Filter::Eq("club_id", "c-1".to_string()),
            )
            .await
            .expect("select ok");

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], "s-1");

        let requests = captured.lock().await.clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "GET");
        assert_eq!(requests[0].path_and_query, "/sessions?select=*&club_id=eq.c-1");
        assert_eq!(
            requests[0].headers.get("authorization").map(String::as_str),
            Some("Bearer token-abc")
        );
        assert_eq!(
            requests[0].headers.get("apikey").map(String::as_str),
            Some("anon-key")
        );

        server.abort();
    }

    #[tokio::test]
    async fn select_renders_in_filter_for_id_sets() {
        let (base_url, captured, server) =
            start_mock_server(vec![(200, "[]".to_string())]).await;

        let client = PostgrestClient::new(&base_url);
        client
            .select(
                "token",
                Collection::Attendance,
                Filter::AnyOf("session_id", vec!["s-1".to_string(), "s-2".to_string()]),
            )
            .await
            .expect("select ok");

        let requests = captured.lock().await.clone();
        assert_eq!(
            requests[0].path_and_query,
            "/attendance_records?select=*&session_id=in.(s-1,s-2)"
        );

        server.abort();
    }

    #[tokio::test]
    async fn upsert_sends_merge_duplicates_prefer_and_returns_rows_in_order() {
        let (base_url, captured, server) = start_mock_server(vec![(
            201,
            r#"[{"id":"c-10","name":"Chess"},{"id":"c-11","name":"Go"}]"#.to_string(),
        )])
        .await;

        let client = PostgrestClient::new(&base_url);
        let rows = client
            .upsert(
                "token",
                Collection::Clubs,
                vec![
                    serde_json::json!({"name": "Chess"}),
                    serde_json::json!({"name": "Go"}),
                ],
            )
            .await
            .expect("upsert ok");

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], "c-10");
        assert_eq!(rows[1]["id"], "c-11");

        let requests = captured.lock().await.clone();
        assert_eq!(requests[0].method, "POST");
        assert_eq!(requests[0].path_and_query, "/clubs");
        assert_eq!(
            requests[0].headers.get("prefer").map(String::as_str),
            Some("resolution=merge-duplicates,return=representation")
        );
        let sent: Vec<Value> = serde_json::from_str(&requests[0].body).expect("body is json");
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0]["name"], "Chess");

        server.abort();
    }

    #[tokio::test]
    async fn delete_targets_stale_ids_with_in_filter() {
        let (base_url, captured, server) = start_mock_server(vec![(204, String::new())]).await;

        let client = PostgrestClient::new(&base_url);
        client
            .delete(
                "token",
                Collection::ParticipantSessions,
                Filter::AnyOf("id", vec!["ps-1".to_string(), "ps-2".to_string()]),
            )
            .await
            .expect("delete ok");

        let requests = captured.lock().await.clone();
        assert_eq!(requests[0].method, "DELETE");
        assert_eq!(
            requests[0].path_and_query,
            "/participant_sessions?id=in.(ps-1,ps-2)"
        );

        server.abort();
    }

    #[tokio::test]
    async fn api_error_body_is_surfaced_with_status_and_code() {
        let (base_url, _captured, server) = start_mock_server(vec![(
            401,
            r#"{"message":"JWT expired","code":"PGRST301"}"#.to_string(),
        )])
        .await;

        let client = PostgrestClient::new(&base_url);
        let err = client
            .select("stale-token", Collection::Clubs, Filter::All)
            .await
            .expect_err("401 should error");

        assert_eq!(err.status_code(), Some(401));
        assert_eq!(err.retry_class(), RemoteRetryClass::ReauthRequired);
        assert!(err.to_string().contains("PGRST301"));

        server.abort();
    }

    #[tokio::test]
    async fn unreachable_host_maps_to_transport_error() {
        let client = PostgrestClient::new("http://127.0.0.1:1");
        let err = client
            .select("token", Collection::Clubs, Filter::All)
            .await
            .expect_err("connection refused");

        assert!(matches!(err, RemoteError::Transport(_)));
        assert_eq!(err.retry_class(), RemoteRetryClass::Retryable);
    }
}
