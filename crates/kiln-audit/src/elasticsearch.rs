//! Elasticsearch audit sink.
//!
//! Indexes one JSON document per audit record. Startup goes through
//! [`ElasticsearchSink::connect`], which pings the cluster with bounded
//! retry; the daemon falls back to a disabled auditor when that fails.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use http_body_util::Full;
use kiln_core::AuditRecord;
use percent_encoding::percent_decode_str;
use tracing::{debug, info, warn};
use url::Url;

use crate::auditor::AuditSink;
use crate::error::AuditError;

/// Connection settings for [`ElasticsearchSink`].
#[derive(Debug, Clone)]
pub struct ElasticsearchConfig {
    /// Base URL, e.g. `http://elasticsearch:9200`.
    pub url: String,
    pub index: String,
    pub connect_attempts: u32,
    pub connect_interval: Duration,
    pub request_timeout: Duration,
}

/// Where and how to reach the cluster, derived from the base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoint {
    /// `host:port` to dial.
    authority: String,
    /// `Host` header value; the port is omitted when it is the default.
    host_header: String,
    /// Path prefix without a trailing slash, e.g. `/es`.
    base_path: String,
    /// `Authorization` header built from URL credentials.
    authorization: Option<String>,
    /// The base URL with any password masked, for logs and errors.
    display: String,
}

impl Endpoint {
    fn parse(raw: &str) -> Result<Self, AuditError> {
        let mut parsed = Url::parse(raw)?;
        if parsed.scheme() != "http" {
            return Err(AuditError::UnsupportedEndpoint(parsed.scheme().to_string()));
        }
        let host = parsed
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or(AuditError::InvalidEndpoint(url::ParseError::EmptyHost))?
            .to_string();
        let port = parsed.port_or_known_default().unwrap_or(80);
        let host_header = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.clone(),
        };
        let base_path = parsed.path().trim_end_matches('/').to_string();
        let authorization = basic_auth(&parsed);

        if parsed.password().is_some() {
            // Only fails for URLs that cannot carry credentials.
            let _ = parsed.set_password(Some("***"));
        }
        Ok(Self {
            authority: format!("{host}:{port}"),
            host_header,
            base_path,
            authorization,
            display: parsed.to_string(),
        })
    }
}

/// `Basic` credentials from the URL's userinfo, if any.
fn basic_auth(url: &Url) -> Option<String> {
    if url.username().is_empty() && url.password().is_none() {
        return None;
    }
    let decode = |s: &str| percent_decode_str(s).decode_utf8_lossy().into_owned();
    let user = decode(url.username());
    let password = url.password().map(decode).unwrap_or_default();
    Some(format!("Basic {}", STANDARD.encode(format!("{user}:{password}"))))
}

/// Sends audit records to an Elasticsearch index over HTTP/1.1.
#[derive(Debug, Clone)]
pub struct ElasticsearchSink {
    endpoint: Endpoint,
    index: String,
    timeout: Duration,
}

impl ElasticsearchSink {
    /// Build a sink without contacting the cluster.
    pub fn new(config: &ElasticsearchConfig) -> Result<Self, AuditError> {
        Ok(Self {
            endpoint: Endpoint::parse(&config.url)?,
            index: config.index.clone(),
            timeout: config.request_timeout,
        })
    }

    /// Build a sink and wait until the cluster answers a ping.
    ///
    /// Tries `connect_attempts` times, `connect_interval` apart.
    pub async fn connect(config: &ElasticsearchConfig) -> Result<Self, AuditError> {
        let sink = Self::new(config)?;
        let attempts = config.connect_attempts.max(1);

        for attempt in 1..=attempts {
            match sink.ping().await {
                Ok(()) => {
                    info!(url = %sink.endpoint.display, attempt, "connected to elasticsearch");
                    return Ok(sink);
                }
                Err(e) => {
                    warn!(url = %sink.endpoint.display, attempt, error = %e, "waiting for elasticsearch");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(config.connect_interval).await;
            }
        }

        Err(AuditError::Unavailable {
            url: sink.endpoint.display.clone(),
            attempts,
        })
    }

    fn document(record: &AuditRecord) -> serde_json::Value {
        serde_json::json!({
            "@timestamp": record.timestamp.to_rfc3339(),
            "namespace": record.namespace,
            "user": record.user,
            "message": record.message,
            "severity": record.severity.as_str(),
        })
    }

    async fn send(
        &self,
        method: http::Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<http::StatusCode, AuditError> {
        let authority = self.endpoint.authority.clone();
        let uri = format!("http://{}{}{path}", self.endpoint.host_header, self.endpoint.base_path);

        let result = tokio::time::timeout(self.timeout, async {
            let stream = tokio::net::TcpStream::connect(&authority)
                .await
                .map_err(|e| AuditError::Request(format!("connect {authority}: {e}")))?;

            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| AuditError::Request(format!("handshake: {e}")))?;

            // Drive the connection in the background.
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let mut builder = http::Request::builder()
                .method(method)
                .uri(&uri)
                .header("host", &self.endpoint.host_header)
                .header("user-agent", "kiln-audit/0.1");
            if let Some(authorization) = &self.endpoint.authorization {
                builder = builder.header("authorization", authorization);
            }
            if body.is_some() {
                builder = builder.header("content-type", "application/json");
            }
            let req = builder
                .body(Full::new(Bytes::from(body.unwrap_or_default())))
                .map_err(|e| AuditError::Request(format!("build request: {e}")))?;

            let resp = sender
                .send_request(req)
                .await
                .map_err(|e| AuditError::Request(format!("send: {e}")))?;
            Ok::<_, AuditError>(resp.status())
        })
        .await;

        match result {
            Ok(status) => status,
            Err(_) => {
                debug!(%uri, "elasticsearch request timed out");
                Err(AuditError::Timeout)
            }
        }
    }
}

#[async_trait]
impl AuditSink for ElasticsearchSink {
    fn name(&self) -> &'static str {
        "elasticsearch"
    }

    async fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let body = serde_json::to_vec(&Self::document(record))?;
        let path = format!("/{}/_doc", self.index);
        let status = self.send(http::Method::POST, &path, Some(body)).await?;
        if !status.is_success() {
            return Err(AuditError::Rejected(status.as_u16()));
        }
        debug!(index = %self.index, user = %record.user, "audit record indexed");
        Ok(())
    }

    async fn ping(&self) -> Result<(), AuditError> {
        let status = self.send(http::Method::GET, "/", None).await?;
        if status.is_success() {
            Ok(())
        } else {
            debug!(url = %self.endpoint.display, %status, "elasticsearch ping non-2xx");
            Err(AuditError::Rejected(status.as_u16()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::Severity;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn config(url: &str) -> ElasticsearchConfig {
        ElasticsearchConfig {
            url: url.to_string(),
            index: "orchestration-logs".to_string(),
            connect_attempts: 2,
            connect_interval: Duration::from_millis(10),
            request_timeout: Duration::from_millis(500),
        }
    }

    /// Serve `status` to every request and forward raw requests to the channel.
    async fn fake_server(status: u16) -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let request = read_request(&mut socket).await;
                    let _ = tx.send(request);
                    let response = format!(
                        "HTTP/1.1 {status} X\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{{}}"
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });

        (format!("http://{addr}"), rx)
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if buf.len() >= header_end + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    #[test]
    fn endpoint_parsing() {
        let ep = Endpoint::parse("http://elasticsearch:9200").unwrap();
        assert_eq!(ep.authority, "elasticsearch:9200");
        assert_eq!(ep.base_path, "");

        let ep = Endpoint::parse("http://proxy/es/").unwrap();
        assert_eq!(ep.authority, "proxy:80");
        assert_eq!(ep.host_header, "proxy");
        assert_eq!(ep.base_path, "/es");

        assert!(matches!(
            Endpoint::parse("https://secure:9200"),
            Err(AuditError::UnsupportedEndpoint(ref scheme)) if scheme == "https"
        ));
        assert!(matches!(
            Endpoint::parse("elasticsearch:9200/"),
            Err(AuditError::UnsupportedEndpoint(_))
        ));
        assert!(Endpoint::parse("http://").is_err());
        assert!(Endpoint::parse("not a url").is_err());
    }

    #[test]
    fn credentials_become_basic_auth() {
        let ep = Endpoint::parse("http://elastic:p%40ss@es:9200").unwrap();
        assert_eq!(ep.authority, "es:9200");
        assert_eq!(ep.host_header, "es:9200");
        // base64("elastic:p@ss")
        assert_eq!(ep.authorization.as_deref(), Some("Basic ZWxhc3RpYzpwQHNz"));
        assert!(!ep.display.contains("p%40ss"));
        assert!(ep.display.contains("elastic:***@es:9200"));

        let ep = Endpoint::parse("http://es:9200").unwrap();
        assert_eq!(ep.authorization, None);
    }

    #[test]
    fn document_shape() {
        let record = AuditRecord::new(Some("user-a"), "a", "boom", Severity::Error);
        let doc = ElasticsearchSink::document(&record);
        assert_eq!(doc["namespace"], "user-a");
        assert_eq!(doc["user"], "a");
        assert_eq!(doc["message"], "boom");
        assert_eq!(doc["severity"], "ERROR");
        assert!(doc["@timestamp"].as_str().is_some());
    }

    #[tokio::test]
    async fn connect_gives_up_after_bounded_attempts() {
        let err = ElasticsearchSink::connect(&config("http://127.0.0.1:1"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuditError::Unavailable { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn connect_and_index_record() {
        let (url, mut requests) = fake_server(200).await;
        let sink = ElasticsearchSink::connect(&config(&url)).await.unwrap();

        let ping = requests.recv().await.unwrap();
        assert!(ping.starts_with("GET / HTTP/1.1"));

        let record = AuditRecord::new(Some("user-a"), "a", "Test failed", Severity::Error);
        sink.record(&record).await.unwrap();

        let index = requests.recv().await.unwrap();
        assert!(index.starts_with("POST /orchestration-logs/_doc HTTP/1.1"));
        assert!(index.contains(r#""severity":"ERROR""#));
        assert!(index.contains(r#""message":"Test failed""#));
    }

    #[tokio::test]
    async fn credentials_are_sent_with_requests() {
        let (url, mut requests) = fake_server(200).await;
        let url = url.replace("http://", "http://elastic:pw@");
        let sink = ElasticsearchSink::connect(&config(&url)).await.unwrap();

        let ping = requests.recv().await.unwrap();
        assert!(ping.starts_with("GET / HTTP/1.1"));
        // base64("elastic:pw")
        assert!(ping.to_ascii_lowercase().contains("authorization: basic zwxhc3rpyzpwdw=="));

        let record = AuditRecord::new(None, "a", "m", Severity::Info);
        sink.record(&record).await.unwrap();
        let index = requests.recv().await.unwrap();
        assert!(index.starts_with("POST /orchestration-logs/_doc HTTP/1.1"));
    }

    #[tokio::test]
    async fn rejected_record_is_an_error() {
        let (url, _requests) = fake_server(503).await;
        let sink = ElasticsearchSink::new(&config(&url)).unwrap();
        let record = AuditRecord::new(None, "a", "m", Severity::Info);
        assert!(matches!(
            sink.record(&record).await,
            Err(AuditError::Rejected(503))
        ));
    }
}
