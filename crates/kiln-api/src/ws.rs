//! WebSocket submission endpoint.
//!
//! Each text frame carries `{"user_id": ..., "code": ...}`. Requests on
//! one connection are handled in order and every request gets exactly
//! one reply: the JSON result, or `Error: <message>`. Frames arriving
//! while the queue is full are refused at once. Closing the socket
//! cancels the run in flight.

use std::collections::VecDeque;
use std::fmt::Display;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::future::OptionFuture;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use kiln_core::DeploymentRequest;
use kiln_pipeline::Pipeline;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::AppState;

/// Requests waiting behind the one in flight.
pub const QUEUE_DEPTH: usize = 16;

pub const QUEUE_FULL_REPLY: &str = "Error: too many pending requests";

/// GET /ws/code
pub async fn ws_code(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| handle_socket(socket, state))
}

/// A frame that must be answered.
#[derive(Debug)]
enum Inbound {
    Text(String),
    Unsupported,
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sender, receiver) = socket.split();
    serve_connection(sender, receiver, state.pipeline, state.shutdown.child_token()).await;
}

/// Drive one connection until the peer goes away.
///
/// The receive side is polled on every turn, so a close is seen even
/// while a run is in flight and the queue is full. Runs execute in their
/// own tasks; on disconnect they are cancelled, not dropped, and stop at
/// their next suspension point.
pub async fn serve_connection<S, R, E>(
    mut sender: S,
    mut receiver: R,
    pipeline: Pipeline,
    connection: CancellationToken,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut queue: VecDeque<Inbound> = VecDeque::with_capacity(QUEUE_DEPTH);
    let mut in_flight: Option<JoinHandle<String>> = None;
    info!("websocket connection opened");

    loop {
        if in_flight.is_none() {
            in_flight = queue
                .pop_front()
                .map(|next| start(next, &pipeline, &connection));
        }

        tokio::select! {
            Some(joined) = OptionFuture::from(in_flight.as_mut()) => {
                in_flight = None;
                let reply = joined.unwrap_or_else(|e| format!("Error: {e}"));
                if let Err(e) = sender.send(Message::Text(reply.into())).await {
                    warn!(error = %e, "websocket send failed");
                    break;
                }
            }
            frame = receiver.next() => {
                let inbound = match frame {
                    Some(Ok(Message::Text(text))) => Inbound::Text(text.as_str().to_owned()),
                    Some(Ok(Message::Binary(_))) => Inbound::Unsupported,
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(error = %e, "websocket receive failed");
                        break;
                    }
                };
                if queue.len() >= QUEUE_DEPTH {
                    debug!(pending = queue.len(), "request queue full");
                    if let Err(e) = sender.send(Message::Text(QUEUE_FULL_REPLY.into())).await {
                        warn!(error = %e, "websocket send failed");
                        break;
                    }
                } else {
                    queue.push_back(inbound);
                }
            }
        }
    }

    connection.cancel();
    info!(dropped = queue.len(), "websocket connection closed");
}

fn start(inbound: Inbound, pipeline: &Pipeline, cancel: &CancellationToken) -> JoinHandle<String> {
    let pipeline = pipeline.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move {
        match inbound {
            Inbound::Text(text) => respond(&pipeline, &text, &cancel).await,
            Inbound::Unsupported => "Error: expected a text frame".to_string(),
        }
    })
}

/// Handle one request frame and produce its reply text.
pub async fn respond(pipeline: &Pipeline, text: &str, cancel: &CancellationToken) -> String {
    let request: DeploymentRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "malformed websocket request");
            return format!("Error: {e}");
        }
    };
    match pipeline.run(&request, cancel).await {
        Ok(result) => match serde_json::to_string(&result) {
            Ok(json) => json,
            Err(e) => format!("Error: {e}"),
        },
        Err(e) => format!("Error: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_audit::Auditor;
    use kiln_cluster::{EnvironmentBehavior, Operation, SimulatedCluster};
    use kiln_core::KilnConfig;
    use kiln_pipeline::PipelineSettings;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::PollSender;

    fn pipeline(cluster: SimulatedCluster) -> Pipeline {
        pipeline_on(Arc::new(cluster))
    }

    fn pipeline_on(cluster: Arc<SimulatedCluster>) -> Pipeline {
        let settings = PipelineSettings::from_config(&KilnConfig::default()).unwrap();
        Pipeline::new(cluster, Auditor::disabled(), settings)
    }

    /// A connection driven over channels: frames in, replies out.
    struct Peer {
        frames: mpsc::UnboundedSender<Result<Message, String>>,
        replies: mpsc::Receiver<Message>,
        served: JoinHandle<()>,
    }

    impl Peer {
        fn connect(pipeline: Pipeline) -> Self {
            let (frames, frame_rx) = mpsc::unbounded_channel::<Result<Message, String>>();
            let (reply_tx, replies) = mpsc::channel::<Message>(64);
            let inbound = Box::pin(futures_util::stream::unfold(frame_rx, |mut rx| async move {
                rx.recv().await.map(|frame| (frame, rx))
            }));
            let served = tokio::spawn(serve_connection(
                PollSender::new(reply_tx),
                inbound,
                pipeline,
                CancellationToken::new(),
            ));
            Self {
                frames,
                replies,
                served,
            }
        }

        fn send(&self, text: &str) {
            self.frames.send(Ok(Message::Text(text.into()))).unwrap();
        }

        async fn reply(&mut self) -> String {
            match self.replies.recv().await.unwrap() {
                Message::Text(text) => text.as_str().to_owned(),
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn valid_request_replies_with_result_json() {
        let reply = respond(
            &pipeline(SimulatedCluster::new()),
            r#"{"user_id": "alice", "code": "print('hi')"}"#,
            &CancellationToken::new(),
        )
        .await;
        let value: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["status"], "deployed");
        assert_eq!(value["namespace"], "user-alice");
    }

    #[tokio::test(start_paused = true)]
    async fn failing_code_replies_tests_failed() {
        let reply = respond(
            &pipeline(SimulatedCluster::new()),
            r#"{"user_id": "alice", "code": "raise ValueError('x')"}"#,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(reply, r#"{"status":"tests_failed","namespace":"user-alice"}"#);
    }

    #[tokio::test]
    async fn malformed_payload_replies_with_error_text() {
        let p = pipeline(SimulatedCluster::new());
        let cancel = CancellationToken::new();
        assert!(respond(&p, "not json", &cancel).await.starts_with("Error: "));
        assert!(respond(&p, r#"{"user_id": "a"}"#, &cancel)
            .await
            .starts_with("Error: missing field `code`"));
    }

    #[tokio::test(start_paused = true)]
    async fn pipeline_error_replies_with_error_text() {
        let cluster = SimulatedCluster::new().with_behavior("bob", EnvironmentBehavior::CrashLoop);
        let reply = respond(
            &pipeline(cluster),
            r#"{"user_id": "bob", "code": "print("}"#,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(reply, "Error: environment bob-test not ready after 60 attempts");
    }

    #[tokio::test]
    async fn cancelled_connection_replies_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let reply = respond(
            &pipeline(SimulatedCluster::new()),
            r#"{"user_id": "alice", "code": "x"}"#,
            &cancel,
        )
        .await;
        assert_eq!(reply, "Error: deployment cancelled");
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_requests_reply_in_order() {
        let mut peer = Peer::connect(pipeline(SimulatedCluster::new()));
        peer.send(r#"{"user_id": "alice", "code": "print('ok')"}"#);
        peer.send("not json");
        peer.send(r#"{"user_id": "bob", "code": "raise ValueError('x')"}"#);
        peer.frames
            .send(Ok(Message::Binary(vec![1, 2, 3].into())))
            .unwrap();

        assert_eq!(peer.reply().await, r#"{"status":"deployed","namespace":"user-alice"}"#);
        assert!(peer.reply().await.starts_with("Error: "));
        assert_eq!(peer.reply().await, r#"{"status":"tests_failed","namespace":"user-bob"}"#);
        assert_eq!(peer.reply().await, "Error: expected a text frame");

        drop(peer.frames);
        peer.served.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_run_in_flight() {
        let cluster = Arc::new(SimulatedCluster::new().with_behavior("carol", EnvironmentBehavior::CrashLoop));
        let peer = Peer::connect(pipeline_on(cluster.clone()));
        peer.send(r#"{"user_id": "carol", "code": "print(1)"}"#);

        tokio::time::sleep(Duration::from_millis(3500)).await;
        drop(peer.frames);
        peer.served.await.unwrap();
        let polled = cluster.calls(Operation::Status);
        assert!(polled >= 3 && polled < 60);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(cluster.calls(Operation::Status) <= polled + 1);
        assert_eq!(cluster.calls(Operation::Inject), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_refuses_and_still_sees_disconnect() {
        let cluster = Arc::new(SimulatedCluster::new().with_behavior("carol", EnvironmentBehavior::CrashLoop));
        let mut peer = Peer::connect(pipeline_on(cluster.clone()));
        let request = r#"{"user_id": "carol", "code": "print(1)"}"#;
        // One in flight, a full queue, then one too many.
        for _ in 0..QUEUE_DEPTH + 2 {
            peer.send(request);
        }

        assert_eq!(peer.reply().await, QUEUE_FULL_REPLY);

        peer.frames.send(Ok(Message::Close(None))).unwrap();
        peer.served.await.unwrap();
        let polled = cluster.calls(Operation::Status);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(cluster.calls(Operation::Status) <= polled + 1);
        assert_eq!(cluster.calls(Operation::Inject), 0);
    }
}
