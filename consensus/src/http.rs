//! Carrying protocol messages over HTTP.
//!
//! Every node serves `POST /raft/message` with a JSON [`Envelope`] body, and
//! sends to its peers with [`HttpTransport`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use tower::ServiceExt;

use crate::error::TransportError;
use crate::membership::Membership;
use crate::message::Envelope;
use crate::node::Mailbox;
use crate::transport::Transport;
use crate::types::{Command, NodeId};

/// Path peers post messages to.
pub const MESSAGE_PATH: &str = "/raft/message";

/// Routes accepting peer messages for the node behind `mailbox`.
pub fn router<C: Command>(mailbox: Mailbox<C>) -> Router {
    Router::new()
        .route(MESSAGE_PATH, post(receive::<C>))
        .with_state(mailbox)
}

async fn receive<C: Command>(
    State(mailbox): State<Mailbox<C>>,
    Json(envelope): Json<Envelope<C>>,
) -> StatusCode {
    if envelope.to != mailbox.id() {
        tracing::warn!(to = envelope.to, node = mailbox.id(), "message for another node");
        return StatusCode::MISDIRECTED_REQUEST;
    }
    match mailbox.deliver(envelope) {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Sends messages to peers over HTTP using the addresses in the cluster
/// configuration.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: hyperdriver::client::SharedClientService<hyperdriver::Body, hyperdriver::Body>,
    addresses: Arc<ArcSwap<BTreeMap<NodeId, String>>>,
    timeout: Duration,
}

impl HttpTransport {
    /// A transport with its own client. Requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        let client = hyperdriver::Client::build_tcp_http()
            .with_default_tls()
            .build_service();
        Self::with_client(client, timeout)
    }

    /// A transport over an existing client service.
    pub fn with_client(
        client: hyperdriver::client::SharedClientService<hyperdriver::Body, hyperdriver::Body>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            addresses: Arc::new(ArcSwap::from_pointee(BTreeMap::new())),
            timeout,
        }
    }

    /// Address currently known for `id`.
    pub fn address(&self, id: NodeId) -> Option<String> {
        self.addresses.load().get(&id).cloned()
    }

    fn uri(address: &str) -> Result<http::Uri, http::uri::InvalidUri> {
        if address.contains("://") {
            format!("{}{MESSAGE_PATH}", address.trim_end_matches('/')).parse()
        } else {
            format!("http://{address}{MESSAGE_PATH}").parse()
        }
    }
}

#[async_trait::async_trait]
impl<C: Command> Transport<C> for HttpTransport {
    async fn send(&self, envelope: Envelope<C>) -> Result<(), TransportError> {
        let node = envelope.to;
        let address = self.address(node).ok_or(TransportError::UnknownPeer(node))?;
        let send_error = |source: Box<dyn std::error::Error + Send + Sync>| TransportError::Send { node, source };

        let body = serde_json::to_vec(&envelope).map_err(|err| send_error(err.into()))?;
        let uri = Self::uri(&address).map_err(|err| send_error(err.into()))?;
        let request = http::Request::builder()
            .method(http::Method::POST)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(hyperdriver::Body::from(Bytes::from(body)))
            .map_err(|err| send_error(err.into()))?;

        let response = tokio::time::timeout(self.timeout, self.client.clone().oneshot(request))
            .await
            .map_err(|_| TransportError::Unreachable(node))?
            .map_err(|err| send_error(err.into()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(TransportError::Rejected {
                node,
                status: response.status(),
            })
        }
    }

    fn update_members(&self, membership: &Membership) {
        let addresses = membership
            .members()
            .map(|m| (m.id, m.address.clone()))
            .collect();
        self.addresses.store(Arc::new(addresses));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, VoteRequest};
    use axum::body::Body;
    use tokio::sync::mpsc;

    fn vote(to: NodeId) -> Envelope<u32> {
        Envelope {
            from: 2,
            to,
            message: Message::RequestVote(VoteRequest {
                term: 3,
                last_log_index: 4,
                last_log_term: 2,
                pre_vote: true,
            }),
        }
    }

    #[tokio::test]
    async fn accepts_messages_for_this_node() {
        let (tx, mut rx) = mpsc::channel(4);
        let router = router(Mailbox::new(1, tx));

        let request = http::Request::builder()
            .method("POST")
            .uri(MESSAGE_PATH)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&vote(1)).unwrap()))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(rx.recv().await, Some(vote(1)));

        let request = http::Request::builder()
            .method("POST")
            .uri(MESSAGE_PATH)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&vote(5)).unwrap()))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::MISDIRECTED_REQUEST);
    }

    #[test]
    fn peer_uris() {
        assert_eq!(
            HttpTransport::uri("10.0.0.2:5000").unwrap().to_string(),
            "http://10.0.0.2:5000/raft/message"
        );
        assert_eq!(
            HttpTransport::uri("https://node-2.internal/").unwrap().to_string(),
            "https://node-2.internal/raft/message"
        );
    }
}
