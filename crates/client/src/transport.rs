// Network seams used by a document session.
//
// `SyncApi` covers the REST calls a session needs and `ChannelConnector`
// opens the presence channel. Production implementations use reqwest and
// tokio-tungstenite; tests plug in in-memory versions built on `ChannelLink::pair`.

use std::future::Future;
use std::pin::Pin;

use draftsync_common::protocol::channel::{ClientFrame, ServerFrame};
use draftsync_common::types::{
    CreateDocumentRequest, DocumentEnvelope, LoadDocumentResponse, RestoreRequest,
    RestoreResponse, SaveRequest, SaveResponse, SnapshotResponse, VersionPage, VersionPreview,
};
use futures_util::{SinkExt, StreamExt};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, warn, Instrument};
use url::Url;
use uuid::Uuid;

const CHANNEL_BUFFER: usize = 64;

pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("relay responded {status} {code}: {message}")]
    Rejected { status: u16, code: String, message: String, retryable: bool },
    #[error("relay request failed: {0}")]
    Network(String),
    #[error("unexpected relay response: {0}")]
    Decode(String),
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),
    #[error("presence channel failed: {0}")]
    Channel(String),
    #[error("presence channel closed")]
    Closed,
}

impl TransportError {
    /// Failures that retrying the same request cannot fix.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Rejected { status, retryable, .. } => !retryable && (400..500).contains(status),
            Self::InvalidUrl(_) => true,
            _ => false,
        }
    }

    fn rejected(status: StatusCode, body: &str) -> Self {
        #[derive(Deserialize)]
        struct Envelope {
            error: EnvelopeBody,
        }

        #[derive(Deserialize)]
        struct EnvelopeBody {
            code: String,
            message: String,
            #[serde(default)]
            retryable: bool,
        }

        match serde_json::from_str::<Envelope>(body) {
            Ok(Envelope { error }) => Self::Rejected {
                status: status.as_u16(),
                code: error.code,
                message: error.message,
                retryable: error.retryable,
            },
            Err(_) => Self::Rejected {
                status: status.as_u16(),
                code: status.canonical_reason().unwrap_or("UNKNOWN").to_string(),
                message: body.to_string(),
                retryable: status.is_server_error(),
            },
        }
    }
}

/// REST operations a document session depends on.
pub trait SyncApi: Send + Sync {
    fn load_document(&self, document_id: Uuid) -> TransportFuture<'_, LoadDocumentResponse>;

    fn save_update(
        &self,
        document_id: Uuid,
        request: SaveRequest,
    ) -> TransportFuture<'_, SaveResponse>;

    fn restore_version(
        &self,
        document_id: Uuid,
        version_number: i64,
    ) -> TransportFuture<'_, RestoreResponse>;
}

/// Opens the presence channel for one document.
pub trait ChannelConnector: Send + Sync {
    fn join(&self, document_id: Uuid) -> TransportFuture<'_, ChannelLink>;
}

/// Client side of an open presence channel. Dropping it leaves the channel.
#[derive(Debug)]
pub struct ChannelLink {
    outbound: mpsc::Sender<ClientFrame>,
    inbound: mpsc::Receiver<ServerFrame>,
}

/// The far end of a [`ChannelLink`]: whatever pumps frames to and from the relay.
#[derive(Debug)]
pub struct ChannelPeer {
    pub from_client: mpsc::Receiver<ClientFrame>,
    pub to_client: mpsc::Sender<ServerFrame>,
}

impl ChannelLink {
    pub fn pair() -> (Self, ChannelPeer) {
        let (outbound, from_client) = mpsc::channel(CHANNEL_BUFFER);
        let (to_client, inbound) = mpsc::channel(CHANNEL_BUFFER);
        (Self { outbound, inbound }, ChannelPeer { from_client, to_client })
    }

    pub async fn send(&self, frame: ClientFrame) -> Result<(), TransportError> {
        self.outbound.send(frame).await.map_err(|_| TransportError::Closed)
    }

    /// Next frame from the relay; `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<ServerFrame> {
        self.inbound.recv().await
    }

    /// A frame the relay has already delivered, without waiting.
    pub fn try_recv(&mut self) -> Option<ServerFrame> {
        self.inbound.try_recv().ok()
    }
}

/// Ensure the base URL is treated as a directory when joining relative paths.
pub fn normalize_base_url(mut base_url: Url) -> Url {
    if !base_url.path().ends_with('/') {
        let path = format!("{}/", base_url.path());
        base_url.set_path(&path);
    }
    base_url
}

pub fn document_url(base_url: &Url, suffix: &str) -> Result<Url, TransportError> {
    base_url.join(suffix).map_err(|error| TransportError::InvalidUrl(error.to_string()))
}

/// `ws(s)://.../v1/documents/{id}/channel` for an `http(s)` base URL.
pub fn channel_url(base_url: &Url, document_id: Uuid) -> Result<Url, TransportError> {
    let mut url = document_url(base_url, &format!("v1/documents/{document_id}/channel"))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(TransportError::InvalidUrl(format!("unsupported scheme `{other}`"))),
    };
    url.set_scheme(scheme)
        .map_err(|()| TransportError::InvalidUrl(format!("cannot switch to `{scheme}`")))?;
    Ok(url)
}

// ── HTTP ────────────────────────────────────────────────────────────

/// reqwest-backed client for the relay's `/v1/documents` API.
#[derive(Debug, Clone)]
pub struct HttpSyncApi {
    client: reqwest::Client,
    base_url: Url,
    access_token: String,
}

impl HttpSyncApi {
    pub fn new(base_url: Url, access_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: normalize_base_url(base_url),
            access_token: access_token.into(),
        }
    }

    pub async fn create_document(&self, title: &str) -> Result<DocumentEnvelope, TransportError> {
        let url = document_url(&self.base_url, "v1/documents")?;
        let request = CreateDocumentRequest { title: title.to_string() };
        self.send_json(self.client.post(url).json(&request)).await
    }

    pub async fn create_snapshot(
        &self,
        document_id: Uuid,
    ) -> Result<SnapshotResponse, TransportError> {
        let url = document_url(&self.base_url, &format!("v1/documents/{document_id}/snapshot"))?;
        self.send_json(self.client.post(url)).await
    }

    pub async fn list_versions(
        &self,
        document_id: Uuid,
        page: u32,
    ) -> Result<VersionPage, TransportError> {
        let url = document_url(&self.base_url, &format!("v1/documents/{document_id}/versions"))?;
        self.send_json(self.client.get(url).query(&[("page", page)])).await
    }

    pub async fn version_content(
        &self,
        document_id: Uuid,
        version_number: i64,
    ) -> Result<VersionPreview, TransportError> {
        let url = document_url(
            &self.base_url,
            &format!("v1/documents/{document_id}/versions/{version_number}"),
        )?;
        self.send_json(self.client.get(url)).await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, TransportError> {
        let response = request
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|error| TransportError::Network(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::rejected(status, &body));
        }

        response.json::<T>().await.map_err(|error| TransportError::Decode(error.to_string()))
    }
}

impl SyncApi for HttpSyncApi {
    fn load_document(&self, document_id: Uuid) -> TransportFuture<'_, LoadDocumentResponse> {
        Box::pin(async move {
            let url = document_url(&self.base_url, &format!("v1/documents/{document_id}"))?;
            self.send_json(self.client.get(url)).await
        })
    }

    fn save_update(
        &self,
        document_id: Uuid,
        request: SaveRequest,
    ) -> TransportFuture<'_, SaveResponse> {
        Box::pin(async move {
            let url = document_url(&self.base_url, &format!("v1/documents/{document_id}/save"))?;
            self.send_json(self.client.post(url).json(&request)).await
        })
    }

    fn restore_version(
        &self,
        document_id: Uuid,
        version_number: i64,
    ) -> TransportFuture<'_, RestoreResponse> {
        Box::pin(async move {
            let url =
                document_url(&self.base_url, &format!("v1/documents/{document_id}/restore"))?;
            let request = RestoreRequest { version_number };
            self.send_json(self.client.post(url).json(&request)).await
        })
    }
}

// ── WebSocket ───────────────────────────────────────────────────────

/// tokio-tungstenite connector for the presence channel.
#[derive(Debug, Clone)]
pub struct WsChannelConnector {
    base_url: Url,
    access_token: String,
}

impl WsChannelConnector {
    pub fn new(base_url: Url, access_token: impl Into<String>) -> Self {
        Self { base_url: normalize_base_url(base_url), access_token: access_token.into() }
    }
}

impl ChannelConnector for WsChannelConnector {
    fn join(&self, document_id: Uuid) -> TransportFuture<'_, ChannelLink> {
        Box::pin(async move {
            let url = channel_url(&self.base_url, document_id)?;
            let mut request = url
                .as_str()
                .into_client_request()
                .map_err(|error| TransportError::InvalidUrl(error.to_string()))?;
            let bearer = HeaderValue::from_str(&format!("Bearer {}", self.access_token))
                .map_err(|error| TransportError::Channel(error.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, bearer);

            let (stream, _response) =
                tokio_tungstenite::connect_async(request).await.map_err(|error| match error {
                    tungstenite::Error::Http(response) => TransportError::Rejected {
                        status: response.status().as_u16(),
                        code: response.status().canonical_reason().unwrap_or("UNKNOWN").to_string(),
                        message: "presence channel upgrade refused".to_string(),
                        retryable: response.status().is_server_error(),
                    },
                    other => TransportError::Channel(other.to_string()),
                })?;

            let (link, peer) = ChannelLink::pair();
            tokio::spawn(
                pump_socket(stream, peer)
                    .instrument(tracing::info_span!("client.channel", document_id = %document_id)),
            );
            Ok(link)
        })
    }
}

async fn pump_socket<S>(stream: tokio_tungstenite::WebSocketStream<S>, mut peer: ChannelPeer)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut source) = stream.split();

    loop {
        tokio::select! {
            outgoing = peer.from_client.recv() => {
                let Some(frame) = outgoing else {
                    close_quietly(&mut sink).await;
                    break;
                };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(error) => {
                        warn!(?error, "failed to encode channel frame");
                        continue;
                    }
                };
                if let Err(error) = sink.send(Message::Text(text.into())).await {
                    warn!(?error, "presence channel send failed");
                    break;
                }
            }
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ServerFrame>(text.as_str()) {
                        Ok(frame) => {
                            if peer.to_client.send(frame).await.is_err() {
                                close_quietly(&mut sink).await;
                                break;
                            }
                        }
                        Err(error) => warn!(?error, "ignoring undecodable channel frame"),
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "presence channel closed by relay");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    warn!(?error, "presence channel read failed");
                    break;
                }
                None => break,
            }
        }
    }
}

async fn close_quietly<S>(sink: &mut S)
where
    S: futures_util::Sink<Message, Error = tungstenite::Error> + Unpin,
{
    if let Err(error) = sink.close().await {
        debug!(%error, "presence channel close handshake failed");
    }
}
