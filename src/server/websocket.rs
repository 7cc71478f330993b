use crate::agent::{ EcgAgent, PersistenceSender };
use crate::cli::Args;
use crate::error::WorkflowError;
use crate::models::websocket::{ ClientMessage, PersistenceEvent, ServerMessage };
use crate::session::Session;

use std::collections::HashMap;
use std::error::Error;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use tokio::io::{ AsyncRead, AsyncWrite };
use tokio::net::TcpListener;
use tokio::sync::mpsc::{ self, UnboundedReceiver, UnboundedSender };

use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ ErrorResponse, Request, Response };
use tokio_tungstenite::tungstenite::protocol::{ Message, WebSocketConfig };
use tokio_tungstenite::{ accept_hdr_async_with_config, WebSocketStream };

use rustls::pki_types::{ CertificateDer, PrivateKeyDer };
use rustls::ServerConfig;
use rustls_pemfile::{ certs, pkcs8_private_keys };

use governor::{ clock::DefaultClock, state::{ InMemoryState, NotKeyed }, Quota, RateLimiter };
use lazy_static::lazy_static;

use chrono::Utc;
use hmac::{ Hmac, Mac };
use sha2::Sha256;
use url::form_urlencoded;

use futures::stream::SplitSink;
use futures::{ SinkExt, StreamExt };
use log::{ debug, error, info, warn };

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_MAX_SKEW_SECS: i64 = 300;

lazy_static! {
    static ref CONNECTION_LIMITER: RateLimiter<NotKeyed, InMemoryState, DefaultClock> =
        RateLimiter::direct(Quota::per_second(NonZeroU32::new(10).unwrap()));
}

/// Largest text frame accepted: a base64 image of `max_upload_bytes` plus
/// room for the JSON envelope.
pub fn max_message_size(max_upload_bytes: usize) -> usize {
    max_upload_bytes / 3 * 4 + 64 * 1024
}

fn load_tls_config(
    cert_path: &str,
    key_path: &str
) -> Result<Arc<ServerConfig>, Box<dyn Error + Send + Sync>> {
    let cert_file = File::open(cert_path).map_err(|e|
        format!("Failed to open TLS certificate file '{}': {}", cert_path, e)
    )?;
    let key_file = File::open(key_path).map_err(|e|
        format!("Failed to open TLS key file '{}': {}", key_path, e)
    )?;

    let mut cert_reader = BufReader::new(cert_file);
    let mut key_reader = BufReader::new(key_file);
    let cert_chain: Vec<CertificateDer<'static>> = certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| format!("Failed to read certificate(s): {}", e))?;

    let mut keys = pkcs8_private_keys(&mut key_reader);
    let key = match keys.next() {
        Some(Ok(k)) => PrivateKeyDer::Pkcs8(k),
        Some(Err(e)) => {
            return Err(format!("Error reading private key: {}", e).into());
        }
        None => {
            return Err("No PKCS8 private key found in key file".into());
        }
    };

    let config = ServerConfig::builder().with_no_client_auth().with_single_cert(cert_chain, key)?;
    Ok(Arc::new(config))
}

pub async fn start_ws_server(
    addr: &str,
    agent: Arc<EcgAgent>,
    api_key: Option<String>,
    args: Args,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;

    let tls_acceptor = match (args.enable_tls, &args.tls_cert_path, &args.tls_key_path) {
        (false, _, _) => None,
        (true, Some(cert_path), Some(key_path)) => {
            info!("Loading TLS certificate '{}' and key '{}'", cert_path, key_path);
            Some(TlsAcceptor::from(load_tls_config(cert_path, key_path)?))
        }
        (true, _, _) => {
            error!("--enable-tls needs both --tls-cert-path and --tls-key-path");
            return Err("TLS enabled without certificate and key".into());
        }
    };
    let scheme = if tls_acceptor.is_some() { "wss" } else { "ws" };
    info!("Session socket listening on {}://{}", scheme, addr);

    let max_size = max_message_size(args.max_upload_bytes);

    loop {
        let (stream, peer) = listener.accept().await?;

        if CONNECTION_LIMITER.check().is_err() {
            warn!("Global connection rate limit exceeded for {}. Dropping connection.", peer);
            continue;
        }

        info!("Incoming connection from: {}", peer);
        let agent_clone = Arc::clone(&agent);
        let required_api_key = api_key.clone();
        let tls_acceptor_clone = tls_acceptor.clone();

        tokio::spawn(async move {
            let process_result = if let Some(acceptor) = tls_acceptor_clone {
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        info!("TLS handshake successful for {}", peer);
                        process_connection(peer, tls_stream, agent_clone, required_api_key, max_size).await
                    }
                    Err(e) => {
                        error!("TLS handshake error for {}: {}", peer, e);
                        Err(Box::new(e) as Box<dyn Error + Send + Sync>)
                    }
                }
            } else {
                process_connection(peer, stream, agent_clone, required_api_key, max_size).await
            };

            if let Err(e) = process_result {
                error!("Failed to process connection for {}: {}", peer, e);
            }
        });
    }
}

fn sign(secret: &str, ts: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(ts.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Accepts either the raw key (`X-API-Key` header or `api_key` query
/// parameter) or an HMAC-SHA256 signature of a recent unix timestamp
/// (`ts` + `sig` query parameters).
pub fn check_credentials(
    secret: &str,
    header_key: Option<&str>,
    query: &str,
    now: i64
) -> Result<(), &'static str> {
    let params: HashMap<String, String> = form_urlencoded
        ::parse(query.as_bytes())
        .into_owned()
        .collect();

    let provided = header_key.or_else(|| params.get("api_key").map(|s| s.as_str()));
    if let Some(provided) = provided {
        return if provided == secret { Ok(()) } else { Err("bad api key") };
    }

    match (params.get("ts"), params.get("sig")) {
        (Some(ts), Some(sig)) => {
            let ts_i: i64 = ts.parse().map_err(|_| "bad timestamp")?;
            if (now - ts_i).abs() > SIGNATURE_MAX_SKEW_SECS {
                return Err("timestamp out of range");
            }
            match sign(secret, ts) {
                Some(expected) if expected == *sig => Ok(()),
                _ => Err("bad signature"),
            }
        }
        _ => Err("missing credentials"),
    }
}

fn unauthorized(reason: &str) -> ErrorResponse {
    let mut res = ErrorResponse::new(Some(reason.to_string()));
    *res.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::UNAUTHORIZED;
    res
}

async fn process_connection<S>(
    peer: SocketAddr,
    stream: S,
    agent: Arc<EcgAgent>,
    required_api_key: Option<String>,
    max_size: usize
) -> Result<(), Box<dyn Error + Send + Sync>>
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    let auth_callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let secret = match &required_api_key {
            Some(k) if !k.is_empty() => k,
            _ => {
                return Ok(response);
            }
        };

        let header_key = req
            .headers()
            .get("X-API-Key")
            .and_then(|v| v.to_str().ok());
        let query = req.uri().query().unwrap_or("");

        match check_credentials(secret, header_key, query, Utc::now().timestamp()) {
            Ok(()) => {
                info!("{} authenticated", peer);
                Ok(response)
            }
            Err(reason) => {
                warn!("{}: rejected handshake ({})", peer, reason);
                Err(unauthorized(reason))
            }
        }
    };

    let config = WebSocketConfig {
        max_message_size: Some(max_size),
        max_frame_size: Some(max_size),
        ..Default::default()
    };

    match accept_hdr_async_with_config(stream, auth_callback, Some(config)).await {
        Ok(ws) => {
            handle_connection(peer, ws, agent, max_size).await;
            Ok(())
        }
        Err(e) => {
            error!("Handshake failed for {}: {}", peer, e);
            Err(Box::new(e) as _)
        }
    }
}

async fn forward_outbound<S>(
    peer: SocketAddr,
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound: UnboundedReceiver<ServerMessage>
)
    where S: AsyncRead + AsyncWrite + Unpin
{
    while let Some(msg) = outbound.recv().await {
        let json = match serde_json::to_string(&msg) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize server message for {}: {}", peer, e);
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(json)).await {
            error!("Error sending to {}: {}", peer, e);
            break;
        }
    }
    let _ = sink.close().await;
}

/// One task and one `Session` per connection. Client messages are handled
/// one at a time; persistence outcomes arrive on their own channel.
pub async fn handle_connection<S>(
    peer: SocketAddr,
    websocket: WebSocketStream<S>,
    agent: Arc<EcgAgent>,
    max_size: usize
)
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    info!("New WebSocket connection: {}", peer);

    let (sink, mut rx) = websocket.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<PersistenceEvent>();
    let writer = tokio::spawn(forward_outbound(peer, sink, out_rx));

    let mut session = agent.new_session();
    send(&out_tx, history_message(&session));

    loop {
        tokio::select! {
            incoming = rx.next() => {
                let message = match incoming {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", peer, e);
                        break;
                    }
                    None => break,
                };

                if message.len() > max_size {
                    warn!("Message from {} exceeds size limit ({} > {})", peer, message.len(), max_size);
                    send(&out_tx, ServerMessage::Error { message: "Message too large".to_string() });
                    continue;
                }

                match message {
                    Message::Text(text) => {
                        // Outcomes that are already in must be applied before
                        // the next action reads the session.
                        while let Ok(event) = events_rx.try_recv() {
                            report_persistence_event(&agent, &mut session, event, &out_tx, &events_tx);
                        }
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(client_msg) => {
                                handle_client_message(&agent, &mut session, client_msg, &out_tx, &events_tx).await;
                            }
                            Err(e) => {
                                warn!("Invalid message from {}: {}", peer, e);
                                send(&out_tx, ServerMessage::Error { message: format!("Invalid message: {}", e) });
                            }
                        }
                    }
                    Message::Close(_) => {
                        info!("Client {} closed the connection", peer);
                        break;
                    }
                    Message::Ping(_) | Message::Pong(_) => {}
                    _ => {
                        send(&out_tx, ServerMessage::Error { message: "Unsupported message type".to_string() });
                    }
                }
            }
            Some(event) = events_rx.recv() => {
                report_persistence_event(&agent, &mut session, event, &out_tx, &events_tx);
            }
        }
    }

    drop(out_tx);
    let _ = writer.await;
    info!("Connection {} closed, session had {} analyses", peer, session.history().len());
}

fn send(out: &UnboundedSender<ServerMessage>, msg: ServerMessage) {
    if out.send(msg).is_err() {
        debug!("Outbound channel closed, dropping message");
    }
}

fn workflow_failure(err: WorkflowError) -> ServerMessage {
    if err.is_warning() {
        ServerMessage::Warning { message: err.to_string() }
    } else {
        ServerMessage::Error { message: err.to_string() }
    }
}

pub fn report_persistence_event(
    agent: &EcgAgent,
    session: &mut Session,
    event: PersistenceEvent,
    out: &UnboundedSender<ServerMessage>,
    events: &PersistenceSender
) {
    agent.apply_persistence_event(session, &event, events);
    send(out, ServerMessage::Persistence { event });
}

/// Runs one client action against the session and reports the outcome.
pub async fn handle_client_message(
    agent: &EcgAgent,
    session: &mut Session,
    message: ClientMessage,
    out: &UnboundedSender<ServerMessage>,
    events: &PersistenceSender
) {
    match message {
        ClientMessage::SetPatient { patient_id } => {
            session.set_patient_id(&patient_id);
            send(out, ServerMessage::Patient { patient_id: session.patient_id().map(str::to_string) });
        }
        ClientMessage::Upload { file_name, mime_type, data } => {
            match agent.upload(session, &file_name, mime_type.as_deref(), &data) {
                Ok(upload) => {
                    send(out, ServerMessage::Uploaded {
                        image_name: upload.file_name.clone(),
                        mime_type: upload.mime_type.clone(),
                        size: upload.size(),
                    });
                }
                Err(e) => send(out, workflow_failure(e)),
            }
        }
        ClientMessage::Analyze => {
            if session.staged_upload().is_none() {
                send(out, workflow_failure(WorkflowError::NoUpload));
                return;
            }
            send(out, ServerMessage::Processing { action: "analyze".to_string() });
            match agent.analyze(session, events).await {
                Ok(record) => {
                    send(out, ServerMessage::Analysis { record });
                    send(out, history_message(session));
                }
                Err(e) => {
                    send(out, ServerMessage::Error { message: format!("Analysis failed: {}", e) });
                }
            }
        }
        ClientMessage::Compare { past } => {
            if session.history().is_empty() || session.current().is_none() {
                let err = if session.history().is_empty() {
                    WorkflowError::EmptyHistory
                } else {
                    WorkflowError::NoCurrentAnalysis
                };
                send(out, workflow_failure(err));
                return;
            }
            send(out, ServerMessage::Processing { action: "compare".to_string() });
            match agent.compare(session, &past).await {
                Ok(comparison) => {
                    send(out, ServerMessage::Comparison {
                        past_id: comparison.past_id,
                        current_id: comparison.current_id,
                        content: comparison.content,
                    });
                }
                Err(e) if e.is_warning() => send(out, workflow_failure(e)),
                Err(e) => {
                    send(out, ServerMessage::Error { message: format!("Comparison failed: {}", e) });
                }
            }
        }
        ClientMessage::Chat { content } => {
            if content.trim().is_empty() {
                send(out, workflow_failure(WorkflowError::EmptyMessage));
                return;
            }
            if session.current().is_none() {
                send(out, workflow_failure(WorkflowError::NoCurrentAnalysis));
                return;
            }
            send(out, ServerMessage::Processing { action: "chat".to_string() });
            match agent.chat(session, &content, events).await {
                Ok(message) => send(out, ServerMessage::ChatReply { message }),
                Err(e) if e.is_warning() => send(out, workflow_failure(e)),
                Err(e) => send(out, ServerMessage::Error { message: format!("Chat error: {}", e) }),
            }
        }
        ClientMessage::LoadHistory => {
            send(out, ServerMessage::Processing { action: "load_history".to_string() });
            match agent.load_history(session).await {
                Ok(0) => send(out, ServerMessage::Warning { message: "No analyses found".to_string() }),
                Ok(_) => send(out, history_message(session)),
                Err(e) if e.is_warning() => send(out, workflow_failure(e)),
                Err(e) => {
                    send(out, ServerMessage::Error { message: format!("Failed to load analyses: {}", e) });
                }
            }
        }
        ClientMessage::History => send(out, history_message(session)),
    }
}

fn history_message(session: &Session) -> ServerMessage {
    ServerMessage::History {
        entries: session.history_entries(),
        current_id: session.current().map(|r| r.id),
        state: session.state(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tests::png_data;
    use crate::agent::WorkflowSettings;
    use crate::config::prompt::PromptConfig;
    use crate::llm::mock::ScriptedClient;
    use crate::models::websocket::RecordSelector;
    use crate::session::UploadState;
    use crate::store::{ AnalysisStore, MemoryStore };

    struct Harness {
        agent: EcgAgent,
        client: Arc<ScriptedClient>,
        session: Session,
        out_tx: UnboundedSender<ServerMessage>,
        out_rx: UnboundedReceiver<ServerMessage>,
        events_tx: PersistenceSender,
        events_rx: UnboundedReceiver<PersistenceEvent>,
    }

    impl Harness {
        fn new(replies: Vec<Result<&str, &str>>, store: Option<Arc<MemoryStore>>) -> Self {
            let client = Arc::new(ScriptedClient::new(replies));
            let agent = EcgAgent::with_parts(
                client.clone(),
                store.map(|s| s as Arc<dyn AnalysisStore>),
                Arc::new(PromptConfig::default()),
                WorkflowSettings::default()
            );
            let session = agent.new_session();
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            Self { agent, client, session, out_tx, out_rx, events_tx, events_rx }
        }

        async fn send(&mut self, msg: ClientMessage) -> Vec<ServerMessage> {
            handle_client_message(&self.agent, &mut self.session, msg, &self.out_tx, &self.events_tx).await;
            let mut replies = Vec::new();
            while let Ok(m) = self.out_rx.try_recv() {
                replies.push(m);
            }
            replies
        }

        async fn upload_and_analyze(&mut self, name: &str) -> Vec<ServerMessage> {
            self.send(ClientMessage::Upload {
                file_name: name.to_string(),
                mime_type: None,
                data: png_data(),
            }).await;
            self.send(ClientMessage::Analyze).await
        }
    }

    #[tokio::test]
    async fn upload_then_analyze_reports_processing_and_record() {
        let mut h = Harness::new(vec![Ok("Normal sinus rhythm")], None);

        let replies = h.send(ClientMessage::Upload {
            file_name: "a.png".into(),
            mime_type: Some("image/png".into()),
            data: png_data(),
        }).await;
        assert!(matches!(&replies[..], [ServerMessage::Uploaded { image_name, .. }] if image_name == "a.png"));

        let replies = h.upload_and_analyze("a.png").await;
        assert!(matches!(replies[0], ServerMessage::Processing { .. }));
        match &replies[1] {
            ServerMessage::Analysis { record } => assert_eq!(record.report, "Normal sinus rhythm"),
            other => panic!("unexpected {:?}", other),
        }
        match &replies[2] {
            ServerMessage::History { entries, current_id, state } => {
                assert_eq!(*state, UploadState::Analyzed);
                assert_eq!(entries.len(), 1);
                assert_eq!(*current_id, Some(entries[0].id));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn analyze_before_upload_warns_without_remote_call() {
        let mut h = Harness::new(vec![], None);
        let replies = h.send(ClientMessage::Analyze).await;
        assert!(matches!(&replies[..], [ServerMessage::Warning { .. }]));
        assert_eq!(h.client.calls(), 0);
    }

    #[tokio::test]
    async fn failed_analysis_is_an_inline_error() {
        let mut h = Harness::new(vec![Err("unauthorized")], None);
        let replies = h.upload_and_analyze("a.png").await;
        match &replies[1] {
            ServerMessage::Error { message } => assert!(message.starts_with("Analysis failed")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(h.session.history().is_empty());
    }

    #[tokio::test]
    async fn compare_and_chat_are_blocked_without_analysis() {
        let mut h = Harness::new(vec![], None);
        let replies = h.send(ClientMessage::Compare { past: RecordSelector::Position { position: 1 } }).await;
        assert!(matches!(&replies[..], [ServerMessage::Warning { .. }]));

        let replies = h.send(ClientMessage::Chat { content: "hi".into() }).await;
        assert!(matches!(&replies[..], [ServerMessage::Warning { .. }]));
        assert_eq!(h.client.calls(), 0);
    }

    #[tokio::test]
    async fn scenario_compare_position_one_against_second_upload() {
        let mut h = Harness::new(vec![Ok("A"), Ok("B"), Ok("changes")], None);
        h.upload_and_analyze("a.png").await;
        h.upload_and_analyze("b.png").await;

        let first = h.session.history()[0].id;
        let second = h.session.history()[1].id;
        let replies = h.send(ClientMessage::Compare { past: RecordSelector::Position { position: 1 } }).await;
        match &replies[1] {
            ServerMessage::Comparison { past_id, current_id, content } => {
                assert_eq!(*past_id, first);
                assert_eq!(*current_id, second);
                assert_eq!(content, "changes");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn chat_failure_is_visible() {
        let mut h = Harness::new(vec![Ok("report"), Err("timeout")], None);
        h.upload_and_analyze("a.png").await;

        let replies = h.send(ClientMessage::Chat { content: "why?".into() }).await;
        assert!(matches!(replies[0], ServerMessage::Processing { .. }));
        match &replies[1] {
            ServerMessage::Error { message } => assert!(message.starts_with("Chat error")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.session.transcript().len(), 1);
    }

    #[tokio::test]
    async fn persistence_events_attach_store_id() {
        let store = Arc::new(MemoryStore::default());
        let mut h = Harness::new(vec![Ok("report")], Some(store));
        h.upload_and_analyze("a.png").await;

        let event = h.events_rx.recv().await.unwrap();
        report_persistence_event(&h.agent, &mut h.session, event, &h.out_tx, &h.events_tx);
        assert_eq!(h.session.current().unwrap().persisted_id.as_deref(), Some("mem-000000"));
        assert!(matches!(h.out_rx.try_recv().unwrap(), ServerMessage::Persistence { .. }));
    }

    #[tokio::test]
    async fn chat_sent_before_save_event_is_still_persisted() {
        let store = Arc::new(MemoryStore::default());
        let mut h = Harness::new(vec![Ok("report"), Ok("answer")], Some(store.clone()));
        h.upload_and_analyze("a.png").await;

        let replies = h.send(ClientMessage::Chat { content: "is this normal?".into() }).await;
        assert!(matches!(replies.last(), Some(ServerMessage::ChatReply { .. })));

        let event = h.events_rx.recv().await.unwrap();
        report_persistence_event(&h.agent, &mut h.session, event, &h.out_tx, &h.events_tx);

        let mut chats = Vec::new();
        for _ in 0..50 {
            chats = store.chats().await;
            if chats.len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(chats.len(), 2);
        assert!(chats.iter().all(|c| c.analysis_id == "mem-000000"));
    }

    #[tokio::test]
    async fn load_history_without_store_warns() {
        let mut h = Harness::new(vec![], None);
        let replies = h.send(ClientMessage::LoadHistory).await;
        assert!(matches!(replies.last(), Some(ServerMessage::Warning { .. })));
    }

    #[tokio::test]
    async fn set_patient_echoes_trimmed_id() {
        let mut h = Harness::new(vec![], None);
        let replies = h.send(ClientMessage::SetPatient { patient_id: " P7 ".into() }).await;
        match &replies[0] {
            ServerMessage::Patient { patient_id } => assert_eq!(patient_id.as_deref(), Some("P7")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn credentials_accept_key_or_signature() {
        let now = 1_700_000_000;
        assert!(check_credentials("s3cret", Some("s3cret"), "", now).is_ok());
        assert!(check_credentials("s3cret", None, "api_key=s3cret", now).is_ok());
        assert!(check_credentials("s3cret", Some("wrong"), "", now).is_err());

        let sig = sign("s3cret", "1700000000").unwrap();
        let query = format!("ts=1700000000&sig={}", sig);
        assert!(check_credentials("s3cret", None, &query, now).is_ok());
        assert_eq!(check_credentials("s3cret", None, &query, now + 301), Err("timestamp out of range"));
        assert_eq!(check_credentials("s3cret", None, "ts=1700000000&sig=00", now), Err("bad signature"));
        assert_eq!(check_credentials("s3cret", None, "", now), Err("missing credentials"));
    }

    #[test]
    fn message_limit_covers_base64_overhead() {
        assert!(max_message_size(3_000) >= 4_000);
    }
}
