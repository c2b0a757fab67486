// NATS-backed peer link
//
// Each side listens on `{prefix}.{role}.msg` for messages and `{prefix}.{role}.file`
// for whole-file segments. Reply-expecting sends use NATS request/reply.
// The durable context lives in a JetStream key-value bucket keyed by role, so
// the peer can read our last state even after either side restarts.

use anyhow::{Context, Result};
use async_nats::jetstream::kv;
use async_nats::Client;
use base64::Engine;
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify, OnceCell};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::messages::{FileTransferEnvelope, PeerContext, PeerMessage};
use super::peer::{
    not_activated, not_reachable, LinkEvent, LinkEvents, PeerLink, Replier, ReplyMode,
    TransferHandle,
};
use crate::device::DeviceRole;
use crate::error::{SyncError, TransferFailure};

/// Segment size for whole-file transfers (stays under the default 1 MiB payload limit)
pub const FILE_SEGMENT_BYTES: usize = 512 * 1024;

#[derive(Debug, Clone)]
pub struct NatsLinkConfig {
    pub url: String,
    pub subject_prefix: String,
    pub context_bucket: String,
    pub role: DeviceRole,
    /// Where whole files received from the peer are written
    pub inbox_dir: PathBuf,
    /// Per-segment ack timeout for file transfers
    pub segment_timeout: Duration,
}

impl NatsLinkConfig {
    fn message_subject(&self, role: DeviceRole) -> String {
        format!("{}.{}.msg", self.subject_prefix, role)
    }

    fn file_subject(&self, role: DeviceRole) -> String {
        format!("{}.{}.file", self.subject_prefix, role)
    }

    fn context_key(&self, role: DeviceRole) -> String {
        format!("context.{}", role)
    }
}

/// One slice of a whole-file transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileSegment {
    transfer_id: Uuid,
    index: u32,
    total: u32,
    envelope: FileTransferEnvelope,
    /// Base64-encoded file bytes
    data: String,
}

struct QueuedFile {
    transfer_id: Uuid,
    location: PathBuf,
    envelope: FileTransferEnvelope,
}

struct Shared {
    config: NatsLinkConfig,
    client: OnceCell<Client>,
    kv: OnceCell<kv::Store>,
    activated: AtomicBool,
    reachable: AtomicBool,
    events: mpsc::UnboundedSender<LinkEvent>,
    outgoing: Mutex<VecDeque<QueuedFile>>,
    outgoing_len: std::sync::atomic::AtomicUsize,
    flush: Notify,
}

pub struct NatsPeerLink {
    shared: Arc<Shared>,
    name: String,
}

impl NatsPeerLink {
    pub fn new(config: NatsLinkConfig) -> (Self, LinkEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let name = format!("nats:{}", config.role);
        let shared = Arc::new(Shared {
            config,
            client: OnceCell::new(),
            kv: OnceCell::new(),
            activated: AtomicBool::new(false),
            reachable: AtomicBool::new(false),
            events,
            outgoing: Mutex::new(VecDeque::new()),
            outgoing_len: std::sync::atomic::AtomicUsize::new(0),
            flush: Notify::new(),
        });
        (Self { shared, name }, rx)
    }

    async fn connect(&self) -> Result<()> {
        let shared = &self.shared;
        let config = &shared.config;
        info!("Connecting to NATS at {} as {}", config.url, config.role);

        let client_name = format!("loqa-sync-{}", config.role);
        let callback_shared = Arc::downgrade(&self.shared);
        let client = async_nats::ConnectOptions::new()
            .name(client_name.as_str())
            .retry_on_initial_connect()
            .event_callback(move |event| {
                let shared = callback_shared.clone();
                async move {
                    let Some(shared) = shared.upgrade() else {
                        return;
                    };
                    match event {
                        async_nats::Event::Connected => {
                            shared.set_reachable(true);
                            shared.flush.notify_one();
                        }
                        async_nats::Event::Disconnected => shared.set_reachable(false),
                        other => debug!("NATS event: {}", other),
                    }
                }
            })
            .connect(config.url.as_str())
            .await
            .context("Failed to connect to NATS")?;

        if matches!(
            client.connection_state(),
            async_nats::connection::State::Connected
        ) {
            shared.set_reachable(true);
        }

        let messages = client
            .subscribe(config.message_subject(config.role))
            .await
            .context("Failed to subscribe to peer messages")?;
        let files = client
            .subscribe(config.file_subject(config.role))
            .await
            .context("Failed to subscribe to file segments")?;

        let _ = shared.client.set(client.clone());

        tokio::spawn(receive_messages(Arc::clone(shared), client.clone(), messages));
        tokio::spawn(receive_files(Arc::clone(shared), client.clone(), files));
        tokio::spawn(flush_outgoing(Arc::downgrade(shared)));

        match open_context_store(&client, &config.context_bucket).await {
            Ok(store) => {
                self.watch_peer_context(&store).await;
                let _ = shared.kv.set(store);
            }
            Err(e) => warn!("Durable context unavailable (JetStream): {:#}", e),
        }

        info!("Connected to NATS successfully");
        Ok(())
    }

    async fn watch_peer_context(&self, store: &kv::Store) {
        let config = &self.shared.config;
        let key = config.context_key(config.role.peer());

        match store.get(key.as_str()).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<PeerContext>(&bytes) {
                Ok(context) => {
                    let _ = self.shared.events.send(LinkEvent::ContextReceived(context));
                }
                Err(e) => warn!("Ignoring malformed peer context: {}", e),
            },
            Ok(None) => debug!("No stored context for {}", key),
            Err(e) => warn!("Failed to read peer context: {}", e),
        }

        match store.watch(key.as_str()).await {
            Ok(mut watch) => {
                let events = self.shared.events.clone();
                tokio::spawn(async move {
                    while let Some(entry) = watch.next().await {
                        match entry {
                            Ok(entry) => {
                                let Ok(context) = serde_json::from_slice::<PeerContext>(&entry.value)
                                else {
                                    continue;
                                };
                                if events.send(LinkEvent::ContextReceived(context)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("Context watch error: {}", e),
                        }
                    }
                });
            }
            Err(e) => warn!("Failed to watch peer context: {}", e),
        }
    }
}

impl Shared {
    fn set_reachable(&self, reachable: bool) {
        if self.reachable.swap(reachable, Ordering::SeqCst) != reachable {
            info!("NATS link {}", if reachable { "reachable" } else { "unreachable" });
            let _ = self.events.send(LinkEvent::ReachabilityChanged(reachable));
        }
    }
}

async fn open_context_store(client: &Client, bucket: &str) -> Result<kv::Store> {
    let js = async_nats::jetstream::new(client.clone());
    if let Ok(store) = js.get_key_value(bucket).await {
        return Ok(store);
    }
    js.create_key_value(kv::Config {
        bucket: bucket.to_string(),
        history: 1,
        ..Default::default()
    })
    .await
    .context("Failed to create context bucket")
}

async fn receive_messages(shared: Arc<Shared>, client: Client, mut sub: async_nats::Subscriber) {
    while let Some(msg) = sub.next().await {
        let message = match PeerMessage::from_json(&msg.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Failed to parse peer message: {}", e);
                continue;
            }
        };

        let reply = match msg.reply {
            Some(subject) => {
                let (replier, rx) = Replier::pair();
                let client = client.clone();
                let subject = subject.to_string();
                tokio::spawn(async move {
                    if let Ok(answer) = rx.await {
                        match answer.to_json() {
                            Ok(bytes) => {
                                if let Err(e) = client.publish(subject, bytes.into()).await {
                                    warn!("Failed to publish reply: {}", e);
                                }
                            }
                            Err(e) => error!("Failed to encode reply: {}", e),
                        }
                    }
                });
                Some(replier)
            }
            None => None,
        };

        if shared
            .events
            .send(LinkEvent::MessageReceived { message, reply })
            .is_err()
        {
            break;
        }
    }
    debug!("Peer message subscription closed");
}

struct PartialFile {
    envelope: FileTransferEnvelope,
    total: u32,
    segments: BTreeMap<u32, Vec<u8>>,
}

async fn receive_files(shared: Arc<Shared>, client: Client, mut sub: async_nats::Subscriber) {
    let mut partial: HashMap<Uuid, PartialFile> = HashMap::new();

    while let Some(msg) = sub.next().await {
        let segment = match serde_json::from_slice::<FileSegment>(&msg.payload) {
            Ok(segment) => segment,
            Err(e) => {
                warn!("Failed to parse file segment: {}", e);
                continue;
            }
        };

        let data = match base64::engine::general_purpose::STANDARD.decode(&segment.data) {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to decode file segment {}: {}", segment.index, e);
                continue;
            }
        };

        if let Some(reply) = msg.reply {
            if let Err(e) = client.publish(reply.to_string(), "ok".into()).await {
                warn!("Failed to ack file segment: {}", e);
            }
        }

        let entry = partial
            .entry(segment.transfer_id)
            .or_insert_with(|| PartialFile {
                envelope: segment.envelope.clone(),
                total: segment.total,
                segments: BTreeMap::new(),
            });
        entry.segments.insert(segment.index, data);

        if entry.segments.len() as u32 == entry.total {
            if let Some(file) = partial.remove(&segment.transfer_id) {
                match write_received_file(&shared.config.inbox_dir, file).await {
                    Ok((envelope, location)) => {
                        let _ = shared
                            .events
                            .send(LinkEvent::FileReceived { envelope, location });
                    }
                    Err(e) => error!("Failed to store received file: {:#}", e),
                }
            }
        }
    }
}

async fn write_received_file(
    inbox: &Path,
    file: PartialFile,
) -> Result<(FileTransferEnvelope, PathBuf)> {
    tokio::fs::create_dir_all(inbox)
        .await
        .context("Failed to create inbox directory")?;

    let name = Path::new(&file.envelope.filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("{}.wav", file.envelope.recording_id));
    let location = inbox.join(name);

    let bytes: Vec<u8> = file.segments.into_values().flatten().collect();
    tokio::fs::write(&location, &bytes)
        .await
        .with_context(|| format!("Failed to write {}", location.display()))?;

    info!(
        "Received recording {} ({} bytes) -> {}",
        file.envelope.recording_id,
        bytes.len(),
        location.display()
    );

    Ok((file.envelope, location))
}

/// Drain the outgoing file queue whenever the link is reachable
async fn flush_outgoing(shared: std::sync::Weak<Shared>) {
    loop {
        let Some(strong) = shared.upgrade() else {
            return;
        };

        while strong.reachable.load(Ordering::SeqCst) {
            let next = strong.outgoing.lock().await.pop_front();
            let Some(file) = next else {
                break;
            };

            match send_file(&strong, &file).await {
                Ok(()) => {
                    strong.outgoing_len.fetch_sub(1, Ordering::SeqCst);
                    let _ = strong.events.send(LinkEvent::FileTransferFinished {
                        transfer_id: file.transfer_id,
                        result: Ok(()),
                    });
                }
                Err(FileSendError::Unreadable(msg)) => {
                    strong.outgoing_len.fetch_sub(1, Ordering::SeqCst);
                    error!("File transfer {} abandoned: {}", file.transfer_id, msg);
                    let _ = strong.events.send(LinkEvent::FileTransferFinished {
                        transfer_id: file.transfer_id,
                        result: Err(TransferFailure::Transport(msg)),
                    });
                }
                Err(FileSendError::Interrupted(e)) => {
                    warn!("File transfer {} interrupted: {}", file.transfer_id, e);
                    strong.outgoing.lock().await.push_front(file);
                    break;
                }
            }
        }

        // Wake on reconnect / new work, or poll occasionally
        let notified = async {
            strong.flush.notified().await;
        };
        let _ = tokio::time::timeout(Duration::from_secs(5), notified).await;
        drop(strong);
    }
}

enum FileSendError {
    /// The source file cannot be read; retrying will not help
    Unreadable(String),
    /// The link failed mid-transfer; the file is re-queued
    Interrupted(TransferFailure),
}

async fn send_file(shared: &Shared, file: &QueuedFile) -> Result<(), FileSendError> {
    let client = shared
        .client
        .get()
        .ok_or(FileSendError::Interrupted(TransferFailure::SessionNotAvailable))?;

    let bytes = tokio::fs::read(&file.location).await.map_err(|e| {
        FileSendError::Unreadable(format!("cannot read {}: {}", file.location.display(), e))
    })?;

    let segments: Vec<&[u8]> = if bytes.is_empty() {
        vec![&bytes[..]]
    } else {
        bytes.chunks(FILE_SEGMENT_BYTES).collect()
    };
    let total = segments.len() as u32;
    let subject = shared.config.file_subject(shared.config.role.peer());

    for (index, data) in segments.into_iter().enumerate() {
        let segment = FileSegment {
            transfer_id: file.transfer_id,
            index: index as u32,
            total,
            envelope: file.envelope.clone(),
            data: base64::engine::general_purpose::STANDARD.encode(data),
        };
        let payload = serde_json::to_vec(&segment)
            .map_err(|e| FileSendError::Unreadable(e.to_string()))?;

        match tokio::time::timeout(
            shared.config.segment_timeout,
            client.request(subject.clone(), payload.into()),
        )
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(FileSendError::Interrupted(map_request_error(e))),
            Err(_) => return Err(FileSendError::Interrupted(TransferFailure::ReplyTimeout)),
        }
    }

    debug!(
        "File transfer {} sent in {} segments",
        file.transfer_id, total
    );
    Ok(())
}

fn map_request_error(err: async_nats::client::RequestError) -> TransferFailure {
    use async_nats::client::RequestErrorKind;
    match err.kind() {
        RequestErrorKind::TimedOut => TransferFailure::ReplyTimeout,
        RequestErrorKind::NoResponders => TransferFailure::PeerNotReachable,
        _ => TransferFailure::Transport(err.to_string()),
    }
}

#[async_trait::async_trait]
impl PeerLink for NatsPeerLink {
    async fn activate(&self) -> Result<(), SyncError> {
        if self.shared.activated.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.connect()
            .await
            .map_err(|e| SyncError::transfer(TransferFailure::Transport(format!("{:#}", e))))?;
        self.shared.activated.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_activated(&self) -> bool {
        self.shared.activated.load(Ordering::SeqCst)
    }

    fn is_reachable(&self) -> bool {
        self.shared.reachable.load(Ordering::SeqCst)
    }

    async fn send(
        &self,
        message: PeerMessage,
        reply: ReplyMode,
    ) -> Result<Option<PeerMessage>, SyncError> {
        if !self.is_activated() {
            return Err(not_activated());
        }
        if !self.is_reachable() {
            return Err(not_reachable());
        }

        let client = self.shared.client.get().ok_or_else(not_activated)?;
        let config = &self.shared.config;
        let subject = config.message_subject(config.role.peer());
        let payload = message
            .to_json()
            .map_err(|e| SyncError::transfer(TransferFailure::Transport(e.to_string())))?;

        match reply {
            ReplyMode::FireAndForget => {
                client
                    .publish(subject, payload.into())
                    .await
                    .map_err(|e| SyncError::transfer(TransferFailure::Transport(e.to_string())))?;
                Ok(None)
            }
            ReplyMode::Expect(timeout) => {
                let response =
                    match tokio::time::timeout(timeout, client.request(subject, payload.into()))
                        .await
                    {
                        Ok(Ok(response)) => response,
                        Ok(Err(e)) => return Err(SyncError::transfer(map_request_error(e))),
                        Err(_) => return Err(SyncError::transfer(TransferFailure::ReplyTimeout)),
                    };

                let answer = PeerMessage::from_json(&response.payload).map_err(|e| {
                    SyncError::transfer(TransferFailure::UnexpectedReply(e.to_string()))
                })?;
                Ok(Some(answer))
            }
        }
    }

    async fn update_context(&self, context: PeerContext) -> Result<(), SyncError> {
        if !self.is_activated() {
            return Err(not_activated());
        }
        let store = self.shared.kv.get().ok_or_else(|| {
            SyncError::transfer(TransferFailure::Transport(
                "durable context store unavailable".to_string(),
            ))
        })?;

        let bytes = serde_json::to_vec(&context)
            .map_err(|e| SyncError::transfer(TransferFailure::Transport(e.to_string())))?;
        let config = &self.shared.config;
        store
            .put(config.context_key(config.role), bytes.into())
            .await
            .map_err(|e| SyncError::transfer(TransferFailure::Transport(e.to_string())))?;
        Ok(())
    }

    async fn transfer_file(
        &self,
        location: &Path,
        envelope: FileTransferEnvelope,
    ) -> Result<TransferHandle, SyncError> {
        if !self.is_activated() {
            return Err(not_activated());
        }

        let transfer_id = Uuid::new_v4();
        self.shared.outgoing.lock().await.push_back(QueuedFile {
            transfer_id,
            location: location.to_path_buf(),
            envelope,
        });
        self.shared.outgoing_len.fetch_add(1, Ordering::SeqCst);
        self.shared.flush.notify_one();

        Ok(TransferHandle { transfer_id })
    }

    fn outstanding_transfers(&self) -> usize {
        self.shared.outgoing_len.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
