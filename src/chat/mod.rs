// Real-time chat synchronisation
// The components below are synchronous state machines; `ChatClient` drives
// them from a single tokio event loop that owns the websocket.

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::future::pending;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

pub mod connection;
pub mod dispatcher;
pub mod engine;
pub mod outbound;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod timeline;
pub mod typing;

pub use connection::{ConnectionManager, ConnectionState, ConnectionStatus, FrameSink, RetryPolicy};
pub use dispatcher::{EventDispatcher, SubscriptionId};
pub use engine::{ChatEngine, EngineSettings};
pub use protocol::{EventKind, InboundEvent, OutboundFrame};

use crate::collab::{HistoryProvider, Uploader};
use crate::config::ChatConfig;
use crate::models::{Attachment, ConversationSummary, Message, Notice, PresenceRecord};

/// User intents fed into the event loop.
#[derive(Debug, Clone)]
pub enum Command {
    /// A keystroke in the composer.
    Input,
    SendText(String),
    SendFile { path: PathBuf, caption: String },
    Delete(String),
    /// Switch to an existing conversation.
    Open(String),
    /// Start a conversation with a user we have none with yet.
    StartWith(String),
    Leave,
    RequestInbox,
    LoadHistory,
    Quit,
}

/// State snapshots pushed to the UI after each change.
#[derive(Debug, Clone)]
pub enum ClientUpdate {
    Status(ConnectionStatus),
    Timeline(Vec<Message>),
    Typing(Vec<String>),
    Presence(Vec<PresenceRecord>),
    Inbox(Vec<ConversationSummary>),
    Notice(Notice),
}

// Results delivered back into the loop by IO tasks. `generation` tags which
// socket an event belongs to, so late events from a replaced socket are ignored.
enum Internal {
    Opened { generation: u64, writer: mpsc::UnboundedSender<String> },
    Frame { generation: u64, text: String },
    Closed { generation: u64, reason: String },
    History { conversation_id: String, result: Result<Vec<Message>> },
    Uploaded { caption: String, result: Result<Attachment> },
}

pub struct ChatClient {
    config: ChatConfig,
    connection: ConnectionManager,
    engine: ChatEngine,
    history: Option<Arc<dyn HistoryProvider>>,
    uploader: Option<Arc<dyn Uploader>>,
    generation: u64,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: Option<mpsc::UnboundedReceiver<Internal>>,
    io_tasks: Vec<JoinHandle<()>>,
}

impl ChatClient {
    pub fn new(config: ChatConfig, conversation_id: Option<String>, counterpart_id: Option<String>) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            connection: ConnectionManager::new(config.retry_policy()),
            engine: ChatEngine::new(config.engine_settings(), conversation_id, counterpart_id),
            config,
            history: None,
            uploader: None,
            generation: 0,
            internal_tx,
            internal_rx: Some(internal_rx),
            io_tasks: Vec::new(),
        }
    }

    pub fn with_history(mut self, provider: Arc<dyn HistoryProvider>) -> Self {
        self.history = Some(provider);
        self
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn Uploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Register observers before calling `run`.
    pub fn dispatcher_mut(&mut self) -> &mut EventDispatcher {
        self.engine.dispatcher_mut()
    }

    /// Run until `Quit` or the command channel closes, then tear down.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        updates: mpsc::UnboundedSender<ClientUpdate>,
    ) -> Result<()> {
        let mut internal_rx = self
            .internal_rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("ChatClient::run called twice"))?;
        let mut status_rx = self.connection.subscribe_status();

        let url = self.config.socket_url();
        if let Some(endpoint) = self.connection.connect(&url) {
            self.open_socket(endpoint);
        }
        self.load_history();

        let mut watchdog = tokio::time::interval(self.config.watchdog_interval());
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut heartbeat = self.config.heartbeat_interval().map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            let retry_at = self.connection.next_retry_at();
            let typing_at = self.engine.next_deadline();

            tokio::select! {
                Some(event) = internal_rx.recv() => self.handle_internal(event, &updates),
                command = commands.recv() => match command {
                    Some(Command::Quit) | None => break,
                    Some(command) => self.handle_command(command, &updates),
                },
                Some(status) = status_rx.recv() => {
                    let _ = updates.send(ClientUpdate::Status(status));
                }
                _ = watchdog.tick() => {
                    if let Some(endpoint) = self.connection.on_watchdog(Instant::now()) {
                        self.open_socket(endpoint);
                    }
                }
                _ = sleep_until(retry_at) => {
                    if let Some(endpoint) = self.connection.poll_retry(Instant::now()) {
                        self.open_socket(endpoint);
                    }
                }
                _ = sleep_until(typing_at) => {
                    self.engine.poll_timers(Instant::now(), &mut self.connection);
                }
                _ = tick(&mut heartbeat) => {
                    self.connection.send(&OutboundFrame::Ping);
                }
            }

            for notice in self.engine.take_notices() {
                let _ = updates.send(ClientUpdate::Notice(notice));
            }
        }

        self.shutdown();
        Ok(())
    }

    fn shutdown(&mut self) {
        info!("Shutting down chat client");
        self.engine.teardown(&mut self.connection);
        for task in self.io_tasks.drain(..) {
            task.abort();
        }
    }

    fn open_socket(&mut self, url: String) {
        self.generation += 1;
        let generation = self.generation;
        let tx = self.internal_tx.clone();
        let connect_timeout = self.config.connect_timeout();

        self.io_tasks.retain(|task| !task.is_finished());
        self.io_tasks.push(tokio::spawn(async move {
            debug!("Opening socket (generation {})", generation);
            let stream = match tokio::time::timeout(connect_timeout, connect_async(url.as_str())).await {
                Ok(Ok((stream, _response))) => stream,
                Ok(Err(e)) => {
                    let _ = tx.send(Internal::Closed { generation, reason: format!("connect failed: {}", e) });
                    return;
                }
                Err(_) => {
                    let _ = tx.send(Internal::Closed {
                        generation,
                        reason: format!("connect timed out after {:?}", connect_timeout),
                    });
                    return;
                }
            };

            let (mut write, mut read) = stream.split();
            let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<String>();
            tokio::spawn(async move {
                while let Some(text) = writer_rx.recv().await {
                    if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                        warn!("Socket write failed: {}", e);
                        break;
                    }
                }
                let _ = write.close().await;
            });
            if tx.send(Internal::Opened { generation, writer: writer_tx }).is_err() {
                return;
            }

            let reason = loop {
                match read.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        let text = text.as_str().to_owned();
                        if tx.send(Internal::Frame { generation, text }).is_err() {
                            return;
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        break format!("closed by server: {:?}", frame);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break format!("read error: {}", e),
                    None => break "stream ended".to_string(),
                }
            };
            let _ = tx.send(Internal::Closed { generation, reason });
        }));
    }

    fn handle_internal(&mut self, event: Internal, updates: &mpsc::UnboundedSender<ClientUpdate>) {
        match event {
            Internal::Opened { generation, writer } if generation == self.generation => {
                self.connection.on_open(writer);
                self.engine.on_connected(&mut self.connection);
            }
            Internal::Frame { generation, text } if generation == self.generation => {
                if let Some(kind) = self.engine.handle_frame(&text, &mut self.connection) {
                    self.publish(kind, updates);
                }
            }
            Internal::Closed { generation, reason } if generation == self.generation => {
                self.connection.on_close(Instant::now(), &reason);
            }
            Internal::Opened { generation, .. }
            | Internal::Frame { generation, .. }
            | Internal::Closed { generation, .. } => {
                debug!("Ignoring event from stale socket generation {}", generation);
            }
            Internal::History { conversation_id, result } => {
                self.engine
                    .finish_history_load(&conversation_id, result, &mut self.connection);
                let _ = updates.send(ClientUpdate::Timeline(self.engine.timeline().messages().to_vec()));
            }
            Internal::Uploaded { caption, result } => match result {
                Ok(attachment) => {
                    self.send_with(|engine, sink| engine.send_attachment(&caption, attachment, sink), updates);
                }
                Err(e) => {
                    error!("Upload failed: {:#}", e);
                    self.engine.report_failure("Could not upload file", &e);
                }
            },
        }
    }

    fn handle_command(&mut self, command: Command, updates: &mpsc::UnboundedSender<ClientUpdate>) {
        match command {
            Command::Input => self.engine.on_input(Instant::now(), &mut self.connection),
            Command::SendText(text) => {
                self.send_with(|engine, sink| engine.send_text(&text, sink), updates);
            }
            Command::SendFile { path, caption } => self.upload(path, caption),
            Command::Delete(message_id) => {
                if let Err(e) = self.engine.delete_message(&message_id, &mut self.connection) {
                    let _ = updates.send(ClientUpdate::Notice(Notice::Error(e.to_string())));
                }
            }
            Command::Open(conversation_id) => {
                self.engine
                    .open_conversation(Some(conversation_id), None, &mut self.connection);
                let _ = updates.send(ClientUpdate::Timeline(Vec::new()));
                self.load_history();
            }
            Command::StartWith(user_id) => {
                self.engine.open_conversation(None, Some(user_id), &mut self.connection);
                let _ = updates.send(ClientUpdate::Timeline(Vec::new()));
            }
            Command::Leave => self.engine.leave(&mut self.connection),
            Command::RequestInbox => {
                if self.engine.request_inbox(&mut self.connection).is_none() {
                    let _ = updates.send(ClientUpdate::Notice(Notice::Error(
                        "Inbox unavailable while disconnected".to_string(),
                    )));
                }
            }
            Command::LoadHistory => self.load_history(),
            Command::Quit => {}
        }
    }

    fn send_with<F>(&mut self, send: F, updates: &mpsc::UnboundedSender<ClientUpdate>)
    where
        F: FnOnce(&mut ChatEngine, &mut dyn FrameSink) -> crate::error::ChatResult<String>,
    {
        match send(&mut self.engine, &mut self.connection) {
            Ok(correlation_id) => {
                debug!("Queued message {}", correlation_id);
                let _ = updates.send(ClientUpdate::Timeline(self.engine.timeline().messages().to_vec()));
            }
            Err(e) => {
                let _ = updates.send(ClientUpdate::Notice(Notice::Error(e.to_string())));
            }
        }
    }

    fn publish(&self, kind: EventKind, updates: &mpsc::UnboundedSender<ClientUpdate>) {
        let update = match kind {
            EventKind::Ack | EventKind::MessageSent | EventKind::ReadReceiptUpdated | EventKind::MessageDeleted => {
                ClientUpdate::Timeline(self.engine.timeline().messages().to_vec())
            }
            EventKind::Typing => ClientUpdate::Typing(self.engine.typing_users()),
            EventKind::PresenceStatus | EventKind::PresenceUpdated => {
                let counterpart: Vec<&str> = self.engine.session().counterpart_id().into_iter().collect();
                ClientUpdate::Presence(self.engine.presence_records(&counterpart))
            }
            EventKind::InboxUpdated => ClientUpdate::Inbox(self.engine.inbox().to_vec()),
            EventKind::Pong | EventKind::Notification | EventKind::Fallback => return,
        };
        let _ = updates.send(update);
    }

    fn load_history(&mut self) {
        let Some(provider) = self.history.clone() else {
            return;
        };
        let Some(query) = self.engine.begin_history_load() else {
            debug!("History load skipped");
            return;
        };
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = provider.fetch_history(&query).await;
            let _ = tx.send(Internal::History {
                conversation_id: query.conversation_id,
                result,
            });
        });
    }

    fn upload(&mut self, path: PathBuf, caption: String) {
        let Some(uploader) = self.uploader.clone() else {
            self.engine
                .report_failure("Could not upload file", &anyhow::anyhow!("no uploader configured"));
            return;
        };
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = uploader.upload(&path).await;
            let _ = tx.send(Internal::Uploaded { caption, result });
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => pending::<()>().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending::<()>().await,
    }
}
