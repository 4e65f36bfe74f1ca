//! Board session: one task per open board view.
//!
//! ARCHITECTURE
//! ============
//! `BoardSession::spawn` moves the channel manager, presence tracker,
//! connection monitor, and undo history into a single task. Every map
//! mutation (local command, peer broadcast, change-stream event, resync)
//! happens on that task, so nothing reads the map mid-mutation and no locks
//! are needed. Callers talk to it through a cloneable `SessionHandle` and
//! observe it through `watch` receivers.
//!
//! LIFECYCLE
//! =========
//! 1. Subscribe both object feeds and the presence feed.
//! 2. If connected: load the board and announce presence.
//! 3. Loop over commands, inbound traffic, status changes, and timer deadlines.
//!    A recovery to `Connected` reloads and re-announces.
//! 4. On `close` or when every handle is dropped: drop the feeds, wait for
//!    queued writes, and untrack presence.

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{info, warn};

use crate::channel::{BoardFeeds, ChannelManager};
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::connection::{ConnectionMonitor, ConnectionStatus, Indicator};
use crate::message::PresenceEvent;
use crate::model::{CanvasObject, ObjectId, ObjectPatch, Point};
use crate::presence::{PresenceTracker, Roster};
use crate::store::Snapshot;
use crate::transport::{PresenceInbound, Transport};
use crate::undo::{GroupRecorder, UndoHistory};

const COMMAND_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("board session closed")]
pub struct SessionClosed;

/// The local user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
}

impl Participant {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self { id: id.into(), display_name: display_name.into() }
    }
}

/// One mutation inside an externally driven unit of work.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationIntent {
    /// Placed on top of the stack.
    Create(CanvasObject),
    Update { id: ObjectId, patch: ObjectPatch },
    /// Recorded as a single batch entry.
    UpdateMany(Vec<(ObjectId, ObjectPatch)>),
    Delete { id: ObjectId },
}

enum Command {
    Create(CanvasObject, oneshot::Sender<CanvasObject>),
    Update(ObjectId, ObjectPatch, oneshot::Sender<Option<CanvasObject>>),
    Delete(ObjectId, oneshot::Sender<Option<CanvasObject>>),
    Apply(Vec<MutationIntent>, oneshot::Sender<usize>),
    Undo(oneshot::Sender<bool>),
    Redo(oneshot::Sender<bool>),
    Cursor(Option<Point>),
    Close(oneshot::Sender<()>),
}

// =============================================================================
// HANDLE
// =============================================================================

#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<Snapshot>,
    roster: watch::Receiver<Roster>,
    indicator: watch::Receiver<Indicator>,
}

impl SessionHandle {
    /// Render feed: a fresh snapshot after every map mutation.
    #[must_use]
    pub fn snapshot(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.clone()
    }

    /// Everyone else on the board.
    #[must_use]
    pub fn roster(&self) -> watch::Receiver<Roster> {
        self.roster.clone()
    }

    #[must_use]
    pub fn indicator(&self) -> watch::Receiver<Indicator> {
        self.indicator.clone()
    }

    /// Create an object on top of the stack.
    pub async fn create(&self, object: CanvasObject) -> Result<CanvasObject, SessionClosed> {
        self.call(|tx| Command::Create(object, tx)).await
    }

    pub async fn update(
        &self,
        id: impl Into<ObjectId>,
        patch: ObjectPatch,
    ) -> Result<Option<CanvasObject>, SessionClosed> {
        let id = id.into();
        self.call(|tx| Command::Update(id, patch, tx)).await
    }

    pub async fn delete(&self, id: impl Into<ObjectId>) -> Result<Option<CanvasObject>, SessionClosed> {
        let id = id.into();
        self.call(|tx| Command::Delete(id, tx)).await
    }

    /// Apply a unit of work as one undo group. Returns how many entries were
    /// recorded.
    pub async fn apply(&self, intents: Vec<MutationIntent>) -> Result<usize, SessionClosed> {
        self.call(|tx| Command::Apply(intents, tx)).await
    }

    pub async fn undo(&self) -> Result<bool, SessionClosed> {
        self.call(Command::Undo).await
    }

    pub async fn redo(&self) -> Result<bool, SessionClosed> {
        self.call(Command::Redo).await
    }

    /// Report the local pointer. `None` on pointer-leave. Dropped if the
    /// session is backed up.
    pub fn cursor(&self, position: Option<Point>) {
        let _ = self.commands.try_send(Command::Cursor(position));
    }

    /// Shut the session down and wait for it to finish.
    pub async fn close(&self) {
        let _ = self.call(Command::Close).await;
    }

    async fn call<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R, SessionClosed> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).await.map_err(|_| SessionClosed)?;
        rx.await.map_err(|_| SessionClosed)
    }
}

// =============================================================================
// SESSION
// =============================================================================

pub struct BoardSession {
    channel: ChannelManager,
    presence: PresenceTracker,
    monitor: ConnectionMonitor,
    history: UndoHistory,
    feeds: BoardFeeds,
    presence_rx: PresenceInbound,
    status_rx: watch::Receiver<ConnectionStatus>,
    indicator_tx: watch::Sender<Indicator>,
    commands: mpsc::Receiver<Command>,
}

impl BoardSession {
    /// Start a session for `board_id`. Must be called inside a tokio runtime.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
        board_id: impl Into<String>,
        participant: Participant,
    ) -> (SessionHandle, JoinHandle<()>) {
        let board_id = board_id.into();
        let channel = ChannelManager::new(
            Arc::clone(&transport),
            clock,
            board_id.clone(),
            Some(participant.id.clone()),
        );
        let presence = PresenceTracker::new(
            Arc::clone(&transport),
            board_id.as_str(),
            participant.id,
            participant.display_name,
            &config,
        );
        let mut status_rx = transport.status();
        let initial = *status_rx.borrow_and_update();
        let monitor = ConnectionMonitor::new(initial, &config, Instant::now());
        let (indicator_tx, indicator_rx) = watch::channel(monitor.indicator());
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);

        let handle = SessionHandle {
            commands: command_tx,
            snapshot: channel.subscribe_render(),
            roster: presence.subscribe(),
            indicator: indicator_rx,
        };

        let session = Self {
            feeds: channel.subscribe(),
            presence_rx: transport.subscribe_presence(&board_id),
            channel,
            presence,
            monitor,
            history: UndoHistory::new(config.undo_history),
            status_rx,
            indicator_tx,
            commands: command_rx,
        };
        let task = tokio::spawn(session.run());
        (handle, task)
    }

    async fn run(mut self) {
        info!(board_id = %self.channel.board_id(), "session: started");
        if self.monitor.status() == ConnectionStatus::Connected {
            self.resync().await;
        }

        let mut feeds_open = true;
        let mut presence_open = true;
        let mut status_open = true;
        let mut close_ack = None;

        loop {
            let deadline = earliest(self.monitor.next_deadline(), self.presence.next_deadline());
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Close(ack)) => {
                        close_ack = Some(ack);
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => break,
                },
                payload = self.feeds.recv(), if feeds_open => match payload {
                    Some(payload) => {
                        self.channel.handle_inbound(payload);
                    }
                    None => feeds_open = false,
                },
                event = self.presence_rx.recv(), if presence_open => match event {
                    Some(PresenceEvent::Sync(roster)) => self.presence.on_presence_sync(roster),
                    Some(PresenceEvent::Broadcast(payload)) => self.presence.on_cursor_broadcast(payload),
                    None => presence_open = false,
                },
                changed = self.status_rx.changed(), if status_open => {
                    if changed.is_err() {
                        status_open = false;
                        continue;
                    }
                    let status = *self.status_rx.borrow_and_update();
                    if status.is_degraded() {
                        self.presence.on_link_lost();
                    }
                    if self.monitor.on_status(status, Instant::now()) {
                        self.resync().await;
                    }
                    self.publish_indicator();
                }
                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let now = Instant::now();
                    self.monitor.on_tick(now);
                    self.presence.flush_cursor(now);
                    self.publish_indicator();
                }
            }
        }

        self.shutdown().await;
        if let Some(ack) = close_ack {
            let _ = ack.send(());
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Create(object, reply) => {
                let created = self.create_on_top(object);
                let _ = reply.send(created);
            }
            Command::Update(id, patch, reply) => {
                let _ = reply.send(self.channel.update(&id, &patch));
            }
            Command::Delete(id, reply) => {
                let _ = reply.send(self.channel.delete(&id));
            }
            Command::Apply(intents, reply) => {
                let _ = reply.send(self.apply(intents));
            }
            Command::Undo(reply) => {
                let _ = reply.send(self.history.undo(&mut self.channel));
            }
            Command::Redo(reply) => {
                let _ = reply.send(self.history.redo(&mut self.channel));
            }
            Command::Cursor(position) => self.presence.send_cursor(position, Instant::now()),
            Command::Close(_) => {}
        }
    }

    fn create_on_top(&mut self, mut object: CanvasObject) -> CanvasObject {
        object.stack_order = self.channel.store().next_stack_order();
        self.channel.create(object)
    }

    fn apply(&mut self, intents: Vec<MutationIntent>) -> usize {
        let mut recorder = GroupRecorder::new(&mut self.channel);
        for intent in intents {
            match intent {
                MutationIntent::Create(mut object) => {
                    object.stack_order = recorder_next_stack_order(&recorder);
                    recorder.create(object);
                }
                MutationIntent::Update { id, patch } => {
                    recorder.update(&id, &patch);
                }
                MutationIntent::UpdateMany(updates) => {
                    recorder.update_many(updates.iter().map(|(id, patch)| (id.as_str(), patch)));
                }
                MutationIntent::Delete { id } => {
                    recorder.delete(&id);
                }
            }
        }
        let group = recorder.finish();
        let recorded = group.entries().len();
        self.history.push(group);
        recorded
    }

    /// Full reload plus presence re-announce.
    async fn resync(&mut self) {
        if let Err(e) = self.channel.load().await {
            warn!(board_id = %self.channel.board_id(), error = %e, "session: load failed");
        }
        if let Err(e) = self.presence.announce().await {
            warn!(board_id = %self.channel.board_id(), error = %e, "session: announce failed");
        }
    }

    fn publish_indicator(&self) {
        let indicator = self.monitor.indicator();
        self.indicator_tx.send_if_modified(|current| {
            if *current == indicator {
                return false;
            }
            *current = indicator;
            true
        });
    }

    async fn shutdown(self) {
        let Self { channel, mut presence, feeds, presence_rx, .. } = self;
        // Unsubscribe before anything else can touch the map.
        drop(feeds);
        drop(presence_rx);
        channel.flush().await;
        if let Err(e) = presence.leave().await {
            warn!(board_id = %channel.board_id(), error = %e, "session: untrack failed");
        }
        info!(board_id = %channel.board_id(), "session: closed");
    }
}

fn recorder_next_stack_order(recorder: &GroupRecorder<'_, ChannelManager>) -> i64 {
    recorder.target().store().next_stack_order()
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
