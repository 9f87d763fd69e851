//! DocumentHandle - an actor owning one document machine.
//!
//! The actor serializes everything that touches a [`DocumentMachine`]:
//! events from the host, invoke completions and persistence results all
//! arrive on one command channel and are processed one at a time.
//!
//! ```text
//! host ──► DocumentHandle ──► command channel ──► actor ──► DocumentMachine
//!                                  ▲                 │
//!                                  └── invoke tasks ◄┘ (completions re-injected)
//! ```
//!
//! Persistence effects are applied by the actor before every effect is
//! forwarded to the host on the shared effect channel.

use std::sync::Arc;

use sync_core::hsm::{InvokeToken, StartedInvoke};
use sync_core::{DocumentMachine, MergeEffect, MergeEvent};
use sync_types::{Guid, PersistedState, SyncStatus};
use tokio::sync::{mpsc, oneshot};

use crate::persistence::Persistence;
use crate::pool::PoolError;

/// An effect tagged with the document that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentEffect {
    /// Producing document.
    pub guid: Guid,
    /// The effect.
    pub effect: MergeEffect,
}

/// Point-in-time view of a live document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    /// Current leaf state.
    pub state_path: String,
    /// Derived sync status.
    pub status: SyncStatus,
    /// Record persistence would store right now.
    pub persisted: PersistedState,
    /// Local replica text, if any.
    pub text: Option<String>,
    /// Effects that found no live consumer.
    pub undelivered_effects: u64,
}

impl DocumentSnapshot {
    fn of(machine: &DocumentMachine, undelivered_effects: u64) -> Self {
        Self {
            state_path: machine.state_path().to_string(),
            status: machine.status(),
            persisted: machine.persisted_state(),
            text: machine.context().local_text(),
            undelivered_effects,
        }
    }
}

enum Command {
    Load,
    Event(MergeEvent),
    Complete {
        token: InvokeToken,
        result: Result<MergeEvent, MergeEvent>,
    },
    Snapshot(oneshot::Sender<DocumentSnapshot>),
    Quiesce(oneshot::Sender<()>),
    Close(oneshot::Sender<PersistedState>),
}

/// Cloneable handle to a running document actor.
#[derive(Debug, Clone)]
pub struct DocumentHandle {
    guid: Guid,
    commands: mpsc::UnboundedSender<Command>,
}

impl DocumentHandle {
    /// Spawn an actor for `machine` on the current tokio runtime.
    pub fn spawn<P: Persistence>(
        machine: DocumentMachine,
        persistence: Arc<P>,
        effects: mpsc::Sender<DocumentEffect>,
    ) -> Self {
        let guid = machine.guid().clone();
        let (commands, receiver) = mpsc::unbounded_channel();
        let actor = DocumentActor {
            machine,
            persistence,
            effects,
            effects_open: true,
            undelivered: 0,
            completions: commands.downgrade(),
            in_flight: 0,
            quiesce_waiters: Vec::new(),
            closing: None,
        };
        tokio::spawn(actor.run(receiver));
        Self { guid, commands }
    }

    /// Document identifier.
    pub fn guid(&self) -> &Guid {
        &self.guid
    }

    fn command(&self, command: Command) -> Result<(), PoolError> {
        self.commands
            .send(command)
            .map_err(|_| PoolError::DocumentClosed(self.guid.clone()))
    }

    /// Send `LOAD`, then feed persisted state and the current disk file.
    pub fn load(&self) -> Result<(), PoolError> {
        self.command(Command::Load)
    }

    /// Queue an event for the machine.
    pub fn send(&self, event: MergeEvent) -> Result<(), PoolError> {
        self.command(Command::Event(event))
    }

    /// Current state of the machine.
    pub async fn snapshot(&self) -> Result<DocumentSnapshot, PoolError> {
        let (reply, response) = oneshot::channel();
        self.command(Command::Snapshot(reply))?;
        response
            .await
            .map_err(|_| PoolError::DocumentClosed(self.guid.clone()))
    }

    /// Wait until every queued command and running invoke has been processed.
    pub async fn quiesce(&self) -> Result<(), PoolError> {
        let (reply, response) = oneshot::channel();
        self.command(Command::Quiesce(reply))?;
        response
            .await
            .map_err(|_| PoolError::DocumentClosed(self.guid.clone()))
    }

    /// Unload the machine and stop the actor.
    ///
    /// Returns the final persisted record once the machine reached
    /// `unloaded`.
    pub async fn close(&self) -> Result<PersistedState, PoolError> {
        let (reply, response) = oneshot::channel();
        self.command(Command::Close(reply))?;
        response
            .await
            .map_err(|_| PoolError::DocumentClosed(self.guid.clone()))
    }
}

struct DocumentActor<P> {
    machine: DocumentMachine,
    persistence: Arc<P>,
    effects: mpsc::Sender<DocumentEffect>,
    effects_open: bool,
    undelivered: u64,
    completions: mpsc::WeakUnboundedSender<Command>,
    in_flight: usize,
    quiesce_waiters: Vec<oneshot::Sender<()>>,
    closing: Option<oneshot::Sender<PersistedState>>,
}

impl<P: Persistence> DocumentActor<P> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let guid = self.machine.guid().clone();
        tracing::info!("{}: document actor started", guid);

        while let Some(command) = commands.recv().await {
            match command {
                Command::Load => self.load().await,
                Command::Event(event) => {
                    self.machine.send(event);
                }
                Command::Complete { token, result } => {
                    self.in_flight = self.in_flight.saturating_sub(1);
                    self.machine.complete(token, result);
                }
                Command::Snapshot(reply) => {
                    let _ = reply.send(DocumentSnapshot::of(&self.machine, self.undelivered));
                }
                Command::Quiesce(reply) => self.quiesce_waiters.push(reply),
                Command::Close(reply) => {
                    self.closing = Some(reply);
                    if !self.machine.matches("unloaded") {
                        self.machine.send(MergeEvent::Unload);
                    }
                }
            }
            self.drain().await;

            if self.in_flight == 0 && commands.is_empty() {
                for waiter in self.quiesce_waiters.drain(..) {
                    let _ = waiter.send(());
                }
            }
            if self.closing.is_some() && self.machine.matches("unloaded") {
                if let Some(reply) = self.closing.take() {
                    let _ = reply.send(self.machine.persisted_state());
                }
                break;
            }
        }

        tracing::info!("{}: document actor stopped", guid);
    }

    async fn load(&mut self) {
        let context = self.machine.context();
        let guid = context.guid.clone();
        let path = context.path.clone();

        self.machine.send(MergeEvent::Load {
            guid: guid.clone(),
            path: path.clone(),
        });
        let db_name = self.machine.context().db_name.clone();
        let loaded = match self.persistence.load_state(&guid).await {
            Ok(state) => self
                .persistence
                .load_updates(&db_name)
                .await
                .map(|updates| (state, updates)),
            Err(e) => Err(e),
        };
        match loaded {
            Ok((state, updates)) => {
                self.machine
                    .send(MergeEvent::PersistenceLoaded { state, updates });
            }
            Err(e) => {
                tracing::warn!("{}: failed to load persisted state: {}", guid, e);
                self.machine.send(MergeEvent::Error {
                    error: e.to_string(),
                });
                return;
            }
        }

        match self.persistence.get_disk_state(&path).await {
            Ok(Some(disk)) => {
                self.machine.send(MergeEvent::DiskChanged {
                    contents: disk.contents,
                    mtime: disk.mtime,
                    hash: disk.hash,
                });
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("{}: failed to read {}: {}", guid, path, e),
        }
    }

    /// Apply effects and start invokes until the machine produces nothing new.
    async fn drain(&mut self) {
        loop {
            let invokes = self.machine.take_invokes();
            let effects = self.machine.take_effects();
            if invokes.is_empty() && effects.is_empty() {
                break;
            }
            for invoke in invokes {
                self.start(invoke);
            }
            for effect in effects {
                self.apply(effect).await;
            }
        }
    }

    fn start(&mut self, invoke: StartedInvoke<MergeEvent>) {
        let Some(completions) = self.completions.upgrade() else {
            return;
        };
        self.in_flight += 1;
        tokio::spawn(async move {
            let result = invoke.future.await;
            let _ = completions.send(Command::Complete {
                token: invoke.token,
                result,
            });
        });
    }

    async fn apply(&mut self, effect: MergeEffect) {
        let persisted = match &effect {
            MergeEffect::PersistState { state, .. } => self.persistence.save_state(state).await,
            MergeEffect::PersistUpdates { db_name, update } => {
                self.persistence.append_update(db_name, update).await
            }
            MergeEffect::ReplaceUpdates { db_name, state } => {
                self.persistence.replace_updates(db_name, state).await
            }
            _ => Ok(()),
        };
        if let Err(e) = persisted {
            tracing::warn!("{}: persistence failed: {}", self.machine.guid(), e);
            self.machine.send(MergeEvent::Error {
                error: e.to_string(),
            });
        }

        let kind = effect.kind();
        if self.effects_open {
            let tagged = DocumentEffect {
                guid: self.machine.guid().clone(),
                effect,
            };
            if self.effects.send(tagged).await.is_ok() {
                return;
            }
            tracing::debug!("{}: effect channel closed", self.machine.guid());
            self.effects_open = false;
        }
        self.undelivered += 1;
        tracing::warn!("{}: no consumer for {} effect", self.machine.guid(), kind);
    }
}
