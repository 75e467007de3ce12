//! Connection lifecycle controller.
//!
//! ```text
//!            Synced (while connected, first time only)
//!  Loading ───────────────────────────────────────────► SyncedRemote{Online}
//!     │        gate + reconcile + bridge + presence        │        ▲
//!     │                                       Disconnected │        │ Connected
//!     │                                                    ▼        │
//!     │                                            SyncedRemote{Offline}
//!     │
//!     └──── any fatal error (here or later) ────────────────► Error (terminal)
//! ```
//!
//! The status is observable through a `tokio::sync::watch` channel. Every
//! subscription made during activation is owned here and released by
//! [`SyncController::shutdown`], which also runs on drop and on any fatal
//! error.

use logos_store::{DisposerList, RecordStore};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::awareness::{Awareness, ParticipantId};
use crate::bridge::SyncBridge;
use crate::config::SyncConfig;
use crate::error::{FatalSink, SyncError};
use crate::gate::SchemaGate;
use crate::replicated::ReplicatedLog;
use crate::presence::PresenceChannel;
use crate::reconcile::{run_initial_sync, ReconcileReport};
use crate::session::{SessionContext, UserPreferences};
use crate::transport::{Transport, TransportEvent, TransportStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Online,
    Offline,
}

/// Observable state of a sync session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    /// Initial reconciliation has not completed yet.
    Loading,
    SyncedRemote { connection: ConnectionStatus },
    /// Fatal; the session is torn down. Show `error.user_notice()`.
    Error(SyncError),
}

impl SyncStatus {
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }
}

/// Sequences initial sync, connection changes, and teardown for one
/// physical connection.
pub struct SyncController<T: Transport> {
    store: RecordStore,
    log: ReplicatedLog,
    preferences: UserPreferences,
    awareness: Awareness,
    transport: T,
    config: SyncConfig,

    status: watch::Sender<SyncStatus>,
    fatal_tx: FatalSink,
    fatal_rx: mpsc::UnboundedReceiver<SyncError>,

    connected: bool,
    has_synced: bool,
    shut_down: bool,

    bridge: Option<SyncBridge>,
    presence: Option<PresenceChannel>,
    subscriptions: DisposerList,
    last_report: Option<ReconcileReport>,
}

impl<T: Transport> SyncController<T> {
    pub fn new(
        store: RecordStore,
        log: ReplicatedLog,
        preferences: UserPreferences,
        transport: T,
        config: SyncConfig,
    ) -> Self {
        let participant = ParticipantId::from_connection(transport.connection_id());
        let (status, _) = watch::channel(SyncStatus::Loading);
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        log::debug!("Sync controller created for participant {participant}");

        Self {
            store,
            log,
            preferences,
            awareness: Awareness::new(participant),
            transport,
            config,
            status,
            fatal_tx,
            fatal_rx,
            connected: false,
            has_synced: false,
            shut_down: false,
            bridge: None,
            presence: None,
            subscriptions: DisposerList::new(),
            last_report: None,
        }
    }

    // ── Exposed surface ──────────────────────────────────────────

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// The store handle, once initial sync has completed (or failed).
    pub fn store(&self) -> Option<&RecordStore> {
        (!self.status.borrow().is_loading()).then_some(&self.store)
    }

    pub fn log(&self) -> &ReplicatedLog {
        &self.log
    }

    pub fn awareness(&self) -> &Awareness {
        &self.awareness
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn last_report(&self) -> Option<&ReconcileReport> {
        self.last_report.as_ref()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Sender for fatal errors detected outside the controller.
    pub fn fatal_sink(&self) -> FatalSink {
        self.fatal_tx.clone()
    }

    // ── Event handling ───────────────────────────────────────────

    pub fn handle_event(&mut self, event: TransportEvent) {
        if self.shut_down {
            log::debug!("Ignoring {event:?} after shutdown");
            return;
        }
        match event {
            TransportEvent::Status(TransportStatus::Connected) => {
                self.connected = true;
                if self.has_synced {
                    self.publish(SyncStatus::SyncedRemote { connection: ConnectionStatus::Online });
                }
            }
            TransportEvent::Status(TransportStatus::Disconnected) => {
                self.connected = false;
                if self.has_synced {
                    log::warn!("Transport disconnected; working offline");
                    self.publish(SyncStatus::SyncedRemote { connection: ConnectionStatus::Offline });
                }
            }
            TransportEvent::Synced if !self.connected => {
                log::debug!("Ignoring sync while disconnected");
            }
            TransportEvent::Synced if self.has_synced => {
                self.publish(SyncStatus::SyncedRemote { connection: ConnectionStatus::Online });
            }
            TransportEvent::Synced => self.initial_sync(),
        }
    }

    fn initial_sync(&mut self) {
        match run_initial_sync(&self.store, &self.log) {
            Ok(report) => self.last_report = Some(report),
            Err(e) => {
                self.fail(e);
                return;
            }
        }
        self.has_synced = true;

        let session = SessionContext::new(self.awareness.local_id(), self.preferences.clone());
        self.bridge = Some(SyncBridge::activate(&self.store, &self.log, self.fatal_tx.clone()));
        self.subscriptions.push(SchemaGate::watch_schema_marker(
            self.store.schema(),
            &self.log,
            self.fatal_tx.clone(),
        ));
        self.presence = Some(PresenceChannel::activate(
            session,
            &self.store,
            &self.awareness,
            &self.config.presence_field,
        ));

        self.publish(SyncStatus::SyncedRemote { connection: ConnectionStatus::Online });
    }

    /// Handle a pending fatal report, if any. Returns whether one was found.
    pub fn poll_fatal(&mut self) -> bool {
        match self.fatal_rx.try_recv() {
            Ok(error) => {
                self.fail(error);
                true
            }
            Err(_) => false,
        }
    }

    /// Publish presence if it changed since the last frame.
    pub fn flush_presence(&mut self) -> bool {
        self.presence.as_mut().is_some_and(|p| p.flush())
    }

    /// Drive the session until the transport closes or a fatal error
    /// stops it.
    pub async fn run(&mut self, mut events: mpsc::Receiver<TransportEvent>) {
        let mut frame = tokio::time::interval(self.config.frame_interval);
        frame.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !self.shut_down {
            tokio::select! {
                biased;

                Some(error) = self.fatal_rx.recv() => self.fail(error),

                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        log::info!("Transport event stream closed");
                        break;
                    }
                },

                _ = frame.tick() => {
                    self.flush_presence();
                }
            }
        }
        self.shutdown();
    }

    // ── Teardown ─────────────────────────────────────────────────

    fn fail(&mut self, error: SyncError) {
        log::error!("Sync stopped: {error}");
        self.shutdown();
        self.status.send_replace(SyncStatus::Error(error));
    }

    /// Release every subscription, clear local presence, and disconnect the
    /// transport. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        if let Some(mut presence) = self.presence.take() {
            presence.deactivate();
        }
        if let Some(mut bridge) = self.bridge.take() {
            bridge.dispose();
        }
        self.subscriptions.dispose_all();
        self.transport.disconnect();

        if self.has_synced {
            self.publish(SyncStatus::SyncedRemote { connection: ConnectionStatus::Offline });
        }
        log::info!("Sync session shut down");
    }

    /// Never regresses to `Loading`; `Error` is terminal.
    fn publish(&self, next: SyncStatus) {
        self.status.send_if_modified(|current| {
            let blocked = matches!(current, SyncStatus::Error(_))
                || (next.is_loading() && !current.is_loading())
                || *current == next;
            if blocked {
                return false;
            }
            log::debug!("Sync status: {current:?} -> {next:?}");
            *current = next;
            true
        });
    }
}

impl<T: Transport> Drop for SyncController<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
