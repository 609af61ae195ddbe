//! The session task: one per engine.
//!
//! Owns the connection state machine and the orchestrator and processes
//! everything that can change local state one message at a time:
//!
//! ```text
//! SyncClient ── Command ──┐
//! timers / link work ─────┼─► mailbox ─┐
//! dispatcher ── LinkDropped┘           ├─► session ─► Orchestrator ─► store
//! Reassembler ── Reassembled ──────────┘      │
//!                                             └─► watch / broadcast
//! ```
//!
//! Link work that may block (discovery, negotiation, subscribing, timers)
//! runs in spawned tasks that post their result back as an [`Event`]; those
//! tasks are aborted on `CancelInFlight`. The handshake and relays run
//! inline so no two of them ever overlap. Full-state reads from the peer are
//! answered by the dispatcher, off the queue.

use poster_sync_core::{Action, ConnectionMachine, ConnectionStatus, Event, Role};
use poster_sync_types::{Channel, Payload, Request, RequestId, Timestamp, TransitionError};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::{ClientError, SyncEvent};
use crate::config::SyncConfig;
use crate::orchestrator::{self, Orchestrator, SyncContext};
use crate::pacing::WritePacer;
use crate::reassembly::{Reassembled, Reassembler};
use crate::retry::Retrier;
use crate::store::RecordStore;
use crate::transport::{LinkEvent, Transport};

/// Reply channel for record-mutating commands.
pub(crate) type Reply = oneshot::Sender<Result<Request, ClientError>>;

/// Record changes requested by the [`SyncClient`](crate::SyncClient) handle.
#[derive(Debug)]
pub(crate) enum Command {
    Submit { label: String, reply: Reply },
    Acknowledge { id: RequestId, reply: Reply },
    Fulfill { id: RequestId, reply: Reply },
}

/// Everything delivered through the session mailbox.
#[derive(Debug)]
pub(crate) enum SessionMsg {
    Command(Command),
    Link(Event),
    Shutdown { reply: oneshot::Sender<()> },
}

/// What the handle keeps after spawning.
pub(crate) struct SessionHandles {
    pub mailbox: mpsc::UnboundedSender<SessionMsg>,
    pub status: watch::Receiver<ConnectionStatus>,
}

/// Spawn the session and dispatcher tasks. Must be called from within a
/// tokio runtime.
pub(crate) fn spawn(
    config: SyncConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn RecordStore>,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    events: broadcast::Sender<SyncEvent>,
) -> SessionHandles {
    let (mailbox, inbox) = mpsc::unbounded_channel();
    let (status_tx, status) = watch::channel(ConnectionStatus::Idle);
    let link = Arc::new(watch::channel(false).0);
    let (reassembled_tx, reassembled) = mpsc::unbounded_channel();

    let dispatcher = tokio::spawn(dispatch(
        link_events,
        Reassembler::new(config.quiescence_window, reassembled_tx),
        config.role,
        Arc::clone(&store),
        Arc::clone(&link),
        mailbox.clone(),
    ));

    let ctx = SyncContext {
        transport,
        store,
        retrier: Retrier::new(config.retry_policy(), link.subscribe()),
        pacer: WritePacer::new(config.write_spacing()),
        full_state_delay: config.full_state_delay,
        events,
    };
    let session = Session {
        machine: ConnectionMachine::new(config.role, config.link_policy()),
        orchestrator: orchestrator::for_role(config.role),
        ctx,
        link,
        status: status_tx,
        mailbox: mailbox.clone(),
        in_flight: Vec::new(),
        dispatcher,
    };
    tokio::spawn(session.run(inbox, reassembled));

    SessionHandles { mailbox, status }
}

struct Session {
    machine: ConnectionMachine,
    orchestrator: Box<dyn Orchestrator>,
    ctx: SyncContext,
    link: Arc<watch::Sender<bool>>,
    status: watch::Sender<ConnectionStatus>,
    mailbox: mpsc::UnboundedSender<SessionMsg>,
    in_flight: Vec<JoinHandle<()>>,
    dispatcher: JoinHandle<()>,
}

impl Session {
    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<SessionMsg>,
        mut reassembled: mpsc::UnboundedReceiver<Reassembled>,
    ) {
        info!(role = %self.machine.role(), "sync session started");
        self.handle_event(Event::Start).await;

        loop {
            tokio::select! {
                biased;
                msg = inbox.recv() => match msg {
                    Some(SessionMsg::Link(event)) => self.handle_event(event).await,
                    Some(SessionMsg::Shutdown { reply }) => {
                        self.handle_event(Event::Stop).await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(SessionMsg::Command(command)) => self.handle_command(command).await,
                    None => {
                        self.handle_event(Event::Stop).await;
                        break;
                    }
                },
                Some(message) = reassembled.recv() => self.handle_inbound(message).await,
            }
        }

        self.cancel_in_flight();
        self.dispatcher.abort();
        info!("sync session stopped");
    }

    /// Feed `event` to the machine and execute the resulting actions,
    /// including any follow-up events they produce.
    async fn handle_event(&mut self, event: Event) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            debug!(?event, state = ?self.machine.state(), "connection event");
            let (machine, actions) = self.machine.clone().on_event(event);
            self.machine = machine;
            for action in actions {
                if let Some(follow_up) = self.execute(action).await {
                    queue.push_back(follow_up);
                }
            }
        }
    }

    async fn execute(&mut self, action: Action) -> Option<Event> {
        match action {
            Action::Discover => {
                let transport = Arc::clone(&self.ctx.transport);
                let role = self.machine.role();
                self.spawn_link_work(async move {
                    match transport.establish(role).await {
                        Ok(peer) => Event::PeerFound { peer },
                        Err(e) => Event::DiscoveryFailed {
                            error: e.to_string(),
                        },
                    }
                });
            }
            Action::Negotiate { epoch, requested } => {
                let transport = Arc::clone(&self.ctx.transport);
                self.spawn_link_work(async move {
                    match transport.negotiate_unit_size(requested).await {
                        Ok(unit_size) => Event::Negotiated { epoch, unit_size },
                        Err(e) => Event::NegotiationFailed {
                            epoch,
                            error: e.to_string(),
                        },
                    }
                });
            }
            Action::StartSettleTimer { epoch, delay } => {
                self.spawn_timer(delay, Event::SettleElapsed { epoch });
            }
            Action::Subscribe { epoch } => {
                let transport = Arc::clone(&self.ctx.transport);
                let channel = self.orchestrator.inbound_channel();
                self.spawn_link_work(async move {
                    match transport.subscribe(channel).await {
                        Ok(()) => Event::Subscribed { epoch },
                        Err(e) => Event::SubscribeFailed {
                            epoch,
                            error: e.to_string(),
                        },
                    }
                });
            }
            Action::RunHandshake { peer, unit_size } => {
                info!(%peer, unit_size, "link ready, running handshake");
                return self.run_handshake().await;
            }
            Action::CancelInFlight => self.cancel_in_flight(),
            Action::Disconnect => {
                if let Err(e) = self.ctx.transport.disconnect().await {
                    debug!(error = %e, "disconnect failed");
                }
            }
            Action::ScheduleStart { delay } => self.spawn_timer(delay, Event::Start),
            Action::ScheduleRecover { delay } => self.spawn_timer(delay, Event::Recover),
            Action::NotifyStatus(status) => {
                info!(%status, "connection status changed");
                self.link.send_replace(status == ConnectionStatus::Ready);
                self.status.send_replace(status);
                self.ctx.notify(SyncEvent::StatusChanged(status));
            }
            Action::ReportError(error) => {
                warn!(%error, "connection error");
                self.ctx.notify(SyncEvent::ConnectionError(error.to_string()));
            }
        }
        None
    }

    async fn run_handshake(&mut self) -> Option<Event> {
        let report = match self.orchestrator.handshake(&self.ctx).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "handshake not run");
                return None;
            }
        };
        info!(
            sent = report.sent,
            failed = report.failed,
            reconciled = report.reconciled,
            interrupted = report.interrupted,
            "handshake finished"
        );
        self.ctx.notify(SyncEvent::HandshakeFinished(report));
        self.publish_unsynced().await;

        report.interrupted.then(|| Event::TransmissionFailed {
            error: "link lost during handshake".into(),
        })
    }

    async fn handle_command(&mut self, command: Command) {
        let (result, reply) = match command {
            Command::Submit { label, reply } => {
                let request = Request::submit(label, Timestamp::now());
                let result = self.ctx.store.put(&request).await.map(|()| request);
                (result.map_err(ClientError::from), reply)
            }
            Command::Acknowledge { id, reply } => {
                (self.mutate(id, |r| r.acknowledge()).await, reply)
            }
            Command::Fulfill { id, reply } => {
                let now = Timestamp::now();
                (self.mutate(id, |r| r.fulfill(now)).await, reply)
            }
        };

        let changed = result.as_ref().ok().map(Request::id);
        if let Ok(request) = &result {
            info!(id = %request.id(), state = %request.state(), "local change stored");
        }
        let _ = reply.send(result);

        if let Some(id) = changed {
            self.publish_unsynced().await;
            self.relay(id).await;
        }
    }

    async fn mutate<F>(&self, id: RequestId, change: F) -> Result<Request, ClientError>
    where
        F: FnOnce(&mut Request) -> Result<(), TransitionError>,
    {
        let mut request = self
            .ctx
            .store
            .get(id)
            .await?
            .ok_or(ClientError::NotFound(id))?;
        change(&mut request)?;
        self.ctx.store.put(&request).await?;
        Ok(request)
    }

    async fn relay(&mut self, id: RequestId) {
        let outcome = match self.orchestrator.relay(&self.ctx, id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(%id, error = %e, "relay could not read the store");
                return;
            }
        };
        self.publish_unsynced().await;

        if outcome.link_failed() {
            self.handle_event(Event::TransmissionFailed {
                error: format!("relay of {id} failed: {outcome:?}"),
            })
            .await;
        }
    }

    async fn handle_inbound(&mut self, message: Reassembled) {
        let Reassembled {
            peer,
            channel,
            result,
        } = message;
        // Failures were already logged by the reassembler.
        let Ok(payload) = result else {
            return;
        };
        if channel != self.orchestrator.inbound_channel() {
            warn!(%peer, %channel, "payload on unexpected channel");
            return;
        }

        match self.orchestrator.apply(&self.ctx, payload).await {
            Ok(Some(_)) => self.publish_unsynced().await,
            Ok(None) => {}
            Err(e) => error!(%peer, %channel, error = %e, "failed to apply inbound payload"),
        }
    }

    async fn publish_unsynced(&self) {
        match self.ctx.store.unsynced_count().await {
            Ok(count) => self.ctx.notify(SyncEvent::UnsyncedCount(count)),
            Err(e) => error!(error = %e, "failed to count unsynced records"),
        }
    }

    /// Run `work` in the background and post its result to the mailbox.
    fn spawn_link_work<F>(&mut self, work: F)
    where
        F: Future<Output = Event> + Send + 'static,
    {
        let mailbox = self.mailbox.clone();
        self.in_flight.retain(|task| !task.is_finished());
        self.in_flight.push(tokio::spawn(async move {
            let _ = mailbox.send(SessionMsg::Link(work.await));
        }));
    }

    fn spawn_timer(&mut self, delay: Duration, event: Event) {
        self.spawn_link_work(async move {
            tokio::time::sleep(delay).await;
            event
        });
    }

    fn cancel_in_flight(&mut self) {
        for task in self.in_flight.drain(..) {
            task.abort();
        }
    }
}

/// Consume the transport's event stream.
async fn dispatch(
    mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
    mut reassembler: Reassembler,
    role: Role,
    store: Arc<dyn RecordStore>,
    link: Arc<watch::Sender<bool>>,
    mailbox: mpsc::UnboundedSender<SessionMsg>,
) {
    while let Some(event) = link_events.recv().await {
        match event {
            LinkEvent::Fragment {
                peer,
                channel,
                bytes,
            } => {
                debug!(%peer, %channel, len = bytes.len(), "fragment received");
                reassembler.push(peer, channel, bytes);
            }
            LinkEvent::ReadRequest { channel, reply } => {
                if role == Role::Authority && channel == Channel::FullState {
                    tokio::spawn(answer_full_state(Arc::clone(&store), reply));
                } else {
                    debug!(%channel, "ignoring read request");
                }
            }
            LinkEvent::Disconnected { reason } => {
                info!(%reason, "link disconnected");
                link.send_replace(false);
                reassembler.reset();
                if mailbox
                    .send(SessionMsg::Link(Event::LinkDropped { reason }))
                    .is_err()
                {
                    break;
                }
            }
        }
    }
    debug!("link event stream closed");
}

async fn answer_full_state(store: Arc<dyn RecordStore>, reply: oneshot::Sender<Vec<u8>>) {
    match store.all().await {
        Ok(records) => {
            debug!(count = records.len(), "serving full state");
            match Payload::full_state(records.iter()).to_bytes() {
                Ok(bytes) => {
                    let _ = reply.send(bytes);
                }
                Err(e) => error!(error = %e, "failed to encode full state"),
            }
        }
        Err(e) => error!(error = %e, "failed to read full state"),
    }
}
