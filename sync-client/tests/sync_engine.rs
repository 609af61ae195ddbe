//! End-to-end tests: two engines talking over a loopback link, plus
//! failure scripting over the mock transport.

use async_trait::async_trait;
use poster_sync_client::{
    ConnectionStatus, HandshakeReport, LinkEvent, LoopbackConfig, LoopbackTransport, MemoryStore,
    MockTransport, RecordStore, Request, RequestState, Role, SyncClient, SyncConfig, SyncEvent,
    Timestamp, Transport, TransportError,
};
use poster_sync_types::{Channel, Payload, PeerId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

const PATIENCE: Duration = Duration::from_secs(120);

struct Engine {
    client: SyncClient,
    store: Arc<MemoryStore>,
    events: broadcast::Receiver<SyncEvent>,
}

fn engine(config: SyncConfig, link: impl Transport + 'static, store: Arc<MemoryStore>) -> Engine {
    let client = SyncClient::start(config, Arc::new(link), store.clone()).unwrap();
    let events = client.subscribe();
    Engine {
        client,
        store,
        events,
    }
}

fn pair_with(
    config: LoopbackConfig,
    originator_store: Arc<MemoryStore>,
    authority_store: Arc<MemoryStore>,
) -> (Engine, Engine, LoopbackTransport) {
    let (originator_link, authority_link) = LoopbackTransport::pair_with(config);
    let control = originator_link.clone();
    let originator = engine(SyncConfig::originator(), originator_link, originator_store);
    let authority = engine(SyncConfig::authority(), authority_link, authority_store);
    (originator, authority, control)
}

/// A loopback endpoint that refuses to deliver chosen writes or any read.
struct FlakyLink {
    inner: LoopbackTransport,
    stuck: Option<Vec<u8>>,
    fail_reads: bool,
}

impl FlakyLink {
    fn new(inner: LoopbackTransport) -> Self {
        Self {
            inner,
            stuck: None,
            fail_reads: false,
        }
    }

    /// Fail every write whose bytes contain `needle`.
    fn stuck_on(mut self, needle: &[u8]) -> Self {
        self.stuck = Some(needle.to_vec());
        self
    }

    fn failing_reads(mut self) -> Self {
        self.fail_reads = true;
        self
    }
}

#[async_trait]
impl Transport for FlakyLink {
    async fn establish(&self, role: Role) -> Result<PeerId, TransportError> {
        self.inner.establish(role).await
    }

    async fn negotiate_unit_size(&self, requested: usize) -> Result<usize, TransportError> {
        self.inner.negotiate_unit_size(requested).await
    }

    async fn subscribe(&self, channel: Channel) -> Result<(), TransportError> {
        self.inner.subscribe(channel).await
    }

    async fn write(&self, channel: Channel, bytes: &[u8]) -> Result<(), TransportError> {
        if let Some(needle) = &self.stuck {
            if bytes.windows(needle.len()).any(|w| w == needle.as_slice()) {
                return Err(TransportError::WriteFailed {
                    channel,
                    reason: "no ack".into(),
                });
            }
        }
        self.inner.write(channel, bytes).await
    }

    async fn read(&self, channel: Channel) -> Result<Vec<u8>, TransportError> {
        if self.fail_reads {
            return Err(TransportError::ReadFailed {
                channel,
                reason: "no response".into(),
            });
        }
        self.inner.read(channel).await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.inner.disconnect().await
    }

    fn take_events(&self) -> Option<tokio::sync::mpsc::UnboundedReceiver<LinkEvent>> {
        self.inner.take_events()
    }
}

fn pair() -> (Engine, Engine, LoopbackTransport) {
    pair_with(
        LoopbackConfig::default(),
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryStore::new()),
    )
}

async fn wait_for_status(client: &SyncClient, status: ConnectionStatus) {
    let mut watch = client.watch_status();
    tokio::time::timeout(PATIENCE, watch.wait_for(|s| *s == status))
        .await
        .expect("status not reached")
        .unwrap();
}

async fn next_matching<F>(events: &mut broadcast::Receiver<SyncEvent>, mut pred: F) -> SyncEvent
where
    F: FnMut(&SyncEvent) -> bool,
{
    tokio::time::timeout(PATIENCE, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("engine stopped"),
            }
        }
    })
    .await
    .expect("event not received")
}

async fn wait_until_synced(store: &MemoryStore, request: &Request) -> Request {
    tokio::time::timeout(PATIENCE, async {
        loop {
            if let Some(stored) = store.get(request.id()).await.unwrap() {
                if stored.is_synced() {
                    return stored;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("record never synced")
}

/// Poll `store` until `done` accepts its contents.
async fn wait_for_store<F>(store: &MemoryStore, mut done: F) -> Vec<Request>
where
    F: FnMut(&[Request]) -> bool,
{
    tokio::time::timeout(PATIENCE, async {
        loop {
            let records = store.all().await.unwrap();
            if done(&records) {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("store never reached the expected contents")
}

fn all_fulfilled_and_synced(records: &[Request]) -> bool {
    records
        .iter()
        .all(|r| r.state() == RequestState::Fulfilled && r.is_synced())
}

fn ts(millis: u64) -> Timestamp {
    Timestamp::from_millis(millis)
}

// ===========================================
// Happy Path
// ===========================================

#[tokio::test(start_paused = true)]
async fn request_round_trip_ends_fulfilled_on_both_sides() {
    let (mut originator, mut authority, _link) = pair();
    wait_for_status(&originator.client, ConnectionStatus::Ready).await;
    wait_for_status(&authority.client, ConnectionStatus::Ready).await;

    let r1 = originator.client.submit("r1").await.unwrap();
    let received = next_matching(&mut authority.events, |e| {
        matches!(e, SyncEvent::RecordApplied(r) if r.id() == r1.id())
    })
    .await;
    let SyncEvent::RecordApplied(received) = received else {
        unreachable!()
    };
    assert_eq!(received.label(), "r1");
    assert_eq!(received.state(), RequestState::Submitted);

    authority.client.mark_fulfilled(r1.id()).await.unwrap();
    next_matching(&mut originator.events, |e| {
        matches!(e, SyncEvent::RecordApplied(r) if r.id() == r1.id() && r.state() == RequestState::Fulfilled)
    })
    .await;

    let on_originator = wait_until_synced(&originator.store, &r1).await;
    let on_authority = wait_until_synced(&authority.store, &r1).await;
    for side in [&on_originator, &on_authority] {
        assert_eq!(side.state(), RequestState::Fulfilled);
        assert!(side.is_synced());
    }
    assert_eq!(on_originator.fulfilled_at(), on_authority.fulfilled_at());
    assert_eq!(originator.client.unsynced_count().await.unwrap(), 0);
    assert_eq!(authority.client.unsynced_count().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn acknowledgement_reaches_originator() {
    let (mut originator, mut authority, _link) = pair();
    wait_for_status(&originator.client, ConnectionStatus::Ready).await;
    wait_for_status(&authority.client, ConnectionStatus::Ready).await;

    let request = originator.client.submit("A42").await.unwrap();
    next_matching(&mut authority.events, |e| matches!(e, SyncEvent::RecordApplied(_))).await;
    authority.client.acknowledge(request.id()).await.unwrap();

    next_matching(&mut originator.events, |e| {
        matches!(e, SyncEvent::RecordApplied(r) if r.state() == RequestState::Acknowledged)
    })
    .await;
}

// ===========================================
// Several Records Over The Link
// ===========================================

#[tokio::test(start_paused = true)]
async fn every_seeded_submission_reaches_the_authority() {
    let originator_store = Arc::new(MemoryStore::new());
    let seeded: Vec<Request> = (0..3u64)
        .map(|i| Request::submit(format!("R{i}"), ts(i)))
        .collect();
    for record in &seeded {
        originator_store.put(record).await.unwrap();
    }

    let (mut originator, authority, _link) = pair_with(
        LoopbackConfig::default(),
        originator_store.clone(),
        Arc::new(MemoryStore::new()),
    );

    let report = next_matching(&mut originator.events, |e| {
        matches!(e, SyncEvent::HandshakeFinished(_))
    })
    .await;
    assert!(matches!(report, SyncEvent::HandshakeFinished(r) if r.sent == 3 && r.failed == 0));

    let received = wait_for_store(&authority.store, |records| records.len() == 3).await;
    for record in &seeded {
        let on_authority = received.iter().find(|r| r.id() == record.id()).unwrap();
        assert_eq!(on_authority.label(), record.label());
        assert_eq!(on_authority.state(), RequestState::Submitted);
    }
    assert_eq!(originator.client.unsynced_count().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn back_to_back_submits_all_arrive() {
    let (originator, authority, _link) = pair();
    wait_for_status(&originator.client, ConnectionStatus::Ready).await;
    wait_for_status(&authority.client, ConnectionStatus::Ready).await;

    let mut submitted = Vec::new();
    for label in ["A1", "A2", "A3"] {
        submitted.push(originator.client.submit(label).await.unwrap());
    }

    let received = wait_for_store(&authority.store, |records| records.len() == 3).await;
    for request in &submitted {
        assert!(received.iter().any(|r| r.id() == request.id()));
    }
}

#[tokio::test(start_paused = true)]
async fn back_to_back_fulfilments_all_arrive() {
    let originator_store = Arc::new(MemoryStore::new());
    let authority_store = Arc::new(MemoryStore::new());
    let shared: Vec<Request> = (0..3u64)
        .map(|i| Request::submit(format!("R{i}"), ts(i)).synced())
        .collect();
    for record in &shared {
        originator_store.put(record).await.unwrap();
        authority_store.put(record).await.unwrap();
    }

    let (mut originator, authority, _link) = pair_with(
        LoopbackConfig::default(),
        originator_store.clone(),
        authority_store.clone(),
    );
    next_matching(&mut originator.events, |e| {
        matches!(e, SyncEvent::HandshakeFinished(_))
    })
    .await;
    wait_for_status(&authority.client, ConnectionStatus::Ready).await;

    for record in &shared {
        authority.client.mark_fulfilled(record.id()).await.unwrap();
    }

    let on_originator = wait_for_store(&originator_store, |records| {
        records.len() == 3 && all_fulfilled_and_synced(records)
    })
    .await;
    assert_eq!(on_originator.len(), 3);
    wait_for_store(&authority_store, all_fulfilled_and_synced).await;
}

#[tokio::test(start_paused = true)]
async fn authority_handshake_pushes_every_status_change() {
    let originator_store = Arc::new(MemoryStore::new());
    let authority_store = Arc::new(MemoryStore::new());
    for i in 0..3u64 {
        let request = Request::submit(format!("R{i}"), ts(i)).synced();
        originator_store.put(&request).await.unwrap();
        let mut fulfilled = request.clone();
        fulfilled.fulfill(ts(100 + i)).unwrap();
        authority_store.put(&fulfilled).await.unwrap();
    }

    // Without a full-state snapshot the status channel is the only way in.
    let (originator_link, authority_link) = LoopbackTransport::pair();
    let mut originator = engine(
        SyncConfig::originator(),
        FlakyLink::new(originator_link).failing_reads(),
        originator_store.clone(),
    );
    let mut authority = engine(SyncConfig::authority(), authority_link, authority_store.clone());

    let pushed = next_matching(&mut authority.events, |e| {
        matches!(e, SyncEvent::HandshakeFinished(_))
    })
    .await;
    assert!(matches!(pushed, SyncEvent::HandshakeFinished(r) if r.sent == 3 && r.failed == 0));

    let reconciled = next_matching(&mut originator.events, |e| {
        matches!(e, SyncEvent::HandshakeFinished(_))
    })
    .await;
    assert!(matches!(reconciled, SyncEvent::HandshakeFinished(r) if r.reconciled == 0));

    wait_for_store(&originator_store, all_fulfilled_and_synced).await;
    wait_for_store(&authority_store, all_fulfilled_and_synced).await;
}

#[tokio::test(start_paused = true)]
async fn one_stuck_record_over_the_link_does_not_block_the_rest() {
    let originator_store = Arc::new(MemoryStore::new());
    let records: Vec<Request> = (0..5u64)
        .map(|i| Request::submit(format!("R{i}"), ts(i)))
        .collect();
    for record in &records {
        originator_store.put(record).await.unwrap();
    }
    let stuck = records[2].id();

    let (originator_link, authority_link) = LoopbackTransport::pair();
    let mut originator = engine(
        SyncConfig::originator(),
        FlakyLink::new(originator_link).stuck_on(stuck.as_bytes()),
        originator_store.clone(),
    );
    let authority = engine(
        SyncConfig::authority(),
        authority_link,
        Arc::new(MemoryStore::new()),
    );

    let report = next_matching(&mut originator.events, |e| {
        matches!(e, SyncEvent::HandshakeFinished(_))
    })
    .await;
    assert!(matches!(
        report,
        SyncEvent::HandshakeFinished(HandshakeReport {
            sent: 4,
            failed: 1,
            interrupted: false,
            ..
        })
    ));

    let received = wait_for_store(&authority.store, |records| records.len() == 4).await;
    assert!(received.iter().all(|r| r.id() != stuck));
    for record in &records {
        let stored = originator_store.get(record.id()).await.unwrap().unwrap();
        assert_eq!(stored.is_synced(), record.id() != stuck, "{}", record.label());
    }
}

// ===========================================
// Reconnection
// ===========================================

#[tokio::test(start_paused = true)]
async fn offline_changes_are_delivered_after_reconnect() {
    let (originator, mut authority, link) = pair();
    wait_for_status(&originator.client, ConnectionStatus::Ready).await;
    wait_for_status(&authority.client, ConnectionStatus::Ready).await;

    let early = originator.client.submit("early").await.unwrap();
    next_matching(&mut authority.events, |e| matches!(e, SyncEvent::RecordApplied(_))).await;

    link.sever();
    let mut status = originator.client.watch_status();
    status
        .wait_for(|s| *s != ConnectionStatus::Ready)
        .await
        .unwrap();

    let late = originator.client.submit("late").await.unwrap();
    authority.client.mark_fulfilled(early.id()).await.unwrap();
    assert!(!originator.store.get(late.id()).await.unwrap().unwrap().is_synced());
    assert!(!authority.store.get(early.id()).await.unwrap().unwrap().is_synced());

    link.restore();

    next_matching(&mut authority.events, |e| {
        matches!(e, SyncEvent::RecordApplied(r) if r.id() == late.id())
    })
    .await;
    wait_until_synced(&originator.store, &late).await;
    wait_until_synced(&authority.store, &early).await;
    let early_on_originator = tokio::time::timeout(PATIENCE, async {
        loop {
            let stored = originator.store.get(early.id()).await.unwrap().unwrap();
            if stored.state() == RequestState::Fulfilled {
                return stored;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("fulfilment never arrived");
    assert!(early_on_originator.is_synced());
}

#[tokio::test(start_paused = true)]
async fn full_state_snapshot_overrides_local_records() {
    let originator_store = Arc::new(MemoryStore::new());
    let authority_store = Arc::new(MemoryStore::new());

    // The originator missed the fulfilment and believes it is in sync.
    let shared = Request::submit("A42", ts(1)).synced();
    let mut fulfilled = shared.clone();
    fulfilled.fulfill(ts(5)).unwrap();
    fulfilled.mark_synced();
    let local_only = Request::submit("B7", ts(2)).synced();
    originator_store.put(&shared).await.unwrap();
    originator_store.put(&local_only).await.unwrap();
    authority_store.put(&fulfilled).await.unwrap();

    let (mut originator, _authority, _link) = pair_with(
        LoopbackConfig::default(),
        originator_store.clone(),
        authority_store,
    );

    let finished = next_matching(&mut originator.events, |e| {
        matches!(e, SyncEvent::HandshakeFinished(_))
    })
    .await;
    assert_eq!(
        finished,
        SyncEvent::HandshakeFinished(HandshakeReport {
            sent: 0,
            failed: 0,
            reconciled: 1,
            interrupted: false,
        })
    );
    assert_eq!(
        originator_store.get(shared.id()).await.unwrap(),
        Some(fulfilled)
    );
    assert_eq!(
        originator_store.get(local_only.id()).await.unwrap(),
        Some(local_only)
    );
}

// ===========================================
// Failure Handling
// ===========================================

#[tokio::test(start_paused = true)]
async fn capability_mismatch_is_reported_once() {
    let config = LoopbackConfig {
        max_unit_size: 64,
        ..LoopbackConfig::default()
    };
    let (mut originator, _authority, _link) = pair_with(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryStore::new()),
    );

    let first = next_matching(&mut originator.events, |e| {
        matches!(e, SyncEvent::ConnectionError(_))
    })
    .await;
    assert!(matches!(first, SyncEvent::ConnectionError(msg) if msg.contains("64")));

    tokio::time::sleep(Duration::from_secs(30)).await;
    let mut repeats = 0;
    loop {
        match originator.events.try_recv() {
            Ok(SyncEvent::ConnectionError(_)) => repeats += 1,
            Ok(SyncEvent::StatusChanged(ConnectionStatus::Ready)) => panic!("link became ready"),
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    assert_eq!(repeats, 0);
    assert_ne!(originator.client.status(), ConnectionStatus::Ready);
}

#[tokio::test(start_paused = true)]
async fn exhausted_relay_tears_down_and_handshake_redelivers() {
    let transport = MockTransport::new();
    let store = Arc::new(MemoryStore::new());
    let client = SyncClient::start(
        SyncConfig::originator(),
        Arc::new(transport.clone()),
        store.clone(),
    )
    .unwrap();
    let mut events = client.subscribe();
    next_matching(&mut events, |e| matches!(e, SyncEvent::HandshakeFinished(_))).await;

    transport.fail_next_writes(3, "no ack");
    let request = client.submit("A42").await.unwrap();

    next_matching(&mut events, |e| {
        matches!(e, SyncEvent::StatusChanged(ConnectionStatus::Lost))
    })
    .await;
    assert!(!store.get(request.id()).await.unwrap().unwrap().is_synced());

    let report = next_matching(&mut events, |e| matches!(e, SyncEvent::HandshakeFinished(_))).await;
    assert!(matches!(report, SyncEvent::HandshakeFinished(r) if r.sent == 1));
    assert!(store.get(request.id()).await.unwrap().unwrap().is_synced());
    assert_eq!(transport.write_attempts(), 4);
    assert_eq!(
        transport.written_on(Channel::Submission),
        vec![Payload::submission(&request).to_bytes().unwrap()]
    );
    assert!(transport.disconnect_count() >= 1);
}

#[tokio::test(start_paused = true)]
async fn one_stuck_record_does_not_block_the_rest() {
    let store = Arc::new(MemoryStore::new());
    let records: Vec<Request> = (0..5u64)
        .map(|i| Request::submit(format!("R{i}"), ts(i)))
        .collect();
    for record in &records {
        store.put(record).await.unwrap();
    }
    let transport = MockTransport::new();
    transport.fail_writes_containing(records[2].id().as_bytes());

    let client = SyncClient::start(
        SyncConfig::originator(),
        Arc::new(transport.clone()),
        store.clone(),
    )
    .unwrap();
    let mut events = client.subscribe();

    let report = next_matching(&mut events, |e| matches!(e, SyncEvent::HandshakeFinished(_))).await;
    assert!(matches!(
        report,
        SyncEvent::HandshakeFinished(HandshakeReport {
            sent: 4,
            failed: 1,
            interrupted: false,
            ..
        })
    ));
    for (i, record) in records.iter().enumerate() {
        let stored = store.get(record.id()).await.unwrap().unwrap();
        assert_eq!(stored.is_synced(), i != 2, "record {i}");
    }
    assert_eq!(client.unsynced_count().await.unwrap(), 1);
}
