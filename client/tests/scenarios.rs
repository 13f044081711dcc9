// Copyright (c) 2025 The Haze Project

//! End-to-end scenarios against the mock gateway network.
//!
//! Each test builds one or two full clients over a shared
//! [`MockNetwork`] and plays the network side: completing rounds after
//! their uploads arrive and, for the two-client tests, doing the mix
//! nodes' work of stripping the onion layers before delivery.

use haze_channels::{ChannelAction, LeaseEvent};
use haze_client::{Client, ClientError, ClientParams};
use haze_cmix::demux::MessageProcessor;
use haze_cmix::message::CmixMessage;
use haze_cmix::ndf::{test_ndf, NetworkDefinition};
use haze_cmix::unchecked::BACKOFF;
use haze_cmix::{CmixError, CmixParams, FollowParams, OutboundMessage};
use haze_common::{window_at, Id, IdKind};
use haze_connection::mock::{MockFactory, MockNetwork};
use haze_connection::{ConnectError, RoundId, RoundInfo, RoundState, SignedKeyResponse, Slot};
use haze_crypto::{
    derive_shared_key, generate_keypair, make_mac, node_payload_key, onion_decrypt, CyclicGroup,
    DhPublicKey, KeyFingerprint, SymmetricKey,
};
use haze_e2e::SessionParams;
use haze_storage::Kv;
use rand::SeedableRng;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc;

const ADDRESS_BITS: u8 = 16;

fn cmix_group() -> CyclicGroup {
    CyclicGroup::from_hex(test_ndf::TEST_CMIX_PRIME_HEX, "02").unwrap()
}

fn test_params() -> ClientParams {
    ClientParams {
        follow: FollowParams {
            track_period: Duration::from_millis(50),
            registration_delay: Duration::from_millis(10),
            round_results_timeout: Duration::from_secs(5),
            ..FollowParams::default()
        },
        stop_deadline: Duration::from_secs(2),
        ..ClientParams::default()
    }
}

type RecordedKeys = Arc<Mutex<HashMap<Id, Vec<SymmetricKey>>>>;

/// Answer node-key registrations the way a real node would, recording
/// every derived transmission key so the test can play the mix.
fn install_key_handler(net: &MockNetwork, group: CyclicGroup) -> RecordedKeys {
    let keys: RecordedKeys = Arc::new(Mutex::new(HashMap::new()));
    let recorded = keys.clone();
    net.set_key_handler(move |req| {
        let mut rng = rand::thread_rng();
        let pair = generate_keypair(&group, &mut rng);
        let client_public = DhPublicKey(
            group
                .decode(&req.client_public)
                .map_err(|e| ConnectError::Unrecoverable(e.to_string()))?,
        );
        let shared = derive_shared_key(&group, &pair.private, &client_public);
        recorded
            .lock()
            .unwrap()
            .entry(req.client_id)
            .or_default()
            .push(shared);
        Ok(SignedKeyResponse {
            node_public: group.encode(&pair.public.0),
            key_id: vec![1],
            valid_until: SystemTime::now() + Duration::from_secs(3600),
            signature: vec![0; 64],
        })
    });
    keys
}

fn queued_round(id: u64, topology: Vec<Id>) -> RoundInfo {
    let mut timestamps = BTreeMap::new();
    timestamps.insert(
        RoundState::Realtime,
        SystemTime::now() + Duration::from_secs(60),
    );
    RoundInfo {
        id: RoundId(id),
        state: RoundState::Queued,
        topology,
        timestamps,
        batch_size: 32,
    }
}

fn completed_round(mut info: RoundInfo) -> RoundInfo {
    info.state = RoundState::Completed;
    info.timestamps
        .insert(RoundState::Completed, SystemTime::now());
    info
}

fn seed_rounds(net: &MockNetwork, ndf: &NetworkDefinition, first: u64, n: u64) {
    let topology: Vec<Id> = ndf.nodes.iter().map(|e| e.id).collect();
    for id in first..first + n {
        net.put_round(queued_round(id, topology.clone()));
    }
}

/// Complete every round once its first upload arrives.
fn complete_uploads(net: Arc<MockNetwork>) {
    tokio::spawn(async move {
        let mut seen = 0;
        loop {
            let uploads = net.uploads();
            for upload in &uploads[seen..] {
                if let Some(info) = net.round(upload.round_id) {
                    if !info.state.terminal() {
                        net.put_round(completed_round(info));
                    }
                }
            }
            seen = uploads.len();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });
}

/// Play the whole network between `participants`: strip each uploaded
/// slot's onion layers with the sender's recorded transmission keys,
/// deposit it in the recipient's mailbox, and complete the round.
fn relay_uploads(
    net: Arc<MockNetwork>,
    group: CyclicGroup,
    keys: RecordedKeys,
    participants: Vec<Id>,
) {
    tokio::spawn(async move {
        let mut seen = 0;
        loop {
            let uploads = net.uploads();
            for upload in &uploads[seen..] {
                let now = SystemTime::now();
                for slot in &upload.slots {
                    let owner = participants
                        .iter()
                        .find(|id| window_at(id, ADDRESS_BITS, now).ephemeral == slot.ephemeral_id);
                    let Some(owner) = owner else { continue };
                    let sender = participants
                        .iter()
                        .find(|id| *id != owner)
                        .expect("two participants");
                    let sender_keys = keys
                        .lock()
                        .unwrap()
                        .get(sender)
                        .cloned()
                        .unwrap_or_default();
                    let salt = upload.round_id.0.to_le_bytes();
                    let keys_a: Vec<_> = sender_keys
                        .iter()
                        .map(|k| node_payload_key(&group, k, &salt, b"A"))
                        .collect();
                    let keys_b: Vec<_> = sender_keys
                        .iter()
                        .map(|k| node_payload_key(&group, k, &salt, b"B"))
                        .collect();
                    let mut msg =
                        CmixMessage::unmarshal(group.prime_len(), &slot.payload).unwrap();
                    let a = onion_decrypt(&group, &keys_a, msg.payload_a()).unwrap();
                    let b = onion_decrypt(&group, &keys_b, msg.payload_b()).unwrap();
                    msg.set_payloads(a, b).unwrap();
                    net.deposit(
                        slot.ephemeral_id,
                        upload.round_id,
                        vec![Slot {
                            ephemeral_id: slot.ephemeral_id,
                            payload: msg.marshal(),
                        }],
                    );
                }
                if let Some(info) = net.round(upload.round_id) {
                    if !info.state.terminal() {
                        net.put_round(completed_round(info));
                    }
                }
            }
            seen = uploads.len();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });
}

async fn new_client(
    net: &Arc<MockNetwork>,
    ndf: &NetworkDefinition,
    params: ClientParams,
) -> Arc<Client> {
    Client::new(
        ndf.clone(),
        Kv::in_memory(),
        Arc::new(MockFactory::new(net.clone())),
        params,
    )
    .await
    .unwrap()
}

async fn start(client: &Arc<Client>) {
    client
        .start_network_follower(Duration::from_secs(10))
        .await
        .unwrap();
    // Give registration and the first poll cycles a moment to settle.
    tokio::time::sleep(Duration::from_millis(300)).await;
}

fn outbound(recipient: Id, contents: &[u8], tag: &[u8]) -> OutboundMessage {
    OutboundMessage {
        recipient,
        fingerprint: KeyFingerprint::from_bytes([5u8; 32]).unwrap(),
        service_tag: tag.to_vec(),
        contents: contents.to_vec(),
        mac_key: [6u8; 32],
    }
}

struct Counting(AtomicUsize);

impl MessageProcessor for Counting {
    fn process(&self, _recipient: &Id, _message: &CmixMessage, _round: RoundId) -> bool {
        self.0.fetch_add(1, Ordering::SeqCst);
        true
    }
}

async fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    done()
}

#[tokio::test]
async fn single_send_completes_through_the_network() {
    let net = MockNetwork::new();
    let ndf = test_ndf::with_nodes(2);
    install_key_handler(&net, cmix_group());
    seed_rounds(&net, &ndf, 100, 4);
    complete_uploads(net.clone());

    let client = new_client(&net, &ndf, test_params()).await;
    client.add_identity(client.client_id(), None, false);
    start(&client).await;

    let mut rng = rand::rngs::StdRng::seed_from_u64(21);
    let recipient = Id::random(&mut rng, IdKind::User);
    let report = client
        .send(outbound(recipient, b"hello", b"t"), &CmixParams::default())
        .await
        .unwrap();

    assert!(report.round_id.0 >= 100);
    assert_eq!(report.ephemeral_ids.len(), 1);
    let uploads = net.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].round_id, report.round_id);
    assert_eq!(uploads[0].slots.len(), 1);

    let results = client
        .get_round_results(Duration::from_secs(2), vec![report.round_id])
        .await
        .unwrap();
    assert!(results.all_succeeded);

    client.stop_network_follower().await.unwrap();
}

#[tokio::test]
async fn blacklisted_topology_is_skipped() {
    let net = MockNetwork::new();
    let ndf = test_ndf::with_nodes(4);
    install_key_handler(&net, cmix_group());
    let nodes: Vec<Id> = ndf.nodes.iter().map(|e| e.id).collect();
    net.put_round(queued_round(100, vec![nodes[0], nodes[1]]));
    net.put_round(queued_round(101, vec![nodes[2], nodes[3]]));
    complete_uploads(net.clone());

    let client = new_client(&net, &ndf, test_params()).await;
    client.add_identity(client.client_id(), None, false);
    start(&client).await;

    let mut rng = rand::rngs::StdRng::seed_from_u64(22);
    let recipient = Id::random(&mut rng, IdKind::User);
    let params = CmixParams {
        blacklisted_nodes: [nodes[0]].into_iter().collect(),
        ..CmixParams::default()
    };
    let report = client
        .send(outbound(recipient, b"routed", b""), &params)
        .await
        .unwrap();

    assert_eq!(report.round_id, RoundId(101));
    assert!(net.uploads().iter().all(|u| u.round_id == RoundId(101)));

    client.stop_network_follower().await.unwrap();
}

#[tokio::test]
async fn failed_pickup_recovers_through_unchecked_rounds() {
    let net = MockNetwork::new();
    let ndf = test_ndf::with_nodes(2);
    install_key_handler(&net, cmix_group());
    let topology: Vec<Id> = ndf.nodes.iter().map(|e| e.id).collect();
    net.put_round(completed_round(queued_round(50, topology)));
    net.fail_pickup(RoundId(50), 1);

    let client = new_client(&net, &ndf, test_params()).await;
    let me = client.client_id();
    client.add_identity(me, None, false);

    let fp = KeyFingerprint::from_bytes([9u8; 32]).unwrap();
    let counter = Arc::new(Counting(AtomicUsize::new(0)));
    client.add_fingerprint(me, fp, counter.clone()).unwrap();

    let eph = window_at(&me, ADDRESS_BITS, SystemTime::now()).ephemeral;
    let mut msg = CmixMessage::new(cmix_group().prime_len()).unwrap();
    msg.set_fingerprint(&fp);
    msg.set_contents(b"late").unwrap();
    msg.set_mac(&make_mac(&[6u8; 32], b"late"));
    net.deposit(
        eph,
        RoundId(50),
        vec![Slot {
            ephemeral_id: eph,
            payload: msg.marshal(),
        }],
    );

    let started = Instant::now();
    start(&client).await;

    // The first pickup fails and lands the round in the unchecked
    // store; the retry only becomes due after the first backoff step.
    assert!(wait_for(Duration::from_secs(20), || {
        counter.0.load(Ordering::SeqCst) == 1
    })
    .await);
    assert!(started.elapsed() >= BACKOFF[0]);

    client.stop_network_follower().await.unwrap();
}

#[tokio::test]
async fn long_lease_schedules_a_replay_inside_the_spread_window() {
    let net = MockNetwork::new();
    let ndf = test_ndf::with_nodes(2);
    install_key_handler(&net, cmix_group());

    let client = new_client(&net, &ndf, test_params()).await;
    let mut rng = rand::rngs::StdRng::seed_from_u64(24);
    let channel = Id::random(&mut rng, IdKind::Group);
    let now = SystemTime::now();
    let lease = Duration::from_secs(1000 * 3600);
    client.add_lease(channel, ChannelAction::Pin, b"pinned".to_vec(), now, Some(lease));

    let pending = client
        .pending_lease(&channel, &ChannelAction::Pin, b"pinned")
        .unwrap();
    assert_eq!(pending.lease_end, Some(now + lease));
    assert!(pending.lease_trigger >= now + Duration::from_secs(250 * 3600));
    assert!(pending.lease_trigger <= now + Duration::from_secs(450 * 3600));
}

#[tokio::test]
async fn short_lease_fires_an_undo_at_lease_end() {
    let net = MockNetwork::new();
    let ndf = test_ndf::with_nodes(2);
    install_key_handler(&net, cmix_group());

    let client = new_client(&net, &ndf, test_params()).await;
    let mut events = client.lease_events().unwrap();
    let mut rng = rand::rngs::StdRng::seed_from_u64(25);
    let channel = Id::random(&mut rng, IdKind::Group);
    let now = SystemTime::now();
    let lease = Duration::from_millis(300);
    client.add_lease(channel, ChannelAction::Hide, b"hidden".to_vec(), now, Some(lease));

    let pending = client
        .pending_lease(&channel, &ChannelAction::Hide, b"hidden")
        .unwrap();
    assert_eq!(pending.lease_trigger, now + lease);
    assert_eq!(pending.lease_end, Some(now + lease));

    // The lease timer only runs with the follower.
    start(&client).await;

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("lease event before timeout")
        .expect("scheduler alive");
    match event {
        LeaseEvent::Undo(message) => {
            assert_eq!(message.channel, channel);
            assert_eq!(message.action, ChannelAction::Hide);
        }
        LeaseEvent::Replay(_) => panic!("short lease must undo, not replay"),
    }
    assert!(client
        .pending_lease(&channel, &ChannelAction::Hide, b"hidden")
        .is_none());

    client.stop_network_follower().await.unwrap();
}

#[tokio::test]
async fn rekey_rotates_the_send_session_between_two_clients() {
    let net = MockNetwork::new();
    let ndf = test_ndf::with_nodes(2);
    let keys = install_key_handler(&net, cmix_group());
    seed_rounds(&net, &ndf, 100, 60);

    let session_params = SessionParams {
        num_keys: 8,
        rekey_threshold: 0.5,
    };
    let params = ClientParams {
        send_sessions: session_params,
        receive_sessions: session_params,
        ..test_params()
    };
    let alice = new_client(&net, &ndf, params.clone()).await;
    let bob = new_client(&net, &ndf, params).await;
    relay_uploads(
        net.clone(),
        cmix_group(),
        keys,
        vec![alice.client_id(), bob.client_id()],
    );

    let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
    bob.on_message(move |m| {
        let _ = bob_tx.send(m.contents);
    });
    let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
    alice.on_message(move |m| {
        let _ = alice_tx.send(m.contents);
    });

    alice.add_identity(alice.client_id(), None, true);
    bob.add_identity(bob.client_id(), None, true);
    // Both sides install the partnership before any traffic can flow,
    // so neither misses the other's announcement.
    let initial = alice
        .add_partner(bob.client_id(), bob.e2e_public())
        .unwrap();
    bob.add_partner(alice.client_id(), alice.e2e_public())
        .unwrap();

    start(&alice).await;
    start(&bob).await;

    // The initial session confirms over the mixnet.
    let bob_id = bob.client_id();
    assert!(
        wait_for(Duration::from_secs(30), || {
            alice.session_state(&bob_id, &initial)
                == Some(haze_e2e::SessionState::Confirmed)
        })
        .await
    );

    // Consuming past the threshold triggers a successor negotiation.
    for i in 0..5u8 {
        alice
            .send_e2e(&bob_id, format!("message {i}").as_bytes())
            .await
            .unwrap();
    }
    let mut received = Vec::new();
    while received.len() < 5 {
        let contents = tokio::time::timeout(Duration::from_secs(10), bob_rx.recv())
            .await
            .expect("bob receives all data messages")
            .expect("listener alive");
        received.push(contents);
    }
    assert!(received.contains(&b"message 0".to_vec()));

    assert!(
        wait_for(Duration::from_secs(30), || {
            match alice.current_send(&bob_id) {
                Ok(current) => {
                    current != initial
                        && alice.session_state(&bob_id, &current)
                            == Some(haze_e2e::SessionState::Confirmed)
                }
                Err(_) => false,
            }
        })
        .await
    );
    assert_eq!(
        alice.session_state(&bob_id, &initial),
        Some(haze_e2e::SessionState::NewSessionCreated)
    );

    // The superseded session's receive side still works: bob's send
    // chain has not rotated and alice can still read it.
    bob.send_e2e(&alice.client_id(), b"reply").await.unwrap();
    let contents = tokio::time::timeout(Duration::from_secs(10), alice_rx.recv())
        .await
        .expect("alice receives the reply")
        .expect("listener alive");
    assert_eq!(contents, b"reply".to_vec());

    alice.stop_network_follower().await.unwrap();
    bob.stop_network_follower().await.unwrap();
}

#[tokio::test]
async fn consumed_fingerprint_cannot_be_registered_again() {
    let net = MockNetwork::new();
    let ndf = test_ndf::with_nodes(2);
    install_key_handler(&net, cmix_group());
    let topology: Vec<Id> = ndf.nodes.iter().map(|e| e.id).collect();
    net.put_round(completed_round(queued_round(60, topology)));

    let client = new_client(&net, &ndf, test_params()).await;
    let me = client.client_id();
    client.add_identity(me, None, false);

    let fp = KeyFingerprint::from_bytes([3u8; 32]).unwrap();
    let counter = Arc::new(Counting(AtomicUsize::new(0)));
    client.add_fingerprint(me, fp, counter.clone()).unwrap();

    let eph = window_at(&me, ADDRESS_BITS, SystemTime::now()).ephemeral;
    let mut msg = CmixMessage::new(cmix_group().prime_len()).unwrap();
    msg.set_fingerprint(&fp);
    msg.set_contents(b"once").unwrap();
    msg.set_mac(&make_mac(&[6u8; 32], b"once"));
    net.deposit(
        eph,
        RoundId(60),
        vec![Slot {
            ephemeral_id: eph,
            payload: msg.marshal(),
        }],
    );

    start(&client).await;
    assert!(wait_for(Duration::from_secs(5), || {
        counter.0.load(Ordering::SeqCst) == 1
    })
    .await);

    // The fingerprint was consumed by the successful decrypt; it must
    // not return to the table under a different processor.
    let again = Arc::new(Counting(AtomicUsize::new(0)));
    let err = client.add_fingerprint(me, fp, again).unwrap_err();
    assert!(matches!(err, ClientError::Cmix(CmixError::AlreadyExists)));

    client.stop_network_follower().await.unwrap();
}
