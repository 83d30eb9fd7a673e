//! Message ledger tests

use super::*;
use crate::persistence::{MemoryStore, Store};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn limits(max_inflight: usize) -> LedgerLimits {
    LedgerLimits {
        max_inflight,
        max_pending: 0,
        retry_interval: Duration::from_secs(20),
    }
}

fn ledger(max_inflight: usize) -> Ledger {
    Ledger::new(Arc::from("client"), limits(max_inflight), Persistence::disabled())
}

fn durable_ledger(max_inflight: usize, store: &MemoryStore) -> Ledger {
    let mut ledger = Ledger::new(
        Arc::from("client"),
        limits(max_inflight),
        Persistence::new(Arc::new(store.clone())),
    );
    ledger.set_durable(true);
    ledger
}

fn enqueue(ledger: &mut Ledger, store: &PublicationStore, topic: &str, qos: QoS) -> u16 {
    let request = PublishRequest::new(topic, topic.as_bytes().to_vec(), qos);
    let publication = store.acquire(request.topic.clone(), request.payload.clone());
    ledger
        .enqueue(publication, &request, ProtocolVersion::V311, Instant::now())
        .unwrap()
}

fn admit_all(ledger: &mut Ledger) -> Vec<u16> {
    let mut ids = Vec::new();
    while let Some(admitted) = ledger.admit(Instant::now()).unwrap() {
        match admitted {
            Admitted::InFlight(id) => ids.push(id),
            Admitted::AtMostOnce(_) => ids.push(0),
        }
    }
    ids
}

/// Write everything flagged, returning (packet type, id, dup)
fn flush(ledger: &mut Ledger) -> Vec<(PacketType, Option<u16>, bool)> {
    let mut written = Vec::new();
    while let Some(packet) = ledger.next_write() {
        let dup = matches!(&packet, Outbound::Publish(p) if p.dup);
        let id = packet.packet_id();
        written.push((packet.packet_type(), id, dup));
        ledger.confirm_write(id.unwrap_or_default(), Instant::now());
    }
    written
}

/// Decoded records currently in the store, with their keys
fn read_back(store: &MemoryStore) -> Vec<(String, StoredMessage)> {
    Persistence::new(Arc::new(store.clone()))
        .restore()
        .unwrap()
        .into_iter()
        .filter_map(|(key, record)| record.ok().map(|record| (key, record)))
        .collect()
}

#[test]
fn test_message_ids_rotate_and_skip_in_use() {
    let store = PublicationStore::new();
    let mut ledger = ledger(10);
    ledger.next_msgid = u16::MAX;

    let a = enqueue(&mut ledger, &store, "a", QoS::AtLeastOnce);
    let b = enqueue(&mut ledger, &store, "b", QoS::AtLeastOnce);
    assert_eq!(a, u16::MAX);
    // 0 is never issued
    assert_eq!(b, 1);

    ledger.next_msgid = u16::MAX;
    let c = enqueue(&mut ledger, &store, "c", QoS::AtLeastOnce);
    assert_eq!(c, 2);
}

#[test]
fn test_qos0_takes_no_identifier_or_slot() {
    let store = PublicationStore::new();
    let mut ledger = ledger(1);
    enqueue(&mut ledger, &store, "one", QoS::AtLeastOnce);
    assert_eq!(enqueue(&mut ledger, &store, "zero", QoS::AtMostOnce), 0);

    assert!(matches!(
        ledger.admit(Instant::now()).unwrap(),
        Some(Admitted::InFlight(1))
    ));
    let Some(Admitted::AtMostOnce(message)) = ledger.admit(Instant::now()).unwrap() else {
        panic!("expected QoS 0 admission");
    };
    assert_eq!(&*message.topic(), "zero");
    assert_eq!(ledger.outbound_len(), 1);
}

#[test]
fn test_admission_bounded_by_max_inflight() {
    let store = PublicationStore::new();
    let mut ledger = ledger(2);
    for topic in ["a", "b", "c"] {
        enqueue(&mut ledger, &store, topic, QoS::AtLeastOnce);
    }

    assert_eq!(admit_all(&mut ledger), vec![1, 2]);
    assert_eq!(ledger.outbound_len(), 2);
    assert_eq!(ledger.pending_len(), 1);

    assert!(matches!(
        ledger.puback(Ack::new(1)).unwrap(),
        AckOutcome::Delivered(_)
    ));
    assert_eq!(admit_all(&mut ledger), vec![3]);
    assert_eq!(ledger.pending_len(), 0);
}

#[test]
fn test_pending_queue_bound() {
    let store = PublicationStore::new();
    let mut ledger = Ledger::new(
        Arc::from("client"),
        LedgerLimits {
            max_pending: 1,
            ..limits(1)
        },
        Persistence::disabled(),
    );
    enqueue(&mut ledger, &store, "a", QoS::AtLeastOnce);
    let request = PublishRequest::new("b", "b", QoS::AtLeastOnce);
    let err = ledger
        .enqueue(
            store.acquire("b", "b"),
            &request,
            ProtocolVersion::V311,
            Instant::now(),
        )
        .unwrap_err();
    assert!(matches!(err, LedgerError::QueueFull));
    // The rejected publication was released with the handle
    assert_eq!(store.live(), 1);
}

#[test]
fn test_qos2_outbound_handshake_order() {
    let store = PublicationStore::new();
    let mut ledger = ledger(5);
    let id = enqueue(&mut ledger, &store, "t", QoS::ExactlyOnce);
    admit_all(&mut ledger);

    assert_eq!(flush(&mut ledger), vec![(PacketType::Publish, Some(id), false)]);

    assert!(matches!(
        ledger.pubrec(Ack::new(id), Instant::now()).unwrap(),
        AckOutcome::Released
    ));
    assert_eq!(flush(&mut ledger), vec![(PacketType::PubRel, Some(id), false)]);
    assert_eq!(
        ledger.outbound().next().map(|m| m.next_expected),
        Some(NextExpected::PubComp)
    );

    let AckOutcome::Delivered(message) = ledger.pubcomp(Ack::new(id)).unwrap() else {
        panic!("expected delivery");
    };
    let watch = message.publication.watch();
    drop(message);
    assert!(watch.is_freed());
    assert_eq!(ledger.outbound_len(), 0);
}

#[test]
fn test_stage_skip_is_a_violation() {
    let store = PublicationStore::new();
    let mut ledger = ledger(5);
    let id = enqueue(&mut ledger, &store, "t", QoS::ExactlyOnce);
    admit_all(&mut ledger);

    let outcome = ledger.pubcomp(Ack::new(id)).unwrap();
    let AckOutcome::Violation { error, .. } = outcome else {
        panic!("expected violation, got {:?}", outcome);
    };
    assert_eq!(
        error,
        ProtocolError::UnexpectedAck {
            packet: PacketType::PubComp,
            packet_id: id,
            expected: Some(PacketType::PubRec),
        }
    );
    assert_eq!(ledger.outbound_len(), 0);
}

#[test]
fn test_unknown_ack_is_protocol_error() {
    let mut ledger = ledger(5);
    let err = ledger.puback(Ack::new(42)).unwrap_err();
    assert!(matches!(
        err,
        LedgerError::Protocol(ProtocolError::UnknownPacketId {
            packet: PacketType::PubAck,
            packet_id: 42
        })
    ));
}

#[test]
fn test_v5_failure_reason_rejects() {
    let store = PublicationStore::new();
    let mut ledger = ledger(5);
    let request = PublishRequest::new("t", "x", QoS::AtLeastOnce);
    ledger
        .enqueue(
            store.acquire("t", "x"),
            &request,
            ProtocolVersion::V5,
            Instant::now(),
        )
        .unwrap();
    admit_all(&mut ledger);

    let outcome = ledger.puback(Ack::with_reason(1, 0x87)).unwrap();
    assert!(matches!(
        outcome,
        AckOutcome::Rejected {
            reason_code: 0x87,
            ..
        }
    ));
}

#[test]
fn test_retry_marks_stale_entries_with_dup() {
    let store = PublicationStore::new();
    let mut ledger = ledger(5);
    let id = enqueue(&mut ledger, &store, "t", QoS::AtLeastOnce);
    let start = Instant::now();
    ledger.admit(start).unwrap();
    flush(&mut ledger);

    assert_eq!(ledger.mark_retries(start + Duration::from_secs(5)), 0);
    assert_eq!(ledger.mark_retries(start + Duration::from_secs(25)), 1);
    assert_eq!(flush(&mut ledger), vec![(PacketType::Publish, Some(id), true)]);
}

#[test]
fn test_zero_retry_interval_disables_retry() {
    let store = PublicationStore::new();
    let mut ledger = Ledger::new(
        Arc::from("client"),
        LedgerLimits {
            retry_interval: Duration::ZERO,
            ..limits(5)
        },
        Persistence::disabled(),
    );
    enqueue(&mut ledger, &store, "t", QoS::AtLeastOnce);
    admit_all(&mut ledger);
    flush(&mut ledger);
    assert_eq!(
        ledger.mark_retries(Instant::now() + Duration::from_secs(3600)),
        0
    );
}

#[test]
fn test_inbound_qos2_delivered_once_on_pubrel() {
    let store = PublicationStore::new();
    let mut ledger = ledger(5);
    let publish = InboundPublish::new("in", "payload", QoS::ExactlyOnce).with_packet_id(9);

    let first = ledger
        .receive(&store, publish.clone(), ProtocolVersion::V311, Instant::now())
        .unwrap();
    assert!(!first.delivered);
    assert!(matches!(first.reply, Some(Outbound::PubRec(Ack { packet_id: 9, .. }))));

    // Redelivery before PUBREL: acknowledge again, deliver nothing
    let again = ledger
        .receive(&store, publish, ProtocolVersion::V311, Instant::now())
        .unwrap();
    assert!(!again.delivered);
    assert_eq!(ledger.inbound_len(), 1);

    let rel = ledger.pubrel(Ack::new(9), ProtocolVersion::V311).unwrap();
    assert!(rel.delivered);
    assert!(matches!(rel.reply, Some(Outbound::PubComp(Ack { packet_id: 9, reason_code: 0 }))));

    let received = ledger.take_received();
    assert_eq!(received.len(), 1);
    assert_eq!(&*received[0].topic(), "in");
    assert_eq!(received[0].payload(), Bytes::from_static(b"payload"));
}

#[test]
fn test_unknown_pubrel_still_completes() {
    let mut ledger = ledger(5);
    let v311 = ledger.pubrel(Ack::new(3), ProtocolVersion::V311).unwrap();
    assert!(matches!(v311.reply, Some(Outbound::PubComp(Ack { packet_id: 3, reason_code: 0 }))));

    let v5 = ledger.pubrel(Ack::new(3), ProtocolVersion::V5).unwrap();
    assert!(matches!(
        v5.reply,
        Some(Outbound::PubComp(Ack {
            packet_id: 3,
            reason_code: REASON_PACKET_ID_NOT_FOUND
        }))
    ));
}

#[test]
fn test_inbound_qos1_acked_without_entry() {
    let store = PublicationStore::new();
    let mut ledger = ledger(5);
    let outcome = ledger
        .receive(
            &store,
            InboundPublish::new("in", "x", QoS::AtLeastOnce).with_packet_id(4),
            ProtocolVersion::V311,
            Instant::now(),
        )
        .unwrap();
    assert!(outcome.delivered);
    assert!(matches!(outcome.reply, Some(Outbound::PubAck(Ack { packet_id: 4, .. }))));
    assert_eq!(ledger.inbound_len(), 0);

    let missing = ledger.receive(
        &store,
        InboundPublish::new("in", "x", QoS::AtLeastOnce),
        ProtocolVersion::V311,
        Instant::now(),
    );
    assert!(matches!(
        missing,
        Err(LedgerError::Protocol(ProtocolError::MissingPacketId))
    ));
}

#[test]
fn test_expiry_skips_entries_awaiting_pubcomp() {
    let store = PublicationStore::new();
    let mut ledger = ledger(5);
    let now = Instant::now();
    let props = Properties {
        message_expiry_interval: Some(10),
        ..Default::default()
    };
    for (topic, qos) in [("a", QoS::ExactlyOnce), ("b", QoS::AtLeastOnce)] {
        let request = PublishRequest::new(topic, "x", qos).with_properties(props.clone());
        ledger
            .enqueue(store.acquire(topic, "x"), &request, ProtocolVersion::V5, now)
            .unwrap();
    }
    let request = PublishRequest::new("c", "x", QoS::AtLeastOnce).with_properties(props);
    ledger.admit(now).unwrap();
    ledger.admit(now).unwrap();
    ledger
        .enqueue(store.acquire("c", "x"), &request, ProtocolVersion::V5, now)
        .unwrap();
    flush(&mut ledger);
    ledger.pubrec(Ack::new(1), now).unwrap();

    let expired = ledger.expire(now + Duration::from_secs(11)).unwrap();
    let mut topics: Vec<String> = expired.iter().map(|m| m.topic().to_string()).collect();
    topics.sort();
    assert_eq!(topics, vec!["b".to_string(), "c".to_string()]);
    assert_eq!(ledger.outbound_len(), 1);
    assert_eq!(ledger.pending_len(), 0);
}

#[test]
fn test_properties_dropped_before_v5() {
    let store = PublicationStore::new();
    let mut ledger = ledger(5);
    let request = PublishRequest::new("t", "x", QoS::AtLeastOnce).with_properties(Properties {
        message_expiry_interval: Some(1),
        ..Default::default()
    });
    ledger
        .enqueue(
            store.acquire("t", "x"),
            &request,
            ProtocolVersion::V311,
            Instant::now(),
        )
        .unwrap();
    let message = ledger.pending().next().unwrap();
    assert!(message.properties.is_empty());
    assert!(message.expires_at.is_none());
}

#[test]
fn test_durable_records_follow_the_handshake() {
    let store = MemoryStore::new();
    let publications = PublicationStore::new();
    let mut ledger = durable_ledger(1, &store);

    enqueue(&mut ledger, &publications, "a", QoS::ExactlyOnce);
    enqueue(&mut ledger, &publications, "b", QoS::AtLeastOnce);
    assert_eq!(
        store.keys().unwrap(),
        vec![
            "q-00000000000000000001".to_string(),
            "q-00000000000000000002".to_string()
        ]
    );

    admit_all(&mut ledger);
    assert_eq!(
        store.keys().unwrap(),
        vec!["q-00000000000000000002".to_string(), "s-1".to_string()]
    );

    ledger.pubrec(Ack::new(1), Instant::now()).unwrap();
    let persistence = Persistence::new(Arc::new(store.clone()));
    let records = persistence.restore().unwrap();
    let outbound = records
        .iter()
        .find(|(key, _)| key == "s-1")
        .and_then(|(_, r)| r.as_ref().ok())
        .unwrap();
    assert_eq!(outbound.next_expected, PacketType::PubComp as u8);

    ledger.pubcomp(Ack::new(1)).unwrap();
    admit_all(&mut ledger);
    assert_eq!(store.keys().unwrap(), vec!["s-2".to_string()]);
}

#[test]
fn test_non_durable_ledger_writes_nothing() {
    let store = MemoryStore::new();
    let publications = PublicationStore::new();
    let mut ledger = durable_ledger(1, &store);
    ledger.set_durable(false);
    enqueue(&mut ledger, &publications, "a", QoS::AtLeastOnce);
    admit_all(&mut ledger);
    assert!(store.is_empty());
}

#[test]
fn test_restore_rebuilds_queues_in_seqno_order() {
    let store = MemoryStore::new();
    let publications = PublicationStore::new();
    {
        let mut ledger = durable_ledger(2, &store);
        for topic in ["a", "b", "c", "a"] {
            enqueue(&mut ledger, &publications, topic, QoS::AtLeastOnce);
        }
        admit_all(&mut ledger);
        ledger
            .receive(
                &publications,
                InboundPublish::new("in", "x", QoS::ExactlyOnce).with_packet_id(77),
                ProtocolVersion::V311,
                Instant::now(),
            )
            .unwrap();
    }
    assert_eq!(publications.live(), 0);

    let restored_store = PublicationStore::new();
    let mut ledger = durable_ledger(2, &store);
    assert_eq!(
        ledger
            .restore(read_back(&store), &restored_store, Instant::now())
            .unwrap(),
        5
    );
    restored_store.finish_recovery();

    let outbound: Vec<u16> = ledger.outbound().map(|m| m.msgid).collect();
    let pending: Vec<u16> = ledger.pending().map(|m| m.msgid).collect();
    assert_eq!(outbound, vec![1, 2]);
    assert_eq!(pending, vec![3, 4]);
    assert_eq!(ledger.inbound_len(), 1);
    assert_eq!(ledger.seqno(), 5);

    // Identical content shares one publication after recovery
    let first = ledger.outbound().next().unwrap();
    let last = ledger.pending().last().unwrap();
    assert!(first.publication.ptr_eq(&last.publication));
    assert_eq!(restored_store.live(), 4);

    // A second restore must not duplicate what is already held
    assert_eq!(
        ledger
            .restore(read_back(&store), &restored_store, Instant::now())
            .unwrap(),
        0
    );
    assert_eq!(ledger.outbound_len(), 2);
    assert_eq!(ledger.pending_len(), 2);

    // New identifiers continue after the restored ones
    assert_eq!(enqueue(&mut ledger, &restored_store, "d", QoS::AtLeastOnce), 5);
    assert_eq!(ledger.seqno(), 6);
}

#[test]
fn test_restore_drops_pending_copy_of_admitted_entry() {
    let store = MemoryStore::new();
    let publications = PublicationStore::new();
    {
        // Crash after writing the outbound record, before deleting the pending one
        let mut source = ledger(1);
        enqueue(&mut source, &publications, "a", QoS::AtLeastOnce);
        let pending = source.pending().next().unwrap().to_record(StoredQueue::Pending);
        admit_all(&mut source);
        let outbound = source.outbound().next().unwrap().to_record(StoredQueue::Outbound);

        let persistence = Persistence::new(Arc::new(store.clone()));
        persistence
            .write(&persistence::pending_key(pending.seqno), &pending)
            .unwrap();
        persistence
            .write(&persistence::outbound_key(outbound.message_id), &outbound)
            .unwrap();
    }

    {
        let mut ledger = durable_ledger(1, &store);
        assert_eq!(
            ledger
                .restore(read_back(&store), &publications, Instant::now())
                .unwrap(),
            1
        );
        assert_eq!(ledger.outbound_len(), 1);
        assert_eq!(ledger.pending_len(), 0);
        assert_eq!(store.keys().unwrap(), vec!["s-1".to_string()]);

        ledger.mark_replay();
        flush(&mut ledger);
        ledger.puback(Ack::new(1)).unwrap();
    }
    assert!(store.is_empty());

    // The acknowledged message does not come back after another restart
    let mut ledger = durable_ledger(1, &store);
    assert_eq!(
        ledger
            .restore(read_back(&store), &publications, Instant::now())
            .unwrap(),
        0
    );
    assert_eq!(ledger.pending_len(), 0);
    assert_eq!(ledger.outbound_len(), 0);
}

#[test]
fn test_restore_deletes_unusable_records() {
    let store = MemoryStore::new();
    let publications = PublicationStore::new();
    let mut source = ledger(2);
    enqueue(&mut source, &publications, "a", QoS::AtLeastOnce);
    enqueue(&mut source, &publications, "b", QoS::AtLeastOnce);
    admit_all(&mut source);

    let mut tampered = source.outbound().next().unwrap().to_record(StoredQueue::Outbound);
    tampered.payload = b"changed".to_vec();
    let mut invalid = source.outbound().last().unwrap().to_record(StoredQueue::Outbound);
    invalid.qos = 7;

    let persistence = Persistence::new(Arc::new(store.clone()));
    persistence.write("s-1", &tampered).unwrap();
    persistence.write("s-2", &invalid).unwrap();

    let mut ledger = durable_ledger(2, &store);
    assert_eq!(
        ledger
            .restore(read_back(&store), &publications, Instant::now())
            .unwrap(),
        0
    );
    assert!(store.is_empty());
}

#[test]
fn test_replay_resends_everything_in_order() {
    let store = PublicationStore::new();
    let mut ledger = ledger(3);
    for topic in ["a", "b", "c"] {
        enqueue(&mut ledger, &store, topic, QoS::ExactlyOnce);
    }
    admit_all(&mut ledger);
    flush(&mut ledger);
    ledger.pubrec(Ack::new(2), Instant::now()).unwrap();

    assert_eq!(ledger.mark_replay(), 3);
    assert_eq!(ledger.replay_outstanding(), 3);
    assert_eq!(
        flush(&mut ledger),
        vec![
            (PacketType::Publish, Some(1), true),
            (PacketType::PubRel, Some(2), false),
            (PacketType::Publish, Some(3), true),
        ]
    );
    assert_eq!(ledger.replay_outstanding(), 0);
}

#[test]
fn test_discard_drops_inflight_but_keeps_pending() {
    let store = MemoryStore::new();
    let publications = PublicationStore::new();
    let mut ledger = durable_ledger(1, &store);
    enqueue(&mut ledger, &publications, "a", QoS::AtLeastOnce);
    enqueue(&mut ledger, &publications, "b", QoS::AtLeastOnce);
    admit_all(&mut ledger);
    ledger
        .receive(
            &publications,
            InboundPublish::new("in", "x", QoS::ExactlyOnce).with_packet_id(5),
            ProtocolVersion::V311,
            Instant::now(),
        )
        .unwrap();

    let dropped = ledger.discard().unwrap();
    assert_eq!(dropped.len(), 1);
    assert_eq!(ledger.inbound_len(), 0);
    assert_eq!(ledger.pending_len(), 1);
    assert_eq!(
        store.keys().unwrap(),
        vec!["q-00000000000000000002".to_string()]
    );
    drop(dropped);
    assert_eq!(publications.live(), 1);
}

#[derive(Debug, Clone)]
enum Op {
    Enqueue(u8),
    Admit,
    AckOldest,
    AckNewest,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..3).prop_map(Op::Enqueue),
        Just(Op::Admit),
        Just(Op::AckOldest),
        Just(Op::AckNewest),
    ]
}

fn complete(ledger: &mut Ledger, msgid: u16) {
    let qos = ledger
        .outbound()
        .find(|m| m.msgid == msgid)
        .map(|m| m.next_expected);
    match qos {
        Some(NextExpected::PubAck) => {
            ledger.puback(Ack::new(msgid)).unwrap();
        }
        Some(NextExpected::PubRec) => {
            ledger.pubrec(Ack::new(msgid), Instant::now()).unwrap();
            ledger.pubcomp(Ack::new(msgid)).unwrap();
        }
        _ => {}
    }
}

proptest! {
    #[test]
    fn inflight_bound_and_unique_ids(max_inflight in 1usize..5, ops in prop::collection::vec(op(), 1..200)) {
        let store = PublicationStore::new();
        let mut ledger = ledger(max_inflight);

        for op in ops {
            match op {
                Op::Enqueue(qos) => {
                    let qos = QoS::from_u8(qos).unwrap();
                    enqueue(&mut ledger, &store, "t", qos);
                }
                Op::Admit => {
                    admit_all(&mut ledger);
                }
                Op::AckOldest => {
                    let oldest = ledger.outbound().next().map(|m| m.msgid);
                    if let Some(id) = oldest {
                        complete(&mut ledger, id);
                    }
                }
                Op::AckNewest => {
                    let newest = ledger.outbound().last().map(|m| m.msgid);
                    if let Some(id) = newest {
                        complete(&mut ledger, id);
                    }
                }
            }

            prop_assert!(ledger.outbound_len() <= max_inflight);

            let mut ids: Vec<u16> = ledger
                .outbound()
                .chain(ledger.pending())
                .filter(|m| m.qos != QoS::AtMostOnce)
                .map(|m| m.msgid)
                .collect();
            prop_assert!(ids.iter().all(|&id| id != 0));
            let total = ids.len();
            ids.sort_unstable();
            ids.dedup();
            prop_assert_eq!(ids.len(), total);
        }
    }
}
