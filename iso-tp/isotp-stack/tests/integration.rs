use core::time::Duration;

use embedded_can::Frame;
use isotp_stack::{
    AddressingFormat, CanFrame, CanIdType, Clock, Confirmation, ConversationKey, IsoTpConfig,
    IsoTpError, IsoTpStack, Mapping, Message, SendOptions, StackEvent, TransmitStatus,
};
use isotp_stack::MessageType;

#[derive(Clone, Copy, Debug, Default)]
struct ManualClock;

impl Clock for ManualClock {
    type Instant = u64;

    fn now(&self) -> u64 {
        0
    }

    fn add(&self, instant: u64, dur: Duration) -> u64 {
        instant + dur.as_millis() as u64
    }
}

type Stack = IsoTpStack<ManualClock>;

fn tester_key() -> ConversationKey {
    ConversationKey::physical(AddressingFormat::Normal, 0xF1, 0x10)
}

fn normal_mapping() -> Mapping {
    Mapping {
        can_id: 0x7E0,
        can_id_response: 0x7E8,
        id_type: CanIdType::standard(),
        message_type: MessageType::Diagnostic,
        key: tester_key(),
    }
}

fn stack(cfg: IsoTpConfig) -> Stack {
    let mut stack = IsoTpStack::new(cfg, ManualClock).unwrap();
    stack.add_mapping(normal_mapping()).unwrap();
    stack
}

fn pair(tester: IsoTpConfig, ecu: IsoTpConfig) -> (Stack, Stack) {
    (stack(tester), stack(ecu))
}

/// Deliver everything `from` wants to send; the transport confirms each frame before the peer
/// sees it.
fn deliver(
    from: &mut Stack,
    to: &mut Stack,
    now: u64,
    wire: &mut Vec<(u64, CanFrame)>,
) -> bool {
    let mut moved = false;
    while let Some(out) = from.poll_transmit() {
        moved = true;
        if let Some(receipt) = out.receipt {
            from.on_transmit_result(receipt, TransmitStatus::Sent, now);
        }
        to.handle_frame(&out.frame, now).unwrap();
        wire.push((now, out.frame));
    }
    moved
}

/// Move frames between both stacks until neither has anything to send.
fn exchange(a: &mut Stack, b: &mut Stack, now: u64, wire: &mut Vec<(u64, CanFrame)>) {
    loop {
        let forward = deliver(a, b, now, wire);
        let backward = deliver(b, a, now, wire);
        if !forward && !backward {
            return;
        }
    }
}

/// Exchange frames and advance time through every deadline until both stacks are idle.
fn run(a: &mut Stack, b: &mut Stack) -> Vec<(u64, CanFrame)> {
    let mut wire = Vec::new();
    let mut now = 0;
    loop {
        exchange(a, b, now, &mut wire);
        let next = match (a.next_deadline(), b.next_deadline()) {
            (Some(x), Some(y)) => x.min(y),
            (Some(x), None) | (None, Some(x)) => x,
            (None, None) => return wire,
        };
        now = next;
        a.handle_timeout(now);
        b.handle_timeout(now);
    }
}

fn events(stack: &mut Stack) -> Vec<StackEvent> {
    std::iter::from_fn(|| stack.poll_event()).collect()
}

fn received(stack: &mut Stack) -> Vec<Message> {
    events(stack)
        .into_iter()
        .filter_map(|event| match event {
            StackEvent::Received(message) => Some(message),
            _ => None,
        })
        .collect()
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| i as u8).collect()
}

#[test]
fn six_byte_payload_is_one_single_frame() {
    let (mut tester, mut ecu) = pair(IsoTpConfig::default(), IsoTpConfig::default());
    tester
        .send(tester_key(), payload(6), SendOptions::default(), 0)
        .unwrap();

    let wire = run(&mut tester, &mut ecu);
    assert_eq!(wire.len(), 1);
    let frame = &wire[0].1;
    assert_eq!(frame.raw_id(), 0x7E0);
    assert_eq!(frame.data(), &[0x06, 0, 1, 2, 3, 4, 5, 0x55]);

    assert_eq!(
        events(&mut tester),
        vec![StackEvent::Confirmed {
            key: tester_key(),
            result: Confirmation::Ok
        }]
    );
    let messages = received(&mut ecu);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].data, payload(6));
    assert_eq!(messages[0].key, tester_key());
    assert_eq!(messages[0].can_id, 0x7E0);
    assert_eq!(messages[0].result, Confirmation::Ok);
    assert_eq!(tester.active_conversations(), 0);
}

#[test]
fn twenty_byte_payload_uses_first_frame_and_two_consecutive_frames() {
    let (mut tester, mut ecu) = pair(IsoTpConfig::default(), IsoTpConfig::default());
    let data = payload(20);
    tester
        .send(tester_key(), data.clone(), SendOptions::default(), 0)
        .unwrap();

    let wire = run(&mut tester, &mut ecu);
    let frames: Vec<(u32, Vec<u8>)> = wire
        .iter()
        .map(|(_, f)| (f.raw_id(), f.data().to_vec()))
        .collect();
    assert_eq!(
        frames,
        vec![
            (0x7E0, vec![0x10, 0x14, 0, 1, 2, 3, 4, 5]),
            (0x7E8, vec![0x30, 0x00, 0x00, 0x55, 0x55, 0x55, 0x55, 0x55]),
            (0x7E0, vec![0x21, 6, 7, 8, 9, 10, 11, 12]),
            (0x7E0, vec![0x22, 13, 14, 15, 16, 17, 18, 19]),
        ]
    );

    let messages = received(&mut ecu);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].data, data);
    assert_eq!(messages[0].result, Confirmation::Ok);
    assert_eq!(
        events(&mut tester),
        vec![StackEvent::Confirmed {
            key: tester_key(),
            result: Confirmation::Ok
        }]
    );
    assert_eq!(ecu.active_conversations(), 0);
}

#[test]
fn sequence_numbers_cycle_through_zero() {
    let (mut tester, mut ecu) = pair(IsoTpConfig::default(), IsoTpConfig::default());
    // 6 bytes in the First Frame plus 17 full Consecutive Frames.
    let data = payload(6 + 7 * 17);
    tester
        .send(tester_key(), data.clone(), SendOptions::default(), 0)
        .unwrap();

    let wire = run(&mut tester, &mut ecu);
    let sns: Vec<u8> = wire
        .iter()
        .filter(|(_, f)| f.raw_id() == 0x7E0 && f.data()[0] >> 4 == 2)
        .map(|(_, f)| f.data()[0] & 0x0F)
        .collect();
    let expected: Vec<u8> = (1..=15).chain([0, 1]).collect();
    assert_eq!(sns, expected);
    assert_eq!(received(&mut ecu)[0].data, data);
}

#[test]
fn block_size_requests_a_flow_control_per_block() {
    let ecu_cfg = IsoTpConfig {
        block_size: 2,
        ..IsoTpConfig::default()
    };
    let (mut tester, mut ecu) = pair(IsoTpConfig::default(), ecu_cfg);
    let data = payload(40);
    tester
        .send(tester_key(), data.clone(), SendOptions::default(), 0)
        .unwrap();

    let wire = run(&mut tester, &mut ecu);
    let kinds: Vec<u8> = wire.iter().map(|(_, f)| f.data()[0] >> 4).collect();
    assert_eq!(kinds, vec![1, 3, 2, 2, 3, 2, 2, 3, 2]);
    for (_, fc) in wire.iter().filter(|(_, f)| f.raw_id() == 0x7E8) {
        assert_eq!(&fc.data()[..3], &[0x30, 0x02, 0x00]);
    }
    assert_eq!(received(&mut ecu)[0].data, data);
}

#[test]
fn separation_time_paces_consecutive_frames() {
    let ecu_cfg = IsoTpConfig {
        st_min: Duration::from_millis(10),
        ..IsoTpConfig::default()
    };
    let (mut tester, mut ecu) = pair(IsoTpConfig::default(), ecu_cfg);
    tester
        .send(tester_key(), payload(27), SendOptions::default(), 0)
        .unwrap();

    let wire = run(&mut tester, &mut ecu);
    let cf_times: Vec<u64> = wire
        .iter()
        .filter(|(_, f)| f.data()[0] >> 4 == 2)
        .map(|(t, _)| *t)
        .collect();
    assert_eq!(cf_times, vec![0, 10, 20]);
    let fc = wire.iter().find(|(_, f)| f.raw_id() == 0x7E8).unwrap();
    assert_eq!(fc.1.data()[2], 10);
    assert_eq!(received(&mut ecu)[0].data, payload(27));
}

/// Send every length in `lens` on `key` and check each one arrives intact.
fn assert_round_trips(
    tester: &mut Stack,
    ecu: &mut Stack,
    key: ConversationKey,
    lens: impl IntoIterator<Item = usize>,
) {
    for len in lens {
        let data = payload(len);
        tester
            .send(key, data.clone(), SendOptions::default(), 0)
            .unwrap();
        run(tester, ecu);
        let messages = received(ecu);
        assert_eq!(messages.len(), 1, "len {len}");
        assert_eq!(messages[0].data, data, "len {len}");
        assert_eq!(messages[0].result, Confirmation::Ok, "len {len}");
        assert_eq!(tester.active_conversations(), 0, "len {len}");
    }
}

#[test]
fn every_classic_length_round_trips() {
    let (mut tester, mut ecu) = pair(IsoTpConfig::default(), IsoTpConfig::default());
    assert_round_trips(&mut tester, &mut ecu, tester_key(), 1..=4095);
}

#[test]
fn extended_addressing_lengths_around_frame_boundaries_round_trip() {
    let key = ConversationKey::physical(AddressingFormat::Extended, 0xF1, 0x10);
    let mapping = Mapping {
        can_id: 0x700,
        can_id_response: 0x701,
        key,
        ..normal_mapping()
    };
    let (mut tester, mut ecu) = pair(IsoTpConfig::default(), IsoTpConfig::default());
    tester.add_mapping(mapping).unwrap();
    ecu.add_mapping(mapping).unwrap();
    // Single Frames hold 6 bytes, the First Frame 5, each Consecutive Frame 6.
    assert_round_trips(
        &mut tester,
        &mut ecu,
        key,
        [1, 6, 7, 11, 12, 17, 18, 95, 96, 97, 4094, 4095],
    );
}

#[test]
fn can_fd_lengths_around_frame_boundaries_round_trip() {
    let mapping = Mapping {
        can_id: 0x6F0,
        can_id_response: 0x6F8,
        id_type: CanIdType::standard().with_fd(true),
        message_type: MessageType::Diagnostic,
        key: ConversationKey::physical(AddressingFormat::Normal, 0xF1, 0x20),
    };
    let (mut tester, mut ecu) = pair(IsoTpConfig::default(), IsoTpConfig::default());
    tester.add_mapping(mapping).unwrap();
    ecu.add_mapping(mapping).unwrap();
    // Single Frames hold 62 bytes with the length escape, the First Frame 62, each
    // Consecutive Frame 63.
    assert_round_trips(
        &mut tester,
        &mut ecu,
        mapping.key,
        [1, 7, 8, 61, 62, 63, 124, 125, 126, 187, 188, 4094, 4095],
    );
}

#[test]
fn large_payload_uses_32_bit_first_frame_length() {
    let cfg = IsoTpConfig {
        max_payload_len: 5000,
        ..IsoTpConfig::default()
    };
    let (mut tester, mut ecu) = pair(cfg.clone(), cfg);
    let data = payload(5000);
    tester
        .send(tester_key(), data.clone(), SendOptions::default(), 0)
        .unwrap();

    let wire = run(&mut tester, &mut ecu);
    assert_eq!(
        wire[0].1.data(),
        &[0x10, 0x00, 0x00, 0x00, 0x13, 0x88, 0x00, 0x01]
    );
    let messages = received(&mut ecu);
    assert_eq!(messages[0].data, data);
    assert_eq!(messages[0].result, Confirmation::Ok);
}

#[test]
fn can_fd_mapping_uses_single_frame_escape_and_64_byte_frames() {
    let fd_mapping = Mapping {
        can_id: 0x6F0,
        can_id_response: 0x6F8,
        id_type: CanIdType::standard().with_fd(true),
        message_type: MessageType::Diagnostic,
        key: ConversationKey::physical(AddressingFormat::Normal, 0xF1, 0x20),
    };
    let (mut tester, mut ecu) = pair(IsoTpConfig::default(), IsoTpConfig::default());
    tester.add_mapping(fd_mapping).unwrap();
    ecu.add_mapping(fd_mapping).unwrap();

    tester
        .send(fd_mapping.key, payload(20), SendOptions::default(), 0)
        .unwrap();
    let wire = run(&mut tester, &mut ecu);
    assert_eq!(wire.len(), 1);
    let sf = &wire[0].1;
    assert!(sf.is_fd());
    assert!(sf.brs());
    assert_eq!(sf.data().len(), 24);
    assert_eq!(&sf.data()[..3], &[0x00, 20, 0]);
    assert_eq!(received(&mut ecu)[0].data, payload(20));

    let data = payload(200);
    tester
        .send(fd_mapping.key, data.clone(), SendOptions::default(), 0)
        .unwrap();
    let wire = run(&mut tester, &mut ecu);
    // First Frame carries 62 bytes, two full Consecutive Frames 63 each, the last one 12.
    let lens: Vec<usize> = wire.iter().map(|(_, f)| f.data().len()).collect();
    assert_eq!(lens, vec![64, 8, 64, 64, 16]);
    let message = &received(&mut ecu)[0];
    assert_eq!(message.data, data);
    assert!(message.id_type.fd);
}

#[test]
fn unmapped_fixed_normal_key_can_switch_to_can_fd_per_send() {
    let mut tester = IsoTpStack::new(IsoTpConfig::default(), ManualClock).unwrap();
    let mut ecu = IsoTpStack::new(IsoTpConfig::default(), ManualClock).unwrap();
    let key = ConversationKey::physical(AddressingFormat::FixedNormal, 0xF1, 0x10);
    let options = SendOptions {
        fd: Some(true),
        brs: Some(false),
        priority: Some(3),
    };
    tester.send(key, payload(100), options, 0).unwrap();

    let wire = run(&mut tester, &mut ecu);
    let ff = &wire[0].1;
    assert!(ff.is_fd());
    assert_eq!(ff.raw_id(), 0x0CDA_10F1);
    // Flow Control answers with the sender's priority on the reversed addresses.
    assert_eq!(wire[1].1.raw_id(), 0x0CDA_F110);
    let message = &received(&mut ecu)[0];
    assert_eq!(message.data, payload(100));
    assert_eq!(message.id_type.priority, Some(3));
}

#[test]
fn concurrent_conversations_on_distinct_keys() {
    let mut tester = IsoTpStack::new(IsoTpConfig::default(), ManualClock).unwrap();
    let mut ecu = IsoTpStack::new(IsoTpConfig::default(), ManualClock).unwrap();
    let first = ConversationKey::physical(AddressingFormat::FixedNormal, 0xF1, 0x10);
    let second = ConversationKey::physical(AddressingFormat::FixedNormal, 0xF2, 0x10);
    tester
        .send(first, payload(30), SendOptions::default(), 0)
        .unwrap();
    tester
        .send(second, payload(45), SendOptions::default(), 0)
        .unwrap();
    assert_eq!(tester.active_conversations(), 2);

    run(&mut tester, &mut ecu);
    let mut messages = received(&mut ecu);
    messages.sort_by_key(|m| m.key.source);
    assert_eq!(messages.len(), 2);
    assert_eq!((messages[0].key, messages[0].data.len()), (first, 30));
    assert_eq!((messages[1].key, messages[1].data.len()), (second, 45));
}

#[test]
fn second_send_on_busy_key_is_rejected() {
    let (mut tester, _) = pair(IsoTpConfig::default(), IsoTpConfig::default());
    tester
        .send(tester_key(), payload(20), SendOptions::default(), 0)
        .unwrap();
    assert_eq!(
        tester.send(tester_key(), payload(3), SendOptions::default(), 0),
        Err(IsoTpError::AlreadyInProgress(tester_key()))
    );
}

#[test]
fn pending_indications_are_reported_when_enabled() {
    let cfg = IsoTpConfig {
        show_pending: true,
        ..IsoTpConfig::default()
    };
    let (mut tester, mut ecu) = pair(cfg.clone(), cfg);
    tester
        .send(tester_key(), payload(20), SendOptions::default(), 0)
        .unwrap();
    run(&mut tester, &mut ecu);

    let tester_events = events(&mut tester);
    assert!(matches!(
        &tester_events[0],
        StackEvent::Indication(m) if m.message_type == MessageType::IndicationTx
    ));
    let ecu_events = events(&mut ecu);
    assert_eq!(ecu_events.len(), 2);
    assert!(matches!(
        &ecu_events[0],
        StackEvent::Indication(m) if m.message_type == MessageType::Indication && m.data.is_empty()
    ));
    assert!(matches!(&ecu_events[1], StackEvent::Received(m) if m.data == payload(20)));
}
