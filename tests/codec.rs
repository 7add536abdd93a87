use bytes::Bytes;
use quantum_session::mqtt::{
    decode, encode, read_packet, write_packet, ConnectPacket, Packet, PublishPacket, Qos,
    SubscribePacket, UnsubscribePacket,
};
use quantum_session::net::TransportError;

#[test]
fn connect_with_credentials_matches_hand_built_frame() {
    let packet = Packet::Connect(ConnectPacket {
        client_id: "dev-1".into(),
        keep_alive: 10,
        clean_session: false,
        will: None,
        username: Some("user".into()),
        password: Some(Bytes::from_static(b"pw")),
    });
    let mut expected = vec![0x10, 27];
    expected.extend_from_slice(&[0, 4, b'M', b'Q', b'T', b'T', 4]);
    expected.push(0x80 | 0x40); // username + password, no clean session
    expected.extend_from_slice(&10u16.to_be_bytes());
    expected.extend_from_slice(&[0, 5]);
    expected.extend_from_slice(b"dev-1");
    expected.extend_from_slice(&[0, 4]);
    expected.extend_from_slice(b"user");
    expected.extend_from_slice(&[0, 2]);
    expected.extend_from_slice(b"pw");

    assert_eq!(encode(&packet).unwrap(), expected);
    assert_eq!(decode(expected[0], &expected[2..]).unwrap(), packet);
}

#[test]
fn publish_flags_carry_qos_dup_and_retain() {
    // QoS 1, DUP, RETAIN; topic "a/b", packet id 0x0102, payload "hi"
    let frame = [0x3B, 9, 0, 3, b'a', b'/', b'b', 0x01, 0x02, b'h', b'i'];
    let packet = decode(frame[0], &frame[2..]).unwrap();
    assert_eq!(
        packet,
        Packet::Publish(PublishPacket {
            topic: "a/b".into(),
            packet_id: Some(0x0102),
            payload: Bytes::from_static(b"hi"),
            qos: Qos::AtLeastOnce,
            retain: true,
            dup: true,
        })
    );
    assert_eq!(encode(&packet).unwrap(), frame);

    // QoS 0 has no packet id
    let frame = [0x30, 5, 0, 1, b't', b'o', b'k'];
    let Packet::Publish(publish) = decode(frame[0], &frame[2..]).unwrap() else {
        panic!("expected PUBLISH");
    };
    assert_eq!(publish.packet_id, None);
    assert_eq!(publish.payload, Bytes::from_static(b"ok"));
}

#[test]
fn publish_with_qos3_is_malformed() {
    assert!(decode(0x36, &[0, 1, b't', 0, 1]).is_err());
}

#[test]
fn subscribe_and_unsubscribe_use_reserved_flags() {
    let subscribe = Packet::Subscribe(SubscribePacket {
        packet_id: 3,
        filters: vec![("x/#".into(), Qos::AtLeastOnce), ("y".into(), Qos::AtMostOnce)],
    });
    let frame = encode(&subscribe).unwrap();
    assert_eq!(frame[0], 0x82);
    assert_eq!(
        &frame[2..],
        &[0, 3, 0, 3, b'x', b'/', b'#', 1, 0, 1, b'y', 0]
    );

    let unsubscribe = Packet::Unsubscribe(UnsubscribePacket {
        packet_id: 4,
        filters: vec!["x/#".into()],
    });
    let frame = encode(&unsubscribe).unwrap();
    assert_eq!(frame, vec![0xA2, 7, 0, 4, 0, 3, b'x', b'/', b'#']);
    assert_eq!(decode(frame[0], &frame[2..]).unwrap(), unsubscribe);
}

#[test]
fn empty_subscribe_is_refused() {
    let err = encode(&Packet::Subscribe(SubscribePacket {
        packet_id: 1,
        filters: Vec::new(),
    }))
    .unwrap_err();
    assert!(err.to_string().contains("at least one"));
}

#[test]
fn fixed_size_packets() {
    assert_eq!(encode(&Packet::PingReq).unwrap(), vec![0xC0, 0]);
    assert_eq!(encode(&Packet::PingResp).unwrap(), vec![0xD0, 0]);
    assert_eq!(encode(&Packet::Disconnect).unwrap(), vec![0xE0, 0]);
    assert_eq!(encode(&Packet::PubAck(0x1234)).unwrap(), vec![0x40, 2, 0x12, 0x34]);
    assert_eq!(encode(&Packet::PubRel(9)).unwrap(), vec![0x62, 2, 0, 9]);
    assert!(decode(0xD0, &[0]).is_err());
}

#[tokio::test]
async fn stream_reads_back_to_back_frames() {
    let (mut client, mut server) = tokio::io::duplex(1024);
    write_packet(&mut client, &Packet::PubAck(5)).await.unwrap();
    write_packet(&mut client, &Packet::PingResp).await.unwrap();
    drop(client);

    assert_eq!(read_packet(&mut server, 1024).await.unwrap(), Packet::PubAck(5));
    assert_eq!(read_packet(&mut server, 1024).await.unwrap(), Packet::PingResp);
    assert!(matches!(
        read_packet(&mut server, 1024).await,
        Err(TransportError::Closed)
    ));
}

#[tokio::test]
async fn stream_rejects_oversized_and_truncated_frames() {
    let (mut client, mut server) = tokio::io::duplex(1024);
    tokio::io::AsyncWriteExt::write_all(&mut client, &[0x30, 0xC8, 0x01])
        .await
        .unwrap();
    assert!(matches!(
        read_packet(&mut server, 100).await,
        Err(TransportError::Malformed(_))
    ));

    let (mut client, mut server) = tokio::io::duplex(1024);
    tokio::io::AsyncWriteExt::write_all(&mut client, &[0x40, 2, 0])
        .await
        .unwrap();
    drop(client);
    assert!(matches!(
        read_packet(&mut server, 100).await,
        Err(TransportError::IoFailure(_))
    ));
}
