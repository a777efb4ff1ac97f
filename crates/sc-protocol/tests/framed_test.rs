use futures_util::{SinkExt, StreamExt};
use sc_protocol::{Frame, FrameCodec, ProtocolError, TerminalSignal};
use tokio::io::AsyncWriteExt;
use tokio_util::codec::{FramedRead, FramedWrite};

#[tokio::test]
async fn frames_survive_a_byte_stream() {
    let (client, server) = tokio::io::duplex(64);
    let mut writer = FramedWrite::new(client, FrameCodec::default());
    let mut reader = FramedRead::new(server, FrameCodec::default());

    let frames = vec![
        Frame::input(vec![b'x'; 1000]),
        Frame::resize(40, 120),
        Frame::signal(TerminalSignal::Interrupt),
        Frame::ping(&b"hb"[..]),
        Frame::close("done"),
    ];

    let sent = frames.clone();
    let send = tokio::spawn(async move {
        for frame in sent {
            writer.send(frame).await.expect("send");
        }
    });

    for expected in &frames {
        let got = reader.next().await.expect("frame").expect("decode");
        assert_eq!(&got, expected);
    }
    send.await.expect("sender task");
}

#[tokio::test]
async fn byte_at_a_time_delivery() {
    let (mut client, server) = tokio::io::duplex(1);
    let mut reader = FramedRead::new(server, FrameCodec::default());

    let bytes = sc_protocol::encode(&Frame::input(&b"slow"[..])).expect("encode");
    tokio::spawn(async move {
        for b in bytes.iter() {
            client.write_all(&[*b]).await.expect("write");
        }
    });

    let got = reader.next().await.expect("frame").expect("decode");
    assert_eq!(got, Frame::input(&b"slow"[..]));
}

#[tokio::test]
async fn oversized_frame_ends_stream_with_error() {
    let (mut client, server) = tokio::io::duplex(64);
    let mut reader = FramedRead::new(server, FrameCodec::new(16));

    client
        .write_all(&[0x02, 0, 0, 1, 0])
        .await
        .expect("write header");

    let err = reader.next().await.expect("item").unwrap_err();
    assert!(matches!(err, ProtocolError::FrameTooLarge { len: 256, max: 16, .. }));
}
