mod common;

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tether::bridge::codec::JsonCodec;
use tether::bridge::protocol::{BufferRef, ChannelId, EnvCheck, Envelope, Message};
use tether::transport::framed;
use tether::{
    ConnectionError, ConnectionStatus, ErrorValue, ExposeConfig, Function, PlatformCapabilities,
    ReadableStream, Value, expose,
};
use tokio::net::UnixStream;
use tokio_util::codec::FramedWrite;
use uuid::Uuid;

use common::{connect_over, init_tracing, settled};

#[tokio::test]
async fn functions_and_streams_over_a_socket() {
    let (a, b) = UnixStream::pair().unwrap();
    let api = Value::object([
        (
            "greet",
            Value::from(Function::new(|args: Vec<Value>| async move {
                let name = args.first().and_then(Value::as_str).unwrap_or("nobody");
                Ok::<_, ErrorValue>(Value::from(format!("hello, {name}")))
            })),
        ),
        (
            "numbers",
            ReadableStream::from_values((0..5).map(Value::from)).into(),
        ),
        ("blob", bytes::Bytes::from_static(b"\xffraw").into()),
    ]);
    let (mut left, right) = connect_over(Value::Null, api, framed(a), framed(b)).await;

    assert_eq!(left.connection.capabilities(), PlatformCapabilities::JSON_ONLY);

    let greet = left.remote.get("greet").and_then(Value::as_function).unwrap();
    let greeting = greet.call(vec!["tether".into()]).await.unwrap();
    assert_eq!(greeting.as_str(), Some("hello, tether"));

    let blob = left.remote.get("blob").and_then(Value::as_bytes).unwrap();
    assert_eq!(&blob[..], &b"\xffraw"[..]);

    let numbers = left.remote.take("numbers").and_then(Value::into_stream).unwrap();
    let numbers: Vec<_> = numbers.collect().await;
    assert_eq!(numbers.len(), 5);

    drop(left.remote);
    settled(&left.connection, &right.connection).await;
}

#[tokio::test]
async fn peer_hangup_closes_the_connection() {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (left, right) = connect_over(Value::Null, Value::Null, framed(a), framed(b)).await;

    left.connection.close();
    assert_eq!(left.connection.closed().await, ConnectionStatus::Closed);
    drop(left);

    let status = tokio::time::timeout(Duration::from_secs(5), right.connection.closed())
        .await
        .expect("peer never noticed the hangup");
    assert_eq!(status, ConnectionStatus::Closed);
}

#[tokio::test]
async fn traffic_before_handshake_fails_expose() {
    init_tracing();
    let (a, b) = tokio::io::duplex(64 * 1024);
    let mut rogue = FramedWrite::new(b, JsonCodec::<Envelope>::new());
    let stranger = Uuid::new_v4();
    rogue
        .send(Envelope::new(
            "tether",
            stranger,
            Message::Data {
                port_id: ChannelId::new(stranger),
                data: serde_json::Value::Null,
            },
        ))
        .await
        .unwrap();

    let result = expose(Value::Null, framed(a), ExposeConfig::default()).await;
    assert!(matches!(result, Err(ConnectionError::Protocol(_))));
}

#[tokio::test]
async fn unknown_box_type_fails_expose() {
    init_tracing();
    let (a, b) = tokio::io::duplex(64 * 1024);
    let mut rogue = FramedWrite::new(b, JsonCodec::<Envelope>::new());
    let stranger = Uuid::new_v4();
    let env_check = EnvCheck {
        buffer: BufferRef::Base64(String::new()),
        port: None,
    };
    for message in [
        Message::Ready { env_check },
        Message::Init {
            data: serde_json::json!({"__marker__": "revivable", "type": "weakRef"}),
        },
    ] {
        rogue
            .send(Envelope::new("tether", stranger, message))
            .await
            .unwrap();
    }

    let result = expose(Value::Null, framed(a), ExposeConfig::default()).await;
    assert!(matches!(result, Err(ConnectionError::Revive(_))));
}
