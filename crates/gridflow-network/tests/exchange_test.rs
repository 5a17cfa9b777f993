//! End-to-end exchange tests over a real TCP connection: a producer task
//! filling a result partition, the data server draining it under
//! credit-based flow control, and a consumer speaking the wire protocol.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use gridflow_core::{
    DataType, EventKind, InputChannelId, NetworkConfig, ResultPartitionId, SubpartitionIndexSet,
};
use gridflow_network::{
    DataServer, DataServerConfig, ErrorKind, LocalPartitionProvider, Message, MessageCodec,
};
use gridflow_partition::{BoundedStorageKind, ResultPartition, ResultPartitionType};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::codec::Framed;

type Client = Framed<TcpStream, MessageCodec>;

struct TestExchange {
    addr: SocketAddr,
    provider: Arc<LocalPartitionProvider>,
    _shutdown: oneshot::Sender<()>,
}

async fn start_exchange() -> TestExchange {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let provider = Arc::new(LocalPartitionProvider::new());
    let server = DataServer::bind(
        DataServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
        },
        provider.clone(),
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(server.run_until(shutdown_rx));
    TestExchange {
        addr,
        provider,
        _shutdown: shutdown_tx,
    }
}

/// A pipelined partition whose pages hold exactly one 8-byte value, so
/// every record becomes its own buffer.
async fn register_pipelined_partition(exchange: &TestExchange) -> Arc<ResultPartition> {
    let config = NetworkConfig {
        page_size: 8,
        buffers_per_pool: 64,
        ..Default::default()
    };
    let partition = Arc::new(
        ResultPartition::new(
            ResultPartitionId::new(),
            ResultPartitionType::Pipelined,
            1,
            BoundedStorageKind::FileChannel,
            &config,
        )
        .unwrap(),
    );
    exchange.provider.register(partition.clone()).await;
    partition
}

async fn connect(addr: SocketAddr) -> Client {
    let stream = TcpStream::connect(addr).await.unwrap();
    Framed::new(stream, MessageCodec::new())
}

async fn next_message(client: &mut Client) -> Message {
    tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for message")
        .expect("connection closed")
        .expect("decode error")
}

async fn expect_silence(client: &mut Client) {
    let result = tokio::time::timeout(Duration::from_millis(150), client.next()).await;
    assert!(result.is_err(), "expected no message, got {result:?}");
}

#[tokio::test]
async fn test_credit_based_exchange_roundtrip() {
    let exchange = start_exchange().await;
    let partition = register_pipelined_partition(&exchange).await;
    let receiver_id = InputChannelId::new();

    let mut client = connect(exchange.addr).await;
    client
        .send(Message::PartitionRequest {
            partition_id: partition.id(),
            subpartitions: SubpartitionIndexSet::single(0),
            receiver_id,
            initial_credit: 2,
        })
        .await
        .unwrap();

    for value in 0u64..5 {
        partition.append_record(0, &value.to_be_bytes()).await.unwrap();
    }
    partition.finish().await.unwrap();

    // Initial credit admits exactly two data buffers.
    for expected in 0u64..2 {
        match next_message(&mut client).await {
            Message::BufferResponse {
                receiver_id: rid,
                sequence_number,
                data_type,
                payload,
                ..
            } => {
                assert_eq!(rid, receiver_id);
                assert_eq!(sequence_number, expected);
                assert_eq!(data_type, DataType::Data);
                assert_eq!(payload.as_ref(), expected.to_be_bytes());
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
    // Credit exhausted: the producer must not send the remaining data.
    expect_silence(&mut client).await;

    client
        .send(Message::AddCredit {
            receiver_id,
            credit: 8,
        })
        .await
        .unwrap();

    let mut values = Vec::new();
    loop {
        match next_message(&mut client).await {
            Message::BufferResponse {
                sequence_number,
                data_type: DataType::Data,
                payload,
                ..
            } => {
                assert_eq!(sequence_number, 2 + values.len() as u64);
                values.push(u64::from_be_bytes(payload.as_ref().try_into().unwrap()));
            }
            Message::BufferResponse {
                data_type: DataType::Event,
                payload,
                backlog,
                sequence_number,
                ..
            } => {
                assert_eq!(EventKind::from_payload(&payload).unwrap(), EventKind::EndOfPartition);
                assert_eq!(backlog, -1);
                assert_eq!(sequence_number, 5);
                break;
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
    assert_eq!(values, vec![2, 3, 4]);

    // Ack completes the producer's termination future.
    client
        .send(Message::AckAllUserRecordsProcessed { receiver_id })
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), partition.all_data_processed())
        .await
        .expect("all_data_processed should resolve after ack");

    client.send(Message::CloseRequest { receiver_id }).await.unwrap();
}

#[tokio::test]
async fn test_event_delivered_at_zero_credit() {
    let exchange = start_exchange().await;
    let partition = register_pipelined_partition(&exchange).await;
    let receiver_id = InputChannelId::new();

    let mut client = connect(exchange.addr).await;
    client
        .send(Message::PartitionRequest {
            partition_id: partition.id(),
            subpartitions: SubpartitionIndexSet::single(0),
            receiver_id,
            initial_credit: 2,
        })
        .await
        .unwrap();

    partition.append_record(0, &1u64.to_be_bytes()).await.unwrap();
    partition.append_record(0, &2u64.to_be_bytes()).await.unwrap();
    partition.finish().await.unwrap();

    // Two data buffers drain the credit to zero...
    for _ in 0..2 {
        match next_message(&mut client).await {
            Message::BufferResponse {
                data_type: DataType::Data,
                ..
            } => {}
            other => panic!("unexpected message {other:?}"),
        }
    }
    // ...and the end-of-partition event still arrives.
    match next_message(&mut client).await {
        Message::BufferResponse {
            data_type: DataType::Event,
            payload,
            ..
        } => {
            assert_eq!(EventKind::from_payload(&payload).unwrap(), EventKind::EndOfPartition);
        }
        other => panic!("unexpected message {other:?}"),
    }
}

#[tokio::test]
async fn test_unknown_partition_is_receiver_scoped() {
    let exchange = start_exchange().await;
    let partition = register_pipelined_partition(&exchange).await;

    let mut client = connect(exchange.addr).await;
    let ghost_receiver = InputChannelId::new();
    client
        .send(Message::PartitionRequest {
            partition_id: ResultPartitionId::new(),
            subpartitions: SubpartitionIndexSet::single(0),
            receiver_id: ghost_receiver,
            initial_credit: 2,
        })
        .await
        .unwrap();

    match next_message(&mut client).await {
        Message::ErrorResponse {
            receiver_id,
            kind,
            ..
        } => {
            assert_eq!(receiver_id, Some(ghost_receiver));
            assert_eq!(kind, ErrorKind::PartitionNotFound);
        }
        other => panic!("unexpected message {other:?}"),
    }

    // The connection survives: a request for a real partition still works.
    let receiver_id = InputChannelId::new();
    client
        .send(Message::PartitionRequest {
            partition_id: partition.id(),
            subpartitions: SubpartitionIndexSet::single(0),
            receiver_id,
            initial_credit: 4,
        })
        .await
        .unwrap();
    partition.finish().await.unwrap();

    match next_message(&mut client).await {
        Message::BufferResponse {
            receiver_id: rid,
            data_type: DataType::Event,
            ..
        } => assert_eq!(rid, receiver_id),
        other => panic!("unexpected message {other:?}"),
    }
}

#[tokio::test]
async fn test_protocol_violation_is_connection_fatal() {
    use tokio::io::AsyncWriteExt;

    let exchange = start_exchange().await;
    let _partition = register_pipelined_partition(&exchange).await;

    let mut stream = TcpStream::connect(exchange.addr).await.unwrap();
    // A frame with a bogus magic value.
    stream
        .write_all(&[0, 0, 0, 3, 0xDE, 0xAD, 0x00])
        .await
        .unwrap();
    stream.flush().await.unwrap();

    let mut client = Framed::new(stream, MessageCodec::new());
    match next_message(&mut client).await {
        Message::ErrorResponse {
            receiver_id,
            kind,
            ..
        } => {
            assert_eq!(receiver_id, None, "fatal errors carry a nil receiver id");
            assert_eq!(kind, ErrorKind::ProtocolViolation);
        }
        other => panic!("unexpected message {other:?}"),
    }
    // The server hangs up after a fatal error.
    let eof = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for close");
    assert!(eof.is_none(), "expected EOF, got {eof:?}");
}

#[tokio::test]
async fn test_released_partition_surfaces_scoped_error_mid_stream() {
    let exchange = start_exchange().await;
    let partition = register_pipelined_partition(&exchange).await;
    let receiver_id = InputChannelId::new();

    let mut client = connect(exchange.addr).await;
    client
        .send(Message::PartitionRequest {
            partition_id: partition.id(),
            subpartitions: SubpartitionIndexSet::single(0),
            receiver_id,
            initial_credit: 8,
        })
        .await
        .unwrap();

    partition.append_record(0, &7u64.to_be_bytes()).await.unwrap();
    match next_message(&mut client).await {
        Message::BufferResponse { .. } => {}
        other => panic!("unexpected message {other:?}"),
    }

    partition.release();
    match next_message(&mut client).await {
        Message::ErrorResponse {
            receiver_id: rid,
            kind,
            ..
        } => {
            assert_eq!(rid, Some(receiver_id));
            assert_eq!(kind, ErrorKind::PartitionNotFound);
        }
        other => panic!("unexpected message {other:?}"),
    }
}
