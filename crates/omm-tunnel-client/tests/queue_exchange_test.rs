/// Integration test for two dispatch drivers exchanging queue messages
///
/// The consumer driver carries a producer; the provider end accepts the
/// tunnel, answers the queue request and acknowledges every message.
use std::time::Duration;

use omm_tunnel_client::{
    ClientConfig, QueueMsgProducer, QueuePayload, Reactor, ReactorDriver, ReactorEvent,
    TunnelSessionConfig,
};
use omm_tunnel_proto::{AckOutcome, DirectoryUpdate, ServiceEntry, ServiceState};
use omm_tunnel_transport::MemoryTransport;

#[tokio::test(start_paused = true)]
async fn test_producer_messages_delivered_and_acked() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let config = ClientConfig::from_yaml(
        r#"
tunnel:
  name: QueueConsumer
  service_name: DIRECT_FEED
  queue_source_name: QUEUE_A
producer:
  destinations: [QUEUE_B]
  period: 2
"#,
    )
    .unwrap();

    let (a, b) = MemoryTransport::pair();
    let mut consumer = Reactor::consumer(a);
    consumer.on_directory_update(&DirectoryUpdate::new(vec![ServiceEntry::add(7, "DIRECT_FEED")
        .with_capabilities(vec![199])
        .with_state(ServiceState::Up, Some(true))]));

    let (consumer_handle, mut consumer_events) =
        ReactorDriver::new(consumer, config.dispatch_interval)
            .with_producer(QueueMsgProducer::new(&config.producer))
            .spawn();
    let (provider_handle, mut provider_events) =
        ReactorDriver::new(Reactor::provider(b), config.dispatch_interval).spawn();

    let tunnel = config.tunnel.clone();
    let stream_id = consumer_handle
        .call(move |reactor, now| reactor.open(tunnel, now))
        .await
        .unwrap()
        .unwrap();

    let provider = tokio::spawn(async move {
        let mut received = Vec::new();
        while let Some(event) = provider_events.recv().await {
            match event {
                ReactorEvent::TunnelRequest(request) => {
                    let config = TunnelSessionConfig::builder()
                        .name("QueueProvider")
                        .queue_capable(true)
                        .build()
                        .unwrap();
                    provider_handle
                        .call(move |reactor, _| reactor.accept(request.stream_id, config))
                        .await
                        .unwrap()
                        .unwrap();
                }
                ReactorEvent::QueueData { data, .. } => {
                    let payload: QueuePayload = serde_json::from_slice(&data.payload).unwrap();
                    println!("received #{} sequence {}", data.identifier, payload.sequence);
                    received.push((data.identifier, payload.sequence));
                    if received.len() == 3 {
                        break;
                    }
                }
                _ => {}
            }
        }
        (provider_handle, received)
    });

    let (provider_handle, received) = tokio::time::timeout(Duration::from_secs(60), provider)
        .await
        .expect("provider did not receive three messages")
        .unwrap();
    assert_eq!(received, vec![(1, 1), (2, 2), (3, 3)]);

    let mut acked = Vec::new();
    while acked.len() < 3 {
        let event = tokio::time::timeout(Duration::from_secs(10), consumer_events.recv())
            .await
            .expect("consumer did not receive acknowledgements")
            .expect("consumer driver stopped");
        if let ReactorEvent::QueueAck { ack, .. } = event {
            assert_eq!(ack.outcome, AckOutcome::Ack);
            acked.push(ack.identifier);
        }
    }
    assert_eq!(acked, vec![1, 2, 3]);

    let consumer = consumer_handle.shutdown().await.unwrap();
    let session = consumer.session(stream_id).unwrap();
    assert!(session.queue().last_identifier() >= 3);
    provider_handle.shutdown().await.unwrap();
}
