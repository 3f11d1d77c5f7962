use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use tokio::select;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::transport::{Channel, PeerTransport, ReceivedPacket, TransportError, TransportEvent};

/// Reads all packets that are currently pending on a channel, without waiting for more.
pub async fn drain_channel(transport: &dyn PeerTransport, channel: Channel) -> Result<Vec<ReceivedPacket>, TransportError> {
    let mut packets = Vec::new();
    while let Some(packet) = transport.poll_packet(channel).await? {
        packets.push(packet);
    }
    Ok(packets)
}

/// Runs `poll_cycle` repeatedly with `poll_interval` between cycles. A cycle is expected to drain
///  and dispatch everything that is pending, and to return [ControlFlow::Break] once its owning
///  session is no longer active.
///
/// The loop also terminates on a message through `cancel`, or when the transport becomes
///  unavailable - that is a regular way for the loop to end and is not reported further. Other
///  errors are logged, and polling continues.
pub async fn run_poll_loop<F, Fut>(name: &'static str, poll_interval: Duration, mut cancel: broadcast::Receiver<()>, mut poll_cycle: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<ControlFlow<()>, TransportError>>,
{
    debug!(name, "poll loop start");

    loop {
        match poll_cycle().await {
            Ok(ControlFlow::Continue(())) => {}
            Ok(ControlFlow::Break(())) => break,
            Err(TransportError::Unavailable) => {
                debug!(name, "transport was disposed");
                break;
            }
            Err(e) => {
                warn!(name, "error in poll cycle: {}", e);
            }
        }

        select! {
            _ = sleep(poll_interval) => {}
            _ = cancel.recv() => break,
        }
    }

    debug!(name, "poll loop stop");
}

/// Dispatches transport notifications to `on_event` until `cancel` fires, which releases the
///  subscription.
pub async fn run_transport_event_loop<F, Fut>(name: &'static str, mut transport_events: broadcast::Receiver<TransportEvent>, mut cancel: broadcast::Receiver<()>, mut on_event: F)
where
    F: FnMut(TransportEvent) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        select! {
            _ = cancel.recv() => break,
            event = transport_events.recv() => {
                match event {
                    Ok(event) => on_event(event).await,
                    Err(RecvError::Lagged(n)) => warn!(name, "missed {} transport events", n),
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    debug!(name, "stopped listening to transport events");
}


#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::time::Instant;

    use crate::transport::in_memory::InMemoryNetwork;
    use crate::transport::{DeliveryMode, PeerId};

    use super::*;

    #[tokio::test]
    async fn test_drain_channel() {
        let network = InMemoryNetwork::new();
        let a = network.endpoint(PeerId(1)).await;
        let b = network.endpoint(PeerId(2)).await;

        for data in [b"a", b"b", b"c"] {
            a.send_packet(PeerId(2), data, 1, DeliveryMode::Unreliable).await.unwrap();
        }
        a.send_packet(PeerId(2), b"other channel", 0, DeliveryMode::Reliable).await.unwrap();

        let drained = drain_channel(&b, 1).await.unwrap();
        assert_eq!(drained.iter().map(|p| p.data.as_ref()).collect::<Vec<&[u8]>>(), vec![&b"a"[..], &b"b"[..], &b"c"[..]]);
        assert!(drain_channel(&b, 1).await.unwrap().is_empty());
        assert_eq!(network.num_pending_packets(PeerId(2), 0).await, 1);

        b.shutdown();
        assert_eq!(drain_channel(&b, 1).await, Err(TransportError::Unavailable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycles_until_break() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (_cancel_sender, cancel) = broadcast::channel(1);

        let start = Instant::now();
        let cycle_counter = counter.clone();
        run_poll_loop("test", Duration::from_millis(10), cancel, move || {
            let counter = cycle_counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 4 {
                    Ok(ControlFlow::Break(()))
                }
                else {
                    Ok(ControlFlow::Continue(()))
                }
            }
        }).await;

        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(start.elapsed(), Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_quietly_when_transport_is_unavailable() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (_cancel_sender, cancel) = broadcast::channel(1);

        let cycle_counter = counter.clone();
        run_poll_loop("test", Duration::from_millis(10), cancel, move || {
            let counter = cycle_counter.clone();
            async move {
                match counter.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(TransportError::PacketTooLarge { len: 2, max: 1 }),
                    1 => Ok(ControlFlow::Continue(())),
                    _ => Err(TransportError::Unavailable),
                }
            }
        }).await;

        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_cancel() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (cancel_sender, cancel) = broadcast::channel(1);

        let cycle_counter = counter.clone();
        let handle = tokio::spawn(run_poll_loop("test", Duration::from_millis(10), cancel, move || {
            let counter = cycle_counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(ControlFlow::Continue(()))
            }
        }));

        sleep(Duration::from_millis(25)).await;
        cancel_sender.send(()).unwrap();
        handle.await.unwrap();

        let num_cycles = counter.load(Ordering::SeqCst);
        assert!(num_cycles >= 2 && num_cycles <= 4, "{} cycles", num_cycles);

        sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), num_cycles);
    }

    #[tokio::test]
    async fn test_transport_event_loop() {
        let (event_sender, transport_events) = broadcast::channel(8);
        let (cancel_sender, cancel) = broadcast::channel(1);
        let received = Arc::new(std::sync::Mutex::new(Vec::new()));

        let handler_received = received.clone();
        let handle = tokio::spawn(run_transport_event_loop("test", transport_events, cancel, move |event| {
            let received = handler_received.clone();
            async move {
                received.lock().unwrap().push(event);
            }
        }));

        event_sender.send(TransportEvent::SessionRequested(PeerId(5))).unwrap();
        event_sender.send(TransportEvent::SessionFailed { peer: PeerId(6), reason: "x".to_string() }).unwrap();
        sleep(Duration::from_millis(10)).await;

        cancel_sender.send(()).unwrap();
        handle.await.unwrap();

        assert_eq!(*received.lock().unwrap(), vec![
            TransportEvent::SessionRequested(PeerId(5)),
            TransportEvent::SessionFailed { peer: PeerId(6), reason: "x".to_string() },
        ]);
        // the subscription was released
        assert_eq!(event_sender.receiver_count(), 0);
    }
}
