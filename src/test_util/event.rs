use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::timeout;

/// returns all events that are buffered in the receiver, without waiting for more
pub fn drain_events<E: Clone>(receiver: &mut broadcast::Receiver<E>) -> Vec<E> {
    let mut result = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(evt) => result.push(evt),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    result
}

/// waits for the next event, returning `None` if there is none within the timeout
pub async fn next_event<E: Clone>(receiver: &mut broadcast::Receiver<E>, max_wait: Duration) -> Option<E> {
    match timeout(max_wait, receiver.recv()).await {
        Ok(Ok(evt)) => Some(evt),
        _ => None,
    }
}
