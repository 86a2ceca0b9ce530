use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError};

// chrono prints up to 9 fractional digits by default, and plenty of ISO 8601
// readers stop at 6
pub const ISO_8601_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f%:z";

pub fn serialize_time<S>(
    this: &chrono::DateTime<chrono::Local>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::ser::Serializer,
{
    serializer.collect_str(&this.format(ISO_8601_FORMAT))
}

/// Extension trait for broadcast receivers.
#[async_trait]
pub trait ReceiverExt<T: Clone + Send> {
    /// Next available value, skipping over anything lost to lag. `None` once
    /// the channel is closed.
    async fn recv_skip(&mut self) -> Option<T>;
}

#[async_trait]
impl<T: Clone + Send> ReceiverExt<T> for broadcast::Receiver<T> {
    async fn recv_skip(&mut self) -> Option<T> {
        loop {
            match self.recv().await {
                Ok(message) => break Some(message),
                Err(RecvError::Lagged(skipped)) => {
                    trace!("receiver lagged, skipped {skipped} messages");
                    continue;
                }
                Err(RecvError::Closed) => break None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recv_skip_survives_lag() {
        let (tx, mut rx) = broadcast::channel(2);
        for i in 0..5 {
            tx.send(i).unwrap();
        }

        // the first three were overwritten
        assert_eq!(rx.recv_skip().await, Some(3));
        assert_eq!(rx.recv_skip().await, Some(4));

        drop(tx);
        assert_eq!(rx.recv_skip().await, None);
    }

    #[test]
    fn time_has_microsecond_precision() {
        use chrono::TimeZone;

        let t = chrono::Local.timestamp_opt(0, 123_456_789).unwrap();
        let mut out = Vec::new();
        let mut ser = serde_json::Serializer::new(&mut out);
        serialize_time(&t, &mut ser).unwrap();

        let s = String::from_utf8(out).unwrap();
        assert!(s.contains(".123456"), "{s}");
        assert!(!s.contains(".1234567"), "{s}");
    }
}
