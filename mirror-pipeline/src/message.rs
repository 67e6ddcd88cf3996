use std::{fmt, sync::Arc};

/// Posts events of type `E` into another actor's mailbox.
///
/// The receiving side decides how an event is wrapped into its own message
/// type, so a producer only needs to know the event it emits.
pub struct Notify<E> {
    post: Arc<dyn Fn(E) -> bool + Send + Sync>,
}

impl<E> Clone for Notify<E> {
    fn clone(&self) -> Self {
        Self {
            post: Arc::clone(&self.post),
        }
    }
}

impl<E> fmt::Debug for Notify<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Notify")
    }
}

impl<E: 'static> Notify<E> {
    pub fn new(post: impl Fn(E) -> bool + Send + Sync + 'static) -> Self {
        Self {
            post: Arc::new(post),
        }
    }

    /// Targets an async actor's mailbox.
    pub fn from_unbounded<M: Send + 'static>(
        tx: tokio::sync::mpsc::UnboundedSender<M>,
        map: impl Fn(E) -> M + Send + Sync + 'static,
    ) -> Self {
        Self::new(move |event| tx.send(map(event)).is_ok())
    }

    /// Targets a blocking worker's mailbox.
    pub fn from_std<M: Send + 'static>(
        tx: std::sync::mpsc::Sender<M>,
        map: impl Fn(E) -> M + Send + Sync + 'static,
    ) -> Self {
        Self::new(move |event| tx.send(map(event)).is_ok())
    }

    /// Returns false when the target mailbox is closed.
    pub fn post(&self, event: E) -> bool {
        (self.post)(event)
    }
}

/// Microseconds since the unix epoch.
pub fn now_us() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}
