use tokio::task::JoinHandle;

/// Guard that aborts a spawned worker when dropped.
///
/// The dispatcher keeps one guard per worker so that dropping an in-progress
/// dispatch future tears the whole pool down with it.
pub(crate) struct AbortGuard<T> {
    handle: Option<JoinHandle<T>>,
}

impl<T> AbortGuard<T> {
    pub fn new(handle: JoinHandle<T>) -> Self {
        Self {
            handle: Some(handle),
        }
    }
}

impl<T> Drop for AbortGuard<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn aborts_worker_on_drop() {
        let (tx, rx) = oneshot::channel::<()>();
        {
            let _guard = AbortGuard::new(tokio::spawn(async move {
                let _ = rx.await;
            }));
        }
        tokio::task::yield_now().await;
        assert!(tx.send(()).is_err());
    }
}
