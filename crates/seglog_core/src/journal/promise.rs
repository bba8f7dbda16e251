//! Set-once, read-many completion cell.

use tokio::sync::watch;

/// Producer side of a shared completion.
///
/// Every future taken from the promise resolves to the same value once
/// [`SharedPromise::set_value`] is called. Dropping the promise without a
/// value resolves every future to `None`.
#[derive(Debug)]
pub(crate) struct SharedPromise<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> SharedPromise<T> {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Resolves every outstanding and future waiter.
    pub(crate) fn set_value(&self, value: T) {
        self.tx.send_replace(Some(value));
    }

    pub(crate) fn get_shared_future(&self) -> SharedFuture<T> {
        SharedFuture {
            rx: self.tx.subscribe(),
        }
    }
}

/// Consumer side of a [`SharedPromise`].
#[derive(Debug)]
pub(crate) struct SharedFuture<T> {
    rx: watch::Receiver<Option<T>>,
}

impl<T: Clone> SharedFuture<T> {
    /// Waits for the value, or `None` if the promise was dropped unset.
    pub(crate) async fn wait(mut self) -> Option<T> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        }
    }
}
