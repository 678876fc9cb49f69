use std::sync::Arc;
use tokio::sync::watch;

/// Sender half of the stop signal. Cloning shares the same channel.
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn request_stop(&self) {
        // An error only means every receiver is gone.
        let _ = self.tx.send(true);
    }

    pub fn is_stopping(&self) -> bool {
        *self.tx.borrow()
    }
}

pub fn stop_channel() -> (StopHandle, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx: Arc::new(tx) }, rx)
}

/// First Ctrl-C asks the loop to flatten and exit; a second one aborts.
pub fn spawn_signal_listener(handle: StopHandle) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            log::error!("[SHUTDOWN] failed to listen for Ctrl-C: {:?}", err);
            return;
        }
        log::warn!("[SHUTDOWN] signal received; flattening before exit (Ctrl-C again to abort)");
        handle.request_stop();

        if tokio::signal::ctrl_c().await.is_ok() {
            log::error!("[SHUTDOWN] second signal received; exiting without flatten");
            std::process::exit(130);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_request_reaches_receivers() {
        let (handle, mut rx) = stop_channel();
        assert!(!handle.is_stopping());
        let clone = handle.clone();
        clone.request_stop();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(handle.is_stopping());
    }
}
