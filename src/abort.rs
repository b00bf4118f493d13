use tokio::sync::watch;

/// Owner side of a cooperative stop signal.
#[derive(Debug)]
pub struct AbortHandle {
    sender: watch::Sender<bool>,
}

/// Observer side, cloned into every worker and request.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    receiver: watch::Receiver<bool>,
}

impl AbortHandle {
    pub fn new() -> (Self, AbortSignal) {
        let (sender, receiver) = watch::channel(false);
        (Self { sender }, AbortSignal { receiver })
    }

    pub fn abort(&self) {
        self.sender.send_replace(true);
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            receiver: self.sender.subscribe(),
        }
    }
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_, receiver) = watch::channel(false);
        Self { receiver }
    }

    pub fn is_aborted(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once the signal fires. Pending forever if the handle was
    /// dropped without aborting.
    pub async fn aborted(&self) {
        let mut receiver = self.receiver.clone();
        if receiver.wait_for(|aborted| *aborted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
