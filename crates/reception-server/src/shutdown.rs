//! Process-wide cooperative stop signal.

use tokio::sync::watch;

pub struct ShutdownTrigger(watch::Sender<bool>);

impl ShutdownTrigger {
    pub fn trigger(&self) {
        // send_replace succeeds even with no receiver left
        self.0.send_replace(true);
    }
}

#[derive(Clone)]
pub struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the trigger fires (or its owner is gone).
    pub async fn triggered(&mut self) {
        let _ = self.0.wait_for(|stopped| *stopped).await;
    }
}

pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger(tx), Shutdown(rx))
}
