use std::time::Duration;
use tokio::sync::watch;

/// Receiving side of a stop flag shared by the scheduler and backfill workers.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn channel() -> (watch::Sender<bool>, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (tx, ShutdownSignal { rx })
    }

    /// A signal that is never raised.
    pub fn never() -> Self {
        Self::channel().1
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Sleep for `duration`, waking early when the flag is raised.
    /// Returns true if stopped.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }

        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return self.is_stopped(),
                changed = self.rx.changed() => match changed {
                    Ok(()) => {
                        if self.is_stopped() {
                            return true;
                        }
                    }
                    // Sender gone: nobody can stop us any more
                    Err(_) => {
                        (&mut sleep).await;
                        return self.is_stopped();
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn wakes_early_on_stop() {
        let (tx, mut signal) = ShutdownSignal::channel();
        let sleeper = tokio::spawn(async move { signal.sleep(Duration::from_secs(3600)).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();
        assert!(sleeper.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn never_sleeps_full_duration() {
        let mut signal = ShutdownSignal::never();
        let start = tokio::time::Instant::now();
        assert!(!signal.sleep(Duration::from_secs(5)).await);
        assert!(start.elapsed() >= Duration::from_secs(5));
    }
}
