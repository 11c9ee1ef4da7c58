use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default)]
struct GateState {
    armed: bool,
    /// Number of resumes so far. A waiter is released once it changes, even if the gate was
    /// armed again before the waiter got to run.
    resumes: u64,
}

/// Process-wide, single-slot pause signal for dumps.
///
/// While armed, every dump blocks before reading its next document. Arming an armed gate is a
/// no-op and a single [`PauseGate::resume`] releases every dump waiting at that moment. Clones
/// share the same slot.
#[derive(Debug, Clone)]
pub struct PauseGate {
    state: Arc<watch::Sender<GateState>>,
}

impl PauseGate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(GateState::default());
        Self {
            state: Arc::new(state),
        }
    }

    /// Arms the gate. Returns `false` when a pause was already outstanding.
    pub fn pause(&self) -> bool {
        self.state.send_if_modified(|state| {
            if state.armed {
                false
            } else {
                state.armed = true;
                true
            }
        })
    }

    /// Releases the gate. Returns `false` when no pause was outstanding.
    pub fn resume(&self) -> bool {
        self.state.send_if_modified(|state| {
            if state.armed {
                state.armed = false;
                state.resumes += 1;
                true
            } else {
                false
            }
        })
    }

    pub fn is_paused(&self) -> bool {
        self.state.borrow().armed
    }

    /// Waits for the next resume; returns immediately when the gate is not armed.
    pub async fn wait_until_resumed(&self) {
        let mut state_rx = self.state.subscribe();
        let seen = *state_rx.borrow_and_update();
        if !seen.armed {
            return;
        }

        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = state_rx
            .wait_for(|state| state.resumes != seen.resumes)
            .await;
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn repeated_pauses_behave_as_one() {
        let gate = PauseGate::new();

        assert!(gate.pause());
        assert!(!gate.pause());
        assert!(gate.is_paused());

        assert!(gate.resume());
        assert!(!gate.resume());
        assert!(!gate.is_paused());
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_not_paused() {
        let gate = PauseGate::new();

        tokio::time::timeout(Duration::from_millis(50), gate.wait_until_resumed())
            .await
            .expect("an unarmed gate must not block");
    }

    #[tokio::test(start_paused = true)]
    async fn resume_releases_every_waiter() {
        let gate = PauseGate::new();
        gate.pause();

        let released = Arc::new(AtomicUsize::new(0));
        let mut waiters = Vec::new();
        for _ in 0..3 {
            let gate = gate.clone();
            let released = released.clone();
            waiters.push(tokio::spawn(async move {
                gate.wait_until_resumed().await;
                released.fetch_add(1, Ordering::SeqCst);
            }));
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(released.load(Ordering::SeqCst), 0);

        gate.resume();
        for waiter in waiters {
            waiter.await.unwrap();
        }
        assert_eq!(released.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_releases_waiters_even_when_paused_again() {
        let gate = PauseGate::new();
        gate.pause();

        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.wait_until_resumed().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(gate.resume());
        assert!(gate.pause());

        tokio::time::timeout(Duration::from_secs(60), waiter)
            .await
            .expect("the resume must release the waiter")
            .unwrap();
        assert!(gate.is_paused());

        // Waiters arriving after the new pause stay blocked.
        let late = tokio::time::timeout(Duration::from_secs(60), gate.wait_until_resumed()).await;
        assert!(late.is_err());
    }
}
