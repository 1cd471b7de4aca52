//! Single rearmable wake-up timer for one session actor.
//!
//! At most one timer task is outstanding. When it fires it posts
//! [`SessionCommand::Alarm`] into the actor's own queue, so the sweep runs
//! serialized with everything else the actor does. The timer holds only a
//! weak sender and never keeps an actor alive.

use std::time::Duration;

use platewise_protocol::now_millis;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::session_command::SessionCommand;

struct ArmedTimer {
    due_at: u64,
    handle: JoinHandle<()>,
}

pub struct Alarm {
    wake_tx: mpsc::WeakSender<SessionCommand>,
    armed: Option<ArmedTimer>,
}

impl Alarm {
    pub fn new(wake_tx: mpsc::WeakSender<SessionCommand>) -> Self {
        Self {
            wake_tx,
            armed: None,
        }
    }

    /// Due time of the last timer set. A timer that already fired still
    /// counts until the sweep it triggered re-arms or disarms.
    pub fn armed_at(&self) -> Option<u64> {
        self.armed.as_ref().map(|t| t.due_at)
    }

    /// Replace the outstanding timer. `None` leaves the alarm unarmed.
    pub fn set(&mut self, due_at: Option<u64>) {
        self.disarm();
        let Some(due_at) = due_at else {
            return;
        };

        let wake_tx = self.wake_tx.clone();
        let delay = due_at.saturating_sub(now_millis());
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if let Some(tx) = wake_tx.upgrade() {
                let _ = tx.send(SessionCommand::Alarm).await;
            }
        });
        trace!(
            component = "alarm",
            event = "alarm.armed",
            due_at,
            delay_ms = delay,
            "Alarm armed"
        );
        self.armed = Some(ArmedTimer { due_at, handle });
    }

    /// Move the timer earlier if `due_at` precedes it; never later.
    pub fn arm_no_later_than(&mut self, due_at: u64) {
        match self.armed_at() {
            Some(current) if current <= due_at => {}
            _ => self.set(Some(due_at)),
        }
    }

    pub fn disarm(&mut self) {
        if let Some(timer) = self.armed.take() {
            timer.handle.abort();
        }
    }
}

impl Drop for Alarm {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fires_alarm_command_when_due() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut alarm = Alarm::new(tx.downgrade());

        alarm.set(Some(now_millis() + 20));
        let cmd = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(cmd, SessionCommand::Alarm));
    }

    #[tokio::test]
    async fn only_earlier_due_time_rearms() {
        let (tx, _rx) = mpsc::channel(4);
        let mut alarm = Alarm::new(tx.downgrade());
        let base = now_millis() + 60_000;

        alarm.arm_no_later_than(base);
        assert_eq!(alarm.armed_at(), Some(base));

        alarm.arm_no_later_than(base + 1_000);
        assert_eq!(alarm.armed_at(), Some(base));

        alarm.arm_no_later_than(base - 1_000);
        assert_eq!(alarm.armed_at(), Some(base - 1_000));
    }

    #[tokio::test]
    async fn disarm_cancels_outstanding_timer() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut alarm = Alarm::new(tx.downgrade());

        alarm.set(Some(now_millis() + 20));
        alarm.disarm();
        assert_eq!(alarm.armed_at(), None);

        let fired = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(fired.is_err(), "disarmed alarm must not fire");
    }

    #[tokio::test]
    async fn past_due_time_fires_immediately() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut alarm = Alarm::new(tx.downgrade());

        alarm.set(Some(now_millis().saturating_sub(5_000)));
        let cmd = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert!(matches!(cmd, Some(SessionCommand::Alarm)));
        assert!(alarm.armed_at().is_some(), "fired timer stays reported until re-armed");
    }
}
