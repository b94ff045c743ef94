use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc::UnboundedSender, Notify},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use super::{MembershipSource, ParticipantRecord};

#[derive(Debug)]
pub(crate) enum PollEvent {
    Members(Vec<ParticipantRecord>),
    Failed(String),
}

/// Fetches membership on every tick (the first one immediately) and whenever
/// `refresh` is notified, until `token` is cancelled or the receiver is gone
pub(crate) fn spawn(
    membership: Arc<dyn MembershipSource>,
    room_id: String,
    interval: Duration,
    refresh: Arc<Notify>,
    token: CancellationToken,
    tx: UnboundedSender<PollEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = timer.tick() => {}
                _ = refresh.notified() => {
                    timer.reset();
                }
            }

            let result = tokio::select! {
                _ = token.cancelled() => break,
                result = membership.participants(&room_id) => result,
            };

            let event = match result {
                Ok(members) => PollEvent::Members(members),
                Err(e) => {
                    tracing::warn!("failed to fetch membership for room {room_id}: {e}");
                    PollEvent::Failed(e.to_string())
                }
            };

            if tx.send(event).is_err() {
                break;
            }
        }
        tracing::debug!("membership poller for room {room_id} stopped");
    })
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use tokio::sync::{mpsc, Notify};
    use tokio_util::sync::CancellationToken;

    use super::PollEvent;
    use crate::{
        error::Error,
        mesh::{MembershipSource, ParticipantRecord},
    };

    #[derive(Default)]
    struct Counting {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl MembershipSource for Counting {
        async fn participants(&self, _: &str) -> Result<Vec<ParticipantRecord>, Error> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst);
            if n == 1 {
                return Err(Error::MembershipFetchFailed("offline".into()));
            }
            Ok(vec![ParticipantRecord::new("a", "Ann")])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn polls_on_interval_and_survives_failures() -> anyhow::Result<()> {
        let source = Arc::new(Counting::default());
        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = super::spawn(
            source.clone(),
            "ROOM01".into(),
            Duration::from_secs(5),
            Arc::new(Notify::new()),
            token.clone(),
            tx,
        );

        assert!(matches!(rx.recv().await, Some(PollEvent::Members(m)) if m.len() == 1));
        assert!(matches!(rx.recv().await, Some(PollEvent::Failed(_))));
        assert!(matches!(rx.recv().await, Some(PollEvent::Members(_))));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 3);

        token.cancel();
        handle.await?;
        assert!(rx.recv().await.is_none());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_polls_immediately() -> anyhow::Result<()> {
        let source = Arc::new(Counting::default());
        let token = CancellationToken::new();
        let refresh = Arc::new(Notify::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = super::spawn(
            source.clone(),
            "ROOM01".into(),
            Duration::from_secs(3600),
            refresh.clone(),
            token.clone(),
            tx,
        );

        rx.recv().await;
        refresh.notify_one();
        let started = tokio::time::Instant::now();
        rx.recv().await;
        assert!(started.elapsed() < Duration::from_secs(1));

        token.cancel();
        Ok(())
    }
}
