mod common;

#[cfg(test)]
mod test {
    use std::{sync::atomic::Ordering, time::Duration};

    use huddle::{
        config::Config,
        mesh::{MeshEventKind, ParticipantRecord},
    };

    use crate::common::{members, settle, Harness, ROOM};

    #[tokio::test(start_paused = true)]
    async fn opens_connections_to_missing_members() -> anyhow::Result<()> {
        let h = Harness::new("b");
        h.controller.join().await?;

        let initiated = h.controller.reconcile(members(&["a", "b", "c"])).await?;
        let initiated = initiated.iter().map(|p| p.as_str()).collect::<Vec<_>>();

        assert_eq!(initiated, vec!["a", "c"]);
        assert_eq!(h.broker.calls_to("a"), 1);
        assert_eq!(h.broker.calls_to("c"), 1);
        assert_eq!(h.broker.calls_to("b"), 0);

        let second = h.controller.reconcile(members(&["a", "b", "c"])).await?;
        assert!(second.is_empty());
        assert_eq!(h.broker.call_count(), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn call_metadata_names_both_sides() -> anyhow::Result<()> {
        let h = Harness::new("b");
        h.controller.join().await?;
        h.controller.reconcile(members(&["a"])).await?;

        let calls = h.broker.calls.lock().clone();
        let (peer, metadata) = &calls[0];
        assert_eq!(peer.as_str(), "a");
        assert_eq!(metadata.user_name.as_deref(), Some("user a"));
        assert_eq!(metadata.caller_name.as_deref(), Some("user b"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_ids_open_one_connection() -> anyhow::Result<()> {
        let h = Harness::new("b");
        h.controller.join().await?;

        h.controller
            .reconcile(members(&["a", "a", "c", "a"]))
            .await?;
        assert_eq!(h.broker.calls_to("a"), 1);
        assert_eq!(h.broker.call_count(), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn absent_members_keep_their_connection() -> anyhow::Result<()> {
        let h = Harness::new("b");
        h.controller.join().await?;

        h.controller.reconcile(members(&["a", "c"])).await?;
        h.controller.reconcile(members(&["b"])).await?;

        let peers = h.controller.connected_peers().await?;
        assert_eq!(peers.len(), 2);
        assert!(!h.broker.opened_to("a").map(|c| c.is_closed()).unwrap_or(true));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn never_calls_self() -> anyhow::Result<()> {
        let h = Harness::new("b");
        h.controller.join().await?;

        assert!(h.controller.reconcile(members(&["b"])).await?.is_empty());
        assert!(!h.controller.initiate("b", "me").await?);
        assert_eq!(h.broker.call_count(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_requires_joined() -> anyhow::Result<()> {
        let h = Harness::new("b");
        assert!(h.controller.reconcile(members(&["a"])).await.is_err());
        assert_eq!(h.broker.call_count(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn poller_drives_reconciliation() -> anyhow::Result<()> {
        let h = Harness::new("b");
        h.membership.set(members(&["a", "b", "c"]));

        h.controller.join().await?;
        settle().await;
        assert_eq!(h.broker.call_count(), 2);
        assert_eq!(h.membership.fetches.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.membership.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(h.broker.call_count(), 2);

        h.membership.set(members(&["a", "b", "c", "d"]));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.broker.calls_to("d"), 1);
        assert_eq!(h.broker.call_count(), 3);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_failures_are_retried_next_tick() -> anyhow::Result<()> {
        let mut h = Harness::new("b");
        h.membership.set(members(&["a", "b"]));
        h.membership.offline.store(true, Ordering::SeqCst);

        h.controller.join().await?;
        settle().await;
        assert_eq!(h.broker.call_count(), 0);
        assert!(h
            .drain_events()
            .iter()
            .any(|e| matches!(e, MeshEventKind::MembershipFetchFailed { .. })));

        h.membership.offline.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.broker.calls_to("a"), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn participant_list_reaches_render_sink() -> anyhow::Result<()> {
        let mut h = Harness::new("b");
        h.membership.set(members(&["a", "b"]));

        h.controller.join().await?;
        settle().await;

        let lists = h.render.lists.lock().clone();
        assert_eq!(lists.len(), 1);
        assert_eq!(lists[0].len(), 2);
        assert!(h
            .drain_events()
            .iter()
            .any(|e| matches!(e, MeshEventKind::MembershipUpdated { participants } if participants.len() == 2)));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_polls_immediately() -> anyhow::Result<()> {
        let mut config = Config::testing(ROOM, "b", "user b");
        *config.poll_interval_mut() = Duration::from_secs(3600);
        let h = Harness::with_config(config);

        h.controller.join().await?;
        settle().await;
        assert_eq!(h.membership.fetches.load(Ordering::SeqCst), 1);

        h.membership.set(vec![ParticipantRecord::new("a", "Ann")]);
        h.controller.refresh();
        settle().await;
        assert_eq!(h.membership.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(h.broker.calls_to("a"), 1);
        Ok(())
    }
}
