#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use axum::{extract::Path, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
    use huddle::{
        error::Error,
        mesh::{HttpMembership, MembershipSource},
    };
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn spawn_room_service(leaves: Arc<AtomicUsize>) -> anyhow::Result<String> {
        let router = Router::new()
            .route(
                "/api/room/:room_id/participants/",
                get(|Path(room_id): Path<String>| async move {
                    if room_id != "ABC123" {
                        return (StatusCode::NOT_FOUND, "no such room").into_response();
                    }
                    Json(json!({
                        "participants": [
                            {"user_id": "1", "name": "Ann", "is_admin": true},
                            {"user_id": "2", "name": "Bob", "is_admin": false}
                        ]
                    }))
                    .into_response()
                }),
            )
            .route(
                "/room/:room_id/leave/",
                get(move || {
                    let leaves = leaves.clone();
                    async move {
                        leaves.fetch_add(1, Ordering::SeqCst);
                        StatusCode::OK
                    }
                }),
            );

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        Ok(format!("http://{addr}"))
    }

    #[tokio::test]
    async fn fetches_participants() -> anyhow::Result<()> {
        let base = spawn_room_service(Arc::default()).await?;
        let membership = HttpMembership::new(&base)?;

        let participants = membership.participants("ABC123").await?;
        assert_eq!(participants.len(), 2);
        assert_eq!(participants[0].id.as_str(), "1");
        assert_eq!(participants[0].display_name, "Ann");
        assert!(participants[0].is_admin);
        assert!(participants[1].video_enabled);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_room_is_a_fetch_failure() -> anyhow::Result<()> {
        let base = spawn_room_service(Arc::default()).await?;
        let membership = HttpMembership::new(&base)?;

        let result = membership.participants("ZZZ999").await;
        assert!(matches!(result, Err(Error::MembershipFetchFailed(_))));
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_service_is_a_fetch_failure() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        drop(listener);

        let membership = HttpMembership::new(&format!("http://{addr}"))?;
        let result = membership.participants("ABC123").await;
        assert!(matches!(result, Err(Error::MembershipFetchFailed(_))));
        Ok(())
    }

    #[tokio::test]
    async fn leave_hits_exit_endpoint() -> anyhow::Result<()> {
        let leaves = Arc::new(AtomicUsize::new(0));
        let base = spawn_room_service(leaves.clone()).await?;
        let membership = HttpMembership::new(&base)?;

        membership.leave("ABC123").await?;
        assert_eq!(leaves.load(Ordering::SeqCst), 1);
        Ok(())
    }
}
