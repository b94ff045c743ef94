use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use super::{MembershipSource, ParticipantRecord};
use crate::error::Error;

#[derive(Debug, Deserialize)]
struct ParticipantsResponse {
    #[serde(default)]
    participants: Vec<ParticipantRecord>,
}

/// Membership from the room service's JSON endpoint
/// (`GET {base}/api/room/{room_id}/participants/`)
#[derive(Debug, Clone)]
pub struct HttpMembership {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpMembership {
    pub fn new(base_url: &str) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .build()?;
        Self::with_client(client, base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Result<Self, Error> {
        let mut base_url = Url::parse(base_url)?;
        // relative joins would otherwise replace the last path segment
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn participants_url(&self, room_id: &str) -> Result<Url, Error> {
        Ok(self
            .base_url
            .join(&format!("api/room/{room_id}/participants/"))?)
    }

    pub fn leave_url(&self, room_id: &str) -> Result<Url, Error> {
        Ok(self.base_url.join(&format!("room/{room_id}/leave/"))?)
    }
}

#[async_trait]
impl MembershipSource for HttpMembership {
    async fn participants(&self, room_id: &str) -> Result<Vec<ParticipantRecord>, Error> {
        let endpoint = self.participants_url(room_id)?;
        let response = self
            .client
            .get(endpoint)
            .send()
            .await
            .map_err(|e| Error::MembershipFetchFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::MembershipFetchFailed(format!(
                "unexpected status {}",
                response.status()
            )));
        }
        let payload = response
            .json::<ParticipantsResponse>()
            .await
            .map_err(|e| Error::MembershipFetchFailed(e.to_string()))?;
        Ok(payload.participants)
    }

    async fn leave(&self, room_id: &str) -> Result<(), Error> {
        let endpoint = self.leave_url(room_id)?;
        let response = self.client.get(endpoint).send().await?;
        if !response.status().is_success() && !response.status().is_redirection() {
            return Err(Error::OtherWithContext(format!(
                "leave request returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{HttpMembership, ParticipantsResponse};

    #[test]
    fn endpoints_keep_base_path() -> anyhow::Result<()> {
        let membership = HttpMembership::new("http://localhost:8000/meet")?;
        assert_eq!(
            membership.participants_url("AB12CD")?.as_str(),
            "http://localhost:8000/meet/api/room/AB12CD/participants/"
        );
        assert_eq!(
            membership.leave_url("AB12CD")?.as_str(),
            "http://localhost:8000/meet/room/AB12CD/leave/"
        );
        Ok(())
    }

    #[test]
    fn rejects_invalid_base() {
        assert!(HttpMembership::new("not a url").is_err());
    }

    #[test]
    fn parses_room_service_payload() -> anyhow::Result<()> {
        let payload: ParticipantsResponse = serde_json::from_str(
            r#"{"participants": [
                {"user_id": "1", "name": "Ann", "is_admin": true},
                {"user_id": "2", "name": "Bob", "is_admin": false, "video_enabled": false}
            ]}"#,
        )?;
        assert_eq!(payload.participants.len(), 2);
        assert!(payload.participants[0].is_admin);
        assert!(!payload.participants[1].video_enabled);
        assert!(payload.participants[1].audio_enabled);

        let empty: ParticipantsResponse = serde_json::from_str("{}")?;
        assert!(empty.participants.is_empty());
        Ok(())
    }
}
