use std::sync::Arc;

use super::{ConnectionTable, MediaTrack, ParticipantId, TrackKind, TrackSender, TrackSource};
use crate::error::Error;

/// Outcome of swapping the outgoing video on every connection
#[derive(Debug, Default)]
pub(crate) struct SwitchReport {
    pub replaced: Vec<ParticipantId>,
    pub failed: Vec<Error>,
}

async fn video_sender(senders: Vec<Arc<dyn TrackSender>>) -> Option<Arc<dyn TrackSender>> {
    for sender in senders {
        if sender.kind().await == Some(TrackKind::Video) {
            return Some(sender);
        }
    }
    None
}

/// Replaces the outgoing video track of every connection in `table` with
/// `track`. Connections that fail are reported and skipped
pub(crate) async fn replace_outgoing_video(
    table: &mut ConnectionTable,
    track: &Arc<dyn MediaTrack>,
    source: TrackSource,
) -> SwitchReport {
    let mut report = SwitchReport::default();

    for entry in table.iter_mut() {
        let peer = entry.peer_id().clone();
        let Some(sender) = video_sender(entry.connection().senders().await).await else {
            report.failed.push(Error::TrackReplaceFailed {
                peer,
                reason: "no video sender".into(),
            });
            continue;
        };

        match sender.replace_track(track.clone()).await {
            Ok(()) => {
                entry.set_outgoing_track_kind(source);
                report.replaced.push(peer);
            }
            Err(e) => report.failed.push(Error::TrackReplaceFailed {
                peer,
                reason: e.to_string(),
            }),
        }
    }

    report
}
