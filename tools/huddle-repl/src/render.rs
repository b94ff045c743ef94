use huddle::mesh::{MediaStream, ParticipantId, ParticipantRecord, RenderSink};

/// Prints what a video grid would show
pub struct LogRender;

impl RenderSink for LogRender {
    fn render(
        &self,
        participant_id: &ParticipantId,
        stream: &MediaStream,
        display_name: &str,
        is_local: bool,
    ) {
        let origin = if is_local { "local" } else { "remote" };
        println!(
            "[view] {display_name} ({participant_id}, {origin}): {} audio / {} video",
            stream.audio_tracks().count(),
            stream.video_tracks().count()
        );
    }

    fn remove(&self, participant_id: &ParticipantId) {
        println!("[view] removed {participant_id}");
    }

    fn participants(&self, participants: &[ParticipantRecord]) {
        let names = participants
            .iter()
            .map(|p| {
                if p.is_admin {
                    format!("{} (admin)", p.display_name)
                } else {
                    p.display_name.clone()
                }
            })
            .collect::<Vec<_>>();
        tracing::debug!("participants: {}", names.join(", "));
    }
}
