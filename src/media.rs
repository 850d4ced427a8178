//! Local audio source.
//!
//! The participant's "microphone" is an Ogg/Opus file that is paced onto a
//! single outbound track. The same track is bound into every peer link.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::media::io::ogg_reader::OggReader;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::config::ClientConfig;
use crate::error::{Error, Result};

/// Opus always runs at 48 kHz.
const OPUS_CLOCK_RATE: u64 = 48_000;

pub struct LocalMedia {
    track: Arc<TrackLocalStaticSample>,
    pump: JoinHandle<()>,
}

impl LocalMedia {
    /// Acquires the configured capture source.
    pub fn acquire(config: &ClientConfig) -> Result<Self> {
        match config.audio_file.as_deref() {
            Some(path) => Self::from_ogg_file(path),
            None => Err(Error::MediaUnavailable(
                "no audio source configured".to_string(),
            )),
        }
    }

    pub fn from_ogg_file(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| Error::MediaUnavailable(format!("{}: {e}", path.display())))?;
        let (reader, header) = OggReader::new(BufReader::new(file), true)
            .map_err(|e| Error::MediaUnavailable(format!("{}: {e}", path.display())))?;
        info!(
            path = %path.display(),
            channels = header.channels,
            sample_rate = header.sample_rate,
            "Audio source opened"
        );

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            "voice-room".to_owned(),
        ));

        let pump = tokio::spawn(pump_pages(reader, Arc::clone(&track)));
        Ok(Self { track, pump })
    }

    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump_pages(mut reader: OggReader<BufReader<File>>, track: Arc<TrackLocalStaticSample>) {
    let mut last_granule: u64 = 0;
    let mut pages: u64 = 0;

    while let Ok((page, header)) = reader.parse_next_page() {
        let sample_count = header.granule_position.saturating_sub(last_granule);
        last_granule = header.granule_position;
        let duration = Duration::from_millis(sample_count * 1000 / OPUS_CLOCK_RATE);

        if let Err(e) = track
            .write_sample(&Sample {
                data: page.freeze(),
                duration,
                ..Default::default()
            })
            .await
        {
            warn!(error = %e, "Failed to write audio sample");
        }
        pages += 1;
        tokio::time::sleep(duration).await;
    }

    debug!(pages, "Audio source exhausted");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config(audio_file: Option<&str>) -> ClientConfig {
        ClientConfig {
            signaling_url: "ws://127.0.0.1:3000".to_string(),
            display_name: "alice".to_string(),
            audio_file: audio_file.map(PathBuf::from),
            ice_servers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_no_source_is_unavailable() {
        let result = LocalMedia::acquire(&config(None));
        assert!(matches!(result, Err(Error::MediaUnavailable(_))));
    }

    #[tokio::test]
    async fn test_missing_file_is_unavailable() {
        let result = LocalMedia::acquire(&config(Some("/nonexistent/voice-room/mic.ogg")));
        assert!(matches!(result, Err(Error::MediaUnavailable(_))));
    }

    #[tokio::test]
    async fn test_non_ogg_file_is_unavailable() {
        let path = std::env::temp_dir().join(format!("voice-room-not-ogg-{}.txt", std::process::id()));
        std::fs::write(&path, b"definitely not an ogg stream").unwrap();
        let result = LocalMedia::from_ogg_file(&path);
        let _ = std::fs::remove_file(&path);
        assert!(matches!(result, Err(Error::MediaUnavailable(_))));
    }
}
