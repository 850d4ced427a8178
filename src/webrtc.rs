use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::IceServer;
use crate::error::{Error, Result};
use crate::media::LocalMedia;
use crate::session::{EngineEvent, EngineFactory, RemoteMedia, SessionEngine};

/// Builds one `RTCPeerConnection` per remote participant, each carrying the
/// shared local audio track.
pub struct WebRtcFactory {
    api: API,
    config: RTCConfiguration,
    local_media: LocalMedia,
}

impl WebRtcFactory {
    pub fn new(local_media: LocalMedia, ice_servers: &[IceServer]) -> Result<Self> {
        // Create a MediaEngine object to configure the supported codec
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let api = APIBuilder::new().with_media_engine(media_engine).build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        Ok(Self {
            api,
            config,
            local_media,
        })
    }
}

#[async_trait]
impl EngineFactory for WebRtcFactory {
    type Engine = WebRtcEngine;

    async fn create(
        &self,
        remote_id: &str,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<WebRtcEngine> {
        let peer_connection = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);

        // The local track subscription for this remote.
        let sender = peer_connection
            .add_track(self.local_media.track() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // Candidates go out one by one as they are gathered.
        let candidate_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("Candidate gathering complete");
                    return;
                };
                let encoded = candidate
                    .to_json()
                    .map_err(Error::from)
                    .and_then(|init| serde_json::to_string(&init).map_err(Error::from));
                match encoded {
                    Ok(json) => {
                        let _ = events.send(EngineEvent::LocalCandidate(json));
                    }
                    Err(e) => {
                        warn!(error = %e, "Could not encode local candidate");
                        let _ = events.send(EngineEvent::Diagnostic(format!(
                            "ICE candidate error: {e}"
                        )));
                    }
                }
            })
        }));

        let track_events = events.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                let events = track_events.clone();
                Box::pin(async move {
                    if track.kind() != RTPCodecType::Audio {
                        return;
                    }
                    let stream_id = track.stream_id().to_string();
                    let playback = tokio::spawn(play_remote(track));
                    let _ = events.send(EngineEvent::RemoteMedia(RemoteMedia::with_playback(
                        stream_id,
                        playback.abort_handle(),
                    )));
                })
            },
        ));

        let gathering_events = events.clone();
        peer_connection.on_ice_gathering_state_change(Box::new(move |s: RTCIceGathererState| {
            let _ = gathering_events.send(EngineEvent::Diagnostic(format!(
                "ICE candidate gathering state {s}"
            )));
            Box::pin(async {})
        }));

        let state_events = events.clone();
        let log_remote_id = remote_id.to_string();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                debug!(remote_id = %log_remote_id, state = %s, "Peer connection state changed");
                if s == RTCPeerConnectionState::Failed {
                    let _ = state_events.send(EngineEvent::ConnectionFailed(
                        "peer connection failed".to_string(),
                    ));
                }
                Box::pin(async {})
            },
        ));

        let ice_events = events;
        let log_remote_id = remote_id.to_string();
        peer_connection.on_ice_connection_state_change(Box::new(
            move |s: RTCIceConnectionState| {
                debug!(remote_id = %log_remote_id, state = %s, "ICE connection state changed");
                let _ = ice_events.send(EngineEvent::Diagnostic(format!("ICE connection state {s}")));
                Box::pin(async {})
            },
        ));

        Ok(WebRtcEngine {
            peer_connection,
            sender,
        })
    }
}

pub struct WebRtcEngine {
    peer_connection: Arc<RTCPeerConnection>,
    sender: Arc<RTCRtpSender>,
}

#[async_trait]
impl SessionEngine for WebRtcEngine {
    async fn create_offer(&self) -> Result<String> {
        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await?;
        Ok(serde_json::to_string(&offer)?)
    }

    async fn create_answer(&self) -> Result<String> {
        let answer = self.peer_connection.create_answer(None).await?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await?;
        Ok(serde_json::to_string(&answer)?)
    }

    async fn apply_remote_description(&self, description: &str) -> Result<()> {
        let description: RTCSessionDescription = serde_json::from_str(description)
            .map_err(|e| Error::Negotiation(format!("malformed session description: {e}")))?;
        self.peer_connection
            .set_remote_description(description)
            .await?;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &str) -> Result<()> {
        let candidate: RTCIceCandidateInit = serde_json::from_str(candidate)?;
        self.peer_connection.add_ice_candidate(candidate).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Err(e) = self.peer_connection.remove_track(&self.sender).await {
            debug!(error = %e, "Local track already detached");
        }
        self.peer_connection.close().await?;
        Ok(())
    }
}

/// Drains the remote audio track until it ends or the task is aborted.
async fn play_remote(track: Arc<TrackRemote>) {
    let mut packets: u64 = 0;
    let mut bytes: usize = 0;
    while let Ok((packet, _)) = track.read_rtp().await {
        packets += 1;
        bytes += packet.payload.len();
    }
    debug!(packets, bytes, "Remote audio ended");
}
