//! WebRTC peer links (webrtc-rs).
//!
//! One `RTCPeerConnection` per link and a single ordered, reliable data
//! channel labelled [`DATA_CHANNEL_LABEL`], created by the offering side.
//! Candidates trickle through the link's event stream instead of being
//! gathered into the session description.

mod channel;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

pub use channel::WebRtcChannel;

use super::{
    IceCandidate, LinkEvent, LinkEvents, LinkFactory, LinkState, PeerLink, SessionDescription,
};
use crate::core::config::{DATA_CHANNEL_LABEL, DC_BUFFERED_AMOUNT_LOW, DEFAULT_STUN_SERVER};
use crate::core::error::{Result, TransferError};

fn negotiation(e: webrtc::Error) -> TransferError {
    TransferError::Negotiation(e.to_string())
}

/// Transport options of the WebRTC factory.
#[derive(Debug, Clone)]
pub struct WebRtcOptions {
    /// STUN/TURN urls. Empty means host candidates only.
    pub ice_servers: Vec<String>,
    /// Offer loopback candidates; lets two peers of one host connect offline.
    pub include_loopback: bool,
    /// Buffered amount below which a parked sender resumes.
    pub low_watermark: usize,
}

impl Default for WebRtcOptions {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            include_loopback: false,
            low_watermark: DC_BUFFERED_AMOUNT_LOW,
        }
    }
}

pub struct WebRtcLinkFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    low_watermark: usize,
}

impl WebRtcLinkFactory {
    pub fn new(options: WebRtcOptions) -> Result<Self> {
        let mut me = MediaEngine::default();
        let registry =
            register_default_interceptors(Registry::new(), &mut me).map_err(negotiation)?;

        let mut se = SettingEngine::default();
        se.set_include_loopback_candidate(options.include_loopback);

        let api = APIBuilder::new()
            .with_setting_engine(se)
            .with_media_engine(me)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if options.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: options.ice_servers,
                ..Default::default()
            }]
        };

        Ok(Self {
            api,
            ice_servers,
            low_watermark: options.low_watermark,
        })
    }
}

#[async_trait]
impl LinkFactory for WebRtcLinkFactory {
    async fn create_link(&self, events: LinkEvents) -> Result<Arc<dyn PeerLink>> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(RTCConfiguration {
                    ice_servers: self.ice_servers.clone(),
                    ..Default::default()
                })
                .await
                .map_err(negotiation)?,
        );

        let ev = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let ev = ev.clone();
            Box::pin(async move {
                let state = match s {
                    RTCPeerConnectionState::New | RTCPeerConnectionState::Connecting => {
                        LinkState::Connecting
                    }
                    RTCPeerConnectionState::Connected => {
                        info!(event = "webrtc_connected", device = %ev.device(), "WebRTC connection established");
                        LinkState::Connected
                    }
                    RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
                    RTCPeerConnectionState::Failed => LinkState::Failed,
                    RTCPeerConnectionState::Closed => LinkState::Closed,
                    RTCPeerConnectionState::Unspecified => return,
                };
                ev.emit(LinkEvent::StateChanged(state));
            })
        }));

        let ev = events.clone();
        pc.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let ev = ev.clone();
            Box::pin(async move {
                let Some(candidate) = c else {
                    debug!(event = "ice_gathering_complete", device = %ev.device(), "No more local candidates");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => ev.emit(LinkEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(e) => warn!(event = "ice_candidate_encode_failure", error = %e, "Dropping local candidate"),
                }
            })
        }));

        let ev = events.clone();
        let low_watermark = self.low_watermark;
        pc.on_data_channel(Box::new(move |dc| {
            let ev = ev.clone();
            Box::pin(async move {
                if dc.label() != DATA_CHANNEL_LABEL {
                    warn!(event = "unexpected_channel", label = %dc.label(), "Ignoring data channel");
                    return;
                }
                channel::attach(dc, ev, low_watermark).await;
            })
        }));

        Ok(Arc::new(WebRtcLink {
            pc,
            events,
            low_watermark,
        }))
    }
}

pub struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    events: LinkEvents,
    low_watermark: usize,
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_offer(&self) -> Result<SessionDescription> {
        // Ordered + fully reliable (SCTP default, no partial reliability).
        let dc = self
            .pc
            .create_data_channel(
                DATA_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(negotiation)?;
        channel::attach(dc, self.events.clone(), self.low_watermark).await;

        let offer = self.pc.create_offer(None).await.map_err(negotiation)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(negotiation)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        let desc = RTCSessionDescription::offer(offer.sdp).map_err(negotiation)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(negotiation)?;

        let answer = self.pc.create_answer(None).await.map_err(negotiation)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(negotiation)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_answer(&self, answer: SessionDescription) -> Result<()> {
        let desc = RTCSessionDescription::answer(answer.sdp).map_err(negotiation)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(negotiation)
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(negotiation)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!(event = "webrtc_close_error", device = %self.events.device(), error = %e, "Error closing peer connection");
        }
    }
}
