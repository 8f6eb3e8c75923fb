use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use mediasoup::consumer::{Consumer, ConsumerOptions};
use mediasoup::data_structures::{ListenInfo, Protocol};
use mediasoup::producer::{Producer, ProducerOptions};
use mediasoup::router::{Router, RouterOptions};
use mediasoup::rtp_parameters::{MediaKind, RtpCapabilities, RtpEncodingParameters, RtpParameters};
use mediasoup::webrtc_transport::{
    WebRtcTransport, WebRtcTransportListenInfos, WebRtcTransportOptions,
    WebRtcTransportRemoteParameters,
};
use mediasoup::worker::Worker;
use tracing::debug;

use conflux_core::error::RouterError;
use conflux_core::ids::{ConsumerId, ProducerId, TransportId};
use conflux_core::media_backend::{
    ConsumerDescriptor, IceDtlsParameters, MediaRouter, ProducerDescriptor, RtpCapabilities as CoreRtpCapabilities,
    RtpParameters as CoreRtpParameters, TransportDescriptor,
};
use conflux_core::model::{PreferredLayers, ProducerKind, SimulcastEncoding};

use crate::codecs::media_codecs;

fn to_media_kind(kind: ProducerKind) -> Result<MediaKind, RouterError> {
    match kind {
        ProducerKind::Audio => Ok(MediaKind::Audio),
        ProducerKind::Video => Ok(MediaKind::Video),
        ProducerKind::Data => Err(RouterError::Produce(
            "data producers are not carried over mediasoup media routers".into(),
        )),
    }
}

fn from_media_kind(kind: MediaKind) -> ProducerKind {
    match kind {
        MediaKind::Audio => ProducerKind::Audio,
        MediaKind::Video => ProducerKind::Video,
    }
}

/// Concrete `MediaRouter` backed by one real `mediasoup::router::Router`.
/// Holds every transport/producer/consumer created against it so later
/// calls can look them up by our newtype IDs, mirroring how the reference
/// stack's `MediaRoom` keeps `ParticipantMedia` maps alongside the router.
pub struct MediasoupRouter {
    router: Router,
    listen_ip: IpAddr,
    announced_ip: Option<String>,
    worker_tag: String,
    transports: DashMap<TransportId, WebRtcTransport>,
    producers: DashMap<ProducerId, Producer>,
    consumers: DashMap<ConsumerId, Consumer>,
}

impl MediasoupRouter {
    pub async fn create(
        worker: &Worker,
        listen_ip: IpAddr,
        announced_ip: Option<String>,
    ) -> Result<Arc<Self>, RouterError> {
        let worker_tag = worker.id().to_string();
        let router = worker
            .create_router(RouterOptions::new(media_codecs()))
            .await
            .map_err(|e| RouterError::RouterCreationFailed(e.to_string()))?;

        Ok(Arc::new(Self {
            router,
            listen_ip,
            announced_ip,
            worker_tag,
            transports: DashMap::new(),
            producers: DashMap::new(),
            consumers: DashMap::new(),
        }))
    }

    async fn new_webrtc_transport(&self) -> Result<WebRtcTransport, RouterError> {
        let udp_info = ListenInfo {
            protocol: Protocol::Udp,
            ip: self.listen_ip,
            announced_address: self.announced_ip.clone(),
            port: None,
            port_range: None,
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            expose_internal_ip: false,
        };
        let tcp_info = ListenInfo {
            protocol: Protocol::Tcp,
            ip: self.listen_ip,
            announced_address: self.announced_ip.clone(),
            port: None,
            port_range: None,
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            expose_internal_ip: false,
        };

        let listen_infos = WebRtcTransportListenInfos::new(udp_info).insert(tcp_info);
        let mut options = WebRtcTransportOptions::new(listen_infos);
        options.enable_udp = true;
        options.enable_tcp = true;
        options.prefer_udp = true;

        self.router
            .create_webrtc_transport(options)
            .await
            .map_err(|e| RouterError::Transport(e.to_string()))
    }
}

#[async_trait]
impl MediaRouter for MediasoupRouter {
    async fn router_rtp_capabilities(&self) -> CoreRtpCapabilities {
        serde_json::to_value(self.router.rtp_capabilities()).unwrap_or_default()
    }

    async fn create_transport(&self) -> Result<TransportDescriptor, RouterError> {
        let transport = self.new_webrtc_transport().await?;
        let id = TransportId(transport.id().to_string());

        let descriptor = TransportDescriptor {
            id: id.clone(),
            ice_parameters: serde_json::to_value(transport.ice_parameters()).unwrap_or_default(),
            ice_candidates: serde_json::to_value(transport.ice_candidates()).unwrap_or_default(),
            dtls_parameters: serde_json::to_value(transport.dtls_parameters()).unwrap_or_default(),
        };

        self.transports.insert(id, transport);
        Ok(descriptor)
    }

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: IceDtlsParameters,
    ) -> Result<(), RouterError> {
        let transport = self
            .transports
            .get(transport_id)
            .ok_or_else(|| RouterError::Transport(format!("unknown transport {transport_id}")))?;

        let dtls_parameters = serde_json::from_value(dtls_parameters)
            .map_err(|e| RouterError::Transport(format!("invalid dtls parameters: {e}")))?;

        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| RouterError::Transport(e.to_string()))?;

        debug!(%transport_id, "transport connected");
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: ProducerKind,
        rtp_parameters: CoreRtpParameters,
        encodings: Vec<SimulcastEncoding>,
    ) -> Result<ProducerDescriptor, RouterError> {
        let transport = self
            .transports
            .get(transport_id)
            .ok_or_else(|| RouterError::Transport(format!("unknown transport {transport_id}")))?;

        let media_kind = to_media_kind(kind)?;
        let mut rtp_parameters: RtpParameters = serde_json::from_value(rtp_parameters)
            .map_err(|e| RouterError::Produce(format!("invalid rtp parameters: {e}")))?;

        if media_kind == MediaKind::Video && rtp_parameters.encodings.is_empty() {
            rtp_parameters.encodings = encodings
                .iter()
                .enumerate()
                .map(|(i, enc)| RtpEncodingParameters {
                    ssrc: None,
                    rid: Some(format!("r{i}")),
                    codec_payload_type: None,
                    rtx: None,
                    dtx: None,
                    scalability_mode: Default::default(),
                    max_bitrate: Some(enc.max_bitrate_bps),
                })
                .collect();
        }

        let producer = transport
            .produce(ProducerOptions::new(media_kind, rtp_parameters))
            .await
            .map_err(|e| RouterError::Produce(e.to_string()))?;

        let id = ProducerId(producer.id().to_string());
        self.producers.insert(id.clone(), producer);

        Ok(ProducerDescriptor { id })
    }

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: CoreRtpCapabilities,
        preferred_layers: PreferredLayers,
    ) -> Result<ConsumerDescriptor, RouterError> {
        let transport = self
            .transports
            .get(transport_id)
            .ok_or_else(|| RouterError::Transport(format!("unknown transport {transport_id}")))?;

        let mediasoup_producer_id = mediasoup::producer::ProducerId::from_str(producer_id.as_str())
            .map_err(|e| RouterError::Consume(format!("invalid producer id: {e}")))?;

        let rtp_capabilities: RtpCapabilities = serde_json::from_value(rtp_capabilities)
            .map_err(|_| RouterError::UnsupportedCapabilities)?;

        if !self.router.can_consume(&mediasoup_producer_id, &rtp_capabilities) {
            return Err(RouterError::UnsupportedCapabilities);
        }

        let mut options = ConsumerOptions::new(mediasoup_producer_id, rtp_capabilities);
        options.preferred_layers = Some(mediasoup::rtp_parameters::RtpEncodingParametersLayer {
            spatial_layer: preferred_layers.spatial,
            temporal_layer: Some(preferred_layers.temporal),
        });

        let consumer = transport
            .consume(options)
            .await
            .map_err(|e| RouterError::Consume(e.to_string()))?;

        let id = ConsumerId(consumer.id().to_string());
        let descriptor = ConsumerDescriptor {
            id: id.clone(),
            producer_id: producer_id.clone(),
            kind: from_media_kind(consumer.kind()),
            rtp_parameters: serde_json::to_value(consumer.rtp_parameters()).unwrap_or_default(),
        };

        self.consumers.insert(id, consumer);
        Ok(descriptor)
    }

    async fn set_preferred_layers(
        &self,
        consumer_id: &ConsumerId,
        layers: PreferredLayers,
    ) -> Result<(), RouterError> {
        let consumer = self
            .consumers
            .get(consumer_id)
            .ok_or_else(|| RouterError::Consume(format!("unknown consumer {consumer_id}")))?;

        consumer
            .set_preferred_layers(mediasoup::consumer::ConsumerLayers {
                spatial_layer: layers.spatial,
                temporal_layer: Some(layers.temporal),
            })
            .await
            .map_err(|e| RouterError::Consume(e.to_string()))
    }

    async fn pause_producer(&self, producer_id: &ProducerId) -> Result<(), RouterError> {
        let producer = self
            .producers
            .get(producer_id)
            .ok_or_else(|| RouterError::Produce(format!("unknown producer {producer_id}")))?;
        producer.pause().await.map_err(|e| RouterError::Produce(e.to_string()))
    }

    async fn resume_producer(&self, producer_id: &ProducerId) -> Result<(), RouterError> {
        let producer = self
            .producers
            .get(producer_id)
            .ok_or_else(|| RouterError::Produce(format!("unknown producer {producer_id}")))?;
        producer.resume().await.map_err(|e| RouterError::Produce(e.to_string()))
    }

    async fn pause_consumer(&self, consumer_id: &ConsumerId) -> Result<(), RouterError> {
        let consumer = self
            .consumers
            .get(consumer_id)
            .ok_or_else(|| RouterError::Consume(format!("unknown consumer {consumer_id}")))?;
        consumer.pause().await.map_err(|e| RouterError::Consume(e.to_string()))
    }

    async fn resume_consumer(&self, consumer_id: &ConsumerId) -> Result<(), RouterError> {
        let consumer = self
            .consumers
            .get(consumer_id)
            .ok_or_else(|| RouterError::Consume(format!("unknown consumer {consumer_id}")))?;
        consumer.resume().await.map_err(|e| RouterError::Consume(e.to_string()))
    }

    async fn close_producer(&self, producer_id: &ProducerId) -> Result<(), RouterError> {
        self.producers.remove(producer_id);
        Ok(())
    }

    async fn close_consumer(&self, consumer_id: &ConsumerId) -> Result<(), RouterError> {
        self.consumers.remove(consumer_id);
        Ok(())
    }

    async fn close_transport(&self, transport_id: &TransportId) -> Result<(), RouterError> {
        self.transports.remove(transport_id);
        Ok(())
    }

    async fn producer_stats(&self, producer_id: &ProducerId) -> Result<(u32, f32), RouterError> {
        let producer = self
            .producers
            .get(producer_id)
            .ok_or_else(|| RouterError::Produce(format!("unknown producer {producer_id}")))?;

        let stats = producer
            .get_stats()
            .await
            .map_err(|e| RouterError::Produce(e.to_string()))?;

        let (bitrate, loss) = stats
            .first()
            .map(|s| (s.bitrate, packet_loss_pct(s.packets_lost, s.packet_count)))
            .unwrap_or((0, 0.0));

        Ok((bitrate, loss))
    }

    async fn consumer_stats(&self, consumer_id: &ConsumerId) -> Result<(u32, f32, u32), RouterError> {
        let consumer = self
            .consumers
            .get(consumer_id)
            .ok_or_else(|| RouterError::Consume(format!("unknown consumer {consumer_id}")))?;

        let stats = consumer
            .get_stats()
            .await
            .map_err(|e| RouterError::Consume(e.to_string()))?;

        let (bitrate, loss, rtt) = stats
            .first()
            .map(|s| {
                (
                    s.bitrate,
                    packet_loss_pct(s.packets_lost, s.packet_count),
                    s.round_trip_time.as_millis() as u32,
                )
            })
            .unwrap_or((0, 0.0, 0));

        Ok((bitrate, loss, rtt))
    }

    async fn close(&self) {
        self.consumers.clear();
        self.producers.clear();
        self.transports.clear();
    }

    fn worker_tag(&self) -> Option<String> {
        Some(self.worker_tag.clone())
    }
}

fn packet_loss_pct(lost: u32, total: u32) -> f32 {
    if total == 0 {
        0.0
    } else {
        (lost as f32 / total as f32) * 100.0
    }
}
