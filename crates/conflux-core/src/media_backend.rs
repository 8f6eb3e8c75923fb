use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::RouterError;
use crate::ids::{ConsumerId, MeetingId, ProducerId, TransportId};
use crate::model::{PreferredLayers, ProducerKind, SimulcastEncoding};

/// Opaque transport-connection parameters (ICE candidates/parameters, DTLS
/// fingerprints). Kept as `serde_json::Value` at this boundary rather than
/// strongly typed mediasoup structs, the same way the reference stack's WS
/// layer already carries `TransportOptions`/`ConsumerInfo` as JSON between
/// the media layer and the signaling layer — it lets `conflux-core` depend
/// on neither `mediasoup` nor any particular SFU crate.
pub type IceDtlsParameters = Value;
pub type RtpParameters = Value;
pub type RtpCapabilities = Value;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportDescriptor {
    pub id: TransportId,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerDescriptor {
    pub id: ProducerId,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerDescriptor {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: ProducerKind,
    pub rtp_parameters: RtpParameters,
}

/// A single SFU router instance scoped to one meeting. `conflux-media`
/// implements this over a real `mediasoup::router::Router`; tests use an
/// in-memory fake so `conflux-core`'s Meeting Lifecycle Manager and Hybrid
/// Topology Engine logic can be exercised without a running mediasoup
/// worker process.
#[async_trait]
pub trait MediaRouter: Send + Sync {
    async fn router_rtp_capabilities(&self) -> RtpCapabilities;

    async fn create_transport(&self) -> Result<TransportDescriptor, RouterError>;

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: IceDtlsParameters,
    ) -> Result<(), RouterError>;

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: ProducerKind,
        rtp_parameters: RtpParameters,
        encodings: Vec<SimulcastEncoding>,
    ) -> Result<ProducerDescriptor, RouterError>;

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
        preferred_layers: PreferredLayers,
    ) -> Result<ConsumerDescriptor, RouterError>;

    async fn set_preferred_layers(
        &self,
        consumer_id: &ConsumerId,
        layers: PreferredLayers,
    ) -> Result<(), RouterError>;

    async fn pause_producer(&self, producer_id: &ProducerId) -> Result<(), RouterError>;
    async fn resume_producer(&self, producer_id: &ProducerId) -> Result<(), RouterError>;
    async fn pause_consumer(&self, consumer_id: &ConsumerId) -> Result<(), RouterError>;
    async fn resume_consumer(&self, consumer_id: &ConsumerId) -> Result<(), RouterError>;

    async fn close_producer(&self, producer_id: &ProducerId) -> Result<(), RouterError>;
    async fn close_consumer(&self, consumer_id: &ConsumerId) -> Result<(), RouterError>;
    async fn close_transport(&self, transport_id: &TransportId) -> Result<(), RouterError>;

    /// Producer bitrate/loss sample for the periodic stats collector.
    async fn producer_stats(&self, producer_id: &ProducerId) -> Result<(u32, f32), RouterError>;
    async fn consumer_stats(
        &self,
        consumer_id: &ConsumerId,
    ) -> Result<(u32, f32, u32), RouterError>;

    async fn close(&self);

    /// Opaque id of the worker process backing this router, if the backend
    /// has such a concept. Lets the pool tell a meeting "your worker died"
    /// without `conflux-core` knowing anything about mediasoup workers.
    fn worker_tag(&self) -> Option<String> {
        None
    }
}

/// Lets an `Arc<dyn MediaRouter>` (or `Arc<ConcreteRouter>`) stand in
/// wherever a `Box<dyn MediaRouter>` is expected, so a backend that wants
/// to keep its own `Arc` around (e.g. to hand the same router to a
/// stats-collection task) doesn't have to hand-write a delegating wrapper.
#[async_trait]
impl<T: MediaRouter + ?Sized> MediaRouter for Arc<T> {
    async fn router_rtp_capabilities(&self) -> RtpCapabilities {
        (**self).router_rtp_capabilities().await
    }

    async fn create_transport(&self) -> Result<TransportDescriptor, RouterError> {
        (**self).create_transport().await
    }

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: IceDtlsParameters,
    ) -> Result<(), RouterError> {
        (**self).connect_transport(transport_id, dtls_parameters).await
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: ProducerKind,
        rtp_parameters: RtpParameters,
        encodings: Vec<SimulcastEncoding>,
    ) -> Result<ProducerDescriptor, RouterError> {
        (**self).produce(transport_id, kind, rtp_parameters, encodings).await
    }

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
        preferred_layers: PreferredLayers,
    ) -> Result<ConsumerDescriptor, RouterError> {
        (**self)
            .consume(transport_id, producer_id, rtp_capabilities, preferred_layers)
            .await
    }

    async fn set_preferred_layers(
        &self,
        consumer_id: &ConsumerId,
        layers: PreferredLayers,
    ) -> Result<(), RouterError> {
        (**self).set_preferred_layers(consumer_id, layers).await
    }

    async fn pause_producer(&self, producer_id: &ProducerId) -> Result<(), RouterError> {
        (**self).pause_producer(producer_id).await
    }

    async fn resume_producer(&self, producer_id: &ProducerId) -> Result<(), RouterError> {
        (**self).resume_producer(producer_id).await
    }

    async fn pause_consumer(&self, consumer_id: &ConsumerId) -> Result<(), RouterError> {
        (**self).pause_consumer(consumer_id).await
    }

    async fn resume_consumer(&self, consumer_id: &ConsumerId) -> Result<(), RouterError> {
        (**self).resume_consumer(consumer_id).await
    }

    async fn close_producer(&self, producer_id: &ProducerId) -> Result<(), RouterError> {
        (**self).close_producer(producer_id).await
    }

    async fn close_consumer(&self, consumer_id: &ConsumerId) -> Result<(), RouterError> {
        (**self).close_consumer(consumer_id).await
    }

    async fn close_transport(&self, transport_id: &TransportId) -> Result<(), RouterError> {
        (**self).close_transport(transport_id).await
    }

    async fn producer_stats(&self, producer_id: &ProducerId) -> Result<(u32, f32), RouterError> {
        (**self).producer_stats(producer_id).await
    }

    async fn consumer_stats(&self, consumer_id: &ConsumerId) -> Result<(u32, f32, u32), RouterError> {
        (**self).consumer_stats(consumer_id).await
    }

    async fn close(&self) {
        (**self).close().await
    }

    fn worker_tag(&self) -> Option<String> {
        (**self).worker_tag()
    }
}

/// Builds (and pre-warms, per §4.2's "pre-warm an SFU router ahead of the
/// hysteresis threshold") one `MediaRouter` per meeting, selecting a worker
/// from the pool the way the reference stack's `WorkerPool` round-robins
/// across mediasoup worker processes.
#[async_trait]
pub trait MediaBackendFactory: Send + Sync {
    async fn create_router(&self, meeting_id: &MeetingId) -> Result<Box<dyn MediaRouter>, RouterError>;
}

/// An in-memory fake used by `conflux-core`'s own unit tests, so Hybrid
/// Topology Engine and Meeting Lifecycle Manager logic can be verified
/// without any real media backend. Not used by the gateway binary.
#[cfg(test)]
pub mod fake {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    #[derive(Default)]
    pub struct FakeMediaRouter {
        next_id: AtomicU64,
    }

    fn next(counter: &AtomicU64, prefix: &str) -> String {
        format!("{prefix}-{}", counter.fetch_add(1, Ordering::Relaxed))
    }

    #[async_trait]
    impl MediaRouter for FakeMediaRouter {
        async fn router_rtp_capabilities(&self) -> RtpCapabilities {
            serde_json::json!({"codecs": []})
        }

        async fn create_transport(&self) -> Result<TransportDescriptor, RouterError> {
            Ok(TransportDescriptor {
                id: TransportId(next(&self.next_id, "transport")),
                ice_parameters: serde_json::json!({}),
                ice_candidates: serde_json::json!([]),
                dtls_parameters: serde_json::json!({}),
            })
        }

        async fn connect_transport(
            &self,
            _transport_id: &TransportId,
            _dtls_parameters: IceDtlsParameters,
        ) -> Result<(), RouterError> {
            Ok(())
        }

        async fn produce(
            &self,
            _transport_id: &TransportId,
            _kind: ProducerKind,
            _rtp_parameters: RtpParameters,
            _encodings: Vec<SimulcastEncoding>,
        ) -> Result<ProducerDescriptor, RouterError> {
            Ok(ProducerDescriptor {
                id: ProducerId(next(&self.next_id, "producer")),
            })
        }

        async fn consume(
            &self,
            _transport_id: &TransportId,
            producer_id: &ProducerId,
            _rtp_capabilities: RtpCapabilities,
            _preferred_layers: PreferredLayers,
        ) -> Result<ConsumerDescriptor, RouterError> {
            Ok(ConsumerDescriptor {
                id: ConsumerId(next(&self.next_id, "consumer")),
                producer_id: producer_id.clone(),
                kind: ProducerKind::Video,
                rtp_parameters: serde_json::json!({}),
            })
        }

        async fn set_preferred_layers(
            &self,
            _consumer_id: &ConsumerId,
            _layers: PreferredLayers,
        ) -> Result<(), RouterError> {
            Ok(())
        }

        async fn pause_producer(&self, _producer_id: &ProducerId) -> Result<(), RouterError> {
            Ok(())
        }

        async fn resume_producer(&self, _producer_id: &ProducerId) -> Result<(), RouterError> {
            Ok(())
        }

        async fn pause_consumer(&self, _consumer_id: &ConsumerId) -> Result<(), RouterError> {
            Ok(())
        }

        async fn resume_consumer(&self, _consumer_id: &ConsumerId) -> Result<(), RouterError> {
            Ok(())
        }

        async fn close_producer(&self, _producer_id: &ProducerId) -> Result<(), RouterError> {
            Ok(())
        }

        async fn close_consumer(&self, _consumer_id: &ConsumerId) -> Result<(), RouterError> {
            Ok(())
        }

        async fn close_transport(&self, _transport_id: &TransportId) -> Result<(), RouterError> {
            Ok(())
        }

        async fn producer_stats(
            &self,
            _producer_id: &ProducerId,
        ) -> Result<(u32, f32), RouterError> {
            Ok((300_000, 0.0))
        }

        async fn consumer_stats(
            &self,
            _consumer_id: &ConsumerId,
        ) -> Result<(u32, f32, u32), RouterError> {
            Ok((300_000, 0.0, 20))
        }

        async fn close(&self) {}
    }

    pub struct FakeMediaBackendFactory;

    #[async_trait]
    impl MediaBackendFactory for FakeMediaBackendFactory {
        async fn create_router(
            &self,
            _meeting_id: &MeetingId,
        ) -> Result<Box<dyn MediaRouter>, RouterError> {
            Ok(Box::new(FakeMediaRouter::default()) as Box<dyn MediaRouter>)
        }
    }
}
