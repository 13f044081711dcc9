// Copyright (c) 2025 The Haze Project

//! Bridges the ratchet's delivery seam onto the send pipeline.

use async_trait::async_trait;
use haze_cmix::{fixed, CmixParams, OutboundMessage, SendPipeline};
use haze_common::{ErrorKind, StopToken};
use haze_e2e::{E2eError, Transport, WireMessage};
use std::sync::Arc;

pub struct PipelineTransport {
    pipeline: Arc<SendPipeline>,
    params: CmixParams,
    stop: StopToken,
}

impl PipelineTransport {
    pub fn new(pipeline: Arc<SendPipeline>, mut params: CmixParams, stop: StopToken) -> Self {
        params.debug_tag = "rekey".into();
        PipelineTransport {
            pipeline,
            params,
            stop,
        }
    }
}

#[async_trait]
impl Transport for PipelineTransport {
    async fn deliver(&self, message: WireMessage) -> haze_e2e::Result<()> {
        let outbound = OutboundMessage {
            recipient: message.recipient,
            fingerprint: message.fingerprint,
            // Ratchet traffic is fingerprint-addressed only.
            service_tag: Vec::new(),
            contents: message.contents,
            mac_key: message.mac_key,
        };
        self.pipeline
            .send_cmix(fixed(outbound), &self.params, &self.stop)
            .await
            .map(|_| ())
            .map_err(|e| {
                if e.kind() == ErrorKind::Cancelled {
                    E2eError::Cancelled
                } else {
                    E2eError::Send(e.to_string())
                }
            })
    }
}
