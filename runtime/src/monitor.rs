//! The resource monitor seam.
//!
//! Everything the engine asks of the external monitor goes through the
//! `ResourceMonitor` trait, so the registration protocol can be exercised
//! against an in-process double as well as the real gRPC endpoint.
//!

use async_trait::async_trait;
use thiserror::Error;
use tonic::transport::Channel;

use intendant_proto::resource_monitor_client::ResourceMonitorClient;
use intendant_proto::{
    InvokeRequest, InvokeResponse, RegisterResourceOutputsRequest, RegisterResourceRequest,
    RegisterResourceResponse,
};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("connecting to resource monitor over RPC: {0}")]
    Connect(#[from] tonic::transport::Error),
    #[error("resource monitor RPC failed: {0}")]
    Call(#[from] tonic::Status),
    #[error("no resource monitor attached")]
    NotAttached,
}

#[async_trait]
pub trait ResourceMonitor: Send + Sync {
    async fn register_resource(
        &self,
        req: RegisterResourceRequest,
    ) -> Result<RegisterResourceResponse, MonitorError>;

    async fn register_resource_outputs(
        &self,
        req: RegisterResourceOutputsRequest,
    ) -> Result<(), MonitorError>;

    async fn invoke(&self, req: InvokeRequest) -> Result<InvokeResponse, MonitorError>;
}

/// The production monitor: a tonic client over an insecure channel, as the
/// driver hands us plain `host:port` addresses.
///
pub struct GrpcMonitor {
    client: ResourceMonitorClient<Channel>,
}

impl GrpcMonitor {
    pub async fn connect(addr: &str) -> Result<Self, MonitorError> {
        let endpoint = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.to_owned()
        } else {
            format!("http://{addr}")
        };
        let client = ResourceMonitorClient::connect(endpoint).await?;
        Ok(GrpcMonitor { client })
    }
}

#[async_trait]
impl ResourceMonitor for GrpcMonitor {
    async fn register_resource(
        &self,
        req: RegisterResourceRequest,
    ) -> Result<RegisterResourceResponse, MonitorError> {
        let mut client = self.client.clone();
        Ok(client.register_resource(req).await?.into_inner())
    }

    async fn register_resource_outputs(
        &self,
        req: RegisterResourceOutputsRequest,
    ) -> Result<(), MonitorError> {
        let mut client = self.client.clone();
        client.register_resource_outputs(req).await?;
        Ok(())
    }

    async fn invoke(&self, req: InvokeRequest) -> Result<InvokeResponse, MonitorError> {
        let mut client = self.client.clone();
        Ok(client.invoke(req).await?.into_inner())
    }
}

/// A monitor that refuses every call. Used when evaluating expressions in a
/// context that has no monitor behind it.
///
pub struct NullMonitor;

#[async_trait]
impl ResourceMonitor for NullMonitor {
    async fn register_resource(
        &self,
        _req: RegisterResourceRequest,
    ) -> Result<RegisterResourceResponse, MonitorError> {
        Err(MonitorError::NotAttached)
    }

    async fn register_resource_outputs(
        &self,
        _req: RegisterResourceOutputsRequest,
    ) -> Result<(), MonitorError> {
        Err(MonitorError::NotAttached)
    }

    async fn invoke(&self, _req: InvokeRequest) -> Result<InvokeResponse, MonitorError> {
        Err(MonitorError::NotAttached)
    }
}
