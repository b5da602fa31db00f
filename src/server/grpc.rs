//! Hand-written tonic plumbing for the `merlin.Merlin` service.
//!
//! The server and client below follow the shape tonic's generator would
//! produce, written directly so the wire types stay plain Rust and no proto
//! codegen enters the build: [`MerlinServer`] routes on the request path and
//! runs each unary method through a [`ProstCodec`][tonic::codec::ProstCodec];
//! [`MerlinClient`] issues the matching unary calls over a channel.

use crate::types::{
    Empty, RealServer, RealServerList, ServiceId, VirtualService, VirtualServiceList,
};
use bytes::Bytes;
use std::sync::Arc;
use tonic::codegen::http;
use tonic::codegen::{empty_body, Body, BoxFuture, Context, Poll, StdError};
use tonic::IntoRequest;

/// Server-side contract of the Merlin RPC surface.
#[tonic::codegen::async_trait]
pub trait Merlin: Send + Sync + 'static {
    async fn create_service(
        &self,
        request: tonic::Request<VirtualService>,
    ) -> Result<tonic::Response<Empty>, tonic::Status>;

    async fn update_service(
        &self,
        request: tonic::Request<VirtualService>,
    ) -> Result<tonic::Response<Empty>, tonic::Status>;

    async fn delete_service(
        &self,
        request: tonic::Request<ServiceId>,
    ) -> Result<tonic::Response<Empty>, tonic::Status>;

    async fn get_service(
        &self,
        request: tonic::Request<ServiceId>,
    ) -> Result<tonic::Response<VirtualService>, tonic::Status>;

    async fn list_services(
        &self,
        request: tonic::Request<Empty>,
    ) -> Result<tonic::Response<VirtualServiceList>, tonic::Status>;

    async fn create_server(
        &self,
        request: tonic::Request<RealServer>,
    ) -> Result<tonic::Response<Empty>, tonic::Status>;

    async fn update_server(
        &self,
        request: tonic::Request<RealServer>,
    ) -> Result<tonic::Response<Empty>, tonic::Status>;

    async fn delete_server(
        &self,
        request: tonic::Request<RealServer>,
    ) -> Result<tonic::Response<Empty>, tonic::Status>;

    async fn list_servers(
        &self,
        request: tonic::Request<ServiceId>,
    ) -> Result<tonic::Response<RealServerList>, tonic::Status>;
}

/// tonic service wrapper around a [`Merlin`] implementation.
pub struct MerlinServer<T> {
    inner: Arc<T>,
}

impl<T> MerlinServer<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn from_arc(inner: Arc<T>) -> Self {
        Self { inner }
    }
}

impl<T> Clone for MerlinServer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Merlin> tonic::server::NamedService for MerlinServer<T> {
    const NAME: &'static str = "merlin.Merlin";
}

/// Dispatch one unary method: decode with prost, call the trait, encode.
macro_rules! unary {
    ($svc_name:ident, $method:ident, $request:ty, $response:ty, $inner:expr, $req:expr) => {{
        #[allow(non_camel_case_types)]
        struct $svc_name<T: Merlin>(Arc<T>);
        impl<T: Merlin> tonic::server::UnaryService<$request> for $svc_name<T> {
            type Response = $response;
            type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
            fn call(&mut self, request: tonic::Request<$request>) -> Self::Future {
                let inner = Arc::clone(&self.0);
                Box::pin(async move { <T as Merlin>::$method(&inner, request).await })
            }
        }
        let inner = $inner;
        let req = $req;
        Box::pin(async move {
            let method = $svc_name(inner);
            let codec = tonic::codec::ProstCodec::default();
            let mut grpc = tonic::server::Grpc::new(codec);
            Ok(grpc.unary(method, req).await)
        })
    }};
}

impl<T, B> tonic::codegen::Service<http::Request<B>> for MerlinServer<T>
where
    T: Merlin,
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let inner = Arc::clone(&self.inner);
        match req.uri().path() {
            "/merlin.Merlin/CreateService" => {
                unary!(CreateServiceSvc, create_service, VirtualService, Empty, inner, req)
            }
            "/merlin.Merlin/UpdateService" => {
                unary!(UpdateServiceSvc, update_service, VirtualService, Empty, inner, req)
            }
            "/merlin.Merlin/DeleteService" => {
                unary!(DeleteServiceSvc, delete_service, ServiceId, Empty, inner, req)
            }
            "/merlin.Merlin/GetService" => {
                unary!(GetServiceSvc, get_service, ServiceId, VirtualService, inner, req)
            }
            "/merlin.Merlin/ListServices" => {
                unary!(ListServicesSvc, list_services, Empty, VirtualServiceList, inner, req)
            }
            "/merlin.Merlin/CreateServer" => {
                unary!(CreateServerSvc, create_server, RealServer, Empty, inner, req)
            }
            "/merlin.Merlin/UpdateServer" => {
                unary!(UpdateServerSvc, update_server, RealServer, Empty, inner, req)
            }
            "/merlin.Merlin/DeleteServer" => {
                unary!(DeleteServerSvc, delete_server, RealServer, Empty, inner, req)
            }
            "/merlin.Merlin/ListServers" => {
                unary!(ListServersSvc, list_servers, ServiceId, RealServerList, inner, req)
            }
            _ => Box::pin(async move {
                Ok(http::Response::builder()
                    .status(http::StatusCode::OK)
                    .header("grpc-status", tonic::Code::Unimplemented as i32)
                    .header(http::header::CONTENT_TYPE, "application/grpc")
                    .body(empty_body())
                    .unwrap())
            }),
        }
    }
}

/// Client for the Merlin RPC surface.
pub struct MerlinClient<T> {
    inner: tonic::client::Grpc<T>,
}

impl MerlinClient<tonic::transport::Channel> {
    /// Connect to a daemon, e.g. `http://localhost:4282`.
    pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
    where
        D: TryInto<tonic::transport::Endpoint>,
        D::Error: Into<StdError>,
    {
        let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
        Ok(Self::new(conn))
    }
}

macro_rules! client_unary {
    ($self:ident, $request:ident, $path:literal) => {{
        $self
            .inner
            .ready()
            .await
            .map_err(|e| tonic::Status::unavailable(format!("service not ready: {}", e.into())))?;
        let codec = tonic::codec::ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static($path);
        $self.inner.unary($request.into_request(), path, codec).await
    }};
}

impl<T> MerlinClient<T>
where
    T: tonic::client::GrpcService<tonic::body::BoxBody>,
    T::Error: Into<StdError>,
    T::ResponseBody: Body<Data = Bytes> + Send + 'static,
    <T::ResponseBody as Body>::Error: Into<StdError> + Send,
{
    pub fn new(inner: T) -> Self {
        Self {
            inner: tonic::client::Grpc::new(inner),
        }
    }

    pub async fn create_service(
        &mut self,
        request: impl tonic::IntoRequest<VirtualService>,
    ) -> Result<tonic::Response<Empty>, tonic::Status> {
        client_unary!(self, request, "/merlin.Merlin/CreateService")
    }

    pub async fn update_service(
        &mut self,
        request: impl tonic::IntoRequest<VirtualService>,
    ) -> Result<tonic::Response<Empty>, tonic::Status> {
        client_unary!(self, request, "/merlin.Merlin/UpdateService")
    }

    pub async fn delete_service(
        &mut self,
        request: impl tonic::IntoRequest<ServiceId>,
    ) -> Result<tonic::Response<Empty>, tonic::Status> {
        client_unary!(self, request, "/merlin.Merlin/DeleteService")
    }

    pub async fn get_service(
        &mut self,
        request: impl tonic::IntoRequest<ServiceId>,
    ) -> Result<tonic::Response<VirtualService>, tonic::Status> {
        client_unary!(self, request, "/merlin.Merlin/GetService")
    }

    pub async fn list_services(
        &mut self,
        request: impl tonic::IntoRequest<Empty>,
    ) -> Result<tonic::Response<VirtualServiceList>, tonic::Status> {
        client_unary!(self, request, "/merlin.Merlin/ListServices")
    }

    pub async fn create_server(
        &mut self,
        request: impl tonic::IntoRequest<RealServer>,
    ) -> Result<tonic::Response<Empty>, tonic::Status> {
        client_unary!(self, request, "/merlin.Merlin/CreateServer")
    }

    pub async fn update_server(
        &mut self,
        request: impl tonic::IntoRequest<RealServer>,
    ) -> Result<tonic::Response<Empty>, tonic::Status> {
        client_unary!(self, request, "/merlin.Merlin/UpdateServer")
    }

    pub async fn delete_server(
        &mut self,
        request: impl tonic::IntoRequest<RealServer>,
    ) -> Result<tonic::Response<Empty>, tonic::Status> {
        client_unary!(self, request, "/merlin.Merlin/DeleteServer")
    }

    pub async fn list_servers(
        &mut self,
        request: impl tonic::IntoRequest<ServiceId>,
    ) -> Result<tonic::Response<RealServerList>, tonic::Status> {
        client_unary!(self, request, "/merlin.Merlin/ListServers")
    }
}
