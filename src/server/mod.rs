//! RPC facade.
//!
//! [`MerlinService`] adapts the nine remote operations 1:1 onto repository
//! calls; its only nontrivial behavior is error translation into the
//! transport's canonical status codes. The tonic wire plumbing lives in
//! [`grpc`].

pub mod grpc;

use crate::core::error::{self, Error};
use crate::repository::Repository;
use crate::types::{
    Empty, RealServer, RealServerList, ServiceId, VirtualService, VirtualServiceList,
};
use async_trait::async_trait;
use tonic::{Request, Response, Status};

/// The facade backing the `merlin.Merlin` gRPC service.
#[derive(Clone)]
pub struct MerlinService {
    repository: Repository,
}

impl MerlinService {
    pub fn new(repository: Repository) -> Self {
        Self { repository }
    }
}

fn reply<T>(value: T) -> Result<Response<T>, Status> {
    Ok(Response::new(value))
}

fn fail<T>(err: Error) -> Result<Response<T>, Status> {
    if matches!(err, Error::Internal { .. } | Error::Unavailable { .. }) {
        tracing::error!(error = %err, "request failed");
    }
    Err(error::to_status(err))
}

#[async_trait]
impl grpc::Merlin for MerlinService {
    async fn create_service(
        &self,
        request: Request<VirtualService>,
    ) -> Result<Response<Empty>, Status> {
        match self.repository.create_service(request.get_ref()).await {
            Ok(()) => reply(Empty {}),
            Err(e) => fail(e),
        }
    }

    async fn update_service(
        &self,
        request: Request<VirtualService>,
    ) -> Result<Response<Empty>, Status> {
        match self.repository.update_service(request.get_ref()).await {
            Ok(()) => reply(Empty {}),
            Err(e) => fail(e),
        }
    }

    async fn delete_service(
        &self,
        request: Request<ServiceId>,
    ) -> Result<Response<Empty>, Status> {
        match self.repository.delete_service(&request.get_ref().id).await {
            Ok(()) => reply(Empty {}),
            Err(e) => fail(e),
        }
    }

    async fn get_service(
        &self,
        request: Request<ServiceId>,
    ) -> Result<Response<VirtualService>, Status> {
        let id = &request.get_ref().id;
        match self.repository.get_service(id).await {
            Ok(Some(service)) => reply(service),
            Ok(None) => fail(Error::not_found(format!("service {id:?}"))),
            Err(e) => fail(e),
        }
    }

    async fn list_services(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<VirtualServiceList>, Status> {
        match self.repository.list_services().await {
            Ok(services) => reply(VirtualServiceList { services }),
            Err(e) => fail(e),
        }
    }

    async fn create_server(
        &self,
        request: Request<RealServer>,
    ) -> Result<Response<Empty>, Status> {
        match self.repository.create_server(request.get_ref()).await {
            Ok(()) => reply(Empty {}),
            Err(e) => fail(e),
        }
    }

    async fn update_server(
        &self,
        request: Request<RealServer>,
    ) -> Result<Response<Empty>, Status> {
        match self.repository.update_server(request.get_ref()).await {
            Ok(()) => reply(Empty {}),
            Err(e) => fail(e),
        }
    }

    async fn delete_server(
        &self,
        request: Request<RealServer>,
    ) -> Result<Response<Empty>, Status> {
        let server = request.get_ref();
        let Some(key) = &server.key else {
            return fail(Error::invalid_argument("server key required"));
        };
        match self
            .repository
            .delete_server(&server.service_id, key)
            .await
        {
            Ok(()) => reply(Empty {}),
            Err(e) => fail(e),
        }
    }

    async fn list_servers(
        &self,
        request: Request<ServiceId>,
    ) -> Result<Response<RealServerList>, Status> {
        match self.repository.list_servers(&request.get_ref().id).await {
            Ok(servers) => reply(RealServerList { servers }),
            Err(e) => fail(e),
        }
    }
}
