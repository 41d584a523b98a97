//! etcd v3 client over tonic.
//!
//! Speaks the KV and Lease services directly with the messages in
//! `proto.rs`. Every RPC runs under the configured request deadline.

use async_trait::async_trait;
use parking_lot::Mutex;
use prost::Message;
use std::collections::BTreeSet;
use std::time::Duration;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, warn};

use super::proto::{self, compare::TargetUnion, request_op};
use super::{
    child_segment, dir_prefix, prefix_range_end, with_deadline, Condition, KeyMatch, KvEntry,
    KvStore, LeaseId,
};
use crate::config::IpamConf;
use crate::error::{CniError, Result};

/// etcd-backed store
pub struct EtcdStore {
    endpoints: Vec<String>,
    dial_timeout: Duration,
    request_timeout: Duration,
    client: Mutex<Option<Grpc<Channel>>>,
}

impl EtcdStore {
    /// Create a store client. No connection is made until first use.
    pub fn new(conf: &IpamConf) -> Self {
        Self {
            endpoints: conf.endpoints.clone(),
            dial_timeout: conf.dial_timeout(),
            request_timeout: conf.request_timeout(),
            client: Mutex::new(None),
        }
    }

    async fn dial(&self) -> Result<Channel> {
        let mut last_error = String::from("no endpoints configured");

        for uri in &self.endpoints {
            let endpoint = Endpoint::from_shared(uri.clone())
                .map_err(|e| CniError::Config(format!("invalid etcd endpoint {}: {}", uri, e)))?
                .connect_timeout(self.dial_timeout)
                .timeout(self.request_timeout);

            match endpoint.connect().await {
                Ok(channel) => {
                    debug!("Connected to etcd at {}", uri);
                    return Ok(channel);
                }
                Err(e) => {
                    warn!("Failed to connect to etcd at {}: {}", uri, e);
                    last_error = format!("{}: {}", uri, e);
                }
            }
        }

        Err(CniError::StoreUnavailable(format!(
            "no etcd endpoint reachable ({})",
            last_error
        )))
    }

    async fn grpc(&self) -> Result<Grpc<Channel>> {
        if let Some(grpc) = self.client.lock().clone() {
            return Ok(grpc);
        }

        let channel = self.dial().await?;
        let grpc = Grpc::new(channel);
        *self.client.lock() = Some(grpc.clone());
        Ok(grpc)
    }

    async fn unary<Req, Resp>(&self, path: &'static str, request: Req) -> Result<Resp>
    where
        Req: Message + Send + Sync + 'static,
        Resp: Message + Default + Send + Sync + 'static,
    {
        let mut grpc = self.grpc().await?;

        with_deadline(self.request_timeout, path, async move {
            grpc.ready()
                .await
                .map_err(|e| CniError::StoreUnavailable(format!("etcd not ready: {}", e)))?;

            let codec = ProstCodec::<Req, Resp>::default();
            let response = grpc
                .unary(tonic::Request::new(request), PathAndQuery::from_static(path), codec)
                .await?;
            Ok(response.into_inner())
        })
        .await
    }

    async fn range(&self, request: proto::RangeRequest) -> Result<proto::RangeResponse> {
        self.unary(proto::KV_RANGE, request).await
    }
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn connect(&self) -> Result<()> {
        self.grpc().await.map(|_| ())
    }

    async fn disconnect(&self) {
        if self.client.lock().take().is_some() {
            debug!("Disconnected from etcd");
        }
    }

    async fn list_child_keys(&self, prefix: &str) -> Result<BTreeSet<String>> {
        let dir = dir_prefix(prefix);
        let response = self
            .range(proto::RangeRequest {
                key: dir.as_bytes().to_vec(),
                range_end: prefix_range_end(dir.as_bytes()),
                keys_only: true,
                ..Default::default()
            })
            .await?;

        let mut children = BTreeSet::new();
        for kv in response.kvs {
            let key = String::from_utf8_lossy(&kv.key);
            if let Some(child) = child_segment(&dir, &key) {
                children.insert(child.to_string());
            }
        }
        Ok(children)
    }

    async fn list_entries(&self, key: &str, matching: KeyMatch) -> Result<Vec<KvEntry>> {
        let range_end = match matching {
            KeyMatch::Exact => Vec::new(),
            KeyMatch::Prefix => prefix_range_end(key.as_bytes()),
        };
        let response = self
            .range(proto::RangeRequest {
                key: key.as_bytes().to_vec(),
                range_end,
                ..Default::default()
            })
            .await?;

        Ok(response
            .kvs
            .into_iter()
            .map(|kv| KvEntry {
                key: String::from_utf8_lossy(&kv.key).into_owned(),
                value: String::from_utf8_lossy(&kv.value).into_owned(),
                lease: (kv.lease != 0).then_some(LeaseId(kv.lease)),
            })
            .collect())
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        let _: proto::PutResponse = self
            .unary(
                proto::KV_PUT,
                proto::PutRequest {
                    key: key.as_bytes().to_vec(),
                    value: value.as_bytes().to_vec(),
                    lease: lease.map(|l| l.0).unwrap_or(0),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let response: proto::DeleteRangeResponse = self
            .unary(
                proto::KV_DELETE_RANGE,
                proto::DeleteRangeRequest {
                    key: key.as_bytes().to_vec(),
                    ..Default::default()
                },
            )
            .await?;
        Ok(response.deleted > 0)
    }

    async fn compare_and_put_all(
        &self,
        guard_key: &str,
        condition: Condition,
        writes: &[(String, String)],
        lease: LeaseId,
    ) -> Result<bool> {
        let (target, target_union) = match condition {
            Condition::Absent => (proto::TARGET_CREATE, TargetUnion::CreateRevision(0)),
            Condition::BoundTo(expected) => (proto::TARGET_LEASE, TargetUnion::Lease(expected.0)),
        };

        let request = proto::TxnRequest {
            compare: vec![proto::Compare {
                result: proto::COMPARE_EQUAL,
                target,
                key: guard_key.as_bytes().to_vec(),
                target_union: Some(target_union),
                range_end: Vec::new(),
            }],
            success: writes
                .iter()
                .map(|(key, value)| proto::RequestOp {
                    request: Some(request_op::Request::RequestPut(proto::PutRequest {
                        key: key.as_bytes().to_vec(),
                        value: value.as_bytes().to_vec(),
                        lease: lease.0,
                        ..Default::default()
                    })),
                })
                .collect(),
            failure: Vec::new(),
        };

        let response: proto::TxnResponse = self.unary(proto::KV_TXN, request).await?;
        Ok(response.succeeded)
    }

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        let response: proto::LeaseGrantResponse = self
            .unary(proto::LEASE_GRANT, proto::LeaseGrantRequest { ttl: ttl_secs, id: 0 })
            .await?;

        if !response.error.is_empty() {
            return Err(CniError::StoreUnavailable(format!(
                "lease grant refused: {}",
                response.error
            )));
        }
        Ok(LeaseId(response.id))
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Option<i64>> {
        let mut grpc = self.grpc().await?;

        with_deadline(self.request_timeout, proto::LEASE_KEEP_ALIVE, async move {
            grpc.ready()
                .await
                .map_err(|e| CniError::StoreUnavailable(format!("etcd not ready: {}", e)))?;

            let codec =
                ProstCodec::<proto::LeaseKeepAliveRequest, proto::LeaseKeepAliveResponse>::default();
            let outbound = tokio_stream::once(proto::LeaseKeepAliveRequest { id: lease.0 });
            let mut inbound = grpc
                .streaming(
                    tonic::Request::new(outbound),
                    PathAndQuery::from_static(proto::LEASE_KEEP_ALIVE),
                    codec,
                )
                .await?
                .into_inner();

            // A closed stream or a non-positive TTL both mean the lease is gone.
            match inbound.message().await? {
                Some(response) if response.ttl > 0 => Ok(Some(response.ttl)),
                _ => Ok(None),
            }
        })
        .await
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let result: Result<proto::LeaseRevokeResponse> = self
            .unary(proto::LEASE_REVOKE, proto::LeaseRevokeRequest { id: lease.0 })
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(CniError::StoreUnavailable(msg)) if msg.contains("lease not found") => {
                debug!("Lease {} already gone", lease);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn lease_time_to_live(&self, lease: LeaseId) -> Result<Option<i64>> {
        let response: proto::LeaseTimeToLiveResponse = self
            .unary(
                proto::LEASE_TIME_TO_LIVE,
                proto::LeaseTimeToLiveRequest {
                    id: lease.0,
                    keys: false,
                },
            )
            .await?;
        Ok((response.ttl > 0).then_some(response.ttl))
    }
}
