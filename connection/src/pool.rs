// Copyright (c) 2025 The Haze Project

//! The resilient gateway pool.
//!
//! Keeps up to `max_pool_size` live connections drawn from the network
//! definition. Hosts are picked by weighted random on inverse recent
//! latency; a host whose proxy-error score climbs above the cutoff is
//! evicted and replaced by the fastest of up to `max_pings` candidate
//! pings.

use crate::{
    error::{ConnectError, Result},
    rpc::{ConnectionFactory, GatewayConnection, GatewaySpec},
};
use futures::future::BoxFuture;
use haze_common::{Id, StopToken};
use rand::Rng;
use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Tuning knobs for the host pool.
#[derive(Clone, Debug)]
pub struct HostPoolParams {
    /// Maximum live connections.
    pub max_pool_size: usize,
    /// Candidates pinged in parallel when replacing a host.
    pub max_pings: usize,
    /// Proxy-error score above which a host is evicted.
    pub error_cutoff: f64,
    /// EMA weight for latency samples.
    pub latency_alpha: f64,
    /// EMA weight for proxy-error samples.
    pub error_alpha: f64,
    /// Attempts across different hosts before giving up.
    pub max_retries: u32,
    /// Per-call timeout.
    pub send_timeout: Duration,
}

impl Default for HostPoolParams {
    fn default() -> Self {
        HostPoolParams {
            max_pool_size: 5,
            max_pings: 3,
            error_cutoff: 0.30,
            latency_alpha: 0.25,
            error_alpha: 0.20,
            max_retries: 3,
            send_timeout: Duration::from_secs(30),
        }
    }
}

/// A snapshot of one pool member, for diagnostics and tests.
#[derive(Clone, Debug)]
pub struct HostReport {
    /// The gateway's identity.
    pub gateway_id: Id,
    /// Smoothed round-trip latency in milliseconds.
    pub latency_ms: f64,
    /// Smoothed proxy-error score in `[0, 1]`.
    pub proxy_error: f64,
}

struct HostEntry {
    spec: GatewaySpec,
    conn: Arc<dyn GatewayConnection>,
    latency_ms: f64,
    proxy_error: f64,
}

struct PoolInner {
    hosts: Vec<HostEntry>,
    /// NDF gateways not currently in the pool.
    candidates: Vec<GatewaySpec>,
}

/// The shared connection pool.
pub struct HostPool {
    inner: RwLock<PoolInner>,
    factory: Arc<dyn ConnectionFactory>,
    params: HostPoolParams,
}

/// The closure shape all pool sends use: given a live connection and its
/// gateway id, produce the RPC future.
pub type SendFn<'a, T> =
    &'a (dyn Fn(Arc<dyn GatewayConnection>, Id) -> BoxFuture<'static, Result<T>> + Sync);

impl HostPool {
    /// Build a pool from the NDF gateway list, dialing up to
    /// `max_pool_size` hosts immediately.
    pub async fn new(
        mut specs: Vec<GatewaySpec>,
        factory: Arc<dyn ConnectionFactory>,
        params: HostPoolParams,
    ) -> Result<Self> {
        let mut hosts = Vec::new();
        let mut rejected = Vec::new();
        while hosts.len() < params.max_pool_size && !specs.is_empty() {
            let spec = specs.remove(0);
            match factory.connect(&spec).await {
                Ok(conn) => hosts.push(HostEntry {
                    spec,
                    conn,
                    latency_ms: 100.0,
                    proxy_error: 0.0,
                }),
                Err(e) => {
                    debug!(gateway = %spec.gateway_id, error = %e, "initial dial failed");
                    rejected.push(spec);
                }
            }
        }
        if hosts.is_empty() {
            return Err(ConnectError::PoolExhausted);
        }
        info!(live = hosts.len(), "host pool initialized");
        specs.extend(rejected);
        Ok(HostPool {
            inner: RwLock::new(PoolInner {
                hosts,
                candidates: specs,
            }),
            factory,
            params,
        })
    }

    /// Snapshot the pool state.
    pub async fn report(&self) -> Vec<HostReport> {
        self.inner
            .read()
            .await
            .hosts
            .iter()
            .map(|h| HostReport {
                gateway_id: h.spec.gateway_id,
                latency_ms: h.latency_ms,
                proxy_error: h.proxy_error,
            })
            .collect()
    }

    /// Run `f` against a weighted-random host, retrying transient failures
    /// on other hosts up to `max_retries`.
    pub async fn send_to_any<T>(&self, f: SendFn<'_, T>, stop: &StopToken) -> Result<T> {
        let mut tried = HashSet::new();
        let mut last_err = ConnectError::PoolExhausted;
        for _ in 0..self.params.max_retries {
            if stop.is_stopped() {
                return Err(ConnectError::Cancelled);
            }
            let Some((id, conn)) = self.pick_weighted(&tried).await else {
                break;
            };
            tried.insert(id);
            match self.attempt(&id, conn, f, stop).await {
                Ok(v) => return Ok(v),
                Err(e) if e.retry_elsewhere() => last_err = e,
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    /// Run `f` preferring the given gateways in order, then falling back
    /// to a random pool member.
    pub async fn send_to_preferred<T>(
        &self,
        preferred: &[Id],
        f: SendFn<'_, T>,
        stop: &StopToken,
    ) -> Result<T> {
        let mut tried = HashSet::new();
        let mut last_err = ConnectError::PoolExhausted;
        for id in preferred {
            if stop.is_stopped() {
                return Err(ConnectError::Cancelled);
            }
            let Some(conn) = self.conn_for(*id).await else {
                continue;
            };
            tried.insert(*id);
            match self.attempt(id, conn, f, stop).await {
                Ok(v) => return Ok(v),
                Err(e) if e.retry_elsewhere() => last_err = e,
                Err(e) => return Err(e),
            }
        }
        // None of the preferred hosts worked; one random replacement.
        if let Some((id, conn)) = self.pick_weighted(&tried).await {
            if stop.is_stopped() {
                return Err(ConnectError::Cancelled);
            }
            return self.attempt(&id, conn, f, stop).await;
        }
        Err(last_err)
    }

    async fn attempt<T>(
        &self,
        id: &Id,
        conn: Arc<dyn GatewayConnection>,
        f: SendFn<'_, T>,
        stop: &StopToken,
    ) -> Result<T> {
        let started = Instant::now();
        let mut stop = stop.clone();
        let call = tokio::time::timeout(self.params.send_timeout, f(conn, *id));
        let outcome = tokio::select! {
            res = call => match res {
                Ok(inner) => inner,
                Err(_) => Err(ConnectError::Timeout(self.params.send_timeout)),
            },
            _ = stop.stopped() => Err(ConnectError::Cancelled),
        };
        match outcome {
            Ok(v) => {
                self.record_success(*id, started.elapsed()).await;
                Ok(v)
            }
            Err(ConnectError::Cancelled) => Err(ConnectError::Cancelled),
            Err(e) => {
                self.record_failure(*id).await;
                Err(e)
            }
        }
    }

    /// Connection for a specific gateway: pool member, or an on-demand
    /// dial of the matching NDF candidate.
    async fn conn_for(&self, id: Id) -> Option<Arc<dyn GatewayConnection>> {
        {
            let inner = self.inner.read().await;
            if let Some(h) = inner.hosts.iter().find(|h| h.spec.gateway_id == id) {
                return Some(Arc::clone(&h.conn));
            }
        }
        let spec = {
            let inner = self.inner.read().await;
            inner
                .candidates
                .iter()
                .find(|s| s.gateway_id == id)
                .cloned()?
        };
        match self.factory.connect(&spec).await {
            Ok(conn) => Some(conn),
            Err(e) => {
                debug!(gateway = %id, error = %e, "on-demand dial failed");
                None
            }
        }
    }

    async fn pick_weighted(&self, exclude: &HashSet<Id>) -> Option<(Id, Arc<dyn GatewayConnection>)> {
        let inner = self.inner.read().await;
        let eligible: Vec<&HostEntry> = inner
            .hosts
            .iter()
            .filter(|h| !exclude.contains(&h.spec.gateway_id))
            .filter(|h| h.proxy_error <= self.params.error_cutoff)
            .collect();
        if eligible.is_empty() {
            return None;
        }
        let weights: Vec<f64> = eligible
            .iter()
            .map(|h| 1.0 / h.latency_ms.max(1.0))
            .collect();
        let total: f64 = weights.iter().sum();
        let mut roll = rand::thread_rng().gen_range(0.0..total);
        for (host, w) in eligible.iter().zip(&weights) {
            if roll < *w {
                return Some((host.spec.gateway_id, Arc::clone(&host.conn)));
            }
            roll -= w;
        }
        let last = eligible.last()?;
        Some((last.spec.gateway_id, Arc::clone(&last.conn)))
    }

    async fn record_success(&self, id: Id, latency: Duration) {
        let mut inner = self.inner.write().await;
        if let Some(h) = inner.hosts.iter_mut().find(|h| h.spec.gateway_id == id) {
            let sample = latency.as_secs_f64() * 1000.0;
            h.latency_ms += self.params.latency_alpha * (sample - h.latency_ms);
            h.proxy_error *= 1.0 - self.params.error_alpha;
        }
    }

    async fn record_failure(&self, id: Id) {
        let evicted = {
            let mut inner = self.inner.write().await;
            let Some(h) = inner.hosts.iter_mut().find(|h| h.spec.gateway_id == id) else {
                return;
            };
            h.proxy_error += self.params.error_alpha * (1.0 - h.proxy_error);
            if h.proxy_error > self.params.error_cutoff {
                let pos = inner
                    .hosts
                    .iter()
                    .position(|h| h.spec.gateway_id == id)
                    .expect("host present");
                let evicted = inner.hosts.remove(pos);
                inner.candidates.push(evicted.spec.clone());
                warn!(gateway = %id, "host evicted on proxy-error cutoff");
                true
            } else {
                false
            }
        };
        if evicted {
            self.replace_evicted().await;
        }
    }

    /// Ping up to `max_pings` candidates in parallel and admit the
    /// fastest responder.
    async fn replace_evicted(&self) {
        let picks: Vec<GatewaySpec> = {
            let mut inner = self.inner.write().await;
            let n = self.params.max_pings.min(inner.candidates.len());
            inner.candidates.drain(..n).collect()
        };
        if picks.is_empty() {
            return;
        }
        let pings = picks.iter().map(|spec| {
            let factory = Arc::clone(&self.factory);
            let spec = spec.clone();
            async move {
                let started = Instant::now();
                let conn = factory.connect(&spec).await.ok()?;
                conn.request_tls_certificate().await.ok()?;
                Some((spec, conn, started.elapsed()))
            }
        });
        let mut results: Vec<(GatewaySpec, Arc<dyn GatewayConnection>, Duration)> =
            futures::future::join_all(pings)
                .await
                .into_iter()
                .flatten()
                .collect();
        results.sort_by_key(|(_, _, rtt)| *rtt);
        let mut inner = self.inner.write().await;
        let admitted = if let Some((spec, conn, rtt)) = results.first().cloned() {
            debug!(gateway = %spec.gateway_id, rtt_ms = rtt.as_millis() as u64, "replacement admitted");
            let id = spec.gateway_id;
            inner.hosts.push(HostEntry {
                spec,
                conn,
                latency_ms: (rtt.as_secs_f64() * 1000.0).max(1.0),
                proxy_error: 0.0,
            });
            Some(id)
        } else {
            None
        };
        // Everything not admitted, including failed pings, returns to the
        // candidate list.
        for spec in picks {
            if Some(spec.gateway_id) != admitted {
                inner.candidates.push(spec);
            }
        }
    }
}
