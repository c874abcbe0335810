//! Server bootstrap: listener sockets, worker threads, and the main
//! control thread.

mod worker;

pub use worker::Worker;

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::unbounded;

use crate::access_log::Sink;
use crate::cluster_manager::{ClusterManager, ControlMsg, Subscriber};
use crate::config::Bootstrap;
use crate::edge::EdgeConfig;
use crate::error::Error;
use crate::route::RouteConfig;
use crate::router::{RouterConfig, RouterStats};
use crate::runtime::Snapshot;
use crate::stats::Store;

/// Process-wide options, straight off the CLI.
#[derive(Debug, Clone)]
pub struct Options {
    pub concurrency: usize,
    pub service_cluster: Option<String>,
    pub service_node: Option<String>,
    pub service_zone: String,
    pub file_flush_interval: Duration,
    pub drain_time: Duration,
    pub parent_shutdown_time: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            service_cluster: None,
            service_node: None,
            service_zone: String::new(),
            file_flush_interval: Duration::from_millis(10_000),
            drain_time: Duration::from_secs(600),
            parent_shutdown_time: Duration::from_secs(900),
        }
    }
}

/// A listener as workers consume it: a cloned nonblocking socket plus the
/// listener-scoped config.
pub struct ListenerHandle {
    pub socket: StdTcpListener,
    pub address: SocketAddr,
    pub edge: EdgeConfig,
    pub router_config: Arc<RouterConfig>,
    pub read_buffer_limit: usize,
}

/// Error responses are preassembled wire bytes so failure paths never
/// allocate or re-enter the encoder.
pub fn build_local_replies() -> HashMap<(u16, &'static str), Bytes> {
    let mut replies = HashMap::new();
    for (status, body) in [
        (404u16, ""),
        (204, ""),
        (503, "no healthy upstream"),
        (503, "maintenance mode"),
        (503, "upstream connect error or disconnect/reset before headers"),
        (504, "upstream request timeout"),
    ] {
        replies.insert((status, body), Bytes::from(render_local_reply(status, body)));
    }
    replies
}

pub fn render_local_reply(status: u16, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\ncontent-length: {}\r\n\r\n{}",
        status,
        protocol_http1::reason_phrase(status),
        body.len(),
        body
    )
    .into_bytes()
}

/// Bind listeners, start the flush thread and workers, then run the
/// cluster manager on the calling thread until shutdown.
pub fn run(options: Options, bootstrap: Bootstrap) -> Result<(), Error> {
    let store = Store::new();
    let runtime = Snapshot::new(bootstrap.runtime.clone());

    let access_log = match bootstrap.access_log_path.clone().map(PathBuf::from) {
        Some(path) => crate::access_log::start(
            path,
            options.file_flush_interval,
            &store.scope("filesystem"),
        ),
        None => Sink::disabled(),
    };

    let mut listeners = Vec::new();
    for listener in &bootstrap.listeners {
        let socket = StdTcpListener::bind(listener.address)?;
        socket.set_nonblocking(true)?;
        let route_config: Arc<RouteConfig> = Arc::new(listener.route_config.build());
        let router_config = Arc::new(RouterConfig {
            route_config,
            stats: RouterStats::new(&store.scope(&format!("http.{}", listener.address))),
        });
        listeners.push(Arc::new(ListenerHandle {
            address: listener.address,
            edge: EdgeConfig {
                use_remote_address: listener.use_remote_address,
                service_cluster: options.service_cluster.clone(),
                local_address: listener.address.ip(),
            },
            router_config,
            read_buffer_limit: listener.read_buffer_limit,
            socket,
        }));
        tracing::info!(address = %listener.address, "listener bound");
    }

    let mut manager = ClusterManager::new(
        &bootstrap.clusters,
        bootstrap.local_cluster_name.clone(),
        options.service_zone.clone(),
        runtime.clone(),
        &store.root(),
        access_log.clone(),
    );

    let (control_tx, control_rx) = unbounded::<ControlMsg>();
    let mut handles = Vec::new();
    for worker_id in 0..options.concurrency.max(1) {
        let (snapshot_tx, snapshot_rx) = unbounded();
        let mut worker = Worker::new(
            worker_id,
            &listeners,
            snapshot_rx,
            control_tx.clone(),
            runtime.clone(),
            options.service_zone.clone(),
            access_log.clone(),
        )?;
        manager.subscribe(Subscriber {
            tx: snapshot_tx,
            waker: worker.waker(),
        });
        handles.push(
            std::thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || worker.run())
                .expect("spawn worker thread"),
        );
    }
    tracing::info!(workers = options.concurrency.max(1), "serving");

    // The manager loop runs until shutdown; workers follow.
    manager.run(control_rx);
    for handle in handles {
        let _ = handle.join();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_replies_are_complete_http_responses() {
        let replies = build_local_replies();
        let reply = replies.get(&(503, "no healthy upstream")).unwrap();
        let text = std::str::from_utf8(reply).unwrap();
        assert!(text.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        assert!(text.contains("content-length: 19\r\n"));
        assert!(text.ends_with("\r\n\r\nno healthy upstream"));
    }

    #[test]
    fn rendered_reply_matches_prebuilt() {
        let replies = build_local_replies();
        assert_eq!(
            replies.get(&(404, "")).unwrap().as_ref(),
            render_local_reply(404, "").as_slice()
        );
    }
}
