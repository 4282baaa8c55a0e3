use std::{collections::HashMap, io, net::SocketAddr, sync::Mutex};

use k8s_offload_core::backoff::TUNNEL_RECONNECT_BACKOFF;
use log::{debug, info, warn};
use tokio::{
    io::copy_bidirectional,
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinHandle,
    time::sleep,
};

/// Forwards local TCP connections into a remote unit's tunnel endpoint.
///
/// Connecting out is retried with backoff for as long as the bridge lives,
/// so a remote restart only costs the in-flight streams; the next local
/// connection succeeds once the endpoint is reachable again. Nothing is
/// buffered across reconnects, this is best-effort transport.
pub struct TunnelBridge {
    listener: TcpListener,
    remote_addr: String,
    shutdown: watch::Receiver<bool>,
}

impl TunnelBridge {
    pub async fn bind(
        local_addr: SocketAddr,
        remote_addr: String,
        shutdown: watch::Receiver<bool>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(local_addr).await?;

        Ok(Self {
            listener,
            remote_addr,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(mut self) {
        info!(
            "Tunnel bridge listening on {:?}, forwarding to '{}'",
            self.listener.local_addr(),
            self.remote_addr
        );

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Tunnel connection accepted from {peer}");

                        let remote_addr = self.remote_addr.clone();
                        let shutdown = self.shutdown.clone();

                        tokio::spawn(forward(stream, remote_addr, shutdown));
                    }
                    Err(error) => {
                        warn!("Tunnel bridge couldn't accept a connection! {error:?}");
                    }
                },
                _ = self.shutdown.changed() => {
                    info!("Tunnel bridge to '{}' shutting down", self.remote_addr);
                    return;
                }
            }
        }
    }
}

async fn forward(mut local: TcpStream, remote_addr: String, mut shutdown: watch::Receiver<bool>) {
    let mut remote = match connect_with_backoff(&remote_addr, &mut shutdown).await {
        Some(remote) => remote,
        None => return,
    };

    tokio::select! {
        result = copy_bidirectional(&mut local, &mut remote) => {
            if let Err(error) = result {
                debug!("Tunnel stream to '{remote_addr}' ended: {error:?}");
            }
        }
        _ = shutdown.changed() => (),
    }
}

async fn connect_with_backoff(
    remote_addr: &str,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<TcpStream> {
    for attempt in 0.. {
        match TcpStream::connect(remote_addr).await {
            Ok(stream) => return Some(stream),
            Err(error) => {
                let delay = TUNNEL_RECONNECT_BACKOFF.delay(attempt);

                warn!("Couldn't reach tunnel endpoint '{remote_addr}', retrying in {delay:?}! {error:?}");

                tokio::select! {
                    _ = sleep(delay) => (),
                    _ = shutdown.changed() => return None,
                }
            }
        }
    }

    None
}

struct ActiveTunnel {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Live bridges keyed by the owning resource's uid. Reconcilers ensure a
/// bridge exists while their resource runs and drop it on teardown.
#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: Mutex<HashMap<String, ActiveTunnel>>,
}

impl TunnelRegistry {
    pub fn contains(&self, uid: &str) -> bool {
        self.tunnels.lock().unwrap().contains_key(uid)
    }

    /// Spawns a bridge for the resource unless one is already up.
    pub async fn ensure(
        &self,
        uid: &str,
        local_port: u16,
        remote_addr: &str,
    ) -> io::Result<()> {
        if self.contains(uid) {
            return Ok(());
        }

        let (sender, receiver) = watch::channel(false);
        let local_addr = SocketAddr::from(([0, 0, 0, 0], local_port));
        let bridge = TunnelBridge::bind(local_addr, remote_addr.to_owned(), receiver).await?;
        let task = tokio::spawn(bridge.run());

        self.tunnels.lock().unwrap().insert(
            uid.to_owned(),
            ActiveTunnel {
                shutdown: sender,
                task,
            },
        );

        Ok(())
    }

    pub fn remove(&self, uid: &str) {
        let Some(tunnel) = self.tunnels.lock().unwrap().remove(uid) else {
            return;
        };

        if tunnel.shutdown.send(true).is_err() {
            tunnel.task.abort();
        }
    }
}
