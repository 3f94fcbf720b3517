//! The socket seam under the resolver.
//!
//! The resolver never touches sockets; it talks to a [`Wire`], and the
//! wire reports completions by scheduling resolver calls on the engine.
//! [`TokioWire`] is the production implementation; [`MockWire`] records
//! traffic for tests, which then inject replies directly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;

use crate::event::{Call, Engine};

use super::resolver::Resolver;

/// Outbound DNS traffic. Inbound traffic arrives via `Resolver::receive`
/// and the `Resolver::vc_*` events, scheduled by the implementation.
pub trait Wire: Send + Sync {
    fn udp_send(&self, ns_idx: usize, to: SocketAddr, payload: &[u8]);
    fn vc_connect(&self, ns_idx: usize, to: SocketAddr, timeout: Duration);
    /// Write raw (already length-prefixed) bytes on the circuit.
    fn vc_send(&self, ns_idx: usize, chunk: &[u8]);
    fn vc_close(&self, ns_idx: usize);
}

struct VcIo {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

/// Tokio-backed sockets: one UDP socket per address family, one TCP
/// stream per nameserver circuit.
pub struct TokioWire {
    engine: Arc<Engine>,
    resolver: Mutex<Weak<Resolver>>,
    v4: Option<Arc<UdpSocket>>,
    v6: Option<Arc<UdpSocket>>,
    vcs: Arc<Mutex<HashMap<usize, VcIo>>>,
}

impl TokioWire {
    /// Bind the UDP sockets. Failing to open any DNS socket is fatal to
    /// the caller.
    pub async fn bind(engine: Arc<Engine>, want_v6: bool) -> Result<Arc<TokioWire>> {
        let v4 = match UdpSocket::bind(("0.0.0.0", 0)).await {
            Ok(s) => Some(Arc::new(s)),
            Err(err) => {
                tracing::warn!(%err, "could not open IPv4 DNS socket");
                None
            }
        };
        let v6 = if want_v6 {
            match UdpSocket::bind(("::", 0)).await {
                Ok(s) => Some(Arc::new(s)),
                Err(err) => {
                    tracing::warn!(%err, "could not open IPv6 DNS socket");
                    None
                }
            }
        } else {
            None
        };
        if v4.is_none() && v6.is_none() {
            anyhow::bail!("could not create a DNS socket");
        }
        Ok(Arc::new(TokioWire {
            engine,
            resolver: Mutex::new(Weak::new()),
            v4,
            v6,
            vcs: Arc::new(Mutex::new(HashMap::new())),
        }))
    }

    /// Wire up the resolver and start the datagram read loops.
    pub fn start(self: &Arc<Self>, resolver: &Arc<Resolver>) {
        *self.resolver.lock() = Arc::downgrade(resolver);
        for sock in [self.v4.clone(), self.v6.clone()].into_iter().flatten() {
            let engine = self.engine.clone();
            let weak = Arc::downgrade(resolver);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 65_535];
                loop {
                    let Ok((len, from)) = sock.recv_from(&mut buf).await else {
                        break;
                    };
                    let Some(resolver) = weak.upgrade() else { break };
                    let data = buf[..len].to_vec();
                    engine.schedule(Call::new("Resolver::receive", move || {
                        resolver.receive(from, &data);
                    }));
                }
            });
        }
    }

}

impl Wire for TokioWire {
    fn udp_send(&self, _ns_idx: usize, to: SocketAddr, payload: &[u8]) {
        let sock = if to.is_ipv6() {
            self.v6.clone()
        } else {
            self.v4.clone()
        };
        let Some(sock) = sock else {
            tracing::warn!(%to, "no socket for nameserver address family");
            return;
        };
        let payload = payload.to_vec();
        tokio::spawn(async move {
            if let Err(err) = sock.send_to(&payload, to).await {
                tracing::warn!(%to, %err, "DNS sendto failed");
            }
        });
    }

    fn vc_connect(&self, ns_idx: usize, to: SocketAddr, timeout: Duration) {
        let engine = self.engine.clone();
        let weak = self.resolver.lock().clone();
        let vcs = self.vcs.clone();
        // connect on a task; register the circuit when it lands
        tokio::spawn(async move {
            let conn = tokio::time::timeout(timeout, TcpStream::connect(to)).await;
            let stream = match conn {
                Ok(Ok(s)) => s,
                _ => {
                    schedule_event(&engine, &weak, move |r| r.vc_connect_failed(ns_idx));
                    return;
                }
            };
            let (mut read_half, mut write_half) = stream.into_split();
            let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
            vcs.lock().insert(ns_idx, VcIo { tx });

            // writer: one chunk at a time, completion reported back
            {
                let engine = engine.clone();
                let weak = weak.clone();
                tokio::spawn(async move {
                    while let Some(chunk) = rx.recv().await {
                        if write_half.write_all(&chunk).await.is_err() {
                            break;
                        }
                        schedule_event(&engine, &weak, move |r| r.vc_write_done(ns_idx));
                    }
                });
            }

            // reader: raw chunks; the circuit reassembles frames
            {
                let engine = engine.clone();
                let weak = weak.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 16_384];
                    loop {
                        match read_half.read(&mut buf).await {
                            Ok(0) | Err(_) => {
                                schedule_event(&engine, &weak, move |r| r.vc_closed(ns_idx));
                                break;
                            }
                            Ok(n) => {
                                let data = buf[..n].to_vec();
                                schedule_event(&engine, &weak, move |r| r.vc_data(ns_idx, &data));
                            }
                        }
                    }
                });
            }

            schedule_event(&engine, &weak, move |r| r.vc_connected(ns_idx));
        });
    }

    fn vc_send(&self, ns_idx: usize, chunk: &[u8]) {
        let vcs = self.vcs.lock();
        if let Some(io) = vcs.get(&ns_idx) {
            let _ = io.tx.send(chunk.to_vec());
        }
    }

    fn vc_close(&self, ns_idx: usize) {
        self.vcs.lock().remove(&ns_idx);
    }
}

fn schedule_event(
    engine: &Arc<Engine>,
    weak: &Weak<Resolver>,
    f: impl FnOnce(Arc<Resolver>) + Send + 'static,
) {
    let weak = weak.clone();
    engine.schedule(Call::new("Resolver::vcEvent", move || {
        if let Some(r) = weak.upgrade() {
            f(r);
        }
    }));
}

/// Test wire: records everything, sends nothing.
pub struct MockWire {
    udp: Mutex<Vec<(usize, SocketAddr, Vec<u8>)>>,
    connects: Mutex<Vec<(usize, SocketAddr)>>,
    vc: Mutex<Vec<(usize, Vec<u8>)>>,
    closed: Mutex<Vec<usize>>,
}

impl MockWire {
    pub fn new() -> Arc<MockWire> {
        Arc::new(MockWire {
            udp: Mutex::new(Vec::new()),
            connects: Mutex::new(Vec::new()),
            vc: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
        })
    }

    pub fn udp_sent(&self) -> Vec<(usize, SocketAddr, Vec<u8>)> {
        self.udp.lock().clone()
    }

    pub fn vc_connects(&self) -> Vec<(usize, SocketAddr)> {
        self.connects.lock().clone()
    }

    pub fn vc_sent(&self) -> Vec<(usize, Vec<u8>)> {
        self.vc.lock().clone()
    }

    pub fn vc_closes(&self) -> Vec<usize> {
        self.closed.lock().clone()
    }
}

impl Wire for MockWire {
    fn udp_send(&self, ns_idx: usize, to: SocketAddr, payload: &[u8]) {
        self.udp.lock().push((ns_idx, to, payload.to_vec()));
    }

    fn vc_connect(&self, ns_idx: usize, to: SocketAddr, _timeout: Duration) {
        self.connects.lock().push((ns_idx, to));
    }

    fn vc_send(&self, ns_idx: usize, chunk: &[u8]) {
        self.vc.lock().push((ns_idx, chunk.to_vec()));
    }

    fn vc_close(&self, ns_idx: usize) {
        self.closed.lock().push(ns_idx);
    }
}
