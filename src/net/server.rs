//! Blocking TCP server over a shared engine.
//!
//! The accept loop runs non-blocking with a short sleep so it can observe
//! the shutdown flag; accepted sockets are fanned out to a fixed pool of
//! worker threads over a bounded channel. Every worker serves its
//! connection to completion: read a frame, run the engine operation, write
//! the response. Writes serialize on the engine's writer seat; reads run
//! concurrently on snapshots.

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver};
use eyre::{Result, WrapErr};
use tracing::{debug, error, info, warn};

use crate::engine::Engine;

use super::proto::{self, Command, Response};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const CONNECTION_QUEUE: usize = 128;
const READ_TIMEOUT: Duration = Duration::from_secs(30);

enum WorkerMessage {
    Connection(TcpStream),
    Shutdown,
}

/// Cloneable handle used to stop a running server from another thread.
#[derive(Clone)]
pub struct ServerHandle {
    shutdown: Arc<AtomicBool>,
}

impl ServerHandle {
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

pub struct Server {
    engine: Arc<Engine>,
    listener: TcpListener,
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    active_connections: Arc<AtomicUsize>,
}

impl Server {
    /// Binds the listener; the accept loop starts with [`Server::run`].
    pub fn bind(engine: Arc<Engine>, addr: &str) -> Result<Self> {
        let listener =
            TcpListener::bind(addr).wrap_err_with(|| format!("failed to bind to {}", addr))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            engine,
            listener,
            local_addr,
            shutdown: Arc::new(AtomicBool::new(false)),
            active_connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    /// Serves until the shutdown handle fires, then drains the workers.
    pub fn run(self) -> Result<()> {
        let workers = thread::available_parallelism().map(|p| p.get()).unwrap_or(4);
        let (sender, receiver) = bounded::<WorkerMessage>(CONNECTION_QUEUE);

        info!(addr = %self.local_addr, workers, "server listening");

        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let worker = Worker {
                id: worker_id,
                receiver: receiver.clone(),
                engine: self.engine.clone(),
                active_connections: self.active_connections.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("wrendb-worker-{}", worker_id))
                .spawn(move || worker.run())
                .wrap_err("failed to spawn worker thread")?;
            handles.push(handle);
        }

        while !self.shutdown.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    if sender.send(WorkerMessage::Connection(stream)).is_err() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    if !self.shutdown.load(Ordering::Relaxed) {
                        error!(error = %e, "accept failed");
                    }
                }
            }
        }

        info!("server shutting down");
        for _ in &handles {
            let _ = sender.send(WorkerMessage::Shutdown);
        }
        for handle in handles {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
        info!("server stopped");

        Ok(())
    }
}

struct Worker {
    id: usize,
    receiver: Receiver<WorkerMessage>,
    engine: Arc<Engine>,
    active_connections: Arc<AtomicUsize>,
}

impl Worker {
    fn run(self) {
        debug!(worker = self.id, "worker started");

        while let Ok(message) = self.receiver.recv() {
            match message {
                WorkerMessage::Connection(stream) => self.serve(stream),
                WorkerMessage::Shutdown => break,
            }
        }

        debug!(worker = self.id, "worker stopped");
    }

    fn serve(&self, stream: TcpStream) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);

        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        if let Err(e) = self.serve_inner(stream) {
            warn!(%peer, error = %e, "connection ended with error");
        } else {
            debug!(%peer, "connection closed");
        }

        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    fn serve_inner(&self, mut stream: TcpStream) -> Result<()> {
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        stream.set_nodelay(true)?;

        while let Some((tag, payload)) = proto::read_frame(&mut stream)? {
            let response = match proto::decode_command(tag, &payload) {
                Ok(command) => self.dispatch(command),
                Err(e) => Response::error(&e.to_string()),
            };
            proto::write_frame(&mut stream, response.status as u8, &response.payload)?;
        }

        Ok(())
    }

    fn dispatch(&self, command: Command) -> Response {
        match command {
            Command::Get { key } => match self.engine.get(&key) {
                Ok(Some(value)) => Response::value(value),
                Ok(None) => Response::not_found(),
                Err(e) => Response::error(&e.to_string()),
            },
            Command::Set { key, value } => match self.engine.set(&key, &value) {
                Ok(()) => Response::ok(),
                Err(e) => Response::error(&e.to_string()),
            },
            Command::Del { key } => match self.engine.delete(&key) {
                Ok(true) => Response::ok(),
                Ok(false) => Response::not_found(),
                Err(e) => Response::error(&e.to_string()),
            },
            Command::Ping => Response::ok(),
        }
    }
}
