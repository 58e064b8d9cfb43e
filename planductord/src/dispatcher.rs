//! Connection multiplexer and control loop.
//!
//! One loop owns the [`TaskRegistry`] and waits on the listening socket, the
//! shutdown signal and the request channel. Each accepted connection gets a
//! task that only does I/O (TLS handshake, framing) and forwards decoded
//! messages to the loop, which answers through a oneshot.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use planductor_common::{
    snippet, BoxedStream, CompletionReport, DispatcherReply, FrameError, MessageChannel,
    WorkerMessage,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::config::ListenSettings;
use crate::registry::{RegistryError, TaskRegistry};

const REQUEST_QUEUE_DEPTH: usize = 64;
const LOG_SNIPPET_LIMIT: usize = 256;

struct Request {
    peer: SocketAddr,
    message: WorkerMessage,
    reply: oneshot::Sender<DispatcherReply>,
}

#[derive(Clone)]
struct ConnectionOptions {
    acceptor: Option<TlsAcceptor>,
    handshake_timeout: Duration,
    max_message_bytes: usize,
}

pub struct Dispatcher {
    listener: TcpListener,
    registry: TaskRegistry,
    options: ConnectionOptions,
}

impl Dispatcher {
    pub async fn bind(
        settings: &ListenSettings,
        acceptor: Option<TlsAcceptor>,
        registry: TaskRegistry,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(&settings.bind).await?;
        Ok(Self {
            listener,
            registry,
            options: ConnectionOptions {
                acceptor,
                handshake_timeout: settings.handshake_timeout(),
                max_message_bytes: settings.max_message_bytes,
            },
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` resolves, then hand the registry back.
    pub async fn run<F>(self, shutdown: F) -> TaskRegistry
    where
        F: Future<Output = ()>,
    {
        let Dispatcher {
            listener,
            mut registry,
            options,
        } = self;
        let (requests_tx, mut requests) = mpsc::channel::<Request>(REQUEST_QUEUE_DEPTH);
        tokio::pin!(shutdown);

        info!(
            addr = ?listener.local_addr().ok(),
            tls = options.acceptor.is_some(),
            "Dispatcher listening"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting workers");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Connection accepted");
                        tokio::spawn(serve_connection(
                            stream,
                            peer,
                            options.clone(),
                            requests_tx.clone(),
                        ));
                    }
                    Err(err) => warn!("Accept failed: {}", err),
                },
                Some(request) = requests.recv() => {
                    let worker = request.peer.to_string();
                    let reply = handle_message(&mut registry, &worker, request.message);
                    if request.reply.send(reply).is_err() {
                        debug!(peer = %request.peer, "Connection went away before the reply");
                    }
                }
            }
        }

        let summary = registry.summary();
        info!(
            unassigned = summary.unassigned,
            assigned = summary.assigned,
            complete = summary.complete,
            "Final registry state"
        );
        registry
    }
}

/// Apply one worker message to the registry and build the reply.
pub fn handle_message(
    registry: &mut TaskRegistry,
    worker: &str,
    message: WorkerMessage,
) -> DispatcherReply {
    match message {
        WorkerMessage::Ready => {
            let task = registry.next_available(worker);
            match &task {
                Some(spec) => {
                    info!(peer = worker, task_id = %spec.name, "Task assigned");
                    log_summary(registry);
                }
                None => info!(peer = worker, "No unassigned task left"),
            }
            DispatcherReply::assignment(task)
        }
        WorkerMessage::Finished { task: Some(report) }
        | WorkerMessage::Complete { task: report } => {
            record_completion(registry, worker, report);
            DispatcherReply::ack()
        }
        WorkerMessage::Finished { task: None } => {
            debug!(peer = worker, "Worker finished, results to follow");
            DispatcherReply::ack()
        }
        WorkerMessage::Unknown => {
            debug!(peer = worker, "Unrecognised status acknowledged");
            DispatcherReply::ack()
        }
    }
}

fn record_completion(registry: &mut TaskRegistry, worker: &str, report: CompletionReport) {
    let CompletionReport {
        task_id,
        end_time,
        output,
        results,
    } = report;
    let reported = results.len();
    let valid = results.iter().filter(|result| result.valid).count();

    match registry.complete(&task_id, results, end_time, output) {
        Ok(record) => {
            if record.owner.as_deref() != Some(worker) {
                // Owners are connection addresses; a reconnecting worker
                // reports from a new one.
                debug!(
                    task_id = %task_id,
                    owner = ?record.owner,
                    peer = worker,
                    "Completion reported from a different connection"
                );
            }
            info!(
                task_id = %task_id,
                peer = worker,
                results = reported,
                valid,
                "Task complete"
            );
            log_summary(registry);
        }
        Err(err) => {
            let reason = match &err {
                RegistryError::NotFound(_) => "unknown task",
                RegistryError::AlreadyComplete(_) => "duplicate completion",
                RegistryError::NotAssigned(_) => "task never assigned",
                RegistryError::Duplicate(_) => "duplicate task",
            };
            warn!(task_id = %task_id, peer = worker, reason, "Registry anomaly: {}", err);
        }
    }
}

fn log_summary(registry: &TaskRegistry) {
    let summary = registry.summary();
    info!(
        unassigned = summary.unassigned,
        assigned = summary.assigned,
        complete = summary.complete,
        "Registry state"
    );
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    options: ConnectionOptions,
    requests: mpsc::Sender<Request>,
) {
    let stream: BoxedStream = match options.acceptor {
        Some(acceptor) => {
            match time::timeout(options.handshake_timeout, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => Box::new(tls),
                Ok(Err(err)) => {
                    warn!(%peer, "TLS handshake failed: {}", err);
                    return;
                }
                Err(_) => {
                    warn!(
                        %peer,
                        timeout_secs = options.handshake_timeout.as_secs(),
                        "TLS handshake timed out"
                    );
                    return;
                }
            }
        }
        None => Box::new(stream),
    };
    let mut channel = MessageChannel::with_limit(stream, options.max_message_bytes);

    loop {
        let reply = match channel.recv::<WorkerMessage>().await {
            Ok(Some(message)) => {
                debug!(%peer, status = message.status(), "Message received");
                let (reply_tx, reply_rx) = oneshot::channel();
                let request = Request {
                    peer,
                    message,
                    reply: reply_tx,
                };
                if requests.send(request).await.is_err() {
                    debug!(%peer, "Dispatcher stopped, closing connection");
                    break;
                }
                match reply_rx.await {
                    Ok(reply) => reply,
                    Err(_) => break,
                }
            }
            Ok(None) => {
                debug!(%peer, "Connection closed by worker");
                break;
            }
            Err(FrameError::Decode { source, raw }) => {
                warn!(
                    %peer,
                    raw = %snippet(&raw, LOG_SNIPPET_LIMIT),
                    "Malformed message acknowledged: {}",
                    source
                );
                DispatcherReply::ack()
            }
            Err(err) => {
                warn!(%peer, "Dropping connection: {}", err);
                break;
            }
        };

        if let Err(err) = channel.send(&reply).await {
            warn!(%peer, "Failed to reply: {}", err);
            break;
        }
    }
}
