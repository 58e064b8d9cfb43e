//! Worker side of the dispatcher connection.

use std::io;
use std::time::Duration;

use planductor_common::tls::{self, TlsError};
use planductor_common::{
    BoxedStream, DispatcherReply, FrameError, MessageChannel, ReplyStatus, WorkerMessage,
};
use tokio::net::TcpStream;
use tokio::time;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::config::DispatcherEndpoint;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("TLS handshake with {addr} failed: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("dispatcher closed the connection")]
    Closed,
    #[error("no reply from the dispatcher within {}s", .0.as_secs())]
    TimedOut(Duration),
}

/// How to reach the dispatcher. TLS material is loaded once, up front.
#[derive(Clone)]
pub struct Transport {
    addr: String,
    tls: Option<(TlsConnector, ServerName<'static>)>,
}

impl Transport {
    pub fn plain(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            tls: None,
        }
    }

    pub fn from_endpoint(endpoint: &DispatcherEndpoint) -> Result<Self, TransportError> {
        let tls = match &endpoint.ca_file {
            Some(ca_file) => {
                let connector = tls::connector(ca_file)?;
                let name = endpoint.server_name.as_deref().unwrap_or(&endpoint.host);
                Some((connector, tls::server_name(name)?))
            }
            None => None,
        };
        Ok(Self {
            addr: endpoint.address(),
            tls,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn connect(&self) -> Result<DispatcherLink, TransportError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|source| TransportError::Connect {
                addr: self.addr.clone(),
                source,
            })?;

        let stream: BoxedStream = match &self.tls {
            Some((connector, name)) => {
                let tls = connector
                    .connect(name.clone(), stream)
                    .await
                    .map_err(|source| TransportError::Handshake {
                        addr: self.addr.clone(),
                        source,
                    })?;
                Box::new(tls)
            }
            None => Box::new(stream),
        };
        debug!(addr = %self.addr, tls = self.tls.is_some(), "Connected to dispatcher");

        Ok(DispatcherLink {
            channel: MessageChannel::new(stream),
        })
    }
}

/// One live connection to the dispatcher.
pub struct DispatcherLink {
    channel: MessageChannel<BoxedStream>,
}

impl DispatcherLink {
    pub async fn send(&mut self, message: &WorkerMessage) -> Result<(), TransportError> {
        self.channel.send(message).await?;
        Ok(())
    }

    pub async fn await_reply(&mut self) -> Result<DispatcherReply, TransportError> {
        let reply: DispatcherReply = self
            .channel
            .recv()
            .await?
            .ok_or(TransportError::Closed)?;
        if reply.status != ReplyStatus::Ok {
            warn!("Dispatcher replied with an unrecognised status");
        }
        Ok(reply)
    }

    pub async fn await_reply_within(
        &mut self,
        limit: Duration,
    ) -> Result<DispatcherReply, TransportError> {
        time::timeout(limit, self.await_reply())
            .await
            .map_err(|_| TransportError::TimedOut(limit))?
    }

    /// Send `message` and wait for the dispatcher's reply.
    pub async fn request(
        &mut self,
        message: &WorkerMessage,
    ) -> Result<DispatcherReply, TransportError> {
        self.send(message).await?;
        self.await_reply().await
    }

    pub async fn close(mut self) {
        if let Err(err) = self.channel.shutdown().await {
            debug!("Error closing dispatcher connection: {}", err);
        }
    }
}
