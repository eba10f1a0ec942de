//! Establishing and authenticating a region connection.
//!
//! The sequence is fixed: TCP connect, a plaintext `start-tls` exchange, the
//! TLS upgrade, then `identify`, `authenticate` and `register` over the
//! encrypted stream. Authentication is mutual; the region challenges this
//! side over the same socket while our own challenge is in flight, so the
//! exchange loop answers inbound requests instead of treating them as noise.

use rand::RngCore;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::net::discovery::EventLoopId;
use crate::net::frame::{read_frame, write_frame, Envelope, FrameError};
use crate::rpc::messages::{
    AuthenticateRequest, AuthenticateResponse, Command, FaultKind, IdentifyResponse,
    RegisterRequest, RegisterResponse,
};
use crate::util::ident::{IdentStore, SharedSecret};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const STEP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("cannot connect to {address}: {source}")]
    Connect {
        address: SocketAddr,
        source: std::io::Error,
    },
    #[error("handshake step '{0}' timed out")]
    Timeout(&'static str),
    #[error("TLS upgrade failed: {0}")]
    Tls(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("connected to event loop '{got}' while expecting '{expected}'")]
    WrongEventLoop {
        expected: EventLoopId,
        got: String,
    },
    #[error("region failed the shared-secret challenge")]
    AuthenticationFailed,
    #[error("region rejected registration: {0}")]
    RegistrationRejected(String),
}

impl HandshakeError {
    /// Routine churn while a region endpoint is down or restarting, as
    /// opposed to failures an operator should look at.
    pub fn is_routine(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Timeout(_))
    }
}

/// Everything a handshake needs besides the endpoint itself.
pub struct Handshake {
    pub connector: TlsConnector,
    pub secret: SharedSecret,
    pub ident: Arc<IdentStore>,
    pub hostname: String,
    pub interfaces: Value,
    pub advertised_url: String,
    pub version: String,
}

/// The result of a completed handshake: an authenticated stream plus the
/// registration outcome.
pub struct Established {
    pub stream: TlsStream<TcpStream>,
    pub system_id: String,
}

impl std::fmt::Debug for Established {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Established")
            .field("system_id", &self.system_id)
            .finish_non_exhaustive()
    }
}

impl Handshake {
    pub async fn perform(
        &self,
        address: SocketAddr,
        expected: &EventLoopId,
    ) -> Result<Established, HandshakeError> {
        let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| HandshakeError::Timeout("connect"))?
            .map_err(|source| HandshakeError::Connect { address, source })?;
        tcp.set_nodelay(true).ok();

        let mut ids = 1u64..;
        let mut tcp = tcp;
        self.step(&mut tcp, &mut ids, "start-tls", Command::StartTls, json!({}))
            .await?;

        let server_name = rustls::pki_types::ServerName::from(address.ip());
        let mut stream = tokio::time::timeout(
            STEP_TIMEOUT,
            self.connector.connect(server_name, tcp),
        )
        .await
        .map_err(|_| HandshakeError::Timeout("tls"))??;
        debug!(%address, "TLS established");

        let identity = self
            .step(&mut stream, &mut ids, "identify", Command::Identify, json!({}))
            .await?;
        let identity: IdentifyResponse = parse("identify", identity)?;
        if identity.ident != expected.0 {
            return Err(HandshakeError::WrongEventLoop {
                expected: expected.clone(),
                got: identity.ident,
            });
        }

        let mut challenge = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut challenge);
        let answer = self
            .step(
                &mut stream,
                &mut ids,
                "authenticate",
                Command::Authenticate,
                serde_json::to_value(AuthenticateRequest {
                    message: challenge.to_vec(),
                })
                .map_err(|e| HandshakeError::Protocol(e.to_string()))?,
            )
            .await?;
        let answer: AuthenticateResponse = parse("authenticate", answer)?;
        if !self
            .secret
            .verify_digest(&challenge, &answer.salt, &answer.digest)
        {
            return Err(HandshakeError::AuthenticationFailed);
        }

        let request = RegisterRequest {
            system_id: self.ident.get().unwrap_or_default(),
            hostname: self.hostname.clone(),
            interfaces: self.interfaces.clone(),
            url: self.advertised_url.clone(),
            version: self.version.clone(),
        };
        let registered = self
            .step(
                &mut stream,
                &mut ids,
                "register",
                Command::Register,
                serde_json::to_value(request)
                    .map_err(|e| HandshakeError::Protocol(e.to_string()))?,
            )
            .await?;
        let registered: RegisterResponse = parse("register", registered)?;
        if self.ident.get().as_deref() != Some(&registered.system_id) {
            if let Err(err) = self.ident.set(&registered.system_id) {
                warn!(%err, "cannot persist system id");
            }
        }
        info!(eventloop = %expected, system_id = %registered.system_id, "registered with region");

        Ok(Established {
            stream,
            system_id: registered.system_id,
        })
    }

    /// One request/response exchange, answering the region's own handshake
    /// requests as they interleave with ours.
    async fn step<S>(
        &self,
        stream: &mut S,
        ids: &mut std::ops::RangeFrom<u64>,
        name: &'static str,
        command: Command,
        params: Value,
    ) -> Result<Value, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let id = ids.next().unwrap_or(u64::MAX);
        tokio::time::timeout(STEP_TIMEOUT, async {
            write_frame(
                stream,
                &Envelope::Request {
                    id,
                    command: command.name(),
                    params,
                },
            )
            .await?;
            loop {
                let envelope = read_frame(stream).await?.ok_or_else(|| {
                    HandshakeError::Protocol(format!("stream closed during {name}"))
                })?;
                match envelope {
                    Envelope::Response { id: got, result } if got == id => return Ok(result),
                    Envelope::Fault { id: got, fault } if got == id => {
                        return Err(match fault.kind {
                            FaultKind::RegistrationRejected => {
                                HandshakeError::RegistrationRejected(fault.message)
                            }
                            _ => HandshakeError::Protocol(format!("{name}: {fault}")),
                        });
                    }
                    Envelope::Request {
                        id: their_id,
                        command,
                        params,
                    } => {
                        let reply = self.answer_inbound(&command, &params);
                        write_frame(stream, &reply_envelope(their_id, reply)).await?;
                    }
                    other => {
                        return Err(HandshakeError::Protocol(format!(
                            "unexpected envelope during {name}: {other:?}"
                        )));
                    }
                }
            }
        })
        .await
        .map_err(|_| HandshakeError::Timeout(name))?
    }

    /// The region's side of mutual authentication.
    fn answer_inbound(&self, command: &str, params: &Value) -> Result<Value, String> {
        match Command::parse(command) {
            Some(Command::Identify) => {
                let ident = self.ident.get().unwrap_or_else(|| self.hostname.clone());
                Ok(json!(IdentifyResponse { ident }))
            }
            Some(Command::Authenticate) => {
                let request: AuthenticateRequest = serde_json::from_value(params.clone())
                    .map_err(|e| format!("bad authenticate request: {e}"))?;
                let mut salt = [0u8; 16];
                rand::thread_rng().fill_bytes(&mut salt);
                let digest = self.secret.calculate_digest(&request.message, &salt);
                serde_json::to_value(AuthenticateResponse {
                    digest,
                    salt: salt.to_vec(),
                })
                .map_err(|e| e.to_string())
            }
            Some(Command::Ping) => Ok(json!({})),
            _ => Err(format!("'{command}' is not valid during the handshake")),
        }
    }
}

fn reply_envelope(id: u64, reply: Result<Value, String>) -> Envelope {
    match reply {
        Ok(result) => Envelope::Response { id, result },
        Err(message) => Envelope::Fault {
            id,
            fault: crate::rpc::messages::Fault::new(FaultKind::UnknownCommand, message),
        },
    }
}

fn parse<T: serde::de::DeserializeOwned>(
    step: &'static str,
    value: Value,
) -> Result<T, HandshakeError> {
    serde_json::from_value(value)
        .map_err(|e| HandshakeError::Protocol(format!("malformed {step} response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_endpoints_are_routine() {
        let refused = HandshakeError::Connect {
            address: "10.0.0.1:5250".parse().unwrap(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert!(refused.is_routine());
        assert!(HandshakeError::Timeout("connect").is_routine());
    }

    #[test]
    fn protocol_and_identity_failures_are_not_routine() {
        assert!(!HandshakeError::AuthenticationFailed.is_routine());
        assert!(!HandshakeError::Protocol("bad frame".into()).is_routine());
        let wrong = HandshakeError::WrongEventLoop {
            expected: EventLoopId("region-1:pid=1".into()),
            got: "region-2:pid=2".into(),
        };
        assert!(!wrong.is_routine());
    }
}
