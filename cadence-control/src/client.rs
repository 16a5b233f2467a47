//! Client for connecting to the control socket

use std::{path::Path, sync::Arc, time::Duration};

use tokio::{net::UnixStream, sync::Mutex};
use tracing::{debug, warn};

use crate::{
    ControlError, Request, RequestCommand, Response, ResponsePayload, Result,
    codec::{MAX_RESPONSE_SIZE, read_frame, write_frame},
    protocol::PROTOCOL_VERSION,
};

/// Client for communicating with the cadence control server
pub struct ControlClient {
    socket_path: String,
    timeout: Duration,
    token: Option<String>,
    /// Kept open across requests in watch mode
    persistent_connection: Option<Arc<Mutex<Option<UnixStream>>>>,
}

impl ControlClient {
    /// Create a new control client with the given socket path
    #[must_use]
    pub fn new(socket_path: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: Duration::from_secs(10),
            token: None,
            persistent_connection: None,
        }
    }

    /// Set the request timeout
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Attach a bearer token to every request
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Reuse one connection for every request, reconnecting once if it
    /// was lost
    #[must_use]
    pub fn with_persistent_connection(mut self) -> Self {
        self.persistent_connection = Some(Arc::new(Mutex::new(None)));
        self
    }

    async fn connect(&self) -> Result<UnixStream> {
        debug!("Connecting to control socket: {}", self.socket_path);
        Ok(UnixStream::connect(&self.socket_path).await?)
    }

    /// Wrap `command` in a request carrying this client's token and send it
    ///
    /// # Errors
    ///
    /// See [`Self::send_request`]
    pub async fn send(&self, command: RequestCommand) -> Result<Response> {
        let request = match &self.token {
            Some(token) => Request::with_token(command, token.clone()),
            None => Request::new(command),
        };
        self.send_request(request).await
    }

    /// Send a request and receive a response
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Connection fails
    /// - Protocol error occurs
    /// - Request times out
    /// - Server returns an error
    pub async fn send_request(&self, request: Request) -> Result<Response> {
        tokio::time::timeout(self.timeout, self.send_request_internal(request))
            .await
            .map_err(|_| ControlError::Timeout)?
    }

    async fn send_request_internal(&self, request: Request) -> Result<Response> {
        if let Some(persistent) = &self.persistent_connection {
            self.send_request_persistent(request, persistent).await
        } else {
            let mut stream = self.connect().await?;
            Self::send_and_receive(&mut stream, &request).await
        }
    }

    async fn send_request_persistent(
        &self,
        request: Request,
        persistent: &Arc<Mutex<Option<UnixStream>>>,
    ) -> Result<Response> {
        let mut guard = persistent.lock().await;

        if let Some(stream) = guard.as_mut() {
            match Self::send_and_receive(stream, &request).await {
                Err(ControlError::Io(_) | ControlError::ConnectionClosed) => {
                    warn!(
                        "Persistent connection failed, reconnecting to {}",
                        self.socket_path
                    );
                    *guard = None;
                }
                result => return result,
            }
        }

        let mut stream = self.connect().await?;
        let result = Self::send_and_receive(&mut stream, &request).await;
        if result.is_ok() {
            *guard = Some(stream);
        }
        result
    }

    async fn send_and_receive(stream: &mut UnixStream, request: &Request) -> Result<Response> {
        write_frame(stream, request).await?;
        let response: Response = read_frame(stream, MAX_RESPONSE_SIZE).await?;

        if !response.is_version_compatible() {
            return Err(ControlError::VersionMismatch {
                peer: response.version,
                local: PROTOCOL_VERSION,
            });
        }

        if let ResponsePayload::Error(ref err) = response.payload {
            return Err(ControlError::ServerError(err.clone()));
        }

        Ok(response)
    }

    /// Check that the control socket exists
    ///
    /// # Errors
    ///
    /// Returns an error if there is no file at the socket path
    pub fn check_socket_exists(&self) -> Result<()> {
        if !Path::new(&self.socket_path).exists() {
            return Err(ControlError::InvalidSocketPath(format!(
                "Socket does not exist: {}",
                self.socket_path
            )));
        }
        Ok(())
    }
}
