//! Control server implementation

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use cadence_common::Signal;
use tokio::{
    net::{UnixListener, UnixStream},
    sync::broadcast,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    ControlError, Request, Response, Result,
    auth::ControlAuthConfig,
    codec::{MAX_REQUEST_SIZE, read_frame, write_frame},
};

/// Handler trait for processing control requests
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handle a request and return a response
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be processed
    async fn handle_request(&self, request: Request) -> Result<Response>;
}

/// Control server for managing a running scheduler via Unix domain socket
pub struct ControlServer {
    socket_path: String,
    handler: Arc<dyn CommandHandler>,
    auth: Arc<ControlAuthConfig>,
    timeout: Duration,
}

impl ControlServer {
    /// Create a new control server
    ///
    /// # Errors
    ///
    /// Returns an error if the socket path is empty
    pub fn new(socket_path: impl Into<String>, handler: Arc<dyn CommandHandler>) -> Result<Self> {
        let socket_path = socket_path.into();
        if socket_path.is_empty() {
            return Err(ControlError::InvalidSocketPath(
                "socket path is empty".to_string(),
            ));
        }

        Ok(Self {
            socket_path,
            handler,
            auth: Arc::default(),
            timeout: Duration::from_secs(30),
        })
    }

    #[must_use]
    pub fn with_auth(mut self, auth: ControlAuthConfig) -> Self {
        self.auth = Arc::new(auth);
        self
    }

    /// How long a connected client may stay silent before it is dropped
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Bind the socket, replacing a file left behind by a crashed process,
    /// and restrict it to the owner
    async fn bind(&self) -> Result<UnixListener> {
        let path = Path::new(&self.socket_path);
        if path.exists() {
            if UnixStream::connect(path).await.is_ok() {
                return Err(ControlError::Io(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    format!("{} is served by a running scheduler", self.socket_path),
                )));
            }
            info!(socket = %self.socket_path, "Removing stale control socket");
            tokio::fs::remove_file(path).await?;
        }

        let listener = UnixListener::bind(path)?;

        #[cfg(unix)]
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;

        Ok(listener)
    }

    /// Accept connections until a shutdown signal arrives
    ///
    /// # Errors
    ///
    /// Returns an error if another scheduler already serves the socket, or
    /// the socket cannot be bound
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) -> Result<()> {
        let listener = self.bind().await?;
        info!(
            socket = %self.socket_path,
            token_required = self.auth.requires_auth(),
            "Control socket listening (mode 0600)"
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let handler = Arc::clone(&self.handler);
                        let auth = Arc::clone(&self.auth);
                        let timeout = self.timeout;
                        tokio::spawn(async move {
                            if let Err(e) =
                                Self::handle_connection(stream, handler, auth, timeout).await
                            {
                                error!("Control connection failed: {e}");
                            }
                        });
                    }
                    Err(e) => error!("Could not accept control connection: {e}"),
                },
                sig = shutdown.recv() => {
                    if let Err(e) = sig {
                        error!("Control server shutdown channel error: {e}");
                    }
                    info!("Control server shutting down");
                    break;
                }
            }
        }

        let path = Path::new(&self.socket_path);
        if path.exists() {
            debug!(socket = %self.socket_path, "Removing control socket");
            let _ = tokio::fs::remove_file(path).await;
        }

        Ok(())
    }

    /// Authenticate and validate one request, then hand it to the handler
    async fn respond(
        handler: &dyn CommandHandler,
        auth: &ControlAuthConfig,
        request: Request,
        peer_uid: Option<u32>,
    ) -> Response {
        let checked = auth
            .validate_token_option(request.token.as_deref())
            .and_then(|()| request.validate())
            .map_err(ControlError::Rejected);
        if let Err(e) = checked {
            warn!(uid = ?peer_uid, "{e}");
            return Response::error(e.to_string());
        }

        info!(uid = ?peer_uid, command = ?request.command, "Control request");
        handler.handle_request(request).await.unwrap_or_else(|e| {
            warn!(uid = ?peer_uid, "Control command failed: {e}");
            Response::error(e.to_string())
        })
    }

    /// Serve requests on one connection until the client hangs up
    async fn handle_connection(
        mut stream: UnixStream,
        handler: Arc<dyn CommandHandler>,
        auth: Arc<ControlAuthConfig>,
        timeout: Duration,
    ) -> Result<()> {
        let peer_uid = stream.peer_cred().ok().map(|cred| cred.uid());

        loop {
            let request: Request =
                match tokio::time::timeout(timeout, read_frame(&mut stream, MAX_REQUEST_SIZE))
                    .await
                    .map_err(|_| ControlError::Timeout)?
                {
                    Ok(request) => request,
                    Err(ControlError::ConnectionClosed) => return Ok(()),
                    Err(e) => return Err(e),
                };

            trace!("Received request: {request:?}");
            let response = Self::respond(handler.as_ref(), &auth, request, peer_uid).await;
            trace!("Sending response: {response:?}");

            tokio::time::timeout(timeout, write_frame(&mut stream, &response))
                .await
                .map_err(|_| ControlError::Timeout)??;
        }
    }
}
