//! Trainer end of the simulator connection
//!
//! The simulator is a gRPC client of the `UnityToExternalProto` service. Every `Exchange`
//! call carries the simulator's latest output and waits for the trainer's next input, so
//! the trainer always owes an answer to the most recent call. The server runs on a private
//! tokio runtime and [`RpcCommunicator`] exposes it to blocking callers.

use std::{
    net::{Ipv4Addr, TcpListener},
    path::Path,
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use tokio::{
    runtime::Runtime,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{transport::Server, Request, Response, Status};
use tracing::{debug, info, warn};

use super::communicator_objects::{
    unity_to_external_proto_server::{UnityToExternalProto, UnityToExternalProtoServer},
    HeaderProto, UnityInputProto, UnityMessageProto, UnityOutputProto,
};
use crate::env::EnvError;

pub const STATUS_OK: i32 = 200;
/// Sent in place of an input to end the session
pub const STATUS_CLOSE: i32 = 400;

/// Largest message accepted from the simulator
pub const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const SERVER_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const CHILD_EXIT_GRACE: Duration = Duration::from_secs(5);

/// Listen for the simulator on `127.0.0.1:{port}`
pub fn bind(port: u16) -> Result<TcpListener, EnvError> {
    Ok(TcpListener::bind((Ipv4Addr::LOCALHOST, port))?)
}

/// Start a simulator build that will connect back on `port`
pub fn launch(executable: &Path, port: u16, no_graphics: bool) -> Result<Child, EnvError> {
    let mut command = Command::new(executable);
    command
        .arg("--mlagents-port")
        .arg(port.to_string())
        .stdin(Stdio::null());
    if no_graphics {
        command.args(["-batchmode", "-nographics"]);
    }

    info!(executable = %executable.display(), port, "launching simulator");
    Ok(command.spawn()?)
}

pub fn wrap(status: i32, input: Option<UnityInputProto>) -> UnityMessageProto {
    UnityMessageProto {
        header: Some(HeaderProto {
            status,
            message: String::new(),
        }),
        unity_output: None,
        unity_input: input,
    }
}

/// A simulator call waiting for the trainer's answer
#[derive(Debug)]
struct PendingExchange {
    message: UnityMessageProto,
    reply: oneshot::Sender<UnityMessageProto>,
}

/// Forwards every `Exchange` call to the [`RpcCommunicator`] and waits for its answer
pub struct UnityToExternalServicer {
    requests: mpsc::Sender<PendingExchange>,
}

#[tonic::async_trait]
impl UnityToExternalProto for UnityToExternalServicer {
    async fn exchange(&self, request: Request<UnityMessageProto>) -> Result<Response<UnityMessageProto>, Status> {
        let (reply, answer) = oneshot::channel();
        self.requests
            .send(PendingExchange {
                message: request.into_inner(),
                reply,
            })
            .await
            .map_err(|_| Status::unavailable("trainer is shutting down"))?;

        answer
            .await
            .map(Response::new)
            .map_err(|_| Status::unavailable("trainer is shutting down"))
    }
}

/// Blocking handle on the gRPC server and, when launched by us, the simulator process
pub struct RpcCommunicator {
    runtime: Runtime,
    requests: mpsc::Receiver<PendingExchange>,
    pending: Option<oneshot::Sender<UnityMessageProto>>,
    shutdown: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<Result<(), tonic::transport::Error>>>,
    child: Option<Child>,
    closed: bool,
}

impl RpcCommunicator {
    /// Serve `UnityToExternalProto` on `listener`
    ///
    /// The simulator is expected to call in on its own; see [`RpcCommunicator::initialize`].
    pub fn serve(listener: TcpListener, child: Option<Child>) -> Result<Self, EnvError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("simulator-rpc")
            .enable_all()
            .build()?;

        listener.set_nonblocking(true)?;
        let port = listener.local_addr().map(|addr| addr.port()).unwrap_or_default();
        let listener = {
            let _guard = runtime.enter();
            tokio::net::TcpListener::from_std(listener)?
        };

        let (sender, requests) = mpsc::channel(1);
        let (shutdown, signal) = oneshot::channel::<()>();
        let service = UnityToExternalProtoServer::new(UnityToExternalServicer { requests: sender })
            .max_decoding_message_size(MAX_MESSAGE_LEN)
            .max_encoding_message_size(MAX_MESSAGE_LEN);
        let server = runtime.spawn(
            Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                    let _ = signal.await;
                }),
        );
        info!(port, "waiting for the simulator to connect");

        Ok(Self {
            runtime,
            requests,
            pending: None,
            shutdown: Some(shutdown),
            server: Some(server),
            child,
            closed: false,
        })
    }

    /// Handshake: take the simulator's first output, answer it with `input`
    ///
    /// The simulator follows the answer with an empty call; that call stays pending and
    /// receives the first [`RpcCommunicator::exchange`] input. Returns the first output.
    pub fn initialize(&mut self, input: UnityInputProto) -> Result<UnityOutputProto, EnvError> {
        let academy = self.receive()?;
        self.answer(input)?;
        self.receive()?;
        Ok(academy)
    }

    /// Answer the pending call with `input` and wait for the simulator's next output
    pub fn exchange(&mut self, input: UnityInputProto) -> Result<UnityOutputProto, EnvError> {
        self.answer(input)?;
        self.receive()
    }

    fn answer(&mut self, input: UnityInputProto) -> Result<(), EnvError> {
        if self.closed {
            return Err(EnvError::Closed);
        }
        let reply = self
            .pending
            .take()
            .ok_or_else(|| EnvError::Protocol("no simulator call to answer".into()))?;
        reply
            .send(wrap(STATUS_OK, Some(input)))
            .map_err(|_| EnvError::SimulatorStopped)
    }

    fn receive(&mut self) -> Result<UnityOutputProto, EnvError> {
        if self.closed {
            return Err(EnvError::Closed);
        }
        let PendingExchange { message, reply } = self.next_call()?;
        self.pending = Some(reply);

        let status = message.header.as_ref().map_or(STATUS_OK, |header| header.status);
        if status != STATUS_OK {
            debug!(status, "simulator ended the session");
            return Err(EnvError::SimulatorStopped);
        }
        Ok(message.unity_output.unwrap_or_default())
    }

    /// Wait for the next call, failing early if a launched simulator exits
    fn next_call(&mut self) -> Result<PendingExchange, EnvError> {
        loop {
            let requests = &mut self.requests;
            match self.runtime.block_on(tokio::time::timeout(POLL_INTERVAL, requests.recv())) {
                Ok(Some(call)) => return Ok(call),
                Ok(None) => return Err(self.server_failure()),
                Err(_) => {
                    if let Some(child) = self.child.as_mut() {
                        if let Some(status) = child.try_wait()? {
                            return Err(EnvError::ProcessExited(status.to_string()));
                        }
                    }
                }
            }
        }
    }

    fn server_failure(&mut self) -> EnvError {
        let Some(server) = self.server.take() else {
            return EnvError::Closed;
        };
        match self.runtime.block_on(server) {
            Ok(Ok(())) => EnvError::Closed,
            Ok(Err(e)) => EnvError::Rpc(e.to_string()),
            Err(e) => EnvError::Rpc(e.to_string()),
        }
    }

    /// Tell the simulator to quit, stop the server and reap the simulator process
    ///
    /// Calling it more than once is a no-op.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(reply) = self.pending.take() {
            if reply.send(wrap(STATUS_CLOSE, None)).is_err() {
                debug!("simulator did not receive the close request");
            }
        }
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(server) = self.server.take() {
            match self.runtime.block_on(tokio::time::timeout(SERVER_SHUTDOWN_GRACE, server)) {
                Ok(Ok(Ok(()))) => debug!("gRPC server stopped"),
                Ok(Ok(Err(e))) => warn!(error = %e, "gRPC server failed"),
                Ok(Err(e)) => warn!(error = %e, "gRPC server task failed"),
                Err(_) => debug!("gRPC server did not stop in time"),
            }
        }

        if let Some(mut child) = self.child.take() {
            let deadline = Instant::now() + CHILD_EXIT_GRACE;
            loop {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        debug!(%status, "simulator exited");
                        break;
                    }
                    Ok(None) if Instant::now() < deadline => thread::sleep(POLL_INTERVAL),
                    Ok(None) => {
                        warn!("simulator did not exit after close, killing it");
                        kill(&mut child);
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "could not query the simulator process");
                        kill(&mut child);
                        break;
                    }
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for RpcCommunicator {
    fn drop(&mut self) {
        self.close();
    }
}

fn kill(child: &mut Child) {
    if let Err(e) = child.kill() {
        warn!(error = %e, "failed to kill the simulator process");
    }
    let _ = child.wait();
}
