//! Call shapes with a single message on one side.
//!
//! All of them run on the bidirectional machinery: a single message is a
//! stream that must end right after its first element.

use std::future::Future;
use std::sync::Arc;

use tonic::Status;
use tracing::debug;

use super::{CallBuilder, CallControl, InboundStream, OutboundSink};
use crate::config::FlowConfig;
use crate::error::{BoxError, QueueError};
use crate::transport::CallTransport;

const NO_RESPONSE: &str = "call completed without a response";
const EXTRA_RESPONSE: &str = "received more than one response";
const NO_REQUEST: &str = "client half-closed without a request";
const EXTRA_REQUEST: &str = "received more than one request";

/// Read exactly one message, then the end of the stream.
async fn single_message<T>(
    inbound: &mut InboundStream<T>,
    missing: &'static str,
    extra: &'static str,
) -> Result<T, Status> {
    let Some(message) = inbound.recv().await? else {
        return Err(Status::internal(missing));
    };
    match inbound.recv().await? {
        None => Ok(message),
        Some(_) => Err(Status::internal(extra)),
    }
}

/// The single response of a client-streaming call.
pub struct SingleResponse<In> {
    inbound: InboundStream<In>,
    control: CallControl,
}

impl<In> SingleResponse<In> {
    /// Wait for the response and the end of the call.
    ///
    /// A missing or repeated response fails the call with `INTERNAL`.
    pub async fn recv(mut self) -> Result<In, Status> {
        let result = single_message(&mut self.inbound, NO_RESPONSE, EXTRA_RESPONSE).await;
        if let Err(status) = &result {
            self.control.fail(status.clone());
        }
        result
    }

    pub fn control(&self) -> &CallControl {
        &self.control
    }
}

/// A client-streaming call: many requests, one response.
pub struct ClientStreamingCall<In, Out> {
    outbound: OutboundSink<Out>,
    response: SingleResponse<In>,
}

impl<In, Out> ClientStreamingCall<In, Out> {
    /// Queue a request.
    pub async fn send(&self, message: Out) -> Result<(), QueueError> {
        self.outbound.send(message).await
    }

    pub fn outbound(&self) -> &OutboundSink<Out> {
        &self.outbound
    }

    pub fn control(&self) -> &CallControl {
        &self.response.control
    }

    /// Finish sending and wait for the response.
    ///
    /// Requests stop once every clone of the sink is gone.
    pub async fn response(self) -> Result<In, Status> {
        let (outbound, response) = self.split();
        drop(outbound);
        response.recv().await
    }

    pub fn split(self) -> (OutboundSink<Out>, SingleResponse<In>) {
        (self.outbound, self.response)
    }
}

impl CallBuilder {
    /// Start a client-streaming call.
    pub fn client_streaming<In, Out, T>(self, transport: Arc<T>) -> ClientStreamingCall<In, Out>
    where
        In: Send + 'static,
        Out: Send + 'static,
        T: CallTransport<In, Out>,
    {
        let (inbound, outbound, control) = self.bidi(transport).split();
        ClientStreamingCall {
            outbound,
            response: SingleResponse { inbound, control },
        }
    }

    /// Send one request and wait for one response.
    pub async fn unary<In, Out, T>(self, transport: Arc<T>, request: Out) -> Result<In, Status>
    where
        In: Send + 'static,
        Out: Send + 'static,
        T: CallTransport<In, Out>,
    {
        let call = self.client_streaming(transport);
        call.send(request).await?;
        call.response().await
    }

    /// Answer each call with `handler(request)`.
    pub fn serve_unary<In, Out, T, F, Fut, E>(self, transport: Arc<T>, handler: F) -> CallControl
    where
        In: Send + 'static,
        Out: Send + 'static,
        T: CallTransport<In, Out>,
        F: FnOnce(In) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Out, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.serve_client_streaming(transport, move |mut inbound: InboundStream<In>| async move {
            let request = single_message(&mut inbound, NO_REQUEST, EXTRA_REQUEST).await?;
            handler(request).await.map_err(Into::<BoxError>::into)
        })
    }

    /// Read the request stream with `handler` and send its result as the
    /// single response.
    pub fn serve_client_streaming<In, Out, T, F, Fut, E>(
        self,
        transport: Arc<T>,
        handler: F,
    ) -> CallControl
    where
        In: Send + 'static,
        Out: Send + 'static,
        T: CallTransport<In, Out>,
        F: FnOnce(InboundStream<In>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Out, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.serve_bidi(
            transport,
            move |inbound: InboundStream<In>, outbound: OutboundSink<Out>| async move {
                let response = handler(inbound).await.map_err(Into::<BoxError>::into)?;
                outbound.send(response).await?;
                Ok::<(), BoxError>(())
            },
        )
    }

    /// Read the single request, then stream responses with
    /// `handler(request, outbound)`.
    pub fn serve_server_streaming<In, Out, T, F, Fut, E>(
        self,
        transport: Arc<T>,
        handler: F,
    ) -> CallControl
    where
        In: Send + 'static,
        Out: Send + 'static,
        T: CallTransport<In, Out>,
        F: FnOnce(In, OutboundSink<Out>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.serve_bidi(
            transport,
            move |mut inbound: InboundStream<In>, outbound: OutboundSink<Out>| async move {
                let request = single_message(&mut inbound, NO_REQUEST, EXTRA_REQUEST).await?;
                debug!("server-streaming request received");
                handler(request, outbound).await.map_err(Into::<BoxError>::into)
            },
        )
    }
}

/// Start a client-streaming call in the client role.
pub fn client_streaming<In, Out, T>(
    transport: Arc<T>,
    config: FlowConfig,
) -> ClientStreamingCall<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
    T: CallTransport<In, Out>,
{
    CallBuilder::client().config(config).client_streaming(transport)
}

/// Send one request and wait for one response in the client role.
pub async fn unary<In, Out, T>(transport: Arc<T>, config: FlowConfig, request: Out) -> Result<In, Status>
where
    In: Send + 'static,
    Out: Send + 'static,
    T: CallTransport<In, Out>,
{
    CallBuilder::client().config(config).unary(transport, request).await
}

/// Serve a unary call with `handler` in the server role.
pub fn serve_unary<In, Out, T, F, Fut, E>(transport: Arc<T>, config: FlowConfig, handler: F) -> CallControl
where
    In: Send + 'static,
    Out: Send + 'static,
    T: CallTransport<In, Out>,
    F: FnOnce(In) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Out, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    CallBuilder::server().config(config).serve_unary(transport, handler)
}

/// Serve a client-streaming call with `handler` in the server role.
pub fn serve_client_streaming<In, Out, T, F, Fut, E>(
    transport: Arc<T>,
    config: FlowConfig,
    handler: F,
) -> CallControl
where
    In: Send + 'static,
    Out: Send + 'static,
    T: CallTransport<In, Out>,
    F: FnOnce(InboundStream<In>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Out, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    CallBuilder::server()
        .config(config)
        .serve_client_streaming(transport, handler)
}

/// Serve a server-streaming call with `handler` in the server role.
pub fn serve_server_streaming<In, Out, T, F, Fut, E>(
    transport: Arc<T>,
    config: FlowConfig,
    handler: F,
) -> CallControl
where
    In: Send + 'static,
    Out: Send + 'static,
    T: CallTransport<In, Out>,
    F: FnOnce(In, OutboundSink<Out>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    CallBuilder::server()
        .config(config)
        .serve_server_streaming(transport, handler)
}
