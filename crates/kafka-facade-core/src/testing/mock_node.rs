//! Mock backend node for integration testing.
//!
//! A lightweight in-process node that:
//! - Accepts framed protocol connections
//! - Records all requests received
//! - Returns configurable responses

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};

/// A recorded backend call.
#[derive(Debug, Clone)]
pub struct NodeCall {
    /// The API key of the request.
    pub api_key: i16,
    /// The API version of the request.
    pub api_version: i16,
    /// The correlation ID.
    pub correlation_id: i32,
    /// The raw request bytes (without length prefix).
    pub request_bytes: Bytes,
}

/// Response generator function type.
///
/// Returns the full response payload: response header (correlation id)
/// followed by the body. The mock adds the length prefix.
pub type ResponseGenerator = Arc<dyn Fn(&NodeCall) -> Bytes + Send + Sync>;

/// Mock backend node for testing.
pub struct MockNode {
    address: String,
    listener: Option<TcpListener>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    call_log: Arc<RwLock<Vec<NodeCall>>>,
    response_handlers: Arc<RwLock<HashMap<i16, ResponseGenerator>>>,
}

impl MockNode {
    /// Create a new mock node that will bind to the given address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            listener: None,
            shutdown_tx: None,
            call_log: Arc::new(RwLock::new(Vec::new())),
            response_handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start the mock node.
    ///
    /// Returns the actual address the node is listening on.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn start(&mut self) -> std::io::Result<String> {
        let listener = TcpListener::bind(&self.address).await?;
        let actual_address = listener.local_addr()?.to_string();
        self.listener = Some(listener);

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let listener = self.listener.take().unwrap();
        let call_log = self.call_log.clone();
        let response_handlers = self.response_handlers.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();

        // Spawn the accept loop
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _addr)) => {
                                let call_log = call_log.clone();
                                let response_handlers = response_handlers.clone();
                                let shutdown_rx = shutdown_tx.subscribe();

                                tokio::spawn(async move {
                                    Self::handle_connection(stream, call_log, response_handlers, shutdown_rx).await;
                                });
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
        });

        Ok(actual_address)
    }

    /// Stop the mock node.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Register a response handler for a specific API key.
    pub async fn register_handler(&self, api_key: i16, handler: ResponseGenerator) {
        self.response_handlers
            .write()
            .await
            .insert(api_key, handler);
    }

    /// Get all recorded calls.
    pub async fn get_calls(&self) -> Vec<NodeCall> {
        self.call_log.read().await.clone()
    }

    /// Get calls filtered by API key.
    pub async fn get_calls_for_api(&self, api_key: i16) -> Vec<NodeCall> {
        self.call_log
            .read()
            .await
            .iter()
            .filter(|c| c.api_key == api_key)
            .cloned()
            .collect()
    }

    /// Get the node address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Handle a single client connection.
    async fn handle_connection(
        mut stream: TcpStream,
        call_log: Arc<RwLock<Vec<NodeCall>>>,
        response_handlers: Arc<RwLock<HashMap<i16, ResponseGenerator>>>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                result = Self::read_frame(&mut stream) => {
                    match result {
                        Ok(Some(frame)) => {
                            // Parse request header
                            if frame.len() < 8 {
                                continue;
                            }

                            let api_key = i16::from_be_bytes([frame[0], frame[1]]);
                            let api_version = i16::from_be_bytes([frame[2], frame[3]]);
                            let correlation_id = i32::from_be_bytes([
                                frame[4], frame[5], frame[6], frame[7],
                            ]);

                            let call = NodeCall {
                                api_key,
                                api_version,
                                correlation_id,
                                request_bytes: Bytes::copy_from_slice(&frame),
                            };

                            // Record the call
                            call_log.write().await.push(call.clone());

                            // Generate response
                            let response = {
                                let handlers = response_handlers.read().await;
                                if let Some(handler) = handlers.get(&api_key) {
                                    handler(&call)
                                } else {
                                    Self::default_response(&call)
                                }
                            };

                            // Write response with length prefix
                            if Self::write_frame(&mut stream, &response).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => break, // Connection closed
                        Err(_) => break,   // Error reading
                    }
                }
            }
        }
    }

    /// Read a frame (4-byte length prefix + body).
    async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;
        Ok(Some(buf))
    }

    /// Write a frame (4-byte length prefix + body).
    async fn write_frame(stream: &mut TcpStream, data: &[u8]) -> std::io::Result<()> {
        let mut buf = BytesMut::with_capacity(4 + data.len());
        buf.put_u32(data.len() as u32);
        buf.extend_from_slice(data);
        stream.write_all(&buf).await?;
        stream.flush().await
    }

    /// Generate a default response (correlation ID only).
    fn default_response(call: &NodeCall) -> Bytes {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_i32(call.correlation_id);
        buf.freeze()
    }
}

/// Canned response payload builders for the rewritten response types.
pub mod responses {
    use super::{Bytes, BytesMut, NodeCall};
    use kafka_protocol::messages::find_coordinator_response::Coordinator;
    use kafka_protocol::messages::metadata_response::MetadataResponseBroker;
    use kafka_protocol::messages::{
        ApiKey, BrokerId, FindCoordinatorResponse, MetadataResponse, ResponseHeader,
    };
    use kafka_protocol::protocol::{Encodable, StrBytes};

    fn encode(
        api_key: ApiKey,
        call: &NodeCall,
        body: &impl Encodable,
    ) -> Bytes {
        let header_version = api_key.response_header_version(call.api_version);
        let mut header = ResponseHeader::default();
        header.correlation_id = call.correlation_id;

        let mut buf = BytesMut::new();
        header.encode(&mut buf, header_version).expect("encode header");
        body.encode(&mut buf, call.api_version).expect("encode body");
        buf.freeze()
    }

    /// A metadata response listing the given `(node_id, host, port)` brokers.
    pub fn metadata(call: &NodeCall, brokers: &[(i32, &str, i32)]) -> Bytes {
        let mut response = MetadataResponse::default();
        for (node_id, host, port) in brokers {
            let mut broker = MetadataResponseBroker::default();
            broker.node_id = BrokerId(*node_id);
            broker.host = StrBytes::from_string((*host).to_string());
            broker.port = *port;
            response.brokers.push(broker);
        }
        encode(ApiKey::MetadataKey, call, &response)
    }

    /// A coordinator lookup response pointing at the given node.
    ///
    /// Uses the inline (v0-v3) shape for requests up to version 3 and the
    /// coordinator-list shape from version 4 on.
    pub fn find_coordinator(call: &NodeCall, node_id: i32, host: &str, port: i32) -> Bytes {
        let mut response = FindCoordinatorResponse::default();
        if call.api_version < 4 {
            response.node_id = BrokerId(node_id);
            response.host = StrBytes::from_string(host.to_string());
            response.port = port;
        } else {
            let mut coordinator = Coordinator::default();
            coordinator.node_id = BrokerId(node_id);
            coordinator.host = StrBytes::from_string(host.to_string());
            coordinator.port = port;
            response.coordinators.push(coordinator);
        }
        encode(ApiKey::FindCoordinatorKey, call, &response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_node_records_calls_and_answers() {
        let mut node = MockNode::new("127.0.0.1:0");
        let address = node.start().await.unwrap();

        let mut client = TcpStream::connect(&address).await.unwrap();

        // Request: api_key=18 (api versions), version 0, correlation 9.
        let mut request = BytesMut::new();
        request.put_u32(8);
        request.put_i16(18);
        request.put_i16(0);
        request.put_i32(9);
        client.write_all(&request).await.unwrap();

        // Default response echoes the correlation id.
        let mut len_buf = [0u8; 4];
        client.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        client.read_exact(&mut body).await.unwrap();
        assert_eq!(i32::from_be_bytes([body[0], body[1], body[2], body[3]]), 9);

        let calls = node.get_calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].api_key, 18);
        assert_eq!(calls[0].correlation_id, 9);

        node.stop().await;
    }

    #[tokio::test]
    async fn test_registered_handler_wins() {
        let mut node = MockNode::new("127.0.0.1:0");
        let address = node.start().await.unwrap();
        node.register_handler(
            1,
            Arc::new(|call| {
                let mut buf = BytesMut::new();
                buf.put_i32(call.correlation_id);
                buf.extend_from_slice(b"custom");
                buf.freeze()
            }),
        )
        .await;

        let mut client = TcpStream::connect(&address).await.unwrap();
        let mut request = BytesMut::new();
        request.put_u32(8);
        request.put_i16(1);
        request.put_i16(11);
        request.put_i32(3);
        client.write_all(&request).await.unwrap();

        let mut len_buf = [0u8; 4];
        client.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        client.read_exact(&mut body).await.unwrap();
        assert_eq!(&body[4..], b"custom");

        node.stop().await;
    }
}
