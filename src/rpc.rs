//! Typed plugin client: the service contract as a trait, plus the one
//! concrete adapter that speaks it over a [`Connection`].
//!
//! Everything downstream of the supervisor (route bridge, search engine,
//! tests) works against `dyn PluginRpc`, never against the wire directly.

use std::sync::Arc;

use async_trait::async_trait;

use crate::protocol::{
    EventPayload, HostCall, PluginMetadata, PluginReply, ReplyErrorKind, RouteDescriptor,
    RpcRequest, RpcResponse, UiManifest,
};
use crate::search::{Release, SearchRequest};
use crate::transport::{Connection, TransportError};

/// Failure of one remote operation.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The connection failed: process gone, codec error, timeout.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// The plugin answered with an error reply.
    #[error("plugin error: {message}")]
    Plugin {
        kind: ReplyErrorKind,
        message: String,
    },

    /// The plugin answered with a reply variant that does not match the
    /// operation. Treated like a protocol violation by callers.
    #[error("unexpected reply type for {operation}")]
    UnexpectedReply { operation: &'static str },
}

/// The fixed operation set every plugin process answers.
#[async_trait]
pub trait PluginRpc: Send + Sync {
    /// Identify the plugin. The only mandatory operation.
    async fn metadata(&self) -> Result<PluginMetadata, RpcError>;
    /// Routes the plugin wants mounted on the host.
    async fn api_routes(&self) -> Result<Vec<RouteDescriptor>, RpcError>;
    /// Forward one HTTP-shaped request.
    async fn handle_api(&self, request: RpcRequest) -> Result<RpcResponse, RpcError>;
    /// UI contribution for the web frontend.
    async fn ui_manifest(&self) -> Result<UiManifest, RpcError>;
    /// Deliver a host event; the reply carries no data.
    async fn handle_event(&self, event: EventPayload) -> Result<(), RpcError>;
    async fn is_indexer(&self) -> Result<bool, RpcError>;
    async fn is_downloader(&self) -> Result<bool, RpcError>;
    /// Typed release search (indexer plugins).
    async fn search(&self, request: SearchRequest) -> Result<Vec<Release>, RpcError>;
}

/// The concrete adapter over the framed stdio transport.
#[derive(Debug)]
pub struct RpcClient {
    conn: Arc<Connection>,
}

impl RpcClient {
    pub fn new(conn: Arc<Connection>) -> Self {
        Self { conn }
    }

    async fn call(&self, call: HostCall) -> Result<PluginReply, RpcError> {
        match self.conn.call(call).await? {
            PluginReply::Error(err) => Err(RpcError::Plugin {
                kind: err.kind,
                message: err.message,
            }),
            reply => Ok(reply),
        }
    }
}

#[async_trait]
impl PluginRpc for RpcClient {
    async fn metadata(&self) -> Result<PluginMetadata, RpcError> {
        match self.call(HostCall::Metadata).await? {
            PluginReply::Metadata(meta) => Ok(meta),
            _ => Err(RpcError::UnexpectedReply {
                operation: "metadata",
            }),
        }
    }

    async fn api_routes(&self) -> Result<Vec<RouteDescriptor>, RpcError> {
        match self.call(HostCall::ApiRoutes).await? {
            PluginReply::ApiRoutes(routes) => Ok(routes),
            _ => Err(RpcError::UnexpectedReply {
                operation: "api_routes",
            }),
        }
    }

    async fn handle_api(&self, request: RpcRequest) -> Result<RpcResponse, RpcError> {
        match self.call(HostCall::HandleApi(request)).await? {
            PluginReply::HandleApi(response) => Ok(response),
            _ => Err(RpcError::UnexpectedReply {
                operation: "handle_api",
            }),
        }
    }

    async fn ui_manifest(&self) -> Result<UiManifest, RpcError> {
        match self.call(HostCall::UiManifest).await? {
            PluginReply::UiManifest(manifest) => Ok(manifest),
            _ => Err(RpcError::UnexpectedReply {
                operation: "ui_manifest",
            }),
        }
    }

    async fn handle_event(&self, event: EventPayload) -> Result<(), RpcError> {
        match self.call(HostCall::HandleEvent(event)).await? {
            PluginReply::EventAck => Ok(()),
            _ => Err(RpcError::UnexpectedReply {
                operation: "handle_event",
            }),
        }
    }

    async fn is_indexer(&self) -> Result<bool, RpcError> {
        match self.call(HostCall::IsIndexer).await? {
            PluginReply::IsIndexer(flag) => Ok(flag),
            _ => Err(RpcError::UnexpectedReply {
                operation: "is_indexer",
            }),
        }
    }

    async fn is_downloader(&self) -> Result<bool, RpcError> {
        match self.call(HostCall::IsDownloader).await? {
            PluginReply::IsDownloader(flag) => Ok(flag),
            _ => Err(RpcError::UnexpectedReply {
                operation: "is_downloader",
            }),
        }
    }

    async fn search(&self, request: SearchRequest) -> Result<Vec<Release>, RpcError> {
        match self.call(HostCall::Search(request)).await? {
            PluginReply::Search(releases) => Ok(releases),
            _ => Err(RpcError::UnexpectedReply {
                operation: "search",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Frame, Hello, ReplyError, PROTOCOL_VERSION};
    use crate::transport::{read_frame, write_frame, SdkHandler};
    use crate::protocol::{SdkCall, SdkReply};
    use std::time::Duration;

    struct NullSdk;

    #[async_trait]
    impl SdkHandler for NullSdk {
        async fn handle(&self, _plugin_id: &str, _call: SdkCall) -> SdkReply {
            SdkReply::Done
        }
    }

    /// Scripted peer answering each request with a canned reply.
    async fn client_with_peer(
        replies: Vec<PluginReply>,
    ) -> (RpcClient, tokio::task::JoinHandle<()>) {
        let (host_io, plugin_io) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host_io);
        let (mut plugin_read, mut plugin_write) = tokio::io::split(plugin_io);

        let peer = tokio::spawn(async move {
            write_frame(
                &mut plugin_write,
                &Frame::Hello(Hello {
                    token: "t".to_string(),
                    protocol: PROTOCOL_VERSION,
                    plugin_id: "p".to_string(),
                }),
            )
            .await
            .unwrap();
            let _ = read_frame(&mut plugin_read).await.unwrap();
            for reply in replies {
                match read_frame(&mut plugin_read).await.unwrap() {
                    Frame::Request { id, .. } => {
                        write_frame(&mut plugin_write, &Frame::Response { id, reply })
                            .await
                            .unwrap();
                    }
                    other => panic!("expected Request, got {other:?}"),
                }
            }
        });

        let (conn, _) = Connection::establish(
            host_read,
            host_write,
            "t",
            Duration::from_secs(5),
            Arc::new(NullSdk),
        )
        .await
        .unwrap();
        (RpcClient::new(Arc::new(conn)), peer)
    }

    #[tokio::test]
    async fn test_error_reply_surfaces_as_plugin_error() {
        let (client, peer) =
            client_with_peer(vec![PluginReply::Error(ReplyError::not_supported("search"))])
                .await;
        let err = client.search(SearchRequest::default()).await.unwrap_err();
        match err {
            RpcError::Plugin { kind, message } => {
                assert_eq!(kind, ReplyErrorKind::NotSupported);
                assert!(message.contains("search"), "got: {message}");
            }
            other => panic!("expected Plugin error, got {other:?}"),
        }
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_mismatched_reply_variant_is_rejected() {
        let (client, peer) = client_with_peer(vec![PluginReply::IsIndexer(true)]).await;
        let err = client.metadata().await.unwrap_err();
        assert!(matches!(
            err,
            RpcError::UnexpectedReply {
                operation: "metadata"
            }
        ));
        peer.await.unwrap();
    }
}
