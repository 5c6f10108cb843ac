//! Sheets server assembly
//!
//! Builds the generic server in front of its delegate and claims the
//! private API group for the subresource handler. Everything outside the
//! group falls through the mux to the delegate.

use sheets_common::{PLUGIN_API_GROUP, PLUGIN_API_VERSION};
use tracing::info;

use crate::config::CompletedConfig;
use crate::error::BootError;
use crate::server::{delegate_handler, DelegationTarget, GenericApiServer};
use crate::subresource::SubresourceHandler;

/// Name of the server in logs
pub const SERVER_NAME: &str = "sheets-apiserver";

/// Build the server and register the private group handler
pub async fn build_server(
    config: CompletedConfig,
    delegate: &dyn DelegationTarget,
) -> Result<GenericApiServer, BootError> {
    let fallback = delegate_handler(delegate);
    let max_request_body_bytes = config.max_request_body_bytes;
    let server = GenericApiServer::new(SERVER_NAME, config, delegate).await?;

    let handler = SubresourceHandler::new(
        PLUGIN_API_GROUP,
        PLUGIN_API_VERSION,
        None,
        server.authorizer.clone(),
        max_request_body_bytes,
        fallback,
    )
    .into_handler();

    let group_path = format!("/apis/{}", PLUGIN_API_GROUP);
    let mux = &server.handler.non_go_restful_mux;
    mux.handle(&group_path, handler.clone())?;
    mux.handle_prefix(&format!("{}/", group_path), handler)?;
    info!(group = PLUGIN_API_GROUP, "registered subresource handler");

    Ok(server)
}
