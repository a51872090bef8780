//! REST collaborator: channel list snapshot, history pages, read marks and
//! reaction toggles.

pub mod http;

use std::future::Future;

use huddle_proto::event::WireMessage;
use huddle_proto::ids::{ChannelId, MessageId};
use huddle_proto::rest::{ChannelSummary, HistoryQuery, ReadConfirmation};

pub use http::HttpChatApi;

/// Errors from the REST collaborator.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Transport failure or non-success HTTP status.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend could not serve the request.
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

/// The REST endpoints the sync engine consumes.
pub trait ChatApi: Send + Sync + 'static {
    /// `GET /channels`: channel metadata with the unread snapshot.
    fn list_channels(&self) -> impl Future<Output = Result<Vec<ChannelSummary>, ApiError>> + Send;

    /// `GET /channels/{id}/messages?limit&offset`: one history page,
    /// ascending by id.
    fn fetch_history(
        &self,
        channel_id: ChannelId,
        query: HistoryQuery,
    ) -> impl Future<Output = Result<Vec<WireMessage>, ApiError>> + Send;

    /// `POST /channels/{id}/read`.
    fn mark_read(
        &self,
        channel_id: ChannelId,
    ) -> impl Future<Output = Result<ReadConfirmation, ApiError>> + Send;

    /// `POST /channels/{id}/messages/{mid}/reactions`.
    fn add_reaction(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        emoji: &str,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;

    /// `DELETE /channels/{id}/messages/{mid}/reactions`.
    fn remove_reaction(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        emoji: &str,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;
}
