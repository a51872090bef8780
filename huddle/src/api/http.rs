//! [`ChatApi`] over HTTP with `reqwest`.

use std::time::Duration;

use reqwest::Client;
use url::Url;

use huddle_proto::event::WireMessage;
use huddle_proto::ids::{ChannelId, MessageId};
use huddle_proto::rest::{ChannelSummary, HistoryQuery, ReactionBody, ReadConfirmation};

use super::{ApiError, ChatApi};

/// HTTP client authenticated with a bearer token.
#[derive(Debug, Clone)]
pub struct HttpChatApi {
    http: Client,
    base: String,
    token: String,
}

impl HttpChatApi {
    /// Creates a client for the REST API rooted at `base`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Http`] if the HTTP client cannot be built.
    pub fn new(base: &Url, token: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base: base.as_str().trim_end_matches('/').to_owned(),
            token: token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    fn reactions_url(&self, channel_id: ChannelId, message_id: MessageId) -> String {
        self.url(&format!("channels/{channel_id}/messages/{message_id}/reactions"))
    }
}

impl ChatApi for HttpChatApi {
    async fn list_channels(&self) -> Result<Vec<ChannelSummary>, ApiError> {
        Ok(self
            .http
            .get(self.url("channels"))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    async fn fetch_history(
        &self,
        channel_id: ChannelId,
        query: HistoryQuery,
    ) -> Result<Vec<WireMessage>, ApiError> {
        Ok(self
            .http
            .get(self.url(&format!("channels/{channel_id}/messages")))
            .bearer_auth(&self.token)
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    async fn mark_read(&self, channel_id: ChannelId) -> Result<ReadConfirmation, ApiError> {
        Ok(self
            .http
            .post(self.url(&format!("channels/{channel_id}/read")))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    async fn add_reaction(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<(), ApiError> {
        self.http
            .post(self.reactions_url(channel_id, message_id))
            .bearer_auth(&self.token)
            .json(&ReactionBody {
                emoji: emoji.to_owned(),
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn remove_reaction(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<(), ApiError> {
        self.http
            .delete(self.reactions_url(channel_id, message_id))
            .bearer_auth(&self.token)
            .json(&ReactionBody {
                emoji: emoji.to_owned(),
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
