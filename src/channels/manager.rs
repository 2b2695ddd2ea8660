//! Channel manager: fans in inbound streams and routes replies by channel name.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::select_all;

use crate::channels::{Channel, MessageStream, OutgoingResponse};
use crate::error::ChannelError;

#[derive(Default)]
pub struct ChannelManager {
    channels: HashMap<String, Arc<dyn Channel>>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, channel: Arc<dyn Channel>) {
        self.channels.insert(channel.name().to_string(), channel);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    /// Start every channel and merge their messages into one stream.
    pub async fn start_all(&self) -> Result<MessageStream, ChannelError> {
        let mut streams = Vec::with_capacity(self.channels.len());
        for channel in self.channels.values() {
            streams.push(channel.start().await?);
            tracing::info!(channel = %channel.name(), "Channel started");
        }
        Ok(Box::pin(select_all(streams)))
    }

    /// Deliver a reply on the channel it names.
    pub async fn send(&self, response: OutgoingResponse) -> Result<(), ChannelError> {
        let channel = self
            .channels
            .get(&response.channel)
            .ok_or_else(|| ChannelError::SendFailed {
                name: response.channel.clone(),
                reason: "no such channel".to_string(),
            })?;
        channel.send(response).await
    }

    pub async fn shutdown_all(&self) {
        for channel in self.channels.values() {
            if let Err(e) = channel.shutdown().await {
                tracing::warn!(channel = %channel.name(), "Channel shutdown failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::IncomingMessage;
    use async_trait::async_trait;
    use futures::StreamExt;
    use tokio::sync::Mutex;

    struct StubChannel {
        name: &'static str,
        sent: Mutex<Vec<OutgoingResponse>>,
    }

    #[async_trait]
    impl Channel for StubChannel {
        fn name(&self) -> &str {
            self.name
        }

        async fn start(&self) -> Result<MessageStream, ChannelError> {
            let msg = IncomingMessage::new(self.name, "g1", "u1", "hello");
            Ok(Box::pin(futures::stream::once(async move { msg })))
        }

        async fn send(&self, response: OutgoingResponse) -> Result<(), ChannelError> {
            self.sent.lock().await.push(response);
            Ok(())
        }
    }

    fn stub(name: &'static str) -> Arc<StubChannel> {
        Arc::new(StubChannel {
            name,
            sent: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn merges_streams() {
        let mut manager = ChannelManager::new();
        manager.add(stub("a"));
        manager.add(stub("b"));
        assert_eq!(manager.names(), vec!["a", "b"]);

        let stream = manager.start_all().await.unwrap();
        let mut channels: Vec<String> = stream.map(|m| m.channel).collect().await;
        channels.sort();
        assert_eq!(channels, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn routes_by_channel_name() {
        let a = stub("a");
        let mut manager = ChannelManager::new();
        manager.add(a.clone());

        let response = OutgoingResponse {
            channel: "a".into(),
            group_id: "g1".into(),
            content: "hi".into(),
            metadata: serde_json::Value::Null,
        };
        manager.send(response.clone()).await.unwrap();
        assert_eq!(a.sent.lock().await.len(), 1);

        let missing = OutgoingResponse {
            channel: "zzz".into(),
            ..response
        };
        assert!(manager.send(missing).await.is_err());
    }
}
